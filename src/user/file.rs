// Client side of the file-device IPC protocol (SPEC_FULL.md 4.9/4.10):
// every op fills `FSIPCBUF` with a request struct, sends it to the FS
// server along with the request type code, and waits for the scalar/page
// reply.

use crate::constants::*;
use crate::fsipc::*;
use crate::user::fd::{fd_alloc, fd_install, fd_va};
use crate::user::ipc::{ipc_recv, ipc_send};
use crate::user::syscall::*;

fn fsipc(req_type: u32, fill: impl FnOnce(*mut u8)) -> Result<(u32, u32), SysError> {
    let rc = sys_mem_alloc(0, FSIPCBUF, (Perm::user_rw()).bits());
    if rc < 0 {
        return Err(SysError::from_code(rc).unwrap_or(SysError::Invalid));
    }
    fill(FSIPCBUF as *mut u8);

    ipc_send(FS_ENV_ID, req_type, FSIPCBUF, (Perm::user_rw()).bits());
    let reply = ipc_recv(FSIPCBUF)?;

    sys_mem_unmap(0, FSIPCBUF);
    Ok((reply.value, reply.perm))
}

fn write_path(dst: &mut [u8; MAXPATHLEN], path: &str) -> Result<(), SysError> {
    let bytes = path.as_bytes();
    if bytes.len() + 1 > MAXPATHLEN {
        return Err(SysError::BadPath);
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    dst[bytes.len()] = 0;
    Ok(())
}

/// Opens `path` with `omode`, installing the shared `Filefd` page the
/// server replies with at a freshly allocated fd slot.
pub(crate) fn open(path: &str, omode: u32) -> Result<u32, SysError> {
    let fdnum = fd_alloc()?;

    let (value, perm) = fsipc(REQ_OPEN, |buf| unsafe {
        let req = &mut *(buf as *mut ReqOpen);
        write_path(&mut req.path, path).expect("path too long");
        req.omode = omode;
    })?;
    if (value as i32) < 0 {
        return Err(SysError::from_code(value as i32).unwrap_or(SysError::Invalid));
    }
    if perm == 0 {
        return Err(SysError::Invalid);
    }

    fd_install(fdnum, FSIPCBUF, perm)?;
    let page = unsafe { &mut *(fd_va(fdnum) as *mut FdPage) };
    page.fd_dev = DEV_FILE;
    page.fd_offset = 0;
    page.fd_omode = omode;

    Ok(fdnum)
}

fn fileid_of(fdnum: u32) -> i32 {
    unsafe { (&*(fd_va(fdnum) as *const FdPage)).file.fileid }
}

fn size_of(fdnum: u32) -> u32 {
    unsafe { (&*(fd_va(fdnum) as *const FdPage)).file.size }
}

/// Requests the block holding `offset` be mapped at `FSIPCBUF` and copies
/// out whatever falls within this file's current size, one block per call
/// (mirrors `read`'s block-at-a-time iteration in `user/fd.rs`'s caller).
fn map_block(fdnum: u32, offset: u32) -> Result<(u32, u32), SysError> {
    let fileid = fileid_of(fdnum);
    fsipc(REQ_MAP, |buf| unsafe {
        let req = &mut *(buf as *mut ReqMap);
        req.fileid = fileid;
        req.offset = offset & !((BLKSIZE as u32) - 1);
    })
}

pub(crate) fn read(fdnum: u32, offset: u32, buf: &mut [u8]) -> Result<i32, SysError> {
    let size = size_of(fdnum);
    if offset >= size {
        return Ok(0);
    }
    let want = core::cmp::min(buf.len() as u32, size - offset) as usize;

    let mut copied = 0;
    while copied < want {
        let cur = offset + copied as u32;
        let (value, perm) = map_block(fdnum, cur)?;
        if (value as i32) < 0 {
            return Err(SysError::from_code(value as i32).unwrap_or(SysError::Invalid));
        }
        if perm == 0 {
            return Err(SysError::NotFound);
        }

        let in_block = (cur % (BLKSIZE as u32)) as usize;
        let n = core::cmp::min(want - copied, BLKSIZE - in_block);
        unsafe {
            let src = (FSIPCBUF as usize + in_block) as *const u8;
            core::ptr::copy_nonoverlapping(src, buf[copied..].as_mut_ptr(), n);
        }
        sys_mem_unmap(0, FSIPCBUF);
        copied += n;
    }

    Ok(copied as i32)
}

pub(crate) fn write(fdnum: u32, offset: u32, buf: &[u8]) -> Result<i32, SysError> {
    let fileid = fileid_of(fdnum);
    let mut written = 0;

    while written < buf.len() {
        let cur = offset + written as u32;
        let (value, perm) = map_block(fdnum, cur)?;
        if (value as i32) < 0 {
            return Err(SysError::from_code(value as i32).unwrap_or(SysError::Invalid));
        }
        if perm == 0 {
            return Err(SysError::NotFound);
        }

        let in_block = (cur % (BLKSIZE as u32)) as usize;
        let n = core::cmp::min(buf.len() - written, BLKSIZE - in_block);
        unsafe {
            let dst = (FSIPCBUF as usize + in_block) as *mut u8;
            core::ptr::copy_nonoverlapping(buf[written..].as_ptr(), dst, n);
        }

        let (value, _) = fsipc(REQ_DIRTY, |b| unsafe {
            let req = &mut *(b as *mut ReqDirty);
            req.fileid = fileid;
            req.offset = cur & !((BLKSIZE as u32) - 1);
        })?;
        sys_mem_unmap(0, FSIPCBUF);
        if (value as i32) < 0 {
            return Err(SysError::from_code(value as i32).unwrap_or(SysError::Invalid));
        }

        written += n;
    }

    let new_size = offset + written as u32;
    if new_size > size_of(fdnum) {
        let (value, _) = fsipc(REQ_SET_SIZE, |b| unsafe {
            let req = &mut *(b as *mut ReqSetSize);
            req.fileid = fileid;
            req.size = new_size;
        })?;
        sys_mem_unmap(0, FSIPCBUF);
        if (value as i32) < 0 {
            return Err(SysError::from_code(value as i32).unwrap_or(SysError::Invalid));
        }
        unsafe {
            (&mut *(fd_va(fdnum) as *mut FdPage)).file.size = new_size;
        }
    }

    Ok(written as i32)
}

pub(crate) fn close(fdnum: u32) -> Result<(), SysError> {
    let fileid = fileid_of(fdnum);
    let (value, _) = fsipc(REQ_CLOSE, |b| unsafe {
        (&mut *(b as *mut ReqClose)).fileid = fileid;
    })?;
    sys_mem_unmap(0, FSIPCBUF);
    if (value as i32) < 0 {
        return Err(SysError::from_code(value as i32).unwrap_or(SysError::Invalid));
    }
    Ok(())
}

pub(crate) fn remove(path: &str) -> Result<(), SysError> {
    let (value, _) = fsipc(REQ_REMOVE, |buf| unsafe {
        let req = &mut *(buf as *mut ReqRemove);
        write_path(&mut req.path, path).expect("path too long");
    })?;
    sys_mem_unmap(0, FSIPCBUF);
    if (value as i32) < 0 {
        return Err(SysError::from_code(value as i32).unwrap_or(SysError::Invalid));
    }
    Ok(())
}

pub(crate) fn sync() -> Result<(), SysError> {
    let (value, _) = fsipc(REQ_SYNC, |_| {})?;
    sys_mem_unmap(0, FSIPCBUF);
    if (value as i32) < 0 {
        return Err(SysError::from_code(value as i32).unwrap_or(SysError::Invalid));
    }
    Ok(())
}
