// Per-process FD table (SPEC_FULL.md 4.10): one page per descriptor at a
// fixed VA, `FDTABLE + fdnum * PGSIZE`. A slot is "allocated" precisely
// when its page is mapped; nothing else tracks liveness.

use crate::constants::*;
use crate::fsipc::*;
use crate::user::pagetable::page_perm;
use crate::user::syscall::*;
use crate::user::{console, file, pipe};

pub(crate) fn fd_va(fdnum: u32) -> u32 {
    FDTABLE + fdnum * PGSIZE
}

fn fd_page(fdnum: u32) -> &'static mut FdPage {
    unsafe { &mut *(fd_va(fdnum) as *mut FdPage) }
}

/// Returns the smallest fd number whose page is currently unmapped.
pub(crate) fn fd_alloc() -> Result<u32, SysError> {
    for i in 0..(MAXOPEN as u32) {
        let (present, _) = page_perm(fd_va(i));
        if !present {
            return Ok(i);
        }
    }
    Err(SysError::MaxOpen)
}

/// Maps a page the caller already owns (e.g. one shared back by the FS
/// server on `OPEN`) at `fdnum`'s fixed slot.
pub(crate) fn fd_install(fdnum: u32, src_va: u32, perm: u32) -> Result<(), SysError> {
    let envid = sys_getenvid();
    let rc = sys_mem_map(envid, src_va, envid, fd_va(fdnum), perm);
    if rc < 0 {
        return Err(SysError::from_code(rc).unwrap_or(SysError::Invalid));
    }
    Ok(())
}

pub(crate) fn close(fdnum: u32) -> Result<(), SysError> {
    let dev = fd_page(fdnum).fd_dev;
    match dev {
        DEV_FILE => file::close(fdnum)?,
        DEV_PIPE => pipe::close(fdnum),
        DEV_CONSOLE => {}
        _ => return Err(SysError::Invalid),
    }
    let envid = sys_getenvid();
    let rc = sys_mem_unmap(envid, fd_va(fdnum));
    if rc < 0 {
        return Err(SysError::from_code(rc).unwrap_or(SysError::Invalid));
    }
    Ok(())
}

pub(crate) fn read(fdnum: u32, buf: &mut [u8]) -> Result<i32, SysError> {
    let dev = fd_page(fdnum).fd_dev;
    let offset = fd_page(fdnum).fd_offset;

    let n = match dev {
        DEV_FILE => file::read(fdnum, offset, buf)?,
        DEV_CONSOLE => console::read(buf),
        DEV_PIPE => pipe::read(fdnum, buf)?,
        _ => return Err(SysError::Invalid),
    };

    if n > 0 {
        fd_page(fdnum).fd_offset = offset + n as u32;
    }
    Ok(n)
}

pub(crate) fn write(fdnum: u32, buf: &[u8]) -> Result<i32, SysError> {
    let dev = fd_page(fdnum).fd_dev;
    let offset = fd_page(fdnum).fd_offset;

    let n = match dev {
        DEV_FILE => file::write(fdnum, offset, buf)?,
        DEV_CONSOLE => console::write(buf),
        DEV_PIPE => pipe::write(fdnum, buf)?,
        _ => return Err(SysError::Invalid),
    };

    if n > 0 {
        fd_page(fdnum).fd_offset = offset + n as u32;
    }
    Ok(n)
}
