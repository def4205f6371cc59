// Anonymous pipes: no kernel support beyond `mem_alloc`/`mem_map`. Both
// ends share one physical frame (mapped `LIBRARY`, so it survives `fork`
// shared rather than getting privately COW'd) holding a small ring buffer.
// This mirrors JOS's `lib/pipe.c`.

use crate::constants::*;
use crate::fsipc::DEV_PIPE;
use crate::user::fd::{fd_alloc, fd_va};
use crate::user::syscall::*;

const PIPE_BUF: usize = PGSIZE as usize - 16;

#[repr(C)]
struct PipePage {
    fd_dev: u32,
    closed: u32,
    p_rpos: u32,
    p_wpos: u32,
    p_buf: [u8; PIPE_BUF],
}

fn page_at(fdnum: u32) -> &'static mut PipePage {
    unsafe { &mut *(fd_va(fdnum) as *mut PipePage) }
}

/// Creates a connected pair; `fds.0` is the read end, `fds.1` the write end.
pub(crate) fn pipe() -> Result<(u32, u32), SysError> {
    let rfd = fd_alloc()?;
    let rc = sys_mem_alloc(0, fd_va(rfd), (Perm::user_rw() | Perm::LIBRARY).bits());
    if rc < 0 {
        return Err(SysError::from_code(rc).unwrap_or(SysError::Invalid));
    }

    // wfd must be allocated with rfd's page already mapped, or fd_alloc
    // could hand back the same slot.
    let wfd = match fd_alloc() {
        Ok(n) if n != rfd => n,
        _ => {
            sys_mem_unmap(0, fd_va(rfd));
            return Err(SysError::MaxOpen);
        }
    };

    let envid = sys_getenvid();
    let rc = sys_mem_map(
        envid,
        fd_va(rfd),
        envid,
        fd_va(wfd),
        (Perm::user_rw() | Perm::LIBRARY).bits(),
    );
    if rc < 0 {
        sys_mem_unmap(0, fd_va(rfd));
        return Err(SysError::from_code(rc).unwrap_or(SysError::Invalid));
    }

    let page = page_at(rfd);
    page.fd_dev = DEV_PIPE;
    page.closed = 0;
    page.p_rpos = 0;
    page.p_wpos = 0;

    Ok((rfd, wfd))
}

pub(crate) fn read(fdnum: u32, buf: &mut [u8]) -> Result<i32, SysError> {
    loop {
        let page = page_at(fdnum);
        if page.p_rpos != page.p_wpos {
            let mut n = 0;
            while n < buf.len() && page.p_rpos != page.p_wpos {
                buf[n] = page.p_buf[(page.p_rpos as usize) % PIPE_BUF];
                page.p_rpos = page.p_rpos.wrapping_add(1);
                n += 1;
            }
            return Ok(n as i32);
        }
        if page.closed != 0 {
            return Ok(0);
        }
        sys_yield();
    }
}

pub(crate) fn write(fdnum: u32, buf: &[u8]) -> Result<i32, SysError> {
    let mut written = 0;
    while written < buf.len() {
        let page = page_at(fdnum);
        if page.closed != 0 {
            return Err(SysError::Invalid);
        }
        if page.p_wpos.wrapping_sub(page.p_rpos) as usize >= PIPE_BUF {
            sys_yield();
            continue;
        }
        page.p_buf[(page.p_wpos as usize) % PIPE_BUF] = buf[written];
        page.p_wpos = page.p_wpos.wrapping_add(1);
        written += 1;
    }
    Ok(written as i32)
}

pub(crate) fn close(fdnum: u32) {
    page_at(fdnum).closed = 1;
}
