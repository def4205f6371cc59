// Thin wrappers around the IPC syscalls. Synchronous rendezvous: a send
// against a receiver that isn't blocked in `ipc_recv` fails immediately
// with `IpcNotRecv` rather than queuing (SPEC_FULL.md 4.6).

use crate::constants::*;
use crate::user::syscall::*;

pub(crate) struct Received {
    pub(crate) from: u32,
    pub(crate) value: u32,
    pub(crate) perm: u32,
}

/// Blocks until some environment sends to us. If `dst_va` is non-zero, any
/// page the sender shares is mapped there with the sender's requested
/// permissions; `perm` reports what was actually applied (0 if nothing was
/// mapped).
pub(crate) fn ipc_recv(dst_va: u32) -> Result<Received, SysError> {
    let (value, from, perm) = sys_ipc_recv(dst_va);
    if value < 0 {
        return Err(SysError::from_code(value).unwrap_or(SysError::Invalid));
    }
    Ok(Received {
        from,
        value: value as u32,
        perm,
    })
}

/// Repeatedly attempts `ipc_can_send` until the target is actually blocked
/// in `ipc_recv`, yielding between attempts. There is no queuing in this
/// IPC design, so a non-blocking send that loses the race must retry.
pub(crate) fn ipc_send(to: u32, value: u32, src_va: u32, perm: u32) {
    loop {
        let rc = sys_ipc_can_send(to, value, src_va, perm);
        if rc == 0 {
            return;
        }
        if rc != SysError::IpcNotRecv.code() {
            panic!("ipc_send: unexpected error {}", rc);
        }
        sys_yield();
    }
}
