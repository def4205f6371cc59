// Raw syscall trampoline and typed wrappers around it. Numbering here must
// track `crate::syscall::consts` on the kernel side (this is a separate
// compilation unit, so the ABI is duplicated rather than shared via `mod`,
// the same way JOS's kernel and lib/ agree on `inc/syscall.h` without
// literally sharing a translation unit).

use crate::constants::*;

mod nums {
    pub(crate) const SYS_CPUTS: u32 = 0;
    pub(crate) const SYS_CGETC: u32 = 1;
    pub(crate) const SYS_YIELD: u32 = 2;
    pub(crate) const SYS_GETENVID: u32 = 3;
    pub(crate) const SYS_ENV_DESTROY: u32 = 4;
    pub(crate) const SYS_SET_PGFAULT_HANDLER: u32 = 5;
    pub(crate) const SYS_MEM_ALLOC: u32 = 6;
    pub(crate) const SYS_MEM_MAP: u32 = 7;
    pub(crate) const SYS_MEM_UNMAP: u32 = 8;
    pub(crate) const SYS_ENV_ALLOC: u32 = 9;
    pub(crate) const SYS_SET_ENV_STATUS: u32 = 10;
    pub(crate) const SYS_IPC_RECV: u32 = 11;
    pub(crate) const SYS_IPC_CAN_SEND: u32 = 12;
}
use nums::*;

/// Vector the kernel's IDT wires to `T_SYSCALL` (see `trap.rs`).
const T_SYSCALL: u32 = 48;

/// Traps into the kernel with `eax=num, edx=a1, ecx=a2, ebx=a3, edi=a4,
/// esi=a5`, matching `trap_dispatch`'s `SYS_*` argument unpacking, and
/// returns the value the kernel placed back in `eax`.
#[inline(always)]
unsafe fn syscall(num: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32 {
    let ret: i32;
    asm!("int $$0x30"
        : "={eax}"(ret)
        : "{eax}"(num), "{edx}"(a1), "{ecx}"(a2), "{ebx}"(a3), "{edi}"(a4), "{esi}"(a5)
        : "cc", "memory"
        : "volatile");
    ret
}

pub(crate) fn sys_cputs(s: &[u8]) {
    unsafe {
        syscall(SYS_CPUTS, s.as_ptr() as u32, s.len() as u32, 0, 0, 0);
    }
}

pub(crate) fn sys_cgetc() -> i32 {
    unsafe { syscall(SYS_CGETC, 0, 0, 0, 0, 0) }
}

pub(crate) fn sys_yield() {
    unsafe {
        syscall(SYS_YIELD, 0, 0, 0, 0, 0);
    }
}

pub(crate) fn sys_getenvid() -> u32 {
    unsafe { syscall(SYS_GETENVID, 0, 0, 0, 0, 0) as u32 }
}

pub(crate) fn sys_env_destroy(envid: u32) -> i32 {
    unsafe { syscall(SYS_ENV_DESTROY, envid, 0, 0, 0, 0) }
}

pub(crate) fn sys_set_pgfault_handler(envid: u32, entry: u32, xstacktop: u32) -> i32 {
    unsafe { syscall(SYS_SET_PGFAULT_HANDLER, envid, entry, xstacktop, 0, 0) }
}

pub(crate) fn sys_mem_alloc(envid: u32, va: u32, perm: u32) -> i32 {
    unsafe { syscall(SYS_MEM_ALLOC, envid, va, perm, 0, 0) }
}

pub(crate) fn sys_mem_map(src_id: u32, src_va: u32, dst_id: u32, dst_va: u32, perm: u32) -> i32 {
    unsafe { syscall(SYS_MEM_MAP, src_id, src_va, dst_id, dst_va, perm) }
}

pub(crate) fn sys_mem_unmap(envid: u32, va: u32) -> i32 {
    unsafe { syscall(SYS_MEM_UNMAP, envid, va, 0, 0, 0) }
}

pub(crate) fn sys_env_alloc() -> i32 {
    unsafe { syscall(SYS_ENV_ALLOC, 0, 0, 0, 0, 0) }
}

pub(crate) fn sys_set_env_status(envid: u32, status: u32) -> i32 {
    unsafe { syscall(SYS_SET_ENV_STATUS, envid, status, 0, 0, 0) }
}

/// Unlike the other wrappers, this reads back `edx`/`ecx` too: a successful
/// `ipc_recv` resumes with `eax`/`edx`/`ecx` already populated by the
/// sender's `complete_ipc_recv` (see `env.rs`), not just a status code in
/// `eax`.
pub(crate) fn sys_ipc_recv(dst_va: u32) -> (i32, u32, u32) {
    let (value, from, perm): (i32, u32, u32);
    unsafe {
        asm!("int $$0x30"
            : "={eax}"(value), "={edx}"(from), "={ecx}"(perm)
            : "{eax}"(SYS_IPC_RECV), "{edx}"(dst_va), "{ecx}"(0), "{ebx}"(0), "{edi}"(0), "{esi}"(0)
            : "cc", "memory"
            : "volatile");
    }
    (value, from, perm)
}

pub(crate) fn sys_ipc_can_send(dst_id: u32, value: u32, src_va: u32, perm: u32) -> i32 {
    unsafe { syscall(SYS_IPC_CAN_SEND, dst_id, value, src_va, perm, 0) }
}

pub(crate) const ENV_STATUS_FREE: u32 = 0;
pub(crate) const ENV_STATUS_RUNNABLE: u32 = 1;
pub(crate) const ENV_STATUS_NOT_RUNNABLE: u32 = 2;

pub(crate) fn to_result(code: i32) -> Result<u32, SysError> {
    if code < 0 {
        Err(SysError::from_code(code).unwrap_or(SysError::Invalid))
    } else {
        Ok(code as u32)
    }
}
