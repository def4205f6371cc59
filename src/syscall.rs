// Syscall dispatch. Numbering and argument order are this crate's own ABI;
// every arm below validates its user pointers with user_mem_assert (or a
// perm/range check) before touching them, since arguments arrive as raw
// untrusted integers from ring 3.

use core::slice;
use core::str;

use crate::constants::*;
use crate::env::{self, Env, EnvId, EnvStatus};
use crate::pmap::VirtAddr;
use crate::sched;

mod consts {
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
use consts::*;

fn sys_cputs(s: &str) {
    print!("{}", s);
}

fn sys_cgetc() -> i32 {
    match crate::console::console_getc() {
        Some(c) => c as i32,
        None => 0,
    }
}

fn sys_yield() -> i32 {
    sched::sched_yield();
    0
}

fn sys_getenvid() -> i32 {
    cur_env().get_env_id().0 as i32
}

fn sys_env_destroy(envid: u32) -> i32 {
    let env = cur_env();
    let table = env::env_table();
    match env::find(&table, env, EnvId(envid), true) {
        Ok(target) => {
            env::env_destroy(target, table);
            0
        }
        Err(e) => e.code(),
    }
}

fn sys_set_pgfault_handler(envid: u32, entry: u32, xstacktop: u32) -> i32 {
    let env = cur_env();
    let mut table = env::env_table();
    match env::find(&table, env, EnvId(envid), true) {
        Ok(target) => {
            let target = table.find_mut(target).unwrap();
            target.set_pgfault_handler(VirtAddr(entry), VirtAddr(xstacktop));
            0
        }
        Err(e) => e.code(),
    }
}

/// `mem_alloc(id, va, perm)`: perm must include U, must not include COW,
/// `va < UTOP`; allocates a zeroed frame and inserts it.
fn sys_mem_alloc(envid: u32, va: u32, perm: u32) -> i32 {
    let perm = match Perm::from_bits(perm) {
        Some(p) if p.contains(Perm::U) && !p.contains(Perm::COW) => p,
        _ => return SysError::Invalid.code(),
    };
    if va >= UTOP || va % PGSIZE != 0 {
        return SysError::Invalid.code();
    }

    let env = cur_env();
    let mut table = env::env_table();
    match env::find(&table, env, EnvId(envid), true) {
        Ok(target) => {
            let target = table.find_mut(target).unwrap();
            match target
                .pgdir_mut()
                .insert_new_page(VirtAddr(va), (perm | Perm::P).bits())
            {
                Ok(()) => 0,
                Err(e) => e.code(),
            }
        }
        Err(e) => e.code(),
    }
}

/// `mem_map(src_id, src_va, dst_id, dst_va, perm)`: both VAs `< UTOP`;
/// resolves the source PTE (must be present) and shares that frame into
/// the destination with the new permissions.
fn sys_mem_map(src_id: u32, src_va: u32, dst_id: u32, dst_va: u32, perm: u32) -> i32 {
    let perm = match Perm::from_bits(perm) {
        Some(p) if p.contains(Perm::U) => p,
        _ => return SysError::Invalid.code(),
    };
    if src_va >= UTOP || src_va % PGSIZE != 0 || dst_va >= UTOP || dst_va % PGSIZE != 0 {
        return SysError::Invalid.code();
    }

    let env = cur_env();
    let mut table = env::env_table();
    let src = match env::find(&table, env, EnvId(src_id), true) {
        Ok(id) => id,
        Err(e) => return e.code(),
    };
    let dst = match env::find(&table, env, EnvId(dst_id), true) {
        Ok(id) => id,
        Err(e) => return e.code(),
    };

    if src == dst {
        let env = table.find_mut(src).unwrap();
        return match env.pgdir_mut().lookup_page(VirtAddr(src_va)) {
            Some((pa, _)) => {
                env.pgdir_mut()
                    .map_existing(VirtAddr(dst_va), pa, (perm | Perm::P).bits());
                0
            }
            None => SysError::Invalid.code(),
        };
    }

    let (src_env, dst_env) = borrow_two_mut(&mut table, src, dst);
    match src_env.pgdir_mut().share_page(
        VirtAddr(src_va),
        dst_env.pgdir_mut(),
        VirtAddr(dst_va),
        (perm | Perm::P).bits(),
    ) {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// Splits the env table's backing array so two distinct envs can be
/// borrowed mutably at once, needed by `sys_mem_map`'s cross-env page copy.
fn borrow_two_mut(
    table: &mut env::EnvTable,
    a: EnvId,
    b: EnvId,
) -> (&mut Env, &mut Env) {
    assert_ne!(a, b, "borrow_two_mut requires distinct envs");
    // Safety: `a` and `b` are distinct table slots (checked above), so the
    // two mutable references never alias the same `Env`.
    unsafe {
        let pa = table.find_mut(a).unwrap() as *mut Env;
        let pb = table.find_mut(b).unwrap() as *mut Env;
        (&mut *pa, &mut *pb)
    }
}

fn sys_mem_unmap(envid: u32, va: u32) -> i32 {
    if va >= UTOP || va % PGSIZE != 0 {
        return SysError::Invalid.code();
    }

    let env = cur_env();
    let mut table = env::env_table();
    match env::find(&table, env, EnvId(envid), true) {
        Ok(target) => {
            table.find_mut(target).unwrap().pgdir_mut().remove_page(VirtAddr(va));
            0
        }
        Err(e) => e.code(),
    }
}

fn sys_env_alloc() -> i32 {
    let env = cur_env();
    match env::sys_env_alloc(env) {
        Ok(new_id) => new_id.0 as i32,
        Err(e) => e.code(),
    }
}

fn sys_set_env_status(envid: u32, status: u32) -> i32 {
    let status = match status {
        0 => EnvStatus::Free,
        1 => EnvStatus::Runnable,
        2 => EnvStatus::NotRunnable,
        _ => return SysError::Invalid.code(),
    };

    let env = cur_env();
    let mut table = env::env_table();
    match env::find(&table, env, EnvId(envid), true) {
        Ok(target) => {
            table.find_mut(target).unwrap().set_status(status);
            0
        }
        Err(e) => e.code(),
    }
}

/// `ipc_recv(dst_va)`: blocks the caller until a matching `ipc_can_send`.
/// Never returns to this call frame; the eventual syscall return (value in
/// `eax`, sender id in `edx`, perm in `ecx`) happens when the env is
/// rescheduled with those registers already populated by the sender.
fn sys_ipc_recv(dst_va: u32) -> i32 {
    if dst_va != 0 && (dst_va >= UTOP || dst_va % PGSIZE != 0) {
        return SysError::Invalid.code();
    }

    let env = cur_env_mut();
    env.begin_ipc_recv(VirtAddr(dst_va));
    sched::sched_yield();
    0
}

/// `ipc_can_send(dst_id, value, src_va, perm)`: fails fast with
/// `IpcNotRecv` unless the target is blocked in `ipc_recv`.
fn sys_ipc_can_send(dst_id: u32, value: u32, src_va: u32, perm: u32) -> i32 {
    let caller_id = cur_env().get_env_id();
    let mut table = env::env_table();

    let dst = match table.find_mut(EnvId(dst_id)) {
        Some(e) if e.is_ipc_recving() => e.get_env_id(),
        Some(_) => return SysError::IpcNotRecv.code(),
        None => return SysError::BadEnv.code(),
    };

    let mut applied_perm = 0;
    if src_va != 0 {
        if src_va >= UTOP || src_va % PGSIZE != 0 {
            return SysError::Invalid.code();
        }
        let perm = match Perm::from_bits(perm) {
            Some(p) if p.contains(Perm::U) => p,
            _ => return SysError::Invalid.code(),
        };

        let dst_va = table.find(dst).unwrap().ipc_dstva();
        let (src_env, dst_env) = borrow_two_mut(&mut table, caller_id, dst);
        match src_env
            .pgdir_mut()
            .share_page(VirtAddr(src_va), dst_env.pgdir_mut(), dst_va, (perm | Perm::P).bits())
        {
            Ok(()) => applied_perm = (perm | Perm::P).bits(),
            Err(e) => return e.code(),
        }
    }

    table
        .find_mut(dst)
        .unwrap()
        .complete_ipc_recv(caller_id, value, applied_perm);
    0
}

fn cur_env() -> &'static Env {
    env::cur_env().expect("syscall with no running env")
}

fn cur_env_mut() -> &'static mut Env {
    env::cur_env_mut().expect("syscall with no running env")
}

fn user_mem_assert(len: usize, ptr: *const u8) {
    let env = cur_env_mut();
    env::user_mem_assert(env, VirtAddr(ptr as u32), len, PTE_U);
}

/// Dispatched to the correct kernel function, passing the arguments.
pub(crate) unsafe fn syscall(syscall_no: u32, a1: u32, a2: u32, a3: u32, a4: u32, a5: u32) -> i32 {
    match syscall_no {
        SYS_CPUTS => {
            let raw_s = a1 as *const u8;
            let len = a2 as usize;
            user_mem_assert(len, raw_s);
            let s = slice::from_raw_parts(raw_s, len);
            let s = str::from_utf8(s).expect("illegal utf8 string");
            sys_cputs(s);
            0
        }
        SYS_CGETC => sys_cgetc(),
        SYS_YIELD => sys_yield(),
        SYS_GETENVID => sys_getenvid(),
        SYS_ENV_DESTROY => sys_env_destroy(a1),
        SYS_SET_PGFAULT_HANDLER => sys_set_pgfault_handler(a1, a2, a3),
        SYS_MEM_ALLOC => sys_mem_alloc(a1, a2, a3),
        SYS_MEM_MAP => sys_mem_map(a1, a2, a3, a4, a5),
        SYS_MEM_UNMAP => sys_mem_unmap(a1, a2),
        SYS_ENV_ALLOC => sys_env_alloc(),
        SYS_SET_ENV_STATUS => sys_set_env_status(a1, a2),
        SYS_IPC_RECV => sys_ipc_recv(a1),
        SYS_IPC_CAN_SEND => sys_ipc_can_send(a1, a2, a3, a4),
        _ => {
            log::warn!("unknown syscall {}", syscall_no);
            SysError::Invalid.code()
        }
    }
}
