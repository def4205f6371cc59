// User-level copy-on-write fork: `env_alloc()` gives the child a private
// page directory plus a fresh copy of the parent's trap frame and user
// stack page; everything else below USTACKTOP is shared copy-on-write by
// `duppage`, and repaired on first write by `pgfault`.

use crate::constants::*;
use crate::user::pagetable::page_perm;
use crate::user::syscall::*;

#[repr(C)]
pub(crate) struct PushRegs {
    pub(crate) reg_edi: u32,
    pub(crate) reg_esi: u32,
    pub(crate) reg_ebp: u32,
    pub(crate) reg_oesp: u32,
    pub(crate) reg_ebx: u32,
    pub(crate) reg_edx: u32,
    pub(crate) reg_ecx: u32,
    pub(crate) reg_eax: u32,
}

/// Mirrors `trap::UTrapframe`'s layout exactly: this is what the kernel
/// writes to the top of the exception stack before jumping to the
/// registered pgfault entry point.
#[repr(C)]
pub(crate) struct UTrapframe {
    pub(crate) utf_fault_va: u32,
    pub(crate) utf_err: u32,
    pub(crate) utf_regs: PushRegs,
    pub(crate) utf_eip: u32,
    pub(crate) utf_eflags: u32,
    pub(crate) utf_esp: u32,
}

pub(crate) type PgfaultHandler = fn(&UTrapframe);

static mut HANDLER: Option<PgfaultHandler> = None;

/// Registers `handler` as this environment's page-fault handler, wiring up
/// the exception stack and telling the kernel where to reflect faults.
/// Allocates `UXSTACKTOP`'s page on first call.
pub(crate) fn set_pgfault_handler(handler: PgfaultHandler) {
    unsafe {
        if HANDLER.is_none() {
            let rc = sys_mem_alloc(
                0,
                UXSTACKTOP - PGSIZE,
                (Perm::user_rw()).bits(),
            );
            assert!(rc >= 0, "failed to allocate exception stack");
        }
        HANDLER = Some(handler);
    }
    let envid = sys_getenvid();
    let rc = sys_set_pgfault_handler(envid, pgfault_upcall as u32, UXSTACKTOP);
    assert!(rc == 0, "sys_set_pgfault_handler failed");
}

/// Entered directly by the kernel's `page_fault_handler`: `esp` points at a
/// freshly-pushed `UTrapframe` on the exception stack, and there is no
/// return address on the stack to work with (this was not a `call`). Reads
/// the frame, runs the registered handler, then resumes the faulting
/// instruction by splicing the saved `eip` onto the saved `esp` and
/// jumping there, the same trick JOS's `pfentry.S` uses.
#[no_mangle]
unsafe extern "C" fn pgfault_upcall() -> ! {
    let utf_ptr: *const UTrapframe;
    asm!("movl %esp, $0" : "=r"(utf_ptr) ::: "volatile");
    let utf = &*utf_ptr;

    match HANDLER {
        Some(h) => h(utf),
        None => panic!("page fault with no handler registered"),
    }

    // Splice the trapped eip into the word just below the trapped esp, then
    // switch %esp to the trapped frame and "return" into it.
    let dst_esp = utf.utf_esp - 4;
    (dst_esp as *mut u32).write(utf.utf_eip);

    asm!("movl $0, %esp; \
          popal; \
          addl $$4, %esp; \
          popfl; \
          popl %esp; \
          ret"
        :: "r"(&utf.utf_regs as *const PushRegs)
        : "memory" : "volatile");

    core::hint::unreachable_unchecked()
}

/// The fault handler proper: copy-on-write only. A PTE without `COW` set is
/// a genuine bug (wild write or a handler registered for the wrong kind of
/// fault) and is fatal.
pub(crate) fn pgfault(utf: &UTrapframe) {
    let fault_va = utf.utf_fault_va;
    let page_va = fault_va & !(PGSIZE - 1);

    let (present, perm) = page_perm(page_va);
    if !present || perm & Perm::COW.bits() == 0 {
        panic!(
            "pgfault: unexpected fault at {:08x} (perm {:#x})",
            fault_va, perm
        );
    }

    const PFTEMP: u32 = UTOP - 2 * PGSIZE;
    let rc = sys_mem_alloc(0, PFTEMP, (Perm::user_rw()).bits());
    assert!(rc >= 0, "pgfault: mem_alloc for scratch page failed");

    unsafe {
        core::ptr::copy_nonoverlapping(
            page_va as *const u8,
            PFTEMP as *mut u8,
            PGSIZE as usize,
        );
    }

    let envid = sys_getenvid();
    let new_perm = (perm & !Perm::COW.bits()) | PTE_W;
    let rc = sys_mem_map(0, PFTEMP, envid, page_va, new_perm);
    assert!(rc >= 0, "pgfault: remapping the repaired page failed");

    let rc = sys_mem_unmap(0, PFTEMP);
    assert!(rc >= 0, "pgfault: unmapping scratch page failed");
}

/// Maps page number `pn`'s page into `child` at the same VA: COW if it is
/// currently writable-or-COW and not a library page, otherwise a plain
/// shared mapping (used for read-only / shared-library pages which should
/// stay shared forever, never privately copied).
fn duppage(child: u32, pn: u32) -> Result<(), i32> {
    let va = pn * PGSIZE;
    let (present, perm) = page_perm(va);
    if !present {
        return Ok(());
    }

    let perm_flags = Perm::from_bits_truncate(perm);
    let should_cow = (perm_flags.contains(Perm::W) || perm_flags.contains(Perm::COW))
        && !perm_flags.contains(Perm::LIBRARY);

    let new_perm = if should_cow {
        (Perm::P | Perm::U | Perm::COW).bits()
    } else {
        perm_flags.bits()
    };

    // Install in the child first, then re-install in ourselves with the
    // same (possibly COW) permission: both PTEs must agree for the
    // happens-before argument in SPEC_FULL.md 4.5 to hold.
    let rc = sys_mem_map(0, va, child, va, new_perm);
    if rc < 0 {
        return Err(rc);
    }
    if should_cow {
        let envid = sys_getenvid();
        let rc = sys_mem_map(0, va, envid, va, new_perm);
        if rc < 0 {
            return Err(rc);
        }
    }
    Ok(())
}

/// Forks the calling environment. Returns the child's env id to the parent
/// and `0` to the child (by virtue of `env_alloc()`'s trap-frame copy
/// already zeroing `eax` for it — the child never executes any of the code
/// below this point, it resumes directly at the post-syscall instruction).
pub(crate) fn fork() -> Result<u32, i32> {
    set_pgfault_handler(pgfault);

    let child = sys_env_alloc();
    if child < 0 {
        return Err(child);
    }
    if child == 0 {
        // We are the child: env_alloc() already gave us our own copy of the
        // stack page and the parent's pgfault handler registration.
        return Ok(0);
    }
    let child = child as u32;

    let last_page = (USTACKTOP - PGSIZE) / PGSIZE;
    for pn in 0..last_page {
        if let Err(e) = duppage(child, pn) {
            return Err(e);
        }
    }

    let rc = sys_set_env_status(child, ENV_STATUS_RUNNABLE);
    if rc < 0 {
        return Err(rc);
    }

    Ok(child)
}
