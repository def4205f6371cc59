// Read-only view of this environment's own page tables through the self-map
// the kernel installs at UVPT/VPT (see `pmap.rs::install_self_map`). Lets
// `duppage`/`pgfault` inspect PTE permission bits without a syscall, the way
// JOS's `uvpt`/`uvpd` do.

use crate::constants::*;

/// Raw 32-bit PTE value for page number `pn` (`va >> PGSHIFT`), read through
/// UVPT. The kernel maps UVPT read-only, so this never faults as long as
/// the containing page table actually exists; callers must check `PDE`
/// presence first via `pde_exists`.
unsafe fn raw_pte(pn: u32) -> u32 {
    let ptr = (UVPT + pn * 4) as *const u32;
    core::ptr::read_volatile(ptr)
}

/// Raw 32-bit PDE value for the page directory index `va` falls in, read
/// through UVPT viewed as a page directory (`UVPT`'s own page table entry
/// doubles as the directory when indexed by `PDX(UVPT) + pdx`).
unsafe fn raw_pde(pdx: u32) -> u32 {
    let ptr = (UVPT + (UVPT >> PGSHIFT) * 4 + pdx * 4) as *const u32;
    core::ptr::read_volatile(ptr)
}

pub(crate) fn pde_exists(va: u32) -> bool {
    let pdx = va >> 22;
    unsafe { raw_pde(pdx) & PTE_P != 0 }
}

/// Returns `(present, perm)` for the page mapped at `va`, or `(false, 0)`
/// if no page table exists for `va` at all.
pub(crate) fn page_perm(va: u32) -> (bool, u32) {
    if !pde_exists(va) {
        return (false, 0);
    }
    let pn = va >> PGSHIFT;
    let pte = unsafe { raw_pte(pn) };
    (pte & PTE_P != 0, pte & 0xfff)
}
