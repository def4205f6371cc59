use alloc::boxed::Box;

use crate::constants::*;
use crate::pmap::{PageDirectory, PhysAddr, VirtAddr, PDX};
use crate::spinlock::{Mutex, MutexGuard};
use crate::trap::Trapframe;
use crate::{mpconfig, pmap, sched, x86};
use core::fmt::{Error, Formatter};
use core::fmt;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct EnvId(pub(crate) u32);

impl EnvId {
    /// The table slot this id was allocated from: low `LOG2NENV+1` bits.
    fn slot(&self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }
}

impl fmt::LowerHex for EnvId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        let val = self.0;
        fmt::LowerHex::fmt(&val, f)
    }
}

#[derive(Debug)]
#[allow(dead_code)]
pub(crate) enum EnvType {
    User,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[allow(dead_code)]
pub(crate) enum EnvStatus {
    Free,
    Dying,
    Runnable,
    Running,
    Zombie,
    NotRunnable,
}

/// A process: trap frame, address space, and the bookkeeping the kernel
/// needs for CoW fork and IPC rendezvous.
///
/// `env_pgfault_upcall`/`env_xstacktop` are 0 until the environment installs
/// a handler with `set_pgfault_handler`; a fault with no handler registered
/// is fatal. `env_ipc_*` hold the state of a blocked `ipc_recv`: see
/// `ipc.rs`/SPEC_FULL.md 4.6 for the rendezvous protocol.
#[repr(C)]
pub(crate) struct Env {
    env_tf: Trapframe,
    env_id: EnvId,
    env_parent_id: EnvId,
    env_type: EnvType,
    env_status: EnvStatus,
    env_runs: u32,
    env_pgdir: Box<PageDirectory>,
    env_pgfault_upcall: VirtAddr,
    env_xstacktop: VirtAddr,
    env_ipc_recving: bool,
    env_ipc_dstva: VirtAddr,
    env_ipc_from: EnvId,
    env_ipc_value: u32,
    env_ipc_perm: u32,
}

impl PartialEq for Env {
    fn eq(&self, other: &Self) -> bool {
        self.env_id == other.env_id
    }
}

impl Eq for Env {}

impl Env {
    fn set_entry_point(&mut self, va: VirtAddr) {
        self.env_tf.set_entry_point(va);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.env_status == EnvStatus::Running
    }

    pub(crate) fn is_runnable(&self) -> bool {
        self.env_status == EnvStatus::Runnable
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.env_status == EnvStatus::Dying
    }

    pub(crate) fn is_zombie(&self) -> bool {
        self.env_status == EnvStatus::Zombie
    }

    fn pause(&mut self) {
        self.env_status = EnvStatus::Runnable;
    }

    fn resume(&mut self) {
        self.env_status = EnvStatus::Running;
        self.env_runs += 1;
    }

    fn die(&mut self) {
        self.env_status = EnvStatus::Dying;
    }

    pub(crate) fn get_tf(&self) -> &Trapframe {
        &self.env_tf
    }

    pub(crate) fn get_tf_mut(&mut self) -> &mut Trapframe {
        &mut self.env_tf
    }

    pub(crate) fn set_tf(&mut self, tf: &Trapframe) {
        self.env_tf = tf.clone();
    }

    pub(crate) fn get_env_id(&self) -> EnvId {
        self.env_id
    }

    pub(crate) fn get_parent_id(&self) -> EnvId {
        self.env_parent_id
    }

    pub(crate) fn get_pgdir_paddr(&mut self) -> PhysAddr {
        self.env_pgdir.paddr().unwrap()
    }

    pub(crate) fn pgdir_mut(&mut self) -> &mut PageDirectory {
        &mut self.env_pgdir
    }

    pub(crate) fn set_status(&mut self, status: EnvStatus) {
        self.env_status = status;
    }

    pub(crate) fn set_pgfault_handler(&mut self, entry: VirtAddr, xstacktop: VirtAddr) {
        self.env_pgfault_upcall = entry;
        self.env_xstacktop = xstacktop;
    }

    pub(crate) fn pgfault_upcall(&self) -> Option<(VirtAddr, VirtAddr)> {
        if self.env_pgfault_upcall.0 == 0 {
            None
        } else {
            Some((self.env_pgfault_upcall, self.env_xstacktop))
        }
    }

    pub(crate) fn is_ipc_recving(&self) -> bool {
        self.env_ipc_recving
    }

    pub(crate) fn begin_ipc_recv(&mut self, dst_va: VirtAddr) {
        self.env_ipc_recving = true;
        self.env_ipc_dstva = dst_va;
        self.env_status = EnvStatus::NotRunnable;
    }

    /// Delivers an IPC send to this (blocked, recving) env: records the
    /// sender, value, and applied permission, clears `recving`, and marks
    /// the env runnable again. The caller (`sys_ipc_can_send`) is
    /// responsible for mapping the source page beforehand.
    pub(crate) fn complete_ipc_recv(&mut self, from: EnvId, value: u32, perm: u32) {
        self.env_ipc_from = from;
        self.env_ipc_value = value;
        self.env_ipc_perm = perm;
        self.env_ipc_recving = false;
        self.env_status = EnvStatus::Runnable;
        // Deliver `value`/`from`/`perm` to the resumed `ipc_recv` call via
        // scratch registers rather than a shared UENVS-style mapping.
        self.env_tf.tf_regs.reg_eax = value;
        self.env_tf.tf_regs.reg_edx = from.0;
        self.env_tf.tf_regs.reg_ecx = perm;
    }

    pub(crate) fn ipc_dstva(&self) -> VirtAddr {
        self.env_ipc_dstva
    }
}

pub(crate) struct EnvTable {
    envs: [Option<Env>; NENV],
    last_ids: [u32; NENV],
}

impl EnvTable {
    fn alloc_slot(&mut self) -> Option<usize> {
        self.envs.iter().position(|e| e.is_none())
    }

    /// `id = generation | slot`, where generation increases every time a
    /// slot is reused so a stale id can never alias a later occupant.
    fn generate_env_id(&mut self, slot: usize) -> EnvId {
        let step = 1u32 << (1 + LOG2NENV as u32);
        let mut generation = (self.last_ids[slot]).wrapping_add(step) & !((NENV as u32) - 1);
        if generation == 0 {
            generation = step;
        }
        self.last_ids[slot] = generation;
        EnvId(generation | (slot as u32))
    }

    pub(crate) fn find(&self, env_id: EnvId) -> Option<&Env> {
        let slot = env_id.slot();
        self.envs[slot]
            .as_ref()
            .filter(|env| env.env_id == env_id)
    }

    pub(crate) fn find_mut(&mut self, env_id: EnvId) -> Option<&mut Env> {
        let slot = env_id.slot();
        self.envs[slot]
            .as_mut()
            .filter(|env| env.env_id == env_id)
    }

    fn get_idx(&self, env_id: EnvId) -> Option<usize> {
        let slot = env_id.slot();
        if self.envs[slot].as_ref().map(|e| e.env_id) == Some(env_id) {
            Some(slot)
        } else {
            None
        }
    }

    pub(crate) fn find_runnable(&mut self) -> Option<EnvId> {
        let start = cur_env()
            .and_then(|e| self.get_idx(e.get_env_id()))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        for i in 0..NENV {
            let idx = (start + i) % NENV;
            if let Some(env) = &self.envs[idx] {
                if env.is_runnable() {
                    return Some(env.get_env_id());
                }
            }
        }

        // Only the current env is runnable (it is in fact still running).
        if start > 0 {
            if let Some(env) = &self.envs[start - 1] {
                return Some(env.get_env_id());
            }
        }

        None
    }

    /// Allocates and initializes a new environment: a fresh page directory
    /// (kernel portion + self-map only, no user mappings), a blank
    /// user-mode trap frame, and `NotRunnable` status. The caller wires up
    /// user memory and flips status to `Runnable`.
    fn env_alloc(&mut self, parent_id: EnvId, typ: EnvType) -> Result<EnvId, SysError> {
        let slot = self.alloc_slot().ok_or(SysError::NoFreeEnv)?;
        let new_id = self.generate_env_id(slot);
        let new_pgdir = env_setup_vm();
        let new_tf = Trapframe::new_for_user();

        self.envs[slot] = Some(Env {
            env_tf: new_tf,
            env_id: new_id,
            env_parent_id: parent_id,
            env_type: typ,
            env_status: EnvStatus::NotRunnable,
            env_runs: 0,
            env_pgdir: new_pgdir,
            env_pgfault_upcall: VirtAddr(0),
            env_xstacktop: VirtAddr(0),
            env_ipc_recving: false,
            env_ipc_dstva: VirtAddr(0),
            env_ipc_from: EnvId(0),
            env_ipc_value: 0,
            env_ipc_perm: 0,
        });

        Ok(new_id)
    }

    /// Implements the `env_alloc()` syscall: allocates a child of `parent`,
    /// copying its trap frame (with `eax` zeroed so the child observes a
    /// return of 0), its page-fault handler/exception-stack registration,
    /// and a fresh copy of its user-stack page.
    fn env_alloc_child(&mut self, parent: &mut Env) -> Result<EnvId, SysError> {
        let new_id = self.env_alloc(parent.env_id, EnvType::User)?;
        let new_env = self.find_mut(new_id).unwrap();

        new_env.env_tf = parent.env_tf.clone();
        new_env.env_tf.tf_regs.reg_eax = 0;
        new_env.env_pgfault_upcall = parent.env_pgfault_upcall;
        new_env.env_xstacktop = parent.env_xstacktop;

        let stack_base = VirtAddr(USTACKTOP - PGSIZE);
        if let Some((stack_pa, _)) = parent.env_pgdir.lookup_page(stack_base) {
            new_env
                .env_pgdir
                .insert_new_page(stack_base, (Perm::user_rw()).bits())?;
            unsafe {
                let src = VirtAddr(KERN_BASE + stack_pa.0).as_ptr::<u8>();
                let (dst_pa, _) = new_env.env_pgdir.lookup_page(stack_base).unwrap();
                let dst = VirtAddr(KERN_BASE + dst_pa.0).as_mut_ptr::<u8>();
                core::ptr::copy_nonoverlapping(src, dst, PGSIZE as usize);
            }
        }

        Ok(new_id)
    }

    /// Frees resources and memory the env uses except for the entry of env_table.
    /// Use env_release to release the entry.
    unsafe fn env_free(&mut self, env_id: EnvId) {
        let env = self.find_mut(env_id).expect("illegal env_id");

        // If freeing the current environment, switch to kern_pgdir
        // before freeing the page directory, just in case the page
        // gets reused.
        match cur_env_mut() {
            Some(e) if e.env_id == env.env_id => {
                pmap::load_kern_pgdir();
            }
            _ => {}
        }

        {
            let curenv_id = cur_env().map(Env::get_env_id).map(|x| x.0).unwrap_or(0);
            println!("[{:08x}] free env {:08x}", curenv_id, env.env_id);
        }

        // Flush all mapped pages in the user portion of the address space.
        assert_eq!(UTOP % (PTSIZE as u32), 0);
        let start_pdx = PDX::new(VirtAddr(0));
        let end_pdx = PDX::new(VirtAddr(UTOP));
        let mut pdx = start_pdx;
        while pdx < end_pdx {
            let pde = &env.env_pgdir[pdx];
            if pde.exists() {
                env.env_pgdir.remove_pde(pdx);
            }
            pdx += 1;
        }

        // The page directory's own allocation is owned by `Box`, so it is
        // freed automatically when the slot's `Option<Env>` is dropped in
        // `env_release`.

        env.env_status = EnvStatus::Zombie;
    }

    /// Release the entry of EnvTable.
    fn env_release(&mut self, env_id: EnvId) -> Option<EnvId> {
        let child_opt = self.find(env_id).filter(|child| child.is_zombie());

        match child_opt {
            None => None,
            Some(_) => {
                let idx = self.get_idx(env_id).unwrap();
                self.envs[idx] = None;
                Some(env_id)
            }
        }
    }
}

static ENV_TABLE: Mutex<EnvTable> = Mutex::new(EnvTable {
    envs: [None; NENV],
    last_ids: [0; NENV],
});

pub(crate) fn env_table() -> MutexGuard<'static, EnvTable> {
    ENV_TABLE.lock()
}

pub(crate) fn cur_env() -> Option<&'static Env> {
    mpconfig::this_cpu().cur_env()
}

pub(crate) fn cur_env_mut() -> Option<&'static mut Env> {
    mpconfig::this_cpu_mut().cur_env_mut()
}

/// Allocate a page directory for a new environment: the kernel portion
/// copied from `KERN_PGDIR`, plus the VPT/UVPT self-map. No user mappings.
fn env_setup_vm() -> Box<PageDirectory> {
    PageDirectory::new_for_user()
}

/// Looks up `env_id` the way `sys_*` calls do: `EnvId(0)` resolves to the
/// current env; otherwise the slot must hold an env whose id matches
/// exactly. When `check_perm`, the target must be the caller or its
/// immediate child.
pub(crate) fn find(
    table: &EnvTable,
    caller: &Env,
    env_id: EnvId,
    check_perm: bool,
) -> Result<EnvId, SysError> {
    let target = if env_id.0 == 0 {
        caller
    } else {
        table.find(env_id).ok_or(SysError::BadEnv)?
    };

    if check_perm && target.env_id != caller.env_id && target.env_parent_id != caller.env_id {
        return Err(SysError::BadEnv);
    }

    Ok(target.env_id)
}

/// Allocates a new env with env_alloc, loads the named elf
/// binary into it with load_icode, and sets its env_type.
/// This function is ONLY called during kernel initialization,
/// before running the first user-mode environment.
/// The new env's parent ID is set to 0.
pub(crate) fn env_create_for_init(env_table: &mut EnvTable, binary: *const u8) -> EnvId {
    let env_id = env_table
        .env_alloc(EnvId(0), EnvType::User)
        .expect("env_create_for_init: env_alloc failed");

    unsafe {
        load_icode(env_table, env_id, binary);
    }

    let env = env_table.find_mut(env_id).unwrap();
    env.env_status = EnvStatus::Runnable;

    env_id
}

/// Like `env_create_for_init`, but also grants IOPL=3 so the resulting
/// environment can execute `in`/`out` directly in ring 3: the FS server
/// talks to the IDE controller itself rather than through a kernel
/// driver (see `fs::block`). Must be called before `env_create_for_init`
/// during boot, since clients address the FS server by the fixed id
/// `constants::FS_ENV_ID`, which assumes it is always the first
/// environment allocated.
pub(crate) fn env_create_for_fs_server(env_table: &mut EnvTable, binary: *const u8) -> EnvId {
    let env_id = env_table
        .env_alloc(EnvId(0), EnvType::User)
        .expect("env_create_for_fs_server: env_alloc failed");

    unsafe {
        load_icode(env_table, env_id, binary);
    }

    let env = env_table.find_mut(env_id).unwrap();
    env.env_tf.grant_iopl3();
    env.env_status = EnvStatus::Runnable;

    env_id
}

/// Loads loadable ELF segments (and a fresh initial stack page) into a
/// freshly-allocated environment. Only used for boot-time init/fs_server
/// loading; ordinary user processes are `exec`'d by the FS server and a
/// user-level loader, not by the kernel.
unsafe fn load_icode(env_table: &mut EnvTable, env_id: EnvId, binary: *const u8) {
    use crate::elf::{ElfParser, ProghdrType};

    let env = env_table.find_mut(env_id).expect("illegal env_id");

    let elf = ElfParser::new(binary).expect("binary is not elf");

    let kern_pgdir = x86::rcr3();
    x86::lcr3(
        env.env_pgdir
            .paddr()
            .expect("failed to get a paddr of pgdir"),
    );

    for ph in elf.program_headers() {
        if ph.p_type != ProghdrType::PtLoad {
            continue;
        }

        let src_va = VirtAddr(binary as u32 + ph.p_offset);
        let dest_va = VirtAddr(ph.p_vaddr);
        let memsz = ph.p_memsz as usize;
        let filesz = ph.p_filesz as usize;

        env.env_pgdir.as_mut().region_alloc(dest_va, memsz);

        crate::util::memcpy(dest_va, src_va, filesz);
        crate::util::memset(dest_va + filesz, 0, memsz - filesz);
    }

    let stack_base = VirtAddr(USTACKTOP - PGSIZE);
    env.env_pgdir.region_alloc(stack_base, USTACKSIZE as usize);

    x86::lcr3(kern_pgdir);

    env.set_entry_point(elf.entry_point());
}

/// Restores the register values in the Trapframe with the 'iret' instruction.
/// This exits the kernel and starts executing some environment's code.
///
/// This function does not return.
fn env_pop_tf(tf: *const Trapframe) -> ! {
    unsafe {
        asm!(
        "movl $0, %esp; \
        popal; \
        popl %es; \
        popl %ds; \
        addl $1, %esp; \
        iret"
        : : "rmi" (tf), "i" (0x8) : "memory" : "volatile"
        );
    }

    panic!("iret failed")
}

/// Context switch from curenv to env e.
/// Note: if this is the first call to env_run, curenv is NULL.
/// Note: This function unlock a passed MutexGuard<ENV_TABLE>.
///
/// This function does not return.
pub(crate) fn env_run(env_id: EnvId, mut table: MutexGuard<EnvTable>) -> ! {
    if let Some(cur) = cur_env_mut().filter(|e| e.is_running()) {
        cur.pause();
    }

    let env = (*table).find_mut(env_id).unwrap();
    let env_tf = &env.env_tf as *const Trapframe;

    env.resume();
    mpconfig::this_cpu_mut().set_env(env);
    x86::lcr3(env.env_pgdir.paddr().unwrap());

    drop(table);

    env_pop_tf(env_tf);
}

/// Frees an environment.
///
/// If env was the current env, then runs a new environment (and does not
/// return to the caller).
pub(crate) fn env_destroy(env_id: EnvId, mut env_table: MutexGuard<EnvTable>) {
    let env = env_table.find_mut(env_id).expect("illegal env_id");

    let is_myself = if let Some(cur_env) = cur_env() {
        cur_env.get_env_id() == env.get_env_id()
    } else {
        false
    };

    if env.is_running() && !is_myself {
        env.die();
    } else {
        unsafe { env_table.env_free(env_id) };

        if is_myself {
            mpconfig::this_cpu_mut().unset_env();
            drop(env_table);
            sched::sched_yield();
        }
    }
}

/// Checks that environment 'env' is allowed to access the range
/// of memory [va, va+len) with permissions 'perm | PTE_U | PTE_P'.
/// If it can, then the function simply returns.
/// If it cannot, 'env' is destroyed and, if env is the current
/// environment, this function will not return.
pub(crate) fn user_mem_assert(env: &mut Env, va: VirtAddr, len: usize, perm: u32) {
    if let Err(addr) = env.env_pgdir.user_mem_check(va, len, perm | PTE_U) {
        println!(
            "[{:08x}] user_mem_check assertion failure for va {:08x}",
            env.env_id, addr.0
        );

        let env_table = env_table();
        env_destroy(env.get_env_id(), env_table);
    }
}

/// Implements the `env_alloc()` syscall on behalf of `parent` (the calling
/// env). Returns the new child's id to the parent; the child itself
/// observes a return of 0 (see `env_alloc_child`).
pub(crate) fn sys_env_alloc(parent: &mut Env) -> Result<EnvId, SysError> {
    let mut table = env_table();
    table.env_alloc_child(parent)
}

pub(crate) fn wait_env_id(env_id: EnvId) -> Option<EnvId> {
    let mut env_table = env_table();
    env_table.env_release(env_id)
}
