// Compile-time configuration: memory layout, resource limits, and the
// stable error-kind hierarchy shared by the kernel, the FS server, and
// every client. Numeric values below UTOP/ULIM follow the JOS memory map;
// REQVA/FDTABLE/DISKMAP and the on-disk layout constants are this crate's
// own addition for the FS-server/client split.

use bitflags::bitflags;
use thiserror::Error;

pub(crate) const KERN_BASE: u32 = 0xf0000000;
pub(crate) const PGSIZE: u32 = 4096;
pub(crate) const PGSHIFT: u32 = 12;
pub(crate) const PTE_U: u32 = 0x4;
pub(crate) const PTE_W: u32 = 0x2;
pub(crate) const PTE_P: u32 = 0x1;
pub(crate) const PTE_PCD: u32 = 0x10;
pub(crate) const PTE_PWT: u32 = 0x8;
pub(crate) const NPDENTRIES: usize = 1024;
pub(crate) const NPTENTRIES: usize = 1024;
pub(crate) const PTSIZE: usize = NPTENTRIES * (PGSIZE as usize);

pub(crate) const KSTACKTOP: u32 = KERN_BASE;
pub(crate) const KSTKSIZE: u32 = 8 * PGSIZE;
pub(crate) const KSTKGAP: u32 = 8 * PGSIZE;
pub(crate) const MMIOLIM: u32 = KSTACKTOP - (PTSIZE as u32);
pub(crate) const MMIOBASE: u32 = MMIOLIM - (PTSIZE as u32);
pub(crate) const ULIM: u32 = MMIOBASE;

// Self-mapping window: the page directory maps its own page tables (VPT)
// and itself (UVPT, read-only to user code) just below ULIM. This is what
// lets user-level fork walk its own PTEs without a syscall.
pub(crate) const UVPT: u32 = ULIM - (PTSIZE as u32);
pub(crate) const VPT: u32 = UVPT - (PTSIZE as u32);

pub(crate) const UTOP: u32 = VPT;
pub(crate) const UXSTACKTOP: u32 = UTOP;
pub(crate) const UXSTACKSIZE: usize = PGSIZE as usize;
pub(crate) const USTACKTOP: u32 = UTOP - 2 * PGSIZE;
pub(crate) const USTACKSIZE: u32 = PGSIZE;

// Kernel heap area, backing the global allocator (see allocator.rs). Not
// part of JOS/xv6's own memory map; this crate's own addition.
pub(crate) const KHEAP_BASE: u32 = ULIM - KHEAP_SIZE as u32;
pub(crate) const KHEAP_SIZE: usize = 3 * PTSIZE;

pub(crate) const CR0_PE: u32 = 0x0000001;
pub(crate) const CR0_MP: u32 = 0x0000002;
pub(crate) const CR0_EM: u32 = 0x0000004;
pub(crate) const CR0_TS: u32 = 0x0000008;
pub(crate) const CR0_ET: u32 = 0x0000010;
pub(crate) const CR0_NE: u32 = 0x0000020;
pub(crate) const CR0_WP: u32 = 0x0010000;
pub(crate) const CR0_AM: u32 = 0x0040000;
pub(crate) const CR0_NW: u32 = 0x2000000;
pub(crate) const CR0_CD: u32 = 0x4000000;
pub(crate) const CR0_PG: u32 = 0x8000000;

/// Environment table size and id encoding: `id = (gen << (1 + LOG2NENV)) | slot`.
pub(crate) const LOG2NENV: u32 = 10;
pub(crate) const NENV: usize = 1 << LOG2NENV;

/// Per-process open file descriptors.
pub(crate) const MAXOPEN: usize = 1 << 6;
/// FS-server side open table, shared by every client.
pub(crate) const FS_MAXOPEN: usize = 1024;

/// Fixed virtual address the FS server receives request pages at.
pub(crate) const REQVA: u32 = 0x0ffff000;
/// Fixed virtual address each client keeps its own outgoing request page at,
/// filled in before `ipc_send` shares it to the server's `REQVA`.
pub(crate) const FSIPCBUF: u32 = 0x0ffff000 - PGSIZE;
/// The FS server is always the first environment `main.rs` creates at boot
/// (slot 0, first generation), so its id is this fixed value rather than
/// something clients discover at runtime — there is no environment
/// directory/UENVS-style mapping exposed to user code in this design.
pub(crate) const FS_ENV_ID: u32 = 1 << (1 + LOG2NENV);
/// Base of the per-process file descriptor table (one page per fd).
pub(crate) const FDTABLE: u32 = 0xd0000000;
/// FS server's own region for per-open `Filefd` pages, one per
/// `FS_MAXOPEN` slot, shared out (read-only) to clients on `OPEN`.
pub(crate) const FILEFD_BASE: u32 = 0xc0000000;
/// Window the FS server maps the disk block cache into: block `b` lives at
/// `DISKMAP + b * BLKSIZE`.
pub(crate) const DISKMAP: u32 = 0x10000000;
pub(crate) const DISKMAX: u32 = 0x10000000;

pub(crate) const SECTOR_SIZE: usize = 512;
pub(crate) const BLKSIZE: usize = PGSIZE as usize;
pub(crate) const SECTS_PER_BLK: usize = BLKSIZE / SECTOR_SIZE;

/// Direct + indirect block pointers per file, and entries per indirect block.
pub(crate) const NDIRECT: usize = 10;
pub(crate) const NINDIRECT: usize = BLKSIZE / 4;
pub(crate) const MAXFILEBLKS: usize = NDIRECT + NINDIRECT;

pub(crate) const SUPER_BLOCK_MAGIC: u32 = 0x68286097;

pub(crate) const MAX_CMD_ARGS: usize = 16;
pub(crate) const MAX_CMD_ARG_LEN: usize = 128;

bitflags! {
    /// Page table entry permission bits below PGSHIFT.
    ///
    /// `COW` never coexists with `W` in an installed mapping: a page marked
    /// `COW` traps on write, and the fault handler installs a private copy
    /// with `W` set and `COW` cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Perm: u32 {
        const P = PTE_P;
        const W = PTE_W;
        const U = PTE_U;
        /// Copy-on-write: shared, read-only until the next write fault.
        const COW = 0x800;
        /// Library page: shared and writable by every holder, never COW'd.
        /// Used for descriptor pages shared between a client and the FS server.
        const LIBRARY = 0x400;
    }
}

impl Perm {
    pub(crate) fn user_rw() -> Perm {
        Perm::P | Perm::U | Perm::W
    }

    pub(crate) fn user_ro() -> Perm {
        Perm::P | Perm::U
    }
}

/// Stable error kinds, shared across the syscall ABI, the IPC wire
/// contract between the FS server and its clients, and ordinary library
/// `Result`s. Numeric values are part of the ABI; don't renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(i32)]
pub(crate) enum SysError {
    #[error("no such environment")]
    BadEnv = -1,
    #[error("invalid argument")]
    Invalid = -2,
    #[error("out of memory")]
    NoMem = -3,
    #[error("out of disk blocks")]
    NoDisk = -4,
    #[error("no such file")]
    NotFound = -5,
    #[error("malformed path")]
    BadPath = -6,
    #[error("file already exists")]
    FileExists = -7,
    #[error("too many open files")]
    MaxOpen = -8,
    #[error("recipient is not blocked in ipc_recv")]
    IpcNotRecv = -9,
    #[error("no free environment slots")]
    NoFreeEnv = -10,
}

impl SysError {
    pub(crate) fn code(self) -> i32 {
        self as i32
    }

    pub(crate) fn from_code(code: i32) -> Option<SysError> {
        match code {
            -1 => Some(SysError::BadEnv),
            -2 => Some(SysError::Invalid),
            -3 => Some(SysError::NoMem),
            -4 => Some(SysError::NoDisk),
            -5 => Some(SysError::NotFound),
            -6 => Some(SysError::BadPath),
            -7 => Some(SysError::FileExists),
            -8 => Some(SysError::MaxOpen),
            -9 => Some(SysError::IpcNotRecv),
            -10 => Some(SysError::NoFreeEnv),
            _ => None,
        }
    }
}
