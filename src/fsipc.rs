// Wire contract shared between FS-server clients (`user/file.rs`) and the
// FS server itself (`fs/serve.rs`). Neither side imports the other's crate
// (they are separate ELF images), so this file is included verbatim into
// both via `#[path]`, the role JOS's `inc/fs.h` plays for `fs/` and `lib/`.

pub(crate) const MAXPATHLEN: usize = 1024;

/// IPC request type codes, passed as the `ipc_send` scalar value alongside
/// the mapped request page (SPEC_FULL.md 4.9).
pub(crate) const REQ_OPEN: u32 = 1;
pub(crate) const REQ_MAP: u32 = 2;
pub(crate) const REQ_SET_SIZE: u32 = 3;
pub(crate) const REQ_CLOSE: u32 = 4;
pub(crate) const REQ_DIRTY: u32 = 5;
pub(crate) const REQ_REMOVE: u32 = 6;
pub(crate) const REQ_SYNC: u32 = 7;

pub(crate) const O_RDONLY: u32 = 0x000;
pub(crate) const O_WRONLY: u32 = 0x001;
pub(crate) const O_RDWR: u32 = 0x002;
pub(crate) const O_CREATE: u32 = 0x100;
pub(crate) const O_TRUNC: u32 = 0x200;

#[repr(C)]
pub(crate) struct ReqOpen {
    pub(crate) path: [u8; MAXPATHLEN],
    pub(crate) omode: u32,
}

#[repr(C)]
pub(crate) struct ReqMap {
    pub(crate) fileid: i32,
    pub(crate) offset: u32,
}

#[repr(C)]
pub(crate) struct ReqSetSize {
    pub(crate) fileid: i32,
    pub(crate) size: u32,
}

#[repr(C)]
pub(crate) struct ReqClose {
    pub(crate) fileid: i32,
}

#[repr(C)]
pub(crate) struct ReqDirty {
    pub(crate) fileid: i32,
    pub(crate) offset: u32,
}

#[repr(C)]
pub(crate) struct ReqRemove {
    pub(crate) path: [u8; MAXPATHLEN],
}

/// What `OPEN` shares back with the client: a page holding the open file's
/// id, current size, and type, kept in sync by the server on every
/// `SET_SIZE` (so a client re-reading its own `Filefd` sees the server's
/// last word on the file's length without another round trip).
#[repr(C)]
pub(crate) struct Filefd {
    pub(crate) fileid: i32,
    pub(crate) size: u32,
    pub(crate) ftype: u32,
}

pub(crate) const FTYPE_REG: u32 = 0;
pub(crate) const FTYPE_DIR: u32 = 1;

pub(crate) const DEV_FILE: u32 = 0;
pub(crate) const DEV_CONSOLE: u32 = 1;
pub(crate) const DEV_PIPE: u32 = 2;

/// Full layout of one client FD-table page (SPEC_FULL.md 4.10). The server
/// only ever populates `file`, zeroing the rest on `open_alloc`; the
/// client fills in `fd_dev`/`fd_offset`/`fd_omode` itself once `OPEN`
/// succeeds and the page is mapped at its FD slot.
#[repr(C)]
pub(crate) struct FdPage {
    pub(crate) fd_dev: u32,
    pub(crate) fd_offset: u32,
    pub(crate) fd_omode: u32,
    pub(crate) file: Filefd,
}
