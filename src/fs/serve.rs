// FS server request loop (SPEC_FULL.md 4.9): receives one request page at
// REQVA per iteration, dispatches on the request type carried in the IPC
// scalar value, and replies with a status/scalar and (for OPEN and MAP) a
// page shared back to the caller. Mirrors the shape of JOS's `fs/serve.c`.

use crate::constants::*;
use crate::fs::file;
use crate::fs::file::RawFile;
use crate::fsipc::*;
use crate::spinlock::Mutex;
use crate::user::ipc::{ipc_recv, ipc_send};
use crate::user::syscall::sys_mem_alloc;

/// The FS server's own open-file table (SPEC_FULL.md 4.9). Files are kept
/// as `usize` (the `RawFile` address) rather than `*mut RawFile` so the
/// table stays `Send` and can live behind an ordinary lock instead of a
/// bare `static mut`, the way the kernel's own env table does.
struct OpenTable {
    files: [Option<(usize, i32)>; FS_MAXOPEN],
    last_ids: [u32; FS_MAXOPEN],
    filefd_mapped: [bool; FS_MAXOPEN],
}

impl OpenTable {
    const fn new() -> OpenTable {
        OpenTable {
            files: [None; FS_MAXOPEN],
            last_ids: [0; FS_MAXOPEN],
            filefd_mapped: [false; FS_MAXOPEN],
        }
    }

    /// `fileid = generation | slot`, generation bumped by `FS_MAXOPEN`
    /// every time a slot is reused so a stale fileid from a closed
    /// descriptor can never alias whatever opens into that slot next.
    fn generate_fileid(&mut self, slot: usize) -> i32 {
        let step = FS_MAXOPEN as u32;
        let mut generation = self.last_ids[slot].wrapping_add(step) & !(step - 1);
        if generation == 0 {
            generation = step;
        }
        self.last_ids[slot] = generation;
        (generation | (slot as u32)) as i32
    }

    fn alloc(&mut self) -> Result<(usize, i32), SysError> {
        let slot = self
            .files
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(SysError::MaxOpen)?;
        Ok((slot, self.generate_fileid(slot)))
    }

    fn lookup(&self, fileid: i32) -> Result<*mut RawFile, SysError> {
        if fileid <= 0 {
            return Err(SysError::Invalid);
        }
        let slot = fileid as usize & (FS_MAXOPEN - 1);
        match self.files[slot] {
            Some((f, id)) if id == fileid => Ok(f as *mut RawFile),
            _ => Err(SysError::Invalid),
        }
    }
}

static OPEN_TABLE: Mutex<OpenTable> = Mutex::new(OpenTable::new());

fn filefd_va(slot: usize) -> u32 {
    FILEFD_BASE + (slot as u32) * PGSIZE
}

fn open_lookup(fileid: i32) -> Result<*mut RawFile, SysError> {
    OPEN_TABLE.lock().lookup(fileid)
}

#[cfg(test)]
mod open_table_tests {
    use super::*;

    #[test]
    fn generation_occupies_the_high_bits_and_slot_the_low_bits() {
        let mut table = OpenTable::new();
        let id = table.generate_fileid(3);
        assert_eq!(id as usize & (FS_MAXOPEN - 1), 3);
        assert!(id as u32 >= FS_MAXOPEN as u32);
    }

    #[test]
    fn reusing_a_slot_bumps_the_generation_each_time() {
        let mut table = OpenTable::new();
        let first = table.generate_fileid(9);
        let second = table.generate_fileid(9);
        assert_ne!(first, second);
        assert_eq!(first as usize & (FS_MAXOPEN - 1), 9);
        assert_eq!(second as usize & (FS_MAXOPEN - 1), 9);
        assert!((second as u32) > (first as u32));
    }

    #[test]
    fn lookup_rejects_a_stale_fileid_from_a_reused_slot() {
        let mut table = OpenTable::new();
        let stale = table.generate_fileid(15);
        let fresh = table.generate_fileid(15);
        table.files[15] = Some((0x1000, fresh));
        assert!(table.lookup(stale).is_err());
        assert!(table.lookup(fresh).is_ok());
    }

    #[test]
    fn alloc_picks_the_first_free_slot() {
        let mut table = OpenTable::new();
        table.files[0] = Some((0x1000, 1));
        let (slot, _) = table.alloc().unwrap();
        assert_eq!(slot, 1);
    }
}

fn path_str(raw: &[u8; MAXPATHLEN]) -> Result<&str, SysError> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    core::str::from_utf8(&raw[..len]).map_err(|_| SysError::BadPath)
}

/// Result a handler hands back to `serve`: a scalar reply value and,
/// optionally, a page of this env's own address space to share to the
/// caller at `perm`.
struct Reply {
    value: i32,
    share_va: u32,
    perm: u32,
}

fn ok(value: i32) -> Reply {
    Reply { value, share_va: 0, perm: 0 }
}

fn err(e: SysError) -> Reply {
    Reply { value: e.code(), share_va: 0, perm: 0 }
}

fn handle_open(req: &ReqOpen) -> Reply {
    let path = match path_str(&req.path) {
        Ok(p) => p,
        Err(e) => return err(e),
    };

    let f = if req.omode & O_CREATE != 0 {
        match file::file_create(path, FTYPE_REG) {
            Ok(f) => f,
            Err(SysError::FileExists) => match file::file_open(path) {
                Ok(f) => f,
                Err(e) => return err(e),
            },
            Err(e) => return err(e),
        }
    } else {
        match file::file_open(path) {
            Ok(f) => f,
            Err(e) => return err(e),
        }
    };

    if req.omode & O_TRUNC != 0 {
        if let Err(e) = file::file_truncate(f) {
            return err(e);
        }
    }

    let (slot, fileid, already_mapped) = {
        let mut table = OPEN_TABLE.lock();
        let (slot, fileid) = match table.alloc() {
            Ok(r) => r,
            Err(e) => return err(e),
        };
        table.files[slot] = Some((f as usize, fileid));
        let already_mapped = table.filefd_mapped[slot];
        (slot, fileid, already_mapped)
    };

    let va = filefd_va(slot);
    if !already_mapped {
        let rc = sys_mem_alloc(0, va, Perm::user_rw().bits());
        if rc < 0 {
            OPEN_TABLE.lock().files[slot] = None;
            return err(SysError::from_code(rc).unwrap_or(SysError::Invalid));
        }
        OPEN_TABLE.lock().filefd_mapped[slot] = true;
    }

    let page = unsafe { &mut *(va as *mut Filefd) };
    page.fileid = fileid;
    page.size = unsafe { (*f).size };
    page.ftype = unsafe { (*f).ftype };

    Reply { value: 0, share_va: va, perm: Perm::user_ro().bits() }
}

fn handle_map(req: &ReqMap) -> Reply {
    let f = match open_lookup(req.fileid) {
        Ok(f) => f,
        Err(e) => return err(e),
    };
    match file::file_map_block(f, req.offset as usize / BLKSIZE) {
        Ok(blockno) => {
            let va = crate::fs::block::disk_addr(blockno);
            let _ = crate::fs::block::read_block(blockno);
            Reply { value: 0, share_va: va, perm: Perm::user_rw().bits() }
        }
        Err(e) => err(e),
    }
}

fn handle_set_size(req: &ReqSetSize) -> Reply {
    let f = match open_lookup(req.fileid) {
        Ok(f) => f,
        Err(e) => return err(e),
    };
    match file::file_set_size(f, req.size) {
        Ok(()) => ok(0),
        Err(e) => err(e),
    }
}

fn handle_close(req: &ReqClose) -> Reply {
    let mut table = OPEN_TABLE.lock();
    if table.lookup(req.fileid).is_err() {
        return err(SysError::Invalid);
    }
    let slot = req.fileid as usize & (FS_MAXOPEN - 1);
    table.files[slot] = None;
    ok(0)
}

fn handle_dirty(req: &ReqDirty) -> Reply {
    let f = match open_lookup(req.fileid) {
        Ok(f) => f,
        Err(e) => return err(e),
    };
    match file::file_map_block(f, req.offset as usize / BLKSIZE) {
        Ok(blockno) => {
            crate::fs::block::dirty_block(blockno);
            ok(0)
        }
        Err(e) => err(e),
    }
}

fn handle_remove(req: &ReqRemove) -> Reply {
    let path = match path_str(&req.path) {
        Ok(p) => p,
        Err(e) => return err(e),
    };
    match file::file_remove(path) {
        Ok(()) => ok(0),
        Err(e) => err(e),
    }
}

fn handle_sync() -> Reply {
    file::fs_sync();
    ok(0)
}

pub(crate) fn serve() -> ! {
    loop {
        let received = match ipc_recv(REQVA) {
            Ok(r) => r,
            Err(_) => continue,
        };

        let reply = match received.value {
            REQ_OPEN => handle_open(unsafe { &*(REQVA as *const ReqOpen) }),
            REQ_MAP => handle_map(unsafe { &*(REQVA as *const ReqMap) }),
            REQ_SET_SIZE => handle_set_size(unsafe { &*(REQVA as *const ReqSetSize) }),
            REQ_CLOSE => handle_close(unsafe { &*(REQVA as *const ReqClose) }),
            REQ_DIRTY => handle_dirty(unsafe { &*(REQVA as *const ReqDirty) }),
            REQ_REMOVE => handle_remove(unsafe { &*(REQVA as *const ReqRemove) }),
            REQ_SYNC => handle_sync(),
            _ => err(SysError::Invalid),
        };

        ipc_send(received.from, reply.value as u32, reply.share_va, reply.perm);
    }
}
