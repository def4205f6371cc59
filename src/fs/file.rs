// 256-byte on-disk file/directory record (SPEC_FULL.md 4.8). There is no
// separate inode table: a file's record lives embedded directly inside
// its parent directory's data blocks, and the root directory's own
// record is embedded in the superblock. This mirrors how JOS's
// `fs/fs.h` lays out `struct File`; operations below are the user-mode,
// synchronous counterparts of xv6's `fs.rs`/`file.rs` kernel routines.

use crate::constants::*;
use crate::fs::bitmap;
use crate::fs::block;
use crate::fs::superblock;
use crate::fsipc::{FTYPE_DIR, FTYPE_REG};

pub(crate) const MAXNAMELEN: usize = 128;
const FILES_PER_BLOCK: usize = BLKSIZE / core::mem::size_of::<RawFile>();
const PAD_LEN: usize = 256 - (MAXNAMELEN + 4 + 4 + NDIRECT * 4 + 4);

#[repr(C)]
pub(crate) struct RawFile {
    pub(crate) name: [u8; MAXNAMELEN],
    pub(crate) size: u32,
    pub(crate) ftype: u32,
    pub(crate) direct: [u32; NDIRECT],
    pub(crate) indirect: u32,
    _pad: [u8; PAD_LEN],
}

fn name_eq(raw: &[u8; MAXNAMELEN], name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() >= MAXNAMELEN {
        return false;
    }
    &raw[..bytes.len()] == bytes && raw[bytes.len()] == 0
}

fn set_name(raw: &mut [u8; MAXNAMELEN], name: &str) -> Result<(), SysError> {
    let bytes = name.as_bytes();
    if bytes.len() >= MAXNAMELEN {
        return Err(SysError::BadPath);
    }
    for b in raw.iter_mut() {
        *b = 0;
    }
    raw[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn blockno_of(f: *mut RawFile) -> u32 {
    ((f as u32) - DISKMAP) / (BLKSIZE as u32)
}

fn dirty_record(f: *mut RawFile) {
    block::dirty_block(blockno_of(f));
}

fn flush_record(f: *mut RawFile) {
    block::write_block(blockno_of(f));
}

/// Returns a pointer to the block-pointer slot holding block number
/// `filebno` of `f` (a direct slot, or an entry inside the indirect
/// block), allocating the indirect block itself if `alloc` and none
/// exists yet.
fn file_block_walk(f: *mut RawFile, filebno: usize, alloc: bool) -> Result<*mut u32, SysError> {
    if filebno >= NDIRECT + NINDIRECT {
        return Err(SysError::Invalid);
    }
    if filebno < NDIRECT {
        return Ok(unsafe { &mut (*f).direct[filebno] as *mut u32 });
    }

    if unsafe { (*f).indirect } == 0 {
        if !alloc {
            return Err(SysError::NotFound);
        }
        let blockno = bitmap::alloc_block().ok_or(SysError::NoDisk)?;
        let ptr = block::read_block(blockno);
        unsafe { core::ptr::write_bytes(ptr, 0, BLKSIZE) };
        block::write_block(blockno);

        dirty_record(f);
        unsafe { (*f).indirect = blockno };
        flush_record(f);
    }

    let indirect_blockno = unsafe { (*f).indirect };
    let base = block::read_block(indirect_blockno) as *mut u32;
    Ok(unsafe { base.add(filebno - NDIRECT) })
}

/// Returns the block number backing file offset `filebno`, allocating a
/// fresh data block (and updating the block pointer slot) if none is
/// mapped yet.
pub(crate) fn file_map_block(f: *mut RawFile, filebno: usize) -> Result<u32, SysError> {
    let slot = file_block_walk(f, filebno, true)?;
    let existing = unsafe { *slot };
    if existing != 0 {
        return Ok(existing);
    }

    let blockno = bitmap::alloc_block().ok_or(SysError::NoDisk)?;
    let indirect_table = filebno >= NDIRECT;
    if indirect_table {
        block::dirty_block(unsafe { (*f).indirect });
    } else {
        dirty_record(f);
    }
    unsafe { *slot = blockno };
    if indirect_table {
        block::write_block(unsafe { (*f).indirect });
    } else {
        flush_record(f);
    }
    Ok(blockno)
}

fn file_clear_block(f: *mut RawFile, filebno: usize) -> Result<(), SysError> {
    let slot = match file_block_walk(f, filebno, false) {
        Ok(s) => s,
        Err(SysError::NotFound) => return Ok(()),
        Err(e) => return Err(e),
    };
    let blockno = unsafe { *slot };
    if blockno == 0 {
        return Ok(());
    }
    bitmap::free_block(blockno);

    let indirect_table = filebno >= NDIRECT;
    if indirect_table {
        block::dirty_block(unsafe { (*f).indirect });
    } else {
        dirty_record(f);
    }
    unsafe { *slot = 0 };
    if indirect_table {
        block::write_block(unsafe { (*f).indirect });
    } else {
        flush_record(f);
    }
    Ok(())
}

/// Maps in (allocating if necessary) and returns a pointer to the data
/// block holding byte offset `offset`.
pub(crate) fn file_get_block(f: *mut RawFile, offset: u32) -> Result<*mut u8, SysError> {
    let filebno = offset as usize / BLKSIZE;
    let blockno = file_map_block(f, filebno)?;
    Ok(block::read_block(blockno))
}

/// Grows or shrinks a file's `size` field, freeing any data blocks that
/// fall past a shrunk size.
pub(crate) fn file_set_size(f: *mut RawFile, newsize: u32) -> Result<(), SysError> {
    let old = unsafe { (*f).size };
    if newsize < old {
        let old_nblocks = (old as usize + BLKSIZE - 1) / BLKSIZE;
        let new_nblocks = (newsize as usize + BLKSIZE - 1) / BLKSIZE;
        for bno in new_nblocks..old_nblocks {
            file_clear_block(f, bno)?;
        }
        if newsize == 0 && unsafe { (*f).indirect } != 0 {
            bitmap::free_block(unsafe { (*f).indirect });
            dirty_record(f);
            unsafe { (*f).indirect = 0 };
        }
    }
    dirty_record(f);
    unsafe { (*f).size = newsize };
    flush_record(f);
    Ok(())
}

pub(crate) fn file_truncate(f: *mut RawFile) -> Result<(), SysError> {
    file_set_size(f, 0)
}

fn dir_entries(dir: *mut RawFile) -> Result<usize, SysError> {
    if unsafe { (*dir).ftype } != FTYPE_DIR {
        return Err(SysError::Invalid);
    }
    Ok((unsafe { (*dir).size } as usize + BLKSIZE - 1) / BLKSIZE)
}

/// Linear scan of a directory's data blocks for an entry named `name`.
pub(crate) fn dir_lookup(dir: *mut RawFile, name: &str) -> Result<*mut RawFile, SysError> {
    let nblocks = dir_entries(dir)?;
    for filebno in 0..nblocks {
        let base = file_get_block(dir, (filebno * BLKSIZE) as u32)? as *mut RawFile;
        for i in 0..FILES_PER_BLOCK {
            let entry = unsafe { base.add(i) };
            let raw = unsafe { &*entry };
            if raw.name[0] != 0 && name_eq(&raw.name, name) {
                return Ok(entry);
            }
        }
    }
    Err(SysError::NotFound)
}

/// Finds a free record slot in `dir`, extending it by one block if every
/// existing block is full, and returns a pointer to the (still
/// zero-initialized aside from being claimed) slot.
pub(crate) fn dir_alloc_file(dir: *mut RawFile) -> Result<*mut RawFile, SysError> {
    let nblocks = dir_entries(dir)?;
    for filebno in 0..nblocks {
        let base = file_get_block(dir, (filebno * BLKSIZE) as u32)? as *mut RawFile;
        for i in 0..FILES_PER_BLOCK {
            let entry = unsafe { base.add(i) };
            if unsafe { (*entry).name[0] } == 0 {
                return Ok(entry);
            }
        }
    }

    let old_size = unsafe { (*dir).size };
    let blockno = file_map_block(dir, nblocks)?;
    block::dirty_block(blockno);
    let base = block::read_block(blockno);
    unsafe { core::ptr::write_bytes(base, 0, BLKSIZE) };
    block::write_block(blockno);
    file_set_size(dir, old_size + BLKSIZE as u32)?;
    Ok(base as *mut RawFile)
}

/// Splits `path` on `/` and walks it component by component from the
/// root. On success returns the matching record; `NotFound` callers that
/// want to create the missing leaf should look it up themselves via
/// `dir_lookup`/`dir_alloc_file` on the parent (see `file_create`).
pub(crate) fn walk_path(path: &str) -> Result<*mut RawFile, SysError> {
    let mut cur = superblock::root_file_ptr();
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(cur);
    }
    for component in trimmed.split('/') {
        if component.is_empty() {
            continue;
        }
        cur = dir_lookup(cur, component)?;
    }
    Ok(cur)
}

fn split_parent(path: &str) -> Result<(&str, &str), SysError> {
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SysError::BadPath);
    }
    match trimmed.rfind('/') {
        Some(i) => Ok((&trimmed[..i], &trimmed[i + 1..])),
        None => Ok(("", trimmed)),
    }
}

/// Creates a new file or directory at `path`. Fails with `FileExists` if
/// something is already there.
pub(crate) fn file_create(path: &str, ftype: u32) -> Result<*mut RawFile, SysError> {
    let (parent_path, name) = split_parent(path)?;
    if name.len() >= MAXNAMELEN {
        return Err(SysError::BadPath);
    }

    let parent = walk_path(parent_path)?;
    if dir_lookup(parent, name).is_ok() {
        return Err(SysError::FileExists);
    }

    let entry = dir_alloc_file(parent)?;
    dirty_record(entry);
    unsafe {
        set_name(&mut (*entry).name, name)?;
        (*entry).size = 0;
        (*entry).ftype = ftype;
        (*entry).direct = [0; NDIRECT];
        (*entry).indirect = 0;
    }
    flush_record(entry);
    Ok(entry)
}

pub(crate) fn file_open(path: &str) -> Result<*mut RawFile, SysError> {
    walk_path(path)
}

/// Zeroes out a record's data and reclaims the slot (the record's name
/// being empty is what `dir_lookup`/`dir_alloc_file` treat as "free").
pub(crate) fn file_remove(path: &str) -> Result<(), SysError> {
    let f = walk_path(path)?;
    if f == superblock::root_file_ptr() {
        return Err(SysError::Invalid);
    }
    if unsafe { (*f).ftype } == FTYPE_DIR {
        let nblocks = dir_entries(f)?;
        for filebno in 0..nblocks {
            let base = file_get_block(f, (filebno * BLKSIZE) as u32)? as *mut RawFile;
            for i in 0..FILES_PER_BLOCK {
                if unsafe { (*base.add(i)).name[0] } != 0 {
                    return Err(SysError::Invalid);
                }
            }
        }
    }

    file_truncate(f)?;
    dirty_record(f);
    unsafe {
        (*f).name = [0; MAXNAMELEN];
        (*f).ftype = FTYPE_REG;
    }
    flush_record(f);
    Ok(())
}

pub(crate) fn fs_sync() {
    block::flush_all(superblock::nblocks());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_eq_matches_exact_and_rejects_prefix() {
        let mut raw = [0u8; MAXNAMELEN];
        raw[..5].copy_from_slice(b"hello");
        assert!(name_eq(&raw, "hello"));
        assert!(!name_eq(&raw, "hell"));
        assert!(!name_eq(&raw, "hello2"));
    }

    #[test]
    fn set_name_zeroes_the_rest_of_the_record() {
        let mut raw = [0xffu8; MAXNAMELEN];
        set_name(&mut raw, "a").unwrap();
        assert_eq!(&raw[..1], b"a");
        assert!(raw[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn set_name_rejects_a_name_that_fills_the_whole_record() {
        let mut raw = [0u8; MAXNAMELEN];
        let long = "x".repeat(MAXNAMELEN);
        assert!(set_name(&mut raw, &long).is_err());
    }

    #[test]
    fn split_parent_splits_on_the_last_slash() {
        assert_eq!(split_parent("/a/b/c").unwrap(), ("a/b", "c"));
        assert_eq!(split_parent("/greeting").unwrap(), ("", "greeting"));
        assert_eq!(split_parent("greeting").unwrap(), ("", "greeting"));
    }

    #[test]
    fn split_parent_rejects_the_root_itself() {
        assert!(split_parent("/").is_err());
        assert!(split_parent("").is_err());
    }

    #[test]
    fn filebno_within_direct_range_uses_direct_slot_count() {
        assert!(NDIRECT < MAXFILEBLKS);
        assert_eq!(MAXFILEBLKS, NDIRECT + NINDIRECT);
    }
}
