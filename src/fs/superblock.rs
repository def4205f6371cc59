// On-disk layout (SPEC_FULL.md 4.7/4.8): block 0 is an unused boot block,
// block 1 is the superblock below, block 2 onward are free-block bitmap
// blocks, and the remaining blocks hold file data and indirect blocks. The
// root directory's own 256-byte record is embedded in the superblock
// rather than stored as a regular file, the way JOS's `fs/fs.h` lays it
// out; mirrors `superblock.rs`'s `read_sb` pattern (`Once`-cached, read
// through the block cache) but with this crate's own disk format.

use crate::constants::*;
use crate::fs::block;
use crate::fs::file::RawFile;
use crate::once::Once;

#[repr(C)]
pub(crate) struct RawSuperBlock {
    pub(crate) magic: u32,
    pub(crate) nblocks: u32,
    pub(crate) root: RawFile,
}

pub(crate) const SUPERBLOCK_BLOCKNO: u32 = 1;
pub(crate) const FIRST_BITMAP_BLOCKNO: u32 = 2;

static NBLOCKS: Once<u32> = Once::new();

/// Validates the magic number and caches `nblocks`; panics (matching the
/// teacher's boot-time `expect`-or-die posture for an unreadable/garbage
/// disk) if the superblock doesn't look like one of ours.
pub(crate) fn mount() {
    NBLOCKS.call_once(|| {
        let ptr = block::read_block(SUPERBLOCK_BLOCKNO) as *const RawSuperBlock;
        let sb = unsafe { &*ptr };
        if sb.magic != SUPER_BLOCK_MAGIC {
            panic!("fs::superblock::mount: bad magic {:#x}", sb.magic);
        }
        if sb.nblocks as usize > (DISKMAX as usize) / BLKSIZE {
            panic!("fs::superblock::mount: disk image too large for DISKMAP window");
        }
        println!("fs: mounted, {} blocks", sb.nblocks);
        sb.nblocks
    });
}

pub(crate) fn nblocks() -> u32 {
    *NBLOCKS.wait().expect("fs::superblock::nblocks: called before mount()")
}

/// Number of blocks set aside for the free-block bitmap: one bit per block
/// in the whole disk, rounded up to a full block.
pub(crate) fn nbitmap_blocks() -> u32 {
    (nblocks() + (BLKSIZE as u32) * 8 - 1) / ((BLKSIZE as u32) * 8)
}

pub(crate) fn root_file_ptr() -> *mut RawFile {
    let ptr = block::read_block(SUPERBLOCK_BLOCKNO) as *mut RawSuperBlock;
    unsafe { &mut (*ptr).root as *mut RawFile }
}
