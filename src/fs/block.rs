// Disk block cache (SPEC_FULL.md 4.7): the FS server maps block `b` of the
// disk at `DISKMAP + b * BLKSIZE` on first touch and leaves it resident
// until `unmap_block` evicts it. Backing I/O is a synchronous, polling PIO
// IDE driver running in ring 3 (the FS server's trapframe carries IOPL=3,
// see `env::env_create_for_fs_server`), since this address space has no
// interrupt vector of its own to wait on. Register layout and command
// codes are the same ones xv6/JOS's kernel-side `ide.rs` used.

use crate::constants::*;
use crate::user::pagetable::page_perm;
use crate::user::syscall::{sys_mem_alloc, sys_mem_map};

mod ports {
    pub(crate) const SR_BSY: u8 = 0x80;
    pub(crate) const SR_DRDY: u8 = 0x40;
    pub(crate) const SR_DWF: u8 = 0x20;
    pub(crate) const SR_ERR: u8 = 0x01;

    pub(crate) const PRIMARY_COMMAND_BASE_REG: u16 = 0x1f0;
    pub(crate) const PRIMARY_CONTROL_BASE_REG: u16 = 0x3f6;

    pub(crate) const REG_DATA: u16 = 0x00;
    pub(crate) const REG_SECCOUNT0: u16 = 0x02;
    pub(crate) const REG_LBA0: u16 = 0x03;
    pub(crate) const REG_LBA1: u16 = 0x04;
    pub(crate) const REG_LBA2: u16 = 0x05;
    pub(crate) const REG_HDDEVSEL: u16 = 0x06;
    pub(crate) const REG_COMMAND: u16 = 0x07;
    pub(crate) const REG_STATUS: u16 = 0x07;

    pub(crate) const IDE_CMD_READ: u8 = 0x20;
    pub(crate) const IDE_CMD_WRITE: u8 = 0x30;
    pub(crate) const IDE_CMD_RDMUL: u8 = 0xc4;
    pub(crate) const IDE_CMD_WRMUL: u8 = 0xc5;
}
use ports::*;

#[inline(always)]
unsafe fn inb(port: u16) -> u8 {
    let ret: u8;
    asm!("inb $1, $0" : "={al}"(ret) : "N{dx}"(port) :: "volatile");
    ret
}

#[inline(always)]
unsafe fn outb(port: u16, val: u8) {
    asm!("outb $1, $0" :: "N{dx}"(port), "{al}"(val) :: "volatile");
}

#[inline(always)]
unsafe fn insl(port: u16, addr: *mut u32, count: usize) {
    asm!("cld; rep insl (%dx), %es:(%edi)"
        : "={edi}"(addr), "={ecx}"(count)
        : "{dx}"(port), "{edi}"(addr), "{ecx}"(count)
        : "memory", "cc"
        : "volatile");
}

#[inline(always)]
unsafe fn outsl(port: u16, addr: *const u32, count: usize) {
    asm!("cld; rep outsl %ds:(%esi), (%dx)"
        : "={esi}"(addr), "={ecx}"(count)
        : "{dx}"(port), "{esi}"(addr), "{ecx}"(count)
        : "cc"
        : "volatile");
}

fn ide_wait_ready(check_error: bool) -> bool {
    let mut r: u8;
    loop {
        r = unsafe { inb(PRIMARY_COMMAND_BASE_REG + REG_STATUS) };
        if (r & (SR_BSY | SR_DRDY)) == SR_DRDY {
            break;
        }
    }
    !check_error || ((r & (SR_DWF | SR_ERR)) == 0)
}

fn ide_start(blockno: u32, write: bool, data: &[u8]) {
    let sector_per_blk = SECTS_PER_BLK as u32;
    let sector = blockno * sector_per_blk;
    let cmd = if write {
        if sector_per_blk == 1 { IDE_CMD_WRITE } else { IDE_CMD_WRMUL }
    } else if sector_per_blk == 1 {
        IDE_CMD_READ
    } else {
        IDE_CMD_RDMUL
    };

    if !ide_wait_ready(true) {
        panic!("ide_start: drive not ready");
    }

    unsafe {
        outb(PRIMARY_CONTROL_BASE_REG, 0);
        outb(PRIMARY_COMMAND_BASE_REG + REG_SECCOUNT0, sector_per_blk as u8);
        outb(PRIMARY_COMMAND_BASE_REG + REG_LBA0, (sector & 0xff) as u8);
        outb(PRIMARY_COMMAND_BASE_REG + REG_LBA1, ((sector >> 8) & 0xff) as u8);
        outb(PRIMARY_COMMAND_BASE_REG + REG_LBA2, ((sector >> 16) & 0xff) as u8);
        outb(
            PRIMARY_COMMAND_BASE_REG + REG_HDDEVSEL,
            0xe0 | (((sector >> 24) & 0x0f) as u8),
        );
        outb(PRIMARY_COMMAND_BASE_REG + REG_COMMAND, cmd);

        if write {
            outsl(
                PRIMARY_COMMAND_BASE_REG + REG_DATA,
                data.as_ptr().cast::<u32>(),
                BLKSIZE / 4,
            );
        }
    }
}

fn ide_read_block(blockno: u32, buf: &mut [u8]) {
    ide_start(blockno, false, &[]);
    if !ide_wait_ready(true) {
        panic!("ide_read_block: drive error");
    }
    unsafe {
        insl(
            PRIMARY_COMMAND_BASE_REG + REG_DATA,
            buf.as_mut_ptr().cast::<u32>(),
            BLKSIZE / 4,
        );
    }
}

fn ide_write_block(blockno: u32, buf: &[u8]) {
    ide_start(blockno, true, buf);
    if !ide_wait_ready(true) {
        panic!("ide_write_block: drive error");
    }
}

/// Virtual address block `blockno` lives at once mapped.
pub(crate) fn disk_addr(blockno: u32) -> u32 {
    DISKMAP + blockno * (BLKSIZE as u32)
}

pub(crate) fn block_is_mapped(blockno: u32) -> bool {
    page_perm(disk_addr(blockno)).0
}

fn block_is_dirty(blockno: u32) -> bool {
    let (present, perm) = page_perm(disk_addr(blockno));
    present && perm & PTE_W != 0
}

/// Maps the block in (read-only, clean) if it isn't resident yet, then
/// returns a pointer to it. `write_block` must be called before any
/// caller writes through this pointer.
pub(crate) fn read_block(blockno: u32) -> *mut u8 {
    let va = disk_addr(blockno);
    if !block_is_mapped(blockno) {
        let rc = sys_mem_alloc(0, va, Perm::user_ro().bits());
        if rc < 0 {
            panic!("read_block: mem_alloc failed for block {}", blockno);
        }
        let buf = unsafe { core::slice::from_raw_parts_mut(va as *mut u8, BLKSIZE) };
        ide_read_block(blockno, buf);
    }
    va as *mut u8
}

/// Marks a resident block writable (the page is already private to this
/// env; this just flips the permission bit in place via a same-env
/// `sys_mem_map`, so the frame's contents survive). Panics if the block
/// was never read in first.
pub(crate) fn dirty_block(blockno: u32) {
    let va = disk_addr(blockno);
    if !block_is_mapped(blockno) {
        panic!("dirty_block: block {} not mapped", blockno);
    }
    let envid = crate::user::syscall::sys_getenvid();
    let rc = sys_mem_map(envid, va, envid, va, Perm::user_rw().bits());
    if rc < 0 {
        panic!("dirty_block: re-mapping block {} failed", blockno);
    }
}

/// Flushes a dirty block to disk and clears its dirty bit by remapping it
/// read-only again (same frame, new permission).
pub(crate) fn write_block(blockno: u32) {
    if !block_is_mapped(blockno) {
        panic!("write_block: block {} not mapped", blockno);
    }
    if !block_is_dirty(blockno) {
        return;
    }
    let va = disk_addr(blockno);
    let buf = unsafe { core::slice::from_raw_parts(va as *const u8, BLKSIZE) };
    ide_write_block(blockno, buf);

    let envid = crate::user::syscall::sys_getenvid();
    let rc = sys_mem_map(envid, va, envid, va, Perm::user_ro().bits());
    if rc < 0 {
        panic!("write_block: re-mapping block {} read-only failed", blockno);
    }
}

/// Evicts a block from the cache, flushing it first if dirty.
pub(crate) fn unmap_block(blockno: u32) {
    if !block_is_mapped(blockno) {
        return;
    }
    write_block(blockno);
    crate::user::syscall::sys_mem_unmap(0, disk_addr(blockno));
}

/// Flushes every dirty block currently resident in the cache's address
/// window.
pub(crate) fn flush_all(nblocks: u32) {
    for b in 0..nblocks {
        if block_is_mapped(b) {
            write_block(b);
        }
    }
}
