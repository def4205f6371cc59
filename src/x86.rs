#[inline]
pub(crate) fn inb(port: u16) -> u8 {
    unsafe {
        let value: u8;
        asm!("inb $1, $0" : "={al}"(value) :"N{dx}"(port) :: "volatile");
        value
    }
}

#[inline]
pub(crate) fn outb(port: u16, value: u8) {
    unsafe {
        asm!("outb $1, $0" :: "N{dx}"(port), "{al}"(value) :: "volatile");
    }
}

use crate::gdt::DescriptorTablePointer;
use crate::pmap::{PhysAddr, VirtAddr};

#[inline]
pub(crate) fn cld() {
    unsafe {
        asm!("cld" ::: "memory" : "volatile");
    }
}

#[inline]
pub(crate) fn read_eflags() -> u32 {
    let flags: u32;
    unsafe {
        asm!("pushfl; popl $0" : "=r"(flags) :: "memory" : "volatile");
    }
    flags
}

#[inline]
pub(crate) fn invlpg(va: VirtAddr) {
    unsafe {
        asm!("invlpg ($0)" :: "r"(va.0) : "memory" : "volatile");
    }
}

#[inline]
pub(crate) fn ltr(sel: u16) {
    unsafe {
        asm!("ltr $0" :: "r"(sel) :: "volatile");
    }
}

#[inline]
pub(crate) fn lidt(dtp: &DescriptorTablePointer) {
    unsafe {
        asm!("lidt ($0)" :: "r"(dtp) : "memory" : "volatile");
    }
}

#[inline]
pub(crate) fn lgdt(dtp: &DescriptorTablePointer) {
    unsafe {
        asm!("lgdt ($0)" :: "r"(dtp) : "memory" : "volatile");
    }
}

#[inline]
pub(crate) fn lldt(dtp: &DescriptorTablePointer) {
    unsafe {
        asm!("lldt ($0)" :: "r"(dtp) : "memory" : "volatile");
    }
}

#[inline]
pub(crate) fn rcr0() -> u32 {
    let val: u32;
    unsafe {
        asm!("movl %cr0, $0" : "=r"(val) ::: "volatile");
    }
    val
}

#[inline]
pub(crate) fn lcr0(val: u32) {
    unsafe {
        asm!("movl $0, %cr0" :: "r"(val) : "memory" : "volatile");
    }
}

#[inline]
pub(crate) fn rcr2() -> VirtAddr {
    let val: u32;
    unsafe {
        asm!("movl %cr2, $0" : "=r"(val) ::: "volatile");
    }
    VirtAddr(val)
}

#[inline]
pub(crate) fn rcr3() -> PhysAddr {
    let val: u32;
    unsafe {
        asm!("movl %cr3, $0" : "=r"(val) ::: "volatile");
    }
    PhysAddr(val)
}

#[inline]
pub(crate) fn lcr3(pa: PhysAddr) {
    unsafe {
        asm!("movl $0, %cr3" :: "r"(pa.0) : "memory" : "volatile");
    }
}
