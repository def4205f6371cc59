#![no_std]
#![no_main]
#![feature(asm)]
#![feature(const_fn)]
#![feature(alloc_error_handler)]

extern crate alloc;

#[macro_use]
mod console;

mod allocator;
mod constants;
mod elf;
mod env;
mod gdt;
mod kbd;
mod kclock;
mod kernel_lock;
mod lapic;
mod mp;
mod mpconfig;
mod once;
mod picirq;
mod pmap;
mod rwlock;
mod sched;
mod serial;
mod spinlock;
mod syscall;
mod trap;
mod util;
mod vga_buffer;
mod volatile;
mod x86;

use constants::*;
use core::alloc::Layout;
use core::panic::PanicInfo;

#[global_allocator]
static ALLOCATOR: allocator::HeapAllocator = allocator::HeapAllocator;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    loop {
        unsafe { asm!("hlt" :::: "volatile") }
    }
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("allocation error: {:?}", layout);
}

static INIT_BINARY: &[u8] = include_bytes!(env!("INIT_IMAGE_PATH"));
static FS_SERVER_BINARY: &[u8] = include_bytes!(env!("FS_SERVER_IMAGE_PATH"));

/// Entry point reached from the boot trampoline once paging and the initial
/// GDT are live. Brings up the rest of the kernel one subsystem at a time,
/// in the same order xv6/JOS bring theirs up, then hands off to the first
/// user environment.
#[no_mangle]
pub extern "C" fn _start() -> ! {
    x86::cld();

    pmap::mem_init();
    unsafe {
        allocator::HeapAllocator::init(KHEAP_BASE as usize, KHEAP_SIZE);
    }

    unsafe {
        mpconfig::mp_init();
        lapic::lapic_init();
        picirq::pic_init();
        gdt::init_percpu();
        trap::trap_init();
    }

    println!("jos-rust: boot cpu {} up", mpconfig::this_cpu().cpu_id);

    let mut table = env::env_table();
    // The FS server must be the first environment allocated: clients address
    // it by the fixed id `constants::FS_ENV_ID`, which assumes slot 0.
    let fs_server_id = env::env_create_for_fs_server(&mut *table, FS_SERVER_BINARY.as_ptr());
    let init_id = env::env_create_for_init(&mut *table, INIT_BINARY.as_ptr());
    debug_assert_eq!(fs_server_id, env::EnvId(FS_ENV_ID));

    env::env_run(init_id, table);
}
