// First user environment (SPEC_FULL.md 4.5/4.9/4.10): a small smoke test
// for the primitives this crate exists to teach. Forks a child that
// writes through the FS server while the parent reads the result back,
// then exercises a pipe between two more children. Loaded by the kernel
// right after the FS server (see `main.rs`).

#![no_std]
#![no_main]
#![feature(asm)]

#[path = "../constants.rs"]
mod constants;
#[path = "../fsipc.rs"]
mod fsipc;
#[path = "../user/mod.rs"]
mod user;

use core::panic::PanicInfo;
use crate::println;
use user::fd;
use user::fork::fork;
use user::{file, pipe};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("init panic: {}", info);
    loop {
        unsafe { asm!("hlt" :::: "volatile") }
    }
}

const GREETING_PATH: &str = "/greeting";

fn child_writes_greeting() -> ! {
    let fdnum = file::open(GREETING_PATH, fsipc::O_WRONLY | fsipc::O_CREATE)
        .expect("child: open for write failed");
    fd::write(fdnum, b"hello from the child environment\n").expect("child: write failed");
    fd::close(fdnum).expect("child: close failed");
    user::syscall::sys_env_destroy(user::syscall::sys_getenvid());
    loop {
        unsafe { asm!("hlt" :::: "volatile") }
    }
}

fn parent_reads_greeting() {
    // No `wait`/`waitpid` syscall exists in this design (SPEC_FULL.md 4.2);
    // yielding a few times is enough for the round-robin scheduler to run
    // the child to completion before we try to read what it wrote.
    for _ in 0..16 {
        user::syscall::sys_yield();
    }

    let fdnum = file::open(GREETING_PATH, fsipc::O_RDONLY).expect("parent: open for read failed");
    let mut buf = [0u8; 128];
    let n = fd::read(fdnum, &mut buf).expect("parent: read failed");
    fd::close(fdnum).expect("parent: close failed");
    println!(
        "init: read back {:?}",
        core::str::from_utf8(&buf[..n as usize]).unwrap_or("<invalid utf8>")
    );
}

fn exercise_pipe() {
    let (rfd, wfd) = pipe::pipe().expect("pipe creation failed");
    match fork() {
        Ok(0) => {
            pipe::write(wfd, b"ping").expect("pipe write failed");
            pipe::close(wfd);
            user::syscall::sys_env_destroy(user::syscall::sys_getenvid());
            loop {
                unsafe { asm!("hlt" :::: "volatile") }
            }
        }
        Ok(_child) => {
            let mut buf = [0u8; 4];
            let n = pipe::read(rfd, &mut buf).expect("pipe read failed");
            pipe::close(rfd);
            println!(
                "init: pipe carried {:?}",
                core::str::from_utf8(&buf[..n as usize]).unwrap_or("<invalid utf8>")
            );
        }
        Err(e) => panic!("fork failed: {}", e),
    }
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    println!("init: starting");

    match fork() {
        Ok(0) => child_writes_greeting(),
        Ok(_child) => parent_reads_greeting(),
        Err(e) => panic!("fork failed: {}", e),
    }

    exercise_pipe();

    println!("init: done");
    loop {
        unsafe { asm!("hlt" :::: "volatile") }
    }
}
