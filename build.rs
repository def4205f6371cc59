use std::env;

fn main() {
    // The C/asm boot trampoline (entry.S, vectors.S, alltraps.S, mpentry.S,
    // entrypgdir.c, kbdmap.c) and the user-space init/fs_server images are
    // produced by the project Makefile before `cargo build` runs; we only
    // need to tell the kernel binary where that step left them.
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    let init = env::var("INIT_IMAGE")
        .unwrap_or_else(|_| format!("{}/obj/user/init", manifest_dir));
    let fs_server = env::var("FS_SERVER_IMAGE")
        .unwrap_or_else(|_| format!("{}/obj/user/fs_server", manifest_dir));

    println!("cargo:rustc-env=INIT_IMAGE_PATH={}", init);
    println!("cargo:rustc-env=FS_SERVER_IMAGE_PATH={}", fs_server);
    println!("cargo:rerun-if-env-changed=INIT_IMAGE");
    println!("cargo:rerun-if-env-changed=FS_SERVER_IMAGE");
}
