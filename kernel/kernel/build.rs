use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("No out dir"));
    let target = env::var("TARGET").expect("No target");
    println!("cargo:rerun-if-changed=build.rs");

    // host builds only produce the library and its tests
    if !target.starts_with("riscv64") {
        return;
    }

    // Put the linker scripts somewhere the linker can find it
    let link_dir = PathBuf::from("src/arch/link");
    println!("cargo:rustc-link-search={}", out_dir.display());
    for entry in fs::read_dir(link_dir).unwrap() {
        let entry = entry.unwrap();
        println!("cargo:rerun-if-changed={}", entry.path().display());
        fs::copy(entry.path(), out_dir.join(entry.file_name())).unwrap();
    }

    // set "-C link-arg=-Tlink.ldS" argument when linking to use the custom linker script
    println!("cargo:rustc-link-arg-bins=-Tlink.ldS");
}
