fn main() {
    // Only the freestanding image is linked with the kernel script
    if std::env::var_os("CARGO_FEATURE_BARE_METAL").is_some() {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into());
        println!("cargo:rustc-link-arg-bins=-T{}/kernel.ld", manifest_dir);
    }

    println!("cargo:rerun-if-changed=kernel.ld");
}
