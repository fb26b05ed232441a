fn main() {
    println!("cargo::rerun-if-env-changed=CARGO_FEATURE_CUDA");

    if std::env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    let root = ".cuda";
    let lib = ".cuda/lib";

    println!("cargo::rustc-link-search=native={lib}");
    println!("cargo::rustc-env=CUDA_PATH={root}");
    println!("cargo::rustc-env=LD_LIBRARY_PATH={lib}");
}
