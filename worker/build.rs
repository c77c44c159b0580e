use std::{env, fs, path::Path};

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let workspace_toml = Path::new(&manifest_dir).join("../Cargo.toml");
    let cargo_toml = fs::read_to_string(&workspace_toml).expect("Unable to read workspace Cargo.toml");
    let version = cargo_toml
        .lines()
        .find(|line| line.starts_with("version = "))
        .and_then(|line| line.split('=').nth(1))
        .map(|v| v.trim_matches(&[' ', '"']).to_string())
        .unwrap_or_else(|| env::var("CARGO_PKG_VERSION").unwrap_or_default());

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let version_file_path = Path::new(&out_dir).join("version.rs");
    let contents = format!(
        "pub const VERSION: &str = \"{version}\";\npub const USER_AGENT: &str = \"gpu-worker/{version}\";\n"
    );
    fs::write(&version_file_path, contents).expect("Unable to write version file");

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../Cargo.toml");
}
