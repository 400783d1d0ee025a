use std::{env, fs, path::Path};

fn main() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set");
    let manifest_path = Path::new(&manifest_dir).join("Cargo.toml");
    println!("cargo:rerun-if-changed={}", manifest_path.display());

    let raw = fs::read_to_string(&manifest_path)
        .unwrap_or_else(|e| panic!("Failed to read Cargo.toml: {e}"));
    let manifest: toml::Table =
        toml::from_str(&raw).unwrap_or_else(|e| panic!("Failed to parse Cargo.toml: {e}"));

    let field = |key: &str, fallback: &str| -> String {
        manifest
            .get("package")
            .and_then(|p| p.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or(fallback)
            .to_string()
    };

    let generated = format!(
        "pub const PKG_NAME: &str = \"{}\";\npub const PKG_VERSION: &str = \"{}\";\npub const PKG_DESCRIPTION: &str = \"{}\";\n",
        field("name", "elevate-sync"),
        field("version", "0.0.0"),
        field("description", "")
    );

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    fs::write(Path::new(&out_dir).join("pkg_info.rs"), generated)
        .expect("Failed to write pkg_info.rs");
}
