use std::env;
use std::process::Command;

fn main() {
    let git_hash = get_git_hash();
    println!("cargo:rustc-env=GIT_HASH={}", git_hash);

    let build_date = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    println!("cargo:rustc-env=BUILD_DATE={}", build_date);

    // Set version - use VERSION_DATE environment variable (falls back to the
    // package version so local builds outside CI still link) with git hash.
    let base_version =
        env::var("VERSION_DATE").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

    let version = if git_hash != "unknown" && !git_hash.is_empty() {
        format!("{}+{}", base_version, git_hash)
    } else {
        format!("{}+unknown", base_version)
    };

    println!("cargo:rustc-env=MOBILESHELL_VERSION={}", version);
}

fn get_git_hash() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .unwrap_or_else(|| "unknown".to_string())
        .trim()
        .to_string()
}
