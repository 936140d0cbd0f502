use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let git_sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| "nogit".to_string());
    println!("cargo:rustc-env=COURIER_BUILD_ID={timestamp}-{git_sha}");
}
