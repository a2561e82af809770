use std::process::Command;

fn main() {
    let version = Command::new("git")
        .args(["describe", "--always", "--tags", "--dirty"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or("(unknown)".to_string());

    println!("cargo:rustc-env=VERSION={version}");
    println!("cargo:rerun-if-changed=.git/HEAD");
}
