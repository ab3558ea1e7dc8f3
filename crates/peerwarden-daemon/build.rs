use std::env;
use std::path::{Component, Path};
use std::process::Command;

fn git_version() -> String {
    Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `PROFILE` only reports `debug` or `release`, so custom profiles are
/// recognised from the target directory name instead.
fn is_distribute() -> bool {
    env::var("OUT_DIR").is_ok_and(|out| {
        Path::new(&out)
            .components()
            .any(|c| c == Component::Normal("distribute".as_ref()))
    })
}

fn main() {
    println!("cargo:rustc-env=GIT_VERSION={}", git_version());
    println!("cargo::rustc-check-cfg=cfg(distribute)");

    if is_distribute() {
        println!("cargo:rustc-cfg=distribute");
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
}
