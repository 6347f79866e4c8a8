//! Stamps `arbor --version` with the commit and the day it was built.

use std::process::Command;

fn main() {
    // Tarball builds have no repository to watch.
    if std::path::Path::new("../../.git").exists() {
        println!("cargo::rerun-if-changed=../../.git/HEAD");
        println!("cargo::rerun-if-changed=../../.git/refs/heads/");
    }

    let commit = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let built = chrono::Utc::now().date_naive();

    println!("cargo:rustc-env=ARBOR_GIT_HASH={commit}");
    println!("cargo:rustc-env=ARBOR_BUILD_DATE={built}");
}
