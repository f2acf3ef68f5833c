//! Build script for deckhand
//! Stamps the commit and build time reported by `--version` and `GET /version`

use chrono::Utc;
use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    // A release build from a tarball has no repository
    let commit = std::env::var("DECKHAND_GIT_HASH")
        .ok()
        .or_else(|| git(&["rev-parse", "--short", "HEAD"]))
        .unwrap_or_else(|| "unknown".to_string());

    let build_time = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    println!("cargo:rustc-env=DECKHAND_GIT_HASH={}", commit);
    println!("cargo:rustc-env=DECKHAND_BUILD_TIME={}", build_time);

    println!("cargo:rerun-if-env-changed=DECKHAND_GIT_HASH");
    println!("cargo:rerun-if-changed=../.git/HEAD");
}
