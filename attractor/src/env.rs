//! Base environment construction for node subprocesses.
//!
//! Executors may remap `HOME` for isolated CLI runs. Toolchain paths that
//! default relative to `$HOME` must therefore be pinned to absolute values
//! *before* any override, or child processes lose their caches.

use std::path::{Path, PathBuf};

/// Variables that leak host-session noise into child processes.
const STRIPPED_VARS: &[&str] = &["CLAUDECODE"];

/// Build the environment for a node subprocess from the current process
/// environment: strips noise variables, pins toolchain paths rooted at
/// `$HOME`, and defaults `CARGO_TARGET_DIR` into the worktree unless the
/// caller set it explicitly.
pub fn build_base_node_env(worktree: &Path) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars()
        .filter(|(k, _)| !STRIPPED_VARS.contains(&k.as_str()))
        .collect();

    let home = lookup(&env, "HOME").map(PathBuf::from);
    if let Some(home) = home {
        materialize(&mut env, "CARGO_HOME", home.join(".cargo"));
        materialize(&mut env, "RUSTUP_HOME", home.join(".rustup"));
        let gopath = lookup(&env, "GOPATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("go"));
        materialize(&mut env, "GOPATH", gopath.clone());
        materialize(&mut env, "GOMODCACHE", gopath.join("pkg").join("mod"));
    }

    materialize(&mut env, "CARGO_TARGET_DIR", worktree.join(".cargo-target"));
    env
}

fn lookup(env: &[(String, String)], key: &str) -> Option<String> {
    env.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .filter(|v| !v.trim().is_empty())
}

/// Set `key` to `value` only when it is absent or empty.
fn materialize(env: &mut Vec<(String, String)>, key: &str, value: PathBuf) {
    if lookup(env, key).is_some() {
        return;
    }
    env.retain(|(k, _)| k != key);
    env.push((key.to_string(), value.to_string_lossy().into_owned()));
}
