//! Process environment scrub.
//!
//! Renderers inherit nothing from the shell that started the proxy. Child
//! commands are additionally spawned with `env_clear`.

use std::ffi::OsString;

/// Remove every variable from this process's environment.
///
/// Must run before the runtime starts any worker threads.
pub fn clear_environment() -> usize {
    let keys: Vec<OsString> = std::env::vars_os().map(|(key, _)| key).collect();
    let removed = keys.len();
    for key in keys {
        std::env::remove_var(key);
    }
    removed
}
