//! Shared test-only helpers for `hub-cli`.

use std::sync::Mutex;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that mutate process environment variables, since
/// `std::env::set_var`/`remove_var` race across threads within one
/// `cargo test` binary.
pub fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}
