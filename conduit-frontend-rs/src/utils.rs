pub fn set_panic_hook() {
    // When the `console_error_panic_hook` feature is enabled, we can call the
    // `set_panic_hook` function at least once during initialization, and then
    // we will get better error messages if our code ever panics.
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Client-side wall-clock milliseconds, the `createdAt`/`updatedAt` carried
/// inside actions. Ordering between clients still comes from the log's server
/// timestamps, never from these.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
