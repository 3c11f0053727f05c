use std::sync::atomic::{AtomicU32, Ordering};

/// Resource names must be unique per test so the kernel IPC objects from
/// concurrent or crashed test runs never collide.
pub fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "semian-it-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
