//! IPC key derivation.
//!
//! Every kernel object the crate touches is addressed by a 32-bit SysV key
//! hashed from the resource name. The semaphore-set cardinality is folded
//! into the hash input because `semget` refuses to return an existing set
//! when it is asked for a different number of semaphores; baking the count
//! into the key means a cardinality change yields a fresh key instead of a
//! runtime error. Auxiliary structures co-located with a resource (PID
//! state, sliding window) hash `name || suffix` so they can never collide
//! with the resource's own key.

use sha1::{Digest, Sha1};

use crate::semset::NUM_SEMS;

pub(crate) const PID_KEY_SUFFIX: &str = "_pid";
pub(crate) const SLIDING_WINDOW_KEY_SUFFIX: &str = "_sliding_window";

fn digest_key(input: &str) -> i32 {
    let digest = Sha1::digest(input.as_bytes());
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&digest[..4]);
    i32::from_ne_bytes(bytes)
}

/// Key of the resource's semaphore set (and of the simple-integer segment,
/// which lives in the disjoint `shmget` key namespace).
pub fn resource_key(name: &str) -> i32 {
    digest_key(&format!("{name}_NUM_SEMS_{NUM_SEMS}"))
}

/// Key of an auxiliary structure co-located with `name`.
pub fn aux_key(name: &str, suffix: &str) -> i32 {
    digest_key(&format!("{name}{suffix}"))
}

/// Render a key the way `ipcs` prints them: `0x` plus eight hex digits.
pub fn format_key(key: i32) -> String {
    format!("0x{:08x}", key as u32)
}
