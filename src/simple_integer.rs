//! A host-wide 64-bit counter.
//!
//! The value lives in a SysV shared-memory segment keyed by the resource
//! name; mutations take the resource's META_LOCK so they serialize with
//! reconfiguration and with every other process on the host. Every mutation
//! returns the post-mutation value read under the same lock, so callers get
//! a consistent pre/post pair.

use crate::error::Result;
use crate::key::resource_key;
use crate::semset::{SemaphoreSet, attach_resource_set};
use crate::shm::Segment;

#[repr(C)]
struct SharedValue {
    value: i64,
}

pub struct SimpleInteger {
    sem: SemaphoreSet,
    segment: Segment<SharedValue>,
    name: String,
}

impl SimpleInteger {
    /// Create or attach the counter for `name`. The first creator finds the
    /// segment zeroed; later openers see whatever the counter holds.
    pub fn new(name: &str, permissions: u32) -> Result<SimpleInteger> {
        let sem = attach_resource_set(name, permissions)?;
        // The sem and shm key namespaces are disjoint, so the segment can
        // reuse the resource key directly.
        let (segment, _created) = Segment::create_or_attach(resource_key(name), permissions)?;
        Ok(SimpleInteger {
            sem,
            segment,
            name: name.to_owned(),
        })
    }

    pub fn value(&self) -> Result<i64> {
        let _guard = self.sem.meta_lock()?;
        Ok(unsafe { (*self.segment.as_ptr()).value })
    }

    pub fn set_value(&self, value: i64) -> Result<i64> {
        let _guard = self.sem.meta_lock()?;
        unsafe {
            (*self.segment.as_ptr()).value = value;
            Ok((*self.segment.as_ptr()).value)
        }
    }

    /// Add `by` and return the new value.
    pub fn increment(&self, by: i64) -> Result<i64> {
        let _guard = self.sem.meta_lock()?;
        unsafe {
            let shared = self.segment.as_ptr();
            (*shared).value += by;
            Ok((*shared).value)
        }
    }

    pub fn reset(&self) -> Result<i64> {
        self.set_value(0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the backing segment for deletion. Live attachments (including
    /// other processes') keep working until they detach.
    pub fn destroy(self) -> Result<()> {
        self.segment.mark_removed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "simple-int-test-{tag}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn cleanup(counter: SimpleInteger) {
        counter.sem.remove().unwrap();
        counter.destroy().unwrap();
    }

    #[test]
    fn starts_at_zero_and_counts() {
        let name = unique_name("count");
        let counter = SimpleInteger::new(&name, 0o660).unwrap();
        assert_eq!(counter.value().unwrap(), 0);
        assert_eq!(counter.increment(1).unwrap(), 1);
        assert_eq!(counter.increment(5).unwrap(), 6);
        assert_eq!(counter.increment(-2).unwrap(), 4);
        cleanup(counter);
    }

    #[test]
    fn set_and_reset_return_the_stored_value() {
        let name = unique_name("set");
        let counter = SimpleInteger::new(&name, 0o660).unwrap();
        assert_eq!(counter.set_value(41).unwrap(), 41);
        assert_eq!(counter.value().unwrap(), 41);
        assert_eq!(counter.reset().unwrap(), 0);
        assert_eq!(counter.value().unwrap(), 0);
        cleanup(counter);
    }

    #[test]
    fn two_handles_share_one_value() {
        let name = unique_name("shared");
        let a = SimpleInteger::new(&name, 0o660).unwrap();
        let b = SimpleInteger::new(&name, 0o660).unwrap();
        a.increment(7).unwrap();
        assert_eq!(b.value().unwrap(), 7);
        b.increment(3).unwrap();
        assert_eq!(a.value().unwrap(), 10);
        drop(b);
        cleanup(a);
    }

    #[test]
    fn survives_in_shared_memory_across_handle_drops() {
        let name = unique_name("persist");
        {
            let counter = SimpleInteger::new(&name, 0o660).unwrap();
            counter.set_value(99).unwrap();
            // Dropping only detaches.
        }
        let counter = SimpleInteger::new(&name, 0o660).unwrap();
        assert_eq!(counter.value().unwrap(), 99);
        cleanup(counter);
    }
}
