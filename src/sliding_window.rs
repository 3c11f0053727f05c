//! A fixed-capacity ring buffer of observations in shared memory.
//!
//! The buffer always occupies [`MAX_CAPACITY`] slots but is interpreted
//! modulo its live `max_size`, which may be resized at runtime without
//! losing data. Logical index `i` maps to `data[(start + i) % max_size]`.
//! Every operation takes the owning resource's META_LOCK so window
//! mutations serialize with bulkhead reconfiguration.
//!
//! `MAX_CAPACITY` is part of the segment layout and must match across all
//! co-located processes.

use log::debug;

use crate::error::{Error, Result};
use crate::key::{SLIDING_WINDOW_KEY_SUFFIX, aux_key};
use crate::semset::{SemIndex, SemaphoreSet, attach_resource_set};
use crate::shm::Segment;

/// Upper bound on `max_size`. Baked into the shared layout (ABI).
pub const MAX_CAPACITY: usize = 4096;

#[repr(C)]
struct WindowState {
    max_size: libc::c_int,
    length: libc::c_int,
    start: libc::c_int,
    data: [i64; MAX_CAPACITY],
}

pub struct SlidingWindow {
    sem: SemaphoreSet,
    segment: Segment<WindowState>,
    name: String,
}

impl SlidingWindow {
    /// Create or attach the window for `name` with capacity `max_size`.
    ///
    /// With a `scale_factor`, the capacity is multiplied by
    /// `max(1, ceil(registered_workers × scale_factor))` and capped at
    /// [`MAX_CAPACITY`]; the window only ever grows from this, so the
    /// configured `max_size` is its floor. The scale keeps a host-wide
    /// window proportional to the number of workers feeding it.
    pub fn new(
        name: &str,
        max_size: usize,
        scale_factor: Option<f64>,
        permissions: u32,
    ) -> Result<SlidingWindow> {
        if max_size == 0 || max_size > MAX_CAPACITY {
            return Err(Error::bad_config(format!(
                "window max_size must be in 1..={MAX_CAPACITY}"
            )));
        }

        let sem = attach_resource_set(name, permissions)?;
        let (segment, _created) =
            Segment::create_or_attach(aux_key(name, SLIDING_WINDOW_KEY_SUFFIX), permissions)?;

        let window = SlidingWindow {
            sem,
            segment,
            name: name.to_owned(),
        };

        {
            let _guard = window.sem.meta_lock()?;
            let state = unsafe { &mut *window.segment.as_ptr() };
            // A freshly created segment is zeroed; whichever attacher gets
            // the lock first gives it its initial shape.
            if state.max_size == 0 {
                state.max_size = max_size as libc::c_int;
            }
            if let Some(factor) = scale_factor {
                let workers = window.sem.get(SemIndex::RegisteredWorkers)?;
                let multiplier = (workers as f64 * factor).ceil().max(1.0) as i64;
                let target =
                    (max_size as i64 * multiplier).min(MAX_CAPACITY as i64) as libc::c_int;
                if target > state.max_size {
                    debug!(
                        "scaling window '{name}' from {} to {target} for {workers} workers",
                        state.max_size
                    );
                    resize(state, target);
                }
            }
        }

        Ok(window)
    }

    /// Number of live values.
    pub fn size(&self) -> Result<usize> {
        let _guard = self.sem.meta_lock()?;
        Ok(unsafe { (*self.segment.as_ptr()).length } as usize)
    }

    pub fn max_size(&self) -> Result<usize> {
        let _guard = self.sem.meta_lock()?;
        Ok(unsafe { (*self.segment.as_ptr()).max_size } as usize)
    }

    /// Append a value, evicting the oldest when the window is full.
    pub fn push(&self, value: i64) -> Result<()> {
        let _guard = self.sem.meta_lock()?;
        let state = unsafe { &mut *self.segment.as_ptr() };
        push_value(state, value);
        Ok(())
    }

    /// All live values, oldest first.
    pub fn values(&self) -> Result<Vec<i64>> {
        let _guard = self.sem.meta_lock()?;
        let state = unsafe { &*self.segment.as_ptr() };
        Ok((0..state.length).map(|i| value_at(state, i)).collect())
    }

    pub fn first(&self) -> Result<Option<i64>> {
        let _guard = self.sem.meta_lock()?;
        let state = unsafe { &*self.segment.as_ptr() };
        Ok((state.length > 0).then(|| value_at(state, 0)))
    }

    pub fn last(&self) -> Result<Option<i64>> {
        let _guard = self.sem.meta_lock()?;
        let state = unsafe { &*self.segment.as_ptr() };
        Ok((state.length > 0).then(|| value_at(state, state.length - 1)))
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self.sem.meta_lock()?;
        let state = unsafe { &mut *self.segment.as_ptr() };
        state.length = 0;
        state.start = 0;
        Ok(())
    }

    /// Remove every value for which `pred` returns true, preserving the
    /// order of survivors. Values are offered newest first; each is visited
    /// exactly once. The predicate runs with the META_LOCK held, so it must
    /// not call back into this resource. Returns how many were removed.
    pub fn reject(&self, pred: impl FnMut(i64) -> bool) -> Result<usize> {
        let _guard = self.sem.meta_lock()?;
        let state = unsafe { &mut *self.segment.as_ptr() };
        Ok(reject_in_place(state, pred))
    }

    /// Change the live capacity, preserving data: growth keeps everything,
    /// shrinking keeps the most recent `new_max` values.
    pub fn resize_to(&self, new_max: usize) -> Result<()> {
        if new_max == 0 || new_max > MAX_CAPACITY {
            return Err(Error::bad_config(format!(
                "window max_size must be in 1..={MAX_CAPACITY}"
            )));
        }
        let _guard = self.sem.meta_lock()?;
        let state = unsafe { &mut *self.segment.as_ptr() };
        resize(state, new_max as libc::c_int);
        Ok(())
    }

    pub fn set_max_size(&self, new_max: usize) -> Result<()> {
        self.resize_to(new_max)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mark the backing segment for deletion; attached processes keep their
    /// mapping until they detach.
    pub fn destroy(self) -> Result<()> {
        self.segment.mark_removed()
    }
}

fn value_at(state: &WindowState, logical: libc::c_int) -> i64 {
    state.data[((state.start + logical) % state.max_size) as usize]
}

fn push_value(state: &mut WindowState, value: i64) {
    if state.length == state.max_size {
        state.start = (state.start + 1) % state.max_size;
    } else {
        state.length += 1;
    }
    let index = (state.start + state.length - 1) % state.max_size;
    state.data[index as usize] = value;
}

fn reject_in_place(state: &mut WindowState, mut pred: impl FnMut(i64) -> bool) -> usize {
    let length = state.length;
    // Walk newest to oldest, compacting survivors toward the back of the
    // window. The write cursor can never pass the read cursor, so every
    // element is read before it could be overwritten.
    let mut write = length;
    for i in (0..length).rev() {
        let value = value_at(state, i);
        if !pred(value) {
            write -= 1;
            let index = ((state.start + write) % state.max_size) as usize;
            state.data[index] = value;
        }
    }
    let removed = write;
    state.start = (state.start + removed) % state.max_size;
    state.length = length - removed;
    removed as usize
}

fn resize(state: &mut WindowState, new_max: libc::c_int) {
    let old_max = state.max_size;
    if new_max == old_max {
        return;
    }

    if new_max > old_max {
        if state.start + state.length > old_max {
            // The window wraps. Slide the tail block [start, old_max) up by
            // the added capacity so that, with start advanced by the same
            // offset, logical indices land where they used to.
            let offset = (new_max - old_max) as usize;
            let start = state.start as usize;
            let count = old_max as usize - start;
            state.data.copy_within(start..start + count, start + offset);
            state.start += offset as libc::c_int;
        }
        state.max_size = new_max;
        return;
    }

    // Shrink: keep the most recent values.
    let new_length = state.length.min(new_max);
    let dropped = state.length - new_length;
    state.start = (state.start + dropped) % old_max;
    state.length = new_length;

    if new_length == 0 {
        state.start = 0;
    } else if state.start + new_length <= old_max {
        // Contiguous run; slide it down to the buffer base.
        let start = state.start as usize;
        state
            .data
            .copy_within(start..start + new_length as usize, 0);
        state.start = 0;
    } else {
        // Wrapped run: rotate the old ring in place so the retained window
        // becomes contiguous at the base. O(n), no auxiliary buffer.
        state.data[..old_max as usize].rotate_left(state.start as usize);
        state.start = 0;
    }
    state.max_size = new_max;
}
