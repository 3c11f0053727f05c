//! Ticket-count reconciliation.
//!
//! Translates the registered worker count and the configured capacity into
//! an actual ticket inventory. The TICKETS delta and the CONFIGURED_TICKETS
//! update happen under META_LOCK, so reconfigurations are totally ordered
//! with respect to each other. Acquirers are deliberately not excluded:
//! they may observe the delta landing on TICKETS, but never an out-of-range
//! value, because a negative delta blocks until enough tickets are free and
//! a positive delta only adds capacity that CONFIGURED_TICKETS is about to
//! advertise.

use crate::error::{Error, Result};
use crate::resource::Capacity;
use crate::semset::{INTERNAL_TIMEOUT, SemIndex, SemaphoreSet};

/// Reconcile the set's ticket inventory with `capacity`, taking META_LOCK.
pub(crate) fn configure(set: &SemaphoreSet, name: &str, capacity: &Capacity) -> Result<()> {
    let _guard = set.meta_lock()?;

    let desired = match capacity {
        Capacity::Fixed(tickets) => *tickets as i32,
        Capacity::Quota(quota) => {
            let workers = set.get(SemIndex::RegisteredWorkers)?;
            (workers as f64 * quota).ceil() as i32
        }
    };

    let configured = set.get(SemIndex::ConfiguredTickets)?;
    if configured == 0 && desired == 0 {
        return Err(Error::bad_config(format!(
            "resource '{name}' would be configured with zero tickets"
        )));
    }
    // Zero desired tickets on an already-configured set is the late-join
    // path: attach without resizing.
    if desired == 0 || desired == configured {
        return Ok(());
    }

    let delta = desired - configured;
    set.op(SemIndex::Tickets, delta as i16, 0, Some(INTERNAL_TIMEOUT))
        .map_err(|err| {
            if err.is_errno(libc::EAGAIN) {
                // Shrinking blocks until enough tickets come home; if the
                // holders outlast the internal timeout, the configuration
                // is left untouched.
                Error::Timeout { name: name.to_owned() }
            } else if err.is_errno(libc::EIDRM) {
                Error::SemaphoreMissing { name: name.to_owned() }
            } else {
                err
            }
        })?;
    set.set(SemIndex::ConfiguredTickets, desired)?;
    Ok(())
}
