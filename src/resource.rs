//! The bulkhead: a named, host-wide pool of tickets.
//!
//! A [`Resource`] wraps the SysV semaphore set shared by every process on
//! the host that registered the same name. Acquiring decrements TICKETS
//! with `SEM_UNDO` and hands back a [`TicketGuard`] whose drop returns the
//! ticket; a crashed holder's tickets come back via the kernel's undo
//! bookkeeping instead.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::warn;

use crate::error::{Error, Result};
use crate::key::{format_key, resource_key};
use crate::semset::{
    INTERNAL_TIMEOUT, MAX_TICKETS, SemIndex, SemaphoreSet, attach_resource_set,
};
use crate::tickets;

/// How a resource's capacity is sized.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Capacity {
    /// A fixed ticket count. `Fixed(0)` is the late-join form: attach to an
    /// already-configured resource without resizing it.
    Fixed(u32),
    /// A fraction in (0, 1] of the registered worker count, rounded up.
    Quota(f64),
}

/// Replacement acquire timeout used while a freshly created quota resource
/// is still collecting worker registrations. Without it, the first workers
/// to boot see a tiny ticket count and time out spuriously.
#[derive(Clone, Copy, Debug)]
pub struct QuotaGrace {
    /// How long after set creation the substitution applies.
    pub period: Duration,
    /// The timeout used for acquires inside the grace period.
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct Resource {
    sem: SemaphoreSet,
    name: String,
    quota: Option<f64>,
    default_timeout: Duration,
    quota_grace: Option<QuotaGrace>,
}

impl Resource {
    /// Register this process against the resource `name`.
    ///
    /// Creates the semaphore set if it does not exist (resolving the
    /// creator/waiter race), increments REGISTERED_WORKERS with `SEM_UNDO`,
    /// and reconciles the ticket inventory under META_LOCK. Call this once
    /// per process per resource; each call registers one more worker.
    pub fn register(
        name: &str,
        capacity: Capacity,
        permissions: u32,
        default_timeout: Duration,
    ) -> Result<Resource> {
        check_capacity(&capacity)?;

        let sem = match capacity {
            // Late join never creates: the resource must already exist.
            Capacity::Fixed(0) => {
                let sem = SemaphoreSet::open(resource_key(name)).map_err(|err| {
                    if err.is_errno(libc::ENOENT) {
                        Error::SemaphoreMissing { name: name.to_owned() }
                    } else {
                        err
                    }
                })?;
                sem.wait_for_initialization()?;
                sem.set_permissions(permissions)?;
                sem
            }
            _ => attach_resource_set(name, permissions)?,
        };

        // One worker per process per resource. The kernel undoes this when
        // the process exits, so a crash never strands a registration.
        sem.op(SemIndex::RegisteredWorkers, 1, libc::SEM_UNDO as i16, None)
            .map_err(|err| map_shared_errno(err, name))?;

        tickets::configure(&sem, name, &capacity)?;

        Ok(Resource {
            sem,
            name: name.to_owned(),
            quota: match capacity {
                Capacity::Quota(quota) => Some(quota),
                Capacity::Fixed(_) => None,
            },
            default_timeout,
            quota_grace: None,
        })
    }

    /// Open an existing resource for observation only: no worker is
    /// registered and the ticket inventory is left untouched. Meant for
    /// operator tooling; `acquire` still works through such a handle.
    pub fn attach(name: &str) -> Result<Resource> {
        let sem = SemaphoreSet::open(resource_key(name)).map_err(|err| {
            if err.is_errno(libc::ENOENT) {
                Error::SemaphoreMissing { name: name.to_owned() }
            } else {
                err
            }
        })?;
        Ok(Resource {
            sem,
            name: name.to_owned(),
            quota: None,
            default_timeout: Duration::from_secs(0),
            quota_grace: None,
        })
    }

    /// Configure the quota grace window on this handle.
    pub fn with_quota_grace(mut self, grace: QuotaGrace) -> Resource {
        self.quota_grace = Some(grace);
        self
    }

    /// Acquire a ticket, blocking up to `timeout` (or the registration
    /// default). Returns a guard that gives the ticket back on drop and
    /// exposes how long the acquire waited.
    ///
    /// The wait runs a plain blocking `semtimedop` on the calling thread;
    /// sibling threads are unaffected.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<TicketGuard<'_>> {
        // Quota resources track the live worker count, so capacity is
        // brought up to date before every acquire. Late registrants grow
        // the pool without an explicit reconfigure call.
        if let Some(quota) = self.quota {
            tickets::configure(&self.sem, &self.name, &Capacity::Quota(quota))?;
        }

        let mut timeout = timeout.unwrap_or(self.default_timeout);
        if self.quota.is_some() {
            if let Some(grace) = self.quota_grace {
                if self.within_grace_period(&grace)? {
                    timeout = grace.timeout;
                }
            }
        }

        let begin = Instant::now();
        self.sem
            .op(
                SemIndex::Tickets,
                -1,
                libc::SEM_UNDO as i16,
                Some(timeout),
            )
            .map_err(|err| map_shared_errno(err, &self.name))?;

        Ok(TicketGuard {
            resource: self,
            wait_time: begin.elapsed(),
            released: false,
        })
    }

    fn within_grace_period(&self, grace: &QuotaGrace) -> Result<bool> {
        let ds = self.sem.stat().map_err(|err| map_shared_errno(err, &self.name))?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        // sem_ctime is the wall-clock time of the last IPC_SET/creation.
        Ok(now.saturating_sub(ds.sem_ctime as i64) < grace.period.as_secs() as i64)
    }

    fn release_ticket(&self) -> Result<()> {
        self.sem
            .op(SemIndex::Tickets, 1, libc::SEM_UNDO as i16, None)
            .map_err(|err| map_shared_errno(err, &self.name))
    }

    /// Deregister this process's worker. The decrement carries `SEM_UNDO`
    /// so it cancels the registration's undo entry rather than stacking a
    /// second exit-time adjustment. Dropping below zero means someone
    /// already unregistered (or undo fired); that is not an error.
    pub fn unregister_worker(&self) -> Result<()> {
        let _guard = self.sem.meta_lock()?;
        match self.sem.op(
            SemIndex::RegisteredWorkers,
            -1,
            (libc::SEM_UNDO | libc::IPC_NOWAIT) as i16,
            None,
        ) {
            Err(err) if err.is_errno(libc::EAGAIN) => Ok(()),
            other => other.map_err(|err| map_shared_errno(err, &self.name)),
        }
    }

    /// Force REGISTERED_WORKERS to zero. `SETVAL` also purges every
    /// process's SEM_UNDO adjustment for the semaphore, so exiting workers
    /// will not drive the count negative afterwards. Operator recovery
    /// only; normal code paths never need this.
    pub fn reset_registered_workers(&self) -> Result<()> {
        self.sem
            .set(SemIndex::RegisteredWorkers, 0)
            .map_err(|err| map_shared_errno(err, &self.name))
    }

    /// Remove the semaphore set. Takes META_LOCK (without undo) first so an
    /// in-flight reconfiguration finishes before the set disappears; a set
    /// that is already gone counts as destroyed.
    pub fn destroy(self) -> Result<()> {
        match self
            .sem
            .op(SemIndex::MetaLock, -1, 0, Some(INTERNAL_TIMEOUT))
        {
            Ok(()) => {}
            Err(err) if err.is_errno(libc::EINVAL) || err.is_errno(libc::EIDRM) => {
                return Ok(());
            }
            Err(err) => {
                // A wedged lock holder should not make the set immortal.
                warn!(
                    "destroying '{}' without META_LOCK: {err}",
                    self.name
                );
            }
        }
        self.sem.remove()
    }

    /// Live ticket inventory (tickets currently available).
    pub fn count(&self) -> Result<i32> {
        self.sem
            .get(SemIndex::Tickets)
            .map_err(|err| map_shared_errno(err, &self.name))
    }

    /// Configured maximum ticket count.
    pub fn tickets(&self) -> Result<i32> {
        self.sem
            .get(SemIndex::ConfiguredTickets)
            .map_err(|err| map_shared_errno(err, &self.name))
    }

    pub fn registered_workers(&self) -> Result<i32> {
        self.sem
            .get(SemIndex::RegisteredWorkers)
            .map_err(|err| map_shared_errno(err, &self.name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The derived IPC key, formatted the way `ipcs` prints it.
    pub fn key(&self) -> String {
        format_key(self.sem.key())
    }

    /// Kernel id of the semaphore set.
    pub fn id(&self) -> i32 {
        self.sem.id()
    }
}

/// A held ticket. Dropping the guard (or calling [`TicketGuard::release`])
/// increments TICKETS back; a process crash releases it via `SEM_UNDO`.
#[must_use = "dropping the guard releases the ticket immediately"]
#[derive(Debug)]
pub struct TicketGuard<'a> {
    resource: &'a Resource,
    wait_time: Duration,
    released: bool,
}

impl TicketGuard<'_> {
    /// Wall-clock time the acquire spent blocked, measured on the
    /// monotonic clock.
    pub fn wait_time_ms(&self) -> u64 {
        self.wait_time.as_millis() as u64
    }

    /// Release explicitly, surfacing any failure that a silent drop would
    /// only log.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.resource.release_ticket()
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.resource.release_ticket() {
            // SEM_UNDO squares the books when the process exits.
            warn!(
                "failed to release ticket for '{}': {err}",
                self.resource.name
            );
        }
    }
}

fn check_capacity(capacity: &Capacity) -> Result<()> {
    match capacity {
        Capacity::Fixed(tickets) => {
            if *tickets > MAX_TICKETS as u32 {
                return Err(Error::bad_config(format!(
                    "ticket count must be at most {MAX_TICKETS}"
                )));
            }
        }
        Capacity::Quota(quota) => {
            if !(*quota > 0.0 && *quota <= 1.0) {
                return Err(Error::bad_config(
                    "quota must be a decimal in (0, 1]",
                ));
            }
        }
    }
    Ok(())
}

/// Shared errno mapping for operations on a possibly-vanished set:
/// `EAGAIN` is a timeout, `EIDRM` means the set was destroyed out from
/// under us.
fn map_shared_errno(err: Error, name: &str) -> Error {
    if err.is_errno(libc::EAGAIN) {
        Error::Timeout { name: name.to_owned() }
    } else if err.is_errno(libc::EIDRM) {
        Error::SemaphoreMissing { name: name.to_owned() }
    } else {
        err
    }
}
