//! SysV semaphore-set wrapper.
//!
//! Each resource owns one set of [`NUM_SEMS`] semaphores laid out as in
//! [`SemIndex`]. SysV semaphores cannot be created and initialized
//! atomically, so creation follows the classic two-phase protocol: exactly
//! one process wins the `IPC_EXCL` create and seeds the values, everyone
//! else attaches and polls `sem_otime` until the creator's first semop
//! publishes it. `SEM_UNDO` is used on every ticket and registration
//! operation so the kernel returns whatever a crashed process was holding.

use std::time::Duration;

use log::{debug, warn};

use crate::clock::duration_to_timespec;
use crate::error::{Error, Result};

// Not exposed by this version of the `libc` crate; bind it directly since
// glibc/musl both provide the symbol.
unsafe extern "C" {
    fn semtimedop(
        semid: libc::c_int,
        sops: *mut libc::sembuf,
        nsops: libc::size_t,
        timeout: *const libc::timespec,
    ) -> libc::c_int;
}

/// Cardinality of every resource semaphore set. Folded into the IPC key.
pub(crate) const NUM_SEMS: usize = 5;

/// Budget for internal timed operations: meta-lock acquisition, ticket
/// deltas during reconfiguration, and the creator/waiter handshake.
pub(crate) const INTERNAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How often waiters re-check `sem_otime` while the creator initializes.
const INIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interrupted semops are retried this many times before surfacing.
const EINTR_RETRIES: u32 = 3;

/// Largest value a single SysV semaphore can hold (SEMVMX), and therefore
/// the largest ticket count a resource can be configured with.
pub const MAX_TICKETS: i32 = 32_767;

/// Semaphore numbers within a resource set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum SemIndex {
    /// Binary mutex serializing reconfiguration. Initial value 1.
    MetaLock = 0,
    /// Live ticket inventory. Decremented on acquire with SEM_UNDO.
    Tickets = 1,
    /// Currently configured maximum; deltas are computed against it.
    ConfiguredTickets = 2,
    /// Number of processes registered against the resource. SEM_UNDO set.
    RegisteredWorkers = 3,
    /// Reserved. Any semop on the set advances `sem_otime`, which waiters
    /// poll to detect that the creator finished initializing.
    OtimeWitness = 4,
}

impl SemIndex {
    fn label(self) -> &'static str {
        match self {
            SemIndex::MetaLock => "META_LOCK",
            SemIndex::Tickets => "TICKETS",
            SemIndex::ConfiguredTickets => "CONFIGURED_TICKETS",
            SemIndex::RegisteredWorkers => "REGISTERED_WORKERS",
            SemIndex::OtimeWitness => "LOCK_OTIME_WITNESS",
        }
    }
}

// semctl's optional fourth argument, per semop(2).
#[repr(C)]
union Semun {
    val: libc::c_int,
    buf: *mut libc::semid_ds,
    array: *mut libc::c_ushort,
}

/// Handle to a kernel semaphore set. Thin reference: dropping it never
/// touches the kernel object, which is shared by every process that opened
/// the same key.
#[derive(Debug)]
pub(crate) struct SemaphoreSet {
    id: libc::c_int,
    key: i32,
}

impl SemaphoreSet {
    /// Exclusive-create first; on `EEXIST` fall back to opening the
    /// existing set. Returns whether this process was the creator.
    pub(crate) fn create_or_attach(key: i32, permissions: u32) -> Result<(Self, bool)> {
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | permissions as libc::c_int;
        let id = unsafe { libc::semget(key, NUM_SEMS as libc::c_int, flags) };
        if id >= 0 {
            return Ok((SemaphoreSet { id, key }, true));
        }

        let err = Error::syscall("semget()");
        if !err.is_errno(libc::EEXIST) {
            return Err(err);
        }

        let id = unsafe {
            libc::semget(key, NUM_SEMS as libc::c_int, permissions as libc::c_int)
        };
        if id < 0 {
            return Err(Error::syscall("semget()"));
        }
        Ok((SemaphoreSet { id, key }, false))
    }

    /// Attach to an existing set without creating one.
    pub(crate) fn open(key: i32) -> Result<Self> {
        let id = unsafe { libc::semget(key, NUM_SEMS as libc::c_int, 0) };
        if id < 0 {
            return Err(Error::syscall("semget()"));
        }
        Ok(SemaphoreSet { id, key })
    }

    pub(crate) fn id(&self) -> i32 {
        self.id
    }

    pub(crate) fn key(&self) -> i32 {
        self.key
    }

    /// Perform a single semop on one semaphore, timed when a timeout is
    /// given. Interrupted calls are retried a bounded number of times, with
    /// the full timeout each attempt; callers treat the residual `EINTR`
    /// as any other syscall failure.
    ///
    /// Blocks only the calling OS thread; sibling threads stay runnable.
    pub(crate) fn op(
        &self,
        index: SemIndex,
        delta: i16,
        flags: i16,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut buf = libc::sembuf {
            sem_num: index as libc::c_ushort,
            sem_op: delta,
            sem_flg: flags,
        };
        let ts = timeout.map(duration_to_timespec);

        let mut retries = EINTR_RETRIES;
        loop {
            let rc = unsafe {
                match &ts {
                    Some(ts) => semtimedop(self.id, &mut buf, 1, ts),
                    None => libc::semop(self.id, &mut buf, 1),
                }
            };
            if rc == 0 {
                return Ok(());
            }
            let err = if ts.is_some() {
                Error::syscall("semtimedop()")
            } else {
                Error::syscall("semop()")
            };
            if err.is_errno(libc::EINTR) && retries > 0 {
                retries -= 1;
                continue;
            }
            return Err(err);
        }
    }

    pub(crate) fn get(&self, index: SemIndex) -> Result<i32> {
        let ret = unsafe { libc::semctl(self.id, index as libc::c_int, libc::GETVAL) };
        if ret == -1 {
            let err = Error::syscall("semctl(GETVAL)");
            debug!(
                "failed reading {} for semid {}: {err}",
                index.label(),
                self.id
            );
            return Err(err);
        }
        Ok(ret)
    }

    pub(crate) fn set(&self, index: SemIndex, value: i32) -> Result<()> {
        let arg = Semun { val: value };
        let rc = unsafe { libc::semctl(self.id, index as libc::c_int, libc::SETVAL, arg) };
        if rc == -1 {
            return Err(Error::syscall("semctl(SETVAL)"));
        }
        Ok(())
    }

    fn set_all(&self, mut values: [libc::c_ushort; NUM_SEMS]) -> Result<()> {
        let arg = Semun {
            array: values.as_mut_ptr(),
        };
        let rc = unsafe { libc::semctl(self.id, 0, libc::SETALL, arg) };
        if rc == -1 {
            return Err(Error::syscall("semctl(SETALL)"));
        }
        Ok(())
    }

    pub(crate) fn stat(&self) -> Result<libc::semid_ds> {
        let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
        let arg = Semun { buf: &mut ds };
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, arg) };
        if rc == -1 {
            return Err(Error::syscall("semctl(IPC_STAT)"));
        }
        Ok(ds)
    }

    /// Rewrite the set's UNIX permission bits when they differ from the
    /// requested mode, so every cooperating process ends up with the mode
    /// the most recent registrant asked for.
    pub(crate) fn set_permissions(&self, permissions: u32) -> Result<()> {
        let mut ds = self.stat()?;
        if (ds.sem_perm.mode as u32) & 0xfff == permissions {
            return Ok(());
        }
        let mode = (ds.sem_perm.mode as u32 & !0xfff) | permissions;
        ds.sem_perm.mode = mode as _;
        let arg = Semun { buf: &mut ds };
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_SET, arg) };
        if rc == -1 {
            return Err(Error::syscall("semctl(IPC_SET)"));
        }
        Ok(())
    }

    /// Block until the creator's first semop publishes `sem_otime`, or give
    /// up after [`INTERNAL_TIMEOUT`].
    pub(crate) fn wait_for_initialization(&self) -> Result<()> {
        let checks = INTERNAL_TIMEOUT.as_millis() / INIT_POLL_INTERVAL.as_millis();
        for attempt in 0..checks {
            if self.stat()?.sem_otime != 0 {
                return Ok(());
            }
            debug!(
                "semid {} not yet initialized, waiting (check {attempt})",
                self.id
            );
            std::thread::sleep(INIT_POLL_INTERVAL);
        }
        Err(Error::internal(format!(
            "timeout waiting for semaphore set {} to initialize",
            self.id
        )))
    }

    /// Creator-side half of the handshake: an increment-decrement pair on
    /// REGISTERED_WORKERS under the meta-lock. The values cancel out; the
    /// point is that any semop advances `sem_otime`, which is the barrier
    /// waiters poll.
    fn publish_initialization(&self) -> Result<()> {
        let _guard = self.meta_lock()?;
        self.op(SemIndex::RegisteredWorkers, 1, 0, None)?;
        self.op(
            SemIndex::RegisteredWorkers,
            -1,
            libc::IPC_NOWAIT as i16,
            None,
        )?;
        Ok(())
    }

    /// Timed decrement of META_LOCK. The guard restores it on drop.
    pub(crate) fn meta_lock(&self) -> Result<MetaLockGuard<'_>> {
        self.op(
            SemIndex::MetaLock,
            -1,
            libc::SEM_UNDO as i16,
            Some(INTERNAL_TIMEOUT),
        )?;
        Ok(MetaLockGuard { set: self })
    }

    /// Remove the set. `EINVAL`/`EIDRM` mean somebody else already removed
    /// it, which counts as success.
    pub(crate) fn remove(&self) -> Result<()> {
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc == -1 {
            let err = Error::syscall("semctl(IPC_RMID)");
            if err.is_errno(libc::EINVAL) || err.is_errno(libc::EIDRM) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Exclusive hold on a set's META_LOCK. Unlocks on drop.
#[must_use]
pub(crate) struct MetaLockGuard<'a> {
    set: &'a SemaphoreSet,
}

impl Drop for MetaLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self
            .set
            .op(SemIndex::MetaLock, 1, libc::SEM_UNDO as i16, None)
        {
            // SEM_UNDO will release the lock when the process exits; all we
            // can do here is make the failure visible.
            warn!("failed to release META_LOCK on semid {}: {err}", self.set.id());
        }
    }
}

/// Create-or-attach the semaphore set for `name`, running the creator/waiter
/// handshake so that the returned set is always fully initialized.
pub(crate) fn attach_resource_set(name: &str, permissions: u32) -> Result<SemaphoreSet> {
    let key = crate::key::resource_key(name);
    let (set, created) = SemaphoreSet::create_or_attach(key, permissions)?;
    if created {
        set.set_all([1, 0, 0, 0, 0])?;
        set.publish_initialization()?;
        debug!("created semaphore set {} for '{name}'", set.id());
    } else {
        set.wait_for_initialization()?;
    }
    set.set_permissions(permissions)?;
    Ok(set)
}
