//! Host-local resource protection over SysV IPC.
//!
//! Worker processes sharing a machine coordinate access to downstream
//! dependencies through named resources. Three kinds of back-pressure are
//! provided, all correct across process boundaries and process crashes:
//!
//! - a **bulkhead** ([`Resource`]): a bounded ticket pool, optionally sized
//!   as a quota of the registered worker count, backed by a SysV semaphore
//!   set with `SEM_UNDO` so crashed holders return their tickets;
//! - **breaker accounting** primitives ([`SimpleInteger`],
//!   [`SlidingWindow`]): a shared counter and a shared ring of recent
//!   outcomes, serialized by the resource's meta-lock;
//! - **adaptive rejection** ([`SharedPidController`]): a host-wide PID
//!   controller computing a rejection probability from observed error and
//!   ping-failure rates, guarded by a process-shared robust mutex.
//!
//! The crate publishes primitives; breaker policy, adapter instrumentation,
//! and configuration live above it. All state is named by key and lives in
//! kernel IPC objects; handles are thin references with no owning lifetime
//! over the underlying object. Linux only.

mod clock;
mod error;
mod key;
mod pid;
mod resource;
mod semset;
mod shm;
mod simple_integer;
mod sliding_window;
mod tickets;

pub use clock::{diff_ms, ms_to_timespec, now_ms};
pub use error::{Error, Result};
pub use key::{aux_key, format_key, resource_key};
pub use pid::{PidMetrics, PingOutcome, RequestOutcome, SharedPidController};
pub use resource::{Capacity, QuotaGrace, Resource, TicketGuard};
pub use semset::MAX_TICKETS;
pub use simple_integer::SimpleInteger;
pub use sliding_window::{MAX_CAPACITY, SlidingWindow};

/// Default UNIX mode for every IPC object the crate creates.
pub const DEFAULT_PERMISSIONS: u32 = 0o660;
