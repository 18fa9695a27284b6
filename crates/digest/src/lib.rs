//! Scheduled digest aggregators.
//!
//! Three jobs (task-update summary, per-user daily digest, per-project daily
//! digest) query an aggregate, skip empty recipients, render and hand each
//! batch to the email gateway. Digests are email-only: nothing is persisted
//! as a notification and nothing is pushed.

pub mod helpers;
pub mod jobs;
pub mod lock;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod templates;
