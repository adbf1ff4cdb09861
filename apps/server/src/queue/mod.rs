//! Durable job queue
//!
//! The `jobs` table is the queue-of-record. Producers go through [`Enqueuer`],
//! which writes the row and then publishes a best-effort wake-up on the
//! notification channel (LISTEN/NOTIFY on `jobs` by default).

mod enqueue;
mod memory;
mod models;
mod notify;
mod postgres;
mod store;

pub use enqueue::Enqueuer;
pub use memory::MemoryJobStore;
pub use models::*;
pub use notify::{MemoryNotifier, NotificationStream, Notifier, PgNotifier};
pub use postgres::PostgresJobStore;
pub use store::{JobStore, MAX_LIST_LIMIT};
