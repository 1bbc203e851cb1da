// Generic at-least-once retry mechanism: a durable task table plus a
// timer-driven dispatcher. Knows nothing about ledger semantics.
pub mod handlers;
pub mod models;
pub mod scheduler;
pub mod store;

pub use models::{CompensationTask, NewTask, TaskStatus};
pub use scheduler::{CompensationHandler, CompensationScheduler};
pub use store::CompensationStore;
