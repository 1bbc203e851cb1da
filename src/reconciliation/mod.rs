pub mod models;
pub mod repository;
pub mod service;

pub use models::{ReconciliationRecord, ReconciliationSummary, UserReconciliation};
pub use repository::ReconciliationRepository;
pub use service::ReconciliationService;
