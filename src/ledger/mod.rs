pub mod models;
pub mod repository;
pub mod service;

pub use models::{RelatedEntity, TokenAccount, TokenTransaction, TransactionStatus, TransactionType};
pub use repository::LedgerRepository;
pub use service::{LedgerOutcome, TokenLedger};
