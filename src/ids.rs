use std::fmt;

use uuid::Uuid;

/// Business lines that mint transaction UUIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Business {
    Package,
    Referral,
    Reconciliation,
    AiWriting,
    InitialBalance,
}

impl Business {
    fn prefix(&self) -> &'static str {
        match self {
            Business::Package => "PK",
            Business::Referral => "RF",
            Business::Reconciliation => "RC",
            Business::AiWriting => "AI",
            Business::InitialBalance => "DF",
        }
    }
}

impl fmt::Display for Business {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Generate a business-prefixed transaction UUID, e.g. `RC-0189f7...`.
/// The prefix makes the originating flow readable in the transaction log.
pub fn transaction_id(business: Business) -> String {
    format!("{}-{}", business.prefix(), Uuid::new_v4().simple())
}
