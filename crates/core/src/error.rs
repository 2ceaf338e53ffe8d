use crate::loyalty::EntryKind;
use thiserror::Error;

pub type LoyaltyResult<T> = Result<T, LoyaltyError>;

#[derive(Error, Debug)]
pub enum LoyaltyError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No tier configured for {points} points")]
    NoTierConfigured { points: u64 },

    #[error("{points} points is not valid for a {kind:?} entry")]
    InvalidPointsKind { kind: EntryKind, points: i64 },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u64, available: u64 },

    #[error("Redemption of {requested} points is below the minimum of {minimum}")]
    BelowMinimumRedemption { requested: u64, minimum: u64 },

    #[error("Accrual already processed: {key}")]
    DuplicateAccrual { key: String },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account is deactivated: {0}")]
    AccountInactive(String),

    #[error("Invalid redemption: {0}")]
    InvalidRedemption(String),

    #[error("Invalid referral: {0}")]
    InvalidReferral(String),

    #[error("Invalid event date: {0}")]
    InvalidEventDate(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoyaltyError {
    /// Whether the caller can fix the request and retry (as opposed to a
    /// configuration or persistence fault on our side).
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            LoyaltyError::InvalidPointsKind { .. }
                | LoyaltyError::InsufficientBalance { .. }
                | LoyaltyError::BelowMinimumRedemption { .. }
                | LoyaltyError::InvalidRedemption(_)
                | LoyaltyError::InvalidReferral(_)
                | LoyaltyError::InvalidEventDate(_)
        )
    }
}
