#![warn(clippy::unwrap_used)]

//! Loyalty points ledger and tier-progression engine.
//!
//! The ledger is the source of truth; accounts are derived from it and can
//! be rebuilt by replaying the journal. Mutations on one account are
//! serialized behind that account's lock; different accounts never contend.

pub mod account;
pub mod accrual;
pub mod engine;
pub mod journal;
pub mod ledger;
pub mod program;
pub mod redemption;
pub mod tiers;

pub use account::{AccountSlot, TierChange};
pub use engine::{BalanceMismatch, LoyaltyEngine, SweepReport};
pub use journal::{FileJournal, Journal, JournalRecord, MemoryJournal};
pub use ledger::{AccountLedger, Lot};
pub use program::Program;
pub use redemption::{RedemptionAttempt, RedemptionState, RewardVault};
