//! Loyalty account aggregate: the per-account state guarded by one lock.

use crate::ledger::AccountLedger;
use crate::program::Program;
use chrono::{DateTime, Utc};
use storefront_core::error::{LoyaltyError, LoyaltyResult};
use storefront_core::loyalty::{EntryKind, LedgerEntry, LoyaltyAccount};
use tracing::{debug, info};
use uuid::Uuid;

/// A tier transition caused by an applied entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierChange {
    pub from: String,
    pub to: String,
    pub upgrade: bool,
}

/// Account plus its ledger. Everything that mutates one account goes
/// through a single `AccountSlot` behind a mutex.
#[derive(Debug, Clone)]
pub struct AccountSlot {
    account: LoyaltyAccount,
    ledger: AccountLedger,
    /// False until the account-opened record is journaled. A slot that never
    /// gets confirmed is withdrawn from the directory.
    confirmed: bool,
}

impl AccountSlot {
    /// A fresh, unconfirmed account with zero points in the program's
    /// entry tier.
    pub fn open(
        user_id: &str,
        program: &Program,
        referral_code: String,
        now: DateTime<Utc>,
    ) -> Self {
        let mut slot = Self::restore(LoyaltyAccount {
            account_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            program_id: program.program_id().to_string(),
            current_points: 0,
            total_points_earned: 0,
            total_points_redeemed: 0,
            current_tier: program.tier_for(0).name.clone(),
            referral_code,
            active: true,
            joined_at: now,
            last_activity_at: now,
        });
        slot.confirmed = false;
        slot
    }

    /// Rebuild from an account snapshot taken before any entry was applied.
    pub fn restore(account: LoyaltyAccount) -> Self {
        Self {
            account,
            ledger: AccountLedger::new(),
            confirmed: true,
        }
    }

    pub fn confirm(&mut self) {
        self.confirmed = true;
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn account(&self) -> &LoyaltyAccount {
        &self.account
    }

    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    pub fn account_id(&self) -> Uuid {
        self.account.account_id
    }

    pub fn ensure_active(&self) -> LoyaltyResult<()> {
        if self.account.active {
            Ok(())
        } else {
            Err(LoyaltyError::AccountInactive(self.account.user_id.clone()))
        }
    }

    pub fn deactivate(&mut self, at: DateTime<Utc>) {
        self.account.active = false;
        self.account.last_activity_at = at;
    }

    /// Check `entry` against both the ledger rules and the non-negative
    /// balance rule without changing anything.
    pub fn check_entry(&self, entry: &LedgerEntry) -> LoyaltyResult<()> {
        if entry.account_id != self.account.account_id {
            return Err(LoyaltyError::AccountNotFound(entry.account_id.to_string()));
        }
        self.ledger.validate(entry)?;
        if entry.points < 0 {
            let debit = entry.points.unsigned_abs();
            if debit > self.account.current_points {
                return Err(LoyaltyError::InsufficientBalance {
                    requested: debit,
                    available: self.account.current_points,
                });
            }
        }
        Ok(())
    }

    /// Append `entry` and fold it into the account. Rejected entries leave
    /// the slot untouched.
    pub fn apply_entry(
        &mut self,
        entry: LedgerEntry,
        program: &Program,
    ) -> LoyaltyResult<Option<TierChange>> {
        self.check_entry(&entry)?;

        let points = entry.points;
        let kind = entry.kind;
        let created_at = entry.created_at;
        self.ledger.append(entry)?;

        if points >= 0 {
            self.account.current_points += points as u64;
            self.account.total_points_earned += points as u64;
        } else {
            self.account.current_points -= points.unsigned_abs();
        }
        if kind == EntryKind::Redeemed {
            self.account.total_points_redeemed += points.unsigned_abs();
        }
        if created_at > self.account.last_activity_at {
            self.account.last_activity_at = created_at;
        }

        debug!(
            user_id = %self.account.user_id,
            kind = ?kind,
            points = points,
            balance = self.account.current_points,
            "Ledger entry applied"
        );

        Ok(self.recompute_tier(program))
    }

    /// Re-derive the tier from `current_points`. Returns the transition, if
    /// any.
    pub fn recompute_tier(&mut self, program: &Program) -> Option<TierChange> {
        let old_rank = program
            .tiers()
            .iter()
            .position(|t| t.name == self.account.current_tier);
        let new_rank = program.tier_rank(self.account.current_points);
        let new_tier = &program.tiers()[new_rank];

        if new_tier.name == self.account.current_tier {
            return None;
        }

        let change = TierChange {
            from: std::mem::replace(&mut self.account.current_tier, new_tier.name.clone()),
            to: new_tier.name.clone(),
            upgrade: old_rank.map_or(true, |old| new_rank > old),
        };

        if change.upgrade {
            metrics::counter!("loyalty.tier_upgrades").increment(1);
            info!(
                user_id = %self.account.user_id,
                old = %change.from,
                new = %change.to,
                "Tier upgrade"
            );
        } else {
            metrics::counter!("loyalty.tier_downgrades").increment(1);
            debug!(
                user_id = %self.account.user_id,
                old = %change.from,
                new = %change.to,
                "Tier downgrade"
            );
        }
        Some(change)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use storefront_core::loyalty::ProgramConfiguration;

    fn program() -> Program {
        Program::new(ProgramConfiguration::default()).unwrap()
    }

    fn entry(slot: &AccountSlot, id: u64, kind: EntryKind, points: i64) -> LedgerEntry {
        LedgerEntry {
            id,
            account_id: slot.account_id(),
            kind,
            points,
            description: "test".into(),
            reference_id: None,
            expiration_date: None,
            idempotency_key: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_entry_updates_totals_and_tier() {
        let program = program();
        let mut slot = AccountSlot::open("user-1", &program, "ABCD1234".into(), Utc::now());
        assert_eq!(slot.account().current_tier, "Bronze");

        let change = slot
            .apply_entry(entry(&slot, 1, EntryKind::Earned, 1200), &program)
            .unwrap();
        assert_eq!(
            change,
            Some(TierChange {
                from: "Bronze".into(),
                to: "Silver".into(),
                upgrade: true
            })
        );

        let change = slot
            .apply_entry(entry(&slot, 2, EntryKind::Redeemed, -300), &program)
            .unwrap();
        assert!(change.as_ref().is_some_and(|c| !c.upgrade));

        let account = slot.account();
        assert_eq!(account.current_points, 900);
        assert_eq!(account.total_points_earned, 1200);
        assert_eq!(account.total_points_redeemed, 300);
        assert_eq!(account.current_tier, "Bronze");
    }

    #[test]
    fn test_overdraft_rejected_before_commit() {
        let program = program();
        let mut slot = AccountSlot::open("user-1", &program, "ABCD1234".into(), Utc::now());
        slot.apply_entry(entry(&slot, 1, EntryKind::Bonus, 50), &program)
            .unwrap();

        let err = slot
            .apply_entry(entry(&slot, 2, EntryKind::Redeemed, -80), &program)
            .unwrap_err();
        assert!(matches!(
            err,
            LoyaltyError::InsufficientBalance { requested: 80, available: 50 }
        ));
        assert_eq!(slot.account().current_points, 50);
        assert_eq!(slot.ledger().len(), 1);
    }

    #[test]
    fn test_expired_entries_do_not_count_as_redeemed() {
        let program = program();
        let mut slot = AccountSlot::open("user-1", &program, "ABCD1234".into(), Utc::now());
        slot.apply_entry(entry(&slot, 1, EntryKind::Earned, 100), &program)
            .unwrap();
        slot.apply_entry(entry(&slot, 2, EntryKind::Expired, -100), &program)
            .unwrap();
        assert_eq!(slot.account().current_points, 0);
        assert_eq!(slot.account().total_points_redeemed, 0);
        assert_eq!(slot.account().total_points_earned, 100);
    }

    #[test]
    fn test_opened_slot_needs_confirmation() {
        let program = program();
        let mut slot = AccountSlot::open("user-1", &program, "ABCD1234".into(), Utc::now());
        assert!(!slot.is_confirmed());
        slot.confirm();
        assert!(slot.is_confirmed());
        assert!(AccountSlot::restore(slot.account().clone()).is_confirmed());
    }

    #[test]
    fn test_inactive_account() {
        let program = program();
        let mut slot = AccountSlot::open("user-1", &program, "ABCD1234".into(), Utc::now());
        assert!(slot.ensure_active().is_ok());
        slot.deactivate(Utc::now());
        assert!(matches!(
            slot.ensure_active(),
            Err(LoyaltyError::AccountInactive(_))
        ));
    }
}
