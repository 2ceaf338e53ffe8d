//! Accrual triggers: order completion, approved reviews, confirmed
//! referrals, birthdays, and manual grants.
//!
//! Each trigger derives an idempotency key from its business identifier, so
//! a redelivered event returns the entry it produced the first time instead
//! of crediting twice.

use crate::account::AccountSlot;
use crate::engine::{EntryDraft, LoyaltyEngine};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use storefront_core::error::{LoyaltyError, LoyaltyResult};
use storefront_core::loyalty::{AccrualOutcome, EntryKind, LoyaltyEvent};
use tracing::{debug, info};

struct Accrual {
    key: String,
    kind: EntryKind,
    description: String,
    reference_id: Option<String>,
}

impl LoyaltyEngine {
    /// Credit points for a completed order, scaled by the member's tier
    /// multiplier at the time of the event.
    pub fn on_order_completed(
        &self,
        user_id: &str,
        order_id: &str,
        order_total_cents: u64,
    ) -> LoyaltyResult<AccrualOutcome> {
        let accrual = Accrual {
            key: format!("order:{order_id}"),
            kind: EntryKind::Earned,
            description: format!("Order {order_id}"),
            reference_id: Some(order_id.to_string()),
        };
        self.accrue(user_id, accrual, |engine, slot| {
            let rank = engine.program().tier_rank(slot.account().current_points);
            engine.program().order_points(order_total_cents, rank)
        })
    }

    pub fn on_review_approved(&self, user_id: &str, review_id: &str) -> LoyaltyResult<AccrualOutcome> {
        let points = self.program().config().review_bonus_points;
        let accrual = Accrual {
            key: format!("review:{review_id}"),
            kind: EntryKind::Bonus,
            description: "Product review bonus".into(),
            reference_id: Some(review_id.to_string()),
        };
        self.accrue(user_id, accrual, |_, _| points)
    }

    /// Credit the referrer once per referred user.
    pub fn on_referral_confirmed(
        &self,
        referrer_id: &str,
        referred_user_id: &str,
    ) -> LoyaltyResult<AccrualOutcome> {
        if referrer_id == referred_user_id {
            return Err(LoyaltyError::InvalidReferral(format!(
                "{referrer_id} cannot refer themselves"
            )));
        }
        let points = self.program().config().referral_bonus_points;
        let accrual = Accrual {
            key: format!("referral:{referred_user_id}"),
            kind: EntryKind::Referral,
            description: format!("Referral of {referred_user_id}"),
            reference_id: Some(referred_user_id.to_string()),
        };
        self.accrue(referrer_id, accrual, |_, _| points)
    }

    pub fn on_birthday(&self, user_id: &str) -> LoyaltyResult<AccrualOutcome> {
        self.on_birthday_on(user_id, Utc::now().date_naive())
    }

    /// Birthday bonus for the year of `date`. At most one per calendar year,
    /// and never for a date after today (UTC).
    pub fn on_birthday_on(&self, user_id: &str, date: NaiveDate) -> LoyaltyResult<AccrualOutcome> {
        let today = Utc::now().date_naive();
        if date > today {
            return Err(LoyaltyError::InvalidEventDate(format!(
                "birthday {date} is after {today}"
            )));
        }
        let points = self.program().config().birthday_bonus_points;
        let year = date.year();
        let accrual = Accrual {
            key: format!("birthday:{year}"),
            kind: EntryKind::Bonus,
            description: format!("Birthday bonus {year}"),
            reference_id: Some(year.to_string()),
        };
        self.accrue(user_id, accrual, |_, _| points)
    }

    /// Manual goodwill credit, idempotent on `reference`.
    pub fn grant_bonus(
        &self,
        user_id: &str,
        points: u64,
        description: &str,
        reference: &str,
    ) -> LoyaltyResult<AccrualOutcome> {
        let accrual = Accrual {
            key: format!("grant:{reference}"),
            kind: EntryKind::Bonus,
            description: description.to_string(),
            reference_id: Some(reference.to_string()),
        };
        self.accrue(user_id, accrual, |_, _| points)
    }

    /// Shared accrual path. `compute` runs under the account lock after the
    /// expiration sweep, so it sees the member's current tier.
    fn accrue<F>(&self, user_id: &str, accrual: Accrual, compute: F) -> LoyaltyResult<AccrualOutcome>
    where
        F: FnOnce(&Self, &AccountSlot) -> u64,
    {
        self.get_or_create(user_id)?;
        let now = Utc::now();
        let mut events = Vec::new();

        let outcome = self.with_slot(user_id, |slot| {
            if let Some(existing) = slot.ledger().find_by_key(&accrual.key) {
                metrics::counter!("loyalty.duplicate_accruals").increment(1);
                debug!(user_id = user_id, key = %accrual.key, "Duplicate accrual ignored");
                return Ok(AccrualOutcome::Duplicate {
                    entry: existing.clone(),
                });
            }
            self.accrue_locked(slot, accrual, compute, now, &mut events)
        });
        self.publish(events);

        if let Ok(AccrualOutcome::Applied { entry }) = &outcome {
            info!(
                user_id = user_id,
                kind = ?entry.kind,
                points = entry.points,
                reference = ?entry.reference_id,
                "Points accrued"
            );
        }
        outcome
    }

    fn accrue_locked<F>(
        &self,
        slot: &mut AccountSlot,
        accrual: Accrual,
        compute: F,
        now: DateTime<Utc>,
        events: &mut Vec<LoyaltyEvent>,
    ) -> LoyaltyResult<AccrualOutcome>
    where
        F: FnOnce(&Self, &AccountSlot) -> u64,
    {
        slot.ensure_active()?;
        self.sweep_locked(slot, now, events)?;

        let points = compute(self, slot);
        if points == 0 {
            return Ok(AccrualOutcome::Skipped {
                reason: format!("{} is worth no points", accrual.key),
            });
        }

        let entry = self.append_locked(
            slot,
            EntryDraft {
                kind: accrual.kind,
                points: points.min(i64::MAX as u64) as i64,
                description: accrual.description,
                reference_id: accrual.reference_id,
                idempotency_key: Some(accrual.key),
                expiration_date: None,
            },
            now,
            events,
        )?;
        Ok(AccrualOutcome::Applied { entry })
    }
}
