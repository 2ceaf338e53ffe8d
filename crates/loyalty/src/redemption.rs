//! Redemption state machine, point-to-reward conversion, and the reward
//! token vault.

use crate::program::Program;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use storefront_core::error::{LoyaltyError, LoyaltyResult};
use storefront_core::loyalty::{RateMode, RewardRate, RewardToken, RewardType, RewardValue};
use tracing::debug;
use uuid::Uuid;

/// `Requested → Validated → Committed`, or `Requested → Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedemptionState {
    Requested,
    Validated,
    Committed,
    Rejected,
}

/// One redemption attempt, tracked through its states.
#[derive(Debug, Clone)]
pub struct RedemptionAttempt {
    pub account_id: Uuid,
    pub points: u64,
    pub reward_type: RewardType,
    state: RedemptionState,
}

impl RedemptionAttempt {
    pub fn new(account_id: Uuid, points: u64, reward_type: RewardType) -> Self {
        Self {
            account_id,
            points,
            reward_type,
            state: RedemptionState::Requested,
        }
    }

    pub fn state(&self) -> RedemptionState {
        self.state
    }

    /// Validate against the program and the account's active balance.
    /// Returns the reward value the points convert to.
    pub fn validate(&mut self, program: &Program, available: u64) -> LoyaltyResult<RewardValue> {
        if self.state != RedemptionState::Requested {
            return Err(LoyaltyError::InvalidRedemption(format!(
                "attempt already {:?}",
                self.state
            )));
        }
        let result = self.check(program, available);
        self.state = if result.is_ok() {
            RedemptionState::Validated
        } else {
            RedemptionState::Rejected
        };
        result
    }

    fn check(&self, program: &Program, available: u64) -> LoyaltyResult<RewardValue> {
        let minimum = program.config().min_redemption_points;
        if self.points < minimum {
            return Err(LoyaltyError::BelowMinimumRedemption {
                requested: self.points,
                minimum,
            });
        }
        if self.points > available {
            return Err(LoyaltyError::InsufficientBalance {
                requested: self.points,
                available,
            });
        }
        let rate = program.rate_for(self.reward_type).ok_or_else(|| {
            LoyaltyError::InvalidRedemption(format!(
                "no conversion rate configured for {:?}",
                self.reward_type
            ))
        })?;
        convert(rate, self.points)
    }

    pub fn commit(&mut self) {
        debug_assert_eq!(self.state, RedemptionState::Validated);
        self.state = RedemptionState::Committed;
    }

    pub fn reject(&mut self) {
        if self.state != RedemptionState::Committed {
            self.state = RedemptionState::Rejected;
        }
    }
}

/// Convert points into reward value. Points must be a positive multiple of
/// the rate's `points_per_unit`.
pub fn convert(rate: &RewardRate, points: u64) -> LoyaltyResult<RewardValue> {
    if points == 0 || points % rate.points_per_unit != 0 {
        return Err(LoyaltyError::InvalidRedemption(format!(
            "{:?} redemptions must be a positive multiple of {} points",
            rate.reward_type, rate.points_per_unit
        )));
    }
    let units = points / rate.points_per_unit;

    match rate.mode {
        RateMode::FixedAmount { cents_per_unit } => Ok(RewardValue::FixedAmount {
            cents: units.saturating_mul(cents_per_unit),
        }),
        RateMode::Percentage {
            percent_per_unit,
            max_percent,
        } => {
            let percent = units.saturating_mul(percent_per_unit as u64);
            if percent > max_percent as u64 {
                return Err(LoyaltyError::InvalidRedemption(format!(
                    "{percent}% exceeds the {max_percent}% cap for {:?}",
                    rate.reward_type
                )));
            }
            Ok(RewardValue::Percentage {
                percent: percent as u32,
            })
        }
    }
}

// ─── Reward Vault ───────────────────────────────────────────────────────────

const CODE_LEN: usize = 10;

/// Issued reward tokens keyed by code.
#[derive(Default)]
pub struct RewardVault {
    tokens: DashMap<String, RewardToken>,
    /// Codes minted but not yet inserted or released.
    reserved: DashSet<String>,
}

impl RewardVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token whose code is reserved until it is inserted or released.
    #[allow(clippy::too_many_arguments)]
    pub fn mint(
        &self,
        account_id: Uuid,
        reward_type: RewardType,
        value: RewardValue,
        points_spent: u64,
        metadata: BTreeMap<String, String>,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> RewardToken {
        RewardToken {
            code: self.reserve_code(|| format!("RW-{}", random_code(CODE_LEN))),
            account_id,
            reward_type,
            value,
            points_spent,
            metadata,
            issued_at,
            expires_at,
            consumed: false,
        }
    }

    /// Draw candidates until one is neither issued nor reserved. The
    /// reservation is taken before the issued check, and `insert` adds the
    /// token before dropping its reservation, so two callers never both
    /// win the same code.
    fn reserve_code<F>(&self, mut candidate: F) -> String
    where
        F: FnMut() -> String,
    {
        loop {
            let code = candidate();
            if !self.reserved.insert(code.clone()) {
                continue;
            }
            if self.tokens.contains_key(&code) {
                self.reserved.remove(&code);
                continue;
            }
            return code;
        }
    }

    pub fn insert(&self, token: RewardToken) {
        let code = token.code.clone();
        self.tokens.insert(code.clone(), token);
        self.reserved.remove(&code);
    }

    /// Give back the code of a token that was never issued.
    pub fn release(&self, code: &str) {
        self.reserved.remove(code);
    }

    pub fn reserved_len(&self) -> usize {
        self.reserved.len()
    }

    pub fn get(&self, code: &str) -> Option<RewardToken> {
        self.tokens.get(code).map(|t| t.clone())
    }

    pub fn for_account(&self, account_id: Uuid) -> Vec<RewardToken> {
        let mut tokens: Vec<RewardToken> = self
            .tokens
            .iter()
            .filter(|t| t.account_id == account_id)
            .map(|t| t.clone())
            .collect();
        tokens.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Mark a token consumed if it is still redeemable at `now`. `persist`
    /// runs before the flag flips; if it fails the token stays unconsumed.
    /// Returns `Ok(None)` for unknown, consumed, or expired tokens.
    pub fn consume<F>(&self, code: &str, now: DateTime<Utc>, persist: F) -> LoyaltyResult<Option<RewardToken>>
    where
        F: FnOnce(&RewardToken) -> LoyaltyResult<()>,
    {
        let Entry::Occupied(mut slot) = self.tokens.entry(code.to_string()) else {
            return Ok(None);
        };
        if !slot.get().is_redeemable(now) {
            debug!(code = code, consumed = slot.get().consumed, "Reward not redeemable");
            return Ok(None);
        }
        persist(slot.get())?;
        slot.get_mut().consumed = true;
        Ok(Some(slot.get().clone()))
    }

    /// Replay path: flip the flag without persisting.
    pub fn mark_consumed(&self, code: &str) -> bool {
        match self.tokens.get_mut(code) {
            Some(mut token) => {
                token.consumed = true;
                true
            }
            None => false,
        }
    }
}

/// Uppercase alphanumeric code, used for reward and referral codes.
pub fn random_code(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect()
}
