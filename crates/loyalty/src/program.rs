//! Validated program configuration.
//!
//! A `Program` can only be built from a configuration that passes
//! validation, so tier lookups on it never fail at request time.

use crate::tiers;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use storefront_core::error::{LoyaltyError, LoyaltyResult};
use storefront_core::loyalty::{
    ProgramConfiguration, RateMode, RewardRate, RewardType, TierDefinition, TierProgress,
    NON_EXPIRING_POINTS,
};
use tracing::info;

/// Fixed-point scale for points per currency unit (1/1000).
const RATE_SCALE: u128 = 1_000;
/// Fixed-point scale for tier multipliers (basis points).
const MULTIPLIER_SCALE: u128 = 10_000;
const CENTS_PER_UNIT: u128 = 100;

#[derive(Debug, Clone)]
pub struct Program {
    config: ProgramConfiguration,
    points_per_unit_milli: u64,
    multipliers_bp: Vec<u64>,
}

impl Program {
    pub fn new(config: ProgramConfiguration) -> LoyaltyResult<Self> {
        tiers::validate_tiers(&config.tiers)?;

        let ppcu = config.points_per_currency_unit;
        if !ppcu.is_finite() || ppcu < 0.0 {
            return Err(LoyaltyError::Configuration(format!(
                "points_per_currency_unit must be a non-negative number, got {ppcu}"
            )));
        }
        if config.points_expiry_days == Some(0) {
            return Err(LoyaltyError::Configuration(
                "points_expiry_days must be positive when set".into(),
            ));
        }
        if config.reward_validity_days == 0 {
            return Err(LoyaltyError::Configuration(
                "reward_validity_days must be positive".into(),
            ));
        }
        validate_rates(&config.reward_rates)?;

        let points_per_unit_milli = (ppcu * RATE_SCALE as f64).round() as u64;
        let multipliers_bp = config
            .tiers
            .iter()
            .map(|t| (t.multiplier * MULTIPLIER_SCALE as f64).round() as u64)
            .collect();

        info!(
            program = %config.program_id,
            version = config.version,
            tiers = config.tiers.len(),
            welcome = config.welcome_bonus_points,
            min_redemption = config.min_redemption_points,
            "Loyalty program loaded"
        );

        Ok(Self {
            config,
            points_per_unit_milli,
            multipliers_bp,
        })
    }

    pub fn config(&self) -> &ProgramConfiguration {
        &self.config
    }

    pub fn program_id(&self) -> &str {
        &self.config.program_id
    }

    pub fn tiers(&self) -> &[TierDefinition] {
        &self.config.tiers
    }

    pub fn tier_rank(&self, points: u64) -> usize {
        // The ladder was validated to cover [0, ∞).
        tiers::rank_of(points, self.tiers()).unwrap_or(0)
    }

    pub fn tier_for(&self, points: u64) -> &TierDefinition {
        &self.config.tiers[self.tier_rank(points)]
    }

    pub fn tier_named(&self, name: &str) -> Option<&TierDefinition> {
        self.config
            .tiers
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn progress(&self, points: u64) -> TierProgress {
        tiers::progress_to_next_tier(points, self.tiers()).unwrap_or(TierProgress {
            percentage: 100,
            points_needed: 0,
            next_tier: None,
        })
    }

    /// `floor(total × points_per_currency_unit × multiplier)` in exact
    /// integer arithmetic.
    pub fn order_points(&self, order_total_cents: u64, tier_rank: usize) -> u64 {
        let multiplier = self
            .multipliers_bp
            .get(tier_rank)
            .copied()
            .unwrap_or(MULTIPLIER_SCALE as u64) as u128;
        let raw = order_total_cents as u128 * self.points_per_unit_milli as u128 * multiplier;
        let points = raw / (CENTS_PER_UNIT * RATE_SCALE * MULTIPLIER_SCALE);
        points.min(u64::MAX as u128) as u64
    }

    pub fn rate_for(&self, reward_type: RewardType) -> Option<&RewardRate> {
        self.config
            .reward_rates
            .iter()
            .find(|r| r.reward_type == reward_type)
    }

    /// Expiration stamped on a credit created at `created_at` by a member
    /// of `tier`.
    pub fn expiration_for(
        &self,
        created_at: DateTime<Utc>,
        tier: &TierDefinition,
    ) -> Option<DateTime<Utc>> {
        if tier.has_benefit(NON_EXPIRING_POINTS) {
            return None;
        }
        self.config
            .points_expiry_days
            .map(|days| created_at + Duration::days(days as i64))
    }

    pub fn reward_expiry(&self, issued_at: DateTime<Utc>) -> DateTime<Utc> {
        issued_at + Duration::days(self.config.reward_validity_days as i64)
    }
}

fn validate_rates(rates: &[RewardRate]) -> LoyaltyResult<()> {
    let mut seen = HashSet::new();
    for rate in rates {
        if !seen.insert(rate.reward_type) {
            return Err(LoyaltyError::Configuration(format!(
                "duplicate reward rate for {:?}",
                rate.reward_type
            )));
        }
        if rate.points_per_unit == 0 {
            return Err(LoyaltyError::Configuration(format!(
                "{:?} rate must spend at least one point per unit",
                rate.reward_type
            )));
        }
        match rate.mode {
            RateMode::FixedAmount { cents_per_unit } if cents_per_unit == 0 => {
                return Err(LoyaltyError::Configuration(format!(
                    "{:?} rate is worth nothing",
                    rate.reward_type
                )));
            }
            RateMode::Percentage {
                percent_per_unit,
                max_percent,
            } if percent_per_unit == 0 || max_percent == 0 || max_percent > 100 => {
                return Err(LoyaltyError::Configuration(format!(
                    "{:?} percentage rate must be within 1..=100",
                    rate.reward_type
                )));
            }
            _ => {}
        }
    }
    Ok(())
}
