//! Loyalty program domain types: points ledger, tier ladder, accounts and
//! reward tokens.
//!
//! - Tiers are half-open `[min, max)` point brackets with an earn multiplier
//! - Every balance change is an immutable `LedgerEntry`
//! - Redemptions spend points for single-use `RewardToken`s

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Benefit that exempts a tier's members from point expiration.
pub const NON_EXPIRING_POINTS: &str = "non_expiring_points";

// ─── Tier System ────────────────────────────────────────────────────────────

/// One bracket of the tier ladder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TierDefinition {
    pub name: String,
    /// Inclusive lower bound.
    pub min_points: u64,
    /// Exclusive upper bound; `None` for the top tier.
    #[serde(default)]
    pub max_points: Option<u64>,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub benefits: BTreeSet<String>,
}

fn default_multiplier() -> f64 {
    1.0
}

impl TierDefinition {
    pub fn new(name: &str, min_points: u64, max_points: Option<u64>, multiplier: f64) -> Self {
        Self {
            name: name.to_string(),
            min_points,
            max_points,
            multiplier,
            benefits: BTreeSet::new(),
        }
    }

    pub fn with_benefits(mut self, benefits: &[&str]) -> Self {
        self.benefits = benefits.iter().map(|b| b.to_string()).collect();
        self
    }

    /// Whether `points` falls inside `[min_points, max_points)`.
    pub fn contains(&self, points: u64) -> bool {
        points >= self.min_points && self.max_points.map_or(true, |max| points < max)
    }

    pub fn has_benefit(&self, benefit: &str) -> bool {
        self.benefits.contains(benefit)
    }
}

/// Progress toward the next tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TierProgress {
    /// 0..=100; always 100 in the top tier.
    pub percentage: u8,
    pub points_needed: u64,
    pub next_tier: Option<String>,
}

// ─── Program Configuration ──────────────────────────────────────────────────

/// Kinds of reward a redemption can produce.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    Discount,
    Product,
    Shipping,
}

/// How redeemed points convert into reward value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RateMode {
    /// Each unit is worth a fixed amount of money.
    FixedAmount { cents_per_unit: u64 },
    /// Each unit is worth a percentage off, capped at `max_percent`.
    Percentage { percent_per_unit: u32, max_percent: u32 },
}

/// One row of the conversion rate table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RewardRate {
    pub reward_type: RewardType,
    pub points_per_unit: u64,
    pub mode: RateMode,
}

/// Program parameters. Passed explicitly to every component that needs them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ProgramConfiguration {
    #[serde(default = "default_program_id")]
    pub program_id: String,
    #[serde(default = "default_program_version")]
    pub version: u32,
    #[serde(default = "default_points_per_currency_unit")]
    pub points_per_currency_unit: f64,
    #[serde(default = "default_welcome_bonus")]
    pub welcome_bonus_points: u64,
    #[serde(default = "default_referral_bonus")]
    pub referral_bonus_points: u64,
    #[serde(default = "default_review_bonus")]
    pub review_bonus_points: u64,
    #[serde(default = "default_birthday_bonus")]
    pub birthday_bonus_points: u64,
    #[serde(default = "default_min_redemption")]
    pub min_redemption_points: u64,
    /// Days until positive entries expire. `None` disables expiration.
    #[serde(default = "default_points_expiry_days")]
    pub points_expiry_days: Option<u32>,
    #[serde(default = "default_reward_validity_days")]
    pub reward_validity_days: u32,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierDefinition>,
    #[serde(default = "default_reward_rates")]
    pub reward_rates: Vec<RewardRate>,
}

fn default_program_id() -> String { "storefront-rewards".to_string() }
fn default_program_version() -> u32 { 1 }
fn default_points_per_currency_unit() -> f64 { 1.0 }
fn default_welcome_bonus() -> u64 { 50 }
fn default_referral_bonus() -> u64 { 500 }
fn default_review_bonus() -> u64 { 50 }
fn default_birthday_bonus() -> u64 { 200 }
fn default_min_redemption() -> u64 { 100 }
fn default_points_expiry_days() -> Option<u32> { Some(365) }
fn default_reward_validity_days() -> u32 { 90 }

fn default_tiers() -> Vec<TierDefinition> {
    vec![
        TierDefinition::new("Bronze", 0, Some(1000), 1.0).with_benefits(&["member_pricing"]),
        TierDefinition::new("Silver", 1000, Some(5000), 1.2)
            .with_benefits(&["member_pricing", "free_shipping_over_50"]),
        TierDefinition::new("Gold", 5000, None, 1.5).with_benefits(&[
            "member_pricing",
            "free_shipping",
            "early_access",
            NON_EXPIRING_POINTS,
        ]),
    ]
}

fn default_reward_rates() -> Vec<RewardRate> {
    // 100 points = $1 across the board.
    [RewardType::Discount, RewardType::Product, RewardType::Shipping]
        .into_iter()
        .map(|reward_type| RewardRate {
            reward_type,
            points_per_unit: 100,
            mode: RateMode::FixedAmount { cents_per_unit: 100 },
        })
        .collect()
}

impl Default for ProgramConfiguration {
    fn default() -> Self {
        Self {
            program_id: default_program_id(),
            version: default_program_version(),
            points_per_currency_unit: default_points_per_currency_unit(),
            welcome_bonus_points: default_welcome_bonus(),
            referral_bonus_points: default_referral_bonus(),
            review_bonus_points: default_review_bonus(),
            birthday_bonus_points: default_birthday_bonus(),
            min_redemption_points: default_min_redemption(),
            points_expiry_days: default_points_expiry_days(),
            reward_validity_days: default_reward_validity_days(),
            tiers: default_tiers(),
            reward_rates: default_reward_rates(),
        }
    }
}

// ─── Ledger ─────────────────────────────────────────────────────────────────

/// Kind of a point-affecting event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Earned,
    Redeemed,
    Expired,
    Bonus,
    Referral,
}

impl EntryKind {
    /// Credits add points; debits remove them.
    pub fn is_credit(&self) -> bool {
        matches!(self, EntryKind::Earned | EntryKind::Bonus | EntryKind::Referral)
    }

    /// Whether `points` has the sign this kind requires. Zero never does.
    pub fn accepts(&self, points: i64) -> bool {
        if self.is_credit() {
            points > 0
        } else {
            points < 0
        }
    }
}

/// Immutable record of one point-affecting event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct LedgerEntry {
    pub id: u64,
    pub account_id: Uuid,
    pub kind: EntryKind,
    pub points: i64,
    pub description: String,
    /// Order id, review id, referred user id, reward code, or expired entry id.
    pub reference_id: Option<String>,
    pub expiration_date: Option<DateTime<Utc>>,
    /// Natural key used to absorb duplicate accruals.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_expired_at(&self, as_of: DateTime<Utc>) -> bool {
        self.expiration_date.map_or(false, |exp| exp <= as_of)
    }
}

/// Filter for transaction history queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistoryFilter {
    #[serde(rename = "type", default)]
    pub kind: Option<EntryKind>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// 1-based page number.
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One page of ledger entries, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EntryPage {
    pub items: Vec<LedgerEntry>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

// ─── Account ────────────────────────────────────────────────────────────────

/// Per-user loyalty aggregate. Derived from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct LoyaltyAccount {
    pub account_id: Uuid,
    pub user_id: String,
    pub program_id: String,
    pub current_points: u64,
    pub total_points_earned: u64,
    pub total_points_redeemed: u64,
    pub current_tier: String,
    pub referral_code: String,
    pub active: bool,
    pub joined_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Account state as presented to the storefront.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AccountSummary {
    pub account: LoyaltyAccount,
    pub tier: TierDefinition,
    pub tier_rank: usize,
    pub progress: TierProgress,
    pub active_balance: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: String,
    pub account_id: Uuid,
    pub current_points: u64,
    pub tier: String,
}

// ─── Rewards ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RewardValue {
    FixedAmount { cents: u64 },
    Percentage { percent: u32 },
}

/// Single-use reward produced by a redemption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct RewardToken {
    pub code: String,
    pub account_id: Uuid,
    pub reward_type: RewardType,
    pub value: RewardValue,
    pub points_spent: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl RewardToken {
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && now < self.expires_at
    }
}

// ─── Requests & Outcomes ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RedeemRequest {
    pub points: u64,
    pub reward_type: RewardType,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderCompletedEvent {
    pub user_id: String,
    pub order_id: String,
    pub order_total_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReviewApprovedEvent {
    pub user_id: String,
    pub review_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReferralConfirmedEvent {
    pub referrer_id: String,
    pub referred_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BirthdayEvent {
    pub user_id: String,
    /// Defaults to today (UTC).
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

/// Result of an accrual trigger. Duplicates are a success, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccrualOutcome {
    Applied { entry: LedgerEntry },
    Duplicate { entry: LedgerEntry },
    Skipped { reason: String },
}

impl AccrualOutcome {
    pub fn entry(&self) -> Option<&LedgerEntry> {
        match self {
            AccrualOutcome::Applied { entry } | AccrualOutcome::Duplicate { entry } => Some(entry),
            AccrualOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AccrualOutcome::Duplicate { .. })
    }
}

// ─── Loyalty Events ─────────────────────────────────────────────────────────

/// Loyalty events emitted to the event sink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoyaltyEventType {
    AccountOpened,
    AccountDeactivated,
    PointsEarned,
    BonusAwarded,
    ReferralAwarded,
    PointsRedeemed,
    PointsExpired,
    TierUpgrade,
    TierDowngrade,
    RewardConsumed,
}

impl LoyaltyEventType {
    pub fn for_entry(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Earned => LoyaltyEventType::PointsEarned,
            EntryKind::Bonus => LoyaltyEventType::BonusAwarded,
            EntryKind::Referral => LoyaltyEventType::ReferralAwarded,
            EntryKind::Redeemed => LoyaltyEventType::PointsRedeemed,
            EntryKind::Expired => LoyaltyEventType::PointsExpired,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoyaltyEvent {
    pub event_id: Uuid,
    pub event_type: LoyaltyEventType,
    pub account_id: Uuid,
    pub user_id: String,
    pub points: Option<i64>,
    pub tier: Option<String>,
    pub reference_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}
