//! Core loyalty engine: account directory, ledger appends, redemption,
//! reward consumption, expiration sweeps, leaderboards, and journal replay.
//!
//! Every mutation of an account happens while holding that account's
//! mutex, and is journaled before it is applied in memory. Events are
//! emitted after the lock is released.

use crate::account::{AccountSlot, TierChange};
use crate::journal::{Journal, JournalRecord, MemoryJournal};
use crate::program::Program;
use crate::redemption::{random_code, RedemptionAttempt, RewardVault};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use storefront_core::error::{LoyaltyError, LoyaltyResult};
use storefront_core::event_bus::{make_event, noop_sink, EventSink};
use storefront_core::loyalty::*;
use tracing::{debug, info, warn};
use uuid::Uuid;

const REFERRAL_CODE_LEN: usize = 8;

type SharedSlot = Arc<Mutex<AccountSlot>>;

/// Fields of a ledger entry the caller chooses; the engine fills in id,
/// account, expiration and timestamp.
pub(crate) struct EntryDraft {
    pub kind: EntryKind,
    pub points: i64,
    pub description: String,
    pub reference_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub expiration_date: Option<DateTime<Utc>>,
}

/// A cached balance that disagrees with the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceMismatch {
    pub user_id: String,
    pub cached: u64,
    pub active: u64,
}

/// Outcome of one expiration sweep across all accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub accounts_swept: usize,
    pub entries_written: usize,
    /// Users whose write-off failed. The next sweep retries them.
    pub failed: Vec<String>,
}

/// Loyalty program engine.
pub struct LoyaltyEngine {
    program: Arc<Program>,
    journal: Arc<dyn Journal>,
    sink: Arc<dyn EventSink>,
    /// user id → account slot
    accounts: DashMap<String, SharedSlot>,
    /// account id → user id
    account_users: DashMap<Uuid, String>,
    /// referral code → user id
    referral_codes: DashMap<String, String>,
    rewards: RewardVault,
    next_entry_id: AtomicU64,
}

impl LoyaltyEngine {
    /// Build the engine and rebuild state by replaying `journal`.
    pub fn new(
        program: Arc<Program>,
        journal: Arc<dyn Journal>,
        sink: Arc<dyn EventSink>,
    ) -> LoyaltyResult<Self> {
        let engine = Self {
            program,
            journal,
            sink,
            accounts: DashMap::new(),
            account_users: DashMap::new(),
            referral_codes: DashMap::new(),
            rewards: RewardVault::new(),
            next_entry_id: AtomicU64::new(1),
        };

        let records = engine.journal.replay()?;
        let replayed = records.len();
        for record in records {
            engine.restore(record)?;
        }

        info!(
            program = %engine.program.program_id(),
            records = replayed,
            accounts = engine.accounts.len(),
            rewards = engine.rewards.len(),
            "Loyalty engine initialized"
        );
        Ok(engine)
    }

    /// Engine over a fresh in-memory journal with no event consumers.
    pub fn in_memory(program: Program) -> Self {
        Self {
            program: Arc::new(program),
            journal: Arc::new(MemoryJournal::new()),
            sink: noop_sink(),
            accounts: DashMap::new(),
            account_users: DashMap::new(),
            referral_codes: DashMap::new(),
            rewards: RewardVault::new(),
            next_entry_id: AtomicU64::new(1),
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    // ─── Accounts ───────────────────────────────────────────────────────────

    /// Fetch the user's account, opening it (with the welcome bonus) on
    /// first use. Never grants the welcome bonus twice.
    pub fn get_or_create(&self, user_id: &str) -> LoyaltyResult<LoyaltyAccount> {
        loop {
            if let Some(slot) = self.lookup(user_id) {
                let mut events = Vec::new();
                let account = {
                    let mut guard = slot.lock();
                    if !guard.is_confirmed() {
                        // Its opener failed and withdrew it.
                        continue;
                    }
                    self.settle_locked(&mut guard, Utc::now(), &mut events);
                    guard.account().clone()
                };
                self.publish(events);
                return Ok(account);
            }
            if let Some(account) = self.try_open(user_id)? {
                return Ok(account);
            }
        }
    }

    /// Publish a locked placeholder slot, then journal the opening under the
    /// account's own mutex so the directory shard is free during I/O.
    /// `None` if another caller published a slot first.
    fn try_open(&self, user_id: &str) -> LoyaltyResult<Option<LoyaltyAccount>> {
        let now = Utc::now();
        let referral_code = self.reserve_referral_code(user_id);
        let slot: SharedSlot = Arc::new(Mutex::new(AccountSlot::open(
            user_id,
            &self.program,
            referral_code.clone(),
            now,
        )));
        let mut guard = slot.lock();

        let published = match self.accounts.entry(user_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(slot.clone());
                true
            }
        };
        if !published {
            self.referral_codes.remove(&referral_code);
            return Ok(None);
        }

        let mut events = Vec::new();
        if let Err(e) = self.open_account(&mut guard, now, &mut events) {
            self.accounts.remove_if(user_id, |_, s| Arc::ptr_eq(s, &slot));
            self.referral_codes.remove(&referral_code);
            return Err(e);
        }
        let account = guard.account().clone();
        drop(guard);

        self.publish(events);
        Ok(Some(account))
    }

    /// Journal and confirm a placeholder slot. The caller holds its lock.
    fn open_account(
        &self,
        slot: &mut AccountSlot,
        now: DateTime<Utc>,
        events: &mut Vec<LoyaltyEvent>,
    ) -> LoyaltyResult<()> {
        let welcome_points = self.program.config().welcome_bonus_points;
        let welcome = (welcome_points > 0).then(|| {
            self.build_entry(
                slot,
                EntryDraft {
                    kind: EntryKind::Bonus,
                    points: welcome_points as i64,
                    description: "Welcome bonus".into(),
                    reference_id: None,
                    idempotency_key: Some("welcome".into()),
                    expiration_date: self
                        .program
                        .expiration_for(now, self.program.tier_for(0)),
                },
                now,
            )
        });

        self.journal.append(&JournalRecord::AccountOpened {
            account: slot.account().clone(),
            welcome: welcome.clone(),
        })?;
        slot.confirm();

        let user_id = slot.account().user_id.clone();
        self.account_users.insert(slot.account_id(), user_id.clone());
        events.push(make_event(
            LoyaltyEventType::AccountOpened,
            slot.account_id(),
            &user_id,
            None,
            Some(slot.account().current_tier.clone()),
            None,
        ));
        if let Some(entry) = welcome {
            let change = slot.apply_entry(entry.clone(), &self.program)?;
            self.entry_events(slot, &entry, change, events);
        }

        metrics::counter!("loyalty.accounts_opened").increment(1);
        info!(
            user_id = %user_id,
            account_id = %slot.account_id(),
            welcome = welcome_points,
            "Loyalty account opened"
        );
        Ok(())
    }

    fn reserve_referral_code(&self, user_id: &str) -> String {
        loop {
            let code = random_code(REFERRAL_CODE_LEN);
            if let Entry::Vacant(vacant) = self.referral_codes.entry(code.clone()) {
                vacant.insert(user_id.to_string());
                return code;
            }
        }
    }

    /// Current account state. Lapsed lots are written off first.
    pub fn account(&self, user_id: &str) -> LoyaltyResult<LoyaltyAccount> {
        self.with_settled(user_id, Utc::now(), |slot| slot.account().clone())
    }

    pub fn account_by_id(&self, account_id: Uuid) -> LoyaltyResult<LoyaltyAccount> {
        self.account(&self.user_for(account_id)?)
    }

    pub fn account_for_referral_code(&self, code: &str) -> LoyaltyResult<LoyaltyAccount> {
        let user_id = self
            .referral_codes
            .get(&code.to_ascii_uppercase())
            .map(|u| u.clone())
            .ok_or_else(|| LoyaltyError::AccountNotFound(format!("referral code {code}")))?;
        self.account(&user_id)
    }

    /// Soft-deactivate. The account and its ledger are kept for audit.
    pub fn deactivate(&self, user_id: &str) -> LoyaltyResult<LoyaltyAccount> {
        let (account, changed) = self.with_slot(user_id, |slot| {
            if !slot.account().active {
                return Ok((slot.account().clone(), false));
            }
            let now = Utc::now();
            self.journal.append(&JournalRecord::AccountDeactivated {
                account_id: slot.account_id(),
                at: now,
            })?;
            slot.deactivate(now);
            Ok((slot.account().clone(), true))
        })?;

        if changed {
            self.sink.emit(make_event(
                LoyaltyEventType::AccountDeactivated,
                account.account_id,
                &account.user_id,
                None,
                None,
                None,
            ));
            info!(user_id = user_id, "Loyalty account deactivated");
        }
        Ok(account)
    }

    /// Tier, progress and balance are derived from the active balance.
    pub fn summary(&self, user_id: &str) -> LoyaltyResult<AccountSummary> {
        self.get_or_create(user_id)?;
        let now = Utc::now();
        let (account, active_balance) = self.with_settled(user_id, now, |slot| {
            (slot.account().clone(), slot.ledger().active_balance(now))
        })?;

        let tier_rank = self.program.tier_rank(active_balance);
        Ok(AccountSummary {
            tier: self.program.tiers()[tier_rank].clone(),
            tier_rank,
            progress: self.program.progress(active_balance),
            active_balance,
            account,
        })
    }

    /// Top `limit` active accounts by active balance, optionally limited to
    /// one tier. Ties go to the earlier member.
    pub fn leaderboard(&self, limit: usize, tier: Option<&str>) -> Vec<LeaderboardEntry> {
        let now = Utc::now();
        let slots: Vec<SharedSlot> = self.accounts.iter().map(|e| e.value().clone()).collect();

        let mut rows: Vec<(LoyaltyAccount, u64)> = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut events = Vec::new();
            let row = {
                let mut guard = slot.lock();
                if guard.is_confirmed() && guard.account().active {
                    self.settle_locked(&mut guard, now, &mut events);
                    Some((guard.account().clone(), guard.ledger().active_balance(now)))
                } else {
                    None
                }
            };
            self.publish(events);
            rows.extend(row);
        }

        let mut ranked: Vec<(LoyaltyAccount, u64, String)> = rows
            .into_iter()
            .map(|(account, points)| {
                let tier_name = self.program.tier_for(points).name.clone();
                (account, points, tier_name)
            })
            .filter(|(_, _, name)| tier.map_or(true, |t| name.eq_ignore_ascii_case(t)))
            .collect();
        ranked.sort_by(|(a, a_points, _), (b, b_points, _)| {
            b_points
                .cmp(a_points)
                .then(a.joined_at.cmp(&b.joined_at))
                .then(a.user_id.cmp(&b.user_id))
        });

        ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, (a, points, tier_name))| LeaderboardEntry {
                rank: i + 1,
                user_id: a.user_id,
                account_id: a.account_id,
                current_points: points,
                tier: tier_name,
            })
            .collect()
    }

    // ─── Ledger ─────────────────────────────────────────────────────────────

    /// Append a ledger entry for an existing account. Credits are stamped
    /// with the program's expiration unless `expiration_date` is given.
    pub fn append(
        &self,
        user_id: &str,
        kind: EntryKind,
        points: i64,
        description: &str,
        reference_id: Option<String>,
        expiration_date: Option<DateTime<Utc>>,
    ) -> LoyaltyResult<LedgerEntry> {
        if !kind.accepts(points) {
            return Err(LoyaltyError::InvalidPointsKind { kind, points });
        }
        let mut events = Vec::new();
        let result = self.with_slot(user_id, |slot| {
            self.append_locked(
                slot,
                EntryDraft {
                    kind,
                    points,
                    description: description.to_string(),
                    reference_id,
                    idempotency_key: None,
                    expiration_date,
                },
                Utc::now(),
                &mut events,
            )
        });
        self.publish(events);
        result
    }

    /// History page, newest first. Lapsed lots are written off first so
    /// their EXPIRED entries show up.
    pub fn entries_for(&self, user_id: &str, filter: &HistoryFilter) -> LoyaltyResult<EntryPage> {
        self.with_settled(user_id, Utc::now(), |slot| slot.ledger().query(filter))
    }

    pub fn active_balance(&self, user_id: &str, as_of: DateTime<Utc>) -> LoyaltyResult<u64> {
        self.with_slot(user_id, |slot| Ok(slot.ledger().active_balance(as_of)))
    }

    /// Accounts whose cached balance differs from the ledger as of `as_of`.
    pub fn verify_consistency(&self, as_of: DateTime<Utc>) -> Vec<BalanceMismatch> {
        let slots: Vec<SharedSlot> = self.accounts.iter().map(|e| e.value().clone()).collect();
        slots
            .iter()
            .filter_map(|slot| {
                let guard = slot.lock();
                if !guard.is_confirmed() {
                    return None;
                }
                let cached = guard.account().current_points;
                let active = guard.ledger().active_balance(as_of);
                (cached != active).then(|| BalanceMismatch {
                    user_id: guard.account().user_id.clone(),
                    cached,
                    active,
                })
            })
            .collect()
    }

    /// Write off lapsed points on every account. A failing account is
    /// logged and skipped; the rest are still swept.
    pub fn expire_points(&self, as_of: DateTime<Utc>) -> SweepReport {
        let slots: Vec<SharedSlot> = self.accounts.iter().map(|e| e.value().clone()).collect();
        let mut report = SweepReport::default();

        for slot in slots {
            let mut events = Vec::new();
            let (user_id, result) = {
                let mut guard = slot.lock();
                if !guard.is_confirmed() {
                    continue;
                }
                let user_id = guard.account().user_id.clone();
                (user_id, self.sweep_locked(&mut guard, as_of, &mut events))
            };
            self.publish(events);

            report.accounts_swept += 1;
            match result {
                Ok(written) => report.entries_written += written,
                Err(e) => {
                    metrics::counter!("loyalty.sweep_failures").increment(1);
                    warn!(user_id = %user_id, error = %e, "Expiration sweep failed for account");
                    report.failed.push(user_id);
                }
            }
        }

        if report.entries_written > 0 || !report.failed.is_empty() {
            info!(
                accounts = report.accounts_swept,
                entries = report.entries_written,
                failed = report.failed.len(),
                "Expired lapsed points"
            );
        }
        report
    }

    // ─── Redemption ─────────────────────────────────────────────────────────

    /// Spend `points` for a reward. Validation and commit happen under one
    /// hold of the account lock; a rejection leaves nothing behind.
    pub fn redeem(
        &self,
        account_id: Uuid,
        points: u64,
        reward_type: RewardType,
        metadata: BTreeMap<String, String>,
    ) -> LoyaltyResult<RewardToken> {
        let user_id = self.user_for(account_id)?;
        let slot = self.slot(&user_id)?;
        let mut attempt = RedemptionAttempt::new(account_id, points, reward_type);
        let mut events = Vec::new();

        let result = {
            let mut guard = slot.lock();
            self.redeem_locked(&mut guard, &mut attempt, metadata, Utc::now(), &mut events)
        };
        self.publish(events);

        match &result {
            Ok(token) => {
                metrics::counter!("loyalty.redemptions").increment(1);
                info!(
                    user_id = %user_id,
                    points = points,
                    reward_type = ?reward_type,
                    code = %token.code,
                    "Points redeemed"
                );
            }
            Err(e) => {
                attempt.reject();
                metrics::counter!("loyalty.redemptions_rejected").increment(1);
                warn!(user_id = %user_id, points = points, error = %e, "Redemption rejected");
            }
        }
        result
    }

    pub fn redeem_for_user(&self, user_id: &str, request: RedeemRequest) -> LoyaltyResult<RewardToken> {
        let account_id = self.with_slot(user_id, |slot| Ok(slot.account_id()))?;
        self.redeem(account_id, request.points, request.reward_type, request.metadata)
    }

    fn redeem_locked(
        &self,
        slot: &mut AccountSlot,
        attempt: &mut RedemptionAttempt,
        metadata: BTreeMap<String, String>,
        now: DateTime<Utc>,
        events: &mut Vec<LoyaltyEvent>,
    ) -> LoyaltyResult<RewardToken> {
        slot.ensure_active()?;
        self.sweep_locked(slot, now, events)?;

        let available = slot.ledger().active_balance(now);
        let value = attempt.validate(&self.program, available)?;
        debug!(account_id = %attempt.account_id, state = ?attempt.state(), "Redemption validated");

        let token = self.rewards.mint(
            attempt.account_id,
            attempt.reward_type,
            value,
            attempt.points,
            metadata,
            now,
            self.program.reward_expiry(now),
        );
        if let Err(e) = self.commit_redemption(slot, attempt, &token, now, events) {
            self.rewards.release(&token.code);
            return Err(e);
        }
        Ok(token)
    }

    /// Journal the debit together with its token, then apply both.
    fn commit_redemption(
        &self,
        slot: &mut AccountSlot,
        attempt: &mut RedemptionAttempt,
        token: &RewardToken,
        now: DateTime<Utc>,
        events: &mut Vec<LoyaltyEvent>,
    ) -> LoyaltyResult<()> {
        let entry = self.build_entry(
            slot,
            EntryDraft {
                kind: EntryKind::Redeemed,
                points: -(attempt.points as i64),
                description: format!("Redeemed for {:?} reward", attempt.reward_type),
                reference_id: Some(token.code.clone()),
                idempotency_key: None,
                expiration_date: None,
            },
            now,
        );

        slot.check_entry(&entry)?;
        self.journal.append(&JournalRecord::RewardIssued {
            entry: entry.clone(),
            token: token.clone(),
        })?;
        let change = slot.apply_entry(entry.clone(), &self.program)?;
        self.rewards.insert(token.clone());
        attempt.commit();

        metrics::counter!("loyalty.points_redeemed").increment(attempt.points);
        self.entry_events(slot, &entry, change, events);
        Ok(())
    }

    /// Use a reward token. `false` if unknown, already used, or expired.
    pub fn consume_reward(&self, code: &str) -> LoyaltyResult<bool> {
        let now = Utc::now();
        let consumed = self.rewards.consume(code, now, |token| {
            self.journal.append(&JournalRecord::RewardConsumed {
                code: token.code.clone(),
                account_id: token.account_id,
                consumed_at: now,
            })
        })?;

        let Some(token) = consumed else {
            return Ok(false);
        };
        metrics::counter!("loyalty.rewards_consumed").increment(1);
        if let Ok(user_id) = self.user_for(token.account_id) {
            self.sink.emit(make_event(
                LoyaltyEventType::RewardConsumed,
                token.account_id,
                user_id,
                None,
                None,
                Some(token.code.clone()),
            ));
        }
        Ok(true)
    }

    pub fn reward(&self, code: &str) -> Option<RewardToken> {
        self.rewards.get(code)
    }

    pub fn rewards_for(&self, user_id: &str) -> LoyaltyResult<Vec<RewardToken>> {
        let account_id = self.with_slot(user_id, |slot| Ok(slot.account_id()))?;
        Ok(self.rewards.for_account(account_id))
    }

    // ─── Internals ──────────────────────────────────────────────────────────

    fn lookup(&self, user_id: &str) -> Option<SharedSlot> {
        self.accounts.get(user_id).map(|s| s.value().clone())
    }

    /// Clone the slot handle out of the directory so the directory shard is
    /// never held while an account lock is taken.
    fn slot(&self, user_id: &str) -> LoyaltyResult<SharedSlot> {
        self.lookup(user_id)
            .ok_or_else(|| LoyaltyError::AccountNotFound(user_id.to_string()))
    }

    /// Lock the user's slot and run `f` under the lock. A slot withdrawn
    /// after a failed opening reads as missing.
    pub(crate) fn with_slot<R, F>(&self, user_id: &str, f: F) -> LoyaltyResult<R>
    where
        F: FnOnce(&mut AccountSlot) -> LoyaltyResult<R>,
    {
        let slot = self.slot(user_id)?;
        let mut guard = slot.lock();
        if !guard.is_confirmed() {
            return Err(LoyaltyError::AccountNotFound(user_id.to_string()));
        }
        f(&mut *guard)
    }

    /// `with_slot` for reads: lapsed lots are written off before `f` sees
    /// the account, and the resulting events go out after the lock drops.
    fn with_settled<R, F>(&self, user_id: &str, now: DateTime<Utc>, f: F) -> LoyaltyResult<R>
    where
        F: FnOnce(&AccountSlot) -> R,
    {
        let mut events = Vec::new();
        let result = self.with_slot(user_id, |slot| {
            self.settle_locked(slot, now, &mut events);
            Ok(f(slot))
        });
        self.publish(events);
        result
    }

    /// Sweep before a read. A failed write-off is logged and the read goes
    /// ahead on the ledger as it stands.
    fn settle_locked(&self, slot: &mut AccountSlot, now: DateTime<Utc>, events: &mut Vec<LoyaltyEvent>) {
        if let Err(e) = self.sweep_locked(slot, now, events) {
            warn!(user_id = %slot.account().user_id, error = %e, "Write-off of lapsed points failed");
        }
    }

    fn user_for(&self, account_id: Uuid) -> LoyaltyResult<String> {
        self.account_users
            .get(&account_id)
            .map(|u| u.clone())
            .ok_or_else(|| LoyaltyError::AccountNotFound(account_id.to_string()))
    }

    pub(crate) fn build_entry(
        &self,
        slot: &AccountSlot,
        draft: EntryDraft,
        now: DateTime<Utc>,
    ) -> LedgerEntry {
        LedgerEntry {
            id: self.next_entry_id.fetch_add(1, Ordering::SeqCst),
            account_id: slot.account_id(),
            kind: draft.kind,
            points: draft.points,
            description: draft.description,
            reference_id: draft.reference_id,
            expiration_date: draft.expiration_date,
            idempotency_key: draft.idempotency_key,
            created_at: now,
        }
    }

    /// Journal then apply one entry. The caller holds the account lock.
    pub(crate) fn commit_locked(
        &self,
        slot: &mut AccountSlot,
        entry: LedgerEntry,
        events: &mut Vec<LoyaltyEvent>,
    ) -> LoyaltyResult<LedgerEntry> {
        slot.check_entry(&entry)?;
        self.journal.append(&JournalRecord::EntryAppended {
            entry: entry.clone(),
        })?;
        let change = slot.apply_entry(entry.clone(), &self.program)?;

        let magnitude = entry.points.unsigned_abs();
        match entry.kind {
            EntryKind::Earned | EntryKind::Bonus | EntryKind::Referral => {
                metrics::counter!("loyalty.points_earned").increment(magnitude)
            }
            EntryKind::Expired => metrics::counter!("loyalty.points_expired").increment(magnitude),
            EntryKind::Redeemed => metrics::counter!("loyalty.points_redeemed").increment(magnitude),
        }
        self.entry_events(slot, &entry, change, events);
        Ok(entry)
    }

    /// Sweep, then append a caller-drafted entry. Credits without an explicit
    /// expiration get the program's.
    pub(crate) fn append_locked(
        &self,
        slot: &mut AccountSlot,
        mut draft: EntryDraft,
        now: DateTime<Utc>,
        events: &mut Vec<LoyaltyEvent>,
    ) -> LoyaltyResult<LedgerEntry> {
        slot.ensure_active()?;
        self.sweep_locked(slot, now, events)?;
        if draft.kind.is_credit() && draft.expiration_date.is_none() {
            let tier = self.program.tier_for(slot.account().current_points);
            draft.expiration_date = self.program.expiration_for(now, tier);
        }
        let entry = self.build_entry(slot, draft, now);
        self.commit_locked(slot, entry, events)
    }

    /// Write one EXPIRED entry per lapsed lot. The caller holds the lock.
    pub(crate) fn sweep_locked(
        &self,
        slot: &mut AccountSlot,
        as_of: DateTime<Utc>,
        events: &mut Vec<LoyaltyEvent>,
    ) -> LoyaltyResult<usize> {
        let lapsed = slot.ledger().lapsed_lots(as_of);
        let count = lapsed.len();
        for lot in lapsed {
            let entry = self.build_entry(
                slot,
                EntryDraft {
                    kind: EntryKind::Expired,
                    points: -(lot.remaining as i64),
                    description: "Points expired".into(),
                    reference_id: Some(lot.entry_id.to_string()),
                    idempotency_key: Some(format!("expire:{}", lot.entry_id)),
                    expiration_date: None,
                },
                as_of,
            );
            self.commit_locked(slot, entry, events)?;
        }
        if count > 0 {
            debug!(user_id = %slot.account().user_id, lots = count, "Lapsed lots expired");
        }
        Ok(count)
    }

    pub(crate) fn entry_events(
        &self,
        slot: &AccountSlot,
        entry: &LedgerEntry,
        change: Option<TierChange>,
        events: &mut Vec<LoyaltyEvent>,
    ) {
        let account = slot.account();
        events.push(make_event(
            LoyaltyEventType::for_entry(entry.kind),
            account.account_id,
            &account.user_id,
            Some(entry.points),
            Some(account.current_tier.clone()),
            entry.reference_id.clone(),
        ));
        if let Some(change) = change {
            let event_type = if change.upgrade {
                LoyaltyEventType::TierUpgrade
            } else {
                LoyaltyEventType::TierDowngrade
            };
            events.push(make_event(
                event_type,
                account.account_id,
                &account.user_id,
                None,
                Some(change.to),
                None,
            ));
        }
    }

    pub(crate) fn publish(&self, events: Vec<LoyaltyEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    // ─── Replay ─────────────────────────────────────────────────────────────

    fn restore(&self, record: JournalRecord) -> LoyaltyResult<()> {
        match record {
            JournalRecord::AccountOpened { account, welcome } => {
                let user_id = account.user_id.clone();
                self.referral_codes
                    .insert(account.referral_code.clone(), user_id.clone());
                self.account_users
                    .insert(account.account_id, user_id.clone());
                let mut slot = AccountSlot::restore(account);
                if let Some(entry) = welcome {
                    self.restore_entry(&mut slot, entry)?;
                }
                self.accounts.insert(user_id, Arc::new(Mutex::new(slot)));
            }
            JournalRecord::EntryAppended { entry } => {
                let slot = self.slot(&self.user_for(entry.account_id)?)?;
                let mut guard = slot.lock();
                self.restore_entry(&mut guard, entry)?;
            }
            JournalRecord::RewardIssued { entry, token } => {
                let slot = self.slot(&self.user_for(entry.account_id)?)?;
                let mut guard = slot.lock();
                self.restore_entry(&mut guard, entry)?;
                self.rewards.insert(token);
            }
            JournalRecord::RewardConsumed { code, .. } => {
                if !self.rewards.mark_consumed(&code) {
                    return Err(LoyaltyError::Journal(format!(
                        "consumption of unknown reward {code}"
                    )));
                }
            }
            JournalRecord::AccountDeactivated { account_id, at } => {
                let slot = self.slot(&self.user_for(account_id)?)?;
                slot.lock().deactivate(at);
            }
        }
        Ok(())
    }

    fn restore_entry(&self, slot: &mut AccountSlot, entry: LedgerEntry) -> LoyaltyResult<()> {
        let id = entry.id;
        self.next_entry_id.fetch_max(id + 1, Ordering::SeqCst);
        slot.apply_entry(entry, &self.program)
            .map(|_| ())
            .map_err(|e| LoyaltyError::Journal(format!("replay rejected entry {id}: {e}")))
    }
}
