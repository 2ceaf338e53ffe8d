//! Append-only points ledger for one account.
//!
//! Entries are never mutated or removed; corrections are new offsetting
//! entries. The active balance is computed with lot accounting: every credit
//! is a lot, redemptions draw from the lots live at redemption time
//! (soonest-expiring first), and an EXPIRED entry closes the lot its
//! `reference_id` names. Any part of an EXPIRED debit the named lot cannot
//! cover is drawn like a redemption.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use storefront_core::error::{LoyaltyError, LoyaltyResult};
use storefront_core::loyalty::{EntryKind, EntryPage, HistoryFilter, LedgerEntry};

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;

/// Unspent remainder of one credit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lot {
    pub entry_id: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining: u64,
}

impl Lot {
    fn is_live_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| exp > at)
    }
}

/// Take `owed` points from the lots live at `at`, soonest-expiring first.
fn draw(lots: &mut [Lot], mut owed: u64, at: DateTime<Utc>) {
    let mut live: Vec<&mut Lot> = lots
        .iter_mut()
        .filter(|l| l.remaining > 0 && l.is_live_at(at))
        .collect();
    live.sort_by_key(|l| (l.expires_at.is_none(), l.expires_at, l.entry_id));
    for lot in live {
        if owed == 0 {
            break;
        }
        let take = owed.min(lot.remaining);
        lot.remaining -= take;
        owed -= take;
    }
}

#[derive(Debug, Default, Clone)]
pub struct AccountLedger {
    entries: Vec<LedgerEntry>,
    /// Idempotency key → index into `entries`.
    keys: HashMap<String, usize>,
}

impl AccountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find_by_key(&self, key: &str) -> Option<&LedgerEntry> {
        self.keys.get(key).map(|&i| &self.entries[i])
    }

    /// Check that `entry` could be appended: sign matches kind and its
    /// idempotency key is unused.
    pub fn validate(&self, entry: &LedgerEntry) -> LoyaltyResult<()> {
        if !entry.kind.accepts(entry.points) {
            return Err(LoyaltyError::InvalidPointsKind {
                kind: entry.kind,
                points: entry.points,
            });
        }
        if let Some(key) = &entry.idempotency_key {
            if self.keys.contains_key(key) {
                return Err(LoyaltyError::DuplicateAccrual { key: key.clone() });
            }
        }
        Ok(())
    }

    pub fn append(&mut self, entry: LedgerEntry) -> LoyaltyResult<&LedgerEntry> {
        self.validate(&entry)?;
        let index = self.entries.len();
        if let Some(key) = &entry.idempotency_key {
            self.keys.insert(key.clone(), index);
        }
        self.entries.push(entry);
        Ok(&self.entries[index])
    }

    /// Plain sum of every entry.
    pub fn net_points(&self) -> i64 {
        self.entries.iter().map(|e| e.points).sum()
    }

    /// Replay the entries into lots with their unspent remainders.
    pub fn lots(&self) -> Vec<Lot> {
        let mut lots: Vec<Lot> = Vec::new();

        for entry in &self.entries {
            match entry.kind {
                EntryKind::Earned | EntryKind::Bonus | EntryKind::Referral => lots.push(Lot {
                    entry_id: entry.id,
                    expires_at: entry.expiration_date,
                    remaining: entry.points.unsigned_abs(),
                }),
                EntryKind::Expired => {
                    let mut owed = entry.points.unsigned_abs();
                    let lot_id = entry
                        .reference_id
                        .as_deref()
                        .and_then(|r| r.parse::<u64>().ok());
                    if let Some(lot) = lot_id.and_then(|id| lots.iter_mut().find(|l| l.entry_id == id)) {
                        let take = owed.min(lot.remaining);
                        lot.remaining -= take;
                        owed -= take;
                    }
                    // Whatever the named lot could not cover comes out of
                    // the live lots, same as a redemption.
                    draw(&mut lots, owed, entry.created_at);
                }
                EntryKind::Redeemed => draw(&mut lots, entry.points.unsigned_abs(), entry.created_at),
            }
        }
        lots
    }

    /// Lots that have expired by `as_of` and still hold points that must be
    /// written off.
    pub fn lapsed_lots(&self, as_of: DateTime<Utc>) -> Vec<Lot> {
        self.lots()
            .into_iter()
            .filter(|l| l.remaining > 0 && !l.is_live_at(as_of))
            .collect()
    }

    /// Authoritative balance as of `as_of`. Points in lots that have lapsed
    /// by then no longer count, whether or not an EXPIRED entry was written.
    pub fn active_balance(&self, as_of: DateTime<Utc>) -> u64 {
        let lapsed: u64 = self.lapsed_lots(as_of).iter().map(|l| l.remaining).sum();
        let net = self.net_points() - lapsed as i64;
        net.max(0) as u64
    }

    /// Filtered, paginated history, newest first.
    pub fn query(&self, filter: &HistoryFilter) -> EntryPage {
        let page = filter.page.unwrap_or(1).max(1);
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);

        let mut matched: Vec<&LedgerEntry> = self
            .entries
            .iter()
            .filter(|e| filter.kind.map_or(true, |k| e.kind == k))
            .filter(|e| filter.from.map_or(true, |from| e.created_at >= from))
            .filter(|e| filter.to.map_or(true, |to| e.created_at <= to))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matched.len();
        let items = matched
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect();

        EntryPage {
            items,
            page,
            limit,
            total,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    struct Builder {
        account_id: Uuid,
        next_id: u64,
        now: DateTime<Utc>,
    }

    impl Builder {
        fn new() -> Self {
            Self {
                account_id: Uuid::new_v4(),
                next_id: 1,
                now: Utc::now(),
            }
        }

        fn entry(&mut self, kind: EntryKind, points: i64) -> LedgerEntry {
            let id = self.next_id;
            self.next_id += 1;
            LedgerEntry {
                id,
                account_id: self.account_id,
                kind,
                points,
                description: format!("{kind:?}"),
                reference_id: None,
                expiration_date: None,
                idempotency_key: None,
                created_at: self.now + Duration::seconds(id as i64),
            }
        }
    }

    #[test]
    fn test_rejects_sign_mismatch() {
        let mut b = Builder::new();
        let mut ledger = AccountLedger::new();
        let bad = b.entry(EntryKind::Earned, -5);
        assert!(matches!(
            ledger.append(bad),
            Err(LoyaltyError::InvalidPointsKind { kind: EntryKind::Earned, points: -5 })
        ));
        let zero = b.entry(EntryKind::Redeemed, 0);
        assert!(ledger.append(zero).is_err());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut b = Builder::new();
        let mut ledger = AccountLedger::new();
        let mut first = b.entry(EntryKind::Earned, 100);
        first.idempotency_key = Some("order:42".into());
        let mut second = b.entry(EntryKind::Earned, 100);
        second.idempotency_key = Some("order:42".into());

        ledger.append(first).unwrap();
        assert!(matches!(
            ledger.append(second),
            Err(LoyaltyError::DuplicateAccrual { .. })
        ));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.find_by_key("order:42").unwrap().id, 1);
    }

    #[test]
    fn test_active_balance_excludes_expired_entries() {
        let mut b = Builder::new();
        let mut ledger = AccountLedger::new();
        let mut expiring = b.entry(EntryKind::Earned, 100);
        expiring.expiration_date = Some(b.now + Duration::days(30));
        ledger.append(expiring).unwrap();
        ledger.append(b.entry(EntryKind::Bonus, 50)).unwrap();

        assert_eq!(ledger.active_balance(b.now + Duration::days(1)), 150);
        assert_eq!(ledger.active_balance(b.now + Duration::days(31)), 50);
    }

    #[test]
    fn test_redemption_draws_from_soonest_expiring_lot() {
        let mut b = Builder::new();
        let mut ledger = AccountLedger::new();
        ledger.append(b.entry(EntryKind::Bonus, 100)).unwrap();
        let mut expiring = b.entry(EntryKind::Earned, 100);
        expiring.expiration_date = Some(b.now + Duration::days(30));
        ledger.append(expiring).unwrap();
        ledger.append(b.entry(EntryKind::Redeemed, -120)).unwrap();

        // The expiring lot is drained first, leaving 80 non-expiring points.
        let later = b.now + Duration::days(60);
        assert!(ledger.lapsed_lots(later).is_empty());
        assert_eq!(ledger.active_balance(later), 80);
    }

    #[test]
    fn test_expired_entry_closes_its_lot() {
        let mut b = Builder::new();
        let mut ledger = AccountLedger::new();
        let mut expiring = b.entry(EntryKind::Earned, 100);
        expiring.expiration_date = Some(b.now + Duration::days(30));
        ledger.append(expiring).unwrap();
        ledger.append(b.entry(EntryKind::Redeemed, -40)).unwrap();

        let later = b.now + Duration::days(31);
        let lapsed = ledger.lapsed_lots(later);
        assert_eq!(lapsed.len(), 1);
        assert_eq!(lapsed[0].remaining, 60);

        let mut write_off = b.entry(EntryKind::Expired, -60);
        write_off.reference_id = Some("1".into());
        ledger.append(write_off).unwrap();

        assert!(ledger.lapsed_lots(later).is_empty());
        assert_eq!(ledger.net_points(), 0);
        assert_eq!(ledger.active_balance(later), 0);
    }

    #[test]
    fn test_unreferenced_expired_entry_draws_from_live_lots() {
        let mut b = Builder::new();
        let mut ledger = AccountLedger::new();
        let mut expiring = b.entry(EntryKind::Bonus, 50);
        expiring.expiration_date = Some(b.now + Duration::days(365));
        ledger.append(expiring).unwrap();
        ledger.append(b.entry(EntryKind::Expired, -10)).unwrap();

        let later = b.now + Duration::days(400);
        let lapsed = ledger.lapsed_lots(later);
        assert_eq!(lapsed.len(), 1);
        assert_eq!(lapsed[0].remaining, 40);
        assert_eq!(ledger.active_balance(later), 0);
        assert_eq!(ledger.active_balance(b.now + Duration::days(1)), 40);
    }

    #[test]
    fn test_expired_entry_overflowing_its_lot_draws_the_rest() {
        let mut b = Builder::new();
        let mut ledger = AccountLedger::new();
        let mut small = b.entry(EntryKind::Earned, 20);
        small.expiration_date = Some(b.now + Duration::days(30));
        ledger.append(small).unwrap();
        let mut large = b.entry(EntryKind::Earned, 100);
        large.expiration_date = Some(b.now + Duration::days(60));
        ledger.append(large).unwrap();

        let mut write_off = b.entry(EntryKind::Expired, -30);
        write_off.reference_id = Some("1".into());
        ledger.append(write_off).unwrap();

        let lots = ledger.lots();
        assert_eq!(lots[0].remaining, 0);
        assert_eq!(lots[1].remaining, 90);
        let later = b.now + Duration::days(61);
        assert_eq!(ledger.lapsed_lots(later)[0].remaining, 90);
        assert_eq!(ledger.active_balance(later), 0);
    }

    #[test]
    fn test_query_filters_and_pages_newest_first() {
        let mut b = Builder::new();
        let mut ledger = AccountLedger::new();
        for _ in 0..5 {
            ledger.append(b.entry(EntryKind::Earned, 10)).unwrap();
        }
        ledger.append(b.entry(EntryKind::Redeemed, -20)).unwrap();

        let page = ledger.query(&HistoryFilter {
            kind: Some(EntryKind::Earned),
            page: Some(2),
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, 3);
        assert_eq!(page.items[1].id, 2);

        let all = ledger.query(&HistoryFilter::default());
        assert_eq!(all.limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(all.items[0].kind, EntryKind::Redeemed);

        let windowed = ledger.query(&HistoryFilter {
            from: Some(b.now + Duration::seconds(2)),
            to: Some(b.now + Duration::seconds(4)),
            ..Default::default()
        });
        assert_eq!(windowed.total, 3);

        let clamped = ledger.query(&HistoryFilter {
            limit: Some(10_000),
            ..Default::default()
        });
        assert_eq!(clamped.limit, MAX_PAGE_LIMIT);
    }
}
