//! Tier classifier: pure functions over an ascending tier ladder.

use std::collections::HashSet;
use storefront_core::error::{LoyaltyError, LoyaltyResult};
use storefront_core::loyalty::{TierDefinition, TierProgress};

/// Check that a tier ladder covers `[0, ∞)` with no gaps or overlaps and
/// that multipliers never decrease with rank.
pub fn validate_tiers(tiers: &[TierDefinition]) -> LoyaltyResult<()> {
    let first = tiers
        .first()
        .ok_or_else(|| LoyaltyError::Configuration("tier list is empty".into()))?;
    if first.min_points != 0 {
        return Err(LoyaltyError::Configuration(format!(
            "first tier '{}' must start at 0 points, starts at {}",
            first.name, first.min_points
        )));
    }

    let mut names = HashSet::new();
    for (i, tier) in tiers.iter().enumerate() {
        if tier.name.trim().is_empty() {
            return Err(LoyaltyError::Configuration(format!("tier {i} has no name")));
        }
        if !names.insert(tier.name.as_str()) {
            return Err(LoyaltyError::Configuration(format!(
                "duplicate tier name '{}'",
                tier.name
            )));
        }
        if !tier.multiplier.is_finite() || tier.multiplier < 1.0 {
            return Err(LoyaltyError::Configuration(format!(
                "tier '{}' multiplier {} must be at least 1.0",
                tier.name, tier.multiplier
            )));
        }

        match (tiers.get(i + 1), tier.max_points) {
            (Some(next), Some(max)) => {
                if max <= tier.min_points {
                    return Err(LoyaltyError::Configuration(format!(
                        "tier '{}' has an empty range [{}, {})",
                        tier.name, tier.min_points, max
                    )));
                }
                if max != next.min_points {
                    return Err(LoyaltyError::Configuration(format!(
                        "tier '{}' ends at {} but '{}' starts at {}",
                        tier.name, max, next.name, next.min_points
                    )));
                }
                if next.multiplier < tier.multiplier {
                    return Err(LoyaltyError::Configuration(format!(
                        "tier '{}' multiplier is lower than '{}'",
                        next.name, tier.name
                    )));
                }
            }
            (Some(_), None) => {
                return Err(LoyaltyError::Configuration(format!(
                    "unbounded tier '{}' must be the last tier",
                    tier.name
                )));
            }
            (None, Some(max)) => {
                return Err(LoyaltyError::Configuration(format!(
                    "top tier '{}' must be unbounded, ends at {}",
                    tier.name, max
                )));
            }
            (None, None) => {}
        }
    }
    Ok(())
}

/// Index of the tier `points` falls into. Ranges are half-open, so exactly
/// reaching the next tier's `min_points` promotes.
pub fn rank_of(points: u64, tiers: &[TierDefinition]) -> LoyaltyResult<usize> {
    let Some(first) = tiers.first() else {
        return Err(LoyaltyError::NoTierConfigured { points });
    };
    if first.min_points != 0 {
        return Err(LoyaltyError::NoTierConfigured { points });
    }

    if let Some(rank) = tiers.iter().position(|t| t.contains(points)) {
        return Ok(rank);
    }

    // Past the last bounded tier: the top tier absorbs everything above it.
    let last = tiers.len() - 1;
    if points >= tiers[last].min_points {
        Ok(last)
    } else {
        Err(LoyaltyError::NoTierConfigured { points })
    }
}

/// The tier `points` falls into.
pub fn classify(points: u64, tiers: &[TierDefinition]) -> LoyaltyResult<&TierDefinition> {
    rank_of(points, tiers).map(|rank| &tiers[rank])
}

/// Progress from the current tier's floor toward the next tier's floor.
pub fn progress_to_next_tier(points: u64, tiers: &[TierDefinition]) -> LoyaltyResult<TierProgress> {
    let rank = rank_of(points, tiers)?;
    let current = &tiers[rank];

    let Some(next) = tiers.get(rank + 1) else {
        return Ok(TierProgress {
            percentage: 100,
            points_needed: 0,
            next_tier: None,
        });
    };

    let span = next.min_points.saturating_sub(current.min_points) as u128;
    let earned = points.saturating_sub(current.min_points) as u128;
    let percentage = if span == 0 {
        100
    } else {
        (earned * 100 / span).min(100) as u8
    };

    Ok(TierProgress {
        percentage,
        points_needed: next.min_points.saturating_sub(points),
        next_tier: Some(next.name.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Vec<TierDefinition> {
        vec![
            TierDefinition::new("Bronze", 0, Some(1000), 1.0),
            TierDefinition::new("Silver", 1000, Some(5000), 1.2),
            TierDefinition::new("Gold", 5000, None, 1.5),
        ]
    }

    #[test]
    fn test_boundary_promotes() {
        let tiers = ladder();
        assert_eq!(classify(0, &tiers).unwrap().name, "Bronze");
        assert_eq!(classify(999, &tiers).unwrap().name, "Bronze");
        assert_eq!(classify(1000, &tiers).unwrap().name, "Silver");
        assert_eq!(classify(4999, &tiers).unwrap().name, "Silver");
        assert_eq!(classify(5000, &tiers).unwrap().name, "Gold");
        assert_eq!(classify(u64::MAX, &tiers).unwrap().name, "Gold");
    }

    #[test]
    fn test_empty_ladder_is_not_configured() {
        assert!(matches!(
            classify(10, &[]),
            Err(LoyaltyError::NoTierConfigured { points: 10 })
        ));
        let missing_zero = vec![TierDefinition::new("Silver", 100, None, 1.2)];
        assert!(matches!(
            rank_of(0, &missing_zero),
            Err(LoyaltyError::NoTierConfigured { .. })
        ));
    }

    #[test]
    fn test_top_tier_absorbs_points_above_bounded_last_tier() {
        let tiers = vec![
            TierDefinition::new("Bronze", 0, Some(100), 1.0),
            TierDefinition::new("Silver", 100, Some(200), 1.1),
        ];
        assert_eq!(classify(500, &tiers).unwrap().name, "Silver");
    }

    #[test]
    fn test_progress() {
        let tiers = ladder();
        let p = progress_to_next_tier(500, &tiers).unwrap();
        assert_eq!(p.percentage, 50);
        assert_eq!(p.points_needed, 500);
        assert_eq!(p.next_tier.as_deref(), Some("Silver"));

        let p = progress_to_next_tier(3000, &tiers).unwrap();
        assert_eq!(p.percentage, 50);
        assert_eq!(p.points_needed, 2000);

        let top = progress_to_next_tier(9000, &tiers).unwrap();
        assert_eq!(top.percentage, 100);
        assert_eq!(top.points_needed, 0);
        assert!(top.next_tier.is_none());
    }

    #[test]
    fn test_validate_accepts_default_ladder() {
        assert!(validate_tiers(&ladder()).is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_ladders() {
        assert!(validate_tiers(&[]).is_err());

        let gap = vec![
            TierDefinition::new("Bronze", 0, Some(900), 1.0),
            TierDefinition::new("Silver", 1000, None, 1.2),
        ];
        assert!(validate_tiers(&gap).is_err());

        let bounded_top = vec![TierDefinition::new("Bronze", 0, Some(900), 1.0)];
        assert!(validate_tiers(&bounded_top).is_err());

        let shrinking = vec![
            TierDefinition::new("Bronze", 0, Some(1000), 1.3),
            TierDefinition::new("Silver", 1000, None, 1.2),
        ];
        assert!(validate_tiers(&shrinking).is_err());

        let low_multiplier = vec![TierDefinition::new("Bronze", 0, None, 0.5)];
        assert!(validate_tiers(&low_multiplier).is_err());

        let duplicate = vec![
            TierDefinition::new("Bronze", 0, Some(1000), 1.0),
            TierDefinition::new("Bronze", 1000, None, 1.2),
        ];
        assert!(validate_tiers(&duplicate).is_err());
    }
}
