//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront Loyalty API",
        version = "0.1.0",
        description = "Points ledger and tier-progression engine for the storefront.\n\nAccount summaries, transaction history, redemptions, reward tokens, leaderboards, and accrual event intake.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Operations", description = "Health, readiness, and liveness probes"),
        (name = "Loyalty", description = "Accounts, history, redemption, rewards, leaderboard"),
        (name = "Loyalty Events", description = "Accrual triggers from orders, reviews, referrals, and birthdays"),
    ),
    paths(
        // Operations
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
        // Loyalty
        crate::loyalty_rest::handle_program,
        crate::loyalty_rest::handle_account,
        crate::loyalty_rest::handle_deactivate,
        crate::loyalty_rest::handle_transactions,
        crate::loyalty_rest::handle_redeem,
        crate::loyalty_rest::handle_consume,
        crate::loyalty_rest::handle_leaderboard,
        // Events
        crate::loyalty_rest::handle_order_completed,
        crate::loyalty_rest::handle_review_approved,
        crate::loyalty_rest::handle_referral_confirmed,
        crate::loyalty_rest::handle_birthday,
    ),
    components(schemas(
        // REST error/health types
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
        crate::loyalty_rest::ConsumeResponse,
        // Program
        storefront_core::loyalty::ProgramConfiguration,
        storefront_core::loyalty::TierDefinition,
        storefront_core::loyalty::TierProgress,
        storefront_core::loyalty::RewardRate,
        storefront_core::loyalty::RateMode,
        storefront_core::loyalty::RewardType,
        // Accounts and ledger
        storefront_core::loyalty::LoyaltyAccount,
        storefront_core::loyalty::AccountSummary,
        storefront_core::loyalty::LeaderboardEntry,
        storefront_core::loyalty::EntryKind,
        storefront_core::loyalty::LedgerEntry,
        storefront_core::loyalty::EntryPage,
        // Redemption
        storefront_core::loyalty::RedeemRequest,
        storefront_core::loyalty::RewardToken,
        storefront_core::loyalty::RewardValue,
        // Events
        storefront_core::loyalty::OrderCompletedEvent,
        storefront_core::loyalty::ReviewApprovedEvent,
        storefront_core::loyalty::ReferralConfirmedEvent,
        storefront_core::loyalty::BirthdayEvent,
        storefront_core::loyalty::AccrualOutcome,
    ))
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_loyalty_routes() {
        let doc = ApiDoc::openapi();
        for path in [
            "/v1/loyalty/accounts/{user_id}",
            "/v1/loyalty/accounts/{user_id}/redeem",
            "/v1/loyalty/leaderboard",
            "/v1/loyalty/events/order-completed",
            "/health",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
