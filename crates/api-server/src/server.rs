//! API server: REST router, Swagger UI, and the Prometheus exporter.

use crate::loyalty_rest::{self, LoyaltyState};
use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use storefront_core::config::AppConfig;
use storefront_loyalty::LoyaltyEngine;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Build the full HTTP router.
pub fn router(state: AppState, leaderboard_max: usize) -> Router {
    let loyalty = LoyaltyState {
        engine: state.engine.clone(),
        leaderboard_max,
    };

    let loyalty_routes = Router::new()
        .route("/v1/loyalty/program", get(loyalty_rest::handle_program))
        .route(
            "/v1/loyalty/accounts/:user_id",
            get(loyalty_rest::handle_account).delete(loyalty_rest::handle_deactivate),
        )
        .route(
            "/v1/loyalty/accounts/:user_id/transactions",
            get(loyalty_rest::handle_transactions),
        )
        .route(
            "/v1/loyalty/accounts/:user_id/redeem",
            post(loyalty_rest::handle_redeem),
        )
        .route(
            "/v1/loyalty/rewards/:code/consume",
            post(loyalty_rest::handle_consume),
        )
        .route("/v1/loyalty/leaderboard", get(loyalty_rest::handle_leaderboard))
        .route(
            "/v1/loyalty/events/order-completed",
            post(loyalty_rest::handle_order_completed),
        )
        .route(
            "/v1/loyalty/events/review-approved",
            post(loyalty_rest::handle_review_approved),
        )
        .route(
            "/v1/loyalty/events/referral-confirmed",
            post(loyalty_rest::handle_referral_confirmed),
        )
        .route("/v1/loyalty/events/birthday", post(loyalty_rest::handle_birthday))
        .with_state(loyalty);

    Router::new()
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .with_state(state)
        .merge(loyalty_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Main API server.
pub struct ApiServer {
    config: AppConfig,
    engine: Arc<LoyaltyEngine>,
}

impl ApiServer {
    pub fn new(config: AppConfig, engine: Arc<LoyaltyEngine>) -> Self {
        Self { config, engine }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let state = AppState {
            engine: self.engine.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };
        let app = router(state, self.config.loyalty.leaderboard_max);

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the Prometheus exporter on its own port. Must run inside the
    /// tokio runtime.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }

        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use storefront_core::loyalty::ProgramConfiguration;
    use storefront_loyalty::Program;
    use tower::ServiceExt;

    fn app() -> Router {
        let engine = LoyaltyEngine::in_memory(Program::new(ProgramConfiguration::default()).unwrap());
        router(
            AppState {
                engine: Arc::new(engine),
                node_id: "test-node".into(),
                start_time: Instant::now(),
            },
            100,
        )
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_probes() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["node_id"], "test-node");

        let (status, _) = call(&app, Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, Method::GET, "/live", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_account_summary_opens_account() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/v1/loyalty/accounts/user-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["account"]["current_points"], 50);
        assert_eq!(body["tier"]["name"], "Bronze");
        assert_eq!(body["progress"]["next_tier"], "Silver");
    }

    #[tokio::test]
    async fn test_order_event_is_idempotent() {
        let app = app();
        let event = json!({"user_id": "user-1", "order_id": "o-1", "order_total_cents": 10000});

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/loyalty/events/order-completed",
            Some(event.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "applied");
        assert_eq!(body["entry"]["points"], 100);

        let (_, body) = call(
            &app,
            Method::POST,
            "/v1/loyalty/events/order-completed",
            Some(event),
        )
        .await;
        assert_eq!(body["status"], "duplicate");

        let (_, body) = call(
            &app,
            Method::GET,
            "/v1/loyalty/accounts/user-1/transactions?type=earned",
            None,
        )
        .await;
        assert_eq!(body["total"], 1);
    }

    #[tokio::test]
    async fn test_redeem_and_consume() {
        let app = app();
        call(
            &app,
            Method::POST,
            "/v1/loyalty/events/referral-confirmed",
            Some(json!({"referrer_id": "user-1", "referred_user_id": "user-2"})),
        )
        .await;

        let (status, token) = call(
            &app,
            Method::POST,
            "/v1/loyalty/accounts/user-1/redeem",
            Some(json!({"points": 300, "reward_type": "discount"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(token["value"]["cents"], 300);
        let code = token["code"].as_str().unwrap().to_string();

        let uri = format!("/v1/loyalty/rewards/{code}/consume");
        let (status, body) = call(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["consumed"], true);

        let (status, body) = call(&app, Method::POST, &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "reward_unavailable");

        let (status, _) = call(&app, Method::POST, "/v1/loyalty/rewards/RW-NOPE/consume", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_redeem_errors_map_to_status() {
        let app = app();
        call(&app, Method::GET, "/v1/loyalty/accounts/user-1", None).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/loyalty/accounts/user-1/redeem",
            Some(json!({"points": 500, "reward_type": "shipping"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "insufficient_balance");

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/loyalty/accounts/user-1/redeem",
            Some(json!({"points": 10, "reward_type": "shipping"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "below_minimum_redemption");

        let (status, _) = call(
            &app,
            Method::POST,
            "/v1/loyalty/accounts/ghost/redeem",
            Some(json!({"points": 100, "reward_type": "shipping"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_leaderboard_and_deactivation() {
        let app = app();
        for (user, cents) in [("a", 300_000), ("b", 50_000), ("c", 700_000)] {
            call(
                &app,
                Method::POST,
                "/v1/loyalty/events/order-completed",
                Some(json!({"user_id": user, "order_id": format!("o-{user}"), "order_total_cents": cents})),
            )
            .await;
        }

        let (_, board) = call(&app, Method::GET, "/v1/loyalty/leaderboard?limit=2", None).await;
        let board = board.as_array().unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0]["user_id"], "c");
        assert_eq!(board[0]["rank"], 1);
        assert_eq!(board[1]["user_id"], "a");

        let (status, body) = call(&app, Method::DELETE, "/v1/loyalty/accounts/c", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], false);

        let (_, board) = call(&app, Method::GET, "/v1/loyalty/leaderboard?tier=bronze", None).await;
        let board = board.as_array().unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0]["user_id"], "b");
    }

    #[tokio::test]
    async fn test_self_referral_rejected() {
        let app = app();
        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/loyalty/events/referral-confirmed",
            Some(json!({"referrer_id": "user-1", "referred_user_id": "user-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_referral");
    }

    #[tokio::test]
    async fn test_future_birthday_rejected() {
        let app = app();
        let tomorrow = chrono::Utc::now().date_naive() + chrono::Duration::days(1);
        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/loyalty/events/birthday",
            Some(json!({"user_id": "user-1", "date": tomorrow.to_string()})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_event_date");

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/loyalty/events/birthday",
            Some(json!({"user_id": "user-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "applied");
    }
}
