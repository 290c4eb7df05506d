mod routes;
pub mod types;

use axum::body::Body;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use crate::app::AppState;
use crate::http::types::{apply_rate_limit_headers, ApiError, AuthContext};

const API_KEY_HEADER: &str = "x-api-key";

/// Bearer-key middleware for the /api/v1 surface. Resolves the key, applies
/// the per-key hourly quota and stamps the rate limit headers on whatever
/// the inner handler returns.
async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut request: Request<Body>,
    next: Next
) -> Result<Response, ApiError> {
    let mut values = request.headers().get_all(API_KEY_HEADER).iter();
    let presented = match (values.next(), values.next()) {
        (Some(value), None) => value
            .to_str()
            .map_err(|_| ApiError::InvalidApiKey)?
            .trim()
            .to_string(),
        (None, _) => return Err(ApiError::MissingApiKey),

        // Two headers means someone is playing games; reject outright.
        (Some(_), Some(_)) => return Err(ApiError::InvalidApiKey)
    };

    if presented.is_empty() {
        return Err(ApiError::MissingApiKey);
    }

    let key = state.api_keys.authenticate(&presented).await
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::InvalidApiKey)?;

    let decision = state.api_keys.check_rate_limit(&key);
    if !decision.allowed {
        return Err(ApiError::RateLimited(decision));
    }

    request.extensions_mut().insert(AuthContext {
        api_key_id: key.api_key_id
    });

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

pub fn create_app(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/messages", post(routes::send_message).get(routes::list_messages))
        .route("/messages/{id}", get(routes::get_message))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api/v1", authenticated)
        .route("/api/health", get(routes::health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use crate::auth::ApiKeyManager;
    use crate::config::ModemConfig;
    use crate::modem::breaker::CircuitBreaker;
    use crate::modem::ModemClient;
    use crate::queue::monitor::HealthMonitor;
    use crate::queue::JobQueue;
    use crate::sms::database::SMSDatabase;
    use crate::sms::SMSManager;

    const SES_TOK_BODY: &str =
        "<response><SesInfo>SessionID=s</SesInfo><TokInfo>t</TokInfo></response>";

    struct TestServer {
        base_url: String,
        secret: String,
        limited_secret: String,
        state: AppState,
        _modem_server: MockServer
    }

    async fn start_server(breaker: CircuitBreaker) -> TestServer {
        let modem_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/webserver/SesTokInfo"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SES_TOK_BODY))
            .mount(&modem_server)
            .await;

        let database = Arc::new(SMSDatabase::connect_in_memory().await.unwrap());
        let queue = JobQueue::new(database.pool().clone());
        let sms_manager = SMSManager::new(Arc::clone(&database), queue.clone());
        let (api_keys, _worker) = ApiKeyManager::new(Arc::clone(&database), 100);

        let (_, secret) = api_keys.create_key("default", None).await.unwrap();
        let (_, limited_secret) = api_keys.create_key("limited", Some(2)).await.unwrap();

        let config = ModemConfig {
            base_url: modem_server.uri(),
            poll_interval_ms: 30_000,
            health_check_interval_ms: 60_000
        };
        let modem = ModemClient::new(&config, breaker).unwrap();
        let monitor = HealthMonitor::new(modem.clone(), queue.clone(), Duration::from_secs(60));

        let state = AppState {
            sms_manager,
            api_keys,
            queue,
            modem,
            health: monitor.handle()
        };

        let app = create_app(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the listener a moment to come up.
        tokio::time::sleep(Duration::from_millis(50)).await;

        TestServer {
            base_url: format!("http://{}", address),
            secret,
            limited_secret,
            state,
            _modem_server: modem_server
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let server = start_server(CircuitBreaker::new()).await;

        let response = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .json(&serde_json::json!({"phone": "+33612345678", "content": "hi"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Missing API key");
    }

    #[tokio::test]
    async fn test_invalid_api_key() {
        let server = start_server(CircuitBreaker::new()).await;

        let response = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .header("X-API-Key", "sk_live_wrongwrongwrong00")
            .json(&serde_json::json!({"phone": "+33612345678", "content": "hi"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Invalid API key");
    }

    #[tokio::test]
    async fn test_submit_happy_path() {
        let server = start_server(CircuitBreaker::new()).await;

        let response = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .header("X-API-Key", &server.secret)
            .json(&serde_json::json!({"phone": "+33612345678", "content": "hi"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 201);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "99");

        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["direction"], "outgoing");
        assert_eq!(body["status"], "queued");
        assert_eq!(body["phone"], "+33612345678");

        // The job landed on the send queue.
        let pending = server.state.queue
            .pending_count(crate::queue::QUEUE_SMS_SEND).await.unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn test_submit_validation_errors() {
        let server = start_server(CircuitBreaker::new()).await;

        let too_long = "a".repeat(161);
        let response = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .header("X-API-Key", &server.secret)
            .json(&serde_json::json!({"phone": "+33612345678", "content": too_long}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        // Exactly 160 characters is fine.
        let max_content = "a".repeat(160);
        let response = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .header("X-API-Key", &server.secret)
            .json(&serde_json::json!({"phone": "+33612345678", "content": max_content}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }

    #[tokio::test]
    async fn test_submit_missing_field_is_bad_request() {
        let server = start_server(CircuitBreaker::new()).await;

        let response = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .header("X-API-Key", &server.secret)
            .json(&serde_json::json!({"phone": "+33612345678"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }

    #[tokio::test]
    async fn test_rate_limit_third_request_denied() {
        let server = start_server(CircuitBreaker::new()).await;

        for _ in 0..2 {
            let response = client()
                .post(format!("{}/api/v1/messages", server.base_url))
                .header("X-API-Key", &server.limited_secret)
                .json(&serde_json::json!({"phone": "+33612345678", "content": "hi"}))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 201);
        }

        let response = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .header("X-API-Key", &server.limited_secret)
            .json(&serde_json::json!({"phone": "+33612345678", "content": "hi"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 429);
        assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
        assert!(response.headers().get("x-ratelimit-reset").is_some());
    }

    #[tokio::test]
    async fn test_get_message_scoped_by_owner() {
        let server = start_server(CircuitBreaker::new()).await;

        let created: serde_json::Value = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .header("X-API-Key", &server.secret)
            .json(&serde_json::json!({"phone": "+33612345678", "content": "hi"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap();

        let own = client()
            .get(format!("{}/api/v1/messages/{}", server.base_url, id))
            .header("X-API-Key", &server.secret)
            .send()
            .await
            .unwrap();
        assert_eq!(own.status(), 200);

        // Another key cannot see it.
        let other = client()
            .get(format!("{}/api/v1/messages/{}", server.base_url, id))
            .header("X-API-Key", &server.limited_secret)
            .send()
            .await
            .unwrap();
        assert_eq!(other.status(), 404);

        let absent = client()
            .get(format!("{}/api/v1/messages/no-such-id", server.base_url))
            .header("X-API-Key", &server.secret)
            .send()
            .await
            .unwrap();
        assert_eq!(absent.status(), 404);
    }

    #[tokio::test]
    async fn test_list_messages_filters() {
        let server = start_server(CircuitBreaker::new()).await;

        for content in ["one", "two"] {
            client()
                .post(format!("{}/api/v1/messages", server.base_url))
                .header("X-API-Key", &server.secret)
                .json(&serde_json::json!({"phone": "+33612345678", "content": content}))
                .send()
                .await
                .unwrap();
        }

        let listed: Vec<serde_json::Value> = client()
            .get(format!("{}/api/v1/messages?direction=outgoing&status=queued", server.base_url))
            .header("X-API-Key", &server.secret)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);

        let bad_filter = client()
            .get(format!("{}/api/v1/messages?status=nonsense", server.base_url))
            .header("X-API-Key", &server.secret)
            .send()
            .await
            .unwrap();
        assert_eq!(bad_filter.status(), 400);
    }

    #[tokio::test]
    async fn test_submit_rejected_when_circuit_open() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_secs(300));
        breaker.record_failure();
        let server = start_server(breaker).await;

        let response = client()
            .post(format!("{}/api/v1/messages", server.base_url))
            .header("X-API-Key", &server.secret)
            .json(&serde_json::json!({"phone": "+33612345678", "content": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn test_health_endpoint_is_public() {
        let server = start_server(CircuitBreaker::new()).await;

        let response = client()
            .get(format!("{}/api/health", server.base_url))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "ok");
    }

    #[tokio::test]
    async fn test_health_degraded_when_circuit_open() {
        let breaker = CircuitBreaker::with_settings(1, Duration::from_secs(300));
        breaker.record_failure();
        let server = start_server(breaker).await;

        let response = client()
            .get(format!("{}/api/health", server.base_url))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 503);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["modem"]["healthy"], false);
    }
}
