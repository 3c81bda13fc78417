//! Клиент удалённого сервиса событий, который ведёт счётчик ёмкости.
//!
//! Каждый вызов проходит через выключатель и ограниченные ретраи с
//! экспоненциальной задержкой. Ретраятся только временные сбои (таймаут,
//! обрыв соединения, 5xx, 408, 429). Изменение ёмкости всегда несёт
//! заголовок `Idempotency-Key`, поэтому повтор после таймаута не спишет
//! места дважды.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{CircuitBreakerConfig, InventoryConfig};
use crate::error::GatewayError;
use crate::models::event::EventPayload;
use crate::models::EventSnapshot;
use crate::services::circuit_breaker::CircuitBreaker;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Исход повторного опроса: было ли изменение с этим ключом применено.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAdjustment {
    Applied,
    NotApplied,
}

#[async_trait]
pub trait InventoryGateway: Send + Sync {
    /// Только чтение. `NotFound`, если события нет.
    async fn validate(&self, event_id: i64) -> Result<EventSnapshot, GatewayError>;

    async fn adjust_capacity(
        &self,
        event_id: i64,
        delta: i32,
        idempotency_key: &str,
    ) -> Result<(), GatewayError>;

    async fn adjustment_status(
        &self,
        event_id: i64,
        idempotency_key: &str,
    ) -> Result<RemoteAdjustment, GatewayError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Задержка перед попыткой `attempt + 1` (нумерация с 1).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: MAX_BACKOFF,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CapacityPatch {
    booked_seats: i32,
}

#[derive(Clone)]
pub struct HttpInventoryGateway {
    http_client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpInventoryGateway {
    pub fn from_config(
        config: &InventoryConfig,
        breaker: &CircuitBreakerConfig,
    ) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                initial_delay: config.backoff(),
                max_delay: MAX_BACKOFF,
            },
            circuit_breaker: Arc::new(CircuitBreaker::new(
                breaker.failure_threshold,
                breaker.timeout_seconds,
            )),
        })
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Одна попытка через выключатель. Временные статусы сразу превращаются в ошибку.
    async fn execute(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        if !self.circuit_breaker.can_execute() {
            warn!("Circuit breaker is OPEN - blocking inventory request");
            return Err(GatewayError::Transient(
                "circuit breaker open - inventory service temporarily unavailable".to_string(),
            ));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.circuit_breaker.record_failure();
                return Err(GatewayError::Transient(e.to_string()));
            }
        };

        let status = response.status();
        if is_transient_status(status) {
            self.circuit_breaker.record_failure();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Transient(format!("status {}: {}", status, body)));
        }

        // 4xx - сервис жив, просто отказал.
        self.circuit_breaker.record_success();
        Ok(response)
    }

    async fn with_retry<F, Fut, T>(&self, operation: &str, call: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "Inventory {} attempt {}/{} failed: {}; retrying in {:?}",
                        operation, attempt, self.retry.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn event_url(&self, event_id: i64) -> String {
        format!("{}/events/{}", self.base_url, event_id)
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

async fn permanent(response: Response) -> GatewayError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    GatewayError::Permanent { status, message }
}

#[async_trait]
impl InventoryGateway for HttpInventoryGateway {
    async fn validate(&self, event_id: i64) -> Result<EventSnapshot, GatewayError> {
        let url = self.event_url(event_id);
        let url = url.as_str();

        self.with_retry("validate", move || async move {
            let response = self.execute(self.http_client.get(url)).await?;
            match response.status() {
                StatusCode::OK => {
                    let payload: EventPayload =
                        response
                            .json()
                            .await
                            .map_err(|e| GatewayError::Permanent {
                                status: 200,
                                message: format!("malformed event payload: {}", e),
                            })?;
                    let snapshot = payload.into_snapshot(event_id);
                    debug!(
                        "Event {} validated: status={:?}, remaining={:?}",
                        event_id, snapshot.status, snapshot.remaining_capacity
                    );
                    Ok(snapshot)
                }
                StatusCode::NOT_FOUND => Err(GatewayError::NotFound(event_id)),
                _ => Err(permanent(response).await),
            }
        })
        .await
    }

    async fn adjust_capacity(
        &self,
        event_id: i64,
        delta: i32,
        idempotency_key: &str,
    ) -> Result<(), GatewayError> {
        let url = format!("{}/capacity", self.event_url(event_id));
        let url = url.as_str();
        let body = &CapacityPatch {
            booked_seats: delta,
        };

        self.with_retry("adjust_capacity", move || async move {
            let request = self
                .http_client
                .patch(url)
                .header(IDEMPOTENCY_HEADER, idempotency_key)
                .json(body);
            let response = self.execute(request).await?;
            if response.status() == StatusCode::OK {
                info!("Event {} capacity adjusted by {}", event_id, delta);
                Ok(())
            } else {
                Err(permanent(response).await)
            }
        })
        .await
    }

    async fn adjustment_status(
        &self,
        event_id: i64,
        idempotency_key: &str,
    ) -> Result<RemoteAdjustment, GatewayError> {
        let url = format!(
            "{}/capacity/adjustments/{}",
            self.event_url(event_id),
            idempotency_key
        );
        let url = url.as_str();

        self.with_retry("adjustment_status", move || async move {
            let response = self.execute(self.http_client.get(url)).await?;
            match response.status() {
                StatusCode::OK => Ok(RemoteAdjustment::Applied),
                StatusCode::NOT_FOUND => Ok(RemoteAdjustment::NotApplied),
                _ => Err(permanent(response).await),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventStatus;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer, max_attempts: u32) -> HttpInventoryGateway {
        HttpInventoryGateway::from_config(
            &InventoryConfig {
                base_url: server.uri(),
                timeout_seconds: 2,
                max_attempts,
                backoff_ms: 1,
            },
            &CircuitBreakerConfig {
                failure_threshold: 100,
                timeout_seconds: 60,
            },
        )
        .unwrap()
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(10), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn validate_parses_event() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "title": "Jazz night",
                "status": "ACTIVE",
                "remainingCapacity": 12,
                "basePrice": 19.99
            })))
            .mount(&server)
            .await;

        let snapshot = gateway(&server, 3).validate(7).await.unwrap();
        assert_eq!(snapshot.status, EventStatus::Active);
        assert_eq!(snapshot.remaining_capacity, Some(12));
        assert_eq!(snapshot.base_price_cents, Some(1999));
    }

    #[tokio::test]
    async fn validate_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events/8"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = gateway(&server, 3).validate(8).await.unwrap_err();
        assert_eq!(err, GatewayError::NotFound(8));
    }

    #[tokio::test]
    async fn adjust_sends_idempotency_key_and_retries_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/events/1/capacity"))
            .and(header(IDEMPOTENCY_HEADER, "key-1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/events/1/capacity"))
            .and(header(IDEMPOTENCY_HEADER, "key-1"))
            .and(body_json(json!({ "bookedSeats": 2 })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        gateway(&server, 3)
            .adjust_capacity(1, 2, "key-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn adjust_does_not_retry_4xx() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/events/1/capacity"))
            .respond_with(ResponseTemplate::new(409).set_body_string("sold out"))
            .expect(1)
            .mount(&server)
            .await;

        let err = gateway(&server, 3)
            .adjust_capacity(1, 1, "key-2")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::Permanent {
                status: 409,
                message: "sold out".to_string()
            }
        );
    }

    #[tokio::test]
    async fn exhausted_retries_stay_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/events/1/capacity"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = gateway(&server, 3)
            .adjust_capacity(1, 1, "key-3")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn adjustment_status_reads_200_and_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events/4/capacity/adjustments/applied-key"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/events/4/capacity/adjustments/missing-key"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let gateway = gateway(&server, 1);
        assert_eq!(
            gateway.adjustment_status(4, "applied-key").await.unwrap(),
            RemoteAdjustment::Applied
        );
        assert_eq!(
            gateway.adjustment_status(4, "missing-key").await.unwrap(),
            RemoteAdjustment::NotApplied
        );
    }

    #[tokio::test]
    async fn open_breaker_short_circuits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/events/5"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpInventoryGateway::from_config(
            &InventoryConfig {
                base_url: server.uri(),
                timeout_seconds: 2,
                max_attempts: 1,
                backoff_ms: 1,
            },
            &CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_seconds: 60,
            },
        )
        .unwrap();

        assert!(gateway.validate(5).await.unwrap_err().is_transient());
        // второй вызов до сервера не доходит
        assert!(gateway.validate(5).await.unwrap_err().is_transient());
    }
}
