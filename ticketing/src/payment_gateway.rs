//! Payment gateway abstraction.
//!
//! The processor talks to an external card processor through
//! [`PaymentGateway`]. A declined charge is a normal [`ChargeResponse`] with
//! `success == false`; [`GatewayError`] is reserved for transport problems.
//!
//! Every request carries an idempotency key. A gateway that already settled a
//! key answers a repeated request with the stored response instead of
//! charging again, which makes retrying a timed-out charge safe.
//!
//! Provided implementations:
//!
//! - [`MockPaymentGateway`]: approves everything except decline test tokens
//! - [`ScriptedPaymentGateway`]: replays queued responses and records requests
//! - [`RetryingGateway`]: retries transient errors of another gateway

use crate::types::Money;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use ticketing_core::retry::{RetryPolicy, retry_if};

/// Charge sent to the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChargeRequest {
    /// Deduplicates retries of the same charge; the payment id
    pub idempotency_key: String,
    /// Amount to charge
    pub amount: Money,
    /// Cardholder or payer name
    pub payer_name: String,
    /// Card number or gateway-issued token
    pub payment_token: String,
    /// Human-readable description shown on statements
    pub description: String,
}

/// Gateway answer to a charge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChargeResponse {
    /// Whether the charge went through
    pub success: bool,
    /// Gateway reference for a successful charge
    pub transaction_reference: Option<String>,
    /// Gateway message (decline reason on failure)
    pub message: String,
}

impl ChargeResponse {
    /// Successful charge with `reference`.
    #[must_use]
    pub fn approved(reference: impl Into<String>) -> Self {
        Self {
            success: true,
            transaction_reference: Some(reference.into()),
            message: "approved".to_string(),
        }
    }

    /// Declined charge with `message`.
    #[must_use]
    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_reference: None,
            message: message.into(),
        }
    }
}

/// Transport-level gateway failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No answer in time
    #[error("Gateway timeout")]
    Timeout,
    /// Gateway reachable but temporarily unable to serve
    #[error("Gateway unavailable: {message}")]
    Unavailable {
        /// Error message
        message: String,
    },
    /// Unexpected answer or client-side failure
    #[error("Gateway error: {message}")]
    Other {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    /// Whether retrying the same charge may help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable { .. })
    }
}

/// Boxed future returned by [`PaymentGateway::charge`].
pub type GatewayFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ChargeResponse, GatewayError>> + Send + 'a>>;

/// Payment gateway trait
///
/// Abstraction over card processors like Stripe or Adyen.
pub trait PaymentGateway: Send + Sync {
    /// Submit one charge.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError`] for transport failures. Declines are
    /// `Ok` with `success == false`.
    fn charge(&self, request: ChargeRequest) -> GatewayFuture<'_>;
}

impl<G: PaymentGateway + ?Sized> PaymentGateway for Arc<G> {
    fn charge(&self, request: ChargeRequest) -> GatewayFuture<'_> {
        (**self).charge(request)
    }
}

/// Mock payment gateway for development.
///
/// Approves every charge unless the payment token starts with
/// [`MockPaymentGateway::DECLINE_PREFIX`]. Repeated idempotency keys get the
/// first response back.
#[derive(Clone, Debug)]
pub struct MockPaymentGateway {
    latency: Duration,
    settled: Arc<Mutex<HashMap<String, ChargeResponse>>>,
}

impl MockPaymentGateway {
    /// Tokens starting with this prefix are declined.
    pub const DECLINE_PREFIX: &'static str = "tok_decline";

    /// Creates a mock gateway with a simulated 100ms network delay
    #[must_use]
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(100),
            settled: Arc::default(),
        }
    }

    /// Override the simulated network delay.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn charge(&self, request: ChargeRequest) -> GatewayFuture<'_> {
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            let mut settled = self.settled.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(response) = settled.get(&request.idempotency_key) {
                tracing::info!(idempotency_key = %request.idempotency_key, "Mock payment replayed");
                return Ok(response.clone());
            }

            let response = if request.payment_token.starts_with(Self::DECLINE_PREFIX) {
                tracing::info!(amount = request.amount.cents(), "Mock payment declined");
                ChargeResponse::declined("card declined")
            } else {
                let reference = format!("mock_txn_{}", uuid::Uuid::new_v4());
                tracing::info!(
                    amount = request.amount.cents(),
                    transaction_reference = %reference,
                    "Mock payment processed successfully"
                );
                ChargeResponse::approved(reference)
            };
            settled.insert(request.idempotency_key, response.clone());
            Ok(response)
        })
    }
}

#[derive(Clone, Debug)]
enum Scripted {
    Respond(ChargeResponse),
    Fail(GatewayError),
    LoseResponse(String),
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<Scripted>,
    requests: Vec<ChargeRequest>,
    settled: HashMap<String, ChargeResponse>,
}

/// Gateway that replays queued outcomes in order.
///
/// With an empty queue every charge is approved. A request whose idempotency
/// key was already answered gets that answer again without consuming a step.
/// Clones share the queue and the request log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedPaymentGateway {
    script: Arc<Mutex<Script>>,
}

impl ScriptedPaymentGateway {
    /// Create a gateway with an empty script
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, step: Scripted) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queue
            .push_back(step);
        self
    }

    /// Queue an approval with `reference`.
    pub fn approve_next(&self, reference: impl Into<String>) -> &Self {
        self.push(Scripted::Respond(ChargeResponse::approved(reference)))
    }

    /// Queue a decline with `message`.
    pub fn decline_next(&self, message: impl Into<String>) -> &Self {
        self.push(Scripted::Respond(ChargeResponse::declined(message)))
    }

    /// Queue a transport failure.
    pub fn fail_next(&self, error: GatewayError) -> &Self {
        self.push(Scripted::Fail(error))
    }

    /// Queue a charge that is approved with `reference` but whose answer is
    /// lost in transit, surfacing as [`GatewayError::Timeout`].
    pub fn lose_response_next(&self, reference: impl Into<String>) -> &Self {
        self.push(Scripted::LoseResponse(reference.into()))
    }

    /// Queue a charge that never answers.
    pub fn hang_next(&self) -> &Self {
        self.push(Scripted::Hang)
    }

    /// Every request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .clone()
    }

    /// Number of distinct idempotency keys answered so far.
    #[must_use]
    pub fn settled_count(&self) -> usize {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settled
            .len()
    }
}

impl PaymentGateway for ScriptedPaymentGateway {
    fn charge(&self, request: ChargeRequest) -> GatewayFuture<'_> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        let key = request.idempotency_key.clone();
        script.requests.push(request);
        if let Some(response) = script.settled.get(&key) {
            return Box::pin(std::future::ready(Ok(response.clone())));
        }

        let answer = match script.queue.pop_front() {
            None => Ok(ChargeResponse::approved(format!(
                "scripted_txn_{}",
                uuid::Uuid::new_v4()
            ))),
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(error)) => Err(error),
            Some(Scripted::LoseResponse(reference)) => {
                script
                    .settled
                    .insert(key.clone(), ChargeResponse::approved(reference));
                Err(GatewayError::Timeout)
            }
            Some(Scripted::Hang) => return Box::pin(futures::future::pending()),
        };
        if let Ok(response) = &answer {
            script.settled.insert(key, response.clone());
        }
        Box::pin(std::future::ready(answer))
    }
}

/// Retries transient [`GatewayError`]s of an inner gateway.
///
/// Declines are returned as-is and never retried. A retry resends the same
/// request, so the inner gateway sees the same idempotency key.
#[derive(Clone, Debug)]
pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: PaymentGateway> RetryingGateway<G> {
    /// Wrap `inner` with `policy`.
    #[must_use]
    pub const fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<G: PaymentGateway> PaymentGateway for RetryingGateway<G> {
    fn charge(&self, request: ChargeRequest) -> GatewayFuture<'_> {
        Box::pin(retry_if(
            self.policy,
            move || self.inner.charge(request.clone()),
            GatewayError::is_transient,
        ))
    }
}
