//! Payment processing.
//!
//! One call to [`PaymentProcessor::process_payment`] validates the payer
//! input, records a `PENDING` payment, performs exactly one gateway charge
//! under a timeout and then either confirms the reservation or marks the
//! payment `FAILED`. A failed payment never changes the reservation, so the
//! client may simply try again.
//!
//! A reservation that already has a `SUCCEEDED` payment is never charged
//! again. If its confirmation was interrupted, the next payment attempt,
//! cancellation or reconciliation run finishes it first.

use crate::error::{Result, StorageContext, TicketingError};
use crate::locks::ReservationLocks;
use crate::metrics;
use crate::payment_gateway::{ChargeRequest, GatewayError, PaymentGateway};
use crate::repository::TicketingRepository;
use crate::types::{
    Payment, PaymentMethodSummary, PaymentStatus, Reservation, ReservationId, ReservationStatus,
};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ticketing_core::environment::Clock;

/// Who is paying.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerDetails {
    /// Cardholder or account name
    pub name: String,
    /// Receipt address
    pub email: Option<String>,
}

/// How the payer pays.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Raw card details
    Card {
        /// Card number; spaces and dashes are ignored
        number: String,
        /// Security code
        cvv: String,
        /// Expiry month, 1-12
        expiry_month: u32,
        /// Expiry year, four digits
        expiry_year: i32,
    },
    /// Token issued by the gateway's client-side library
    GatewayToken {
        /// Opaque token
        token: String,
    },
}

impl fmt::Debug for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Card {
                number,
                expiry_month,
                expiry_year,
                ..
            } => f
                .debug_struct("Card")
                .field("last_four", &last_four(&card_digits(number)))
                .field("expiry_month", expiry_month)
                .field("expiry_year", expiry_year)
                .finish_non_exhaustive(),
            Self::GatewayToken { .. } => f.debug_struct("GatewayToken").finish_non_exhaustive(),
        }
    }
}

/// Payment input after validation.
#[derive(Clone, PartialEq, Eq)]
pub struct ValidatedPayment {
    /// Stored description of the method
    pub summary: PaymentMethodSummary,
    /// Value sent to the gateway as `payment_token`
    pub token: String,
}

impl fmt::Debug for ValidatedPayment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedPayment")
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

fn card_digits(number: &str) -> String {
    number
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect()
}

fn last_four(digits: &str) -> String {
    let skip = digits.chars().count().saturating_sub(4);
    digits.chars().skip(skip).collect()
}

/// Luhn checksum over an all-digit string.
#[must_use]
pub fn luhn_valid(digits: &str) -> bool {
    let mut sum = 0_u32;
    for (index, c) in digits.chars().rev().enumerate() {
        let Some(mut digit) = c.to_digit(10) else {
            return false;
        };
        if index % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }
    !digits.is_empty() && sum % 10 == 0
}

fn invalid(message: impl Into<String>) -> TicketingError {
    TicketingError::PaymentInvalid(message.into())
}

/// Validate payer input before any state is touched.
///
/// # Errors
///
/// [`TicketingError::PaymentInvalid`] describing the first problem found.
pub fn validate_payment(
    payer: &PayerDetails,
    method: &PaymentMethod,
    now: DateTime<Utc>,
) -> Result<ValidatedPayment> {
    if payer.name.trim().is_empty() {
        return Err(invalid("payer name is required"));
    }
    if let Some(email) = &payer.email {
        let valid = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !valid {
            return Err(invalid("email address is malformed"));
        }
    }

    match method {
        PaymentMethod::Card {
            number,
            cvv,
            expiry_month,
            expiry_year,
        } => {
            let digits = card_digits(number);
            if !(13..=19).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid("card number must be 13 to 19 digits"));
            }
            if !luhn_valid(&digits) {
                return Err(invalid("card number failed checksum"));
            }
            if !(3..=4).contains(&cvv.len()) || !cvv.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid("security code must be 3 or 4 digits"));
            }
            if !(1..=12).contains(expiry_month) {
                return Err(invalid("expiry month must be between 1 and 12"));
            }
            if (*expiry_year, *expiry_month) < (now.year(), now.month()) {
                return Err(invalid("card has expired"));
            }
            Ok(ValidatedPayment {
                summary: PaymentMethodSummary::Card {
                    last_four: last_four(&digits),
                },
                token: digits,
            })
        }
        PaymentMethod::GatewayToken { token } => {
            if token.trim().is_empty() {
                return Err(invalid("payment token is required"));
            }
            Ok(ValidatedPayment {
                summary: PaymentMethodSummary::GatewayToken,
                token: token.clone(),
            })
        }
    }
}

/// Latest `SUCCEEDED` payment of a reservation, if any.
pub(crate) async fn succeeded_payment(
    repository: &dyn TicketingRepository,
    reservation_id: ReservationId,
) -> Result<Option<Payment>> {
    let payments = repository
        .list_payments(reservation_id)
        .await
        .context("list payments")?;
    Ok(payments
        .into_iter()
        .rev()
        .find(|payment| payment.status == PaymentStatus::Succeeded))
}

/// Confirm a `PENDING_PAYMENT` reservation whose payment already succeeded.
///
/// Callers hold the reservation lock.
pub(crate) async fn confirm_paid(
    repository: &dyn TicketingRepository,
    mut reservation: Reservation,
) -> Result<Reservation> {
    reservation.confirm()?;
    repository
        .save_reservation(reservation.clone())
        .await
        .context("confirm reservation")?;
    metrics::record_reservation_confirmed();
    tracing::info!(reservation_id = %reservation.id, "Confirmed reservation with succeeded payment");
    Ok(reservation)
}

enum ChargeOutcome {
    Approved(String),
    Declined(String),
    Failed(GatewayError),
}

/// Charges reservations through a [`PaymentGateway`].
pub struct PaymentProcessor {
    repository: Arc<dyn TicketingRepository>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    locks: ReservationLocks,
    gateway_timeout: Duration,
}

impl PaymentProcessor {
    /// Creates a new processor.
    #[must_use]
    pub fn new(
        repository: Arc<dyn TicketingRepository>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        locks: ReservationLocks,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            gateway,
            clock,
            locks,
            gateway_timeout,
        }
    }

    /// Pay a `PENDING_PAYMENT` reservation.
    ///
    /// On success the payment is `SUCCEEDED` and the reservation
    /// `CONFIRMED`. On a decline or gateway failure the payment is `FAILED`
    /// with reference `FAILED-<payment id>` and the reservation is unchanged.
    ///
    /// If an earlier payment already succeeded, the reservation is confirmed
    /// and that payment returned without contacting the gateway.
    ///
    /// # Errors
    ///
    /// - [`TicketingError::PaymentInvalid`] for malformed input
    /// - [`TicketingError::NotFound`] for an unknown reservation
    /// - [`TicketingError::NothingToPay`] for a zero total
    /// - [`TicketingError::InvalidState`] unless `PENDING_PAYMENT`
    /// - [`TicketingError::PaymentDeclined`] when the gateway declines
    /// - [`TicketingError::PaymentGateway`] on gateway error or timeout
    /// - [`TicketingError::Storage`] if recording the outcome fails
    #[tracing::instrument(skip_all, fields(%reservation_id))]
    pub async fn process_payment(
        &self,
        reservation_id: ReservationId,
        payer: PayerDetails,
        method: PaymentMethod,
    ) -> Result<Payment> {
        let validated = validate_payment(&payer, &method, self.clock.now())?;

        let _guard = self.locks.lock(reservation_id).await;

        let mut reservation = self
            .repository
            .load_reservation(reservation_id)
            .await
            .context("load reservation")?;
        if reservation.total_amount.is_zero() {
            return Err(TicketingError::NothingToPay(reservation_id));
        }
        if reservation.status == ReservationStatus::PendingPayment {
            if let Some(paid) = succeeded_payment(self.repository.as_ref(), reservation_id).await? {
                tracing::warn!(payment_id = %paid.id, "Reservation already paid; finishing confirmation");
                confirm_paid(self.repository.as_ref(), reservation).await?;
                return Ok(paid);
            }
        } else {
            return Err(TicketingError::InvalidState {
                reservation_id,
                status: reservation.status,
                expected: ReservationStatus::PendingPayment,
            });
        }

        let mut payment = Payment::pending(
            reservation_id,
            reservation.total_amount,
            validated.summary,
            self.clock.now(),
        );
        self.repository
            .create_payment(payment.clone())
            .await
            .context("create payment")?;
        tracing::info!(payment_id = %payment.id, amount = %payment.amount, method = %payment.method, "Charging");

        let request = ChargeRequest {
            idempotency_key: payment.id.to_string(),
            amount: payment.amount,
            payer_name: payer.name,
            payment_token: validated.token,
            description: format!("Reservation {reservation_id}"),
        };
        let started = Instant::now();
        let outcome = self.charge(request).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            ChargeOutcome::Approved(reference) => {
                payment.succeed(reference)?;
                if let Err(err) = self
                    .repository
                    .save_payment(payment.clone())
                    .await
                    .context("save payment")
                {
                    tracing::error!(
                        payment_id = %payment.id,
                        transaction_reference = ?payment.transaction_reference,
                        "Charge succeeded but could not be recorded"
                    );
                    return Err(err);
                }

                reservation.confirm()?;
                if let Err(err) = self
                    .repository
                    .save_reservation(reservation)
                    .await
                    .context("confirm reservation")
                {
                    tracing::error!(
                        payment_id = %payment.id,
                        "Payment recorded but reservation not confirmed; reconciliation will confirm it"
                    );
                    return Err(err);
                }

                metrics::record_payment_succeeded(payment.amount.cents(), elapsed);
                metrics::record_reservation_confirmed();
                tracing::info!(
                    payment_id = %payment.id,
                    transaction_reference = ?payment.transaction_reference,
                    "Payment succeeded; reservation confirmed"
                );
                Ok(payment)
            }
            ChargeOutcome::Declined(reason) => {
                self.record_failure(&mut payment, &reason).await?;
                metrics::record_payment_failed("declined", elapsed);
                tracing::info!(payment_id = %payment.id, %reason, "Payment declined");
                Err(TicketingError::PaymentDeclined {
                    payment_id: payment.id,
                    reason,
                })
            }
            ChargeOutcome::Failed(source) => {
                self.record_failure(&mut payment, &source.to_string()).await?;
                metrics::record_payment_failed("gateway_error", elapsed);
                tracing::warn!(payment_id = %payment.id, error = %source, "Payment gateway failure");
                Err(TicketingError::PaymentGateway {
                    payment_id: payment.id,
                    source,
                })
            }
        }
    }

    async fn charge(&self, request: ChargeRequest) -> ChargeOutcome {
        match tokio::time::timeout(self.gateway_timeout, self.gateway.charge(request)).await {
            Err(_) => ChargeOutcome::Failed(GatewayError::Timeout),
            Ok(Err(err)) => ChargeOutcome::Failed(err),
            Ok(Ok(response)) if response.success => match response.transaction_reference {
                Some(reference) => ChargeOutcome::Approved(reference),
                None => ChargeOutcome::Failed(GatewayError::Other {
                    message: "approval without transaction reference".to_string(),
                }),
            },
            Ok(Ok(response)) => ChargeOutcome::Declined(response.message),
        }
    }

    async fn record_failure(&self, payment: &mut Payment, reason: &str) -> Result<()> {
        payment.fail(reason)?;
        if let Err(err) = self
            .repository
            .save_payment(payment.clone())
            .await
            .context("record payment failure")
        {
            tracing::error!(
                payment_id = %payment.id,
                %reason,
                "Payment failed but stays PENDING; reconciliation will fail it"
            );
            return Err(err);
        }
        Ok(())
    }

    /// Payment attempts for a reservation, oldest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn payments_for(&self, reservation_id: ReservationId) -> Result<Vec<Payment>> {
        self.repository
            .list_payments(reservation_id)
            .await
            .context("list payments")
    }
}
