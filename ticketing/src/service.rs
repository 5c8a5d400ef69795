//! Upward facade: one handle over catalog, reservations, payments and
//! reconciliation, wired from a [`Config`].

use crate::catalog::EventCatalog;
use crate::config::{Config, PaymentConfig};
use crate::error::{Result, StorageContext, TicketingError};
use crate::locks::ReservationLocks;
use crate::payment_gateway::{PaymentGateway, RetryingGateway};
use crate::payments::{PayerDetails, PaymentMethod, PaymentProcessor};
use crate::reconciliation::Reconciler;
use crate::repository::TicketingRepository;
use crate::reservations::{ReservationDetails, ReservationManager, ReservationRequest};
use crate::types::{ClientId, Payment, Reservation, ReservationId};
use crate::worker::PaymentWorker;
use std::sync::Arc;
use ticketing_core::environment::Clock;

/// Result of [`TicketingService::book`].
#[derive(Debug)]
pub struct BookingOutcome {
    /// The reservation as stored after the optional payment
    pub reservation: Reservation,
    /// Payment result when the booking asked to pay immediately.
    ///
    /// A failed payment leaves the reservation `PENDING_PAYMENT`; the client
    /// can pay again later.
    pub payment: Option<Result<Payment>>,
}

impl BookingOutcome {
    /// Whether the booking ended `CONFIRMED`.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self.payment, Some(Ok(_)))
    }
}

/// Ticketing operations over one repository, gateway and clock.
pub struct TicketingService {
    repository: Arc<dyn TicketingRepository>,
    catalog: EventCatalog,
    reservations: ReservationManager,
    payments: Arc<PaymentProcessor>,
    reconciler: Reconciler,
    payment_config: PaymentConfig,
}

impl TicketingService {
    /// Wire every component.
    ///
    /// The gateway is wrapped in a [`RetryingGateway`] when
    /// `config.payment.retry_max` is non-zero.
    #[must_use]
    pub fn new(
        repository: Arc<dyn TicketingRepository>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let locks = ReservationLocks::new();
        let gateway: Arc<dyn PaymentGateway> = if config.payment.retry_max > 0 {
            Arc::new(RetryingGateway::new(gateway, config.payment.retry_policy()))
        } else {
            gateway
        };

        let payments = PaymentProcessor::new(
            Arc::clone(&repository),
            gateway,
            Arc::clone(&clock),
            locks.clone(),
            config.payment.gateway_timeout(),
        );

        tracing::info!(
            max_tickets = config.booking.max_tickets_per_reservation,
            booking_cutoff_minutes = config.booking.booking_cutoff_minutes,
            cancellation_cutoff_hours = config.booking.cancellation_cutoff_hours,
            "Ticketing service ready"
        );

        Self {
            catalog: EventCatalog::new(Arc::clone(&repository), Arc::clone(&clock)),
            reservations: ReservationManager::new(
                Arc::clone(&repository),
                clock,
                config.booking.clone(),
                locks.clone(),
            ),
            payments: Arc::new(payments),
            reconciler: Reconciler::new(Arc::clone(&repository), locks),
            payment_config: config.payment.clone(),
            repository,
        }
    }

    /// Event management.
    #[must_use]
    pub const fn catalog(&self) -> &EventCatalog {
        &self.catalog
    }

    /// Counter repair.
    #[must_use]
    pub const fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Reserve tickets; see [`ReservationManager::create_reservation`].
    ///
    /// # Errors
    ///
    /// As [`ReservationManager::create_reservation`].
    pub async fn create_reservation(&self, request: ReservationRequest) -> Result<Reservation> {
        self.reservations.create_reservation(request).await
    }

    /// Cancel a reservation; see [`ReservationManager::cancel_reservation`].
    ///
    /// # Errors
    ///
    /// As [`ReservationManager::cancel_reservation`].
    pub async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
        requester: ClientId,
    ) -> Result<Reservation> {
        self.reservations
            .cancel_reservation(reservation_id, requester)
            .await
    }

    /// Pay a reservation; see [`PaymentProcessor::process_payment`].
    ///
    /// # Errors
    ///
    /// As [`PaymentProcessor::process_payment`].
    pub async fn process_payment(
        &self,
        reservation_id: ReservationId,
        payer: PayerDetails,
        method: PaymentMethod,
    ) -> Result<Payment> {
        self.payments
            .process_payment(reservation_id, payer, method)
            .await
    }

    /// Reservations of one client, newest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn reservations_for_client(&self, client_id: ClientId) -> Result<Vec<Reservation>> {
        self.reservations.reservations_for_client(client_id).await
    }

    /// One reservation with event and payments, for its owner.
    ///
    /// # Errors
    ///
    /// As [`ReservationManager::reservation_details`].
    pub async fn reservation_details(
        &self,
        reservation_id: ReservationId,
        requester: ClientId,
    ) -> Result<ReservationDetails> {
        self.reservations
            .reservation_details(reservation_id, requester)
            .await
    }

    /// Create a reservation and, when `request.pay_immediately` is set, pay
    /// it right away with `payment`.
    ///
    /// A payment failure does not fail the booking: the reservation stays
    /// `PENDING_PAYMENT` and the error is returned in
    /// [`BookingOutcome::payment`].
    ///
    /// # Errors
    ///
    /// - [`TicketingError::Validation`] if `pay_immediately` and `payment`
    ///   disagree (checked before anything is reserved)
    /// - any error of [`Self::create_reservation`]
    #[tracing::instrument(
        skip_all,
        fields(event_id = %request.event_id, pay_immediately = request.pay_immediately)
    )]
    pub async fn book(
        &self,
        request: ReservationRequest,
        payment: Option<(PayerDetails, PaymentMethod)>,
    ) -> Result<BookingOutcome> {
        let payment = match (request.pay_immediately, payment) {
            (true, None) => {
                return Err(TicketingError::Validation(
                    "immediate payment requires payment details".to_string(),
                ));
            }
            (false, Some(_)) => {
                return Err(TicketingError::Validation(
                    "payment details given without immediate payment".to_string(),
                ));
            }
            (_, payment) => payment,
        };

        let reservation = self.reservations.create_reservation(request).await?;
        let Some((payer, method)) = payment else {
            return Ok(BookingOutcome {
                reservation,
                payment: None,
            });
        };

        let result = self
            .payments
            .process_payment(reservation.id, payer, method)
            .await;
        if let Err(err) = &result {
            tracing::info!(
                reservation_id = %reservation.id,
                error = %err,
                "Immediate payment failed; reservation awaits payment"
            );
        }
        let reservation = self
            .repository
            .load_reservation(reservation.id)
            .await
            .context("load reservation")?;
        Ok(BookingOutcome {
            reservation,
            payment: Some(result),
        })
    }

    /// [`Self::book`] with `pay_immediately` forced on.
    ///
    /// # Errors
    ///
    /// As [`Self::book`].
    pub async fn book_and_pay(
        &self,
        request: ReservationRequest,
        payer: PayerDetails,
        method: PaymentMethod,
    ) -> Result<BookingOutcome> {
        let request = ReservationRequest {
            pay_immediately: true,
            ..request
        };
        self.book(request, Some((payer, method))).await
    }

    /// Start a background payment pool sized by the payment configuration.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn_payment_worker(&self) -> PaymentWorker {
        PaymentWorker::spawn(
            Arc::clone(&self.payments),
            self.payment_config.workers,
            self.payment_config.worker_queue_depth,
        )
    }
}
