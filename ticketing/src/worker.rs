//! Background payment execution.
//!
//! Gateway calls may take seconds. [`PaymentWorker`] moves them onto a fixed
//! pool of tokio tasks fed by a bounded queue; callers get a
//! [`PendingPayment`] to await whenever they like. A job runs to completion
//! even when its handle is dropped.

use crate::error::{Result, TicketingError};
use crate::payments::{PayerDetails, PaymentMethod, PaymentProcessor};
use crate::types::{Payment, ReservationId};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

struct PaymentJob {
    reservation_id: ReservationId,
    payer: PayerDetails,
    method: PaymentMethod,
    reply: oneshot::Sender<Result<Payment>>,
}

/// Handle to a queued payment.
#[derive(Debug)]
pub struct PendingPayment {
    reservation_id: ReservationId,
    reply: oneshot::Receiver<Result<Payment>>,
}

impl PendingPayment {
    /// Reservation being paid.
    #[must_use]
    pub const fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }
}

impl Future for PendingPayment {
    type Output = Result<Payment>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TicketingError::WorkerShutdown)))
    }
}

/// Fixed-size pool running [`PaymentProcessor::process_payment`].
pub struct PaymentWorker {
    sender: mpsc::Sender<PaymentJob>,
    handles: Vec<JoinHandle<()>>,
}

impl PaymentWorker {
    /// Start `workers` tasks sharing a queue of `queue_depth` jobs.
    ///
    /// Both values are raised to at least one. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn spawn(processor: Arc<PaymentProcessor>, workers: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let processor = Arc::clone(&processor);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    tracing::debug!(worker, "Payment worker started");
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        let PaymentJob {
                            reservation_id,
                            payer,
                            method,
                            reply,
                        } = job;
                        let result = processor
                            .process_payment(reservation_id, payer, method)
                            .await;
                        if reply.send(result).is_err() {
                            tracing::debug!(%reservation_id, "Payment result dropped by caller");
                        }
                    }
                    tracing::debug!(worker, "Payment worker stopped");
                })
            })
            .collect();

        Self { sender, handles }
    }

    /// Queue a payment. Waits while the queue is full.
    ///
    /// # Errors
    ///
    /// [`TicketingError::WorkerShutdown`] if the pool has stopped.
    pub async fn submit(
        &self,
        reservation_id: ReservationId,
        payer: PayerDetails,
        method: PaymentMethod,
    ) -> Result<PendingPayment> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(PaymentJob {
                reservation_id,
                payer,
                method,
                reply,
            })
            .await
            .map_err(|_| TicketingError::WorkerShutdown)?;
        tracing::debug!(%reservation_id, "Payment queued");
        Ok(PendingPayment {
            reservation_id,
            reply: receiver,
        })
    }

    /// Stop accepting jobs, drain the queue and wait for every worker.
    pub async fn shutdown(self) {
        let Self { sender, handles } = self;
        drop(sender);
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Payment worker panicked");
            }
        }
        tracing::info!("Payment workers shut down");
    }
}
