//! Tiered event ticketing.
//!
//! Events sell tickets in three tiers (standard, VIP, premium), each with its
//! own capacity and unit price. Clients reserve tickets, pay for them and may
//! cancel them; the service guarantees that no tier is ever oversold, however
//! many requests race for the last seats.
//!
//! # Architecture
//!
//! ```text
//!                      ┌────────────────────┐
//!                      │  TicketingService  │
//!                      └────────────────────┘
//!          ┌────────────┬───────┴──────┬──────────────┐
//!          ▼            ▼              ▼              ▼
//!   ┌────────────┐ ┌──────────────┐ ┌──────────────┐ ┌────────────┐
//!   │  Catalog   │ │ Reservations │ │   Payments   │ │ Reconciler │
//!   └────────────┘ └──────────────┘ └──────────────┘ └────────────┘
//!          │          │      │          │      │            │
//!          │          ▼      │          │      ▼            │
//!          │   ┌───────────┐ │          │  ┌─────────┐      │
//!          │   │ Inventory │ │          │  │ Gateway │      │
//!          │   └───────────┘ │          │  └─────────┘      │
//!          ▼          ▼      ▼          ▼                   ▼
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │         TicketingRepository (in-memory / PostgreSQL)         │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key guarantees
//!
//! - **No overselling**: reserving a tier is one atomic conditional update
//!   (`sold + quantity <= capacity`); a losing request changes nothing.
//! - **All-or-nothing reservations**: if any tier of a request is short, the
//!   tiers already reserved for it are released before the error returns.
//! - **Price snapshots**: line items keep the unit price at booking time.
//! - **One outcome per reservation**: cancellation, payment and
//!   reconciliation of the same reservation are serialized.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ticketing::{Config, InMemoryTicketingRepository, MockPaymentGateway, TicketingService};
//! use ticketing_core::SystemClock;
//!
//! let service = TicketingService::new(
//!     Arc::new(InMemoryTicketingRepository::new()),
//!     MockPaymentGateway::shared(),
//!     Arc::new(SystemClock),
//!     &Config::default(),
//! );
//! # let _ = service;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod inventory;
pub mod locks;
pub mod metrics;
pub mod payment_gateway;
pub mod payments;
pub mod pricing;
pub mod reconciliation;
pub mod repository;
pub mod reservations;
pub mod service;
pub mod types;
pub mod worker;

pub use catalog::{EventCatalog, EventUpdate, NewEvent};
pub use config::{BookingRules, Config, PaymentConfig, PostgresConfig};
pub use error::{Result, TicketingError};
pub use inventory::Inventory;
pub use payment_gateway::{
    ChargeRequest, ChargeResponse, GatewayError, MockPaymentGateway, PaymentGateway,
    RetryingGateway, ScriptedPaymentGateway,
};
pub use payments::{PayerDetails, PaymentMethod, PaymentProcessor};
pub use reconciliation::{ReconciliationReport, Reconciler};
pub use repository::{
    InMemoryTicketingRepository, PostgresTicketingRepository, RepositoryError,
    TicketingRepository,
};
pub use reservations::{EventSummary, ReservationDetails, ReservationManager, ReservationRequest};
pub use service::{BookingOutcome, TicketingService};
pub use types::*;
pub use worker::{PaymentWorker, PendingPayment};
