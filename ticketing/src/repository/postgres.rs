//! `PostgreSQL` repository.
//!
//! Capacity lives in `event_tiers`, one row per (event, tier). Reserving is a
//! single conditional `UPDATE ... WHERE sold + $q <= capacity`, so concurrent
//! reservations for the same tier serialize on the row lock and can never
//! push `sold` past `capacity`. Multi-row writes (event creation, line items,
//! cancellation, recounts) run in one transaction.

use super::{
    RepositoryError, RepositoryFuture, RepositoryResult, ReserveOutcome, SoldRecount,
    TicketingRepository,
};
use crate::config::PostgresConfig;
use crate::types::{
    ClientId, Event, EventId, Money, OrganizerId, Payment, PaymentId, PaymentStatus, Reservation,
    ReservationId, ReservationLineItem, ReservationStatus, Tier, TierMap,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Uuid;
use std::collections::HashMap;
use std::time::Duration;

type EventRow = (
    Uuid,
    Uuid,
    String,
    String,
    serde_json::Value,
    DateTime<Utc>,
    bool,
    DateTime<Utc>,
);
type TierRow = (Uuid, String, i32, i32, i64);
type ReservationRow = (
    Uuid,
    Uuid,
    Uuid,
    String,
    i64,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);
type LineItemRow = (Uuid, String, i32, i64, i64);
type PaymentRow = (
    Uuid,
    Uuid,
    i64,
    String,
    serde_json::Value,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
);

const EVENT_COLUMNS: &str = "id, organizer_id, name, venue, category, starts_at, active, created_at";
const TIER_COLUMNS: &str = "event_id, tier, capacity, sold, price_cents";
const RESERVATION_COLUMNS: &str =
    "id, client_id, event_id, status, total_cents, created_at, cancelled_at";
const LINE_ITEM_COLUMNS: &str =
    "reservation_id, tier, quantity, unit_price_cents, subtotal_cents";
const PAYMENT_COLUMNS: &str = "id, reservation_id, amount_cents, status, method, \
     transaction_reference, failure_reason, created_at";

fn db(context: &'static str) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |e| RepositoryError::Database(format!("Failed to {context}: {e}"))
}

/// Map constraint violations to domain errors, everything else to `Database`.
fn write_err(
    context: &'static str,
    entity: &'static str,
    id: impl ToString,
) -> impl FnOnce(sqlx::Error) -> RepositoryError {
    move |e| match e.as_database_error() {
        Some(d) if d.is_unique_violation() => {
            RepositoryError::Conflict(format!("{entity} {} exists", id.to_string()))
        }
        Some(d) if d.is_foreign_key_violation() => RepositoryError::NotFound {
            entity,
            id: id.to_string(),
        },
        _ => RepositoryError::Database(format!("Failed to {context}: {e}")),
    }
}

fn to_db_count(value: u32) -> RepositoryResult<i32> {
    i32::try_from(value)
        .map_err(|_| RepositoryError::Serialization(format!("count out of range: {value}")))
}

fn from_db_count(value: i32) -> RepositoryResult<u32> {
    u32::try_from(value)
        .map_err(|_| RepositoryError::Serialization(format!("negative count: {value}")))
}

fn to_db_cents(money: Money) -> RepositoryResult<i64> {
    i64::try_from(money.cents())
        .map_err(|_| RepositoryError::Serialization(format!("amount out of range: {money}")))
}

fn from_db_cents(value: i64) -> RepositoryResult<Money> {
    u64::try_from(value)
        .map(Money::from_cents)
        .map_err(|_| RepositoryError::Serialization(format!("negative amount: {value}")))
}

fn parse_tier(value: &str) -> RepositoryResult<Tier> {
    Tier::parse(value).ok_or_else(|| RepositoryError::Serialization(format!("unknown tier: {value}")))
}

fn event_from_rows(row: EventRow, tiers: &[TierRow]) -> RepositoryResult<Event> {
    let (id, organizer_id, name, venue, category, starts_at, active, created_at) = row;

    let mut capacity = TierMap::uniform(0_u32);
    let mut sold = TierMap::uniform(0_u32);
    let mut prices = TierMap::uniform(Money::ZERO);
    for (_, tier, tier_capacity, tier_sold, price_cents) in tiers {
        let tier = parse_tier(tier)?;
        *capacity.get_mut(tier) = from_db_count(*tier_capacity)?;
        *sold.get_mut(tier) = from_db_count(*tier_sold)?;
        *prices.get_mut(tier) = from_db_cents(*price_cents)?;
    }

    Ok(Event {
        id: EventId::from_uuid(id),
        organizer_id: OrganizerId::from_uuid(organizer_id),
        name,
        venue,
        category: serde_json::from_value(category)
            .map_err(|e| RepositoryError::Serialization(format!("event category: {e}")))?,
        capacity,
        sold,
        prices,
        starts_at,
        active,
        created_at,
    })
}

fn line_item_from_row(row: LineItemRow) -> RepositoryResult<ReservationLineItem> {
    let (reservation_id, tier, quantity, unit_price, subtotal) = row;
    Ok(ReservationLineItem {
        reservation_id: ReservationId::from_uuid(reservation_id),
        tier: parse_tier(&tier)?,
        quantity: from_db_count(quantity)?,
        unit_price: from_db_cents(unit_price)?,
        subtotal: from_db_cents(subtotal)?,
    })
}

fn reservation_from_row(
    row: ReservationRow,
    mut line_items: Vec<ReservationLineItem>,
) -> RepositoryResult<Reservation> {
    let (id, client_id, event_id, status, total_cents, created_at, cancelled_at) = row;
    line_items.sort_by_key(|item| item.tier);
    Ok(Reservation {
        id: ReservationId::from_uuid(id),
        client_id: ClientId::from_uuid(client_id),
        event_id: EventId::from_uuid(event_id),
        created_at,
        cancelled_at,
        status: ReservationStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Serialization(format!("unknown reservation status: {status}"))
        })?,
        total_amount: from_db_cents(total_cents)?,
        line_items,
    })
}

fn payment_from_row(row: PaymentRow) -> RepositoryResult<Payment> {
    let (id, reservation_id, amount_cents, status, method, reference, failure_reason, created_at) =
        row;
    Ok(Payment {
        id: PaymentId::from_uuid(id),
        reservation_id: ReservationId::from_uuid(reservation_id),
        amount: from_db_cents(amount_cents)?,
        created_at,
        status: PaymentStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Serialization(format!("unknown payment status: {status}"))
        })?,
        method: serde_json::from_value(method)
            .map_err(|e| RepositoryError::Serialization(format!("payment method: {e}")))?,
        transaction_reference: reference,
        failure_reason,
    })
}

/// `PostgreSQL`-backed [`TicketingRepository`].
#[derive(Clone, Debug)]
pub struct PostgresTicketingRepository {
    pool: PgPool,
}

impl PostgresTicketingRepository {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the pool settings in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if the pool cannot connect.
    pub async fn connect(config: &PostgresConfig) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .idle_timeout(Duration::from_secs(config.idle_timeout))
            .connect(&config.url)
            .await
            .map_err(db("connect"))?;

        tracing::info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self::from_pool(pool))
    }

    /// Run the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Database`] if a migration fails.
    pub async fn migrate(&self) -> RepositoryResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_event(&self, event: Event) -> RepositoryResult<()> {
        let category = serde_json::to_value(&event.category)
            .map_err(|e| RepositoryError::Serialization(format!("event category: {e}")))?;
        let mut tx = self.pool.begin().await.map_err(db("begin transaction"))?;

        sqlx::query(
            "INSERT INTO events (id, organizer_id, name, venue, category, starts_at, active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(event.id.as_uuid())
        .bind(event.organizer_id.as_uuid())
        .bind(&event.name)
        .bind(&event.venue)
        .bind(category)
        .bind(event.starts_at)
        .bind(event.active)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await
        .map_err(write_err("insert event", "event", event.id))?;

        for tier in Tier::ALL {
            sqlx::query(
                "INSERT INTO event_tiers (event_id, tier, capacity, sold, price_cents)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(event.id.as_uuid())
            .bind(tier.as_str())
            .bind(to_db_count(*event.capacity.get(tier))?)
            .bind(to_db_count(*event.sold.get(tier))?)
            .bind(to_db_cents(*event.prices.get(tier))?)
            .execute(&mut *tx)
            .await
            .map_err(db("insert event tier"))?;
        }

        tx.commit().await.map_err(db("commit event"))
    }

    async fn fetch_event(&self, event_id: EventId) -> RepositoryResult<Event> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                .bind(event_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db("load event"))?;
        let row = row.ok_or_else(|| RepositoryError::not_found("event", event_id))?;

        let tiers: Vec<TierRow> =
            sqlx::query_as(&format!("SELECT {TIER_COLUMNS} FROM event_tiers WHERE event_id = $1"))
                .bind(event_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(db("load event tiers"))?;

        event_from_rows(row, &tiers)
    }

    async fn update_event(&self, event: Event) -> RepositoryResult<()> {
        let category = serde_json::to_value(&event.category)
            .map_err(|e| RepositoryError::Serialization(format!("event category: {e}")))?;
        let mut tx = self.pool.begin().await.map_err(db("begin transaction"))?;

        let updated = sqlx::query(
            "UPDATE events SET name = $2, venue = $3, category = $4, starts_at = $5, active = $6
             WHERE id = $1",
        )
        .bind(event.id.as_uuid())
        .bind(&event.name)
        .bind(&event.venue)
        .bind(category)
        .bind(event.starts_at)
        .bind(event.active)
        .execute(&mut *tx)
        .await
        .map_err(db("update event"))?;
        if updated.rows_affected() == 0 {
            return Err(RepositoryError::not_found("event", event.id));
        }

        for tier in Tier::ALL {
            let capacity = to_db_count(*event.capacity.get(tier))?;
            let updated = sqlx::query(
                "UPDATE event_tiers SET capacity = $3, price_cents = $4
                 WHERE event_id = $1 AND tier = $2 AND sold <= $3",
            )
            .bind(event.id.as_uuid())
            .bind(tier.as_str())
            .bind(capacity)
            .bind(to_db_cents(*event.prices.get(tier))?)
            .execute(&mut *tx)
            .await
            .map_err(db("update event tier"))?;
            if updated.rows_affected() == 0 {
                return Err(RepositoryError::Conflict(format!(
                    "{tier} capacity {capacity} is below sold"
                )));
            }
        }

        tx.commit().await.map_err(db("commit event update"))
    }

    async fn fetch_events(&self) -> RepositoryResult<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY starts_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db("list events"))?;

        let tiers: Vec<TierRow> = sqlx::query_as(&format!("SELECT {TIER_COLUMNS} FROM event_tiers"))
            .fetch_all(&self.pool)
            .await
            .map_err(db("list event tiers"))?;
        let mut by_event: HashMap<Uuid, Vec<TierRow>> = HashMap::new();
        for tier in tiers {
            by_event.entry(tier.0).or_default().push(tier);
        }

        rows.into_iter()
            .map(|row| {
                let tiers = by_event.remove(&row.0).unwrap_or_default();
                event_from_rows(row, &tiers)
            })
            .collect()
    }

    async fn reserve(
        &self,
        event_id: EventId,
        tier: Tier,
        quantity: u32,
    ) -> RepositoryResult<ReserveOutcome> {
        let quantity = to_db_count(quantity)?;
        let reserved: Option<(i32,)> = sqlx::query_as(
            "UPDATE event_tiers SET sold = sold + $3
             WHERE event_id = $1 AND tier = $2 AND sold + $3 <= capacity
             RETURNING capacity - sold",
        )
        .bind(event_id.as_uuid())
        .bind(tier.as_str())
        .bind(quantity)
        .fetch_optional(&self.pool)
        .await
        .map_err(db("reserve capacity"))?;

        if let Some((remaining,)) = reserved {
            return Ok(ReserveOutcome::Reserved {
                remaining: from_db_count(remaining)?,
            });
        }

        let current: Option<(i32,)> = sqlx::query_as(
            "SELECT capacity - sold FROM event_tiers WHERE event_id = $1 AND tier = $2",
        )
        .bind(event_id.as_uuid())
        .bind(tier.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db("read remaining capacity"))?;

        match current {
            Some((available,)) => Ok(ReserveOutcome::Insufficient {
                available: from_db_count(available)?,
            }),
            None => Err(RepositoryError::not_found("event", event_id)),
        }
    }

    async fn release(&self, event_id: EventId, tier: Tier, quantity: u32) -> RepositoryResult<u32> {
        let released: Option<(i32,)> = sqlx::query_as(
            "WITH current AS (
                 SELECT sold FROM event_tiers WHERE event_id = $1 AND tier = $2 FOR UPDATE
             )
             UPDATE event_tiers t SET sold = GREATEST(t.sold - $3, 0)
             FROM current
             WHERE t.event_id = $1 AND t.tier = $2
             RETURNING LEAST(current.sold, $3)",
        )
        .bind(event_id.as_uuid())
        .bind(tier.as_str())
        .bind(to_db_count(quantity)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db("release capacity"))?;

        match released {
            Some((released,)) => from_db_count(released),
            None => Err(RepositoryError::not_found("event", event_id)),
        }
    }

    async fn insert_reservation(&self, reservation: Reservation) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO reservations (id, client_id, event_id, status, total_cents, created_at, cancelled_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.client_id.as_uuid())
        .bind(reservation.event_id.as_uuid())
        .bind(reservation.status.as_str())
        .bind(to_db_cents(reservation.total_amount)?)
        .bind(reservation.created_at)
        .bind(reservation.cancelled_at)
        .execute(&self.pool)
        .await
        .map_err(write_err("insert reservation", "reservation", reservation.id))?;
        Ok(())
    }

    async fn insert_line_items(&self, items: Vec<ReservationLineItem>) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(db("begin transaction"))?;
        for item in &items {
            sqlx::query(
                "INSERT INTO reservation_line_items
                     (reservation_id, tier, quantity, unit_price_cents, subtotal_cents)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(item.reservation_id.as_uuid())
            .bind(item.tier.as_str())
            .bind(to_db_count(item.quantity)?)
            .bind(to_db_cents(item.unit_price)?)
            .bind(to_db_cents(item.subtotal)?)
            .execute(&mut *tx)
            .await
            .map_err(write_err("insert line item", "reservation", item.reservation_id))?;
        }
        tx.commit().await.map_err(db("commit line items"))
    }

    /// `NotFound` if the reservation is absent, `Conflict` otherwise. Called
    /// after a guarded update touched no rows.
    async fn reservation_write_refused(&self, reservation_id: ReservationId) -> RepositoryError {
        let exists: Result<Option<(String,)>, _> =
            sqlx::query_as("SELECT status FROM reservations WHERE id = $1")
                .bind(reservation_id.as_uuid())
                .fetch_optional(&self.pool)
                .await;
        match exists {
            Ok(Some(_)) => {
                RepositoryError::Conflict(format!("reservation {reservation_id} is cancelled"))
            }
            Ok(None) => RepositoryError::not_found("reservation", reservation_id),
            Err(e) => db("load reservation status")(e),
        }
    }

    async fn update_reservation(&self, reservation: Reservation) -> RepositoryResult<()> {
        let updated = sqlx::query(
            "UPDATE reservations SET status = $2, cancelled_at = $3
             WHERE id = $1 AND status <> 'CANCELLED'",
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.status.as_str())
        .bind(reservation.cancelled_at)
        .execute(&self.pool)
        .await
        .map_err(db("update reservation"))?;

        if updated.rows_affected() == 0 {
            return Err(self.reservation_write_refused(reservation.id).await);
        }
        Ok(())
    }

    async fn fetch_line_items(
        &self,
        reservation_ids: &[Uuid],
    ) -> RepositoryResult<HashMap<Uuid, Vec<ReservationLineItem>>> {
        let rows: Vec<LineItemRow> = sqlx::query_as(&format!(
            "SELECT {LINE_ITEM_COLUMNS} FROM reservation_line_items WHERE reservation_id = ANY($1)"
        ))
        .bind(reservation_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db("load line items"))?;

        let mut grouped: HashMap<Uuid, Vec<ReservationLineItem>> = HashMap::new();
        for row in rows {
            let key = row.0;
            grouped.entry(key).or_default().push(line_item_from_row(row)?);
        }
        Ok(grouped)
    }

    async fn fetch_reservations(
        &self,
        filter: &str,
        order: &str,
        id: Uuid,
    ) -> RepositoryResult<Vec<Reservation>> {
        let rows: Vec<ReservationRow> = sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE {filter} = $1 ORDER BY {order}"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(db("list reservations"))?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.0).collect();
        let mut items = self.fetch_line_items(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let line_items = items.remove(&row.0).unwrap_or_default();
                reservation_from_row(row, line_items)
            })
            .collect()
    }

    async fn fetch_reservation(&self, reservation_id: ReservationId) -> RepositoryResult<Reservation> {
        self.fetch_reservations("id", "created_at", *reservation_id.as_uuid())
            .await?
            .pop()
            .ok_or_else(|| RepositoryError::not_found("reservation", reservation_id))
    }

    async fn cancel(&self, reservation: Reservation) -> RepositoryResult<()> {
        let mut tx = self.pool.begin().await.map_err(db("begin transaction"))?;

        let cancelled: Option<(Uuid,)> = sqlx::query_as(
            "UPDATE reservations SET status = 'CANCELLED', cancelled_at = $2
             WHERE id = $1 AND status <> 'CANCELLED'
             RETURNING event_id",
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.cancelled_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db("cancel reservation"))?;

        let Some((event_id,)) = cancelled else {
            drop(tx);
            return Err(self.reservation_write_refused(reservation.id).await);
        };

        let mut held: Vec<(String, i32)> = sqlx::query_as(
            "SELECT tier, quantity FROM reservation_line_items WHERE reservation_id = $1",
        )
        .bind(reservation.id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(db("load held quantities"))?;
        held.sort();

        for (tier, quantity) in held {
            sqlx::query(
                "UPDATE event_tiers SET sold = GREATEST(sold - $3, 0)
                 WHERE event_id = $1 AND tier = $2",
            )
            .bind(event_id)
            .bind(&tier)
            .bind(quantity)
            .execute(&mut *tx)
            .await
            .map_err(db("release cancelled capacity"))?;
        }

        tx.commit().await.map_err(db("commit cancellation"))
    }

    async fn insert_payment(&self, payment: Payment) -> RepositoryResult<()> {
        let method = serde_json::to_value(&payment.method)
            .map_err(|e| RepositoryError::Serialization(format!("payment method: {e}")))?;
        sqlx::query(
            "INSERT INTO payments
                 (id, reservation_id, amount_cents, status, method, transaction_reference, failure_reason, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(payment.id.as_uuid())
        .bind(payment.reservation_id.as_uuid())
        .bind(to_db_cents(payment.amount)?)
        .bind(payment.status.as_str())
        .bind(method)
        .bind(&payment.transaction_reference)
        .bind(&payment.failure_reason)
        .bind(payment.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_err("insert payment", "reservation", payment.reservation_id))?;
        Ok(())
    }

    async fn update_payment(&self, payment: Payment) -> RepositoryResult<()> {
        let updated = sqlx::query(
            "UPDATE payments SET status = $2, transaction_reference = $3, failure_reason = $4
             WHERE id = $1",
        )
        .bind(payment.id.as_uuid())
        .bind(payment.status.as_str())
        .bind(&payment.transaction_reference)
        .bind(&payment.failure_reason)
        .execute(&self.pool)
        .await
        .map_err(db("update payment"))?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::not_found("payment", payment.id));
        }
        Ok(())
    }

    async fn fetch_payments(&self, reservation_id: ReservationId) -> RepositoryResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE reservation_id = $1 ORDER BY created_at, id"
        ))
        .bind(reservation_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db("list payments"))?;

        rows.into_iter().map(payment_from_row).collect()
    }

    async fn recount(&self, event_id: EventId) -> RepositoryResult<SoldRecount> {
        let mut tx = self.pool.begin().await.map_err(db("begin transaction"))?;

        let tiers: Vec<TierRow> = sqlx::query_as(&format!(
            "SELECT {TIER_COLUMNS} FROM event_tiers WHERE event_id = $1 ORDER BY tier FOR UPDATE"
        ))
        .bind(event_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(db("lock event tiers"))?;
        if tiers.is_empty() {
            return Err(RepositoryError::not_found("event", event_id));
        }

        let sums: Vec<(String, i64)> = sqlx::query_as(
            "SELECT li.tier, COALESCE(SUM(li.quantity), 0)::BIGINT
             FROM reservation_line_items li
             JOIN reservations r ON r.id = li.reservation_id
             WHERE r.event_id = $1 AND r.status <> 'CANCELLED'
             GROUP BY li.tier",
        )
        .bind(event_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(db("sum held quantities"))?;

        let mut held = TierMap::uniform(0_u32);
        for (tier, sum) in sums {
            *held.get_mut(parse_tier(&tier)?) = u32::try_from(sum).unwrap_or(u32::MAX);
        }

        let mut before = TierMap::uniform(0_u32);
        let mut capacity = TierMap::uniform(0_u32);
        for (_, tier, tier_capacity, tier_sold, _) in &tiers {
            let tier = parse_tier(tier)?;
            *before.get_mut(tier) = from_db_count(*tier_sold)?;
            *capacity.get_mut(tier) = from_db_count(*tier_capacity)?;
        }
        let after = held.map(|tier, held| (*held).min(*capacity.get(tier)));

        for tier in Tier::ALL {
            if before.get(tier) == after.get(tier) {
                continue;
            }
            sqlx::query("UPDATE event_tiers SET sold = $3 WHERE event_id = $1 AND tier = $2")
                .bind(event_id.as_uuid())
                .bind(tier.as_str())
                .bind(to_db_count(*after.get(tier))?)
                .execute(&mut *tx)
                .await
                .map_err(db("store recomputed sold"))?;
        }

        tx.commit().await.map_err(db("commit recount"))?;
        Ok(SoldRecount {
            before,
            after,
            held,
            capacity,
        })
    }
}

impl TicketingRepository for PostgresTicketingRepository {
    fn create_event(&self, event: Event) -> RepositoryFuture<'_, ()> {
        Box::pin(self.insert_event(event))
    }

    fn load_event(&self, event_id: EventId) -> RepositoryFuture<'_, Event> {
        Box::pin(self.fetch_event(event_id))
    }

    fn save_event(&self, event: Event) -> RepositoryFuture<'_, ()> {
        Box::pin(self.update_event(event))
    }

    fn list_events(&self) -> RepositoryFuture<'_, Vec<Event>> {
        Box::pin(self.fetch_events())
    }

    fn reserve_capacity(
        &self,
        event_id: EventId,
        tier: Tier,
        quantity: u32,
    ) -> RepositoryFuture<'_, ReserveOutcome> {
        Box::pin(self.reserve(event_id, tier, quantity))
    }

    fn release_capacity(
        &self,
        event_id: EventId,
        tier: Tier,
        quantity: u32,
    ) -> RepositoryFuture<'_, u32> {
        Box::pin(self.release(event_id, tier, quantity))
    }

    fn create_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()> {
        Box::pin(self.insert_reservation(reservation))
    }

    fn create_line_items(&self, items: Vec<ReservationLineItem>) -> RepositoryFuture<'_, ()> {
        Box::pin(self.insert_line_items(items))
    }

    fn save_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()> {
        Box::pin(self.update_reservation(reservation))
    }

    fn load_reservation(&self, reservation_id: ReservationId) -> RepositoryFuture<'_, Reservation> {
        Box::pin(self.fetch_reservation(reservation_id))
    }

    fn load_line_items(
        &self,
        reservation_id: ReservationId,
    ) -> RepositoryFuture<'_, Vec<ReservationLineItem>> {
        Box::pin(async move {
            let mut items = self
                .fetch_line_items(&[*reservation_id.as_uuid()])
                .await?
                .remove(reservation_id.as_uuid())
                .unwrap_or_default();
            items.sort_by_key(|item| item.tier);
            Ok(items)
        })
    }

    fn cancel_reservation(&self, reservation: Reservation) -> RepositoryFuture<'_, ()> {
        Box::pin(self.cancel(reservation))
    }

    fn create_payment(&self, payment: Payment) -> RepositoryFuture<'_, ()> {
        Box::pin(self.insert_payment(payment))
    }

    fn save_payment(&self, payment: Payment) -> RepositoryFuture<'_, ()> {
        Box::pin(self.update_payment(payment))
    }

    fn list_payments(&self, reservation_id: ReservationId) -> RepositoryFuture<'_, Vec<Payment>> {
        Box::pin(self.fetch_payments(reservation_id))
    }

    fn list_reservations_by_client(
        &self,
        client_id: ClientId,
    ) -> RepositoryFuture<'_, Vec<Reservation>> {
        Box::pin(self.fetch_reservations(
            "client_id",
            "created_at DESC, id",
            *client_id.as_uuid(),
        ))
    }

    fn list_reservations_by_event(
        &self,
        event_id: EventId,
    ) -> RepositoryFuture<'_, Vec<Reservation>> {
        Box::pin(self.fetch_reservations("event_id", "created_at, id", *event_id.as_uuid()))
    }

    fn recompute_sold(&self, event_id: EventId) -> RepositoryFuture<'_, SoldRecount> {
        Box::pin(self.recount(event_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_counts_are_rejected() {
        assert!(matches!(
            from_db_count(-1),
            Err(RepositoryError::Serialization(_))
        ));
        assert_eq!(from_db_count(7), Ok(7));
        assert!(to_db_count(u32::MAX).is_err());
    }

    #[test]
    fn line_items_are_sorted_by_tier() {
        let id = Uuid::new_v4();
        let items = vec![
            line_item_from_row((id, "vip".to_string(), 1, 2500, 2500)),
            line_item_from_row((id, "standard".to_string(), 2, 1000, 2000)),
        ]
        .into_iter()
        .collect::<RepositoryResult<Vec<_>>>();
        let row: ReservationRow = (
            id,
            Uuid::new_v4(),
            Uuid::new_v4(),
            "PENDING_PAYMENT".to_string(),
            4500,
            Utc::now(),
            None,
        );
        let reservation = items.and_then(|items| reservation_from_row(row, items));
        let tiers: Vec<Tier> = reservation
            .map(|r| r.line_items.iter().map(|item| item.tier).collect())
            .unwrap_or_default();
        assert_eq!(tiers, vec![Tier::Standard, Tier::Vip]);
    }

    #[test]
    fn unknown_status_is_a_serialization_error() {
        let row: ReservationRow = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "EXPIRED".to_string(),
            0,
            Utc::now(),
            None,
        );
        assert!(matches!(
            reservation_from_row(row, Vec::new()),
            Err(RepositoryError::Serialization(_))
        ));
    }
}
