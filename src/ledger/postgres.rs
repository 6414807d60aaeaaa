//! PostgreSQL ledger.
//!
//! `SELECT … FOR UPDATE` locks only rows that already exist, so an empty slot
//! would let two transactions through. Every slot check therefore first takes
//! `pg_advisory_xact_lock(pandit_id, days_since_epoch)`, which Postgres holds
//! until the transaction ends. The partial unique index created by
//! `db::ensure_schema` rejects anything that slips past both.

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use super::{Ledger, LedgerTx};
use crate::directory::Directory;
use crate::error::{BookingError, Result};
use crate::models::{
    BookingFilter, BookingId, BookingRecord, BookingRow, BookingStatus, Customer, NewBookingRow,
    NewUser, Provider, ProviderFee, ProviderId, ProviderPage, User, ROLE_CUSTOMER,
};

const BOOKING_SELECT: &str = "SELECT
        b.id, b.customer_id, b.pandit_id, b.puja_type, b.puja_date, b.puja_time,
        b.location, b.total_amount, b.notes, b.status, b.created_at, b.updated_at,
        u.name AS customer_name,
        u.phone AS customer_phone,
        pu.name AS pandit_name
    FROM bookings b
    INNER JOIN users u ON b.customer_id = u.id
    INNER JOIN pandits p ON b.pandit_id = p.id
    INNER JOIN users pu ON p.user_id = pu.id";

const PROVIDER_SELECT: &str = "SELECT
        p.id, p.user_id, u.name, u.email, u.phone, p.expertise, p.experience,
        p.rating, p.fee, p.location, p.image_url, p.bio, p.available
    FROM pandits p
    INNER JOIN users u ON p.user_id = u.id";

fn active_statuses() -> Vec<&'static str> {
    BookingStatus::ACTIVE.iter().map(|s| s.as_str()).collect()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map_or(false, |db| db.is_unique_violation())
}

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn count_active(&self, pandit_id: ProviderId, date: NaiveDate) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM bookings
             WHERE pandit_id = $1 AND puja_date = $2 AND status = ANY($3)",
        )
        .bind(pandit_id)
        .bind(date)
        .bind(active_statuses())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get(&self, id: BookingId) -> Result<Option<BookingRecord>> {
        let sql = format!("{BOOKING_SELECT} WHERE b.id = $1");
        let record = sqlx::query_as::<_, BookingRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<BookingRecord>> {
        let mut query = QueryBuilder::<Postgres>::new(BOOKING_SELECT);
        query.push(" WHERE TRUE");
        if let Some(status) = filter.status {
            query.push(" AND b.status = ").push_bind(status.as_str());
        }
        if let Some(pandit_id) = filter.pandit_id {
            query.push(" AND b.pandit_id = ").push_bind(pandit_id);
        }
        if let Some(date) = filter.date {
            query.push(" AND b.puja_date = ").push_bind(date);
        }
        if let Some(phone) = &filter.customer_phone {
            query.push(" AND u.phone = ").push_bind(phone.clone());
        }
        query.push(" ORDER BY b.created_at DESC, b.id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit.max(0));
        }
        if let Some(offset) = filter.offset {
            query.push(" OFFSET ").push_bind(offset.max(0));
        }

        let records = query
            .build_query_as::<BookingRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn delete(&self, id: BookingId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bookings WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Owns its pooled connection; dropping it rolls back and returns the
/// connection to the pool.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_active(
        &mut self,
        pandit_id: ProviderId,
        date: NaiveDate,
        excluding: Option<BookingId>,
    ) -> Result<Vec<BookingId>> {
        sqlx::query("SELECT pg_advisory_xact_lock($1, ($2::date - DATE '1970-01-01'))")
            .bind(pandit_id)
            .bind(date)
            .execute(&mut *self.tx)
            .await?;

        let ids = sqlx::query_scalar::<_, i32>(
            "SELECT id FROM bookings
             WHERE pandit_id = $1
             AND puja_date = $2
             AND status = ANY($3)
             AND ($4::int IS NULL OR id <> $4)
             ORDER BY id
             FOR UPDATE",
        )
        .bind(pandit_id)
        .bind(date)
        .bind(active_statuses())
        .bind(excluding)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(ids)
    }

    async fn find_booking(&mut self, id: BookingId) -> Result<Option<BookingRow>> {
        let row = sqlx::query_as::<_, BookingRow>(
            "SELECT id, pandit_id, puja_date, status FROM bookings WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<BookingRow>> {
        let row = sqlx::query_as::<_, BookingRow>(
            "SELECT id, pandit_id, puja_date, status FROM bookings WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_customer_by_phone(&mut self, phone: &str) -> Result<Option<Customer>> {
        let customer = sqlx::query_as::<_, Customer>(
            "SELECT id, name FROM users WHERE phone = $1 AND role = $2",
        )
        .bind(phone)
        .bind(ROLE_CUSTOMER)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(customer)
    }

    async fn find_provider(&mut self, id: ProviderId) -> Result<Option<ProviderFee>> {
        // FOR SHARE keeps fee and availability fixed until commit.
        let provider = sqlx::query_as::<_, ProviderFee>(
            "SELECT fee, available FROM pandits WHERE id = $1 FOR SHARE",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(provider)
    }

    async fn insert(&mut self, booking: NewBookingRow) -> Result<BookingId> {
        let id = sqlx::query_scalar::<_, i32>(
            "INSERT INTO bookings
             (customer_id, pandit_id, puja_type, puja_date, puja_time, location, total_amount, notes, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING id",
        )
        .bind(booking.customer_id)
        .bind(booking.pandit_id)
        .bind(&booking.puja_type)
        .bind(booking.puja_date)
        .bind(booking.puja_time)
        .bind(&booking.location)
        .bind(booking.total_amount)
        .bind(&booking.notes)
        .bind(booking.status.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn update_status(&mut self, id: BookingId, status: BookingStatus) -> Result<()> {
        sqlx::query("UPDATE bookings SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgLedgerTx { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let PgLedgerTx { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl Directory for PgLedger {
    async fn register(&self, user: NewUser) -> Result<i32> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_scalar::<_, i32>(
            "SELECT id FROM users WHERE email = $1 OR phone = $2 LIMIT 1",
        )
        .bind(&user.email)
        .bind(&user.phone)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            tx.rollback().await?;
            return Err(BookingError::AlreadyRegistered);
        }

        let user_id = sqlx::query_scalar::<_, i32>(
            "INSERT INTO users (name, email, phone, role) VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(&user.role)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BookingError::AlreadyRegistered
            } else {
                BookingError::Storage(e)
            }
        })?;

        if let Some(profile) = &user.pandit {
            sqlx::query(
                "INSERT INTO pandits (user_id, expertise, experience, location, fee, image_url, bio)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(user_id)
            .bind(&profile.expertise)
            .bind(profile.experience)
            .bind(&profile.location)
            .bind(profile.fee)
            .bind(&profile.image_url)
            .bind(&profile.bio)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(user_id)
    }

    async fn list_users(&self, role: Option<&str>) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT id, name, email, phone, role, created_at FROM users
             WHERE ($1::text IS NULL OR role = $1)
             ORDER BY created_at DESC, id DESC",
        )
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn list_providers(&self, page: ProviderPage) -> Result<Vec<Provider>> {
        let providers = sqlx::query_as::<_, Provider>(&format!(
            "{PROVIDER_SELECT}
             WHERE p.available = TRUE
             ORDER BY p.rating DESC, p.experience DESC, p.id
             LIMIT $1 OFFSET $2"
        ))
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(providers)
    }

    async fn get_provider(&self, id: ProviderId) -> Result<Option<Provider>> {
        let provider = sqlx::query_as::<_, Provider>(&format!("{PROVIDER_SELECT} WHERE p.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(provider)
    }
}
