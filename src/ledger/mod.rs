//! Booking storage.
//!
//! The ledger is the source of truth for conflict detection. Writers go
//! through a [`LedgerTx`] unit of work that holds a dedicated connection and
//! the locks it took until `commit`/`rollback`. Dropping an unfinished unit
//! of work rolls it back and releases both.
//!
//! Lock order is slot first, then booking rows. A unit of work locks at most
//! one slot.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use log::info;

use crate::config::{Config, LedgerBackend};
use crate::db::BoxError;
use crate::directory::Directory;
use crate::error::Result;
use crate::models::{
    BookingFilter, BookingId, BookingRecord, BookingRow, BookingStatus, Customer, NewBookingRow,
    ProviderFee, ProviderId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Acquires a connection and opens a transaction on it.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Non-locking count of active bookings for a pandit on a date.
    async fn count_active(&self, pandit_id: ProviderId, date: NaiveDate) -> Result<i64>;

    async fn get(&self, id: BookingId) -> Result<Option<BookingRecord>>;

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<BookingRecord>>;

    /// Administrative hard delete. Returns false when nothing matched.
    async fn delete(&self, id: BookingId) -> Result<bool>;
}

#[async_trait]
pub trait LedgerTx: Send {
    /// Locks the (pandit, date) slot and every active booking in it, then
    /// returns the ids of those bookings. Blocks while another unit of work
    /// holds the same slot.
    async fn lock_active(
        &mut self,
        pandit_id: ProviderId,
        date: NaiveDate,
        excluding: Option<BookingId>,
    ) -> Result<Vec<BookingId>>;

    /// Reads a booking row without locking it.
    async fn find_booking(&mut self, id: BookingId) -> Result<Option<BookingRow>>;

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<BookingRow>>;

    async fn find_customer_by_phone(&mut self, phone: &str) -> Result<Option<Customer>>;

    async fn find_provider(&mut self, id: ProviderId) -> Result<Option<ProviderFee>>;

    async fn insert(&mut self, booking: NewBookingRow) -> Result<BookingId>;

    async fn update_status(&mut self, id: BookingId, status: BookingStatus) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens the configured backend. Both handles point at the same store.
pub async fn init_ledger(
    config: &Config,
) -> std::result::Result<(Arc<dyn Ledger>, Arc<dyn Directory>), BoxError> {
    match config.backend {
        LedgerBackend::Postgres => {
            let pool = crate::db::get_db_pool(config).await?;
            crate::db::ensure_schema(&pool).await?;
            info!("Ledger: postgres");
            let ledger = Arc::new(PgLedger::new(pool));
            let directory: Arc<dyn Directory> = ledger.clone();
            Ok((ledger as Arc<dyn Ledger>, directory))
        }
        LedgerBackend::Memory => {
            info!("Ledger: in-memory (data is lost on exit)");
            let ledger = Arc::new(MemoryLedger::new());
            let directory: Arc<dyn Directory> = ledger.clone();
            Ok((ledger as Arc<dyn Ledger>, directory))
        }
    }
}
