//! Booking operations.
//!
//! `create_booking` is the only path that inserts bookings. It takes the
//! slot lock before deciding whether the pandit is free, so two requests for
//! the same pandit and date are decided one after the other.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use log::{debug, error, info, warn};
use serde::Deserialize;

use crate::error::{BookingError, Result};
use crate::ledger::{Ledger, LedgerTx};
use crate::models::{
    BookingCreated, BookingFilter, BookingId, BookingInput, BookingRecord, BookingStatus,
    NewBookingRow, ProviderId,
};

/// Raw booking request as posted by the frontend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingRequest {
    pub customer_phone: Option<String>,
    pub pandit_id: Option<ProviderId>,
    pub puja_type: Option<String>,
    pub puja_date: Option<String>,
    pub puja_time: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        BookingError::Validation(format!("Invalid date `{}`, expected YYYY-MM-DD", value))
    })
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| {
            BookingError::Validation(format!("Invalid time `{}`, expected HH:MM", value))
        })
}

impl BookingRequest {
    pub fn validate(self) -> Result<BookingInput> {
        let (
            Some(customer_phone),
            Some(pandit_id),
            Some(puja_type),
            Some(puja_date),
            Some(puja_time),
            Some(location),
        ) = (
            non_blank(self.customer_phone),
            self.pandit_id,
            non_blank(self.puja_type),
            non_blank(self.puja_date),
            non_blank(self.puja_time),
            non_blank(self.location),
        )
        else {
            return Err(BookingError::Validation("All fields are required".into()));
        };

        if pandit_id <= 0 {
            return Err(BookingError::Validation(format!(
                "Invalid pandit id {}",
                pandit_id
            )));
        }

        Ok(BookingInput {
            customer_phone,
            pandit_id,
            puja_type,
            puja_date: parse_date(&puja_date)?,
            puja_time: parse_time(&puja_time)?,
            location,
            notes: self.notes.map(|n| n.trim().to_string()).unwrap_or_default(),
        })
    }
}

#[derive(Clone)]
pub struct BookingService {
    ledger: Arc<dyn Ledger>,
    strict_transitions: bool,
}

impl BookingService {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            strict_transitions: false,
        }
    }

    pub fn with_strict_transitions(mut self, strict: bool) -> Self {
        self.strict_transitions = strict;
        self
    }

    pub async fn create_booking(&self, request: BookingRequest) -> Result<BookingCreated> {
        let input = request.validate()?;

        let mut tx = self.ledger.begin().await?;
        match create_in(&mut *tx, &input).await {
            Ok(created) => {
                tx.commit().await?;
                info!(
                    "Booking created: ID {} | Pandit {} | Date {}",
                    created.booking_id, input.pandit_id, input.puja_date
                );
                Ok(created)
            }
            Err(e) => {
                rollback(tx).await;
                match &e {
                    BookingError::Conflict { existing_booking_id } => warn!(
                        "Booking conflict: Pandit {} already booked on {} (booking {})",
                        input.pandit_id, input.puja_date, existing_booking_id
                    ),
                    BookingError::Storage(cause) => error!("Error creating booking: {}", cause),
                    other => info!("Booking rejected: {}", other),
                }
                Err(e)
            }
        }
    }

    /// Advisory only: the answer can be stale as soon as it is returned.
    pub async fn check_availability(&self, pandit_id: ProviderId, date: NaiveDate) -> Result<bool> {
        Ok(self.ledger.count_active(pandit_id, date).await? == 0)
    }

    pub async fn set_booking_status(&self, id: BookingId, status: &str) -> Result<BookingStatus> {
        let status: BookingStatus = status
            .parse()
            .map_err(|_| BookingError::InvalidStatus(status.to_string()))?;

        let mut tx = self.ledger.begin().await?;
        match set_status_in(&mut *tx, id, status, self.strict_transitions).await {
            Ok(()) => {
                tx.commit().await?;
                info!("Booking {} status updated to: {}", id, status);
                Ok(status)
            }
            Err(e) => {
                rollback(tx).await;
                if let BookingError::Storage(cause) = &e {
                    error!("Error updating status of booking {}: {}", id, cause);
                }
                Err(e)
            }
        }
    }

    pub async fn get_booking(&self, id: BookingId) -> Result<BookingRecord> {
        self.ledger
            .get(id)
            .await?
            .ok_or(BookingError::NotFound("Booking"))
    }

    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<BookingRecord>> {
        self.ledger.list(filter).await
    }

    /// Administrative removal; not subject to the one-per-date rule.
    pub async fn delete_booking(&self, id: BookingId) -> Result<()> {
        if self.ledger.delete(id).await? {
            info!("Booking {} deleted", id);
            Ok(())
        } else {
            Err(BookingError::NotFound("Booking"))
        }
    }
}

async fn rollback(tx: Box<dyn LedgerTx>) {
    if let Err(e) = tx.rollback().await {
        error!("Rollback failed: {}", e);
    }
}

async fn create_in(tx: &mut dyn LedgerTx, input: &BookingInput) -> Result<BookingCreated> {
    let conflicts = tx
        .lock_active(input.pandit_id, input.puja_date, None)
        .await?;
    if let Some(&existing_booking_id) = conflicts.first() {
        return Err(BookingError::Conflict { existing_booking_id });
    }

    let customer = tx
        .find_customer_by_phone(&input.customer_phone)
        .await?
        .ok_or(BookingError::NotRegistered)?;
    debug!("Customer {} ({}) resolved for booking", customer.id, customer.name);

    let provider = tx
        .find_provider(input.pandit_id)
        .await?
        .ok_or(BookingError::NotFound("Pandit"))?;
    if !provider.available {
        return Err(BookingError::ProviderUnavailable);
    }

    let status = BookingStatus::Confirmed;
    let booking_id = tx
        .insert(NewBookingRow {
            customer_id: customer.id,
            pandit_id: input.pandit_id,
            puja_type: input.puja_type.clone(),
            puja_date: input.puja_date,
            puja_time: input.puja_time,
            location: input.location.clone(),
            total_amount: provider.fee,
            notes: input.notes.clone(),
            status,
        })
        .await?;

    Ok(BookingCreated {
        booking_id,
        total_amount: provider.fee,
        status,
    })
}

async fn set_status_in(
    tx: &mut dyn LedgerTx,
    id: BookingId,
    status: BookingStatus,
    strict: bool,
) -> Result<()> {
    // An active target may claim the slot again, so take the slot lock
    // before the row lock. Pandit and date never change after insert.
    let mut slot_conflicts = Vec::new();
    if status.is_active() {
        let booking = tx
            .find_booking(id)
            .await?
            .ok_or(BookingError::NotFound("Booking"))?;
        slot_conflicts = tx
            .lock_active(booking.pandit_id, booking.puja_date, Some(id))
            .await?;
    }

    let current = tx
        .lock_booking(id)
        .await?
        .ok_or(BookingError::NotFound("Booking"))?;
    debug!("Booking {} is {}, moving to {}", current.id, current.status, status);

    if strict && !current.status.can_transition_to(status) {
        return Err(BookingError::InvalidTransition {
            from: current.status,
            to: status,
        });
    }

    if status.is_active() && !current.status.is_active() {
        if let Some(&existing_booking_id) = slot_conflicts.first() {
            return Err(BookingError::Conflict { existing_booking_id });
        }
    }

    tx.update_status(id, status).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::directory::Directory;
    use crate::ledger::MemoryLedger;
    use crate::models::{BookingRow, Customer, NewPanditProfile, NewUser, ProviderFee};

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        service: BookingService,
        pandit_id: ProviderId,
    }

    async fn register_customer(ledger: &MemoryLedger, phone: &str) {
        ledger
            .register(NewUser {
                name: format!("Customer {phone}"),
                email: format!("{phone}@example.com"),
                phone: phone.to_string(),
                role: "customer".into(),
                pandit: None,
            })
            .await
            .unwrap();
    }

    async fn register_pandit(ledger: &MemoryLedger, phone: &str, fee: i32) -> ProviderId {
        let user_id = ledger
            .register(NewUser {
                name: format!("Pandit {phone}"),
                email: format!("{phone}@example.com"),
                phone: phone.to_string(),
                role: "pandit".into(),
                pandit: Some(NewPanditProfile {
                    expertise: "Griha Puja".into(),
                    experience: 7,
                    location: "Kathmandu".into(),
                    fee,
                    image_url: String::new(),
                    bio: String::new(),
                }),
            })
            .await
            .unwrap();
        ledger.provider_id_for_user(user_id).await.unwrap()
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        register_customer(&ledger, "9800000001").await;
        register_customer(&ledger, "9800000002").await;
        let pandit_id = register_pandit(&ledger, "9811111111", 5500).await;
        let service = BookingService::new(ledger.clone());
        Fixture {
            ledger,
            service,
            pandit_id,
        }
    }

    fn request(phone: &str, pandit_id: ProviderId, date: &str) -> BookingRequest {
        BookingRequest {
            customer_phone: Some(phone.into()),
            pandit_id: Some(pandit_id),
            puja_type: Some("Griha Puja".into()),
            puja_date: Some(date.into()),
            puja_time: Some("10:00".into()),
            location: Some("Baneshwor, Kathmandu".into()),
            notes: None,
        }
    }

    /// Memory ledger whose units of work fail on every write.
    struct BrokenWrites {
        inner: Arc<MemoryLedger>,
        rolled_back: Arc<AtomicBool>,
    }

    struct BrokenWritesTx {
        inner: Box<dyn LedgerTx>,
        rolled_back: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Ledger for BrokenWrites {
        async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
            Ok(Box::new(BrokenWritesTx {
                inner: self.inner.begin().await?,
                rolled_back: self.rolled_back.clone(),
            }))
        }

        async fn count_active(&self, pandit_id: ProviderId, date: NaiveDate) -> Result<i64> {
            self.inner.count_active(pandit_id, date).await
        }

        async fn get(&self, id: BookingId) -> Result<Option<BookingRecord>> {
            self.inner.get(id).await
        }

        async fn list(&self, filter: &BookingFilter) -> Result<Vec<BookingRecord>> {
            self.inner.list(filter).await
        }

        async fn delete(&self, id: BookingId) -> Result<bool> {
            self.inner.delete(id).await
        }
    }

    #[async_trait]
    impl LedgerTx for BrokenWritesTx {
        async fn lock_active(
            &mut self,
            pandit_id: ProviderId,
            date: NaiveDate,
            excluding: Option<BookingId>,
        ) -> Result<Vec<BookingId>> {
            self.inner.lock_active(pandit_id, date, excluding).await
        }

        async fn find_booking(&mut self, id: BookingId) -> Result<Option<BookingRow>> {
            self.inner.find_booking(id).await
        }

        async fn lock_booking(&mut self, id: BookingId) -> Result<Option<BookingRow>> {
            self.inner.lock_booking(id).await
        }

        async fn find_customer_by_phone(&mut self, phone: &str) -> Result<Option<Customer>> {
            self.inner.find_customer_by_phone(phone).await
        }

        async fn find_provider(&mut self, id: ProviderId) -> Result<Option<ProviderFee>> {
            self.inner.find_provider(id).await
        }

        async fn insert(&mut self, _booking: NewBookingRow) -> Result<BookingId> {
            Err(sqlx::Error::PoolTimedOut.into())
        }

        async fn update_status(&mut self, _id: BookingId, _status: BookingStatus) -> Result<()> {
            Err(sqlx::Error::PoolTimedOut.into())
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            self.rolled_back.store(true, Ordering::SeqCst);
            self.inner.rollback().await
        }
    }

    fn broken(f: &Fixture) -> (BookingService, Arc<AtomicBool>) {
        let rolled_back = Arc::new(AtomicBool::new(false));
        let ledger = BrokenWrites {
            inner: f.ledger.clone(),
            rolled_back: rolled_back.clone(),
        };
        (BookingService::new(Arc::new(ledger)), rolled_back)
    }

    fn may_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 1).unwrap()
    }

    #[tokio::test]
    async fn booking_a_free_pandit_confirms_at_current_fee() {
        let f = fixture().await;
        assert!(f.service.check_availability(f.pandit_id, may_first()).await.unwrap());

        let created = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();
        assert_eq!(created.status, BookingStatus::Confirmed);
        assert_eq!(created.total_amount, 5500);

        let record = f.service.get_booking(created.booking_id).await.unwrap();
        assert_eq!(record.status, BookingStatus::Confirmed);
        assert_eq!(record.total_amount, 5500);
        assert_eq!(record.customer_phone, "9800000001");
        assert_eq!(record.puja_time, NaiveTime::from_hms_opt(10, 0, 0).unwrap());
        assert_eq!(record.notes, "");
        assert!(!f.service.check_availability(f.pandit_id, may_first()).await.unwrap());
    }

    #[tokio::test]
    async fn second_booking_for_same_date_conflicts_with_first() {
        let f = fixture().await;
        let first = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();

        let second = f
            .service
            .create_booking(request("9800000002", f.pandit_id, "2025-05-01"))
            .await;
        match second {
            Err(BookingError::Conflict { existing_booking_id }) => {
                assert_eq!(existing_booking_id, first.booking_id)
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(f.ledger.booking_count().await, 1);

        // Another day is still free.
        f.service
            .create_booking(request("9800000002", f.pandit_id, "2025-05-02"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unregistered_phone_is_rejected_without_a_write() {
        let f = fixture().await;
        let result = f
            .service
            .create_booking(request("9899999999", f.pandit_id, "2025-05-01"))
            .await;
        assert!(matches!(result, Err(BookingError::NotRegistered)));
        assert_eq!(f.ledger.booking_count().await, 0);
        assert!(f.service.check_availability(f.pandit_id, may_first()).await.unwrap());
    }

    #[tokio::test]
    async fn pandit_phone_is_not_a_customer() {
        let f = fixture().await;
        let result = f
            .service
            .create_booking(request("9811111111", f.pandit_id, "2025-05-01"))
            .await;
        assert!(matches!(result, Err(BookingError::NotRegistered)));
    }

    #[tokio::test]
    async fn unavailable_pandit_is_rejected() {
        let f = fixture().await;
        f.ledger.set_provider_available(f.pandit_id, false).await;
        let result = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await;
        assert!(matches!(result, Err(BookingError::ProviderUnavailable)));
        assert_eq!(f.ledger.booking_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_pandit_is_not_found() {
        let f = fixture().await;
        let result = f
            .service
            .create_booking(request("9800000001", 999, "2025-05-01"))
            .await;
        assert!(matches!(result, Err(BookingError::NotFound("Pandit"))));
        assert_eq!(f.ledger.booking_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_input_never_reaches_the_ledger() {
        let f = fixture().await;
        let mut missing_location = request("9800000001", f.pandit_id, "2025-05-01");
        missing_location.location = Some("  ".into());
        let bad_date = request("9800000001", f.pandit_id, "01/05/2025");
        let mut bad_time = request("9800000001", f.pandit_id, "2025-05-01");
        bad_time.puja_time = Some("morning".into());
        let bad_id = request("9800000001", 0, "2025-05-01");

        for request in [missing_location, bad_date, bad_time, bad_id] {
            let result = f.service.create_booking(request).await;
            assert!(matches!(result, Err(BookingError::Validation(_))));
        }
        assert_eq!(f.ledger.booking_count().await, 0);
    }

    #[tokio::test]
    async fn cancelling_frees_the_date() {
        let f = fixture().await;
        let first = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();

        let status = f
            .service
            .set_booking_status(first.booking_id, "cancelled")
            .await
            .unwrap();
        assert_eq!(status, BookingStatus::Cancelled);
        assert!(f.service.check_availability(f.pandit_id, may_first()).await.unwrap());

        let second = f
            .service
            .create_booking(request("9800000002", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();
        assert_ne!(second.booking_id, first.booking_id);
    }

    #[tokio::test]
    async fn reviving_a_cancelled_booking_conflicts_with_its_replacement() {
        let f = fixture().await;
        let first = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();
        f.service
            .set_booking_status(first.booking_id, "cancelled")
            .await
            .unwrap();
        let second = f
            .service
            .create_booking(request("9800000002", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();

        let revived = f
            .service
            .set_booking_status(first.booking_id, "pending")
            .await;
        match revived {
            Err(BookingError::Conflict { existing_booking_id }) => {
                assert_eq!(existing_booking_id, second.booking_id)
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        let record = f.service.get_booking(first.booking_id).await.unwrap();
        assert_eq!(record.status, BookingStatus::Cancelled);
    }

    #[tokio::test]
    async fn status_updates_validate_input() {
        let f = fixture().await;
        let created = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();

        assert!(matches!(
            f.service.set_booking_status(created.booking_id, "done").await,
            Err(BookingError::InvalidStatus(s)) if s == "done"
        ));
        assert!(matches!(
            f.service.set_booking_status(created.booking_id, " cancelled ").await,
            Err(BookingError::InvalidStatus(s)) if s == " cancelled "
        ));
        assert!(matches!(
            f.service.set_booking_status(created.booking_id, "Cancelled").await,
            Err(BookingError::InvalidStatus(_))
        ));
        assert!(matches!(
            f.service.set_booking_status(4242, "assigned").await,
            Err(BookingError::NotFound("Booking"))
        ));

        // Permissive by default: any valid status from any status.
        for status in ["completed", "pending", "on_the_way", "assigned"] {
            f.service
                .set_booking_status(created.booking_id, status)
                .await
                .unwrap();
        }
        let record = f.service.get_booking(created.booking_id).await.unwrap();
        assert_eq!(record.status, BookingStatus::Assigned);
        assert!(record.updated_at >= record.created_at);
    }

    #[tokio::test]
    async fn strict_mode_rejects_backward_moves() {
        let f = fixture().await;
        let service = f.service.clone().with_strict_transitions(true);
        let created = service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();

        service
            .set_booking_status(created.booking_id, "on_the_way")
            .await
            .unwrap();
        assert!(matches!(
            service.set_booking_status(created.booking_id, "pending").await,
            Err(BookingError::InvalidTransition {
                from: BookingStatus::OnTheWay,
                to: BookingStatus::Pending
            })
        ));
        service
            .set_booking_status(created.booking_id, "completed")
            .await
            .unwrap();
        assert!(matches!(
            service.set_booking_status(created.booking_id, "cancelled").await,
            Err(BookingError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn amount_is_a_snapshot_of_the_fee() {
        let f = fixture().await;
        let created = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();
        f.ledger.set_provider_fee(f.pandit_id, 9000).await;

        let record = f.service.get_booking(created.booking_id).await.unwrap();
        assert_eq!(record.total_amount, 5500);

        let later = f
            .service
            .create_booking(request("9800000002", f.pandit_id, "2025-05-03"))
            .await
            .unwrap();
        assert_eq!(later.total_amount, 9000);
    }

    #[tokio::test]
    async fn get_booking_is_stable_without_writes() {
        let f = fixture().await;
        let created = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();
        let first = f.service.get_booking(created.booking_id).await.unwrap();
        let second = f.service.get_booking(created.booking_id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn list_and_delete() {
        let f = fixture().await;
        let other = register_pandit(&f.ledger, "9822222222", 4000).await;
        let a = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();
        let b = f
            .service
            .create_booking(request("9800000002", other, "2025-05-01"))
            .await
            .unwrap();

        let all = f.service.list_bookings(&BookingFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let mine = f
            .service
            .list_bookings(&BookingFilter {
                pandit_id: Some(other),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b.booking_id]);

        let paged = f
            .service
            .list_bookings(&BookingFilter {
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);

        f.service.delete_booking(a.booking_id).await.unwrap();
        assert!(matches!(
            f.service.delete_booking(a.booking_id).await,
            Err(BookingError::NotFound("Booking"))
        ));
        assert!(matches!(
            f.service.get_booking(a.booking_id).await,
            Err(BookingError::NotFound("Booking"))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_for_one_slot_have_a_single_winner() {
        let f = fixture().await;
        let phones: Vec<String> = (0..24).map(|i| format!("97000000{i:02}")).collect();
        for phone in &phones {
            register_customer(&f.ledger, phone).await;
        }

        let mut handles = Vec::new();
        for phone in &phones {
            let service = f.service.clone();
            let request = request(phone, f.pandit_id, "2025-05-01");
            handles.push(tokio::spawn(async move { service.create_booking(request).await }));
        }

        let mut winners = Vec::new();
        let mut conflicts = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(created) => winners.push(created.booking_id),
                Err(BookingError::Conflict { existing_booking_id }) => {
                    conflicts.push(existing_booking_id)
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(conflicts.len(), phones.len() - 1);
        assert!(conflicts.iter().all(|id| *id == winners[0]));
        assert_eq!(f.ledger.booking_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mixed_creates_and_status_changes_keep_one_active_per_slot() {
        let f = fixture().await;
        let second_pandit = register_pandit(&f.ledger, "9833333333", 3000).await;
        let pandits = [f.pandit_id, second_pandit];
        let dates = ["2025-05-01", "2025-05-02"];
        let statuses = ["cancelled", "pending", "completed", "confirmed", "on_the_way"];

        let mut handles = Vec::new();
        for round in 0..40usize {
            let service = f.service.clone();
            let pandit = pandits[round % 2];
            let date = dates[(round / 2) % 2];
            let phone = if round % 3 == 0 { "9800000001" } else { "9800000002" };
            let status = statuses[round % statuses.len()];
            handles.push(tokio::spawn(async move {
                let _ = service.create_booking(request(phone, pandit, date)).await;
                let target = (round as BookingId % 6) + 1;
                let _ = service.set_booking_status(target, status).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut active: HashMap<(ProviderId, NaiveDate), usize> = HashMap::new();
        for record in f.service.list_bookings(&BookingFilter::default()).await.unwrap() {
            if record.status.is_active() {
                *active.entry((record.pandit_id, record.puja_date)).or_default() += 1;
            }
        }
        assert!(active.values().all(|count| *count <= 1), "{active:?}");
    }

    #[tokio::test]
    async fn failed_insert_rolls_back_and_frees_the_slot() {
        let f = fixture().await;
        let (service, rolled_back) = broken(&f);

        let result = service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await;
        assert!(matches!(result, Err(BookingError::Storage(_))));
        assert!(rolled_back.load(Ordering::SeqCst));
        assert_eq!(f.ledger.booking_count().await, 0);

        // The slot lock went with the rollback.
        let mut tx = f.ledger.begin().await.unwrap();
        let held = timeout(
            Duration::from_secs(1),
            tx.lock_active(f.pandit_id, may_first(), None),
        )
        .await
        .expect("slot must be free after rollback")
        .unwrap();
        assert!(held.is_empty());
        tx.rollback().await.unwrap();

        f.service
            .create_booking(request("9800000002", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_status_write_leaves_booking_untouched() {
        let f = fixture().await;
        let created = f
            .service
            .create_booking(request("9800000001", f.pandit_id, "2025-05-01"))
            .await
            .unwrap();
        let (service, rolled_back) = broken(&f);

        let result = service
            .set_booking_status(created.booking_id, "cancelled")
            .await;
        assert!(matches!(result, Err(BookingError::Storage(_))));
        assert!(rolled_back.load(Ordering::SeqCst));

        let record = f.service.get_booking(created.booking_id).await.unwrap();
        assert_eq!(record.status, BookingStatus::Confirmed);

        // Row lock released: a healthy writer goes straight through.
        timeout(
            Duration::from_secs(1),
            f.service.set_booking_status(created.booking_id, "assigned"),
        )
        .await
        .expect("row must be free after rollback")
        .unwrap();
    }
}
