//! In-process ledger with the same locking contract as Postgres: a unit of
//! work holds per-slot and per-row async mutexes until it ends, and its
//! writes stay staged until commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{Ledger, LedgerTx};
use crate::directory::Directory;
use crate::error::{BookingError, Result};
use crate::models::{
    BookingFilter, BookingId, BookingRecord, BookingRow, BookingStatus, Customer, NewBookingRow,
    NewUser, Provider, ProviderFee, ProviderId, ProviderPage, User, ROLE_CUSTOMER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Slot(ProviderId, NaiveDate),
    Booking(BookingId),
}

#[derive(Default)]
struct LockTable {
    locks: StdMutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl LockTable {
    fn handle(&self, key: LockKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Entries nobody holds or waits on can go.
        locks.retain(|k, m| *k == key || Arc::strong_count(m) > 1);
        locks.entry(key).or_default().clone()
    }
}

#[derive(Debug, Clone)]
struct StoredBooking {
    id: BookingId,
    customer_id: i32,
    pandit_id: ProviderId,
    puja_type: String,
    puja_date: NaiveDate,
    puja_time: NaiveTime,
    location: String,
    total_amount: i32,
    notes: String,
    status: BookingStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredProvider {
    id: ProviderId,
    user_id: i32,
    expertise: String,
    experience: i32,
    rating: f64,
    fee: i32,
    location: String,
    image_url: String,
    bio: String,
    available: bool,
}

#[derive(Default)]
struct State {
    users: BTreeMap<i32, User>,
    providers: BTreeMap<ProviderId, StoredProvider>,
    bookings: BTreeMap<BookingId, StoredBooking>,
    next_user_id: i32,
    next_provider_id: ProviderId,
}

impl State {
    fn record(&self, booking: &StoredBooking) -> BookingRecord {
        let customer = self.users.get(&booking.customer_id);
        let pandit_name = self
            .providers
            .get(&booking.pandit_id)
            .and_then(|p| self.users.get(&p.user_id))
            .map(|u| u.name.clone())
            .unwrap_or_default();
        BookingRecord {
            id: booking.id,
            customer_id: booking.customer_id,
            pandit_id: booking.pandit_id,
            puja_type: booking.puja_type.clone(),
            puja_date: booking.puja_date,
            puja_time: booking.puja_time,
            location: booking.location.clone(),
            total_amount: booking.total_amount,
            notes: booking.notes.clone(),
            status: booking.status,
            created_at: booking.created_at,
            updated_at: booking.updated_at,
            customer_name: customer.map(|u| u.name.clone()).unwrap_or_default(),
            customer_phone: customer.map(|u| u.phone.clone()).unwrap_or_default(),
            pandit_name,
        }
    }

    fn provider(&self, stored: &StoredProvider) -> Provider {
        let user = self.users.get(&stored.user_id);
        Provider {
            id: stored.id,
            user_id: stored.user_id,
            name: user.map(|u| u.name.clone()).unwrap_or_default(),
            email: user.map(|u| u.email.clone()).unwrap_or_default(),
            phone: user.map(|u| u.phone.clone()).unwrap_or_default(),
            expertise: stored.expertise.clone(),
            experience: stored.experience,
            rating: stored.rating,
            fee: stored.fee,
            location: stored.location.clone(),
            image_url: stored.image_url.clone(),
            bio: stored.bio.clone(),
            available: stored.available,
        }
    }

    fn active_in_slot(
        &self,
        pandit_id: ProviderId,
        date: NaiveDate,
        excluding: Option<BookingId>,
    ) -> Vec<BookingId> {
        self.bookings
            .values()
            .filter(|b| b.pandit_id == pandit_id && b.puja_date == date && b.status.is_active())
            .filter(|b| Some(b.id) != excluding)
            .map(|b| b.id)
            .collect()
    }

    /// Newest first, like `ORDER BY created_at DESC, id DESC`.
    fn sorted_records(&self) -> Vec<BookingRecord> {
        let mut records: Vec<BookingRecord> =
            self.bookings.values().map(|b| self.record(b)).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        records
    }
}

#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<RwLock<State>>,
    locks: Arc<LockTable>,
    next_booking_id: Arc<AtomicI32>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        Ok(Box::new(MemoryTx {
            ledger: self.clone(),
            held: HashSet::new(),
            guards: Vec::new(),
            writes: Vec::new(),
        }))
    }

    async fn count_active(&self, pandit_id: ProviderId, date: NaiveDate) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state.active_in_slot(pandit_id, date, None).len() as i64)
    }

    async fn get(&self, id: BookingId) -> Result<Option<BookingRecord>> {
        let state = self.state.read().await;
        Ok(state.bookings.get(&id).map(|b| state.record(b)))
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<BookingRecord>> {
        let state = self.state.read().await;
        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        Ok(state
            .sorted_records()
            .into_iter()
            .filter(|r| filter.matches(r))
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn delete(&self, id: BookingId) -> Result<bool> {
        Ok(self.state.write().await.bookings.remove(&id).is_some())
    }
}

enum StagedWrite {
    Insert(StoredBooking),
    Status(BookingId, BookingStatus),
}

pub struct MemoryTx {
    ledger: MemoryLedger,
    held: HashSet<LockKey>,
    guards: Vec<OwnedMutexGuard<()>>,
    writes: Vec<StagedWrite>,
}

impl MemoryTx {
    async fn acquire(&mut self, key: LockKey) {
        if self.held.insert(key) {
            let guard = self.ledger.locks.handle(key).lock_owned().await;
            self.guards.push(guard);
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_active(
        &mut self,
        pandit_id: ProviderId,
        date: NaiveDate,
        excluding: Option<BookingId>,
    ) -> Result<Vec<BookingId>> {
        self.acquire(LockKey::Slot(pandit_id, date)).await;

        let candidates = self
            .ledger
            .state
            .read()
            .await
            .active_in_slot(pandit_id, date, excluding);
        for id in &candidates {
            self.acquire(LockKey::Booking(*id)).await;
        }

        // Rows may have changed while we waited for them.
        let state = self.ledger.state.read().await;
        Ok(candidates
            .into_iter()
            .filter(|id| state.bookings.get(id).map_or(false, |b| b.status.is_active()))
            .collect())
    }

    async fn find_booking(&mut self, id: BookingId) -> Result<Option<BookingRow>> {
        let state = self.ledger.state.read().await;
        Ok(state.bookings.get(&id).map(|b| BookingRow {
            id: b.id,
            pandit_id: b.pandit_id,
            puja_date: b.puja_date,
            status: b.status,
        }))
    }

    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<BookingRow>> {
        self.acquire(LockKey::Booking(id)).await;
        let state = self.ledger.state.read().await;
        Ok(state.bookings.get(&id).map(|b| BookingRow {
            id: b.id,
            pandit_id: b.pandit_id,
            puja_date: b.puja_date,
            status: b.status,
        }))
    }

    async fn find_customer_by_phone(&mut self, phone: &str) -> Result<Option<Customer>> {
        let state = self.ledger.state.read().await;
        Ok(state
            .users
            .values()
            .find(|u| u.phone == phone && u.role == ROLE_CUSTOMER)
            .map(|u| Customer {
                id: u.id,
                name: u.name.clone(),
            }))
    }

    async fn find_provider(&mut self, id: ProviderId) -> Result<Option<ProviderFee>> {
        let state = self.ledger.state.read().await;
        Ok(state.providers.get(&id).map(|p| ProviderFee {
            fee: p.fee,
            available: p.available,
        }))
    }

    async fn insert(&mut self, booking: NewBookingRow) -> Result<BookingId> {
        // Ids are not reused after a rollback, same as a Postgres sequence.
        let id = self.ledger.next_booking_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        self.writes.push(StagedWrite::Insert(StoredBooking {
            id,
            customer_id: booking.customer_id,
            pandit_id: booking.pandit_id,
            puja_type: booking.puja_type,
            puja_date: booking.puja_date,
            puja_time: booking.puja_time,
            location: booking.location,
            total_amount: booking.total_amount,
            notes: booking.notes,
            status: booking.status,
            created_at: now,
            updated_at: now,
        }));
        Ok(id)
    }

    async fn update_status(&mut self, id: BookingId, status: BookingStatus) -> Result<()> {
        self.writes.push(StagedWrite::Status(id, status));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx {
            ledger,
            guards,
            writes,
            ..
        } = *self;
        {
            let mut state = ledger.state.write().await;
            for write in writes {
                match write {
                    StagedWrite::Insert(booking) => {
                        state.bookings.insert(booking.id, booking);
                    }
                    StagedWrite::Status(id, status) => {
                        if let Some(booking) = state.bookings.get_mut(&id) {
                            booking.status = status;
                            booking.updated_at = Utc::now();
                        }
                    }
                }
            }
        }
        // Locks are released only once the writes are visible.
        drop(guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Directory for MemoryLedger {
    async fn register(&self, user: NewUser) -> Result<i32> {
        let mut state = self.state.write().await;
        if state
            .users
            .values()
            .any(|u| u.email == user.email || u.phone == user.phone)
        {
            return Err(BookingError::AlreadyRegistered);
        }

        state.next_user_id += 1;
        let user_id = state.next_user_id;
        state.users.insert(
            user_id,
            User {
                id: user_id,
                name: user.name,
                email: user.email,
                phone: user.phone,
                role: user.role,
                created_at: Utc::now(),
            },
        );

        if let Some(profile) = user.pandit {
            state.next_provider_id += 1;
            let id = state.next_provider_id;
            state.providers.insert(
                id,
                StoredProvider {
                    id,
                    user_id,
                    expertise: profile.expertise,
                    experience: profile.experience,
                    rating: 0.0,
                    fee: profile.fee,
                    location: profile.location,
                    image_url: profile.image_url,
                    bio: profile.bio,
                    available: true,
                },
            );
        }
        Ok(user_id)
    }

    async fn list_users(&self, role: Option<&str>) -> Result<Vec<User>> {
        let state = self.state.read().await;
        let mut users: Vec<User> = state
            .users
            .values()
            .filter(|u| role.map_or(true, |r| u.role == r))
            .cloned()
            .collect();
        users.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(users)
    }

    async fn list_providers(&self, page: ProviderPage) -> Result<Vec<Provider>> {
        let state = self.state.read().await;
        let mut providers: Vec<&StoredProvider> =
            state.providers.values().filter(|p| p.available).collect();
        providers.sort_by(|a, b| {
            b.rating
                .total_cmp(&a.rating)
                .then(b.experience.cmp(&a.experience))
                .then(a.id.cmp(&b.id))
        });
        Ok(providers
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(|p| state.provider(p))
            .collect())
    }

    async fn get_provider(&self, id: ProviderId) -> Result<Option<Provider>> {
        let state = self.state.read().await;
        Ok(state.providers.get(&id).map(|p| state.provider(p)))
    }
}

#[cfg(test)]
impl MemoryLedger {
    /// Returns the pandit id for a pandit user.
    pub async fn provider_id_for_user(&self, user_id: i32) -> Option<ProviderId> {
        let state = self.state.read().await;
        state
            .providers
            .values()
            .find(|p| p.user_id == user_id)
            .map(|p| p.id)
    }

    pub async fn set_provider_fee(&self, id: ProviderId, fee: i32) {
        if let Some(p) = self.state.write().await.providers.get_mut(&id) {
            p.fee = fee;
        }
    }

    pub async fn set_provider_available(&self, id: ProviderId, available: bool) {
        if let Some(p) = self.state.write().await.providers.get_mut(&id) {
            p.available = available;
        }
    }

    pub async fn set_provider_rating(&self, id: ProviderId, rating: f64) {
        if let Some(p) = self.state.write().await.providers.get_mut(&id) {
            p.rating = rating;
        }
    }

    pub async fn booking_count(&self) -> usize {
        self.state.read().await.bookings.len()
    }
}
