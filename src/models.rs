use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub type BookingId = i32;
pub type ProviderId = i32;

pub const ROLE_CUSTOMER: &str = "customer";
pub const ROLE_PANDIT: &str = "pandit";

pub const DEFAULT_FEE: i32 = 5000;
pub const DEFAULT_IMAGE_URL: &str =
    "https://images.unsplash.com/photo-1506794778202-cad84cf45f1d?w=400";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Assigned,
    OnTheWay,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 6] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Assigned,
        BookingStatus::OnTheWay,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
    ];

    /// Statuses that count against the one-booking-per-date rule.
    pub const ACTIVE: [BookingStatus; 4] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Assigned,
        BookingStatus::OnTheWay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Assigned => "assigned",
            BookingStatus::OnTheWay => "on_the_way",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            BookingStatus::Pending => 0,
            BookingStatus::Confirmed => 1,
            BookingStatus::Assigned => 2,
            BookingStatus::OnTheWay => 3,
            BookingStatus::Completed => 4,
            BookingStatus::Cancelled => 5,
        }
    }

    /// Strict lifecycle: forward along the happy path (skips allowed),
    /// cancel from any non-terminal state, terminal states are final.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match next {
            BookingStatus::Cancelled => true,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn valid_values() -> String {
        Self::ALL
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown booking status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl TryFrom<String> for BookingStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A booking joined with the names the dashboard shows next to it.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct BookingRecord {
    pub id: BookingId,
    pub customer_id: i32,
    pub pandit_id: ProviderId,
    pub puja_type: String,
    pub puja_date: NaiveDate,
    pub puja_time: NaiveTime,
    pub location: String,
    pub total_amount: i32,
    pub notes: String,
    #[sqlx(try_from = "String")]
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub customer_name: String,
    pub customer_phone: String,
    pub pandit_name: String,
}

/// The columns of a locked booking row needed to decide a status change.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct BookingRow {
    pub id: BookingId,
    pub pandit_id: ProviderId,
    pub puja_date: NaiveDate,
    #[sqlx(try_from = "String")]
    pub status: BookingStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBookingRow {
    pub customer_id: i32,
    pub pandit_id: ProviderId,
    pub puja_type: String,
    pub puja_date: NaiveDate,
    pub puja_time: NaiveTime,
    pub location: String,
    pub total_amount: i32,
    pub notes: String,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingCreated {
    pub booking_id: BookingId,
    pub total_amount: i32,
    pub status: BookingStatus,
}

/// Validated booking request; only built by `BookingRequest::validate`.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingInput {
    pub customer_phone: String,
    pub pandit_id: ProviderId,
    pub puja_type: String,
    pub puja_date: NaiveDate,
    pub puja_time: NaiveTime,
    pub location: String,
    pub notes: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub pandit_id: Option<ProviderId>,
    pub date: Option<NaiveDate>,
    pub customer_phone: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl BookingFilter {
    pub fn matches(&self, record: &BookingRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self.pandit_id.map_or(true, |p| record.pandit_id == p)
            && self.date.map_or(true, |d| record.puja_date == d)
            && self
                .customer_phone
                .as_deref()
                .map_or(true, |phone| record.customer_phone == phone)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Customer {
    pub id: i32,
    pub name: String,
}

/// What the booking transaction needs to know about a pandit.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ProviderFee {
    pub fee: i32,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Provider {
    pub id: ProviderId,
    pub user_id: i32,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub expertise: String,
    pub experience: i32,
    pub rating: f64,
    pub fee: i32,
    pub location: String,
    pub image_url: String,
    pub bio: String,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub role: String,
    pub pandit: Option<NewPanditProfile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPanditProfile {
    pub expertise: String,
    pub experience: i32,
    pub location: String,
    pub fee: i32,
    pub image_url: String,
    pub bio: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderPage {
    pub limit: i64,
    pub offset: i64,
}

impl ProviderPage {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Self {
        ProviderPage {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

impl Default for ProviderPage {
    fn default() -> Self {
        Self::new(None, None)
    }
}
