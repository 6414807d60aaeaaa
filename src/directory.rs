//! Customers and pandits. The booking core only reads these; registration
//! is the one writer.

use async_trait::async_trait;

use crate::error::{BookingError, Result};
use crate::models::{
    NewPanditProfile, NewUser, Provider, ProviderId, ProviderPage, User, DEFAULT_FEE,
    DEFAULT_IMAGE_URL, ROLE_CUSTOMER, ROLE_PANDIT,
};

#[async_trait]
pub trait Directory: Send + Sync {
    /// Inserts the user and, for pandits, the profile in one transaction.
    async fn register(&self, user: NewUser) -> Result<i32>;

    async fn list_users(&self, role: Option<&str>) -> Result<Vec<User>>;

    /// Available pandits, best rated first.
    async fn list_providers(&self, page: ProviderPage) -> Result<Vec<Provider>>;

    async fn get_provider(&self, id: ProviderId) -> Result<Option<Provider>>;
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Option<String>,
    pub pandit_details: Option<PanditDetails>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PanditDetails {
    pub experience: Option<i32>,
    pub location: Option<String>,
    pub expertise: Option<String>,
    pub fee: Option<i32>,
    pub image_url: Option<String>,
    pub bio: Option<String>,
}

fn required(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RegisterRequest {
    pub fn validate(self) -> Result<NewUser> {
        let (Some(name), Some(email), Some(phone), Some(role)) = (
            required(self.name),
            required(self.email),
            required(self.phone),
            required(self.role),
        ) else {
            return Err(BookingError::Validation("All fields are required".into()));
        };

        let pandit = match role.as_str() {
            ROLE_CUSTOMER => None,
            ROLE_PANDIT => {
                let details = self.pandit_details.unwrap_or_default();
                let (Some(experience), Some(location), Some(expertise)) = (
                    details.experience,
                    required(details.location),
                    required(details.expertise),
                ) else {
                    return Err(BookingError::Validation(
                        "Pandit details (experience, location, expertise) are required".into(),
                    ));
                };
                if experience < 0 {
                    return Err(BookingError::Validation(
                        "Experience cannot be negative".into(),
                    ));
                }
                let fee = details.fee.unwrap_or(DEFAULT_FEE);
                if fee < 0 {
                    return Err(BookingError::Validation("Fee cannot be negative".into()));
                }
                Some(NewPanditProfile {
                    expertise,
                    experience,
                    location,
                    fee,
                    image_url: required(details.image_url)
                        .unwrap_or_else(|| DEFAULT_IMAGE_URL.to_string()),
                    bio: details.bio.unwrap_or_default(),
                })
            }
            other => {
                return Err(BookingError::Validation(format!(
                    "Unknown role `{}`. Must be customer or pandit",
                    other
                )))
            }
        };

        Ok(NewUser {
            name,
            email,
            phone,
            role,
            pandit,
        })
    }
}
