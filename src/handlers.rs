use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::booking::{parse_date, BookingRequest, BookingService};
use crate::directory::{Directory, RegisterRequest};
use crate::error::{BookingError, Result};
use crate::models::{BookingFilter, BookingId, ProviderId, ProviderPage, ROLE_PANDIT};

#[derive(Clone)]
pub struct AppState {
    pub bookings: BookingService,
    pub directory: Arc<dyn Directory>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/register", post(register))
        .route("/api/users", get(list_users))
        .route("/api/pandits", get(list_pandits))
        .route("/api/pandits/:id", get(get_pandit))
        .route("/api/pandits/:id/availability/:date", get(check_availability))
        .route("/api/bookings", post(create_booking).get(list_bookings))
        .route("/api/bookings/:id", get(get_booking).delete(delete_booking))
        .route("/api/bookings/:id/status", put(update_status))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| BookingError::Validation(rejection.body_text()))
}

fn path<T>(segments: std::result::Result<Path<T>, PathRejection>) -> Result<T> {
    segments
        .map(|Path(value)| value)
        .map_err(|rejection| BookingError::Validation(rejection.body_text()))
}

fn query<T>(params: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    params
        .map(|Query(value)| value)
        .map_err(|rejection| BookingError::Validation(rejection.body_text()))
}

async fn health() -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "Pandit Sewa API is running",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn register(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let user = body(payload)?.validate()?;
    let label = if user.role == ROLE_PANDIT { "Pandit" } else { "Customer" };
    let user_id = state.directory.register(user).await?;
    info!("{} registered: user {}", label, user_id);

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": format!("{label} registered successfully"),
            "userId": user_id,
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct UsersQuery {
    role: Option<String>,
}

async fn list_users(
    State(state): State<AppState>,
    params: std::result::Result<Query<UsersQuery>, QueryRejection>,
) -> Result<Json<Value>> {
    let params = query(params)?;
    let users = state.directory.list_users(params.role.as_deref()).await?;
    Ok(Json(json!({
        "success": true,
        "count": users.len(),
        "data": users,
    })))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_pandits(
    State(state): State<AppState>,
    params: std::result::Result<Query<PageQuery>, QueryRejection>,
) -> Result<Json<Value>> {
    let params = query(params)?;
    let page = ProviderPage::new(params.limit, params.offset);
    let pandits = state.directory.list_providers(page).await?;
    Ok(Json(json!({
        "success": true,
        "count": pandits.len(),
        "limit": page.limit,
        "offset": page.offset,
        "data": pandits,
    })))
}

async fn get_pandit(
    State(state): State<AppState>,
    id: std::result::Result<Path<ProviderId>, PathRejection>,
) -> Result<Json<Value>> {
    let id = path(id)?;
    let pandit = state
        .directory
        .get_provider(id)
        .await?
        .ok_or(BookingError::NotFound("Pandit"))?;
    Ok(Json(json!({ "success": true, "data": pandit })))
}

async fn check_availability(
    State(state): State<AppState>,
    segments: std::result::Result<Path<(ProviderId, String)>, PathRejection>,
) -> Result<Json<Value>> {
    let (id, date) = path(segments)?;
    let day = parse_date(&date)?;
    let available = state.bookings.check_availability(id, day).await?;
    Ok(Json(json!({
        "success": true,
        "available": available,
        "date": day,
        "pandit_id": id,
    })))
}

async fn create_booking(
    State(state): State<AppState>,
    payload: std::result::Result<Json<BookingRequest>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let created = state.bookings.create_booking(body(payload)?).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Booking created successfully",
            "booking_id": created.booking_id,
            "total_amount": created.total_amount,
            "status": created.status,
        })),
    ))
}

async fn list_bookings(
    State(state): State<AppState>,
    filter: std::result::Result<Query<BookingFilter>, QueryRejection>,
) -> Result<Json<Value>> {
    let filter = query(filter)?;
    let bookings = state.bookings.list_bookings(&filter).await?;
    Ok(Json(json!({
        "success": true,
        "count": bookings.len(),
        "data": bookings,
    })))
}

async fn get_booking(
    State(state): State<AppState>,
    id: std::result::Result<Path<BookingId>, PathRejection>,
) -> Result<Json<Value>> {
    let id = path(id)?;
    let booking = state.bookings.get_booking(id).await?;
    Ok(Json(json!({ "success": true, "data": booking })))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: Option<String>,
}

async fn update_status(
    State(state): State<AppState>,
    id: std::result::Result<Path<BookingId>, PathRejection>,
    payload: std::result::Result<Json<StatusUpdate>, JsonRejection>,
) -> Result<Json<Value>> {
    let id = path(id)?;
    let requested = body(payload)?.status.unwrap_or_default();
    let status = state.bookings.set_booking_status(id, &requested).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Status updated successfully",
        "new_status": status,
    })))
}

async fn delete_booking(
    State(state): State<AppState>,
    id: std::result::Result<Path<BookingId>, PathRejection>,
) -> Result<Json<Value>> {
    let id = path(id)?;
    state.bookings.delete_booking(id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Booking deleted successfully",
        "deleted_id": id,
    })))
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "message": "Route not found",
            "path": uri.path(),
        })),
    )
}
