use log::info;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use url::Url;

use crate::config::Config;
use crate::config::ConfigError;

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS users (
        id SERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        phone TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL CHECK (role IN ('customer', 'pandit')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS pandits (
        id SERIAL PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expertise TEXT NOT NULL,
        experience INTEGER NOT NULL DEFAULT 0,
        rating DOUBLE PRECISION NOT NULL DEFAULT 0,
        fee INTEGER NOT NULL DEFAULT 5000,
        location TEXT NOT NULL,
        image_url TEXT NOT NULL DEFAULT '',
        bio TEXT NOT NULL DEFAULT '',
        available BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE TABLE IF NOT EXISTS bookings (
        id SERIAL PRIMARY KEY,
        customer_id INTEGER NOT NULL REFERENCES users(id),
        pandit_id INTEGER NOT NULL REFERENCES pandits(id),
        puja_type TEXT NOT NULL,
        puja_date DATE NOT NULL,
        puja_time TIME NOT NULL,
        location TEXT NOT NULL,
        total_amount INTEGER NOT NULL,
        notes TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN
            ('pending', 'confirmed', 'assigned', 'on_the_way', 'completed', 'cancelled')),
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS bookings_pandit_date_idx ON bookings (pandit_id, puja_date)",
    // Backstop for the slot lock: one active booking per pandit and date.
    "CREATE UNIQUE INDEX IF NOT EXISTS bookings_one_active_per_slot ON bookings (pandit_id, puja_date)
        WHERE status IN ('pending', 'confirmed', 'assigned', 'on_the_way')",
    "CREATE INDEX IF NOT EXISTS bookings_created_at_idx ON bookings (created_at DESC)",
];

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub async fn get_db_pool(config: &Config) -> Result<PgPool, BoxError> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or(ConfigError::MissingDatabaseUrl)?;

    info!("Connecting to {}", redact(database_url));
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(database_url)
        .await?;
    info!("Database connected ({} max connections)", config.max_connections);
    Ok(pool)
}

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Drops credentials so the URL can be logged.
pub fn redact(database_url: &str) -> String {
    match Url::parse(database_url) {
        Ok(url) => format!(
            "{}://{}:{}{}",
            url.scheme(),
            url.host_str().unwrap_or("localhost"),
            url.port().unwrap_or(5432),
            url.path()
        ),
        Err(_) => "<unparseable database url>".to_string(),
    }
}
