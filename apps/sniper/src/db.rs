use sqlx::SqlitePool;

use crate::models::{
    BookingAttempt, BookingStatus, DayConfig, PassiveTarget, Proxy, ProxyClass, Restaurant,
    Subscription, User, Weekday0,
};

/// Runs the schema forward the same way the teacher does: a `_migrations`
/// ledger table guarding idempotent `include_str!` SQL steps, applied once
/// each, in order.
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    apply_once(pool, "001_init", include_str!("../migrations/001_init.sql")).await?;

    tracing::info!("database migrations up to date");
    Ok(())
}

async fn apply_once(pool: &SqlitePool, name: &str, sql: &str) -> anyhow::Result<()> {
    let applied: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_one(pool)
            .await?;
    if applied {
        return Ok(());
    }
    for statement in sql.split(';') {
        let trimmed = statement.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await?;
    tracing::info!(migration = name, "applied migration");
    Ok(())
}

// ── Bootstrap loads (spec.md §4.B: "Loads, at startup, all enabled ...") ──

pub async fn load_restaurants(pool: &SqlitePool) -> anyhow::Result<Vec<Restaurant>> {
    Ok(sqlx::query_as::<_, Restaurant>(
        "SELECT id, venue_id, name, days_in_advance, release_time, release_timezone, enabled
         FROM restaurants WHERE enabled = 1",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn load_users(pool: &SqlitePool) -> anyhow::Result<Vec<User>> {
    Ok(
        sqlx::query_as::<_, User>("SELECT id, chat_id, auth_token, payment_method_id FROM users")
            .fetch_all(pool)
            .await?,
    )
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    user_id: i64,
    restaurant_id: i64,
    party_size: i64,
    window_start: String,
    window_end: String,
    table_types: Option<String>,
    day_configs: Option<String>,
    target_days: Option<String>,
    enabled: bool,
}

fn parse_table_types(raw: Option<String>) -> Option<Vec<String>> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn parse_day_configs(raw: Option<String>) -> Vec<DayConfig> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn parse_target_days(raw: Option<String>) -> Vec<Weekday0> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

impl From<SubscriptionRow> for Subscription {
    fn from(r: SubscriptionRow) -> Self {
        Subscription {
            id: r.id,
            user_id: r.user_id,
            restaurant_id: r.restaurant_id,
            party_size: r.party_size,
            window_start: r.window_start,
            window_end: r.window_end,
            table_types: parse_table_types(r.table_types),
            day_configs: parse_day_configs(r.day_configs),
            target_days: parse_target_days(r.target_days),
            enabled: r.enabled,
        }
    }
}

pub async fn load_subscriptions(pool: &SqlitePool) -> anyhow::Result<Vec<Subscription>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(
        "SELECT id, user_id, restaurant_id, party_size, window_start, window_end,
                table_types, day_configs, target_days, enabled
         FROM user_subscriptions WHERE enabled = 1",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Subscription::from).collect())
}

#[derive(sqlx::FromRow)]
struct PassiveTargetRow {
    id: i64,
    user_id: i64,
    restaurant_id: i64,
    party_size: i64,
    window_start: String,
    window_end: String,
    table_types: Option<String>,
    day_configs: Option<String>,
    target_days: Option<String>,
    enabled: bool,
}

impl From<PassiveTargetRow> for PassiveTarget {
    fn from(r: PassiveTargetRow) -> Self {
        PassiveTarget {
            id: r.id,
            user_id: r.user_id,
            restaurant_id: r.restaurant_id,
            party_size: r.party_size,
            window_start: r.window_start,
            window_end: r.window_end,
            table_types: parse_table_types(r.table_types),
            day_configs: parse_day_configs(r.day_configs),
            target_days: parse_target_days(r.target_days),
            enabled: r.enabled,
        }
    }
}

pub async fn load_passive_targets(pool: &SqlitePool) -> anyhow::Result<Vec<PassiveTarget>> {
    let rows = sqlx::query_as::<_, PassiveTargetRow>(
        "SELECT id, user_id, restaurant_id, party_size, window_start, window_end,
                table_types, day_configs, target_days, enabled
         FROM passive_targets WHERE enabled = 1",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(PassiveTarget::from).collect())
}

#[derive(sqlx::FromRow)]
struct ProxyRow {
    id: i64,
    url: String,
    class: String,
    last_used_at: Option<chrono::DateTime<chrono::Utc>>,
    rate_limited_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<ProxyRow> for Proxy {
    fn from(r: ProxyRow) -> Self {
        Proxy {
            id: r.id,
            url: r.url,
            class: if r.class == "isp" { ProxyClass::Isp } else { ProxyClass::Datacenter },
            last_used_at: r.last_used_at,
            rate_limited_until: r.rate_limited_until,
        }
    }
}

pub async fn load_proxies(pool: &SqlitePool) -> anyhow::Result<Vec<Proxy>> {
    let rows = sqlx::query_as::<_, ProxyRow>(
        "SELECT id, url, class, last_used_at, rate_limited_until FROM proxies WHERE enabled = 1",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Proxy::from).collect())
}

// ── Write-through mutations. Failures are logged by the caller (Store), ──
// ── never surfaced — these return a plain `sqlx::Result` for that purpose. ──

pub async fn upsert_user(pool: &SqlitePool, user: &User) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO users (id, chat_id, auth_token, payment_method_id)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            chat_id = excluded.chat_id,
            auth_token = excluded.auth_token,
            payment_method_id = excluded.payment_method_id",
    )
    .bind(user.id)
    .bind(user.chat_id)
    .bind(&user.auth_token)
    .bind(user.payment_method_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_subscription(pool: &SqlitePool, sub: &Subscription) -> sqlx::Result<()> {
    let table_types = sub.table_types.as_ref().map(|t| serde_json::to_string(t).unwrap());
    let day_configs = serde_json::to_string(&sub.day_configs).unwrap();
    let target_days = serde_json::to_string(&sub.target_days).unwrap();
    sqlx::query(
        "INSERT INTO user_subscriptions
            (user_id, restaurant_id, party_size, window_start, window_end,
             table_types, day_configs, target_days, enabled)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id, restaurant_id, party_size) DO UPDATE SET
            window_start = excluded.window_start,
            window_end = excluded.window_end,
            table_types = excluded.table_types,
            day_configs = excluded.day_configs,
            target_days = excluded.target_days,
            enabled = excluded.enabled",
    )
    .bind(sub.user_id)
    .bind(sub.restaurant_id)
    .bind(sub.party_size)
    .bind(&sub.window_start)
    .bind(&sub.window_end)
    .bind(table_types)
    .bind(day_configs)
    .bind(target_days)
    .bind(sub.enabled)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_subscription(pool: &SqlitePool, user_id: i64, restaurant_id: i64, party_size: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM user_subscriptions WHERE user_id = ? AND restaurant_id = ? AND party_size = ?")
        .bind(user_id)
        .bind(restaurant_id)
        .bind(party_size)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_proxy_used(pool: &SqlitePool, proxy_id: i64, at: chrono::DateTime<chrono::Utc>) -> sqlx::Result<()> {
    sqlx::query("UPDATE proxies SET last_used_at = ? WHERE id = ?")
        .bind(at)
        .bind(proxy_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_proxy_rate_limited(pool: &SqlitePool, proxy_id: i64, until: chrono::DateTime<chrono::Utc>) -> sqlx::Result<()> {
    sqlx::query("UPDATE proxies SET rate_limited_until = ? WHERE id = ?")
        .bind(until)
        .bind(proxy_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn create_booking_attempt(pool: &SqlitePool, attempt: &BookingAttempt) -> sqlx::Result<()> {
    let status = match attempt.status {
        BookingStatus::Pending => "pending",
        BookingStatus::Success => "success",
        BookingStatus::Failed => "failed",
        BookingStatus::SoldOut => "sold_out",
    };
    sqlx::query(
        "INSERT INTO booking_attempts
            (user_id, restaurant_id, target_date, slot_time, status, reservation_id, error_message, proxy_used)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(attempt.user_id)
    .bind(attempt.restaurant_id)
    .bind(attempt.target_date)
    .bind(&attempt.slot_time)
    .bind(status)
    .bind(&attempt.reservation_id)
    .bind(&attempt.error_message)
    .bind(attempt.proxy_used)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn log_booking_error(pool: &SqlitePool, user_id: i64, restaurant_id: i64, message: &str) -> sqlx::Result<()> {
    sqlx::query("INSERT INTO booking_errors (user_id, restaurant_id, message) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(restaurant_id)
        .bind(message)
        .execute(pool)
        .await?;
    Ok(())
}
