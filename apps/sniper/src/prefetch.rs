use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};

use crate::api_client::UpstreamApi;
use crate::models::AccountExclusions;
use crate::store::Store;

/// Bounded parallelism for `getUpcomingReservations` fan-out.
const PREFETCH_CONCURRENCY: usize = 5;

/// Runs once per window opening: fetches each unique user's upcoming
/// reservations and builds the same-day exclusion set the Coordinator
/// consults before starting any processor. Fails open per
/// user — a failed fetch leaves that user with an empty exclusion list
/// rather than blocking the window.
pub async fn build_account_exclusions(
    store: &Store,
    api: &Arc<dyn UpstreamApi>,
    user_ids: &[i64],
    target_date: NaiveDate,
) -> AccountExclusions {
    let unique: Vec<i64> = user_ids.iter().copied().collect::<HashSet<_>>().into_iter().collect();

    let results = stream::iter(unique)
        .map(|user_id| {
            let api = Arc::clone(api);
            let user = store.user_by_id(user_id);
            async move {
                let Some(user) = user else {
                    return (user_id, None);
                };
                let Some(auth_token) = user.auth_token.clone() else {
                    return (user_id, None);
                };
                match api.get_upcoming_reservations(&auth_token, None).await {
                    Ok(reservations) => (user_id, Some(reservations)),
                    Err(e) => {
                        tracing::warn!(user_id, error = %e, "prefetch failed for user, fail-open (no exclusions)");
                        (user_id, None)
                    }
                }
            }
        })
        .buffer_unordered(PREFETCH_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    let mut exclusions = AccountExclusions::default();
    for (user_id, reservations) in results {
        match reservations {
            Some(reservations) => {
                let same_day: Vec<_> = reservations.into_iter().filter(|r| r.date == target_date).collect();
                if !same_day.is_empty() {
                    tracing::info!(user_id, %target_date, count = same_day.len(), "user already has a reservation on target date");
                }
                exclusions.reservations_by_user.insert(user_id, same_day);
            }
            None => {
                exclusions.fetch_failed_users.insert(user_id);
            }
        }
    }

    exclusions
}

/// Collects the unique user ids with a live subscription in this window.
pub fn window_user_ids(subscriptions: &[crate::models::FullSubscription]) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for fs in subscriptions {
        if seen.insert(fs.user.id) {
            out.push(fs.user.id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{BookResult, BookToken};
    use crate::error::ApiError;
    use crate::models::{CalendarDay, Slot, UpcomingReservation, User};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeApi {
        by_token: Mutex<HashMap<String, Result<Vec<UpcomingReservation>, ()>>>,
    }

    #[async_trait]
    impl UpstreamApi for FakeApi {
        async fn find_slots(&self, _v: &str, _d: NaiveDate, _p: i64, _proxy: Option<&str>) -> Result<Vec<Slot>, ApiError> {
            Ok(vec![])
        }
        async fn get_details(&self, _v: &str, _d: NaiveDate, _p: i64, _c: &str, _a: &str, _proxy: Option<&str>) -> Result<Option<BookToken>, ApiError> {
            Ok(None)
        }
        async fn book(&self, _t: &str, _p: i64, _proxy: Option<&str>) -> Result<BookResult, ApiError> {
            Ok(BookResult { reservation_id: "r".into(), confirmation_token: "c".into() })
        }
        async fn cancel(&self, _t: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn get_upcoming_reservations(&self, user_auth_token: &str, _proxy: Option<&str>) -> Result<Vec<UpcomingReservation>, ApiError> {
            match self.by_token.lock().unwrap().get(user_auth_token) {
                Some(Ok(rs)) => Ok(rs.clone()),
                Some(Err(())) => Err(ApiError::classify(500, None, "boom".into())),
                None => Ok(vec![]),
            }
        }
        async fn get_calendar(&self, _v: &str, _p: i64, _s: NaiveDate, _e: NaiveDate, _proxy: Option<&str>) -> Result<Vec<CalendarDay>, ApiError> {
            Ok(vec![])
        }
    }

    async fn memory_store() -> Store {
        let pool = sqlx::sqlite::SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        Store::bootstrap(pool).await.unwrap()
    }

    #[tokio::test]
    async fn excludes_user_with_same_day_reservation() {
        let store = memory_store().await;
        store.upsert_user(User { id: 1, chat_id: 1, auth_token: Some("tok-1".into()), payment_method_id: Some(9) }).await;
        let target_date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();

        let mut by_token = HashMap::new();
        by_token.insert(
            "tok-1".to_string(),
            Ok(vec![UpcomingReservation { date: target_date, venue_id: "v1".into(), venue_name: "Test".into(), time: "19:00".into() }]),
        );
        let api: Arc<dyn UpstreamApi> = Arc::new(FakeApi { by_token: Mutex::new(by_token) });

        let exclusions = build_account_exclusions(&store, &api, &[1], target_date).await;
        assert!(exclusions.is_excluded(1, target_date));
        assert!(exclusions.fetch_failed_users.is_empty());
    }

    #[tokio::test]
    async fn fails_open_on_fetch_error() {
        let store = memory_store().await;
        store.upsert_user(User { id: 2, chat_id: 2, auth_token: Some("tok-2".into()), payment_method_id: Some(9) }).await;
        let target_date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();

        let mut by_token = HashMap::new();
        by_token.insert("tok-2".to_string(), Err(()));
        let api: Arc<dyn UpstreamApi> = Arc::new(FakeApi { by_token: Mutex::new(by_token) });

        let exclusions = build_account_exclusions(&store, &api, &[2], target_date).await;
        assert!(!exclusions.is_excluded(2, target_date));
        assert!(exclusions.fetch_failed_users.contains(&2));
    }

    #[tokio::test]
    async fn user_missing_auth_token_is_skipped_without_calling_api() {
        let store = memory_store().await;
        store.upsert_user(User { id: 3, chat_id: 3, auth_token: None, payment_method_id: None }).await;
        let target_date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let api: Arc<dyn UpstreamApi> = Arc::new(FakeApi { by_token: Mutex::new(HashMap::new()) });

        let exclusions = build_account_exclusions(&store, &api, &[3], target_date).await;
        assert!(exclusions.fetch_failed_users.contains(&3));
    }
}
