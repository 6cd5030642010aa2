use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::{DashMap, DashSet};

use crate::api_client::UpstreamApi;
use crate::error::ApiErrorKind;
use crate::events::{EventSender, SniperEvent};
use crate::models::{
    AccountExclusions, BookingAttempt, BookingStatus, DayWindowed, FullSubscription, Proxy,
    Restaurant, Slot, Subscription, UserBookingResult,
};
use crate::proxy_pool::{ProxyPool, DEFAULT_ACQUIRE_TIMEOUT};
use crate::store::Store;

/// Booking-path proxy cooldown happens via `ProxyPool::mark_bad` (5 minutes).
/// The *user* rate-limit flag below has no timed expiry: it lasts for the
/// remainder of the current window, cleared on `reset()`.
const MAX_WAF_RETRIES: u32 = 2;

type ProcessorKey = (i64, i64, NaiveDate);
type ClaimKey = (i64, NaiveDate, String);

/// The per-(user, restaurant, date) sequential processor, claim arbitration,
/// and dedup state. This is the heart of the system: it consumes slot
/// events, acquires proxies, and drives the
/// claim -> acquire -> attempt -> classify -> release state machine.
pub struct Coordinator {
    store: Arc<Store>,
    pool: Arc<ProxyPool>,
    api: Arc<dyn UpstreamApi>,
    dry_run: bool,
    events: EventSender,

    active_processors: DashMap<ProcessorKey, ()>,
    successful_bookings: DashSet<ProcessorKey>,
    rate_limited_users: DashSet<i64>,
    auth_failed_users: DashSet<i64>,
    claimed_slots: DashMap<ClaimKey, i64>,
    account_exclusions: std::sync::RwLock<Option<AccountExclusions>>,
}

impl Coordinator {
    pub fn new(store: Arc<Store>, pool: Arc<ProxyPool>, api: Arc<dyn UpstreamApi>, dry_run: bool, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            store,
            pool,
            api,
            dry_run,
            events,
            active_processors: DashMap::new(),
            successful_bookings: DashSet::new(),
            rate_limited_users: DashSet::new(),
            auth_failed_users: DashSet::new(),
            claimed_slots: DashMap::new(),
            account_exclusions: std::sync::RwLock::new(None),
        })
    }

    /// Called at each window start: clears all sets
    /// and maps, but not the Proxy Pool itself, which is reset separately.
    pub fn reset(&self) {
        self.active_processors.clear();
        self.successful_bookings.clear();
        self.rate_limited_users.clear();
        self.auth_failed_users.clear();
        self.claimed_slots.clear();
        *self.account_exclusions.write().unwrap() = None;
    }

    pub fn set_account_exclusions(&self, exclusions: AccountExclusions) {
        *self.account_exclusions.write().unwrap() = Some(exclusions);
    }

    fn is_excluded(&self, user_id: i64, date: NaiveDate) -> bool {
        self.account_exclusions
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|ex| ex.is_excluded(user_id, date))
    }

    /// Atomic test-and-set. `true` iff the slot
    /// was unclaimed and is now held by `user_id`.
    fn try_claim_slot(&self, restaurant_id: i64, date: NaiveDate, slot_time: &str, user_id: i64) -> bool {
        use dashmap::mapref::entry::Entry;
        let key = (restaurant_id, date, slot_time.to_string());
        match self.claimed_slots.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(user_id);
                true
            }
        }
    }

    /// Idempotent no-op if `user_id` does not currently own the claim
    /// (spec.md §5 "Ordering guarantees").
    fn release_slot(&self, restaurant_id: i64, date: NaiveDate, slot_time: &str, user_id: i64) {
        let key = (restaurant_id, date, slot_time.to_string());
        self.claimed_slots.remove_if(&key, |_, owner| *owner == user_id);
    }

    /// spec.md §4.F "onSlotsDiscovered": resolves active subscriptions for
    /// `restaurant`, groups by user, starts a processor per user unless one
    /// is already active or a terminal state applies.
    pub fn on_slots_discovered(self: &Arc<Self>, restaurant: &Restaurant, slots: &[Slot]) {
        let full_subs: Vec<FullSubscription> = self
            .store
            .full_subscriptions()
            .into_iter()
            .filter(|fs| fs.restaurant.id == restaurant.id && fs.subscription.day_filter_passes(fs.target_date))
            .collect();

        let mut by_user: std::collections::HashMap<i64, Vec<Subscription>> = std::collections::HashMap::new();
        for fs in &full_subs {
            by_user.entry(fs.user.id).or_default().push(fs.subscription.clone());
        }

        let target_date = full_subs.first().map(|fs| fs.target_date);
        let Some(target_date) = target_date else { return };

        let _ = self.events.send(SniperEvent::SlotsDiscovered {
            restaurant_id: restaurant.id,
            slot_count: slots.len(),
        });

        for (user_id, subs) in by_user {
            let candidates = match_slots_for_user(&subs, slots, target_date);
            if candidates.is_empty() {
                continue;
            }
            self.maybe_start_processor(restaurant.id, user_id, target_date, candidates);
        }
    }

    /// spec.md §4.F "onPassiveSlotsDiscovered": same dedup/start logic, but
    /// `pre_matched_targets` already passed the day-of-week filter so no
    /// re-matching against day_configs/target_days happens here.
    pub fn on_passive_slots_discovered(
        self: &Arc<Self>,
        restaurant: &Restaurant,
        target_date: NaiveDate,
        slots: &[Slot],
        pre_matched_targets: &[crate::models::PassiveTarget],
    ) {
        let mut by_user: std::collections::HashMap<i64, Vec<crate::models::PassiveTarget>> = std::collections::HashMap::new();
        for t in pre_matched_targets {
            if t.restaurant_id == restaurant.id {
                by_user.entry(t.user_id).or_default().push(t.clone());
            }
        }
        for (user_id, targets) in by_user {
            let subs: Vec<Subscription> = targets
                .into_iter()
                .map(|t| Subscription {
                    id: t.id,
                    user_id: t.user_id,
                    restaurant_id: t.restaurant_id,
                    party_size: t.party_size,
                    window_start: t.window_start,
                    window_end: t.window_end,
                    table_types: t.table_types,
                    day_configs: t.day_configs,
                    target_days: t.target_days,
                    enabled: t.enabled,
                })
                .collect();
            let candidates = match_slots_for_user(&subs, slots, target_date);
            if candidates.is_empty() {
                continue;
            }
            self.maybe_start_processor(restaurant.id, user_id, target_date, candidates);
        }
    }

    fn maybe_start_processor(self: &Arc<Self>, restaurant_id: i64, user_id: i64, target_date: NaiveDate, candidates: Vec<Slot>) {
        let key: ProcessorKey = (user_id, restaurant_id, target_date);

        if self.successful_bookings.contains(&key) {
            return;
        }
        if self.rate_limited_users.contains(&user_id) {
            tracing::debug!(user_id, "skipping: user rate-limited this window");
            return;
        }
        if self.auth_failed_users.contains(&user_id) {
            tracing::debug!(user_id, "skipping: user auth-failed this window");
            return;
        }
        if self.is_excluded(user_id, target_date) {
            tracing::info!(user_id, restaurant_id, %target_date, "skipping: user already has a reservation that day");
            return;
        }

        use dashmap::mapref::entry::Entry;
        match self.active_processors.entry(key) {
            Entry::Occupied(_) => return,
            Entry::Vacant(v) => {
                v.insert(());
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(user) = this.store.user_by_id(user_id) else {
                this.active_processors.remove(&key);
                return;
            };
            let Some(restaurant) = this.store.restaurant_by_id(restaurant_id) else {
                this.active_processors.remove(&key);
                return;
            };
            let result = this.run_processor(&user, &restaurant, target_date, candidates).await;
            this.on_processor_terminated(key, &result);
        });
    }

    fn on_processor_terminated(&self, key: ProcessorKey, result: &UserBookingResult) {
        let (user_id, restaurant_id, target_date) = key;
        if result.success {
            self.successful_bookings.insert(key);
            let reservation_id = result.message.clone().unwrap_or_default();
            let _ = self.events.send(SniperEvent::BookingSuccess {
                user_id,
                restaurant_id,
                target_date,
                reservation_id,
            });
        } else if let Some(msg) = &result.message {
            let _ = self.events.send(SniperEvent::BookingFailed {
                user_id,
                restaurant_id,
                target_date,
                message: msg.clone(),
            });
        }
        self.active_processors.remove(&key);
    }

    /// spec.md §4.F "Processor state machine": sequential slot attempts,
    /// exactly `[claim, acquire, (attempt)+, classify, release-or-mark-bad,
    /// release-or-keep-claim]` per slot.
    async fn run_processor(
        &self,
        user: &crate::models::User,
        restaurant: &Restaurant,
        target_date: NaiveDate,
        candidates: Vec<Slot>,
    ) -> UserBookingResult {
        let Some(auth_token) = user.auth_token.clone() else {
            return UserBookingResult { success: false, slot: None, message: Some("user missing auth token".into()) };
        };
        let Some(payment_method_id) = user.payment_method_id else {
            return UserBookingResult { success: false, slot: None, message: Some("user missing payment method".into()) };
        };

        'slots: for slot in candidates {
            if !self.try_claim_slot(restaurant.id, target_date, &slot.time_string, user.id) {
                continue 'slots; // ALREADY_CLAIMED: advance silently
            }

            let mut retry_count = 0u32;
            loop {
                let Some(proxy) = self.pool.acquire(DEFAULT_ACQUIRE_TIMEOUT).await else {
                    self.release_slot(restaurant.id, target_date, &slot.time_string, user.id);
                    self.store.log_booking_error(user.id, restaurant.id, "no proxy available".into()).await;
                    return UserBookingResult { success: false, slot: None, message: Some("no proxy".into()) };
                };
                self.store.mark_proxy_used(proxy.id).await;

                let outcome = self
                    .attempt_slot(&auth_token, payment_method_id, restaurant, target_date, &slot, &proxy)
                    .await;

                match outcome {
                    AttemptOutcome::Success(reservation_id) => {
                        self.pool.release(proxy.id);
                        self.store
                            .create_booking_attempt(BookingAttempt {
                                user_id: user.id,
                                restaurant_id: restaurant.id,
                                target_date,
                                slot_time: slot.time_string.clone(),
                                status: BookingStatus::Success,
                                reservation_id: Some(reservation_id.clone()),
                                error_message: None,
                                proxy_used: Some(proxy.id),
                            })
                            .await;
                        return UserBookingResult {
                            success: true,
                            slot: Some(slot),
                            message: Some(reservation_id),
                        };
                    }
                    AttemptOutcome::WafBlocked => {
                        self.pool.mark_bad(proxy.id);
                        retry_count += 1;
                        if retry_count >= MAX_WAF_RETRIES {
                            self.release_slot(restaurant.id, target_date, &slot.time_string, user.id);
                            continue 'slots;
                        }
                        // keep the claim, loop: a fresh proxy will be acquired.
                        continue;
                    }
                    AttemptOutcome::SoldOut => {
                        self.pool.release(proxy.id);
                        self.store
                            .create_booking_attempt(BookingAttempt {
                                user_id: user.id,
                                restaurant_id: restaurant.id,
                                target_date,
                                slot_time: slot.time_string.clone(),
                                status: BookingStatus::SoldOut,
                                reservation_id: None,
                                error_message: None,
                                proxy_used: Some(proxy.id),
                            })
                            .await;
                        // keep claimed: no point letting others try a sold-out slot.
                        continue 'slots;
                    }
                    AttemptOutcome::RateLimited => {
                        self.pool.mark_bad(proxy.id);
                        self.release_slot(restaurant.id, target_date, &slot.time_string, user.id);
                        self.rate_limited_users.insert(user.id);
                        self.store.log_booking_error(user.id, restaurant.id, "rate limited".into()).await;
                        return UserBookingResult { success: false, slot: None, message: Some("rate limited".into()) };
                    }
                    AttemptOutcome::AuthFailed => {
                        self.pool.release(proxy.id);
                        self.release_slot(restaurant.id, target_date, &slot.time_string, user.id);
                        self.auth_failed_users.insert(user.id);
                        self.store.log_booking_error(user.id, restaurant.id, "auth failed".into()).await;
                        return UserBookingResult { success: false, slot: None, message: Some("auth failed".into()) };
                    }
                    AttemptOutcome::OtherFailure(message) => {
                        self.pool.release(proxy.id);
                        self.release_slot(restaurant.id, target_date, &slot.time_string, user.id);
                        self.store
                            .create_booking_attempt(BookingAttempt {
                                user_id: user.id,
                                restaurant_id: restaurant.id,
                                target_date,
                                slot_time: slot.time_string.clone(),
                                status: BookingStatus::Failed,
                                reservation_id: None,
                                error_message: Some(message),
                                proxy_used: Some(proxy.id),
                            })
                            .await;
                        continue 'slots;
                    }
                }
            }
        }

        UserBookingResult { success: false, slot: None, message: Some("all slots failed".into()) }
    }

    async fn attempt_slot(
        &self,
        auth_token: &str,
        payment_method_id: i64,
        restaurant: &Restaurant,
        target_date: NaiveDate,
        slot: &Slot,
        proxy: &Proxy,
    ) -> AttemptOutcome {
        let details = self
            .api
            .get_details(
                &restaurant.venue_id,
                target_date,
                slot.party_size,
                &slot.config_id,
                auth_token,
                Some(proxy.url.as_str()),
            )
            .await;

        let token = match details {
            Ok(Some(t)) => t,
            Ok(None) => return AttemptOutcome::OtherFailure("no book token".into()),
            Err(e) => return AttemptOutcome::from_api_error(e.kind),
        };

        if self.dry_run {
            return AttemptOutcome::Success(format!("dry-run-{}-{}", restaurant.id, slot.time_string));
        }

        match self.api.book(&token.token, payment_method_id, Some(proxy.url.as_str())).await {
            Ok(result) => AttemptOutcome::Success(result.reservation_id),
            Err(e) => AttemptOutcome::from_api_error(e.kind),
        }
    }
}

enum AttemptOutcome {
    Success(String),
    WafBlocked,
    SoldOut,
    RateLimited,
    AuthFailed,
    OtherFailure(String),
}

impl AttemptOutcome {
    fn from_api_error(kind: ApiErrorKind) -> Self {
        match kind {
            ApiErrorKind::WafBlocked => Self::WafBlocked,
            ApiErrorKind::SoldOut => Self::SoldOut,
            ApiErrorKind::RateLimited => Self::RateLimited,
            ApiErrorKind::AuthFailed => Self::AuthFailed,
            other => Self::OtherFailure(format!("{other:?}")),
        }
    }
}

/// spec.md §4.F "Per-user slot matching": time window (including
/// `day_configs` override for the target weekday) then table-type
/// allow-list, across all of the user's subscriptions for this restaurant,
/// sorted by time ascending.
fn match_slots_for_user(subs: &[Subscription], slots: &[Slot], target_date: NaiveDate) -> Vec<Slot> {
    let mut seen_times = HashSet::new();
    let mut out: Vec<Slot> = Vec::new();
    for sub in subs {
        let (start, end) = sub.window_for(target_date);
        for slot in slots {
            if slot.party_size != sub.party_size {
                continue;
            }
            let Ok(t) = chrono::NaiveTime::parse_from_str(&slot.time_string, "%H:%M") else { continue };
            if !crate::models::time_in_window(t, &start, &end) {
                continue;
            }
            if !sub.accepts_table_type(slot.table_type.as_deref()) {
                continue;
            }
            if seen_times.insert(slot.time_string.clone()) {
                out.push(slot.clone());
            }
        }
    }
    out.sort_by(|a, b| a.time_string.cmp(&b.time_string));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{BookResult, BookToken};
    use crate::error::ApiError;
    use crate::models::{CalendarDay, ProxyClass, UpcomingReservation};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedApi {
        details_calls: AtomicUsize,
        book_results: Mutex<Vec<Result<BookResult, ApiError>>>,
    }

    #[async_trait]
    impl UpstreamApi for ScriptedApi {
        async fn find_slots(&self, _v: &str, _d: NaiveDate, _p: i64, _proxy: Option<&str>) -> Result<Vec<Slot>, ApiError> {
            Ok(vec![])
        }
        async fn get_details(&self, _v: &str, _d: NaiveDate, _p: i64, _c: &str, _a: &str, _proxy: Option<&str>) -> Result<Option<BookToken>, ApiError> {
            self.details_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(BookToken { token: "tok".into(), expires_at: chrono::Utc::now() }))
        }
        async fn book(&self, _t: &str, _p: i64, _proxy: Option<&str>) -> Result<BookResult, ApiError> {
            self.book_results.lock().unwrap().remove(0)
        }
        async fn cancel(&self, _t: &str) -> Result<(), ApiError> {
            Ok(())
        }
        async fn get_upcoming_reservations(&self, _a: &str, _proxy: Option<&str>) -> Result<Vec<UpcomingReservation>, ApiError> {
            Ok(vec![])
        }
        async fn get_calendar(&self, _v: &str, _p: i64, _s: NaiveDate, _e: NaiveDate, _proxy: Option<&str>) -> Result<Vec<CalendarDay>, ApiError> {
            Ok(vec![])
        }
    }

    fn proxy(id: i64) -> crate::models::Proxy {
        crate::models::Proxy { id, url: format!("http://p{id}"), class: ProxyClass::Isp, last_used_at: None, rate_limited_until: None }
    }

    async fn setup(book_results: Vec<Result<BookResult, ApiError>>) -> (Arc<Coordinator>, Arc<ProxyPool>) {
        let db_pool = sqlx::sqlite::SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&db_pool).await.unwrap();
        let store = Arc::new(Store::bootstrap(db_pool).await.unwrap());
        let pool = Arc::new(ProxyPool::new(vec![proxy(1), proxy(2), proxy(3)]));
        let api = Arc::new(ScriptedApi { details_calls: AtomicUsize::new(0), book_results: Mutex::new(book_results) });
        let (tx, _rx) = crate::events::channel(16);
        let coordinator = Coordinator::new(store, pool.clone(), api, false, tx);
        (coordinator, pool)
    }

    fn test_subscription(restaurant_id: i64) -> Subscription {
        Subscription {
            id: 1,
            user_id: 1,
            restaurant_id,
            party_size: 2,
            window_start: "18:00".into(),
            window_end: "21:00".into(),
            table_types: None,
            day_configs: vec![],
            target_days: vec![],
            enabled: true,
        }
    }

    fn slot(time: &str) -> Slot {
        Slot { restaurant_id: 1, target_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(), party_size: 2, config_id: "c".into(), time_string: time.into(), table_type: None }
    }

    #[test]
    fn claim_then_release_returns_to_prior_state() {
        // Exercised directly against the DashMap logic via a throwaway map
        // (no async needed for claim bookkeeping).
        let claimed: DashMap<ClaimKey, i64> = DashMap::new();
        let key: ClaimKey = (1, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(), "19:30".into());
        use dashmap::mapref::entry::Entry;
        let claimed_ok = match claimed.entry(key.clone()) {
            Entry::Vacant(v) => {
                v.insert(1);
                true
            }
            Entry::Occupied(_) => false,
        };
        assert!(claimed_ok);
        claimed.remove_if(&key, |_, owner| *owner == 1);
        assert!(claimed.get(&key).is_none());
    }

    #[test]
    fn match_slots_filters_by_window_and_sorts() {
        let sub = test_subscription(1);
        let slots = vec![slot("20:00"), slot("19:00"), slot("22:30")];
        let matched = match_slots_for_user(&[sub], &slots, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].time_string, "19:00");
        assert_eq!(matched[1].time_string, "20:00");
    }

    #[tokio::test]
    async fn sold_out_cascade_then_success() {
        let (coordinator, pool) = setup(vec![
            Err(ApiError::classify(412, None, String::new())),
            Err(ApiError::classify(412, None, String::new())),
            Ok(BookResult { reservation_id: "r-42".into(), confirmation_token: "ct".into() }),
        ])
        .await;

        let user = crate::models::User { id: 1, chat_id: 1, auth_token: Some("t".into()), payment_method_id: Some(1) };
        let restaurant = crate::models::Restaurant {
            id: 1,
            venue_id: "v1".into(),
            name: "Test".into(),
            days_in_advance: 30,
            release_time: "10:00".into(),
            release_timezone: "America/New_York".into(),
            enabled: true,
        };
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let candidates = vec![slot("19:00"), slot("19:30"), slot("20:00")];

        let result = coordinator.run_processor(&user, &restaurant, date, candidates).await;
        assert!(result.success);
        assert_eq!(pool.counts(), (3, 0, 0));
    }

    /// spec.md §8 day-filter invariant / scenario 6: a restaurant can stay
    /// in-window (and keep receiving scan traffic) because of one
    /// subscriber while another subscriber's `target_days` fails the
    /// window's target date — that second subscriber must not be matched.
    #[tokio::test]
    async fn on_slots_discovered_drops_subscriber_failing_day_filter() {
        let db_pool = sqlx::sqlite::SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&db_pool).await.unwrap();
        sqlx::query(
            "INSERT INTO restaurants (id, venue_id, name, days_in_advance, release_time, release_timezone, enabled)
             VALUES (1, 'v1', 'Test', 30, '10:00', 'America/New_York', 1)",
        )
        .execute(&db_pool)
        .await
        .unwrap();
        let store = Arc::new(Store::bootstrap(db_pool).await.unwrap());
        store
            .upsert_user(crate::models::User { id: 1, chat_id: 1, auth_token: Some("t".into()), payment_method_id: Some(1) })
            .await;
        store
            .upsert_user(crate::models::User { id: 2, chat_id: 2, auth_token: Some("t".into()), payment_method_id: Some(1) })
            .await;

        let restaurant = store.restaurant_by_id(1).unwrap();
        let target_date = crate::store::target_date_for(&restaurant).unwrap();
        let wd = crate::models::weekday0(target_date);
        let excluded_day = (wd + 1) % 7;

        let mut sub_a = test_subscription(1);
        sub_a.user_id = 1;
        sub_a.target_days = vec![excluded_day]; // never matches target_date's weekday
        store.upsert_subscription(sub_a).await;

        let mut sub_b = test_subscription(1);
        sub_b.id = 2;
        sub_b.user_id = 2;
        sub_b.target_days = vec![]; // any day
        store.upsert_subscription(sub_b).await;

        let pool = Arc::new(ProxyPool::new(vec![]));
        let api = Arc::new(ScriptedApi { details_calls: AtomicUsize::new(0), book_results: Mutex::new(vec![]) });
        let (tx, _rx) = crate::events::channel(16);
        let coordinator = Coordinator::new(store.clone(), pool, api, true, tx);

        coordinator.on_slots_discovered(&restaurant, &[slot("19:00")]);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(coordinator.successful_bookings.contains(&(2, 1, target_date)));
        assert!(!coordinator.successful_bookings.contains(&(1, 1, target_date)));
    }
}
