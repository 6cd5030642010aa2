use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::db;
use crate::models::{
    BookingAttempt, FullSubscription, PassiveTarget, Proxy, ProxyClass, Restaurant, Subscription,
    User,
};

/// Periodic refresh interval (spec.md §4.B "Periodic sync").
pub const SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// The sync blackout predicate suppresses a refresh due within this many
/// seconds of the next scheduled release.
pub const SYNC_BLACKOUT_SECONDS: i64 = 60;

/// A predicate supplied by the Scheduler so the Store can evaluate its sync
/// blackout without holding a reference back to the Scheduler (spec.md §9
/// "Scheduler <-> Store cycle").
pub type BlackoutPredicate = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct Snapshot {
    restaurants: HashMap<i64, Restaurant>,
    restaurants_by_venue: HashMap<String, i64>,
    users: HashMap<i64, User>,
    users_by_chat_id: HashMap<i64, i64>,
    subscriptions: Vec<Subscription>,
    passive_targets: Vec<PassiveTarget>,
    proxies: HashMap<i64, Proxy>,
}

impl Snapshot {
    fn from_parts(
        restaurants: Vec<Restaurant>,
        users: Vec<User>,
        subscriptions: Vec<Subscription>,
        passive_targets: Vec<PassiveTarget>,
        proxies: Vec<Proxy>,
    ) -> Self {
        let mut restaurants_by_venue = HashMap::new();
        let mut restaurants_by_id = HashMap::new();
        for r in restaurants {
            restaurants_by_venue.insert(r.venue_id.clone(), r.id);
            restaurants_by_id.insert(r.id, r);
        }
        let mut users_by_chat_id = HashMap::new();
        let mut users_by_id = HashMap::new();
        for u in users {
            users_by_chat_id.insert(u.chat_id, u.id);
            users_by_id.insert(u.id, u);
        }
        let proxies = proxies.into_iter().map(|p| (p.id, p)).collect();
        Self {
            restaurants: restaurants_by_id,
            restaurants_by_venue,
            users: users_by_id,
            users_by_chat_id,
            subscriptions,
            passive_targets,
            proxies,
        }
    }
}

/// Loads all config once; hot-path reads come from memory; mutations fan out
/// to durable storage fire-and-forget (spec.md §4.B).
pub struct Store {
    pool: SqlitePool,
    snapshot: RwLock<Snapshot>,
    blackout: RwLock<Option<BlackoutPredicate>>,
}

impl Store {
    pub async fn bootstrap(pool: SqlitePool) -> anyhow::Result<Self> {
        let restaurants = db::load_restaurants(&pool).await?;
        let users = db::load_users(&pool).await?;
        let subscriptions = db::load_subscriptions(&pool).await?;
        let passive_targets = db::load_passive_targets(&pool).await?;
        let proxies = db::load_proxies(&pool).await?;
        tracing::info!(
            restaurants = restaurants.len(),
            users = users.len(),
            subscriptions = subscriptions.len(),
            passive_targets = passive_targets.len(),
            proxies = proxies.len(),
            "store bootstrapped"
        );
        Ok(Self {
            pool,
            snapshot: RwLock::new(Snapshot::from_parts(
                restaurants,
                users,
                subscriptions,
                passive_targets,
                proxies,
            )),
            blackout: RwLock::new(None),
        })
    }

    /// Injected by the Scheduler after both are constructed, breaking the
    /// Scheduler<->Store reference cycle (spec.md §9).
    pub fn set_blackout_predicate(&self, predicate: BlackoutPredicate) {
        *self.blackout.write().unwrap() = Some(predicate);
    }

    // ── Reads ──

    pub fn restaurants(&self) -> Vec<Restaurant> {
        self.snapshot.read().unwrap().restaurants.values().cloned().collect()
    }

    pub fn restaurant_by_id(&self, id: i64) -> Option<Restaurant> {
        self.snapshot.read().unwrap().restaurants.get(&id).cloned()
    }

    pub fn restaurant_by_venue(&self, venue_id: &str) -> Option<Restaurant> {
        let snap = self.snapshot.read().unwrap();
        snap.restaurants_by_venue
            .get(venue_id)
            .and_then(|id| snap.restaurants.get(id))
            .cloned()
    }

    pub fn user_by_id(&self, id: i64) -> Option<User> {
        self.snapshot.read().unwrap().users.get(&id).cloned()
    }

    pub fn user_by_chat_id(&self, chat_id: i64) -> Option<User> {
        let snap = self.snapshot.read().unwrap();
        snap.users_by_chat_id.get(&chat_id).and_then(|id| snap.users.get(id)).cloned()
    }

    pub fn passive_targets(&self) -> Vec<PassiveTarget> {
        self.snapshot.read().unwrap().passive_targets.clone()
    }

    pub fn proxies_by_class(&self, class: ProxyClass) -> Vec<Proxy> {
        self.snapshot
            .read()
            .unwrap()
            .proxies
            .values()
            .filter(|p| p.class == class)
            .cloned()
            .collect()
    }

    pub fn all_proxies(&self) -> Vec<Proxy> {
        self.snapshot.read().unwrap().proxies.values().cloned().collect()
    }

    /// The denormalised join of spec.md §4.B "Derived query: full
    /// subscription": excludes subscriptions whose user lacks auth token or
    /// payment method, and computes each subscription's own target date from
    /// its restaurant's `days_in_advance` and timezone.
    pub fn full_subscriptions(&self) -> Vec<FullSubscription> {
        let snap = self.snapshot.read().unwrap();
        snap.subscriptions
            .iter()
            .filter_map(|sub| {
                let user = snap.users.get(&sub.user_id)?;
                if !user.has_auth_material() {
                    return None;
                }
                let restaurant = snap.restaurants.get(&sub.restaurant_id)?;
                if !restaurant.enabled {
                    return None;
                }
                let target_date = target_date_for(restaurant).ok()?;
                Some(FullSubscription {
                    subscription: sub.clone(),
                    user: user.clone(),
                    restaurant: restaurant.clone(),
                    target_date,
                })
            })
            .collect()
    }

    /// Groups full subscriptions by restaurant release time-of-day, the input
    /// the Scheduler's `calculateReleaseWindows` consumes (spec.md §4.E).
    pub fn full_subscriptions_by_release_time(&self) -> HashMap<String, Vec<FullSubscription>> {
        let mut groups: HashMap<String, Vec<FullSubscription>> = HashMap::new();
        for fs in self.full_subscriptions() {
            groups.entry(fs.restaurant.release_time.clone()).or_default().push(fs);
        }
        groups
    }

    // ── Write-through mutations ──

    pub async fn upsert_user(&self, user: User) {
        {
            let mut snap = self.snapshot.write().unwrap();
            snap.users_by_chat_id.insert(user.chat_id, user.id);
            snap.users.insert(user.id, user.clone());
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = db::upsert_user(&pool, &user).await {
                tracing::warn!(error = %e, "write-through upsert_user failed");
            }
        });
    }

    pub async fn upsert_subscription(&self, sub: Subscription) {
        {
            let mut snap = self.snapshot.write().unwrap();
            snap.subscriptions.retain(|s| {
                !(s.user_id == sub.user_id && s.restaurant_id == sub.restaurant_id && s.party_size == sub.party_size)
            });
            snap.subscriptions.push(sub.clone());
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = db::upsert_subscription(&pool, &sub).await {
                tracing::warn!(error = %e, "write-through upsert_subscription failed");
            }
        });
    }

    pub async fn delete_subscription(&self, user_id: i64, restaurant_id: i64, party_size: i64) {
        {
            let mut snap = self.snapshot.write().unwrap();
            snap.subscriptions
                .retain(|s| !(s.user_id == user_id && s.restaurant_id == restaurant_id && s.party_size == party_size));
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = db::delete_subscription(&pool, user_id, restaurant_id, party_size).await {
                tracing::warn!(error = %e, "write-through delete_subscription failed");
            }
        });
    }

    pub async fn mark_proxy_used(&self, proxy_id: i64) {
        let now = Utc::now();
        {
            let mut snap = self.snapshot.write().unwrap();
            if let Some(p) = snap.proxies.get_mut(&proxy_id) {
                p.last_used_at = Some(now);
            }
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = db::mark_proxy_used(&pool, proxy_id, now).await {
                tracing::warn!(error = %e, "write-through mark_proxy_used failed");
            }
        });
    }

    /// `cooldown_minutes` lets scanner (15 min, spec.md §4.D) and booking
    /// (5 min, spec.md §4.F) paths share this one write-through helper while
    /// keeping their different durations (spec.md §9 Open Questions).
    pub async fn mark_proxy_rate_limited(&self, proxy_id: i64, cooldown_minutes: i64) {
        let until = Utc::now() + chrono::Duration::minutes(cooldown_minutes);
        {
            let mut snap = self.snapshot.write().unwrap();
            if let Some(p) = snap.proxies.get_mut(&proxy_id) {
                p.rate_limited_until = Some(until);
            }
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = db::mark_proxy_rate_limited(&pool, proxy_id, until).await {
                tracing::warn!(error = %e, "write-through mark_proxy_rate_limited failed");
            }
        });
    }

    /// Write-only: booking attempts are audit log entries, never read back
    /// (spec.md §4.B).
    pub async fn create_booking_attempt(&self, attempt: BookingAttempt) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = db::create_booking_attempt(&pool, &attempt).await {
                tracing::warn!(error = %e, "write-through create_booking_attempt failed");
            }
        });
    }

    pub async fn log_booking_error(&self, user_id: i64, restaurant_id: i64, message: String) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = db::log_booking_error(&pool, user_id, restaurant_id, &message).await {
                tracing::warn!(error = %e, "write-through log_booking_error failed");
            }
        });
    }

    // ── Periodic sync ──

    /// Refreshes the in-memory snapshot from the durable store, unless the
    /// injected blackout predicate says a release is imminent (spec.md
    /// §4.B). Returns `true` if a refresh actually happened.
    pub async fn maybe_sync(&self) -> anyhow::Result<bool> {
        if self.blackout.read().unwrap().as_ref().is_some_and(|p| p()) {
            tracing::debug!("sync suppressed: inside release blackout window");
            return Ok(false);
        }
        self.sync().await?;
        Ok(true)
    }

    async fn sync(&self) -> anyhow::Result<()> {
        let restaurants = db::load_restaurants(&self.pool).await?;
        let users = db::load_users(&self.pool).await?;
        let subscriptions = db::load_subscriptions(&self.pool).await?;
        let passive_targets = db::load_passive_targets(&self.pool).await?;
        let proxies = db::load_proxies(&self.pool).await?;
        let fresh = Snapshot::from_parts(restaurants, users, subscriptions, passive_targets, proxies);
        *self.snapshot.write().unwrap() = fresh;
        tracing::info!("store synced from durable backend");
        Ok(())
    }
}

/// `targetDate = today + daysInAdvance` in the restaurant's configured zone
/// (spec.md §3 "Release Window").
pub fn target_date_for(restaurant: &Restaurant) -> anyhow::Result<NaiveDate> {
    let tz = restaurant.tz()?;
    let today = Utc::now().with_timezone(&tz).date_naive();
    Ok(today + chrono::Duration::days(restaurant.days_in_advance))
}
