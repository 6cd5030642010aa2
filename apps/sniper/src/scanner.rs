use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use crate::api_client::UpstreamApi;
use crate::coordinator::Coordinator;
use crate::error::ApiErrorKind;
use crate::events::{EventSender, SniperEvent};
use crate::models::{Restaurant, Slot};
use crate::proxy_pool::DatacenterRotation;
use crate::store::Store;

/// spec.md §4.D "Constants", also the defaults behind `SCAN_TIMEOUT_SECONDS`
/// / `SCAN_INTERVAL_MS` (spec.md §6): the scan keeps polling this long past
/// the computed release instant, to absorb upstream clock skew.
pub const DEFAULT_POST_RELEASE_GRACE: Duration = Duration::from_secs(120);
pub const DEFAULT_SCAN_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Scan-path datacenter proxy cooldown on a 429 (distinct from the booking
/// path's 5 minute ISP cooldown, spec.md §9 Open Questions).
const SCAN_RATE_LIMIT_MINUTES: i64 = 15;

/// Terminal summary of one window's scan, fed back as a `SniperEvent`
/// (spec.md §4.D "ScanStats").
#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub ticks: u64,
    pub venues_scanned: usize,
    pub slots_found: usize,
}

/// Polls every restaurant in a firing window at ~1Hz from `scan_start_date_time`
/// until `release_date_time + 120s`, handing discovered slots to the
/// Coordinator (spec.md §4.D).
pub struct Scanner {
    store: Arc<Store>,
    datacenter_pool: Arc<DatacenterRotation>,
    api: Arc<dyn UpstreamApi>,
    coordinator: Arc<Coordinator>,
    tick_interval: Duration,
    post_release_grace: Duration,
    events: EventSender,
}

impl Scanner {
    pub fn new(
        store: Arc<Store>,
        datacenter_pool: Arc<DatacenterRotation>,
        api: Arc<dyn UpstreamApi>,
        coordinator: Arc<Coordinator>,
        events: EventSender,
    ) -> Arc<Self> {
        Self::with_timing(store, datacenter_pool, api, coordinator, events, DEFAULT_SCAN_TICK_INTERVAL, DEFAULT_POST_RELEASE_GRACE)
    }

    /// As `new`, but with the `SCAN_INTERVAL_MS` / `SCAN_TIMEOUT_SECONDS`
    /// tunables (spec.md §6) threaded through instead of the hardcoded
    /// defaults.
    pub fn with_timing(
        store: Arc<Store>,
        datacenter_pool: Arc<DatacenterRotation>,
        api: Arc<dyn UpstreamApi>,
        coordinator: Arc<Coordinator>,
        events: EventSender,
        tick_interval: Duration,
        post_release_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { store, datacenter_pool, api, coordinator, tick_interval, post_release_grace, events })
    }

    /// Runs the scan loop to completion. Expected to be spawned per firing
    /// window; does not return until the release-plus-grace deadline passes.
    pub async fn run(
        &self,
        restaurants: Vec<Restaurant>,
        target_date: NaiveDate,
        release_at: chrono::DateTime<chrono::Utc>,
        guard_key: String,
    ) -> ScanStats {
        let deadline = release_at + chrono::Duration::from_std(self.post_release_grace).unwrap();
        let mut stats = ScanStats::default();
        let mut interval = tokio::time::interval(self.tick_interval);

        tracing::info!(guard_key = %guard_key, restaurants = restaurants.len(), %target_date, "scan started");

        loop {
            interval.tick().await;
            stats.ticks += 1;

            let party_sizes = self.party_sizes_for(&restaurants, target_date);
            let scans = restaurants.iter().map(|r| self.scan_one_venue(r, target_date, &party_sizes));
            let results = futures::future::join_all(scans).await;
            for (restaurant, slots) in restaurants.iter().zip(results) {
                stats.venues_scanned += 1;
                if slots.is_empty() {
                    continue;
                }
                stats.slots_found += slots.len();
                self.coordinator.on_slots_discovered(restaurant, &slots);
            }

            if chrono::Utc::now() >= deadline {
                break;
            }
        }

        tracing::info!(guard_key = %guard_key, ticks = stats.ticks, slots_found = stats.slots_found, "scan complete");
        stats
    }

    /// Distinct party sizes any active subscriber of these restaurants wants,
    /// so each venue scan can issue one sequential request per size
    /// (spec.md §4.D "Sequential per-party-size requests").
    fn party_sizes_for(&self, restaurants: &[Restaurant], target_date: NaiveDate) -> Vec<i64> {
        let restaurant_ids: std::collections::HashSet<i64> = restaurants.iter().map(|r| r.id).collect();
        let mut sizes: Vec<i64> = self
            .store
            .full_subscriptions()
            .into_iter()
            .filter(|fs| restaurant_ids.contains(&fs.restaurant.id) && fs.target_date == target_date)
            .map(|fs| fs.subscription.party_size)
            .collect();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    /// One venue, one tick: requests each party size sequentially against
    /// the next datacenter proxy in rotation (spec.md §4.D "Concurrent
    /// per-venue scans", spec.md §3: datacenter proxies are used
    /// round-robin, not through the ISP pool's acquire/cooldown machinery).
    async fn scan_one_venue(&self, restaurant: &Restaurant, target_date: NaiveDate, party_sizes: &[i64]) -> Vec<Slot> {
        let proxy = self.datacenter_pool.next();
        let proxy_url = proxy.as_ref().map(|p| p.url.clone());

        let mut found = Vec::new();
        for &party_size in party_sizes {
            match self.api.find_slots(&restaurant.venue_id, target_date, party_size, proxy_url.as_deref()).await {
                Ok(slots) => {
                    found.extend(slots.into_iter().map(|mut s| {
                        s.restaurant_id = restaurant.id;
                        s
                    }));
                }
                Err(e) if e.kind == ApiErrorKind::RateLimited => {
                    if let Some(p) = &proxy {
                        self.store.mark_proxy_rate_limited(p.id, SCAN_RATE_LIMIT_MINUTES).await;
                        let until = chrono::Utc::now() + chrono::Duration::minutes(SCAN_RATE_LIMIT_MINUTES);
                        self.datacenter_pool.mark_rate_limited(p.id, until);
                        let _ = self.events.send(SniperEvent::ProxyRateLimited { proxy_id: p.id, minutes: SCAN_RATE_LIMIT_MINUTES });
                    }
                    tracing::warn!(venue_id = %restaurant.venue_id, party_size, "scan rate limited, dropping remaining sizes this tick");
                    break;
                }
                Err(e) => {
                    tracing::debug!(venue_id = %restaurant.venue_id, party_size, kind = ?e.kind, "scan request failed");
                }
            }
        }

        found
    }
}
