use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;

use crate::models::Proxy;

/// spec.md §4.C "Constants".
pub const COOLDOWN: Duration = Duration::from_secs(5 * 60);
pub const MIN_REUSE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Inner {
    available: Vec<Proxy>,
    in_use: HashMap<i64, Proxy>,
    cooldown: HashMap<i64, (Proxy, tokio::time::Instant)>,
    /// monotonic release times, kept to enforce `MIN_REUSE_DELAY` independent
    /// of whether a proxy is currently available or in cooldown.
    last_released: HashMap<i64, tokio::time::Instant>,
}

/// The bounded ISP proxy pool (spec.md §4.C). `available`, `in_use`, and
/// `cooldown` form a partition over the proxy set at all times — every
/// mutating method moves a proxy between exactly two of these, never leaving
/// it in two at once.
pub struct ProxyPool {
    inner: Mutex<Inner>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                available: proxies,
                in_use: HashMap::new(),
                cooldown: HashMap::new(),
                last_released: HashMap::new(),
            }),
        }
    }

    /// Replaces the full proxy set (called on Store sync), preserving
    /// in-flight leases by id where the new set still contains them.
    pub fn refresh(&self, proxies: Vec<Proxy>) {
        let mut inner = self.inner.lock().unwrap();
        let in_use_ids: std::collections::HashSet<i64> = inner.in_use.keys().copied().collect();
        inner.available = proxies.into_iter().filter(|p| !in_use_ids.contains(&p.id)).collect();
    }

    fn restore_expired_cooldowns(inner: &mut Inner) {
        let now = tokio::time::Instant::now();
        let expired: Vec<i64> = inner
            .cooldown
            .iter()
            .filter(|(_, (_, until))| *until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((proxy, _)) = inner.cooldown.remove(&id) {
                inner.available.push(proxy);
            }
        }
    }

    fn eligible_index(inner: &Inner) -> Option<usize> {
        let now = tokio::time::Instant::now();
        inner.available.iter().position(|p| {
            inner
                .last_released
                .get(&p.id)
                .is_none_or(|t| now.saturating_duration_since(*t) >= MIN_REUSE_DELAY)
        })
    }

    /// `acquire(timeout)`: returns the first available proxy whose last
    /// release was at least `MIN_REUSE_DELAY` ago, polling every
    /// `POLL_INTERVAL` until `timeout` elapses (spec.md §4.C).
    pub async fn acquire(&self, timeout: Duration) -> Option<Proxy> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                Self::restore_expired_cooldowns(&mut inner);
                if let Some(idx) = Self::eligible_index(&inner) {
                    let proxy = inner.available.remove(idx);
                    inner.in_use.insert(proxy.id, proxy.clone());
                    return Some(proxy);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(tokio::time::Instant::now()))).await;
        }
    }

    /// Moves a proxy from `in_use` back to `available`, recording the
    /// release time so the next `acquire` respects `MIN_REUSE_DELAY`.
    /// No-op if the id is not currently held.
    pub fn release(&self, proxy_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(proxy) = inner.in_use.remove(&proxy_id) {
            inner.last_released.insert(proxy_id, tokio::time::Instant::now());
            inner.available.push(proxy);
        }
    }

    /// Moves a proxy from `in_use` to `cooldown`, expiring `COOLDOWN` from
    /// now. No-op if the id is not currently held.
    pub fn mark_bad(&self, proxy_id: i64) {
        self.mark_bad_for(proxy_id, COOLDOWN);
    }

    /// Like `mark_bad`, but with a caller-chosen cooldown duration. The scan
    /// path uses this with the 15 minute datacenter rate-limit window instead
    /// of the booking path's 5 minute `COOLDOWN` (spec.md §9 Open Questions:
    /// the two durations are intentionally distinct).
    pub fn mark_bad_for(&self, proxy_id: i64, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(proxy) = inner.in_use.remove(&proxy_id) {
            let expiry = tokio::time::Instant::now() + duration;
            inner.cooldown.insert(proxy_id, (proxy, expiry));
        }
    }

    /// Moves all `in_use` and `cooldown` entries back to `available` and
    /// clears reuse history. Called at each window start (spec.md §4.C).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        let in_use: Vec<Proxy> = inner.in_use.drain().map(|(_, p)| p).collect();
        let cooled: Vec<Proxy> = inner.cooldown.drain().map(|(_, (p, _))| p).collect();
        inner.available.extend(in_use);
        inner.available.extend(cooled);
        inner.last_released.clear();
    }

    /// Current `(available, in_use, cooldown)` counts, for metrics/tests.
    pub fn counts(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.available.len(), inner.in_use.len(), inner.cooldown.len())
    }
}

/// Round-robin selection over the datacenter proxy set used by the Scanner
/// and the Passive Monitor (spec.md §3: datacenter proxies are "used
/// round-robin", a usage model distinct from the ISP Booking Pool's bounded
/// acquire/release/cooldown state machine above). There is no `available` /
/// `in_use` / `cooldown` partition and no `MIN_REUSE_DELAY`: every call just
/// advances to the next proxy in line, skipping ones still rate-limited.
pub struct DatacenterRotation {
    proxies: Mutex<Vec<Proxy>>,
    cursor: AtomicUsize,
}

impl DatacenterRotation {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self { proxies: Mutex::new(proxies), cursor: AtomicUsize::new(0) }
    }

    /// Replaces the full proxy set (called on Store sync).
    pub fn refresh(&self, proxies: Vec<Proxy>) {
        *self.proxies.lock().unwrap() = proxies;
    }

    /// Returns the next proxy in rotation order, skipping any currently
    /// rate-limited. `None` if the set is empty or every proxy is
    /// rate-limited.
    pub fn next(&self) -> Option<Proxy> {
        let proxies = self.proxies.lock().unwrap();
        let len = proxies.len();
        if len == 0 {
            return None;
        }
        let now = Utc::now();
        let start = self.cursor.fetch_add(1, Ordering::SeqCst) % len;
        (0..len)
            .map(|offset| &proxies[(start + offset) % len])
            .find(|p| p.rate_limited_until.is_none_or(|until| until <= now))
            .cloned()
    }

    /// Records a rate-limit directly on the rotation's own snapshot so the
    /// next `next()` call excludes this proxy without waiting for the next
    /// Store sync (spec.md §4.D: scan-path rate limit is 15 minutes).
    pub fn mark_rate_limited(&self, proxy_id: i64, until: DateTime<Utc>) {
        let mut proxies = self.proxies.lock().unwrap();
        if let Some(p) = proxies.iter_mut().find(|p| p.id == proxy_id) {
            p.rate_limited_until = Some(until);
        }
    }

    /// Current proxy count, for metrics/tests.
    pub fn len(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProxyClass;

    fn proxy(id: i64) -> Proxy {
        Proxy {
            id,
            url: format!("http://proxy-{id}.example.com:8080"),
            class: ProxyClass::Isp,
            last_used_at: None,
            rate_limited_until: None,
        }
    }

    #[tokio::test]
    async fn acquire_release_partition_holds() {
        let pool = ProxyPool::new(vec![proxy(1), proxy(2)]);
        let p1 = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.counts(), (1, 1, 0));
        pool.release(p1.id);
        assert_eq!(pool.counts(), (2, 0, 0));
    }

    #[tokio::test]
    async fn empty_pool_times_out_without_stalling() {
        let pool = ProxyPool::new(vec![]);
        let start = tokio::time::Instant::now();
        let result = pool.acquire(Duration::from_millis(100)).await;
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn mark_bad_moves_to_cooldown_and_blocks_reacquire() {
        let pool = ProxyPool::new(vec![proxy(1)]);
        let p1 = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.mark_bad(p1.id);
        assert_eq!(pool.counts(), (0, 0, 1));
        let none = pool.acquire(Duration::from_millis(50)).await;
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn reset_clears_in_use_and_cooldown_back_to_available() {
        let pool = ProxyPool::new(vec![proxy(1), proxy(2)]);
        let p1 = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.mark_bad(p1.id);
        let _p2 = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.counts(), (0, 1, 1));
        pool.reset();
        assert_eq!(pool.counts(), (2, 0, 0));
    }

    #[tokio::test]
    async fn min_reuse_delay_blocks_immediate_reacquire() {
        let pool = ProxyPool::new(vec![proxy(1)]);
        let p1 = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(p1.id);
        // Proxy is `available` again but inside the 2s reuse spacing window.
        let reacquired = pool.acquire(Duration::from_millis(50)).await;
        assert!(reacquired.is_none());
    }

    #[tokio::test]
    async fn release_of_unheld_proxy_is_noop() {
        let pool = ProxyPool::new(vec![proxy(1)]);
        pool.release(999); // never acquired
        assert_eq!(pool.counts(), (1, 0, 0));
    }

    #[test]
    fn rotation_cycles_through_proxies_in_order() {
        let rotation = DatacenterRotation::new(vec![proxy(1), proxy(2), proxy(3)]);
        let seen: Vec<i64> = (0..6).map(|_| rotation.next().unwrap().id).collect();
        assert_eq!(seen, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn rotation_does_not_gate_on_reuse_spacing() {
        // Unlike the ISP pool, back-to-back calls for the same proxy are
        // fine: there is no in-use/cooldown partition to wait out.
        let rotation = DatacenterRotation::new(vec![proxy(1)]);
        assert_eq!(rotation.next().unwrap().id, 1);
        assert_eq!(rotation.next().unwrap().id, 1);
    }

    #[test]
    fn rotation_skips_rate_limited_proxy() {
        let rotation = DatacenterRotation::new(vec![proxy(1), proxy(2)]);
        rotation.mark_rate_limited(1, Utc::now() + chrono::Duration::minutes(15));
        let picked: Vec<i64> = (0..3).map(|_| rotation.next().unwrap().id).collect();
        assert_eq!(picked, vec![2, 2, 2]);
    }

    #[test]
    fn rotation_returns_none_when_all_rate_limited() {
        let rotation = DatacenterRotation::new(vec![proxy(1)]);
        rotation.mark_rate_limited(1, Utc::now() + chrono::Duration::minutes(15));
        assert!(rotation.next().is_none());
    }

    #[test]
    fn rotation_of_empty_set_returns_none() {
        let rotation = DatacenterRotation::new(vec![]);
        assert!(rotation.next().is_none());
    }
}
