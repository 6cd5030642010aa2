use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use tokio::sync::mpsc;

use crate::models::{DayWindowed, FullSubscription, ReleaseWindow};
use crate::store::Store;

const RECOMPUTE_TICK: Duration = Duration::from_secs(60 * 60);

/// Computes when each restaurant's next release happens and fires a
/// `ReleaseWindow` a configured lead time before it (spec.md §4.E).
pub struct Scheduler {
    store: Arc<Store>,
    lead_time: Duration,
    window_tx: mpsc::UnboundedSender<ReleaseWindow>,
    guard: std::sync::Mutex<HashSet<String>>,
    next_release_times: RwLock<Vec<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, lead_time: Duration, window_tx: mpsc::UnboundedSender<ReleaseWindow>) -> Arc<Self> {
        Arc::new(Self {
            store,
            lead_time,
            window_tx,
            guard: std::sync::Mutex::new(HashSet::new()),
            next_release_times: RwLock::new(Vec::new()),
        })
    }

    /// spec.md §4.E "Blackout hook": exposed to the Store so its sync
    /// blackout predicate can be evaluated without a circular dependency.
    pub fn next_release_times(&self) -> Vec<DateTime<Utc>> {
        self.next_release_times.read().unwrap().clone()
    }

    /// `true` if any upcoming release falls within `half_window` of `now`,
    /// in either direction. Passive monitor blackout (spec.md §4.G) passes
    /// minutes; the Store's sync blackout (spec.md §4.B, 60 seconds) passes
    /// seconds — both share this one predicate shape.
    pub fn is_within_blackout(&self, now: DateTime<Utc>, half_window: chrono::Duration) -> bool {
        self.next_release_times()
            .iter()
            .any(|t| (*t - now).abs() <= half_window)
    }

    /// Pure window computation (spec.md §4.E steps 1-5), independently
    /// testable without timers. Groups full subscriptions by
    /// `(release_time, release_timezone)` so every restaurant sharing a
    /// window also shares its release instant.
    pub fn calculate_release_windows(&self) -> Vec<ReleaseWindow> {
        Self::windows_from(self.store.full_subscriptions(), Utc::now(), self.lead_time)
    }

    fn windows_from(
        full_subs: Vec<FullSubscription>,
        now: DateTime<Utc>,
        lead_time: Duration,
    ) -> Vec<ReleaseWindow> {
        use std::collections::HashMap;
        let mut groups: HashMap<(String, String), Vec<FullSubscription>> = HashMap::new();
        for fs in full_subs {
            groups
                .entry((fs.restaurant.release_time.clone(), fs.restaurant.release_timezone.clone()))
                .or_default()
                .push(fs);
        }

        let mut windows = Vec::new();
        for ((release_time, _tz_name), group) in groups {
            let Some(release_date_time) = next_occurrence(&group[0].restaurant.release_time, &group[0].restaurant.release_timezone, now) else {
                tracing::warn!(release_time, "skipping window: could not compute next occurrence");
                continue;
            };

            let surviving: Vec<FullSubscription> = group
                .into_iter()
                .filter(|fs| fs.subscription.day_filter_passes(fs.target_date))
                .collect();
            if surviving.is_empty() {
                continue;
            }

            let mut restaurants = Vec::new();
            let mut seen_restaurant_ids = HashSet::new();
            for fs in &surviving {
                if seen_restaurant_ids.insert(fs.restaurant.id) {
                    restaurants.push(fs.restaurant.clone());
                }
            }

            windows.push(ReleaseWindow {
                release_time: release_time.clone(),
                release_date_time,
                scan_start_date_time: release_date_time - chrono::Duration::from_std(lead_time).unwrap(),
                target_date: surviving[0].target_date,
                restaurants,
                subscriptions: surviving,
            });
        }

        windows.sort_by_key(|w| w.scan_start_date_time);
        windows
    }

    /// spec.md §4.E "Timer discipline": schedules a one-shot timer per window
    /// whose firing delay is in `(0, 24h]`, guarded against duplicates by
    /// `guard_key()`, plus a recurring hourly recompute.
    pub fn start(self: &Arc<Self>) {
        self.schedule_pending();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RECOMPUTE_TICK);
            loop {
                interval.tick().await;
                this.schedule_pending();
            }
        });
    }

    /// Called after a Store sync completes, or on the hourly tick, to pick up
    /// newly added subscriptions.
    pub fn schedule_pending(self: &Arc<Self>) {
        let windows = self.calculate_release_windows();
        *self.next_release_times.write().unwrap() = windows.iter().map(|w| w.release_date_time).collect();

        let now = Utc::now();
        for window in windows {
            let key = window.guard_key();
            {
                let mut guard = self.guard.lock().unwrap();
                if guard.contains(&key) {
                    continue;
                }
                let delay = window.scan_start_date_time - now;
                let in_range = delay > chrono::Duration::zero() && delay <= chrono::Duration::hours(24);
                if !in_range {
                    continue;
                }
                guard.insert(key.clone());
            }

            let this = Arc::clone(self);
            let delay_std = (window.scan_start_date_time - now).to_std().unwrap_or(Duration::ZERO);
            tokio::spawn(async move {
                tokio::time::sleep(delay_std).await;
                this.guard.lock().unwrap().remove(&key);
                tracing::info!(guard_key = %key, "window firing");
                if this.window_tx.send(window).is_err() {
                    tracing::warn!("window fired but no receiver is listening");
                }
            });
        }
    }
}

/// Next absolute instant at which `release_time` ("HH:MM") occurs in
/// `tz_name`, from `now` (spec.md §4.E step 1: tomorrow if today's already
/// passed, never skipped).
fn next_occurrence(release_time: &str, tz_name: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz: chrono_tz::Tz = tz_name.parse().ok()?;
    let naive_time = NaiveTime::parse_from_str(release_time, "%H:%M").ok()?;
    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();
    let candidate = tz.from_local_datetime(&today.and_time(naive_time)).single()?;
    let candidate_utc = candidate.with_timezone(&Utc);
    if candidate_utc > now {
        Some(candidate_utc)
    } else {
        let tomorrow = today + chrono::Duration::days(1);
        let next = tz.from_local_datetime(&tomorrow.and_time(naive_time)).single()?;
        Some(next.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FullSubscription, Restaurant, Subscription, User};
    use chrono::NaiveDate;

    fn restaurant(id: i64, release_time: &str) -> Restaurant {
        Restaurant {
            id,
            venue_id: format!("v{id}"),
            name: "Test".into(),
            days_in_advance: 30,
            release_time: release_time.into(),
            release_timezone: "America/New_York".into(),
            enabled: true,
        }
    }

    fn full_sub(restaurant: Restaurant, target_days: Vec<u8>, target_date: NaiveDate) -> FullSubscription {
        FullSubscription {
            subscription: Subscription {
                id: 1,
                user_id: 1,
                restaurant_id: restaurant.id,
                party_size: 2,
                window_start: "18:00".into(),
                window_end: "21:00".into(),
                table_types: None,
                day_configs: vec![],
                target_days,
                enabled: true,
            },
            user: User { id: 1, chat_id: 1, auth_token: Some("t".into()), payment_method_id: Some(1) },
            restaurant,
            target_date,
        }
    }

    #[test]
    fn release_just_passed_rolls_to_next_day_not_skipped() {
        let now: DateTime<Utc> = "2026-07-28T14:00:05Z".parse().unwrap(); // America/New_York, 10:00:05 local
        let next = next_occurrence("10:00", "America/New_York", now).unwrap();
        let local = next.with_timezone(&chrono_tz::America::New_York);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2026, 7, 29).unwrap());
        assert_eq!(local.format("%H:%M").to_string(), "10:00");
    }

    #[test]
    fn release_not_yet_passed_fires_today() {
        let now: DateTime<Utc> = "2026-07-28T13:00:00Z".parse().unwrap(); // 09:00 local
        let next = next_occurrence("10:00", "America/New_York", now).unwrap();
        let local = next.with_timezone(&chrono_tz::America::New_York);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2026, 7, 28).unwrap());
    }

    #[test]
    fn day_filter_drops_subscription_on_wrong_weekday() {
        // 2026-07-29 is a Wednesday (3).
        let wed = NaiveDate::from_ymd_opt(2026, 7, 29).unwrap();
        let r = restaurant(1, "10:00");
        let fs = full_sub(r, vec![5, 6, 0], wed); // Fri/Sat/Sun only
        let now: DateTime<Utc> = "2026-07-28T13:00:00Z".parse().unwrap();
        let windows = Scheduler::windows_from(vec![fs], now, Duration::from_secs(45));
        assert!(windows.is_empty());
    }

    #[test]
    fn window_survives_when_day_filter_passes_for_at_least_one_sub() {
        let wed = NaiveDate::from_ymd_opt(2026, 7, 29).unwrap();
        let r = restaurant(1, "10:00");
        let fs_drop = full_sub(r.clone(), vec![5, 6, 0], wed);
        let fs_keep = full_sub(r, vec![], wed); // empty = any day
        let now: DateTime<Utc> = "2026-07-28T13:00:00Z".parse().unwrap();
        let windows = Scheduler::windows_from(vec![fs_drop, fs_keep], now, Duration::from_secs(45));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].subscriptions.len(), 1);
    }

    #[test]
    fn scan_start_is_release_minus_lead_time() {
        let r = restaurant(1, "10:00");
        let fs = full_sub(r, vec![], NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        let now: DateTime<Utc> = "2026-07-28T13:00:00Z".parse().unwrap();
        let lead = Duration::from_secs(45);
        let windows = Scheduler::windows_from(vec![fs], now, lead);
        assert_eq!(windows.len(), 1);
        assert_eq!(
            windows[0].scan_start_date_time,
            windows[0].release_date_time - chrono::Duration::seconds(45)
        );
    }

    #[test]
    fn windows_are_sorted_by_scan_start_ascending() {
        let r1 = restaurant(1, "09:00");
        let r2 = restaurant(2, "10:00");
        let date = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        let now: DateTime<Utc> = "2026-07-28T13:00:00Z".parse().unwrap();
        let windows = Scheduler::windows_from(
            vec![full_sub(r2, vec![], date), full_sub(r1, vec![], date)],
            now,
            Duration::from_secs(45),
        );
        assert!(windows[0].scan_start_date_time <= windows[1].scan_start_date_time);
    }
}
