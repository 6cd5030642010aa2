use chrono::NaiveDate;

/// Typed fan-out events (spec.md §6 "Outbound events", §9 "Callback graph").
/// The source wires components with direct callbacks; this crate expresses
/// the same fan-out as a broadcast channel of one enum rather than a chain
/// of `on_*` closures, so any number of observers (logging, a future
/// dashboard bridge) can subscribe independently.
#[derive(Debug, Clone)]
pub enum SniperEvent {
    WindowStart { guard_key: String, restaurant_count: usize, target_date: NaiveDate },
    SlotsDiscovered { restaurant_id: i64, slot_count: usize },
    ScanComplete { guard_key: String, ticks: u64 },
    BookingSuccess { user_id: i64, restaurant_id: i64, target_date: NaiveDate, reservation_id: String },
    BookingFailed { user_id: i64, restaurant_id: i64, target_date: NaiveDate, message: String },
    ProxyRateLimited { proxy_id: i64, minutes: i64 },
}

pub type EventSender = tokio::sync::broadcast::Sender<SniperEvent>;

pub fn channel(capacity: usize) -> (EventSender, tokio::sync::broadcast::Receiver<SniperEvent>) {
    tokio::sync::broadcast::channel(capacity)
}
