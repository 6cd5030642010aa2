use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{ApiError, ApiErrorKind};
use crate::models::{CalendarDay, Slot, UpcomingReservation};

/// Per-API-request timeout (spec.md §5 "Cancellation and timeouts").
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BookToken {
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct BookResult {
    pub reservation_id: String,
    pub confirmation_token: String,
}

/// Typed request/response contract for the upstream reservation API
/// (spec.md §4.A, §6). This crate never reimplements the upstream service —
/// `UpstreamApi` is the seam: the reqwest-backed `HttpUpstreamApi` in
/// production, a scripted fake in tests.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn find_slots(
        &self,
        venue_id: &str,
        day: NaiveDate,
        party_size: i64,
        proxy_url: Option<&str>,
    ) -> Result<Vec<Slot>, ApiError>;

    async fn get_details(
        &self,
        venue_id: &str,
        day: NaiveDate,
        party_size: i64,
        config_id: &str,
        user_auth_token: &str,
        proxy_url: Option<&str>,
    ) -> Result<Option<BookToken>, ApiError>;

    async fn book(
        &self,
        book_token: &str,
        payment_method_id: i64,
        proxy_url: Option<&str>,
    ) -> Result<BookResult, ApiError>;

    async fn cancel(&self, confirmation_token: &str) -> Result<(), ApiError>;

    async fn get_upcoming_reservations(
        &self,
        user_auth_token: &str,
        proxy_url: Option<&str>,
    ) -> Result<Vec<UpcomingReservation>, ApiError>;

    async fn get_calendar(
        &self,
        venue_id: &str,
        party_size: i64,
        start_date: NaiveDate,
        end_date: NaiveDate,
        proxy_url: Option<&str>,
    ) -> Result<Vec<CalendarDay>, ApiError>;
}

pub struct HttpUpstreamApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpUpstreamApi {
    pub fn new(base_url: String, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str, proxy_url: Option<&str>) -> anyhow::Result<reqwest::RequestBuilder> {
        let client = match proxy_url {
            Some(url) => reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .proxy(reqwest::Proxy::all(url)?)
                .build()?,
            None => self.client.clone(),
        };
        Ok(client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("x-api-key", &self.api_key))
    }

    async fn classify_error(resp: reqwest::Response) -> ApiError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let code = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("code").and_then(|c| c.as_str()).map(str::to_string));
        ApiError::classify(status, code, body)
    }
}

#[derive(Deserialize)]
struct FindSlotsResponse {
    slots: Vec<RawSlot>,
}

#[derive(Deserialize)]
struct RawSlot {
    time: String,
    config_id: String,
    #[serde(default)]
    table_type: Option<String>,
}

#[derive(Deserialize)]
struct DetailsResponse {
    book_token: Option<String>,
    #[serde(default)]
    expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Deserialize)]
struct BookResponse {
    reservation_id: String,
    confirmation_token: String,
}

#[derive(Deserialize)]
struct UpcomingReservationsResponse {
    reservations: Vec<UpcomingReservation>,
}

#[derive(Deserialize)]
struct CalendarResponse {
    days: Vec<CalendarDay>,
}

#[async_trait]
impl UpstreamApi for HttpUpstreamApi {
    async fn find_slots(
        &self,
        venue_id: &str,
        day: NaiveDate,
        party_size: i64,
        proxy_url: Option<&str>,
    ) -> Result<Vec<Slot>, ApiError> {
        let req = self
            .request(reqwest::Method::GET, "/api/find", proxy_url)
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?
            .query(&[
                ("venue_id", venue_id.to_string()),
                ("day", day.format("%Y-%m-%d").to_string()),
                ("party_size", party_size.to_string()),
            ]);
        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }
        let parsed: FindSlotsResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        Ok(parsed
            .slots
            .into_iter()
            .map(|s| Slot {
                restaurant_id: 0,
                target_date: day,
                party_size,
                config_id: s.config_id,
                time_string: s.time,
                table_type: s.table_type,
            })
            .collect())
    }

    async fn get_details(
        &self,
        venue_id: &str,
        day: NaiveDate,
        party_size: i64,
        config_id: &str,
        user_auth_token: &str,
        proxy_url: Option<&str>,
    ) -> Result<Option<BookToken>, ApiError> {
        let req = self
            .request(reqwest::Method::GET, "/api/details", proxy_url)
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?
            .query(&[
                ("venue_id", venue_id.to_string()),
                ("day", day.format("%Y-%m-%d").to_string()),
                ("party_size", party_size.to_string()),
                ("config_id", config_id.to_string()),
                ("auth_token", user_auth_token.to_string()),
            ]);
        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }
        let parsed: DetailsResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        Ok(parsed.book_token.map(|token| BookToken {
            token,
            expires_at: parsed
                .expires_at
                .unwrap_or_else(|| chrono::Utc::now() + chrono::Duration::seconds(60)),
        }))
    }

    async fn book(
        &self,
        book_token: &str,
        payment_method_id: i64,
        proxy_url: Option<&str>,
    ) -> Result<BookResult, ApiError> {
        // application/x-www-form-urlencoded with book_token, a JSON-encoded
        // payment-method struct, and a source_id (spec.md §6).
        let payment_method = serde_json::json!({ "id": payment_method_id }).to_string();
        let form = [
            ("book_token", book_token.to_string()),
            ("payment_method", payment_method),
            ("source_id", "sniper".to_string()),
        ];
        let resp = self
            .request(reqwest::Method::POST, "/api/book", proxy_url)
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?
            .form(&form)
            .send()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }
        let parsed: BookResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        Ok(BookResult {
            reservation_id: parsed.reservation_id,
            confirmation_token: parsed.confirmation_token,
        })
    }

    async fn cancel(&self, confirmation_token: &str) -> Result<(), ApiError> {
        let resp = self
            .request(reqwest::Method::POST, "/api/cancel", None)
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?
            .form(&[("confirmation_token", confirmation_token)])
            .send()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }
        Ok(())
    }

    async fn get_upcoming_reservations(
        &self,
        user_auth_token: &str,
        proxy_url: Option<&str>,
    ) -> Result<Vec<UpcomingReservation>, ApiError> {
        let resp = self
            .request(reqwest::Method::GET, "/api/user/reservations", proxy_url)
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?
            .query(&[("auth_token", user_auth_token)])
            .send()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }
        let parsed: UpcomingReservationsResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        Ok(parsed.reservations)
    }

    async fn get_calendar(
        &self,
        venue_id: &str,
        party_size: i64,
        start_date: NaiveDate,
        end_date: NaiveDate,
        proxy_url: Option<&str>,
    ) -> Result<Vec<CalendarDay>, ApiError> {
        let resp = self
            .request(reqwest::Method::GET, "/api/calendar", proxy_url)
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?
            .query(&[
                ("venue_id", venue_id.to_string()),
                ("party_size", party_size.to_string()),
                ("start_date", start_date.format("%Y-%m-%d").to_string()),
                ("end_date", end_date.format("%Y-%m-%d").to_string()),
            ])
            .send()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_error(resp).await);
        }
        let parsed: CalendarResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::classify(0, None, e.to_string()))?;
        Ok(parsed.days)
    }
}
