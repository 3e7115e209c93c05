use super::config::{MAX_PAGE_SIZE, ResendConfig};
use super::events::RawDeliveryEvent;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading a page of delivery events.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("event source HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("event source returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode event page: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Opaque pagination position handed back by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of events. `next_cursor == None` means the listing is exhausted.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<RawDeliveryEvent>,
    pub next_cursor: Option<Cursor>,
}

/// Paginated, read-only access to delivery events.
#[rocket::async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch the page after `cursor`, or the first page when `cursor` is `None`.
    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<EventPage, SourceError>;
}

/// HTTP client for the provider's `GET /emails` listing.
#[derive(Clone)]
pub struct ResendClient {
    http: reqwest::Client,
    config: ResendConfig,
    page_size: usize,
}

impl ResendClient {
    pub fn new(config: ResendConfig, page_size: usize) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("audience-server/0.1")
            .build()
            .map_err(SourceError::Http)?;

        Ok(Self {
            http: client,
            config,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        })
    }
}

#[rocket::async_trait]
impl EventSource for ResendClient {
    async fn fetch_page(&self, cursor: Option<&Cursor>) -> Result<EventPage, SourceError> {
        let endpoint = format!("{}/emails", self.config.base_url.trim_end_matches('/'));

        let mut query = vec![("limit", self.page_size.to_string())];
        if let Some(cursor) = cursor {
            query.push(("after", cursor.as_str().to_string()));
        }

        let mut request = self.http.get(&endpoint).query(&query);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(SourceError::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status { status, body });
        }

        let body = response.bytes().await.map_err(SourceError::Http)?;
        let listing: ListEmailsResponse = serde_json::from_slice(&body)?;
        log::debug!(
            "fetched {} events (has_more: {})",
            listing.data.len(),
            listing.has_more
        );

        Ok(listing.into_page())
    }
}

#[derive(Debug, Deserialize)]
struct ListEmailsResponse {
    #[serde(default)]
    data: Vec<RawDeliveryEvent>,
    #[serde(default)]
    has_more: bool,
}

impl ListEmailsResponse {
    /// The provider paginates with `after=<last id>`; an empty page or a page
    /// whose last item has no id cannot be continued.
    fn into_page(self) -> EventPage {
        let next_cursor = if self.has_more {
            self.data
                .last()
                .and_then(|event| event.id.as_deref())
                .filter(|id| !id.trim().is_empty())
                .map(Cursor::new)
        } else {
            None
        };

        EventPage {
            events: self.data,
            next_cursor,
        }
    }
}
