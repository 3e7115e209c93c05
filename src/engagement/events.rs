//! Delivery events reported by the transactional-email provider.
//!
//! The provider returns loosely shaped JSON; [`RawDeliveryEvent`] mirrors that
//! shape one-to-one and [`DeliveryEvent`] is the validated form the aggregator
//! works with. Conversion rejects anything it cannot interpret, including event
//! kinds it does not know about.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Last known state of a delivered message.
///
/// Variants are declared in lifecycle order so that `Ord` can be used to pick
/// the most advanced copy of a message reported more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Sent,
    Delivered,
    DeliveryDelayed,
    Opened,
    Clicked,
    Bounced,
    Complained,
}

impl EventKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sent" => Some(EventKind::Sent),
            "delivered" => Some(EventKind::Delivered),
            "delivery_delayed" => Some(EventKind::DeliveryDelayed),
            "opened" => Some(EventKind::Opened),
            "clicked" => Some(EventKind::Clicked),
            "bounced" => Some(EventKind::Bounced),
            "complained" => Some(EventKind::Complained),
            _ => None,
        }
    }

    /// A click can only follow an open, so both count toward opens.
    pub fn counts_as_open(self) -> bool {
        matches!(self, EventKind::Opened | EventKind::Clicked)
    }
}

/// Event exactly as received from the provider's list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeliveryEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub to: Option<Vec<String>>,
    #[serde(default)]
    pub last_event: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Reasons an event is dropped before aggregation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedEvent {
    #[error("event has no message id")]
    MissingId,
    #[error("event {0} has no recipients")]
    NoRecipients(String),
    #[error("event {0} has no last_event")]
    MissingKind(String),
    #[error("event {id} has unknown kind '{kind}'")]
    UnknownKind { id: String, kind: String },
    #[error("event {0} has no created_at")]
    MissingTimestamp(String),
    #[error("event {id} has unparseable created_at '{value}'")]
    InvalidTimestamp { id: String, value: String },
}

/// Validated delivery event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEvent {
    pub message_id: String,
    pub recipients: Vec<String>,
    pub last_event: EventKind,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<&RawDeliveryEvent> for DeliveryEvent {
    type Error = MalformedEvent;

    fn try_from(raw: &RawDeliveryEvent) -> Result<Self, Self::Error> {
        let message_id = raw
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(MalformedEvent::MissingId)?
            .to_string();

        let recipients: Vec<String> = raw
            .to
            .iter()
            .flatten()
            .filter(|address| !address.trim().is_empty())
            .cloned()
            .collect();
        if recipients.is_empty() {
            return Err(MalformedEvent::NoRecipients(message_id));
        }

        let kind = raw
            .last_event
            .as_deref()
            .ok_or_else(|| MalformedEvent::MissingKind(message_id.clone()))?;
        let last_event = EventKind::parse(kind).ok_or_else(|| MalformedEvent::UnknownKind {
            id: message_id.clone(),
            kind: kind.to_string(),
        })?;

        let value = raw
            .created_at
            .as_deref()
            .ok_or_else(|| MalformedEvent::MissingTimestamp(message_id.clone()))?;
        let created_at = parse_timestamp(value).ok_or_else(|| MalformedEvent::InvalidTimestamp {
            id: message_id.clone(),
            value: value.to_string(),
        })?;

        Ok(DeliveryEvent {
            message_id,
            recipients,
            last_event,
            created_at,
        })
    }
}

/// Parse provider timestamps.
///
/// Accepts RFC 3339 as well as the Postgres-style `2024-04-03 22:13:42.674981+00`
/// the provider emits; naive values are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
