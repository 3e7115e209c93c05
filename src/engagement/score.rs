//! Engagement scoring.
//!
//! A score is built from four capped components: open rate (up to 40 points),
//! click rate weighted 1.5x (up to 30), recency of the last open (up to 20) and
//! consistency across at least three sends (up to 10).

use super::aggregate::RecipientStats;
use chrono::{DateTime, Utc};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const OPEN_RATE_WEIGHT: f64 = 0.4;
const MAX_OPEN_POINTS: f64 = 40.0;
const CLICK_RATE_WEIGHT: f64 = 1.5;
const MAX_CLICK_POINTS: f64 = 30.0;
const CONSISTENCY_MIN_SENT: u32 = 3;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, sqlx::Type,
)]
#[sqlx(type_name = "engagement_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EngagementLevel {
    New,
    Inactive,
    Low,
    Medium,
    High,
}

impl EngagementLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            70.. => EngagementLevel::High,
            40..=69 => EngagementLevel::Medium,
            15..=39 => EngagementLevel::Low,
            _ => EngagementLevel::Inactive,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngagementLevel::New => "new",
            EngagementLevel::Inactive => "inactive",
            EngagementLevel::Low => "low",
            EngagementLevel::Medium => "medium",
            EngagementLevel::High => "high",
        }
    }
}

impl fmt::Display for EngagementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngagementLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "new" => Ok(EngagementLevel::New),
            "inactive" => Ok(EngagementLevel::Inactive),
            "low" => Ok(EngagementLevel::Low),
            "medium" => Ok(EngagementLevel::Medium),
            "high" => Ok(EngagementLevel::High),
            other => Err(format!("unknown engagement level '{other}'")),
        }
    }
}

/// Score in `0..=100` and the level derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EngagementScore {
    pub score: u8,
    pub level: EngagementLevel,
}

impl EngagementScore {
    /// Score given to subscribers who have not been mailed yet.
    pub const NEW: EngagementScore = EngagementScore {
        score: 0,
        level: EngagementLevel::New,
    };
}

/// Score `stats` as of now.
pub fn score(stats: &RecipientStats, enrolled_at: DateTime<Utc>) -> EngagementScore {
    score_at(stats, enrolled_at, Utc::now())
}

/// Score `stats` as of `now`.
///
/// The enrollment time is accepted so callers can pass tenure for every subscriber,
/// but no component reads it yet.
pub fn score_at(
    stats: &RecipientStats,
    _enrolled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> EngagementScore {
    if stats.emails_sent == 0 {
        return EngagementScore::NEW;
    }

    let open_rate = stats.open_rate();
    let click_rate = stats.click_rate();

    let mut total = (open_rate * OPEN_RATE_WEIGHT).min(MAX_OPEN_POINTS);
    total += (click_rate * CLICK_RATE_WEIGHT).min(MAX_CLICK_POINTS);
    total += recency_bonus(stats.last_email_opened, now);

    if stats.emails_sent >= CONSISTENCY_MIN_SENT {
        total += consistency_bonus(open_rate);
    }

    let score = total.clamp(0.0, 100.0).round() as u8;
    EngagementScore {
        score,
        level: EngagementLevel::from_score(score),
    }
}

fn recency_bonus(last_opened: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(opened) = last_opened else {
        return 0.0;
    };

    match (now - opened).num_days().max(0) {
        0..=7 => 20.0,
        8..=30 => 15.0,
        31..=90 => 10.0,
        91..=180 => 5.0,
        _ => 0.0,
    }
}

fn consistency_bonus(open_rate: f64) -> f64 {
    if open_rate >= 75.0 {
        10.0
    } else if open_rate >= 50.0 {
        7.0
    } else if open_rate >= 25.0 {
        4.0
    } else {
        0.0
    }
}
