use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A user row as the cleanup sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub last_activity_at: Option<String>,
    pub is_active: bool,
}

/// Data for inserting a user. Registration lives outside this service; this
/// exists for seeding and tests.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Identity and contact address of a candidate, used for dry-run samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CandidateSample {
    pub id: i64,
    pub email: String,
}

/// Snapshot of a candidate taken before it is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CandidateSnapshot {
    pub id: i64,
    pub email: String,
    pub last_activity_at: Option<String>,
}

/// Audit row written once per completed cleanup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CleanupReport {
    pub id: i64,
    pub timestamp: String,
    pub users_deleted: i64,
    pub active_users_remaining: i64,
}

/// Format a timestamp the way every timestamp column stores it.
///
/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so string
/// comparison in SQL matches chronological order.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp_is_fixed_width() {
        let whole = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(whole), "2024-01-02T03:04:05.000000Z");

        let later = whole + chrono::Duration::microseconds(1);
        assert_eq!(format_timestamp(later).len(), format_timestamp(whole).len());
        assert!(format_timestamp(later) > format_timestamp(whole));
    }
}
