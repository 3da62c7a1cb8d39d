//! Tracker adapters: one REST implementation of the adapter contract per
//! supported tracker.

pub mod github;
pub mod gitlab;
pub mod jira;
pub mod servicenow;

use crate::error::ApiError;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::blocking::Client;

pub use github::GitHubTrackerClient;
pub use gitlab::GitLabTrackerClient;
pub use jira::JiraTrackerClient;
pub use servicenow::ServiceNowTrackerClient;

pub(crate) fn http_client(verify: bool) -> Result<Client, ApiError> {
    Client::builder()
        .user_agent(format!("bountysync/{}", env!("CARGO_PKG_VERSION")))
        .danger_accept_invalid_certs(!verify)
        .build()
        .map_err(|error| ApiError::adapter(format!("unable to build HTTP client: {error}")))
}

/// Parse the timestamp formats the trackers hand out: RFC 3339 with or
/// without a colon in the offset, and ServiceNow's plain UTC form.
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(parsed.and_utc());
    }
    Err(ApiError::protocol(format!(
        "unparseable tracker timestamp {raw:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tracker_timestamp_formats() {
        parse_timestamp("2021-01-01T15:17:23.420+00:00").expect("rfc3339");
        parse_timestamp("2021-01-01T15:17:23.420+0000").expect("compact offset");
        parse_timestamp("2021-01-01 15:17:23").expect("servicenow");
        assert!(parse_timestamp("yesterday").is_err());
    }
}
