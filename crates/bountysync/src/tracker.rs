//! The uniform contract every tracker adapter implements, and the types
//! exchanged across it.

use crate::error::ApiError;
use crate::report::{Log, Report};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tracker-side issue mirroring one report. Produced by adapters and
/// never persisted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerIssue {
    /// Base URL of the tracker.
    pub tracker_url: String,
    /// Project identifier on the tracker.
    pub project: String,
    /// Tracker-side issue id.
    pub issue_id: String,
    /// Deep link to the issue.
    pub issue_url: String,
    /// Whether the issue is closed.
    pub closed: bool,
}

/// Bytes of a tracker-side attachment downloaded through the adapter's
/// credentialed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerAttachment {
    /// File name.
    pub filename: String,
    /// MIME type.
    pub mime_type: String,
    /// Raw content.
    pub content: Vec<u8>,
}

/// A comment on a tracker issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerIssueComment {
    /// Tracker-side comment id.
    pub comment_id: String,
    /// Display name of the comment author.
    pub author: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Comment body, in the platform's markdown after adapter conversion.
    pub body: String,
    /// Inline attachment bytes, keyed by the reference appearing in `body`.
    pub attachments: BTreeMap<String, TrackerAttachment>,
}

/// Result of sending logs to a tracker.
#[derive(Debug, Clone)]
pub struct SendLogsResult {
    /// The issue the comments were appended to.
    pub tracker_issue: TrackerIssue,
    /// The created comments, in creation order.
    pub added_comments: Vec<TrackerIssueComment>,
}

/// Per-report synchronization state carried inside state tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerIssueState {
    /// Whether the issue was closed at the last synchronization.
    #[serde(default)]
    pub closed: bool,
    /// Name of the tracker the state belongs to.
    #[serde(default)]
    pub bugtracker_name: Option<String>,
    /// Tracker-side comment ids already accounted for: comments this engine
    /// created on the issue and tracker-origin comments already mirrored
    /// back to the platform.
    #[serde(default)]
    pub downloaded_comments: Vec<String>,
}

impl bountysync_state::State for TrackerIssueState {
    const NAME: &'static str = "TrackerIssueState";
}

/// The uniform adapter contract.
///
/// Implementations authenticate lazily on first use and keep one HTTP
/// session for the whole run. All operations are blocking; adapters may
/// multiplex internally but must not expose asynchrony.
pub trait TrackerClient {
    /// Human name of the tracker kind (`GitLab`, `Jira`, ...).
    fn tracker_type(&self) -> &'static str;

    /// Succeeds iff the credentials grant enough access to create and list
    /// issues.
    fn test(&self) -> Result<(), ApiError>;

    /// Look up an issue. `Ok(None)` means the tracker definitively reports
    /// no such issue; errors must never be collapsed into `None`.
    fn get_tracker_issue(&self, issue_id: &str) -> Result<Option<TrackerIssue>, ApiError>;

    /// Create a new issue from the formatted report and upload its
    /// attachments. The returned issue has a non-empty id and URL.
    fn send_report(&self, report: &Report) -> Result<TrackerIssue, ApiError>;

    /// Append one tracker comment per log, in input order. Partial failure
    /// surfaces as an error; comments created before the failure stay in
    /// place.
    fn send_logs(
        &self,
        tracker_issue: &TrackerIssue,
        logs: &[&Log],
    ) -> Result<SendLogsResult, ApiError>;

    /// Tracker-origin comments in chronological order, skipping ids listed
    /// in `exclude_comments`, with inline image bytes fetched through the
    /// adapter's session.
    fn get_tracker_issue_comments(
        &self,
        issue_id: &str,
        exclude_comments: &[String],
    ) -> Result<Vec<TrackerIssueComment>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_state_roundtrips_through_a_token() {
        let state = TrackerIssueState {
            closed: true,
            bugtracker_name: Some("gl".to_string()),
            downloaded_comments: vec!["c1".to_string(), "c2".to_string()],
        };
        let token = bountysync_state::encrypt(&state, "123").expect("encrypt");
        let decoded: TrackerIssueState =
            bountysync_state::decrypt(&token, "123").expect("decrypt").expect("state");
        assert_eq!(state, decoded);
    }

    #[test]
    fn issue_state_tolerates_tokens_without_downloaded_comments() {
        // Tokens written before the feedback protocol carry only the closed
        // flag and tracker name.
        use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
        let payload = serde_json::to_string(&serde_json::json!([
            "TrackerIssueState",
            {"closed": false, "bugtracker_name": "gl"}
        ]))
        .expect("payload");
        let encrypted: Vec<u8> = payload
            .bytes()
            .zip(b"123".iter().cycle())
            .map(|(byte, key_byte)| byte ^ key_byte)
            .collect();
        let token = format!("[YWH2BT:S:{}]", BASE64.encode(encrypted));
        let decoded: TrackerIssueState =
            bountysync_state::decrypt(&token, "123").expect("decrypt").expect("state");
        assert_eq!(decoded.downloaded_comments, Vec::<String>::new());
        assert_eq!(decoded.bugtracker_name.as_deref(), Some("gl"));
    }
}
