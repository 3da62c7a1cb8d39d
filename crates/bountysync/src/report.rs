//! Domain model of a vulnerability report and its activity logs.
//!
//! A [`Report`] is an immutable snapshot of the platform's view for the
//! duration of one reconciliation. Logs are append-only and typed through
//! [`LogKind`]; the engine never reorders them relative to the platform.

use crate::error::ApiError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A vulnerability report fetched from the platform.
#[derive(Debug, Clone)]
pub struct Report {
    /// Stable numeric id, stringified.
    pub report_id: String,
    /// Human-facing local id (`YWH-123`).
    pub local_id: String,
    /// Report title.
    pub title: String,
    /// Bug type triple.
    pub bug_type: BugType,
    /// Affected scope.
    pub scope: String,
    /// CVSS triple.
    pub cvss: Cvss,
    /// Affected end point.
    pub end_point: String,
    /// The vulnerable part of the scope.
    pub vulnerable_part: String,
    /// Name of the vulnerable part.
    pub part_name: String,
    /// Payload sample, when provided by the hunter.
    pub payload_sample: String,
    /// Technical environment description.
    pub technical_environment: String,
    /// Description as platform HTML.
    pub description_html: String,
    /// Report attachments, in platform order.
    pub attachments: Vec<Attachment>,
    /// Author of the report.
    pub hunter: Author,
    /// Workflow state (`accepted`, `resolved`, ...).
    pub status: String,
    /// Tracking status code (`AFI`, `T`, ...), treated opaquely beyond
    /// those two.
    pub tracking_status: String,
    /// Activity logs, in platform delivery order.
    pub logs: Vec<Log>,
    /// Priority, when the program defines priorities.
    pub priority: Option<Priority>,
    /// Program the report belongs to.
    pub program: ReportProgram,
}

impl Report {
    /// The newest `tracking-status` log naming `tracker_name` with a
    /// non-empty tracker id, if any.
    pub fn last_tracking_status_log(&self, tracker_name: &str) -> Option<&Log> {
        self.logs.iter().rev().find(|log| {
            matches!(
                &log.kind,
                LogKind::TrackingStatus {
                    tracker_name: Some(name),
                    tracker_id: Some(id),
                    ..
                } if name == tracker_name && !id.is_empty()
            )
        })
    }

    /// All logs strictly after the log with the given id, in platform order.
    pub fn logs_after(&self, log_id: i64) -> Vec<&Log> {
        match self.logs.iter().position(|log| log.log_id == log_id) {
            Some(position) => self.logs[position + 1..].iter().collect(),
            None => self.logs.iter().collect(),
        }
    }
}

/// A bug type with its taxonomy links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BugType {
    /// Bug type name.
    pub name: String,
    /// Link to the bug type description.
    pub link: String,
    /// Link to remediation guidance, when available.
    pub remediation_link: String,
}

/// A CVSS rating.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cvss {
    /// Criticity label (`low`, `medium`, `high`, `critical`).
    pub criticity: String,
    /// Numeric score.
    pub score: f64,
    /// Vector string.
    pub vector: String,
}

/// A report or log author.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Author {
    /// Platform handle.
    pub username: String,
}

/// A program priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Priority {
    /// Priority name.
    pub name: String,
}

/// Program details carried by a report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportProgram {
    /// Program title.
    pub title: String,
    /// Program slug.
    pub slug: String,
}

/// Loader invoked by adapters when attachment bytes are actually needed.
pub type AttachmentLoader = Arc<dyn Fn() -> Result<Vec<u8>, ApiError> + Send + Sync>;

/// An attachment: metadata plus a lazy byte loader. The engine never reads
/// the bytes itself; adapters invoke [`Attachment::data`] at upload time.
#[derive(Clone)]
pub struct Attachment {
    /// Platform-assigned attachment id.
    pub attachment_id: i64,
    /// Platform-assigned name.
    pub name: String,
    /// Original file name.
    pub original_name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Download URL on the platform.
    pub url: String,
    loader: AttachmentLoader,
}

impl Attachment {
    /// Build an attachment with a lazy loader.
    pub fn new(
        attachment_id: i64,
        name: impl Into<String>,
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        url: impl Into<String>,
        loader: AttachmentLoader,
    ) -> Self {
        Self {
            attachment_id,
            name: name.into(),
            original_name: original_name.into(),
            mime_type: mime_type.into(),
            size,
            url: url.into(),
            loader,
        }
    }

    /// Build an attachment whose bytes are already in memory.
    pub fn eager(
        attachment_id: i64,
        original_name: impl Into<String>,
        mime_type: impl Into<String>,
        url: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        let original_name = original_name.into();
        let size = data.len() as u64;
        Self {
            attachment_id,
            name: original_name.clone(),
            original_name,
            mime_type: mime_type.into(),
            size,
            url: url.into(),
            loader: Arc::new(move || Ok(data.clone())),
        }
    }

    /// Fetch the attachment bytes through the loader.
    pub fn data(&self) -> Result<Vec<u8>, ApiError> {
        (self.loader)()
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Attachment")
            .field("attachment_id", &self.attachment_id)
            .field("name", &self.name)
            .field("original_name", &self.original_name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// A typed, timestamped event on a report.
#[derive(Debug, Clone)]
pub struct Log {
    /// Creation timestamp as delivered by the platform.
    pub created_at: String,
    /// Integer log id.
    pub log_id: i64,
    /// Whether the log is private to the program.
    pub private: bool,
    /// Log author.
    pub author: Author,
    /// Message as platform HTML.
    pub message_html: String,
    /// Log attachments.
    pub attachments: Vec<Attachment>,
    /// Typed variant.
    pub kind: LogKind,
}

/// The typed variants a log can take. Unknown kinds are preserved in
/// [`LogKind::Other`] and formatted from their raw message HTML.
#[derive(Debug, Clone)]
pub enum LogKind {
    /// A hunter or manager comment.
    Comment,
    /// The CVSS rating changed.
    CvssUpdate {
        /// Rating before the change.
        old_cvss: Cvss,
        /// Rating after the change.
        new_cvss: Cvss,
    },
    /// Report detail fields changed.
    DetailsUpdate {
        /// Field values before the change.
        old_details: BTreeMap<String, String>,
        /// Field values after the change.
        new_details: BTreeMap<String, String>,
    },
    /// The priority changed.
    PriorityUpdate {
        /// Priority after the change.
        new_priority: Option<Priority>,
    },
    /// A reward was granted.
    Reward {
        /// Kind of reward.
        reward_type: String,
    },
    /// The workflow state changed.
    StatusUpdate {
        /// Workflow state before the change.
        old_status: Option<String>,
        /// Workflow state after the change.
        new_status: Option<String>,
    },
    /// The report became tracked in a tracker.
    TrackingStatus {
        /// Tracker name.
        tracker_name: Option<String>,
        /// Tracker base URL.
        tracker_url: Option<String>,
        /// Tracker-side issue id.
        tracker_id: Option<String>,
    },
    /// A synchronization round completed, with its state token.
    TrackerUpdate {
        /// Tracker name.
        tracker_name: Option<String>,
        /// Tracker base URL.
        tracker_url: Option<String>,
        /// Tracker-side issue id.
        tracker_id: Option<String>,
        /// Encrypted state token.
        tracker_token: Option<String>,
    },
    /// A tracker-side comment mirrored into the report.
    TrackerMessage {
        /// Tracker name.
        tracker_name: Option<String>,
        /// Tracker base URL.
        tracker_url: Option<String>,
        /// Tracker-side issue id.
        tracker_id: Option<String>,
    },
    /// Any log kind this engine does not know.
    Other {
        /// The raw kind string.
        kind: String,
    },
}

/// Human labels of the report detail fields.
pub fn report_property_label(property: &str) -> &str {
    match property {
        "bug_type" => "Bug Type",
        "scope" => "Scope",
        "end_point" => "End Point",
        "vulnerable_part" => "Vulnerable Part",
        "part_name" => "Part Name",
        "payload_sample" => "Payload Sample",
        other => other,
    }
}

/// Translate a workflow state into its human label; unknown states
/// translate to an empty string.
pub fn translate_status(status: &str) -> &str {
    match status {
        "new" => "New",
        "under_review" => "Under Review",
        "ask_verif" => "Ask for Fix Verification",
        "need_more_info" => "Need More Info",
        "accepted" => "Accepted",
        "invalid" => "Invalid",
        "duplicate" => "Duplicate",
        "resolved" => "Resolved",
        "wont_fix" => "Won't Fix",
        "rtfs" => "RTFS",
        "out_of_scope" => "Out of Scope",
        "spam" => "Spam",
        "auto_close" => "Auto Close",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(log_id: i64, kind: LogKind) -> Log {
        Log {
            created_at: "2021-01-01T00:00:00+00:00".to_string(),
            log_id,
            private: false,
            author: Author {
                username: "user".to_string(),
            },
            message_html: String::new(),
            attachments: Vec::new(),
            kind,
        }
    }

    fn tracking_status(log_id: i64, tracker_name: &str, tracker_id: Option<&str>) -> Log {
        log(
            log_id,
            LogKind::TrackingStatus {
                tracker_name: Some(tracker_name.to_string()),
                tracker_url: Some("http://tracker".to_string()),
                tracker_id: tracker_id.map(str::to_string),
            },
        )
    }

    fn report_with_logs(logs: Vec<Log>) -> Report {
        Report {
            report_id: "123".to_string(),
            local_id: "YWH-123".to_string(),
            title: "A bug".to_string(),
            bug_type: BugType::default(),
            scope: String::new(),
            cvss: Cvss::default(),
            end_point: String::new(),
            vulnerable_part: String::new(),
            part_name: String::new(),
            payload_sample: String::new(),
            technical_environment: String::new(),
            description_html: String::new(),
            attachments: Vec::new(),
            hunter: Author::default(),
            status: "accepted".to_string(),
            tracking_status: "AFI".to_string(),
            logs,
            priority: None,
            program: ReportProgram::default(),
        }
    }

    #[test]
    fn finds_newest_matching_tracking_status_log() {
        let report = report_with_logs(vec![
            tracking_status(1, "gl", Some("10")),
            tracking_status(2, "gh", Some("20")),
            tracking_status(3, "gl", Some("30")),
        ]);
        let found = report.last_tracking_status_log("gl").expect("log");
        assert_eq!(found.log_id, 3);
    }

    #[test]
    fn ignores_tracking_status_logs_without_tracker_id() {
        let report = report_with_logs(vec![
            tracking_status(1, "gl", Some("10")),
            tracking_status(2, "gl", None),
        ]);
        let found = report.last_tracking_status_log("gl").expect("log");
        assert_eq!(found.log_id, 1);
    }

    #[test]
    fn logs_after_excludes_the_cursor_log() {
        let report = report_with_logs(vec![
            log(1, LogKind::Comment),
            log(2, LogKind::Comment),
            log(3, LogKind::Comment),
        ]);
        let after: Vec<i64> = report.logs_after(2).iter().map(|log| log.log_id).collect();
        assert_eq!(after, vec![3]);
    }

    #[test]
    fn logs_after_unknown_id_returns_everything() {
        let report = report_with_logs(vec![log(1, LogKind::Comment)]);
        assert_eq!(report.logs_after(99).len(), 1);
    }

    #[test]
    fn eager_attachment_serves_its_bytes() {
        let attachment = Attachment::eager(7, "poc.txt", "text/plain", "http://a/7", b"abc".to_vec());
        assert_eq!(attachment.data().expect("data"), b"abc");
        assert_eq!(attachment.size, 3);
    }

    #[test]
    fn unknown_status_translates_to_empty() {
        assert_eq!(translate_status("accepted"), "Accepted");
        assert_eq!(translate_status("whatever"), "");
    }
}
