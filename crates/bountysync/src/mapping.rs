//! Mapping of raw platform API payloads into the domain model.
//!
//! Redirect wrappers are unwrapped here, once, so the rest of the engine
//! only ever sees clean URLs.

use crate::report::{
    Attachment, AttachmentLoader, Author, BugType, Cvss, Log, LogKind, Priority, Report,
    ReportProgram,
};
use bountysync_markup::{
    cleanup_redirects_in_html, cleanup_redirects_in_text, scrub_attachment_urls,
};
use serde_json::Value;
use std::collections::BTreeMap;

/// Context shared by all mapping calls of one platform session.
pub struct MappingContext<'a> {
    /// Domain used by the platform's redirect wrapper.
    pub yeswehack_domain: String,
    /// Host serving the platform's attachments.
    pub platform_host: String,
    /// Builds the lazy byte loader for an attachment URL.
    pub attachment_loader: &'a dyn Fn(&str) -> AttachmentLoader,
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Map a detailed raw report payload.
pub fn map_raw_report(context: &MappingContext<'_>, raw_report: &Value) -> Report {
    let report_id = raw_report
        .get("id")
        .and_then(Value::as_i64)
        .unwrap_or_default()
        .to_string();
    let empty = Value::Null;
    let raw_program = raw_report.get("program").unwrap_or(&empty);
    let attachments = map_raw_attachments(context, raw_report.get("attachments"));
    let attachment_urls: Vec<String> = attachments
        .iter()
        .map(|attachment| attachment.url.clone())
        .collect();
    let description_html = scrub_attachment_urls(
        &cleanup_redirects_in_html(
            &context.yeswehack_domain,
            &str_field(raw_report, "description_html"),
        ),
        &attachment_urls,
        &context.platform_host,
    );
    Report {
        report_id,
        local_id: str_field(raw_report, "local_id"),
        title: str_field(raw_report, "title"),
        bug_type: map_raw_bug_type(raw_report.get("bug_type").unwrap_or(&empty)),
        scope: str_field(raw_report, "scope"),
        cvss: map_raw_cvss(raw_report.get("cvss").unwrap_or(&empty)),
        end_point: str_field(raw_report, "end_point"),
        vulnerable_part: str_field(raw_report, "vulnerable_part"),
        part_name: str_field(raw_report, "part_name"),
        payload_sample: str_field(raw_report, "payload_sample"),
        technical_environment: str_field(raw_report, "technical_environment"),
        description_html,
        attachments,
        hunter: map_raw_author(raw_report.get("hunter")),
        status: raw_report
            .get("status")
            .map(|status| str_field(status, "workflow_state"))
            .unwrap_or_default(),
        tracking_status: str_field(raw_report, "tracking_status"),
        logs: raw_report
            .get("logs")
            .and_then(Value::as_array)
            .map(|logs| logs.iter().map(|log| map_raw_log(context, log)).collect())
            .unwrap_or_default(),
        priority: raw_report
            .get("priority")
            .filter(|priority| !priority.is_null())
            .map(|priority| Priority {
                name: str_field(priority, "name"),
            }),
        program: ReportProgram {
            title: str_field(raw_program, "title"),
            slug: str_field(raw_program, "slug"),
        },
    }
}

fn map_raw_bug_type(raw_bug_type: &Value) -> BugType {
    BugType {
        name: str_field(raw_bug_type, "name"),
        link: str_field(raw_bug_type, "link"),
        remediation_link: str_field(raw_bug_type, "remediation_link"),
    }
}

fn map_raw_cvss(raw_cvss: &Value) -> Cvss {
    Cvss {
        criticity: str_field(raw_cvss, "criticity"),
        score: raw_cvss
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or_default(),
        vector: str_field(raw_cvss, "vector"),
    }
}

fn map_raw_author(raw_author: Option<&Value>) -> Author {
    Author {
        username: raw_author
            .and_then(|author| author.get("username"))
            .and_then(Value::as_str)
            .unwrap_or("Anonymous")
            .to_string(),
    }
}

fn map_raw_attachments(context: &MappingContext<'_>, raw: Option<&Value>) -> Vec<Attachment> {
    raw.and_then(Value::as_array)
        .map(|attachments| {
            attachments
                .iter()
                .map(|attachment| map_raw_attachment(context, attachment))
                .collect()
        })
        .unwrap_or_default()
}

fn map_raw_attachment(context: &MappingContext<'_>, raw_attachment: &Value) -> Attachment {
    let url = str_field(raw_attachment, "url");
    Attachment::new(
        raw_attachment
            .get("id")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        str_field(raw_attachment, "name"),
        str_field(raw_attachment, "original_name"),
        str_field(raw_attachment, "mime_type"),
        raw_attachment
            .get("size")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
        url.clone(),
        (context.attachment_loader)(&url),
    )
}

fn map_raw_details(raw: Option<&Value>) -> BTreeMap<String, String> {
    raw.and_then(Value::as_object)
        .map(|details| {
            details
                .iter()
                .map(|(field, value)| {
                    let value = match value {
                        Value::String(text) => text.clone(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (field.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn clean_tracker_url(context: &MappingContext<'_>, raw_log: &Value) -> Option<String> {
    opt_str_field(raw_log, "tracker_url")
        .map(|tracker_url| cleanup_redirects_in_text(&context.yeswehack_domain, &tracker_url))
}

/// Map one raw log payload into its typed variant.
pub fn map_raw_log(context: &MappingContext<'_>, raw_log: &Value) -> Log {
    let empty = Value::Null;
    let kind = match raw_log.get("type").and_then(Value::as_str).unwrap_or("") {
        "comment" => LogKind::Comment,
        "cvss-update" => LogKind::CvssUpdate {
            old_cvss: map_raw_cvss(raw_log.get("old_cvss").unwrap_or(&empty)),
            new_cvss: map_raw_cvss(raw_log.get("new_cvss").unwrap_or(&empty)),
        },
        "details-update" => LogKind::DetailsUpdate {
            old_details: map_raw_details(raw_log.get("old_details")),
            new_details: map_raw_details(raw_log.get("new_details")),
        },
        "priority-update" => LogKind::PriorityUpdate {
            new_priority: raw_log
                .get("priority")
                .filter(|priority| !priority.is_null())
                .map(|priority| Priority {
                    name: str_field(priority, "name"),
                }),
        },
        "reward" => LogKind::Reward {
            reward_type: str_field(raw_log, "reward_type"),
        },
        "status-update" => LogKind::StatusUpdate {
            old_status: raw_log
                .get("old_status")
                .and_then(|status| status.get("workflow_state"))
                .and_then(Value::as_str)
                .map(str::to_string),
            new_status: raw_log
                .get("status")
                .and_then(|status| status.get("workflow_state"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "tracking-status" => LogKind::TrackingStatus {
            tracker_name: opt_str_field(raw_log, "tracker_name"),
            tracker_url: clean_tracker_url(context, raw_log),
            tracker_id: opt_str_field(raw_log, "tracker_id"),
        },
        "tracker-update" => LogKind::TrackerUpdate {
            tracker_name: opt_str_field(raw_log, "tracker_name"),
            tracker_url: clean_tracker_url(context, raw_log),
            tracker_id: opt_str_field(raw_log, "tracker_id"),
            tracker_token: opt_str_field(raw_log, "tracker_token"),
        },
        "tracker-message" => LogKind::TrackerMessage {
            tracker_name: opt_str_field(raw_log, "tracker_name"),
            tracker_url: clean_tracker_url(context, raw_log),
            tracker_id: opt_str_field(raw_log, "tracker_id"),
        },
        other => LogKind::Other {
            kind: other.to_string(),
        },
    };
    Log {
        created_at: str_field(raw_log, "created_at"),
        log_id: raw_log
            .get("id")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        private: raw_log
            .get("private")
            .and_then(Value::as_bool)
            .unwrap_or_default(),
        author: map_raw_author(raw_log.get("author")),
        message_html: cleanup_redirects_in_html(
            &context.yeswehack_domain,
            &str_field(raw_log, "message_html"),
        ),
        attachments: map_raw_attachments(context, raw_log.get("attachments")),
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    static NOOP_LOADER: fn(&str) -> AttachmentLoader = |_| Arc::new(|| Ok(Vec::new()));

    fn context_with_noop_loader() -> MappingContext<'static> {
        MappingContext {
            yeswehack_domain: "yeswehack.com".to_string(),
            platform_host: "apps.yeswehack.com".to_string(),
            attachment_loader: &NOOP_LOADER,
        }
    }

    #[test]
    fn maps_a_detailed_report() {
        let raw = serde_json::json!({
            "id": 123,
            "local_id": "YWH-123",
            "title": "A bug",
            "bug_type": {"name": "XSS", "link": "https://b/x", "remediation_link": "https://b/r"},
            "scope": "https://target",
            "cvss": {"criticity": "high", "score": 7.5, "vector": "CVSS:3.1"},
            "end_point": "/search",
            "vulnerable_part": "q",
            "part_name": "param",
            "payload_sample": "x",
            "technical_environment": "prod",
            "description_html": "<p>desc</p>",
            "attachments": [
                {"id": 1, "name": "a", "original_name": "a.png", "mime_type": "image/png", "size": 10, "url": "https://apps/a/1"}
            ],
            "hunter": {"username": "hunter"},
            "status": {"workflow_state": "accepted"},
            "tracking_status": "AFI",
            "priority": {"name": "P1"},
            "program": {"title": "Prog", "slug": "prog"},
            "logs": [
                {"id": 5, "type": "comment", "private": true, "created_at": "2021-01-01",
                 "author": {"username": "manager"}, "message_html": "<p>hi</p>", "attachments": []}
            ]
        });
        let report = map_raw_report(&context_with_noop_loader(), &raw);
        assert_eq!(report.report_id, "123");
        assert_eq!(report.status, "accepted");
        assert_eq!(report.attachments.len(), 1);
        assert_eq!(report.priority.as_ref().expect("priority").name, "P1");
        assert_eq!(report.logs.len(), 1);
        assert!(report.logs[0].private);
        assert!(matches!(report.logs[0].kind, LogKind::Comment));
    }

    #[test]
    fn maps_typed_log_variants() {
        let context = context_with_noop_loader();
        let tracking = map_raw_log(
            &context,
            &serde_json::json!({
                "id": 1, "type": "tracking-status", "created_at": "2021-01-01",
                "tracker_name": "gl", "tracker_id": "10", "tracker_url": "http://gl/10"
            }),
        );
        assert!(matches!(
            tracking.kind,
            LogKind::TrackingStatus { tracker_name: Some(ref name), .. } if name == "gl"
        ));

        let status = map_raw_log(
            &context,
            &serde_json::json!({
                "id": 2, "type": "status-update", "created_at": "2021-01-01",
                "old_status": {"workflow_state": "new"}, "status": {"workflow_state": "accepted"}
            }),
        );
        assert!(matches!(
            status.kind,
            LogKind::StatusUpdate { old_status: Some(ref old), new_status: Some(ref new) }
                if old == "new" && new == "accepted"
        ));

        let unknown = map_raw_log(
            &context,
            &serde_json::json!({"id": 3, "type": "brand-new-kind", "created_at": "2021-01-01"}),
        );
        assert!(matches!(unknown.kind, LogKind::Other { ref kind } if kind == "brand-new-kind"));
    }

    #[test]
    fn description_attachment_links_are_scrubbed() {
        let raw = serde_json::json!({
            "id": 1,
            "description_html":
                "<a href=\"https://apps.yeswehack.com/attachments/9?token=x&sig=y\">file</a>",
            "attachments": [
                {"id": 9, "name": "f", "original_name": "f.png", "mime_type": "image/png",
                 "size": 1, "url": "https://apps.yeswehack.com/attachments/9"}
            ]
        });
        let report = map_raw_report(&context_with_noop_loader(), &raw);
        assert!(
            report
                .description_html
                .contains("\"https://apps.yeswehack.com/attachments/9\"")
        );
        assert!(!report.description_html.contains("token=x"));
    }

    #[test]
    fn missing_author_maps_to_anonymous() {
        let log = map_raw_log(
            &context_with_noop_loader(),
            &serde_json::json!({"id": 1, "type": "comment", "created_at": "2021-01-01"}),
        );
        assert_eq!(log.author.username, "Anonymous");
    }
}
