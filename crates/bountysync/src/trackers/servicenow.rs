//! ServiceNow adapter: incidents over the Table API.
//!
//! An incident has two activity streams — journal comments and attachments —
//! which are merged chronologically into one comment timeline. Closed
//! incidents accept no further comments.

use crate::error::ApiError;
use crate::formatter::{ReportMessageFormatter, markdown_formatter};
use crate::report::{Attachment, Log, Report};
use crate::tracker::{
    SendLogsResult, TrackerAttachment, TrackerClient, TrackerIssue, TrackerIssueComment,
};
use crate::trackers::{http_client, parse_timestamp};
use bountysync_config::ServiceNowConfiguration;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn inline_attachment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(!?\[([^\]]+)]\(([^)]+)\))").expect("valid regex"))
}

const INCIDENT_ATTACHMENT_PREFIX: &str = "incident_";
const COMMENT_ATTACHMENT_PREFIX: &str = "comment_";

/// Adapter for ServiceNow instances.
pub struct ServiceNowTrackerClient {
    configuration: ServiceNowConfiguration,
    http: Client,
    formatter: ReportMessageFormatter,
}

impl ServiceNowTrackerClient {
    /// Build an adapter; no traffic happens until the first operation.
    pub fn new(configuration: &ServiceNowConfiguration) -> Result<Self, ApiError> {
        Ok(Self {
            configuration: configuration.clone(),
            http: http_client(configuration.verify)?,
            formatter: markdown_formatter(),
        })
    }

    fn base_url(&self) -> String {
        let scheme = if self.configuration.use_ssl {
            "https"
        } else {
            "http"
        };
        format!("{scheme}://{}", self.configuration.host)
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/now{path}", self.base_url())
    }

    fn authenticated(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .basic_auth(&self.configuration.login, Some(&self.configuration.password))
            .header("Accept", "application/json")
    }

    fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, ApiError> {
        let response = self
            .authenticated(self.http.get(url))
            .query(query)
            .send()
            .map_err(|error| ApiError::transport(format!("GET {url}"), error))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Authentication {
                context: format!("ServiceNow returned {status} for {url}"),
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                context: format!("GET {url}"),
            });
        }
        if !status.is_success() {
            return Err(ApiError::protocol(format!("GET {url} returned {status}")));
        }
        response
            .json()
            .map_err(|_| ApiError::protocol(format!("GET {url} did not return JSON")))
    }

    fn send_json(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &Value,
    ) -> Result<Value, ApiError> {
        let response = self
            .authenticated(self.http.request(method.clone(), url))
            .json(body)
            .send()
            .map_err(|error| ApiError::transport(format!("{method} {url}"), error))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::protocol(format!(
                "{method} {url} returned {status}"
            )));
        }
        response
            .json()
            .map_err(|_| ApiError::protocol(format!("{method} {url} did not return JSON")))
    }

    fn get_incident(&self, sys_id: &str) -> Result<Option<Value>, ApiError> {
        let url = self.api(&format!("/table/incident/{sys_id}"));
        match self.get_json(&url, &[("sysparm_display_value", "true")]) {
            Ok(body) => Ok(body.get("result").cloned()),
            Err(ApiError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn incident_url(&self, sys_id: &str) -> String {
        format!(
            "{}/nav_to.do?uri=%2Fincident.do%3Fsys_id%3D{sys_id}",
            self.base_url()
        )
    }

    fn build_tracker_issue(&self, issue_id: String, closed: bool) -> TrackerIssue {
        TrackerIssue {
            tracker_url: self.base_url(),
            project: self.configuration.host.clone(),
            issue_id: issue_id.clone(),
            issue_url: self.incident_url(&issue_id),
            closed,
        }
    }

    fn incident_is_closed(incident: &Value) -> bool {
        incident
            .get("state")
            .and_then(Value::as_str)
            .map(|state| state.to_lowercase() == "closed")
            .unwrap_or(false)
    }

    fn incident_sys_id(incident: &Value) -> String {
        incident
            .get("sys_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// Inline references to report attachments cannot stay inline; the
    /// files live in the incident's attachment stream instead.
    fn replace_inline_attachments(
        attachments: &[Attachment],
        content: &str,
        file_name_prefix: &str,
    ) -> String {
        let attachment_urls: Vec<&str> =
            attachments.iter().map(|attachment| attachment.url.as_str()).collect();
        let mut content = content.to_string();
        let references: Vec<(String, String, String)> = inline_attachment_re()
            .captures_iter(&content)
            .map(|captures| {
                (
                    captures[1].to_string(),
                    captures[2].to_string(),
                    captures[3].to_string(),
                )
            })
            .collect();
        for (reference, attachment_name, url) in references {
            if attachment_urls.contains(&url.as_str()) {
                content = content.replace(
                    &reference,
                    &format!("[See attachment \"{file_name_prefix}{attachment_name}\"]"),
                );
            }
        }
        content
    }

    fn upload_attachments(
        &self,
        attachments: &[Attachment],
        file_name_prefix: &str,
        record_sys_id: &str,
    ) -> Result<(), ApiError> {
        for attachment in attachments {
            let data = attachment.data()?;
            let url = self.api("/attachment/file");
            let file_name = format!("{file_name_prefix}{}", attachment.original_name);
            let response = self
                .authenticated(self.http.post(&url))
                .query(&[
                    ("table_name", "incident"),
                    ("table_sys_id", record_sys_id),
                    ("file_name", file_name.as_str()),
                ])
                .header("Content-Type", &attachment.mime_type)
                .body(data)
                .send()
                .map_err(|error| ApiError::transport(format!("POST {url}"), error))?;
            if !response.status().is_success() {
                return Err(ApiError::adapter(format!(
                    "unable to upload attachments to incident {record_sys_id}"
                )));
            }
        }
        Ok(())
    }

    /// `^` separates query terms in the Table API.
    fn escape_query_term(term: &str) -> String {
        term.replace('^', "^^")
    }

    fn journal_query(&self, query: String) -> Result<Vec<Value>, ApiError> {
        let url = self.api("/table/sys_journal_field");
        let body = self.get_json(&url, &[("sysparm_query", query.as_str())])?;
        Ok(body
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn get_journal_comments(
        &self,
        incident_sys_id: &str,
        exclude_comments: &[String],
    ) -> Result<Vec<Value>, ApiError> {
        let query = format!(
            "element_id={incident_sys_id}^element=comments^ORDERBYsys_created_on"
        );
        Ok(self
            .journal_query(query)?
            .into_iter()
            .filter(|record| {
                !exclude_comments.contains(&record_field(record, "sys_id"))
            })
            .collect())
    }

    fn get_incident_attachments(
        &self,
        incident_sys_id: &str,
        exclude_comments: &[String],
    ) -> Result<Vec<Value>, ApiError> {
        let url = self.api("/attachment");
        let query = format!(
            "table_name=incident^table_sys_id={incident_sys_id}^ORDERBYsys_created_on"
        );
        let body = self.get_json(&url, &[("sysparm_query", query.as_str())])?;
        Ok(body
            .get("result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|record| {
                !exclude_comments.contains(&record_field(record, "sys_id"))
            })
            .collect())
    }

    fn extract_journal_comment(&self, record: &Value) -> Result<TrackerIssueComment, ApiError> {
        Ok(TrackerIssueComment {
            comment_id: record_field(record, "sys_id"),
            author: record_field(record, "sys_created_by"),
            created_at: parse_timestamp(&record_field(record, "sys_created_on"))?,
            body: record_field(record, "value"),
            attachments: BTreeMap::new(),
        })
    }

    /// An attachment row surfaces as a synthetic comment pointing at the
    /// downloaded file.
    fn extract_attachment_comment(
        &self,
        record: &Value,
    ) -> Result<TrackerIssueComment, ApiError> {
        let file_name = record_field(record, "file_name");
        let download_link = record_field(record, "download_link");
        let response = self
            .authenticated(self.http.get(&download_link))
            .send()
            .map_err(|error| ApiError::transport(format!("GET {download_link}"), error))?;
        if !response.status().is_success() {
            return Err(ApiError::adapter(format!(
                "unable to download attachment {file_name:?} from incident"
            )));
        }
        let content = response
            .bytes()
            .map_err(|error| ApiError::transport(format!("GET {download_link}"), error))?
            .to_vec();
        Ok(TrackerIssueComment {
            comment_id: record_field(record, "sys_id"),
            author: record_field(record, "sys_created_by"),
            created_at: parse_timestamp(&record_field(record, "sys_created_on"))?,
            body: format!("Attachment:\n![{file_name}]({file_name})"),
            attachments: BTreeMap::from([(
                file_name.clone(),
                TrackerAttachment {
                    filename: file_name,
                    mime_type: record_field(record, "content_type"),
                    content,
                },
            )]),
        })
    }

    /// Comments are added by updating the incident's `comments` field; the
    /// server assigns the journal sys_id, so the entry is read back by
    /// value.
    fn find_created_comment(
        &self,
        incident_sys_id: &str,
        comment: &str,
    ) -> Result<Value, ApiError> {
        let query = format!(
            "element_id={incident_sys_id}^element=comments^value={}",
            Self::escape_query_term(comment)
        );
        self.journal_query(query)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ApiError::protocol(format!(
                    "unable to get comment from incident {incident_sys_id}"
                ))
            })
    }
}

fn record_field(record: &Value, field: &str) -> String {
    match record.get(field) {
        Some(Value::String(text)) => text.clone(),
        // With display values requested, fields may come wrapped.
        Some(Value::Object(object)) => object
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

impl TrackerClient for ServiceNowTrackerClient {
    fn tracker_type(&self) -> &'static str {
        "ServiceNow"
    }

    fn test(&self) -> Result<(), ApiError> {
        let url = self.api("/table/sys_user");
        let body = self.get_json(
            &url,
            &[
                (
                    "sysparm_query",
                    &format!("user_name={}", self.configuration.login),
                ),
                ("sysparm_limit", "1"),
            ],
        )?;
        let found = body
            .get("result")
            .and_then(Value::as_array)
            .map(|users| !users.is_empty())
            .unwrap_or(false);
        if found {
            Ok(())
        } else {
            Err(ApiError::Authentication {
                context: "ServiceNow user not found".to_string(),
            })
        }
    }

    fn get_tracker_issue(&self, issue_id: &str) -> Result<Option<TrackerIssue>, ApiError> {
        let Some(incident) = self.get_incident(issue_id)? else {
            return Ok(None);
        };
        Ok(Some(self.build_tracker_issue(
            issue_id.to_string(),
            Self::incident_is_closed(&incident),
        )))
    }

    fn send_report(&self, report: &Report) -> Result<TrackerIssue, ApiError> {
        let description = Self::replace_inline_attachments(
            &report.attachments,
            &self.formatter.format_report_description(report),
            INCIDENT_ATTACHMENT_PREFIX,
        );
        let created = self.send_json(
            reqwest::Method::POST,
            &self.api("/table/incident"),
            &serde_json::json!({
                "short_description": self.formatter.format_report_title(report),
                "description": description,
            }),
        )?;
        let sys_id = created
            .get("result")
            .map(|result| record_field(result, "sys_id"))
            .unwrap_or_default();
        if sys_id.is_empty() {
            return Err(ApiError::protocol(
                "incident creation acknowledgement carries no sys_id",
            ));
        }
        self.upload_attachments(&report.attachments, INCIDENT_ATTACHMENT_PREFIX, &sys_id)?;
        Ok(self.build_tracker_issue(sys_id, false))
    }

    fn send_logs(
        &self,
        tracker_issue: &TrackerIssue,
        logs: &[&Log],
    ) -> Result<SendLogsResult, ApiError> {
        let incident = self.get_incident(&tracker_issue.issue_id)?.ok_or_else(|| {
            ApiError::adapter(format!(
                "ServiceNow incident {} not found",
                tracker_issue.issue_id
            ))
        })?;
        let mut result = SendLogsResult {
            tracker_issue: tracker_issue.clone(),
            added_comments: Vec::new(),
        };
        if Self::incident_is_closed(&incident) {
            return Ok(result);
        }
        let sys_id = Self::incident_sys_id(&incident);
        for log in logs {
            let comment = Self::replace_inline_attachments(
                &log.attachments,
                &self.formatter.format_log(log),
                COMMENT_ATTACHMENT_PREFIX,
            );
            self.send_json(
                reqwest::Method::PATCH,
                &self.api(&format!("/table/incident/{sys_id}")),
                &serde_json::json!({"comments": comment}),
            )?;
            let record = self.find_created_comment(&sys_id, &comment)?;
            self.upload_attachments(&log.attachments, COMMENT_ATTACHMENT_PREFIX, &sys_id)?;
            result.added_comments.push(TrackerIssueComment {
                comment_id: record_field(&record, "sys_id"),
                author: record_field(&record, "sys_created_by"),
                created_at: parse_timestamp(&record_field(&record, "sys_created_on"))?,
                body: comment,
                attachments: BTreeMap::new(),
            });
        }
        Ok(result)
    }

    fn get_tracker_issue_comments(
        &self,
        issue_id: &str,
        exclude_comments: &[String],
    ) -> Result<Vec<TrackerIssueComment>, ApiError> {
        let Some(incident) = self.get_incident(issue_id)? else {
            return Ok(Vec::new());
        };
        let sys_id = Self::incident_sys_id(&incident);
        let mut dated: Vec<(DateTime<Utc>, TrackerIssueComment)> = Vec::new();
        for record in self.get_journal_comments(&sys_id, exclude_comments)? {
            let comment = self.extract_journal_comment(&record)?;
            dated.push((comment.created_at, comment));
        }
        for record in self.get_incident_attachments(&sys_id, exclude_comments)? {
            let comment = self.extract_attachment_comment(&record)?;
            dated.push((comment.created_at, comment));
        }
        dated.sort_by_key(|(created_at, _)| *created_at);
        Ok(dated.into_iter().map(|(_, comment)| comment).collect())
    }
}
