//! GitLab adapter: project issues over the v4 REST API, attachments through
//! the project upload endpoint.

use crate::error::ApiError;
use crate::formatter::{ReportMessageFormatter, markdown_formatter};
use crate::report::{Attachment, Log, Report};
use crate::tracker::{
    SendLogsResult, TrackerAttachment, TrackerClient, TrackerIssue, TrackerIssueComment,
};
use crate::trackers::{http_client, parse_timestamp};
use bountysync_config::GitLabConfiguration;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[([^\]]+)]\(([^)]+)\)").expect("valid regex"))
}

fn content_disposition_filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"filename="([^"]+)";?"#).expect("valid regex"))
}

const DEFAULT_AUTHOR: &str = "Anonymous";

/// Adapter for GitLab projects.
pub struct GitLabTrackerClient {
    configuration: GitLabConfiguration,
    http: Client,
    formatter: ReportMessageFormatter,
}

impl GitLabTrackerClient {
    /// Build an adapter; no traffic happens until the first operation.
    pub fn new(configuration: &GitLabConfiguration) -> Result<Self, ApiError> {
        Ok(Self {
            configuration: configuration.clone(),
            http: http_client(configuration.verify)?,
            formatter: markdown_formatter(),
        })
    }

    fn project_api(&self, path: &str) -> String {
        let project =
            utf8_percent_encode(&self.configuration.project, NON_ALPHANUMERIC).to_string();
        format!(
            "{}/api/v4/projects/{project}{path}",
            self.configuration.url.trim_end_matches('/')
        )
    }

    fn authenticated(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("PRIVATE-TOKEN", &self.configuration.token)
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
                context: format!("GitLab returned {status} for {url}"),
            });
        }
        if !status.is_success() {
            return Err(ApiError::protocol(format!("GET {url} returned {status}")));
        }
        response
            .json()
            .map_err(|_| ApiError::protocol(format!("GET {url} did not return JSON")))
    }

    fn post_json(&self, url: &str, body: &Value) -> Result<Value, ApiError> {
        let response = self
            .authenticated(self.http.post(url))
            .json(body)
            .send()
            .map_err(|error| ApiError::transport(format!("POST {url}"), error))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::protocol(format!("POST {url} returned {status}")));
        }
        response
            .json()
            .map_err(|_| ApiError::protocol(format!("POST {url} did not return JSON")))
    }

    /// GitLab issue ids are global; the notes endpoints want the per-project
    /// iid, so issues are located by listing.
    fn get_gitlab_issue(&self, issue_id: &str) -> Result<Option<Value>, ApiError> {
        let issue_id: i64 = issue_id
            .parse()
            .map_err(|_| ApiError::adapter(format!("invalid GitLab issue id {issue_id:?}")))?;
        let url = self.project_api("/issues");
        let issues = self.get_json(&url, &[("per_page", "100")])?;
        let issues = issues.as_array().ok_or_else(|| {
            ApiError::protocol(format!(
                "issue list for project {} is not an array",
                self.configuration.project
            ))
        })?;
        Ok(issues
            .iter()
            .find(|issue| issue.get("id").and_then(Value::as_i64) == Some(issue_id))
            .cloned())
    }

    fn build_tracker_issue(&self, issue_id: String, issue_url: String, closed: bool) -> TrackerIssue {
        TrackerIssue {
            tracker_url: self.configuration.url.clone(),
            project: self.configuration.project.clone(),
            issue_id,
            issue_url,
            closed,
        }
    }

    fn upload_attachments(
        &self,
        attachments: &[Attachment],
    ) -> Result<Vec<(Attachment, String)>, ApiError> {
        let url = self.project_api("/uploads");
        let mut uploads = Vec::new();
        for attachment in attachments {
            let data = attachment.data()?;
            let part = reqwest::blocking::multipart::Part::bytes(data)
                .file_name(attachment.original_name.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|_| {
                    ApiError::adapter(format!(
                        "invalid MIME type {:?} for attachment {:?}",
                        attachment.mime_type, attachment.original_name
                    ))
                })?;
            let form = reqwest::blocking::multipart::Form::new().part("file", part);
            let response = self
                .authenticated(self.http.post(&url))
                .multipart(form)
                .send()
                .map_err(|error| ApiError::transport(format!("POST {url}"), error))?;
            if !response.status().is_success() {
                return Err(ApiError::adapter(format!(
                    "unable to upload attachment {:?} to project {}",
                    attachment.original_name, self.configuration.project
                )));
            }
            let body: Value = response
                .json()
                .map_err(|_| ApiError::protocol("upload acknowledgement is not JSON"))?;
            let uploaded_url = body
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| ApiError::protocol("upload acknowledgement carries no url"))?;
            uploads.push((attachment.clone(), uploaded_url.to_string()));
        }
        Ok(uploads)
    }

    fn apply_uploads(&self, body: &str, uploads: &[(Attachment, String)]) -> String {
        let mut body = body.to_string();
        if uploads.is_empty() {
            return body;
        }
        let mut attachments_lines = vec![String::new(), "Attachments:".to_string()];
        for (attachment, uploaded_url) in uploads {
            body = body.replace(&attachment.url, uploaded_url);
            attachments_lines.push(format!("- [{}]({uploaded_url})", attachment.original_name));
        }
        attachments_lines.push(String::new());
        format!("{body}{}", attachments_lines.join("\n"))
    }

    fn extract_comment(&self, note: &Value) -> Result<TrackerIssueComment, ApiError> {
        let body = note
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut attachments = BTreeMap::new();
        for captures in image_re().captures_iter(&body) {
            let inline_path = captures[2].to_string();
            if let Some(attachment) = self.download_attachment(&inline_path) {
                attachments.insert(inline_path, attachment);
            }
        }
        Ok(TrackerIssueComment {
            comment_id: note
                .get("id")
                .and_then(Value::as_i64)
                .unwrap_or_default()
                .to_string(),
            author: note
                .get("author")
                .and_then(|author| author.get("name"))
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_AUTHOR)
                .to_string(),
            created_at: parse_timestamp(
                note.get("created_at")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            )?,
            body,
            attachments,
        })
    }

    /// Upload URLs are project-relative; unreachable files degrade to a
    /// missing attachment rather than failing the whole comment batch.
    fn download_attachment(&self, path: &str) -> Option<TrackerAttachment> {
        let url = format!(
            "{}/{}/{}",
            self.configuration.url.trim_end_matches('/'),
            self.configuration.project,
            path.trim_start_matches('/')
        );
        let response = self.authenticated(self.http.get(&url)).send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("text/plain")
            .to_string();
        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                content_disposition_filename_re()
                    .captures(value)
                    .map(|captures| captures[1].to_string())
            })
            .unwrap_or_else(|| {
                path.rsplit('/')
                    .next()
                    .unwrap_or(path)
                    .to_string()
            });
        let content = response.bytes().ok()?.to_vec();
        Some(TrackerAttachment {
            filename,
            mime_type,
            content,
        })
    }
}

impl TrackerClient for GitLabTrackerClient {
    fn tracker_type(&self) -> &'static str {
        "GitLab"
    }

    fn test(&self) -> Result<(), ApiError> {
        let url = format!(
            "{}/api/v4/user",
            self.configuration.url.trim_end_matches('/')
        );
        self.get_json(&url, &[]).map(|_| ())
    }

    fn get_tracker_issue(&self, issue_id: &str) -> Result<Option<TrackerIssue>, ApiError> {
        let Some(issue) = self.get_gitlab_issue(issue_id)? else {
            return Ok(None);
        };
        Ok(Some(self.build_tracker_issue(
            issue_id.to_string(),
            issue
                .get("web_url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            issue.get("state").and_then(Value::as_str) == Some("closed"),
        )))
    }

    fn send_report(&self, report: &Report) -> Result<TrackerIssue, ApiError> {
        let description = self.formatter.format_report_description(report);
        let uploads = self.upload_attachments(&report.attachments)?;
        let description = self.apply_uploads(&description, &uploads);
        let issue = self.post_json(
            &self.project_api("/issues"),
            &serde_json::json!({
                "title": self.formatter.format_report_title(report),
                "description": description,
                "confidential": self.configuration.confidential,
            }),
        )?;
        Ok(self.build_tracker_issue(
            issue
                .get("id")
                .and_then(Value::as_i64)
                .unwrap_or_default()
                .to_string(),
            issue
                .get("web_url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            false,
        ))
    }

    fn send_logs(
        &self,
        tracker_issue: &TrackerIssue,
        logs: &[&Log],
    ) -> Result<SendLogsResult, ApiError> {
        let issue = self.get_gitlab_issue(&tracker_issue.issue_id)?.ok_or_else(|| {
            ApiError::adapter(format!(
                "GitLab issue {} not found in project {}",
                tracker_issue.issue_id, self.configuration.project
            ))
        })?;
        let issue_iid = issue.get("iid").and_then(Value::as_i64).unwrap_or_default();
        let notes_url = self.project_api(&format!("/issues/{issue_iid}/notes"));
        let mut result = SendLogsResult {
            tracker_issue: tracker_issue.clone(),
            added_comments: Vec::new(),
        };
        for log in logs {
            let body = self.formatter.format_log(log);
            let uploads = self.upload_attachments(&log.attachments)?;
            let body = self.apply_uploads(&body, &uploads);
            let note = self.post_json(&notes_url, &serde_json::json!({"body": body}))?;
            result.added_comments.push(self.extract_comment(&note)?);
        }
        Ok(result)
    }

    fn get_tracker_issue_comments(
        &self,
        issue_id: &str,
        exclude_comments: &[String],
    ) -> Result<Vec<TrackerIssueComment>, ApiError> {
        let Some(issue) = self.get_gitlab_issue(issue_id)? else {
            return Ok(Vec::new());
        };
        let issue_iid = issue.get("iid").and_then(Value::as_i64).unwrap_or_default();
        let notes_url = self.project_api(&format!("/issues/{issue_iid}/notes"));
        let notes = self.get_json(&notes_url, &[("sort", "asc")])?;
        let notes = notes
            .as_array()
            .ok_or_else(|| ApiError::protocol("note list is not an array"))?;
        let mut comments = Vec::new();
        for note in notes {
            let note_id = note
                .get("id")
                .and_then(Value::as_i64)
                .unwrap_or_default()
                .to_string();
            if exclude_comments.contains(&note_id) {
                continue;
            }
            comments.push(self.extract_comment(note)?);
        }
        Ok(comments)
    }
}
