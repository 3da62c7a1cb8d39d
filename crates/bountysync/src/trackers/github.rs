//! GitHub adapter: repository issues over the REST API.
//!
//! GitHub has no supported attachment upload endpoint. Inline attachment
//! references are rewritten to an explanatory placeholder; the
//! `github_cdn_on` web-session flow of earlier generations is intentionally
//! not reproduced.

use crate::error::ApiError;
use crate::formatter::{ReportMessageFormatter, markdown_formatter};
use crate::report::{Attachment, Log, Report};
use crate::tracker::{
    SendLogsResult, TrackerAttachment, TrackerClient, TrackerIssue, TrackerIssueComment,
};
use crate::trackers::{http_client, parse_timestamp};
use bountysync_config::GitHubConfiguration;
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

/// Adapter for GitHub repositories.
pub struct GitHubTrackerClient {
    configuration: GitHubConfiguration,
    http: Client,
    formatter: ReportMessageFormatter,
}

impl GitHubTrackerClient {
    /// Build an adapter; no traffic happens until the first operation.
    pub fn new(configuration: &GitHubConfiguration) -> Result<Self, ApiError> {
        Ok(Self {
            configuration: configuration.clone(),
            http: http_client(configuration.verify)?,
            formatter: markdown_formatter(),
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}{path}", self.configuration.url.trim_end_matches('/'))
    }

    fn repo_api(&self, path: &str) -> String {
        self.api(&format!("/repos/{}{path}", self.configuration.project))
    }

    fn authenticated(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Authorization", format!("token {}", self.configuration.token))
            .header("Accept", "application/vnd.github+json")
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
                context: format!("GitHub returned {status} for {url}"),
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

    /// Issues are identified by their global id in tracking-status logs;
    /// the comment endpoints want the per-repository number.
    fn get_github_issue(&self, issue_id: &str) -> Result<Option<Value>, ApiError> {
        let issue_id: i64 = issue_id
            .parse()
            .map_err(|_| ApiError::adapter(format!("invalid GitHub issue id {issue_id:?}")))?;
        let issues = self.get_json(
            &self.repo_api("/issues"),
            &[("state", "all"), ("per_page", "100")],
        )?;
        let issues = issues.as_array().ok_or_else(|| {
            ApiError::protocol(format!(
                "issue list for {} is not an array",
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

    fn extract_attachment_name(&self, body: &str, attachment: &Attachment) -> String {
        let pattern = format!(
            r"(?:!?\[)([^\[\]]*)(?:\])\({}\)",
            regex::escape(&attachment.url)
        );
        Regex::new(&pattern)
            .ok()
            .and_then(|re| re.captures(body).map(|captures| captures[1].to_string()))
            .unwrap_or_else(|| attachment.original_name.clone())
    }

    /// Replace every reference to the attachments with the placeholder
    /// explaining why the file is not available on GitHub.
    fn substitute_attachments(&self, body: &str, attachments: &[Attachment]) -> String {
        let mut body = body.to_string();
        for attachment in attachments {
            let attachment_name = self.extract_attachment_name(&body, attachment);
            let substitution = format!(
                "(Attachment \"{attachment_name}\" not available due to export script’s configuration)"
            );
            let pattern = format!(r"!?\[[^\[\]]*\]\({}\)", regex::escape(&attachment.url));
            if let Ok(re) = Regex::new(&pattern) {
                body = re.replace_all(&body, substitution.as_str()).into_owned();
            }
        }
        body
    }

    fn extract_comment(&self, comment: &Value) -> Result<TrackerIssueComment, ApiError> {
        let body = comment
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut attachments = BTreeMap::new();
        for captures in image_re().captures_iter(&body) {
            let inline_url = captures[2].to_string();
            if let Some(attachment) = self.download_attachment(&inline_url) {
                attachments.insert(inline_url, attachment);
            }
        }
        Ok(TrackerIssueComment {
            comment_id: comment
                .get("id")
                .and_then(Value::as_i64)
                .unwrap_or_default()
                .to_string(),
            author: comment
                .get("user")
                .and_then(|user| user.get("login"))
                .and_then(Value::as_str)
                .unwrap_or("Anonymous")
                .to_string(),
            created_at: parse_timestamp(
                comment
                    .get("created_at")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            )?,
            body,
            attachments,
        })
    }

    fn download_attachment(&self, url: &str) -> Option<TrackerAttachment> {
        let response = self.authenticated(self.http.get(url)).send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let filename = url.rsplit('/').next().unwrap_or(url).to_string();
        let content = response.bytes().ok()?.to_vec();
        Some(TrackerAttachment {
            filename,
            mime_type,
            content,
        })
    }
}

impl TrackerClient for GitHubTrackerClient {
    fn tracker_type(&self) -> &'static str {
        "GitHub"
    }

    fn test(&self) -> Result<(), ApiError> {
        let user = self.get_json(&self.api("/user"), &[])?;
        match user.get("login").and_then(Value::as_str) {
            Some(login) if !login.is_empty() => Ok(()),
            _ => Err(ApiError::Authentication {
                context: "unable to log in with the GitHub API client".to_string(),
            }),
        }
    }

    fn get_tracker_issue(&self, issue_id: &str) -> Result<Option<TrackerIssue>, ApiError> {
        let Some(issue) = self.get_github_issue(issue_id)? else {
            return Ok(None);
        };
        Ok(Some(self.build_tracker_issue(
            issue_id.to_string(),
            issue
                .get("html_url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            !issue
                .get("closed_at")
                .map(Value::is_null)
                .unwrap_or(true),
        )))
    }

    fn send_report(&self, report: &Report) -> Result<TrackerIssue, ApiError> {
        let body = self.formatter.format_report_description(report);
        let issue = self.send_json(
            reqwest::Method::POST,
            &self.repo_api("/issues"),
            &serde_json::json!({
                "title": self.formatter.format_report_title(report),
                "body": body,
            }),
        )?;
        let issue_number = issue
            .get("number")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let substituted = self.substitute_attachments(&body, &report.attachments);
        if substituted != body {
            self.send_json(
                reqwest::Method::PATCH,
                &self.repo_api(&format!("/issues/{issue_number}")),
                &serde_json::json!({"body": substituted}),
            )?;
        }
        Ok(self.build_tracker_issue(
            issue
                .get("id")
                .and_then(Value::as_i64)
                .unwrap_or_default()
                .to_string(),
            issue
                .get("html_url")
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
        let issue = self.get_github_issue(&tracker_issue.issue_id)?.ok_or_else(|| {
            ApiError::adapter(format!("GitHub issue {} not found", tracker_issue.issue_id))
        })?;
        let issue_number = issue
            .get("number")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let comments_url = self.repo_api(&format!("/issues/{issue_number}/comments"));
        let mut result = SendLogsResult {
            tracker_issue: tracker_issue.clone(),
            added_comments: Vec::new(),
        };
        for log in logs {
            let body = self.formatter.format_log(log);
            let comment = self.send_json(
                reqwest::Method::POST,
                &comments_url,
                &serde_json::json!({"body": body}),
            )?;
            let substituted = self.substitute_attachments(&body, &log.attachments);
            if substituted != body {
                let comment_id = comment
                    .get("id")
                    .and_then(Value::as_i64)
                    .unwrap_or_default();
                self.send_json(
                    reqwest::Method::PATCH,
                    &self.repo_api(&format!("/issues/comments/{comment_id}")),
                    &serde_json::json!({"body": substituted}),
                )?;
            }
            result.added_comments.push(self.extract_comment(&comment)?);
        }
        Ok(result)
    }

    fn get_tracker_issue_comments(
        &self,
        issue_id: &str,
        exclude_comments: &[String],
    ) -> Result<Vec<TrackerIssueComment>, ApiError> {
        let Some(issue) = self.get_github_issue(issue_id)? else {
            return Ok(Vec::new());
        };
        let issue_number = issue
            .get("number")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let comments = self.get_json(
            &self.repo_api(&format!("/issues/{issue_number}/comments")),
            &[("per_page", "100")],
        )?;
        let comments = comments
            .as_array()
            .ok_or_else(|| ApiError::protocol("comment list is not an array"))?;
        let mut extracted = Vec::new();
        for comment in comments {
            let comment_id = comment
                .get("id")
                .and_then(Value::as_i64)
                .unwrap_or_default()
                .to_string();
            if exclude_comments.contains(&comment_id) {
                continue;
            }
            extracted.push(self.extract_comment(comment)?);
        }
        Ok(extracted)
    }
}
