//! Jira adapter: issues over the v2 REST API, bodies in the Jira wiki
//! dialect.
//!
//! Jira's REST payloads are inconsistent about field-name casing across
//! deployments; [`field_ci`] normalizes the lookup once at this boundary
//! instead of patching response containers.

use crate::error::ApiError;
use crate::formatter::{ReportMessageFormatter, jira_formatter};
use crate::report::{Attachment, Log, Report};
use crate::tracker::{
    SendLogsResult, TrackerAttachment, TrackerClient, TrackerIssue, TrackerIssueComment,
};
use crate::trackers::{http_client, parse_timestamp};
use bountysync_config::JiraConfiguration;
use bountysync_markup::jira_to_markdown;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!([^!|]+)(?:\|[^!]*)?!").expect("valid regex"))
}

/// Case-insensitive field lookup on a JSON object.
fn field_ci<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    object
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(field))
        .map(|(_, field_value)| field_value)
}

/// Adapter for Jira projects.
pub struct JiraTrackerClient {
    configuration: JiraConfiguration,
    http: Client,
    formatter: ReportMessageFormatter,
}

impl JiraTrackerClient {
    /// Build an adapter; no traffic happens until the first operation.
    pub fn new(configuration: &JiraConfiguration) -> Result<Self, ApiError> {
        Ok(Self {
            configuration: configuration.clone(),
            http: http_client(configuration.verify)?,
            formatter: jira_formatter(),
        })
    }

    fn api(&self, path: &str) -> String {
        format!(
            "{}/rest/api/2{path}",
            self.configuration.url.trim_end_matches('/')
        )
    }

    fn authenticated(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.configuration.login, Some(&self.configuration.password))
    }

    fn get_json(&self, url: &str) -> Result<Value, ApiError> {
        let response = self
            .authenticated(self.http.get(url))
            .send()
            .map_err(|error| ApiError::transport(format!("GET {url}"), error))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ApiError::Authentication {
                context: format!("Jira returned {status} for {url}"),
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
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        response.json().or(Ok(Value::Null))
    }

    fn get_issue(&self, issue_id: &str) -> Result<Option<Value>, ApiError> {
        match self.get_json(&self.api(&format!("/issue/{issue_id}"))) {
            Ok(issue) => Ok(Some(issue)),
            Err(ApiError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn permalink(&self, issue_key: &str) -> String {
        format!(
            "{}/browse/{issue_key}",
            self.configuration.url.trim_end_matches('/')
        )
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

    fn issue_is_closed(&self, issue: &Value) -> bool {
        issue
            .get("fields")
            .and_then(|fields| fields.get("status"))
            .and_then(|status| field_ci(status, "name"))
            .and_then(Value::as_str)
            == Some(self.configuration.issue_closed_status.as_str())
    }

    /// Upload attachments and return `(platform url, jira content url)`
    /// substitution pairs.
    fn upload_attachments(
        &self,
        issue_key: &str,
        attachments: &[Attachment],
    ) -> Result<Vec<(String, String)>, ApiError> {
        let url = self.api(&format!("/issue/{issue_key}/attachments"));
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
                .header("X-Atlassian-Token", "no-check")
                .multipart(form)
                .send()
                .map_err(|error| ApiError::transport(format!("POST {url}"), error))?;
            if !response.status().is_success() {
                return Err(ApiError::adapter(format!(
                    "unable to upload attachments for project {} to Jira",
                    self.configuration.project
                )));
            }
            let body: Value = response
                .json()
                .map_err(|_| ApiError::protocol("attachment acknowledgement is not JSON"))?;
            let uploaded = body
                .as_array()
                .and_then(|uploaded| uploaded.first())
                .and_then(|uploaded| field_ci(uploaded, "content"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ApiError::protocol("attachment acknowledgement carries no content URL")
                })?;
            // Jira serves content URLs with raw spaces in file names.
            uploads.push((attachment.url.clone(), uploaded.replace(' ', "%20")));
        }
        Ok(uploads)
    }

    fn extract_comment(
        &self,
        issue: &Value,
        comment: &Value,
    ) -> Result<TrackerIssueComment, ApiError> {
        let body = comment
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let inline_images: Vec<String> = image_re()
            .captures_iter(body)
            .map(|captures| captures[1].to_string())
            .collect();
        let mut attachments = BTreeMap::new();
        let issue_attachments = issue
            .get("fields")
            .and_then(|fields| field_ci(fields, "attachment"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for issue_attachment in &issue_attachments {
            let filename = field_ci(issue_attachment, "filename")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !inline_images.iter().any(|inline| inline == filename) {
                continue;
            }
            let content_url = field_ci(issue_attachment, "content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Some(content) = self.download_attachment(content_url) {
                attachments.insert(
                    filename.to_string(),
                    TrackerAttachment {
                        filename: filename.to_string(),
                        mime_type: field_ci(issue_attachment, "mimeType")
                            .and_then(Value::as_str)
                            .unwrap_or("application/octet-stream")
                            .to_string(),
                        content,
                    },
                );
            }
        }
        Ok(TrackerIssueComment {
            comment_id: comment
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            author: comment
                .get("author")
                .and_then(|author| field_ci(author, "displayName"))
                .and_then(Value::as_str)
                .unwrap_or("Anonymous")
                .to_string(),
            created_at: parse_timestamp(
                comment
                    .get("created")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            )?,
            body: jira_to_markdown(body),
            attachments,
        })
    }

    fn download_attachment(&self, url: &str) -> Option<Vec<u8>> {
        let response = self.authenticated(self.http.get(url)).send().ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.bytes().ok().map(|bytes| bytes.to_vec())
    }
}

impl TrackerClient for JiraTrackerClient {
    fn tracker_type(&self) -> &'static str {
        "Jira"
    }

    fn test(&self) -> Result<(), ApiError> {
        self.get_json(&self.api("/myself")).map(|_| ())
    }

    fn get_tracker_issue(&self, issue_id: &str) -> Result<Option<TrackerIssue>, ApiError> {
        let Some(issue) = self.get_issue(issue_id)? else {
            return Ok(None);
        };
        let key = issue
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or(issue_id);
        Ok(Some(self.build_tracker_issue(
            issue_id.to_string(),
            self.permalink(key),
            self.issue_is_closed(&issue),
        )))
    }

    fn send_report(&self, report: &Report) -> Result<TrackerIssue, ApiError> {
        let mut description = self.formatter.format_report_description(report);
        let created = self.send_json(
            reqwest::Method::POST,
            &self.api("/issue"),
            &serde_json::json!({
                "fields": {
                    "project": {"key": self.configuration.project},
                    "summary": self.formatter.format_report_title(report),
                    "description": description,
                    "issuetype": {"name": self.configuration.issuetype},
                }
            }),
        )?;
        let issue_key = created
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::protocol("issue creation acknowledgement carries no key"))?
            .to_string();
        let uploads = self.upload_attachments(&issue_key, &report.attachments)?;
        if !uploads.is_empty() {
            for (attachment_url, uploaded_url) in &uploads {
                description = description.replace(attachment_url, uploaded_url);
            }
            self.send_json(
                reqwest::Method::PUT,
                &self.api(&format!("/issue/{issue_key}")),
                &serde_json::json!({"fields": {"description": description}}),
            )?;
        }
        Ok(self.build_tracker_issue(issue_key.clone(), self.permalink(&issue_key), false))
    }

    fn send_logs(
        &self,
        tracker_issue: &TrackerIssue,
        logs: &[&Log],
    ) -> Result<SendLogsResult, ApiError> {
        let issue = self.get_issue(&tracker_issue.issue_id)?.ok_or_else(|| {
            ApiError::adapter(format!(
                "unable to get Jira issue {} in project {}",
                tracker_issue.issue_id, self.configuration.project
            ))
        })?;
        let mut result = SendLogsResult {
            tracker_issue: tracker_issue.clone(),
            added_comments: Vec::new(),
        };
        for log in logs {
            let mut body = self.formatter.format_log(log);
            let uploads = self.upload_attachments(&tracker_issue.issue_id, &log.attachments)?;
            for (attachment_url, uploaded_url) in &uploads {
                body = body.replace(attachment_url, uploaded_url);
            }
            let comment = self.send_json(
                reqwest::Method::POST,
                &self.api(&format!("/issue/{}/comment", tracker_issue.issue_id)),
                &serde_json::json!({"body": body}),
            )?;
            result.added_comments.push(self.extract_comment(&issue, &comment)?);
        }
        Ok(result)
    }

    fn get_tracker_issue_comments(
        &self,
        issue_id: &str,
        exclude_comments: &[String],
    ) -> Result<Vec<TrackerIssueComment>, ApiError> {
        let Some(issue) = self.get_issue(issue_id)? else {
            return Ok(Vec::new());
        };
        let comments = issue
            .get("fields")
            .and_then(|fields| field_ci(fields, "comment"))
            .and_then(|comment_field| comment_field.get("comments"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut extracted = Vec::new();
        for comment in &comments {
            let comment_id = comment
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if exclude_comments.contains(&comment_id) {
                continue;
            }
            extracted.push(self.extract_comment(&issue, comment)?);
        }
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> JiraTrackerClient {
        JiraTrackerClient::new(&JiraConfiguration {
            url: "https://jira.example.com".to_string(),
            login: "bot".to_string(),
            password: "secret".to_string(),
            project: "SEC".to_string(),
            verify: true,
            issuetype: "Task".to_string(),
            issue_closed_status: "Closed".to_string(),
        })
        .expect("client")
    }

    #[test]
    fn case_insensitive_field_lookup() {
        let value = serde_json::json!({"mimeType": "image/png", "FileName": "a.png"});
        assert_eq!(
            field_ci(&value, "mimetype").and_then(Value::as_str),
            Some("image/png")
        );
        assert_eq!(
            field_ci(&value, "filename").and_then(Value::as_str),
            Some("a.png")
        );
        assert!(field_ci(&value, "content").is_none());
    }

    #[test]
    fn closed_state_matches_the_configured_status_name() {
        let adapter = client();
        let closed = serde_json::json!({"fields": {"status": {"name": "Closed"}}});
        let open = serde_json::json!({"fields": {"status": {"name": "In Progress"}}});
        assert!(adapter.issue_is_closed(&closed));
        assert!(!adapter.issue_is_closed(&open));
    }

    #[test]
    fn permalink_points_to_the_browse_page() {
        assert_eq!(
            client().permalink("SEC-12"),
            "https://jira.example.com/browse/SEC-12"
        );
    }

    #[test]
    fn inline_image_references_are_detected() {
        let captures: Vec<String> = image_re()
            .captures_iter("see !shot.png|thumbnail! and !plain.png!")
            .map(|captures| captures[1].to_string())
            .collect();
        assert_eq!(captures, vec!["shot.png", "plain.png"]);
    }
}
