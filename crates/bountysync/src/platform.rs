//! Blocking client for the platform API.
//!
//! One client exists per platform configuration for the duration of a run.
//! Authentication happens lazily on the first call and is never repeated
//! unless the run restarts.

use crate::error::ApiError;
use crate::formatter::markdown_to_platform;
use crate::mapping::{MappingContext, map_raw_report};
use crate::report::{AttachmentLoader, Report};
use crate::tracker::TrackerAttachment;
use bountysync_config::YesWeHackConfiguration;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use url::Url;

/// Platform operations consumed by the synchronizer, the orchestrator and
/// the tester. [`PlatformClient`] is the HTTP implementation; tests use
/// in-memory fakes.
pub trait PlatformApi {
    /// Check that the credentials allow logging in.
    fn test(&self) -> Result<(), ApiError>;

    /// Fetch the detailed reports of a program matching the filters.
    fn get_program_reports(
        &self,
        slug: &str,
        filters: &[(String, String)],
    ) -> Result<Vec<Report>, ApiError>;

    /// Record that a report is tracked in a tracker issue.
    fn put_report_tracking_status(
        &self,
        report: &Report,
        status: &str,
        tracker_name: &str,
        issue_id: &str,
        issue_url: &str,
        comment: &str,
    ) -> Result<(), ApiError>;

    /// Append a tracker-update log carrying a fresh state token.
    fn post_report_tracker_update(
        &self,
        report: &Report,
        tracker_name: &str,
        issue_id: &str,
        issue_url: &str,
        token: &str,
        comment: &str,
    ) -> Result<(), ApiError>;

    /// Post a report comment mirroring tracker-side activity. Attachments
    /// are uploaded first and inline references rewritten to platform
    /// placeholders. Returns the created log id.
    fn post_report_comment(
        &self,
        report: &Report,
        comment: &str,
        attachments: &[TrackerAttachment],
    ) -> Result<String, ApiError>;

    /// Update the report workflow status.
    fn update_report_status(
        &self,
        report: &Report,
        status: &str,
        comment: &str,
    ) -> Result<(), ApiError>;
}

enum Credentials {
    Password { login: String, password: String },
    Pat(String),
}

struct ClientInner {
    api_url: String,
    host: String,
    domain: String,
    apps_headers: BTreeMap<String, String>,
    credentials: Credentials,
    http: Client,
    token: Mutex<Option<String>>,
}

/// The HTTP implementation of [`PlatformApi`].
#[derive(Clone)]
pub struct PlatformClient {
    inner: Arc<ClientInner>,
}

impl PlatformClient {
    /// Build a client from a platform configuration. No network traffic
    /// happens until the first operation.
    pub fn new(configuration: &YesWeHackConfiguration) -> Result<Self, ApiError> {
        let api_url = configuration.api_url.trim_end_matches('/').to_string();
        let (host, domain) = split_host(&api_url)?;
        let http = Client::builder()
            .user_agent(format!("bountysync/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!configuration.verify)
            .build()
            .map_err(|error| ApiError::adapter(format!("unable to build HTTP client: {error}")))?;
        let credentials = match &configuration.pat {
            Some(pat) => Credentials::Pat(pat.clone()),
            None => Credentials::Password {
                login: configuration.login.clone().unwrap_or_default(),
                password: configuration.password.clone().unwrap_or_default(),
            },
        };
        Ok(Self {
            inner: Arc::new(ClientInner {
                api_url,
                host,
                domain,
                apps_headers: configuration.apps_headers.clone(),
                credentials,
                http,
                token: Mutex::new(None),
            }),
        })
    }

    fn ensure_login(&self) -> Result<(), ApiError> {
        let mut token = self
            .inner
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if token.is_some() {
            return Ok(());
        }
        match &self.inner.credentials {
            Credentials::Pat(pat) => {
                *token = Some(pat.clone());
                Ok(())
            }
            Credentials::Password { login, password } => {
                let response = self
                    .inner
                    .http
                    .post(format!("{}/login", self.inner.api_url))
                    .json(&serde_json::json!({"email": login, "password": password}))
                    .send()
                    .map_err(|error| ApiError::transport("platform login request", error))?;
                if response.status() == StatusCode::UNAUTHORIZED {
                    return Err(ApiError::Authentication {
                        context: "platform rejected the credentials".to_string(),
                    });
                }
                let body: Value = response
                    .json()
                    .map_err(|_| ApiError::protocol("platform login response is not JSON"))?;
                if body.get("totp_token").is_some() {
                    return Err(ApiError::Authentication {
                        context: "platform requires a TOTP code for this account".to_string(),
                    });
                }
                match body.get("token").and_then(Value::as_str) {
                    Some(session_token) => {
                        *token = Some(session_token.to_string());
                        Ok(())
                    }
                    None => Err(ApiError::protocol(
                        "platform login response carries no token",
                    )),
                }
            }
        }
    }

    fn authenticated(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .inner
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_default();
        let mut request = request.bearer_auth(token);
        for (name, value) in &self.inner.apps_headers {
            request = request.header(name, value);
        }
        request
    }

    fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, ApiError> {
        let response = self
            .authenticated(self.inner.http.get(url))
            .query(query)
            .send()
            .map_err(|error| ApiError::transport(format!("GET {url}"), error))?;
        expect_json_response(url, response)
    }

    /// Lazy loader fetching an attachment through the authenticated session.
    fn attachment_loader(&self, url: &str) -> AttachmentLoader {
        let client = self.clone();
        let url = url.to_string();
        Arc::new(move || {
            client.ensure_login()?;
            let response = client
                .authenticated(client.inner.http.get(&url))
                .send()
                .map_err(|error| ApiError::transport(format!("GET {url}"), error))?;
            if !response.status().is_success() {
                return Err(ApiError::protocol(format!(
                    "attachment download failed with status {}",
                    response.status()
                )));
            }
            response
                .bytes()
                .map(|bytes| bytes.to_vec())
                .map_err(|error| ApiError::transport(format!("GET {url}"), error))
        })
    }

    fn get_detailed_report(&self, report_id: i64) -> Result<Report, ApiError> {
        let url = format!("{}/reports/{report_id}", self.inner.api_url);
        let raw_report = self.get_json(&url, &[])?;
        let loader_factory = |url: &str| self.attachment_loader(url);
        let context = MappingContext {
            yeswehack_domain: self.inner.domain.clone(),
            platform_host: self.inner.host.clone(),
            attachment_loader: &loader_factory,
        };
        Ok(map_raw_report(&context, &raw_report))
    }
}

fn split_host(api_url: &str) -> Result<(String, String), ApiError> {
    let url = Url::parse(api_url)
        .map_err(|_| ApiError::protocol(format!("invalid platform API URL {api_url:?}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| ApiError::protocol(format!("platform API URL {api_url:?} has no host")))?;
    // Keep `xxx.yyy.zzz` from `www.xxx.yyy.zzz`; redirect wrappers live on
    // the parent domain, not on the API host.
    let domain = host
        .split_once('.')
        .map(|(_, parent)| parent.to_string())
        .unwrap_or_else(|| host.to_string());
    Ok((host.to_string(), domain))
}

fn expect_json_response(
    context: &str,
    response: reqwest::blocking::Response,
) -> Result<Value, ApiError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Authentication {
            context: format!("{context} returned {status}"),
        });
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ApiError::NotFound {
            context: context.to_string(),
        });
    }
    if !status.is_success() {
        return Err(ApiError::protocol(format!("{context} returned {status}")));
    }
    response
        .json()
        .map_err(|_| ApiError::protocol(format!("{context} did not return JSON")))
}

/// Check a write acknowledgement: it must be a JSON object, and a populated
/// `errors` key means the server rejected the write.
fn expect_acknowledgement(context: &str, body: Value) -> Result<(), ApiError> {
    let Some(object) = body.as_object() else {
        return Err(ApiError::protocol(format!(
            "{context}: expecting a JSON object acknowledgement"
        )));
    };
    if object.contains_key("errors") {
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("[no error message]");
        return Err(ApiError::protocol(format!("{context}: {message}")));
    }
    Ok(())
}

impl PlatformApi for PlatformClient {
    fn test(&self) -> Result<(), ApiError> {
        self.ensure_login()
    }

    fn get_program_reports(
        &self,
        slug: &str,
        filters: &[(String, String)],
    ) -> Result<Vec<Report>, ApiError> {
        self.ensure_login()?;
        let url = format!("{}/programs/{slug}/reports", self.inner.api_url);
        let mut reports = Vec::new();
        let mut page = 1_u64;
        loop {
            let mut query = filters.to_vec();
            query.push(("page".to_string(), page.to_string()));
            let body = self.get_json(&url, &query)?;
            let items = body
                .get("items")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    ApiError::protocol(format!("report list for {slug} carries no items"))
                })?;
            for item in items {
                let report_id = item.get("id").and_then(Value::as_i64).ok_or_else(|| {
                    ApiError::protocol(format!("report list item for {slug} carries no id"))
                })?;
                reports.push(self.get_detailed_report(report_id)?);
            }
            let nb_pages = body
                .get("pagination")
                .and_then(|pagination| pagination.get("nb_pages"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            if page >= nb_pages {
                break;
            }
            page += 1;
        }
        Ok(reports)
    }

    fn put_report_tracking_status(
        &self,
        report: &Report,
        status: &str,
        tracker_name: &str,
        issue_id: &str,
        issue_url: &str,
        comment: &str,
    ) -> Result<(), ApiError> {
        self.ensure_login()?;
        let url = format!(
            "{}/reports/{}/tracking-status",
            self.inner.api_url, report.report_id
        );
        let response = self
            .authenticated(self.inner.http.put(&url))
            .json(&serde_json::json!({
                "tracking_status": status,
                "tracker_name": tracker_name,
                "tracker_id": issue_id,
                "tracker_url": issue_url,
                "message": comment,
            }))
            .send()
            .map_err(|error| ApiError::transport(format!("PUT {url}"), error))?;
        let body: Value = response
            .json()
            .map_err(|_| ApiError::protocol(format!("PUT {url} did not return JSON")))?;
        expect_acknowledgement("tracking status update", body)
    }

    fn post_report_tracker_update(
        &self,
        report: &Report,
        tracker_name: &str,
        issue_id: &str,
        issue_url: &str,
        token: &str,
        comment: &str,
    ) -> Result<(), ApiError> {
        self.ensure_login()?;
        let url = format!(
            "{}/reports/{}/tracker-update",
            self.inner.api_url, report.report_id
        );
        let response = self
            .authenticated(self.inner.http.post(&url))
            .json(&serde_json::json!({
                "tracker_name": tracker_name,
                "tracker_id": issue_id,
                "tracker_url": issue_url,
                "token": token,
                "message": comment,
            }))
            .send()
            .map_err(|error| ApiError::transport(format!("POST {url}"), error))?;
        if !response.status().is_success() {
            return Err(ApiError::protocol(format!(
                "tracker update returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn post_report_comment(
        &self,
        report: &Report,
        comment: &str,
        attachments: &[TrackerAttachment],
    ) -> Result<String, ApiError> {
        self.ensure_login()?;
        let mut attachment_ids = BTreeMap::new();
        for attachment in attachments {
            let url = format!(
                "{}/reports/{}/attachments",
                self.inner.api_url, report.report_id
            );
            let part = reqwest::blocking::multipart::Part::bytes(attachment.content.clone())
                .file_name(attachment.filename.clone())
                .mime_str(&attachment.mime_type)
                .map_err(|_| {
                    ApiError::protocol(format!(
                        "invalid MIME type {:?} for attachment {:?}",
                        attachment.mime_type, attachment.filename
                    ))
                })?;
            let form = reqwest::blocking::multipart::Form::new().part("file", part);
            let response = self
                .authenticated(self.inner.http.post(&url))
                .multipart(form)
                .send()
                .map_err(|error| ApiError::transport(format!("POST {url}"), error))?;
            let body = expect_json_response("attachment upload", response)?;
            let attachment_id = body.get("id").and_then(Value::as_i64).ok_or_else(|| {
                ApiError::protocol("attachment upload acknowledgement carries no id")
            })?;
            attachment_ids.insert(attachment.filename.clone(), attachment_id);
        }
        let body = markdown_to_platform(comment, &attachment_ids);
        let url = format!(
            "{}/reports/{}/comments",
            self.inner.api_url, report.report_id
        );
        let response = self
            .authenticated(self.inner.http.post(&url))
            .json(&serde_json::json!({"message": body, "private": false}))
            .send()
            .map_err(|error| ApiError::transport(format!("POST {url}"), error))?;
        let body = expect_json_response("report comment", response)?;
        match body.get("id") {
            Some(Value::Number(number)) => Ok(number.to_string()),
            Some(Value::String(id)) => Ok(id.clone()),
            _ => Err(ApiError::protocol(
                "report comment acknowledgement carries no id",
            )),
        }
    }

    fn update_report_status(
        &self,
        report: &Report,
        status: &str,
        comment: &str,
    ) -> Result<(), ApiError> {
        self.ensure_login()?;
        let url = format!("{}/reports/{}/status", self.inner.api_url, report.report_id);
        let response = self
            .authenticated(self.inner.http.put(&url))
            .json(&serde_json::json!({
                "status": {"workflow_state": status},
                "message": comment,
            }))
            .send()
            .map_err(|error| ApiError::transport(format!("PUT {url}"), error))?;
        let body: Value = response
            .json()
            .map_err(|_| ApiError::protocol(format!("PUT {url} did not return JSON")))?;
        expect_acknowledgement("report status update", body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_drops_the_first_host_label() {
        let (host, domain) = split_host("https://apps.yeswehack.com").expect("host");
        assert_eq!(host, "apps.yeswehack.com");
        assert_eq!(domain, "yeswehack.com");
        let (host, domain) = split_host("https://localhost:9999").expect("host");
        assert_eq!(host, "localhost");
        assert_eq!(domain, "localhost");
    }

    #[test]
    fn acknowledgement_with_errors_is_rejected() {
        let body = serde_json::json!({"errors": ["boom"], "message": "tracker rejected"});
        let error = expect_acknowledgement("tracking status update", body).expect_err("must fail");
        assert!(error.to_string().contains("tracker rejected"));
    }

    #[test]
    fn acknowledgement_must_be_an_object() {
        let error =
            expect_acknowledgement("tracking status update", serde_json::json!([1, 2]))
                .expect_err("must fail");
        assert!(matches!(error, ApiError::Protocol { .. }));
    }

    #[test]
    fn acknowledgement_without_errors_passes() {
        expect_acknowledgement("tracking status update", serde_json::json!({"status": "ok"}))
            .expect("acknowledged");
    }
}
