//! Configuration model for bountysync.
//!
//! A configuration document (YAML or JSON) has two top-level maps:
//!
//! ```yaml
//! trackers:
//!   gl:
//!     type: gitlab
//!     token: secret
//!     project: group/project
//! yeswehack:
//!   production:
//!     apps_headers:
//!       X-YesWeHack-Apps: app-id
//!     login: bot@example.com
//!     password: secret
//!     programs:
//!       - slug: my-program
//!         bugtrackers_name: [gl]
//! ```
//!
//! Loading deserializes into the typed tree; [`RootConfiguration::validate`]
//! then checks everything that can be checked before the first network call
//! and aggregates failures with dotted attribute paths. A JSON Schema of the
//! whole tree is derivable through [`config_schema`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

mod schema;
mod validate;

pub use schema::{config_schema, schema_as_json, schema_as_markdown, schema_as_text};
pub use validate::ValidationError;

/// Supported configuration document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML (`.yaml`, `.yml`).
    Yaml,
    /// JSON (`.json`).
    Json,
}

impl ConfigFormat {
    /// Parse a format name as used on the command line.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::UnsupportedFormat {
                format: name.to_string(),
            }),
        }
    }
}

/// A configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested format has no serializer.
    #[error("unsupported configuration format {format}")]
    UnsupportedFormat {
        /// The requested format name.
        format: String,
    },
    /// The configuration file could not be read.
    #[error("unable to read configuration file {path}")]
    Read {
        /// Path of the unreadable file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid YAML.
    #[error("unable to parse YAML configuration")]
    ParseYaml(#[source] serde_yaml::Error),
    /// The document is not valid JSON.
    #[error("unable to parse JSON configuration")]
    ParseJson(#[source] serde_json::Error),
    /// The document could not be serialized back out.
    #[error("unable to serialize configuration")]
    Serialize(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The typed tree failed validation.
    #[error("invalid configuration:\n{}", format_validation_errors(.errors))]
    Invalid {
        /// One entry per failed attribute, dotted-path keyed.
        errors: Vec<ValidationError>,
    },
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|error| format!("  - {}: {}", error.path, error.message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Root of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RootConfiguration {
    /// Issue trackers addressable from programs, keyed by name.
    #[serde(default)]
    pub trackers: BTreeMap<String, TrackerConfiguration>,
    /// Platform accounts, keyed by name.
    #[serde(default)]
    pub yeswehack: BTreeMap<String, YesWeHackConfiguration>,
}

impl RootConfiguration {
    /// Load a configuration document from a reader.
    pub fn load(reader: impl Read, format: ConfigFormat) -> Result<Self, ConfigError> {
        let configuration = match format {
            ConfigFormat::Yaml => {
                serde_yaml::from_reader(reader).map_err(ConfigError::ParseYaml)?
            }
            ConfigFormat::Json => {
                serde_json::from_reader(reader).map_err(ConfigError::ParseJson)?
            }
        };
        Ok(configuration)
    }

    /// Load and validate a configuration file.
    pub fn load_file(path: &Path, format: ConfigFormat) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let configuration = Self::load(file, format)?;
        configuration.validate()?;
        Ok(configuration)
    }

    /// Serialize the configuration in the given format.
    pub fn dump(&self, format: ConfigFormat) -> Result<String, ConfigError> {
        match format {
            ConfigFormat::Yaml => serde_yaml::to_string(self)
                .map_err(|error| ConfigError::Serialize(Box::new(error))),
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|error| ConfigError::Serialize(Box::new(error))),
        }
    }

    /// Validate the whole tree, aggregating every failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let errors = validate::validate_root(self);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { errors })
        }
    }
}

/// Configuration of one tracker, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TrackerConfiguration {
    /// A GitHub repository.
    Github(GitHubConfiguration),
    /// A GitLab project.
    Gitlab(GitLabConfiguration),
    /// A Jira project.
    Jira(JiraConfiguration),
    /// A ServiceNow instance.
    Servicenow(ServiceNowConfiguration),
}

impl TrackerConfiguration {
    /// The `type` tag of this tracker configuration.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Github(_) => "github",
            Self::Gitlab(_) => "gitlab",
            Self::Jira(_) => "jira",
            Self::Servicenow(_) => "servicenow",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_github_url() -> String {
    "https://api.github.com".to_string()
}

fn default_gitlab_url() -> String {
    "https://gitlab.com".to_string()
}

fn default_jira_issuetype() -> String {
    "Task".to_string()
}

fn default_jira_closed_status() -> String {
    "Closed".to_string()
}

fn default_api_url() -> String {
    "https://apps.yeswehack.com".to_string()
}

/// Configuration of a GitHub tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GitHubConfiguration {
    /// Base URL of the GitHub API.
    #[serde(default = "default_github_url")]
    pub url: String,
    /// Personal access token for the GitHub API.
    pub token: String,
    /// Path to the repository (`owner/name`).
    pub project: String,
    /// Verify the server's TLS certificate.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Attempt to re-host attachments on the GitHub CDN. The upload channel
    /// requires a web session, hence the extra login/password pair.
    #[serde(default)]
    pub github_cdn_on: bool,
    /// Web-session login, required when `github_cdn_on` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// Web-session password, required when `github_cdn_on` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Configuration of a GitLab tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GitLabConfiguration {
    /// Base URL of the GitLab server.
    #[serde(default = "default_gitlab_url")]
    pub url: String,
    /// Private token for the GitLab API.
    pub token: String,
    /// Path or numeric id of the project.
    pub project: String,
    /// Verify the server's TLS certificate.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Mark created issues as confidential.
    #[serde(default)]
    pub confidential: bool,
}

/// Configuration of a Jira tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JiraConfiguration {
    /// Base URL of the Jira server.
    pub url: String,
    /// User login for the Jira API.
    pub login: String,
    /// User password or API token for the Jira API.
    pub password: String,
    /// Jira project key.
    pub project: String,
    /// Verify the server's TLS certificate.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Issue type used when creating issues (sensitive to account language).
    #[serde(default = "default_jira_issuetype")]
    pub issuetype: String,
    /// Status name identifying a closed issue (sensitive to account language).
    #[serde(default = "default_jira_closed_status")]
    pub issue_closed_status: String,
}

/// Configuration of a ServiceNow tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceNowConfiguration {
    /// Host of the ServiceNow instance (no scheme).
    pub host: String,
    /// User login for the instance.
    pub login: String,
    /// User password for the instance.
    pub password: String,
    /// Connect over TLS.
    #[serde(default = "default_true")]
    pub use_ssl: bool,
    /// Verify the server's TLS certificate.
    #[serde(default = "default_true")]
    pub verify: bool,
}

/// Configuration of one platform account and its programs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct YesWeHackConfiguration {
    /// Base URL of the platform API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// HTTP headers added to every API call; must contain a non-blank
    /// `X-YesWeHack-Apps` header.
    #[serde(default)]
    pub apps_headers: BTreeMap<String, String>,
    /// User login; required unless `pat` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// User password; required unless `pat` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Personal access token, replacing login/password authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pat: Option<String>,
    /// OAuth settings for API authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_args: Option<OAuthSettings>,
    /// Verify the server's TLS certificate.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Whether the account has TOTP enabled. The apps API itself never asks
    /// for a code; the flag documents why a login can still be rejected on
    /// secured programs.
    #[serde(default)]
    pub totp: bool,
    /// Programs to synchronize.
    #[serde(default)]
    pub programs: Vec<Program>,
}

/// OAuth client settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OAuthSettings {
    /// OAuth v2 client id.
    pub client_id: String,
    /// OAuth v2 client secret.
    pub client_secret: String,
    /// Redirect URI registered for the client.
    pub redirect_uri: String,
}

/// A program and the trackers its reports synchronize into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Program {
    /// Program slug on the platform.
    pub slug: String,
    /// Which outbound log kinds are pushed to the trackers.
    #[serde(default)]
    pub synchronize_options: SynchronizeOptions,
    /// Whether tracker-side activity is mirrored back to the platform.
    #[serde(default)]
    pub feedback_options: FeedbackOptions,
    /// Names of the target trackers; each must exist in the `trackers` map.
    #[serde(default)]
    pub bugtrackers_name: Vec<String>,
}

/// Per-program flags selecting the outbound log kinds to push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SynchronizeOptions {
    /// Push private comments to the trackers.
    #[serde(default)]
    pub upload_private_comments: bool,
    /// Push public comments to the trackers.
    #[serde(default)]
    pub upload_public_comments: bool,
    /// Push details updates (including CVSS and priority changes) to the
    /// trackers.
    #[serde(default)]
    pub upload_details_updates: bool,
    /// Push rewards to the trackers.
    #[serde(default)]
    pub upload_rewards: bool,
    /// Push status updates to the trackers.
    #[serde(default)]
    pub upload_status_updates: bool,
}

impl SynchronizeOptions {
    /// True if any flag requires revisiting already-tracked reports.
    pub fn any_continuous(&self) -> bool {
        self.upload_private_comments
            || self.upload_public_comments
            || self.upload_details_updates
            || self.upload_rewards
            || self.upload_status_updates
    }
}

/// Per-program flags selecting which tracker-side activity flows back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FeedbackOptions {
    /// Mirror tracker-side comments back to the platform as report comments.
    #[serde(default)]
    pub download_tracker_comments: bool,
    /// When the tracker issue gets closed, move the report to
    /// Ask-for-Fix-Verification.
    #[serde(default)]
    pub issue_closed_to_report_afv: bool,
}

impl FeedbackOptions {
    /// True if any flag requires revisiting already-tracked reports.
    pub fn any_continuous(&self) -> bool {
        self.download_tracker_comments || self.issue_closed_to_report_afv
    }
}
