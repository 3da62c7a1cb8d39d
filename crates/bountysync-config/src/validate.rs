//! Pre-flight validation of the configuration tree.
//!
//! Validation walks the typed tree and aggregates every failure instead of
//! stopping at the first one, so a configuration author sees the full list
//! in one run. Paths are dotted attribute paths
//! (`yeswehack.prod.programs.0.slug`).

use crate::{
    GitHubConfiguration, GitLabConfiguration, JiraConfiguration, Program, RootConfiguration,
    ServiceNowConfiguration, TrackerConfiguration, YesWeHackConfiguration,
};
use url::Url;

/// One failed attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending attribute.
    pub path: String,
    /// What is wrong with it.
    pub message: String,
}

struct Collector {
    errors: Vec<ValidationError>,
}

impl Collector {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn require_not_blank(&mut self, path: String, value: &str) {
        if value.trim().is_empty() {
            self.push(path, "expecting a non-blank value");
        }
    }

    fn require_url(&mut self, path: String, value: &str) {
        match Url::parse(value) {
            Ok(url) if url.has_host() => {}
            _ => self.push(path, format!("not a valid URL: {value:?}")),
        }
    }

    fn require_host(&mut self, path: String, value: &str) {
        if value.trim().is_empty() || value.contains('/') || value.contains(' ') {
            self.push(path, format!("not a valid host: {value:?}"));
        }
    }
}

pub(crate) fn validate_root(root: &RootConfiguration) -> Vec<ValidationError> {
    let mut collector = Collector { errors: Vec::new() };
    for (name, tracker) in &root.trackers {
        validate_tracker(&mut collector, &format!("trackers.{name}"), tracker);
    }
    for (name, platform) in &root.yeswehack {
        validate_platform(&mut collector, &format!("yeswehack.{name}"), platform, root);
    }
    collector.errors
}

fn validate_tracker(collector: &mut Collector, path: &str, tracker: &TrackerConfiguration) {
    match tracker {
        TrackerConfiguration::Github(github) => validate_github(collector, path, github),
        TrackerConfiguration::Gitlab(gitlab) => validate_gitlab(collector, path, gitlab),
        TrackerConfiguration::Jira(jira) => validate_jira(collector, path, jira),
        TrackerConfiguration::Servicenow(servicenow) => {
            validate_servicenow(collector, path, servicenow);
        }
    }
}

fn validate_github(collector: &mut Collector, path: &str, github: &GitHubConfiguration) {
    collector.require_url(format!("{path}.url"), &github.url);
    collector.require_not_blank(format!("{path}.token"), &github.token);
    collector.require_not_blank(format!("{path}.project"), &github.project);
    if github.github_cdn_on {
        if github.login.as_deref().map(str::trim).unwrap_or("").is_empty() {
            collector.push(
                format!("{path}.login"),
                "expecting a value when github_cdn_on is true",
            );
        }
        if github
            .password
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
        {
            collector.push(
                format!("{path}.password"),
                "expecting a value when github_cdn_on is true",
            );
        }
    }
}

fn validate_gitlab(collector: &mut Collector, path: &str, gitlab: &GitLabConfiguration) {
    collector.require_url(format!("{path}.url"), &gitlab.url);
    collector.require_not_blank(format!("{path}.token"), &gitlab.token);
    collector.require_not_blank(format!("{path}.project"), &gitlab.project);
}

fn validate_jira(collector: &mut Collector, path: &str, jira: &JiraConfiguration) {
    collector.require_url(format!("{path}.url"), &jira.url);
    collector.require_not_blank(format!("{path}.login"), &jira.login);
    collector.require_not_blank(format!("{path}.password"), &jira.password);
    collector.require_not_blank(format!("{path}.project"), &jira.project);
}

fn validate_servicenow(
    collector: &mut Collector,
    path: &str,
    servicenow: &ServiceNowConfiguration,
) {
    collector.require_host(format!("{path}.host"), &servicenow.host);
    collector.require_not_blank(format!("{path}.login"), &servicenow.login);
    collector.require_not_blank(format!("{path}.password"), &servicenow.password);
}

fn validate_platform(
    collector: &mut Collector,
    path: &str,
    platform: &YesWeHackConfiguration,
    root: &RootConfiguration,
) {
    collector.require_url(format!("{path}.api_url"), &platform.api_url);
    let apps_header = platform
        .apps_headers
        .get("X-YesWeHack-Apps")
        .map(String::as_str)
        .unwrap_or("");
    if apps_header.trim().is_empty() {
        collector.push(
            format!("{path}.apps_headers"),
            "expecting a non-blank X-YesWeHack-Apps header",
        );
    }
    validate_credentials(collector, path, platform);
    if let Some(oauth) = &platform.oauth_args {
        collector.require_not_blank(format!("{path}.oauth_args.client_id"), &oauth.client_id);
        collector.require_not_blank(
            format!("{path}.oauth_args.client_secret"),
            &oauth.client_secret,
        );
        collector.require_url(format!("{path}.oauth_args.redirect_uri"), &oauth.redirect_uri);
    }
    if platform.programs.is_empty() {
        collector.push(format!("{path}.programs"), "expecting at least one program");
    }
    for (index, program) in platform.programs.iter().enumerate() {
        validate_program(
            collector,
            &format!("{path}.programs.{index}"),
            program,
            root,
        );
    }
}

fn validate_credentials(
    collector: &mut Collector,
    path: &str,
    platform: &YesWeHackConfiguration,
) {
    if let Some(pat) = &platform.pat {
        collector.require_not_blank(format!("{path}.pat"), pat);
        return;
    }
    match &platform.login {
        Some(login) => collector.require_not_blank(format!("{path}.login"), login),
        None => collector.push(format!("{path}.login"), "expecting a value"),
    }
    match &platform.password {
        Some(password) => collector.require_not_blank(format!("{path}.password"), password),
        None => collector.push(format!("{path}.password"), "expecting a value"),
    }
}

fn validate_program(
    collector: &mut Collector,
    path: &str,
    program: &Program,
    root: &RootConfiguration,
) {
    collector.require_not_blank(format!("{path}.slug"), &program.slug);
    if program.bugtrackers_name.is_empty() {
        collector.push(
            format!("{path}.bugtrackers_name"),
            "expecting at least one tracker name",
        );
    }
    for (index, tracker_name) in program.bugtrackers_name.iter().enumerate() {
        if !root.trackers.contains_key(tracker_name) {
            collector.push(
                format!("{path}.bugtrackers_name.{index}"),
                format!("tracker {tracker_name:?} is not declared in the trackers map"),
            );
        }
    }
}
