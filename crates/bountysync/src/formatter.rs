//! Template-driven rendering of reports and logs into tracker dialects.
//!
//! One template set exists per dialect. Values interpolated into markdown
//! are HTML-escaped; the Jira dialect takes values verbatim. Description
//! HTML flows through the matching converter from `bountysync-markup`.

use crate::report::{Log, LogKind, Report, report_property_label, translate_status};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const REPORT_TITLE_TEMPLATE: &str = "${local_id} : ${title}";

const MARKDOWN_REPORT_DESCRIPTION_TEMPLATE: &str = "
| Title | ${local_id} : ${title} |
|-------|---------------------|
| Priority | ${priority_name} |
| ${bug_type_label} | [${bug_type_name}](${bug_type_link}) &#8594; [Remediation](${bug_type_remediation_link}) |
| ${scope_label} | ${scope} |
| Severity | ${cvss_criticity}, score: ${cvss_score}, vector: ${cvss_vector} |
| ${end_point_label} | ${end_point} |
| ${vulnerable_part_label} | ${vulnerable_part} |
| ${part_name_label} | ${part_name} |
| ${payload_sample_label} | ${payload_sample} |
| Technical Environment | ${technical_environment} |

${description}
";

const MARKDOWN_COMMENT_BODY_TEMPLATE: &str = "
**Date**: ${date}

${body}
";

const MARKDOWN_COMMENT_LOG_TEMPLATE: &str = "
**Comment**:

${comment}
";

const MARKDOWN_CVSS_UPDATE_LOG_TEMPLATE: &str = "
**CVSS updated**:

| Detail | Old value | New value |
|--------|-----------|-----------|
| **Severity** | ${old_cvss_criticity} | ${new_cvss_criticity} |
| **Score** | ${old_cvss_score} | ${new_cvss_score} |
";

const MARKDOWN_STATUS_UPDATE_LOG_TEMPLATE: &str = "
**Status updated**:

${old_status} -> ${new_status}

**Comment**:

${comment}
";

const MARKDOWN_DETAILS_UPDATE_LOG_TEMPLATE: &str = "
**Details updated**:

| Detail | Old value | New value |
|--------|-----------|-----------|
${details_lines}
";

const MARKDOWN_DETAILS_UPDATE_LOG_LINE_TEMPLATE: &str =
    "| **${updated_property}** | ${old_value} | ${new_value} |\n";

const MARKDOWN_PRIORITY_UPDATE_LOG_TEMPLATE: &str = "
**Priority updated**:

${new_priority}
";

const MARKDOWN_REWARD_LOG_TEMPLATE: &str = "
**Comment from reward**:

${comment}
";

const JIRA_REPORT_DESCRIPTION_TEMPLATE: &str = "
|| Title || ${local_id} : ${title} ||
| Priority | ${priority_name} |
| ${bug_type_label} | [${bug_type_name}|${bug_type_link}] => [Remediation|${bug_type_remediation_link}] |
| ${scope_label} | ${scope} |
| Severity | ${cvss_criticity}, score: ${cvss_score}, vector: {noformat}${cvss_vector}{noformat} |
| ${end_point_label} | ${end_point} |
| ${vulnerable_part_label} | ${vulnerable_part} |
| ${part_name_label} | ${part_name} |
| ${payload_sample_label} | ${payload_sample} |
| Technical Environment | ${technical_environment} |

${description}
";

const JIRA_COMMENT_BODY_TEMPLATE: &str = "
*Date*: ${date}

${body}
";

const JIRA_COMMENT_LOG_TEMPLATE: &str = "
*Comment*:

${comment}
";

const JIRA_CVSS_UPDATE_LOG_TEMPLATE: &str = "
*CVSS updated*:

|| Detail || Old value || New value ||
| *Severity* | ${old_cvss_criticity} | ${new_cvss_criticity} |
| *Score* | ${old_cvss_score} | ${new_cvss_score} |
";

const JIRA_STATUS_UPDATE_LOG_TEMPLATE: &str = "
*Status updated*:

${old_status} -> ${new_status}

*Comment*:

${comment}
";

const JIRA_DETAILS_UPDATE_LOG_TEMPLATE: &str = "
*Details updated*:

|| Detail || Old value || New value ||
${details_lines}
";

const JIRA_DETAILS_UPDATE_LOG_LINE_TEMPLATE: &str =
    "| *${updated_property}* | ${old_value} | ${new_value} |\n";

const JIRA_PRIORITY_UPDATE_LOG_TEMPLATE: &str = "
*Priority updated*:

${new_priority}
";

const JIRA_REWARD_LOG_TEMPLATE: &str = "
*Comment from reward*:

${comment}
";

/// Substitute `${name}` placeholders in a template.
pub fn substitute(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in values {
        out = out.replace(&format!("${{{name}}}"), value);
    }
    out
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

fn identity(value: &str) -> String {
    value.to_string()
}

/// Template set of one dialect.
struct TemplateSet {
    report_description: &'static str,
    comment_body: &'static str,
    comment_log: &'static str,
    cvss_update_log: &'static str,
    status_update_log: &'static str,
    details_update_log: &'static str,
    details_update_log_line: &'static str,
    priority_update_log: &'static str,
    reward_log: &'static str,
}

/// Renders report titles, descriptions and log comment bodies for one
/// tracker dialect.
pub struct ReportMessageFormatter {
    templates: TemplateSet,
    transform_html: fn(&str) -> String,
    transform_value: fn(&str) -> String,
}

/// The markdown dialect formatter (GitHub, GitLab, ServiceNow).
pub fn markdown_formatter() -> ReportMessageFormatter {
    ReportMessageFormatter {
        templates: TemplateSet {
            report_description: MARKDOWN_REPORT_DESCRIPTION_TEMPLATE,
            comment_body: MARKDOWN_COMMENT_BODY_TEMPLATE,
            comment_log: MARKDOWN_COMMENT_LOG_TEMPLATE,
            cvss_update_log: MARKDOWN_CVSS_UPDATE_LOG_TEMPLATE,
            status_update_log: MARKDOWN_STATUS_UPDATE_LOG_TEMPLATE,
            details_update_log: MARKDOWN_DETAILS_UPDATE_LOG_TEMPLATE,
            details_update_log_line: MARKDOWN_DETAILS_UPDATE_LOG_LINE_TEMPLATE,
            priority_update_log: MARKDOWN_PRIORITY_UPDATE_LOG_TEMPLATE,
            reward_log: MARKDOWN_REWARD_LOG_TEMPLATE,
        },
        transform_html: bountysync_markup::html_to_markdown,
        transform_value: html_escape,
    }
}

/// The Jira wiki dialect formatter.
pub fn jira_formatter() -> ReportMessageFormatter {
    ReportMessageFormatter {
        templates: TemplateSet {
            report_description: JIRA_REPORT_DESCRIPTION_TEMPLATE,
            comment_body: JIRA_COMMENT_BODY_TEMPLATE,
            comment_log: JIRA_COMMENT_LOG_TEMPLATE,
            cvss_update_log: JIRA_CVSS_UPDATE_LOG_TEMPLATE,
            status_update_log: JIRA_STATUS_UPDATE_LOG_TEMPLATE,
            details_update_log: JIRA_DETAILS_UPDATE_LOG_TEMPLATE,
            details_update_log_line: JIRA_DETAILS_UPDATE_LOG_LINE_TEMPLATE,
            priority_update_log: JIRA_PRIORITY_UPDATE_LOG_TEMPLATE,
            reward_log: JIRA_REWARD_LOG_TEMPLATE,
        },
        transform_html: bountysync_markup::html_to_jira,
        transform_value: identity,
    }
}

impl ReportMessageFormatter {
    /// Issue title for a report.
    pub fn format_report_title(&self, report: &Report) -> String {
        substitute(
            REPORT_TITLE_TEMPLATE,
            &[
                ("local_id", &report.local_id),
                ("title", &(self.transform_value)(&report.title)),
            ],
        )
    }

    /// Issue description for a report.
    pub fn format_report_description(&self, report: &Report) -> String {
        let priority_name = report
            .priority
            .as_ref()
            .map(|priority| priority.name.clone())
            .unwrap_or_default();
        let remediation_link = if report.bug_type.remediation_link.is_empty() {
            "/"
        } else {
            &report.bug_type.remediation_link
        };
        let cvss_score = format_score(report.cvss.score);
        substitute(
            self.templates.report_description,
            &[
                ("local_id", &report.local_id),
                ("title", &(self.transform_value)(&report.title)),
                ("priority_name", &priority_name),
                ("bug_type_label", report_property_label("bug_type")),
                ("bug_type_name", &report.bug_type.name),
                ("bug_type_link", &report.bug_type.link),
                ("bug_type_remediation_link", remediation_link),
                ("scope_label", report_property_label("scope")),
                ("scope", &(self.transform_value)(&report.scope)),
                ("cvss_criticity", &report.cvss.criticity),
                ("cvss_score", &cvss_score),
                ("cvss_vector", &report.cvss.vector),
                ("end_point_label", report_property_label("end_point")),
                ("end_point", &(self.transform_value)(&report.end_point)),
                (
                    "vulnerable_part_label",
                    report_property_label("vulnerable_part"),
                ),
                (
                    "vulnerable_part",
                    &(self.transform_value)(&report.vulnerable_part),
                ),
                ("part_name_label", report_property_label("part_name")),
                ("part_name", &(self.transform_value)(&report.part_name)),
                (
                    "payload_sample_label",
                    report_property_label("payload_sample"),
                ),
                (
                    "payload_sample",
                    &(self.transform_value)(&report.payload_sample),
                ),
                (
                    "technical_environment",
                    &(self.transform_value)(&report.technical_environment),
                ),
                (
                    "description",
                    &(self.transform_html)(&report.description_html),
                ),
            ],
        )
    }

    /// Comment body for a log, framed with its date.
    pub fn format_log(&self, log: &Log) -> String {
        substitute(
            self.templates.comment_body,
            &[("date", &log.created_at), ("body", &self.format_log_body(log))],
        )
    }

    fn format_log_body(&self, log: &Log) -> String {
        match &log.kind {
            LogKind::Comment => substitute(
                self.templates.comment_log,
                &[("comment", &(self.transform_html)(&log.message_html))],
            ),
            LogKind::CvssUpdate { old_cvss, new_cvss } => substitute(
                self.templates.cvss_update_log,
                &[
                    ("old_cvss_criticity", old_cvss.criticity.as_str()),
                    ("old_cvss_score", &format_score(old_cvss.score)),
                    ("new_cvss_criticity", new_cvss.criticity.as_str()),
                    ("new_cvss_score", &format_score(new_cvss.score)),
                ],
            ),
            LogKind::StatusUpdate {
                old_status,
                new_status,
            } => substitute(
                self.templates.status_update_log,
                &[
                    (
                        "old_status",
                        translate_status(old_status.as_deref().unwrap_or("")),
                    ),
                    (
                        "new_status",
                        translate_status(new_status.as_deref().unwrap_or("")),
                    ),
                    ("comment", &(self.transform_html)(&log.message_html)),
                ],
            ),
            LogKind::DetailsUpdate {
                old_details,
                new_details,
            } => {
                let mut details_lines = String::new();
                for (updated_property, new_value) in new_details {
                    let old_value = old_details
                        .get(updated_property)
                        .map(String::as_str)
                        .unwrap_or("");
                    details_lines.push_str(&substitute(
                        self.templates.details_update_log_line,
                        &[
                            (
                                "updated_property",
                                report_property_label(updated_property),
                            ),
                            ("old_value", &(self.transform_value)(old_value)),
                            ("new_value", &(self.transform_value)(new_value)),
                        ],
                    ));
                }
                substitute(
                    self.templates.details_update_log,
                    &[("details_lines", details_lines.as_str())],
                )
            }
            LogKind::PriorityUpdate { new_priority } => substitute(
                self.templates.priority_update_log,
                &[(
                    "new_priority",
                    new_priority
                        .as_ref()
                        .map(|priority| priority.name.as_str())
                        .unwrap_or("Undefined"),
                )],
            ),
            LogKind::Reward { .. } => substitute(
                self.templates.reward_log,
                &[("comment", &(self.transform_html)(&log.message_html))],
            ),
            // Tracking, tracker-update, tracker-message and unknown kinds
            // carry their whole payload in the message HTML.
            _ => (self.transform_html)(&log.message_html),
        }
    }
}

fn format_score(score: f64) -> String {
    if score == score.trunc() {
        format!("{score:.1}")
    } else {
        format!("{score}")
    }
}

/// Rewrite inline image references to platform attachment placeholders
/// (`{YWH-C<id>}`), given the mapping from reference to attachment id.
pub fn markdown_to_platform(message: &str, attachment_ids: &BTreeMap<String, i64>) -> String {
    static IMAGE_RE: OnceLock<Regex> = OnceLock::new();
    let re = IMAGE_RE
        .get_or_init(|| Regex::new(r"!\[([^\]]+)]\(([^)]+)\)").expect("valid regex"));
    let mut message = message.to_string();
    let references: Vec<(String, String)> = re
        .captures_iter(&message)
        .map(|captures| (captures[1].to_string(), captures[2].to_string()))
        .collect();
    for (alt, reference) in references {
        if let Some(attachment_id) = attachment_ids.get(&reference) {
            message = message.replace(
                &format!("![{alt}]({reference})"),
                &format!("{{YWH-C{attachment_id}}}"),
            );
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Author, BugType, Cvss, Priority, ReportProgram};

    fn sample_report() -> Report {
        Report {
            report_id: "123".to_string(),
            local_id: "YWH-123".to_string(),
            title: "XSS in <search>".to_string(),
            bug_type: BugType {
                name: "XSS".to_string(),
                link: "https://bugs/xss".to_string(),
                remediation_link: String::new(),
            },
            scope: "https://target".to_string(),
            cvss: Cvss {
                criticity: "critical".to_string(),
                score: 9.0,
                vector: "CVSS:3.1/AV:N".to_string(),
            },
            end_point: "/search".to_string(),
            vulnerable_part: "q".to_string(),
            part_name: "param".to_string(),
            payload_sample: "<script>1</script>".to_string(),
            technical_environment: String::new(),
            description_html: "<p>Reflected <strong>XSS</strong></p>".to_string(),
            attachments: Vec::new(),
            hunter: Author {
                username: "hunter".to_string(),
            },
            status: "accepted".to_string(),
            tracking_status: "AFI".to_string(),
            logs: Vec::new(),
            priority: Some(Priority {
                name: "P2".to_string(),
            }),
            program: ReportProgram::default(),
        }
    }

    fn comment_log() -> Log {
        Log {
            created_at: "2021-01-01T00:00:00+00:00".to_string(),
            log_id: 7,
            private: false,
            author: Author {
                username: "user".to_string(),
            },
            message_html: "<p>Any news?</p>".to_string(),
            attachments: Vec::new(),
            kind: LogKind::Comment,
        }
    }

    #[test]
    fn title_escapes_markdown_values() {
        let formatter = markdown_formatter();
        assert_eq!(
            formatter.format_report_title(&sample_report()),
            "YWH-123 : XSS in &lt;search&gt;"
        );
    }

    #[test]
    fn jira_title_keeps_values_verbatim() {
        let formatter = jira_formatter();
        assert_eq!(
            formatter.format_report_title(&sample_report()),
            "YWH-123 : XSS in <search>"
        );
    }

    #[test]
    fn description_fills_the_summary_table() {
        let description = markdown_formatter().format_report_description(&sample_report());
        assert!(description.contains("| Title | YWH-123 : XSS in &lt;search&gt; |"));
        assert!(description.contains("| Priority | P2 |"));
        assert!(description.contains("[XSS](https://bugs/xss) &#8594; [Remediation](/)"));
        assert!(description.contains("| Severity | critical, score: 9.0, vector: CVSS:3.1/AV:N |"));
        assert!(description.contains("Reflected **XSS**"));
    }

    #[test]
    fn jira_description_uses_wiki_table_syntax() {
        let description = jira_formatter().format_report_description(&sample_report());
        assert!(description.contains("|| Title || YWH-123 : XSS in <search> ||"));
        assert!(description.contains("[XSS|https://bugs/xss] => [Remediation|/]"));
        assert!(description.contains("{noformat}CVSS:3.1/AV:N{noformat}"));
    }

    #[test]
    fn comment_log_is_framed_with_its_date() {
        let body = markdown_formatter().format_log(&comment_log());
        assert!(body.contains("**Date**: 2021-01-01T00:00:00+00:00"));
        assert!(body.contains("**Comment**:"));
        assert!(body.contains("Any news?"));
    }

    #[test]
    fn status_update_log_translates_workflow_states() {
        let mut log = comment_log();
        log.kind = LogKind::StatusUpdate {
            old_status: Some("under_review".to_string()),
            new_status: Some("accepted".to_string()),
        };
        let body = markdown_formatter().format_log(&log);
        assert!(body.contains("Under Review -> Accepted"));
    }

    #[test]
    fn details_update_log_renders_one_line_per_field() {
        let mut log = comment_log();
        log.kind = LogKind::DetailsUpdate {
            old_details: BTreeMap::from([("end_point".to_string(), "/old".to_string())]),
            new_details: BTreeMap::from([("end_point".to_string(), "/new".to_string())]),
        };
        let body = markdown_formatter().format_log(&log);
        assert!(body.contains("| **End Point** | /old | /new |"));
    }

    #[test]
    fn priority_update_without_priority_prints_undefined() {
        let mut log = comment_log();
        log.kind = LogKind::PriorityUpdate { new_priority: None };
        let body = markdown_formatter().format_log(&log);
        assert!(body.contains("Undefined"));
    }

    #[test]
    fn unknown_log_kind_falls_back_to_its_message() {
        let mut log = comment_log();
        log.kind = LogKind::Other {
            kind: "surprise".to_string(),
        };
        log.message_html = "<p>raw <em>message</em></p>".to_string();
        let body = markdown_formatter().format_log(&log);
        assert!(body.contains("raw *message*"));
        assert!(!body.contains("**Comment**"));
    }

    #[test]
    fn inline_images_become_platform_placeholders() {
        let attachments = BTreeMap::from([("shot.png".to_string(), 42_i64)]);
        let rewritten = markdown_to_platform(
            "see ![capture](shot.png) and ![other](missing.png)",
            &attachments,
        );
        assert_eq!(rewritten, "see {YWH-C42} and ![other](missing.png)");
    }
}
