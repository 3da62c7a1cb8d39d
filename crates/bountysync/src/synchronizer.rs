//! Per-(report, tracker) reconciliation.
//!
//! One [`ReportSynchronizer::synchronize_report`] call drives a full round:
//! find or create the tracker issue, replay the platform logs the tracker
//! has not seen, mirror tracker-side comments back, detect issue state
//! transitions, and stamp the platform with a fresh state token recording
//! how far the pair has advanced. All operations of one round are strictly
//! sequential; they share the replay cursor.

use crate::error::ApiError;
use crate::platform::PlatformApi;
use crate::report::{Log, LogKind, Report};
use crate::tracker::{
    SendLogsResult, TrackerClient, TrackerIssue, TrackerIssueComment, TrackerIssueState,
};
use bountysync_config::{FeedbackOptions, SynchronizeOptions};

/// Tracking status code for a tracked report.
pub const TRACKED_STATUS: &str = "T";
/// Workflow status a report moves to when its issue gets closed and the
/// ask-for-fix-verification feedback is enabled.
pub const AFV_STATUS: &str = "ask_verif";

/// A synchronization error for one (report, tracker) pair.
#[derive(Debug, thiserror::Error)]
pub enum SynchronizerError {
    /// Building a platform or tracker client failed.
    #[error("unable to initialize client for {name}")]
    Client {
        /// Configuration name of the endpoint.
        name: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
    /// Fetching a program's reports failed.
    #[error("unable to get AFI/T reports for program {slug}")]
    FetchReports {
        /// Program slug.
        slug: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
    /// Looking up the tracker-side issue failed (not a definitive
    /// not-found).
    #[error("unable to get issue for #{report_id} in {tracker_name}")]
    GetIssue {
        /// Report id.
        report_id: String,
        /// Tracker name.
        tracker_name: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
    /// Creating the tracker-side issue failed.
    #[error("unable to send report #{report_id} to {tracker_name}")]
    SendReport {
        /// Report id.
        report_id: String,
        /// Tracker name.
        tracker_name: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
    /// Appending comments to the tracker issue failed. Comments created
    /// before the failure stay in place; the cursor does not advance.
    #[error("unable to send logs for #{report_id} to {tracker_name}")]
    SendLogs {
        /// Report id.
        report_id: String,
        /// Tracker name.
        tracker_name: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
    /// Recording the tracking status on the platform failed.
    #[error("unable to update tracking status for report #{report_id}")]
    TrackingStatus {
        /// Report id.
        report_id: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
    /// Writing the tracker-update feedback log failed.
    #[error("unable to send tracker update for report #{report_id}")]
    TrackerUpdate {
        /// Report id.
        report_id: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
    /// Updating the report workflow status failed.
    #[error("unable to update status of report #{report_id}")]
    ReportStatus {
        /// Report id.
        report_id: String,
        /// Underlying error.
        #[source]
        source: ApiError,
    },
    /// Encoding the state token failed.
    #[error("unable to encode state token for report #{report_id}")]
    Token {
        /// Report id.
        report_id: String,
        /// Underlying error.
        #[source]
        source: bountysync_state::StateError,
    },
}

/// What one synchronization round did.
#[derive(Debug, Clone)]
pub struct SynchronizeReportResult {
    /// The issue the pair resolved to.
    pub tracker_issue: TrackerIssue,
    /// True if the issue already existed on the tracker.
    pub is_existing_issue: bool,
    /// True if the round created the issue.
    pub is_created_issue: bool,
    /// True if the round recorded the tracking status on the platform.
    pub tracking_status_updated: bool,
    /// Tracker-side ids of comments added to the issue this round.
    pub issue_added_comments: Vec<String>,
    /// Tracker-side ids of comments mirrored to the platform this round.
    pub report_added_comments: Vec<String>,
    /// `(old, new)` workflow states when the round moved the report.
    pub new_report_status: Option<(String, String)>,
}

/// Renders the platform-side messages a round produces. The default
/// implementation is [`DefaultSyncMessageFormatter`]; tests substitute
/// their own.
pub trait SyncMessageFormatter {
    /// Message for the first-time tracking-status update.
    fn format_tracking_status_update(
        &self,
        tracker_type: &str,
        tracker_issue: &TrackerIssue,
    ) -> String;

    /// Message for a completed synchronization round.
    fn format_synchronization_done(
        &self,
        tracker_type: &str,
        tracker_issue: &TrackerIssue,
        comment_count: usize,
        state_transition: Option<&str>,
    ) -> String;

    /// Platform comment body mirroring one tracker comment.
    fn format_download_comment(&self, tracker_type: &str, comment: &TrackerIssueComment)
    -> String;

    /// Comment accompanying the ask-for-fix-verification status change.
    fn format_status_update_comment(&self, comment: &str) -> String;
}

/// The production message formatter.
#[derive(Debug, Default)]
pub struct DefaultSyncMessageFormatter;

impl SyncMessageFormatter for DefaultSyncMessageFormatter {
    fn format_tracking_status_update(
        &self,
        tracker_type: &str,
        tracker_issue: &TrackerIssue,
    ) -> String {
        format!(
            "Synchronized with bugtracker : {} on project : {}.\nTracked to [{} #{}]({}).",
            tracker_issue.tracker_url,
            tracker_issue.project,
            tracker_type,
            tracker_issue.issue_id,
            tracker_issue.issue_url,
        )
    }

    fn format_synchronization_done(
        &self,
        tracker_type: &str,
        tracker_issue: &TrackerIssue,
        comment_count: usize,
        state_transition: Option<&str>,
    ) -> String {
        let mut message = format!(
            "Synchronized with bugtracker : {} on project : {}.\nTracked to [{} #{}]({}).\nReport comments added to issue: {}",
            tracker_issue.tracker_url,
            tracker_issue.project,
            tracker_type,
            tracker_issue.issue_id,
            tracker_issue.issue_url,
            comment_count,
        );
        if let Some(transition) = state_transition {
            message.push_str(&format!("\nIssue state: {transition}"));
        }
        message
    }

    fn format_download_comment(
        &self,
        tracker_type: &str,
        comment: &TrackerIssueComment,
    ) -> String {
        format!(
            "**Date**: {}\n\n**Comment from {} ({})**:\n\n{}",
            comment.created_at.to_rfc3339(),
            tracker_type,
            comment.author,
            comment.body,
        )
    }

    fn format_status_update_comment(&self, comment: &str) -> String {
        format!("Status updated from tracker:\n\n{comment}")
    }
}

/// Reconciles one report against one tracker.
pub struct ReportSynchronizer<'a> {
    /// Platform client of the report's platform.
    pub yeswehack_client: &'a dyn PlatformApi,
    /// Adapter of the target tracker.
    pub tracker_client: &'a dyn TrackerClient,
    /// Configured name of the target tracker.
    pub tracker_name: &'a str,
    /// Outbound gating flags of the program.
    pub synchronize_options: &'a SynchronizeOptions,
    /// Inbound mirroring flags of the program.
    pub feedback_options: &'a FeedbackOptions,
    /// Message renderer.
    pub message_formatter: &'a dyn SyncMessageFormatter,
}

impl ReportSynchronizer<'_> {
    /// Run one synchronization round for `report`.
    pub fn synchronize_report(
        &self,
        report: &Report,
    ) -> Result<SynchronizeReportResult, SynchronizerError> {
        let existing_issue = self.find_existing_issue(report)?;
        let is_existing_issue = existing_issue.is_some();
        let (tracker_issue, is_created_issue) = match existing_issue {
            Some(issue) => (issue, false),
            None => {
                let issue = self.tracker_client.send_report(report).map_err(|source| {
                    SynchronizerError::SendReport {
                        report_id: report.report_id.clone(),
                        tracker_name: self.tracker_name.to_string(),
                        source,
                    }
                })?;
                (issue, true)
            }
        };

        let replay = self.compute_replay(report, is_existing_issue);

        // The tracking status is recorded before anything else is written
        // back, so a crash mid-round still leaves the issue discoverable.
        let tracking_status_updated =
            report.tracking_status != TRACKED_STATUS || !is_existing_issue;
        if tracking_status_updated {
            let message = self
                .message_formatter
                .format_tracking_status_update(self.tracker_client.tracker_type(), &tracker_issue);
            self.yeswehack_client
                .put_report_tracking_status(
                    report,
                    TRACKED_STATUS,
                    self.tracker_name,
                    &tracker_issue.issue_id,
                    &tracker_issue.issue_url,
                    &message,
                )
                .map_err(|source| SynchronizerError::TrackingStatus {
                    report_id: report.report_id.clone(),
                    source,
                })?;
        }

        let outbound: Vec<&Log> = replay
            .candidate_logs
            .into_iter()
            .filter(|log| is_synchronizable(log, self.synchronize_options))
            .filter(|log| !replay.known_comments.contains(&log.log_id.to_string()))
            .collect();
        let send_result = if outbound.is_empty() {
            SendLogsResult {
                tracker_issue: tracker_issue.clone(),
                added_comments: Vec::new(),
            }
        } else {
            self.tracker_client
                .send_logs(&tracker_issue, &outbound)
                .map_err(|source| SynchronizerError::SendLogs {
                    report_id: report.report_id.clone(),
                    tracker_name: self.tracker_name.to_string(),
                    source,
                })?
        };
        let issue_added_comments: Vec<String> = send_result
            .added_comments
            .iter()
            .map(|comment| comment.comment_id.clone())
            .collect();

        let report_added_comments = self.download_comments(
            report,
            &tracker_issue,
            &replay.known_comments,
            &issue_added_comments,
        )?;

        let state_changed = is_existing_issue
            && replay
                .last_state
                .as_ref()
                .is_some_and(|state| state.closed != tracker_issue.closed);
        let state_transition = state_changed.then(|| {
            let previous = replay
                .last_state
                .as_ref()
                .map(|state| closed_label(state.closed))
                .unwrap_or("???");
            format!("{previous} -> {}", closed_label(tracker_issue.closed))
        });

        let new_report_status =
            self.apply_closed_feedback(report, &tracker_issue, state_changed)?;

        if !issue_added_comments.is_empty()
            || !report_added_comments.is_empty()
            || state_changed
        {
            let mut downloaded_comments = replay.known_comments;
            downloaded_comments.extend(issue_added_comments.iter().cloned());
            downloaded_comments.extend(report_added_comments.iter().cloned());
            let token = bountysync_state::encrypt(
                &TrackerIssueState {
                    closed: tracker_issue.closed,
                    bugtracker_name: Some(self.tracker_name.to_string()),
                    downloaded_comments,
                },
                &report.report_id,
            )
            .map_err(|source| SynchronizerError::Token {
                report_id: report.report_id.clone(),
                source,
            })?;
            let message = self.message_formatter.format_synchronization_done(
                self.tracker_client.tracker_type(),
                &tracker_issue,
                issue_added_comments.len(),
                state_transition.as_deref(),
            );
            self.yeswehack_client
                .post_report_tracker_update(
                    report,
                    self.tracker_name,
                    &tracker_issue.issue_id,
                    &tracker_issue.issue_url,
                    &token,
                    &message,
                )
                .map_err(|source| SynchronizerError::TrackerUpdate {
                    report_id: report.report_id.clone(),
                    source,
                })?;
        }

        Ok(SynchronizeReportResult {
            tracker_issue,
            is_existing_issue,
            is_created_issue,
            tracking_status_updated,
            issue_added_comments,
            report_added_comments,
            new_report_status,
        })
    }

    /// Walk the logs newest-first for a tracking-status entry naming this
    /// tracker, then ask the adapter. A stale mapping (the tracker
    /// definitively lost the issue) reads as "no issue": the round
    /// recreates rather than block on a deleted remote.
    fn find_existing_issue(
        &self,
        report: &Report,
    ) -> Result<Option<TrackerIssue>, SynchronizerError> {
        let Some(log) = report.last_tracking_status_log(self.tracker_name) else {
            return Ok(None);
        };
        let LogKind::TrackingStatus {
            tracker_id: Some(tracker_id),
            ..
        } = &log.kind
        else {
            return Ok(None);
        };
        self.tracker_client
            .get_tracker_issue(tracker_id)
            .map_err(|source| SynchronizerError::GetIssue {
                report_id: report.report_id.clone(),
                tracker_name: self.tracker_name.to_string(),
                source,
            })
    }

    fn compute_replay<'r>(&self, report: &'r Report, is_existing_issue: bool) -> Replay<'r> {
        let mut known_comments: Vec<String> = Vec::new();
        let mut last_state = None;
        let mut cursor_log_id = None;
        for log in &report.logs {
            let LogKind::TrackerUpdate {
                tracker_token: Some(token),
                ..
            } = &log.kind
            else {
                continue;
            };
            let Some(state) =
                bountysync_state::decrypt_lenient::<TrackerIssueState>(token, &report.report_id)
            else {
                continue;
            };
            if state.bugtracker_name.as_deref() != Some(self.tracker_name) {
                continue;
            }
            for comment_id in &state.downloaded_comments {
                if !known_comments.contains(comment_id) {
                    known_comments.push(comment_id.clone());
                }
            }
            cursor_log_id = Some(log.log_id);
            last_state = Some(state);
        }
        if !is_existing_issue {
            // A recreated issue has nothing on it yet; tokens of the lost
            // issue must neither trim the replay nor exclude comments.
            return Replay {
                candidate_logs: report.logs.iter().collect(),
                known_comments: Vec::new(),
                last_state: None,
            };
        }
        let candidate_logs = match cursor_log_id {
            Some(log_id) => report.logs_after(log_id),
            None => report.logs.iter().collect(),
        };
        Replay {
            candidate_logs,
            known_comments,
            last_state,
        }
    }

    fn download_comments(
        &self,
        report: &Report,
        tracker_issue: &TrackerIssue,
        known_comments: &[String],
        issue_added_comments: &[String],
    ) -> Result<Vec<String>, SynchronizerError> {
        if !self.feedback_options.download_tracker_comments {
            return Ok(Vec::new());
        }
        let mut exclude = known_comments.to_vec();
        exclude.extend(issue_added_comments.iter().cloned());
        let comments = self
            .tracker_client
            .get_tracker_issue_comments(&tracker_issue.issue_id, &exclude)
            .map_err(|source| SynchronizerError::GetIssue {
                report_id: report.report_id.clone(),
                tracker_name: self.tracker_name.to_string(),
                source,
            })?;
        let mut mirrored = Vec::new();
        for comment in comments {
            let body = self
                .message_formatter
                .format_download_comment(self.tracker_client.tracker_type(), &comment);
            let attachments: Vec<_> = comment.attachments.values().cloned().collect();
            // A failed mirror is skipped and retried next round; successes
            // are recorded either way so they are mirrored at most once.
            if self
                .yeswehack_client
                .post_report_comment(report, &body, &attachments)
                .is_ok()
            {
                mirrored.push(comment.comment_id.clone());
            }
        }
        Ok(mirrored)
    }

    fn apply_closed_feedback(
        &self,
        report: &Report,
        tracker_issue: &TrackerIssue,
        state_changed: bool,
    ) -> Result<Option<(String, String)>, SynchronizerError> {
        if !(state_changed
            && tracker_issue.closed
            && self.feedback_options.issue_closed_to_report_afv
            && report.status == "accepted")
        {
            return Ok(None);
        }
        let comment = self.message_formatter.format_status_update_comment(&format!(
            "Issue [{}]({}) was closed on {}.",
            tracker_issue.issue_id,
            tracker_issue.issue_url,
            self.tracker_client.tracker_type(),
        ));
        self.yeswehack_client
            .update_report_status(report, AFV_STATUS, &comment)
            .map_err(|source| SynchronizerError::ReportStatus {
                report_id: report.report_id.clone(),
                source,
            })?;
        Ok(Some((report.status.clone(), AFV_STATUS.to_string())))
    }
}

struct Replay<'r> {
    candidate_logs: Vec<&'r Log>,
    known_comments: Vec<String>,
    last_state: Option<TrackerIssueState>,
}

fn closed_label(closed: bool) -> &'static str {
    if closed { "closed" } else { "opened" }
}

fn is_synchronizable(log: &Log, options: &SynchronizeOptions) -> bool {
    match &log.kind {
        LogKind::Comment if log.private => options.upload_private_comments,
        LogKind::Comment => options.upload_public_comments,
        LogKind::DetailsUpdate { .. }
        | LogKind::CvssUpdate { .. }
        | LogKind::PriorityUpdate { .. } => options.upload_details_updates,
        LogKind::Reward { .. } => options.upload_rewards,
        LogKind::StatusUpdate { .. } => options.upload_status_updates,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Author, BugType, Cvss, ReportProgram};
    use crate::tracker::TrackerAttachment;
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    fn all_options() -> SynchronizeOptions {
        SynchronizeOptions {
            upload_private_comments: true,
            upload_public_comments: true,
            upload_details_updates: true,
            upload_rewards: true,
            upload_status_updates: true,
        }
    }

    fn issue(issue_id: &str, closed: bool) -> TrackerIssue {
        TrackerIssue {
            tracker_url: "http://tracker".to_string(),
            project: "my-project".to_string(),
            issue_id: issue_id.to_string(),
            issue_url: format!("http://tracker/issue/{issue_id}"),
            closed,
        }
    }

    fn comment_log(log_id: i64, private: bool, message: &str) -> Log {
        Log {
            created_at: "2021-01-01T00:00:00+00:00".to_string(),
            log_id,
            private,
            author: Author {
                username: "user1".to_string(),
            },
            message_html: message.to_string(),
            attachments: Vec::new(),
            kind: LogKind::Comment,
        }
    }

    fn tracking_status_log(log_id: i64, tracker_name: &str, tracker_id: &str) -> Log {
        Log {
            created_at: "2021-01-01T00:30:00+00:00".to_string(),
            log_id,
            private: true,
            author: Author {
                username: "user1".to_string(),
            },
            message_html: "Tracked".to_string(),
            attachments: Vec::new(),
            kind: LogKind::TrackingStatus {
                tracker_name: Some(tracker_name.to_string()),
                tracker_url: Some(format!("http://tracker/issue/{tracker_id}")),
                tracker_id: Some(tracker_id.to_string()),
            },
        }
    }

    fn tracker_update_log(log_id: i64, report_id: &str, state: &TrackerIssueState) -> Log {
        let token = bountysync_state::encrypt(state, report_id).expect("token");
        Log {
            created_at: "2021-01-01T01:00:00+00:00".to_string(),
            log_id,
            private: true,
            author: Author {
                username: "user1".to_string(),
            },
            message_html: "This is a tracker update".to_string(),
            attachments: Vec::new(),
            kind: LogKind::TrackerUpdate {
                tracker_name: Some("my-tracker".to_string()),
                tracker_url: Some("http://tracker/issue/1".to_string()),
                tracker_id: Some("1".to_string()),
                tracker_token: Some(token),
            },
        }
    }

    fn report(tracking_status: &str, logs: Vec<Log>) -> Report {
        Report {
            report_id: "123".to_string(),
            local_id: "YWH-123".to_string(),
            title: "A bug report".to_string(),
            bug_type: BugType::default(),
            scope: String::new(),
            cvss: Cvss::default(),
            end_point: "/".to_string(),
            vulnerable_part: "post".to_string(),
            part_name: "param".to_string(),
            payload_sample: "abcde".to_string(),
            technical_environment: String::new(),
            description_html: "This is a bug".to_string(),
            attachments: Vec::new(),
            hunter: Author {
                username: "a-hunter".to_string(),
            },
            status: "accepted".to_string(),
            tracking_status: tracking_status.to_string(),
            logs,
            priority: None,
            program: ReportProgram {
                title: "Program 1".to_string(),
                slug: "program1".to_string(),
            },
        }
    }

    #[derive(Default)]
    struct FakeTracker {
        existing_issue: Option<TrackerIssue>,
        created_issue: Option<TrackerIssue>,
        tracker_comments: Vec<TrackerIssueComment>,
        fail_send_logs: bool,
        send_report_calls: RefCell<u32>,
        sent_log_ids: RefCell<Vec<Vec<i64>>>,
        comment_requests: RefCell<Vec<Vec<String>>>,
    }

    impl TrackerClient for FakeTracker {
        fn tracker_type(&self) -> &'static str {
            "MyTracker"
        }

        fn test(&self) -> Result<(), ApiError> {
            Ok(())
        }

        fn get_tracker_issue(&self, _issue_id: &str) -> Result<Option<TrackerIssue>, ApiError> {
            Ok(self.existing_issue.clone())
        }

        fn send_report(&self, _report: &Report) -> Result<TrackerIssue, ApiError> {
            *self.send_report_calls.borrow_mut() += 1;
            self.created_issue
                .clone()
                .ok_or_else(|| ApiError::adapter("issue creation disabled in this fake"))
        }

        fn send_logs(
            &self,
            tracker_issue: &TrackerIssue,
            logs: &[&Log],
        ) -> Result<SendLogsResult, ApiError> {
            self.sent_log_ids
                .borrow_mut()
                .push(logs.iter().map(|log| log.log_id).collect());
            if self.fail_send_logs {
                return Err(ApiError::adapter("comment creation failed mid-batch"));
            }
            Ok(SendLogsResult {
                tracker_issue: tracker_issue.clone(),
                added_comments: logs
                    .iter()
                    .map(|log| TrackerIssueComment {
                        comment_id: format!("tc-{}", log.log_id),
                        author: "tracker-user".to_string(),
                        created_at: Utc.with_ymd_and_hms(2020, 1, 1, 15, 17, 23).unwrap(),
                        body: String::new(),
                        attachments: BTreeMap::new(),
                    })
                    .collect(),
            })
        }

        fn get_tracker_issue_comments(
            &self,
            _issue_id: &str,
            exclude_comments: &[String],
        ) -> Result<Vec<TrackerIssueComment>, ApiError> {
            self.comment_requests
                .borrow_mut()
                .push(exclude_comments.to_vec());
            Ok(self
                .tracker_comments
                .iter()
                .filter(|comment| !exclude_comments.contains(&comment.comment_id))
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakePlatform {
        fail_post_comment: bool,
        tracking_status_calls: RefCell<Vec<(String, String, String, String)>>,
        tracker_updates: RefCell<Vec<(String, String)>>,
        posted_comments: RefCell<Vec<String>>,
        status_updates: RefCell<Vec<(String, String)>>,
    }

    impl PlatformApi for FakePlatform {
        fn test(&self) -> Result<(), ApiError> {
            Ok(())
        }

        fn get_program_reports(
            &self,
            _slug: &str,
            _filters: &[(String, String)],
        ) -> Result<Vec<Report>, ApiError> {
            Ok(Vec::new())
        }

        fn put_report_tracking_status(
            &self,
            _report: &Report,
            status: &str,
            tracker_name: &str,
            issue_id: &str,
            _issue_url: &str,
            comment: &str,
        ) -> Result<(), ApiError> {
            self.tracking_status_calls.borrow_mut().push((
                status.to_string(),
                tracker_name.to_string(),
                issue_id.to_string(),
                comment.to_string(),
            ));
            Ok(())
        }

        fn post_report_tracker_update(
            &self,
            _report: &Report,
            _tracker_name: &str,
            _issue_id: &str,
            _issue_url: &str,
            token: &str,
            comment: &str,
        ) -> Result<(), ApiError> {
            self.tracker_updates
                .borrow_mut()
                .push((token.to_string(), comment.to_string()));
            Ok(())
        }

        fn post_report_comment(
            &self,
            _report: &Report,
            comment: &str,
            _attachments: &[TrackerAttachment],
        ) -> Result<String, ApiError> {
            if self.fail_post_comment {
                return Err(ApiError::adapter("comment rejected"));
            }
            self.posted_comments.borrow_mut().push(comment.to_string());
            Ok("900".to_string())
        }

        fn update_report_status(
            &self,
            _report: &Report,
            status: &str,
            comment: &str,
        ) -> Result<(), ApiError> {
            self.status_updates
                .borrow_mut()
                .push((status.to_string(), comment.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        platform: FakePlatform,
        tracker: FakeTracker,
        synchronize_options: SynchronizeOptions,
        feedback_options: FeedbackOptions,
    }

    impl Fixture {
        fn new(tracker: FakeTracker) -> Self {
            Self {
                platform: FakePlatform::default(),
                tracker,
                synchronize_options: all_options(),
                feedback_options: FeedbackOptions::default(),
            }
        }

        fn run(&self, report: &Report) -> Result<SynchronizeReportResult, SynchronizerError> {
            let synchronizer = ReportSynchronizer {
                yeswehack_client: &self.platform,
                tracker_client: &self.tracker,
                tracker_name: "my-tracker",
                synchronize_options: &self.synchronize_options,
                feedback_options: &self.feedback_options,
                message_formatter: &DefaultSyncMessageFormatter,
            };
            synchronizer.synchronize_report(report)
        }

        fn decoded_token(&self) -> TrackerIssueState {
            let updates = self.platform.tracker_updates.borrow();
            let (token, _) = updates.last().expect("a tracker update");
            bountysync_state::decrypt_lenient(token, "123").expect("decodable state")
        }
    }

    #[test]
    fn first_sync_of_a_new_afi_report_creates_and_tracks() {
        let fixture = Fixture::new(FakeTracker {
            created_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        let result = fixture.run(&report("AFI", Vec::new())).expect("result");
        assert!(!result.is_existing_issue);
        assert!(result.is_created_issue);
        assert!(result.tracking_status_updated);
        assert_eq!(*fixture.tracker.send_report_calls.borrow(), 1);
        assert!(fixture.tracker.sent_log_ids.borrow().is_empty());
        let calls = fixture.platform.tracking_status_calls.borrow();
        assert_eq!(calls.len(), 1);
        let (status, tracker_name, issue_id, comment) = &calls[0];
        assert_eq!(status, "T");
        assert_eq!(tracker_name, "my-tracker");
        assert_eq!(issue_id, "1");
        assert!(comment.contains("Tracked to [MyTracker #1](http://tracker/issue/1)."));
        assert!(fixture.platform.tracker_updates.borrow().is_empty());
    }

    #[test]
    fn second_sync_with_no_activity_writes_nothing() {
        let fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        let result = fixture
            .run(&report("T", vec![tracking_status_log(1, "my-tracker", "1")]))
            .expect("result");
        assert!(result.is_existing_issue);
        assert!(!result.tracking_status_updated);
        assert_eq!(*fixture.tracker.send_report_calls.borrow(), 0);
        assert!(fixture.tracker.sent_log_ids.borrow().is_empty());
        assert!(fixture.platform.tracking_status_calls.borrow().is_empty());
        assert!(fixture.platform.tracker_updates.borrow().is_empty());
    }

    #[test]
    fn incremental_comment_is_sent_and_stamps_a_token() {
        let state = TrackerIssueState {
            closed: false,
            bugtracker_name: Some("my-tracker".to_string()),
            downloaded_comments: Vec::new(),
        };
        let fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        let report = report(
            "T",
            vec![
                comment_log(1, true, "before the cursor"),
                tracking_status_log(2, "my-tracker", "1"),
                tracker_update_log(3, "123", &state),
                comment_log(7, false, "after the cursor"),
            ],
        );
        let result = fixture.run(&report).expect("result");
        assert_eq!(
            *fixture.tracker.sent_log_ids.borrow(),
            vec![vec![7_i64]],
            "only the log after the cursor is replayed"
        );
        assert_eq!(result.issue_added_comments, vec!["tc-7".to_string()]);
        let token_state = fixture.decoded_token();
        assert_eq!(token_state.bugtracker_name.as_deref(), Some("my-tracker"));
        assert_eq!(token_state.downloaded_comments, vec!["tc-7".to_string()]);
        assert!(!token_state.closed);
        assert!(fixture.platform.tracking_status_calls.borrow().is_empty());
    }

    #[test]
    fn existing_issue_with_stale_tracking_status_is_retracked() {
        let fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        let result = fixture
            .run(&report("AFI", vec![tracking_status_log(1, "my-tracker", "1")]))
            .expect("result");
        assert!(result.is_existing_issue);
        assert!(result.tracking_status_updated);
        assert_eq!(fixture.platform.tracking_status_calls.borrow().len(), 1);
    }

    #[test]
    fn a_quiet_second_round_performs_zero_writes() {
        let first = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        first
            .run(&report(
                "T",
                vec![
                    tracking_status_log(1, "my-tracker", "1"),
                    comment_log(2, false, "a comment"),
                ],
            ))
            .expect("first round");
        let (token, _) = first.platform.tracker_updates.borrow().last().expect("token").clone();

        // The platform now carries the tracker-update log; nothing else
        // happened on either side since.
        let mut tracker_update = comment_log(3, true, "sync done");
        tracker_update.kind = LogKind::TrackerUpdate {
            tracker_name: Some("my-tracker".to_string()),
            tracker_url: Some("http://tracker/issue/1".to_string()),
            tracker_id: Some("1".to_string()),
            tracker_token: Some(token),
        };
        let second = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        second
            .run(&report(
                "T",
                vec![
                    tracking_status_log(1, "my-tracker", "1"),
                    comment_log(2, false, "a comment"),
                    tracker_update,
                ],
            ))
            .expect("second round");
        assert!(second.tracker.sent_log_ids.borrow().is_empty());
        assert!(second.platform.tracking_status_calls.borrow().is_empty());
        assert!(second.platform.tracker_updates.borrow().is_empty());
    }

    #[test]
    fn foreign_tracker_tokens_do_not_advance_the_cursor() {
        let foreign_state = TrackerIssueState {
            closed: false,
            bugtracker_name: Some("another-tracker".to_string()),
            downloaded_comments: Vec::new(),
        };
        let fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        let report = report(
            "T",
            vec![
                tracking_status_log(1, "my-tracker", "1"),
                comment_log(2, false, "a comment"),
                tracker_update_log(3, "123", &foreign_state),
            ],
        );
        fixture.run(&report).expect("result");
        assert_eq!(*fixture.tracker.sent_log_ids.borrow(), vec![vec![2_i64]]);
    }

    #[test]
    fn tracker_comment_is_mirrored_back_once() {
        let tracker_comment = TrackerIssueComment {
            comment_id: "c1".to_string(),
            author: "dev".to_string(),
            created_at: Utc.with_ymd_and_hms(2021, 2, 3, 4, 5, 6).unwrap(),
            body: "fixed in main".to_string(),
            attachments: BTreeMap::new(),
        };
        let mut fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            tracker_comments: vec![tracker_comment],
            ..FakeTracker::default()
        });
        fixture.feedback_options.download_tracker_comments = true;
        let result = fixture
            .run(&report("T", vec![tracking_status_log(1, "my-tracker", "1")]))
            .expect("result");
        assert_eq!(result.report_added_comments, vec!["c1".to_string()]);
        let posted = fixture.platform.posted_comments.borrow();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].contains("fixed in main"));
        assert!(posted[0].contains("Comment from MyTracker (dev)"));
        assert_eq!(fixture.decoded_token().downloaded_comments, vec!["c1".to_string()]);
    }

    #[test]
    fn previously_mirrored_comments_are_excluded_from_download() {
        let state = TrackerIssueState {
            closed: false,
            bugtracker_name: Some("my-tracker".to_string()),
            downloaded_comments: vec!["c1".to_string()],
        };
        let tracker_comment = |comment_id: &str| TrackerIssueComment {
            comment_id: comment_id.to_string(),
            author: "dev".to_string(),
            created_at: Utc.with_ymd_and_hms(2021, 2, 3, 4, 5, 6).unwrap(),
            body: "body".to_string(),
            attachments: BTreeMap::new(),
        };
        let mut fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            tracker_comments: vec![tracker_comment("c1"), tracker_comment("c2")],
            ..FakeTracker::default()
        });
        fixture.feedback_options.download_tracker_comments = true;
        let report = report(
            "T",
            vec![
                tracking_status_log(1, "my-tracker", "1"),
                tracker_update_log(2, "123", &state),
            ],
        );
        let result = fixture.run(&report).expect("result");
        assert_eq!(result.report_added_comments, vec!["c2".to_string()]);
        let requests = fixture.tracker.comment_requests.borrow();
        assert_eq!(requests[0], vec!["c1".to_string()]);
        let token_state = fixture.decoded_token();
        assert_eq!(
            token_state.downloaded_comments,
            vec!["c1".to_string(), "c2".to_string()],
            "the new token carries the union"
        );
    }

    #[test]
    fn stale_issue_id_recreates_the_issue() {
        let fixture = Fixture::new(FakeTracker {
            existing_issue: None,
            created_issue: Some(issue("1000", false)),
            ..FakeTracker::default()
        });
        let result = fixture
            .run(&report("T", vec![tracking_status_log(1, "my-tracker", "999")]))
            .expect("result");
        assert!(!result.is_existing_issue);
        assert!(result.is_created_issue);
        assert_eq!(*fixture.tracker.send_report_calls.borrow(), 1);
        let calls = fixture.platform.tracking_status_calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, "1000");
    }

    #[test]
    fn partial_send_failure_leaves_the_cursor_in_place() {
        let fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            fail_send_logs: true,
            ..FakeTracker::default()
        });
        let report = report(
            "T",
            vec![
                tracking_status_log(1, "my-tracker", "1"),
                comment_log(2, false, "one"),
                comment_log(3, false, "two"),
                comment_log(4, false, "three"),
            ],
        );
        let error = fixture.run(&report).expect_err("send failure");
        assert!(matches!(error, SynchronizerError::SendLogs { .. }));
        assert!(
            fixture.platform.tracker_updates.borrow().is_empty(),
            "no state token is written after a failed batch"
        );
    }

    #[test]
    fn private_comments_are_gated_independently() {
        let mut fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        fixture.synchronize_options = SynchronizeOptions {
            upload_public_comments: true,
            ..SynchronizeOptions::default()
        };
        let report = report(
            "T",
            vec![
                tracking_status_log(1, "my-tracker", "1"),
                comment_log(2, true, "private note"),
                comment_log(3, false, "public note"),
            ],
        );
        fixture.run(&report).expect("result");
        assert_eq!(*fixture.tracker.sent_log_ids.borrow(), vec![vec![3_i64]]);
    }

    #[test]
    fn nothing_synchronizable_means_no_tracker_write() {
        let mut fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        fixture.synchronize_options = SynchronizeOptions::default();
        let report = report(
            "T",
            vec![
                tracking_status_log(1, "my-tracker", "1"),
                comment_log(2, false, "a comment nobody wants"),
            ],
        );
        fixture.run(&report).expect("result");
        assert!(fixture.tracker.sent_log_ids.borrow().is_empty());
        assert!(fixture.platform.tracker_updates.borrow().is_empty());
    }

    #[test]
    fn issue_state_transition_is_reported_and_stamped() {
        let state = TrackerIssueState {
            closed: false,
            bugtracker_name: Some("my-tracker".to_string()),
            downloaded_comments: vec!["c1".to_string()],
        };
        let fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", true)),
            ..FakeTracker::default()
        });
        let report = report(
            "T",
            vec![
                tracking_status_log(1, "my-tracker", "1"),
                tracker_update_log(2, "123", &state),
            ],
        );
        fixture.run(&report).expect("result");
        let updates = fixture.platform.tracker_updates.borrow();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].1.contains("Issue state: opened -> closed"));
        drop(updates);
        let token_state = fixture.decoded_token();
        assert!(token_state.closed);
        assert_eq!(token_state.downloaded_comments, vec!["c1".to_string()]);
    }

    #[test]
    fn closed_issue_moves_the_report_to_afv_when_enabled() {
        let state = TrackerIssueState {
            closed: false,
            bugtracker_name: Some("my-tracker".to_string()),
            downloaded_comments: Vec::new(),
        };
        let mut fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", true)),
            ..FakeTracker::default()
        });
        fixture.feedback_options.issue_closed_to_report_afv = true;
        let report = report(
            "T",
            vec![
                tracking_status_log(1, "my-tracker", "1"),
                tracker_update_log(2, "123", &state),
            ],
        );
        let result = fixture.run(&report).expect("result");
        assert_eq!(
            result.new_report_status,
            Some(("accepted".to_string(), "ask_verif".to_string()))
        );
        let status_updates = fixture.platform.status_updates.borrow();
        assert_eq!(status_updates.len(), 1);
        assert_eq!(status_updates[0].0, "ask_verif");
    }

    #[test]
    fn undecodable_tokens_read_as_no_state() {
        let fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            ..FakeTracker::default()
        });
        let mut log = tracker_update_log(
            2,
            // A token written under another report's key.
            "456",
            &TrackerIssueState {
                closed: false,
                bugtracker_name: Some("my-tracker".to_string()),
                downloaded_comments: Vec::new(),
            },
        );
        log.log_id = 2;
        let report = report(
            "T",
            vec![
                tracking_status_log(1, "my-tracker", "1"),
                log,
                comment_log(3, false, "a comment"),
            ],
        );
        fixture.run(&report).expect("result");
        // The foreign-key token is no-state, so the whole log list replays.
        assert_eq!(*fixture.tracker.sent_log_ids.borrow(), vec![vec![3_i64]]);
    }

    #[test]
    fn failed_mirror_posts_are_retried_next_round() {
        let tracker_comment = TrackerIssueComment {
            comment_id: "c1".to_string(),
            author: "dev".to_string(),
            created_at: Utc.with_ymd_and_hms(2021, 2, 3, 4, 5, 6).unwrap(),
            body: "body".to_string(),
            attachments: BTreeMap::new(),
        };
        let mut fixture = Fixture::new(FakeTracker {
            existing_issue: Some(issue("1", false)),
            tracker_comments: vec![tracker_comment],
            ..FakeTracker::default()
        });
        fixture.platform.fail_post_comment = true;
        fixture.feedback_options.download_tracker_comments = true;
        let result = fixture
            .run(&report("T", vec![tracking_status_log(1, "my-tracker", "1")]))
            .expect("result");
        assert!(result.report_added_comments.is_empty());
        assert!(
            fixture.platform.tracker_updates.borrow().is_empty(),
            "a round that mirrored nothing writes no token"
        );
    }
}
