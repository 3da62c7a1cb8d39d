//! Dry connectivity check across every configured endpoint.

use crate::error::error_chain;
use crate::events::{Event, Listener};
use crate::orchestrator::ClientFactory;
use bountysync_config::RootConfiguration;

/// A connectivity test failure.
#[derive(Debug, thiserror::Error)]
pub enum TesterError {
    /// One or more endpoints failed their probe.
    #[error("endpoint test failed for: {}", .names.join(", "))]
    Failures {
        /// Names of the failing endpoints.
        names: Vec<String>,
    },
}

/// Probes every configured platform and tracker without mutating anything.
pub struct Tester<'a> {
    configuration: &'a RootConfiguration,
    clients: &'a dyn ClientFactory,
    listener: &'a dyn Listener,
}

impl<'a> Tester<'a> {
    /// Build a tester over a validated configuration.
    pub fn new(
        configuration: &'a RootConfiguration,
        clients: &'a dyn ClientFactory,
        listener: &'a dyn Listener,
    ) -> Self {
        Self {
            configuration,
            clients,
            listener,
        }
    }

    /// Probe everything, reporting per-endpoint results through events.
    /// Every endpoint is probed even when an earlier one fails.
    pub fn test(&self) -> Result<(), TesterError> {
        self.listener.on_event(&Event::TestStarted);
        let mut failing = Vec::new();
        for (platform_name, platform_configuration) in &self.configuration.yeswehack {
            self.listener.on_event(&Event::PlatformTestStarted {
                platform: platform_name.clone(),
            });
            let error = self
                .clients
                .platform_client(platform_name, platform_configuration)
                .and_then(|client| client.test())
                .err()
                .map(|error| error_chain(&error));
            if error.is_some() {
                failing.push(platform_name.clone());
            }
            self.listener.on_event(&Event::PlatformTestEnded {
                platform: platform_name.clone(),
                error,
            });
        }
        for (tracker_name, tracker_configuration) in &self.configuration.trackers {
            self.listener.on_event(&Event::TrackerTestStarted {
                tracker: tracker_name.clone(),
            });
            let error = self
                .clients
                .tracker_client(tracker_name, tracker_configuration)
                .and_then(|client| client.test())
                .err()
                .map(|error| error_chain(&error));
            if error.is_some() {
                failing.push(tracker_name.clone());
            }
            self.listener.on_event(&Event::TrackerTestEnded {
                tracker: tracker_name.clone(),
                error,
            });
        }
        self.listener.on_event(&Event::TestEnded);
        if failing.is_empty() {
            Ok(())
        } else {
            Err(TesterError::Failures { names: failing })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::platform::PlatformApi;
    use crate::report::{Log, Report};
    use crate::tracker::{
        SendLogsResult, TrackerAttachment, TrackerClient, TrackerIssue, TrackerIssueComment,
    };
    use bountysync_config::{
        GitLabConfiguration, TrackerConfiguration, YesWeHackConfiguration,
    };
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    struct ProbePlatform {
        ok: bool,
    }

    impl PlatformApi for ProbePlatform {
        fn test(&self) -> Result<(), ApiError> {
            if self.ok {
                Ok(())
            } else {
                Err(ApiError::Authentication {
                    context: "bad credentials".to_string(),
                })
            }
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
            _status: &str,
            _tracker_name: &str,
            _issue_id: &str,
            _issue_url: &str,
            _comment: &str,
        ) -> Result<(), ApiError> {
            unreachable!("the tester never mutates")
        }

        fn post_report_tracker_update(
            &self,
            _report: &Report,
            _tracker_name: &str,
            _issue_id: &str,
            _issue_url: &str,
            _token: &str,
            _comment: &str,
        ) -> Result<(), ApiError> {
            unreachable!("the tester never mutates")
        }

        fn post_report_comment(
            &self,
            _report: &Report,
            _comment: &str,
            _attachments: &[TrackerAttachment],
        ) -> Result<String, ApiError> {
            unreachable!("the tester never mutates")
        }

        fn update_report_status(
            &self,
            _report: &Report,
            _status: &str,
            _comment: &str,
        ) -> Result<(), ApiError> {
            unreachable!("the tester never mutates")
        }
    }

    struct ProbeTracker {
        ok: bool,
    }

    impl TrackerClient for ProbeTracker {
        fn tracker_type(&self) -> &'static str {
            "Probe"
        }

        fn test(&self) -> Result<(), ApiError> {
            if self.ok {
                Ok(())
            } else {
                Err(ApiError::Authentication {
                    context: "bad token".to_string(),
                })
            }
        }

        fn get_tracker_issue(&self, _issue_id: &str) -> Result<Option<TrackerIssue>, ApiError> {
            unreachable!("the tester never reads issues")
        }

        fn send_report(&self, _report: &Report) -> Result<TrackerIssue, ApiError> {
            unreachable!("the tester never mutates")
        }

        fn send_logs(
            &self,
            _tracker_issue: &TrackerIssue,
            _logs: &[&Log],
        ) -> Result<SendLogsResult, ApiError> {
            unreachable!("the tester never mutates")
        }

        fn get_tracker_issue_comments(
            &self,
            _issue_id: &str,
            _exclude_comments: &[String],
        ) -> Result<Vec<TrackerIssueComment>, ApiError> {
            unreachable!("the tester never reads comments")
        }
    }

    struct ProbeFactory {
        platform_ok: bool,
        tracker_ok: bool,
    }

    impl ClientFactory for ProbeFactory {
        fn platform_client(
            &self,
            _name: &str,
            _configuration: &YesWeHackConfiguration,
        ) -> Result<Rc<dyn PlatformApi>, ApiError> {
            Ok(Rc::new(ProbePlatform {
                ok: self.platform_ok,
            }))
        }

        fn tracker_client(
            &self,
            _name: &str,
            _configuration: &TrackerConfiguration,
        ) -> Result<Rc<dyn TrackerClient>, ApiError> {
            Ok(Rc::new(ProbeTracker {
                ok: self.tracker_ok,
            }))
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        events: RefCell<Vec<Event>>,
    }

    impl Listener for RecordingListener {
        fn on_event(&self, event: &Event) {
            self.events.borrow_mut().push(event.clone());
        }
    }

    fn configuration() -> RootConfiguration {
        RootConfiguration {
            trackers: BTreeMap::from([(
                "gl".to_string(),
                TrackerConfiguration::Gitlab(GitLabConfiguration {
                    url: "https://gitlab.example.com".to_string(),
                    token: "t".to_string(),
                    project: "g/p".to_string(),
                    verify: true,
                    confidential: false,
                }),
            )]),
            yeswehack: BTreeMap::from([(
                "ywh".to_string(),
                YesWeHackConfiguration::default(),
            )]),
        }
    }

    #[test]
    fn all_endpoints_passing_is_a_success() {
        let factory = ProbeFactory {
            platform_ok: true,
            tracker_ok: true,
        };
        let listener = RecordingListener::default();
        Tester::new(&configuration(), &factory, &listener)
            .test()
            .expect("all endpoints pass");
        let events = listener.events.borrow();
        assert!(matches!(events.first(), Some(Event::TestStarted)));
        assert!(matches!(events.last(), Some(Event::TestEnded)));
    }

    #[test]
    fn failing_endpoints_are_all_reported() {
        let factory = ProbeFactory {
            platform_ok: false,
            tracker_ok: false,
        };
        let listener = RecordingListener::default();
        let error = Tester::new(&configuration(), &factory, &listener)
            .test()
            .expect_err("both endpoints fail");
        let TesterError::Failures { names } = error;
        assert_eq!(names, vec!["ywh".to_string(), "gl".to_string()]);
        let events = listener.events.borrow();
        let errors: Vec<bool> = events
            .iter()
            .filter_map(|event| match event {
                Event::PlatformTestEnded { error, .. }
                | Event::TrackerTestEnded { error, .. } => Some(error.is_some()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![true, true]);
    }
}
