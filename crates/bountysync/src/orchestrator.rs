//! Orchestration of a whole synchronization run: platforms, programs,
//! reports and target trackers.

use crate::error::{ApiError, error_chain};
use crate::events::{Event, Listener, ReportSyncSummary, SendReportOutcome};
use crate::platform::{PlatformApi, PlatformClient};
use crate::report::Report;
use crate::synchronizer::{
    DefaultSyncMessageFormatter, ReportSynchronizer, SynchronizerError, TRACKED_STATUS,
};
use crate::tracker::TrackerClient;
use crate::trackers::{
    GitHubTrackerClient, GitLabTrackerClient, JiraTrackerClient, ServiceNowTrackerClient,
};
use bountysync_config::{Program, RootConfiguration, TrackerConfiguration, YesWeHackConfiguration};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Tracking status of reports awaiting their first synchronization.
pub const AFI_STATUS: &str = "AFI";

/// Builds and caches clients for the endpoints of one run. Sessions are
/// shared across the run and authenticated lazily on first use.
pub trait ClientFactory {
    /// Client for a platform configuration.
    fn platform_client(
        &self,
        name: &str,
        configuration: &YesWeHackConfiguration,
    ) -> Result<Rc<dyn PlatformApi>, ApiError>;

    /// Client for a tracker configuration.
    fn tracker_client(
        &self,
        name: &str,
        configuration: &TrackerConfiguration,
    ) -> Result<Rc<dyn TrackerClient>, ApiError>;
}

/// The production factory: the `type` tag of a tracker configuration
/// selects the adapter.
#[derive(Default)]
pub struct DefaultClientFactory {
    platform_cache: RefCell<BTreeMap<String, Rc<dyn PlatformApi>>>,
    tracker_cache: RefCell<BTreeMap<String, Rc<dyn TrackerClient>>>,
}

impl ClientFactory for DefaultClientFactory {
    fn platform_client(
        &self,
        name: &str,
        configuration: &YesWeHackConfiguration,
    ) -> Result<Rc<dyn PlatformApi>, ApiError> {
        if let Some(client) = self.platform_cache.borrow().get(name) {
            return Ok(client.clone());
        }
        let client: Rc<dyn PlatformApi> = Rc::new(PlatformClient::new(configuration)?);
        self.platform_cache
            .borrow_mut()
            .insert(name.to_string(), client.clone());
        Ok(client)
    }

    fn tracker_client(
        &self,
        name: &str,
        configuration: &TrackerConfiguration,
    ) -> Result<Rc<dyn TrackerClient>, ApiError> {
        if let Some(client) = self.tracker_cache.borrow().get(name) {
            return Ok(client.clone());
        }
        let client: Rc<dyn TrackerClient> = match configuration {
            TrackerConfiguration::Github(github) => Rc::new(GitHubTrackerClient::new(github)?),
            TrackerConfiguration::Gitlab(gitlab) => Rc::new(GitLabTrackerClient::new(gitlab)?),
            TrackerConfiguration::Jira(jira) => Rc::new(JiraTrackerClient::new(jira)?),
            TrackerConfiguration::Servicenow(servicenow) => {
                Rc::new(ServiceNowTrackerClient::new(servicenow)?)
            }
        };
        self.tracker_cache
            .borrow_mut()
            .insert(name.to_string(), client.clone());
        Ok(client)
    }
}

/// Drives synchronization for every configured platform, program, report
/// and target tracker.
pub struct Synchronizer<'a> {
    configuration: &'a RootConfiguration,
    clients: &'a dyn ClientFactory,
    listener: &'a dyn Listener,
    message_formatter: DefaultSyncMessageFormatter,
}

impl<'a> Synchronizer<'a> {
    /// Build a synchronizer over a validated configuration.
    pub fn new(
        configuration: &'a RootConfiguration,
        clients: &'a dyn ClientFactory,
        listener: &'a dyn Listener,
    ) -> Self {
        Self {
            configuration,
            clients,
            listener,
            message_formatter: DefaultSyncMessageFormatter,
        }
    }

    /// Run one full synchronization. Per-pair failures surface as events
    /// and do not abort the run; platform-level failures do.
    pub fn synchronize(&self) -> Result<(), SynchronizerError> {
        self.listener.on_event(&Event::SynchronizationStarted);
        for (platform_name, platform_configuration) in &self.configuration.yeswehack {
            self.synchronize_platform(platform_name, platform_configuration)?;
        }
        self.listener.on_event(&Event::SynchronizationEnded);
        Ok(())
    }

    fn synchronize_platform(
        &self,
        platform_name: &str,
        platform_configuration: &YesWeHackConfiguration,
    ) -> Result<(), SynchronizerError> {
        let platform_client = self
            .clients
            .platform_client(platform_name, platform_configuration)
            .map_err(|source| SynchronizerError::Client {
                name: platform_name.to_string(),
                source,
            })?;
        for program in &platform_configuration.programs {
            self.listener.on_event(&Event::FetchReportsStarted {
                platform: platform_name.to_string(),
                program: program.slug.clone(),
            });
            let reports = self.fetch_reports(platform_client.as_ref(), program)?;
            self.listener.on_event(&Event::FetchReportsEnded {
                platform: platform_name.to_string(),
                program: program.slug.clone(),
                report_local_ids: reports
                    .iter()
                    .map(|report| report.local_id.clone())
                    .collect(),
            });
            for report in &reports {
                self.synchronize_report(platform_name, platform_client.as_ref(), program, report)?;
            }
        }
        Ok(())
    }

    /// Already-tracked reports are only refetched when some flag keeps
    /// them moving, saving a detail request per tracked report otherwise.
    fn fetch_reports(
        &self,
        platform_client: &dyn PlatformApi,
        program: &Program,
    ) -> Result<Vec<Report>, SynchronizerError> {
        let mut filters = vec![(
            "filter[trackingStatus][0]".to_string(),
            AFI_STATUS.to_string(),
        )];
        let include_tracked = program.synchronize_options.any_continuous()
            || program.feedback_options.any_continuous();
        if include_tracked {
            filters.push((
                "filter[trackingStatus][1]".to_string(),
                TRACKED_STATUS.to_string(),
            ));
        }
        platform_client
            .get_program_reports(&program.slug, &filters)
            .map_err(|source| SynchronizerError::FetchReports {
                slug: program.slug.clone(),
                source,
            })
    }

    fn synchronize_report(
        &self,
        platform_name: &str,
        platform_client: &dyn PlatformApi,
        program: &Program,
        report: &Report,
    ) -> Result<(), SynchronizerError> {
        for tracker_name in &program.bugtrackers_name {
            // Validation guarantees the name resolves; a program edited
            // behind our back is skipped rather than crashed on.
            let Some(tracker_configuration) = self.configuration.trackers.get(tracker_name)
            else {
                continue;
            };
            self.listener.on_event(&Event::SendReportStarted {
                platform: platform_name.to_string(),
                program: program.slug.clone(),
                tracker: tracker_name.clone(),
                report_local_id: report.local_id.clone(),
            });
            let outcome = match self.clients.tracker_client(tracker_name, tracker_configuration)
            {
                Ok(tracker_client) => {
                    let synchronizer = ReportSynchronizer {
                        yeswehack_client: platform_client,
                        tracker_client: tracker_client.as_ref(),
                        tracker_name,
                        synchronize_options: &program.synchronize_options,
                        feedback_options: &program.feedback_options,
                        message_formatter: &self.message_formatter,
                    };
                    match synchronizer.synchronize_report(report) {
                        Ok(result) => {
                            SendReportOutcome::Synchronized(ReportSyncSummary::from(&result))
                        }
                        Err(error) => SendReportOutcome::Failed {
                            error: error_chain(&error),
                        },
                    }
                }
                Err(error) => SendReportOutcome::Failed {
                    error: error_chain(&error),
                },
            };
            self.listener.on_event(&Event::SendReportEnded {
                platform: platform_name.to_string(),
                program: program.slug.clone(),
                tracker: tracker_name.clone(),
                report_local_id: report.local_id.clone(),
                outcome,
            });
        }
        Ok(())
    }
}
