//! Line-per-event rendering of engine progress.

use bountysync::events::{Event, Listener, SendReportOutcome};

/// Prints one line per event to standard output; per-pair failures go to
/// standard error.
#[derive(Debug, Default)]
pub struct CliListener;

impl Listener for CliListener {
    fn on_event(&self, event: &Event) {
        match event {
            Event::SynchronizationStarted => println!("Starting synchronization..."),
            Event::SynchronizationEnded => println!("Synchronization done."),
            Event::FetchReportsStarted { platform, program } => {
                println!("[{platform}/{program}] fetching reports...");
            }
            Event::FetchReportsEnded {
                platform,
                program,
                report_local_ids,
            } => {
                if report_local_ids.is_empty() {
                    println!("[{platform}/{program}] no report to synchronize");
                } else {
                    println!(
                        "[{platform}/{program}] {} report(s): {}",
                        report_local_ids.len(),
                        report_local_ids.join(", ")
                    );
                }
            }
            Event::SendReportStarted {
                platform,
                program,
                tracker,
                report_local_id,
            } => {
                println!("[{platform}/{program}] {report_local_id} -> {tracker}: synchronizing...");
            }
            Event::SendReportEnded {
                platform,
                program,
                tracker,
                report_local_id,
                outcome,
            } => match outcome {
                SendReportOutcome::Synchronized(summary) => {
                    let mut details = vec![
                        if summary.is_created_issue {
                            "issue created".to_string()
                        } else {
                            "issue up to date".to_string()
                        },
                        format!("{} comment(s) added", summary.issue_added_comments),
                    ];
                    if summary.report_added_comments > 0 {
                        details.push(format!(
                            "{} comment(s) mirrored back",
                            summary.report_added_comments
                        ));
                    }
                    if let Some((old, new)) = &summary.new_report_status {
                        details.push(format!("report status {old} -> {new}"));
                    }
                    println!(
                        "[{platform}/{program}] {report_local_id} -> {tracker}: {} ({})",
                        summary.issue_url,
                        details.join(", ")
                    );
                }
                SendReportOutcome::Failed { error } => {
                    eprintln!(
                        "[{platform}/{program}] {report_local_id} -> {tracker}: FAILED\n{error}"
                    );
                }
            },
            Event::TestStarted => println!("Testing configured endpoints..."),
            Event::TestEnded => println!("Endpoint tests done."),
            Event::PlatformTestStarted { platform } => {
                println!("[{platform}] testing platform connection...");
            }
            Event::PlatformTestEnded { platform, error } => match error {
                None => println!("[{platform}] OK"),
                Some(error) => eprintln!("[{platform}] FAILED\n{error}"),
            },
            Event::TrackerTestStarted { tracker } => {
                println!("[{tracker}] testing tracker connection...");
            }
            Event::TrackerTestEnded { tracker, error } => match error {
                None => println!("[{tracker}] OK"),
                Some(error) => eprintln!("[{tracker}] FAILED\n{error}"),
            },
        }
    }
}
