//! Stopping and starting the services a job depends on.

use crate::backup::process::{Invocation, ProcessResult, ProcessRunner};
use crate::backup::run_log::{attach_if_long, Attachments, RunLog};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::warn;

/// How a service is managed on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceBackend {
    /// Init-script managed, driven through `service`.
    System,
    #[serde(rename = "docker", alias = "container")]
    Container,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
        }
    }
}

impl Display for ServiceAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServiceBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceBackend::System => "system",
            ServiceBackend::Container => "docker",
        }
    }

    /// Shell command applying `action` to the service `name`.
    pub fn command(&self, name: &str, action: ServiceAction) -> String {
        match self {
            ServiceBackend::System => format!("service {name} {action}"),
            ServiceBackend::Container => format!("docker {action} {name}"),
        }
    }
}

impl Display for ServiceBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one start or stop pass over all configured services.
#[derive(Debug, Default)]
pub struct ServiceReport {
    pub attachments: Attachments,
    pub failed: Vec<String>,
}

/// Apply `action` to every configured service.
///
/// One service failing does not stop the others from being attempted.
pub fn apply_services<R: ProcessRunner + ?Sized>(
    runner: &R,
    services: &BTreeMap<ServiceBackend, Vec<String>>,
    action: ServiceAction,
    timeout: Option<Duration>,
    max_lines: usize,
    log: &mut RunLog,
) -> ServiceReport {
    let mut report = ServiceReport::default();
    for (backend, names) in services {
        for name in names {
            let command = backend.command(name, action);
            log.add(format!("{backend} service {name} ({action}) \"{command}\":\n"), true);
            let invocation = Invocation::builder()
                .command(command)
                .maybe_timeout(timeout)
                .build();
            let result = runner.run(&invocation).unwrap_or_else(|e| {
                warn!("Could not {action} {backend} service {name}: {e}");
                ProcessResult::new(-1, e.to_string())
            });
            log.add_result(&result, max_lines);
            attach_if_long(
                &mut report.attachments,
                format!("{name}_{action}.txt"),
                result.output(),
                max_lines,
            );
            if !result.success() {
                warn!(
                    "Failed to {action} {backend} service {name}, exit code {}",
                    result.exit_code()
                );
                report.failed.push(name.clone());
            }
        }
    }

    report
}
