//! Runs configured jobs through the fixed backup pipeline and reports by email.

use crate::backup::backup_config::JobConfig;
use crate::backup::borg::{archive_name, Borg, Step};
use crate::backup::hooks::{run_hook, HookName};
use crate::backup::notifications::Notification;
use crate::backup::permissions::PermissionLock;
use crate::backup::process::ProcessRunner;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::run_log::{Attachments, RunLog};
use crate::backup::services::{apply_services, ServiceAction};
use crate::backup::text::{header, HEADER_WIDTH, LOG_LEN};
use bon::Builder;
use chrono::Local;
use itertools::Itertools;
use std::fmt::Display;
use std::result;
use tracing::{error, info, warn};

/// Terminal state of one job run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobOutcome {
    pub ok: bool,
    pub failed_at: Option<Step>,
}

impl JobOutcome {
    fn from_failure(failed_at: Option<Step>) -> Self {
        Self {
            ok: failed_at.is_none(),
            failed_at,
        }
    }
}

#[derive(Builder)]
pub struct Orchestrator<'a, R: ProcessRunner, N: Notification> {
    runner: &'a R,
    notifier: &'a N,
    /// Shaping threshold for the report body.
    #[builder(default = LOG_LEN)]
    max_lines: usize,
}

/// Report and attachments of the phase currently running.
struct Report {
    log: RunLog,
    attachments: Attachments,
}

/// Steps a job will run, in order, as listed in the start email.
pub fn planned_steps(job: &JobConfig) -> Vec<String> {
    let mut steps = Vec::new();
    let hook = |steps: &mut Vec<String>, hook: HookName| {
        if !job.hook(hook).is_empty() {
            steps.push(format!("Run {} {hook} command(s)", job.hook(hook).len()));
        }
    };
    let services = job.services().values().flatten().join(", ");

    hook(&mut steps, HookName::PreStop);
    if job.has_services() {
        steps.push(format!("Stop services: {services}"));
    }
    hook(&mut steps, HookName::PostStop);
    if job.lock_permissions() {
        steps.push("Make backed up paths read-only".to_string());
    }
    steps.push(format!("Initialize or open repository {}", job.repo()));
    steps.push(format!(
        "Create archive of {}",
        job.paths().iter().map(|p| p.display()).join(", ")
    ));
    if job.lock_permissions() {
        steps.push("Restore permissions".to_string());
    }
    hook(&mut steps, HookName::PreStart);
    if job.has_services() {
        steps.push(format!("Start services: {services}"));
    }
    hook(&mut steps, HookName::PostStart);
    if let Some(policy) = job.keep() {
        steps.push(format!("Prune repository ({policy})"));
        steps.push("Compact repository".to_string());
    }
    steps
}

impl<R: ProcessRunner, N: Notification> Orchestrator<'_, R, N> {
    /// Run one job from start to final notification.
    ///
    /// Command failures never surface as `Err`. Fatal steps end up in
    /// [`JobOutcome::failed_at`], everything else is only reported.
    pub fn run_job(&self, name: &str, job: &JobConfig) -> JobOutcome {
        info!("Starting backup job {name}");
        let mut report = Report {
            log: RunLog::new(),
            attachments: Attachments::new(),
        };

        report.log.add(format!("Backup job {name} will run these steps:\n"), true);
        for (index, step) in planned_steps(job).iter().enumerate() {
            report.log.add(format!("{}. {step}\n", index + 1), true);
        }
        self.flush(job, format!("Backup {name} started"), &mut report);

        self.hook(job, HookName::PreStop, &mut report);
        self.services(job, ServiceAction::Stop, &mut report);
        self.hook(job, HookName::PostStop, &mut report);

        let borg = Borg::builder()
            .runner(self.runner)
            .repo(job.repo().as_str())
            .passphrase(job.pass())
            .maybe_timeout(job.timeout())
            .max_lines(self.max_lines)
            .build();
        let mut failed_at = self.backup(name, job, &borg, &mut report).err();

        if failed_at.is_none() {
            self.hook(job, HookName::PreStart, &mut report);
        } else if !job.hook(HookName::PreStart).is_empty() {
            report.log.add("Backup failed, skipping pre_start commands.\n\n", true);
        }
        if failed_at.is_none() || job.restart_services_on_failure() {
            self.services(job, ServiceAction::Start, &mut report);
        } else if job.has_services() {
            report.log.add("Backup failed, leaving services stopped.\n\n", true);
        }
        if failed_at.is_none() {
            self.hook(job, HookName::PostStart, &mut report);
        } else if !job.hook(HookName::PostStart).is_empty() {
            report.log.add("Backup failed, skipping post_start commands.\n\n", true);
        }

        if let (Some(policy), None) = (job.keep(), failed_at) {
            report.log.add("Backup phase finished, retention follows.\n", true);
            self.flush(job, format!("Backup {name} finished backup phase"), &mut report);

            let retention = borg
                .prune(policy, &mut report.log, &mut report.attachments)
                .and_then(|_| borg.compact(&mut report.log, &mut report.attachments));
            if let Err(step) = retention {
                if job.prune_failure_is_fatal() {
                    failed_at = Some(step);
                } else {
                    report.log.add(format!("Warning: {step} failed.\n\n"), true);
                }
            }
        }

        let outcome = JobOutcome::from_failure(failed_at);
        match outcome.failed_at {
            None => {
                info!("Backup job {name} finished");
                report.log.add(format!("Backup job {name} finished.\n"), true);
                self.flush(job, format!("Backup {name} finished"), &mut report);
            }
            Some(step) => {
                error!("Backup job {name} failed at {step}");
                report.log.add(format!("Backup job {name} failed at {step}.\n"), true);
                self.flush(job, format!("Backup {name} failed"), &mut report);
            }
        }
        outcome
    }

    /// Repository and archive, with the optional permission lock around them.
    fn backup(
        &self,
        name: &str,
        job: &JobConfig,
        borg: &Borg<'_, R>,
        report: &mut Report,
    ) -> result::Result<(), Step> {
        let mut lock = PermissionLock::new();
        if job.lock_permissions() {
            report.log.add(format!("{}\n\n", header("Locking permissions", HEADER_WIDTH)), true);
            match lock.lock_paths(job.paths()) {
                Ok(locked) => report.log.add(format!("Made {locked} entries read-only.\n\n"), true),
                Err(e) => {
                    warn!("Locking permissions for job {name} was incomplete: {e}");
                    report.log.add(
                        format!("Made {} entries read-only, with errors:\n{e}\n\n", lock.len()),
                        true,
                    );
                }
            }
        }

        let result = borg
            .ensure_repo(job.encryption(), &mut report.log, &mut report.attachments)
            .and_then(|_| {
                borg.create(
                    &archive_name(Local::now()),
                    job.paths(),
                    &mut report.log,
                    &mut report.attachments,
                )
            });

        if job.lock_permissions() {
            match lock.restore() {
                Ok(restored) => {
                    report.log.add(format!("Restored permissions of {restored} entries.\n\n"), true)
                }
                Err(e) => {
                    error!("Restoring permissions for job {name} failed: {e}");
                    report.log.add(format!("Restoring permissions failed:\n{e}\n\n"), true);
                }
            }
        }
        result
    }

    fn hook(&self, job: &JobConfig, hook: HookName, report: &mut Report) {
        let hook_report = run_hook(
            self.runner,
            hook,
            job.hook(hook),
            job.timeout(),
            self.max_lines,
            &mut report.log,
        );
        if hook_report.failed > 0 {
            warn!("{} {hook} command(s) failed", hook_report.failed);
            report
                .log
                .add(format!("{} {hook} command(s) failed.\n\n", hook_report.failed), true);
        }
        report.attachments.extend(hook_report.attachments);
    }

    fn services(&self, job: &JobConfig, action: ServiceAction, report: &mut Report) {
        if !job.has_services() {
            return;
        }
        let title = match action {
            ServiceAction::Stop => "Stopping services",
            ServiceAction::Start => "Starting services",
        };
        report.log.add(format!("{}\n\n", header(title, HEADER_WIDTH)), true);
        let service_report = apply_services(
            self.runner,
            job.services(),
            action,
            job.timeout(),
            self.max_lines,
            &mut report.log,
        );
        if !service_report.failed.is_empty() {
            report.log.add(
                format!(
                    "Could not {action} service(s): {}\n\n",
                    service_report.failed.iter().join(", ")
                ),
                true,
            );
        }
        report.attachments.extend(service_report.attachments);
    }

    /// Email the buffered report and start a fresh one. Send failures are only logged.
    fn flush<S: Display>(&self, job: &JobConfig, subject: S, report: &mut Report) {
        let body = report.log.take();
        let attachments = std::mem::take(&mut report.attachments);
        if let Err(e) = self.notifier.send(job.email(), &subject, body, &attachments) {
            error!("Sending \"{subject}\" to {} failed: {e}", job.email());
            report.log.add(format!("Sending \"{subject}\" failed:\n{e}\n\n"), false);
        }
    }
}

/// The first failed job of `outcomes` as an [`Error::JobFailed`].
pub fn check_outcomes(outcomes: &[(String, JobOutcome)]) -> Result<()> {
    match outcomes
        .iter()
        .find_map(|(name, outcome)| outcome.failed_at.map(|step| (name, step)))
    {
        Some((job, step)) => Err(Error::JobFailed {
            job: job.clone(),
            step,
        }),
        None => Ok(()),
    }
}

/// Run `jobs` in order, stopping after the first one that fails.
pub fn run_all<'j, R, N, I>(orchestrator: &Orchestrator<'_, R, N>, jobs: I) -> Vec<(String, JobOutcome)>
where
    R: ProcessRunner,
    N: Notification,
    I: IntoIterator<Item = (&'j String, &'j JobConfig)>,
{
    let mut outcomes = Vec::new();
    for (name, job) in jobs {
        let outcome = orchestrator.run_job(name, job);
        outcomes.push((name.clone(), outcome));
        if !outcome.ok {
            warn!("Skipping remaining jobs after {name} failed");
            break;
        }
    }
    outcomes
}
