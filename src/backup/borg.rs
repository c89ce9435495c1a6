//! Driving the `borg` command line for one job.
//!
//! The repository passphrase is handed to each borg child through its own
//! environment. It is never written to the environment of this process, so
//! nothing is left behind for later jobs when a step fails.

use crate::backup::process::{Invocation, ProcessResult, ProcessRunner};
use crate::backup::redacted::RedactedString;
use crate::backup::retention::RetentionPolicy;
use crate::backup::run_log::{attach_if_long, Attachments, RunLog};
use crate::backup::text::{cap_bytes, header, shell_quote, shorten, HEADER_WIDTH, LOG_LEN, MAX_ATTACHMENT_BYTES};
use bon::Builder;
use chrono::{DateTime, Local};
use derive_more::Display;
use itertools::Itertools;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

pub const PASSPHRASE_ENV: &str = "BORG_PASSPHRASE";
/// Printed by `borg init` when the target already holds a repository.
pub const REPO_EXISTS_MARKER: &str = "A repository already exists at";
/// Separator borg prints in front of the `--stats` summary.
pub const STATS_BANNER: &str =
    "------------------------------------------------------------------------------";

/// Steps whose failure ends a job.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Step {
    #[display("repository init")]
    Init,
    #[display("key export")]
    KeyExport,
    #[display("archive create")]
    Create,
    #[display("prune")]
    Prune,
    #[display("compact")]
    Compact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepoState {
    Created,
    Existing,
}

/// Borg commands against a single repository.
#[derive(Builder)]
pub struct Borg<'a, R: ProcessRunner> {
    runner: &'a R,
    #[builder(into)]
    repo: String,
    passphrase: &'a RedactedString,
    timeout: Option<Duration>,
    #[builder(default = LOG_LEN)]
    max_lines: usize,
}

/// Archive names are the local start time, without spaces.
pub fn archive_name(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string().replace(' ', "_")
}

/// The `--stats` summary at the end of `borg create` output.
pub fn stats_block(output: &str) -> Option<&str> {
    output.find(STATS_BANNER).map(|start| output[start..].trim_end())
}

impl<R: ProcessRunner> Borg<'_, R> {
    fn run(&self, args: &str, echo: bool) -> Result<ProcessResult, String> {
        let invocation = Invocation::builder()
            .command(format!("borg {args}"))
            .echo(echo)
            .env(vec![(PASSPHRASE_ENV.to_string(), self.passphrase.clone())])
            .maybe_timeout(self.timeout)
            .build();
        self.runner.run(&invocation).map_err(|e| {
            error!("borg {args} could not run: {e}");
            e.to_string()
        })
    }

    /// Create the repository, or accept the one that is already there.
    ///
    /// A freshly created repository has its key exported into `attachments`.
    /// Failing to export that key is fatal.
    pub fn ensure_repo(
        &self,
        encryption: &str,
        log: &mut RunLog,
        attachments: &mut Attachments,
    ) -> Result<RepoState, Step> {
        let repo = shell_quote(&self.repo);
        log.add(format!("{}\n\n", header("Repository", HEADER_WIDTH)), true);
        log.add(format!("Initializing repository {}:\n", self.repo), true);
        let init = match self.run(&format!("init --encryption {} {repo}", shell_quote(encryption)), true) {
            Ok(init) => init,
            Err(e) => {
                log.add(format!("Error: {e}\nStopping now!\n\n"), true);
                return Err(Step::Init);
            }
        };
        log.add_result(&init, self.max_lines);

        if init.success() {
            info!("Created repository {}", self.repo);
            log.add("Repository created, exporting key:\n", true);
            return match self.run(&format!("key export {repo}"), false) {
                Ok(export) if export.success() => {
                    attachments.insert("borg_key.txt".to_string(), export.output().clone());
                    log.add("Key exported to borg_key.txt, store it somewhere safe!\n\n", true);
                    Ok(RepoState::Created)
                }
                Ok(export) => {
                    error!("Key export of new repository {} failed", self.repo);
                    log.add_result(&export, self.max_lines);
                    log.add("Key export failed. Stopping now!\n\n", true);
                    Err(Step::KeyExport)
                }
                Err(e) => {
                    log.add(format!("Error: {e}\nKey export failed. Stopping now!\n\n"), true);
                    Err(Step::KeyExport)
                }
            };
        }

        if init.output().contains(REPO_EXISTS_MARKER) {
            info!("Using existing repository {}", self.repo);
            log.add("Repository already exists, continuing.\n\n", true);
            return Ok(RepoState::Existing);
        }

        error!("borg init failed with exit code {}", init.exit_code());
        log.add("Repository unusable. Stopping now!\n\n", true);
        Err(Step::Init)
    }

    /// Create one archive of `paths`. The full output is attached as `borg_create.txt`.
    pub fn create(
        &self,
        archive: &str,
        paths: &[PathBuf],
        log: &mut RunLog,
        attachments: &mut Attachments,
    ) -> Result<(), Step> {
        let paths = paths
            .iter()
            .map(|p| shell_quote(&p.to_string_lossy()))
            .join(" ");
        let target = shell_quote(&format!("{}::{archive}", self.repo));
        log.add(format!("{}\n\n", header("Running borg", HEADER_WIDTH)), true);
        log.add(format!("Creating archive {archive}:\n"), true);
        let created = match self.run(
            &format!("create --stats --verbose --info --progress {target} {paths}"),
            true,
        ) {
            Ok(created) => created,
            Err(e) => {
                log.add(format!("Error: {e}\nStopping now!\n\n"), true);
                return Err(Step::Create);
            }
        };

        attachments.insert(
            "borg_create.txt".to_string(),
            cap_bytes(created.output(), MAX_ATTACHMENT_BYTES),
        );
        let summary = stats_block(created.output())
            .map(str::to_string)
            .unwrap_or_else(|| shorten(created.output().trim_end(), self.max_lines));
        log.add(format!("{summary}\n"), false);
        log.add(format!("Return code: {}\n\n", created.exit_code()), true);

        if created.success() {
            info!("Created archive {archive}");
            Ok(())
        } else {
            error!("borg create failed with exit code {}", created.exit_code());
            log.add("Backup failed. Stopping now!\n\n", true);
            Err(Step::Create)
        }
    }

    pub fn prune(
        &self,
        policy: &RetentionPolicy,
        log: &mut RunLog,
        attachments: &mut Attachments,
    ) -> Result<(), Step> {
        log.add(format!("{}\n\n", header("Pruning", HEADER_WIDTH)), true);
        log.add(format!("Pruning repository ({policy}):\n"), true);
        let args = format!(
            "prune --stats --verbose --info --progress {} {}",
            policy.prune_flags().join(" "),
            shell_quote(&self.repo)
        );
        self.maintenance(&args, "borg_prune.txt", Step::Prune, log, attachments)
    }

    pub fn compact(&self, log: &mut RunLog, attachments: &mut Attachments) -> Result<(), Step> {
        log.add(format!("{}\n\n", header("Compacting", HEADER_WIDTH)), true);
        log.add("Compacting repository:\n", true);
        let args = format!("compact --progress --verbose {}", shell_quote(&self.repo));
        self.maintenance(&args, "borg_compact.txt", Step::Compact, log, attachments)
    }

    fn maintenance(
        &self,
        args: &str,
        attachment: &str,
        step: Step,
        log: &mut RunLog,
        attachments: &mut Attachments,
    ) -> Result<(), Step> {
        let result = match self.run(args, true) {
            Ok(result) => result,
            Err(e) => {
                log.add(format!("Error: {e}\n\n"), true);
                return Err(step);
            }
        };
        log.add_result(&result, self.max_lines);
        attach_if_long(attachments, attachment.to_string(), result.output(), self.max_lines);
        if result.success() {
            Ok(())
        } else {
            warn!("borg {step} failed with exit code {}", result.exit_code());
            Err(step)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::process::fake::ScriptedRunner;
    use crate::backup::result_error::error::Error;
    use crate::backup::retention::PeriodicRetention;
    use chrono::TimeZone;

    fn borg<'a>(runner: &'a ScriptedRunner, pass: &'a RedactedString) -> Borg<'a, ScriptedRunner> {
        Borg::builder().runner(runner).repo("/mnt/backup/repo").passphrase(pass).build()
    }

    #[test]
    fn test_archive_name_has_no_spaces() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 4, 5, 6).unwrap();
        assert_eq!(archive_name(now), "2024-03-09_04:05:06");
    }

    #[test]
    fn test_stats_block() {
        let output = format!(
            "A /srv/a\nA /srv/b\n{STATS_BANNER}\nArchive name: x\nNumber of files: 2\n{STATS_BANNER}\n"
        );
        let stats = stats_block(&output).unwrap();

        assert!(stats.starts_with(STATS_BANNER));
        assert!(stats.contains("Number of files: 2"));
        assert!(!stats.contains("A /srv/a"));
        assert!(stats_block("no stats here").is_none());
    }

    #[test]
    fn test_ensure_repo_created_exports_key() {
        let runner = ScriptedRunner::new().on("key export", ProcessResult::new(0, "BORG_KEY abc"));
        let pass = RedactedString::from("hunter2");
        let mut log = RunLog::new();
        let mut attachments = Attachments::new();

        let state = borg(&runner, &pass).ensure_repo("repokey-blake2", &mut log, &mut attachments);

        assert_eq!(state, Ok(RepoState::Created));
        assert_eq!(
            runner.commands(),
            vec![
                "borg init --encryption repokey-blake2 /mnt/backup/repo",
                "borg key export /mnt/backup/repo",
            ]
        );
        assert_eq!(attachments["borg_key.txt"], "BORG_KEY abc");
        assert!(!log.get().contains("BORG_KEY abc"));
    }

    #[test]
    fn test_ensure_repo_key_export_failure_is_fatal() {
        let runner = ScriptedRunner::new().on("key export", ProcessResult::new(2, "error"));
        let pass = RedactedString::from("hunter2");

        let state = borg(&runner, &pass).ensure_repo(
            "repokey",
            &mut RunLog::new(),
            &mut Attachments::new(),
        );

        assert_eq!(state, Err(Step::KeyExport));
    }

    #[test]
    fn test_ensure_repo_existing_is_not_an_error() {
        let runner = ScriptedRunner::new().on(
            "init",
            ProcessResult::new(2, "A repository already exists at /mnt/backup/repo."),
        );
        let pass = RedactedString::from("hunter2");
        let mut attachments = Attachments::new();

        let state = borg(&runner, &pass).ensure_repo("repokey", &mut RunLog::new(), &mut attachments);

        assert_eq!(state, Ok(RepoState::Existing));
        assert_eq!(runner.commands().len(), 1);
        assert!(attachments.is_empty());
    }

    #[test]
    fn test_ensure_repo_other_failure_is_fatal() {
        let runner = ScriptedRunner::new().on("init", ProcessResult::new(2, "Permission denied"));
        let pass = RedactedString::from("hunter2");

        let state = borg(&runner, &pass).ensure_repo(
            "repokey",
            &mut RunLog::new(),
            &mut Attachments::new(),
        );

        assert_eq!(state, Err(Step::Init));
    }

    #[test]
    fn test_create_attaches_output_and_logs_stats_only() {
        let output = format!("A /srv/a\nA /srv/b\n{STATS_BANNER}\nDeduplicated size: 1 MB\n");
        let runner = ScriptedRunner::new().on("create", ProcessResult::new(0, output.clone()));
        let pass = RedactedString::from("hunter2");
        let mut log = RunLog::new();
        let mut attachments = Attachments::new();

        let result = borg(&runner, &pass).create(
            "2024-03-09_04:05:06",
            &[PathBuf::from("/srv/a"), PathBuf::from("/srv/my docs")],
            &mut log,
            &mut attachments,
        );

        assert_eq!(result, Ok(()));
        let calls = runner.calls();
        assert_eq!(
            calls[0].command,
            "borg create --stats --verbose --info --progress /mnt/backup/repo::2024-03-09_04:05:06 /srv/a '/srv/my docs'"
        );
        assert!(calls[0].echo);
        assert_eq!(calls[0].env, vec![(PASSPHRASE_ENV.to_string(), "hunter2".to_string())]);
        assert_eq!(attachments["borg_create.txt"], output);
        assert!(log.get().contains("Deduplicated size: 1 MB"));
        assert!(!log.get().contains("A /srv/a"));
    }

    #[test]
    fn test_create_failure_is_fatal() {
        let runner = ScriptedRunner::new().on("create", ProcessResult::new(2, "Repository does not exist"));
        let pass = RedactedString::from("hunter2");
        let mut attachments = Attachments::new();

        let result = borg(&runner, &pass).create(
            "a",
            &[PathBuf::from("/srv")],
            &mut RunLog::new(),
            &mut attachments,
        );

        assert_eq!(result, Err(Step::Create));
        assert!(attachments.contains_key("borg_create.txt"));
    }

    #[test]
    fn test_prune_and_compact_commands() {
        let runner = ScriptedRunner::new().on("compact", ProcessResult::new(1, "lock timeout"));
        let pass = RedactedString::from("hunter2");
        let borg = borg(&runner, &pass);
        let mut log = RunLog::new();
        let mut attachments = Attachments::new();
        let policy = RetentionPolicy::Periodic(PeriodicRetention {
            daily: 3,
            monthly: 1,
            ..Default::default()
        });

        assert_eq!(borg.prune(&policy, &mut log, &mut attachments), Ok(()));
        assert_eq!(borg.compact(&mut log, &mut attachments), Err(Step::Compact));
        assert_eq!(
            runner.commands(),
            vec![
                "borg prune --stats --verbose --info --progress --keep-daily 3 --keep-monthly 1 /mnt/backup/repo",
                "borg compact --progress --verbose /mnt/backup/repo",
            ]
        );
    }

    #[test]
    fn test_passphrase_never_reaches_process_env() {
        let runner = ScriptedRunner::new();
        let pass = RedactedString::from("hunter2");
        let borg = borg(&runner, &pass);

        let _ = borg.ensure_repo("repokey", &mut RunLog::new(), &mut Attachments::new());
        let _ = borg.create("a", &[PathBuf::from("/srv")], &mut RunLog::new(), &mut Attachments::new());

        assert!(runner
            .calls()
            .iter()
            .all(|c| c.env == vec![(PASSPHRASE_ENV.to_string(), "hunter2".to_string())]));
        assert!(std::env::var(PASSPHRASE_ENV).is_err());
    }

    fn timed_out(command: &'static str) -> impl Fn() -> Error {
        move || Error::ProcessTimeout {
            command: command.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_runner_errors_are_fatal_per_step() {
        let pass = RedactedString::from("hunter2");

        let runner = ScriptedRunner::new().on_err("borg init", timed_out("borg init"));
        let mut log = RunLog::new();
        let state = borg(&runner, &pass).ensure_repo("repokey", &mut log, &mut Attachments::new());
        assert_eq!(state, Err(Step::Init));
        assert!(log.get().contains("did not finish within 1m"));

        let runner = ScriptedRunner::new().on_err("borg key export", timed_out("borg key export"));
        let state = borg(&runner, &pass).ensure_repo(
            "repokey",
            &mut RunLog::new(),
            &mut Attachments::new(),
        );
        assert_eq!(state, Err(Step::KeyExport));

        let runner = ScriptedRunner::new().on_err("borg create", timed_out("borg create"));
        let mut attachments = Attachments::new();
        let created = borg(&runner, &pass).create(
            "a",
            &[PathBuf::from("/srv")],
            &mut RunLog::new(),
            &mut attachments,
        );
        assert_eq!(created, Err(Step::Create));
        assert!(attachments.is_empty());

        let runner = ScriptedRunner::new().on_err("borg prune", timed_out("borg prune"));
        let pruned = borg(&runner, &pass).prune(
            &RetentionPolicy::KeepLast(5),
            &mut RunLog::new(),
            &mut Attachments::new(),
        );
        assert_eq!(pruned, Err(Step::Prune));
    }
}
