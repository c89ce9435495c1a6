//! # borg_runner
//!
//! Unattended borg backup jobs with service handling and email reports.
//!
//! ## Features
//!
//! - **Hooks**: User commands at `pre_stop`, `post_stop`, `pre_start` and `post_start`
//! - **Services**: Stop and start init-script and docker managed services around the backup
//! - **Borg**: Create-or-reuse encrypted repositories, timestamped archives, prune and compact
//! - **Reports**: Email notifications with shortened logs and full output attachments
//! - **Fail fast**: A failed job stops the remaining jobs
//!
//! ## Quick Start
//!
//! ```no_run
//! use borg_runner::backup::backup_config::BackupConfig;
//! use borg_runner::backup::notifications::smtp::SmtpSettings;
//! use borg_runner::backup::orchestrator::{run_all, Orchestrator};
//! use borg_runner::backup::process::ShellRunner;
//!
//! let config = BackupConfig::load("jobs.yml")?;
//! let smtp = SmtpSettings::load("smtp.yml", "Borg Backup")?;
//! let runner = ShellRunner;
//! let orchestrator = Orchestrator::builder().runner(&runner).notifier(&smtp).build();
//! let outcomes = run_all(&orchestrator, config.jobs());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
