use crate::backup::hooks::HookName;
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::result_error::WithMsg;
use crate::backup::retention::RetentionPolicy;
use crate::backup::services::ServiceBackend;
use crate::backup::validate::{validate_entries_not_blank, validate_not_blank, validate_paths};
use getset::{CopyGetters, Getters};
use indexmap::IndexMap;
use itertools::Itertools;
use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, OneOrMany};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::{Validate, ValidationError};

pub const DEFAULT_ENCRYPTION: &str = "repokey-blake2";

/// All jobs of a job file, in the order they run.
#[derive(Clone, Debug, Serialize, Deserialize, Getters)]
#[serde(transparent)]
#[getset(get = "pub")]
pub struct BackupConfig {
    jobs: IndexMap<String, JobConfig>,
}

/// One backup set: what to save, where, and what to do around it.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde_as(as = "OneOrMany<_>")]
    #[validate(custom(function = validate_paths))]
    #[getset(get = "pub")]
    paths: Vec<PathBuf>,
    #[validate(custom(function = validate_not_blank))]
    #[getset(get = "pub")]
    repo: String,
    #[validate(nested)]
    #[getset(get = "pub")]
    pass: RedactedString,
    #[serde(default)]
    #[validate(nested)]
    #[getset(get = "pub")]
    keep: Option<RetentionPolicy>,
    #[serde_as(as = "BTreeMap<_, OneOrMany<_>>")]
    #[serde(default)]
    #[validate(custom(function = validate_entries_not_blank))]
    #[getset(get = "pub")]
    commands: BTreeMap<HookName, Vec<String>>,
    #[serde_as(as = "BTreeMap<_, OneOrMany<_>>")]
    #[serde(default)]
    #[validate(custom(function = validate_entries_not_blank))]
    #[getset(get = "pub")]
    services: BTreeMap<ServiceBackend, Vec<String>>,
    #[getset(get = "pub")]
    email: Mailbox,
    /// `borg init --encryption` mode for new repositories.
    #[serde(default = "default_encryption")]
    #[validate(custom(function = validate_not_blank))]
    #[getset(get = "pub")]
    encryption: String,
    /// Upper bound for any single command of the job.
    #[serde(default, with = "humantime_serde")]
    #[getset(get_copy = "pub")]
    timeout: Option<Duration>,
    /// Start services again even when the backup itself failed.
    #[serde(default = "default_true")]
    #[getset(get_copy = "pub")]
    restart_services_on_failure: bool,
    #[serde(default)]
    #[getset(get_copy = "pub")]
    prune_failure_is_fatal: bool,
    /// Make the paths read-only while borg reads them.
    #[serde(default)]
    #[getset(get_copy = "pub")]
    lock_permissions: bool,
}

fn default_encryption() -> String {
    DEFAULT_ENCRYPTION.to_string()
}

fn default_true() -> bool {
    true
}

impl JobConfig {
    pub fn hook(&self, hook: HookName) -> &[String] {
        self.commands.get(&hook).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_services(&self) -> bool {
        self.services.values().any(|names| !names.is_empty())
    }
}

impl BackupConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, BackupConfig>(f).map_err(Error::from))
            .with_msg(format!("Parse YAML config failed: {:?}", path))?;
        config
            .validate()
            .with_msg(format!("Config validation failed: {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            let mut errors = validator::ValidationErrors::new();
            errors.add(
                "jobs",
                ValidationError::new("NoJobs").with_message("no jobs configured".into()),
            );
            return Err(errors.into());
        }
        convert_error_vec(
            self.jobs
                .iter()
                .filter_map(|(name, job)| {
                    job.validate()
                        .map_err(Error::from)
                        .with_msg(format!("Job {name:?} is invalid"))
                        .err()
                })
                .collect_vec(),
        )
    }

    /// Jobs to run, in file order. An empty `names` selects every job.
    pub fn select(&self, names: &[String]) -> Result<Vec<(&String, &JobConfig)>> {
        if let Some(unknown) = names.iter().find(|n| !self.jobs.contains_key(n.as_str())) {
            let mut errors = validator::ValidationErrors::new();
            errors.add(
                "jobs",
                ValidationError::new("UnknownJob")
                    .with_message(format!("job {unknown:?} not found").into()),
            );
            return Err(errors.into());
        }
        Ok(self
            .jobs
            .iter()
            .filter(|(name, _)| names.is_empty() || names.contains(*name))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backup::retention::PeriodicRetention;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) fn job_from_yaml(yaml: &str) -> JobConfig {
        let job: JobConfig = serde_yml::from_str(yaml).unwrap();
        job.validate().unwrap();
        job
    }

    #[test]
    fn test_scalars_are_normalized_to_lists() {
        let job = job_from_yaml(
            r#"
paths: /srv/data
repo: /mnt/backup/data
pass: hunter2
keep: 5
commands:
  pre_stop: echo stopping
  post_start:
    - echo one
    - echo two
services:
  system: nginx
  docker: [db, app]
email: admin@example.com
"#,
        );

        assert_eq!(job.paths(), &vec![PathBuf::from("/srv/data")]);
        assert_eq!(job.hook(HookName::PreStop), ["echo stopping"]);
        assert_eq!(job.hook(HookName::PostStart), ["echo one", "echo two"]);
        assert!(job.hook(HookName::PostStop).is_empty());
        assert_eq!(job.services()[&ServiceBackend::System], vec!["nginx"]);
        assert_eq!(job.services()[&ServiceBackend::Container], vec!["db", "app"]);
        assert_eq!(job.keep(), &Some(RetentionPolicy::KeepLast(5)));
        assert_eq!(job.encryption(), DEFAULT_ENCRYPTION);
        assert!(job.restart_services_on_failure());
        assert!(!job.prune_failure_is_fatal());
        assert!(!job.lock_permissions());
        assert_eq!(job.timeout(), None);
    }

    #[test]
    fn test_optional_sections() {
        let job = job_from_yaml(
            r#"
paths: [/srv/a, /srv/b]
repo: ssh://backup@host/./repo
pass: "correct horse"
keep: {daily: 7, monthly: 6}
email: Admin <admin@example.com>
timeout: 6h
restart_services_on_failure: false
"#,
        );

        assert_eq!(job.paths().len(), 2);
        assert!(!job.has_services());
        assert!(job.commands().is_empty());
        assert_eq!(job.timeout(), Some(Duration::from_secs(6 * 3600)));
        assert!(!job.restart_services_on_failure());
        assert_eq!(
            job.keep(),
            &Some(RetentionPolicy::Periodic(PeriodicRetention {
                daily: 7,
                monthly: 6,
                ..Default::default()
            }))
        );
        assert_eq!(job.email().name.as_deref(), Some("Admin"));
    }

    #[test]
    fn test_unknown_fields_and_hooks_rejected() {
        let unknown_field = r#"
paths: /srv
repo: /repo
pass: x
email: a@example.com
retention: 5
"#;
        assert!(serde_yml::from_str::<JobConfig>(unknown_field).is_err());

        let unknown_hook = r#"
paths: /srv
repo: /repo
pass: x
email: a@example.com
commands:
  mid_backup: echo
"#;
        assert!(serde_yml::from_str::<JobConfig>(unknown_hook).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_values() {
        let job: JobConfig = serde_yml::from_str(
            r#"
paths: []
repo: " "
pass: ""
email: a@example.com
"#,
        )
        .unwrap();
        let errors = job.validate().unwrap_err();
        let fields = errors.field_errors();

        assert!(fields.contains_key("paths"));
        assert!(fields.contains_key("repo"));
    }

    #[test]
    fn test_load_keeps_job_order_and_selects() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"
zeta:
  paths: /srv/zeta
  repo: /repo/zeta
  pass: one
  email: a@example.com
alpha:
  paths: /srv/alpha
  repo: /repo/alpha
  pass: two
  email: a@example.com
"#,
        )
        .unwrap();

        let config = BackupConfig::load(file.path()).unwrap();
        let names = config.jobs().keys().cloned().collect_vec();
        assert_eq!(names, vec!["zeta", "alpha"]);

        let selected = config.select(&["alpha".to_string()]).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].0, "alpha");
        assert_eq!(config.select(&[]).unwrap().len(), 2);
        assert!(config.select(&["missing".to_string()]).is_err());
    }

    #[test]
    fn test_load_reports_invalid_job() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"
broken:
  paths: []
  repo: /repo
  pass: one
  email: a@example.com
"#,
        )
        .unwrap();

        let error = BackupConfig::load(file.path()).unwrap_err().to_string();
        assert!(error.contains("Config validation failed"));
        assert!(error.contains("\"broken\""));
    }
}
