use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::fmt::{Display, Formatter};
use std::result;
use validator::{Validate, ValidationError, ValidationErrors};

/// Which archives `borg prune` keeps.
///
/// Written in the job file either as a single number (`keep: 5`), as a map
/// (`keep: {daily: 7, monthly: 6}`) or as `[daily, weekly, monthly, yearly]`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetentionPolicy {
    KeepLast(#[serde_as(as = "PickFirst<(_, DisplayFromStr)>")] u32),
    Periodic(PeriodicRetention),
}

/// A zero count disables that rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeriodicRetention {
    #[serde(default)]
    pub daily: u32,
    #[serde(default)]
    pub weekly: u32,
    #[serde(default)]
    pub monthly: u32,
    #[serde(default)]
    pub yearly: u32,
}

impl PeriodicRetention {
    fn rules(&self) -> [(&'static str, u32); 4] {
        [
            ("daily", self.daily),
            ("weekly", self.weekly),
            ("monthly", self.monthly),
            ("yearly", self.yearly),
        ]
    }
}

impl RetentionPolicy {
    /// `--keep-*` arguments for `borg prune`.
    pub fn prune_flags(&self) -> Vec<String> {
        match self {
            Self::KeepLast(n) => vec!["--keep-last".to_string(), n.to_string()],
            Self::Periodic(periodic) => periodic
                .rules()
                .into_iter()
                .filter(|(_, n)| *n > 0)
                .flat_map(|(rule, n)| [format!("--keep-{rule}"), n.to_string()])
                .collect(),
        }
    }
}

impl Display for RetentionPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeepLast(n) => write!(f, "keep last {n}"),
            Self::Periodic(periodic) => {
                let rules = periodic
                    .rules()
                    .into_iter()
                    .filter(|(_, n)| *n > 0)
                    .map(|(rule, n)| format!("{n} {rule}"))
                    .collect::<Vec<_>>();
                write!(f, "keep {}", rules.join(", "))
            }
        }
    }
}

impl Validate for RetentionPolicy {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        match self {
            Self::KeepLast(0) => errors.add(
                "keep",
                ValidationError::new("InvalidRetention")
                    .with_message("keep must be at least 1".into()),
            ),
            Self::Periodic(periodic) if periodic.rules().iter().all(|(_, n)| *n == 0) => errors
                .add(
                    "keep",
                    ValidationError::new("InvalidRetention")
                        .with_message("at least one of daily, weekly, monthly, yearly must be set".into()),
                ),
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_periodic_flags_skip_zero_rules() {
        let policy = RetentionPolicy::Periodic(PeriodicRetention {
            daily: 3,
            weekly: 0,
            monthly: 1,
            yearly: 0,
        });
        let flags = policy.prune_flags().join(" ");

        assert_eq!(flags, "--keep-daily 3 --keep-monthly 1");
        assert!(!flags.contains("--keep-weekly"));
        assert!(!flags.contains("--keep-yearly"));
    }

    #[test]
    fn test_keep_last_flags() {
        assert_eq!(
            RetentionPolicy::KeepLast(5).prune_flags(),
            vec!["--keep-last", "5"]
        );
    }

    #[test]
    fn test_deserialize_forms() {
        let scalar: RetentionPolicy = serde_yml::from_str("5").unwrap();
        assert_eq!(scalar, RetentionPolicy::KeepLast(5));

        let quoted: RetentionPolicy = serde_yml::from_str("\"7\"").unwrap();
        assert_eq!(quoted, RetentionPolicy::KeepLast(7));

        let map: RetentionPolicy = serde_yml::from_str("{daily: 7, yearly: 2}").unwrap();
        assert_eq!(
            map,
            RetentionPolicy::Periodic(PeriodicRetention {
                daily: 7,
                yearly: 2,
                ..Default::default()
            })
        );

        let list: RetentionPolicy = serde_yml::from_str("[7, 4, 6, 1]").unwrap();
        assert_eq!(
            list,
            RetentionPolicy::Periodic(PeriodicRetention {
                daily: 7,
                weekly: 4,
                monthly: 6,
                yearly: 1,
            })
        );
    }

    #[test]
    fn test_validation() {
        assert!(RetentionPolicy::KeepLast(1).validate().is_ok());
        assert!(RetentionPolicy::KeepLast(0).validate().is_err());
        assert!(RetentionPolicy::Periodic(PeriodicRetention::default())
            .validate()
            .is_err());
        assert!(RetentionPolicy::Periodic(PeriodicRetention {
            weekly: 4,
            ..Default::default()
        })
        .validate()
        .is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(RetentionPolicy::KeepLast(5).to_string(), "keep last 5");
        let periodic = RetentionPolicy::Periodic(PeriodicRetention {
            daily: 7,
            monthly: 6,
            ..Default::default()
        });
        assert_eq!(periodic.to_string(), "keep 7 daily, 6 monthly");
    }
}
