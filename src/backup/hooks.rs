//! User commands that run at fixed points of a job.

use crate::backup::process::{Invocation, ProcessRunner, ProcessResult};
use crate::backup::run_log::{attach_if_long, Attachments, RunLog};
use crate::backup::text::{header, HEADER_WIDTH};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tracing::warn;

/// Pipeline points where commands run, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookName {
    PreStop,
    PostStop,
    PreStart,
    PostStart,
}

impl HookName {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::PreStop => "pre_stop",
            HookName::PostStop => "post_stop",
            HookName::PreStart => "pre_start",
            HookName::PostStart => "post_start",
        }
    }
}

impl Display for HookName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one hook batch.
#[derive(Debug, Default)]
pub struct HookReport {
    pub attachments: Attachments,
    pub failed: usize,
}

/// Run `commands` in order. Failing commands are recorded and the batch continues.
pub fn run_hook<R: ProcessRunner + ?Sized>(
    runner: &R,
    hook: HookName,
    commands: &[String],
    timeout: Option<Duration>,
    max_lines: usize,
    log: &mut RunLog,
) -> HookReport {
    let mut report = HookReport::default();
    if commands.is_empty() {
        return report;
    }

    log.add(
        format!("{}\n\n", header(&format!("Running {hook} commands"), HEADER_WIDTH)),
        true,
    );
    for (index, command) in commands.iter().enumerate() {
        log.add(format!("{}. Running command \"{command}\":\n", index + 1), true);
        let invocation = Invocation::builder()
            .command(command.as_str())
            .echo(true)
            .maybe_timeout(timeout)
            .build();
        let result = runner.run(&invocation).unwrap_or_else(|e| {
            warn!("{hook} command {command:?} could not run: {e}");
            ProcessResult::new(-1, e.to_string())
        });
        log.add_result(&result, max_lines);
        attach_if_long(
            &mut report.attachments,
            format!("{hook}_cmd_{}.txt", index + 1),
            result.output(),
            max_lines,
        );
        if !result.success() {
            warn!("{hook} command {command:?} exited with {}", result.exit_code());
            report.failed += 1;
        }
    }

    report
}
