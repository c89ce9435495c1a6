use borg_runner::backup::backup_config::BackupConfig;
use borg_runner::backup::notifications::smtp::SmtpSettings;
use borg_runner::backup::orchestrator::{check_outcomes, run_all, Orchestrator};
use borg_runner::backup::process::ShellRunner;
use borg_runner::backup::result_error::error::Error;
use borg_runner::backup::result_error::result::Result;
use borg_runner::backup::result_error::WithMsg;
use borg_runner::backup::text::LOG_LEN;
use clap::Parser;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Run borg backup jobs and report each one by email
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of the job file
    #[arg(short, long)]
    config: PathBuf,
    /// Location of the smtp settings, YAML or JSON
    #[arg(short, long)]
    smtp: PathBuf,
    /// Display name in the From header of report emails
    #[arg(short = 'n', long, default_value = "Borg Backup")]
    sender_name: String,
    /// Only run the named job, may be repeated
    #[arg(short, long = "job")]
    jobs: Vec<String>,
    /// Lines of command output kept in the report body
    #[arg(long, default_value_t = LOG_LEN)]
    log_len: usize,
    /// Validate both files and print the jobs, without running anything
    #[arg(long)]
    check: bool,
}

fn run(args: &Args) -> Result<()> {
    let config = BackupConfig::load(&args.config)?;
    let smtp = SmtpSettings::load(&args.smtp, args.sender_name.as_str())?;
    let jobs = config.select(&args.jobs)?;

    if args.check {
        if let Some(e) = smtp.error() {
            return Err(e);
        }
        let printed = serde_yml::to_string(&jobs.into_iter().collect::<indexmap::IndexMap<_, _>>())
            .map_err(Error::from)
            .with_msg("Print config failed")?;
        println!("{printed}");
        return Ok(());
    }

    let runner = ShellRunner;
    let orchestrator = Orchestrator::builder()
        .runner(&runner)
        .notifier(&smtp)
        .max_lines(args.log_len)
        .build();
    let outcomes = run_all(&orchestrator, jobs);
    for (name, outcome) in &outcomes {
        if outcome.ok {
            info!("Job {name} succeeded");
        }
    }
    check_outcomes(&outcomes)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => exit(0),
        Err(e) => {
            error!("{e}");
            exit(1);
        }
    }
}
