//! `image-repro`: rebuild the source revision behind a disk image and diff the result.
//!
//! Exit status is 0 whenever the comparison completes, reproducible or not.
//! Every fatal error exits with the code of its category.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use image_repro::config::Config;
use image_repro::identity::{Arch, Branch, CommitHash, PartialIdentity, Platform};
use image_repro::image::ImageSource;
use image_repro::pipeline::{self, RunOptions, RunOutcome};
use image_repro::resource::{signals, ResourceTracker};
use image_repro::Error;

/// Exit status for command-line errors, including `help`.
const EXIT_USAGE: u8 = 64;
/// Exit status when the error is not one of ours (logging bootstrap).
const EXIT_SOFTWARE: u8 = 70;

const AWS_ENV: &[&str] = &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "AWS_DEFAULT_REGION"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ImageType {
    Local,
    Remote,
    Aws,
}

#[derive(Debug, Parser)]
#[command(
    name = "image-repro",
    version,
    about = "Verify that a disk image can be rebuilt bit-for-bit from its source revision",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Where the image comes from.
    #[arg(long, value_enum, default_value_t = ImageType::Local)]
    image_type: ImageType,

    /// Path, URL or cloud image id, depending on --image-type.
    #[arg(long)]
    image: Option<String>,

    #[arg(long, value_enum)]
    platform: Option<Platform>,

    #[arg(long, value_enum)]
    arch: Option<Arch>,

    /// main, stable/<N> or releng/<N>[.<N>].
    #[arg(long)]
    branch: Option<String>,

    /// 7 to 40 lowercase hex digits.
    #[arg(long)]
    commit: Option<String>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    results_dir: Option<PathBuf>,

    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep the source checkout and object directory.
    #[arg(long)]
    keep_build: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print usage.
    Help,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(parse_exit_status(e.kind()));
        }
    };
    if matches!(cli.command, Some(Command::Help)) {
        let _ = Cli::command().print_help();
        return ExitCode::from(EXIT_USAGE);
    }

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("error: {e:#}");
        return ExitCode::from(EXIT_SOFTWARE);
    }

    match verify(cli) {
        Ok(outcome) => {
            print_verdict(&outcome);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<Error>()
                .map(Error::exit_code)
                .unwrap_or(EXIT_SOFTWARE);
            ExitCode::from(code)
        }
    }
}

/// `--version` is a successful run; help and every real parse error are usage errors.
fn parse_exit_status(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::DisplayVersion => 0,
        _ => EXIT_USAGE,
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .context("parsing log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("initialising logging: {e}"))
}

fn verify(cli: Cli) -> Result<RunOutcome> {
    let source = image_source(cli.image_type, cli.image.as_deref())?;
    let identity = PartialIdentity {
        platform: cli.platform,
        arch: cli.arch,
        branch: cli.branch.as_deref().map(Branch::parse).transpose()?,
        commit: cli.commit.as_deref().map(CommitHash::parse).transpose()?,
    };

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.results_dir {
        config.paths.results_dir = dir;
    }
    if let Some(dir) = cli.work_dir {
        config.paths.work_dir = dir;
    }

    let tracker = ResourceTracker::new();
    signals::install_teardown_on_signal(tracker.clone())?;
    let _teardown = tracker.guard();

    let outcome = pipeline::run(
        config,
        tracker.clone(),
        RunOptions {
            source,
            identity,
            keep_build: cli.keep_build,
        },
    )?;
    Ok(outcome)
}

fn image_source(kind: ImageType, image: Option<&str>) -> Result<ImageSource, Error> {
    let image = image
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::Usage("--image is required".into()))?;
    match kind {
        ImageType::Local => Ok(ImageSource::Local {
            path: PathBuf::from(image),
        }),
        ImageType::Remote => Ok(ImageSource::Remote {
            url: image.to_string(),
        }),
        ImageType::Aws => {
            let missing: Vec<&str> = AWS_ENV
                .iter()
                .copied()
                .filter(|var| std::env::var_os(var).map_or(true, |v| v.is_empty()))
                .collect();
            if !missing.is_empty() {
                return Err(Error::Usage(format!(
                    "--image-type aws requires {} in the environment",
                    missing.join(", ")
                )));
            }
            Ok(ImageSource::CloudManaged {
                image_id: image.to_string(),
                region: std::env::var("AWS_DEFAULT_REGION").unwrap_or_default(),
            })
        }
    }
}

fn print_verdict(outcome: &RunOutcome) {
    let diff = outcome.files.diff.display();
    if outcome.report.is_reproducible() {
        println!("reproducible: {} ({diff})", outcome.identity);
    } else {
        println!(
            "divergent: {} ({} changed paths, see {diff})",
            outcome.identity,
            outcome.report.changes().len()
        );
    }
}
