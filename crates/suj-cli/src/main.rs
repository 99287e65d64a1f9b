#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::env::VarError;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use suj_block::FileByteDevice;
use suj_error::{EXIT_OPERATIONAL, EXIT_USAGE, SujError};
use suj_recovery::{
    AssumeNo, AssumeYes, Confirm, Gate, JournalListing, RecoveryOptions, RecoverySummary,
    inspect_journal, recover,
};
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "SUJ_LOG_FORMAT";

    fn parse(raw: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(raw.trim(), true).map_err(|_| {
            anyhow::anyhow!(
                "invalid {key}={raw:?}; expected one of: human, json",
                key = Self::ENV_KEY
            )
        })
    }

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => Ok(Some(Self::parse(&value)?)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => {
                bail!("{key} contains non-UTF-8 bytes", key = Self::ENV_KEY)
            }
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

/// `RUST_LOG` when set, otherwise `level`.
fn default_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_logging(log_format_override: Option<LogFormat>, level: &str) -> Result<LogFormat> {
    let format = log_format_override
        .or(LogFormat::from_env()?)
        .unwrap_or(LogFormat::Human);

    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter(level))
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_env_filter(default_env_filter(level))
            .with_writer(io::stderr)
            .with_target(true)
            .with_level(true)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize JSON logger: {err}"))?,
    }

    Ok(format)
}

#[derive(Parser)]
#[command(name = "suj", about = "Soft-updates journal recovery for UFS2")]
struct Cli {
    /// Log output format (`human` or `json`).
    ///
    /// Precedence: `--log-format` > `SUJ_LOG_FORMAT` > `human`.
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
    /// Log per-record decisions.
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
    /// Log cache traffic and every visited reference.
    #[arg(short = 'd', long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay the journal and mark the filesystem clean.
    Recover {
        image: PathBuf,
        /// Answer yes to every question.
        #[arg(short = 'y', conflicts_with_all = ["no", "preen"])]
        yes: bool,
        /// Answer no to every question; the image is opened read-only.
        #[arg(short = 'n', conflicts_with = "preen")]
        no: bool,
        /// Preen: recover without asking.
        #[arg(short = 'p')]
        preen: bool,
        #[arg(long)]
        json: bool,
        /// Journal block size used to resynchronize after a torn write.
        #[arg(long)]
        dev_bsize: Option<usize>,
    },
    /// List the journal segments recovery would replay.
    Journal {
        image: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        dev_bsize: Option<usize>,
    },
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::Recover { .. } => "recover",
            Self::Journal { .. } => "journal",
        }
    }

    const fn json(&self) -> bool {
        match self {
            Self::Recover { json, .. } | Self::Journal { json, .. } => *json,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Answer {
    Ask,
    Yes,
    No,
}

// ── Confirmation ────────────────────────────────────────────────────────────

/// Asks each gate on `output` and reads the answer from `input`.
///
/// End of input counts as no.
struct Prompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Confirm for Prompt<R, W> {
    fn confirm(&mut self, gate: Gate) -> bool {
        loop {
            if write!(self.output, "{gate}? [yn] ").is_err() || self.output.flush().is_err() {
                return false;
            }
            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => {
                    let _ = writeln!(self.output);
                    return false;
                }
                Ok(_) => {}
            }
            match line.trim().chars().next() {
                Some('y' | 'Y') => return true,
                Some('n' | 'N') => return false,
                _ => {}
            }
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn recovery_options(dev_bsize: Option<usize>, preen: bool) -> Result<RecoveryOptions> {
    let mut options = RecoveryOptions {
        preen,
        ..RecoveryOptions::default()
    };
    if let Some(size) = dev_bsize {
        if size < 512 || !size.is_power_of_two() {
            return Err(SujError::Format(format!(
                "--dev-bsize {size} must be a power of two of at least 512"
            ))
            .into());
        }
        options.dev_bsize = size;
    }
    Ok(options)
}

fn recover_image(
    path: &Path,
    options: RecoveryOptions,
    read_only: bool,
    confirm: &mut dyn Confirm,
) -> Result<RecoverySummary> {
    let device = if read_only {
        FileByteDevice::open_read_only(path)
    } else {
        FileByteDevice::open(path)
    }
    .with_context(|| format!("failed to open {}", path.display()))?;
    if !read_only && !device.is_writable() {
        warn!(target: "suj::cli", image = %path.display(), "image opened read-only");
    }
    recover(device, options, confirm)
        .with_context(|| format!("journal recovery failed on {}", path.display()))
}

fn recover_cmd(path: &Path, answer: Answer, json: bool, options: RecoveryOptions) -> Result<()> {
    let summary = match answer {
        Answer::Yes => recover_image(path, options, false, &mut AssumeYes)?,
        Answer::No => recover_image(path, options, true, &mut AssumeNo)?,
        Answer::Ask => {
            let mut prompt = Prompt {
                input: io::stdin().lock(),
                output: io::stderr(),
            };
            recover_image(path, options, false, &mut prompt)?
        }
    };
    info!(
        target: "suj::cli",
        outcome = ?summary.outcome,
        records = summary.journal_records,
        "recover_complete"
    );
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize summary")?
        );
    } else {
        println!("** SU+J Recovering {}", path.display());
        println!("{summary}");
    }
    Ok(())
}

fn journal_cmd(path: &Path, json: bool, options: RecoveryOptions) -> Result<()> {
    let device = FileByteDevice::open_read_only(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let listing = inspect_journal(device, options)
        .with_context(|| format!("failed to read journal of {}", path.display()))?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&listing).context("serialize listing")?
        );
    } else {
        print!("{}", render_listing(&listing));
    }
    Ok(())
}

fn render_listing(listing: &JournalListing) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "status: {:?}", listing.status);
    for seg in &listing.segments {
        let _ = writeln!(
            out,
            "seq {} oldest {} records {} at sector {}",
            seg.seq.0, seg.oldest.0, seg.records, seg.addr.0
        );
    }
    let report = &listing.report;
    let _ = writeln!(
        out,
        "{} segments kept, {} pruned, {} blocks skipped",
        report.kept, report.pruned, listing.skipped_blocks
    );
    let _ = writeln!(
        out,
        "{} journal records in {} bytes for {:.2}% utilization",
        report.records,
        report.bytes,
        report.utilization()
    );
    out
}

/// Exit status for a failed command: the fsck code of the underlying
/// recovery error, or the operational error code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<SujError>()
        .map_or(EXIT_OPERATIONAL, SujError::exit_code)
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_USAGE } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    let json = cli.command.json();
    if let Err(error) = run(cli) {
        let code = exit_code_for(&error);
        if json {
            let body = serde_json::json!({
                "status": "operational_error",
                "exit_code": code,
                "error": format!("{error:#}"),
            });
            println!("{body}");
        } else {
            eprintln!("error: {error:#}");
        }
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let log_format = init_logging(cli.log_format, level)?;
    let command_name = cli.command.name();
    let run_span = info_span!(
        target: "suj::cli",
        "command",
        command = command_name,
        log_format = log_format.as_str()
    );
    let _run_guard = run_span.enter();
    let started = Instant::now();
    info!(target: "suj::cli", command = command_name, "command_start");

    let result = match cli.command {
        Command::Recover {
            image,
            yes,
            no,
            preen,
            json,
            dev_bsize,
        } => {
            let answer = if yes {
                Answer::Yes
            } else if no {
                Answer::No
            } else {
                Answer::Ask
            };
            recovery_options(dev_bsize, preen)
                .and_then(|options| recover_cmd(&image, answer, json, options))
        }
        Command::Journal {
            image,
            json,
            dev_bsize,
        } => recovery_options(dev_bsize, false).and_then(|options| journal_cmd(&image, json, options)),
    };

    info!(
        target: "suj::cli",
        command = command_name,
        ok = result.is_ok(),
        duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        "command_complete"
    );
    result
}
