use crate::engine::retry::RetryPolicy;
use crate::engine::{JobTransport, RemoteClient};
use crate::model::{ControllerConfig, ControllerSnapshot, DownloadKind, JobEvent, JobState};
use crate::orchestrator::{run_controller, JobController, UiCommand};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
#[derive(Debug)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "email-parse-cli",
    version,
    about = "Start, follow and collect remote email-parsing jobs, with optional TUI"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Base URL of the parsing backend
    #[arg(long, env = "PARSER_BASE_URL", default_value = "http://localhost:8010")]
    pub base_url: String,

    /// AI model the backend should use for parsing
    #[arg(long, default_value = "grok-3")]
    pub model: String,

    /// Print JSON result and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print text progress and summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for cron usage)
    #[arg(long)]
    pub silent: bool,

    /// Interval between status polls
    #[arg(long, default_value = "3s")]
    pub poll_interval: humantime::Duration,

    /// Use --auto-download true or --auto-download false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_download: bool,

    /// Also fetch the backend's debug log when a job finishes
    #[arg(long)]
    pub debug_download: bool,

    /// Guess a `<name>_failed.<ext>` companion file when the backend does not name one
    #[arg(long)]
    pub derive_failed_file: bool,

    /// Ask the backend to clean up after the output was downloaded
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub cleanup: bool,

    /// Delay between the output download and the cleanup call
    #[arg(long, default_value = "5s")]
    pub cleanup_delay: humantime::Duration,

    /// Attempts per status/download call (1 disables retry)
    #[arg(long, default_value_t = 3)]
    pub retry_attempts: u32,

    /// Base delay of the exponential retry backoff
    #[arg(long, default_value = "500ms")]
    pub retry_base_delay: humantime::Duration,

    /// Timeout for a single HTTP request
    #[arg(long, default_value = "30s")]
    pub request_timeout: humantime::Duration,

    /// Directory downloaded files are written to (defaults to the user's download directory)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Automatically start a job when the TUI launches
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,

    /// Write logs to this file (the only way to get logs while the TUI runs)
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the current status of a job as JSON
    Status { id: String },
    /// Print the backend's processing log for a job
    Log { id: String },
    /// Download a file the backend produced
    Download { filename: String },
    /// Ping the backend so hosted instances stay awake
    KeepAlive,
    /// Serve a pass-through proxy for browser front ends
    Proxy {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3000")]
        listen: SocketAddr,
        /// Built single-page app to serve for non-API paths
        #[arg(long)]
        static_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Text,
    Json,
    Silent,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    let interactive =
        cfg!(feature = "tui") && args.command.is_none() && !args.json && !args.text;
    crate::logging::init(args.verbose, args.log_file.as_deref(), interactive, args.silent)?;

    if let Some(cmd) = args.command.clone() {
        return run_command(&args, cmd).await;
    }

    // Silent mode takes precedence over other output modes
    if args.silent {
        return run_job(args, OutputMode::Silent).await;
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_job(args, OutputMode::Text).await;
        }
    }

    if args.json {
        return run_job(args, OutputMode::Json).await;
    }

    run_job(args, OutputMode::Text).await
}

/// Build a `ControllerConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ControllerConfig {
    ControllerConfig {
        base_url: args.base_url.clone(),
        poll_interval: Duration::from(args.poll_interval),
        auto_download: args.auto_download,
        enable_debug_download: args.debug_download,
        derive_failed_file: args.derive_failed_file,
        cleanup: args.cleanup,
        cleanup_delay: Duration::from(args.cleanup_delay),
        request_timeout: Duration::from(args.request_timeout),
        retry: RetryPolicy {
            max_attempts: args.retry_attempts,
            base_delay: Duration::from(args.retry_base_delay),
            ..RetryPolicy::default()
        },
        ..ControllerConfig::default()
    }
}

pub fn output_dir(args: &Cli) -> PathBuf {
    args.output_dir
        .clone()
        .unwrap_or_else(crate::storage::default_output_dir)
}

/// One-shot backend calls that do not need the job lifecycle.
async fn run_command(args: &Cli, cmd: Command) -> Result<()> {
    let cfg = build_config(args);
    if let Command::Proxy { listen, static_dir } = cmd {
        return crate::proxy::serve(&cfg, listen, static_dir).await;
    }

    let client = RemoteClient::new(&cfg)?;
    match cmd {
        Command::Status { id } => {
            let status = client
                .fetch_status(&id)
                .await
                .with_context(|| format!("fetch status of job {id}"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Log { id } => {
            let log = client
                .fetch_log(&id)
                .await
                .with_context(|| format!("fetch log of job {id}"))?;
            match log {
                Some(text) => println!("{text}"),
                None => eprintln!("No log available for job {id}"),
            }
        }
        Command::Download { filename } => {
            let file = client
                .download(DownloadKind::Output, &filename)
                .await
                .with_context(|| format!("download {filename}"))?;
            let path = crate::storage::save_download(&output_dir(args), &file)?;
            eprintln!("Saved: {}", path.display());
        }
        Command::KeepAlive => {
            let body = client.keep_alive().await.context("keep-alive ping")?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Proxy { .. } => {}
    }
    Ok(())
}

/// Final JSON document printed by `--json`.
#[derive(Serialize)]
struct JobReport<'a> {
    #[serde(flatten)]
    snapshot: &'a ControllerSnapshot,
    output_file: Option<&'a str>,
    error_message: Option<String>,
    saved_files: Vec<String>,
}

/// Start one job, follow it to a terminal state and report the result.
async fn run_job(args: Cli, mode: OutputMode) -> Result<()> {
    let cfg = build_config(&args);
    let out_dir = output_dir(&args);
    let client: Arc<dyn JobTransport> = Arc::new(RemoteClient::new(&cfg)?);

    let (out_tx, out_handle) = if mode == OutputMode::Silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    let res = drive_job(client, cfg, &args.model, mode, &out_dir, |line| {
        if let Some(tx) = out_tx.as_ref() {
            let _ = tx.send(line);
        }
    })
    .await;

    drop(out_tx);
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }
    res
}

/// Run one job through a controller, saving downloads into `out_dir` and
/// writing progress and the final report through `say`.
///
/// Fails when the job ends in `Error` so the process exits non-zero.
async fn drive_job(
    transport: Arc<dyn JobTransport>,
    cfg: ControllerConfig,
    model: &str,
    mode: OutputMode,
    out_dir: &Path,
    mut say: impl FnMut(OutputLine),
) -> Result<()> {
    let mut say = |line: OutputLine| {
        if mode != OutputMode::Silent {
            say(line);
        }
    };

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let controller = JobController::new(transport, cfg, evt_tx);
    let handle = tokio::spawn(run_controller(controller, cmd_rx));
    cmd_tx
        .send(UiCommand::Start(model.to_string()))
        .map_err(|_| anyhow::anyhow!("job controller is not running"))?;

    let followed = tokio::select! {
        res = follow_job(&mut evt_rx, mode, out_dir, &mut say) => res,
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };

    let _ = cmd_tx.send(UiCommand::Quit);
    handle
        .await
        .context("job controller task failed")?
        .context("job controller failed")?;
    let (finished, saved) = followed?;

    match mode {
        OutputMode::Json => {
            let report = JobReport {
                snapshot: &finished,
                output_file: finished.output_file(),
                error_message: finished.error_message(),
                saved_files: saved.iter().map(|p| p.display().to_string()).collect(),
            };
            say(OutputLine::Stdout(serde_json::to_string_pretty(&report)?));
        }
        OutputMode::Text => {
            for line in crate::text_summary::build_text_summary(&finished, &saved).lines {
                say(OutputLine::Stdout(line));
            }
        }
        OutputMode::Silent => {}
    }

    if finished.state == JobState::Error {
        let msg = finished
            .error_message()
            .unwrap_or_else(|| "job failed".to_string());
        anyhow::bail!(msg);
    }
    Ok(())
}

/// Consume controller events until the job finishes. Returns the final
/// snapshot and the paths of the files saved along the way.
async fn follow_job(
    evt_rx: &mut mpsc::UnboundedReceiver<JobEvent>,
    mode: OutputMode,
    out_dir: &Path,
    say: &mut impl FnMut(OutputLine),
) -> Result<(ControllerSnapshot, Vec<PathBuf>)> {
    let mut saved: Vec<PathBuf> = Vec::new();
    let mut last_progress: Option<String> = None;
    loop {
        match evt_rx.recv().await {
            Some(JobEvent::Snapshot(snap)) => {
                if mode == OutputMode::Text {
                    if let Some(line) = crate::text_summary::progress_line(&snap) {
                        if last_progress.as_deref() != Some(line.as_str()) {
                            say(OutputLine::Stderr(line.clone()));
                            last_progress = Some(line);
                        }
                    }
                }
            }
            Some(JobEvent::Downloaded(file)) => match crate::storage::save_download(out_dir, &file) {
                Ok(p) => saved.push(p),
                Err(e) => {
                    tracing::warn!(filename = %file.filename, error = %e, "could not save download");
                    say(OutputLine::Stderr(format!(
                        "Could not save {}: {e:#}",
                        file.kind.label()
                    )));
                }
            },
            Some(JobEvent::DownloadFailed { kind, filename, message }) => {
                say(OutputLine::Stderr(format!(
                    "Download of {} file {filename} failed: {message}",
                    kind.label()
                )));
            }
            Some(JobEvent::Info(info)) => {
                if mode == OutputMode::Text {
                    say(OutputLine::Stderr(info.to_message()));
                }
            }
            Some(JobEvent::Finished(snap)) => return Ok((snap, saved)),
            None => anyhow::bail!("job controller stopped before the job finished"),
        }
    }
}
