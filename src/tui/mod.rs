mod clipboard;
mod help;
mod state;

use crate::cli::Cli;
use crate::engine::{JobTransport, RemoteClient};
use crate::model::{DownloadKind, JobEvent, JobState};
use crate::orchestrator::{self, JobController, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Sparkline, Tabs},
    Terminal,
};
use state::{apply_event, push_wrapped_status_kv, state_color, UiState};
use std::sync::Arc;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli) -> Result<()> {
    let cfg = crate::cli::build_config(&args);
    let client: Arc<dyn JobTransport> = Arc::new(RemoteClient::new(&cfg)?);

    // Unbounded channels avoid backpressure between the UI thread and the controller.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let controller = JobController::new(client, cfg, event_tx);

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, event_rx, cmd_tx));

    let res = orchestrator::run_controller(controller, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

fn start_job(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>) {
    state.reset_job();
    state.log(format!("Starting job with model {}", state.model()));
    let _ = cmd_tx.send(UiCommand::Start(state.model().to_string()));
}

fn request_download(state: &mut UiState, cmd_tx: &UnboundedSender<UiCommand>, kind: DownloadKind) {
    if state.snapshot.state != JobState::Done {
        state.info = "No finished job to download from yet.".into();
        return;
    }
    state.info = format!("Downloading {}...", kind.label());
    let _ = cmd_tx.send(UiCommand::Download(kind));
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    args: Cli,
    mut event_rx: UnboundedReceiver<JobEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState {
        out_dir: crate::cli::output_dir(&args),
        ..Default::default()
    }
    .with_model(&args.model);
    state.info = "Press s to start a job, ? for help.".into();
    if args.start_on_launch {
        start_job(&mut state, &cmd_tx);
    }

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        while let Ok(ev) = event_rx.try_recv() {
            apply_event(&mut state, ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('s')) => start_job(&mut state, &cmd_tx),
                    (_, KeyCode::Char('m')) => {
                        state.cycle_model(true);
                        state.info = format!("Model: {}", state.model());
                    }
                    (_, KeyCode::Char('M')) => {
                        state.cycle_model(false);
                        state.info = format!("Model: {}", state.model());
                    }
                    (_, KeyCode::Char('c')) => {
                        if state.is_running() {
                            let _ = cmd_tx.send(UiCommand::Cancel);
                            state.log("Stopped following the job");
                        }
                    }
                    (_, KeyCode::Char('d')) => {
                        request_download(&mut state, &cmd_tx, DownloadKind::Output)
                    }
                    (_, KeyCode::Char('l')) => {
                        request_download(&mut state, &cmd_tx, DownloadKind::Debug)
                    }
                    (_, KeyCode::Char('f')) => {
                        request_download(&mut state, &cmd_tx, DownloadKind::Failed)
                    }
                    (_, KeyCode::Char('y')) => match state.snapshot.job_id() {
                        Some(id) => {
                            let id = id.to_string();
                            state.info = match clipboard::copy_to_clipboard(&id) {
                                Ok(()) => format!("✓ Copied job id: {id}"),
                                Err(e) => format!("Clipboard copy failed: {e:#}"),
                            };
                        }
                        None => state.info = "No job id to copy yet.".into(),
                    },
                    (_, KeyCode::Tab) => state.tab = (state.tab + 1) % 3,
                    (_, KeyCode::Char('?')) => state.tab = 2,
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![Line::from("Job"), Line::from("Activity"), Line::from("Help")])
        .select(state.tab)
        .block(Block::default().borders(Borders::ALL).title("email-parse-cli"))
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_job(chunks[1], f, state),
        1 => draw_activity(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }

    let footer = Paragraph::new(Line::from(vec![
        Span::styled("[s]", Style::default().fg(Color::Magenta)),
        Span::raw("tart "),
        Span::styled("[m]", Style::default().fg(Color::Magenta)),
        Span::raw("odel "),
        Span::styled("[d]", Style::default().fg(Color::Magenta)),
        Span::raw("ownload "),
        Span::styled("[?]", Style::default().fg(Color::Magenta)),
        Span::raw(" help  "),
        Span::raw(state.info.clone()),
    ]))
    .block(Block::default().borders(Borders::ALL));
    f.render_widget(footer, chunks[2]);
}

fn draw_job(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(9), Constraint::Length(3), Constraint::Length(6)].as_ref())
        .split(area);

    let snap = &state.snapshot;
    let mut lines = vec![
        Line::from(vec![
            Span::styled("Model:", Style::default().fg(Color::Gray)),
            Span::raw(" "),
            Span::raw(snap.model.clone().unwrap_or_else(|| state.model().to_string())),
            Span::styled(
                format!("  (next start: {})", state.model()),
                Style::default().fg(Color::DarkGray),
            ),
        ]),
        Line::from(vec![
            Span::styled("State:", Style::default().fg(Color::Gray)),
            Span::raw(" "),
            Span::styled(
                snap.state.label(),
                Style::default()
                    .fg(state_color(snap.state))
                    .add_modifier(Modifier::BOLD),
            ),
        ]),
    ];
    let width = rows[0].width;
    push_wrapped_status_kv(&mut lines, "Job", snap.job_id().unwrap_or(""), width);
    if let Some(s) = snap.status.as_ref() {
        lines.push(Line::from(format!(
            "Emails: {} processed / {} fetched    Rows parsed: {}",
            s.emails_processed_count, s.emails_fetched_count, s.rows_parsed_count
        )));
    }
    if let Some(elapsed) = state.elapsed() {
        lines.push(Line::from(format!(
            "Elapsed: {}",
            humantime::format_duration(Duration::from_secs(elapsed.as_secs()))
        )));
    }
    push_wrapped_status_kv(&mut lines, "Output", snap.output_file().unwrap_or(""), width);
    if let Some(err) = snap.error_message() {
        push_wrapped_status_kv(&mut lines, "Error", &err, width);
    }
    for p in &state.saved {
        push_wrapped_status_kv(&mut lines, "Saved", &p.display().to_string(), width);
    }
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Job")),
        rows[0],
    );

    let (ratio, label) = match snap.status.as_ref() {
        Some(s) if snap.state == JobState::Done => (1.0, format!("{} emails", s.emails_fetched_count)),
        Some(s) => (
            s.progress(),
            format!("{}/{} emails", s.emails_processed_count, s.emails_fetched_count),
        ),
        None => (0.0, "-".to_string()),
    };
    f.render_widget(
        Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(state_color(snap.state)))
            .ratio(ratio.clamp(0.0, 1.0))
            .label(label),
        rows[1],
    );

    f.render_widget(
        Sparkline::default()
            .block(Block::default().borders(Borders::ALL).title("Rows parsed"))
            .data(&state.rows_series)
            .style(Style::default().fg(Color::Green)),
        rows[2],
    );
}

fn draw_activity(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let visible = area.height.saturating_sub(2) as usize;
    let start = state.activity.len().saturating_sub(visible);
    let lines: Vec<Line> = state.activity[start..]
        .iter()
        .map(|l| Line::from(l.as_str()))
        .collect();
    f.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Activity")),
        area,
    );
}
