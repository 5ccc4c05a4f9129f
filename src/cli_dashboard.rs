//! Operator command line. One-shot actions print a report; `--watch` refreshes read-only
//! reports, as a tabbed terminal dashboard in `table` format:
//! Queues (depth and health per queue)
//! Workers (heartbeats)
//! Health (component verdicts)

use std::{
  io::{self, BufRead, Write},
  sync::mpsc,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
  cursor::MoveTo,
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use tokio::runtime::Runtime;
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};

use qdispatch::{
  app::Services,
  cli::{render, run_action, Action, Cli, OutputFormat, Report},
  config::Config,
  monitor::{HealthStatus, Monitor, QueueStats, SystemHealth, WorkerStats},
};

#[derive(Clone, Copy)]
enum DashboardTab {
  Queues,
  Workers,
  Health,
}

struct Snapshot {
  queues: Vec<(String, QueueStats)>,
  workers: Vec<(String, WorkerStats)>,
  health: Option<SystemHealth>,
  error: Option<String>,
  taken_at: String,
}

impl Snapshot {
  fn empty() -> Self {
    Self {
      queues: vec![],
      workers: vec![],
      health: None,
      error: None,
      taken_at: "-".into(),
    }
  }
}

struct App {
  current_tab: DashboardTab,
  snapshot: Snapshot,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Queues,
      snapshot: Snapshot::empty(),
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Queues => DashboardTab::Workers,
      DashboardTab::Workers => DashboardTab::Health,
      DashboardTab::Health => DashboardTab::Queues,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Queues => DashboardTab::Health,
      DashboardTab::Workers => DashboardTab::Queues,
      DashboardTab::Health => DashboardTab::Workers,
    }
  }
}

async fn take_snapshot(monitor: &Monitor) -> Snapshot {
  let mut snapshot = Snapshot::empty();
  match monitor.queue_stats().await {
    Ok(queues) => snapshot.queues = queues.into_iter().collect(),
    Err(e) => snapshot.error = Some(e.to_string()),
  }
  match monitor.worker_stats().await {
    Ok(workers) => snapshot.workers = workers.into_iter().collect(),
    Err(e) => snapshot.error = Some(e.to_string()),
  }
  snapshot.health = Some(monitor.system_health().await);
  snapshot.taken_at = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
  snapshot
}

fn confirm(prompt: &str) -> Result<bool> {
  print!("{prompt} [y/N] ");
  io::stdout().flush()?;
  let mut answer = String::new();
  io::stdin().lock().read_line(&mut answer)?;
  Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  cli.validate()?;

  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    )
    .with_writer(io::stderr)
    .init();

  if let Some(prompt) = cli.confirmation_prompt() {
    if !confirm(&prompt)? {
      println!("Aborted.");
      return Ok(());
    }
  }

  let config = Config::from_env().context("invalid configuration")?;
  let rt = Runtime::new()?;
  let services = rt.block_on(Services::connect(&config)).context("failed to connect")?;
  let monitor = services.monitor.clone();

  if !cli.watch {
    let report = rt.block_on(run_action(&cli, &monitor))?;
    println!("{}", render(&report, cli.format)?);
    return Ok(());
  }

  if cli.format == OutputFormat::Table && matches!(cli.action, Action::Status | Action::Workers | Action::Health) {
    return run_dashboard(&rt, monitor, &cli);
  }

  loop {
    let report: Report = rt.block_on(run_action(&cli, &monitor))?;
    let mut stdout = io::stdout();
    execute!(stdout, Clear(ClearType::All), MoveTo(0, 0))?;
    println!("{}", render(&report, cli.format)?);
    println!("\nRefreshing every {}s. Ctrl-C to stop.", cli.interval);
    std::thread::sleep(cli.refresh());
  }
}

fn run_dashboard(rt: &Runtime, monitor: std::sync::Arc<Monitor>, cli: &Cli) -> Result<()> {
  let (tx, rx) = mpsc::channel::<Snapshot>();
  let refresh = cli.refresh();
  rt.spawn(async move {
    loop {
      if tx.send(take_snapshot(&monitor).await).is_err() {
        break;
      }
      tokio::time::sleep(refresh).await;
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  app.current_tab = match cli.action {
    Action::Workers => DashboardTab::Workers,
    Action::Health => DashboardTab::Health,
    _ => DashboardTab::Queues,
  };

  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  let outcome = (|| -> Result<()> {
    loop {
      if let Ok(snapshot) = rx.try_recv() {
        app.snapshot = snapshot;
      }
      terminal.draw(|f| ui(f, &app))?;

      let timeout = tick_rate.checked_sub(last_tick.elapsed()).unwrap_or_else(|| Duration::from_secs(0));
      if event::poll(timeout)? {
        if let CEvent::Key(key) = event::read()? {
          match key.code {
            KeyCode::Char('q') => break,
            KeyCode::Right => app.next_tab(),
            KeyCode::Left => app.previous_tab(),
            _ => {}
          }
        }
      }
      if last_tick.elapsed() >= tick_rate {
        last_tick = Instant::now();
      }
    }
    Ok(())
  })();

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  outcome
}

fn health_color(status: HealthStatus) -> Color {
  match status {
    HealthStatus::Healthy => Color::Green,
    HealthStatus::Warning => Color::Yellow,
    HealthStatus::Critical => Color::Red,
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = ["Queues", "Workers", "Health"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
  .block(Block::default().borders(Borders::ALL).title("qdispatch"))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(match app.current_tab {
    DashboardTab::Queues => 0,
    DashboardTab::Workers => 1,
    DashboardTab::Health => 2,
  });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Queues => render_queues(f, app, chunks[1]),
    DashboardTab::Workers => render_workers(f, app, chunks[1]),
    DashboardTab::Health => render_health(f, app, chunks[1]),
  }

  let status = match &app.snapshot.error {
    Some(e) => format!("Error: {e}"),
    None => format!("Updated {}", app.snapshot.taken_at),
  };
  let footer = Paragraph::new(format!("←/→: Switch Tabs | q: Quit | {status}"))
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn render_queues<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app
    .snapshot
    .queues
    .iter()
    .map(|(name, s)| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{name:<18}"), Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(format!(
          "pending {:>6} | ready {:>6} | delayed {:>5} | leased {:>5} | {:<6} ",
          s.pending_count,
          s.depth.ready,
          s.depth.delayed,
          s.depth.leased,
          s.policy.priority.to_string()
        )),
        Span::styled(s.health.as_str(), Style::default().fg(health_color(s.health))),
      ]))
    })
    .collect();
  let total: u64 = app.snapshot.queues.iter().map(|(_, s)| s.pending_count).sum();
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title(format!("Queues (pending: {total})")));
  f.render_widget(list, area);
}

fn render_workers<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = if app.snapshot.workers.is_empty() {
    vec![ListItem::new(Spans::from(Span::raw("No workers have reported")))]
  } else {
    app
      .snapshot
      .workers
      .iter()
      .map(|(id, w)| {
        let lines = vec![
          Spans::from(Span::styled(format!("ID: {id}"), Style::default().add_modifier(Modifier::BOLD))),
          Spans::from(Span::raw(format!(
            "Status: {} | active {} | scheduled {} | reserved {} | processed {}",
            w.status, w.active, w.scheduled, w.reserved, w.processed
          ))),
          Spans::from(Span::raw(format!("Last seen: {}", w.last_seen.format("%Y-%m-%d %H:%M:%S")))),
        ];
        ListItem::new(lines)
      })
      .collect()
  };
  let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Workers"));
  f.render_widget(list, area);
}

fn render_health<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let Some(health) = &app.snapshot.health else {
    f.render_widget(
      Paragraph::new("Waiting for first health check").block(Block::default().borders(Borders::ALL).title("Health")),
      area,
    );
    return;
  };
  let items: Vec<ListItem> = health
    .components
    .iter()
    .map(|(name, c)| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{name:<10}"), Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(format!("{:<9}", c.status.as_str()), Style::default().fg(health_color(c.status))),
        Span::raw(c.message.clone()),
      ]))
    })
    .collect();
  let title = format!("Health (overall: {})", health.overall_status);
  let list = List::new(items).block(
    Block::default()
      .borders(Borders::ALL)
      .title(Span::styled(title, Style::default().fg(health_color(health.overall_status)))),
  );
  f.render_widget(list, area);
}
