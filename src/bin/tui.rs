//! Real-time ECG chart viewer.
//!
//! Usage:
//!   cargo run --bin tui                          # radio on /dev/ttyACM0
//!   cargo run --bin tui -- --port /dev/ttyUSB0   # another port
//!   cargo run --bin tui -- --simulate            # built-in fake sensor (no hardware needed)
//!
//! Keys
//! ----
//!   +  / =   zoom out  (increase mV scale)
//!   -        zoom in   (decrease mV scale)
//!   a        auto-scale: fit Y axis to current peak amplitude
//!   v        toggle smooth overlay (dim raw + bright moving-average)
//!   p        freeze the chart (collection continues)
//!   r        unfreeze
//!   c        clear the sample buffer
//!   q / Esc  quit

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame, Terminal,
};
use tokio::sync::mpsc;

use ecg_ble::collector::{CollectorHandle, EcgCollector};
use ecg_ble::config::{CollectorConfig, SerialConfig};
use ecg_ble::parse::FragmentLayout;
use ecg_ble::protocol::DEFAULT_DEVICE_NAME;
use ecg_ble::simulator::{SimulatedRadio, SimulatorConfig};
use ecg_ble::sink::SampleBuffer;
use ecg_ble::transport::{SerialTransport, Transport};
use ecg_ble::types::{Address, CollectorEvent, DiscoveryState};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Discrete Y-axis scale steps in mV (half the full symmetric range ±scale).
/// The user cycles through these with `+` / `-`; `a` picks the best fit automatically.
const Y_SCALES: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 100.0, 1000.0];

/// ±2 mV shows a normal QRS complex with headroom.
const DEFAULT_SCALE: usize = 4;

const TRACE_COLOR: Color = Color::Green;
const DIM_TRACE_COLOR: Color = Color::Rgb(0, 100, 0);

/// Moving-average window in samples.
const SMOOTH_WINDOW: usize = 5;

/// Braille spinner frames cycled at ~100 ms intervals to indicate background activity.
const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(version, about = "Real-time ECG chart for a BGAPI serial BLE radio")]
struct Args {
    /// Serial port device name
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Serial port baud rate
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Packet mode (prefix API packets with <length> byte)
    #[arg(short = 'k', long)]
    packet: bool,

    /// Counter mode (read the packet counter and report lost packets)
    #[arg(short, long)]
    counter: bool,

    /// Advertised name of the sensor
    #[arg(long, default_value = DEFAULT_DEVICE_NAME)]
    name: String,

    /// Decode ECG values with the zero byte in the low position.
    ///
    /// The vendor's collector uses this layout; without it, real hardware
    /// reads as a flat line of subnormal values.
    #[arg(long)]
    low_byte_omitted: bool,

    /// Use the built-in simulated sensor
    #[arg(long)]
    simulate: bool,
}

// ── App state (shared with the event task via Arc<Mutex<_>>) ──────────────────

pub struct App {
    // ── Chart data, refreshed from the collector's buffer every frame
    samples: Vec<f64>,

    // ── Status
    pub state: DiscoveryState,
    pub sensor: Option<Address>,
    pub simulated: bool,
    pub counter_mode: bool,
    /// Sum of all packet-loss reports so far.
    pub lost_total: i64,
    /// Last stall, failure or disconnect, shown in the footer.
    pub last_error: Option<String>,

    // ── Rate tracking
    total_samples: u64,
    pkt_times: VecDeque<Instant>,

    // ── UI controls
    scale_idx: usize,
    pub frozen: bool,
    pub smooth: bool,
}

impl App {
    fn new() -> Self {
        Self {
            samples: vec![],
            state: DiscoveryState::Standby,
            sensor: None,
            simulated: false,
            counter_mode: false,
            lost_total: 0,
            last_error: None,
            total_samples: 0,
            pkt_times: VecDeque::with_capacity(256),
            scale_idx: DEFAULT_SCALE,
            frozen: false,
            smooth: true,
        }
    }

    /// Record the arrival of one notification (two values).
    fn on_sample(&mut self) {
        self.total_samples += 2;
        let now = Instant::now();
        self.pkt_times.push_back(now);
        // Keep only arrival times from the last 2 seconds for rate computation.
        while self
            .pkt_times
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(2))
        {
            self.pkt_times.pop_front();
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.total_samples = 0;
        self.pkt_times.clear();
        self.lost_total = 0;
        self.last_error = None;
    }

    /// Notification arrival rate over the last two seconds.
    fn pkt_rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.pkt_times.front(), self.pkt_times.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first).as_secs_f64();
        if self.pkt_times.len() < 2 || span < 1e-9 {
            0.0
        } else {
            (self.pkt_times.len() as f64 - 1.0) / span
        }
    }

    fn y_range(&self) -> f64 {
        Y_SCALES[self.scale_idx]
    }

    fn scale_up(&mut self) {
        if self.scale_idx + 1 < Y_SCALES.len() {
            self.scale_idx += 1;
        }
    }

    fn scale_down(&mut self) {
        if self.scale_idx > 0 {
            self.scale_idx -= 1;
        }
    }

    /// Choose the smallest Y-scale step that fits the current peak amplitude
    /// with 10 % headroom.
    fn auto_scale(&mut self) {
        let peak = self
            .samples
            .iter()
            .filter(|v| v.is_finite())
            .fold(0.0_f64, |acc, &v| acc.max(v.abs()));
        let needed = peak * 1.1;
        self.scale_idx = Y_SCALES
            .iter()
            .position(|&s| s >= needed)
            .unwrap_or(Y_SCALES.len() - 1);
    }
}

/// Lock the shared state.  A panic in the event task cannot leave `App`
/// inconsistent enough to matter for drawing.
fn lock(app: &Mutex<App>) -> MutexGuard<'_, App> {
    app.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Symmetric moving-average (boxcar) smoother that preserves length.
fn smooth_signal(data: &[(f64, f64)], window: usize) -> Vec<(f64, f64)> {
    if data.len() < 3 || window < 2 {
        return data.to_vec();
    }
    let half = window / 2;
    data.iter()
        .enumerate()
        .map(|(i, &(x, _))| {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(data.len());
            let sum: f64 = data[start..end].iter().map(|&(_, y)| y).sum();
            (x, sum / (end - start) as f64)
        })
        .collect()
}

/// Forward collector events into `app` until the collector stops.
fn spawn_event_task(mut rx: mpsc::Receiver<CollectorEvent>, app: Arc<Mutex<App>>) {
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let mut s = lock(&app);
            match ev {
                CollectorEvent::StateChanged(state) => s.state = state,
                CollectorEvent::Connected(address) => {
                    s.sensor = Some(address);
                    s.last_error = None;
                }
                CollectorEvent::Sample(_) => s.on_sample(),
                CollectorEvent::PacketLoss(report) => s.lost_total += report.lost,
                CollectorEvent::Stalled(e) | CollectorEvent::Failed(e) => {
                    s.last_error = Some(e.to_string());
                }
                CollectorEvent::Disconnected { address, reason } => {
                    s.sensor = None;
                    s.last_error = Some(format!("lost {address} (reason {reason:#06x})"));
                }
            }
        }
        log::info!("Collector event stream ended");
    });
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn draw(frame: &mut Frame, app: &App) {
    let root = Layout::vertical([
        Constraint::Length(3),
        Constraint::Min(0),
        Constraint::Length(4),
    ])
    .split(frame.area());

    draw_header(frame, root[0], app);
    draw_chart(frame, root[1], app);
    draw_footer(frame, root[2], app);
}

fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

/// Status bar: title, discovery state, sensor address, packet rate, scale,
/// packet loss (counter mode only) and sample count.
fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let (label, color) = match app.state {
        DiscoveryState::Listening => {
            let who = app
                .sensor
                .map(|a| a.to_string())
                .unwrap_or_else(|| "sensor".into());
            let tag = if app.simulated { "◆" } else { "●" };
            (format!("{tag} Streaming from {who}"), Color::Green)
        }
        DiscoveryState::Failed => ("✗ Discovery failed".to_owned(), Color::Red),
        DiscoveryState::Disconnected => {
            (format!("{} Disconnected, scanning…", spinner_str()), Color::Red)
        }
        DiscoveryState::Standby => (format!("{} Scanning…", spinner_str()), Color::Yellow),
        state => (format!("{} {}…", spinner_str(), capitalise(&state.to_string())), Color::Yellow),
    };

    let rate = format!("{:.1} pkt/s", app.pkt_rate());
    let scale = format!("±{} mV", app.y_range());
    let total = format!("{}K smp", app.total_samples / 1_000);

    let mut spans = vec![
        Span::styled(
            " ECG Monitor ",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        sep(),
        Span::styled(rate, Style::default().fg(Color::White)),
        sep(),
        Span::styled(
            scale,
            Style::default()
                .fg(Color::LightBlue)
                .add_modifier(Modifier::BOLD),
        ),
    ];
    if app.counter_mode {
        let style = if app.lost_total > 0 {
            Style::default().fg(Color::Red)
        } else {
            Style::default().fg(Color::White)
        };
        spans.push(sep());
        spans.push(Span::styled(format!("lost {}", app.lost_total), style));
    }
    spans.push(sep());
    spans.push(Span::styled(total, Style::default().fg(Color::DarkGray)));
    spans.push(Span::raw(" "));

    frame.render_widget(
        Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[inline]
fn sep<'a>() -> Span<'a> {
    Span::styled(" │ ", Style::default().fg(Color::DarkGray))
}

/// The waveform, oldest sample on the left.
fn draw_chart(frame: &mut Frame, area: Rect, app: &App) {
    let y_range = app.y_range();
    let width = app.samples.len().max(2) as f64;

    // Clamp to the visible Y window; ratatui drops out-of-range points.
    let data: Vec<(f64, f64)> = app
        .samples
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(i, &v)| (i as f64, v.clamp(-y_range, y_range)))
        .collect();

    let (min_v, max_v) = app
        .samples
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let (min_v, max_v) = if min_v.is_finite() { (min_v, max_v) } else { (0.0, 0.0) };
    let clipping = max_v > y_range || min_v < -y_range;

    let clip_tag = if clipping { " [CLIP +]" } else { "" };
    let smooth_tag = if app.smooth { " [SMOOTH]" } else { "" };
    let frozen_tag = if app.frozen { " [FROZEN]" } else { "" };
    let title = format!(
        " ECG  min:{min_v:+8.3}  max:{max_v:+8.3} mV{clip_tag}{smooth_tag}{frozen_tag} "
    );

    let smoothed = if app.smooth {
        smooth_signal(&data, SMOOTH_WINDOW)
    } else {
        vec![]
    };
    let datasets: Vec<Dataset> = if app.smooth {
        vec![
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(DIM_TRACE_COLOR))
                .data(&data),
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(TRACE_COLOR))
                .data(&smoothed),
        ]
    } else {
        vec![Dataset::default()
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(TRACE_COLOR))
            .data(&data)]
    };

    let y_labels: Vec<String> = [-1.0, -0.5, 0.0, 0.5, 1.0]
        .iter()
        .map(|&f| format!("{:+}", f * y_range))
        .collect();
    let x_labels = vec![
        "oldest".to_string(),
        format!("{} samples", app.samples.len()),
        "newest".to_string(),
    ];

    let border = if clipping { Color::Red } else { TRACE_COLOR };
    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title(Span::styled(
                    title,
                    Style::default().fg(TRACE_COLOR).add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(border)),
        )
        .x_axis(
            Axis::default()
                .bounds([0.0, width - 1.0])
                .labels(x_labels)
                .style(Style::default().fg(Color::DarkGray)),
        )
        .y_axis(
            Axis::default()
                .bounds([-y_range, y_range])
                .labels(y_labels)
                .style(Style::default().fg(Color::DarkGray)),
        );

    frame.render_widget(chart, area);
}

/// Key reference on the first line; the last error on the second.
fn draw_footer(frame: &mut Frame, area: Rect, app: &App) {
    let keys = Line::from(vec![
        Span::raw(" "),
        key("[+]"),
        Span::raw("Scale↑  "),
        key("[-]"),
        Span::raw("Scale↓  "),
        key("[a]"),
        Span::raw("Auto-scale  "),
        key("[v]"),
        Span::raw(if app.smooth { "Raw  " } else { "Smooth  " }),
        key("[p]"),
        Span::raw("Freeze  "),
        key("[r]"),
        Span::raw("Unfreeze  "),
        key("[c]"),
        Span::raw("Clear  "),
        key("[q]"),
        Span::raw("Quit"),
    ]);

    let status = match (&app.last_error, app.state) {
        (Some(e), _) => Line::from(Span::styled(
            format!(" {e}"),
            Style::default().fg(Color::Yellow),
        )),
        (None, DiscoveryState::Standby) => Line::from(Span::styled(
            " Waiting for the sensor to advertise. Make sure it is powered on and in range.",
            Style::default().fg(Color::DarkGray),
        )),
        (None, _) => Line::from(""),
    };

    frame.render_widget(
        Paragraph::new(vec![keys, status]).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

#[inline]
fn key(s: &str) -> Span<'_> {
    Span::styled(
        s,
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    )
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Start the collector on `transport` and wire its events into `app`.
fn start<T: Transport + 'static>(
    transport: T,
    config: CollectorConfig,
    app: &Arc<Mutex<App>>,
) -> CollectorHandle {
    let (rx, handle, _task) = EcgCollector::new(config).start(transport);
    spawn_event_task(rx, Arc::clone(app));
    handle
}

#[tokio::main]
async fn main() -> Result<()> {
    use std::io::IsTerminal as _;
    if !io::stdout().is_terminal() {
        eprintln!("Error: ecg-ble tui requires a real terminal (TTY).");
        eprintln!("Run it directly in a terminal emulator, not piped or redirected.");
        std::process::exit(1);
    }
    let args = Args::parse();

    // ── Logging ─────────────────────────────────────────────────────────────
    // Write logs to a file so they never interfere with the TUI display.
    // Logs are written to ecg-tui.log in the current directory.
    {
        use std::fs::File;
        if let Ok(file) = File::create("ecg-tui.log") {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
    }

    let app = Arc::new(Mutex::new(App::new()));
    let mut config = CollectorConfig {
        target_name: args.name.clone(),
        counter_mode: args.counter,
        fragment_layout: if args.low_byte_omitted {
            FragmentLayout::LowByteOmitted
        } else {
            FragmentLayout::HighByteOmitted
        },
        ..CollectorConfig::default()
    };
    lock(&app).counter_mode = config.counter_mode;

    // ── Start data source ─────────────────────────────────────────────────────
    let handle = if args.simulate {
        config.fragment_layout = FragmentLayout::LowByteOmitted;
        lock(&app).simulated = true;
        let (transport, _radio) = SimulatedRadio::spawn(SimulatorConfig {
            name: args.name.clone(),
            layout: config.fragment_layout,
            drop_every: args.counter.then_some(97),
            ..SimulatorConfig::default()
        });
        start(transport, config, &app)
    } else {
        let serial = SerialConfig {
            port: args.port.clone(),
            baud: args.baud,
            packet_mode: args.packet,
            ..SerialConfig::default()
        };
        match SerialTransport::open(&serial) {
            Ok(transport) => start(transport, config, &app),
            Err(e) => {
                eprintln!("Port error (name='{}', baud='{}'): {e}", serial.port, serial.baud);
                std::process::exit(2);
            }
        }
    };
    let buffer: SampleBuffer = handle.buffer();

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let tick = Duration::from_millis(33); // ~30 FPS

    // ── Main loop ─────────────────────────────────────────────────────────────
    loop {
        {
            let mut s = lock(&app);
            if !s.frozen {
                s.samples = buffer.snapshot().into_iter().map(f64::from).collect();
            }
            terminal.draw(|f| draw(f, &s))?;
        }

        if !event::poll(tick)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,

            KeyCode::Char('+') | KeyCode::Char('=') => lock(&app).scale_up(),
            KeyCode::Char('-') => lock(&app).scale_down(),
            KeyCode::Char('a') => lock(&app).auto_scale(),
            KeyCode::Char('v') => {
                let mut s = lock(&app);
                s.smooth = !s.smooth;
            }
            KeyCode::Char('p') => lock(&app).frozen = true,
            KeyCode::Char('r') => lock(&app).frozen = false,
            KeyCode::Char('c') => {
                buffer.clear();
                lock(&app).clear();
            }
            _ => {}
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    handle.stop();
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_scale_fits_peak() {
        let mut app = App::new();
        app.samples = vec![0.1, -1.4, 0.9];
        app.auto_scale();
        assert_eq!(app.y_range(), 2.0);

        app.samples = vec![f64::NAN, 0.05];
        app.auto_scale();
        assert_eq!(app.y_range(), 0.1);
    }

    #[test]
    fn scale_steps_are_clamped() {
        let mut app = App::new();
        for _ in 0..20 {
            app.scale_up();
        }
        assert_eq!(app.y_range(), 1000.0);
        for _ in 0..20 {
            app.scale_down();
        }
        assert_eq!(app.y_range(), 0.1);
    }

    #[test]
    fn smoothing_preserves_length() {
        let data: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, (i % 2) as f64)).collect();
        let out = smooth_signal(&data, 5);
        assert_eq!(out.len(), data.len());
        assert!(out.iter().all(|&(_, y)| (0.0..=1.0).contains(&y)));
    }

    #[test]
    fn capitalise_first_letter() {
        assert_eq!(capitalise("finding services"), "Finding services");
        assert_eq!(capitalise(""), "");
    }
}
