use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ofstats_core::{DeviceId, Metric, PortSummary, QueryService, RangeRequest, StatsKey};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols;
use ratatui::text::{Line, Span};
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph};
use ratatui::{Frame, Terminal};

/// Chart order, two per row.
const CHARTS: [(Metric, Color); 8] = [
    (Metric::RxBytes, Color::Yellow),
    (Metric::TxBytes, Color::Cyan),
    (Metric::RxPackets, Color::Green),
    (Metric::TxPackets, Color::Magenta),
    (Metric::RxDropped, Color::Blue),
    (Metric::TxDropped, Color::LightBlue),
    (Metric::RxErrors, Color::Red),
    (Metric::TxErrors, Color::LightYellow),
];

const REFRESH: Duration = Duration::from_millis(500);

struct RateHistory {
    metric: Metric,
    title: String,
    color: Color,
    points: VecDeque<(f64, f64)>,
    last_ts: Option<DateTime<Utc>>,
}

impl RateHistory {
    fn new(metric: Metric, color: Color) -> Self {
        Self {
            metric,
            title: format!("{metric} ({})", metric.unit()),
            color,
            points: VecDeque::new(),
            last_ts: None,
        }
    }

    /// Each stored sample is plotted once; anything older than the window falls off.
    fn push(&mut self, ts: DateTime<Utc>, x: f64, y: f64, window_sec: f64) {
        if self.last_ts.is_some_and(|last| ts <= last) {
            return;
        }
        self.last_ts = Some(ts);
        self.points.push_back((x, y));
        while self.points.front().is_some_and(|(old_x, _)| x - old_x > window_sec) {
            self.points.pop_front();
        }
    }

    fn clear(&mut self) {
        self.points.clear();
        self.last_ts = None;
    }

    /// Rates are never negative, so the lower bound stops at zero.
    fn y_bounds(&self) -> [f64; 2] {
        let Some(max) = self.points.iter().map(|(_, y)| *y).reduce(f64::max) else {
            return [0.0, 1.0];
        };
        let min = self.points.iter().map(|(_, y)| *y).fold(max, f64::min);
        let pad = if max - min < f64::EPSILON { 1.0 } else { (max - min) * 0.12 };
        [(min - pad).max(0.0), max + pad]
    }
}

struct PortView {
    device: DeviceId,
    port_no: u32,
    start: DateTime<Utc>,
    summary: Option<PortSummary>,
    known_ports: Vec<u32>,
    charts: Vec<RateHistory>,
}

impl PortView {
    fn new(device: DeviceId, port_no: u32) -> Self {
        Self {
            device,
            port_no,
            start: Utc::now(),
            summary: None,
            known_ports: Vec::new(),
            charts: CHARTS
                .iter()
                .map(|(metric, color)| RateHistory::new(*metric, *color))
                .collect(),
        }
    }

    fn key(&self) -> StatsKey {
        StatsKey::port(self.device.clone(), self.port_no)
    }

    fn seconds_since_start(&self, ts: DateTime<Utc>) -> f64 {
        (ts - self.start).num_milliseconds() as f64 / 1000.0
    }

    /// Fill the charts with what the store already holds for the window.
    fn backfill(&mut self, query: &QueryService, window_sec: f64) {
        let to = Utc::now();
        let from = to - chrono::Duration::milliseconds((window_sec * 1000.0) as i64);
        let key = self.key();
        let start = self.start;
        for chart in &mut self.charts {
            let Ok(range) = query.get_range(&key, chart.metric, RangeRequest::new(from, to)) else {
                continue;
            };
            for point in range.points() {
                let x = (point.timestamp - start).num_milliseconds() as f64 / 1000.0;
                chart.push(point.timestamp, x, point.value, window_sec);
            }
        }
    }

    fn refresh(&mut self, query: &QueryService, window_sec: f64) {
        let key = self.key();
        let start = self.start;
        for chart in &mut self.charts {
            let Ok(Some(latest)) = query.get_instant(&key, chart.metric) else {
                continue;
            };
            if let Some(value) = latest.value {
                let x = (latest.timestamp - start).num_milliseconds() as f64 / 1000.0;
                chart.push(latest.timestamp, x, value, window_sec);
            }
        }

        let ports = query.port_summaries(&self.device).unwrap_or_default();
        self.known_ports = ports.iter().map(|p| p.port_no).collect();
        self.summary = ports.into_iter().find(|p| p.port_no == self.port_no);
    }

    /// Move to the previous or next known port and start its charts over.
    fn step_port(&mut self, forward: bool, query: &QueryService, window_sec: f64) {
        if self.known_ports.is_empty() {
            return;
        }
        let idx = self
            .known_ports
            .iter()
            .position(|no| *no == self.port_no)
            .unwrap_or(0);
        let len = self.known_ports.len();
        let next = if forward { (idx + 1) % len } else { (idx + len - 1) % len };
        if self.known_ports[next] == self.port_no {
            return;
        }
        self.port_no = self.known_ports[next];
        self.summary = None;
        for chart in &mut self.charts {
            chart.clear();
        }
        self.backfill(query, window_sec);
        self.refresh(query, window_sec);
    }
}

pub async fn run_viewer(query: &QueryService, key: StatsKey, window_sec: f64) -> Result<()> {
    let ofstats_core::ItemKey::Port(port_no) = key.item else {
        anyhow::bail!("the viewer charts ports only, got {key}");
    };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut view = PortView::new(key.device, port_no);
    view.backfill(query, window_sec);
    let mut next_refresh = Instant::now();

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(press) = event::read()? {
                    if press.kind == KeyEventKind::Press {
                        match press.code {
                            KeyCode::Char('q') | KeyCode::Esc => break,
                            KeyCode::Right | KeyCode::Char('n') => view.step_port(true, query, window_sec),
                            KeyCode::Left | KeyCode::Char('p') => view.step_port(false, query, window_sec),
                            _ => {}
                        }
                    }
                }
            }

            if Instant::now() >= next_refresh {
                view.refresh(query, window_sec);
                next_refresh = Instant::now() + REFRESH;
            }

            // Polling runs on other tasks; let them in between frames.
            tokio::task::yield_now().await;
            terminal.draw(|frame| draw(frame, &view, window_sec))?;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw(frame: &mut Frame<'_>, view: &PortView, window_sec: f64) {
    let [header_area, charts_area] = split(
        frame.size(),
        Direction::Vertical,
        &[Constraint::Length(4), Constraint::Min(0)],
    );
    frame.render_widget(header(view, window_sec), header_area);

    let now_sec = view.seconds_since_start(Utc::now());
    let rows = split(charts_area, Direction::Vertical, &[Constraint::Ratio(1, 4); 4]);
    let cells = rows
        .into_iter()
        .flat_map(|row| split(row, Direction::Horizontal, &[Constraint::Ratio(1, 2); 2]));
    for (cell, chart) in cells.zip(&view.charts) {
        render_rate_chart(frame, cell, chart, now_sec, window_sec);
    }
}

fn split<const N: usize>(area: Rect, direction: Direction, constraints: &[Constraint; N]) -> [Rect; N] {
    let chunks = Layout::default()
        .direction(direction)
        .constraints(constraints.to_vec())
        .split(area);
    std::array::from_fn(|i| chunks.get(i).copied().unwrap_or_default())
}

fn percent(util: Option<f64>) -> String {
    util.map_or_else(|| "n/a".to_string(), |u| format!("{:.2}%", u * 100.0))
}

fn header(view: &PortView, window_sec: f64) -> Paragraph<'static> {
    let title = Span::styled(
        format!("{}  ", view.key()),
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
    );
    let lines = match &view.summary {
        Some(port) => {
            let speed = port
                .speed
                .map_or_else(|| "unknown".to_string(), |bps| format!("{bps:.0} B/s"));
            let seen = port
                .timestamp
                .map_or_else(|| "no sample yet".to_string(), |ts| ts.to_rfc3339());
            vec![
                Line::from(vec![
                    title,
                    Span::raw(format!(
                        "speed={speed} ({:?})  rx_util={}  tx_util={}{}",
                        port.speed_source,
                        percent(port.rx_util),
                        percent(port.tx_util),
                        if port.reset { "  counter reset" } else { "" },
                    )),
                ]),
                Line::from(format!(
                    "{}  last={seen}  window={}s  [<-/->] port  [q] quit",
                    port.name.as_deref().unwrap_or("-"),
                    window_sec as u64
                )),
            ]
        }
        None => vec![Line::from(vec![title, Span::raw("waiting for the first reply...")])],
    };

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Port"))
}

fn axis(title: &'static str, bounds: [f64; 2], precision: usize) -> Axis<'static> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    Axis::default()
        .title(title)
        .style(Style::default().fg(Color::Gray))
        .bounds(bounds)
        .labels(
            [bounds[0], mid, bounds[1]]
                .into_iter()
                .map(|v| Span::raw(format!("{v:.precision$}")))
                .collect(),
        )
}

fn render_rate_chart(frame: &mut Frame<'_>, area: Rect, chart: &RateHistory, now_sec: f64, window_sec: f64) {
    let points: Vec<(f64, f64)> = chart.points.iter().copied().collect();
    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(chart.color))
        .data(&points);

    let widget = Chart::new(vec![dataset])
        .block(Block::default().borders(Borders::ALL).title(chart.title.clone()))
        .x_axis(axis("time (s)", [now_sec - window_sec, now_sec], 0))
        .y_axis(axis(chart.metric.unit(), chart.y_bounds(), 1));
    frame.render_widget(widget, area);
}
