use std::error::Error;
use std::io::stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap};

use crate::audible_state::AudibleState;
use crate::client::Client;
use crate::control::api;
use crate::control::sim::{SimulatedHost, seed_demo_session};
use crate::device::{Device, DeviceStatus};
use crate::{DeviceConfig, NullNotifier, pop_log};

const TICK_RATE: Duration = Duration::from_millis(100);
const VOLUME_STEP: i32 = 5;
const PAN_STEP: i32 = 10;

#[derive(Default)]
struct AppState {
    status: Option<DeviceStatus>,
    selected: usize,
    message: Option<String>,
    last_update: Option<Instant>,
}

/// Run the ratatui-based developer console against a simulated session.
pub fn run() -> Result<(), Box<dyn Error>> {
    let device = Device::new(DeviceConfig::default(), Arc::new(NullNotifier))?;
    seed_demo_session(&device)?;
    let host = SimulatedHost::start(Arc::clone(&device))?;

    setup_terminal()?;
    let result = run_console(&device);
    restore_terminal()?;

    drop(host);
    result
}

fn run_console(device: &Arc<Device>) -> Result<(), Box<dyn Error>> {
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let status_rx = api::spawn_status_poller(Arc::clone(device), TICK_RATE);
    let mut app = AppState::default();

    loop {
        terminal.draw(|frame| draw(frame, &app))?;

        if let Some(status) = try_recv_latest(&status_rx) {
            let client_count = status.clients.len();
            app.status = Some(status);
            app.last_update = Some(Instant::now());
            app.selected = app.selected.min(client_count.saturating_sub(1));
        }
        while let Some(line) = pop_log() {
            app.message = Some(line);
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&mut app, device, key) {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

fn handle_key(app: &mut AppState, device: &Arc<Device>, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') => return true,
        KeyCode::Up => {
            app.selected = app.selected.saturating_sub(1);
        }
        KeyCode::Down => {
            if let Some(status) = &app.status {
                if app.selected + 1 < status.clients.len() {
                    app.selected += 1;
                }
            }
        }
        KeyCode::Char(c @ ('+' | '=' | '-')) => {
            if let Some(client) = current_client(app) {
                let delta = if c == '-' { -VOLUME_STEP } else { VOLUME_STEP };
                app.message = Some(match api::nudge_volume(device, &client, delta) {
                    Ok(raw) => format!("{} volume {raw}", label(&client)),
                    Err(err) => format!("volume change failed: {err}"),
                });
            }
        }
        KeyCode::Left | KeyCode::Right => {
            if let Some(client) = current_client(app) {
                let delta = if key.code == KeyCode::Left { -PAN_STEP } else { PAN_STEP };
                app.message = Some(match api::nudge_pan(device, &client, delta) {
                    Ok(pan) => format!("{} pan {pan}", label(&client)),
                    Err(err) => format!("pan change failed: {err}"),
                });
            }
        }
        KeyCode::Char('m') => {
            if let Some(client) = current_client(app) {
                app.message = Some(match api::make_music_player(device, &client) {
                    Ok(()) => format!("{} is the music player", label(&client)),
                    Err(err) => format!("music player change failed: {err}"),
                });
            }
        }
        KeyCode::Char('i') => {
            if let Some(client) = current_client(app) {
                app.message = Some(match api::toggle_io(device, &client) {
                    Ok(true) => format!("{} started IO", label(&client)),
                    Ok(false) => format!("{} stopped IO", label(&client)),
                    Err(err) => format!("IO toggle failed: {err}"),
                });
            }
        }
        _ => {}
    }
    false
}

fn current_client(app: &AppState) -> Option<Client> {
    app.status.as_ref()?.clients.get(app.selected).cloned()
}

fn label(client: &Client) -> String {
    client
        .bundle_id_str()
        .map(str::to_owned)
        .unwrap_or_else(|| format!("pid {}", client.process_id))
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(4),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_clients(frame, chunks[1], app);
    draw_footer(frame, chunks[2], app);
}

fn audible_style(state: AudibleState) -> Style {
    match state {
        AudibleState::Silent => Style::default().fg(Color::DarkGray),
        AudibleState::SilentExceptMusic => Style::default().fg(Color::Magenta),
        AudibleState::Audible => Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
    }
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Volume Console").borders(Borders::ALL);

    let content = if let Some(status) = &app.status {
        Paragraph::new(Line::from(vec![
            Span::raw(format!(
                "Running: {}    IO clients: {} ({} excl. app)    Music player: {}    Free tasks: {}    ",
                if status.is_running { "yes" } else { "no" },
                status.io_counts.total,
                status.io_counts.excluding_app,
                music_player_label(status),
                status.free_tasks,
            )),
            Span::styled(
                format!("{:?}", status.audible_state),
                audible_style(status.audible_state),
            ),
        ]))
    } else {
        Paragraph::new(Line::from(vec![Span::styled(
            "Waiting for device status",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]))
    };

    frame.render_widget(content.block(block), area);
}

fn music_player_label(status: &DeviceStatus) -> String {
    if !status.music_player_bundle_id.is_empty() {
        status.music_player_bundle_id.clone()
    } else if status.music_player_pid != 0 {
        format!("pid {}", status.music_player_pid)
    } else {
        "none".to_owned()
    }
}

fn draw_clients(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Clients").borders(Borders::ALL);

    let Some(status) = &app.status else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };

    let header = Row::new(vec![
        Cell::from(""),
        Cell::from("Id"),
        Cell::from("Pid"),
        Cell::from("Bundle id"),
        Cell::from("IO"),
        Cell::from("Music"),
        Cell::from("Volume"),
        Cell::from("Pan"),
    ])
    .style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows = status.clients.iter().enumerate().map(|(idx, client)| {
        let indicator = if idx == app.selected { ">" } else { "" };
        let mut row = Row::new(vec![
            Cell::from(indicator.to_string()),
            Cell::from(client.client_id.to_string()),
            Cell::from(client.process_id.to_string()),
            Cell::from(client.bundle_id_str().unwrap_or("-").to_owned()),
            Cell::from(if client.doing_io { "Yes" } else { "No" }),
            Cell::from(if client.is_music_player { "Yes" } else { "" }),
            Cell::from(format!("{:.2}", client.relative_volume)),
            Cell::from(client.pan_position.to_string()),
        ]);
        if idx == app.selected {
            row = row.style(Style::default().fg(Color::Yellow));
        }
        row
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Length(4),
            Constraint::Length(7),
            Constraint::Length(32),
            Constraint::Length(4),
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Length(6),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(2);

    frame.render_widget(table, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "Up/Down: Select  •  +/-: Volume  •  Left/Right: Pan  •  m: Music player  •  i: Toggle IO  •  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
