//! Interactive Fluid Simulation Demo
//!
//! Runs the simulation inside the terminal. Each character cell shows two
//! grid cells with an upper half block, so the grid is as wide as the
//! terminal and twice as tall.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --package demo-interactive 2> fluid.log
//! ```
//!
//! # Controls
//!
//! - drag with the left mouse button to push fluid and add dye
//! - `v` - cycle the displayed field (density, pressure, velocity, vorticity)
//! - `space` - pause / resume
//! - `r` - restart the simulation
//! - `q` / `Esc` - quit
//!
//! Logs go to stderr; redirect it to keep the display clean.

use std::error::Error;
use std::io::stdout;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fluid_sim_core::{
    create_backend, BackendPreference, ComputeBackend, FluidSimulation, FrameOutcome,
    FrameReport, SimulationConfig,
};
use ratatui::buffer::Buffer;
use ratatui::crossterm::event::{
    self, DisableFocusChange, DisableMouseCapture, EnableFocusChange, EnableMouseCapture, Event,
    KeyCode, KeyEventKind, MouseButton, MouseEvent, MouseEventKind,
};
use ratatui::crossterm::execute;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Style};
use ratatui::text::Line;
use ratatui::widgets::{Paragraph, Widget};
use ratatui::{DefaultTerminal, Frame};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Target frame period (about 60 fps)
const FRAME_PERIOD: Duration = Duration::from_millis(16);

/// Grid cells per terminal row
const ROWS_PER_CELL: u32 = 2;

fn config() -> SimulationConfig {
    SimulationConfig {
        // Screen pixels are terminal columns here, so the radius is small
        ink_radius: 6.0,
        impulse_scalar: 0.8,
        visualize_scale: 1.0,
        ..SimulationConfig::default()
    }
}

/// Screen size in simulation pixels for a terminal area
fn screen_size(area: Rect) -> (u32, u32) {
    (
        u32::from(area.width.max(1)),
        u32::from(area.height.max(1)) * ROWS_PER_CELL,
    )
}

fn unpack(pixel: u32) -> Color {
    let [r, g, b, _] = pixel.to_le_bytes();
    Color::Rgb(r, g, b)
}

/// Draws a packed RGBA surface with one upper half block per two rows
struct SurfaceView<'a> {
    pixels: &'a [u32],
    width: u32,
    height: u32,
}

impl Widget for SurfaceView<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let pixel = |x: u32, y: u32| {
            if x < self.width && y < self.height {
                self.pixels
                    .get((y * self.width + x) as usize)
                    .copied()
                    .map_or(Color::Black, unpack)
            } else {
                Color::Black
            }
        };

        for row in 0..area.height {
            for col in 0..area.width {
                let (x, y) = (u32::from(col), u32::from(row) * ROWS_PER_CELL);
                if let Some(cell) = buf.cell_mut((area.x + col, area.y + row)) {
                    cell.set_symbol("▀")
                        .set_fg(pixel(x, y))
                        .set_bg(pixel(x, y + 1));
                }
            }
        }
    }
}

struct App {
    sim: FluidSimulation,
    fluid_area: Rect,
    last_report: Option<FrameReport>,
    frame_time: Duration,
    quit: bool,
}

impl App {
    fn new(backend: Arc<dyn ComputeBackend>, fluid_area: Rect) -> Result<Self, Box<dyn Error>> {
        let (width, height) = screen_size(fluid_area);
        let sim = FluidSimulation::new(backend, config(), width, height)?;
        Ok(Self {
            sim,
            fluid_area,
            last_report: None,
            frame_time: Duration::ZERO,
            quit: false,
        })
    }

    fn split(area: Rect) -> [Rect; 2] {
        Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).areas(area)
    }

    fn run(&mut self, terminal: &mut DefaultTerminal) -> Result<(), Box<dyn Error>> {
        while !self.quit {
            let started = Instant::now();
            while event::poll(Duration::ZERO)? {
                self.handle_event(&event::read()?)?;
            }

            if let FrameOutcome::Rendered(report) = self.sim.render_frame() {
                self.last_report = Some(report);
            }
            let pixels = self.sim.read_presented()?;
            terminal.draw(|frame| self.draw(frame, &pixels))?;

            self.frame_time = started.elapsed();
            if let Some(rest) = FRAME_PERIOD.checked_sub(self.frame_time) {
                thread::sleep(rest);
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: &Event) -> Result<(), Box<dyn Error>> {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => match key.code {
                KeyCode::Char('q') | KeyCode::Esc => self.quit = true,
                KeyCode::Char('v') => {
                    let view = self.sim.advance_view();
                    info!("Showing {}", view);
                }
                KeyCode::Char(' ') => {
                    self.sim.toggle_pause();
                }
                KeyCode::Char('r') => self.restart()?,
                _ => {}
            },
            Event::Mouse(mouse) => self.handle_mouse(mouse),
            Event::Resize(width, height) => {
                let [fluid_area, _] = Self::split(Rect::new(0, 0, *width, *height));
                let (screen_width, screen_height) = screen_size(fluid_area);
                self.sim.resize(screen_width, screen_height)?;
                self.fluid_area = fluid_area;
            }
            Event::FocusLost => self.sim.focus_lost(),
            Event::FocusGained => self.sim.focus_gained(),
            _ => {}
        }
        Ok(())
    }

    fn handle_mouse(&mut self, mouse: &MouseEvent) {
        let x = f32::from(mouse.column);
        let y = f32::from(mouse.row) * ROWS_PER_CELL as f32;
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => self.sim.pointer_down(x, y),
            MouseEventKind::Drag(MouseButton::Left) => self.sim.pointer_move(x, y),
            MouseEventKind::Up(MouseButton::Left) => self.sim.pointer_up(),
            _ => {}
        }
    }

    /// Clear every field by recreating them at the current size
    fn restart(&mut self) -> Result<(), Box<dyn Error>> {
        let (width, height) = screen_size(self.fluid_area);
        self.sim.resize(width, height)?;
        self.last_report = None;
        Ok(())
    }

    fn draw(&self, frame: &mut Frame, pixels: &[u32]) {
        let [fluid_area, status_area] = Self::split(frame.area());
        let (width, height) = self.sim.grid_size();
        frame.render_widget(
            SurfaceView {
                pixels,
                width,
                height,
            },
            fluid_area,
        );

        let stages = self.last_report.map_or_else(
            || "-".to_string(),
            |r| format!("{}/{}", r.stages_executed, r.stages_planned),
        );
        let status = format!(
            " {} | view: {} | {} | frame {} | stages {} | {:.1} ms | in flight {} | v: view  space: pause  r: restart  q: quit",
            self.sim.backend().name(),
            self.sim.view(),
            if self.sim.is_paused() { "paused" } else { "running" },
            self.sim.frame_index(),
            stages,
            self.frame_time.as_secs_f64() * 1000.0,
            self.sim.in_flight(),
        );
        frame.render_widget(
            Paragraph::new(Line::from(status)).style(Style::default().fg(Color::Black).bg(Color::Gray)),
            status_area,
        );
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let backend = create_backend(BackendPreference::Auto)?;

    let mut terminal = ratatui::init();
    execute!(stdout(), EnableMouseCapture, EnableFocusChange)?;

    let result = terminal
        .size()
        .map_err(Box::<dyn Error>::from)
        .and_then(|size| {
            let [fluid_area, _] = App::split(Rect::new(0, 0, size.width, size.height));
            App::new(backend, fluid_area)
        })
        .and_then(|mut app| app.run(&mut terminal));

    execute!(stdout(), DisableMouseCapture, DisableFocusChange)?;
    ratatui::restore();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screen_size_doubles_rows() {
        assert_eq!(screen_size(Rect::new(0, 0, 80, 23)), (80, 46));
        assert_eq!(screen_size(Rect::new(0, 0, 0, 0)), (1, 2));
    }

    #[test]
    fn test_unpack_little_endian() {
        assert_eq!(unpack(0xFF30_2010), Color::Rgb(0x10, 0x20, 0x30));
    }

    #[test]
    fn test_surface_view_half_blocks() {
        let pixels = [0xFF00_00FF, 0xFF00_FF00];
        let area = Rect::new(0, 0, 1, 1);
        let mut buf = Buffer::empty(area);
        SurfaceView {
            pixels: &pixels,
            width: 1,
            height: 2,
        }
        .render(area, &mut buf);

        let cell = &buf[(0, 0)];
        assert_eq!(cell.symbol(), "▀");
        assert_eq!(cell.fg, Color::Rgb(0xFF, 0, 0));
        assert_eq!(cell.bg, Color::Rgb(0, 0xFF, 0));
    }
}
