//! Headless fluid simulation driver
//!
//! Runs the simulation without a window, feeding it seeded random pointer
//! strokes, and prints per-interval statistics. Useful for benchmarking
//! backends and checking that long runs stay stable.
//!
//! ```bash
//! cargo run --release --package demo-headless -- --frames 600 --backend cpu
//! cargo run --release --package demo-headless -- --config sim.json --json
//! ```

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, ValueEnum};
use fluid_sim_core::{
    create_backend, BackendPreference, FieldKind, FluidSimulation, FrameOutcome, Precision,
    SimulationConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Auto,
    Gpu,
    Cpu,
}

impl From<BackendArg> for BackendPreference {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => Self::Auto,
            BackendArg::Gpu => Self::Gpu,
            BackendArg::Cpu => Self::Cpu,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PrecisionArg {
    Half,
    Full,
}

/// Headless stable-fluids run with scripted pointer strokes
#[derive(Parser, Debug)]
#[command(name = "fluid-sim-headless")]
#[command(about = "Run the fluid simulation without a window", long_about = None)]
struct Args {
    /// Screen width in pixels
    #[arg(long, default_value_t = 256)]
    width: u32,

    /// Screen height in pixels
    #[arg(long, default_value_t = 256)]
    height: u32,

    /// Frames to render
    #[arg(short, long, default_value_t = 300)]
    frames: u64,

    /// JSON file with a `SimulationConfig` (missing fields use defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Compute backend (overrides the config file)
    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    /// Field precision (overrides the config file)
    #[arg(long, value_enum)]
    precision: Option<PrecisionArg>,

    /// Jacobi iterations per frame (overrides the config file)
    #[arg(short = 'i', long)]
    pressure_iterations: Option<u32>,

    /// Number of random strokes spread over the run
    #[arg(long, default_value_t = 12)]
    strokes: u32,

    /// Random seed for stroke generation
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Report every N frames
    #[arg(short, long, default_value_t = 60)]
    report_interval: u64,

    /// Write the last presented surface as a binary PPM image
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

/// A straight drag starting at `start_frame`
#[derive(Debug, Clone, Copy)]
struct Stroke {
    start_frame: u64,
    frames: u64,
    origin: (f32, f32),
    step: (f32, f32),
}

impl Stroke {
    fn random(rng: &mut StdRng, width: f32, height: f32, start_frame: u64) -> Self {
        let angle = rng.random_range(0.0..std::f32::consts::TAU);
        let speed = rng.random_range(2.0..8.0);
        Self {
            start_frame,
            frames: rng.random_range(8..30),
            origin: (
                rng.random_range(0.2 * width..0.8 * width),
                rng.random_range(0.2 * height..0.8 * height),
            ),
            step: (speed * angle.cos(), speed * angle.sin()),
        }
    }

    fn position(&self, frame: u64) -> (f32, f32) {
        let t = (frame - self.start_frame) as f32;
        (self.origin.0 + t * self.step.0, self.origin.1 + t * self.step.1)
    }

    fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }
}

fn strokes(args: &Args) -> Vec<Stroke> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let spacing = args.frames / u64::from(args.strokes.max(1));
    (0..u64::from(args.strokes))
        .map(|i| {
            Stroke::random(
                &mut rng,
                args.width as f32,
                args.height as f32,
                i * spacing,
            )
        })
        .collect()
}

fn load_config(args: &Args) -> Result<SimulationConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        }
        None => SimulationConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    if let Some(precision) = args.precision {
        config.precision = match precision {
            PrecisionArg::Half => Precision::Float16,
            PrecisionArg::Full => Precision::Float32,
        };
    }
    if let Some(iterations) = args.pressure_iterations {
        config.pressure_iterations = iterations;
    }
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    backend: String,
    grid: (u32, u32),
    frames: u64,
    incomplete_frames: u64,
    elapsed_ms: f64,
    mean_frame_ms: f64,
    peak_in_flight: usize,
    total_density: f64,
    max_speed: f32,
}

fn field_stats(sim: &FluidSimulation) -> Result<(f64, f32), Box<dyn Error>> {
    let density = sim.read_field(FieldKind::Density)?;
    let velocity = sim.read_field(FieldKind::Velocity)?;
    let total = density.iter().map(|c| f64::from(c[0])).sum();
    let max_speed = velocity
        .iter()
        .map(|v| v[0].hypot(v[1]))
        .fold(0.0f32, f32::max);
    Ok((total, max_speed))
}

fn write_ppm(path: &Path, width: u32, height: u32, pixels: &[u32]) -> Result<(), Box<dyn Error>> {
    let mut data = format!("P6\n{width} {height}\n255\n").into_bytes();
    data.reserve(pixels.len() * 3);
    for px in pixels {
        let [r, g, b, _] = px.to_le_bytes();
        data.extend_from_slice(&[r, g, b]);
    }
    fs::write(path, data)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let backend = create_backend(config.backend)?;
    let mut sim = FluidSimulation::new(backend, config, args.width, args.height)?;
    info!(
        "Running {} frames on a {}x{} grid ({})",
        args.frames,
        sim.grid_size().0,
        sim.grid_size().1,
        sim.backend().name()
    );

    let plan = strokes(&args);
    let mut active: Option<Stroke> = None;
    let mut summary = Summary {
        backend: sim.backend().name().to_string(),
        grid: sim.grid_size(),
        ..Summary::default()
    };

    if !args.json {
        println!("  Frame | Stages | Density total | Max speed | ms/frame");
        println!("--------|--------|---------------|-----------|---------");
    }

    let started = Instant::now();
    let mut interval_start = Instant::now();
    for frame in 0..args.frames {
        if let Some(stroke) = plan.iter().find(|s| s.start_frame == frame) {
            let (x, y) = stroke.position(frame);
            sim.pointer_down(x, y);
            active = Some(*stroke);
        } else if let Some(stroke) = active {
            if frame >= stroke.end_frame() {
                sim.pointer_up();
                active = None;
            } else {
                let (x, y) = stroke.position(frame);
                sim.pointer_move(x, y);
            }
        }

        let FrameOutcome::Rendered(report) = sim.render_frame() else {
            continue;
        };
        summary.frames += 1;
        if !report.is_complete() {
            summary.incomplete_frames += 1;
        }

        if args.report_interval > 0 && (frame + 1) % args.report_interval == 0 && !args.json {
            sim.wait_idle();
            let (total, max_speed) = field_stats(&sim)?;
            let ms = interval_start.elapsed().as_secs_f64() * 1000.0 / args.report_interval as f64;
            println!(
                "{:7} | {:3}/{:<2} | {:13.2} | {:9.3} | {:8.2}",
                frame + 1,
                report.stages_executed,
                report.stages_planned,
                total,
                max_speed,
                ms
            );
            interval_start = Instant::now();
        }
    }
    sim.wait_idle();

    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
    let (total, max_speed) = field_stats(&sim)?;
    summary.elapsed_ms = elapsed;
    summary.mean_frame_ms = if summary.frames > 0 {
        elapsed / summary.frames as f64
    } else {
        0.0
    };
    summary.peak_in_flight = sim.peak_in_flight();
    summary.total_density = total;
    summary.max_speed = max_speed;

    if let Some(path) = &args.output {
        let (width, height) = sim.grid_size();
        write_ppm(path, width, height, &sim.read_presented()?)?;
        info!("Wrote surface to {}", path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("\n=== Run Complete ===");
        println!("Backend: {}", summary.backend);
        println!("Frames: {} ({} incomplete)", summary.frames, summary.incomplete_frames);
        println!("Mean frame time: {:.2} ms", summary.mean_frame_ms);
        println!("Peak frames in flight: {}", summary.peak_in_flight);
        println!("Final density total: {:.2}", summary.total_density);
        println!("Final max speed: {:.3}", summary.max_speed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strokes_are_deterministic() {
        let args = Args::parse_from(["demo-headless", "--strokes", "4", "--frames", "100"]);
        let first = strokes(&args);
        let second = strokes(&args);
        assert_eq!(first.len(), 4);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.origin, b.origin);
            assert_eq!(a.start_frame, b.start_frame);
        }
        assert_eq!(first[1].start_frame, 25);
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "demo-headless",
            "--backend",
            "cpu",
            "--precision",
            "full",
            "-i",
            "12",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.backend, BackendPreference::Cpu);
        assert_eq!(config.precision, Precision::Float32);
        assert_eq!(config.pressure_iterations, 12);
    }

    #[test]
    fn test_partial_json_config() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{ "pressure_iterations": 30, "idle_emitter": true }"#)
                .unwrap();
        assert_eq!(config.pressure_iterations, 30);
        assert!(config.idle_emitter);
        assert_eq!(config.max_in_flight, SimulationConfig::default().max_in_flight);
    }
}
