//! In-flight frame bounds under sustained load

use std::sync::Arc;
use std::time::Duration;

use fluid_sim_core::{
    ComputeBackend, CpuBackend, FluidSimulation, FrameOutcome, Precision, SimulationConfig,
};
use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn slow_simulation(max_in_flight: usize, latency_ms: u64) -> FluidSimulation {
    let backend: Arc<dyn ComputeBackend> = Arc::new(
        CpuBackend::builder()
            .completion_latency(Duration::from_millis(latency_ms))
            .build(),
    );
    let config = SimulationConfig {
        pressure_iterations: 4,
        max_in_flight,
        ring_size: max_in_flight.max(3),
        ink_radius: 4.0,
        precision: Precision::Float32,
        ..SimulationConfig::default()
    };
    FluidSimulation::new(backend, config, 16, 16).unwrap()
}

#[test]
fn test_outstanding_frames_never_exceed_bound() {
    let mut sim = slow_simulation(3, 5);
    sim.pointer_down(8.0, 8.0);
    for i in 0..40 {
        sim.pointer_move(8.0 + (i % 5) as f32, 8.0);
        assert!(matches!(sim.render_frame(), FrameOutcome::Rendered(_)));
        assert!(sim.in_flight() <= 3);
    }
    sim.wait_idle();

    assert!(sim.peak_in_flight() <= 3);
    // Completions lag 5ms per frame, so the bound is actually reached
    assert_eq!(sim.peak_in_flight(), 3);
    assert_eq!(sim.in_flight(), 0);
    assert_eq!(sim.frame_index(), 40);
}

#[test]
fn test_single_frame_in_flight_serializes() {
    let mut sim = slow_simulation(1, 2);
    for _ in 0..10 {
        sim.render_frame();
        assert!(sim.in_flight() <= 1);
    }
    sim.wait_idle();
    assert_eq!(sim.peak_in_flight(), 1);
}

#[test]
fn test_paused_frames_do_not_acquire() {
    let mut sim = slow_simulation(3, 1);
    sim.render_frame();
    sim.focus_lost();
    assert!(sim.is_paused());
    for _ in 0..5 {
        assert_eq!(sim.render_frame(), FrameOutcome::Paused);
    }
    sim.wait_idle();
    assert_eq!(sim.frame_index(), 1);

    sim.focus_gained();
    assert!(matches!(sim.render_frame(), FrameOutcome::Rendered(_)));
}
