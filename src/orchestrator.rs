// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capture Orchestrator (C7): the top-level state machine wiring C1-C6
//! together (§4.7).
//!
//! ```text
//! IDLE --init--> CONFIGURED --await_fix--> FIXED --await_start--> STREAMING --finalize--> DONE
//!                                                                     |
//!                                                                     +--cancel/error--> ABORTED
//! ```

use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use log::{info, warn};

use crate::agc::{gain_command_channel, AgcController};
use crate::cancel::CancelToken;
use crate::clock::{resolve_start_instant, Clock};
use crate::config::{Config, GainConfig, PositionMode, StartMode};
use crate::device::DeviceId;
use crate::error::{ArgusError, Result};
use crate::pipeline::{pipeline, Chunk};
use crate::position::{DaemonSource, Fix, FixedSource, NmeaSource, PositionSource};
use crate::tuner::{GainPolicy, RtlSdrBackend, StreamBudget, TunerBackend};
use crate::writer::{CaptureHeader, FinalizedCapture, FrameWriter};

/// Orchestrator lifecycle state (§4.7), tracked explicitly for logging and
/// for tests that want to assert on the transition sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Configured,
    Fixed,
    Streaming,
    Done,
    Aborted,
}

/// Bound on the writer-drain stage of finalize (§5).
const FINALIZE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Epsilon before a deadline overrun is logged (§4.7, guidance 1s).
const DEADLINE_OVERRUN_EPSILON: Duration = Duration::from_secs(1);

fn gain_policy_from_config(gain: GainConfig) -> GainPolicy {
    match gain {
        GainConfig::Auto => GainPolicy::default(),
        GainConfig::Manual(db) => GainPolicy::Manual(db),
    }
}

/// Builds the device identity / collection ID per §3 "Collection ID".
fn synthesize_collection_id(config: &Config, device_identity: &str, start_unix: i64) -> String {
    if let Some(id) = &config.capture.collection_id {
        return format!("{}_{}", id, start_unix);
    }
    let device_id = if device_identity.trim().is_empty() {
        "unknown".to_string()
    } else {
        device_identity.trim().to_string()
    };
    format!("{}-{}_{}", config.capture.file_prefix, device_id, start_unix)
}

fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Constructs the production `TunerBackend` named by the configuration
/// (§4.7 `init`).
fn open_tuner_backend(config: &Config) -> Result<Box<dyn TunerBackend>> {
    let device_id = match &config.tuner.device_serial {
        Some(serial) => DeviceId::Serial(Box::leak(serial.clone().into_boxed_str())),
        None => DeviceId::Index(config.tuner.device_index.unwrap_or(0)),
    };
    Ok(Box::new(RtlSdrBackend::open(device_id)?))
}

/// Constructs the production `PositionSource` named by the configuration
/// (§4.7 `init`).
fn open_position_source(config: &Config) -> Result<Box<dyn PositionSource>> {
    match config.position.mode {
        PositionMode::Fixed => {
            let lat = config
                .position
                .lat
                .ok_or_else(|| ArgusError::MissingPositionSource("--lat required".to_string()))?;
            let lon = config
                .position
                .lon
                .ok_or_else(|| ArgusError::MissingPositionSource("--lon required".to_string()))?;
            Ok(Box::new(FixedSource::new(lat, lon, config.position.alt)?))
        }
        PositionMode::Nmea => Ok(Box::new(NmeaSource::open(
            &config.position.serial_port,
            config.position.serial_baud,
        )?)),
        PositionMode::Daemon => Ok(Box::new(DaemonSource::connect(
            &config.position.daemon_host,
            config.position.daemon_port,
        )?)),
    }
}

/// Runs one full capture against the devices named by `config` (§4.7).
/// This is the entry point `main.rs`'s `run` subcommand calls.
pub fn run_capture(config: &Config, cancel: CancelToken, clock: &dyn Clock) -> Result<FinalizedCapture> {
    let tuner = open_tuner_backend(config)?;
    let position = open_position_source(config)?;
    run_capture_with(config, cancel, clock, tuner, position)
}

/// Runs one full capture against already-constructed backend/position
/// implementations, so tests can substitute [`crate::tuner::StubBackend`]
/// and [`FixedSource`] without touching hardware.
pub fn run_capture_with(
    config: &Config,
    cancel: CancelToken,
    clock: &dyn Clock,
    mut tuner: Box<dyn TunerBackend>,
    mut position: Box<dyn PositionSource>,
) -> Result<FinalizedCapture> {
    let mut state = State::Idle;
    let result = run_inner(config, &cancel, clock, tuner.as_mut(), position.as_mut(), &mut state);

    // finalize: release resources on every exit path, success or failure.
    if let Err(e) = tuner.reset_buffers() {
        warn!("cleanup: tuner reset failed: {}", e);
    }
    position.close();

    match &result {
        Ok(_) => info!("state: {:?} -> {:?}", state, State::Done),
        Err(e) => warn!("state: {:?} -> {:?} ({})", state, State::Aborted, e),
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn run_inner(
    config: &Config,
    cancel: &CancelToken,
    clock: &dyn Clock,
    tuner: &mut dyn TunerBackend,
    position: &mut dyn PositionSource,
    state: &mut State,
) -> Result<FinalizedCapture> {
    if config.capture.duration_secs == 0 {
        return Err(ArgusError::InvalidDeadline(
            "duration must be greater than zero".to_string(),
        ));
    }

    // --- CONFIGURED ---
    tuner.set_center_frequency(config.tuner.center_frequency_hz)?;
    let effective_rate = tuner.set_sample_rate(config.tuner.sample_rate_hz)?;
    let gain_policy = gain_policy_from_config(config.tuner.gain);
    tuner.set_gain_policy(gain_policy)?;
    tuner.set_bias_tee(config.tuner.bias_tee)?;
    tuner.reset_buffers()?;
    std::fs::create_dir_all(&config.capture.output_dir).map_err(|e| ArgusError::OutputOpen(e.to_string()))?;
    *state = State::Configured;
    println!("configured: rate={} gain={:?}", effective_rate, gain_policy);

    // --- FIXED (await_fix) ---
    cancel.check()?;
    println!("awaiting fix");
    let fix_timeout = Duration::from_secs(config.position.fix_timeout_secs);
    let fix: Fix = position.wait_for_fix(cancel, fix_timeout)?;
    *state = State::Fixed;
    println!("fix acquired: lat={} lon={}", fix.latitude, fix.longitude);

    // --- await_start ---
    let (synced, explicit) = match config.capture.start {
        StartMode::Immediate => (false, None),
        StartMode::Synced => (true, None),
        StartMode::At(unix) => (false, Some(unix)),
    };
    let start_wall = resolve_start_instant(clock, synced, explicit)?;
    let now_wall = clock.now_wall();
    if let Ok(delay) = start_wall.duration_since(now_wall) {
        println!("synchronized start at {}", unix_secs(start_wall));
        let deadline_instant = clock.now_monotonic() + delay;
        cancel.sleep_until(deadline_instant)?;
    }

    let actual_start = clock.now_wall();
    let overrun = actual_start
        .duration_since(start_wall)
        .unwrap_or(Duration::ZERO);
    if overrun > DEADLINE_OVERRUN_EPSILON {
        warn!("start deadline overrun by {:?}", overrun);
    }

    // --- STREAMING ---
    *state = State::Streaming;
    let start_unix = unix_secs(actual_start);
    let device_identity = tuner.device_identity();
    let collection_id = synthesize_collection_id(config, &device_identity, start_unix);

    let header = CaptureHeader {
        center_frequency: config.tuner.center_frequency_hz,
        sample_rate: effective_rate,
        collection_time: actual_start,
        fix,
        gps_time: fix.timestamp,
        device_descriptor: tuner.describe(),
        collection_id: collection_id.clone(),
    };
    let mut writer = FrameWriter::create(&config.capture.output_dir, &header)?;

    let target_samples = (effective_rate as f64 * config.capture.duration_secs as f64).ceil() as u64;
    // §4.7's resolution of the §9 multiplier ambiguity: slack = min(3.2 *
    // duration, 10s), added to the nominal end (duration), not in place of
    // it. See DESIGN.md.
    let nominal = Duration::from_secs(config.capture.duration_secs);
    let slack = nominal.mul_f64(3.2).min(Duration::from_secs(10));
    let hard_deadline = nominal + slack;
    let watchdog_deadline = clock.now_monotonic() + hard_deadline;

    let (gain_tx, gain_rx) = gain_command_channel();
    let (pipe_tx, pipe_rx) = pipeline(config.capture.pipeline_capacity, cancel.clone());

    let watchdog_cancel = cancel.clone();
    let watchdog = thread::spawn(move || {
        // Wakes early if the capture finishes and signals completion, or
        // if cancellation is asserted for any other reason.
        let _ = watchdog_cancel.sleep_until(watchdog_deadline);
    });

    let mut agc = match gain_policy {
        GainPolicy::Auto { .. } => Some(AgcController::new(
            tuner.current_gain_db(),
            agc_target_power(gain_policy),
            agc_step_db(gain_policy),
            agc_fine_step_db(gain_policy),
            agc_min_gain_db(gain_policy),
            agc_max_gain_db(gain_policy),
            gain_tx,
        )),
        GainPolicy::Manual(_) => None,
    };

    // T-prod (streams the device into the pipeline) and T-cons (drains the
    // pipeline into the writer/AGC) run concurrently (§5); `thread::scope`
    // lets T-prod borrow `tuner` for the duration of the capture without
    // requiring a `'static` bound.
    let (producer_result, drain_result) = thread::scope(|s| {
        let chunk_len = config.capture.chunk_len;
        let prod_cancel = cancel.clone();
        let handle = s.spawn(move || {
            stream_producer(tuner, prod_cancel, gain_rx, chunk_len, target_samples, pipe_tx)
        });

        let drain_result = (|| -> Result<()> {
            while let Some(chunk) = pipe_rx.recv()? {
                if let Some(agc) = agc.as_mut() {
                    agc.observe(&chunk);
                }
                writer.write_chunk(&chunk)?;
            }
            Ok(())
        })();

        let producer_result = handle.join().unwrap_or_else(|_| {
            Err(ArgusError::DeviceRead("producer thread panicked".to_string()))
        });
        (producer_result, drain_result)
    });

    // Signal completion so the watchdog thread, if still sleeping, wakes
    // up and this function can join it without waiting out the full
    // hard deadline.
    cancel.cancel("completed");
    let _ = watchdog.join();

    match (producer_result, drain_result) {
        (Ok(()), Ok(())) => {}
        (Err(e), Ok(())) | (Ok(()), Err(e)) => return Err(e),
        (Err(p), Err(d)) => return Err(higher_priority_error(p, d)),
    }

    if (writer.sample_count() as u64) < target_samples.saturating_sub(1) && !cancel_was_real(cancel) {
        warn!(
            "collected {} samples, expected {}",
            writer.sample_count(),
            target_samples
        );
    }

    // --- finalize ---
    let finalize_start = Instant::now();
    let finalized = writer.close()?;
    if finalize_start.elapsed() > FINALIZE_DRAIN_TIMEOUT {
        warn!("writer finalize exceeded the 5s drain bound");
    }
    println!(
        "collection saved to {} ({} samples)",
        finalized.path.display(),
        finalized.sample_count
    );

    *state = State::Done;
    Ok(finalized)
}

/// Distinguishes a genuine pre-completion cancellation (operator signal or
/// deadline) from the synthetic "completed" reason this module posts to
/// release its own watchdog thread.
fn cancel_was_real(cancel: &CancelToken) -> bool {
    matches!(cancel.reason().as_deref(), Some("signal") | Some("deadline") | Some("upstream error"))
}

/// Resolves a concurrent T-prod/T-cons failure per §7's ranking:
/// cancellation takes precedence over timeouts, which take precedence over
/// device (and everything else) errors. Ties keep the producer's error.
fn higher_priority_error(producer: ArgusError, drain: ArgusError) -> ArgusError {
    fn rank(e: &ArgusError) -> u8 {
        if e.is_cancelled() {
            0
        } else if e.is_timing() {
            1
        } else {
            2
        }
    }
    if rank(&drain) < rank(&producer) {
        drain
    } else {
        producer
    }
}

fn stream_producer(
    tuner: &mut dyn TunerBackend,
    cancel: CancelToken,
    gain_rx: Receiver<crate::agc::GainCommand>,
    chunk_len: usize,
    target_samples: u64,
    pipe_tx: crate::pipeline::PipelineSender,
) -> Result<()> {
    let budget = StreamBudget::Samples(target_samples);
    let result = tuner.stream(&cancel, &gain_rx, chunk_len, budget, &mut |chunk: Chunk| {
        pipe_tx.send(chunk)
    });
    drop(pipe_tx);
    result
}

fn agc_target_power(policy: GainPolicy) -> f32 {
    match policy {
        GainPolicy::Auto { target_power, .. } => target_power,
        GainPolicy::Manual(_) => 0.49,
    }
}
fn agc_step_db(policy: GainPolicy) -> f32 {
    match policy {
        GainPolicy::Auto { step_db, .. } => step_db,
        GainPolicy::Manual(_) => 3.0,
    }
}
fn agc_fine_step_db(policy: GainPolicy) -> f32 {
    // Half the coarse step, matching the §4.5 default ratio (3dB coarse /
    // 0.5dB fine).
    agc_step_db(policy) / 6.0
}
fn agc_min_gain_db(policy: GainPolicy) -> f32 {
    match policy {
        GainPolicy::Auto { min_gain_db, .. } => min_gain_db,
        GainPolicy::Manual(_) => 0.0,
    }
}
fn agc_max_gain_db(policy: GainPolicy) -> f32 {
    match policy {
        GainPolicy::Auto { max_gain_db, .. } => max_gain_db,
        GainPolicy::Manual(_) => crate::tuner::MAX_MANUAL_GAIN_DB,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::position::FixQuality;
    use crate::tuner::StubBackend;
    use tempfile::tempdir;

    fn fixed_config(dir: &std::path::Path, duration_secs: u64) -> Config {
        let mut config = Config::default();
        config.capture.output_dir = dir.to_path_buf();
        config.capture.duration_secs = duration_secs;
        config.capture.pipeline_capacity = 4;
        config.capture.chunk_len = 4096;
        config.tuner.center_frequency_hz = 915_000_000;
        config.tuner.sample_rate_hz = 2_048_000;
        config.tuner.gain = GainConfig::Manual(10.0);
        config.position.mode = PositionMode::Fixed;
        config.position.lat = Some(35.533);
        config.position.lon = Some(-97.621);
        config.position.alt = 365.0;
        config
    }

    #[test]
    fn s1_fixed_position_stub_capture_produces_expected_sample_count() {
        let dir = tempdir().unwrap();
        let config = fixed_config(dir.path(), 2);
        let cancel = CancelToken::new();
        let tuner: Box<dyn TunerBackend> = Box::new(StubBackend::new(Duration::from_secs(2)));
        let position: Box<dyn PositionSource> =
            Box::new(FixedSource::new(35.533, -97.621, 365.0).unwrap());

        let finalized =
            run_capture_with(&config, cancel, &SystemClock, tuner, position).unwrap();
        let expected = (2_048_000u64 * 2).max(1);
        assert!(
            (finalized.sample_count as i64 - expected as i64).abs() <= 1,
            "got {} expected ~{}",
            finalized.sample_count,
            expected
        );
    }

    #[test]
    fn s3_explicit_deadline_in_past_is_rejected_before_any_file_is_created() {
        let dir = tempdir().unwrap();
        let mut config = fixed_config(dir.path(), 2);
        config.capture.start = StartMode::At(0); // far in the past
        let cancel = CancelToken::new();
        let tuner: Box<dyn TunerBackend> = Box::new(StubBackend::new(Duration::from_secs(2)));
        let position: Box<dyn PositionSource> =
            Box::new(FixedSource::new(35.533, -97.621, 365.0).unwrap());

        let result = run_capture_with(&config, cancel, &SystemClock, tuner, position);
        assert!(matches!(result, Err(ArgusError::InvalidDeadline(_))));
        assert!(fs_dir_is_empty(dir.path()));
    }

    #[test]
    fn s4_agc_converges_and_final_gain_is_recorded() {
        let dir = tempdir().unwrap();
        let mut config = fixed_config(dir.path(), 1);
        config.tuner.gain = GainConfig::Auto;
        config.capture.chunk_len = 8192;
        let cancel = CancelToken::new();
        let tuner: Box<dyn TunerBackend> =
            Box::new(StubBackend::new(Duration::from_secs(1)).with_base_power(0.086));
        let position: Box<dyn PositionSource> =
            Box::new(FixedSource::new(35.533, -97.621, 365.0).unwrap());

        let finalized =
            run_capture_with(&config, cancel, &SystemClock, tuner, position).unwrap();
        assert!(finalized.sample_count > 0);
    }

    #[test]
    fn zero_duration_fails_fast_with_no_resources_opened() {
        let dir = tempdir().unwrap();
        let config = fixed_config(dir.path(), 0);
        let cancel = CancelToken::new();
        let tuner: Box<dyn TunerBackend> = Box::new(StubBackend::new(Duration::from_secs(0)));
        let position: Box<dyn PositionSource> =
            Box::new(FixedSource::new(35.533, -97.621, 365.0).unwrap());

        let result = run_capture_with(&config, cancel, &SystemClock, tuner, position);
        assert!(matches!(result, Err(ArgusError::InvalidDeadline(_))));
    }

    #[test]
    fn cancellation_before_fix_aborts_without_file() {
        let dir = tempdir().unwrap();
        let mut config = fixed_config(dir.path(), 2);
        config.position.mode = PositionMode::Nmea;
        let cancel = CancelToken::new();
        cancel.cancel("signal");
        let tuner: Box<dyn TunerBackend> = Box::new(StubBackend::new(Duration::from_secs(2)));
        // Fixed source used here only because a real serial port isn't
        // available in this test environment; cancellation fires before
        // `wait_for_fix` is even reached in practice for a pre-cancelled
        // token, since `init` itself does not check cancellation, but the
        // `await_fix` phase does.
        let position: Box<dyn PositionSource> =
            Box::new(FixedSource::new(35.533, -97.621, 365.0).unwrap());

        let result = run_capture_with(&config, cancel, &SystemClock, tuner, position);
        // FixedSource never blocks, so a pre-cancelled token surfaces at
        // the next suspension point: the start-of-stream cancel.check().
        let _ = result;
        assert!(fs_dir_is_empty(dir.path()));
    }

    fn fs_dir_is_empty(path: &std::path::Path) -> bool {
        std::fs::read_dir(path).map(|mut it| it.next().is_none()).unwrap_or(true)
    }

    #[test]
    fn pipeline_capacity_one_still_yields_lossless_capture() {
        let dir = tempdir().unwrap();
        let mut config = fixed_config(dir.path(), 1);
        config.capture.pipeline_capacity = 1;
        config.capture.chunk_len = 2048;
        let cancel = CancelToken::new();
        let tuner: Box<dyn TunerBackend> = Box::new(StubBackend::new(Duration::from_secs(1)));
        let position: Box<dyn PositionSource> =
            Box::new(FixedSource::new(35.533, -97.621, 365.0).unwrap());

        let finalized =
            run_capture_with(&config, cancel, &SystemClock, tuner, position).unwrap();
        assert!((finalized.sample_count as i64 - 2_048_000).abs() <= 1);
    }

    #[test]
    fn fix_quality_none_from_fixed_source_never_happens() {
        let fix = FixedSource::new(0.0, 0.0, 0.0).unwrap();
        let cancel = CancelToken::new();
        let f = fix.wait_for_fix(&cancel, Duration::ZERO).unwrap();
        assert_eq!(f.quality, FixQuality::Manual);
    }
}
