// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SDR Tuner Driver abstraction (C2): the capability set of §4.2 expressed
//! as a `TunerBackend` trait, with two implementations —
//! [`RtlSdrBackend`] wrapping the `RtlSdr`/`Device`/`Tuner`
//! plumbing, and [`StubBackend`] synthesizing a test pattern for
//! hardware-free development and the S1/S4 scenarios of §8.

use std::sync::mpsc::Receiver;
use std::time::Duration;

use log::warn;

use crate::agc::GainCommand;
use crate::cancel::CancelToken;
use crate::device::{Device, DeviceId, DeviceInfo};
use crate::error::{ArgusError, Result};
use crate::pipeline::{Chunk, IqSample};
use crate::rtlsdr::RtlSdr;
use crate::tuners::TunerGain;

/// Supported sample rates a substitution request snaps to (§4.2).
pub const RATE_LADDER: [u32; 10] = [
    250_000, 1_024_000, 1_536_000, 1_792_000, 1_920_000, 2_048_000, 2_160_000, 2_560_000,
    2_880_000, 3_200_000,
];

/// Maximum manual gain accepted by `set_gain_policy`/`set_gain` (§4.2).
pub const MAX_MANUAL_GAIN_DB: f32 = 49.6;

/// Default chunk length in samples (§3 guidance: 64Ki-256Ki).
pub const DEFAULT_CHUNK_LEN: usize = 64 * 1024;

/// Gain policy installed on a tuner (§3 "Capture descriptor").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GainPolicy {
    Manual(f32),
    Auto {
        target_power: f32,
        step_db: f32,
        min_gain_db: f32,
        max_gain_db: f32,
    },
}

impl Default for GainPolicy {
    fn default() -> Self {
        GainPolicy::Auto {
            target_power: 0.49,
            step_db: 3.0,
            min_gain_db: 0.0,
            max_gain_db: MAX_MANUAL_GAIN_DB,
        }
    }
}

fn nearest_rate(requested: u32) -> u32 {
    *RATE_LADDER
        .iter()
        .min_by_key(|&&r| (r as i64 - requested as i64).unsigned_abs())
        .expect("RATE_LADDER is non-empty")
}

/// How the tuner driver thread (T-prod) should decide the stream is done:
/// either a fixed sample budget, or "run until cancelled/EOF".
pub enum StreamBudget {
    Samples(u64),
    Unbounded,
}

/// The capability set C7 is generic over (§4.2).
pub trait TunerBackend: Send {
    fn set_center_frequency(&mut self, hz: u64) -> Result<()>;
    /// Returns the effective rate actually programmed, which may differ
    /// from `hz` if substitution occurred (§4.2, §8 property 4).
    fn set_sample_rate(&mut self, hz: u32) -> Result<u32>;
    fn set_gain_policy(&mut self, policy: GainPolicy) -> Result<()>;
    /// Quantizes to the nearest gain the driver reports as available and
    /// latches it; returns the effective gain.
    fn set_gain(&mut self, db: f32) -> Result<f32>;
    fn set_bias_tee(&mut self, on: bool) -> Result<()>;
    fn reset_buffers(&mut self) -> Result<()>;
    fn available_gains_db(&self) -> Vec<f32>;
    fn bias_tee(&self) -> bool;
    fn gain_policy(&self) -> GainPolicy;
    fn current_gain_db(&self) -> f32;
    fn center_frequency(&self) -> u64;
    fn sample_rate(&self) -> u32;

    /// A short descriptor embedding freq/rate/gain/bias-tee state, written
    /// into the frame header (§3, §4.2).
    fn describe(&self) -> String {
        let (mode, gain) = match self.gain_policy() {
            GainPolicy::Manual(db) => ("manual", db),
            GainPolicy::Auto { .. } => ("auto", self.current_gain_db()),
        };
        format!(
            "freq={} rate={} gain={}:{:.1} bias_tee={}",
            self.center_frequency(),
            self.sample_rate(),
            mode,
            gain,
            if self.bias_tee() { "on" } else { "off" }
        )
    }

    /// Tuner serial/index identity for collection-ID synthesis (§3).
    fn device_identity(&self) -> String;

    /// Runs the bounded blocking sample producer (§4.2 `stream`). Checks
    /// `cancel` between reads; drains `gain_cmds` at each chunk boundary
    /// (§4.5/§9's command-channel hand-off) before the next read; a
    /// zero-length read ends the stream normally.
    fn stream(
        &mut self,
        cancel: &CancelToken,
        gain_cmds: &Receiver<GainCommand>,
        chunk_len: usize,
        budget: StreamBudget,
        emit: &mut dyn FnMut(Chunk) -> Result<()>,
    ) -> Result<()>;
}

/// Wraps the `RtlSdr`/`Device`/`Tuner` plumbing behind the real USB device.
pub struct RtlSdrBackend {
    sdr: RtlSdr,
    identity: String,
    center_freq_hz: u64,
    sample_rate_hz: u32,
    gain_policy: GainPolicy,
    current_gain_db: f32,
    bias_tee: bool,
}

impl RtlSdrBackend {
    pub fn open(device_id: DeviceId) -> Result<Self> {
        let device = Device::new(device_id)?;
        let mut sdr = RtlSdr::new(device);
        sdr.init()?;
        let identity = match device_id {
            DeviceId::Serial(s) => s.trim().to_string(),
            DeviceId::Index(i) => i.to_string(),
            DeviceId::Fd(_) => "unknown".to_string(),
        };
        Ok(RtlSdrBackend {
            sdr,
            identity,
            center_freq_hz: 0,
            sample_rate_hz: 0,
            gain_policy: GainPolicy::Manual(0.0),
            current_gain_db: 0.0,
            bias_tee: false,
        })
    }

    pub fn list_devices() -> Result<Vec<DeviceInfo>> {
        Device::list_devices()
    }

    fn quantize_gain(&self, requested_db: f32) -> Result<f32> {
        let gains = self.sdr.get_tuner_gains()?;
        if gains.is_empty() {
            return Ok(requested_db.clamp(0.0, MAX_MANUAL_GAIN_DB));
        }
        let requested_tenths = (requested_db * 10.0).round() as i32;
        let nearest = *gains
            .iter()
            .min_by_key(|&&g| (g - requested_tenths).abs())
            .unwrap();
        Ok(nearest as f32 / 10.0)
    }
}

impl TunerBackend for RtlSdrBackend {
    fn set_center_frequency(&mut self, hz: u64) -> Result<()> {
        if hz == 0 {
            return Err(ArgusError::Unsupported(
                "center frequency must be positive".to_string(),
            ));
        }
        self.sdr.set_center_freq(hz as u32)?;
        self.center_freq_hz = hz;
        Ok(())
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<u32> {
        let effective = if RATE_LADDER.contains(&hz) {
            hz
        } else {
            let snapped = nearest_rate(hz);
            warn!(
                "requested sample rate {} Hz not supported, substituting {} Hz",
                hz, snapped
            );
            snapped
        };
        self.sdr.set_sample_rate(effective)?;
        self.sample_rate_hz = self.sdr.get_sample_rate();
        Ok(self.sample_rate_hz)
    }

    fn set_gain_policy(&mut self, policy: GainPolicy) -> Result<()> {
        match policy {
            GainPolicy::Manual(db) => {
                if !(0.0..=MAX_MANUAL_GAIN_DB).contains(&db) {
                    return Err(ArgusError::UnknownGainMode(format!(
                        "manual gain {} dB out of range [0, {}]",
                        db, MAX_MANUAL_GAIN_DB
                    )));
                }
                let effective = self.quantize_gain(db)?;
                self.sdr
                    .set_tuner_gain(TunerGain::Manual((effective * 10.0).round() as i32))?;
                self.current_gain_db = effective;
            }
            GainPolicy::Auto { .. } => {
                self.sdr.set_tuner_gain(TunerGain::Auto)?;
            }
        }
        self.gain_policy = policy;
        Ok(())
    }

    fn set_gain(&mut self, db: f32) -> Result<f32> {
        let effective = self.quantize_gain(db)?;
        self.sdr
            .set_tuner_gain(TunerGain::Manual((effective * 10.0).round() as i32))?;
        self.current_gain_db = effective;
        Ok(effective)
    }

    fn set_bias_tee(&mut self, on: bool) -> Result<()> {
        if let Err(e) = self.sdr.set_bias_tee(on) {
            warn!("bias-tee control unsupported by this device, ignoring: {}", e);
        } else {
            self.bias_tee = on;
        }
        Ok(())
    }

    fn reset_buffers(&mut self) -> Result<()> {
        self.sdr.reset_buffer()
    }

    fn available_gains_db(&self) -> Vec<f32> {
        self.sdr
            .get_tuner_gains()
            .unwrap_or_default()
            .into_iter()
            .map(|g| g as f32 / 10.0)
            .collect()
    }

    fn bias_tee(&self) -> bool {
        self.bias_tee
    }

    fn gain_policy(&self) -> GainPolicy {
        self.gain_policy
    }

    fn current_gain_db(&self) -> f32 {
        self.current_gain_db
    }

    fn center_frequency(&self) -> u64 {
        self.center_freq_hz
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate_hz
    }

    fn device_identity(&self) -> String {
        self.identity.clone()
    }

    fn stream(
        &mut self,
        cancel: &CancelToken,
        gain_cmds: &Receiver<GainCommand>,
        chunk_len: usize,
        budget: StreamBudget,
        emit: &mut dyn FnMut(Chunk) -> Result<()>,
    ) -> Result<()> {
        let mut delivered: u64 = 0;
        let mut raw = vec![0u8; chunk_len * 2];
        loop {
            cancel.check()?;
            if let StreamBudget::Samples(target) = budget {
                if delivered >= target {
                    return Ok(());
                }
            }

            while let Ok(cmd) = gain_cmds.try_recv() {
                if let Err(e) = self.set_gain(cmd.gain_db) {
                    warn!("agc gain command failed, retaining previous gain: {}", e);
                }
            }

            let n = match self
                .sdr
                .read_sync(&mut raw)
                .map_err(|e| ArgusError::DeviceRead(e.to_string()))?
            {
                // Bounded-timeout read with nothing ready; loop back to
                // re-check cancellation and the budget rather than ending
                // the stream (§5 suspension point (b)).
                None => continue,
                // A genuine zero-byte transfer ends the stream normally
                // (§4.2).
                Some(0) => return Ok(()),
                Some(n) => n,
            };
            let chunk = bytes_to_chunk(&raw[..n]);
            delivered += chunk.len() as u64;
            emit(chunk)?;
        }
    }
}

/// Raw device bytes arrive as interleaved unsigned 8-bit I,Q pairs;
/// `(byte - 127.5) / 127.5` maps them to float32 in `[-1, 1]` (§4.2).
fn bytes_to_chunk(raw: &[u8]) -> Chunk {
    let mut chunk = Chunk::with_capacity(raw.len() / 2);
    for pair in raw.chunks_exact(2) {
        chunk.samples.push(IqSample {
            i: (pair[0] as f32 - 127.5) / 127.5,
            q: (pair[1] as f32 - 127.5) / 127.5,
        });
    }
    chunk
}

/// Synthesizes a constant test pattern at the configured rate for the
/// configured duration, so the capture engine can be exercised without
/// hardware (§4.2's "stub variant MUST exist").
pub struct StubBackend {
    identity: String,
    center_freq_hz: u64,
    sample_rate_hz: u32,
    duration: Duration,
    gain_policy: GainPolicy,
    current_gain_db: f32,
    bias_tee: bool,
    /// Power the synthesized tone carries at 0dB applied gain; chosen so
    /// the per-sample power is exactly `base_power * 10^(gain/10)`,
    /// matching a linear gain stage (used by the AGC convergence tests).
    base_power: f32,
}

impl StubBackend {
    pub fn new(duration: Duration) -> Self {
        StubBackend {
            identity: "stub0".to_string(),
            center_freq_hz: 0,
            sample_rate_hz: RATE_LADDER[0],
            duration,
            gain_policy: GainPolicy::Manual(0.0),
            current_gain_db: 0.0,
            bias_tee: false,
            base_power: 0.5,
        }
    }

    pub fn with_base_power(mut self, base_power: f32) -> Self {
        self.base_power = base_power;
        self
    }

    fn amplitude(&self) -> f32 {
        let power = self.base_power * 10f32.powf(self.current_gain_db / 10.0);
        power.max(0.0).sqrt().min(1.0)
    }
}

impl TunerBackend for StubBackend {
    fn set_center_frequency(&mut self, hz: u64) -> Result<()> {
        if hz == 0 {
            return Err(ArgusError::Unsupported(
                "center frequency must be positive".to_string(),
            ));
        }
        self.center_freq_hz = hz;
        Ok(())
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<u32> {
        let effective = if RATE_LADDER.contains(&hz) {
            hz
        } else {
            let snapped = nearest_rate(hz);
            warn!(
                "requested sample rate {} Hz not supported, substituting {} Hz",
                hz, snapped
            );
            snapped
        };
        self.sample_rate_hz = effective;
        Ok(effective)
    }

    fn set_gain_policy(&mut self, policy: GainPolicy) -> Result<()> {
        if let GainPolicy::Manual(db) = policy {
            if !(0.0..=MAX_MANUAL_GAIN_DB).contains(&db) {
                return Err(ArgusError::UnknownGainMode(format!(
                    "manual gain {} dB out of range [0, {}]",
                    db, MAX_MANUAL_GAIN_DB
                )));
            }
            self.current_gain_db = db;
        }
        self.gain_policy = policy;
        Ok(())
    }

    fn set_gain(&mut self, db: f32) -> Result<f32> {
        let clamped = db.clamp(0.0, MAX_MANUAL_GAIN_DB);
        self.current_gain_db = clamped;
        Ok(clamped)
    }

    fn set_bias_tee(&mut self, on: bool) -> Result<()> {
        self.bias_tee = on;
        Ok(())
    }

    fn reset_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn available_gains_db(&self) -> Vec<f32> {
        (0..=496).step_by(1).map(|t| t as f32 / 10.0).collect()
    }

    fn bias_tee(&self) -> bool {
        self.bias_tee
    }

    fn gain_policy(&self) -> GainPolicy {
        self.gain_policy
    }

    fn current_gain_db(&self) -> f32 {
        self.current_gain_db
    }

    fn center_frequency(&self) -> u64 {
        self.center_freq_hz
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate_hz
    }

    fn device_identity(&self) -> String {
        self.identity.clone()
    }

    fn stream(
        &mut self,
        cancel: &CancelToken,
        gain_cmds: &Receiver<GainCommand>,
        chunk_len: usize,
        budget: StreamBudget,
        emit: &mut dyn FnMut(Chunk) -> Result<()>,
    ) -> Result<()> {
        let target = match budget {
            StreamBudget::Samples(n) => n,
            StreamBudget::Unbounded => {
                (self.sample_rate_hz as f64 * self.duration.as_secs_f64()).ceil() as u64
            }
        };
        let mut delivered: u64 = 0;
        let mut phase: f64 = 0.0;
        // A fixed, visible offset tone; arbitrary but deterministic.
        let cycles_per_sample = 0.01f64;
        while delivered < target {
            cancel.check()?;
            while let Ok(cmd) = gain_cmds.try_recv() {
                let _ = self.set_gain(cmd.gain_db);
            }
            let remaining = (target - delivered).min(chunk_len as u64) as usize;
            let amp = self.amplitude();
            let mut chunk = Chunk::with_capacity(remaining);
            for _ in 0..remaining {
                let (s, c) = (phase * std::f64::consts::TAU).sin_cos();
                chunk.samples.push(IqSample {
                    i: (amp as f64 * c) as f32,
                    q: (amp as f64 * s) as f32,
                });
                phase = (phase + cycles_per_sample).fract();
            }
            delivered += chunk.len() as u64;
            emit(chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agc::gain_command_channel;

    #[test]
    fn nearest_rate_snaps_up_and_down() {
        assert_eq!(nearest_rate(1_000_000), 1_024_000);
        assert_eq!(nearest_rate(3_000_000), 2_880_000);
        assert_eq!(nearest_rate(2_048_000), 2_048_000);
    }

    #[test]
    fn stub_emits_exact_sample_budget() {
        let mut stub = StubBackend::new(Duration::from_secs(1));
        stub.set_sample_rate(2_048_000).unwrap();
        let (_tx, rx) = gain_command_channel();
        let cancel = CancelToken::new();
        let mut total = 0u64;
        stub.stream(
            &cancel,
            &rx,
            65536,
            StreamBudget::Samples(2_048_000),
            &mut |c| {
                total += c.len() as u64;
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(total, 2_048_000);
    }

    #[test]
    fn stub_samples_stay_within_unit_amplitude() {
        let mut stub = StubBackend::new(Duration::from_millis(10)).with_base_power(0.9);
        stub.set_sample_rate(250_000).unwrap();
        let (_tx, rx) = gain_command_channel();
        let cancel = CancelToken::new();
        stub.stream(&cancel, &rx, 4096, StreamBudget::Samples(4096), &mut |c| {
            for s in &c.samples {
                assert!(s.i.abs() <= 1.0);
                assert!(s.q.abs() <= 1.0);
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn describe_embeds_freq_rate_gain_bias() {
        let mut stub = StubBackend::new(Duration::from_secs(1));
        stub.set_center_frequency(120_900_000).unwrap();
        stub.set_sample_rate(2_048_000).unwrap();
        stub.set_gain_policy(GainPolicy::Manual(20.0)).unwrap();
        stub.set_bias_tee(true).unwrap();
        let d = stub.describe();
        assert!(d.contains("120900000"));
        assert!(d.contains("2048000"));
        assert!(d.contains("manual:20"));
        assert!(d.contains("bias_tee=on"));
    }
}
