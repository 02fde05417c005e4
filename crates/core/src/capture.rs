//! Capture Pipeline
//!
//! Turns raw microphone frames into base64 PCM16 chunks for
//! `input_audio_buffer.append`. Frames are dropped while muted, paused, while
//! the agent is speaking, and during the post-speech cooldown. Every frame,
//! forwarded or not, yields an input level and an echo-likelihood estimate for
//! the UI. Neither value gates capture.

use crate::audio::{self, TRANSPORT_SAMPLE_RATE};
use crate::turn_taking::{TurnState, TurnTaking};
use rubato::{FastFixedIn, Resampler};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner, Length};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

const RESAMPLER_CHUNK: usize = 512;
const LOW_BAND_HZ: f32 = 300.0;
const MID_BAND_HZ: f32 = 3_400.0;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("unsupported input sample rate: {0}")]
    UnsupportedSampleRate(u32),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MicrophonePermission {
    Granted,
    Denied,
}

/// Description of the device stream capture is started on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputStream {
    pub sample_rate: u32,
    pub permission: MicrophonePermission,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureConfig {
    pub target_sample_rate: u32,
    /// RMS below this is flagged as quiet. Observational only.
    pub silence_threshold: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: TRANSPORT_SAMPLE_RATE,
            silence_threshold: 0.01,
        }
    }
}

/// Why a frame was not forwarded.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Stopped,
    Muted,
    Paused,
    AgentSpeaking,
    Cooldown,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputLevel {
    pub rms: f32,
    pub below_threshold: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub level: InputLevel,
    pub echo_likelihood: f32,
    /// Encoded chunk ready for the transport, if the frame was forwarded and
    /// produced output.
    pub chunk: Option<String>,
    pub gated: Option<GateReason>,
}

pub struct CapturePipeline {
    config: CaptureConfig,
    input_rate: u32,
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    echo: EchoEstimator,
    running: bool,
    muted: bool,
    paused: bool,
}

impl CapturePipeline {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            input_rate: config.target_sample_rate,
            resampler: None,
            pending: Vec::new(),
            echo: EchoEstimator::default(),
            running: false,
            muted: false,
            paused: false,
        }
    }

    /// Opens capture on `input`. A denied permission fails without side effects.
    pub fn start(&mut self, input: &InputStream) -> Result<(), CaptureError> {
        if input.permission == MicrophonePermission::Denied {
            warn!("Microphone permission denied; refusing to start capture");
            return Err(CaptureError::PermissionDenied);
        }
        if input.sample_rate == 0 {
            return Err(CaptureError::UnsupportedSampleRate(input.sample_rate));
        }

        self.resampler = if input.sample_rate == self.config.target_sample_rate {
            None
        } else {
            let resampler = audio::create_resampler(
                input.sample_rate as f64,
                self.config.target_sample_rate as f64,
                RESAMPLER_CHUNK,
            )
            .map_err(|e| {
                warn!(error = %e, "Could not build capture resampler");
                CaptureError::UnsupportedSampleRate(input.sample_rate)
            })?;
            Some(resampler)
        };

        self.input_rate = input.sample_rate;
        self.pending.clear();
        self.running = true;
        info!(
            input_rate = input.sample_rate,
            target_rate = self.config.target_sample_rate,
            "Capture started"
        );
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) {
        debug!(muted, "Capture mute changed");
        self.muted = muted;
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Releases the resampler and any buffered samples.
    pub fn stop(&mut self) {
        if self.running {
            info!("Capture stopped");
        }
        self.running = false;
        self.resampler = None;
        self.pending.clear();
    }

    pub fn on_frame(&mut self, samples: &[f32], turn: &TurnTaking, now: Instant) -> CapturedFrame {
        let rms = audio::rms(samples);
        let level = InputLevel {
            rms,
            below_threshold: rms < self.config.silence_threshold,
        };
        let echo_likelihood = self.echo.estimate(samples, self.input_rate);
        trace!(rms, echo_likelihood, "Microphone frame");

        let gated = self.gate(turn, now);
        if gated.is_some() {
            // Audio captured under a gate must not leak into the next forwarded chunk.
            self.pending.clear();
            return CapturedFrame {
                level,
                echo_likelihood,
                chunk: None,
                gated,
            };
        }

        let resampled = self.resample(samples);
        let chunk = (!resampled.is_empty()).then(|| audio::encode_pcm16(&resampled));
        CapturedFrame {
            level,
            echo_likelihood,
            chunk,
            gated: None,
        }
    }

    fn gate(&self, turn: &TurnTaking, now: Instant) -> Option<GateReason> {
        if !self.running {
            return Some(GateReason::Stopped);
        }
        if self.muted {
            return Some(GateReason::Muted);
        }
        if self.paused {
            return Some(GateReason::Paused);
        }
        if turn.capture_allowed(now) {
            return None;
        }
        match turn.state() {
            TurnState::Cooldown { .. } => Some(GateReason::Cooldown),
            _ => Some(GateReason::AgentSpeaking),
        }
    }

    fn resample(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match resampler.process(&[chunk], None) {
                Ok(res) => out.extend_from_slice(&res[0]),
                Err(e) => warn!(error = %e, "Dropping microphone chunk that failed to resample"),
            }
        }
        out
    }
}

/// Ratio of low-band (< 300 Hz) to speech-band (< 3.4 kHz) energy.
///
/// Loudspeaker bleed picked up by a laptop microphone tends to be bass-heavy.
/// The value is reported for observability and never gates capture. The FFT
/// plan and buffers are reused while the frame length stays the same.
pub struct EchoEstimator {
    planner: FftPlanner<f32>,
    plan: Option<Arc<dyn Fft<f32>>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Default for EchoEstimator {
    fn default() -> Self {
        Self {
            planner: FftPlanner::new(),
            plan: None,
            buffer: Vec::new(),
            scratch: Vec::new(),
        }
    }
}

impl EchoEstimator {
    pub fn estimate(&mut self, samples: &[f32], sample_rate: u32) -> f32 {
        if samples.len() < 2 || sample_rate == 0 {
            return 0.0;
        }

        let n = samples.len();
        let fft = match &self.plan {
            Some(plan) if plan.len() == n => plan.clone(),
            _ => {
                let plan = self.planner.plan_fft_forward(n);
                self.scratch = vec![Complex::default(); plan.get_inplace_scratch_len()];
                self.plan = Some(plan.clone());
                plan
            }
        };
        self.buffer.clear();
        self.buffer
            .extend(samples.iter().map(|&s| Complex::new(s, 0.0)));
        fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let bin_hz = sample_rate as f32 / n as f32;
        let mut low = 0.0f32;
        let mut mid = 0.0f32;
        // Skip DC.
        for (k, bin) in self.buffer.iter().enumerate().take(n / 2 + 1).skip(1) {
            let freq = k as f32 * bin_hz;
            let power = bin.norm_sqr();
            if freq < LOW_BAND_HZ {
                low += power;
            } else if freq < MID_BAND_HZ {
                mid += power;
            }
        }

        let total = low + mid;
        if total <= f32::EPSILON {
            0.0
        } else {
            low / total
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use base64::Engine;
    use std::f32::consts::PI;
    use std::time::Duration;

    fn tone(freq: f32, rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    fn started(rate: u32) -> CapturePipeline {
        let mut capture = CapturePipeline::new(CaptureConfig::default());
        capture
            .start(&InputStream {
                sample_rate: rate,
                permission: MicrophonePermission::Granted,
            })
            .unwrap();
        capture
    }

    fn decoded_len(chunk: &str) -> usize {
        base64::engine::general_purpose::STANDARD.decode(chunk).unwrap().len() / 2
    }

    #[test]
    fn test_denied_permission_fails_start() {
        let mut capture = CapturePipeline::new(CaptureConfig::default());
        let result = capture.start(&InputStream {
            sample_rate: 24_000,
            permission: MicrophonePermission::Denied,
        });
        assert!(matches!(result, Err(CaptureError::PermissionDenied)));
        assert!(!capture.is_running());
    }

    #[test]
    fn test_forwards_frames_when_idle() {
        let mut capture = started(24_000);
        let frame = capture.on_frame(&tone(440.0, 24_000, 480, 0.5), &TurnTaking::default(), Instant::now());
        assert_eq!(frame.gated, None);
        assert_eq!(decoded_len(frame.chunk.as_deref().unwrap()), 480);
        assert!(!frame.level.below_threshold);
    }

    #[test]
    fn test_gates_in_priority_order() {
        let mut capture = started(24_000);
        let mut turn = TurnTaking::default();
        let now = Instant::now();
        let samples = tone(440.0, 24_000, 480, 0.5);

        turn.on_agent_audio();
        assert_eq!(capture.on_frame(&samples, &turn, now).gated, Some(GateReason::AgentSpeaking));

        turn.on_agent_finished(now);
        let frame = capture.on_frame(&samples, &turn, now + Duration::from_millis(100));
        assert_eq!(frame.gated, Some(GateReason::Cooldown));
        assert!(frame.chunk.is_none());
        let frame = capture.on_frame(&samples, &turn, now + Duration::from_millis(600));
        assert_eq!(frame.gated, None);

        capture.set_paused(true);
        assert_eq!(capture.on_frame(&samples, &turn, now).gated, Some(GateReason::Paused));
        capture.set_muted(true);
        assert_eq!(capture.on_frame(&samples, &turn, now).gated, Some(GateReason::Muted));

        capture.stop();
        assert_eq!(capture.on_frame(&samples, &turn, now).gated, Some(GateReason::Stopped));
    }

    #[test]
    fn test_quiet_frame_is_flagged_not_rejected() {
        let mut capture = started(24_000);
        let frame = capture.on_frame(&[0.001; 480], &TurnTaking::default(), Instant::now());
        assert!(frame.level.below_threshold);
        assert!(frame.chunk.is_some());
    }

    #[test]
    fn test_resamples_to_transport_rate() {
        let mut capture = started(48_000);
        let turn = TurnTaking::default();
        let mut produced = 0;
        for _ in 0..20 {
            let frame = capture.on_frame(&tone(440.0, 48_000, 960, 0.3), &turn, Instant::now());
            if let Some(chunk) = frame.chunk {
                produced += decoded_len(&chunk);
            }
        }
        // 20 * 960 samples at 48 kHz is 0.4 s, roughly 9600 samples at 24 kHz.
        assert!(produced > 8_000 && produced <= 9_600, "produced {produced}");
    }

    #[test]
    fn test_echo_likelihood_tracks_low_band_energy() {
        let mut echo = EchoEstimator::default();
        let bass = echo.estimate(&tone(120.0, 24_000, 2_400, 0.5), 24_000);
        let voice = echo.estimate(&tone(1_000.0, 24_000, 2_400, 0.5), 24_000);
        assert!(bass > 0.9, "bass {bass}");
        assert!(voice < 0.1, "voice {voice}");
        assert_eq!(echo.estimate(&[0.0; 480], 24_000), 0.0);
        assert_eq!(echo.estimate(&[], 24_000), 0.0);
    }

    #[test]
    fn test_echo_plan_is_reused_per_frame_length() {
        let mut capture = started(24_000);
        let turn = TurnTaking::default();
        let samples = tone(440.0, 24_000, 480, 0.5);

        capture.on_frame(&samples, &turn, Instant::now());
        let first = capture.echo.plan.clone().unwrap();
        capture.on_frame(&samples, &turn, Instant::now());
        let second = capture.echo.plan.clone().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 480);

        capture.on_frame(&tone(440.0, 24_000, 960, 0.5), &turn, Instant::now());
        let replanned = capture.echo.plan.clone().unwrap();
        assert_eq!(replanned.len(), 960);
        assert!(!Arc::ptr_eq(&first, &replanned));

        // Same length as before: the same estimate as a fresh estimator.
        let mut fresh = EchoEstimator::default();
        let cached = capture.on_frame(&samples, &turn, Instant::now()).echo_likelihood;
        assert_abs_diff_eq!(cached, fresh.estimate(&samples, 24_000), epsilon = 1e-6);
    }

    #[test]
    fn test_echo_likelihood_never_gates() {
        let mut capture = started(24_000);
        let frame = capture.on_frame(&tone(100.0, 24_000, 2_400, 0.5), &TurnTaking::default(), Instant::now());
        assert!(frame.echo_likelihood > 0.5);
        assert_eq!(frame.gated, None);
        assert!(frame.chunk.is_some());
    }
}
