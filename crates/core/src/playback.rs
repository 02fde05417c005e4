//! Playback Scheduler
//!
//! Lays inbound agent audio out back to back on a playback clock so that
//! consecutive chunks play gaplessly, keeps the set of in-flight handles, and
//! declares the agent finished once that set has drained and a short grace
//! period has passed. A barge-in stops everything at once.
//!
//! The clock and the output device sit behind `PlaybackClock` and `AudioSink`
//! so the scheduling arithmetic can be driven by hand in tests.

use crate::audio::{self, AudioDecodeError, AudioFrame};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Default wait after the last span ends before the agent counts as finished.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(200);

pub type PlaybackHandle = u64;

/// A monotonic clock in seconds that can be frozen while the session is paused.
pub trait PlaybackClock: Send {
    fn now(&self) -> f64;
    fn suspend(&mut self);
    fn resume(&mut self);
}

/// Where scheduled audio actually goes.
pub trait AudioSink: Send {
    fn play(&mut self, handle: PlaybackHandle, frame: &AudioFrame, start_at: f64);
    fn stop(&mut self, handle: PlaybackHandle);
}

/// Wall clock that starts at zero and does not advance while suspended.
#[derive(Debug)]
pub struct StreamClock {
    origin: Instant,
    suspended_at: Option<Instant>,
    suspended_total: Duration,
}

impl StreamClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            suspended_at: None,
            suspended_total: Duration::ZERO,
        }
    }
}

impl Default for StreamClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock for StreamClock {
    fn now(&self) -> f64 {
        let reference = self.suspended_at.unwrap_or_else(Instant::now);
        reference
            .saturating_duration_since(self.origin)
            .saturating_sub(self.suspended_total)
            .as_secs_f64()
    }

    fn suspend(&mut self) {
        if self.suspended_at.is_none() {
            self.suspended_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let Some(at) = self.suspended_at.take() {
            self.suspended_total += at.elapsed();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The active set drained and stayed empty for the grace period.
    AgentFinished,
}

pub struct PlaybackScheduler<C: PlaybackClock, S: AudioSink> {
    clock: C,
    sink: S,
    grace: f64,
    next_start_time: f64,
    next_handle: PlaybackHandle,
    active: BTreeMap<PlaybackHandle, ScheduledSpan>,
    drained_at: Option<f64>,
}

impl<C: PlaybackClock, S: AudioSink> PlaybackScheduler<C, S> {
    pub fn new(clock: C, sink: S, grace: Duration) -> Self {
        Self {
            clock,
            sink,
            grace: grace.as_secs_f64(),
            next_start_time: 0.0,
            next_handle: 1,
            active: BTreeMap::new(),
            drained_at: None,
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Decodes one inbound `response.audio.delta` payload and schedules it.
    ///
    /// Corrupt payloads are returned as errors and leave the schedule untouched.
    pub fn enqueue_encoded(&mut self, delta: &str) -> Result<PlaybackHandle, AudioDecodeError> {
        let frame = audio::decode_pcm16(delta)?;
        Ok(self.enqueue(frame))
    }

    /// Schedules a decoded frame right after everything already queued.
    pub fn enqueue(&mut self, frame: AudioFrame) -> PlaybackHandle {
        let now = self.clock.now();
        let start = self.next_start_time.max(now);
        let end = start + frame.duration();

        let handle = self.next_handle;
        self.next_handle += 1;

        self.sink.play(handle, &frame, start);
        self.next_start_time = end;
        self.active.insert(handle, ScheduledSpan { start, end });
        self.drained_at = None;

        trace!(handle, start, end, "Scheduled agent audio");
        handle
    }

    /// Retires spans that have finished playing and reports when the agent is done.
    pub fn poll(&mut self) -> Option<PlaybackEvent> {
        let now = self.clock.now();
        let before = self.active.len();
        self.active.retain(|_, span| span.end > now);

        if before > 0 && self.active.is_empty() {
            debug!(now, "Playback drained");
            self.drained_at = Some(now);
        }

        match self.drained_at {
            Some(at) if self.active.is_empty() && now - at >= self.grace => {
                self.drained_at = None;
                Some(PlaybackEvent::AgentFinished)
            }
            _ => None,
        }
    }

    /// Stops every active handle immediately and rewinds the schedule.
    pub fn barge_in(&mut self) -> Vec<PlaybackHandle> {
        let stopped: Vec<PlaybackHandle> = self.active.keys().copied().collect();
        for handle in &stopped {
            self.sink.stop(*handle);
        }
        self.active.clear();
        self.next_start_time = 0.0;
        self.drained_at = None;
        info!(stopped = stopped.len(), "Playback interrupted");
        stopped
    }

    pub fn suspend(&mut self) {
        self.clock.suspend();
    }

    pub fn resume(&mut self) {
        self.clock.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct ManualClock {
        now: Arc<Mutex<f64>>,
    }

    impl ManualClock {
        fn set(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }
    }

    impl PlaybackClock for ManualClock {
        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }
        fn suspend(&mut self) {}
        fn resume(&mut self) {}
    }

    #[derive(Default)]
    struct SinkLog {
        played: Vec<(PlaybackHandle, f64, f64)>,
        stopped: Vec<PlaybackHandle>,
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        log: Arc<Mutex<SinkLog>>,
    }

    impl AudioSink for RecordingSink {
        fn play(&mut self, handle: PlaybackHandle, frame: &AudioFrame, start_at: f64) {
            self.log.lock().unwrap().played.push((handle, start_at, frame.duration()));
        }
        fn stop(&mut self, handle: PlaybackHandle) {
            self.log.lock().unwrap().stopped.push(handle);
        }
    }

    fn frame(secs: f64) -> AudioFrame {
        AudioFrame {
            samples: vec![0.0; (secs * 24_000.0) as usize],
            sample_rate: 24_000,
        }
    }

    fn scheduler() -> (
        ManualClock,
        RecordingSink,
        PlaybackScheduler<ManualClock, RecordingSink>,
    ) {
        let clock = ManualClock::default();
        let sink = RecordingSink::default();
        let scheduler = PlaybackScheduler::new(clock.clone(), sink.clone(), DEFAULT_GRACE);
        (clock, sink, scheduler)
    }

    #[test]
    fn test_spans_are_gapless_and_sum_durations() {
        let (_clock, sink, mut scheduler) = scheduler();
        let durations = [0.25, 0.5, 0.125, 1.0];
        for d in durations {
            scheduler.enqueue(frame(d));
        }

        let log = sink.log.lock().unwrap();
        let played = &log.played;
        for pair in played.windows(2) {
            let (_, start_a, dur_a) = pair[0];
            let (_, start_b, _) = pair[1];
            assert!(start_a + dur_a <= start_b + 1e-9);
        }
        assert_abs_diff_eq!(scheduler.next_start_time(), durations.iter().sum::<f64>(), epsilon = 1e-9);
        assert_eq!(scheduler.active_count(), 4);
    }

    #[test]
    fn test_late_chunk_starts_at_current_time() {
        let (clock, sink, mut scheduler) = scheduler();
        scheduler.enqueue(frame(0.5));
        clock.set(2.0);
        scheduler.enqueue(frame(0.5));
        let (_, start, _) = sink.log.lock().unwrap().played[1];
        assert_abs_diff_eq!(start, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(scheduler.next_start_time(), 2.5, epsilon = 1e-9);
    }

    #[test]
    fn test_agent_finished_after_grace() {
        let (clock, _sink, mut scheduler) = scheduler();
        scheduler.enqueue(frame(0.5));
        clock.set(0.25);
        assert_eq!(scheduler.poll(), None);
        assert_eq!(scheduler.active_count(), 1);

        clock.set(0.5);
        assert_eq!(scheduler.poll(), None);
        assert_eq!(scheduler.active_count(), 0);

        clock.set(0.6);
        assert_eq!(scheduler.poll(), None);

        clock.set(0.75);
        assert_eq!(scheduler.poll(), Some(PlaybackEvent::AgentFinished));
        clock.set(0.9);
        assert_eq!(scheduler.poll(), None);
    }

    #[test]
    fn test_new_audio_during_grace_cancels_finish() {
        let (clock, _sink, mut scheduler) = scheduler();
        scheduler.enqueue(frame(0.5));
        clock.set(0.5);
        scheduler.poll();
        clock.set(0.6);
        scheduler.enqueue(frame(0.5));
        clock.set(0.8);
        assert_eq!(scheduler.poll(), None);
        assert_eq!(scheduler.active_count(), 1);
    }

    #[test]
    fn test_barge_in_stops_everything_and_rewinds() {
        let (clock, sink, mut scheduler) = scheduler();
        let a = scheduler.enqueue(frame(1.0));
        let b = scheduler.enqueue(frame(1.0));
        clock.set(0.5);

        let stopped = scheduler.barge_in();
        assert_eq!(stopped, vec![a, b]);
        assert_eq!(sink.log.lock().unwrap().stopped, vec![a, b]);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(scheduler.poll(), None);

        // The next response starts at the current clock time.
        scheduler.enqueue(frame(0.5));
        assert_abs_diff_eq!(scheduler.next_start_time(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_corrupt_delta_leaves_schedule_untouched() {
        let (_clock, _sink, mut scheduler) = scheduler();
        scheduler.enqueue(frame(0.5));
        assert!(scheduler.enqueue_encoded("not base64!").is_err());
        assert_eq!(scheduler.active_count(), 1);
        assert_abs_diff_eq!(scheduler.next_start_time(), 0.5, epsilon = 1e-9);

        let ok = audio::encode_pcm16(&vec![0.0; 2_400]);
        scheduler.enqueue_encoded(&ok).unwrap();
        assert_abs_diff_eq!(scheduler.next_start_time(), 0.6, epsilon = 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_clock_freezes_while_suspended() {
        let mut clock = StreamClock::new();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_abs_diff_eq!(clock.now(), 1.0, epsilon = 1e-3);

        clock.suspend();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_abs_diff_eq!(clock.now(), 1.0, epsilon = 1e-3);

        clock.resume();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_abs_diff_eq!(clock.now(), 2.0, epsilon = 1e-3);
    }
}
