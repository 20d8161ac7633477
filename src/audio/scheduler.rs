//! # Playback Scheduling
//!
//! Delivers the frames of one synthesized reply to the call socket at
//! real-time pacing. Audio is computed far faster than it plays, so frames
//! must be held back and written one per frame interval or the caller hears
//! sped-up, garbled speech.
//!
//! ## Job registry:
//! The scheduler tracks at most one playback job per call in a synchronized
//! map keyed by call id. Starting a new job for a call
//! is itself the cancellation signal for the old one: a fresh AI response
//! always supersedes audio still being delivered for the previous turn
//! (barge-in). Frames from two jobs for the same call never interleave.
//!
//! ## Cancellation:
//! Each job carries a `CancellationToken`. `cancel` is race-free: once it
//! returns, no frame from that job reaches the sink at or after any delivery
//! time the cancel preceded. Delivery tasks poll the token ahead of the frame
//! timer in a biased select, so a token cancelled before a frame's scheduled
//! time always wins the race.
//!
//! ## Failure semantics:
//! Scheduling never surfaces an error. A sink that reports itself closed at
//! delivery time means the caller hung up; the frame is skipped, logged at
//! debug, and never retried.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Destination for scheduled audio frames.
///
/// Implemented over the call-socket actor address in production and by
/// recording doubles in tests. `deliver` must not block; the scheduler calls
/// it from its timing loop.
pub trait FrameSink: Send + Sync + 'static {
    /// Whether the sink can still accept frames. A closed sink is a normal
    /// outcome (the call ended), not a failure.
    fn is_open(&self) -> bool;

    /// Write one frame to the sink.
    fn deliver(&self, frame: Bytes);
}

/// Handle to one in-flight playback job.
struct JobHandle {
    token: CancellationToken,
    /// Distinguishes this job from any later job under the same call id, so
    /// a finished task only removes its own registry entry.
    seq: u64,
}

/// Paces frame delivery for every active call.
///
/// One instance serves the whole process; calls are independent apart from
/// the shared registry, which is locked only for insert/replace/remove.
pub struct PlaybackScheduler {
    jobs: Arc<RwLock<HashMap<String, JobHandle>>>,
    frame_interval: Duration,
    next_seq: AtomicU64,
}

impl PlaybackScheduler {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            frame_interval,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Schedule delivery of `frames[i]` at elapsed time `i × frame_interval`
    /// from now, superseding any job still running for this call.
    ///
    /// An empty frame sequence still cancels the previous job (the new turn
    /// barged in, it just has nothing to say).
    pub fn start(&self, call_id: &str, frames: Vec<Bytes>, sink: Arc<dyn FrameSink>) {
        let token = CancellationToken::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        {
            let mut jobs = self.jobs.write().unwrap();
            if let Some(old) = jobs.insert(
                call_id.to_string(),
                JobHandle {
                    token: token.clone(),
                    seq,
                },
            ) {
                // Barge-in: the superseded job must not deliver another frame.
                old.token.cancel();
            }
        }

        debug!(
            call_id = %call_id,
            frames = frames.len(),
            "Starting playback job"
        );

        let jobs = Arc::clone(&self.jobs);
        let call_id = call_id.to_string();
        let interval = self.frame_interval;

        tokio::spawn(async move {
            let started = Instant::now();
            let total = frames.len();
            let mut delivered = 0usize;

            for (i, frame) in frames.into_iter().enumerate() {
                let due = started + interval * i as u32;
                tokio::select! {
                    // The token must win when both are ready, otherwise a
                    // cancel issued before this frame's deadline could lose
                    // the race against an already-elapsed timer.
                    biased;
                    _ = token.cancelled() => {
                        debug!(call_id = %call_id, frame = i, total, "Playback job canceled");
                        break;
                    }
                    _ = time::sleep_until(due) => {
                        if sink.is_open() {
                            sink.deliver(frame);
                            delivered += 1;
                        } else {
                            debug!(call_id = %call_id, frame = i, "Sink closed, skipping frame");
                        }
                    }
                }
            }

            // Only clear the registry entry if a newer job has not replaced it.
            let mut jobs = jobs.write().unwrap();
            if jobs.get(&call_id).map(|j| j.seq) == Some(seq) {
                jobs.remove(&call_id);
            }

            debug!(call_id = %call_id, delivered, total, "Playback job finished");
        });
    }

    /// Stop all not-yet-fired deliveries for this call. Already-delivered
    /// frames are not recalled. Safe to call with no job active.
    ///
    /// Returns whether a job was actually canceled.
    pub fn cancel(&self, call_id: &str) -> bool {
        let removed = self.jobs.write().unwrap().remove(call_id);
        match removed {
            Some(job) => {
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the job of every call the scheduler tracks. Used at process
    /// shutdown so no delivery task outlives the server loop.
    pub fn cancel_all(&self) {
        let mut jobs = self.jobs.write().unwrap();
        for (call_id, job) in jobs.drain() {
            debug!(call_id = %call_id, "Canceling playback job at shutdown");
            job.token.cancel();
        }
    }

    /// Number of calls with a registered playback job.
    pub fn active_jobs(&self) -> usize {
        self.jobs.read().unwrap().len()
    }
}
