//! # Audio Playback Module
//!
//! Everything between a synthesized audio buffer and correctly timed frames
//! on the call socket:
//!
//! - **Frame splitter**: strips the WAV header from a synthesized buffer and
//!   cuts the payload into fixed-size frames (pure transformation).
//! - **Playback scheduler**: owns one cancelable delivery job per call and
//!   writes each frame to the socket sink at real-time pacing. Starting a new
//!   job for a call supersedes the previous one (barge-in).
//!
//! ## Wire Format:
//! - **Frame size**: 640 bytes (20 ms of 16 kHz 16-bit mono PCM)
//! - **Pacing**: one frame every 20 ms, matching playback speed
//! - **Header**: each synthesized buffer starts with a 44-byte WAV header
//!   that must not reach the caller

pub mod scheduler;
pub mod splitter;

pub use scheduler::{FrameSink, PlaybackScheduler};
pub use splitter::FrameSplitter;
