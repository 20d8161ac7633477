//! # Audio Frame Splitting
//!
//! Turns one synthesized audio buffer into the frame sequence the playback
//! scheduler delivers. Pure transformation: no clocks, no sockets, no side
//! effects.
//!
//! ## Contract:
//! - The first `header_len` bytes (the WAV header) are discarded.
//! - The remaining payload is cut into frames of exactly `frame_size` bytes,
//!   except the last frame which holds the remainder (1 to `frame_size`
//!   bytes) and is still delivered.
//! - A payload of 0 bytes yields an empty sequence.
//! - A buffer shorter than the header is rejected with
//!   [`CallError::InvalidBuffer`].
//!
//! Frames are `Bytes` slices into the source buffer, so splitting never
//! copies audio data.

use crate::error::CallError;
use bytes::Bytes;

/// Splits raw synthesized-audio buffers into fixed-size playback frames.
#[derive(Debug, Clone)]
pub struct FrameSplitter {
    frame_size: usize,
    header_len: usize,
}

impl FrameSplitter {
    pub fn new(frame_size: usize, header_len: usize) -> Self {
        assert!(frame_size > 0, "frame size must be non-zero");
        Self {
            frame_size,
            header_len,
        }
    }

    /// Split a buffer into frames, discarding the leading header.
    ///
    /// Returns a lazy, restartable iterator over the frames. Fails only if
    /// the buffer cannot even hold its own header.
    pub fn split(&self, buffer: &Bytes) -> Result<Frames, CallError> {
        if buffer.len() < self.header_len {
            return Err(CallError::InvalidBuffer {
                len: buffer.len(),
                header_len: self.header_len,
            });
        }

        Ok(Frames {
            payload: buffer.slice(self.header_len..),
            frame_size: self.frame_size,
            pos: 0,
        })
    }

    /// Number of frames `split` would yield for a buffer of length `len`,
    /// or `None` if the buffer is shorter than the header.
    pub fn frame_count(&self, len: usize) -> Option<usize> {
        let payload = len.checked_sub(self.header_len)?;
        Some(payload.div_ceil(self.frame_size))
    }
}

/// Iterator over the frames of one buffer.
///
/// Cloning restarts the sequence from the first frame; frames are cheap
/// sub-slices of the shared payload.
#[derive(Debug, Clone)]
pub struct Frames {
    payload: Bytes,
    frame_size: usize,
    pos: usize,
}

impl Iterator for Frames {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.pos >= self.payload.len() {
            return None;
        }
        let end = usize::min(self.pos + self.frame_size, self.payload.len());
        let frame = self.payload.slice(self.pos..end);
        self.pos = end;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.payload.len() - self.pos).div_ceil(self.frame_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Frames {}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter() -> FrameSplitter {
        FrameSplitter::new(640, 44)
    }

    fn buffer_of(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    /// 44-byte header + 640-byte payload: exactly one full frame.
    #[test]
    fn test_single_full_frame() {
        let frames: Vec<Bytes> = splitter().split(&buffer_of(684)).unwrap().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 640);
    }

    /// 44 + 1280: two full frames.
    #[test]
    fn test_two_full_frames() {
        let frames: Vec<Bytes> = splitter().split(&buffer_of(1324)).unwrap().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 640);
        assert_eq!(frames[1].len(), 640);
    }

    /// A remainder becomes one short final frame, still delivered.
    #[test]
    fn test_trailing_partial_frame() {
        let frames: Vec<Bytes> = splitter().split(&buffer_of(44 + 1000)).unwrap().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 640);
        assert_eq!(frames[1].len(), 360);
    }

    /// Concatenating all frames reproduces the input minus its header, and
    /// the frame count is exactly ceil(payload / 640). An off-by-one here
    /// would push a trailing empty frame onto the wire, so the count is
    /// asserted exactly.
    #[test]
    fn test_frames_reassemble_payload() {
        let splitter = splitter();
        for len in [45usize, 44 + 639, 684, 685, 1324, 44 + 6400 + 1] {
            let buffer = buffer_of(len);
            let frames: Vec<Bytes> = splitter.split(&buffer).unwrap().collect();

            let payload_len = len - 44;
            assert_eq!(frames.len(), payload_len.div_ceil(640), "len={}", len);
            assert_eq!(frames.len(), splitter.frame_count(len).unwrap());

            let rejoined: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
            assert_eq!(&rejoined[..], &buffer[44..], "len={}", len);
        }
    }

    /// Header with nothing behind it: empty sequence, not an error.
    #[test]
    fn test_header_only_buffer_is_empty_sequence() {
        let mut frames = splitter().split(&buffer_of(44)).unwrap();
        assert_eq!(frames.len(), 0);
        assert!(frames.next().is_none());
    }

    /// Buffers too short to hold the header are malformed.
    #[test]
    fn test_short_buffer_rejected() {
        let err = splitter().split(&buffer_of(43)).unwrap_err();
        match err {
            CallError::InvalidBuffer { len, header_len } => {
                assert_eq!(len, 43);
                assert_eq!(header_len, 44);
            }
            other => panic!("expected InvalidBuffer, got {:?}", other),
        }
        assert_eq!(splitter().frame_count(43), None);
    }

    /// The iterator is restartable: a clone replays from the first frame.
    #[test]
    fn test_clone_restarts_sequence() {
        let mut frames = splitter().split(&buffer_of(1324)).unwrap();
        let restart = frames.clone();
        frames.next();
        frames.next();
        assert!(frames.next().is_none());
        assert_eq!(restart.count(), 2);
    }
}
