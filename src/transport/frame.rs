//! Length-prefixed framing.
//!
//! Frame format: `[length:4][payload:length]`
//!
//! - **length**: payload size in bytes (little-endian `u32`)
//! - **payload**: opaque bytes, never interpreted at this layer
//!
//! [`FrameAssembler`] decodes a stream incrementally and tolerates reads of
//! any size, down to a single byte at a time.

use super::TransportError;

/// Width of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default cap on accepted payload sizes (64 MiB).
///
/// Announced lengths above the cap are rejected before any allocation.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 << 20;

/// Encode the length prefix for a payload of `len` bytes.
pub fn length_prefix(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE], TransportError> {
    let len32 = u32::try_from(len).map_err(|_| TransportError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })?;
    Ok(len32.to_le_bytes())
}

/// Frame `payload` into a single contiguous buffer.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let prefix = length_prefix(payload.len())?;
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    framed.extend_from_slice(&prefix);
    framed.extend_from_slice(payload);
    Ok(framed)
}

#[derive(Clone, Copy, Debug)]
enum Stage {
    Header { filled: usize },
    Body { filled: usize },
}

/// Incremental frame decoder.
///
/// The caller reads directly into [`read_buf`](Self::read_buf) and reports
/// how many bytes landed via [`advance`](Self::advance). The length prefix is
/// accumulated until complete, then a buffer of exactly that length is
/// allocated and filled.
#[derive(Debug)]
pub struct FrameAssembler {
    header: [u8; LENGTH_PREFIX_SIZE],
    body: Vec<u8>,
    stage: Stage,
    max_frame_size: usize,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameAssembler {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            header: [0; LENGTH_PREFIX_SIZE],
            body: Vec::new(),
            stage: Stage::Header { filled: 0 },
            max_frame_size,
        }
    }

    /// Slice the next read should fill. Never empty.
    pub fn read_buf(&mut self) -> &mut [u8] {
        match self.stage {
            Stage::Header { filled } => &mut self.header[filled..],
            Stage::Body { filled } => &mut self.body[filled..],
        }
    }

    /// Record that `n` bytes were written into [`read_buf`](Self::read_buf).
    ///
    /// Returns the completed payload once the frame is whole.
    pub fn advance(&mut self, n: usize) -> Result<Option<Vec<u8>>, TransportError> {
        match self.stage {
            Stage::Header { filled } => {
                let filled = filled + n;
                debug_assert!(filled <= LENGTH_PREFIX_SIZE);
                if filled < LENGTH_PREFIX_SIZE {
                    self.stage = Stage::Header { filled };
                    return Ok(None);
                }
                let len = u32::from_le_bytes(self.header) as usize;
                if len > self.max_frame_size {
                    self.reset();
                    return Err(TransportError::FrameTooLarge {
                        len,
                        max: self.max_frame_size,
                    });
                }
                if len == 0 {
                    self.reset();
                    return Ok(Some(Vec::new()));
                }
                self.body = vec![0; len];
                self.stage = Stage::Body { filled: 0 };
                Ok(None)
            }
            Stage::Body { filled } => {
                let filled = filled + n;
                debug_assert!(filled <= self.body.len());
                if filled < self.body.len() {
                    self.stage = Stage::Body { filled };
                    return Ok(None);
                }
                let frame = std::mem::take(&mut self.body);
                self.reset();
                Ok(Some(frame))
            }
        }
    }

    /// Feed an arbitrary chunk of stream bytes, returning every frame it
    /// completes.
    pub fn push(&mut self, mut bytes: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let buf = self.read_buf();
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if let Some(frame) = self.advance(n)? {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.stage, Stage::Header { filled: 0 })
    }

    fn reset(&mut self) {
        self.stage = Stage::Header { filled: 0 };
        self.body = Vec::new();
    }
}
