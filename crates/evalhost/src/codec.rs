//! Incremental sentinel-delimited frame decoding for worker stdio streams.
//!
//! The wire protocol delimits messages with single reserved control bytes
//! (see [`crate::config::Sentinels`]). Stream chunks arrive in arbitrary
//! splits, so the decoder accumulates bytes and yields one decoded unit per
//! sentinel occurrence. It is independent of any I/O API so that framing can
//! be tested without spawning processes.

/// Accumulates raw stream bytes and splits off sentinel-delimited frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of raw stream bytes to the internal buffer.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Splits off the first complete frame delimited by `sentinel`.
    ///
    /// The sentinel byte itself is consumed. Bytes following it stay
    /// buffered and belong to the next frame.
    pub fn split_frame(&mut self, sentinel: u8) -> Option<Vec<u8>> {
        let index = self.buf.iter().position(|byte| *byte == sentinel)?;
        let mut frame: Vec<u8> = self.buf.drain(..=index).collect();
        frame.pop();
        Some(frame)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes accumulated without a completed frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Takes whatever partial data is buffered, leaving the decoder empty.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
