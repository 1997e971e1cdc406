use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::payload::RtpAudioFormat;

/// Contract for audio data providers feeding an [`crate::RtpStreamer`].
///
/// `read_bytes` is called periodically from the streaming task and must
/// not block: it fills the destination with whatever audio is available
/// and returns 0 when there is none.
pub trait AudioSource: Send {
    /// The payload format describing the delivered bytes
    fn format(&self) -> &RtpAudioFormat;

    /// Called when streaming is about to begin
    fn start(&mut self) {}

    /// Called when streaming has ended
    fn stop(&mut self) {}

    /// Fill `dest` with audio bytes; returns the number written
    fn read_bytes(&mut self, dest: &mut [u8]) -> usize;
}

/// Audio source backed by a PCM byte buffer, optionally looping.
/// Useful for tests and canned announcements.
pub struct PcmBufferSource {
    format: RtpAudioFormat,
    data: Vec<u8>,
    pos: usize,
    looping: bool,
}

impl PcmBufferSource {
    pub fn new(format: RtpAudioFormat, data: Vec<u8>) -> Self {
        Self {
            format,
            data,
            pos: 0,
            looping: false,
        }
    }

    /// Restart from the beginning when the buffer is exhausted
    pub fn with_looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl AudioSource for PcmBufferSource {
    fn format(&self) -> &RtpAudioFormat {
        &self.format
    }

    fn start(&mut self) {
        self.pos = 0;
    }

    fn read_bytes(&mut self, dest: &mut [u8]) -> usize {
        if self.pos >= self.data.len() {
            if !self.looping {
                return 0;
            }
            self.pos = 0;
        }
        let n = dest.len().min(self.data.len() - self.pos);
        dest[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }
}

/// Push style audio source backed by a bounded byte queue.
///
/// Audio written through a [`QueueWriter`] is buffered here and
/// drained by the streamer's periodic reads, decoupling producers
/// (e.g. an encoder pipeline) from the packet clock.
pub struct QueueAudioSource {
    format: RtpAudioFormat,
    shared: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
    started: bool,
}

/// Default queue capacity in bytes
const QUEUE_CAPACITY: usize = 8 * 1024;

impl QueueAudioSource {
    pub fn new(format: RtpAudioFormat) -> Self {
        Self::with_capacity(format, QUEUE_CAPACITY)
    }

    pub fn with_capacity(format: RtpAudioFormat, capacity: usize) -> Self {
        Self {
            format,
            shared: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            started: false,
        }
    }

    /// Writer handle feeding this source; cheap to clone
    pub fn writer(&self) -> QueueWriter {
        QueueWriter {
            shared: self.shared.clone(),
            capacity: self.capacity,
        }
    }

    /// Buffered bytes waiting to be streamed
    pub fn available(&self) -> usize {
        self.shared.lock().len()
    }
}

impl AudioSource for QueueAudioSource {
    fn format(&self) -> &RtpAudioFormat {
        &self.format
    }

    fn start(&mut self) {
        self.started = true;
    }

    fn stop(&mut self) {
        self.started = false;
        self.shared.lock().clear();
    }

    fn read_bytes(&mut self, dest: &mut [u8]) -> usize {
        if !self.started {
            return 0;
        }
        let mut queue = self.shared.lock();
        let n = dest.len().min(queue.len());
        for slot in dest.iter_mut().take(n) {
            *slot = queue.pop_front().unwrap_or(0);
        }
        n
    }
}

/// Producer handle for a [`QueueAudioSource`]
#[derive(Clone)]
pub struct QueueWriter {
    shared: Arc<Mutex<VecDeque<u8>>>,
    capacity: usize,
}

impl QueueWriter {
    /// Append audio bytes, up to the free capacity; returns the number
    /// accepted
    pub fn write(&self, data: &[u8]) -> usize {
        let mut queue = self.shared.lock();
        let free = self.capacity.saturating_sub(queue.len());
        let n = data.len().min(free);
        queue.extend(&data[..n]);
        n
    }

    /// Free space in the queue
    pub fn available_for_write(&self) -> usize {
        self.capacity.saturating_sub(self.shared.lock().len())
    }
}
