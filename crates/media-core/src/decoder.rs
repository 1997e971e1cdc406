use std::sync::Arc;

use parking_lot::Mutex;

use audiocast_mp3_core::Mp3FrameParser;

/// Shared sink receiving decoded host-order PCM (or whole compressed
/// frames for passthrough decoders). Several decoders can feed the
/// same sink, only one of them being selected at a time.
pub type SharedPcmSink = Arc<Mutex<Box<dyn FnMut(&[u8]) + Send>>>;

/// Wrap a closure into a [`SharedPcmSink`]
pub fn shared_sink<F>(f: F) -> SharedPcmSink
where
    F: FnMut(&[u8]) + Send + 'static,
{
    Arc::new(Mutex::new(Box::new(f)))
}

/// A byte transformer with a declared lifecycle. `write` consumes
/// payload bytes and pushes the decoded result to its sink.
pub trait AudioDecoder: Send {
    fn begin(&mut self) {}
    fn end(&mut self) {}
    fn write(&mut self, data: &[u8]) -> usize;
}

/// Converts big-endian (network order) 16 bit samples to host order.
///
/// A dangling odd byte is kept until the next write, so sample pairs
/// may be split across packet boundaries.
pub struct NetworkOrderDecoder {
    sink: SharedPcmSink,
    pending: Option<u8>,
}

impl NetworkOrderDecoder {
    pub fn new(sink: SharedPcmSink) -> Self {
        Self {
            sink,
            pending: None,
        }
    }
}

impl AudioDecoder for NetworkOrderDecoder {
    fn begin(&mut self) {
        self.pending = None;
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut bytes: Vec<u8> = Vec::with_capacity(data.len() + 1);
        if let Some(b) = self.pending.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(data);

        let n = bytes.len() & !1;
        if bytes.len() > n {
            self.pending = Some(bytes[n]);
        }
        let mut out = Vec::with_capacity(n);
        for pair in bytes[..n].chunks_exact(2) {
            let value = i16::from_be_bytes([pair[0], pair[1]]);
            out.extend_from_slice(&value.to_ne_bytes());
        }
        (*self.sink.lock())(&out);
        data.len()
    }
}

/// Expands unsigned 8 bit samples (L8) to host order 16 bit samples
pub struct L8Decoder {
    sink: SharedPcmSink,
}

impl L8Decoder {
    pub fn new(sink: SharedPcmSink) -> Self {
        Self { sink }
    }
}

impl AudioDecoder for L8Decoder {
    fn write(&mut self, data: &[u8]) -> usize {
        let mut out = Vec::with_capacity(data.len() * 2);
        for &byte in data {
            let value = ((byte as i16) - 128) << 8;
            out.extend_from_slice(&value.to_ne_bytes());
        }
        (*self.sink.lock())(&out);
        data.len()
    }
}

/// Re-frames an MPEG audio byte stream and forwards whole frames.
/// Useful in front of an actual MP3 decoder that expects frame
/// aligned input.
pub struct Mp3FrameDecoder {
    parser: Mp3FrameParser,
}

impl Mp3FrameDecoder {
    pub fn new(sink: SharedPcmSink) -> Self {
        let mut parser = Mp3FrameParser::default();
        let frame_sink = sink.clone();
        parser.set_sink(Box::new(move |frame: &[u8]| {
            (*frame_sink.lock())(frame);
        }));
        Self { parser }
    }

    pub fn sample_rate(&self) -> u32 {
        self.parser.sample_rate()
    }

    pub fn bit_rate(&self) -> u32 {
        self.parser.bit_rate()
    }
}

impl AudioDecoder for Mp3FrameDecoder {
    fn begin(&mut self) {
        self.parser.reset();
    }

    fn end(&mut self) {
        self.parser.flush();
        self.parser.reset();
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.parser.write(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> (SharedPcmSink, Arc<Mutex<Vec<u8>>>) {
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = shared_sink(move |data: &[u8]| {
            captured.lock().extend_from_slice(data);
        });
        (sink, seen)
    }

    #[test]
    fn test_network_order_decoder() {
        let (sink, seen) = capture();
        let mut decoder = NetworkOrderDecoder::new(sink);
        decoder.begin();

        // 0x0102 and 0x0304 big-endian
        decoder.write(&[0x01, 0x02, 0x03, 0x04]);
        let expected: Vec<u8> = [0x0102i16, 0x0304]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn test_network_order_decoder_odd_split() {
        let (sink, seen) = capture();
        let mut decoder = NetworkOrderDecoder::new(sink);
        decoder.begin();

        decoder.write(&[0x01]);
        assert!(seen.lock().is_empty());
        decoder.write(&[0x02, 0x7F, 0xFF]);

        let expected: Vec<u8> = [0x0102i16, 0x7FFF]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn test_l8_decoder_expands() {
        let (sink, seen) = capture();
        let mut decoder = L8Decoder::new(sink);

        decoder.write(&[128, 255, 0]);
        let expected: Vec<u8> = [0i16, 127 << 8, -128 << 8]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn test_mp3_frame_decoder_reframes() {
        let (sink, seen) = capture();
        let mut decoder = Mp3FrameDecoder::new(sink);
        decoder.begin();

        let mut frame = vec![0xFF, 0xFB, 0x90, 0x64];
        frame.resize(417, 0x22);
        let mut stream = vec![0x00, 0x01]; // leading garbage
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(&frame);

        decoder.write(&stream);
        let seen = seen.lock();
        assert!(seen.len() >= 417);
        assert_eq!(&seen[..4], &[0xFF, 0xFB, 0x90, 0x64]);
    }
}
