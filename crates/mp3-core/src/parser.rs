use tracing::{debug, info};

use crate::header::{find_frame_sync, FrameHeader, MpegVersion};

/// Sink receiving complete MP3 frames
pub type FrameSink = Box<dyn FnMut(&[u8]) + Send>;

/// Default internal buffer size; the largest legal frame is well below this
const DEFAULT_BUFFER_SIZE: usize = 4096;

/// How far `is_valid_mp3` searches for frame syncs
const MAX_SEARCH_DISTANCE: usize = 8192;

/// Consecutive valid frames required for a confident classification
const MIN_FRAMES_TO_VALIDATE: usize = 3;

/// Incremental MP3 frame splitter.
///
/// Bytes are appended with [`write`](Self::write); whenever the internal
/// buffer holds a complete, validated frame it is handed to the frame
/// sink. Partial frames are retained across calls, so feeding the parser
/// one byte at a time produces the same output as one large write.
pub struct Mp3FrameParser {
    buffer: Vec<u8>,
    capacity: usize,
    sink: Option<FrameSink>,
    header: Option<FrameHeader>,
    last_frame_len: usize,
}

impl Default for Mp3FrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl Mp3FrameParser {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(buffer_size.max(FrameHeader::SERIALIZED_SIZE)),
            capacity: buffer_size.max(FrameHeader::SERIALIZED_SIZE),
            sink: None,
            header: None,
            last_frame_len: 0,
        }
    }

    /// Frames are delivered to `sink`, one whole frame per call
    pub fn set_sink(&mut self, sink: FrameSink) {
        self.sink = Some(sink);
    }

    /// Append data and drain all complete frames
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.buffer.extend_from_slice(data);
        while self.process_buffer() {}
        data.len()
    }

    /// Drain any complete frames still in the buffer
    pub fn flush(&mut self) {
        while self.process_buffer() {}
    }

    /// Clear the buffer and all parse state
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.header = None;
        self.last_frame_len = 0;
    }

    /// True once at least one valid frame has been emitted
    pub fn has_valid_frame(&self) -> bool {
        self.header.is_some()
    }

    /// Header of the last emitted frame
    pub fn frame_header(&self) -> Option<&FrameHeader> {
        self.header.as_ref()
    }

    pub fn sample_rate(&self) -> u32 {
        self.header.and_then(|h| h.sample_rate()).unwrap_or(0)
    }

    pub fn bit_rate(&self) -> u32 {
        self.header.and_then(|h| h.bit_rate()).unwrap_or(0)
    }

    pub fn frame_len(&self) -> usize {
        self.header.map(|h| h.frame_len()).unwrap_or(0)
    }

    pub fn samples_per_frame(&self) -> u32 {
        self.header.map(|h| h.samples_per_frame()).unwrap_or(0)
    }

    pub fn time_per_frame_ms(&self) -> u32 {
        self.header.map(|h| h.time_per_frame_ms()).unwrap_or(0)
    }

    pub fn frame_rate_hz(&self) -> u32 {
        self.header.map(|h| h.frame_rate_hz()).unwrap_or(0)
    }

    /// Estimated playing time in seconds derived from the bitrate of
    /// the last frame
    pub fn playing_time_secs(&self, file_size_bytes: u64) -> u64 {
        let bit_rate = self.bit_rate() as u64;
        if bit_rate == 0 {
            return 0;
        }
        file_size_bytes * 8 / bit_rate
    }

    /// Bytes currently buffered (the retained partial frame)
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    // One drain step; returns true when the buffer changed
    fn process_buffer(&mut self) -> bool {
        if self.buffer.len() < FrameHeader::SERIALIZED_SIZE {
            return false;
        }

        let Some(sync_pos) = find_frame_sync(&self.buffer) else {
            // keep the tail in case a sync spans the buffer boundary
            let keep = self.buffer.len().min(3);
            let to_remove = self.buffer.len() - keep;
            if to_remove > 0 {
                self.buffer.drain(..to_remove);
                return true;
            }
            return false;
        };

        // discard leading bytes before the sync
        if sync_pos > 0 {
            self.buffer.drain(..sync_pos);
            return true;
        }

        let Some(header) = FrameHeader::parse(&self.buffer) else {
            self.buffer.drain(..1);
            return true;
        };
        if header.validate().is_err() {
            self.buffer.drain(..1);
            return true;
        }

        let frame_len = header.frame_len();
        if frame_len < FrameHeader::SERIALIZED_SIZE || frame_len > self.capacity {
            self.buffer.drain(..1);
            return true;
        }

        if self.buffer.len() < frame_len {
            // need more data for the complete frame
            return false;
        }

        // when enough bytes are buffered the next frame must start with
        // a sync directly after this one, otherwise resynchronize
        if self.buffer.len() >= frame_len + 2
            && find_frame_sync(&self.buffer[frame_len..frame_len + 2]) != Some(0)
        {
            self.buffer.drain(..1);
            return true;
        }

        if let Some(sink) = self.sink.as_mut() {
            sink(&self.buffer[..frame_len]);
        }
        debug!(frame_len, "frame emitted");
        self.header = Some(header);
        self.last_frame_len = frame_len;
        self.buffer.drain(..frame_len);
        true
    }
}

/// Classify a buffer as MP3 data.
///
/// A leading ID3v2 tag is skipped via its synchsafe size. Buffers with a
/// VBR header (Xing/Info/VBRI) are accepted directly. Otherwise frames
/// are walked and an adaptive policy applies: large buffers need three
/// consecutive valid frames, medium buffers two consecutive or three in
/// total, small buffers one frame whose length is within 10% of the
/// nominal length for its bitrate and sample rate.
pub fn is_valid_mp3(data: &[u8]) -> bool {
    if data.len() < 10 {
        debug!("buffer too small to classify");
        return false;
    }

    // ID3v2 tag: skip 10 + synchsafe size, then validate the audio
    if &data[..3] == b"ID3" {
        info!("ID3v2 tag found");
        let id3_size = ((data[6] & 0x7F) as usize) << 21
            | ((data[7] & 0x7F) as usize) << 14
            | ((data[8] & 0x7F) as usize) << 7
            | (data[9] & 0x7F) as usize;
        let audio_start = 10 + id3_size;
        if audio_start < data.len() {
            return is_valid_mp3(&data[audio_start..]);
        }
        // tag covers the whole buffer
        return true;
    }

    let search_len = data.len().min(MAX_SEARCH_DISTANCE);
    let Some(sync_pos) = find_frame_sync(&data[..search_len]) else {
        debug!("no frame sync found");
        return false;
    };

    if contains(&data[sync_pos..], b"Xing")
        || contains(&data[sync_pos..], b"Info")
        || contains(&data[sync_pos..], b"VBRI")
    {
        info!("VBR header found");
        return true;
    }

    let mut pos = sync_pos;
    let mut valid_frames = 0usize;
    let mut consecutive = 0usize;
    let mut first_header: Option<FrameHeader> = None;

    while pos + FrameHeader::SERIALIZED_SIZE <= data.len() && (pos - sync_pos) < MAX_SEARCH_DISTANCE
    {
        let header = match FrameHeader::parse(&data[pos..]) {
            Some(header) if header.validate().is_ok() => header,
            _ => {
                consecutive = 0;
                match find_frame_sync(&data[pos + 1..]) {
                    Some(off) => {
                        pos = pos + 1 + off;
                        continue;
                    }
                    None => break,
                }
            }
        };

        let frame_len = header.frame_len();
        if frame_len < FrameHeader::SERIALIZED_SIZE || frame_len > DEFAULT_BUFFER_SIZE {
            consecutive = 0;
            pos += 1;
            continue;
        }

        if first_header.is_none() {
            // a small buffer allows only one frame, so that frame has to
            // look plausible on its own
            if data.len() < 1024 && !frame_len_plausible(&header, frame_len) {
                consecutive = 0;
                pos += 1;
                continue;
            }
            first_header = Some(header);
        }

        valid_frames += 1;
        consecutive += 1;

        let next = pos + frame_len;
        if next + 2 <= data.len() {
            let window_end = (next + 4).min(data.len());
            if find_frame_sync(&data[next..window_end]) == Some(0) {
                pos = next;
                continue;
            }
            consecutive = 0;
            match find_frame_sync(&data[pos + 1..]) {
                Some(off) => pos = pos + 1 + off,
                None => break,
            }
        } else {
            break;
        }
    }

    let result = if data.len() >= 2048 {
        consecutive >= MIN_FRAMES_TO_VALIDATE
    } else if data.len() >= 1024 {
        consecutive >= 2 || valid_frames >= MIN_FRAMES_TO_VALIDATE
    } else {
        valid_frames >= 1 && first_header.is_some()
    };

    debug!(
        valid_frames,
        consecutive,
        len = data.len(),
        result,
        "mp3 classification"
    );
    result
}

// frame length within 10% of the nominal (144|72) * bitrate / rate
fn frame_len_plausible(header: &FrameHeader, frame_len: usize) -> bool {
    let (Some(bit_rate), Some(sample_rate)) = (header.bit_rate(), header.sample_rate()) else {
        return false;
    };
    if bit_rate == 0 || sample_rate == 0 {
        return false;
    }
    let base: u32 = if header.version == MpegVersion::Mpeg1 { 144 } else { 72 };
    let expected = (base * bit_rate / sample_rate) as i64;
    if expected == 0 {
        return false;
    }
    (frame_len as i64 - expected).abs() * 10 <= expected
}

fn contains(data: &[u8], needle: &[u8]) -> bool {
    data.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    // MPEG-1 Layer III, 128 kbit/s, 44.1 kHz: 417 byte frames
    fn test_frame() -> Vec<u8> {
        let mut frame = vec![0xFF, 0xFB, 0x90, 0x64];
        frame.resize(417, 0xA5);
        frame
    }

    fn parser_with_capture() -> (Mp3FrameParser, Arc<Mutex<Vec<Vec<u8>>>>) {
        let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = frames.clone();
        let mut parser = Mp3FrameParser::default();
        parser.set_sink(Box::new(move |frame: &[u8]| {
            captured.lock().unwrap().push(frame.to_vec());
        }));
        (parser, frames)
    }

    #[test]
    fn test_three_frames_are_emitted_unchanged() {
        let frame = test_frame();
        let mut input = Vec::new();
        for _ in 0..3 {
            input.extend_from_slice(&frame);
        }

        let (mut parser, frames) = parser_with_capture();
        parser.write(&input);

        let frames = frames.lock().unwrap();
        // the last frame has no following sync yet but is complete
        assert!(frames.len() >= 2);
        for emitted in frames.iter() {
            assert_eq!(emitted, &frame);
        }
        assert!(parser.has_valid_frame());
        assert_eq!(parser.sample_rate(), 44_100);
        assert_eq!(parser.bit_rate(), 128_000);
        assert_eq!(parser.frame_len(), 417);
    }

    #[test]
    fn test_byte_at_a_time_equals_bulk() {
        let frame = test_frame();
        let mut input = Vec::new();
        for _ in 0..4 {
            input.extend_from_slice(&frame);
        }

        let (mut bulk, bulk_frames) = parser_with_capture();
        bulk.write(&input);

        let (mut single, single_frames) = parser_with_capture();
        for byte in &input {
            single.write(std::slice::from_ref(byte));
        }

        assert_eq!(*bulk_frames.lock().unwrap(), *single_frames.lock().unwrap());
        assert_eq!(bulk.buffered(), single.buffered());
    }

    #[test]
    fn test_leading_garbage_is_discarded() {
        let frame = test_frame();
        let mut input = vec![0x00, 0x12, 0x34, 0x56, 0x78];
        input.extend_from_slice(&frame);
        input.extend_from_slice(&frame);

        let (mut parser, frames) = parser_with_capture();
        parser.write(&input);

        let frames = frames.lock().unwrap();
        assert!(!frames.is_empty());
        assert_eq!(frames[0], frame);
    }

    #[test]
    fn test_false_sync_is_skipped() {
        let frame = test_frame();
        // a sync-looking pair followed by an invalid header byte pattern
        let mut input = vec![0xFF, 0xFB, 0xF0, 0x64];
        input.extend_from_slice(&frame);
        input.extend_from_slice(&frame);

        let (mut parser, frames) = parser_with_capture();
        parser.write(&input);

        let frames = frames.lock().unwrap();
        assert!(!frames.is_empty());
        assert_eq!(frames[0], frame);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let frame = test_frame();
        let (mut parser, frames) = parser_with_capture();

        parser.write(&frame[..100]);
        assert_eq!(frames.lock().unwrap().len(), 0);
        assert_eq!(parser.buffered(), 100);

        parser.write(&frame[100..]);
        parser.write(&frame);
        assert!(frames.lock().unwrap().len() >= 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let frame = test_frame();
        let (mut parser, _frames) = parser_with_capture();
        parser.write(&frame[..50]);
        parser.reset();
        assert_eq!(parser.buffered(), 0);
        assert!(!parser.has_valid_frame());
    }

    #[test]
    fn test_is_valid_small_buffer() {
        let frame = test_frame();
        assert!(is_valid_mp3(&frame));
    }

    #[test]
    fn test_is_valid_large_buffer_needs_consecutive_frames() {
        let frame = test_frame();
        let mut stream = Vec::new();
        for _ in 0..6 {
            stream.extend_from_slice(&frame);
        }
        assert!(is_valid_mp3(&stream));
    }

    #[test]
    fn test_random_data_is_not_mp3() {
        let data: Vec<u8> = (0..4096).map(|i| (i * 31 % 251) as u8).collect();
        assert!(!is_valid_mp3(&data));
    }

    #[test]
    fn test_id3_tag_is_skipped() {
        let frame = test_frame();
        // ID3v2 header with a 100 byte synchsafe size
        let mut data = vec![b'I', b'D', b'3', 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 100];
        data.resize(10 + 100, 0);
        for _ in 0..4 {
            data.extend_from_slice(&frame);
        }
        assert!(is_valid_mp3(&data));
    }

    #[test]
    fn test_aac_adts_is_rejected() {
        // ADTS header sync 0xFFF1
        let mut data = vec![0xFF, 0xF1, 0x50, 0x80, 0x00, 0x1F, 0xFC];
        data.resize(512, 0x11);
        assert!(!is_valid_mp3(&data));
    }
}
