use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::header::Method;
use crate::url_stream::{UrlStream, UrlStreamConfig};
use crate::Result;

/// Upper bound for a single ICY metadata block. The length byte allows
/// at most 255 * 16 = 4080 bytes.
pub const ICY_METADATA_MAX: usize = 4096;

/// Kind of metadata surfaced by an ICY stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Title,
    Name,
    Genre,
    Description,
}

/// Callback receiving metadata values as they are discovered
pub type MetadataCallback = Arc<dyn Fn(MetaKind, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IcyState {
    Data,
    Size,
    Metadata,
}

/// Icecast/Shoutcast metadata state machine.
///
/// The stream interleaves a metadata block after every `metaint` audio
/// bytes: one size byte S, then 16*S bytes of metadata. `process_byte`
/// classifies each byte and fires the callback when a complete
/// `StreamTitle='…';` block has been collected.
pub struct IcyMetaData {
    meta_interval: usize,
    next_state: IcyState,
    total_data: usize,
    meta: Vec<u8>,
    meta_len: usize,
    callback: Option<MetadataCallback>,
}

impl Default for IcyMetaData {
    fn default() -> Self {
        Self::new()
    }
}

impl IcyMetaData {
    pub fn new() -> Self {
        Self {
            meta_interval: 0,
            next_state: IcyState::Data,
            total_data: 0,
            meta: Vec::new(),
            meta_len: 0,
            callback: None,
        }
    }

    /// Defines the icy-metaint value provided by the http reply
    pub fn set_meta_interval(&mut self, interval: usize) {
        self.meta_interval = interval;
    }

    pub fn meta_interval(&self) -> usize {
        self.meta_interval
    }

    pub fn set_callback(&mut self, callback: MetadataCallback) {
        self.callback = Some(callback);
    }

    /// True when the stream announced a metadata interval
    pub fn has_metadata(&self) -> bool {
        self.meta_interval > 0
    }

    /// Resets all counters and restarts the processing
    pub fn begin(&mut self) {
        self.next_state = IcyState::Data;
        self.total_data = 0;
        self.meta.clear();
        self.meta_len = 0;
        debug!(metaint = self.meta_interval, "icy started");
    }

    pub fn end(&mut self) {
        self.begin();
    }

    /// Classify one stream byte; returns true when the byte is audio
    /// data that belongs to the caller.
    pub fn process_byte(&mut self, byte: u8) -> bool {
        match self.next_state {
            IcyState::Data => {
                self.total_data += 1;
                if self.total_data >= self.meta_interval {
                    self.total_data = 0;
                    self.next_state = IcyState::Size;
                }
                true
            }
            IcyState::Size => {
                self.total_data = 0;
                self.meta_len = (byte as usize) * 16;
                self.meta.clear();
                if self.meta_len == 0 {
                    self.next_state = IcyState::Data;
                } else if self.meta_len > ICY_METADATA_MAX {
                    warn!(len = self.meta_len, "unexpected metadata length, skipping");
                    self.meta_len = 0;
                    self.next_state = IcyState::Data;
                } else {
                    debug!(len = self.meta_len, "metadata found");
                    self.next_state = IcyState::Metadata;
                }
                false
            }
            IcyState::Metadata => {
                self.meta.push(byte);
                if self.meta.len() >= self.meta_len {
                    self.emit_metadata();
                    self.next_state = IcyState::Data;
                }
                false
            }
        }
    }

    /// e.g. `StreamTitle='House Bulldogs - But your love';StreamUrl='';`
    fn emit_metadata(&mut self) {
        let text = String::from_utf8_lossy(&self.meta);
        let text = text.trim_end_matches('\0');
        debug!(meta = %text, "metadata block complete");
        if let Some(start) = text.find("StreamTitle='") {
            let after = &text[start + "StreamTitle='".len()..];
            if let Some(end) = after.find("';") {
                let title = &after[..end];
                info!(title, "stream title");
                if let Some(callback) = &self.callback {
                    callback(MetaKind::Title, title);
                }
            }
        }
        self.meta.clear();
    }
}

/// Icecast/Shoutcast audio stream which splits the received bytes into
/// metadata and audio data. Audio is read with the regular stream
/// functions, metadata is surfaced through the callback.
///
/// This is a [`UrlStream`] with the `Icy-MetaData: 1` handshake turned on.
pub struct IcyStream {
    url: UrlStream,
    icy: IcyMetaData,
    callback: Option<MetadataCallback>,
}

impl Default for IcyStream {
    fn default() -> Self {
        Self::new(UrlStreamConfig::default())
    }
}

impl IcyStream {
    pub fn new(cfg: UrlStreamConfig) -> Self {
        Self {
            url: UrlStream::new(cfg),
            icy: IcyMetaData::new(),
            callback: None,
        }
    }

    /// Defines the metadata callback
    pub fn set_metadata_callback(&mut self, callback: MetadataCallback) {
        self.callback = Some(callback.clone());
        self.icy.set_callback(callback);
    }

    /// Icy http get request to the indicated url
    pub async fn begin(&mut self, url_str: &str, accept_mime: Option<&str>) -> Result<bool> {
        // signal participation in metadata interleaving
        self.url
            .http_request()
            .add_request_header("Icy-MetaData", "1");
        let result = self.url.begin(url_str, accept_mime, Method::Get, None, None).await?;

        if result {
            let meta_interval = self
                .url
                .reply_header("icy-metaint")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if meta_interval == 0 {
                warn!("url does not provide metadata");
            }
            self.emit_reply_metadata();
            self.icy.set_meta_interval(meta_interval);
            self.icy.begin();
        }
        Ok(result)
    }

    pub async fn end(&mut self) {
        self.url.end().await;
        self.icy.end();
    }

    pub fn available(&self) -> usize {
        self.url.available()
    }

    pub fn is_active(&self) -> bool {
        self.url.is_active()
    }

    pub fn has_metadata(&self) -> bool {
        self.icy.has_metadata()
    }

    pub fn total_read(&self) -> u64 {
        self.url.total_read()
    }

    /// Reads audio bytes; metadata bytes are consumed transparently and
    /// surfaced via the callback.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.icy.has_metadata() {
            // fast path when the stream carries no metadata
            return self.url.read_bytes(buf).await;
        }
        let read = self.url.read_bytes(buf).await?;
        let mut pos = 0;
        for j in 0..read {
            let byte = buf[j];
            if self.icy.process_byte(byte) {
                buf[pos] = byte;
                pos += 1;
            }
        }
        Ok(pos)
    }

    /// Access to the wrapped url stream
    pub fn url_stream(&mut self) -> &mut UrlStream {
        &mut self.url
    }

    // icy-name, icy-genre and icy-description arrive as reply headers
    fn emit_reply_metadata(&mut self) {
        let Some(callback) = &self.callback else {
            return;
        };
        for (key, kind) in [
            ("icy-name", MetaKind::Name),
            ("icy-genre", MetaKind::Genre),
            ("icy-description", MetaKind::Description),
        ] {
            if let Some(value) = self.url.reply_header(key) {
                if !value.is_empty() {
                    callback(kind, value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_callback() -> (MetadataCallback, Arc<Mutex<Vec<(MetaKind, String)>>>) {
        let seen: Arc<Mutex<Vec<(MetaKind, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let callback: MetadataCallback = Arc::new(move |kind, value: &str| {
            seen_cb.lock().unwrap().push((kind, value.to_string()));
        });
        (callback, seen)
    }

    #[test]
    fn test_audio_only_when_metaint_zero_blocks() {
        let mut icy = IcyMetaData::new();
        icy.set_meta_interval(4);
        icy.begin();

        // 4 audio bytes, size byte 0, 4 audio bytes
        let stream = [1u8, 2, 3, 4, 0, 5, 6, 7, 8];
        let audio: Vec<u8> = stream
            .iter()
            .filter(|&&b| icy.process_byte(b))
            .copied()
            .collect();
        assert_eq!(audio, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_title_extraction() {
        let (callback, seen) = collecting_callback();
        let mut icy = IcyMetaData::new();
        icy.set_meta_interval(2);
        icy.set_callback(callback);
        icy.begin();

        let mut stream: Vec<u8> = vec![0xAA, 0xBB];
        // size byte 1 -> 16 metadata bytes
        stream.push(1);
        let mut meta = b"StreamTitle='A';".to_vec();
        meta.resize(16, 0);
        stream.extend_from_slice(&meta);
        stream.extend_from_slice(&[0xCC, 0xDD]);

        let audio: Vec<u8> = stream
            .iter()
            .filter(|&&b| icy.process_byte(b))
            .copied()
            .collect();
        assert_eq!(audio, vec![0xAA, 0xBB, 0xCC, 0xDD]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (MetaKind::Title, "A".to_string()));
    }

    #[test]
    fn test_one_metadata_block_per_interval() {
        let (callback, seen) = collecting_callback();
        let mut icy = IcyMetaData::new();
        icy.set_meta_interval(3);
        icy.set_callback(callback);
        icy.begin();

        let mut meta = b"StreamTitle='x';".to_vec();
        meta.resize(16, 0);

        let mut audio_count = 0;
        for _round in 0..5 {
            for b in [9u8, 9, 9] {
                if icy.process_byte(b) {
                    audio_count += 1;
                }
            }
            assert!(!icy.process_byte(1)); // size byte
            for &b in &meta {
                assert!(!icy.process_byte(b));
            }
        }
        assert_eq!(audio_count, 15);
        assert_eq!(seen.lock().unwrap().len(), 5);
    }
}
