use tracing::{info, warn};

use crate::decoder::AudioDecoder;
use crate::{Error, Result};

/// Routes payload bytes to the decoder registered for the negotiated
/// MIME type. Exactly one decoder is selected at a time; writes with no
/// selection are dropped.
#[derive(Default)]
pub struct DecoderRegistry {
    entries: Vec<(String, Box<dyn AudioDecoder>)>,
    selected: Option<usize>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for a MIME type; replaces an earlier
    /// registration for the same type
    pub fn add_decoder(&mut self, mime: &str, decoder: Box<dyn AudioDecoder>) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(m, _)| m.eq_ignore_ascii_case(mime))
        {
            entry.1 = decoder;
        } else {
            self.entries.push((mime.to_string(), decoder));
        }
    }

    /// Select and start the decoder for `mime`
    pub fn select(&mut self, mime: &str) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|(m, _)| m.eq_ignore_ascii_case(mime))
            .ok_or_else(|| Error::UnsupportedFormat(mime.to_string()))?;
        info!(mime, "decoder selected");
        self.selected = Some(index);
        self.entries[index].1.begin();
        Ok(())
    }

    pub fn selected_mime(&self) -> Option<&str> {
        self.selected.map(|i| self.entries[i].0.as_str())
    }

    pub fn is_selected(&self) -> bool {
        self.selected.is_some()
    }

    /// Forward payload bytes to the selected decoder
    pub fn write(&mut self, data: &[u8]) -> usize {
        match self.selected {
            Some(index) => self.entries[index].1.write(data),
            None => {
                warn!("write without a selected decoder");
                0
            }
        }
    }

    /// End the selected decoder and clear the selection
    pub fn end(&mut self) {
        if let Some(index) = self.selected.take() {
            self.entries[index].1.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{shared_sink, NetworkOrderDecoder};
    use std::sync::Arc;

    #[test]
    fn test_select_and_write() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = shared_sink(move |data: &[u8]| captured.lock().extend_from_slice(data));

        let mut registry = DecoderRegistry::new();
        registry.add_decoder("audio/L16", Box::new(NetworkOrderDecoder::new(sink)));

        assert!(registry.select("AUDIO/l16").is_ok());
        assert_eq!(registry.selected_mime(), Some("audio/L16"));
        assert_eq!(registry.write(&[0x00, 0x01]), 2);
        assert!(!seen.lock().is_empty());
    }

    #[test]
    fn test_unknown_mime_rejected() {
        let mut registry = DecoderRegistry::new();
        assert!(matches!(
            registry.select("audio/opus"),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_write_without_selection_is_dropped() {
        let mut registry = DecoderRegistry::new();
        assert_eq!(registry.write(&[1, 2, 3]), 0);
    }
}
