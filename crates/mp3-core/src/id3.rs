//! ID3 tag parsing for MP3 streams
//!
//! Extracts title, artist, album and genre from ID3v1 tags (the fixed
//! 128 byte block at the end of a file, or the 227 byte `TAG+`
//! extension) and from ID3v2 tags at the stream start. Audio data is
//! simply written through the parser; results arrive via callback.

use std::sync::Arc;

use tracing::{debug, info, warn};

/// Field kinds surfaced from an ID3 tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Id3Field {
    Title,
    Artist,
    Album,
    Genre,
}

/// Callback receiving parsed tag fields
pub type Id3Callback = Arc<dyn Fn(Id3Field, &str) + Send + Sync>;

/// ID3v1 genre table; the ID3v1 genre byte and `(nn)` references in
/// ID3v2 TCON frames index into it
pub const ID3_GENRES: [&str; 148] = [
    "Blues", "Classic Rock", "Country", "Dance", "Disco", "Funk", "Grunge", "Hip-Hop", "Jazz",
    "Metal", "New Age", "Oldies", "Other", "Pop", "R&B", "Rap", "Reggae", "Rock", "Techno",
    "Industrial", "Alternative", "Ska", "Death Metal", "Pranks", "Soundtrack", "Euro-Techno",
    "Ambient", "Trip-Hop", "Vocal", "Jazz+Funk", "Fusion", "Trance", "Classical", "Instrumental",
    "Acid", "House", "Game", "Sound Clip", "Gospel", "Noise", "Alternative Rock", "Bass", "Soul",
    "Punk", "Space", "Meditative", "Instrumental Pop", "Instrumental Rock", "Ethnic", "Gothic",
    "Darkwave", "Techno-Industrial", "Electronic", "Pop-Folk", "Eurodance", "Dream",
    "Southern Rock", "Comedy", "Cult", "Gangsta", "Top 40", "Christian Rap", "Pop/Funk", "Jungle",
    "Native US", "Cabaret", "New Wave", "Psychedelic", "Rave", "Showtunes", "Trailer", "Lo-Fi",
    "Tribal", "Acid Punk", "Acid Jazz", "Polka", "Retro", "Musical", "Rock & Roll", "Hard Rock",
    "Folk", "Folk-Rock", "National Folk", "Swing", "Fast Fusion", "Bebob", "Latin", "Revival",
    "Celtic", "Bluegrass", "Avantgarde", "Gothic Rock", "Progressive Rock", "Psychedelic Rock",
    "Symphonic Rock", "Slow Rock", "Big Band", "Chorus", "Easy Listening", "Acoustic", "Humour",
    "Speech", "Chanson", "Opera", "Chamber Music", "Sonata", "Symphony", "Booty Bass", "Primus",
    "Porn Groove", "Satire", "Slow Jam", "Club", "Tango", "Samba", "Folklore", "Ballad",
    "Power Ballad", "Rhythmic Soul", "Freestyle", "Duet", "Punk Rock", "Drum Solo", "Acapella",
    "Euro-House", "Dance Hall", "Goa", "Drum & Bass", "Club-House", "Hardcore", "Terror", "Indie",
    "BritPop", "Negerpunk", "Polsk Punk", "Beat", "Christian Gangsta", "Heavy Metal",
    "Black Metal", "Crossover", "Contemporary C", "Christian Rock", "Merengue", "Salsa",
    "Thrash Metal", "Anime", "JPop", "SynthPop",
];

/// Size of a plain ID3v1 tag
const ID3V1_SIZE: usize = 128;

/// Size of an enhanced `TAG+` block
const ID3V1_ENHANCED_SIZE: usize = 227;

/// Upper bound for a buffered ID3v2 tag
const ID3V2_MAX_SIZE: usize = 64 * 1024;

/// The ID3v2 text frames that are surfaced
const ID3V2_TEXT_FRAMES: [(&[u8; 4], Id3Field); 5] = [
    (b"TIT2", Id3Field::Title),
    (b"TPE1", Id3Field::Artist),
    (b"TOPE", Id3Field::Artist),
    (b"TALB", Id3Field::Album),
    (b"TCON", Id3Field::Genre),
];

fn trimmed_latin1(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parser for the ID3v1 tag at the end of an MP3 file.
///
/// The tag may be split across writes; a tail window of the previous
/// write is retained so `TAG`/`TAG+` blocks spanning a boundary are
/// still found.
pub struct Id3v1Parser {
    callback: Option<Id3Callback>,
    window: Vec<u8>,
    processed: bool,
}

impl Default for Id3v1Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Id3v1Parser {
    pub fn new() -> Self {
        Self {
            callback: None,
            window: Vec::new(),
            processed: false,
        }
    }

    pub fn set_callback(&mut self, callback: Id3Callback) {
        self.callback = Some(callback);
    }

    pub fn begin(&mut self) {
        self.window.clear();
        self.processed = false;
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    /// Write audio data through the parser
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.callback.is_none() || self.processed {
            return data.len();
        }
        self.window.extend_from_slice(data);
        self.scan();
        // keep one tag length as carry for boundary spanning tags
        if self.window.len() > ID3V1_ENHANCED_SIZE {
            let drop = self.window.len() - ID3V1_ENHANCED_SIZE;
            self.window.drain(..drop);
        }
        data.len()
    }

    fn scan(&mut self) {
        // TAG+ first; a plain TAG match would also hit its prefix
        if let Some(pos) = find(&self.window, b"TAG+") {
            if self.window.len() - pos >= ID3V1_ENHANCED_SIZE {
                let tag = self.window[pos..pos + ID3V1_ENHANCED_SIZE].to_vec();
                self.emit_enhanced(&tag);
                self.processed = true;
            }
            return;
        }
        if let Some(pos) = find(&self.window, b"TAG") {
            if self.window.len() - pos >= ID3V1_SIZE {
                let tag = self.window[pos..pos + ID3V1_SIZE].to_vec();
                self.emit_v1(&tag);
                self.processed = true;
            }
        }
    }

    // TAG + title[30] + artist[30] + album[30] + year[4] + comment[30] + genre
    fn emit_v1(&self, tag: &[u8]) {
        let Some(callback) = &self.callback else {
            return;
        };
        info!("ID3v1 tag found");
        emit_if_present(callback, Id3Field::Title, &tag[3..33]);
        emit_if_present(callback, Id3Field::Artist, &tag[33..63]);
        emit_if_present(callback, Id3Field::Album, &tag[63..93]);
        let genre = tag[127] as usize;
        if let Some(name) = ID3_GENRES.get(genre) {
            callback(Id3Field::Genre, name);
        }
    }

    // TAG+ + title[60] + artist[60] + album[60] + speed + genre[30]
    fn emit_enhanced(&self, tag: &[u8]) {
        let Some(callback) = &self.callback else {
            return;
        };
        info!("enhanced ID3v1 tag found");
        emit_if_present(callback, Id3Field::Title, &tag[4..64]);
        emit_if_present(callback, Id3Field::Artist, &tag[64..124]);
        emit_if_present(callback, Id3Field::Album, &tag[124..184]);
        emit_if_present(callback, Id3Field::Genre, &tag[185..215]);
    }
}

fn emit_if_present(callback: &Id3Callback, field: Id3Field, bytes: &[u8]) {
    let value = trimmed_latin1(bytes);
    if !value.is_empty() {
        callback(field, &value);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn synchsafe(bytes: &[u8]) -> usize {
    ((bytes[0] & 0x7F) as usize) << 21
        | ((bytes[1] & 0x7F) as usize) << 14
        | ((bytes[2] & 0x7F) as usize) << 7
        | (bytes[3] & 0x7F) as usize
}

#[derive(Debug, PartialEq, Eq)]
enum Id3v2State {
    Searching,
    Collecting,
    Done,
}

/// Parser for an ID3v2 tag at the start of a stream.
///
/// The tag (header plus synchsafe size) is buffered, then the text
/// frames TIT2/TPE1/TOPE/TALB/TCON are extracted. Only ISO-8859-1 and
/// UTF-8 encodings are surfaced.
pub struct Id3v2Parser {
    callback: Option<Id3Callback>,
    state: Id3v2State,
    buffer: Vec<u8>,
    needed: usize,
}

impl Default for Id3v2Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Id3v2Parser {
    pub fn new() -> Self {
        Self {
            callback: None,
            state: Id3v2State::Searching,
            buffer: Vec::new(),
            needed: 0,
        }
    }

    pub fn set_callback(&mut self, callback: Id3Callback) {
        self.callback = Some(callback);
    }

    pub fn begin(&mut self) {
        self.state = Id3v2State::Searching;
        self.buffer.clear();
        self.needed = 0;
    }

    pub fn is_processed(&self) -> bool {
        self.state == Id3v2State::Done
    }

    /// Write audio data through the parser
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.callback.is_none() || self.state == Id3v2State::Done {
            return data.len();
        }

        match self.state {
            Id3v2State::Searching => {
                self.buffer.extend_from_slice(data);
                if let Some(pos) = find(&self.buffer, b"ID3") {
                    self.buffer.drain(..pos);
                    if self.buffer.len() >= 10 {
                        let size = synchsafe(&self.buffer[6..10]);
                        self.needed = 10 + size;
                        if self.needed > ID3V2_MAX_SIZE {
                            warn!(size, "oversized ID3v2 tag skipped");
                            self.state = Id3v2State::Done;
                            self.buffer.clear();
                        } else {
                            self.state = Id3v2State::Collecting;
                            self.try_parse();
                        }
                    }
                } else {
                    // the marker can span a write boundary
                    let keep = self.buffer.len().min(2);
                    let drop = self.buffer.len() - keep;
                    self.buffer.drain(..drop);
                }
            }
            Id3v2State::Collecting => {
                self.buffer.extend_from_slice(data);
                self.try_parse();
            }
            Id3v2State::Done => {}
        }
        data.len()
    }

    fn try_parse(&mut self) {
        if self.buffer.len() < self.needed {
            return;
        }
        let tag = self.buffer[..self.needed].to_vec();
        self.parse_frames(&tag[10..]);
        self.state = Id3v2State::Done;
        self.buffer.clear();
    }

    // frame layout: id[4] size[4] flags[2] encoding content...
    fn parse_frames(&self, mut frames: &[u8]) {
        let Some(callback) = &self.callback else {
            return;
        };
        info!("ID3v2 tag found");
        while frames.len() >= 10 {
            let id: [u8; 4] = [frames[0], frames[1], frames[2], frames[3]];
            if id == [0, 0, 0, 0] {
                // padding reached
                break;
            }
            let size = synchsafe(&frames[4..8]);
            if size == 0 || frames.len() < 10 + size {
                break;
            }
            let content = &frames[10..10 + size];
            if let Some((_, field)) = ID3V2_TEXT_FRAMES.iter().find(|(tag, _)| **tag == id) {
                self.emit_frame(callback, *field, content);
            } else {
                debug!(id = %String::from_utf8_lossy(&id), "frame skipped");
            }
            frames = &frames[10 + size..];
        }
    }

    fn emit_frame(&self, callback: &Id3Callback, field: Id3Field, content: &[u8]) {
        if content.is_empty() {
            return;
        }
        let encoding = content[0];
        let text = &content[1..];
        let value = match encoding {
            0 => trimmed_latin1(text),
            3 => String::from_utf8_lossy(text)
                .trim_end_matches('\0')
                .trim()
                .to_string(),
            other => {
                warn!(encoding = other, "unsupported text encoding ignored");
                return;
            }
        };
        if value.is_empty() {
            return;
        }
        // genre ids may arrive as "(nn)" references
        if field == Id3Field::Genre && value.starts_with('(') {
            if let Some(end) = value.find(')') {
                if let Ok(index) = value[1..end].parse::<usize>() {
                    if let Some(name) = ID3_GENRES.get(index) {
                        callback(field, name);
                        return;
                    }
                }
            }
        }
        callback(field, &value);
    }
}

/// Combined ID3v1 + ID3v2 parser: copy the audio data through `write`
/// and receive tag fields via the callback.
pub struct Id3MetaData {
    v1: Id3v1Parser,
    v2: Id3v2Parser,
}

impl Default for Id3MetaData {
    fn default() -> Self {
        Self::new()
    }
}

impl Id3MetaData {
    pub fn new() -> Self {
        Self {
            v1: Id3v1Parser::new(),
            v2: Id3v2Parser::new(),
        }
    }

    pub fn set_callback(&mut self, callback: Id3Callback) {
        self.v1.set_callback(callback.clone());
        self.v2.set_callback(callback);
    }

    pub fn begin(&mut self) {
        self.v1.begin();
        self.v2.begin();
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        self.v2.write(data);
        if !self.v2.is_processed() {
            self.v1.write(data);
        }
        data.len()
    }
}
