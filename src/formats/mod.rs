//! Binary record decoding for the supported survey sensor formats.
//!
//! Every format is read by the same engine: a [[DatagramHeaderReader]] peeks at the fixed header of
//! the next record, [[RecordStream]] cuts out the payload window and moves to the declared end of
//! the record, and a [[DispatchingReader]] hands the window to the decoder registered for the
//! record's tag. Formats only contribute their header rule, their decoders and a file-level
//! header reader via [[RecordFormat]].
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use std::{fmt, hash::Hash, io::SeekFrom, mem, path::Path};

mod cursor;
pub use cursor::ByteCursor;
pub mod layout;

pub mod gsf;
pub mod jsf;
pub mod kmraw;
pub mod s7k;
pub mod sbd;
pub mod segy;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FormatError {
    #[snafu(display(
        "Needed {needed} bytes at position {position}, but only {remaining} are left"
    ))]
    TruncatedInput {
        needed: u64,
        remaining: u64,
        position: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Corrupt header at position {position}: {description}"))]
    CorruptHeader {
        description: String,
        position: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Cannot seek to {target} in a source of {length} bytes"))]
    SeekOutOfBounds {
        target: i128,
        length: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Layout {layout} has no field named '{field}'"))]
    UnknownField {
        layout: &'static str,
        field: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Error reading bytes: {source}"))]
    Io {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Error parsing embedded XML: {source}"))]
    Xml {
        source: quick_xml::Error,
        backtrace: Backtrace,
    },
    #[snafu(whatever, display("{message}"))]
    Other {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = FormatError> = std::result::Result<T, E>;

/// Where a record carries a 4 byte checksum, if it has one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Checksum {
    Absent,
    /// Between the header and the payload.
    Leading,
    /// Between the payload and any trailer.
    Trailing,
}

impl Checksum {
    pub const LENGTH: u64 = 4;

    pub fn length(self) -> u64 {
        match self {
            Checksum::Absent => 0,
            Checksum::Leading | Checksum::Trailing => Self::LENGTH,
        }
    }
}

/// The fixed leading part of a record, as far as it is needed to find the record's end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatagramHeader<T> {
    pub tag: T,
    pub header_length: u8,
    pub payload_length: u32,
    pub checksum: Checksum,
    /// Bytes after the payload (and trailing checksum) that still belong to the record.
    pub trailer_length: u8,
}

impl<T> DatagramHeader<T> {
    pub fn has_checksum(&self) -> bool {
        self.checksum != Checksum::Absent
    }

    pub fn total_length(&self) -> u64 {
        self.header_length as u64
            + self.checksum.length()
            + self.payload_length as u64
            + self.trailer_length as u64
    }

    /// Offset of the payload from the start of the record.
    pub fn payload_offset(&self) -> u64 {
        let leading = match self.checksum {
            Checksum::Leading => Checksum::LENGTH,
            _ => 0,
        };
        self.header_length as u64 + leading
    }
}

/// Per-format rule for reading the header of the next record.
pub trait DatagramHeaderReader {
    type Tag: Copy + Eq + Hash + fmt::Debug;

    const HEADER_LENGTH: usize;

    /// Parse and sanity check a header from exactly [[Self::HEADER_LENGTH]] bytes that were found
    /// at `position`.
    fn parse_header(&self, bytes: &[u8], position: u64) -> Result<DatagramHeader<Self::Tag>>;

    /// Look at the header at the cursor position without moving the cursor.
    ///
    /// `Ok(None)` means a clean end of stream: fewer bytes than a header are left.
    fn peek_header(&self, cursor: &ByteCursor) -> Result<Option<DatagramHeader<Self::Tag>>> {
        if cursor.remaining() < Self::HEADER_LENGTH as u64 {
            return Ok(None);
        }
        let bytes = cursor.peek(Self::HEADER_LENGTH)?;
        self.parse_header(bytes, cursor.tell()).map(Some)
    }
}

/// A record cut out of the stream, before any decoding.
#[derive(Clone, Debug)]
pub struct RawRecord<T> {
    pub header: DatagramHeader<T>,
    /// Absolute position of the first header byte.
    pub start: u64,
    pub header_bytes: bytes::Bytes,
    pub payload: bytes::Bytes,
}

/// Walks the records of one file, always leaving the cursor at the declared end of the record it
/// just returned.
pub struct RecordStream<H> {
    cursor: ByteCursor,
    header_reader: H,
    data_start: u64,
}

impl<H: DatagramHeaderReader> RecordStream<H> {
    pub fn new(mut cursor: ByteCursor, header_reader: H, data_start: u64) -> Result<Self> {
        cursor.seek(SeekFrom::Start(data_start))?;
        Ok(Self {
            cursor,
            header_reader,
            data_start,
        })
    }

    pub fn next_raw(&mut self) -> Result<Option<RawRecord<H::Tag>>> {
        let start = self.cursor.tell();
        let Some(header) = self.header_reader.peek_header(&self.cursor)? else {
            return Ok(None);
        };
        let total = header.total_length();
        ensure!(
            header.header_length as usize == H::HEADER_LENGTH,
            CorruptHeaderSnafu {
                description: format!(
                    "header reader reported {} header bytes instead of {}",
                    header.header_length,
                    H::HEADER_LENGTH
                ),
                position: start,
            }
        );
        ensure!(
            total <= self.cursor.remaining(),
            TruncatedInputSnafu {
                needed: total,
                remaining: self.cursor.remaining(),
                position: start,
            }
        );
        let header_bytes = self.cursor.slice_at(start, H::HEADER_LENGTH)?;
        let payload = self.cursor.slice_at(
            start + header.payload_offset(),
            header.payload_length as usize,
        )?;
        // Jump to the declared end, whatever the decoder makes of the payload.
        self.cursor.seek(SeekFrom::Start(start + total))?;
        Ok(Some(RawRecord {
            header,
            start,
            header_bytes,
            payload,
        }))
    }

    pub fn rewind(&mut self) -> Result<()> {
        self.cursor.seek(SeekFrom::Start(self.data_start))?;
        Ok(())
    }

    pub fn cursor(&self) -> &ByteCursor {
        &self.cursor
    }

    pub fn header_reader(&self) -> &H {
        &self.header_reader
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderState {
    Fresh,
    /// The file-level header is read and the cursor is before the first data record.
    HeaderRead,
    Streaming,
    Exhausted,
    /// Terminal. Nothing more is read from this file.
    Corrupt,
}

impl ReaderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReaderState::Exhausted | ReaderState::Corrupt)
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A streaming reader over one file of one format.
pub trait FormatReader {
    type Record;

    fn more_data(&self) -> bool;

    /// The next record, or `None` once the reader is exhausted or corrupt.
    fn read_next_record(&mut self) -> Option<Self::Record>;

    /// Go back to the first data record. Decoder state survives, corruption does too.
    fn rewind(&mut self);

    fn state(&self) -> ReaderState;
}

/// Result of reading the file-level header of a format.
pub struct OpenedStream<F: RecordFormat> {
    pub header_reader: F::HeaderReader,
    pub context: F::Context,
    pub data_start: u64,
}

pub type TagOf<F> = <<F as RecordFormat>::HeaderReader as DatagramHeaderReader>::Tag;

/// A record decoder: a pure function from a payload window and the prior decoder state to the
/// decoded record and the next state.
pub type DecodeFn<F> = fn(
    &RawRecord<TagOf<F>>,
    &<F as RecordFormat>::Context,
    <F as RecordFormat>::State,
) -> Result<(
    <F as RecordFormat>::Record,
    <F as RecordFormat>::State,
)>;

/// Everything a file format contributes to the shared reading engine.
pub trait RecordFormat: Sized + 'static {
    type HeaderReader: DatagramHeaderReader;
    /// Caller supplied knobs.
    type Options: Default;
    /// Read-only information gathered from the file-level header.
    type Context: Default;
    /// State carried from one record to the next.
    type State: Default;
    type Record;

    const NAME: &'static str;

    fn open_stream(cursor: &ByteCursor, options: Self::Options) -> Result<OpenedStream<Self>>;

    fn register(registry: &mut DecoderRegistry<Self>);

    /// The record produced for tags without a registered decoder.
    fn unsupported(raw: &RawRecord<TagOf<Self>>) -> Self::Record;
}

pub struct DecoderRegistry<F: RecordFormat> {
    decoders: FxHashMap<TagOf<F>, DecodeFn<F>>,
}

impl<F: RecordFormat> DecoderRegistry<F> {
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: FxHashMap::default(),
        };
        F::register(&mut registry);
        registry
    }

    pub fn register(&mut self, tag: TagOf<F>, decoder: DecodeFn<F>) {
        if self.decoders.insert(tag, decoder).is_some() {
            log::warn!("Replaced the {} decoder for {:?}", F::NAME, tag);
        }
    }

    pub fn get(&self, tag: TagOf<F>) -> Option<DecodeFn<F>> {
        self.decoders.get(&tag).copied()
    }

    pub fn supports(&self, tag: TagOf<F>) -> bool {
        self.decoders.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl<F: RecordFormat> Default for DecoderRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// The state machine shared by all formats.
pub struct DispatchingReader<F: RecordFormat> {
    stream: Option<RecordStream<F::HeaderReader>>,
    context: F::Context,
    decode_state: F::State,
    registry: DecoderRegistry<F>,
    state: ReaderState,
}

impl<F: RecordFormat> DispatchingReader<F> {
    /// Open `path` and read its file-level header.
    ///
    /// Only failing to read the file at all is an error. A file whose header is unusable produces
    /// a reader that is already [[ReaderState::Corrupt]].
    pub fn open<P: AsRef<Path>>(path: P, options: F::Options) -> Result<Self> {
        let cursor = ByteCursor::open(path.as_ref())?;
        let reader = Self::from_cursor(cursor, options);
        if reader.state == ReaderState::Corrupt {
            log::warn!(
                "{} file {} has an unusable file header",
                F::NAME,
                path.as_ref().display()
            );
        }
        Ok(reader)
    }

    pub fn from_cursor(cursor: ByteCursor, options: F::Options) -> Self {
        let mut reader = Self {
            stream: None,
            context: F::Context::default(),
            decode_state: F::State::default(),
            registry: DecoderRegistry::new(),
            state: ReaderState::Fresh,
        };
        let opened = F::open_stream(&cursor, options).and_then(|opened| {
            let stream = RecordStream::new(cursor, opened.header_reader, opened.data_start)?;
            Ok((stream, opened.context))
        });
        match opened {
            Ok((stream, context)) => {
                reader.stream = Some(stream);
                reader.context = context;
                reader.state = ReaderState::HeaderRead;
            }
            Err(e) => reader.mark_corrupt(&e),
        }
        reader
    }

    fn mark_corrupt(&mut self, error: &FormatError) {
        log::warn!("Stopped reading {} data: {}", F::NAME, error);
        self.state = ReaderState::Corrupt;
    }

    pub fn context(&self) -> &F::Context {
        &self.context
    }

    pub fn decode_state(&self) -> &F::State {
        &self.decode_state
    }

    pub fn registry(&self) -> &DecoderRegistry<F> {
        &self.registry
    }

    /// Current byte position, if the file header could be read.
    pub fn position(&self) -> Option<u64> {
        self.stream.as_ref().map(|s| s.cursor().tell())
    }
}

impl<F: RecordFormat> FormatReader for DispatchingReader<F> {
    type Record = F::Record;

    fn more_data(&self) -> bool {
        !self.state.is_terminal()
            && self
                .stream
                .as_ref()
                .is_some_and(|s| s.cursor().remaining() > 0)
    }

    fn read_next_record(&mut self) -> Option<F::Record> {
        if self.state.is_terminal() {
            return None;
        }
        let stream = self.stream.as_mut()?;
        match stream.next_raw() {
            Ok(None) => {
                self.state = ReaderState::Exhausted;
                None
            }
            Ok(Some(raw)) => {
                self.state = ReaderState::Streaming;
                let Some(decode) = self.registry.get(raw.header.tag) else {
                    return Some(F::unsupported(&raw));
                };
                let prior = mem::take(&mut self.decode_state);
                match decode(&raw, &self.context, prior) {
                    Ok((record, next)) => {
                        self.decode_state = next;
                        Some(record)
                    }
                    Err(e) => {
                        self.mark_corrupt(&e);
                        None
                    }
                }
            }
            Err(e) => {
                self.mark_corrupt(&e);
                None
            }
        }
    }

    fn rewind(&mut self) {
        if self.state == ReaderState::Corrupt {
            log::debug!("Not rewinding a corrupt {} reader", F::NAME);
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match stream.rewind() {
            Ok(()) => self.state = ReaderState::HeaderRead,
            Err(e) => self.mark_corrupt(&e),
        }
    }

    fn state(&self) -> ReaderState {
        self.state
    }
}

/// The supported input formats, recognised by file extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SurveyFormat {
    Gsf,
    KmRaw,
    Jsf,
    S7k,
    Segy,
    Sbd,
}

impl SurveyFormat {
    pub const ALL: [SurveyFormat; 6] = [
        SurveyFormat::Gsf,
        SurveyFormat::KmRaw,
        SurveyFormat::Jsf,
        SurveyFormat::S7k,
        SurveyFormat::Segy,
        SurveyFormat::Sbd,
    ];

    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            SurveyFormat::Gsf => &["gsf"],
            SurveyFormat::KmRaw => &["raw"],
            SurveyFormat::Jsf => &["jsf"],
            SurveyFormat::S7k => &["s7k"],
            SurveyFormat::Segy => &["sgy", "segy", "seg"],
            SurveyFormat::Sbd => &["sbd"],
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.extensions().contains(&extension.as_str()))
    }

    pub fn name(self) -> &'static str {
        match self {
            SurveyFormat::Gsf => gsf::Gsf::NAME,
            SurveyFormat::KmRaw => kmraw::KmRaw::NAME,
            SurveyFormat::Jsf => jsf::Jsf::NAME,
            SurveyFormat::S7k => s7k::S7k::NAME,
            SurveyFormat::Segy => segy::Segy::NAME,
            SurveyFormat::Sbd => sbd::Sbd::NAME,
        }
    }
}

impl fmt::Display for SurveyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A position as reported by a sensor, before any projection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Coordinates {
    /// Degrees.
    Geographic { longitude: f64, latitude: f64 },
    /// Metres in some projected grid.
    Grid { easting: f64, northing: f64 },
}

impl Coordinates {
    /// `(longitude, latitude)` if this is a geographic position.
    pub fn geographic(self) -> Option<(f64, f64)> {
        match self {
            Coordinates::Geographic {
                longitude,
                latitude,
            } => Some((longitude, latitude)),
            Coordinates::Grid { .. } => None,
        }
    }
}

/// Converts a Windows style fixed-length, NUL padded byte string into text.
pub(crate) fn decode_padded_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let (text, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes[..end]);
    text.trim().to_string()
}
