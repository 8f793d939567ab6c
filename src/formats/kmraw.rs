//! Kongsberg EA/EK `.raw` telemetry files.
//!
//! Little endian. A datagram is `length: u32`, a four character type, a Windows FILETIME and
//! `length - 12` payload bytes, followed by `length` repeated once more. The first datagram of a
//! file is an `XML0` configuration document.
use super::{
    layout::{Endian, FieldSpec, FieldType, Layout},
    *,
};
use crate::navigation::{NavigationFix, NavigationRecord};
use delegate::delegate;
use quick_xml::{events::Event, Reader};
use std::collections::BTreeMap;

pub const XML0: [u8; 4] = *b"XML0";
pub const MRU1: [u8; 4] = *b"MRU1";
pub const NME0: [u8; 4] = *b"NME0";

pub const KM_BINARY_START: &[u8; 4] = b"#KMB";

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: f64 = 11_644_473_600.0;
/// Type plus timestamp, counted in the datagram length.
const LENGTH_OVERHEAD: u64 = 12;

static DATAGRAM_HEADER: Layout = Layout::new(
    "raw datagram header",
    Endian::Little,
    &[
        FieldSpec::new("length", FieldType::U32),
        FieldSpec::new("datagram_type", FieldType::Bytes(4)),
        FieldSpec::new("low_date_time", FieldType::U32),
        FieldSpec::new("high_date_time", FieldType::U32),
    ],
);

static KM_BINARY: Layout = Layout::new(
    "KM binary motion",
    Endian::Little,
    &[
        FieldSpec::new("start_id", FieldType::Bytes(4)),
        FieldSpec::new("length", FieldType::U16),
        FieldSpec::new("version", FieldType::U16),
        FieldSpec::new("utc_seconds", FieldType::U32),
        FieldSpec::new("utc_nanoseconds", FieldType::U32),
        FieldSpec::new("status", FieldType::U32),
        FieldSpec::new("latitude", FieldType::F64),
        FieldSpec::new("longitude", FieldType::F64),
        FieldSpec::new("ellipsoid_height", FieldType::F32),
        FieldSpec::new("roll", FieldType::F32),
        FieldSpec::new("pitch", FieldType::F32),
        FieldSpec::new("heading", FieldType::F32),
        FieldSpec::new("heave", FieldType::F32),
    ],
);

pub struct KmRawHeaderReader;

impl DatagramHeaderReader for KmRawHeaderReader {
    type Tag = [u8; 4];

    const HEADER_LENGTH: usize = 16;

    fn parse_header(&self, bytes: &[u8], position: u64) -> Result<DatagramHeader<[u8; 4]>> {
        let fields = DATAGRAM_HEADER.decode(bytes)?;
        let length = fields.int("length")? as u64;
        ensure!(
            length >= LENGTH_OVERHEAD,
            CorruptHeaderSnafu {
                description: format!("datagram length {length} is shorter than its header"),
                position,
            }
        );
        let mut tag = [0u8; 4];
        tag.copy_from_slice(fields.bytes("datagram_type")?);
        Ok(DatagramHeader {
            tag,
            header_length: Self::HEADER_LENGTH as u8,
            payload_length: (length - LENGTH_OVERHEAD) as u32,
            checksum: Checksum::Absent,
            trailer_length: 4,
        })
    }
}

/// Unix time of the FILETIME (100 ns ticks since 1601) in a datagram header.
fn datagram_time(header_bytes: &[u8]) -> Result<f64> {
    let fields = DATAGRAM_HEADER.decode(header_bytes)?;
    let ticks = (fields.int("high_date_time")? << 32) | fields.int("low_date_time")?;
    Ok(ticks as f64 / 1.0e7 - FILETIME_UNIX_OFFSET)
}

fn type_name(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

/// The parts of an XML datagram that are kept.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XmlDocument {
    /// `Configuration`, `Environment`, `Parameter`, ...
    pub root: String,
    /// Attributes of the first `Header` element.
    pub header: BTreeMap<String, String>,
    /// Names of every element in document order, without duplicates.
    pub elements: Vec<String>,
}

impl XmlDocument {
    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        let mut document = XmlDocument::default();
        let mut seen_header = false;
        loop {
            match reader.read_event().context(XmlSnafu)? {
                Event::Start(element) | Event::Empty(element) => {
                    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                    if document.root.is_empty() {
                        document.root = name.clone();
                    }
                    if name == "Header" && !seen_header {
                        seen_header = true;
                        for attribute in element.attributes() {
                            let attribute = attribute
                                .map_err(quick_xml::Error::from)
                                .context(XmlSnafu)?;
                            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
                            let value = attribute.decode_and_unescape_value(&reader).context(XmlSnafu)?;
                            document.header.insert(key, value.into_owned());
                        }
                    }
                    if !document.elements.contains(&name) {
                        document.elements.push(name);
                    }
                }
                Event::Eof => break,
                _ => (),
            }
        }
        ensure!(
            !document.root.is_empty(),
            CorruptHeaderSnafu {
                description: "XML datagram without a root element",
                position: 0u64,
            }
        );
        Ok(document)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KmBinaryMotion {
    pub timestamp: f64,
    pub status: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub ellipsoid_height: f64,
    pub roll: f64,
    pub pitch: f64,
    pub heading: f64,
    pub heave: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum KmRawRecord {
    Xml(XmlDocument),
    Motion(KmBinaryMotion),
    Nmea { timestamp: f64, sentence: String },
    Unsupported { datagram_type: [u8; 4], length: u32 },
}

impl NavigationRecord for KmRawRecord {
    fn navigation_fix(&self) -> Option<NavigationFix> {
        match self {
            KmRawRecord::Motion(m) if m.latitude != 0.0 && m.longitude != 0.0 => Some(
                NavigationFix::new(m.timestamp, m.longitude, m.latitude)
                    .with_heading(m.heading)
                    .with_flags(m.status),
            ),
            _ => None,
        }
    }
}

/// Information from the configuration datagram at the start of the file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KmRawContext {
    pub configuration: Option<XmlDocument>,
}

pub struct KmRaw;

impl RecordFormat for KmRaw {
    type HeaderReader = KmRawHeaderReader;
    type Options = ();
    type Context = KmRawContext;
    type State = ();
    type Record = KmRawRecord;

    const NAME: &'static str = "KM raw";

    fn open_stream(cursor: &ByteCursor, _options: ()) -> Result<OpenedStream<Self>> {
        let mut context = KmRawContext::default();
        if let Some(header) = KmRawHeaderReader.peek_header(cursor)? {
            if header.tag == XML0 {
                let payload = cursor.slice_at(
                    cursor.tell() + header.payload_offset(),
                    header.payload_length as usize,
                )?;
                context.configuration = Some(XmlDocument::parse(&xml_text(&payload))?);
            } else {
                log::warn!(
                    "Raw file starts with {} instead of a configuration datagram",
                    type_name(&header.tag)
                );
            }
        }
        Ok(OpenedStream {
            header_reader: KmRawHeaderReader,
            context,
            data_start: cursor.tell(),
        })
    }

    fn register(registry: &mut DecoderRegistry<Self>) {
        registry.register(XML0, decode_xml);
        registry.register(MRU1, decode_motion);
        registry.register(NME0, decode_nmea);
    }

    fn unsupported(raw: &RawRecord<[u8; 4]>) -> KmRawRecord {
        KmRawRecord::Unsupported {
            datagram_type: raw.header.tag,
            length: raw.header.payload_length,
        }
    }
}

fn xml_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches('\0')
        .to_string()
}

fn decode_xml(
    raw: &RawRecord<[u8; 4]>,
    _context: &KmRawContext,
    state: (),
) -> Result<(KmRawRecord, ())> {
    let document = XmlDocument::parse(&xml_text(&raw.payload))?;
    Ok((KmRawRecord::Xml(document), state))
}

fn decode_motion(
    raw: &RawRecord<[u8; 4]>,
    _context: &KmRawContext,
    state: (),
) -> Result<(KmRawRecord, ())> {
    let fields = KM_BINARY.decode(&raw.payload)?;
    let start_id = fields.bytes("start_id")?;
    ensure!(
        start_id.as_ref() == KM_BINARY_START,
        CorruptHeaderSnafu {
            description: format!("MRU1 datagram starts with {start_id:?} instead of #KMB"),
            position: raw.start,
        }
    );
    let motion = KmBinaryMotion {
        timestamp: fields.int("utc_seconds")? as f64
            + fields.int("utc_nanoseconds")? as f64 / 1.0e9,
        status: fields.int("status")? as u32,
        latitude: fields.float("latitude")?,
        longitude: fields.float("longitude")?,
        ellipsoid_height: fields.float("ellipsoid_height")?,
        roll: fields.float("roll")?,
        pitch: fields.float("pitch")?,
        heading: fields.float("heading")?,
        heave: fields.float("heave")?,
    };
    Ok((KmRawRecord::Motion(motion), state))
}

fn decode_nmea(
    raw: &RawRecord<[u8; 4]>,
    _context: &KmRawContext,
    state: (),
) -> Result<(KmRawRecord, ())> {
    let sentence = String::from_utf8_lossy(&raw.payload)
        .trim_end_matches(['\0', '\r', '\n'])
        .to_string();
    Ok((
        KmRawRecord::Nmea {
            timestamp: datagram_time(&raw.header_bytes)?,
            sentence,
        },
        state,
    ))
}

pub struct KmRawReader {
    inner: DispatchingReader<KmRaw>,
}

impl KmRawReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        DispatchingReader::open(path, ()).map(|inner| Self { inner })
    }

    pub fn from_cursor(cursor: ByteCursor) -> Self {
        Self {
            inner: DispatchingReader::from_cursor(cursor, ()),
        }
    }

    /// The configuration document the file starts with.
    pub fn configuration(&self) -> Option<&XmlDocument> {
        self.inner.context().configuration.as_ref()
    }
}

impl FormatReader for KmRawReader {
    type Record = KmRawRecord;

    delegate! {
        to self.inner {
            fn more_data(&self) -> bool;
            fn read_next_record(&mut self) -> Option<KmRawRecord>;
            fn rewind(&mut self);
            fn state(&self) -> ReaderState;
        }
    }
}
