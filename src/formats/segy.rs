//! SEG-Y seismic and sub-bottom profiler files.
//!
//! Big endian. A 3200 byte textual header (ASCII or EBCDIC) and a 400 byte binary header open the
//! file, optionally followed by extended textual headers. Every trace is a 240 byte header and its
//! samples; the sample count comes from the trace header or, if that is zero, the binary header.
use super::{
    layout::{Endian, FieldSpec, FieldType, Fields, Layout},
    *,
};
use crate::navigation::{NavigationFix, NavigationRecord};
use chrono::{NaiveDate, NaiveTime};
use delegate::delegate;

pub const TEXTUAL_HEADER_LENGTH: u64 = 3200;
pub const BINARY_HEADER_LENGTH: u64 = 400;
const CARD_LENGTH: usize = 80;

static BINARY_HEADER: Layout = Layout::new(
    "SEG-Y binary header",
    Endian::Big,
    &[
        FieldSpec::new("job_id", FieldType::I32),
        FieldSpec::new("line_number", FieldType::I32),
        FieldSpec::new("reel_number", FieldType::I32),
        FieldSpec::new("traces_per_ensemble", FieldType::I16),
        FieldSpec::new("auxiliary_traces", FieldType::I16),
        FieldSpec::new("sample_interval", FieldType::U16),
        FieldSpec::pad(2),
        FieldSpec::new("samples_per_trace", FieldType::U16),
        FieldSpec::pad(2),
        FieldSpec::new("sample_format", FieldType::I16),
        FieldSpec::pad(274),
        FieldSpec::new("revision_major", FieldType::U8),
        FieldSpec::new("revision_minor", FieldType::U8),
        FieldSpec::new("fixed_length", FieldType::I16),
        FieldSpec::new("extended_headers", FieldType::I16),
        FieldSpec::pad(94),
    ],
);

static TRACE_HEADER: Layout = Layout::new(
    "SEG-Y trace header",
    Endian::Big,
    &[
        FieldSpec::new("line_sequence", FieldType::I32),
        FieldSpec::new("file_sequence", FieldType::I32),
        FieldSpec::new("field_record", FieldType::I32),
        FieldSpec::new("trace_number", FieldType::I32),
        FieldSpec::pad(52),
        FieldSpec::new("elevation_scalar", FieldType::I16),
        FieldSpec::new("coordinate_scalar", FieldType::I16),
        FieldSpec::new("source_x", FieldType::I32),
        FieldSpec::new("source_y", FieldType::I32),
        FieldSpec::new("group_x", FieldType::I32),
        FieldSpec::new("group_y", FieldType::I32),
        FieldSpec::new("coordinate_units", FieldType::I16),
        FieldSpec::pad(24),
        FieldSpec::new("samples", FieldType::U16),
        FieldSpec::new("sample_interval", FieldType::U16),
        FieldSpec::pad(38),
        FieldSpec::new("year", FieldType::I16),
        FieldSpec::new("day", FieldType::I16),
        FieldSpec::new("hour", FieldType::I16),
        FieldSpec::new("minute", FieldType::I16),
        FieldSpec::new("second", FieldType::I16),
        FieldSpec::new("time_basis", FieldType::I16),
        FieldSpec::pad(28),
        FieldSpec::new("shotpoint", FieldType::I32),
        FieldSpec::new("shotpoint_scalar", FieldType::I16),
        FieldSpec::pad(38),
    ],
);

/// Bytes per sample for a binary header sample format code.
pub fn sample_size(format: i64) -> Option<u64> {
    match format {
        1 | 2 | 4 | 5 | 10 => Some(4),
        3 | 11 => Some(2),
        6 | 9 | 12 => Some(8),
        7 | 15 => Some(3),
        8 | 16 => Some(1),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SegyBlock {
    Trace,
}

/// Knows the sample size and default sample count, which are needed to find the end of a trace.
pub struct SegyHeaderReader {
    sample_size: u64,
    default_samples: u64,
    fixed_length: bool,
}

impl SegyHeaderReader {
    fn samples(&self, fields: &Fields) -> Result<u64> {
        let samples = fields.int("samples")? as u64;
        Ok(if self.fixed_length || samples == 0 {
            self.default_samples
        } else {
            samples
        })
    }
}

impl DatagramHeaderReader for SegyHeaderReader {
    type Tag = SegyBlock;

    const HEADER_LENGTH: usize = 240;

    fn parse_header(&self, bytes: &[u8], position: u64) -> Result<DatagramHeader<SegyBlock>> {
        let fields = TRACE_HEADER.decode(bytes)?;
        let payload_length = self.samples(&fields)? * self.sample_size;
        ensure!(
            payload_length <= u32::MAX as u64,
            CorruptHeaderSnafu {
                description: format!("trace of {payload_length} sample bytes"),
                position,
            }
        );
        Ok(DatagramHeader {
            tag: SegyBlock::Trace,
            header_length: Self::HEADER_LENGTH as u8,
            payload_length: payload_length as u32,
            checksum: Checksum::Absent,
            trailer_length: 0,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Ascii,
    Ebcdic,
}

impl TextEncoding {
    /// Whichever encoding explains more of the bytes. `0x40` is the EBCDIC space.
    pub fn detect(bytes: &[u8]) -> Self {
        let ascii = bytes
            .iter()
            .filter(|b| matches!(**b, 0x20..=0x3F | 0x41..=0x7E | b'\n' | b'\r'))
            .count();
        let ebcdic = bytes
            .iter()
            .filter(|b| **b == 0x40 || ebcdic_char(**b) != ' ')
            .count();
        if ebcdic > ascii {
            TextEncoding::Ebcdic
        } else {
            TextEncoding::Ascii
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        bytes
            .chunks(CARD_LENGTH)
            .map(|card| {
                let line: String = match self {
                    TextEncoding::Ascii => encoding_rs::WINDOWS_1252.decode(card).0.into_owned(),
                    TextEncoding::Ebcdic => card.iter().copied().map(ebcdic_char).collect(),
                };
                line.trim_end_matches(['\0', ' ', '\r', '\n']).to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Code page 037, printable characters only.
fn ebcdic_char(byte: u8) -> char {
    const PUNCTUATION: &[(u8, char)] = &[
        (0x4B, '.'),
        (0x4C, '<'),
        (0x4D, '('),
        (0x4E, '+'),
        (0x4F, '|'),
        (0x50, '&'),
        (0x5A, '!'),
        (0x5B, '$'),
        (0x5C, '*'),
        (0x5D, ')'),
        (0x5E, ';'),
        (0x60, '-'),
        (0x61, '/'),
        (0x6B, ','),
        (0x6C, '%'),
        (0x6D, '_'),
        (0x6E, '>'),
        (0x6F, '?'),
        (0x7A, ':'),
        (0x7B, '#'),
        (0x7C, '@'),
        (0x7D, '\''),
        (0x7E, '='),
        (0x7F, '"'),
    ];
    let offset = |base: u8, first: char| (first as u8 + (byte - base)) as char;
    match byte {
        0x81..=0x89 => offset(0x81, 'a'),
        0x91..=0x99 => offset(0x91, 'j'),
        0xA2..=0xA9 => offset(0xA2, 's'),
        0xC1..=0xC9 => offset(0xC1, 'A'),
        0xD1..=0xD9 => offset(0xD1, 'J'),
        0xE2..=0xE9 => offset(0xE2, 'S'),
        0xF0..=0xF9 => offset(0xF0, '0'),
        _ => PUNCTUATION
            .iter()
            .find(|(code, _)| *code == byte)
            .map_or(' ', |(_, c)| *c),
    }
}

/// What the file-level headers say.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegyFileHeader {
    pub encoding: Option<TextEncoding>,
    /// The textual header, one line per 80 character card.
    pub text: String,
    pub revision: (u8, u8),
    pub sample_format: i16,
    pub sample_interval: u16,
    pub samples_per_trace: u16,
    pub fixed_length: bool,
    pub extended_headers: u16,
}

/// Applies the SEG-Y coordinate scalar: negative divides, positive multiplies, zero is one.
fn apply_scalar(value: i64, scalar: i64) -> f64 {
    match scalar {
        0 => value as f64,
        s if s < 0 => value as f64 / (-s) as f64,
        s => value as f64 * s as f64,
    }
}

/// `DDDMMSS.ss` to decimal degrees.
fn dms_to_degrees(value: f64) -> f64 {
    let magnitude = value.abs();
    let degrees = (magnitude / 10_000.0).trunc();
    let minutes = ((magnitude - degrees * 10_000.0) / 100.0).trunc();
    let seconds = magnitude - degrees * 10_000.0 - minutes * 100.0;
    (degrees + minutes / 60.0 + seconds / 3600.0).copysign(value)
}

fn coordinates(x: f64, y: f64, units: i64) -> Option<Coordinates> {
    match units {
        1 => Some(Coordinates::Grid {
            easting: x,
            northing: y,
        }),
        2 => Some(Coordinates::Geographic {
            longitude: x / 3600.0,
            latitude: y / 3600.0,
        }),
        3 => Some(Coordinates::Geographic {
            longitude: x,
            latitude: y,
        }),
        4 => Some(Coordinates::Geographic {
            longitude: dms_to_degrees(x),
            latitude: dms_to_degrees(y),
        }),
        _ => None,
    }
}

fn trace_time(fields: &Fields) -> Result<Option<f64>> {
    let year = fields.int("year")? as i32;
    let day = fields.int("day")? as u32;
    let hour = fields.int("hour")? as u32;
    let minute = fields.int("minute")? as u32;
    let second = fields.int("second")? as u32;
    Ok(NaiveDate::from_yo_opt(year, day)
        .zip(NaiveTime::from_hms_opt(hour, minute, second))
        .map(|(date, time)| date.and_time(time).and_utc().timestamp() as f64))
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    pub sequence: i32,
    pub field_record: i32,
    pub trace_number: i32,
    /// `None` if the trace header carries no valid date.
    pub timestamp: Option<f64>,
    pub source: Option<Coordinates>,
    pub group: Option<Coordinates>,
    pub shotpoint: i32,
    pub samples: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SegyRecord {
    Trace(Trace),
    Unsupported { length: u32 },
}

impl NavigationRecord for SegyRecord {
    fn navigation_fix(&self) -> Option<NavigationFix> {
        let SegyRecord::Trace(trace) = self else {
            return None;
        };
        let (longitude, latitude) = trace.source?.geographic()?;
        Some(
            NavigationFix::new(trace.timestamp?, longitude, latitude)
                .with_flags(trace.shotpoint as u32),
        )
    }
}

pub struct Segy;

impl RecordFormat for Segy {
    type HeaderReader = SegyHeaderReader;
    type Options = ();
    type Context = SegyFileHeader;
    type State = ();
    type Record = SegyRecord;

    const NAME: &'static str = "SEG-Y";

    fn open_stream(cursor: &ByteCursor, _options: ()) -> Result<OpenedStream<Self>> {
        let text = cursor.slice_at(0, TEXTUAL_HEADER_LENGTH as usize)?;
        let encoding = TextEncoding::detect(&text);
        let binary = cursor.slice_at(TEXTUAL_HEADER_LENGTH, BINARY_HEADER_LENGTH as usize)?;
        let fields = BINARY_HEADER.decode(&binary)?;

        let sample_format = fields.int("sample_format")?;
        let size = sample_size(sample_format).context(CorruptHeaderSnafu {
            description: format!("unknown SEG-Y sample format {sample_format}"),
            position: TEXTUAL_HEADER_LENGTH,
        })?;
        let extended_headers = fields.int("extended_headers")?;
        ensure!(
            extended_headers >= 0,
            CorruptHeaderSnafu {
                description: "variable number of extended textual headers",
                position: TEXTUAL_HEADER_LENGTH,
            }
        );
        let data_start = TEXTUAL_HEADER_LENGTH
            + BINARY_HEADER_LENGTH
            + extended_headers as u64 * TEXTUAL_HEADER_LENGTH;
        ensure!(
            data_start <= cursor.len(),
            TruncatedInputSnafu {
                needed: data_start,
                remaining: cursor.len(),
                position: 0u64,
            }
        );

        let header = SegyFileHeader {
            encoding: Some(encoding),
            text: encoding.decode(&text),
            revision: (
                fields.int("revision_major")? as u8,
                fields.int("revision_minor")? as u8,
            ),
            sample_format: sample_format as i16,
            sample_interval: fields.int("sample_interval")? as u16,
            samples_per_trace: fields.int("samples_per_trace")? as u16,
            fixed_length: fields.int("fixed_length")? != 0,
            extended_headers: extended_headers as u16,
        };
        Ok(OpenedStream {
            header_reader: SegyHeaderReader {
                sample_size: size,
                default_samples: header.samples_per_trace as u64,
                fixed_length: header.fixed_length,
            },
            context: header,
            data_start,
        })
    }

    fn register(registry: &mut DecoderRegistry<Self>) {
        registry.register(SegyBlock::Trace, decode_trace);
    }

    fn unsupported(raw: &RawRecord<SegyBlock>) -> SegyRecord {
        SegyRecord::Unsupported {
            length: raw.header.payload_length,
        }
    }
}

fn decode_trace(
    raw: &RawRecord<SegyBlock>,
    context: &SegyFileHeader,
    state: (),
) -> Result<(SegyRecord, ())> {
    let fields = TRACE_HEADER.decode(&raw.header_bytes)?;
    let scalar = fields.int("coordinate_scalar")?;
    let units = fields.int("coordinate_units")?;
    let position = |x: &str, y: &str| -> Result<Option<Coordinates>> {
        Ok(coordinates(
            apply_scalar(fields.int(x)?, scalar),
            apply_scalar(fields.int(y)?, scalar),
            units,
        ))
    };
    let timestamp = trace_time(&fields)?;
    if timestamp.is_none() {
        log::debug!("SEG-Y trace at {} has no valid date", raw.start);
    }
    let sample_bytes = sample_size(context.sample_format as i64).unwrap_or(1);
    let trace = Trace {
        sequence: fields.int("line_sequence")? as i32,
        field_record: fields.int("field_record")? as i32,
        trace_number: fields.int("trace_number")? as i32,
        timestamp,
        source: position("source_x", "source_y")?,
        group: position("group_x", "group_y")?,
        shotpoint: fields.int("shotpoint")? as i32,
        samples: (raw.payload.len() as u64 / sample_bytes) as u32,
    };
    Ok((SegyRecord::Trace(trace), state))
}

pub struct SegyReader {
    inner: DispatchingReader<Segy>,
}

impl SegyReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        DispatchingReader::open(path, ()).map(|inner| Self { inner })
    }

    pub fn from_cursor(cursor: ByteCursor) -> Self {
        Self {
            inner: DispatchingReader::from_cursor(cursor, ()),
        }
    }

    pub fn file_header(&self) -> &SegyFileHeader {
        self.inner.context()
    }
}

impl FormatReader for SegyReader {
    type Record = SegyRecord;

    delegate! {
        to self.inner {
            fn more_data(&self) -> bool;
            fn read_next_record(&mut self) -> Option<SegyRecord>;
            fn rewind(&mut self);
            fn state(&self) -> ReaderState;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{layout::Value, *};
    use crate::navigation::extract;
    use approx::assert_relative_eq;

    fn file_header(sample_format: i64, samples: i64, extended: i64) -> Vec<u8> {
        let mut text = format!("{:<80}{:<80}", "C 1 CLIENT GUARDIAN", "C 2 LINE 0042");
        text.push_str(&" ".repeat(3200 - text.len()));
        let mut out = text.into_bytes();
        out.extend(
            BINARY_HEADER
                .encode(&[
                    ("sample_interval", Value::Int(25)),
                    ("samples_per_trace", Value::Int(samples)),
                    ("sample_format", Value::Int(sample_format)),
                    ("revision_major", Value::Int(1)),
                    ("extended_headers", Value::Int(extended)),
                ])
                .unwrap(),
        );
        out.extend(std::iter::repeat(b' ').take(3200 * extended as usize));
        out
    }

    fn trace(
        sequence: i64,
        samples: i64,
        sample_size: usize,
        xy: (i64, i64),
        units: i64,
    ) -> Vec<u8> {
        let mut out = TRACE_HEADER
            .encode(&[
                ("line_sequence", Value::Int(sequence)),
                ("coordinate_scalar", Value::Int(-100)),
                ("source_x", Value::Int(xy.0)),
                ("source_y", Value::Int(xy.1)),
                ("group_x", Value::Int(xy.0)),
                ("group_y", Value::Int(xy.1)),
                ("coordinate_units", Value::Int(units)),
                ("samples", Value::Int(samples)),
                ("year", Value::Int(2019)),
                ("day", Value::Int(341)),
                ("hour", Value::Int(8)),
                ("minute", Value::Int(54)),
                ("second", Value::Int(sequence)),
                ("shotpoint", Value::Int(1000 + sequence)),
            ])
            .unwrap();
        let stated = if samples == 0 { 10 } else { samples as usize };
        out.extend(std::iter::repeat(0x5A).take(stated * sample_size));
        out
    }

    #[test]
    fn layouts_match_the_standard_offsets() {
        assert_eq!(BINARY_HEADER.size(), 400);
        assert_eq!(BINARY_HEADER.offset_of("samples_per_trace"), Some(20));
        assert_eq!(BINARY_HEADER.offset_of("sample_format"), Some(24));
        assert_eq!(BINARY_HEADER.offset_of("revision_major"), Some(300));
        assert_eq!(BINARY_HEADER.offset_of("extended_headers"), Some(304));
        assert_eq!(TRACE_HEADER.size(), 240);
        assert_eq!(TRACE_HEADER.offset_of("coordinate_scalar"), Some(70));
        assert_eq!(TRACE_HEADER.offset_of("coordinate_units"), Some(88));
        assert_eq!(TRACE_HEADER.offset_of("samples"), Some(114));
        assert_eq!(TRACE_HEADER.offset_of("year"), Some(156));
        assert_eq!(TRACE_HEADER.offset_of("shotpoint"), Some(196));
    }

    #[test]
    fn reads_traces_with_their_own_or_default_sample_count() {
        let bytes = [
            file_header(5, 10, 1),
            // Arc seconds times 100: 0.5 and -30.25 degrees.
            trace(1, 16, 4, (180_000, -10_890_000), 2),
            trace(2, 0, 4, (180_000, -10_890_000), 2),
        ]
        .concat();
        let mut reader = SegyReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert_eq!(reader.state(), ReaderState::HeaderRead);
        let header = reader.file_header();
        assert_eq!(header.encoding, Some(TextEncoding::Ascii));
        assert!(header.text.starts_with("C 1 CLIENT GUARDIAN\nC 2 LINE 0042"));
        assert_eq!(header.revision, (1, 0));
        assert_eq!(header.extended_headers, 1);

        let Some(SegyRecord::Trace(first)) = reader.read_next_record() else {
            panic!("expected a trace");
        };
        assert_eq!(first.samples, 16);
        assert_eq!(first.shotpoint, 1001);
        let (lon, lat) = first.source.unwrap().geographic().unwrap();
        assert_relative_eq!(lon, 0.5, epsilon = 1e-9);
        assert_relative_eq!(lat, -30.25, epsilon = 1e-9);
        // 2019-12-07T08:54:01Z
        assert_eq!(first.timestamp, Some(1_575_708_841.0));

        let Some(SegyRecord::Trace(second)) = reader.read_next_record() else {
            panic!("expected a trace");
        };
        assert_eq!(second.samples, 10);
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Exhausted);
    }

    #[test]
    fn coordinate_units() {
        assert_eq!(
            coordinates(500_000.0, 6_000_000.0, 1),
            Some(Coordinates::Grid {
                easting: 500_000.0,
                northing: 6_000_000.0
            })
        );
        let (lon, lat) = coordinates(1_153_030.0, -334_515.0, 4)
            .unwrap()
            .geographic()
            .unwrap();
        assert_relative_eq!(lon, 115.0 + 30.0 / 60.0 + 30.0 / 3600.0, epsilon = 1e-9);
        assert_relative_eq!(lat, -(33.0 + 45.0 / 60.0 + 15.0 / 3600.0), epsilon = 1e-9);
        assert_eq!(coordinates(1.0, 1.0, 0), None);
        assert_relative_eq!(apply_scalar(12_345, -100), 123.45);
        assert_relative_eq!(apply_scalar(12, 10), 120.0);
        assert_relative_eq!(apply_scalar(12, 0), 12.0);
    }

    #[test]
    fn grid_traces_are_not_navigation() {
        let bytes = [
            file_header(8, 4, 0),
            trace(1, 4, 1, (50_000_000, 600_000_000), 1),
            trace(2, 4, 1, (180_000, 180_000), 2),
            trace(3, 4, 1, (1_050, 4_525), 3),
            trace(4, 4, 1, (180_000, 36_000_000), 3),
        ]
        .concat();
        let mut reader = SegyReader::from_cursor(ByteCursor::from_bytes(bytes));
        let extraction = extract(&mut reader, 0.0);
        assert_eq!(extraction.fixes.len(), 2);
        assert_relative_eq!(extraction.fixes[0].longitude, 0.5, epsilon = 1e-9);
        // Units 3 are decimal degrees, still scaled by the coordinate scalar.
        assert_relative_eq!(extraction.fixes[1].latitude, 45.25, epsilon = 1e-9);
        assert_eq!(extraction.fixes[1].flags, 1003);
        assert_eq!(extraction.rejected, 1);
    }

    #[test]
    fn ebcdic_text_header() {
        // "C 1" in code page 037, padded with EBCDIC spaces.
        let mut card = vec![0xC3, 0x40, 0xF1, 0x40, 0xC8, 0x89];
        card.resize(3200, 0x40);
        assert_eq!(TextEncoding::detect(&card), TextEncoding::Ebcdic);
        assert!(TextEncoding::Ebcdic.decode(&card).starts_with("C 1 Hi"));
    }

    #[test]
    fn unusable_file_headers_open_corrupt() {
        let reader = SegyReader::from_cursor(ByteCursor::from_bytes(file_header(99, 10, 0)));
        assert_eq!(reader.state(), ReaderState::Corrupt);

        let mut short = file_header(1, 10, 0);
        short.truncate(3500);
        let reader = SegyReader::from_cursor(ByteCursor::from_bytes(short));
        assert_eq!(reader.state(), ReaderState::Corrupt);

        let mut missing_extended = file_header(1, 10, 2);
        missing_extended.truncate(3600 + 3200);
        let reader = SegyReader::from_cursor(ByteCursor::from_bytes(missing_extended));
        assert_eq!(reader.state(), ReaderState::Corrupt);
    }

    #[test]
    fn truncated_trace_is_corrupt() {
        let mut bytes = [file_header(1, 10, 0), trace(1, 10, 4, (1, 1), 2)].concat();
        bytes.truncate(bytes.len() - 1);
        let mut reader = SegyReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Corrupt);
    }
}
