//! Teledyne Reson 7k (`.s7k`) multibeam records.
//!
//! Little endian. Every record starts with a 64 byte data record frame whose `size` covers the
//! whole record, including the optional trailing checksum announced by bit 0 of `flags`.
use super::{
    layout::{Endian, FieldSpec, FieldType, Fields, Layout},
    *,
};
use crate::navigation::{NavigationFix, NavigationRecord};
use chrono::{NaiveDate, NaiveTime};
use delegate::delegate;

pub const SYNC_PATTERN: i64 = 0x0000_FFFF;
pub const POSITION: u32 = 1015;

const CHECKSUM_FLAG: i64 = 0x0001;

static FRAME: Layout = Layout::new(
    "7k data record frame",
    Endian::Little,
    &[
        FieldSpec::new("protocol_version", FieldType::U16),
        FieldSpec::new("offset", FieldType::U16),
        FieldSpec::new("sync_pattern", FieldType::U32),
        FieldSpec::new("size", FieldType::U32),
        FieldSpec::new("optional_data_offset", FieldType::U32),
        FieldSpec::new("optional_data_identifier", FieldType::U32),
        FieldSpec::new("year", FieldType::U16),
        FieldSpec::new("day", FieldType::U16),
        FieldSpec::new("seconds", FieldType::F32),
        FieldSpec::new("hours", FieldType::U8),
        FieldSpec::new("minutes", FieldType::U8),
        FieldSpec::new("record_version", FieldType::U16),
        FieldSpec::new("record_type", FieldType::U32),
        FieldSpec::new("device_identifier", FieldType::U32),
        FieldSpec::pad(2),
        FieldSpec::new("system_enumerator", FieldType::U16),
        FieldSpec::pad(4),
        FieldSpec::new("flags", FieldType::U16),
        FieldSpec::pad(6),
        FieldSpec::new("total_fragments", FieldType::U32),
        FieldSpec::new("fragment_number", FieldType::U32),
    ],
);

static POSITION_RECORD: Layout = Layout::new(
    "7k position",
    Endian::Little,
    &[
        FieldSpec::new("vertical_reference", FieldType::U8),
        FieldSpec::new("latitude", FieldType::F64),
        FieldSpec::new("longitude", FieldType::F64),
        FieldSpec::new("horizontal_accuracy", FieldType::F32),
        FieldSpec::new("vessel_height", FieldType::F32),
        FieldSpec::new("height_accuracy", FieldType::F32),
        FieldSpec::new("speed_over_ground", FieldType::F32),
        FieldSpec::new("course_over_ground", FieldType::F32),
        FieldSpec::new("heading", FieldType::F32),
    ],
);

pub struct S7kHeaderReader;

impl DatagramHeaderReader for S7kHeaderReader {
    type Tag = u32;

    const HEADER_LENGTH: usize = 64;

    fn parse_header(&self, bytes: &[u8], position: u64) -> Result<DatagramHeader<u32>> {
        let frame = FRAME.decode(bytes)?;
        let sync = frame.int("sync_pattern")?;
        ensure!(
            sync == SYNC_PATTERN,
            CorruptHeaderSnafu {
                description: format!("bad 7k sync pattern {sync:#010x}"),
                position,
            }
        );
        let size = frame.int("size")? as u64;
        let checksum = if frame.int("flags")? & CHECKSUM_FLAG != 0 {
            Checksum::Trailing
        } else {
            Checksum::Absent
        };
        let overhead = Self::HEADER_LENGTH as u64 + checksum.length();
        ensure!(
            size >= overhead,
            CorruptHeaderSnafu {
                description: format!("7k record size {size} is smaller than its frame"),
                position,
            }
        );
        Ok(DatagramHeader {
            tag: frame.int("record_type")? as u32,
            header_length: Self::HEADER_LENGTH as u8,
            payload_length: (size - overhead) as u32,
            checksum,
            trailer_length: 0,
        })
    }
}

/// Unix time of a 7k frame: year, day of year (1 based) and time of day.
///
/// `None` for calendar fields that do not form a valid time.
fn frame_time(frame: &Fields) -> Result<Option<f64>> {
    let year = frame.int("year")? as i32;
    let day = frame.int("day")? as u32;
    let hours = frame.int("hours")? as u32;
    let minutes = frame.int("minutes")? as u32;
    let seconds = frame.float("seconds")?;
    let time = NaiveDate::from_yo_opt(year, day)
        .zip(NaiveTime::from_hms_opt(hours, minutes, 0))
        .filter(|_| (0.0..61.0).contains(&seconds))
        .map(|(date, time)| date.and_time(time).and_utc().timestamp() as f64 + seconds);
    if time.is_none() {
        log::debug!("Ignoring invalid 7k time {year}/{day} {hours}:{minutes}:{seconds}");
    }
    Ok(time)
}

#[derive(Clone, Debug, PartialEq)]
pub struct Position {
    /// Unix seconds, `None` when the frame carries an invalid date.
    pub timestamp: Option<f64>,
    pub vertical_reference: u8,
    /// Degrees.
    pub latitude: f64,
    /// Degrees.
    pub longitude: f64,
    pub horizontal_accuracy: f64,
    pub vessel_height: f64,
    pub height_accuracy: f64,
    pub speed_over_ground: f64,
    /// Degrees.
    pub course_over_ground: f64,
    /// Degrees.
    pub heading: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum S7kRecord {
    Position(Position),
    Unsupported { record_type: u32, length: u32 },
}

impl NavigationRecord for S7kRecord {
    fn navigation_fix(&self) -> Option<NavigationFix> {
        match self {
            S7kRecord::Position(p) => p.timestamp.map(|timestamp| {
                NavigationFix::new(timestamp, p.longitude, p.latitude)
                    .with_depth(p.vessel_height)
                    .with_heading(p.heading)
            }),
            S7kRecord::Unsupported { .. } => None,
        }
    }
}

pub struct S7k;

impl RecordFormat for S7k {
    type HeaderReader = S7kHeaderReader;
    type Options = ();
    type Context = ();
    type State = ();
    type Record = S7kRecord;

    const NAME: &'static str = "7k";

    fn open_stream(_cursor: &ByteCursor, _options: ()) -> Result<OpenedStream<Self>> {
        Ok(OpenedStream {
            header_reader: S7kHeaderReader,
            context: (),
            data_start: 0,
        })
    }

    fn register(registry: &mut DecoderRegistry<Self>) {
        registry.register(POSITION, decode_position);
    }

    fn unsupported(raw: &RawRecord<u32>) -> S7kRecord {
        S7kRecord::Unsupported {
            record_type: raw.header.tag,
            length: raw.header.payload_length,
        }
    }
}

fn decode_position(raw: &RawRecord<u32>, _context: &(), state: ()) -> Result<(S7kRecord, ())> {
    let frame = FRAME.decode(&raw.header_bytes)?;
    let fields = POSITION_RECORD.decode(&raw.payload)?;
    let position = Position {
        timestamp: frame_time(&frame)?,
        vertical_reference: fields.int("vertical_reference")? as u8,
        latitude: fields.float("latitude")?.to_degrees(),
        longitude: fields.float("longitude")?.to_degrees(),
        horizontal_accuracy: fields.float("horizontal_accuracy")?,
        vessel_height: fields.float("vessel_height")?,
        height_accuracy: fields.float("height_accuracy")?,
        speed_over_ground: fields.float("speed_over_ground")?,
        course_over_ground: fields.float("course_over_ground")?.to_degrees(),
        heading: fields.float("heading")?.to_degrees(),
    };
    Ok((S7kRecord::Position(position), state))
}

pub struct S7kReader {
    inner: DispatchingReader<S7k>,
}

impl S7kReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        DispatchingReader::open(path, ()).map(|inner| Self { inner })
    }

    pub fn from_cursor(cursor: ByteCursor) -> Self {
        Self {
            inner: DispatchingReader::from_cursor(cursor, ()),
        }
    }
}

impl FormatReader for S7kReader {
    type Record = S7kRecord;

    delegate! {
        to self.inner {
            fn more_data(&self) -> bool;
            fn read_next_record(&mut self) -> Option<S7kRecord>;
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

    fn record(record_type: u32, payload: &[u8], checksum: bool, seconds: f64) -> Vec<u8> {
        record_on_day(record_type, payload, checksum, seconds, 32)
    }

    fn record_on_day(
        record_type: u32,
        payload: &[u8],
        checksum: bool,
        seconds: f64,
        day: i64,
    ) -> Vec<u8> {
        let checksum_len = if checksum { 4 } else { 0 };
        let mut out = FRAME
            .encode(&[
                ("protocol_version", Value::Int(5)),
                ("offset", Value::Int(60)),
                ("sync_pattern", Value::Int(SYNC_PATTERN)),
                (
                    "size",
                    Value::Int((64 + payload.len() + checksum_len) as i64),
                ),
                ("year", Value::Int(2021)),
                ("day", Value::Int(day)),
                ("seconds", Value::Float(seconds)),
                ("hours", Value::Int(12)),
                ("minutes", Value::Int(30)),
                ("record_type", Value::Int(record_type as i64)),
                ("flags", Value::Int(if checksum { 1 } else { 0 })),
            ])
            .unwrap();
        out.extend_from_slice(payload);
        out.extend(std::iter::repeat(0xCC).take(checksum_len));
        out
    }

    fn position(lon: f64, lat: f64, heading: f64) -> Vec<u8> {
        POSITION_RECORD
            .encode(&[
                ("latitude", Value::Float(lat.to_radians())),
                ("longitude", Value::Float(lon.to_radians())),
                ("vessel_height", Value::Float(2.5)),
                ("heading", Value::Float(heading.to_radians())),
            ])
            .unwrap()
    }

    #[test]
    fn frame_layout_is_64_bytes() {
        assert_eq!(FRAME.size(), 64);
        assert_eq!(FRAME.offset_of("record_type"), Some(32));
        assert_eq!(FRAME.offset_of("flags"), Some(48));
        assert_eq!(POSITION_RECORD.size(), 41);
    }

    #[test]
    fn decodes_position_in_degrees() {
        let bytes = [
            record(7000, &[0u8; 12], true, 0.0),
            record(POSITION, &position(4.5, 52.25, 90.0), true, 15.5),
        ]
        .concat();
        let mut reader = S7kReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert_eq!(
            reader.read_next_record(),
            Some(S7kRecord::Unsupported {
                record_type: 7000,
                length: 12
            })
        );
        let Some(S7kRecord::Position(p)) = reader.read_next_record() else {
            panic!("expected a position");
        };
        assert_relative_eq!(p.longitude, 4.5, epsilon = 1e-9);
        assert_relative_eq!(p.latitude, 52.25, epsilon = 1e-9);
        assert_relative_eq!(p.heading, 90.0, epsilon = 1e-4);
        // 2021-02-01 12:30:15.5 UTC
        assert_relative_eq!(p.timestamp.unwrap(), 1_612_182_615.5, epsilon = 1e-3);
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Exhausted);
    }

    #[test]
    fn bad_sync_is_corrupt() {
        let mut bytes = record(POSITION, &position(1.0, 1.0, 0.0), false, 0.0);
        bytes[4] = 0;
        let mut reader = S7kReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Corrupt);
    }

    #[test]
    fn navigation_from_positions() {
        let bytes = [
            record(POSITION, &position(4.5, 52.25, 10.0), false, 0.0),
            record(POSITION, &position(4.6, 52.35, 10.0), false, 1.0),
            record(POSITION, &position(4.7, 52.45, 10.0), false, 2.0),
        ]
        .concat();
        let mut reader = S7kReader::from_cursor(ByteCursor::from_bytes(bytes));
        let extraction = extract(&mut reader, 2.0);
        assert_eq!(extraction.fixes.len(), 2);
        assert_relative_eq!(extraction.fixes[1].longitude, 4.7, epsilon = 1e-9);
        assert_relative_eq!(extraction.fixes[1].depth.unwrap(), 2.5);
    }

    #[test]
    fn invalid_dates_only_drop_their_fix() {
        let bytes = [
            record(POSITION, &position(4.5, 52.25, 10.0), false, 0.0),
            record_on_day(POSITION, &position(4.6, 52.35, 10.0), false, 1.0, 400),
            record(POSITION, &position(4.7, 52.45, 10.0), false, 2.0),
        ]
        .concat();
        let mut reader = S7kReader::from_cursor(ByteCursor::from_bytes(bytes));
        let extraction = extract(&mut reader, 0.0);
        assert_eq!(extraction.final_state, ReaderState::Exhausted);
        assert_eq!(extraction.fixes.len(), 2);
        assert_relative_eq!(extraction.fixes[1].longitude, 4.7, epsilon = 1e-9);
    }

    #[test]
    fn truncated_file_keeps_earlier_fixes() {
        let mut bytes = [
            record(POSITION, &position(4.5, 52.25, 10.0), true, 0.0),
            record(POSITION, &position(4.6, 52.35, 10.0), true, 1.0),
            record(POSITION, &position(4.7, 52.45, 10.0), true, 2.0),
        ]
        .concat();
        bytes.truncate(bytes.len() - 20);
        let mut reader = S7kReader::from_cursor(ByteCursor::from_bytes(bytes));
        let extraction = extract(&mut reader, 0.0);
        assert_eq!(extraction.final_state, ReaderState::Corrupt);
        assert_eq!(extraction.fixes.len(), 2);
        assert_relative_eq!(extraction.fixes[1].latitude, 52.35, epsilon = 1e-9);
        assert_eq!(reader.read_next_record(), None);
    }
}
