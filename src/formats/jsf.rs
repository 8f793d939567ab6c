//! EdgeTech JSF side-scan and sub-bottom files.
//!
//! Little endian. Each message has a 16 byte header starting with the `0x1601` marker and
//! announcing the size of the message that follows.
use super::{
    layout::{Endian, FieldSpec, FieldType, Layout},
    *,
};
use crate::navigation::{NavigationFix, NavigationRecord};
use delegate::delegate;

pub const START_OF_MESSAGE: i64 = 0x1601;
pub const SONAR_DATA: u16 = 80;

static MESSAGE_HEADER: Layout = Layout::new(
    "JSF message header",
    Endian::Little,
    &[
        FieldSpec::new("marker", FieldType::U16),
        FieldSpec::new("version", FieldType::U8),
        FieldSpec::new("session", FieldType::U8),
        FieldSpec::new("message_type", FieldType::U16),
        FieldSpec::new("command", FieldType::U8),
        FieldSpec::new("subsystem", FieldType::U8),
        FieldSpec::new("channel", FieldType::U8),
        FieldSpec::new("sequence", FieldType::U8),
        FieldSpec::pad(2),
        FieldSpec::new("message_size", FieldType::U32),
    ],
);

static SONAR_DATA_HEADER: Layout = Layout::new(
    "JSF sonar data message",
    Endian::Little,
    &[
        FieldSpec::new("ping_time", FieldType::I32),
        FieldSpec::new("starting_depth", FieldType::U32),
        FieldSpec::new("ping_number", FieldType::U32),
        FieldSpec::pad(68),
        FieldSpec::new("x", FieldType::I32),
        FieldSpec::new("y", FieldType::I32),
        FieldSpec::new("coordinate_units", FieldType::I16),
        FieldSpec::pad(46),
        FieldSpec::scaled("depth", FieldType::I32, 0.001),
        FieldSpec::pad(32),
        FieldSpec::scaled("heading", FieldType::U16, 0.01),
        FieldSpec::pad(26),
        FieldSpec::new("milliseconds_today", FieldType::U32),
    ],
);

pub struct JsfHeaderReader;

impl DatagramHeaderReader for JsfHeaderReader {
    type Tag = u16;

    const HEADER_LENGTH: usize = 16;

    fn parse_header(&self, bytes: &[u8], position: u64) -> Result<DatagramHeader<u16>> {
        let fields = MESSAGE_HEADER.decode(bytes)?;
        let marker = fields.int("marker")?;
        ensure!(
            marker == START_OF_MESSAGE,
            CorruptHeaderSnafu {
                description: format!("bad JSF start of message {marker:#06x}"),
                position,
            }
        );
        Ok(DatagramHeader {
            tag: fields.int("message_type")? as u16,
            header_length: Self::HEADER_LENGTH as u8,
            payload_length: fields.int("message_size")? as u32,
            checksum: Checksum::Absent,
            trailer_length: 0,
        })
    }
}

/// Converts JSF `x`/`y` values according to their coordinate units.
fn coordinates(x: i64, y: i64, units: i64) -> Option<Coordinates> {
    let (x, y) = (x as f64, y as f64);
    match units {
        1 => Some(Coordinates::Grid {
            easting: x / 1000.0,
            northing: y / 1000.0,
        }),
        // Minutes of arc times 10000.
        2 => Some(Coordinates::Geographic {
            longitude: x / 10000.0 / 60.0,
            latitude: y / 10000.0 / 60.0,
        }),
        3 => Some(Coordinates::Grid {
            easting: x / 10.0,
            northing: y / 10.0,
        }),
        4 => Some(Coordinates::Grid {
            easting: x / 100.0,
            northing: y / 100.0,
        }),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SonarData {
    pub timestamp: f64,
    pub ping_number: u32,
    pub subsystem: u8,
    pub channel: u8,
    pub position: Option<Coordinates>,
    /// Metres, if the towfish reported one.
    pub depth: Option<f64>,
    pub heading: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JsfRecord {
    SonarData(SonarData),
    Unsupported { message_type: u16, length: u32 },
}

impl NavigationRecord for JsfRecord {
    fn navigation_fix(&self) -> Option<NavigationFix> {
        let JsfRecord::SonarData(data) = self else {
            return None;
        };
        let (longitude, latitude) = data.position?.geographic()?;
        let fix =
            NavigationFix::new(data.timestamp, longitude, latitude).with_heading(data.heading);
        Some(match data.depth {
            Some(depth) => fix.with_depth(depth),
            None => fix,
        })
    }
}

pub struct Jsf;

impl RecordFormat for Jsf {
    type HeaderReader = JsfHeaderReader;
    type Options = ();
    type Context = ();
    type State = ();
    type Record = JsfRecord;

    const NAME: &'static str = "JSF";

    fn open_stream(_cursor: &ByteCursor, _options: ()) -> Result<OpenedStream<Self>> {
        Ok(OpenedStream {
            header_reader: JsfHeaderReader,
            context: (),
            data_start: 0,
        })
    }

    fn register(registry: &mut DecoderRegistry<Self>) {
        registry.register(SONAR_DATA, decode_sonar_data);
    }

    fn unsupported(raw: &RawRecord<u16>) -> JsfRecord {
        JsfRecord::Unsupported {
            message_type: raw.header.tag,
            length: raw.header.payload_length,
        }
    }
}

fn decode_sonar_data(raw: &RawRecord<u16>, _context: &(), state: ()) -> Result<(JsfRecord, ())> {
    let header = MESSAGE_HEADER.decode(&raw.header_bytes)?;
    let fields = SONAR_DATA_HEADER.decode(&raw.payload)?;
    let units = fields.int("coordinate_units")?;
    let position = coordinates(fields.int("x")?, fields.int("y")?, units);
    if position.is_none() {
        log::debug!("JSF ping at {} has unknown coordinate units {units}", raw.start);
    }
    let milliseconds = fields.int("milliseconds_today")? % 1000;
    let depth = fields.float("depth")?;
    let data = SonarData {
        timestamp: fields.int("ping_time")? as f64 + milliseconds as f64 / 1000.0,
        ping_number: fields.int("ping_number")? as u32,
        subsystem: header.int("subsystem")? as u8,
        channel: header.int("channel")? as u8,
        position,
        depth: (depth != 0.0).then_some(depth),
        heading: fields.float("heading")?,
    };
    Ok((JsfRecord::SonarData(data), state))
}

pub struct JsfReader {
    inner: DispatchingReader<Jsf>,
}

impl JsfReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        DispatchingReader::open(path, ()).map(|inner| Self { inner })
    }

    pub fn from_cursor(cursor: ByteCursor) -> Self {
        Self {
            inner: DispatchingReader::from_cursor(cursor, ()),
        }
    }
}

impl FormatReader for JsfReader {
    type Record = JsfRecord;

    delegate! {
        to self.inner {
            fn more_data(&self) -> bool;
            fn read_next_record(&mut self) -> Option<JsfRecord>;
            fn rewind(&mut self);
            fn state(&self) -> ReaderState;
        }
    }
}

/// A sonar data message at `time` with a geographic position, for building survey fixtures.
#[cfg(test)]
pub(crate) fn sonar_message_at(time: i64, longitude: f64, latitude: f64) -> Vec<u8> {
    use layout::Value;
    let mut payload = SONAR_DATA_HEADER
        .encode(&[
            ("ping_time", Value::Int(time)),
            ("x", Value::Int((longitude * 600_000.0).round() as i64)),
            ("y", Value::Int((latitude * 600_000.0).round() as i64)),
            ("coordinate_units", Value::Int(2)),
            ("depth", Value::Int(5_000)),
            ("heading", Value::Int(9_000)),
        ])
        .unwrap();
    payload.extend_from_slice(&[0u8; 16]);
    let mut out = MESSAGE_HEADER
        .encode(&[
            ("marker", Value::Int(START_OF_MESSAGE)),
            ("message_type", Value::Int(SONAR_DATA as i64)),
            ("message_size", Value::Int(payload.len() as i64)),
        ])
        .unwrap();
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::{layout::Value, *};
    use crate::navigation::extract;
    use approx::assert_relative_eq;

    fn message(message_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = MESSAGE_HEADER
            .encode(&[
                ("marker", Value::Int(START_OF_MESSAGE)),
                ("version", Value::Int(8)),
                ("message_type", Value::Int(message_type as i64)),
                ("subsystem", Value::Int(20)),
                ("channel", Value::Int(1)),
                ("message_size", Value::Int(payload.len() as i64)),
            ])
            .unwrap();
        out.extend_from_slice(payload);
        out
    }

    fn sonar(time: i64, x: i64, y: i64, units: i64) -> Vec<u8> {
        let mut payload = SONAR_DATA_HEADER
            .encode(&[
                ("ping_time", Value::Int(time)),
                ("ping_number", Value::Int(time - 1000)),
                ("x", Value::Int(x)),
                ("y", Value::Int(y)),
                ("coordinate_units", Value::Int(units)),
                ("depth", Value::Int(12_345)),
                ("heading", Value::Int(18_050)),
                ("milliseconds_today", Value::Int(45_296_250)),
            ])
            .unwrap();
        // Trace samples follow the header.
        payload.extend_from_slice(&[0u8; 32]);
        message(SONAR_DATA, &payload)
    }

    #[test]
    fn sonar_header_offsets() {
        assert_eq!(MESSAGE_HEADER.size(), 16);
        assert_eq!(SONAR_DATA_HEADER.offset_of("x"), Some(80));
        assert_eq!(SONAR_DATA_HEADER.offset_of("coordinate_units"), Some(88));
        assert_eq!(SONAR_DATA_HEADER.offset_of("depth"), Some(136));
        assert_eq!(SONAR_DATA_HEADER.offset_of("heading"), Some(172));
        assert_eq!(SONAR_DATA_HEADER.offset_of("milliseconds_today"), Some(200));
    }

    #[test]
    fn decodes_geographic_sonar_data() {
        let bytes = [
            message(182, &[1, 2, 3]),
            // 3 and 51.5 degrees in minutes of arc times 10000.
            sonar(1_700_000_000, 1_800_000, 30_900_000, 2),
        ]
        .concat();
        let mut reader = JsfReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert_eq!(
            reader.read_next_record(),
            Some(JsfRecord::Unsupported {
                message_type: 182,
                length: 3
            })
        );
        let Some(JsfRecord::SonarData(data)) = reader.read_next_record() else {
            panic!("expected sonar data");
        };
        assert_eq!(
            data.position,
            Some(Coordinates::Geographic {
                longitude: 3.0,
                latitude: 51.5
            })
        );
        assert_eq!(data.channel, 1);
        assert_relative_eq!(data.timestamp, 1_700_000_000.25);
        assert_relative_eq!(data.depth.unwrap(), 12.345, epsilon = 1e-9);
        assert_relative_eq!(data.heading, 180.5, epsilon = 1e-9);
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Exhausted);
    }

    #[test]
    fn grid_positions_are_not_navigation() {
        let bytes = [
            sonar(100, 500_000, 6_000_000, 1),
            sonar(101, 1_800_000, 30_900_000, 2),
        ]
        .concat();
        let mut reader = JsfReader::from_cursor(ByteCursor::from_bytes(bytes));
        let extraction = extract(&mut reader, 0.0);
        assert_eq!(extraction.fixes.len(), 1);
        assert_relative_eq!(extraction.fixes[0].timestamp, 101.25);
    }

    #[test]
    fn bad_marker_is_corrupt() {
        let mut bytes = sonar(100, 1, 1, 2);
        bytes.extend(sonar(101, 1, 1, 2));
        let second = bytes.len() / 2;
        bytes[second] = 0x00;
        let mut reader = JsfReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert!(reader.read_next_record().is_some());
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Corrupt);
    }

    #[test]
    fn truncated_file_keeps_earlier_fixes() {
        let mut bytes = [
            sonar(100, 1_800_000, 30_900_000, 2),
            sonar(101, 1_800_600, 30_900_000, 2),
            sonar(102, 1_801_200, 30_900_000, 2),
        ]
        .concat();
        bytes.truncate(bytes.len() - 10);
        let mut reader = JsfReader::from_cursor(ByteCursor::from_bytes(bytes));
        let extraction = extract(&mut reader, 0.0);
        assert_eq!(extraction.final_state, ReaderState::Corrupt);
        assert_eq!(extraction.fixes.len(), 2);
        assert_relative_eq!(extraction.fixes[1].timestamp, 101.25);
        assert_eq!(reader.read_next_record(), None);
    }
}
