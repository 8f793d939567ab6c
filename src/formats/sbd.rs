//! EIVA NaviScan binary sensor logs (`.sbd`).
//!
//! Little endian. The file starts with a header block that carries the file date, the geodesy
//! names and a table of sensor definitions. Data messages follow at the offset given in the
//! header, each one a 20 byte header and a category specific body.
use super::{
    layout::{Endian, FieldSpec, FieldType, Fields, Layout},
    *,
};
use crate::navigation::{NavigationFix, NavigationRecord};
use bytes::Bytes;
use chrono::{NaiveDate, NaiveTime};
use delegate::delegate;
use std::net::Ipv4Addr;

/// Sensor categories, as used in the low byte of a message's sensor id.
pub mod category {
    pub const GNSS_TIME: u8 = 0;
    pub const RUN_LINE_CONTROL: u8 = 1;
    pub const GYRO: u8 = 2;
    pub const MOTION: u8 = 3;
    pub const BATHY: u8 = 4;
    pub const AUXILIARY: u8 = 5;
    pub const RAW_DATA: u8 = 6;
    pub const DOPPLER: u8 = 7;
    pub const POSITION: u8 = 8;
    pub const ECHOSOUNDER: u8 = 9;
    pub const SIDESCAN: u8 = 10;
    pub const PIPE_TRACKER: u8 = 11;
}

const ELLIPSOID_OFFSET: u64 = 366;
const PROJECTION_OFFSET: u64 = 446;
const GEODESY_NAME_LENGTH: usize = 80;
const SENSOR_TABLE_OFFSET: u64 = 1060;
const SENSOR_ENTRY_LENGTH: u64 = 256;
/// Data starts this far after the offset stored in the file header.
const DATA_START_ADJUSTMENT: u64 = 20;

static FILE_HEADER: Layout = Layout::new(
    "SBD file header",
    Endian::Little,
    &[
        FieldSpec::pad(14),
        FieldSpec::new("sensor_count", FieldType::I16),
        FieldSpec::new("data_start", FieldType::U16),
        FieldSpec::pad(2),
        FieldSpec::new("year", FieldType::I16),
        FieldSpec::new("month", FieldType::I16),
        FieldSpec::pad(2),
        FieldSpec::new("day", FieldType::I16),
        FieldSpec::new("hour", FieldType::I16),
        FieldSpec::new("minute", FieldType::I16),
        FieldSpec::new("second", FieldType::I16),
        FieldSpec::new("millisecond", FieldType::I16),
        FieldSpec::pad(2),
        FieldSpec::new("version", FieldType::I16),
        FieldSpec::pad(20),
    ],
);

static SENSOR_ENTRY: Layout = Layout::new(
    "SBD sensor definition",
    Endian::Little,
    &[
        FieldSpec::new("sensor_type", FieldType::U8),
        FieldSpec::pad(1),
        FieldSpec::new("category", FieldType::U8),
        FieldSpec::new("disabled", FieldType::U8),
        FieldSpec::pad(4),
        FieldSpec::new("name", FieldType::Bytes(32)),
        FieldSpec::new("port_type", FieldType::U16),
    ],
);

static SERIAL_PORT: Layout = Layout::new(
    "SBD serial port",
    Endian::Little,
    &[
        FieldSpec::pad(2),
        FieldSpec::new("port", FieldType::U16),
        FieldSpec::pad(2),
        FieldSpec::new("baud", FieldType::U16),
        FieldSpec::pad(6),
        FieldSpec::pad(4),
        FieldSpec::new("latency", FieldType::F32),
        FieldSpec::pad(4),
        FieldSpec::new("offset_x", FieldType::F32),
        FieldSpec::new("offset_y", FieldType::F32),
        FieldSpec::new("offset_z", FieldType::F32),
        FieldSpec::pad(4),
        FieldSpec::new("offset_roll", FieldType::F32),
        FieldSpec::new("offset_pitch", FieldType::F32),
        FieldSpec::new("offset_heading", FieldType::F32),
        FieldSpec::pad(160),
    ],
);

static NETWORK_PORT: Layout = Layout::new(
    "SBD network port",
    Endian::Little,
    &[
        FieldSpec::pad(2),
        FieldSpec::new("port", FieldType::U16),
        FieldSpec::pad(2),
        FieldSpec::new("address", FieldType::Bytes(4)),
        FieldSpec::pad(4),
        FieldSpec::new("latency", FieldType::F32),
        FieldSpec::new("offset_x", FieldType::F32),
        FieldSpec::new("offset_y", FieldType::F32),
        FieldSpec::new("offset_z", FieldType::F32),
        FieldSpec::pad(4),
        FieldSpec::new("offset_roll", FieldType::F32),
        FieldSpec::new("offset_pitch", FieldType::F32),
        FieldSpec::new("offset_heading", FieldType::F32),
        FieldSpec::pad(168),
    ],
);

static MESSAGE_HEADER: Layout = Layout::new(
    "SBD message header",
    Endian::Little,
    &[
        FieldSpec::new("sensor_id", FieldType::U32),
        FieldSpec::pad(4),
        FieldSpec::new("seconds", FieldType::U32),
        FieldSpec::new("microseconds", FieldType::U32),
        FieldSpec::new("length", FieldType::U32),
    ],
);

static GYRO_MESSAGE: Layout = Layout::new(
    "SBD gyro",
    Endian::Little,
    &[
        FieldSpec::new("heading", FieldType::F32),
        FieldSpec::pad(4),
        FieldSpec::new("corrected_heading", FieldType::F32),
        FieldSpec::new("packet_size", FieldType::U32),
    ],
);

static MOTION_MESSAGE: Layout = Layout::new(
    "SBD motion",
    Endian::Little,
    &[
        FieldSpec::new("roll", FieldType::F32),
        FieldSpec::new("pitch", FieldType::F32),
        FieldSpec::new("heave", FieldType::F32),
        FieldSpec::new("packet_size", FieldType::U32),
    ],
);

static BATHY_MESSAGE: Layout = Layout::new(
    "SBD bathy",
    Endian::Little,
    &[
        FieldSpec::new("depth", FieldType::F32),
        FieldSpec::pad(8),
        FieldSpec::new("packet_size", FieldType::U32),
    ],
);

static AUXILIARY_MESSAGE: Layout = Layout::new(
    "SBD auxiliary",
    Endian::Little,
    &[FieldSpec::new("velocity", FieldType::F32)],
);

static POSITION_MESSAGE: Layout = Layout::new(
    "SBD position",
    Endian::Little,
    &[
        FieldSpec::new("easting", FieldType::F64),
        FieldSpec::new("northing", FieldType::F64),
        FieldSpec::new("packet_size", FieldType::U32),
    ],
);

pub struct SbdHeaderReader;

impl DatagramHeaderReader for SbdHeaderReader {
    type Tag = u8;

    const HEADER_LENGTH: usize = 20;

    fn parse_header(&self, bytes: &[u8], _position: u64) -> Result<DatagramHeader<u8>> {
        let fields = MESSAGE_HEADER.decode(bytes)?;
        Ok(DatagramHeader {
            tag: (fields.int("sensor_id")? % 256) as u8,
            header_length: Self::HEADER_LENGTH as u8,
            payload_length: fields.int("length")? as u32,
            checksum: Checksum::Absent,
            trailer_length: 0,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SensorPort {
    Serial { port: u16, baud: u16 },
    Network { address: Ipv4Addr, port: u16 },
}

/// An enabled entry of the file's sensor table.
#[derive(Clone, Debug, PartialEq)]
pub struct Sensor {
    /// Position in the sensor table, counting disabled entries.
    pub index: usize,
    pub name: String,
    pub sensor_type: u8,
    pub category: u8,
    pub port: SensorPort,
    pub latency: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub offset_z: f64,
    pub offset_roll: f64,
    pub offset_pitch: f64,
    pub offset_heading: f64,
}

impl Sensor {
    fn from_entry(index: usize, entry: &[u8]) -> Result<Option<Self>> {
        let fields = SENSOR_ENTRY.decode(entry)?;
        if fields.int("disabled")? != 0 {
            return Ok(None);
        }
        let (port, block) = if fields.int("port_type")? == 1 {
            let block = SERIAL_PORT.decode_at(entry, SENSOR_ENTRY.size())?;
            let port = SensorPort::Serial {
                port: block.int("port")? as u16,
                baud: block.int("baud")? as u16,
            };
            (port, block)
        } else {
            let block = NETWORK_PORT.decode_at(entry, SENSOR_ENTRY.size())?;
            let address = block.bytes("address")?;
            let port = SensorPort::Network {
                address: Ipv4Addr::new(address[0], address[1], address[2], address[3]),
                port: block.int("port")? as u16,
            };
            (port, block)
        };
        Ok(Some(Sensor {
            index,
            name: decode_padded_text(fields.bytes("name")?),
            sensor_type: fields.int("sensor_type")? as u8,
            category: fields.int("category")? as u8,
            port,
            latency: block.float("latency")?,
            offset_x: block.float("offset_x")?,
            offset_y: block.float("offset_y")?,
            offset_z: block.float("offset_z")?,
            offset_roll: block.float("offset_roll")?,
            offset_pitch: block.float("offset_pitch")?,
            offset_heading: block.float("offset_heading")?,
        }))
    }
}

/// What the file header says.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SbdFileHeader {
    pub version: i16,
    /// Unix time the log was started, if the header date is valid.
    pub start_time: Option<f64>,
    pub ellipsoid: String,
    pub projection: String,
    pub sensors: Vec<Sensor>,
}

fn file_start_time(fields: &Fields) -> Result<Option<f64>> {
    let date = NaiveDate::from_ymd_opt(
        fields.int("year")? as i32,
        fields.int("month")? as u32,
        fields.int("day")? as u32,
    );
    let time = NaiveTime::from_hms_milli_opt(
        fields.int("hour")? as u32,
        fields.int("minute")? as u32,
        fields.int("second")? as u32,
        fields.int("millisecond")? as u32,
    );
    Ok(date
        .zip(time)
        .map(|(date, time)| date.and_time(time).and_utc().timestamp_millis() as f64 / 1000.0))
}

/// Reads the geodesy names and the sensor table into `header`, stopping at the first problem.
fn read_descriptions(
    cursor: &ByteCursor,
    entries: usize,
    header: &mut SbdFileHeader,
) -> Result<()> {
    header.ellipsoid =
        decode_padded_text(&cursor.slice_at(ELLIPSOID_OFFSET, GEODESY_NAME_LENGTH)?);
    header.projection =
        decode_padded_text(&cursor.slice_at(PROJECTION_OFFSET, GEODESY_NAME_LENGTH)?);
    for index in 0..entries {
        let offset = SENSOR_TABLE_OFFSET + index as u64 * SENSOR_ENTRY_LENGTH;
        let entry = cursor.slice_at(offset, SENSOR_ENTRY_LENGTH as usize)?;
        if let Some(sensor) = Sensor::from_entry(index, &entry)? {
            header.sensors.push(sensor);
        }
    }
    Ok(())
}

/// Header fields shared by every data message.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MessageHeader {
    pub sensor_id: u32,
    pub timestamp: f64,
}

impl MessageHeader {
    fn decode(raw: &RawRecord<u8>) -> Result<Self> {
        let fields = MESSAGE_HEADER.decode(&raw.header_bytes)?;
        Ok(Self {
            sensor_id: fields.int("sensor_id")? as u32,
            timestamp: fields.int("seconds")? as f64 + fields.int("microseconds")? as f64 / 1.0e6,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SbdRecord {
    Gyro {
        header: MessageHeader,
        heading: f64,
        corrected_heading: f64,
    },
    Motion {
        header: MessageHeader,
        roll: f64,
        pitch: f64,
        heave: f64,
    },
    Bathy {
        header: MessageHeader,
        depth: f64,
    },
    Auxiliary {
        header: MessageHeader,
        velocity: f64,
    },
    /// A position with the latest gyro heading and bathy depth seen before it.
    Position {
        header: MessageHeader,
        position: Coordinates,
        heading: Option<f64>,
        depth: Option<f64>,
    },
    Echosounder {
        header: MessageHeader,
        /// The four character datagram name the raw data starts with, e.g. `BTH0`.
        system: String,
        data: Bytes,
    },
    /// A message of a known category without a body.
    Empty {
        header: MessageHeader,
    },
    Unsupported {
        category: u8,
        length: u32,
    },
}

impl NavigationRecord for SbdRecord {
    fn navigation_fix(&self) -> Option<NavigationFix> {
        let SbdRecord::Position {
            header,
            position,
            heading,
            depth,
        } = self
        else {
            return None;
        };
        let (longitude, latitude) = position.geographic()?;
        let mut fix = NavigationFix::new(header.timestamp, longitude, latitude)
            .with_flags(header.sensor_id);
        fix.heading = *heading;
        fix.depth = *depth;
        Some(fix)
    }
}

/// Latest readings that are attached to the positions that follow them.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SbdState {
    pub heading: Option<f64>,
    pub depth: Option<f64>,
}

pub struct Sbd;

impl RecordFormat for Sbd {
    type HeaderReader = SbdHeaderReader;
    type Options = ();
    type Context = SbdFileHeader;
    type State = SbdState;
    type Record = SbdRecord;

    const NAME: &'static str = "SBD";

    fn open_stream(cursor: &ByteCursor, _options: ()) -> Result<OpenedStream<Self>> {
        let fields = FILE_HEADER.decode(&cursor.slice_at(0, FILE_HEADER.size())?)?;
        let mut header = SbdFileHeader {
            version: fields.int("version")? as i16,
            start_time: file_start_time(&fields)?,
            ..Default::default()
        };
        let entries = (fields.int("sensor_count")? + 1).max(0) as usize;
        if let Err(e) = read_descriptions(cursor, entries, &mut header) {
            log::warn!(
                "Could not read the whole SBD sensor table, keeping {} sensors: {}",
                header.sensors.len(),
                e
            );
        }
        Ok(OpenedStream {
            header_reader: SbdHeaderReader,
            context: header,
            data_start: fields.int("data_start")? as u64 + DATA_START_ADJUSTMENT,
        })
    }

    fn register(registry: &mut DecoderRegistry<Self>) {
        registry.register(category::GYRO, decode_gyro);
        registry.register(category::MOTION, decode_motion);
        registry.register(category::BATHY, decode_bathy);
        registry.register(category::AUXILIARY, decode_auxiliary);
        registry.register(category::POSITION, decode_position);
        registry.register(category::ECHOSOUNDER, decode_echosounder);
    }

    fn unsupported(raw: &RawRecord<u8>) -> SbdRecord {
        SbdRecord::Unsupported {
            category: raw.header.tag,
            length: raw.header.payload_length,
        }
    }
}

/// Decodes the message header, or produces [[SbdRecord::Empty]] for messages without a body.
fn message_header(raw: &RawRecord<u8>) -> Result<(MessageHeader, Option<SbdRecord>)> {
    let header = MessageHeader::decode(raw)?;
    let empty = raw.payload.is_empty().then_some(SbdRecord::Empty { header });
    Ok((header, empty))
}

fn decode_gyro(
    raw: &RawRecord<u8>,
    _context: &SbdFileHeader,
    state: SbdState,
) -> Result<(SbdRecord, SbdState)> {
    let (header, empty) = message_header(raw)?;
    if let Some(empty) = empty {
        return Ok((empty, state));
    }
    let fields = GYRO_MESSAGE.decode(&raw.payload)?;
    let heading = fields.float("heading")?;
    let record = SbdRecord::Gyro {
        header,
        heading,
        corrected_heading: fields.float("corrected_heading")?,
    };
    Ok((
        record,
        SbdState {
            heading: Some(heading),
            ..state
        },
    ))
}

fn decode_motion(
    raw: &RawRecord<u8>,
    _context: &SbdFileHeader,
    state: SbdState,
) -> Result<(SbdRecord, SbdState)> {
    let (header, empty) = message_header(raw)?;
    if let Some(empty) = empty {
        return Ok((empty, state));
    }
    let fields = MOTION_MESSAGE.decode(&raw.payload)?;
    let record = SbdRecord::Motion {
        header,
        roll: fields.float("roll")?,
        pitch: fields.float("pitch")?,
        heave: fields.float("heave")?,
    };
    Ok((record, state))
}

fn decode_bathy(
    raw: &RawRecord<u8>,
    _context: &SbdFileHeader,
    state: SbdState,
) -> Result<(SbdRecord, SbdState)> {
    let (header, empty) = message_header(raw)?;
    if let Some(empty) = empty {
        return Ok((empty, state));
    }
    let depth = BATHY_MESSAGE.decode(&raw.payload)?.float("depth")?;
    Ok((
        SbdRecord::Bathy { header, depth },
        SbdState {
            depth: Some(depth),
            ..state
        },
    ))
}

fn decode_auxiliary(
    raw: &RawRecord<u8>,
    _context: &SbdFileHeader,
    state: SbdState,
) -> Result<(SbdRecord, SbdState)> {
    let (header, empty) = message_header(raw)?;
    if let Some(empty) = empty {
        return Ok((empty, state));
    }
    let velocity = AUXILIARY_MESSAGE.decode(&raw.payload)?.float("velocity")?;
    Ok((SbdRecord::Auxiliary { header, velocity }, state))
}

fn decode_position(
    raw: &RawRecord<u8>,
    _context: &SbdFileHeader,
    state: SbdState,
) -> Result<(SbdRecord, SbdState)> {
    let (header, empty) = message_header(raw)?;
    if let Some(empty) = empty {
        return Ok((empty, state));
    }
    let fields = POSITION_MESSAGE.decode(&raw.payload)?;
    let (x, y) = (fields.float("easting")?, fields.float("northing")?);
    // NaviScan logs either geographic or projected positions, depending on its setup.
    let position = if x.abs() <= 180.0 && y.abs() <= 90.0 {
        Coordinates::Geographic {
            longitude: x,
            latitude: y,
        }
    } else {
        Coordinates::Grid {
            easting: x,
            northing: y,
        }
    };
    let record = SbdRecord::Position {
        header,
        position,
        heading: state.heading,
        depth: state.depth,
    };
    Ok((record, state))
}

fn decode_echosounder(
    raw: &RawRecord<u8>,
    _context: &SbdFileHeader,
    state: SbdState,
) -> Result<(SbdRecord, SbdState)> {
    let (header, empty) = message_header(raw)?;
    if let Some(empty) = empty {
        return Ok((empty, state));
    }
    let name_length = raw.payload.len().min(4);
    let record = SbdRecord::Echosounder {
        header,
        system: decode_padded_text(&raw.payload[..name_length]),
        data: raw.payload.clone(),
    };
    Ok((record, state))
}

pub struct SbdReader {
    inner: DispatchingReader<Sbd>,
}

impl SbdReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        DispatchingReader::open(path, ()).map(|inner| Self { inner })
    }

    pub fn from_cursor(cursor: ByteCursor) -> Self {
        Self {
            inner: DispatchingReader::from_cursor(cursor, ()),
        }
    }

    pub fn file_header(&self) -> &SbdFileHeader {
        self.inner.context()
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.inner.context().sensors
    }
}

impl FormatReader for SbdReader {
    type Record = SbdRecord;

    delegate! {
        to self.inner {
            fn more_data(&self) -> bool;
            fn read_next_record(&mut self) -> Option<SbdRecord>;
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

    fn sensor_entry(name: &str, category: u8, disabled: bool, serial: bool) -> Vec<u8> {
        let mut out = SENSOR_ENTRY
            .encode(&[
                ("sensor_type", Value::Int(26)),
                ("category", Value::Int(category as i64)),
                ("disabled", Value::Int(disabled as i64)),
                ("name", Value::Bytes(Bytes::copy_from_slice(name.as_bytes()))),
                ("port_type", Value::Int(if serial { 1 } else { 2 })),
            ])
            .unwrap();
        let port = if serial {
            SERIAL_PORT
                .encode(&[
                    ("port", Value::Int(3)),
                    ("baud", Value::Int(9600)),
                    ("latency", Value::Float(0.25)),
                    ("offset_x", Value::Float(1.5)),
                    ("offset_heading", Value::Float(-0.5)),
                ])
                .unwrap()
        } else {
            NETWORK_PORT
                .encode(&[
                    ("port", Value::Int(4001)),
                    ("address", Value::Bytes(Bytes::from_static(&[192, 168, 1, 20]))),
                    ("offset_z", Value::Float(-2.0)),
                ])
                .unwrap()
        };
        out.extend(port);
        out
    }

    /// A file header followed by `entries`, with data starting right after them.
    fn file_header(sensor_count: i64, entries: &[Vec<u8>]) -> Vec<u8> {
        let data_start =
            SENSOR_TABLE_OFFSET as usize + entries.len() * SENSOR_ENTRY_LENGTH as usize;
        let mut out = FILE_HEADER
            .encode(&[
                ("sensor_count", Value::Int(sensor_count)),
                ("data_start", Value::Int(data_start as i64)),
                ("year", Value::Int(2023)),
                ("month", Value::Int(11)),
                ("day", Value::Int(20)),
                ("hour", Value::Int(0)),
                ("minute", Value::Int(23)),
                ("second", Value::Int(8)),
                ("millisecond", Value::Int(500)),
                ("version", Value::Int(4)),
            ])
            .unwrap();
        out.resize(ELLIPSOID_OFFSET as usize, 0);
        out.extend_from_slice(b"WGS84");
        out.resize(PROJECTION_OFFSET as usize, 0);
        out.extend_from_slice(b"UTM 32N");
        out.resize(SENSOR_TABLE_OFFSET as usize, 0);
        for entry in entries {
            out.extend_from_slice(entry);
        }
        out.resize(data_start + DATA_START_ADJUSTMENT as usize, 0);
        out
    }

    fn message(sensor_id: u32, seconds: i64, body: &[u8]) -> Vec<u8> {
        let mut out = MESSAGE_HEADER
            .encode(&[
                ("sensor_id", Value::Int(sensor_id as i64)),
                ("seconds", Value::Int(seconds)),
                ("microseconds", Value::Int(250_000)),
                ("length", Value::Int(body.len() as i64)),
            ])
            .unwrap();
        out.extend_from_slice(body);
        out
    }

    fn gyro(seconds: i64, heading: f64) -> Vec<u8> {
        let body = GYRO_MESSAGE
            .encode(&[
                ("heading", Value::Float(heading)),
                ("corrected_heading", Value::Float(heading + 1.0)),
                ("packet_size", Value::Int(16)),
            ])
            .unwrap();
        message(category::GYRO as u32, seconds, &body)
    }

    fn bathy(seconds: i64, depth: f64) -> Vec<u8> {
        let body = BATHY_MESSAGE
            .encode(&[("depth", Value::Float(depth))])
            .unwrap();
        message(256 + category::BATHY as u32, seconds, &body)
    }

    fn position(seconds: i64, x: f64, y: f64) -> Vec<u8> {
        let mut body = POSITION_MESSAGE
            .encode(&[
                ("easting", Value::Float(x)),
                ("northing", Value::Float(y)),
                ("packet_size", Value::Int(20)),
            ])
            .unwrap();
        // The original sensor string follows.
        body.extend_from_slice(b"$GPGGA,...");
        message(category::POSITION as u32, seconds, &body)
    }

    fn sample_entries() -> Vec<Vec<u8>> {
        vec![
            sensor_entry("NMEA ZDA", 0, false, true),
            sensor_entry("Stbd wheel", 8, true, true),
            sensor_entry("ROV USBL", 8, false, false),
        ]
    }

    #[test]
    fn layouts_cover_the_sensor_entry() {
        assert_eq!(FILE_HEADER.size(), 60);
        assert_eq!(FILE_HEADER.offset_of("sensor_count"), Some(14));
        assert_eq!(FILE_HEADER.offset_of("version"), Some(38));
        assert_eq!(SENSOR_ENTRY.size(), 42);
        assert_eq!(SERIAL_PORT.size() + SENSOR_ENTRY.size(), 256);
        assert_eq!(NETWORK_PORT.size() + SENSOR_ENTRY.size(), 256);
        assert_eq!(SERIAL_PORT.offset_of("offset_x"), Some(26));
        assert_eq!(NETWORK_PORT.offset_of("offset_x"), Some(18));
        assert_eq!(MESSAGE_HEADER.size(), 20);
    }

    #[test]
    fn reads_the_file_header_and_sensor_table() {
        let bytes = file_header(2, &sample_entries());
        let reader = SbdReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert_eq!(reader.state(), ReaderState::HeaderRead);
        let header = reader.file_header();
        assert_eq!(header.version, 4);
        assert_eq!(header.ellipsoid, "WGS84");
        assert_eq!(header.projection, "UTM 32N");
        // 2023-11-20T00:23:08.5Z
        assert_relative_eq!(header.start_time.unwrap(), 1_700_439_788.5);

        let sensors = reader.sensors();
        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[0].name, "NMEA ZDA");
        assert_eq!(sensors[0].port, SensorPort::Serial { port: 3, baud: 9600 });
        assert_relative_eq!(sensors[0].latency, 0.25);
        assert_relative_eq!(sensors[0].offset_x, 1.5);
        assert_relative_eq!(sensors[0].offset_heading, -0.5);
        assert_eq!(sensors[1].index, 2);
        assert_eq!(sensors[1].category, category::POSITION);
        assert_eq!(
            sensors[1].port,
            SensorPort::Network {
                address: Ipv4Addr::new(192, 168, 1, 20),
                port: 4001
            }
        );
        assert_relative_eq!(sensors[1].offset_z, -2.0);
    }

    #[test]
    fn broken_sensor_table_still_opens() {
        // Declares more sensors than the file holds.
        let bytes = file_header(40, &sample_entries());
        let mut reader = SbdReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert_eq!(reader.state(), ReaderState::HeaderRead);
        assert_eq!(reader.sensors().len(), 2);
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Exhausted);
    }

    #[test]
    fn tiny_file_is_corrupt() {
        let reader = SbdReader::from_cursor(ByteCursor::from_bytes(vec![0u8; 30]));
        assert_eq!(reader.state(), ReaderState::Corrupt);
    }

    #[test]
    fn decodes_messages_and_carries_heading_and_depth() {
        let mut bytes = file_header(2, &sample_entries());
        for chunk in [
            position(100, 5.25, 60.5),
            gyro(101, 90.5),
            bathy(101, 42.25),
            message(category::MOTION as u32, 102, &[]),
            message(category::DOPPLER as u32, 102, &[1, 2, 3]),
            position(103, 5.5, 60.75),
            message(category::ECHOSOUNDER as u32, 104, b"BTH0\x01\x02"),
            position(105, 512_345.0, 6_700_000.0),
        ] {
            bytes.extend(chunk);
        }
        let mut reader = SbdReader::from_cursor(ByteCursor::from_bytes(bytes));

        let Some(SbdRecord::Position { heading, depth, .. }) = reader.read_next_record() else {
            panic!("expected a position");
        };
        assert_eq!((heading, depth), (None, None));
        let Some(SbdRecord::Gyro {
            header,
            heading,
            corrected_heading,
        }) = reader.read_next_record()
        else {
            panic!("expected a gyro reading");
        };
        assert_relative_eq!(header.timestamp, 101.25);
        assert_relative_eq!(heading, 90.5);
        assert_relative_eq!(corrected_heading, 91.5);
        let Some(SbdRecord::Bathy { header, depth }) = reader.read_next_record() else {
            panic!("expected a depth");
        };
        assert_eq!(header.sensor_id, 260);
        assert_relative_eq!(depth, 42.25);
        assert!(matches!(reader.read_next_record(), Some(SbdRecord::Empty { .. })));
        assert_eq!(
            reader.read_next_record(),
            Some(SbdRecord::Unsupported {
                category: category::DOPPLER,
                length: 3
            })
        );
        let Some(SbdRecord::Position {
            position,
            heading,
            depth,
            ..
        }) = reader.read_next_record()
        else {
            panic!("expected a position");
        };
        assert_eq!(
            position,
            Coordinates::Geographic {
                longitude: 5.5,
                latitude: 60.75
            }
        );
        assert_eq!(heading, Some(90.5));
        assert_eq!(depth, Some(42.25));
        let Some(SbdRecord::Echosounder { system, data, .. }) = reader.read_next_record() else {
            panic!("expected echosounder data");
        };
        assert_eq!(system, "BTH0");
        assert_eq!(data.len(), 6);
        assert!(matches!(
            reader.read_next_record(),
            Some(SbdRecord::Position {
                position: Coordinates::Grid { .. },
                ..
            })
        ));
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Exhausted);

        let extraction = extract(&mut reader, 0.0);
        assert_eq!(extraction.fixes.len(), 2);
        assert_eq!(extraction.fixes[1].heading, Some(90.5));
        assert_eq!(extraction.fixes[1].flags, category::POSITION as u32);
    }

    #[test]
    fn short_body_is_corrupt() {
        let mut bytes = file_header(0, &[sensor_entry("Gyro", 2, false, true)]);
        bytes.extend(message(category::GYRO as u32, 1, &[0, 0, 0]));
        let mut reader = SbdReader::from_cursor(ByteCursor::from_bytes(bytes));
        assert_eq!(reader.read_next_record(), None);
        assert_eq!(reader.state(), ReaderState::Corrupt);
    }

    #[test]
    fn truncated_file_keeps_earlier_fixes() {
        let mut bytes = file_header(2, &sample_entries());
        for chunk in [
            position(100, 5.25, 60.5),
            gyro(101, 90.5),
            position(102, 5.5, 60.75),
            position(103, 5.75, 61.0),
        ] {
            bytes.extend(chunk);
        }
        bytes.truncate(bytes.len() - 8);
        let mut reader = SbdReader::from_cursor(ByteCursor::from_bytes(bytes));
        let extraction = extract(&mut reader, 0.0);
        assert_eq!(extraction.final_state, ReaderState::Corrupt);
        assert_eq!(extraction.fixes.len(), 2);
        assert_relative_eq!(extraction.fixes[1].longitude, 5.5);
        assert_eq!(extraction.fixes[1].heading, Some(90.5));
        assert_eq!(reader.read_next_record(), None);
    }
}
