//! Generic Sensor Format (GSF) swath bathymetry files.
//!
//! All values are big endian. A record is an 8 byte header (`size`, `id`) followed by `size`
//! payload bytes. If bit 31 of `id` is set, a 4 byte checksum sits between header and payload.
//! Swath pings carry per-beam arrays as sub-records whose integer values are turned into physical
//! units with scale factors. Scale factors are only transmitted when they change, so they are part
//! of the decoder state that flows from one ping to the next.
use super::{
    layout::{Endian, FieldSpec, FieldType, Fields, Layout},
    *,
};
use crate::navigation::{NavigationFix, NavigationRecord};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use delegate::delegate;
use std::{collections::BTreeMap, io::Cursor};

pub mod record_id {
    pub const HEADER: u32 = 1;
    pub const SWATH_BATHYMETRY_PING: u32 = 2;
    pub const SOUND_VELOCITY_PROFILE: u32 = 3;
    pub const PROCESSING_PARAMETERS: u32 = 4;
    pub const SENSOR_PARAMETERS: u32 = 5;
    pub const COMMENT: u32 = 6;
    pub const HISTORY: u32 = 7;
    pub const NAVIGATION_ERROR: u32 = 8;
    pub const SWATH_BATHY_SUMMARY: u32 = 9;
    pub const SINGLE_BEAM_PING: u32 = 10;
    pub const HV_NAVIGATION_ERROR: u32 = 11;
    pub const ATTITUDE: u32 = 12;
}

/// Sub-record id of the scale factor table inside a ping.
pub const SCALE_FACTORS_SUBRECORD: u8 = 100;
/// Sub-record id of the per-beam intensity time series, which is never decoded here.
pub const INTENSITY_SERIES_SUBRECORD: u8 = 21;

/// Added to a beam's quality factor when its angle is outside the polar clip.
pub const REJECT_CLIP: f64 = -1.0;
/// Added to a beam's quality factor when its travel time is too short.
pub const REJECT_RANGE: f64 = -2.0;
/// Added to a beam's quality factor when its amplitude is too low.
pub const REJECT_INTENSITY: f64 = -4.0;

const CHECKSUM_FLAG: u32 = 0x8000_0000;
const RESERVED_BITS: u32 = 0x7FC0_0000;
const RECORD_ID_MASK: u32 = 0x003F_FFFF;

static RECORD_HEADER: Layout = Layout::new(
    "GSF record header",
    Endian::Big,
    &[
        FieldSpec::new("data_size", FieldType::U32),
        FieldSpec::new("record_id", FieldType::U32),
    ],
);

static PING_HEADER: Layout = Layout::new(
    "GSF swath bathymetry ping header",
    Endian::Big,
    &[
        FieldSpec::new("time", FieldType::I32),
        FieldSpec::new("nanoseconds", FieldType::I32),
        FieldSpec::scaled("longitude", FieldType::I32, 1.0e-7),
        FieldSpec::scaled("latitude", FieldType::I32, 1.0e-7),
        FieldSpec::new("number_beams", FieldType::I16),
        FieldSpec::new("centre_beam", FieldType::I16),
        FieldSpec::new("ping_flags", FieldType::U16),
        FieldSpec::pad(2),
        FieldSpec::scaled("tide_corrector", FieldType::I16, 0.01),
        FieldSpec::scaled("depth_corrector", FieldType::I32, 0.01),
        FieldSpec::scaled("heading", FieldType::U16, 0.01),
        FieldSpec::scaled("pitch", FieldType::I16, 0.01),
        FieldSpec::scaled("roll", FieldType::I16, 0.01),
        FieldSpec::scaled("heave", FieldType::I16, 0.01),
        FieldSpec::scaled("course", FieldType::U16, 0.01),
        FieldSpec::scaled("speed", FieldType::U16, 0.01),
        FieldSpec::scaled("height", FieldType::I32, 0.01),
        FieldSpec::scaled("separation", FieldType::I32, 0.01),
        FieldSpec::scaled("gps_tide_corrector", FieldType::I32, 0.01),
        FieldSpec::pad(2),
    ],
);

static SUMMARY: Layout = Layout::new(
    "GSF swath bathymetry summary",
    Endian::Big,
    &[
        FieldSpec::new("begin_time", FieldType::I32),
        FieldSpec::new("begin_nanoseconds", FieldType::I32),
        FieldSpec::new("end_time", FieldType::I32),
        FieldSpec::new("end_nanoseconds", FieldType::I32),
        FieldSpec::scaled("min_latitude", FieldType::I32, 1.0e-7),
        FieldSpec::scaled("min_longitude", FieldType::I32, 1.0e-7),
        FieldSpec::scaled("max_latitude", FieldType::I32, 1.0e-7),
        FieldSpec::scaled("max_longitude", FieldType::I32, 1.0e-7),
        FieldSpec::scaled("min_depth", FieldType::I32, 0.01),
        FieldSpec::scaled("max_depth", FieldType::I32, 0.01),
    ],
);

static COMMENT: Layout = Layout::new(
    "GSF comment",
    Endian::Big,
    &[
        FieldSpec::new("time", FieldType::I32),
        FieldSpec::new("nanoseconds", FieldType::I32),
        FieldSpec::new("text_length", FieldType::I32),
    ],
);

static ATTITUDE: Layout = Layout::new(
    "GSF attitude",
    Endian::Big,
    &[
        FieldSpec::new("time", FieldType::I32),
        FieldSpec::new("nanoseconds", FieldType::I32),
        FieldSpec::new("measurements", FieldType::U16),
    ],
);

static SOUND_VELOCITY_PROFILE: Layout = Layout::new(
    "GSF sound velocity profile",
    Endian::Big,
    &[
        FieldSpec::new("observation_time", FieldType::I32),
        FieldSpec::new("observation_nanoseconds", FieldType::I32),
        FieldSpec::new("application_time", FieldType::I32),
        FieldSpec::new("application_nanoseconds", FieldType::I32),
        FieldSpec::scaled("longitude", FieldType::I32, 1.0e-7),
        FieldSpec::scaled("latitude", FieldType::I32, 1.0e-7),
        FieldSpec::new("points", FieldType::I32),
    ],
);

fn seconds(fields: &Fields, time: &str, nanos: &str) -> Result<f64> {
    Ok(fields.int(time)? as f64 + fields.int(nanos)? as f64 / 1.0e9)
}

pub struct GsfHeaderReader;

impl DatagramHeaderReader for GsfHeaderReader {
    type Tag = u32;

    const HEADER_LENGTH: usize = 8;

    fn parse_header(&self, bytes: &[u8], position: u64) -> Result<DatagramHeader<u32>> {
        let fields = RECORD_HEADER.decode(bytes)?;
        let size = fields.int("data_size")? as u32;
        let id = fields.int("record_id")? as u32;
        ensure!(
            id & RESERVED_BITS == 0,
            CorruptHeaderSnafu {
                description: format!("reserved bits set in record id {id:#010x}"),
                position,
            }
        );
        let checksum = if id & CHECKSUM_FLAG != 0 {
            Checksum::Leading
        } else {
            Checksum::Absent
        };
        Ok(DatagramHeader {
            tag: id & RECORD_ID_MASK,
            header_length: Self::HEADER_LENGTH as u8,
            payload_length: size,
            checksum,
            trailer_length: 0,
        })
    }
}

/// How the offset of a scale factor enters the beam value equation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OffsetConvention {
    /// `value = raw / multiplier - offset`
    #[default]
    Subtract,
    /// `value = raw / multiplier + offset`
    Add,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PingDecoding {
    #[default]
    Full,
    /// Only the fixed ping header. Scale factors are still tracked.
    HeaderOnly,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GsfOptions {
    pub ping_decoding: PingDecoding,
    pub offset_convention: OffsetConvention,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleFactor {
    pub subrecord_id: u8,
    pub compression_flag: u8,
    pub multiplier: f64,
    pub offset: f64,
}

impl ScaleFactor {
    /// Bytes per beam value as announced by the compression flag, if it announces one.
    pub fn field_width(&self) -> Option<usize> {
        match self.compression_flag & 0xF0 {
            0x10 => Some(1),
            0x20 => Some(2),
            0x40 => Some(4),
            _ => None,
        }
    }

    pub fn decode(&self, raw: i64, convention: OffsetConvention) -> f64 {
        let scaled = raw as f64 / self.multiplier;
        match convention {
            OffsetConvention::Subtract => scaled - self.offset,
            OffsetConvention::Add => scaled + self.offset,
        }
    }

    /// Inverse of [[ScaleFactor::decode]], before rounding to an integer.
    pub fn encode(&self, value: f64, convention: OffsetConvention) -> f64 {
        match convention {
            OffsetConvention::Subtract => (value + self.offset) * self.multiplier,
            OffsetConvention::Add => (value - self.offset) * self.multiplier,
        }
    }
}

pub type ScaleFactorTable = BTreeMap<u8, ScaleFactor>;

/// The per-beam arrays of a swath ping that are decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BeamArray {
    Depth,
    AcrossTrack,
    AlongTrack,
    TravelTime,
    BeamAngle,
    MeanCalAmplitude,
    MeanRelAmplitude,
    EchoWidth,
    QualityFactor,
    ReceiveHeave,
    DepthError,
    AcrossTrackError,
    AlongTrackError,
    NominalDepth,
    QualityFlags,
    BeamFlags,
    SignalToNoise,
    BeamAngleForward,
    VerticalError,
    HorizontalError,
    SectorNumber,
    DetectionInfo,
}

/// Sub-record id, array and whether its raw values are signed.
const BEAM_ARRAYS: [(u8, BeamArray, bool); 22] = [
    (1, BeamArray::Depth, false),
    (2, BeamArray::AcrossTrack, true),
    (3, BeamArray::AlongTrack, true),
    (4, BeamArray::TravelTime, false),
    (5, BeamArray::BeamAngle, true),
    (6, BeamArray::MeanCalAmplitude, true),
    (7, BeamArray::MeanRelAmplitude, false),
    (8, BeamArray::EchoWidth, false),
    (9, BeamArray::QualityFactor, false),
    (10, BeamArray::ReceiveHeave, true),
    (11, BeamArray::DepthError, false),
    (12, BeamArray::AcrossTrackError, false),
    (13, BeamArray::AlongTrackError, false),
    (14, BeamArray::NominalDepth, false),
    (15, BeamArray::QualityFlags, false),
    (16, BeamArray::BeamFlags, false),
    (17, BeamArray::SignalToNoise, true),
    (18, BeamArray::BeamAngleForward, false),
    (19, BeamArray::VerticalError, false),
    (20, BeamArray::HorizontalError, false),
    (22, BeamArray::SectorNumber, false),
    (23, BeamArray::DetectionInfo, false),
];

impl BeamArray {
    pub fn from_subrecord_id(id: u8) -> Option<(Self, bool)> {
        BEAM_ARRAYS
            .iter()
            .find(|(array_id, _, _)| *array_id == id)
            .map(|(_, array, signed)| (*array, *signed))
    }

    pub fn subrecord_id(self) -> u8 {
        BEAM_ARRAYS
            .iter()
            .find(|(_, array, _)| *array == self)
            .map(|(id, _, _)| *id)
            .unwrap_or_default()
    }

    pub fn is_signed(self) -> bool {
        BEAM_ARRAYS
            .iter()
            .any(|(_, array, signed)| *array == self && *signed)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PingHeader {
    pub timestamp: f64,
    pub longitude: f64,
    pub latitude: f64,
    pub number_beams: u16,
    pub centre_beam: i16,
    pub ping_flags: u16,
    pub tide_corrector: f64,
    pub depth_corrector: f64,
    pub heading: f64,
    pub pitch: f64,
    pub roll: f64,
    pub heave: f64,
    pub course: f64,
    pub speed: f64,
    pub height: f64,
    pub separation: f64,
    pub gps_tide_corrector: f64,
}

impl PingHeader {
    fn from_fields(fields: &Fields, position: u64) -> Result<Self> {
        let number_beams = fields.int("number_beams")?;
        ensure!(
            number_beams >= 0,
            CorruptHeaderSnafu {
                description: format!("negative beam count {number_beams}"),
                position,
            }
        );
        Ok(Self {
            timestamp: seconds(fields, "time", "nanoseconds")?,
            longitude: fields.float("longitude")?,
            latitude: fields.float("latitude")?,
            number_beams: number_beams as u16,
            centre_beam: fields.int("centre_beam")? as i16,
            ping_flags: fields.int("ping_flags")? as u16,
            tide_corrector: fields.float("tide_corrector")?,
            depth_corrector: fields.float("depth_corrector")?,
            heading: fields.float("heading")?,
            pitch: fields.float("pitch")?,
            roll: fields.float("roll")?,
            heave: fields.float("heave")?,
            course: fields.float("course")?,
            speed: fields.float("speed")?,
            height: fields.float("height")?,
            separation: fields.float("separation")?,
            gps_tide_corrector: fields.float("gps_tide_corrector")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwathPing {
    pub header: PingHeader,
    pub arrays: BTreeMap<BeamArray, Vec<f64>>,
    /// Sub-records that were present but not decoded.
    pub skipped_subrecords: Vec<u8>,
}

impl SwathPing {
    pub fn array(&self, array: BeamArray) -> Option<&[f64]> {
        self.arrays.get(&array).map(Vec::as_slice)
    }

    pub fn depths(&self) -> Option<&[f64]> {
        self.array(BeamArray::Depth)
    }

    /// Reject beams whose angle is at or beyond `left` or `right` degrees.
    pub fn clip_polar(&mut self, left: f64, right: f64) -> usize {
        self.reject(BeamArray::BeamAngle, REJECT_CLIP, |angle| {
            angle <= left || angle >= right
        })
    }

    /// Reject beams with a two way travel time at or below `minimum` seconds.
    pub fn clip_travel_time(&mut self, minimum: f64) -> usize {
        self.reject(BeamArray::TravelTime, REJECT_RANGE, |t| t <= minimum)
    }

    /// Reject beams with a mean relative amplitude at or below `minimum`.
    pub fn clip_intensity(&mut self, minimum: f64) -> usize {
        self.reject(BeamArray::MeanRelAmplitude, REJECT_INTENSITY, |a| {
            a <= minimum
        })
    }

    /// Add `code` to the quality factor of every beam where `test` holds on `source`.
    /// Codes accumulate, so several reasons stay distinguishable.
    fn reject(&mut self, source: BeamArray, code: f64, test: impl Fn(f64) -> bool) -> usize {
        if self.header.number_beams == 0 {
            return 0;
        }
        let travel_times = self.arrays.get(&BeamArray::TravelTime).map_or(0, Vec::len);
        let quality_len = self.arrays.get(&BeamArray::QualityFactor).map_or(0, Vec::len);
        if quality_len != travel_times {
            return 0;
        }
        let hits: Vec<usize> = match self.arrays.get(&source) {
            Some(values) => values
                .iter()
                .enumerate()
                .filter(|(_, v)| test(**v))
                .map(|(i, _)| i)
                .collect(),
            None => return 0,
        };
        let Some(quality) = self.arrays.get_mut(&BeamArray::QualityFactor) else {
            return 0;
        };
        let mut touched = 0;
        for i in hits {
            if let Some(q) = quality.get_mut(i) {
                *q += code;
                touched += 1;
            }
        }
        touched
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwathSummary {
    pub begin_time: f64,
    pub end_time: f64,
    pub min_latitude: f64,
    pub min_longitude: f64,
    pub max_latitude: f64,
    pub max_longitude: f64,
    pub min_depth: f64,
    pub max_depth: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AttitudeSample {
    pub timestamp: f64,
    pub pitch: f64,
    pub roll: f64,
    pub heave: f64,
    pub heading: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SoundVelocityProfile {
    pub observation_time: f64,
    pub application_time: f64,
    pub longitude: f64,
    pub latitude: f64,
    /// `(depth m, sound speed m/s)` pairs.
    pub points: Vec<(f64, f64)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GsfRecord {
    Header { version: String },
    SwathPing(Box<SwathPing>),
    SoundVelocityProfile(SoundVelocityProfile),
    Comment { timestamp: f64, text: String },
    Summary(SwathSummary),
    Attitude(Vec<AttitudeSample>),
    Unsupported { record_id: u32, length: u32 },
}

impl NavigationRecord for GsfRecord {
    fn navigation_fix(&self) -> Option<NavigationFix> {
        match self {
            GsfRecord::SwathPing(ping) => {
                let h = &ping.header;
                Some(
                    NavigationFix::new(h.timestamp, h.longitude, h.latitude)
                        .with_depth(h.height)
                        .with_heading(h.heading)
                        .with_flags(h.ping_flags as u32),
                )
            }
            _ => None,
        }
    }
}

/// Decoder state carried from record to record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GsfState {
    /// The most recently transmitted scale factors.
    pub scale_factors: ScaleFactorTable,
    pub pings: u64,
}

pub struct Gsf;

impl RecordFormat for Gsf {
    type HeaderReader = GsfHeaderReader;
    type Options = GsfOptions;
    type Context = GsfOptions;
    type State = GsfState;
    type Record = GsfRecord;

    const NAME: &'static str = "GSF";

    fn open_stream(cursor: &ByteCursor, options: GsfOptions) -> Result<OpenedStream<Self>> {
        if let Some(first) = GsfHeaderReader.peek_header(cursor)? {
            ensure!(
                first.tag == record_id::HEADER,
                CorruptHeaderSnafu {
                    description: format!(
                        "file starts with record {} instead of a GSF header",
                        first.tag
                    ),
                    position: cursor.tell(),
                }
            );
        }
        Ok(OpenedStream {
            header_reader: GsfHeaderReader,
            context: options,
            data_start: cursor.tell(),
        })
    }

    fn register(registry: &mut DecoderRegistry<Self>) {
        registry.register(record_id::HEADER, decode_header);
        registry.register(record_id::SWATH_BATHYMETRY_PING, decode_ping);
        registry.register(record_id::SOUND_VELOCITY_PROFILE, decode_svp);
        registry.register(record_id::COMMENT, decode_comment);
        registry.register(record_id::SWATH_BATHY_SUMMARY, decode_summary);
        registry.register(record_id::ATTITUDE, decode_attitude);
    }

    fn unsupported(raw: &RawRecord<u32>) -> GsfRecord {
        GsfRecord::Unsupported {
            record_id: raw.header.tag,
            length: raw.header.payload_length,
        }
    }
}

fn decode_header(
    raw: &RawRecord<u32>,
    _options: &GsfOptions,
    state: GsfState,
) -> Result<(GsfRecord, GsfState)> {
    let end = raw.payload.len().min(12);
    let version = decode_padded_text(&raw.payload[..end]);
    log::debug!("GSF version {version}");
    Ok((GsfRecord::Header { version }, state))
}

fn decode_ping(
    raw: &RawRecord<u32>,
    options: &GsfOptions,
    mut state: GsfState,
) -> Result<(GsfRecord, GsfState)> {
    let fields = PING_HEADER.decode(&raw.payload)?;
    let header = PingHeader::from_fields(&fields, raw.start)?;
    let mut ping = SwathPing {
        header,
        arrays: BTreeMap::new(),
        skipped_subrecords: Vec::new(),
    };
    let mut offset = PING_HEADER.size();
    let payload = &raw.payload[..];
    // Anything shorter than a sub-record header is padding.
    while payload.len() - offset >= 4 {
        let word = BigEndian::read_u32(&payload[offset..]);
        let id = (word >> 24) as u8;
        let size = (word & 0x00FF_FFFF) as usize;
        let body_start = offset + 4;
        ensure!(
            size <= payload.len() - body_start,
            TruncatedInputSnafu {
                needed: size as u64,
                remaining: (payload.len() - body_start) as u64,
                position: raw.start + raw.header.payload_offset() + body_start as u64,
            }
        );
        let body = &payload[body_start..body_start + size];
        if id == SCALE_FACTORS_SUBRECORD {
            // Ids missing from this table keep their previous factors.
            state.scale_factors.extend(read_scale_factors(body)?);
        } else if options.ping_decoding == PingDecoding::Full {
            decode_beam_subrecord(&mut ping, id, body, &state.scale_factors, options);
        }
        // Trust the declared size, not what was consumed.
        offset = body_start + size;
    }
    state.pings += 1;
    Ok((GsfRecord::SwathPing(Box::new(ping)), state))
}

fn read_scale_factors(body: &[u8]) -> Result<ScaleFactorTable> {
    let mut reader = Cursor::new(body);
    let count = reader.read_i32::<BigEndian>().context(IoSnafu)?;
    ensure!(
        count >= 0 && 4 + count as usize * 12 <= body.len(),
        CorruptHeaderSnafu {
            description: format!(
                "{count} scale factors do not fit into {} bytes",
                body.len()
            ),
            position: 0u64,
        }
    );
    let mut table = ScaleFactorTable::new();
    for _ in 0..count {
        let word = reader.read_u32::<BigEndian>().context(IoSnafu)?;
        let multiplier = reader.read_i32::<BigEndian>().context(IoSnafu)?;
        let offset = reader.read_i32::<BigEndian>().context(IoSnafu)?;
        let subrecord_id = (word >> 24) as u8;
        if multiplier == 0 {
            log::warn!(
                "Ignoring scale factor for sub-record {subrecord_id} with a zero multiplier"
            );
            continue;
        }
        table.insert(
            subrecord_id,
            ScaleFactor {
                subrecord_id,
                compression_flag: ((word >> 16) & 0xFF) as u8,
                multiplier: multiplier as f64,
                offset: offset as f64,
            },
        );
    }
    Ok(table)
}

fn decode_beam_subrecord(
    ping: &mut SwathPing,
    id: u8,
    body: &[u8],
    scale_factors: &ScaleFactorTable,
    options: &GsfOptions,
) {
    let number_beams = ping.header.number_beams as usize;
    let decodable = BeamArray::from_subrecord_id(id)
        .zip(scale_factors.get(&id))
        .filter(|_| number_beams > 0);
    let Some(((array, signed), scale_factor)) = decodable else {
        ping.skipped_subrecords.push(id);
        return;
    };
    let width = scale_factor
        .field_width()
        .unwrap_or(body.len() / number_beams);
    match read_beam_values(body, number_beams, width, signed) {
        Some(raw) => {
            let values = raw
                .into_iter()
                .map(|v| scale_factor.decode(v, options.offset_convention))
                .collect();
            ping.arrays.insert(array, values);
        }
        None => {
            log::warn!(
                "Skipping {array:?}: {number_beams} beams of {width} bytes \
                 do not fit into {} bytes",
                body.len()
            );
            ping.skipped_subrecords.push(id);
        }
    }
}

fn read_beam_values(body: &[u8], count: usize, width: usize, signed: bool) -> Option<Vec<i64>> {
    if !matches!(width, 1 | 2 | 4) || count * width > body.len() {
        return None;
    }
    let mut reader = Cursor::new(body);
    (0..count)
        .map(|_| {
            let value = match (width, signed) {
                (1, false) => reader.read_u8().map(i64::from),
                (1, true) => reader.read_i8().map(i64::from),
                (2, false) => reader.read_u16::<BigEndian>().map(i64::from),
                (2, true) => reader.read_i16::<BigEndian>().map(i64::from),
                (_, false) => reader.read_u32::<BigEndian>().map(i64::from),
                (_, true) => reader.read_i32::<BigEndian>().map(i64::from),
            };
            value.ok()
        })
        .collect()
}

fn decode_svp(
    raw: &RawRecord<u32>,
    _options: &GsfOptions,
    state: GsfState,
) -> Result<(GsfRecord, GsfState)> {
    let fields = SOUND_VELOCITY_PROFILE.decode(&raw.payload)?;
    let count = fields.int("points")?.max(0) as usize;
    let body = &raw.payload[SOUND_VELOCITY_PROFILE.size()..];
    ensure!(
        count * 8 <= body.len(),
        TruncatedInputSnafu {
            needed: (count * 8) as u64,
            remaining: body.len() as u64,
            position: raw.start,
        }
    );
    let mut reader = Cursor::new(body);
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let depth = reader.read_i32::<BigEndian>().context(IoSnafu)?;
        let speed = reader.read_i32::<BigEndian>().context(IoSnafu)?;
        points.push((depth as f64 / 100.0, speed as f64 / 100.0));
    }
    let profile = SoundVelocityProfile {
        observation_time: seconds(&fields, "observation_time", "observation_nanoseconds")?,
        application_time: seconds(&fields, "application_time", "application_nanoseconds")?,
        longitude: fields.float("longitude")?,
        latitude: fields.float("latitude")?,
        points,
    };
    Ok((GsfRecord::SoundVelocityProfile(profile), state))
}

fn decode_comment(
    raw: &RawRecord<u32>,
    _options: &GsfOptions,
    state: GsfState,
) -> Result<(GsfRecord, GsfState)> {
    let fields = COMMENT.decode(&raw.payload)?;
    let start = COMMENT.size();
    let length = (fields.int("text_length")?.max(0) as usize).min(raw.payload.len() - start);
    let text = String::from_utf8_lossy(&raw.payload[start..start + length])
        .trim_end_matches('\0')
        .to_string();
    Ok((
        GsfRecord::Comment {
            timestamp: seconds(&fields, "time", "nanoseconds")?,
            text,
        },
        state,
    ))
}

fn decode_summary(
    raw: &RawRecord<u32>,
    _options: &GsfOptions,
    state: GsfState,
) -> Result<(GsfRecord, GsfState)> {
    let fields = SUMMARY.decode(&raw.payload)?;
    let summary = SwathSummary {
        begin_time: seconds(&fields, "begin_time", "begin_nanoseconds")?,
        end_time: seconds(&fields, "end_time", "end_nanoseconds")?,
        min_latitude: fields.float("min_latitude")?,
        min_longitude: fields.float("min_longitude")?,
        max_latitude: fields.float("max_latitude")?,
        max_longitude: fields.float("max_longitude")?,
        min_depth: fields.float("min_depth")?,
        max_depth: fields.float("max_depth")?,
    };
    Ok((GsfRecord::Summary(summary), state))
}

fn decode_attitude(
    raw: &RawRecord<u32>,
    _options: &GsfOptions,
    state: GsfState,
) -> Result<(GsfRecord, GsfState)> {
    let fields = ATTITUDE.decode(&raw.payload)?;
    let base = seconds(&fields, "time", "nanoseconds")?;
    let count = fields.int("measurements")? as usize;
    let body = &raw.payload[ATTITUDE.size()..];
    ensure!(
        count * 10 <= body.len(),
        TruncatedInputSnafu {
            needed: (count * 10) as u64,
            remaining: body.len() as u64,
            position: raw.start,
        }
    );
    let mut reader = Cursor::new(body);
    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        let mut values = [0i16; 5];
        reader
            .read_i16_into::<BigEndian>(&mut values)
            .context(IoSnafu)?;
        samples.push(AttitudeSample {
            // Offsets from the base time are in milliseconds.
            timestamp: base + values[0] as f64 / 1000.0,
            pitch: values[1] as f64 / 100.0,
            roll: values[2] as f64 / 100.0,
            heave: values[3] as f64 / 100.0,
            heading: values[4] as u16 as f64 / 100.0,
        });
    }
    Ok((GsfRecord::Attitude(samples), state))
}

/// Reader for GSF files.
pub struct GsfReader {
    inner: DispatchingReader<Gsf>,
}

impl GsfReader {
    pub fn open<P: AsRef<Path>>(path: P, options: GsfOptions) -> Result<Self> {
        DispatchingReader::open(path, options).map(|inner| Self { inner })
    }

    pub fn from_cursor(cursor: ByteCursor, options: GsfOptions) -> Self {
        Self {
            inner: DispatchingReader::from_cursor(cursor, options),
        }
    }

    pub fn options(&self) -> &GsfOptions {
        self.inner.context()
    }

    /// The scale factors in effect after the last decoded ping.
    pub fn scale_factors(&self) -> &ScaleFactorTable {
        &self.inner.decode_state().scale_factors
    }

    /// Read ahead until the first scale factor table is known, then go back to the start.
    ///
    /// Useful before decoding pings out of order, since a file's first ping is not guaranteed to
    /// carry a table.
    pub fn prime_scale_factors(&mut self) -> bool {
        self.inner.rewind();
        while self.scale_factors().is_empty() {
            if self.inner.read_next_record().is_none() {
                break;
            }
        }
        self.inner.rewind();
        !self.scale_factors().is_empty()
    }
}

impl FormatReader for GsfReader {
    type Record = GsfRecord;

    delegate! {
        to self.inner {
            fn more_data(&self) -> bool;
            fn read_next_record(&mut self) -> Option<GsfRecord>;
            fn rewind(&mut self);
            fn state(&self) -> ReaderState;
        }
    }
}
