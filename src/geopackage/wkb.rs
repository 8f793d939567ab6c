//! GeoPackage geometry blobs: a short binary header followed by little endian WKB.
use super::*;
use byteorder::{LittleEndian, ReadBytesExt};
use bytes::BufMut;
use std::{fmt, io::Cursor};

pub const MAGIC: &[u8; 2] = b"GP";
pub const VERSION: u8 = 0;
/// Little endian, no envelope, not empty.
pub const FLAGS: u8 = 0x01;
pub const HEADER_LENGTH: usize = 8;

const WKB_LITTLE_ENDIAN: u8 = 0x01;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Coord {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
}

impl GeometryType {
    pub fn wkb_code(self) -> u32 {
        match self {
            GeometryType::Point => 1,
            GeometryType::LineString => 2,
            GeometryType::Polygon => 3,
        }
    }

    pub fn from_wkb_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(GeometryType::Point),
            2 => Some(GeometryType::LineString),
            3 => Some(GeometryType::Polygon),
            _ => None,
        }
    }

    /// The name used in `gpkg_geometry_columns` and column declarations.
    pub fn sql_name(self) -> &'static str {
        match self {
            GeometryType::Point => "POINT",
            GeometryType::LineString => "LINESTRING",
            GeometryType::Polygon => "POLYGON",
        }
    }
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

/// A feature geometry.
///
/// Polygons have exactly one ring. The ring is closed on encoding if its last vertex differs
/// from its first.
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Coord>),
}

impl Geometry {
    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Geometry::Point(_) => GeometryType::Point,
            Geometry::LineString(_) => GeometryType::LineString,
            Geometry::Polygon(_) => GeometryType::Polygon,
        }
    }

    pub fn vertices(&self) -> &[Coord] {
        match self {
            Geometry::Point(coord) => std::slice::from_ref(coord),
            Geometry::LineString(coords) | Geometry::Polygon(coords) => coords,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vertices().is_empty()
    }

    /// Append the WKB form of this geometry to `out`.
    pub fn write_wkb(&self, out: &mut Vec<u8>) {
        out.put_u8(WKB_LITTLE_ENDIAN);
        out.put_u32_le(self.geometry_type().wkb_code());
        match self {
            Geometry::Point(coord) => put_coord(out, coord),
            Geometry::LineString(coords) => {
                out.put_u32_le(coords.len() as u32);
                coords.iter().for_each(|c| put_coord(out, c));
            }
            Geometry::Polygon(coords) => {
                let closing = match (coords.first(), coords.last()) {
                    (Some(first), Some(last)) if first != last => Some(*first),
                    _ => None,
                };
                out.put_u32_le(1);
                out.put_u32_le((coords.len() + closing.iter().count()) as u32);
                coords.iter().chain(closing.iter()).for_each(|c| put_coord(out, c));
            }
        }
    }

    /// The complete GeoPackage blob for this geometry in `srs_id`.
    pub fn to_blob(&self, srs_id: i32) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH + 9 + 16 * self.vertices().len() + 16);
        out.put_slice(MAGIC);
        out.put_u8(VERSION);
        out.put_u8(FLAGS);
        out.put_i32_le(srs_id);
        self.write_wkb(&mut out);
        out
    }

    /// Parse a blob written by [[Geometry::to_blob]], returning the srs id and the geometry.
    pub fn from_blob(blob: &[u8]) -> Result<(i32, Geometry)> {
        ensure!(
            blob.len() >= HEADER_LENGTH && &blob[..2] == MAGIC,
            InvalidBlobSnafu {
                description: "missing GP header",
            }
        );
        ensure!(
            blob[3] & 0x01 == 0x01 && blob[3] & 0x0E == 0,
            InvalidBlobSnafu {
                description: format!("unsupported flags {:#04x}", blob[3]),
            }
        );
        let mut cursor = Cursor::new(&blob[4..]);
        let srs_id = cursor.read_i32::<LittleEndian>().context(BlobIoSnafu)?;
        let geometry = read_wkb(&mut cursor)?;
        Ok((srs_id, geometry))
    }
}

fn put_coord(out: &mut Vec<u8>, coord: &Coord) {
    out.put_f64_le(coord.x);
    out.put_f64_le(coord.y);
}

fn read_coord(cursor: &mut Cursor<&[u8]>) -> Result<Coord> {
    let x = cursor.read_f64::<LittleEndian>().context(BlobIoSnafu)?;
    let y = cursor.read_f64::<LittleEndian>().context(BlobIoSnafu)?;
    Ok(Coord { x, y })
}

fn read_coords(cursor: &mut Cursor<&[u8]>) -> Result<Vec<Coord>> {
    let count = cursor.read_u32::<LittleEndian>().context(BlobIoSnafu)? as usize;
    let available = (cursor.get_ref().len() as u64).saturating_sub(cursor.position()) as usize;
    ensure!(
        count.saturating_mul(16) <= available,
        InvalidBlobSnafu {
            description: format!("{count} vertices do not fit in {available} bytes"),
        }
    );
    (0..count).map(|_| read_coord(cursor)).collect()
}

fn read_wkb(cursor: &mut Cursor<&[u8]>) -> Result<Geometry> {
    let order = cursor.read_u8().context(BlobIoSnafu)?;
    ensure!(
        order == WKB_LITTLE_ENDIAN,
        InvalidBlobSnafu {
            description: "big endian WKB",
        }
    );
    let code = cursor.read_u32::<LittleEndian>().context(BlobIoSnafu)?;
    let Some(geometry_type) = GeometryType::from_wkb_code(code) else {
        whatever!("Unsupported WKB geometry type {code}");
    };
    match geometry_type {
        GeometryType::Point => read_coord(cursor).map(Geometry::Point),
        GeometryType::LineString => read_coords(cursor).map(Geometry::LineString),
        GeometryType::Polygon => {
            let rings = cursor.read_u32::<LittleEndian>().context(BlobIoSnafu)?;
            ensure!(
                rings == 1,
                InvalidBlobSnafu {
                    description: format!("polygon with {rings} rings"),
                }
            );
            read_coords(cursor).map(Geometry::Polygon)
        }
    }
}
