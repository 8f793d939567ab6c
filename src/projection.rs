//! Conversion of navigation fixes into output coordinates.
use crate::geopackage::{Coord, SpatialRefSys};
use geographiclib_rs::{Geodesic, InverseGeodesic};

/// Maps geographic WGS 84 positions into the coordinate system of the output tables.
pub trait ProjectionService: Send + Sync {
    /// The coordinate system that [[ProjectionService::convert_to_grid]] produces.
    fn spatial_ref_sys(&self) -> SpatialRefSys;

    fn convert_to_grid(&self, longitude: f64, latitude: f64) -> Coord;

    fn srs_id(&self) -> i32 {
        self.spatial_ref_sys().srs_id
    }
}

/// Keeps longitude and latitude as they are (EPSG:4326).
#[derive(Clone, Copy, Debug, Default)]
pub struct Wgs84Geographic;

impl ProjectionService for Wgs84Geographic {
    fn spatial_ref_sys(&self) -> SpatialRefSys {
        SpatialRefSys::WGS84
    }

    fn convert_to_grid(&self, longitude: f64, latitude: f64) -> Coord {
        Coord::new(longitude, latitude)
    }
}

/// The projection for an EPSG code, if it is one we can produce.
pub fn for_epsg(epsg: i32) -> Option<Box<dyn ProjectionService>> {
    match epsg {
        4326 => Some(Box::new(Wgs84Geographic)),
        _ => None,
    }
}

/// Length in metres of the path through `points` (longitude, latitude) on the WGS 84 ellipsoid.
pub fn geodesic_length<I>(points: I) -> f64
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let g = Geodesic::wgs84();
    let mut total = 0.0;
    let mut previous: Option<(f64, f64)> = None;
    for (lon, lat) in points {
        if let Some((prev_lon, prev_lat)) = previous {
            let distance_m: f64 = g.inverse(prev_lat, prev_lon, lat, lon);
            total += distance_m;
        }
        previous = Some((lon, lat));
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn geographic_is_identity() {
        let projection = for_epsg(4326).unwrap();
        assert_eq!(projection.srs_id(), 4326);
        assert_eq!(
            projection.convert_to_grid(151.2, -33.9),
            Coord::new(151.2, -33.9)
        );
        assert!(for_epsg(32756).is_none());
    }

    #[test]
    fn lengths_along_the_equator() {
        // One degree of longitude on the equator is a fixed fraction of the WGS 84 equator.
        let one_degree = 6_378_137.0 * std::f64::consts::PI / 180.0;
        assert_relative_eq!(
            geodesic_length([(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]),
            2.0 * one_degree,
            max_relative = 1e-9
        );
        assert_eq!(geodesic_length([(5.0, 5.0)]), 0.0);
        assert_eq!(geodesic_length(Vec::new()), 0.0);
    }
}
