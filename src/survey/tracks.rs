//! The `SurveyTrackLine` and `SurveyTrackPoint` tables.
use super::*;
use crate::{
    geopackage::{
        ContainerError,
        Coord,
        Envelope,
        FieldDef,
        FieldKind,
        FieldValue,
        GeoPackage,
        Geometry,
        GeometryType,
        TableHandle,
    },
    navigation::{Decimator, NavigationFix},
    projection::{geodesic_length, ProjectionService},
};
use chrono::{DateTime, Utc};

pub const TRACK_LINE_TABLE: &str = "SurveyTrackLine";
pub const TRACK_POINT_TABLE: &str = "SurveyTrackPoint";

/// Attribute values of the track tables that do not come from the data files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackAttributes {
    pub last_update_by: String,
    pub survey_id: Option<i64>,
    pub survey_id_ref: Option<String>,
    pub remarks: Option<String>,
    pub line_id: Option<i64>,
    pub symbology_code: Option<String>,
    pub contractor_name: Option<String>,
    pub hires_seismic_eql_url: Option<String>,
    pub other_data_url: Option<String>,
    pub layer: Option<String>,
}

impl Default for TrackAttributes {
    fn default() -> Self {
        let last_update_by = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        Self {
            last_update_by,
            survey_id: None,
            survey_id_ref: None,
            remarks: None,
            line_id: None,
            symbology_code: None,
            contractor_name: None,
            hires_seismic_eql_url: None,
            other_data_url: None,
            layer: None,
        }
    }
}

impl TrackAttributes {
    /// Read attributes from a JSON object. Missing keys keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path).context(AttributesIoSnafu { path })?;
        serde_json::from_reader(io::BufReader::new(file)).context(AttributesFormatSnafu { path })
    }
}

pub fn track_line_fields() -> Vec<FieldDef> {
    use FieldKind::*;
    [
        ("LAST_UPDATE", Text),
        ("LAST_UPDATE_BY", Text),
        ("FEATURE_ID", Text),
        ("SURVEY_ID", Integer),
        ("SURVEY_ID_REF", Text),
        ("REMARKS", Text),
        ("LINE_ID", Integer),
        ("LINE_NAME", Text),
        ("LAST_SEIS_PT_ID", Integer),
        ("SYMBOLOGY_CODE", Text),
        ("DATA_SOURCE", Text),
        ("CONTRACTOR_NAME", Text),
        ("LINE_LENGTH", Real),
        ("FIRST_SEIS_PT_ID", Integer),
        ("HIRES_SEISMIC_EQL_URL", Text),
        ("OTHER_DATA_URL", Text),
        ("LAYER", Text),
        ("SHAPE_Length", Real),
    ]
    .into_iter()
    .map(|(name, kind)| FieldDef::new(name, kind))
    .collect()
}

pub fn track_point_fields() -> Vec<FieldDef> {
    use FieldKind::*;
    [
        ("LINE_NAME", Text),
        ("DATA_SOURCE", Text),
        ("SurveyTime", Text),
        ("UNIXTime", Real),
        ("Longitude", Real),
        ("Latitude", Real),
        ("Depth", Real),
        ("Heading", Real),
        ("PingFlag", Integer),
    ]
    .into_iter()
    .map(|(name, kind)| FieldDef::new(name, kind))
    .collect()
}

/// `YYYYMMDD` of a unix timestamp, if it is representable.
pub fn survey_date(timestamp: f64) -> Option<String> {
    let seconds = timestamp.floor();
    let nanos = ((timestamp - seconds) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(seconds as i64, nanos).map(|t| t.format("%Y%m%d").to_string())
}

/// Fixes of the track line: `fixes` thinned to `step` seconds, always ending with the last fix.
pub fn track_line_vertices(fixes: &[NavigationFix], step: f64) -> Vec<&NavigationFix> {
    let mut decimator = Decimator::new(step);
    let mut vertices: Vec<&NavigationFix> = fixes
        .iter()
        .filter(|fix| decimator.accept(fix.timestamp))
        .collect();
    if let Some(last) = fixes.last() {
        if !vertices.last().is_some_and(|v| std::ptr::eq(*v, last)) {
            vertices.push(last);
        }
    }
    vertices
}

fn file_label(source: &Path) -> String {
    source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.display().to_string())
}

/// Per table outcome of folding all files into the container.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackTotals {
    pub lines: usize,
    pub points: usize,
    pub line_envelope: Option<Envelope>,
    pub point_envelope: Option<Envelope>,
    /// Files whose features could not be written, with the reason.
    pub failures: Vec<(PathBuf, String)>,
}

/// Writes one line and its points per input file.
pub struct TrackWriter<'a> {
    gpkg: &'a GeoPackage,
    projection: &'a dyn ProjectionService,
    attributes: &'a TrackAttributes,
    step: f64,
    lines: TableHandle,
    points: TableHandle,
    failures: Vec<(PathBuf, String)>,
}

impl<'a> TrackWriter<'a> {
    pub fn open(
        gpkg: &'a GeoPackage,
        projection: &'a dyn ProjectionService,
        attributes: &'a TrackAttributes,
        step: f64,
    ) -> Result<Self, ContainerError> {
        let srs_id = projection.srs_id();
        gpkg.add_spatial_ref_sys(&projection.spatial_ref_sys())?;
        let lines = gpkg.open_table(
            TRACK_LINE_TABLE,
            GeometryType::LineString,
            &track_line_fields(),
            srs_id,
        )?;
        let points = gpkg.open_table(
            TRACK_POINT_TABLE,
            GeometryType::Point,
            &track_point_fields(),
            srs_id,
        )?;
        Ok(Self {
            gpkg,
            projection,
            attributes,
            step,
            lines,
            points,
            failures: Vec::new(),
        })
    }

    fn project(&self, fix: &NavigationFix) -> Coord {
        self.projection.convert_to_grid(fix.longitude, fix.latitude)
    }

    /// One LINESTRING for the whole file. Returns `false` for files without fixes.
    pub fn add_line(
        &mut self,
        source: &Path,
        fixes: &[NavigationFix],
    ) -> Result<bool, ContainerError> {
        let (Some(first), Some(last)) = (fixes.first(), fixes.last()) else {
            return Ok(false);
        };
        let vertices: Vec<Coord> = track_line_vertices(fixes, self.step)
            .into_iter()
            .map(|fix| self.project(fix))
            .collect();
        let length = geodesic_length(fixes.iter().map(|f| (f.longitude, f.latitude)));
        let label = file_label(source);
        let attributes = self.attributes;
        let row = [
            FieldValue::Text(Utc::now().format("%Y-%m-%d").to_string()),
            FieldValue::Text(attributes.last_update_by.clone()),
            FieldValue::Text(format!("{label}:{}", first.timestamp as i64)),
            attributes.survey_id.into(),
            attributes.survey_id_ref.clone().into(),
            attributes.remarks.clone().into(),
            attributes.line_id.into(),
            FieldValue::Text(label.clone()),
            FieldValue::Integer(last.timestamp as i64),
            attributes.symbology_code.clone().into(),
            FieldValue::Text(label),
            attributes.contractor_name.clone().into(),
            FieldValue::Real(length),
            FieldValue::Integer(first.timestamp as i64),
            attributes.hires_seismic_eql_url.clone().into(),
            attributes.other_data_url.clone().into(),
            attributes.layer.clone().into(),
            FieldValue::Real(length),
        ];
        let line = Geometry::LineString(vertices);
        self.gpkg
            .in_table_transaction(&mut self.lines, |gpkg, lines| {
                gpkg.add_feature(lines, &line, &row)
            })?;
        Ok(true)
    }

    /// One POINT per fix, all or none. Returns the number written.
    pub fn add_points(
        &mut self,
        source: &Path,
        fixes: &[NavigationFix],
    ) -> Result<usize, ContainerError> {
        let label = file_label(source);
        let projection = self.projection;
        self.gpkg
            .in_table_transaction(&mut self.points, |gpkg, points| {
                for fix in fixes {
                    let row = [
                        FieldValue::Text(label.clone()),
                        FieldValue::Text(label.clone()),
                        survey_date(fix.timestamp).into(),
                        FieldValue::Real(fix.timestamp),
                        FieldValue::Real(fix.longitude),
                        FieldValue::Real(fix.latitude),
                        fix.depth.into(),
                        fix.heading.into(),
                        FieldValue::Integer(fix.flags as i64),
                    ];
                    let point =
                        Geometry::Point(projection.convert_to_grid(fix.longitude, fix.latitude));
                    gpkg.add_feature(points, &point, &row)?;
                }
                Ok(fixes.len())
            })
    }

    /// Write the features of one file. Each table is written in its own transaction, so a
    /// failure leaves the other table's features of that file in place.
    pub fn add_file(&mut self, source: &Path, fixes: &[NavigationFix]) -> (bool, usize) {
        if fixes.is_empty() {
            log::info!("{} has no navigation, skipping", source.display());
            return (false, 0);
        }
        let line = match self.add_line(source, fixes) {
            Ok(written) => written,
            Err(e) => {
                log::warn!("Could not write track line of {}: {e}", source.display());
                self.failures.push((source.to_path_buf(), e.to_string()));
                false
            }
        };
        let points = match self.add_points(source, fixes) {
            Ok(written) => written,
            Err(e) => {
                log::warn!("Could not write track points of {}: {e}", source.display());
                self.failures.push((source.to_path_buf(), e.to_string()));
                0
            }
        };
        (line, points)
    }

    /// Flush both envelopes into `gpkg_contents`.
    pub fn close(self) -> Result<TrackTotals, ContainerError> {
        let lines = self.lines.features();
        let points = self.points.features();
        let line_envelope = self.gpkg.close_table(self.lines)?;
        let point_envelope = self.gpkg.close_table(self.points)?;
        Ok(TrackTotals {
            lines,
            points,
            line_envelope: (!line_envelope.is_empty()).then_some(line_envelope),
            point_envelope: (!point_envelope.is_empty()).then_some(point_envelope),
            failures: self.failures,
        })
    }
}
