//! Vector feature output into an OGC GeoPackage.
//!
//! A [[GeoPackage]] owns one SQLite connection. Creating one writes the metadata tables and the
//! default spatial reference systems. Feature tables are opened with [[GeoPackage::open_table]],
//! filled with [[GeoPackage::add_feature]] and finished with [[GeoPackage::close_table]], which
//! records the bounding envelope of everything inserted in `gpkg_contents`.
use rusqlite::{
    params,
    params_from_iter,
    types::{ToSqlOutput, Value as SqlValue, ValueRef},
    Connection,
    ToSql,
};
use snafu::{prelude::*, Backtrace};
use std::{
    fmt,
    iter,
    path::{Path, PathBuf},
};

pub mod wkb;
pub use wkb::{Coord, Geometry, GeometryType};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ContainerError {
    #[snafu(display("Could not open GeoPackage {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not create the GeoPackage metadata tables: {source}"))]
    Bootstrap {
        source: rusqlite::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Writing to table {table} failed: {source}"))]
    ContainerWrite {
        table: String,
        source: rusqlite::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Table {table} has {expected} fields, but the row has {actual} values"))]
    SchemaMismatch {
        table: String,
        expected: usize,
        actual: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Table {table} holds {expected} geometries, not {actual}"))]
    GeometryMismatch {
        table: String,
        expected: GeometryType,
        actual: GeometryType,
        backtrace: Backtrace,
    },
    #[snafu(display("Refusing to write an empty geometry into {table}"))]
    EmptyGeometry { table: String, backtrace: Backtrace },
    #[snafu(display("'{name}' is not a valid table or column name"))]
    InvalidName { name: String, backtrace: Backtrace },
    #[snafu(display("Invalid geometry blob: {description}"))]
    InvalidBlob {
        description: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Geometry blob ended early: {source}"))]
    BlobIo {
        source: std::io::Error,
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

pub type Result<T, E = ContainerError> = std::result::Result<T, E>;

/// `GPKG` in ASCII.
pub const APPLICATION_ID: i32 = 0x4750_4B47;
/// GeoPackage 1.2.
pub const USER_VERSION: i32 = 10200;
pub const GEOMETRY_COLUMN: &str = "geom";

const BOOTSTRAP_SQL: &str = "
CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
    srs_name TEXT NOT NULL,
    srs_id INTEGER PRIMARY KEY NOT NULL,
    organization TEXT NOT NULL,
    organization_coordsys_id INTEGER NOT NULL,
    definition TEXT NOT NULL,
    description TEXT
);
CREATE TABLE IF NOT EXISTS gpkg_contents (
    table_name TEXT PRIMARY KEY NOT NULL,
    data_type TEXT NOT NULL,
    identifier TEXT UNIQUE,
    description TEXT DEFAULT '',
    last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    min_x DOUBLE,
    min_y DOUBLE,
    max_x DOUBLE,
    max_y DOUBLE,
    srs_id INTEGER,
    CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    geometry_type_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL,
    z TINYINT NOT NULL,
    m TINYINT NOT NULL,
    CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
    CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
    CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
CREATE TABLE IF NOT EXISTS gpkg_extensions (
    table_name TEXT,
    column_name TEXT,
    extension_name TEXT NOT NULL,
    definition TEXT NOT NULL,
    scope TEXT NOT NULL,
    CONSTRAINT ge_tce UNIQUE (table_name, column_name, extension_name)
);
CREATE TABLE IF NOT EXISTS gpkg_tile_matrix_set (
    table_name TEXT PRIMARY KEY NOT NULL,
    srs_id INTEGER NOT NULL,
    min_x DOUBLE NOT NULL,
    min_y DOUBLE NOT NULL,
    max_x DOUBLE NOT NULL,
    max_y DOUBLE NOT NULL,
    CONSTRAINT fk_gtms_table_name FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
    CONSTRAINT fk_gtms_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
);
CREATE TABLE IF NOT EXISTS gpkg_tile_matrix (
    table_name TEXT NOT NULL,
    zoom_level INTEGER NOT NULL,
    matrix_width INTEGER NOT NULL,
    matrix_height INTEGER NOT NULL,
    tile_width INTEGER NOT NULL,
    tile_height INTEGER NOT NULL,
    pixel_x_size DOUBLE NOT NULL,
    pixel_y_size DOUBLE NOT NULL,
    CONSTRAINT pk_ttm PRIMARY KEY (table_name, zoom_level),
    CONSTRAINT fk_tmm_table_name FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name)
);
";

/// A row of `gpkg_spatial_ref_sys`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpatialRefSys {
    pub srs_name: &'static str,
    pub srs_id: i32,
    pub organization: &'static str,
    pub organization_coordsys_id: i32,
    pub definition: &'static str,
    pub description: &'static str,
}

impl SpatialRefSys {
    pub const UNDEFINED_CARTESIAN: SpatialRefSys = SpatialRefSys {
        srs_name: "Undefined cartesian SRS",
        srs_id: -1,
        organization: "NONE",
        organization_coordsys_id: -1,
        definition: "undefined",
        description: "undefined cartesian coordinate reference system",
    };
    pub const UNDEFINED_GEOGRAPHIC: SpatialRefSys = SpatialRefSys {
        srs_name: "Undefined geographic SRS",
        srs_id: 0,
        organization: "NONE",
        organization_coordsys_id: 0,
        definition: "undefined",
        description: "undefined geographic coordinate reference system",
    };
    pub const WGS84: SpatialRefSys = SpatialRefSys {
        srs_name: "WGS 84 geodetic",
        srs_id: 4326,
        organization: "EPSG",
        organization_coordsys_id: 4326,
        definition: "GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563,\
AUTHORITY[\"EPSG\",\"7030\"]],AUTHORITY[\"EPSG\",\"6326\"]],PRIMEM[\"Greenwich\",0,\
AUTHORITY[\"EPSG\",\"8901\"]],UNIT[\"degree\",0.0174532925199433,AUTHORITY[\"EPSG\",\"9122\"]],\
AUTHORITY[\"EPSG\",\"4326\"]]",
        description: "longitude/latitude coordinates in decimal degrees on the WGS 84 spheroid",
    };

    /// Rows every GeoPackage must contain.
    pub const REQUIRED: [SpatialRefSys; 3] = [
        SpatialRefSys::UNDEFINED_CARTESIAN,
        SpatialRefSys::UNDEFINED_GEOGRAPHIC,
        SpatialRefSys::WGS84,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Real,
    Text,
}

impl FieldKind {
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldKind::Integer => "INTEGER",
            FieldKind::Real => "REAL",
            FieldKind::Text => "TEXT",
        }
    }
}

/// One attribute column of a feature table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// One attribute value, in field order.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Real(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            FieldValue::Integer(value) => ToSqlOutput::Owned(SqlValue::Integer(*value)),
            FieldValue::Real(value) => ToSqlOutput::Owned(SqlValue::Real(*value)),
            FieldValue::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
        })
    }
}

/// Axis aligned bounds over every vertex written to a table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Envelope {
    pub const EMPTY: Envelope = Envelope {
        min_x: f64::INFINITY,
        max_x: f64::NEG_INFINITY,
        min_y: f64::INFINITY,
        max_y: f64::NEG_INFINITY,
    };

    pub fn expand(&mut self, coord: &Coord) {
        self.min_x = self.min_x.min(coord.x);
        self.max_x = self.max_x.max(coord.x);
        self.min_y = self.min_y.min(coord.y);
        self.max_y = self.max_y.max(coord.y);
    }

    pub fn is_empty(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Envelope::EMPTY
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] x [{}, {}]",
            self.min_x, self.max_x, self.min_y, self.max_y
        )
    }
}

/// An open feature table. Hand it back to [[GeoPackage::close_table]] to record its envelope.
#[derive(Debug)]
pub struct TableHandle {
    name: String,
    geometry_type: GeometryType,
    srs_id: i32,
    fields: Vec<FieldDef>,
    envelope: Envelope,
    features: usize,
    insert_sql: String,
}

impl TableHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.geometry_type
    }

    pub fn srs_id(&self) -> i32 {
        self.srs_id
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    /// Features written through this handle.
    pub fn features(&self) -> usize {
        self.features
    }
}

fn check_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    ensure!(valid, InvalidNameSnafu { name });
    Ok(())
}

pub struct GeoPackage {
    connection: Connection,
}

impl GeoPackage {
    /// Open or create the file at `path` and make sure the metadata tables exist.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let connection = Connection::open(path).context(OpenSnafu { path })?;
        Self::bootstrap(connection)
    }

    pub fn in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context(BootstrapSnafu)?;
        Self::bootstrap(connection)
    }

    fn bootstrap(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(&format!(
                "PRAGMA application_id = {APPLICATION_ID}; PRAGMA user_version = {USER_VERSION};"
            ))
            .context(BootstrapSnafu)?;
        connection
            .execute_batch(BOOTSTRAP_SQL)
            .context(BootstrapSnafu)?;
        let gpkg = Self { connection };
        for srs in SpatialRefSys::REQUIRED.iter() {
            gpkg.add_spatial_ref_sys(srs)?;
        }
        Ok(gpkg)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Register `srs`. Existing rows with the same id are kept.
    pub fn add_spatial_ref_sys(&self, srs: &SpatialRefSys) -> Result<()> {
        self.connection
            .execute(
                "INSERT OR IGNORE INTO gpkg_spatial_ref_sys
                 (srs_name, srs_id, organization, organization_coordsys_id, definition, description)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    srs.srs_name,
                    srs.srs_id,
                    srs.organization,
                    srs.organization_coordsys_id,
                    srs.definition,
                    srs.description,
                ],
            )
            .context(ContainerWriteSnafu {
                table: "gpkg_spatial_ref_sys",
            })?;
        Ok(())
    }

    /// Create the feature table `name` if needed and register it in `gpkg_contents` and
    /// `gpkg_geometry_columns`.
    ///
    /// The table gets an integer primary key `fid`, one column per entry of `fields` and a
    /// geometry column named [[GEOMETRY_COLUMN]].
    pub fn open_table(
        &self,
        name: &str,
        geometry_type: GeometryType,
        fields: &[FieldDef],
        srs_id: i32,
    ) -> Result<TableHandle> {
        check_name(name)?;
        for field in fields {
            check_name(&field.name)?;
        }
        let columns = fields
            .iter()
            .map(|f| format!("\"{}\" {}", f.name, f.kind.sql_type()))
            .chain(iter::once(format!(
                "\"{GEOMETRY_COLUMN}\" {}",
                geometry_type.sql_name()
            )));
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{name}\" \
             (\"fid\" INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, {})",
            itertools::join(columns, ", ")
        );
        let write_context = || ContainerWriteSnafu { table: name };
        self.connection
            .execute(&create_sql, [])
            .context(write_context())?;
        self.connection
            .execute(
                "INSERT OR REPLACE INTO gpkg_contents
                     (table_name, data_type, identifier, description, srs_id)
                 VALUES (?1, 'features', ?1, '', ?2)",
                params![name, srs_id],
            )
            .context(write_context())?;
        self.connection
            .execute(
                "INSERT OR REPLACE INTO gpkg_geometry_columns
                 (table_name, column_name, geometry_type_name, srs_id, z, m)
                 VALUES (?1, ?2, ?3, ?4, 0, 0)",
                params![name, GEOMETRY_COLUMN, geometry_type.sql_name(), srs_id],
            )
            .context(write_context())?;

        let column_names = fields
            .iter()
            .map(|f| format!("\"{}\"", f.name))
            .chain(iter::once(format!("\"{GEOMETRY_COLUMN}\"")));
        let placeholders = itertools::join(iter::repeat("?").take(fields.len() + 1), ", ");
        let insert_sql = format!(
            "INSERT INTO \"{name}\" ({}) VALUES ({placeholders})",
            itertools::join(column_names, ", ")
        );
        log::debug!("Opened {geometry_type} table {name} with {} fields", fields.len());
        Ok(TableHandle {
            name: name.to_string(),
            geometry_type,
            srs_id,
            fields: fields.to_vec(),
            envelope: Envelope::EMPTY,
            features: 0,
            insert_sql,
        })
    }

    /// Insert one feature and grow the table's envelope by its vertices.
    ///
    /// Returns the `fid` of the new row.
    pub fn add_feature(
        &self,
        table: &mut TableHandle,
        geometry: &Geometry,
        attributes: &[FieldValue],
    ) -> Result<i64> {
        ensure!(
            attributes.len() == table.fields.len(),
            SchemaMismatchSnafu {
                table: table.name.as_str(),
                expected: table.fields.len(),
                actual: attributes.len(),
            }
        );
        ensure!(
            geometry.geometry_type() == table.geometry_type,
            GeometryMismatchSnafu {
                table: table.name.as_str(),
                expected: table.geometry_type,
                actual: geometry.geometry_type(),
            }
        );
        ensure!(
            !geometry.is_empty(),
            EmptyGeometrySnafu {
                table: table.name.as_str(),
            }
        );
        let blob = geometry.to_blob(table.srs_id);
        let values = attributes
            .iter()
            .map(|value| value as &dyn ToSql)
            .chain(iter::once(&blob as &dyn ToSql));
        let mut statement = self
            .connection
            .prepare_cached(&table.insert_sql)
            .context(ContainerWriteSnafu {
                table: table.name.as_str(),
            })?;
        statement
            .execute(params_from_iter(values))
            .context(ContainerWriteSnafu {
                table: table.name.as_str(),
            })?;
        for vertex in geometry.vertices() {
            table.envelope.expand(vertex);
        }
        table.features += 1;
        Ok(self.connection.last_insert_rowid())
    }

    /// Write the envelope of `table` into its `gpkg_contents` row.
    ///
    /// Tables that never received a feature keep null bounds.
    pub fn close_table(&self, table: TableHandle) -> Result<Envelope> {
        let envelope = table.envelope;
        if envelope.is_empty() {
            log::debug!("Closing empty table {}", table.name);
            return Ok(envelope);
        }
        self.connection
            .execute(
                "UPDATE gpkg_contents
                 SET min_x = ?1, min_y = ?2, max_x = ?3, max_y = ?4,
                     last_change = strftime('%Y-%m-%dT%H:%M:%fZ','now')
                 WHERE table_name = ?5",
                params![
                    envelope.min_x,
                    envelope.min_y,
                    envelope.max_x,
                    envelope.max_y,
                    table.name
                ],
            )
            .context(ContainerWriteSnafu {
                table: table.name.as_str(),
            })?;
        log::debug!(
            "Closed {} with {} features inside {envelope}",
            table.name,
            table.features
        );
        Ok(envelope)
    }

    /// Run `f` inside one transaction. Nothing `f` wrote is kept if it fails.
    pub fn in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        let transaction = self
            .connection
            .unchecked_transaction()
            .context(ContainerWriteSnafu { table: "*" })?;
        let result = f(self)?;
        transaction
            .commit()
            .context(ContainerWriteSnafu { table: "*" })?;
        Ok(result)
    }

    /// [[GeoPackage::in_transaction]] for writes into `table`.
    ///
    /// The handle's envelope and feature count roll back together with the rows.
    pub fn in_table_transaction<T, F>(&self, table: &mut TableHandle, f: F) -> Result<T>
    where
        F: FnOnce(&Self, &mut TableHandle) -> Result<T>,
    {
        let (envelope, features) = (table.envelope, table.features);
        let result = self.in_transaction(|gpkg| f(gpkg, table));
        if result.is_err() {
            table.envelope = envelope;
            table.features = features;
        }
        result
    }
}
