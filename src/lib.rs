//! Survey track extraction from vendor sonar and seismic files into GeoPackages.
pub mod formats;
pub mod geopackage;
pub mod navigation;
pub mod projection;
pub mod survey;

pub use formats::{FormatReader, ReaderState, SurveyFormat};
pub use navigation::{extract, Extraction, NavigationFix};
pub use survey::{run, SurveyConfig, SurveyError};
