//! Extraction of decimated navigation fixes from any [[FormatReader]].
use crate::formats::{FormatReader, ReaderState};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use std::path::PathBuf;

pub mod cache;
pub use cache::{CachedNavigation, NavigationCache};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum NavigationError {
    #[snafu(display("Invalid coordinate lon={longitude}, lat={latitude}"))]
    InvalidCoordinate {
        longitude: f64,
        latitude: f64,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not access navigation cache {}: {source}", path.display()))]
    CacheIo {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Navigation cache {} is not valid JSON: {source}", path.display()))]
    CacheFormat {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not move navigation cache into place: {source}"))]
    CachePersist {
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = NavigationError> = std::result::Result<T, E>;

/// One position of the survey platform.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationFix {
    /// Seconds since the unix epoch, UTC.
    pub timestamp: f64,
    pub longitude: f64,
    pub latitude: f64,
    /// Height or depth as reported by the sensor, in metres.
    pub depth: Option<f64>,
    /// Degrees clockwise from north.
    pub heading: Option<f64>,
    /// Format specific status bits, e.g. GSF ping flags.
    pub flags: u32,
}

impl NavigationFix {
    pub fn new(timestamp: f64, longitude: f64, latitude: f64) -> Self {
        Self {
            timestamp,
            longitude,
            latitude,
            depth: None,
            heading: None,
            flags: 0,
        }
    }

    pub fn with_depth(mut self, depth: f64) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Rejects non-finite values, coordinates outside the valid range and the null island.
    pub fn validate(&self) -> Result<()> {
        let (lon, lat) = (self.longitude, self.latitude);
        let in_range = lon.is_finite()
            && lat.is_finite()
            && self.timestamp.is_finite()
            && lat.abs() <= 90.0
            && lon.abs() <= 180.0;
        ensure!(
            in_range && !(lat == 0.0 && lon == 0.0),
            InvalidCoordinateSnafu {
                longitude: lon,
                latitude: lat,
            }
        );
        Ok(())
    }
}

/// Records that may carry a position.
///
/// Implementations report whatever the record says. Validation happens in [[extract]].
pub trait NavigationRecord {
    fn navigation_fix(&self) -> Option<NavigationFix>;
}

/// Fixes extracted from one file.
#[derive(Clone, Debug, PartialEq)]
pub struct Extraction {
    pub fixes: Vec<NavigationFix>,
    /// [[ReaderState::Exhausted]] for a clean run, [[ReaderState::Corrupt]] when the file ended
    /// early. The fixes are kept either way.
    pub final_state: ReaderState,
    /// Fixes dropped as invalid coordinates.
    pub rejected: usize,
}

/// Accepts a fix only if it is at least `min_step` seconds after the last accepted one.
/// The first fix is always accepted.
#[derive(Clone, Copy, Debug)]
pub struct Decimator {
    min_step: f64,
    last_accepted: Option<f64>,
}

impl Decimator {
    pub fn new(min_step: f64) -> Self {
        Self {
            min_step,
            last_accepted: None,
        }
    }

    pub fn accept(&mut self, timestamp: f64) -> bool {
        match self.last_accepted {
            Some(last) if timestamp - last < self.min_step => false,
            _ => {
                self.last_accepted = Some(timestamp);
                true
            }
        }
    }
}

/// Walk `reader` from its first record to the end, collecting valid fixes that are at least
/// `min_step` seconds apart.
pub fn extract<R>(reader: &mut R, min_step: f64) -> Extraction
where
    R: FormatReader,
    R::Record: NavigationRecord,
{
    reader.rewind();
    let mut decimator = Decimator::new(min_step);
    let mut fixes = Vec::new();
    let mut rejected = 0;
    while let Some(record) = reader.read_next_record() {
        let Some(fix) = record.navigation_fix() else {
            continue;
        };
        if let Err(e) = fix.validate() {
            log::debug!("Dropping fix at t={}: {}", fix.timestamp, e);
            rejected += 1;
            continue;
        }
        if decimator.accept(fix.timestamp) {
            fixes.push(fix);
        }
    }
    Extraction {
        fixes,
        final_state: reader.state(),
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed list of records, optionally ending in corruption.
    struct ScriptedReader {
        records: Vec<Option<NavigationFix>>,
        next: usize,
        corrupt_after: Option<usize>,
        state: ReaderState,
    }

    impl ScriptedReader {
        fn new(records: Vec<Option<NavigationFix>>) -> Self {
            Self {
                records,
                next: 0,
                corrupt_after: None,
                state: ReaderState::HeaderRead,
            }
        }
    }

    struct Scripted(Option<NavigationFix>);

    impl NavigationRecord for Scripted {
        fn navigation_fix(&self) -> Option<NavigationFix> {
            self.0
        }
    }

    impl FormatReader for ScriptedReader {
        type Record = Scripted;

        fn more_data(&self) -> bool {
            !self.state.is_terminal()
        }

        fn read_next_record(&mut self) -> Option<Scripted> {
            if self.state.is_terminal() {
                return None;
            }
            if self.corrupt_after == Some(self.next) {
                self.state = ReaderState::Corrupt;
                return None;
            }
            match self.records.get(self.next) {
                Some(record) => {
                    self.next += 1;
                    self.state = ReaderState::Streaming;
                    Some(Scripted(*record))
                }
                None => {
                    self.state = ReaderState::Exhausted;
                    None
                }
            }
        }

        fn rewind(&mut self) {
            if self.state != ReaderState::Corrupt {
                self.next = 0;
                self.state = ReaderState::HeaderRead;
            }
        }

        fn state(&self) -> ReaderState {
            self.state
        }
    }

    fn fix(t: f64) -> Option<NavigationFix> {
        Some(NavigationFix::new(t, 5.0 + t / 1000.0, 52.0))
    }

    #[test]
    fn decimates_by_step() {
        let mut reader = ScriptedReader::new(vec![fix(0.0), fix(1.0), fix(2.0)]);
        let extraction = extract(&mut reader, 2.0);
        let times: Vec<f64> = extraction.fixes.iter().map(|f| f.timestamp).collect();
        assert_eq!(times, vec![0.0, 2.0]);
        assert_eq!(extraction.final_state, ReaderState::Exhausted);
    }

    #[test]
    fn adjacent_fixes_respect_step() {
        let records = (0..50).map(|i| fix(i as f64 * 0.3)).collect();
        let mut reader = ScriptedReader::new(records);
        let extraction = extract(&mut reader, 1.0);
        assert!(extraction.fixes.len() > 1);
        for pair in extraction.fixes.windows(2) {
            assert!(pair[1].timestamp - pair[0].timestamp >= 1.0);
        }
    }

    #[test]
    fn extraction_is_deterministic() {
        let records: Vec<_> = (0..20).map(|i| fix(i as f64 * 0.7)).collect();
        let mut reader = ScriptedReader::new(records);
        let first = extract(&mut reader, 1.5);
        let second = extract(&mut reader, 1.5);
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_fixes_are_dropped_and_do_not_seed() {
        let mut reader = ScriptedReader::new(vec![
            None,
            Some(NavigationFix::new(0.0, 0.0, 0.0)),
            Some(NavigationFix::new(0.5, 181.0, 10.0)),
            Some(NavigationFix::new(0.7, 10.0, f64::NAN)),
            Some(NavigationFix::new(0.9, 10.0, -91.0)),
            fix(1.0),
        ]);
        let extraction = extract(&mut reader, 10.0);
        assert_eq!(extraction.rejected, 4);
        assert_eq!(extraction.fixes.len(), 1);
        assert_eq!(extraction.fixes[0].timestamp, 1.0);
    }

    #[test]
    fn corrupt_stream_keeps_partial_fixes() {
        let mut reader = ScriptedReader::new(vec![fix(0.0), fix(1.0), fix(2.0), fix(3.0)]);
        reader.corrupt_after = Some(2);
        let extraction = extract(&mut reader, 0.0);
        assert_eq!(extraction.fixes.len(), 2);
        assert_eq!(extraction.final_state, ReaderState::Corrupt);
    }

    #[test]
    fn validation_edges() {
        assert!(NavigationFix::new(0.0, 180.0, 90.0).validate().is_ok());
        assert!(NavigationFix::new(0.0, -180.0, -90.0).validate().is_ok());
        assert!(NavigationFix::new(0.0, 0.0, 1.0).validate().is_ok());
        assert!(NavigationFix::new(0.0, 0.0, 0.0).validate().is_err());
        assert!(NavigationFix::new(f64::INFINITY, 1.0, 1.0)
            .validate()
            .is_err());
    }
}
