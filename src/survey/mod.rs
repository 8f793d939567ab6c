//! Conversion of a whole survey folder into one GeoPackage.
//!
//! Files are discovered by extension, their navigation is extracted on a worker pool (or loaded
//! from the JSON sidecar written by an earlier run), and the results are folded in path order
//! into the track tables on the calling thread.
use crate::{
    formats::{
        gsf::{GsfOptions, GsfReader, PingDecoding},
        jsf::JsfReader,
        kmraw::KmRawReader,
        s7k::S7kReader,
        sbd::SbdReader,
        segy::SegyReader,
        FormatError,
        ReaderState,
        SurveyFormat,
    },
    geopackage::{ContainerError, GeoPackage},
    navigation::{extract, CachedNavigation, Extraction, NavigationCache, NavigationError},
    projection,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use std::{
    fs,
    io,
    path::{Path, PathBuf},
    time::Instant,
};
use walkdir::WalkDir;

pub mod tracks;
pub use tracks::{TrackAttributes, TrackTotals, TrackWriter};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SurveyError {
    #[snafu(display("Input {} is not a folder. Please specify a survey folder.", path.display()))]
    InputFolder { path: PathBuf, backtrace: Backtrace },
    #[snafu(display("Cannot produce coordinates in EPSG:{epsg}, only 4326 is supported"))]
    UnsupportedEpsg { epsg: i32, backtrace: Backtrace },
    #[snafu(display("Could not start the worker pool: {source}"))]
    ThreadPool {
        source: rayon::ThreadPoolBuildError,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not create output folder {}: {source}", path.display()))]
    OutputFolder {
        path: PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not read track attributes from {}: {source}", path.display()))]
    AttributesIo {
        path: PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Track attributes in {} are not valid: {source}", path.display()))]
    AttributesFormat {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Could not read {}: {source}", path.display()))]
    Input {
        path: PathBuf,
        #[snafu(backtrace)]
        source: FormatError,
    },
    #[snafu(context(false), display("{source}"))]
    Container {
        #[snafu(backtrace)]
        source: ContainerError,
    },
    #[snafu(context(false), display("{source}"))]
    Cache {
        #[snafu(backtrace)]
        source: NavigationError,
    },
}

pub type Result<T, E = SurveyError> = std::result::Result<T, E>;

/// Everything a run needs to know.
#[derive(Clone, Debug, PartialEq)]
pub struct SurveyConfig {
    pub input: PathBuf,
    /// Defaults to [[default_output_path]].
    pub output: Option<PathBuf>,
    /// Minimum seconds between extracted fixes.
    pub step: f64,
    /// Worker threads, 0 for one per core.
    pub cpu: usize,
    /// Ignore and rebuild cached navigation.
    pub reprocess: bool,
    pub epsg: i32,
    pub attributes: TrackAttributes,
}

impl SurveyConfig {
    pub fn new<P: Into<PathBuf>>(input: P) -> Self {
        Self {
            input: input.into(),
            output: None,
            step: 1.0,
            cpu: 0,
            reprocess: false,
            epsg: 4326,
            attributes: TrackAttributes::default(),
        }
    }

    /// The explicit output, or a fresh name under the input folder.
    pub fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(output) => output.clone(),
            None => unique_path(default_output_path(&self.input)),
        }
    }
}

/// `<input>/GIS/<input folder name>_SSDM.gpkg`
pub fn default_output_path(input: &Path) -> PathBuf {
    let survey = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "survey".to_string());
    input.join("GIS").join(format!("{survey}_SSDM.gpkg"))
}

/// `path` if nothing exists there yet, otherwise the first free `<stem>_<n>.<ext>`.
pub fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1..)
        .map(|n| path.with_file_name(format!("{stem}_{n}{extension}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

/// All files below `input` with a known survey format extension, sorted by path.
pub fn discover<P: AsRef<Path>>(input: P) -> Vec<(PathBuf, SurveyFormat)> {
    let mut files: Vec<(PathBuf, SurveyFormat)> = WalkDir::new(input)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let format = SurveyFormat::from_path(entry.path())?;
            Some((entry.into_path(), format))
        })
        .collect();
    files.sort();
    files
}

/// Decimated navigation of one file.
///
/// Opening failures are errors. A file that turns out to be corrupt part way through yields the
/// fixes read up to that point.
pub fn extract_file(path: &Path, format: SurveyFormat, step: f64) -> Result<Extraction> {
    let context = || InputSnafu { path };
    let extraction = match format {
        SurveyFormat::Gsf => {
            let options = GsfOptions {
                ping_decoding: PingDecoding::HeaderOnly,
                ..GsfOptions::default()
            };
            extract(&mut GsfReader::open(path, options).context(context())?, step)
        }
        SurveyFormat::KmRaw => extract(&mut KmRawReader::open(path).context(context())?, step),
        SurveyFormat::Jsf => extract(&mut JsfReader::open(path).context(context())?, step),
        SurveyFormat::S7k => extract(&mut S7kReader::open(path).context(context())?, step),
        SurveyFormat::Segy => extract(&mut SegyReader::open(path).context(context())?, step),
        SurveyFormat::Sbd => extract(&mut SbdReader::open(path).context(context())?, step),
    };
    Ok(extraction)
}

/// Cached navigation of `path`, extracting and caching it when there is no usable sidecar.
pub fn process_file(
    path: &Path,
    format: SurveyFormat,
    step: f64,
    cache: &NavigationCache,
    reprocess: bool,
) -> Result<CachedNavigation> {
    if reprocess {
        cache.invalidate(path)?;
    } else {
        match cache.load(path) {
            Ok(Some(cached)) if cached.source != path => log::info!(
                "Cached navigation at {} belongs to {}, extracting again",
                cache.path_for(path).display(),
                cached.source.display()
            ),
            Ok(Some(cached)) if cached.step == step => {
                log::debug!("Using cached navigation for {}", path.display());
                return Ok(cached);
            }
            Ok(Some(cached)) => log::info!(
                "Cached navigation of {} used a step of {}s, extracting again",
                path.display(),
                cached.step
            ),
            Ok(None) => (),
            Err(e) => log::warn!("Ignoring unusable cache for {}: {e}", path.display()),
        }
    }
    let extraction = extract_file(path, format, step)?;
    if extraction.final_state == ReaderState::Corrupt {
        log::warn!(
            "{} ended early, keeping the {} fixes read before that",
            path.display(),
            extraction.fixes.len()
        );
    }
    if extraction.rejected > 0 {
        log::debug!(
            "{}: dropped {} fixes with invalid coordinates",
            path.display(),
            extraction.rejected
        );
    }
    let cached = CachedNavigation {
        source: path.to_path_buf(),
        format: format.name().to_string(),
        step,
        final_state: extraction.final_state,
        fixes: extraction.fixes,
    };
    cache.store(&cached)?;
    Ok(cached)
}

/// What a run produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SurveySummary {
    pub output: PathBuf,
    pub files: usize,
    /// Files that ended early. Their partial navigation was written.
    pub partial: Vec<PathBuf>,
    /// Files that could not be read at all, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    pub tracks: TrackTotals,
}

/// Convert the survey folder described by `config`.
pub fn run(config: &SurveyConfig) -> Result<SurveySummary> {
    let start = Instant::now();
    ensure!(
        config.input.is_dir(),
        InputFolderSnafu {
            path: config.input.clone(),
        }
    );
    let projection = projection::for_epsg(config.epsg).context(UnsupportedEpsgSnafu {
        epsg: config.epsg,
    })?;
    let output = config.output_path();
    let output_dir = output
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&output_dir).context(OutputFolderSnafu {
        path: output_dir.clone(),
    })?;
    let cache = NavigationCache::new(output_dir.join("log"))?;

    let files = discover(&config.input);
    log::info!(
        "Found {} survey files in {}",
        files.len(),
        config.input.display()
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.cpu)
        .build()
        .context(ThreadPoolSnafu)?;
    log::info!("Extracting navigation with {} threads", pool.current_num_threads());
    let results: Vec<(PathBuf, Result<CachedNavigation>)> = pool.install(|| {
        files
            .par_iter()
            .map(|(path, format)| {
                let result = process_file(path, *format, config.step, &cache, config.reprocess);
                (path.clone(), result)
            })
            .collect()
    });

    let gpkg = GeoPackage::create(&output)?;
    let mut writer =
        TrackWriter::open(&gpkg, projection.as_ref(), &config.attributes, config.step)?;
    let mut summary = SurveySummary {
        output: output.clone(),
        files: files.len(),
        ..SurveySummary::default()
    };
    for (path, result) in results {
        match result {
            Ok(navigation) => {
                if navigation.final_state == ReaderState::Corrupt {
                    summary.partial.push(path.clone());
                }
                writer.add_file(&path, &navigation.fixes);
            }
            Err(e) => {
                log::warn!("Skipping {}: {e}", path.display());
                summary.skipped.push((path, e.to_string()));
            }
        }
    }
    summary.tracks = writer.close()?;
    log::info!(
        "Wrote {} track lines and {} track points to {} in {}",
        summary.tracks.lines,
        summary.tracks.points,
        output.display(),
        pretty_duration::pretty_duration(&start.elapsed(), None)
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::jsf::sonar_message_at;

    fn write_jsf(path: &Path, start: i64, count: i64) {
        let bytes: Vec<u8> = (0..count)
            .flat_map(|i| sonar_message_at(start + i, 3.0 + 0.001 * i as f64, 51.5))
            .collect();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn default_output_is_unique() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Survey_A");
        let first = default_output_path(&input);
        assert_eq!(first, input.join("GIS").join("Survey_A_SSDM.gpkg"));
        assert_eq!(unique_path(first.clone()), first);
        fs::create_dir_all(first.parent().unwrap()).unwrap();
        fs::write(&first, b"").unwrap();
        assert_eq!(
            unique_path(first.clone()),
            input.join("GIS").join("Survey_A_SSDM_1.gpkg")
        );
    }

    #[test]
    fn discovers_known_extensions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b/line2.JSF", "a/line1.gsf", "notes.txt", "seismic.sgy"] {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"").unwrap();
        }
        let found: Vec<(String, SurveyFormat)> = discover(dir.path())
            .into_iter()
            .map(|(path, format)| {
                let relative = path.strip_prefix(dir.path()).unwrap().to_path_buf();
                (relative.to_string_lossy().replace('\\', "/"), format)
            })
            .collect();
        assert_eq!(
            found,
            vec![
                ("a/line1.gsf".to_string(), SurveyFormat::Gsf),
                ("b/line2.JSF".to_string(), SurveyFormat::Jsf),
                ("seismic.sgy".to_string(), SurveyFormat::Segy),
            ]
        );
    }

    #[test]
    fn missing_input_folder() {
        let dir = tempfile::tempdir().unwrap();
        let config = SurveyConfig::new(dir.path().join("nope"));
        assert!(matches!(run(&config), Err(SurveyError::InputFolder { .. })));
        assert!(!dir.path().join("nope").exists());
    }

    #[test]
    fn unsupported_projection() {
        let dir = tempfile::tempdir().unwrap();
        let config = SurveyConfig {
            epsg: 32631,
            ..SurveyConfig::new(dir.path())
        };
        assert!(matches!(
            run(&config),
            Err(SurveyError::UnsupportedEpsg { epsg: 32631, .. })
        ));
    }

    #[test]
    fn converts_a_survey_folder() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Survey_B");
        write_jsf(&input.join("sss/line_0001.jsf"), 1_700_000_000, 10);
        write_jsf(&input.join("sss/line_0002.jsf"), 1_700_000_100, 4);
        // Cut the second file in the middle of its last message.
        let second = input.join("sss/line_0002.jsf");
        let bytes = fs::read(&second).unwrap();
        fs::write(&second, &bytes[..bytes.len() - 10]).unwrap();
        // Long enough for a 7k frame, but without its sync pattern.
        fs::write(input.join("sss/broken.s7k"), vec![0xAB; 100]).unwrap();

        let config = SurveyConfig {
            step: 2.0,
            cpu: 2,
            ..SurveyConfig::new(&input)
        };
        let summary = run(&config).unwrap();
        assert_eq!(summary.output, input.join("GIS").join("Survey_B_SSDM.gpkg"));
        assert_eq!(summary.files, 3);
        assert_eq!(summary.partial, vec![input.join("sss/broken.s7k"), second.clone()]);
        // Fixes at 0, 2, 4, 6, 8 and 0, 2.
        assert_eq!(summary.tracks.points, 7);
        assert_eq!(summary.tracks.lines, 2);

        let cache = NavigationCache::new(input.join("GIS").join("log")).unwrap();
        let cached = cache.load(&second).unwrap().unwrap();
        assert_eq!(cached.final_state, ReaderState::Corrupt);
        assert_eq!(cached.fixes.len(), 2);

        // A second run reuses the sidecars and writes a new container.
        let summary = run(&config).unwrap();
        assert_eq!(
            summary.output,
            input.join("GIS").join("Survey_B_SSDM_1.gpkg")
        );
        assert_eq!(summary.tracks.points, 7);
    }

    #[test]
    fn reprocess_rebuilds_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Survey_C");
        let line = input.join("line.jsf");
        write_jsf(&line, 1_700_000_000, 3);
        let cache = NavigationCache::new(input.join("GIS").join("log")).unwrap();

        let first = process_file(&line, SurveyFormat::Jsf, 1.0, &cache, false).unwrap();
        assert_eq!(first.fixes.len(), 3);
        write_jsf(&line, 1_700_000_000, 6);
        let stale = process_file(&line, SurveyFormat::Jsf, 1.0, &cache, false).unwrap();
        assert_eq!(stale.fixes.len(), 3);
        let fresh = process_file(&line, SurveyFormat::Jsf, 1.0, &cache, true).unwrap();
        assert_eq!(fresh.fixes.len(), 6);
        // A different step is never served from the cache.
        let coarse = process_file(&line, SurveyFormat::Jsf, 5.0, &cache, false).unwrap();
        assert_eq!(coarse.fixes.len(), 2);
    }

    #[test]
    fn equally_named_files_keep_their_own_navigation() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Survey_D");
        let day1 = input.join("day1/line.jsf");
        let day2 = input.join("day2/line.jsf");
        write_jsf(&day1, 1_700_000_000, 3);
        write_jsf(&day2, 1_700_001_000, 6);
        let cache = NavigationCache::new(input.join("GIS").join("log")).unwrap();

        let first = process_file(&day1, SurveyFormat::Jsf, 1.0, &cache, false).unwrap();
        let second = process_file(&day2, SurveyFormat::Jsf, 1.0, &cache, false).unwrap();
        assert_eq!((first.fixes.len(), second.fixes.len()), (3, 6));
        assert_eq!(second.source, day2);

        // A sidecar recorded for another file is not trusted.
        fs::copy(cache.path_for(&day1), cache.path_for(&day2)).unwrap();
        let again = process_file(&day2, SurveyFormat::Jsf, 1.0, &cache, false).unwrap();
        assert_eq!(again.fixes.len(), 6);
        assert_eq!(again.source, day2);
    }
}
