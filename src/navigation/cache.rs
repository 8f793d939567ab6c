use super::*;
use rustc_hash::FxHasher;
use std::{
    fs,
    hash::{Hash, Hasher},
    io::{BufReader, BufWriter, Write},
    path::Path,
};
use tempfile::NamedTempFile;

/// The extraction result of one input file as stored next to the output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedNavigation {
    pub source: PathBuf,
    pub format: String,
    pub step: f64,
    pub final_state: ReaderState,
    pub fixes: Vec<NavigationFix>,
}

/// One JSON sidecar per input file, kept in a single directory.
#[derive(Clone, Debug)]
pub struct NavigationCache {
    dir: PathBuf,
}

impl NavigationCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context(CacheIoSnafu { path: dir.clone() })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<file name>_<path hash>_navigation.json`, so equally named files in different folders
    /// get their own sidecar.
    pub fn path_for(&self, input: &Path) -> PathBuf {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mut hasher = FxHasher::default();
        input.hash(&mut hasher);
        self.dir
            .join(format!("{name}_{:016x}_navigation.json", hasher.finish()))
    }

    /// The cached result for `input`, if there is one.
    pub fn load(&self, input: &Path) -> Result<Option<CachedNavigation>> {
        let path = self.path_for(input);
        if !path.exists() {
            return Ok(None);
        }
        let file = fs::File::open(&path).context(CacheIoSnafu { path: path.clone() })?;
        let cached = serde_json::from_reader(BufReader::new(file))
            .context(CacheFormatSnafu { path })?;
        Ok(Some(cached))
    }

    /// Write the sidecar for `cached.source`. Readers never observe a half written file.
    pub fn store(&self, cached: &CachedNavigation) -> Result<PathBuf> {
        let path = self.path_for(&cached.source);
        let temp = NamedTempFile::new_in(&self.dir).context(CacheIoSnafu {
            path: self.dir.clone(),
        })?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, cached)
                .context(CacheFormatSnafu { path: path.clone() })?;
            writer
                .flush()
                .context(CacheIoSnafu { path: path.clone() })?;
        }
        temp.persist(&path).context(CachePersistSnafu)?;
        Ok(path)
    }

    pub fn invalidate(&self, input: &Path) -> Result<()> {
        let path = self.path_for(input);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(CacheIoSnafu { path }),
        }
    }
}
