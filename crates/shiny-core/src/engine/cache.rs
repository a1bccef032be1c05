use super::error::EngineError;
use crate::core::fitting::BFactorFit;
use crate::core::io::tables::{BfactorRecord, TableError, read_bfactors, write_records};
use crate::core::models::ids::HalfSet;
use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use ndarray::Array3;
use num_complex::Complex64;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::debug;

const MAGIC: &[u8; 8] = b"SHNYVOL1";
const EXTENSION: &str = "vol";
const BFACTOR_PREFIX: &str = "bfactors_";

/// Identifies one single-frame, single-half reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameHalfKey {
    pub frame: usize,
    pub half: HalfSet,
}

impl FrameHalfKey {
    pub fn new(frame: usize, half: HalfSet) -> Self {
        Self { frame, half }
    }

    fn file_name(&self) -> String {
        format!("frame{:04}_half{}.{EXTENSION}", self.frame, self.half.number())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error for '{path}': {source}")]
    Io { path: String, source: io::Error },
    #[error("corrupt cache entry '{path}': {reason}")]
    Corrupt { path: String, reason: String },
    #[error("cache lock poisoned by a panicking worker")]
    Poisoned,
    #[error("cached B-factor table: {0}")]
    Table(#[from] TableError),
}

/// Backing storage for reconstructed Fourier volumes and the per-frame B-factor fits
/// derived from them.
///
/// Each entry carries the fingerprint of the settings it was computed with; a load with a
/// different fingerprint is a miss.
pub trait ReconstructionStore: Send + Sync {
    fn load(&self, key: FrameHalfKey, fingerprint: u64) -> Result<Option<Array3<Complex64>>, CacheError>;
    fn save(&self, key: FrameHalfKey, fingerprint: u64, volume: &Array3<Complex64>) -> Result<(), CacheError>;
    fn load_bfactors(&self, fingerprint: u64) -> Result<Option<Vec<(usize, BFactorFit)>>, CacheError>;
    fn save_bfactors(&self, fingerprint: u64, fits: &[(usize, BFactorFit)]) -> Result<(), CacheError>;
    /// Drops every volume and fit table.
    fn invalidate_all(&self) -> Result<(), CacheError>;
}

/// Volumes kept in memory for the lifetime of the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<FrameHalfKey, (u64, Array3<Complex64>)>>,
    bfactors: Mutex<HashMap<u64, Vec<(usize, BFactorFit)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReconstructionStore for MemoryStore {
    fn load(&self, key: FrameHalfKey, fingerprint: u64) -> Result<Option<Array3<Complex64>>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(entries
            .get(&key)
            .filter(|(stored, _)| *stored == fingerprint)
            .map(|(_, volume)| volume.clone()))
    }

    fn save(&self, key: FrameHalfKey, fingerprint: u64, volume: &Array3<Complex64>) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        entries.insert(key, (fingerprint, volume.clone()));
        Ok(())
    }

    fn load_bfactors(&self, fingerprint: u64) -> Result<Option<Vec<(usize, BFactorFit)>>, CacheError> {
        let bfactors = self.bfactors.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(bfactors.get(&fingerprint).cloned())
    }

    fn save_bfactors(&self, fingerprint: u64, fits: &[(usize, BFactorFit)]) -> Result<(), CacheError> {
        let mut bfactors = self.bfactors.lock().map_err(|_| CacheError::Poisoned)?;
        bfactors.insert(fingerprint, fits.to_vec());
        Ok(())
    }

    fn invalidate_all(&self) -> Result<(), CacheError> {
        self.entries.lock().map_err(|_| CacheError::Poisoned)?.clear();
        self.bfactors.lock().map_err(|_| CacheError::Poisoned)?.clear();
        Ok(())
    }
}

/// Volumes persisted as one binary file per key, so an interrupted run can resume.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: FrameHalfKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    fn bfactor_path(&self, fingerprint: u64) -> PathBuf {
        self.root.join(format!("{BFACTOR_PREFIX}{fingerprint:016x}.csv"))
    }
}

fn is_cache_file(path: &Path) -> bool {
    let is_bfactor_table = path.extension().is_some_and(|ext| ext == "csv")
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(BFACTOR_PREFIX));
    is_bfactor_table || path.extension().is_some_and(|ext| ext == EXTENSION)
}

fn io_error(path: &Path, source: io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    }
}

fn read_volume(reader: &mut impl Read, fingerprint: u64) -> io::Result<Option<Array3<Complex64>>> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }
    if reader.read_u64::<LE>()? != fingerprint {
        return Ok(None);
    }
    let nz = reader.read_u32::<LE>()? as usize;
    let ny = reader.read_u32::<LE>()? as usize;
    let nx = reader.read_u32::<LE>()? as usize;
    let mut values = Vec::with_capacity(nz * ny * nx);
    for _ in 0..nz * ny * nx {
        let re = reader.read_f64::<LE>()?;
        let im = reader.read_f64::<LE>()?;
        values.push(Complex64::new(re, im));
    }
    Array3::from_shape_vec((nz, ny, nx), values)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn write_volume(writer: &mut impl Write, fingerprint: u64, volume: &Array3<Complex64>) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_u64::<LE>(fingerprint)?;
    let (nz, ny, nx) = volume.dim();
    for d in [nz, ny, nx] {
        writer.write_u32::<LE>(d as u32)?;
    }
    for v in volume.iter() {
        writer.write_f64::<LE>(v.re)?;
        writer.write_f64::<LE>(v.im)?;
    }
    writer.flush()
}

impl ReconstructionStore for DirectoryStore {
    fn load(&self, key: FrameHalfKey, fingerprint: u64) -> Result<Option<Array3<Complex64>>, CacheError> {
        let path = self.path_for(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        match read_volume(&mut BufReader::new(file), fingerprint) {
            Ok(None) => {
                debug!(path = %path.display(), "Cached volume is stale, recomputing.");
                Ok(None)
            }
            Ok(volume) => Ok(volume),
            Err(e) => Err(CacheError::Corrupt {
                path: path.to_string_lossy().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn save(&self, key: FrameHalfKey, fingerprint: u64, volume: &Array3<Complex64>) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).map_err(|e| io_error(&self.root, e))?;
        let path = self.path_for(key);
        let file = File::create(&path).map_err(|e| io_error(&path, e))?;
        write_volume(&mut BufWriter::new(file), fingerprint, volume).map_err(|e| io_error(&path, e))
    }

    fn load_bfactors(&self, fingerprint: u64) -> Result<Option<Vec<(usize, BFactorFit)>>, CacheError> {
        let path = self.bfactor_path(fingerprint);
        if !path.exists() {
            return Ok(None);
        }
        let records = read_bfactors(&path)?;
        debug!(path = %path.display(), frames = records.len(), "Stored B-factor fits found.");
        Ok(Some(records.iter().map(|r| (r.frame, r.fit())).collect()))
    }

    fn save_bfactors(&self, fingerprint: u64, fits: &[(usize, BFactorFit)]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.root).map_err(|e| io_error(&self.root, e))?;
        let records: Vec<BfactorRecord> = fits.iter().map(|(frame, fit)| BfactorRecord::new(*frame, fit)).collect();
        write_records(&self.bfactor_path(fingerprint), &records)?;
        Ok(())
    }

    fn invalidate_all(&self) -> Result<(), CacheError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(&self.root, e)),
        };
        for entry in entries {
            let path = entry.map_err(|e| io_error(&self.root, e))?.path();
            if is_cache_file(&path) {
                fs::remove_file(&path).map_err(|e| io_error(&path, e))?;
            }
        }
        Ok(())
    }
}

/// Memoises single-frame reconstructions through a [`ReconstructionStore`].
///
/// Safe to share between workers: every key is computed by exactly one unit of work, and
/// the hit/compute counters are atomic.
pub struct ReconstructionCache<'a> {
    store: &'a dyn ReconstructionStore,
    fingerprint: u64,
    hits: AtomicUsize,
    computed: AtomicUsize,
}

impl<'a> ReconstructionCache<'a> {
    pub fn new(store: &'a dyn ReconstructionStore, fingerprint: u64) -> Self {
        Self {
            store,
            fingerprint,
            hits: AtomicUsize::new(0),
            computed: AtomicUsize::new(0),
        }
    }

    pub fn get_or_compute<F>(&self, key: FrameHalfKey, compute: F) -> Result<Array3<Complex64>, EngineError>
    where
        F: FnOnce() -> Result<Array3<Complex64>, EngineError>,
    {
        if let Some(volume) = self.store.load(key, self.fingerprint)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(frame = key.frame, half = %key.half, "Reconstruction served from cache.");
            return Ok(volume);
        }
        let volume = compute()?;
        self.store.save(key, self.fingerprint, &volume)?;
        self.computed.fetch_add(1, Ordering::Relaxed);
        Ok(volume)
    }

    pub fn invalidate_all(&self) -> Result<(), CacheError> {
        self.store.invalidate_all()
    }

    /// Fingerprint of the reconstructions this cache serves.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn load_bfactors(&self, fingerprint: u64) -> Result<Option<Vec<(usize, BFactorFit)>>, CacheError> {
        self.store.load_bfactors(fingerprint)
    }

    pub fn save_bfactors(&self, fingerprint: u64, fits: &[(usize, BFactorFit)]) -> Result<(), CacheError> {
        self.store.save_bfactors(fingerprint, fits)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn computed(&self) -> usize {
        self.computed.load(Ordering::Relaxed)
    }
}
