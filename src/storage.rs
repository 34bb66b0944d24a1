// src/storage.rs
//
// Versioned content store. On disk each object is a directory whose entries
// are decimal version numbers; the highest complete one is current. Readers
// get an mmap-backed snapshot that stays valid across later publications.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::error::{VersoError, VersoResult};
use crate::stream::{Stream, BUFFER_SIZE_MAX};

/// An immutable snapshot of one stored version.
///
/// The mapping is private and read-only; publishing a newer version does not
/// disturb holders of an older snapshot. Dropping the last handle unmaps.
pub struct FileInfo {
    map: Mmap,
    version: u32,
}

impl FileInfo {
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

/// The store: a root directory plus one cached current snapshot per name.
/// The mutex guards only the cache map; snapshot data needs no locking.
pub struct Storage {
    root: PathBuf,
    cache: Mutex<HashMap<Vec<u8>, Arc<FileInfo>>>,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Storage {
        Storage {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the current snapshot for `name`, loading and caching it on
    /// first use. Fails with `Missing` when the object has no versions.
    pub fn get(&self, name: &[u8]) -> VersoResult<Arc<FileInfo>> {
        let mut cache = self.cache.lock().map_err(|_| VersoError::Unknown)?;

        if let Some(info) = cache.get(name) {
            return Ok(info.clone());
        }

        let dir = self.object_dir(name)?;
        let version = latest_version(&dir)?;
        let info = Arc::new(load(&dir, version)?);
        cache.insert(name.to_vec(), info.clone());
        Ok(info)
    }

    /// Streams `size` bytes from the connection into a new version of
    /// `name` and publishes it. The bytes land in a temporary file that is
    /// renamed into place only once complete, so a crash can never leave a
    /// partial file that a later scan would adopt as current.
    ///
    /// Readers holding the previous snapshot keep seeing the old bytes
    /// until they release it.
    pub fn set(&self, name: &[u8], stream: &mut Stream, size: u64) -> VersoResult<()> {
        let dir = self.object_dir(name)?;

        // Pick the next version number under the lock, then release it for
        // the transfer so readers of other objects are not held up.
        let version = {
            let cache = self.cache.lock().map_err(|_| VersoError::Unknown)?;
            match cache.get(name) {
                Some(info) => info.version + 1,
                None => match latest_version(&dir) {
                    Ok(version) => version + 1,
                    Err(VersoError::Missing) => {
                        fs::create_dir_all(&dir)?;
                        1
                    }
                    Err(error) => return Err(error),
                },
            }
        };

        let staging = dir.join(format!(".tmp-{}", version));
        let path = dir.join(version.to_string());

        let result = write_version(&staging, stream, size);
        if let Err(error) = result {
            let _ = fs::remove_file(&staging);
            warn!(version, error = %error, "discarding partial version");
            return Err(error);
        }
        fs::rename(&staging, &path)?;
        debug!(version, path = %path.display(), "published version");

        // Publish: later readers see the new snapshot, existing references
        // stay on the old one.
        let info = Arc::new(load(&dir, version)?);
        let mut cache = self.cache.lock().map_err(|_| VersoError::Unknown)?;
        cache.insert(name.to_vec(), info);
        Ok(())
    }

    fn object_dir(&self, name: &[u8]) -> VersoResult<PathBuf> {
        if name.is_empty() {
            return Err(VersoError::Missing);
        }
        let name = std::str::from_utf8(name).map_err(|_| VersoError::Input)?;
        Ok(self.root.join(name))
    }
}

fn write_version(path: &Path, stream: &mut Stream, size: u64) -> VersoResult<()> {
    let mut file = fs::File::create(path)?;
    file.set_len(size)?;

    let mut remaining = size as usize;
    while remaining > 0 {
        let buffer = stream.read(remaining.min(BUFFER_SIZE_MAX))?;
        // The stream may have buffered bytes beyond this body.
        let take = buffer.len().min(remaining);
        file.write_all(&buffer[..take])?;
        stream.read_flush(take);
        remaining -= take;
    }

    file.sync_all()?;
    Ok(())
}

// Scans the version directory for the largest decimal filename.
fn latest_version(dir: &Path) -> VersoResult<u32> {
    let entries = fs::read_dir(dir)?;
    let mut version: Option<u32> = None;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Ok(number) = name.parse::<u32>() else {
            continue;
        };
        version = Some(version.map_or(number, |v| v.max(number)));
    }

    version.ok_or(VersoError::Missing)
}

fn load(dir: &Path, version: u32) -> VersoResult<FileInfo> {
    let file = fs::File::open(dir.join(version.to_string()))?;
    let map = unsafe { Mmap::map(&file)? };
    Ok(FileInfo { map, version })
}
