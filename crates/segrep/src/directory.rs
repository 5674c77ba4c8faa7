//! Local segment directory: where a shard copy keeps its segment files.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{SegrepError, SegrepResult};
use crate::manifest::StoreFileMetadata;

/// Prefix for files still being fetched; never part of a visible generation.
pub const TEMP_FILE_PREFIX: &str = "replication.";

/// Local file storage of one shard copy.
pub trait Directory: Send + Sync {
    /// Write (or overwrite) a file.
    fn write_file(&self, name: &str, data: &[u8]) -> SegrepResult<()>;
    /// Read a whole file.
    fn read_file(&self, name: &str) -> SegrepResult<Bytes>;
    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> SegrepResult<()>;
    /// Atomically rename a file, replacing any existing target.
    fn rename(&self, from: &str, to: &str) -> SegrepResult<()>;
    /// All file names, sorted.
    fn list_all(&self) -> SegrepResult<Vec<String>>;

    /// True if the file exists.
    fn contains(&self, name: &str) -> SegrepResult<bool> {
        Ok(self.list_all()?.iter().any(|n| n == name))
    }

    /// Metadata for every non-temporary file.
    fn metadata_map(&self, written_by: u32) -> SegrepResult<BTreeMap<String, StoreFileMetadata>> {
        let mut map = BTreeMap::new();
        for name in self.list_all()? {
            if name.starts_with(TEMP_FILE_PREFIX) {
                continue;
            }
            let data = self.read_file(&name)?;
            map.insert(name.clone(), StoreFileMetadata::of(name, &data, written_by));
        }
        Ok(map)
    }
}

/// Heap-backed directory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    files: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    /// True if there are no files.
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}

impl Directory for InMemoryDirectory {
    fn write_file(&self, name: &str, data: &[u8]) -> SegrepResult<()> {
        self.files
            .write()
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn read_file(&self, name: &str) -> SegrepResult<Bytes> {
        self.files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SegrepError::FileNotFound {
                name: name.to_string(),
            })
    }

    fn delete_file(&self, name: &str) -> SegrepResult<()> {
        self.files.write().remove(name);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> SegrepResult<()> {
        let mut files = self.files.write();
        let data = files.remove(from).ok_or_else(|| SegrepError::FileNotFound {
            name: from.to_string(),
        })?;
        files.insert(to.to_string(), data);
        Ok(())
    }

    fn list_all(&self) -> SegrepResult<Vec<String>> {
        Ok(self.files.read().keys().cloned().collect())
    }

    fn contains(&self, name: &str) -> SegrepResult<bool> {
        Ok(self.files.read().contains_key(name))
    }
}

/// Directory backed by a filesystem path.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Open (creating if needed) a directory at `root`.
    pub fn open(root: impl AsRef<Path>) -> SegrepResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(path = %root.display(), "opened segment directory");
        Ok(Self { root })
    }

    /// Root path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> SegrepResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(SegrepError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid file name [{}]", name),
            )));
        }
        Ok(self.root.join(name))
    }
}

impl Directory for FsDirectory {
    fn write_file(&self, name: &str, data: &[u8]) -> SegrepResult<()> {
        let path = self.resolve(name)?;
        let mut file = fs::File::create(&path)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    fn read_file(&self, name: &str) -> SegrepResult<Bytes> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SegrepError::FileNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_file(&self, name: &str) -> SegrepResult<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> SegrepResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        match fs::rename(&src, &dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SegrepError::FileNotFound {
                name: from.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn list_all(&self) -> SegrepResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
