//! Durable storage of schema topic snapshots
//!
//! Snapshots are written to a temporary file next to the target and moved
//! into place with a single rename, so the target is never observed half
//! written. Replacing a file with different content first copies the old
//! file to a sibling stamped with its last modification time.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tempfile::NamedTempFile;
use tracing::info;

use crate::checksum::Checksum;
use crate::error::Result;
use crate::snapshot::TopicSnapshot;

const EXT: &str = ".json";
const INVALID_EXT: &str = ".invalid.json";
const COMPARE_CHUNK: usize = 4096;

/// What a store call did to the target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// No file existed yet.
    Created { path: PathBuf, checksum: Checksum },
    /// The file already held identical content and was left alone.
    Unchanged { path: PathBuf, checksum: Checksum },
    /// The file was replaced; the previous content was kept at `history`.
    Replaced {
        path: PathBuf,
        history: PathBuf,
        checksum: Checksum,
    },
}

impl StoreOutcome {
    pub fn path(&self) -> &Path {
        match self {
            StoreOutcome::Created { path, .. }
            | StoreOutcome::Unchanged { path, .. }
            | StoreOutcome::Replaced { path, .. } => path,
        }
    }

    pub fn checksum(&self) -> &Checksum {
        match self {
            StoreOutcome::Created { checksum, .. }
            | StoreOutcome::Unchanged { checksum, .. }
            | StoreOutcome::Replaced { checksum, .. } => checksum,
        }
    }
}

/// Storage medium for snapshot backups.
pub trait BackupStore: Send + Sync {
    /// Store a valid snapshot as the current backup.
    fn store(&self, snapshot: &TopicSnapshot) -> Result<StoreOutcome>;

    /// Store a snapshot that failed validation, without touching the valid
    /// backup.
    fn store_invalid(&self, snapshot: &TopicSnapshot) -> Result<StoreOutcome>;

    /// Load the current valid backup, `None` when there is none yet.
    fn load(&self) -> Result<Option<TopicSnapshot>>;

    fn path(&self) -> &Path;
}

/// Backup store writing JSON documents to the local filesystem.
#[derive(Debug, Clone)]
pub struct JsonBackupStore {
    path: PathBuf,
}

impl JsonBackupStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(Self { path })
    }

    /// Path of the invalid variant, `<base>.invalid.json`.
    pub fn invalid_path(&self) -> PathBuf {
        change_json_suffix(&self.path, INVALID_EXT)
    }

    fn parent(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn write(&self, snapshot: &TopicSnapshot, target: &Path, suffix: &str) -> Result<StoreOutcome> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".schema-backup")
            .suffix(suffix)
            .tempfile_in(self.parent())?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut writer, snapshot)?;
            writer.flush()?;
        }
        self.replace(tmp, target, suffix)
    }

    fn replace(&self, tmp: NamedTempFile, target: &Path, suffix: &str) -> Result<StoreOutcome> {
        let checksum = Checksum::from_file(tmp.path())?;

        if !target.exists() {
            info!(path = %target.display(), %checksum, "Creating new backup");
            tmp.persist(target)?;
            return Ok(StoreOutcome::Created {
                path: target.to_path_buf(),
                checksum,
            });
        }

        if content_equals(target, tmp.path())? {
            info!(path = %target.display(), "Not replacing old identical backup");
            tmp.close()?;
            return Ok(StoreOutcome::Unchanged {
                path: target.to_path_buf(),
                checksum,
            });
        }

        let modified: DateTime<Utc> = fs::metadata(target)?.modified()?.into();
        let history = change_json_suffix(
            &self.path,
            &format!(".{}{}", modified.to_rfc3339_opts(SecondsFormat::AutoSi, true), suffix),
        );
        info!(
            path = %target.display(),
            history = %history.display(),
            %checksum,
            "Creating new backup and moving the existing one aside"
        );
        fs::copy(target, &history)?;
        tmp.persist(target)?;
        Ok(StoreOutcome::Replaced {
            path: target.to_path_buf(),
            history,
            checksum,
        })
    }
}

impl BackupStore for JsonBackupStore {
    fn store(&self, snapshot: &TopicSnapshot) -> Result<StoreOutcome> {
        self.write(snapshot, &self.path, EXT)
    }

    fn store_invalid(&self, snapshot: &TopicSnapshot) -> Result<StoreOutcome> {
        self.write(snapshot, &self.invalid_path(), INVALID_EXT)
    }

    fn load(&self) -> Result<Option<TopicSnapshot>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let snapshot = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(snapshot))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Replace a trailing `.json` (any case) of the file name by `suffix`.
fn change_json_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let split = name.len().saturating_sub(EXT.len());
    let base = match name.get(split..) {
        Some(ext) if ext.eq_ignore_ascii_case(EXT) => &name[..split],
        _ => name.as_str(),
    };
    path.with_file_name(format!("{}{}", base, suffix))
}

/// Byte-for-byte comparison of two files, rejecting on size first.
pub fn content_equals(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }

    let mut first = BufReader::new(File::open(a)?);
    let mut second = BufReader::new(File::open(b)?);
    let mut buf1 = [0u8; COMPARE_CHUNK];
    let mut buf2 = [0u8; COMPARE_CHUNK];

    loop {
        let read1 = fill(&mut first, &mut buf1)?;
        let read2 = fill(&mut second, &mut buf2)?;
        if read1 != read2 || buf1[..read1] != buf2[..read2] {
            return Ok(false);
        }
        if read1 == 0 {
            return Ok(true);
        }
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
