use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::domain::{CacheId, FileId, JobId, SampleId};
use crate::error::KiraError;

/// Filesystem layout under the data root:
/// `files/<file_id>` uploads, `samples/<sample_id>/` working areas,
/// `caches/<cache_id>/` cache snapshots, `db/` for the document store and
/// `locks/<job_id>.lock` run claims.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn files_dir(&self) -> Utf8PathBuf {
        self.root.join("files")
    }

    pub fn upload_path(&self, id: &FileId) -> Utf8PathBuf {
        self.files_dir().join(id.as_str())
    }

    pub fn sample_dir(&self, id: &SampleId) -> Utf8PathBuf {
        self.root.join("samples").join(id.as_str())
    }

    pub fn sample_fastqc_dir(&self, id: &SampleId) -> Utf8PathBuf {
        self.sample_dir(id).join("fastqc")
    }

    /// Where superseded files are moved when a new file takes their name.
    pub fn sample_legacy_dir(&self, id: &SampleId) -> Utf8PathBuf {
        self.sample_dir(id).join("legacy")
    }

    pub fn cache_dir(&self, id: &CacheId) -> Utf8PathBuf {
        self.root.join("caches").join(id.as_str())
    }

    pub fn db_dir(&self) -> Utf8PathBuf {
        self.root.join("db")
    }

    pub fn locks_dir(&self) -> Utf8PathBuf {
        self.root.join("locks")
    }

    /// Exclusive run claim of a job, held by whichever process created it.
    pub fn job_lock_path(&self, id: &JobId) -> Utf8PathBuf {
        self.locks_dir().join(format!("{}.lock", id.as_str()))
    }

    pub fn ensure_layout(&self) -> Result<(), KiraError> {
        for dir in ["files", "samples", "caches", "db", "locks"] {
            ensure_dir(&self.root.join(dir))?;
        }
        Ok(())
    }
}

pub fn ensure_dir(path: &Utf8Path) -> Result<(), KiraError> {
    fs::create_dir_all(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("create {path}: {err}")))
}

/// Creates `path` and fails if it is already present. Parents are created.
pub fn create_dir_fresh(path: &Utf8Path) -> Result<(), KiraError> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::create_dir(path.as_std_path()).map_err(|err| match err.kind() {
        io::ErrorKind::AlreadyExists => {
            KiraError::Filesystem(format!("directory already exists: {path}"))
        }
        _ => KiraError::Filesystem(format!("create {path}: {err}")),
    })
}

/// Removes `path` when present and creates it empty.
pub fn recreate_dir(path: &Utf8Path) -> Result<(), KiraError> {
    match fs::remove_dir_all(path.as_std_path()) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(KiraError::Filesystem(format!("remove {path}: {err}"))),
    }
    create_dir_fresh(path)
}

/// Returns `true` when a file was removed.
pub fn remove_file_if_exists(path: &Utf8Path) -> Result<bool, KiraError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(KiraError::Filesystem(format!("remove {path}: {err}"))),
    }
}

pub fn file_size(path: &Utf8Path) -> Result<u64, KiraError> {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.len())
        .map_err(|err| KiraError::Filesystem(format!("stat {path}: {err}")))
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem(format!("invalid destination path: {path}")))?;
    ensure_dir(parent)?;
    let mut temp = Builder::new()
        .prefix(".kira-write")
        .tempfile_in(parent.as_std_path())
        .map_err(KiraError::fs)?;
    io::Write::write_all(&mut temp, content).map_err(KiraError::fs)?;
    temp.as_file().sync_all().map_err(KiraError::fs)?;
    temp.persist(path.as_std_path()).map_err(KiraError::fs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, ArtifactStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, ArtifactStore::new(root))
    }

    #[test]
    fn layout_paths() {
        let store = ArtifactStore::new("/data");
        let sample: SampleId = "S1".parse().unwrap();
        let cache: CacheId = "c0ffee".parse().unwrap();
        let upload: FileId = "abc-reads.fq".parse().unwrap();

        assert_eq!(store.sample_dir(&sample), Utf8PathBuf::from("/data/samples/S1"));
        assert!(store.sample_fastqc_dir(&sample).ends_with("samples/S1/fastqc"));
        assert_eq!(store.cache_dir(&cache), Utf8PathBuf::from("/data/caches/c0ffee"));
        assert_eq!(
            store.upload_path(&upload),
            Utf8PathBuf::from("/data/files/abc-reads.fq")
        );
    }

    #[test]
    fn fresh_dir_refuses_existing() {
        let (_temp, store) = temp_store();
        let dir = store.root().join("caches").join("one");
        create_dir_fresh(&dir).unwrap();
        assert!(create_dir_fresh(&dir).is_err());
    }

    #[test]
    fn recreate_clears_contents() {
        let (_temp, store) = temp_store();
        let dir = store.root().join("fastqc");
        create_dir_fresh(&dir).unwrap();
        fs::write(dir.join("stale.txt").as_std_path(), b"old").unwrap();
        recreate_dir(&dir).unwrap();
        assert!(dir.as_std_path().is_dir());
        assert!(!dir.join("stale.txt").as_std_path().exists());
    }

    #[test]
    fn atomic_write_replaces_file() {
        let (_temp, store) = temp_store();
        let path = store.root().join("db").join("doc.json");
        write_bytes_atomic(&path, b"one").unwrap();
        write_bytes_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(path.as_std_path()).unwrap(), b"two");
        assert!(!remove_file_if_exists(&store.root().join("missing")).unwrap());
    }
}
