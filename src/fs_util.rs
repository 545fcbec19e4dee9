use std::fs;
use std::io;

use camino::Utf8Path;
use zip::ZipArchive;

use crate::error::KiraError;

/// Extracts a QC report archive into `target_dir`, refusing entries that
/// would escape it.
pub fn extract_zip(zip_path: &Utf8Path, target_dir: &Utf8Path) -> Result<(), KiraError> {
    let file = fs::File::open(zip_path.as_std_path())
        .map_err(|err| KiraError::Filesystem(format!("open zip {zip_path}: {err}")))?;
    let mut archive = ZipArchive::new(file).map_err(|err| KiraError::QcParse {
        path: zip_path.to_path_buf(),
        message: err.to_string(),
    })?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|err| KiraError::QcParse {
            path: zip_path.to_path_buf(),
            message: err.to_string(),
        })?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.as_std_path().join(path),
            None => {
                return Err(KiraError::Filesystem(format!(
                    "zip entry path traversal detected in {zip_path}"
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(KiraError::fs)?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(KiraError::fs)?;
        }
        let mut outfile = fs::File::create(&entry_path).map_err(KiraError::fs)?;
        io::copy(&mut entry, &mut outfile).map_err(KiraError::fs)?;
    }
    Ok(())
}
