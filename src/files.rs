//! Uploaded files: the producer side of job inputs.

use tracing::info;

use crate::db::{self, DocumentStore, Filter};
use crate::dispatch::Dispatcher;
use crate::domain::{Collection, FileId, Operation, UploadFile};
use crate::error::KiraError;
use crate::store::{self, ArtifactStore};

/// Uploads that are complete and not claimed by a job, oldest first.
pub fn find(db: &dyn DocumentStore, file_type: Option<&str>) -> Result<Vec<UploadFile>, KiraError> {
    let mut filter = Filter::new().eq("ready", true).eq("reserved", false);
    if let Some(file_type) = file_type {
        filter = filter.eq("type", file_type);
    }
    let mut files = db
        .find(Collection::Files, &filter)?
        .into_iter()
        .map(|value| db::decode::<UploadFile>(Collection::Files, value))
        .collect::<Result<Vec<_>, _>>()?;
    files.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then_with(|| a.id.cmp(&b.id)));
    Ok(files)
}

/// Deletes the upload document and its file. A missing physical file is not
/// an error; a missing document is.
pub fn remove(
    db: &dyn DocumentStore,
    store: &ArtifactStore,
    dispatcher: &dyn Dispatcher,
    file_id: &FileId,
) -> Result<(), KiraError> {
    if !db.delete_one(Collection::Files, file_id.as_str())? {
        return Err(KiraError::not_found(Collection::Files.as_str(), file_id.as_str()));
    }
    let removed = store::remove_file_if_exists(&store.upload_path(file_id))?;
    info!(%file_id, removed, "removed upload");
    dispatcher.dispatch(Collection::Files, Operation::Remove, vec![file_id.to_string()]);
    Ok(())
}
