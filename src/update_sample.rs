//! Replaces a sample's read files with uploaded replacements.
//!
//! The superseded generation is preserved in a legacy cache and every
//! analysis of the sample is pointed at it before the sample document is
//! switched over. Old files stay on disk; the sample's `prune` flag tells the
//! pruning collaborator they may be removed once nothing depends on them.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::caches::{CacheFile, legacy_trim_parameters};
use crate::db::{self, set_fields};
use crate::domain::{
    CacheId, Collection, FileId, Operation, Sample, SampleFile, SampleId, UploadFile, UploadRef,
    reads_file_name, sample_download_url,
};
use crate::error::KiraError;
use crate::fastqc::{self, Quality};
use crate::pipeline::{JobContext, Stage, Workflow};
use crate::process;
use crate::store;

pub const TASK: &str = "update_sample";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSampleArgs {
    pub sample_id: SampleId,
    #[serde(default)]
    pub paired: bool,
    #[serde(default)]
    pub files: Vec<FileReplacement>,
}

/// `id` names the current sample file that `replacement` supersedes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReplacement {
    pub id: String,
    pub replacement: UploadRef,
}

impl UpdateSampleArgs {
    pub fn to_value(&self) -> Result<Value, KiraError> {
        db::encode(self)
    }
}

/// A replacement upload resolved to filesystem paths.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub name: String,
    pub source: Utf8PathBuf,
    pub target: Utf8PathBuf,
    pub from: UploadRef,
}

#[derive(Debug, Clone)]
pub struct Params {
    pub sample_id: SampleId,
    pub paired: bool,
    pub sample_path: Utf8PathBuf,
    pub fastqc_path: Utf8PathBuf,
    pub legacy_path: Utf8PathBuf,
    pub files: Vec<ResolvedFile>,
    /// The generation being replaced, in declaration order.
    pub old_files: Vec<SampleFile>,
    pub old_quality: Option<Quality>,
}

impl Params {
    fn targets(&self) -> Vec<Utf8PathBuf> {
        self.files.iter().map(|file| file.target.clone()).collect()
    }

    /// Current location of an old file: the legacy area once it has been
    /// moved aside, the sample directory otherwise.
    fn old_file_path(&self, name: &str) -> Utf8PathBuf {
        locate_old_file(&self.sample_path, &self.legacy_path, name)
    }
}

fn locate_old_file(sample_path: &Utf8Path, legacy_path: &Utf8Path, name: &str) -> Utf8PathBuf {
    let moved = legacy_path.join(name);
    if moved.as_std_path().exists() {
        moved
    } else {
        sample_path.join(name)
    }
}

#[derive(Debug, Default)]
pub struct Intermediate {
    pub raw: Vec<SampleFile>,
    pub quality: Option<Quality>,
    pub cache_id: Option<CacheId>,
}

pub struct UpdateSample;

static STAGES: [Stage<UpdateSample>; 5] = [
    Stage {
        name: "copy_files",
        run: copy_files,
    },
    Stage {
        name: "fastqc",
        run: run_fastqc,
    },
    Stage {
        name: "parse_fastqc",
        run: parse_fastqc,
    },
    Stage {
        name: "create_cache",
        run: create_cache,
    },
    Stage {
        name: "replace_old",
        run: replace_old,
    },
];

impl Workflow for UpdateSample {
    type Params = Params;
    type Intermediate = Intermediate;

    const TASK: &'static str = TASK;

    fn stages(&self) -> &'static [Stage<Self>] {
        &STAGES
    }

    fn check_db(&self, ctx: &JobContext, args: &Value) -> Result<Params, KiraError> {
        let args: UpdateSampleArgs = serde_json::from_value(args.clone())
            .map_err(|err| KiraError::Validation(format!("malformed job arguments: {err}")))?;

        let sample: Sample = db::get(ctx.db.as_ref(), Collection::Samples, args.sample_id.as_str())?
            .ok_or_else(|| {
                KiraError::Validation(format!("sample {} does not exist", args.sample_id))
            })?;

        let sample_path = ctx.store.sample_dir(&sample.id);
        let legacy_path = ctx.store.sample_legacy_dir(&sample.id);
        let mut files = Vec::with_capacity(args.files.len());
        let mut old_files: Vec<SampleFile> = Vec::with_capacity(args.files.len());
        for (index, declared) in args.files.iter().enumerate() {
            if old_files.iter().any(|old| old.name == declared.id) {
                return Err(KiraError::Validation(format!(
                    "file {} of sample {} is replaced more than once",
                    declared.id, sample.id
                )));
            }
            let old = sample
                .files
                .iter()
                .find(|file| file.name == declared.id)
                .ok_or_else(|| {
                    KiraError::Validation(format!(
                        "sample {} has no file named {}",
                        sample.id, declared.id
                    ))
                })?;
            let on_disk = locate_old_file(&sample_path, &legacy_path, &old.name);
            if !on_disk.as_std_path().is_file() {
                return Err(KiraError::Validation(format!(
                    "file {} of sample {} is missing from {on_disk}",
                    old.name, sample.id
                )));
            }
            old_files.push(old.clone());
            files.push(resolve_upload(ctx, &sample.id, index, &declared.replacement)?);
        }

        // New files take canonical names and may land on any current file.
        if !files.is_empty() {
            let undeclared: Vec<&str> = sample
                .files
                .iter()
                .map(|file| file.name.as_str())
                .filter(|name| !old_files.iter().any(|old| old.name == *name))
                .collect();
            if !undeclared.is_empty() {
                return Err(KiraError::Validation(format!(
                    "replacement of sample {} must cover every current file; not declared: {}",
                    sample.id,
                    undeclared.join(", ")
                )));
            }
        }

        debug!(sample_id = %sample.id, files = files.len(), "resolved replacement files");
        Ok(Params {
            paired: args.paired,
            fastqc_path: ctx.store.sample_fastqc_dir(&sample.id),
            legacy_path,
            sample_id: sample.id,
            sample_path,
            files,
            old_files,
            old_quality: sample.quality,
        })
    }
}

fn resolve_upload(
    ctx: &JobContext,
    sample_id: &SampleId,
    index: usize,
    replacement: &UploadRef,
) -> Result<ResolvedFile, KiraError> {
    let upload: UploadFile = db::get(ctx.db.as_ref(), Collection::Files, replacement.id.as_str())?
        .ok_or_else(|| {
            KiraError::Validation(format!("uploaded file {} does not exist", replacement.id))
        })?;
    let source = ctx.store.upload_path(&upload.id);
    if !source.as_std_path().is_file() {
        return Err(KiraError::Validation(format!(
            "uploaded file {} is missing from {source}",
            upload.id
        )));
    }
    let name = reads_file_name(index);
    Ok(ResolvedFile {
        target: ctx.store.sample_dir(sample_id).join(&name),
        name,
        source,
        from: UploadRef {
            id: upload.id,
            name: replacement.name.clone().or(Some(upload.name)),
            size: replacement.size.or(Some(upload.size)),
        },
    })
}

fn copy_files(
    ctx: &JobContext,
    params: &Params,
    intermediate: &mut Intermediate,
) -> Result<(), KiraError> {
    store::ensure_dir(&params.sample_path)?;
    intermediate.raw.clear();
    for file in &params.files {
        move_aside_if_old(params, &file.name)?;
        let size = {
            let _slot = ctx.slots.acquire(1);
            process::copy_or_compress(&file.source, &file.target)?
        };
        debug!(source = %file.source, target = %file.target, size, "copied replacement");
        intermediate.raw.push(new_sample_file(params, file, size));
    }
    Ok(())
}

/// Moves an old file out of the way of the new file taking its name. A file
/// already in the legacy area is never overwritten; whatever then sits at the
/// canonical name is a new file from an interrupted attempt.
fn move_aside_if_old(params: &Params, name: &str) -> Result<(), KiraError> {
    if !params.old_files.iter().any(|old| old.name == name) {
        return Ok(());
    }
    let current = params.sample_path.join(name);
    let moved = params.legacy_path.join(name);
    if moved.as_std_path().exists() || !current.as_std_path().exists() {
        return Ok(());
    }
    store::ensure_dir(&params.legacy_path)?;
    fs::rename(current.as_std_path(), moved.as_std_path())
        .map_err(|err| KiraError::fs(format!("move {current} to {moved}: {err}")))?;
    debug!(%current, %moved, "moved old file aside");
    Ok(())
}

fn new_sample_file(params: &Params, file: &ResolvedFile, size: u64) -> SampleFile {
    SampleFile {
        name: file.name.clone(),
        size,
        download_url: sample_download_url(&params.sample_id, &file.name),
        from: Some(file.from.clone()),
        raw: true,
    }
}

fn run_fastqc(
    ctx: &JobContext,
    params: &Params,
    _intermediate: &mut Intermediate,
) -> Result<(), KiraError> {
    store::recreate_dir(&params.fastqc_path)?;
    fastqc::run_fastqc(
        ctx.runner.as_ref(),
        &ctx.slots,
        &ctx.settings.fastqc_path,
        ctx.settings.proc,
        &params.targets(),
        &params.fastqc_path,
    )
}

fn parse_fastqc(
    _ctx: &JobContext,
    params: &Params,
    intermediate: &mut Intermediate,
) -> Result<(), KiraError> {
    let quality = fastqc::parse_fastqc(&params.fastqc_path)?;
    debug!(count = quality.count, gc = quality.gc, "parsed QC report");
    intermediate.quality = Some(quality);
    Ok(())
}

fn create_cache(
    ctx: &JobContext,
    params: &Params,
    intermediate: &mut Intermediate,
) -> Result<(), KiraError> {
    let caches = ctx.caches();
    let cache_id = caches.create(
        &params.sample_id,
        &legacy_trim_parameters(),
        params.paired,
        true,
    )?;
    let cache_path = caches.create_dir(&cache_id)?;

    let mut files = Vec::with_capacity(params.old_files.len());
    for (index, old) in params.old_files.iter().enumerate() {
        let name = reads_file_name(index);
        let size = {
            let _slot = ctx.slots.acquire(1);
            process::copy_or_compress(&params.old_file_path(&old.name), &cache_path.join(&name))?
        };
        files.push(CacheFile { name, size });
    }

    caches.finalize(&cache_id, files, params.old_quality.clone())?;
    caches.repoint_analyses(&params.sample_id, &cache_id)?;
    intermediate.cache_id = Some(cache_id);
    Ok(())
}

fn replace_old(
    ctx: &JobContext,
    params: &Params,
    intermediate: &mut Intermediate,
) -> Result<(), KiraError> {
    // After a resume the copy stage's records are gone; rebuild them from disk.
    let files = if intermediate.raw.len() == params.files.len() {
        std::mem::take(&mut intermediate.raw)
    } else {
        let mut files = Vec::with_capacity(params.files.len());
        for file in &params.files {
            files.push(new_sample_file(params, file, store::file_size(&file.target)?));
        }
        files
    };
    let quality = match intermediate.quality.take() {
        Some(quality) => quality,
        None => fastqc::parse_fastqc(&params.fastqc_path)?,
    };

    let matched = ctx.db.update_one(
        Collection::Samples,
        params.sample_id.as_str(),
        set_fields([
            ("files", db::encode(&files)?),
            ("quality", db::encode(&quality)?),
            ("prune", Value::Bool(true)),
        ]),
    )?;
    if !matched {
        return Err(KiraError::StorageWrite(format!(
            "sample {} disappeared before its files were replaced",
            params.sample_id
        )));
    }
    info!(sample_id = %params.sample_id, files = files.len(), "replaced sample files");
    ctx.dispatch(
        Collection::Samples,
        Operation::Update,
        vec![params.sample_id.to_string()],
    );
    Ok(())
}

/// Parses a `<old-name>=<upload-id>` pair.
pub fn parse_replacement(raw: &str) -> Result<FileReplacement, KiraError> {
    let (old, upload) = raw.split_once('=').ok_or_else(|| {
        KiraError::Validation(format!("expected <old-name>=<upload-id>, got {raw}"))
    })?;
    let old = old.trim();
    if old.is_empty() {
        return Err(KiraError::Validation(format!("missing old file name in {raw}")));
    }
    let id: FileId = upload.parse()?;
    Ok(FileReplacement {
        id: old.to_string(),
        replacement: UploadRef {
            id,
            name: None,
            size: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn stage_names_are_fixed() {
        assert_eq!(
            UpdateSample.stage_names(),
            vec!["copy_files", "fastqc", "parse_fastqc", "create_cache", "replace_old"]
        );
    }

    #[test]
    fn parses_replacement_pair() {
        let parsed = parse_replacement("reads_1.fq.gz=up1").unwrap();
        assert_eq!(parsed.id, "reads_1.fq.gz");
        assert_eq!(parsed.replacement.id.as_str(), "up1");
        assert_matches!(parse_replacement("nope"), Err(KiraError::Validation(_)));
        assert_matches!(parse_replacement("=up1"), Err(KiraError::Validation(_)));
    }

    #[test]
    fn args_round_trip_through_job_document() {
        let args = UpdateSampleArgs {
            sample_id: "S1".parse().unwrap(),
            paired: true,
            files: vec![parse_replacement("reads_1.fq.gz=up1").unwrap()],
        };
        let value = args.to_value().unwrap();
        assert_eq!(value["files"][0]["replacement"]["id"], "up1");
        let back: UpdateSampleArgs = serde_json::from_value(value).unwrap();
        assert_eq!(back, args);
    }
}
