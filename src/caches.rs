//! Immutable snapshots of a sample's processed reads.
//!
//! A cache document is inserted with `ready=false` and an empty file list so
//! dependents can reference its id early. `finalize` sets the file list, the
//! quality summary and `ready=true` in one write; after that the cache does
//! not change.

use std::fmt::Write as _;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::db::{self, DocumentStore, Filter, set_fields};
use crate::dispatch::Dispatcher;
use crate::domain::{CacheId, Collection, EntityRef, Operation, SampleId};
use crate::error::KiraError;
use crate::fastqc::Quality;
use crate::store::{self, ArtifactStore};

/// Read-trimming parameters a cache was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimParameters {
    pub program: String,
    pub mode: String,
    pub end_quality: u32,
    pub mean_quality: u32,
    pub min_length: u32,
    pub max_length: Option<u32>,
    pub max_error_rate: f64,
    pub max_indel_rate: f64,
}

/// Parameters that files produced by the initial sample-creation trimming
/// step are assumed to have been trimmed with.
pub fn legacy_trim_parameters() -> TrimParameters {
    TrimParameters {
        program: "skewer-0.2.2".to_string(),
        mode: "pe".to_string(),
        end_quality: 20,
        mean_quality: 25,
        min_length: 20,
        max_length: None,
        max_error_rate: 0.1,
        max_indel_rate: 0.03,
    }
}

pub fn parameters_hash(parameters: &TrimParameters) -> Result<String, KiraError> {
    let bytes = serde_json::to_vec(parameters)
        .map_err(|err| KiraError::StorageWrite(err.to_string()))?;
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFile {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cache {
    #[serde(rename = "_id")]
    pub id: CacheId,
    pub sample: EntityRef,
    pub parameters: TrimParameters,
    pub hash: String,
    pub paired: bool,
    pub legacy: bool,
    pub ready: bool,
    #[serde(default)]
    pub files: Vec<CacheFile>,
    #[serde(default)]
    pub quality: Option<Quality>,
    pub created_at: DateTime<Utc>,
}

pub struct CacheManager<'a> {
    db: &'a dyn DocumentStore,
    dispatcher: &'a dyn Dispatcher,
    store: &'a ArtifactStore,
}

impl<'a> CacheManager<'a> {
    pub fn new(
        db: &'a dyn DocumentStore,
        dispatcher: &'a dyn Dispatcher,
        store: &'a ArtifactStore,
    ) -> Self {
        Self {
            db,
            dispatcher,
            store,
        }
    }

    /// Inserts an unready cache record and returns its id.
    pub fn create(
        &self,
        sample_id: &SampleId,
        parameters: &TrimParameters,
        paired: bool,
        legacy: bool,
    ) -> Result<CacheId, KiraError> {
        let cache = Cache {
            id: CacheId::generate(),
            sample: EntityRef::new(sample_id.as_str()),
            parameters: parameters.clone(),
            hash: parameters_hash(parameters)?,
            paired,
            legacy,
            ready: false,
            files: Vec::new(),
            quality: None,
            created_at: Utc::now(),
        };
        self.db.insert_one(Collection::Caches, db::encode(&cache)?)?;
        info!(cache_id = %cache.id, %sample_id, legacy, "created cache");
        self.dispatcher
            .dispatch(Collection::Caches, Operation::Insert, vec![cache.id.to_string()]);
        Ok(cache.id)
    }

    pub fn path(&self, cache_id: &CacheId) -> Utf8PathBuf {
        self.store.cache_dir(cache_id)
    }

    /// Creates the cache directory. An existing directory is an error.
    pub fn create_dir(&self, cache_id: &CacheId) -> Result<Utf8PathBuf, KiraError> {
        let path = self.path(cache_id);
        if path.as_std_path().exists() {
            return Err(KiraError::CacheDirExists(path));
        }
        store::create_dir_fresh(&path)?;
        Ok(path)
    }

    pub fn get(&self, cache_id: &CacheId) -> Result<Option<Cache>, KiraError> {
        db::get(self.db, Collection::Caches, cache_id.as_str())
    }

    /// Marks the cache ready together with its files and quality.
    ///
    /// Finalizing again with the same files is a no-op; with different files
    /// it is an error.
    pub fn finalize(
        &self,
        cache_id: &CacheId,
        files: Vec<CacheFile>,
        quality: Option<Quality>,
    ) -> Result<(), KiraError> {
        let cache = self
            .get(cache_id)?
            .ok_or_else(|| KiraError::not_found(Collection::Caches.as_str(), cache_id.as_str()))?;
        if cache.ready {
            if cache.files == files {
                debug!(%cache_id, "cache already finalized");
                return Ok(());
            }
            return Err(KiraError::CacheAlreadyFinalized(cache_id.to_string()));
        }

        let matched = self.db.update_one(
            Collection::Caches,
            cache_id.as_str(),
            set_fields([
                ("ready", Value::Bool(true)),
                ("files", db::encode(&files)?),
                ("quality", db::encode(&quality)?),
            ]),
        )?;
        if !matched {
            return Err(KiraError::StorageWrite(format!(
                "cache {cache_id} disappeared before finalize"
            )));
        }
        info!(%cache_id, files = files.len(), "finalized cache");
        self.dispatcher
            .dispatch(Collection::Caches, Operation::Update, vec![cache_id.to_string()]);
        Ok(())
    }

    /// Points every analysis of the sample at `cache_id` and returns their ids.
    pub fn repoint_analyses(
        &self,
        sample_id: &SampleId,
        cache_id: &CacheId,
    ) -> Result<Vec<String>, KiraError> {
        let query = Filter::new().eq("sample.id", sample_id.as_str());
        self.db.update_many(
            Collection::Analyses,
            &query,
            set_fields([("cache", json!({ "id": cache_id.as_str() }))]),
        )?;
        let ids: Vec<String> = self
            .db
            .distinct(Collection::Analyses, "_id", &query)?
            .into_iter()
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect();
        info!(%sample_id, %cache_id, analyses = ids.len(), "repointed analyses");
        self.dispatcher
            .dispatch(Collection::Analyses, Operation::Update, ids.clone());
        Ok(ids)
    }

    /// Looks up a usable cache. Unready caches are never returned.
    pub fn find_ready(
        &self,
        sample_id: &SampleId,
        hash: &str,
        paired: bool,
    ) -> Result<Option<Cache>, KiraError> {
        let query = Filter::new()
            .eq("sample.id", sample_id.as_str())
            .eq("hash", hash)
            .eq("paired", paired)
            .eq("ready", true);
        let mut caches = self
            .db
            .find(Collection::Caches, &query)?
            .into_iter()
            .map(|value| db::decode::<Cache>(Collection::Caches, value))
            .collect::<Result<Vec<_>, _>>()?;
        caches.sort_by_key(|cache| cache.created_at);
        Ok(caches.pop())
    }
}
