//! Narrow document-store contract used by jobs.
//!
//! Every write touches exactly one document (or, for `update_many`, applies a
//! single-document write per match). There are no multi-document
//! transactions; callers order their writes instead.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::domain::Collection;
use crate::error::KiraError;
use crate::store;

/// Top-level fields assigned by an update, like a `$set` clause.
pub type SetFields = Map<String, Value>;

/// Conjunction of dotted-path equality tests.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((path.into(), value.into()));
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(path, expected)| lookup(document, path) == Some(expected))
    }
}

pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, key| current.as_object()?.get(key))
}

pub trait DocumentStore: Send + Sync {
    fn find_one(&self, collection: Collection, id: &str) -> Result<Option<Value>, KiraError>;

    fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, KiraError>;

    /// Inserts a document carrying an `_id`; fails if the id is taken.
    fn insert_one(&self, collection: Collection, document: Value) -> Result<String, KiraError>;

    /// Returns whether a document matched.
    fn update_one(
        &self,
        collection: Collection,
        id: &str,
        set: SetFields,
    ) -> Result<bool, KiraError>;

    /// Returns the number of matched documents.
    fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        set: SetFields,
    ) -> Result<usize, KiraError>;

    /// Returns whether a document was deleted.
    fn delete_one(&self, collection: Collection, id: &str) -> Result<bool, KiraError>;

    fn distinct(
        &self,
        collection: Collection,
        field: &str,
        filter: &Filter,
    ) -> Result<Vec<Value>, KiraError> {
        let mut values: Vec<Value> = Vec::new();
        for document in self.find(collection, filter)? {
            if let Some(value) = lookup(&document, field) {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        Ok(values)
    }
}

pub fn get<T: DeserializeOwned>(
    db: &dyn DocumentStore,
    collection: Collection,
    id: &str,
) -> Result<Option<T>, KiraError> {
    db.find_one(collection, id)?
        .map(|value| decode(collection, value))
        .transpose()
}

pub fn decode<T: DeserializeOwned>(collection: Collection, value: Value) -> Result<T, KiraError> {
    serde_json::from_value(value)
        .map_err(|err| KiraError::StorageRead(format!("malformed {collection} document: {err}")))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value, KiraError> {
    serde_json::to_value(value).map_err(|err| KiraError::StorageWrite(err.to_string()))
}

/// Builds `$set` fields from `(key, value)` pairs.
pub fn set_fields<I, K>(fields: I) -> SetFields
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    fields
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect()
}

fn document_id(document: &Value) -> Result<String, KiraError> {
    match document.get("_id") {
        Some(Value::String(id)) => Ok(id.clone()),
        _ => Err(KiraError::StorageWrite(
            "document is missing a string _id".to_string(),
        )),
    }
}

fn apply_set(document: &mut Value, set: &SetFields) -> Result<(), KiraError> {
    let object = document
        .as_object_mut()
        .ok_or_else(|| KiraError::StorageWrite("document is not an object".to_string()))?;
    for (key, value) in set {
        if key == "_id" {
            return Err(KiraError::StorageWrite("_id is immutable".to_string()));
        }
        object.insert(key.clone(), value.clone());
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<Collection, BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<Collection, BTreeMap<String, Value>>>, KiraError>
    {
        self.collections
            .lock()
            .map_err(|_| KiraError::StorageWrite("document store lock poisoned".to_string()))
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn find_one(&self, collection: Collection, id: &str) -> Result<Option<Value>, KiraError> {
        let guard = self.lock()?;
        Ok(guard.get(&collection).and_then(|docs| docs.get(id)).cloned())
    }

    fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, KiraError> {
        let guard = self.lock()?;
        Ok(guard
            .get(&collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn insert_one(&self, collection: Collection, document: Value) -> Result<String, KiraError> {
        let id = document_id(&document)?;
        let mut guard = self.lock()?;
        let docs = guard.entry(collection).or_default();
        if docs.contains_key(&id) {
            return Err(KiraError::StorageWrite(format!(
                "duplicate {collection} id: {id}"
            )));
        }
        docs.insert(id.clone(), document);
        Ok(id)
    }

    fn update_one(
        &self,
        collection: Collection,
        id: &str,
        set: SetFields,
    ) -> Result<bool, KiraError> {
        let mut guard = self.lock()?;
        match guard.get_mut(&collection).and_then(|docs| docs.get_mut(id)) {
            Some(document) => {
                apply_set(document, &set)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        set: SetFields,
    ) -> Result<usize, KiraError> {
        let mut guard = self.lock()?;
        let mut matched = 0;
        if let Some(docs) = guard.get_mut(&collection) {
            for document in docs.values_mut().filter(|doc| filter.matches(doc)) {
                apply_set(document, &set)?;
                matched += 1;
            }
        }
        Ok(matched)
    }

    fn delete_one(&self, collection: Collection, id: &str) -> Result<bool, KiraError> {
        let mut guard = self.lock()?;
        Ok(guard
            .get_mut(&collection)
            .map(|docs| docs.remove(id).is_some())
            .unwrap_or(false))
    }
}

/// One JSON file per document at `<root>/<collection>/<id>.json`.
///
/// Writes go through a temp file and a rename, so a concurrent reader sees
/// either the whole previous document or the whole new one.
#[derive(Debug)]
pub struct JsonDocumentStore {
    root: Utf8PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDocumentStore {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, KiraError> {
        let root = root.into();
        for collection in Collection::ALL {
            store::ensure_dir(&root.join(collection.as_str()))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, collection: Collection, id: &str) -> Utf8PathBuf {
        self.root
            .join(collection.as_str())
            .join(format!("{id}.json"))
    }

    fn read(&self, path: &Utf8Path) -> Result<Option<Value>, KiraError> {
        match fs::read(path.as_std_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| KiraError::StorageRead(format!("{path}: {err}"))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(KiraError::StorageRead(format!("{path}: {err}"))),
        }
    }

    fn write(&self, path: &Utf8Path, document: &Value) -> Result<(), KiraError> {
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|err| KiraError::StorageWrite(err.to_string()))?;
        store::write_bytes_atomic(path, &bytes)
            .map_err(|err| KiraError::StorageWrite(format!("{path}: {err}")))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, KiraError> {
        self.write_lock
            .lock()
            .map_err(|_| KiraError::StorageWrite("document store lock poisoned".to_string()))
    }

    fn list(&self, collection: Collection) -> Result<Vec<(Utf8PathBuf, Value)>, KiraError> {
        let dir = self.root.join(collection.as_str());
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(KiraError::StorageRead(format!("{dir}: {err}"))),
        };
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::StorageRead(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.extension() == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            // A document deleted between listing and reading is skipped.
            if let Some(document) = self.read(&path)? {
                documents.push((path, document));
            }
        }
        Ok(documents)
    }
}

impl DocumentStore for JsonDocumentStore {
    fn find_one(&self, collection: Collection, id: &str) -> Result<Option<Value>, KiraError> {
        self.read(&self.path(collection, id))
    }

    fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, KiraError> {
        Ok(self
            .list(collection)?
            .into_iter()
            .map(|(_, document)| document)
            .filter(|document| filter.matches(document))
            .collect())
    }

    fn insert_one(&self, collection: Collection, document: Value) -> Result<String, KiraError> {
        let id = document_id(&document)?;
        let _guard = self.guard()?;
        let path = self.path(collection, &id);
        if path.as_std_path().exists() {
            return Err(KiraError::StorageWrite(format!(
                "duplicate {collection} id: {id}"
            )));
        }
        self.write(&path, &document)?;
        Ok(id)
    }

    fn update_one(
        &self,
        collection: Collection,
        id: &str,
        set: SetFields,
    ) -> Result<bool, KiraError> {
        let _guard = self.guard()?;
        let path = self.path(collection, id);
        let Some(mut document) = self.read(&path)? else {
            return Ok(false);
        };
        apply_set(&mut document, &set)?;
        self.write(&path, &document)?;
        Ok(true)
    }

    fn update_many(
        &self,
        collection: Collection,
        filter: &Filter,
        set: SetFields,
    ) -> Result<usize, KiraError> {
        let _guard = self.guard()?;
        let mut matched = 0;
        for (path, mut document) in self.list(collection)? {
            if !filter.matches(&document) {
                continue;
            }
            apply_set(&mut document, &set)?;
            self.write(&path, &document)?;
            matched += 1;
        }
        Ok(matched)
    }

    fn delete_one(&self, collection: Collection, id: &str) -> Result<bool, KiraError> {
        let _guard = self.guard()?;
        store::remove_file_if_exists(&self.path(collection, id))
            .map_err(|err| KiraError::StorageWrite(err.to_string()))
    }
}
