use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;
use crate::fastqc::Quality;

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid regex"))
}

// Identifiers end up as path components under the data root, so they are
// restricted to a path-safe alphabet.
macro_rules! identifier {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = KiraError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let trimmed = value.trim();
                if !identifier_regex().is_match(trimmed) || trimmed.contains("..") {
                    return Err(KiraError::InvalidIdentifier(value.to_string()));
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = KiraError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }
    };
}

identifier!(JobId);
identifier!(SampleId);
identifier!(CacheId);
identifier!(FileId);
identifier!(AnalysisId);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl CacheId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Jobs,
    Samples,
    Analyses,
    Caches,
    Files,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::Jobs,
        Collection::Samples,
        Collection::Analyses,
        Collection::Caches,
        Collection::Files,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Jobs => "jobs",
            Collection::Samples => "samples",
            Collection::Analyses => "analyses",
            Collection::Caches => "caches",
            Collection::Files => "files",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Remove,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Insert => write!(f, "insert"),
            Operation::Update => write!(f, "update"),
            Operation::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: String,
}

impl EntityRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Provenance of a sample file: the upload it was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRef {
    pub id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<UploadRef>,
    #[serde(default)]
    pub raw: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "_id")]
    pub id: SampleId,
    #[serde(default)]
    pub files: Vec<SampleFile>,
    #[serde(default)]
    pub paired: bool,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub quality: Option<Quality>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(rename = "_id")]
    pub id: AnalysisId,
    pub sample: EntityRef,
    #[serde(default)]
    pub cache: Option<EntityRef>,
}

/// An uploaded file waiting to be consumed by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFile {
    #[serde(rename = "_id")]
    pub id: FileId,
    pub name: String,
    #[serde(default, rename = "type")]
    pub file_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub reserved: bool,
    #[serde(default)]
    pub uploaded_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Canonical read file name for a zero-based position in the pairing order.
pub fn reads_file_name(index: usize) -> String {
    format!("reads_{}.fq.gz", index + 1)
}

pub fn sample_download_url(sample_id: &SampleId, name: &str) -> String {
    format!("/download/samples/{sample_id}/{name}")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_identifier_valid() {
        let id: SampleId = " S1 ".parse().unwrap();
        assert_eq!(id.as_str(), "S1");
    }

    #[test]
    fn parse_identifier_rejects_paths() {
        assert_matches!(
            "../etc".parse::<SampleId>(),
            Err(KiraError::InvalidIdentifier(_))
        );
        assert_matches!(
            "a/b".parse::<FileId>(),
            Err(KiraError::InvalidIdentifier(_))
        );
        assert_matches!("".parse::<CacheId>(), Err(KiraError::InvalidIdentifier(_)));
    }

    #[test]
    fn canonical_names_are_one_based() {
        assert_eq!(reads_file_name(0), "reads_1.fq.gz");
        assert_eq!(reads_file_name(1), "reads_2.fq.gz");
        let sample: SampleId = "S1".parse().unwrap();
        assert_eq!(
            sample_download_url(&sample, "reads_2.fq.gz"),
            "/download/samples/S1/reads_2.fq.gz"
        );
    }

    #[test]
    fn sample_document_defaults() {
        let sample: Sample = serde_json::from_value(serde_json::json!({"_id": "S1"})).unwrap();
        assert!(sample.files.is_empty());
        assert!(!sample.prune);
        assert!(sample.quality.is_none());
    }
}
