#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::json;

use kira_sample_jobs::config::Settings;
use kira_sample_jobs::db::{DocumentStore, MemoryDocumentStore};
use kira_sample_jobs::dispatch::{Dispatcher, Notification};
use kira_sample_jobs::domain::{Collection, Operation};
use kira_sample_jobs::error::KiraError;
use kira_sample_jobs::process::{ProcessOutput, ProcessRunner, ToolCommand};
use kira_sample_jobs::store::ArtifactStore;

pub const REPORT: &str = "##FastQC\t0.11.9
>>Basic Statistics\tpass
#Measure\tValue
Encoding\tSanger / Illumina 1.9
Total Sequences\t250
Sequence length\t50-100
%GC\t45
>>END_MODULE
>>Per base sequence quality\tpass
#Base\tMean\tMedian\tLower Quartile\tUpper Quartile\t10th Percentile\t90th Percentile
1\t30.0\t31.0\t29.0\t33.0\t27.0\t34.0
>>END_MODULE
>>Per sequence quality scores\tpass
#Quality\tCount
35\t250.0
>>END_MODULE
>>Per base sequence content\tpass
#Base\tG\tA\tT\tC
1\t25.0\t25.0\t25.0\t25.0
>>END_MODULE
";

#[derive(Default)]
pub struct RecordingDispatcher {
    pub events: Mutex<Vec<Notification>>,
}

impl RecordingDispatcher {
    /// Everything except job bookkeeping.
    pub fn data_events(&self) -> Vec<Notification> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.collection != Collection::Jobs)
            .cloned()
            .collect()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, collection: Collection, operation: Operation, ids: Vec<String>) {
        self.events.lock().unwrap().push(Notification {
            collection,
            operation,
            ids,
        });
    }
}

type Hook = Box<dyn Fn(&ToolCommand) -> Result<(), KiraError> + Send + Sync>;

/// Stands in for FastQC: writes one extracted report per read into the
/// `-o` directory.
#[derive(Default)]
pub struct FakeFastqc {
    pub calls: Mutex<Vec<ToolCommand>>,
    pub hook: Mutex<Option<Hook>>,
}

impl FakeFastqc {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn set_hook(
        &self,
        hook: impl Fn(&ToolCommand) -> Result<(), KiraError> + Send + Sync + 'static,
    ) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl ProcessRunner for FakeFastqc {
    fn run(&self, command: &ToolCommand) -> Result<ProcessOutput, KiraError> {
        self.calls.lock().unwrap().push(command.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(command)?;
        }
        let out = command
            .args
            .iter()
            .position(|arg| arg == "-o")
            .and_then(|index| command.args.get(index + 1))
            .map(Utf8PathBuf::from)
            .ok_or_else(|| KiraError::tool("fastqc", "missing -o"))?;
        let reads = command
            .args
            .iter()
            .skip_while(|arg| *arg != "--extract")
            .skip(1);
        for read in reads {
            let name = Utf8Path::new(read).file_name().unwrap_or_default();
            let stem = name.trim_end_matches(".gz").trim_end_matches(".fq");
            let dir = out.join(format!("{stem}_fastqc"));
            fs::create_dir_all(dir.as_std_path()).map_err(KiraError::fs)?;
            fs::write(dir.join("fastqc_data.txt").as_std_path(), REPORT).map_err(KiraError::fs)?;
        }
        Ok(ProcessOutput::default())
    }
}

pub struct Fixture {
    pub _temp: tempfile::TempDir,
    pub root: Utf8PathBuf,
    pub store: ArtifactStore,
    pub db: Arc<MemoryDocumentStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub fastqc: Arc<FakeFastqc>,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let store = ArtifactStore::new(root.clone());
        store.ensure_layout().unwrap();
        Self {
            _temp: temp,
            root,
            store,
            db: Arc::new(MemoryDocumentStore::new()),
            dispatcher: Arc::new(RecordingDispatcher::default()),
            fastqc: Arc::new(FakeFastqc::default()),
        }
    }

    pub fn settings(&self) -> Settings {
        let mut settings = Settings::with_data_path(self.root.clone());
        settings.slots = 2;
        settings.proc = 2;
        settings
    }

    pub fn db(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.db) as Arc<dyn DocumentStore>
    }

    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        Arc::clone(&self.dispatcher) as Arc<dyn Dispatcher>
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.fastqc) as Arc<dyn ProcessRunner>
    }

    /// Adds a sample whose current files are gzip files on disk. Returns
    /// their sizes.
    pub fn add_sample(&self, sample_id: &str, names: &[&str]) -> Vec<u64> {
        let dir = self.root.join("samples").join(sample_id);
        fs::create_dir_all(dir.as_std_path()).unwrap();
        let mut files = Vec::new();
        let mut sizes = Vec::new();
        for (index, name) in names.iter().enumerate() {
            let bytes = gzip(format!("@old{index}\nACGTACGT\n+\nIIIIIIII\n").as_bytes());
            fs::write(dir.join(name).as_std_path(), &bytes).unwrap();
            sizes.push(bytes.len() as u64);
            files.push(json!({
                "name": name,
                "size": bytes.len(),
                "download_url": format!("/download/samples/{sample_id}/{name}"),
                "raw": false,
            }));
        }
        self.db
            .insert_one(
                Collection::Samples,
                json!({
                    "_id": sample_id,
                    "files": files,
                    "paired": names.len() == 2,
                    "prune": false,
                    "quality": {
                        "count": 7,
                        "encoding": "old",
                        "length": [1, 2],
                        "gc": 40.0,
                        "bases": [],
                        "composition": [],
                        "sequences": [],
                    },
                }),
            )
            .unwrap();
        sizes
    }

    /// Adds a ready upload holding plain FASTQ text.
    pub fn add_upload(&self, file_id: &str) {
        let content = format!("@{file_id}\nTTTTGGGGCCCCAAAA\n+\nIIIIIIIIIIIIIIII\n");
        fs::write(self.root.join("files").join(file_id).as_std_path(), &content).unwrap();
        self.db
            .insert_one(
                Collection::Files,
                json!({
                    "_id": file_id,
                    "name": format!("{file_id}.fastq"),
                    "type": "reads",
                    "size": content.len(),
                    "ready": true,
                    "reserved": false,
                    "uploaded_at": "2024-03-01T12:00:00Z",
                }),
            )
            .unwrap();
    }

    pub fn add_analysis(&self, analysis_id: &str, sample_id: &str) {
        self.db
            .insert_one(
                Collection::Analyses,
                json!({ "_id": analysis_id, "sample": { "id": sample_id } }),
            )
            .unwrap();
    }
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}
