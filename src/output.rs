use std::io::{self, Write};

use serde::Serialize;

use crate::domain::UploadFile;
use crate::jobs::JobDocument;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_job(job: &JobDocument) -> io::Result<()> {
        Self::print_json(job)
    }

    pub fn print_jobs(jobs: &[JobDocument]) -> io::Result<()> {
        Self::print_json(&jobs)
    }

    pub fn print_files(files: &[UploadFile]) -> io::Result<()> {
        Self::print_json(&files)
    }

    pub fn print_removed(id: &str) -> io::Result<()> {
        Self::print_json(&serde_json::json!({ "removed": id }))
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
