use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Condvar, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::error::KiraError;
use crate::store;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Process-wide budget of tool slots. A job asks for a number of slots before
/// starting a tool and gives them back when the tool exits. This is admission
/// control only; the OS still schedules the processes.
#[derive(Debug)]
pub struct SlotPool {
    total: usize,
    free: Mutex<usize>,
    released: Condvar,
}

impl SlotPool {
    pub fn new(total: usize) -> Self {
        let total = total.max(1);
        Self {
            total,
            free: Mutex::new(total),
            released: Condvar::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn available(&self) -> usize {
        *self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until `requested` slots (clamped to `1..=total`) are free.
    pub fn acquire(&self, requested: usize) -> SlotGuard<'_> {
        let count = requested.clamp(1, self.total);
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        while *free < count {
            free = self
                .released
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *free -= count;
        SlotGuard { pool: self, count }
    }
}

pub struct SlotGuard<'a> {
    pool: &'a SlotPool,
    count: usize,
}

impl SlotGuard<'_> {
    pub fn count(&self) -> usize {
        self.count
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut free = self
            .pool
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *free += self.count;
        drop(free);
        self.pool.released.notify_all();
    }
}

#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<Utf8PathBuf>,
    /// Slots this invocation holds while it runs.
    pub slots: usize,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            slots: 1,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

pub trait ProcessRunner: Send + Sync {
    /// Runs the command to completion. A non-zero exit is an error.
    fn run(&self, command: &ToolCommand) -> Result<ProcessOutput, KiraError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, command: &ToolCommand) -> Result<ProcessOutput, KiraError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir.as_std_path());
        }
        debug!(program = %command.program, args = ?command.args, "running tool");
        let output = cmd
            .output()
            .map_err(|err| KiraError::tool(&command.program, err.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            return Ok(ProcessOutput { stdout, stderr });
        }
        let message = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        };
        Err(KiraError::tool(&command.program, message))
    }
}

/// Resolves a tool given either as a path or as a bare name on `PATH`.
pub fn resolve_tool(name: &str) -> Result<PathBuf, KiraError> {
    let candidate = PathBuf::from(name);
    if candidate.components().count() > 1 {
        return candidate
            .exists()
            .then_some(candidate)
            .ok_or_else(|| KiraError::MissingTool(name.to_string()));
    }
    find_in_path(name).ok_or_else(|| KiraError::MissingTool(name.to_string()))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

pub fn is_gzip(path: &Utf8Path) -> Result<bool, KiraError> {
    let mut file =
        File::open(path.as_std_path()).map_err(|err| KiraError::fs(format!("open {path}: {err}")))?;
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        match file.read(&mut magic[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(KiraError::fs(format!("read {path}: {err}"))),
        }
    }
    Ok(magic == GZIP_MAGIC)
}

/// Places `source` at `target` in gzip form and returns the target size.
///
/// Gzip input is copied verbatim, anything else is compressed while
/// streaming. The target only appears once it is complete.
pub fn copy_or_compress(source: &Utf8Path, target: &Utf8Path) -> Result<u64, KiraError> {
    let parent = target
        .parent()
        .ok_or_else(|| KiraError::fs(format!("invalid destination path: {target}")))?;
    store::ensure_dir(parent)?;

    let temp = tempfile::Builder::new()
        .prefix(".kira-copy")
        .tempfile_in(parent.as_std_path())
        .map_err(KiraError::fs)?;

    let mut reader = BufReader::new(
        File::open(source.as_std_path())
            .map_err(|err| KiraError::fs(format!("open {source}: {err}")))?,
    );

    if is_gzip(source)? {
        debug!(%source, %target, "copying compressed file");
        let mut writer = BufWriter::new(temp.as_file());
        io::copy(&mut reader, &mut writer).map_err(KiraError::fs)?;
        writer.flush().map_err(KiraError::fs)?;
    } else {
        debug!(%source, %target, "compressing file");
        let writer = BufWriter::new(temp.as_file());
        let mut encoder = GzEncoder::new(writer, Compression::new(6));
        io::copy(&mut reader, &mut encoder).map_err(KiraError::fs)?;
        let mut writer = encoder.finish().map_err(KiraError::fs)?;
        writer.flush().map_err(KiraError::fs)?;
    }

    temp.as_file().sync_all().map_err(KiraError::fs)?;
    temp.persist(target.as_std_path()).map_err(KiraError::fs)?;
    store::file_size(target)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use flate2::read::MultiGzDecoder;

    use super::*;

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        (temp, root)
    }

    fn gunzip(path: &Utf8Path) -> Vec<u8> {
        let mut out = Vec::new();
        MultiGzDecoder::new(File::open(path.as_std_path()).unwrap())
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn compressed_and_plain_sources_decompress_identically() {
        let (_temp, root) = temp_root();
        let reads = b"@r1\nACGT\n+\nIIII\n@r2\nTTGA\n+\nHHHH\n".repeat(50);

        let plain = root.join("plain.fq");
        std::fs::write(plain.as_std_path(), &reads).unwrap();

        let gz = root.join("already.fq.gz");
        let file = File::create(gz.as_std_path()).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::fast());
        encoder.write_all(&reads).unwrap();
        encoder.finish().unwrap();

        let from_plain = root.join("out").join("reads_1.fq.gz");
        let from_gz = root.join("out").join("reads_2.fq.gz");
        let size_plain = copy_or_compress(&plain, &from_plain).unwrap();
        let size_gz = copy_or_compress(&gz, &from_gz).unwrap();

        assert!(is_gzip(&from_plain).unwrap());
        assert_eq!(gunzip(&from_plain), reads);
        assert_eq!(gunzip(&from_gz), reads);
        assert_eq!(size_plain, std::fs::metadata(from_plain.as_std_path()).unwrap().len());
        // Compressed input is passed through untouched.
        assert_eq!(
            std::fs::read(from_gz.as_std_path()).unwrap(),
            std::fs::read(gz.as_std_path()).unwrap()
        );
        assert_eq!(size_gz, std::fs::metadata(gz.as_std_path()).unwrap().len());
    }

    #[test]
    fn empty_source_is_compressed() {
        let (_temp, root) = temp_root();
        let empty = root.join("empty.fq");
        std::fs::write(empty.as_std_path(), b"").unwrap();
        let target = root.join("reads_1.fq.gz");
        copy_or_compress(&empty, &target).unwrap();
        assert!(gunzip(&target).is_empty());
    }

    #[test]
    fn missing_source_fails() {
        let (_temp, root) = temp_root();
        let target = root.join("reads_1.fq.gz");
        assert!(copy_or_compress(&root.join("nope"), &target).is_err());
        assert!(!target.as_std_path().exists());
    }

    #[test]
    fn slot_pool_blocks_until_release() {
        let pool = Arc::new(SlotPool::new(2));
        let held = pool.acquire(5);
        assert_eq!(held.count(), 2);
        assert_eq!(pool.available(), 0);

        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let guard = waiter_pool.acquire(1);
            guard.count()
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(held);
        assert_eq!(waiter.join().unwrap(), 1);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn failing_tool_surfaces_stderr() {
        let command = ToolCommand::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = SystemProcessRunner.run(&command).unwrap_err();
        match err {
            KiraError::ToolExecution { tool, message } => {
                assert_eq!(tool, "sh");
                assert_eq!(message, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
