//! JSON-file log driver: Docker-compatible JSON lines with size rotation.

use dockyard_core::log::{LogConfig, LogDriver, LogEntry, LogLine};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Path to the structured JSON log file inside a container directory.
pub fn json_log_path(container_dir: &Path) -> PathBuf {
    container_dir.join("container.json")
}

/// Open the writer for `config`'s driver, if it writes to disk at all.
pub fn open_log_writer(
    container_dir: &Path,
    config: &LogConfig,
) -> std::io::Result<Option<RotatingWriter>> {
    match config.driver {
        LogDriver::None => Ok(None),
        LogDriver::JsonFile => RotatingWriter::new(
            &json_log_path(container_dir),
            config.max_size,
            config.max_file,
        )
        .map(Some),
    }
}

/// Appends JSON log records to one file, shifting it to `.1`, `.2`, ...
/// once the next record would push it past `max_size`.
#[derive(Debug)]
pub struct RotatingWriter {
    path: PathBuf,
    out: std::fs::File,
    len: u64,
    max_size: u64,
    keep: u32,
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

impl RotatingWriter {
    /// `max_file` counts rotated generations; at least one is always kept.
    pub fn new(path: &Path, max_size: u64, max_file: u32) -> std::io::Result<Self> {
        let out = open_append(path)?;
        Ok(Self {
            len: out.metadata()?.len(),
            path: path.to_path_buf(),
            out,
            max_size,
            keep: max_file.max(1),
        })
    }

    /// Append one output line as a JSON log entry.
    pub fn write_entry(&mut self, line: &LogLine) -> std::io::Result<()> {
        let mut record = serde_json::to_vec(&LogEntry::from(line))?;
        record.push(b'\n');

        let record_len = record.len() as u64;
        if self.len > 0 && self.len + record_len > self.max_size {
            self.shift_generations()?;
        }
        self.out.write_all(&record)?;
        self.len += record_len;
        Ok(())
    }

    fn shift_generations(&mut self) -> std::io::Result<()> {
        // Oldest first so nothing is overwritten: .{keep-1} -> .{keep}, ..., live -> .1
        for generation in (0..self.keep).rev() {
            let from = match generation {
                0 => self.path.clone(),
                n => rotated_path(&self.path, n),
            };
            match std::fs::rename(&from, rotated_path(&self.path, generation + 1)) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                other => other?,
            }
        }
        tracing::debug!(path = %self.path.display(), "Rotated container log");

        self.out = open_append(&self.path)?;
        self.len = 0;
        Ok(())
    }
}

/// container.json → container.json.1
fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
