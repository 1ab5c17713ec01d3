// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-test log files.
//!
//! Every test writes to its own file under `target/test-logs/<date>/`. A
//! passing test prints a single line; a failing one prints the log path and
//! size so the full output can be opened directly.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

const MAX_TEST_NAME_LEN: usize = 200;

#[derive(Error, Debug)]
pub enum TestLogError {
    #[error("failed to create test log: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write test log {path}")]
    Write { path: PathBuf },

    #[error("invalid test name: {name}")]
    InvalidTestName { name: String },
}

pub struct TestLogger {
    log_path: PathBuf,
    writer: BufWriter<File>,
    test_name: String,
    start_time: DateTime<Utc>,
}

impl TestLogger {
    pub fn new(test_name: &str) -> Result<Self, TestLogError> {
        validate_test_name(test_name)?;

        let log_path = create_unique_test_log(test_name)?;
        // Append mode: the tracing capture writes to the same file through a
        // second handle.
        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut logger = Self {
            log_path,
            writer: BufWriter::new(file),
            test_name: test_name.to_string(),
            start_time: Utc::now(),
        };
        logger.write_header()?;
        Ok(logger)
    }

    pub fn log(&mut self, message: &str) -> Result<(), TestLogError> {
        let timestamp = Utc::now().format("%H:%M:%S%.3f");
        writeln!(self.writer, "[{}] {}", timestamp, message).map_err(|_| self.write_error())?;
        self.writer.flush().map_err(|_| self.write_error())
    }

    /// Logs `data` pretty-printed as JSON under `label`.
    pub fn log_json<T: serde::Serialize>(
        &mut self,
        label: &str,
        data: &T,
    ) -> Result<(), TestLogError> {
        let json = serde_json::to_string_pretty(data).map_err(|_| self.write_error())?;
        self.log(&format!("{}: {}", label, json))
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn finish_success(mut self) -> Result<PathBuf, TestLogError> {
        let elapsed = self.elapsed_secs();
        self.log(&format!("test passed in {:.3}s", elapsed))?;
        self.writer.flush().map_err(|_| self.write_error())?;
        println!("✅ {} passed", self.test_name);
        Ok(self.log_path)
    }

    pub fn finish_failure(mut self, error_message: &str) -> Result<PathBuf, TestLogError> {
        let elapsed = self.elapsed_secs();
        self.log(&format!("test failed after {:.3}s: {}", elapsed, error_message))?;
        self.writer.flush().map_err(|_| self.write_error())?;

        match fs::metadata(&self.log_path) {
            Ok(metadata) => println!(
                "❌ {} failed - Log: {} ({} bytes)",
                self.test_name,
                self.log_path.display(),
                metadata.len()
            ),
            Err(_) => println!("❌ {} failed - Log: {}", self.test_name, self.log_path.display()),
        }
        Ok(self.log_path)
    }

    fn elapsed_secs(&self) -> f64 {
        Utc::now().signed_duration_since(self.start_time).num_milliseconds() as f64 / 1000.0
    }

    fn write_error(&self) -> TestLogError {
        TestLogError::Write {
            path: self.log_path.clone(),
        }
    }

    fn write_header(&mut self) -> Result<(), TestLogError> {
        writeln!(self.writer, "=== remex test log ===")?;
        writeln!(self.writer, "Test: {}", self.test_name)?;
        writeln!(self.writer, "Started: {}", self.start_time.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(self.writer, "Process: {}", std::process::id())?;
        if let Some(thread) = std::thread::current().name() {
            writeln!(self.writer, "Thread: {}", thread)?;
        }
        writeln!(self.writer, "=== output ===")?;
        writeln!(self.writer)?;
        self.writer.flush().map_err(|_| self.write_error())
    }
}

/// Allocates a fresh log path for `test_name`:
/// `target/test-logs/YYYY-MM-DD/<name>-HH-MM-SS-<uuid>.log`.
pub fn create_unique_test_log(test_name: &str) -> Result<PathBuf, TestLogError> {
    let now = Utc::now();
    let log_dir = find_workspace_root()
        .join("target")
        .join("test-logs")
        .join(now.format("%Y-%m-%d").to_string());
    fs::create_dir_all(&log_dir)?;

    let filename = format!(
        "{}-{}-{}.log",
        sanitize_filename(test_name),
        now.format("%H-%M-%S"),
        Uuid::new_v4()
    );
    Ok(log_dir.join(filename))
}

fn find_workspace_root() -> PathBuf {
    let start = env::var_os("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .or_else(|| env::current_dir().ok())
        .unwrap_or_else(env::temp_dir);

    for dir in start.ancestors() {
        let manifest = dir.join("Cargo.toml");
        if let Ok(content) = fs::read_to_string(&manifest) {
            if content.contains("[workspace]") {
                return dir.to_path_buf();
            }
        }
    }
    start
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn validate_test_name(name: &str) -> Result<(), TestLogError> {
    if name.is_empty() {
        return Err(TestLogError::InvalidTestName {
            name: name.to_string(),
        });
    }
    if name.len() > MAX_TEST_NAME_LEN {
        return Err(TestLogError::InvalidTestName {
            name: format!("name too long: {} chars", name.len()),
        });
    }
    Ok(())
}
