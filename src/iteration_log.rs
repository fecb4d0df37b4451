//! Append-only text logs mirroring a per-participant iteration log and
//! convergence log: one row per completed window (`precice-<participant>
//! -iterations.log`) and one row per iteration
//! (`precice-<participant>-convergence.log`). Writing a row also emits a
//! matching `tracing` event so the same information reaches structured
//! log collectors without parsing the text files back.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::DataId;

/// Errors opening or writing a log file.
#[derive(Debug, thiserror::Error)]
pub enum IterationLogError {
    /// The file could not be opened or written.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The path that failed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

fn open_append(path: &Path) -> Result<(BufWriter<File>, bool), IterationLogError> {
    let existed = path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| IterationLogError::Io { path: path.to_path_buf(), source })?;
    Ok((BufWriter::new(file), existed))
}

/// One completed window's row for the iteration log.
#[derive(Debug, Clone)]
pub struct IterationRow {
    /// `TimeWindow`.
    pub time_window: u64,
    /// `TotalIterations` accumulated over the whole run so far.
    pub total_iterations: u64,
    /// `Iterations` taken by this window.
    pub iterations: u32,
    /// Whether this window converged on its own, or was forced by
    /// `maxIterations`.
    pub convergence: bool,
    /// Per-data average convergence rate over this window's iterations.
    pub avg_conv_rate: Vec<(DataId, f64)>,
    /// History columns the accelerator dropped via filtering this window.
    pub deleted_columns: usize,
}

/// Per-participant `precice-<participant>-iterations.log` writer: one row
/// per completed time window.
pub struct IterationLog {
    writer: BufWriter<File>,
    path: PathBuf,
    participant: String,
}

impl IterationLog {
    /// Open (creating if needed) the iteration log for `participant` under
    /// `directory`, writing the header row once if the file is new.
    pub fn open(participant: &str, directory: impl AsRef<Path>) -> Result<Self, IterationLogError> {
        let path = directory.as_ref().join(format!("precice-{participant}-iterations.log"));
        let (mut writer, existed) = open_append(&path)?;
        if !existed {
            writeln!(writer, "TimeWindow TotalIterations Iterations Convergence AvgConvRate DeletedColumns")
                .map_err(|source| IterationLogError::Io { path: path.clone(), source })?;
        }
        Ok(Self { writer, path, participant: participant.to_string() })
    }

    /// Append one window's row and flush immediately: a crash should not
    /// lose a row that `tracing` already reported as written.
    pub fn log_window(&mut self, row: &IterationRow) -> Result<(), IterationLogError> {
        let avg_conv_rate = row
            .avg_conv_rate
            .iter()
            .map(|(id, rate)| format!("{}:{:.6e}", id.0, rate))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(
            self.writer,
            "{} {} {} {} {} {}",
            row.time_window,
            row.total_iterations,
            row.iterations,
            row.convergence as u8,
            avg_conv_rate,
            row.deleted_columns
        )
        .map_err(|source| IterationLogError::Io { path: self.path.clone(), source })?;
        self.writer.flush().map_err(|source| IterationLogError::Io { path: self.path.clone(), source })?;

        tracing::info!(
            participant = %self.participant,
            time_window = row.time_window,
            total_iterations = row.total_iterations,
            iterations = row.iterations,
            convergence = row.convergence,
            deleted_columns = row.deleted_columns,
            "time window complete"
        );
        Ok(())
    }
}

/// One iteration's row for the convergence log.
#[derive(Debug, Clone)]
pub struct ConvergenceRow {
    /// `TimeWindow`.
    pub time_window: u64,
    /// `Iteration` within the window.
    pub iteration: u32,
    /// Per-data residual norm this iteration.
    pub residual_norms: Vec<(DataId, f64)>,
}

/// Per-participant `precice-<participant>-convergence.log` writer: one row
/// per iteration (explicit schemes never write one, since they have no
/// convergence measures).
pub struct ConvergenceLog {
    writer: BufWriter<File>,
    path: PathBuf,
    participant: String,
}

impl ConvergenceLog {
    /// Open (creating if needed) the convergence log for `participant`
    /// under `directory`, writing the header row once if the file is new.
    pub fn open(participant: &str, directory: impl AsRef<Path>) -> Result<Self, IterationLogError> {
        let path = directory.as_ref().join(format!("precice-{participant}-convergence.log"));
        let (mut writer, existed) = open_append(&path)?;
        if !existed {
            writeln!(writer, "TimeWindow Iteration ResNorm")
                .map_err(|source| IterationLogError::Io { path: path.clone(), source })?;
        }
        Ok(Self { writer, path, participant: participant.to_string() })
    }

    /// Append one iteration's row and flush immediately.
    pub fn log_iteration(&mut self, row: &ConvergenceRow) -> Result<(), IterationLogError> {
        let res_norm = row
            .residual_norms
            .iter()
            .map(|(id, norm)| format!("{}:{:.6e}", id.0, norm))
            .collect::<Vec<_>>()
            .join(",");
        writeln!(self.writer, "{} {} {}", row.time_window, row.iteration, res_norm)
            .map_err(|source| IterationLogError::Io { path: self.path.clone(), source })?;
        self.writer.flush().map_err(|source| IterationLogError::Io { path: self.path.clone(), source })?;

        tracing::debug!(
            participant = %self.participant,
            time_window = row.time_window,
            iteration = row.iteration,
            "iteration residual logged"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_log_writes_header_once_and_appends_rows() {
        let dir = std::env::temp_dir().join(format!("coupling-core-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut log = IterationLog::open("A", &dir).unwrap();
        log.log_window(&IterationRow {
            time_window: 1,
            total_iterations: 3,
            iterations: 3,
            convergence: true,
            avg_conv_rate: vec![(DataId(0), 0.01)],
            deleted_columns: 1,
        })
        .unwrap();
        drop(log);

        let contents = std::fs::read_to_string(dir.join("precice-A-iterations.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "TimeWindow TotalIterations Iterations Convergence AvgConvRate DeletedColumns");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("1 3 3 1"));

        // Re-opening an existing file must not rewrite the header.
        let mut log = IterationLog::open("A", &dir).unwrap();
        log.log_window(&IterationRow {
            time_window: 2,
            total_iterations: 5,
            iterations: 2,
            convergence: false,
            avg_conv_rate: vec![],
            deleted_columns: 0,
        })
        .unwrap();
        drop(log);
        let contents = std::fs::read_to_string(dir.join("precice-A-iterations.log")).unwrap();
        assert_eq!(contents.lines().count(), 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn convergence_log_appends_one_row_per_iteration() {
        let dir = std::env::temp_dir().join(format!("coupling-core-test-conv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut log = ConvergenceLog::open("B", &dir).unwrap();
        log.log_iteration(&ConvergenceRow { time_window: 1, iteration: 1, residual_norms: vec![(DataId(0), 0.5)] })
            .unwrap();
        log.log_iteration(&ConvergenceRow { time_window: 1, iteration: 2, residual_norms: vec![(DataId(0), 0.1)] })
            .unwrap();
        drop(log);

        let contents = std::fs::read_to_string(dir.join("precice-B-convergence.log")).unwrap();
        assert_eq!(contents.lines().count(), 3);
        std::fs::remove_dir_all(&dir).ok();
    }
}
