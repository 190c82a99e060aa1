//! Daily-rotated audit line file
//!
//! One canonical JSON record per line in `audit-YYYY-MM-DD.file`. The day is
//! the UTC day of the record timestamp, so a late record never lands in the
//! wrong file.

use chrono::{DateTime, NaiveDate};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// File permissions for day files
pub const DAY_FILE_MODE: u32 = 0o640;

/// Name of the day file covering `day`
#[must_use]
pub fn day_file_name(day: NaiveDate) -> String {
    format!("audit-{}.file", day.format("%Y-%m-%d"))
}

/// UTC day of a millisecond timestamp
///
/// # Errors
///
/// Returns an error if the timestamp is outside chrono's range.
pub fn utc_day(ts_ms: i64) -> io::Result<NaiveDate> {
    DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("timestamp out of range: {ts_ms}")))
}

struct OpenDay {
    day: NaiveDate,
    path: PathBuf,
    file: File,
}

/// Appender that owns at most one open day file
pub struct DayFileWriter {
    dir: PathBuf,
    current: Option<OpenDay>,
    lines: u64,
}

impl DayFileWriter {
    /// Create the directory if needed; no file is opened until the first append
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn new(dir: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            current: None,
            lines: 0,
        })
    }

    /// Directory holding the day files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file currently open, if any
    #[must_use]
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }

    /// Lines appended since creation
    #[must_use]
    pub const fn lines_written(&self) -> u64 {
        self.lines
    }

    /// Append `line` plus a newline to the file for the UTC day of `ts_ms`
    /// and sync it to disk
    ///
    /// # Errors
    ///
    /// Returns an error if rotation, the write or the sync fails.
    pub async fn append(&mut self, ts_ms: i64, line: &str) -> io::Result<()> {
        let day = utc_day(ts_ms)?;
        if self.current.as_ref().map(|c| c.day) != Some(day) {
            self.rotate(day).await?;
        }
        let Some(open) = self.current.as_mut() else {
            return Err(io::Error::other("day file not open after rotation"));
        };

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        open.file.write_all(&buf).await?;
        open.file.sync_data().await?;
        self.lines += 1;
        Ok(())
    }

    async fn rotate(&mut self, day: NaiveDate) -> io::Result<()> {
        // Close the previous handle before the next one is opened
        if let Some(mut prev) = self.current.take() {
            prev.file.flush().await?;
            prev.file.sync_all().await?;
            debug!(path = %prev.path.display(), "day file closed");
        }

        let path = self.dir.join(day_file_name(day));
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(DAY_FILE_MODE);
        let file = options.open(&path).await?;
        info!(path = %path.display(), "day file opened");
        self.current = Some(OpenDay { day, path, file });
        Ok(())
    }

    /// Flush and close the open file
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub async fn close(&mut self) -> io::Result<()> {
        if let Some(mut open) = self.current.take() {
            open.file.flush().await?;
            open.file.sync_all().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY1_MS: i64 = 1_700_000_000_000; // 2023-11-14T22:13:20Z
    const DAY2_MS: i64 = DAY1_MS + 2 * 3_600_000;

    #[test]
    fn test_day_file_name() {
        assert_eq!(day_file_name(utc_day(DAY1_MS).unwrap()), "audit-2023-11-14.file");
        assert_eq!(day_file_name(utc_day(DAY2_MS).unwrap()), "audit-2023-11-15.file");
    }

    #[tokio::test]
    async fn test_rotates_on_utc_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = DayFileWriter::new(dir.path()).await.unwrap();
        w.append(DAY1_MS, r#"{"n":1}"#).await.unwrap();
        w.append(DAY1_MS + 1, r#"{"n":2}"#).await.unwrap();
        w.append(DAY2_MS, r#"{"n":3}"#).await.unwrap();
        w.close().await.unwrap();

        let first = std::fs::read_to_string(dir.path().join("audit-2023-11-14.file")).unwrap();
        let second = std::fs::read_to_string(dir.path().join("audit-2023-11-15.file")).unwrap();
        assert_eq!(first, "{\"n\":1}\n{\"n\":2}\n");
        assert_eq!(second, "{\"n\":3}\n");
        assert_eq!(w.lines_written(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_day_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut w = DayFileWriter::new(dir.path()).await.unwrap();
        w.append(DAY1_MS, "{}").await.unwrap();
        let meta = std::fs::metadata(w.current_path().unwrap()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o007, 0, "no world access");
    }
}
