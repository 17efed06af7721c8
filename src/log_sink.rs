/// Append-only audit log: one `YYYY-MM-DD HH:MM:SS message` line per event.
///
/// The same file receives the worker's stdout and stderr, so warden's own
/// lines and the worker's output interleave in arrival order. No rotation.
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Read size when scanning the log backwards for `tail`.
const TAIL_CHUNK: u64 = 8 * 1024;

#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the log for appending, creating it if needed.
    pub fn open_append(&self) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
    }

    /// Append one timestamped line.
    pub fn append(&self, message: &str) -> std::io::Result<()> {
        let line = format_line(&Local::now().format(TIMESTAMP_FORMAT).to_string(), message);
        let mut file = self.open_append()?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }

    /// Append a line; a failed write is reported through tracing and otherwise ignored.
    pub fn record(&self, message: &str) {
        if let Err(e) = self.append(message) {
            tracing::warn!(
                error = %e,
                path = %self.path.display(),
                "failed to append to log file"
            );
        }
    }

    /// Last `n` lines of the log, oldest first. `None` if the log does not exist.
    ///
    /// Only the end of the file is read. Worker output is not guaranteed to
    /// be UTF-8, so invalid bytes come back as U+FFFD.
    pub fn tail(&self, n: usize) -> std::io::Result<Option<Vec<String>>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let bytes = read_tail(&mut file, n)?;
        Ok(Some(last_lines(&String::from_utf8_lossy(&bytes), n)))
    }
}

/// Trailing bytes of `reader` that hold at least its last `n` complete lines.
///
/// Stops once `n + 1` newlines are buffered; the first, possibly partial,
/// line is then dropped by `last_lines`.
fn read_tail<R: Read + Seek>(reader: &mut R, n: usize) -> std::io::Result<Vec<u8>> {
    let mut start = reader.seek(SeekFrom::End(0))?;
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    while start > 0 && newlines <= n {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        reader.seek(SeekFrom::Start(start))?;

        let mut chunk = vec![0u8; step as usize];
        reader.read_exact(&mut chunk)?;
        newlines += chunk.iter().filter(|&&b| b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }
    Ok(buf)
}

fn format_line(timestamp: &str, message: &str) -> String {
    // Keep one entry per line even if a message carries a newline
    let message = message.trim_end().replace('\n', " ");
    format!("{timestamp} {message}\n")
}

fn last_lines(contents: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = contents.lines().collect();
    let skip = lines.len().saturating_sub(n);
    lines[skip..].iter().map(|l| l.to_string()).collect()
}
