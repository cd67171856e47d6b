//! Container log files on the local node.

use crate::error::{Error, Result};
use crate::source::{LineSink, Tail};
use crate::types::{Line, TailFrom};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
mod tests;

/// `<pod>_<namespace>_<container>-<container id>.log`, as kubelet links them
/// into `/var/log/containers`.
static LOG_FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<pod>[^_]+)_(?P<namespace>[^_]+)_(?P<container>.+)-(?P<id>[0-9a-f]{64})\.log$")
        .expect("log file pattern must compile")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogFile {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub container_id: String,
    pub path: PathBuf,
}

impl LogFile {
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let caps = LOG_FILE_NAME.captures(name)?;
        Some(Self {
            namespace: caps["namespace"].to_string(),
            pod: caps["pod"].to_string(),
            container: caps["container"].to_string(),
            container_id: caps["id"].to_string(),
            path: path.to_path_buf(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub last_event: Option<DateTime<Utc>>,
}

pub async fn stat(path: &Path) -> Result<FileStat> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(FileStat {
        size: meta.len(),
        last_event: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}

/// Lists container log files in `dir` belonging to one of `namespaces`
/// (all namespaces when empty).
pub async fn scan(dir: &Path, namespaces: &[String]) -> Result<Vec<(LogFile, FileStat)>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Some(file) = LogFile::parse(&entry.path()) else {
            continue;
        };
        if !namespaces.is_empty() && !namespaces.contains(&file.namespace) {
            continue;
        }
        // Files can vanish between listing and stat.
        match stat(&file.path).await {
            Ok(stat) => files.push((file, stat)),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    files.sort_by(|a, b| a.0.path.cmp(&b.0.path));
    Ok(files)
}

#[derive(Deserialize)]
struct DockerLine {
    log: String,
    stream: Option<String>,
    time: Option<DateTime<Utc>>,
}

/// Parses one raw line in CRI or Docker json-file format; anything else is
/// passed through as-is. The flag reports a CRI partial line.
pub fn parse_line(raw: &str) -> (Line, bool) {
    let raw = raw.trim_end_matches(['\n', '\r']);

    if raw.starts_with('{') {
        if let Ok(docker) = serde_json::from_str::<DockerLine>(raw) {
            let mut line = Line::new(docker.log.trim_end_matches('\n'));
            line.timestamp = docker.time;
            if let Some(stream) = docker.stream {
                line.metadata.insert("stream".to_string(), stream);
            }
            return (line, false);
        }
    }

    let mut parts = raw.splitn(4, ' ');
    if let (Some(ts), Some(stream), Some(tag)) = (parts.next(), parts.next(), parts.next()) {
        if let (Ok(ts), "stdout" | "stderr", "F" | "P") =
            (DateTime::parse_from_rfc3339(ts), stream, tag)
        {
            let mut line = Line::new(parts.next().unwrap_or(""));
            line.timestamp = Some(ts.with_timezone(&Utc));
            line.metadata.insert("stream".to_string(), stream.to_string());
            return (line, tag == "P");
        }
    }

    (Line::new(raw), false)
}

/// Follows one log file across rotations.
pub struct FileTail {
    path: PathBuf,
    from: TailFrom,
    poll: Option<Duration>,
    reader: Option<BufReader<File>>,
    file_id: u64,
    offset: u64,
    partial: Option<Line>,
}

impl FileTail {
    pub fn new(path: impl Into<PathBuf>, from: TailFrom) -> Self {
        Self {
            path: path.into(),
            from,
            poll: None,
            reader: None,
            file_id: 0,
            offset: 0,
            partial: None,
        }
    }

    /// Keep polling for appended data instead of stopping at end of file.
    pub fn following(mut self, poll: Duration) -> Self {
        self.poll = Some(poll);
        self
    }

    async fn reopen(&mut self) -> Result<BufReader<File>> {
        let file = File::open(&self.path).await?;
        self.file_id = file_id(&file.metadata().await?);
        self.offset = 0;
        Ok(BufReader::new(file))
    }

    /// Invalid UTF-8 is replaced rather than failing the tail.
    async fn emit(&mut self, sink: &mut LineSink, raw: &[u8]) -> Result<()> {
        let (line, partial) = parse_line(&String::from_utf8_lossy(raw));
        let line = match self.partial.take() {
            Some(mut head) => {
                head.message.push_str(&line.message);
                head
            }
            None => line,
        };
        if partial {
            self.partial = Some(line);
            Ok(())
        } else {
            sink.send(line).await
        }
    }
}

#[async_trait]
impl Tail for FileTail {
    async fn open(&mut self) -> Result<()> {
        let mut reader = self.reopen().await?;
        if self.from == TailFrom::End {
            self.offset = reader.seek(SeekFrom::End(0)).await?;
        }
        self.reader = Some(reader);
        Ok(())
    }

    async fn follow(mut self: Box<Self>, sink: &mut LineSink, cancel: CancellationToken) -> Result<()> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| Error::usage("file tail followed before open"))?;
        let mut buf = Vec::new();

        if let TailFrom::Last(n) = self.from {
            let mut backlog = VecDeque::with_capacity(n.min(1024));
            loop {
                let read = reader.read_until(b'\n', &mut buf).await?;
                if read == 0 || !buf.ends_with(b"\n") {
                    self.offset += read as u64;
                    break;
                }
                self.offset += read as u64;
                if n > 0 {
                    if backlog.len() == n {
                        backlog.pop_front();
                    }
                    backlog.push_back(std::mem::take(&mut buf));
                } else {
                    buf.clear();
                }
            }
            for raw in backlog {
                self.emit(sink, &raw).await?;
            }
        }

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = reader.read_until(b'\n', &mut buf) => read?,
            };
            if read > 0 {
                self.offset += read as u64;
                if buf.ends_with(b"\n") {
                    let raw = std::mem::take(&mut buf);
                    self.emit(sink, &raw).await?;
                }
                continue;
            }

            let Some(poll) = self.poll else {
                if !buf.is_empty() {
                    let raw = std::mem::take(&mut buf);
                    self.emit(sink, &raw).await?;
                }
                if let Some(line) = self.partial.take() {
                    sink.send(line).await?;
                }
                return Ok(());
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(poll) => {}
            }

            match tokio::fs::metadata(&self.path).await {
                Ok(meta) if file_id(&meta) != self.file_id || meta.len() < self.offset => {
                    debug!(path = %self.path.display(), "log file rotated, reopening");
                    reader = self.reopen().await?;
                    buf.clear();
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::source_failed(
                        self.path.display(),
                        "log file removed",
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> u64 {
    0
}
