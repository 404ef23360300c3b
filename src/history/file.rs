//! JSON-lines history store.
//!
//! One file per instance (`{workflow_id}.jsonl`), one event per line. Every
//! append is flushed with `sync_data` before it is acknowledged. A torn final
//! line left by a crash or a failed write is truncated the next time the
//! instance is appended to. Archived runs are renamed to
//! `{workflow_id}.run-{n}.archived`.

use super::event::HistoryEvent;
use super::store::{
    check_order, validate_instance_id, HistoryError, HistoryResult, HistoryStore,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const EXTENSION: &str = "jsonl";
const ARCHIVE_EXTENSION: &str = "archived";

/// Write side of an instance file
#[async_trait]
trait HistoryFile: AsyncWrite + Unpin + Send {
    async fn sync(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl HistoryFile for fs::File {
    async fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data().await
    }
}

#[derive(Debug, Clone)]
pub struct FileHistoryStore {
    directory: PathBuf,
    /// Event count per instance, loaded lazily; the mutex serializes appends
    lengths: Arc<DashMap<String, Arc<Mutex<Option<u64>>>>>,
}

impl FileHistoryStore {
    /// Open a store rooted at `directory`, creating it if needed
    pub async fn open(directory: impl Into<PathBuf>) -> HistoryResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .await
            .map_err(|source| HistoryError::Io {
                operation: "create_dir",
                workflow_id: String::new(),
                source,
            })?;
        debug!(directory = %directory.display(), "File history store opened");
        Ok(Self {
            directory,
            lengths: Arc::new(DashMap::new()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.directory.join(format!("{workflow_id}.{EXTENSION}"))
    }

    fn archive_path_for(&self, workflow_id: &str, run: u32) -> PathBuf {
        self.directory
            .join(format!("{workflow_id}.run-{run}.{ARCHIVE_EXTENSION}"))
    }

    fn length_slot(&self, workflow_id: &str) -> Arc<Mutex<Option<u64>>> {
        self.lengths
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Count complete lines on disk, dropping a torn tail
    async fn load_length(&self, workflow_id: &str) -> HistoryResult<u64> {
        let path = self.path_for(workflow_id);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(HistoryError::Io {
                    operation: "read",
                    workflow_id: workflow_id.to_string(),
                    source,
                })
            }
        };

        let complete = match content.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        if complete < content.len() {
            warn!(
                workflow_id = %workflow_id,
                dropped_bytes = content.len() - complete,
                "Truncating torn history tail"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|source| HistoryError::Io {
                    operation: "truncate",
                    workflow_id: workflow_id.to_string(),
                    source,
                })?;
            file.set_len(complete as u64)
                .await
                .map_err(|source| HistoryError::Io {
                    operation: "truncate",
                    workflow_id: workflow_id.to_string(),
                    source,
                })?;
        }

        Ok(content[..complete].iter().filter(|b| **b == b'\n').count() as u64)
    }

    async fn append_with<F, Fut, W>(
        &self,
        workflow_id: &str,
        event: &HistoryEvent,
        open: F,
    ) -> HistoryResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::io::Result<W>>,
        W: HistoryFile,
    {
        validate_instance_id(workflow_id)?;

        let slot = self.length_slot(workflow_id);
        let mut length = slot.lock().await;
        let current = match *length {
            Some(current) => current,
            None => self.load_length(workflow_id).await?,
        };
        check_order(workflow_id, current, event)?;

        let mut line = serde_json::to_string(event).map_err(|e| HistoryError::Serialization {
            workflow_id: workflow_id.to_string(),
            event_id: event.event_id,
            message: e.to_string(),
        })?;
        line.push('\n');

        let io_error = |operation| {
            let workflow_id = workflow_id.to_string();
            move |source| HistoryError::Io {
                operation,
                workflow_id,
                source,
            }
        };

        let mut file = open().await.map_err(io_error("open"))?;
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.sync().await.map_err(io_error("sync")),
            Err(source) => Err(io_error("write")(source)),
        };
        match written {
            Ok(()) => {
                *length = Some(current + 1);
                Ok(())
            }
            Err(e) => {
                // Part of the line may have reached the file; recount before the next append
                *length = None;
                Err(e)
            }
        }
    }

    fn parse_lines(workflow_id: &str, content: &str) -> HistoryResult<Vec<HistoryEvent>> {
        let mut events = Vec::new();
        let complete = match content.rfind('\n') {
            Some(pos) => &content[..=pos],
            None => "",
        };
        for (index, line) in complete.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: HistoryEvent =
                serde_json::from_str(line).map_err(|e| HistoryError::Corrupted {
                    workflow_id: workflow_id.to_string(),
                    line: index + 1,
                    message: e.to_string(),
                })?;
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> HistoryResult<()> {
        let path = self.path_for(workflow_id);
        self.append_with(workflow_id, event, move || async move {
            OpenOptions::new().create(true).append(true).open(path).await
        })
        .await
    }

    async fn read_all(&self, workflow_id: &str) -> HistoryResult<Vec<HistoryEvent>> {
        validate_instance_id(workflow_id)?;
        let slot = self.length_slot(workflow_id);
        let _guard = slot.lock().await;

        match fs::read_to_string(self.path_for(workflow_id)).await {
            Ok(content) => Self::parse_lines(workflow_id, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(HistoryError::Io {
                operation: "read",
                workflow_id: workflow_id.to_string(),
                source,
            }),
        }
    }

    async fn list_instances(&self) -> HistoryResult<Vec<String>> {
        let io_error = |source| HistoryError::Io {
            operation: "list",
            workflow_id: String::new(),
            source,
        };
        let mut entries = fs::read_dir(&self.directory).await.map_err(io_error)?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let non_empty = entry
                .metadata()
                .await
                .map(|metadata| metadata.len() > 0)
                .unwrap_or(false);
            if non_empty && validate_instance_id(stem).is_ok() {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn archive(&self, workflow_id: &str) -> HistoryResult<u32> {
        validate_instance_id(workflow_id)?;
        let io_error = |operation| {
            let workflow_id = workflow_id.to_string();
            move |source| HistoryError::Io {
                operation,
                workflow_id,
                source,
            }
        };

        let slot = self.length_slot(workflow_id);
        let mut length = slot.lock().await;
        let path = self.path_for(workflow_id);
        let recorded = match fs::metadata(&path).await {
            Ok(metadata) => metadata.len() > 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(source) => return Err(io_error("archive")(source)),
        };
        if !recorded {
            return Err(HistoryError::NoHistory(workflow_id.to_string()));
        }

        let mut run = 1;
        while fs::try_exists(self.archive_path_for(workflow_id, run))
            .await
            .map_err(io_error("archive"))?
        {
            run += 1;
        }
        fs::rename(&path, self.archive_path_for(workflow_id, run))
            .await
            .map_err(io_error("archive"))?;
        *length = Some(0);

        info!(workflow_id = %workflow_id, run, "History archived");
        Ok(run)
    }

    async fn read_archived(&self, workflow_id: &str, run: u32) -> HistoryResult<Vec<HistoryEvent>> {
        validate_instance_id(workflow_id)?;
        match fs::read_to_string(self.archive_path_for(workflow_id, run)).await {
            Ok(content) => Self::parse_lines(workflow_id, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(HistoryError::Io {
                operation: "read",
                workflow_id: workflow_id.to_string(),
                source,
            }),
        }
    }
}
