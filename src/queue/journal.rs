use super::{DurableQueue, QueueError, QueuedItem};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

const COMPACT_ACK_THRESHOLD: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Enqueue { item: QueuedItem },
    Ack { id: Uuid },
}

/// Append-only JSON-lines journal holding one destination's pending items.
/// Opening replays the file to rebuild the pending index. Once enough
/// acknowledgements accumulate the journal is compacted by rewriting the
/// surviving items to a sibling file and renaming it into place.
pub struct JournalQueue {
    path: PathBuf,
    inner: Mutex<JournalInner>,
}

struct JournalInner {
    file: File,
    live: VecDeque<QueuedItem>,
    cursor: usize,
    acked_since_compact: usize,
}

impl JournalQueue {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut live: VecDeque<QueuedItem> = VecDeque::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
            for (index, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalRecord>(line) {
                    Ok(JournalRecord::Enqueue { item }) => live.push_back(item),
                    Ok(JournalRecord::Ack { id }) => {
                        if let Some(position) = live.iter().position(|item| item.id == id) {
                            live.remove(position);
                        }
                    }
                    Err(err) if index + 1 == lines.len() => {
                        // A torn tail record means the writer never saw the
                        // append succeed, so the item was never reported
                        // durable. Drop the fragment.
                        tracing::warn!(
                            target: "courier::queue",
                            event = "journal_tail_dropped",
                            path = %path.display(),
                            line = index + 1,
                            detail = %err,
                        );
                    }
                    Err(err) => {
                        return Err(QueueError::Corrupt {
                            detail: format!("{} line {}: {err}", path.display(), index + 1),
                        });
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(JournalInner {
                file,
                live,
                cursor: 0,
                acked_since_compact: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .live
            .len()
    }

    fn append(inner: &mut JournalInner, record: &JournalRecord) -> Result<(), QueueError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        inner.file.write_all(line.as_bytes())?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn compact(&self, inner: &mut JournalInner) -> Result<(), QueueError> {
        let rewrite = self.path.with_extension("compact");
        {
            let mut out = File::create(&rewrite)?;
            for item in &inner.live {
                let mut line = serde_json::to_string(&JournalRecord::Enqueue {
                    item: item.clone(),
                })?;
                line.push('\n');
                out.write_all(line.as_bytes())?;
            }
            out.sync_all()?;
        }
        fs::rename(&rewrite, &self.path)?;
        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        inner.acked_since_compact = 0;
        tracing::debug!(
            target: "courier::queue",
            event = "queue_compacted",
            path = %self.path.display(),
            retained = inner.live.len(),
        );
        Ok(())
    }
}

#[async_trait]
impl DurableQueue for JournalQueue {
    async fn enqueue(&self, item: QueuedItem) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        Self::append(&mut inner, &JournalRecord::Enqueue { item: item.clone() })?;
        inner.live.push_back(item);
        Ok(())
    }

    async fn dequeue_next(&self) -> Result<Option<QueuedItem>, QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        if inner.cursor < inner.live.len() {
            let item = inner.live[inner.cursor].clone();
            inner.cursor += 1;
            Ok(Some(item))
        } else {
            Ok(None)
        }
    }

    async fn acknowledge(&self, item: &QueuedItem) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        let position = inner
            .live
            .iter()
            .position(|queued| queued.id == item.id)
            .ok_or(QueueError::UnknownItem { id: item.id })?;

        Self::append(&mut inner, &JournalRecord::Ack { id: item.id })?;
        inner.live.remove(position);
        if position < inner.cursor {
            inner.cursor -= 1;
        }
        inner.acked_since_compact += 1;
        if inner.acked_since_compact >= COMPACT_ACK_THRESHOLD {
            self.compact(&mut inner)?;
        }
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<QueuedItem>, QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner.cursor = 0;
        Ok(inner.live.iter().cloned().collect())
    }
}
