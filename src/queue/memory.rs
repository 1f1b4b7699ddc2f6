use super::{DurableQueue, QueueError, QueuedItem};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Non-durable FIFO queue for tests and ephemeral channels. `recover` resets
/// delivery tracking, mirroring what reopening does for the journal queue.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    live: VecDeque<QueuedItem>,
    cursor: usize,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("memory queue poisoned").live.len()
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn enqueue(&self, item: QueuedItem) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("memory queue poisoned");
        inner.live.push_back(item);
        Ok(())
    }

    async fn dequeue_next(&self) -> Result<Option<QueuedItem>, QueueError> {
        let mut inner = self.inner.lock().expect("memory queue poisoned");
        if inner.cursor < inner.live.len() {
            let item = inner.live[inner.cursor].clone();
            inner.cursor += 1;
            Ok(Some(item))
        } else {
            Ok(None)
        }
    }

    async fn acknowledge(&self, item: &QueuedItem) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("memory queue poisoned");
        match inner.live.iter().position(|queued| queued.id == item.id) {
            Some(index) => {
                inner.live.remove(index);
                if index < inner.cursor {
                    inner.cursor -= 1;
                }
                Ok(())
            }
            None => Err(QueueError::UnknownItem { id: item.id }),
        }
    }

    async fn recover(&self) -> Result<Vec<QueuedItem>, QueueError> {
        let mut inner = self.inner.lock().expect("memory queue poisoned");
        inner.cursor = 0;
        Ok(inner.live.iter().cloned().collect())
    }
}
