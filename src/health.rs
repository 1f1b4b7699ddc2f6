use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// Rolled-up operational health of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelHealth {
    Ok,
    Degraded {
        destinations: Vec<DegradedDestination>,
    },
}

impl ChannelHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelHealth::Ok => "OK",
            ChannelHealth::Degraded { .. } => "DEGRADED",
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, ChannelHealth::Degraded { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DegradedDestination {
    pub destination: String,
    pub reason: String,
}

/// Tracks per-destination faults and publishes the rolled-up channel health
/// on a watch channel. A degraded mark stays until an operator redeploys the
/// channel.
pub struct HealthBoard {
    marks: Mutex<BTreeMap<String, String>>,
    sender: watch::Sender<ChannelHealth>,
}

impl HealthBoard {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ChannelHealth::Ok);
        Self {
            marks: Mutex::new(BTreeMap::new()),
            sender,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelHealth> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> ChannelHealth {
        self.sender.borrow().clone()
    }

    pub fn mark_degraded(&self, destination: impl Into<String>, reason: impl Into<String>) {
        let mut marks = self.marks.lock().expect("health marks poisoned");
        marks.insert(destination.into(), reason.into());
        self.sender.send_replace(roll_up(&marks));
    }

    pub fn clear(&self, destination: &str) {
        let mut marks = self.marks.lock().expect("health marks poisoned");
        marks.remove(destination);
        self.sender.send_replace(roll_up(&marks));
    }

    pub fn reset(&self) {
        let mut marks = self.marks.lock().expect("health marks poisoned");
        marks.clear();
        self.sender.send_replace(ChannelHealth::Ok);
    }
}

impl Default for HealthBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn roll_up(marks: &BTreeMap<String, String>) -> ChannelHealth {
    if marks.is_empty() {
        ChannelHealth::Ok
    } else {
        ChannelHealth::Degraded {
            destinations: marks
                .iter()
                .map(|(destination, reason)| DegradedDestination {
                    destination: destination.clone(),
                    reason: reason.clone(),
                })
                .collect(),
        }
    }
}
