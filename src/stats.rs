use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::binder::registry::StatisticsSink;
use crate::error::CoreError;
use crate::xml::Element;

/// Outcome the client reported for one literal entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryStatus {
    pub kind: String,
    pub name: String,
    /// good | bad | modified | extra
    pub state: String,
}

/// One client interaction's worth of statistics.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsRecord {
    pub client: String,
    pub timestamp: String,
    pub entries: Vec<EntryStatus>,
}

/// Parse a `RecvStats` body: a `<Statistics>` document with one
/// `<Entry kind name state/>` child per entry the client attempted.
pub fn parse_stats(client: &str, root: &Element) -> Result<StatsRecord, CoreError> {
    if root.name != "Statistics" {
        return Err(CoreError::MetadataRuntime(format!(
            "unexpected statistics root {}",
            root.name
        )));
    }

    let mut entries = Vec::new();
    for child in root.find_all("Entry") {
        let (Some(kind), Some(name)) = (child.attr("kind"), child.attr("name")) else {
            continue;
        };
        entries.push(EntryStatus {
            kind: kind.to_string(),
            name: name.to_string(),
            state: child.attr("state").unwrap_or("extra").to_string(),
        });
    }

    Ok(StatsRecord {
        client: client.to_string(),
        timestamp: now_ts(),
        entries,
    })
}

fn now_ts() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "<time>".to_string())
}

/// Bounded statistics queue. Enqueue never blocks the response path:
/// when the queue is full the oldest record is dropped and a counter
/// incremented. A consumer task drains records into every registered
/// sink.
pub struct StatsIntake {
    queue: Mutex<VecDeque<StatsRecord>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl StatsIntake {
    pub fn new(capacity: usize) -> Self {
        StatsIntake {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn enqueue(&self, record: StatsRecord) {
        {
            let mut queue = self.queue.lock().expect("stats queue lock");
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "statistics queue full; dropped oldest record");
            }
            queue.push_back(record);
        }
        self.notify.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Option<StatsRecord> {
        self.queue.lock().expect("stats queue lock").pop_front()
    }

    /// Consumer loop; runs on its own task for the life of the server.
    pub async fn run(self: Arc<Self>, sinks: Vec<Arc<dyn StatisticsSink>>) {
        loop {
            while let Some(record) = self.pop() {
                for sink in &sinks {
                    if let Err(err) = sink.store(&record) {
                        tracing::warn!(
                            sink = sink.name(),
                            client = %record.client,
                            error = %err,
                            "statistics sink failed"
                        );
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    /// Synchronously drain everything queued so far.
    pub fn drain_into(&self, sinks: &[Arc<dyn StatisticsSink>]) {
        while let Some(record) = self.pop() {
            for sink in sinks {
                if let Err(err) = sink.store(&record) {
                    tracing::warn!(sink = sink.name(), error = %err, "statistics sink failed");
                }
            }
        }
    }
}

/// Append-only flat log sink: one JSON line per client interaction.
pub struct FlatLogSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FlatLogSink {
    pub fn new(path: PathBuf) -> Self {
        FlatLogSink {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

impl StatisticsSink for FlatLogSink {
    fn name(&self) -> &str {
        "flatlog"
    }

    fn store(&self, record: &StatsRecord) -> Result<(), CoreError> {
        use std::io::Write;

        let line = serde_json::to_string(record)
            .map_err(|err| CoreError::plugin("flatlog", err.to_string()))?;

        let _guard = self.write_lock.lock().expect("flat log lock");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| CoreError::plugin("flatlog", err.to_string()))?;
        writeln!(file, "{line}").map_err(|err| CoreError::plugin("flatlog", err.to_string()))?;
        Ok(())
    }
}
