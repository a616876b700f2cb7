// # Diagnostic View
//
// Best-effort telemetry sidecar: one row of 32-bit counters per worker
// thread, updated without synchronization by the owning thread and read
// with torn values tolerated. The segment key is derived from the database
// path and collision-resolved by linear probing; the layout keeps the
// historical magic number.

use crate::config::ServerConfig;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Segment magic, kept in octal as it has always been written
pub const DIAG_MAGIC: u32 = 0o7115;

const KEY_MASK: u32 = 0x00FF_FFFF;

/// Per-thread counter columns, in row order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum DiagCounter {
    QueryOpenPage,
    QueryOpenedPage,
    SlowQuery,
    FullScan,
    CliRequest,
    AbortedClients,
    ConnReq,
    ConnReject,
    BufferPageRead,
    BufferPageWrite,
    LockDeadlock,
    LockRequest,
}

pub const DIAG_COUNTER_COUNT: usize = 12;

impl DiagCounter {
    pub const ALL: [DiagCounter; DIAG_COUNTER_COUNT] = [
        DiagCounter::QueryOpenPage,
        DiagCounter::QueryOpenedPage,
        DiagCounter::SlowQuery,
        DiagCounter::FullScan,
        DiagCounter::CliRequest,
        DiagCounter::AbortedClients,
        DiagCounter::ConnReq,
        DiagCounter::ConnReject,
        DiagCounter::BufferPageRead,
        DiagCounter::BufferPageWrite,
        DiagCounter::LockDeadlock,
        DiagCounter::LockRequest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DiagCounter::QueryOpenPage => "open_page",
            DiagCounter::QueryOpenedPage => "opened_page",
            DiagCounter::SlowQuery => "slow_query",
            DiagCounter::FullScan => "full_scan",
            DiagCounter::CliRequest => "cli_request",
            DiagCounter::AbortedClients => "aborted_client",
            DiagCounter::ConnReq => "conn_req",
            DiagCounter::ConnReject => "conn_reject",
            DiagCounter::BufferPageRead => "buffer_page_read",
            DiagCounter::BufferPageWrite => "buffer_page_write",
            DiagCounter::LockDeadlock => "lock_deadlock",
            DiagCounter::LockRequest => "lock_request",
        }
    }
}

/// One worker thread's counter row
pub struct DiagRow {
    counters: [AtomicU32; DIAG_COUNTER_COUNT],
}

impl DiagRow {
    fn new() -> Self {
        Self { counters: std::array::from_fn(|_| AtomicU32::new(0)) }
    }
}

static USED_KEYS: Lazy<Mutex<HashSet<u32>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// The in-process diagnostic segment
pub struct DiagView {
    pub magic: u32,
    pub key: u32,
    pub server_name: String,
    rows: Vec<DiagRow>,
    long_query_time: i64,
}

impl DiagView {
    /// Create the view when `Execute_diag` is on; `None` otherwise.
    pub fn create(
        db_path: &str,
        server_name: &str,
        num_threads: usize,
        config: &ServerConfig,
    ) -> Option<Arc<DiagView>> {
        if !config.execute_diag {
            return None;
        }
        let num_threads = if num_threads == 0 { num_cpus::get() } else { num_threads };
        let key = allocate_key(db_path);
        let rows = (0..num_threads).map(|_| DiagRow::new()).collect();
        Some(Arc::new(DiagView {
            magic: DIAG_MAGIC,
            key,
            server_name: server_name.to_string(),
            rows,
            long_query_time: config.long_query_time,
        }))
    }

    pub fn num_threads(&self) -> usize {
        self.rows.len()
    }

    /// Unsynchronized increment by the owning thread
    pub fn increment(&self, thread_index: usize, counter: DiagCounter) {
        self.add(thread_index, counter, 1);
    }

    pub fn add(&self, thread_index: usize, counter: DiagCounter, n: u32) {
        if let Some(row) = self.rows.get(thread_index) {
            row.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn set(&self, thread_index: usize, counter: DiagCounter, value: u32) {
        if let Some(row) = self.rows.get(thread_index) {
            row.counters[counter as usize].store(value, Ordering::Relaxed);
        }
    }

    /// Possibly-torn read; exact only from the owning thread
    pub fn read(&self, thread_index: usize, counter: DiagCounter) -> u32 {
        self.rows
            .get(thread_index)
            .map(|row| row.counters[counter as usize].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Count the query slow when tracking is enabled and it ran at or over
    /// the configured threshold.
    pub fn record_query_time(&self, thread_index: usize, elapsed: Duration) {
        if self.long_query_time >= 1 && elapsed.as_secs() >= self.long_query_time as u64 {
            self.increment(thread_index, DiagCounter::SlowQuery);
        }
    }

    /// JSON dump of the whole segment for external tooling
    pub fn snapshot_json(&self) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = self
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let mut obj = serde_json::Map::new();
                obj.insert("thread".to_string(), json!(idx));
                for counter in DiagCounter::ALL {
                    obj.insert(
                        counter.name().to_string(),
                        json!(row.counters[counter as usize].load(Ordering::Relaxed)),
                    );
                }
                serde_json::Value::Object(obj)
            })
            .collect();
        json!({
            "magic": self.magic,
            "key": self.key,
            "server_name": self.server_name,
            "num_threads": self.rows.len(),
            "threads": rows,
        })
    }
}

impl Drop for DiagView {
    fn drop(&mut self) {
        USED_KEYS.lock().remove(&self.key);
    }
}

fn allocate_key(db_path: &str) -> u32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    db_path.hash(&mut hasher);
    let base = (hasher.finish() as u32) & KEY_MASK;

    let mut used = USED_KEYS.lock();
    let mut key = base;
    loop {
        if used.insert(key) {
            return key;
        }
        key = (key + 1) & KEY_MASK;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag_config() -> ServerConfig {
        ServerConfig { execute_diag: true, long_query_time: 2 }
    }

    #[test]
    fn test_disabled_by_config() {
        let config = ServerConfig::default();
        assert!(DiagView::create("/data/demo", "demo", 4, &config).is_none());
    }

    #[test]
    fn test_counters_per_thread() {
        let view = DiagView::create("/data/demo1", "demo", 2, &diag_config()).unwrap();
        view.increment(0, DiagCounter::FullScan);
        view.increment(0, DiagCounter::FullScan);
        view.increment(1, DiagCounter::LockRequest);
        assert_eq!(view.read(0, DiagCounter::FullScan), 2);
        assert_eq!(view.read(1, DiagCounter::FullScan), 0);
        assert_eq!(view.read(1, DiagCounter::LockRequest), 1);
    }

    #[test]
    fn test_key_collision_probes() {
        let a = DiagView::create("/same/path", "a", 1, &diag_config()).unwrap();
        let b = DiagView::create("/same/path", "b", 1, &diag_config()).unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_slow_query_threshold() {
        let view = DiagView::create("/data/demo2", "demo", 1, &diag_config()).unwrap();
        view.record_query_time(0, Duration::from_millis(500));
        assert_eq!(view.read(0, DiagCounter::SlowQuery), 0);
        view.record_query_time(0, Duration::from_secs(3));
        assert_eq!(view.read(0, DiagCounter::SlowQuery), 1);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let view = DiagView::create("/data/demo3", "demo", 1, &diag_config()).unwrap();
        let snap = view.snapshot_json();
        assert_eq!(snap["magic"], DIAG_MAGIC);
        assert_eq!(snap["threads"][0]["slow_query"], 0);
    }
}
