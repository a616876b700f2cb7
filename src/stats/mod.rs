// # Execution Statistics Registry
//
// A fixed, ordered set of counters per transaction plus a global aggregate.
// Increments are relaxed atomic adds with no lock: a torn read-modify-write
// window is accepted in exchange for zero synchronization on the hot path
// ("lost update for counters"). The registry mutex serializes only block
// creation/destruction and the global fold.

pub mod diag;

use crate::common::TranIndex;
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The fixed counter set, in registry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatKind {
    // File I/O
    FileCreates,
    FileRemoves,
    FileIoReads,
    FileIoWrites,
    // Page buffer
    PbFetches,
    PbDirties,
    PbIoReads,
    PbIoWrites,
    PbVictims,
    PbReplacements,
    // Log
    LogAppendRecs,
    LogArchives,
    LogCheckpoints,
    // Locks
    LockAcquires,
    LockConverts,
    LockReRequests,
    LockWaits,
    // Transactions
    TranCommits,
    TranRollbacks,
    TranTopops,
    TranInterrupts,
    // B-tree
    BtreeInserts,
    BtreeDeletes,
    BtreeUpdates,
    // Query manager
    QuerySelects,
    QueryInserts,
    QueryDeletes,
    QueryUpdates,
    QueryScans,
    QueryJoins,
    // Network
    NetRequests,
    // Adaptive flush
    AdaptiveFlushPages,
    AdaptiveFlushTokens,
}

pub const STAT_COUNT: usize = 33;

impl StatKind {
    pub const ALL: [StatKind; STAT_COUNT] = [
        StatKind::FileCreates,
        StatKind::FileRemoves,
        StatKind::FileIoReads,
        StatKind::FileIoWrites,
        StatKind::PbFetches,
        StatKind::PbDirties,
        StatKind::PbIoReads,
        StatKind::PbIoWrites,
        StatKind::PbVictims,
        StatKind::PbReplacements,
        StatKind::LogAppendRecs,
        StatKind::LogArchives,
        StatKind::LogCheckpoints,
        StatKind::LockAcquires,
        StatKind::LockConverts,
        StatKind::LockReRequests,
        StatKind::LockWaits,
        StatKind::TranCommits,
        StatKind::TranRollbacks,
        StatKind::TranTopops,
        StatKind::TranInterrupts,
        StatKind::BtreeInserts,
        StatKind::BtreeDeletes,
        StatKind::BtreeUpdates,
        StatKind::QuerySelects,
        StatKind::QueryInserts,
        StatKind::QueryDeletes,
        StatKind::QueryUpdates,
        StatKind::QueryScans,
        StatKind::QueryJoins,
        StatKind::NetRequests,
        StatKind::AdaptiveFlushPages,
        StatKind::AdaptiveFlushTokens,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StatKind::FileCreates => "file_num_creates",
            StatKind::FileRemoves => "file_num_removes",
            StatKind::FileIoReads => "file_num_ioreads",
            StatKind::FileIoWrites => "file_num_iowrites",
            StatKind::PbFetches => "pb_num_fetches",
            StatKind::PbDirties => "pb_num_dirties",
            StatKind::PbIoReads => "pb_num_ioreads",
            StatKind::PbIoWrites => "pb_num_iowrites",
            StatKind::PbVictims => "pb_num_victims",
            StatKind::PbReplacements => "pb_num_replacements",
            StatKind::LogAppendRecs => "log_num_appendrecs",
            StatKind::LogArchives => "log_num_archives",
            StatKind::LogCheckpoints => "log_num_checkpoints",
            StatKind::LockAcquires => "lk_num_acquired",
            StatKind::LockConverts => "lk_num_converted",
            StatKind::LockReRequests => "lk_num_re_requested",
            StatKind::LockWaits => "lk_num_waited",
            StatKind::TranCommits => "tran_num_commits",
            StatKind::TranRollbacks => "tran_num_rollbacks",
            StatKind::TranTopops => "tran_num_topops",
            StatKind::TranInterrupts => "tran_num_interrupts",
            StatKind::BtreeInserts => "bt_num_inserts",
            StatKind::BtreeDeletes => "bt_num_deletes",
            StatKind::BtreeUpdates => "bt_num_updates",
            StatKind::QuerySelects => "qm_num_selects",
            StatKind::QueryInserts => "qm_num_inserts",
            StatKind::QueryDeletes => "qm_num_deletes",
            StatKind::QueryUpdates => "qm_num_updates",
            StatKind::QueryScans => "qm_num_scans",
            StatKind::QueryJoins => "qm_num_joins",
            StatKind::NetRequests => "net_num_requests",
            StatKind::AdaptiveFlushPages => "fc_num_pages",
            StatKind::AdaptiveFlushTokens => "fc_num_tokens",
        }
    }
}

/// One transaction's counter block. Increments are relaxed and unlocked;
/// `copy` takes the block lock to pair with create/destroy.
pub struct StatBlock {
    counters: [AtomicU64; STAT_COUNT],
    lock: Mutex<()>,
}

impl StatBlock {
    fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn increment(&self, kind: StatKind) {
        self.counters[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, kind: StatKind, n: u64) {
        self.counters[kind as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, kind: StatKind) -> u64 {
        self.counters[kind as usize].load(Ordering::Relaxed)
    }

    fn reset(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
    }

    fn values(&self) -> [u64; STAT_COUNT] {
        std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed))
    }
}

/// A consistent copy of one block plus derived rates.
#[derive(Debug, Clone)]
pub struct StatSnapshot {
    pub values: [u64; STAT_COUNT],
    /// Buffer hit ratio scaled by 10 000 to stay in integer arithmetic
    pub pb_hit_ratio: u64,
}

impl StatSnapshot {
    pub fn get(&self, kind: StatKind) -> u64 {
        self.values[kind as usize]
    }

    /// Human-readable dump, one counter per line.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for kind in StatKind::ALL {
            let _ = writeln!(out, "{:32} = {}", kind.name(), self.get(kind));
        }
        let _ = writeln!(out, "{:32} = {}", "pb_hit_ratio_x10000", self.pb_hit_ratio);
        out
    }
}

fn hit_ratio(values: &[u64; STAT_COUNT]) -> u64 {
    let fetches = values[StatKind::PbFetches as usize];
    let ioreads = values[StatKind::PbIoReads as usize];
    if fetches == 0 {
        return 0;
    }
    fetches.saturating_sub(ioreads) * 10_000 / fetches
}

/// Threshold-crossing notification
#[derive(Debug, Clone)]
pub struct ThresholdEvent {
    pub kind: StatKind,
    pub tran_index: TranIndex,
    pub value: u64,
}

/// Process-wide statistics registry.
pub struct StatsRegistry {
    /// Serializes block create/destroy and the global fold; increments
    /// deliberately bypass it.
    registry_lock: Mutex<()>,
    blocks: DashMap<TranIndex, Arc<StatBlock>>,
    global: StatBlock,
    global_hit_ratio: AtomicU64,
    thresholds: [AtomicU64; STAT_COUNT],
    num_slots: usize,
    events_tx: Sender<ThresholdEvent>,
    events_rx: Receiver<ThresholdEvent>,
}

impl StatsRegistry {
    pub fn new(num_slots: usize) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            registry_lock: Mutex::new(()),
            blocks: DashMap::new(),
            global: StatBlock::new(),
            global_hit_ratio: AtomicU64::new(0),
            thresholds: std::array::from_fn(|_| AtomicU64::new(0)),
            num_slots,
            events_tx,
            events_rx,
        }
    }

    /// Allocate the counter block for one slot, or for every slot.
    pub fn start(&self, tran_index: TranIndex, all_trans: bool) {
        let _guard = self.registry_lock.lock();
        if all_trans {
            for idx in 0..self.num_slots {
                self.blocks.entry(idx).or_insert_with(|| Arc::new(StatBlock::new()));
            }
        } else {
            self.blocks
                .entry(tran_index)
                .or_insert_with(|| Arc::new(StatBlock::new()));
        }
    }

    /// Destroy a slot's block.
    pub fn stop(&self, tran_index: TranIndex) {
        let _guard = self.registry_lock.lock();
        self.blocks.remove(&tran_index);
    }

    /// Handle for lock-free increments; the transaction context keeps it.
    pub fn block(&self, tran_index: TranIndex) -> Option<Arc<StatBlock>> {
        self.blocks.get(&tran_index).map(|b| Arc::clone(&b))
    }

    pub fn reset(&self, tran_index: TranIndex) {
        if let Some(block) = self.block(tran_index) {
            block.reset();
        }
    }

    pub fn reset_global(&self) {
        let _guard = self.registry_lock.lock();
        self.global.reset();
        self.global_hit_ratio.store(0, Ordering::Relaxed);
    }

    /// Per-counter threshold; zero disables.
    pub fn set_threshold(&self, kind: StatKind, value: u64) {
        self.thresholds[kind as usize].store(value, Ordering::Relaxed);
    }

    /// Notification stream for threshold crossings.
    pub fn events(&self) -> Receiver<ThresholdEvent> {
        self.events_rx.clone()
    }

    /// Fold a transaction's block into the global aggregate, recompute the
    /// derived rate, and evaluate thresholds. The local block restarts at
    /// zero afterwards.
    pub fn reflect_local(&self, tran_index: TranIndex) {
        let block = match self.block(tran_index) {
            Some(b) => b,
            None => return,
        };
        let _guard = self.registry_lock.lock();
        let values = block.values();
        block.reset();
        for (i, v) in values.iter().enumerate() {
            if *v > 0 {
                self.global.counters[i].fetch_add(*v, Ordering::Relaxed);
            }
        }
        self.global_hit_ratio
            .store(hit_ratio(&self.global.values()), Ordering::Relaxed);

        for kind in StatKind::ALL {
            let threshold = self.thresholds[kind as usize].load(Ordering::Relaxed);
            if threshold > 0 {
                let v = values[kind as usize];
                if v >= threshold {
                    let _ = self.events_tx.send(ThresholdEvent { kind, tran_index, value: v });
                }
            }
        }
    }

    /// Consistent copy of one transaction's counters with derived rates.
    pub fn copy(&self, tran_index: TranIndex) -> Option<StatSnapshot> {
        let block = self.block(tran_index)?;
        let _block_guard = block.lock.lock();
        let values = block.values();
        Some(StatSnapshot { pb_hit_ratio: hit_ratio(&values), values })
    }

    /// Snapshot of the global aggregate.
    pub fn global_snapshot(&self) -> StatSnapshot {
        let _guard = self.registry_lock.lock();
        let values = self.global.values();
        StatSnapshot {
            pb_hit_ratio: self.global_hit_ratio.load(Ordering::Relaxed),
            values,
        }
    }
}
