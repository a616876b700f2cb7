// # Server-to-Server Connection Pool
//
// One bounded pool of outbound connections per remote node: a fast-path
// free list, a slow-path in-use list, and a condition variable for waiters
// when the pool is at its limit. Borrowers are registered as two-phase
// commit participants for their transaction.

use crate::common::{NodeId, TranIndex};
use crate::error::{DbError, Result};
use crate::net::connection::{ConnStatus, Connection};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct S2sPoolConfig {
    /// Maximum outbound connections per remote node
    pub max_per_node: usize,
    /// Cluster-size limit on distinct remote nodes
    pub max_nodes: usize,
    /// Database name sent during the handshake
    pub db_name: String,
}

impl Default for S2sPoolConfig {
    fn default() -> Self {
        Self {
            max_per_node: 4,
            max_nodes: 64,
            db_name: String::new(),
        }
    }
}

/// Opens a fresh outbound connection, running the two-phase handshake.
pub trait S2sOpener: Send + Sync {
    fn open(&self, node: NodeId, db_name: &str) -> Result<Arc<Connection>>;
}

/// Registers a borrower as a two-phase-commit participant.
pub trait TwoPhaseRegistrar: Send + Sync {
    fn register_participant(&self, tran_index: TranIndex, node: NodeId);
}

struct NodePoolInner {
    free: Vec<Arc<Connection>>,
    in_use: Vec<Arc<Connection>>,
    /// Connections alive or being opened
    total: usize,
}

struct NodePool {
    inner: Mutex<NodePoolInner>,
    available: Condvar,
}

impl NodePool {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NodePoolInner {
                free: Vec::new(),
                in_use: Vec::new(),
                total: 0,
            }),
            available: Condvar::new(),
        })
    }
}

/// The per-node pool registry
pub struct S2sPool {
    config: S2sPoolConfig,
    nodes: DashMap<NodeId, Arc<NodePool>>,
    opener: Arc<dyn S2sOpener>,
    registrar: Option<Arc<dyn TwoPhaseRegistrar>>,
}

impl S2sPool {
    pub fn new(
        config: S2sPoolConfig,
        opener: Arc<dyn S2sOpener>,
        registrar: Option<Arc<dyn TwoPhaseRegistrar>>,
    ) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
            opener,
            registrar,
        }
    }

    /// Borrow a connection to `node`, waiting until `deadline` when the
    /// pool is at its limit. A non-null `tran_index` registers the borrower
    /// for two-phase commit before the connection is handed out.
    pub fn borrow(
        &self,
        node: NodeId,
        tran_index: Option<TranIndex>,
        deadline: Instant,
    ) -> Result<Arc<Connection>> {
        let pool = self.node_pool(node)?;

        let conn = loop {
            let mut inner = pool.inner.lock();

            // Fast path: detach from the free list, discarding any
            // connection that died while parked there.
            let mut reused = None;
            while let Some(conn) = inner.free.pop() {
                if conn.status() == ConnStatus::Closed {
                    inner.total -= 1;
                    continue;
                }
                reused = Some(conn);
                break;
            }
            if let Some(conn) = reused {
                inner.in_use.push(Arc::clone(&conn));
                break conn;
            }

            if inner.total < self.config.max_per_node {
                inner.total += 1;
                drop(inner);
                match self.opener.open(node, &self.config.db_name) {
                    Ok(conn) => {
                        let mut inner = pool.inner.lock();
                        inner.in_use.push(Arc::clone(&conn));
                        break conn;
                    }
                    Err(e) => {
                        // The slot returns un-initialized; the next
                        // borrower allocates a fresh connection.
                        let mut inner = pool.inner.lock();
                        inner.total -= 1;
                        drop(inner);
                        pool.available.notify_one();
                        warn!(node, error = %e, "server-to-server handshake failed");
                        return Err(e);
                    }
                }
            }

            if pool.available.wait_until(&mut inner, deadline).timed_out() {
                return Err(DbError::Timeout(format!(
                    "no free connection to node {} before deadline",
                    node
                )));
            }
        };

        if let (Some(tran_index), Some(registrar)) = (tran_index, &self.registrar) {
            registrar.register_participant(tran_index, node);
        }
        debug!(node, "borrowed server-to-server connection");
        Ok(conn)
    }

    /// Return a borrowed connection: in-use to free, signal one waiter.
    pub fn give_back(&self, conn: Arc<Connection>) {
        let node = conn.peer_node();
        let pool = match self.nodes.get(&node) {
            Some(p) => Arc::clone(&p),
            None => return,
        };
        {
            let mut inner = pool.inner.lock();
            if let Some(idx) = inner.in_use.iter().position(|c| Arc::ptr_eq(c, &conn)) {
                inner.in_use.remove(idx);
            }
            if conn.status() == ConnStatus::Closed {
                inner.total -= 1;
            } else {
                inner.free.push(conn);
            }
        }
        pool.available.notify_one();
    }

    /// (free, in-use, total) for one node
    pub fn counters(&self, node: NodeId) -> (usize, usize, usize) {
        match self.nodes.get(&node) {
            Some(pool) => {
                let inner = pool.inner.lock();
                (inner.free.len(), inner.in_use.len(), inner.total)
            }
            None => (0, 0, 0),
        }
    }

    fn node_pool(&self, node: NodeId) -> Result<Arc<NodePool>> {
        if let Some(pool) = self.nodes.get(&node) {
            return Ok(Arc::clone(&pool));
        }
        if self.nodes.len() >= self.config.max_nodes {
            return Err(DbError::ResourceExhausted(format!(
                "cluster limit of {} remote nodes reached",
                self.config.max_nodes
            )));
        }
        Ok(Arc::clone(&self.nodes.entry(node).or_insert_with(NodePool::new)))
    }
}
