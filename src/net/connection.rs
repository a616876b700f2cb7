// # Connection Multiplexer
//
// Per-connection state: one critical section guarding six FIFO queues
// (request, data, data-wait, abort, error, posted buffers), a 16-bit
// request-id generator that skips zero and every id still live on a queue,
// and an optional redirect target used to splice packets onto another
// connection. Producers collect the waiters to wake while holding the
// section, then release it and signal each waiter's own condition variable.

use crate::common::{NodeId, RequestId};
use crate::error::{DbError, Result};
use crate::net::buffer_pool::NetBufferPool;
use crate::net::header::{PacketHeader, PacketType, FC_SET_ROUTER};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Open,
    Closing,
    Closed,
}

/// Outbound packet writer; the server backs this with a socket, tests with
/// a channel.
pub trait PacketSink: Send + Sync {
    fn send(&self, header: &PacketHeader, body: &[u8]) -> Result<()>;
}

/// Opens a connection to another node when a set-router packet rebinds the
/// redirect target.
pub trait RouteOpener: Send + Sync {
    fn open(&self, node: NodeId) -> Result<Arc<Connection>>;
}

struct QueueEntry {
    rid: RequestId,
    header: PacketHeader,
    body: Option<Vec<u8>>,
}

enum WaitOutcome {
    Pending,
    Arrived(Vec<u8>),
    Interrupted,
    Closed,
}

struct WaitSlot {
    state: Mutex<WaitOutcome>,
    cond: Condvar,
}

impl WaitSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaitOutcome::Pending),
            cond: Condvar::new(),
        })
    }

    fn resolve(&self, outcome: WaitOutcome) {
        let mut state = self.state.lock();
        if matches!(*state, WaitOutcome::Pending) {
            *state = outcome;
            self.cond.notify_one();
        }
    }
}

struct DataWaiter {
    rid: RequestId,
    slot: Arc<WaitSlot>,
}

struct ConnInner {
    status: ConnStatus,
    request_queue: VecDeque<QueueEntry>,
    data_queue: VecDeque<QueueEntry>,
    error_queue: VecDeque<QueueEntry>,
    abort_queue: Vec<RequestId>,
    buffer_queue: Vec<(RequestId, Vec<u8>)>,
    data_waiters: Vec<DataWaiter>,
    next_request_id: u16,
    transaction_id: u32,
    global_transaction_id: u32,
    db_error: i32,
    trans_conn: Option<Arc<Connection>>,
    trans_back: Option<Weak<Connection>>,
    bound_node: Option<NodeId>,
}

/// One multiplexed connection
pub struct Connection {
    peer_node: NodeId,
    cs: Mutex<ConnInner>,
    sink: Arc<dyn PacketSink>,
    buffer_pool: Arc<NetBufferPool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_node", &self.peer_node)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(peer_node: NodeId, sink: Arc<dyn PacketSink>, buffer_pool: Arc<NetBufferPool>) -> Arc<Self> {
        Arc::new(Self {
            peer_node,
            cs: Mutex::new(ConnInner {
                status: ConnStatus::Open,
                request_queue: VecDeque::new(),
                data_queue: VecDeque::new(),
                error_queue: VecDeque::new(),
                abort_queue: Vec::new(),
                buffer_queue: Vec::new(),
                data_waiters: Vec::new(),
                next_request_id: 0,
                transaction_id: 0,
                global_transaction_id: 0,
                db_error: 0,
                trans_conn: None,
                trans_back: None,
                bound_node: None,
            }),
            sink,
            buffer_pool,
        })
    }

    pub fn peer_node(&self) -> NodeId {
        self.peer_node
    }

    pub fn status(&self) -> ConnStatus {
        self.cs.lock().status
    }

    pub fn db_error(&self) -> i32 {
        self.cs.lock().db_error
    }

    pub fn transaction_id(&self) -> u32 {
        self.cs.lock().transaction_id
    }

    /// Global transaction id substituted into forwarded headers
    pub fn set_global_transaction_id(&self, id: u32) {
        self.cs.lock().global_transaction_id = id;
    }

    /// Next request id: wraps mod 2^16, never zero, never an id still live
    /// on any queue.
    pub fn next_request_id(&self) -> Result<RequestId> {
        let mut inner = self.cs.lock();
        for _ in 0..=u16::MAX as u32 {
            inner.next_request_id = inner.next_request_id.wrapping_add(1);
            let rid = inner.next_request_id;
            if rid == 0 {
                continue;
            }
            if !rid_live(&inner, rid) {
                return Ok(rid);
            }
        }
        Err(DbError::ResourceExhausted("no free request id".to_string()))
    }

    /// Send a packet to the peer.
    pub fn send(&self, header: &PacketHeader, body: &[u8]) -> Result<()> {
        self.sink.send(header, body)
    }

    /// Feed one incoming packet through the dispatch state machine. The
    /// caller (the reader loop) has already consumed the body bytes.
    pub fn handle_packet(
        self: &Arc<Self>,
        mut header: PacketHeader,
        body: Option<Vec<u8>>,
        opener: Option<&dyn RouteOpener>,
    ) -> Result<()> {
        enum Action {
            Done,
            Wake(Arc<WaitSlot>, Vec<u8>),
            Forward(Arc<Connection>, PacketHeader, Option<Vec<u8>>),
            Rebind(Option<Arc<Connection>>, NodeId),
            CloseWake(Vec<Arc<WaitSlot>>, Option<Arc<Connection>>),
        }

        let action = {
            let mut inner = self.cs.lock();
            inner.transaction_id = header.transaction_id;
            inner.db_error = header.db_error;

            match header.ptype {
                PacketType::Close => {
                    let waiters = close_locked(&mut inner, &self.buffer_pool);
                    let target = inner.trans_conn.take();
                    inner.trans_back = None;
                    Action::CloseWake(waiters, target)
                }
                PacketType::Abort => {
                    drop_entries_for(&mut inner, header.request_id, &self.buffer_pool);
                    if !inner.abort_queue.contains(&header.request_id) {
                        inner.abort_queue.push(header.request_id);
                    }
                    Action::Done
                }
                _ if header.function_code == FC_SET_ROUTER
                    && inner.bound_node != Some(header.node_id) =>
                {
                    let old = inner.trans_conn.take();
                    inner.trans_back = None;
                    Action::Rebind(old, header.node_id)
                }
                _ => {
                    if let Some(target) = inner.trans_conn.clone() {
                        header.transaction_id = inner.global_transaction_id;
                        Action::Forward(target, header, body)
                    } else if inner.abort_queue.contains(&header.request_id) {
                        // Aborted mid-flight: header consumed, body drained
                        if let Some(b) = body {
                            self.buffer_pool.free(b);
                        }
                        Action::Done
                    } else {
                        match header.ptype {
                            PacketType::Command => {
                                inner.request_queue.push_back(QueueEntry {
                                    rid: header.request_id,
                                    header,
                                    body,
                                });
                                Action::Done
                            }
                            PacketType::Data => {
                                match queue_data_locked(&mut inner, header, body) {
                                    ConnDataAction::Done => Action::Done,
                                    ConnDataAction::Wake(slot, payload) => {
                                        Action::Wake(slot, payload)
                                    }
                                }
                            }
                            PacketType::Error => {
                                inner.error_queue.push_back(QueueEntry {
                                    rid: header.request_id,
                                    header,
                                    body,
                                });
                                Action::Done
                            }
                            PacketType::Magic => Action::Done,
                            PacketType::Close | PacketType::Abort => unreachable!(),
                        }
                    }
                }
            }
        };

        match action {
            Action::Done => Ok(()),
            Action::Wake(slot, payload) => {
                slot.resolve(WaitOutcome::Arrived(payload));
                Ok(())
            }
            Action::Forward(target, header, body) => {
                target.send(&header, body.as_deref().unwrap_or(&[]))
            }
            Action::Rebind(old, node) => {
                if let Some(old) = old {
                    old.clear_redirect_back();
                    old.close();
                }
                let opener = opener.ok_or_else(|| {
                    DbError::Network("set-router received but no route opener".to_string())
                })?;
                let target = opener.open(node)?;
                {
                    let mut inner = self.cs.lock();
                    inner.bound_node = Some(node);
                    inner.trans_conn = Some(Arc::clone(&target));
                }
                target.cs.lock().trans_back = Some(Arc::downgrade(self));
                debug!(node, "connection rebound to new router target");
                Ok(())
            }
            Action::CloseWake(waiters, target) => {
                for slot in waiters {
                    slot.resolve(WaitOutcome::Closed);
                }
                if let Some(target) = target {
                    target.clear_redirect_back();
                    target.close();
                }
                Ok(())
            }
        }
    }

    fn clear_redirect_back(&self) {
        let mut inner = self.cs.lock();
        inner.trans_back = None;
        inner.trans_conn = None;
    }

    /// Pop the oldest pending command, FIFO per arrival order.
    pub fn receive_request(&self) -> Option<(PacketHeader, Option<Vec<u8>>)> {
        let mut inner = self.cs.lock();
        inner.request_queue.pop_front().map(|e| (e.header, e.body))
    }

    /// Pop a queued error payload for a request.
    pub fn receive_error(&self, rid: RequestId) -> Option<Vec<u8>> {
        let mut inner = self.cs.lock();
        let idx = inner.error_queue.iter().position(|e| e.rid == rid)?;
        inner.error_queue.remove(idx).and_then(|e| e.body)
    }

    /// Pre-post a receive buffer for a request's data body.
    pub fn post_receive_buffer(&self, rid: RequestId, buf: Vec<u8>) {
        self.cs.lock().buffer_queue.push((rid, buf));
    }

    /// Block until the data body for `rid` arrives. Resume reasons are
    /// distinguished on wakeup: arrived, deadline exceeded, interrupted, or
    /// connection closed while suspended.
    pub fn wait_for_data(&self, rid: RequestId, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let slot = {
            let mut inner = self.cs.lock();
            if inner.status == ConnStatus::Closed {
                return Err(DbError::ConnectionClosed);
            }
            // Data queue first
            if let Some(idx) = inner.data_queue.iter().position(|e| e.rid == rid) {
                let entry = inner
                    .data_queue
                    .remove(idx)
                    .ok_or_else(|| DbError::Internal("data entry vanished".to_string()))?;
                return Ok(entry.body.unwrap_or_default());
            }
            let slot = WaitSlot::new();
            inner.data_waiters.push(DataWaiter { rid, slot: Arc::clone(&slot) });
            slot
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = slot.state.lock();
        loop {
            match std::mem::replace(&mut *state, WaitOutcome::Pending) {
                WaitOutcome::Arrived(payload) => return Ok(payload),
                WaitOutcome::Interrupted => {
                    drop(state);
                    self.remove_waiter(&slot);
                    return Err(DbError::Interrupted);
                }
                WaitOutcome::Closed => return Err(DbError::ConnectionClosed),
                WaitOutcome::Pending => {}
            }
            match deadline {
                Some(deadline) => {
                    if slot.cond.wait_until(&mut state, deadline).timed_out() {
                        // Remove self from the wait queue, then re-check:
                        // the producer may have delivered in the window.
                        drop(state);
                        self.remove_waiter(&slot);
                        let mut state = slot.state.lock();
                        return match std::mem::replace(&mut *state, WaitOutcome::Pending) {
                            WaitOutcome::Arrived(payload) => Ok(payload),
                            WaitOutcome::Closed => Err(DbError::ConnectionClosed),
                            WaitOutcome::Interrupted => Err(DbError::Interrupted),
                            WaitOutcome::Pending => Err(DbError::NoData),
                        };
                    }
                }
                None => slot.cond.wait(&mut state),
            }
        }
    }

    /// Interrupt a parked reader of `rid`.
    pub fn interrupt_request(&self, rid: RequestId) {
        let slot = {
            let mut inner = self.cs.lock();
            match inner.data_waiters.iter().position(|w| w.rid == rid) {
                Some(idx) => Some(inner.data_waiters.remove(idx).slot),
                None => None,
            }
        };
        if let Some(slot) = slot {
            slot.resolve(WaitOutcome::Interrupted);
        }
    }

    fn remove_waiter(&self, slot: &Arc<WaitSlot>) {
        let mut inner = self.cs.lock();
        inner
            .data_waiters
            .retain(|w| !Arc::ptr_eq(&w.slot, slot));
    }

    /// Move the connection to CLOSED: queued packets are discarded and
    /// every parked waiter wakes with CONNECTION_CLOSED.
    pub fn close(&self) {
        let (waiters, target) = {
            let mut inner = self.cs.lock();
            if inner.status == ConnStatus::Closed {
                return;
            }
            let waiters = close_locked(&mut inner, &self.buffer_pool);
            let target = inner.trans_conn.take();
            inner.trans_back = None;
            (waiters, target)
        };
        for slot in waiters {
            slot.resolve(WaitOutcome::Closed);
        }
        if let Some(target) = target {
            target.clear_redirect_back();
            target.close();
        }
        debug!(node = self.peer_node, "connection closed");
    }

    /// Whether `rid` carries an abort marker.
    pub fn is_aborted(&self, rid: RequestId) -> bool {
        self.cs.lock().abort_queue.contains(&rid)
    }

    /// Queue depths: (request, data, waiters, abort, error)
    pub fn queue_depths(&self) -> (usize, usize, usize, usize, usize) {
        let inner = self.cs.lock();
        (
            inner.request_queue.len(),
            inner.data_queue.len(),
            inner.data_waiters.len(),
            inner.abort_queue.len(),
            inner.error_queue.len(),
        )
    }
}

fn rid_live(inner: &ConnInner, rid: RequestId) -> bool {
    inner.request_queue.iter().any(|e| e.rid == rid)
        || inner.data_queue.iter().any(|e| e.rid == rid)
        || inner.error_queue.iter().any(|e| e.rid == rid)
        || inner.abort_queue.contains(&rid)
        || inner.buffer_queue.iter().any(|(r, _)| *r == rid)
        || inner.data_waiters.iter().any(|w| w.rid == rid)
}

fn drop_entries_for(inner: &mut ConnInner, rid: RequestId, pool: &NetBufferPool) {
    let drain = |queue: &mut VecDeque<QueueEntry>| {
        let mut kept = VecDeque::with_capacity(queue.len());
        while let Some(entry) = queue.pop_front() {
            if entry.rid == rid {
                if let Some(body) = entry.body {
                    pool.free(body);
                }
            } else {
                kept.push_back(entry);
            }
        }
        *queue = kept;
    };
    drain(&mut inner.request_queue);
    drain(&mut inner.data_queue);
}

fn close_locked(inner: &mut ConnInner, pool: &NetBufferPool) -> Vec<Arc<WaitSlot>> {
    inner.status = ConnStatus::Closed;
    for queue in [&mut inner.request_queue, &mut inner.data_queue, &mut inner.error_queue] {
        while let Some(entry) = queue.pop_front() {
            if let Some(body) = entry.body {
                pool.free(body);
            }
        }
    }
    inner.abort_queue.clear();
    inner.buffer_queue.clear();
    inner.data_waiters.drain(..).map(|w| w.slot).collect()
}

/// DATA dispatch under the section: copy into a posted buffer, hand to a
/// parked waiter, or queue.
fn queue_data_locked(
    inner: &mut ConnInner,
    header: PacketHeader,
    body: Option<Vec<u8>>,
) -> ConnDataAction {
    let rid = header.request_id;
    let mut payload = body.unwrap_or_default();

    if let Some(idx) = inner.buffer_queue.iter().position(|(r, _)| *r == rid) {
        let (_, mut posted) = inner.buffer_queue.remove(idx);
        posted.clear();
        posted.extend_from_slice(&payload);
        payload = posted;
    }

    if let Some(idx) = inner.data_waiters.iter().position(|w| w.rid == rid) {
        let waiter = inner.data_waiters.remove(idx);
        // The entry never touches the data queue; exactly one reader
        // receives it.
        return ConnDataAction::Wake(waiter.slot, payload);
    }

    if payload.len() != header.buffer_size as usize {
        warn!(
            rid,
            expected = header.buffer_size,
            got = payload.len(),
            "data body size disagrees with header"
        );
    }
    inner.data_queue.push_back(QueueEntry { rid, header, body: Some(payload) });
    ConnDataAction::Done
}

enum ConnDataAction {
    Done,
    Wake(Arc<WaitSlot>, Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::header::{FC_NONE, MAGIC};

    struct RecordingSink {
        sent: Mutex<Vec<(PacketHeader, Vec<u8>)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()) })
        }
    }

    impl PacketSink for RecordingSink {
        fn send(&self, header: &PacketHeader, body: &[u8]) -> Result<()> {
            self.sent.lock().push((*header, body.to_vec()));
            Ok(())
        }
    }

    fn conn() -> Arc<Connection> {
        Connection::new(0, RecordingSink::new(), Arc::new(NetBufferPool::new()))
    }

    fn data_packet(rid: RequestId, body: &[u8]) -> PacketHeader {
        PacketHeader::new(PacketType::Data, rid).with_body_size(body.len())
    }

    #[test]
    fn test_data_before_wait() {
        let c = conn();
        c.handle_packet(data_packet(7, b"abc"), Some(b"abc".to_vec()), None)
            .unwrap();
        let payload = c.wait_for_data(7, None).unwrap();
        assert_eq!(payload, b"abc".to_vec());
        let (_, data, _, _, _) = c.queue_depths();
        assert_eq!(data, 0);
    }

    #[test]
    fn test_wait_then_data_wakes() {
        let c = conn();
        let c2 = Arc::clone(&c);
        let waiter = std::thread::spawn(move || c2.wait_for_data(9, Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(50));
        c.handle_packet(data_packet(9, b"xyz"), Some(b"xyz".to_vec()), None)
            .unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), b"xyz".to_vec());
        let (_, _, waiters, _, _) = c.queue_depths();
        assert_eq!(waiters, 0);
    }

    #[test]
    fn test_wait_timeout_returns_no_data() {
        let c = conn();
        let err = c.wait_for_data(5, Some(Duration::from_millis(40))).unwrap_err();
        assert!(matches!(err, DbError::NoData));
        let (_, _, waiters, _, _) = c.queue_depths();
        assert_eq!(waiters, 0);
    }

    #[test]
    fn test_close_wakes_waiter_with_connection_closed() {
        let c = conn();
        let c2 = Arc::clone(&c);
        let waiter =
            std::thread::spawn(move || c2.wait_for_data(7, Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(50));
        c.close();
        assert!(matches!(waiter.join().unwrap(), Err(DbError::ConnectionClosed)));
        let (_, _, waiters, _, _) = c.queue_depths();
        assert_eq!(waiters, 0);
        // A late packet for the closed request cannot reach a stale waiter
        assert!(c
            .handle_packet(data_packet(7, b"late"), Some(b"late".to_vec()), None)
            .is_ok());
        assert!(matches!(c.wait_for_data(7, Some(Duration::from_millis(10))), Err(_)));
    }

    #[test]
    fn test_interrupt_wakes_waiter() {
        let c = conn();
        let c2 = Arc::clone(&c);
        let waiter =
            std::thread::spawn(move || c2.wait_for_data(3, Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(50));
        c.interrupt_request(3);
        assert!(matches!(waiter.join().unwrap(), Err(DbError::Interrupted)));
    }

    #[test]
    fn test_abort_drops_pending_and_marks() {
        let c = conn();
        let cmd = PacketHeader::new(PacketType::Command, 4).with_body_size(2);
        c.handle_packet(cmd, Some(b"qq".to_vec()), None).unwrap();
        c.handle_packet(data_packet(4, b"dd"), Some(b"dd".to_vec()), None)
            .unwrap();

        c.handle_packet(PacketHeader::new(PacketType::Abort, 4), None, None)
            .unwrap();
        let (req, data, _, abort, _) = c.queue_depths();
        assert_eq!((req, data, abort), (0, 0, 1));
        assert!(c.is_aborted(4));

        // Marker is idempotent
        c.handle_packet(PacketHeader::new(PacketType::Abort, 4), None, None)
            .unwrap();
        let (_, _, _, abort, _) = c.queue_depths();
        assert_eq!(abort, 1);

        // Packets for the aborted id are silently dropped
        c.handle_packet(data_packet(4, b"x"), Some(b"x".to_vec()), None)
            .unwrap();
        let (_, data, _, _, _) = c.queue_depths();
        assert_eq!(data, 0);
    }

    #[test]
    fn test_request_fifo_order() {
        let c = conn();
        for rid in [11u16, 12, 13] {
            let cmd = PacketHeader::new(PacketType::Command, rid);
            c.handle_packet(cmd, None, None).unwrap();
        }
        let order: Vec<RequestId> = std::iter::from_fn(|| c.receive_request())
            .map(|(h, _)| h.request_id)
            .collect();
        assert_eq!(order, vec![11, 12, 13]);
    }

    #[test]
    fn test_request_id_generator_skips_zero_and_live() {
        let c = conn();
        assert_eq!(c.next_request_id().unwrap(), 1);
        // Make id 2 live on the data queue
        c.handle_packet(data_packet(2, b"z"), Some(b"z".to_vec()), None)
            .unwrap();
        assert_eq!(c.next_request_id().unwrap(), 3);
        // Wrap past zero
        {
            let mut inner = c.cs.lock();
            inner.next_request_id = u16::MAX;
        }
        assert_eq!(c.next_request_id().unwrap(), 1);
    }

    #[test]
    fn test_posted_buffer_receives_copy() {
        let c = conn();
        let posted = Vec::with_capacity(512);
        c.post_receive_buffer(8, posted);
        c.handle_packet(data_packet(8, b"body"), Some(b"body".to_vec()), None)
            .unwrap();
        let got = c.wait_for_data(8, None).unwrap();
        assert_eq!(got, b"body".to_vec());
        assert!(got.capacity() >= 512);
    }

    #[test]
    fn test_error_queue_routing() {
        let c = conn();
        let err = PacketHeader::new(PacketType::Error, 6).with_body_size(4);
        c.handle_packet(err, Some(b"oops".to_vec()), None).unwrap();
        assert_eq!(c.receive_error(6).unwrap(), b"oops".to_vec());
        assert!(c.receive_error(6).is_none());
    }

    struct FixedOpener {
        target: Arc<Connection>,
    }

    impl RouteOpener for FixedOpener {
        fn open(&self, _node: NodeId) -> Result<Arc<Connection>> {
            Ok(Arc::clone(&self.target))
        }
    }

    #[test]
    fn test_set_router_then_forwarding_rewrites_tran_id() {
        let sink = RecordingSink::new();
        let target = Connection::new(2, sink.clone(), Arc::new(NetBufferPool::new()));
        let c = conn();
        c.set_global_transaction_id(999);
        let opener = FixedOpener { target };

        let set_router = PacketHeader::new(PacketType::Command, 5)
            .with_function(FC_SET_ROUTER)
            .with_node(2);
        c.handle_packet(set_router, None, Some(&opener)).unwrap();

        let mut data = data_packet(5, b"fwd").with_transaction(17);
        data.function_code = FC_NONE;
        c.handle_packet(data, Some(b"fwd".to_vec()), Some(&opener)).unwrap();

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.transaction_id, 999);
        assert_eq!(sent[0].1, b"fwd".to_vec());
        // Nothing queued locally
        let (req, data, _, _, _) = c.queue_depths();
        assert_eq!((req, data), (0, 0));
    }

    #[test]
    fn test_magic_packet_ignored() {
        let c = conn();
        let magic = PacketHeader::new(PacketType::Magic, 0).with_body_size(MAGIC.len());
        c.handle_packet(magic, Some(MAGIC.to_vec()), None).unwrap();
        let (req, data, _, _, _) = c.queue_depths();
        assert_eq!((req, data), (0, 0));
    }
}
