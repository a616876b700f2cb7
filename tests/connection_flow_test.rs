// Concurrency behavior of the connection multiplexer and the
// server-to-server pool: exactly-once data delivery, bounded cancellation,
// and borrow/return accounting.

use corvus_db::error::DbError;
use corvus_db::net::buffer_pool::NetBufferPool;
use corvus_db::net::connection::{Connection, PacketSink};
use corvus_db::net::header::{PacketHeader, PacketType};
use corvus_db::net::pool::{S2sOpener, S2sPool, S2sPoolConfig};
use corvus_db::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct NullSink;

impl PacketSink for NullSink {
    fn send(&self, _header: &PacketHeader, _body: &[u8]) -> Result<()> {
        Ok(())
    }
}

fn conn() -> Arc<Connection> {
    Connection::new(0, Arc::new(NullSink), Arc::new(NetBufferPool::new()))
}

fn data_packet(rid: u16, body: &[u8]) -> PacketHeader {
    PacketHeader::new(PacketType::Data, rid).with_body_size(body.len())
}

#[test]
fn test_each_data_packet_delivered_exactly_once() {
    let c = conn();
    let mut readers = Vec::new();
    for rid in 1..=8u16 {
        let c = Arc::clone(&c);
        readers.push(std::thread::spawn(move || {
            c.wait_for_data(rid, Some(Duration::from_secs(5))).unwrap()
        }));
    }
    std::thread::sleep(Duration::from_millis(30));
    for rid in 1..=8u16 {
        let body = format!("payload-{}", rid).into_bytes();
        c.handle_packet(data_packet(rid, &body), Some(body.clone()), None)
            .unwrap();
    }
    let mut seen = HashSet::new();
    for reader in readers {
        let payload = String::from_utf8(reader.join().unwrap()).unwrap();
        assert!(seen.insert(payload), "duplicate delivery");
    }
    assert_eq!(seen.len(), 8);
    let (_, data, waiters, _, _) = c.queue_depths();
    assert_eq!((data, waiters), (0, 0));
}

#[test]
fn test_reader_never_gets_foreign_request_payload() {
    let c = conn();
    c.handle_packet(data_packet(5, b"five"), Some(b"five".to_vec()), None)
        .unwrap();
    // Reading request 6 must not consume request 5's packet
    assert!(matches!(
        c.wait_for_data(6, Some(Duration::from_millis(40))),
        Err(DbError::NoData)
    ));
    assert_eq!(c.wait_for_data(5, None).unwrap(), b"five".to_vec());
}

#[test]
fn test_close_during_wait_returns_connection_closed_quickly() {
    let c = conn();
    let c2 = Arc::clone(&c);
    let waiter = std::thread::spawn(move || {
        let started = Instant::now();
        let result = c2.wait_for_data(7, Some(Duration::from_millis(100)));
        (result, started.elapsed())
    });
    std::thread::sleep(Duration::from_millis(50));
    c.close();
    let (result, elapsed) = waiter.join().unwrap();
    assert!(matches!(result, Err(DbError::ConnectionClosed)));
    // Woken well before the deadline would have fired on its own
    assert!(elapsed < Duration::from_secs(2));

    // No stale waiter remains; a late packet for that request goes nowhere
    let (_, _, waiters, _, _) = c.queue_depths();
    assert_eq!(waiters, 0);
    c.handle_packet(data_packet(7, b"late"), Some(b"late".to_vec()), None)
        .unwrap();
    let (_, data, _, _, _) = c.queue_depths();
    assert_eq!(data, 0);
}

#[test]
fn test_abort_then_data_is_dropped() {
    let c = conn();
    c.handle_packet(PacketHeader::new(PacketType::Abort, 3), None, None)
        .unwrap();
    c.handle_packet(data_packet(3, b"zzz"), Some(b"zzz".to_vec()), None)
        .unwrap();
    assert!(matches!(
        c.wait_for_data(3, Some(Duration::from_millis(40))),
        Err(DbError::NoData)
    ));
}

struct CountingOpener {
    opened: AtomicUsize,
}

impl S2sOpener for CountingOpener {
    fn open(&self, node: u32, _db_name: &str) -> Result<Arc<Connection>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Connection::new(
            node,
            Arc::new(NullSink),
            Arc::new(NetBufferPool::new()),
        ))
    }
}

#[test]
fn test_pool_borrow_return_leaves_counters_unchanged() {
    let pool = S2sPool::new(
        S2sPoolConfig::default(),
        Arc::new(CountingOpener { opened: AtomicUsize::new(0) }),
        None,
    );
    let deadline = Instant::now() + Duration::from_millis(200);
    let before = pool.counters(3);
    let conn = pool.borrow(3, None, deadline).unwrap();
    pool.give_back(conn);
    let after = pool.counters(3);
    // One connection exists either way; free/in-use balance restored
    assert_eq!(after.0, before.0 + 1);
    assert_eq!(after.1, 0);

    let conn = pool.borrow(3, None, Instant::now() + Duration::from_millis(200)).unwrap();
    pool.give_back(conn);
    assert_eq!(pool.counters(3), after);
}

#[test]
fn test_pool_contention_many_borrowers() {
    let pool = Arc::new(S2sPool::new(
        S2sPoolConfig { max_per_node: 2, ..Default::default() },
        Arc::new(CountingOpener { opened: AtomicUsize::new(0) }),
        None,
    ));
    let mut workers = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        workers.push(std::thread::spawn(move || {
            for _ in 0..10 {
                let conn = pool
                    .borrow(1, None, Instant::now() + Duration::from_secs(5))
                    .unwrap();
                std::thread::sleep(Duration::from_millis(1));
                pool.give_back(conn);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    let (free, in_use, total) = pool.counters(1);
    assert_eq!(in_use, 0);
    assert!(total <= 2);
    assert_eq!(free, total);
}
