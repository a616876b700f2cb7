// # Server
//
// The connection front end: a TCP listener with one reader thread per
// client connection feeding the multiplexer, dispatch of queued commands
// (plan execution, remote class scans), registration with the cluster
// master at startup, and the TCP-backed opener behind the server-to-server
// pool.

use crate::common::{NodeId, Oid, RequestId, TranIndex, LOCAL_NODE_ID};
use crate::config::ServerConfig;
use crate::error::{DbError, Result};
use crate::exec::{execute_plan, ExecContext, XaslPlan};
use crate::net::buffer_pool::NetBufferPool;
use crate::net::connection::{Connection, PacketSink};
use crate::net::handshake::{
    master_handshake, read_packet, s2s_client_handshake, write_packet, MasterProtocol,
    MasterReply, S2sHandshake,
};
use crate::net::header::{
    PacketHeader, PacketType, FC_EXECUTE_PLAN, FC_REMOTE_SCAN,
};
use crate::net::pool::{S2sOpener, S2sPool, S2sPoolConfig, TwoPhaseRegistrar};
use crate::plancache::{PlanCache, PlanCacheConfig};
use crate::runtime::list_file::{ListFile, ListFlags};
use crate::runtime::tuple::TypeList;
use crate::runtime::value::Value;
use crate::scan::RemoteClassFetcher;
use crate::stats::diag::{DiagCounter, DiagView};
use crate::stats::{StatKind, StatsRegistry};
use crate::storage::StorageServices;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Refuse connections beyond this count
pub const MAX_CONCURRENT_CONNECTIONS: usize = 10_000;

/// Rows per DATA packet when streaming a remote scan
const REMOTE_SCAN_CHUNK: usize = 256;

/// Startup options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub db_name: String,
    pub server_name: String,
    pub listen_addr: String,
    pub master_addr: Option<String>,
    /// node id -> address for server-to-server connections
    pub cluster_addrs: HashMap<NodeId, String>,
    pub num_tran_slots: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            db_name: "demodb".to_string(),
            server_name: "corvus".to_string(),
            listen_addr: "127.0.0.1:41523".to_string(),
            master_addr: None,
            cluster_addrs: HashMap::new(),
            num_tran_slots: 64,
        }
    }
}

/// Socket-backed outbound packet writer
pub struct TcpPacketSink {
    stream: Mutex<TcpStream>,
}

impl TcpPacketSink {
    pub fn new(stream: TcpStream) -> Arc<Self> {
        Arc::new(Self { stream: Mutex::new(stream) })
    }
}

impl PacketSink for TcpPacketSink {
    fn send(&self, header: &PacketHeader, body: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(&header.encode())?;
        if !body.is_empty() {
            stream.write_all(body)?;
        }
        stream.flush()?;
        Ok(())
    }
}

/// Opens server-to-server connections over TCP with the two-phase
/// handshake, redialing once when the peer answers with a new port.
pub struct TcpS2sOpener {
    cluster_addrs: HashMap<NodeId, String>,
    buffer_pool: Arc<NetBufferPool>,
}

impl TcpS2sOpener {
    pub fn new(cluster_addrs: HashMap<NodeId, String>, buffer_pool: Arc<NetBufferPool>) -> Self {
        Self { cluster_addrs, buffer_pool }
    }
}

impl S2sOpener for TcpS2sOpener {
    fn open(&self, node: NodeId, db_name: &str) -> Result<Arc<Connection>> {
        let addr = self
            .cluster_addrs
            .get(&node)
            .ok_or_else(|| DbError::Network(format!("no address for node {}", node)))?;

        let mut stream = TcpStream::connect(addr).map_err(|e| {
            DbError::Network(format!("cannot reach node {} at {}: {}", node, addr, e))
        })?;
        let mut outcome = s2s_client_handshake(&mut stream, db_name, true)?;
        if let S2sHandshake::ReconnectNewPort(port) = outcome {
            // Close and redo against the new port, without magic
            drop(stream);
            let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr.as_str());
            stream = TcpStream::connect((host, port)).map_err(|e| {
                DbError::Network(format!("reconnect to {}:{} failed: {}", host, port, e))
            })?;
            outcome = s2s_client_handshake(&mut stream, db_name, false)?;
        }
        if outcome != S2sHandshake::Accepted {
            return Err(DbError::Network("handshake did not settle".to_string()));
        }

        let reader = stream.try_clone()?;
        let conn = Connection::new(node, TcpPacketSink::new(stream), Arc::clone(&self.buffer_pool));

        // Pump incoming packets into the multiplexer
        let pump = Arc::clone(&conn);
        std::thread::Builder::new()
            .name(format!("s2s-reader-{}", node))
            .spawn(move || {
                let mut reader = reader;
                loop {
                    match read_packet(&mut reader) {
                        Ok((header, body)) => {
                            if header.ptype == PacketType::Close {
                                pump.close();
                                break;
                            }
                            if let Err(e) = pump.handle_packet(header, body, None) {
                                warn!(error = %e, "server-to-server packet dropped");
                            }
                        }
                        Err(_) => {
                            pump.close();
                            break;
                        }
                    }
                }
            })
            .map_err(|e| DbError::Internal(e.to_string()))?;

        Ok(conn)
    }
}

/// Registers remote borrowers for two-phase commit through the
/// transaction service.
struct TranRegistrar {
    services: Arc<StorageServices>,
}

impl TwoPhaseRegistrar for TranRegistrar {
    fn register_participant(&self, tran_index: TranIndex, node: NodeId) {
        self.services.tran.register_participant(tran_index, node);
    }
}

/// Streams a non-local class through the pool into a local list file.
pub struct PooledRemoteFetcher {
    pool: Arc<S2sPool>,
    timeout: Duration,
}

impl PooledRemoteFetcher {
    pub fn new(pool: Arc<S2sPool>) -> Self {
        Self { pool, timeout: Duration::from_secs(30) }
    }
}

impl RemoteClassFetcher for PooledRemoteFetcher {
    fn fetch_class(&self, node: NodeId, class: Oid) -> Result<Arc<ListFile>> {
        let conn = self.pool.borrow(node, None, Instant::now() + self.timeout)?;
        let result = fetch_remote_list(&conn, class, self.timeout);
        self.pool.give_back(conn);
        result
    }
}

/// Client side of the remote-scan exchange: one COMMAND out, a type list
/// and row chunks back, terminated by an empty DATA body.
pub fn fetch_remote_list(
    conn: &Arc<Connection>,
    class: Oid,
    timeout: Duration,
) -> Result<Arc<ListFile>> {
    let rid = conn.next_request_id()?;
    let body = encode_class_ref(&class);
    let header = PacketHeader::new(PacketType::Command, rid)
        .with_function(FC_REMOTE_SCAN)
        .with_body_size(body.len());
    conn.send(&header, &body)?;

    let first = conn.wait_for_data(rid, Some(timeout))?;
    let (types, _): (TypeList, usize) =
        bincode::decode_from_slice(&first, bincode::config::standard())?;
    let list = Arc::new(ListFile::new(0, types, ListFlags::default()));

    loop {
        let chunk = conn.wait_for_data(rid, Some(timeout))?;
        if chunk.is_empty() {
            break;
        }
        let (rows, _): (Vec<Vec<Value>>, usize) =
            bincode::decode_from_slice(&chunk, bincode::config::standard())?;
        for row in rows {
            list.append_values(&row)?;
        }
    }
    Ok(list)
}

fn encode_class_ref(class: &Oid) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&class.volid.to_be_bytes());
    body.extend_from_slice(&class.pageid.to_be_bytes());
    body.extend_from_slice(&class.slotid.to_be_bytes());
    body
}

fn decode_class_ref(body: &[u8]) -> Result<Oid> {
    if body.len() < 8 {
        return Err(DbError::Network("short class reference".to_string()));
    }
    Ok(Oid {
        volid: u16::from_be_bytes([body[0], body[1]]),
        pageid: u32::from_be_bytes([body[2], body[3], body[4], body[5]]),
        slotid: u16::from_be_bytes([body[6], body[7]]),
    })
}

/// The assembled server
pub struct CorvusServer {
    pub options: ServerOptions,
    pub config: ServerConfig,
    pub services: Arc<StorageServices>,
    pub plan_cache: Arc<PlanCache<XaslPlan>>,
    pub stats: Arc<StatsRegistry>,
    pub diag: Option<Arc<DiagView>>,
    pub buffer_pool: Arc<NetBufferPool>,
    pub s2s: Arc<S2sPool>,
    active_connections: Arc<AtomicUsize>,
}

impl CorvusServer {
    pub fn new(options: ServerOptions, config: ServerConfig, db_path: &str) -> Self {
        let services = Arc::new(StorageServices::new());
        let buffer_pool = Arc::new(NetBufferPool::new());
        let stats = Arc::new(StatsRegistry::new(options.num_tran_slots));
        let diag = DiagView::create(
            db_path,
            &options.server_name,
            options.num_tran_slots,
            &config,
        );
        let opener = Arc::new(TcpS2sOpener::new(
            options.cluster_addrs.clone(),
            Arc::clone(&buffer_pool),
        ));
        let registrar = Arc::new(TranRegistrar { services: Arc::clone(&services) });
        let s2s = Arc::new(S2sPool::new(
            S2sPoolConfig {
                db_name: options.db_name.clone(),
                ..Default::default()
            },
            opener,
            Some(registrar),
        ));
        Self {
            options,
            config,
            services,
            plan_cache: Arc::new(PlanCache::new(PlanCacheConfig::default())),
            stats,
            diag,
            buffer_pool,
            s2s,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Announce this server to the cluster master. SERVER_ALREADY_EXISTS
    /// aborts startup.
    pub fn register_with_master(&self) -> Result<Option<MasterReply>> {
        let addr = match &self.options.master_addr {
            Some(addr) => addr,
            None => return Ok(None),
        };
        let mut stream = TcpStream::connect(addr)
            .map_err(|e| DbError::Network(format!("cannot reach master at {}: {}", addr, e)))?;
        let reply = master_handshake(&mut stream, &self.options.server_name, MasterProtocol::New)?;
        Ok(Some(reply))
    }

    /// Accept loop. One reader thread per connection.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.options.listen_addr)
            .map_err(|e| DbError::Network(e.to_string()))?;
        info!(addr = %self.options.listen_addr, "server listening");

        loop {
            let (stream, peer) = listener.accept().map_err(|e| DbError::Network(e.to_string()))?;
            if let Some(diag) = &self.diag {
                diag.increment(0, DiagCounter::ConnReq);
            }
            let current = self.active_connections.load(Ordering::Relaxed);
            if current >= MAX_CONCURRENT_CONNECTIONS {
                warn!(%peer, current, "connection limit reached, rejecting");
                if let Some(diag) = &self.diag {
                    diag.increment(0, DiagCounter::ConnReject);
                }
                continue;
            }
            self.active_connections.fetch_add(1, Ordering::Relaxed);
            info!(%peer, "client connected");

            let server = Arc::clone(self);
            std::thread::Builder::new()
                .name(format!("conn-{}", peer))
                .spawn(move || {
                    if let Err(e) = server.serve_connection(stream) {
                        if !matches!(e, DbError::ConnectionClosed) {
                            error!(error = %e, "connection failed");
                            if let Some(diag) = &server.diag {
                                diag.increment(0, DiagCounter::AbortedClients);
                            }
                        }
                    }
                    server.active_connections.fetch_sub(1, Ordering::Relaxed);
                })
                .map_err(|e| DbError::Internal(e.to_string()))?;
        }
    }

    fn serve_connection(&self, stream: TcpStream) -> Result<()> {
        let reader = stream.try_clone()?;
        let conn = Connection::new(
            LOCAL_NODE_ID,
            TcpPacketSink::new(stream),
            Arc::clone(&self.buffer_pool),
        );
        let mut reader = reader;

        loop {
            let (header, body) = read_packet(&mut reader)?;
            if header.ptype == PacketType::Close {
                conn.close();
                return Ok(());
            }
            conn.handle_packet(header, body, None)?;

            // Service queued commands in arrival order
            while let Some((req_header, req_body)) = conn.receive_request() {
                self.dispatch(&conn, req_header, req_body);
            }
        }
    }

    fn dispatch(&self, conn: &Arc<Connection>, header: PacketHeader, body: Option<Vec<u8>>) {
        let rid = header.request_id;
        let started = Instant::now();
        if let Some(block) = self.stats.block(0) {
            block.increment(StatKind::NetRequests);
        }
        if let Some(diag) = &self.diag {
            diag.increment(0, DiagCounter::CliRequest);
        }

        let result = match header.function_code {
            FC_EXECUTE_PLAN => self.handle_execute(conn, rid, body.as_deref().unwrap_or(&[])),
            FC_REMOTE_SCAN => self.handle_remote_scan(conn, rid, body.as_deref().unwrap_or(&[])),
            other => Err(DbError::InvalidInput(format!("unknown function code {}", other))),
        };

        if let Some(diag) = &self.diag {
            diag.record_query_time(0, started.elapsed());
        }
        if let Err(e) = result {
            let message = e.to_string();
            let reply = PacketHeader::new(PacketType::Error, rid)
                .with_body_size(message.len());
            if conn.send(&reply, message.as_bytes()).is_err() {
                conn.close();
            }
        }
    }

    /// Decode an encoded plan from the body, run it, and stream the result
    /// list back: type list first, then row chunks, then an empty body.
    fn handle_execute(&self, conn: &Arc<Connection>, rid: RequestId, body: &[u8]) -> Result<()> {
        let plan = XaslPlan::decode(body)?;
        let tran_index: TranIndex = 0;
        self.services.tran.begin(tran_index);
        self.stats.start(tran_index, false);

        let fetcher = PooledRemoteFetcher::new(Arc::clone(&self.s2s));
        let mut ctx = ExecContext::new(&self.services, rid as u64, tran_index);
        if let Some(block) = self.stats.block(tran_index) {
            ctx = ctx.with_stats(block);
        }
        ctx = ctx.with_remote(&fetcher);

        let list = execute_plan(&plan, &mut ctx)?;
        self.stats.reflect_local(tran_index);
        send_list(conn, rid, &list)
    }

    /// Remote scan service: send the class's rows to the requesting node.
    fn handle_remote_scan(&self, conn: &Arc<Connection>, rid: RequestId, body: &[u8]) -> Result<()> {
        let class = decode_class_ref(body)?;
        let meta = self
            .services
            .catalog
            .class(class)
            .ok_or_else(|| DbError::Catalog(format!("no class {}", class)))?;
        let types: TypeList = meta.attrs.iter().map(|a| a.domain).collect();

        let encoded = bincode::encode_to_vec(&types, bincode::config::standard())?;
        send_data(conn, rid, &encoded)?;

        let rows = self.services.heap.scan_all(class);
        for chunk in rows.chunks(REMOTE_SCAN_CHUNK) {
            let rows_only: Vec<&Vec<Value>> = chunk.iter().map(|(_, row)| row).collect();
            let encoded = bincode::encode_to_vec(&rows_only, bincode::config::standard())?;
            send_data(conn, rid, &encoded)?;
        }
        send_data(conn, rid, &[])
    }
}

fn send_data(conn: &Arc<Connection>, rid: RequestId, body: &[u8]) -> Result<()> {
    let header = PacketHeader::new(PacketType::Data, rid).with_body_size(body.len());
    conn.send(&header, body)
}

/// Stream a result list: type list, row chunks, empty terminator.
pub fn send_list(conn: &Arc<Connection>, rid: RequestId, list: &Arc<ListFile>) -> Result<()> {
    let encoded = bincode::encode_to_vec(list.type_list(), bincode::config::standard())?;
    send_data(conn, rid, &encoded)?;

    let mut scan = list.open_scan();
    let mut chunk: Vec<Vec<Value>> = Vec::with_capacity(REMOTE_SCAN_CHUNK);
    while let Some(row) = scan.next_tuple()? {
        chunk.push(row);
        if chunk.len() >= REMOTE_SCAN_CHUNK {
            let encoded = bincode::encode_to_vec(&chunk, bincode::config::standard())?;
            send_data(conn, rid, &encoded)?;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        let encoded = bincode::encode_to_vec(&chunk, bincode::config::standard())?;
        send_data(conn, rid, &encoded)?;
    }
    send_data(conn, rid, &[])
}

/// Write one packet to a raw stream; used by thin clients and tests.
pub fn send_packet_raw<S: Write>(stream: &mut S, header: &PacketHeader, body: &[u8]) -> Result<()> {
    write_packet(stream, header, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::header::FC_NONE;

    struct MemorySink {
        sent: Mutex<Vec<(PacketHeader, Vec<u8>)>>,
    }

    impl MemorySink {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()) })
        }
    }

    impl PacketSink for MemorySink {
        fn send(&self, header: &PacketHeader, body: &[u8]) -> Result<()> {
            self.sent.lock().push((*header, body.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_class_ref_round_trip() {
        let class = Oid::new(3, 77, 5);
        let body = encode_class_ref(&class);
        assert_eq!(decode_class_ref(&body).unwrap(), class);
    }

    #[test]
    fn test_send_list_stream_shape() {
        use crate::runtime::value::Domain;
        let sink = MemorySink::new();
        let conn = Connection::new(0, sink.clone(), Arc::new(NetBufferPool::new()));
        let list = Arc::new(ListFile::new(1, vec![Domain::int()], ListFlags::default()));
        for i in 0..3 {
            list.append_values(&[Value::Int(i)]).unwrap();
        }
        send_list(&conn, 9, &list).unwrap();

        let sent = sink.sent.lock();
        // type list + one chunk + terminator
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(h, _)| h.request_id == 9));
        assert!(sent.iter().all(|(h, _)| h.ptype == PacketType::Data));
        assert!(sent[2].1.is_empty());

        let (types, _): (TypeList, usize) =
            bincode::decode_from_slice(&sent[0].1, bincode::config::standard()).unwrap();
        assert_eq!(types.len(), 1);
        let (rows, _): (Vec<Vec<Value>>, usize) =
            bincode::decode_from_slice(&sent[1].1, bincode::config::standard()).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_fetch_remote_list_against_scripted_peer() {
        use crate::runtime::value::Domain;
        let sink = MemorySink::new();
        let conn = Connection::new(4, sink.clone(), Arc::new(NetBufferPool::new()));

        // A scripted peer feeds the replies while the fetch blocks. The
        // fetcher takes the first free request id on a fresh connection.
        let rid_probe: RequestId = 1;
        let types: TypeList = vec![Domain::int()];
        let rows = vec![vec![Value::Int(7)], vec![Value::Int(8)]];
        let t = bincode::encode_to_vec(&types, bincode::config::standard()).unwrap();
        let r = bincode::encode_to_vec(&rows, bincode::config::standard()).unwrap();
        let feeder_conn = Arc::clone(&conn);
        let feeder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            for body in [t, r, Vec::new()] {
                let header = PacketHeader::new(PacketType::Data, rid_probe)
                    .with_function(FC_NONE)
                    .with_body_size(body.len());
                feeder_conn.handle_packet(header, Some(body), None).unwrap();
            }
        });

        let list = fetch_remote_list(&conn, Oid::new(0, 1, 0), Duration::from_secs(5)).unwrap();
        feeder.join().unwrap();
        assert_eq!(list.tuple_count(), 2);
        match list.read_index(1).unwrap()[0] {
            Value::Int(v) => assert_eq!(v, 8),
            _ => panic!(),
        }

        // The command itself went out with the probed request id
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.function_code, FC_REMOTE_SCAN);
        assert_eq!(sent[0].0.request_id, rid_probe);
    }
}
