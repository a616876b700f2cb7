// # Handshakes
//
// Blocking packet IO helpers plus the two connection-opening protocols:
// the server-to-server handshake (MAGIC, then a DATA_REQUEST carrying the
// database name; the peer may answer "reconnect to a new port", in which
// case the caller redials without magic) and the startup handshake against
// the cluster master.

use crate::error::{DbError, Result};
use crate::net::header::{
    PacketHeader, PacketType, FC_DATA_REQUEST, FC_RECONNECT_NEW_PORT, FC_SERVER_ALREADY_EXISTS,
    FC_SERVER_REQUEST, FC_SERVER_REQUEST_ACCEPTED, FC_SERVER_REQUEST_ACCEPTED_NEW,
    FC_SERVER_REQUEST_NEW, HEADER_SIZE, MAGIC,
};
use std::io::{Read, Write};
use tracing::info;

/// Write one packet: header then body.
pub fn write_packet<S: Write>(stream: &mut S, header: &PacketHeader, body: &[u8]) -> Result<()> {
    stream.write_all(&header.encode())?;
    if !body.is_empty() {
        stream.write_all(body)?;
    }
    stream.flush()?;
    Ok(())
}

/// Read one packet: header, then `buffer_size` body bytes when the type
/// carries a body.
pub fn read_packet<S: Read>(stream: &mut S) -> Result<(PacketHeader, Option<Vec<u8>>)> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DbError::ConnectionClosed
        } else {
            e.into()
        }
    })?;
    let header = PacketHeader::decode(&header_bytes)?;
    if !header.ptype.has_body(header.buffer_size) {
        return Ok((header, None));
    }
    let mut body = vec![0u8; header.buffer_size as usize];
    stream.read_exact(&mut body)?;
    Ok((header, Some(body)))
}

/// Outcome of one server-to-server handshake attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S2sHandshake {
    Accepted,
    /// Close this connection and redial the given port, without magic
    ReconnectNewPort(u16),
}

/// Run the client side of the server-to-server handshake on a fresh stream.
pub fn s2s_client_handshake<S: Read + Write>(
    stream: &mut S,
    db_name: &str,
    with_magic: bool,
) -> Result<S2sHandshake> {
    if with_magic {
        let magic_header =
            PacketHeader::new(PacketType::Magic, 0).with_body_size(MAGIC.len());
        write_packet(stream, &magic_header, &MAGIC)?;
    }
    let request = PacketHeader::new(PacketType::Data, 0)
        .with_function(FC_DATA_REQUEST)
        .with_body_size(db_name.len());
    write_packet(stream, &request, db_name.as_bytes())?;

    let (reply, body) = read_packet(stream)?;
    match reply.function_code {
        FC_SERVER_REQUEST_ACCEPTED => Ok(S2sHandshake::Accepted),
        FC_RECONNECT_NEW_PORT => {
            let body = body.unwrap_or_default();
            if body.len() < 2 {
                return Err(DbError::Network("reconnect reply without port".to_string()));
            }
            let port = u16::from_be_bytes([body[0], body[1]]);
            Ok(S2sHandshake::ReconnectNewPort(port))
        }
        other => Err(DbError::Network(format!(
            "unexpected handshake reply code {}",
            other
        ))),
    }
}

/// Which master protocol the server speaks at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterProtocol {
    /// Master replies with an agreed local datagram path
    Legacy,
    /// Master replies with a port to listen on and keeps the control
    /// connection
    New,
}

/// Master's startup answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterReply {
    DatagramPath(String),
    ListenPort(u16),
}

/// Register this server with the cluster master. A SERVER_ALREADY_EXISTS
/// reply is fatal to startup.
pub fn master_handshake<S: Read + Write>(
    stream: &mut S,
    server_name: &str,
    protocol: MasterProtocol,
) -> Result<MasterReply> {
    let magic_header = PacketHeader::new(PacketType::Magic, 0).with_body_size(MAGIC.len());
    write_packet(stream, &magic_header, &MAGIC)?;

    let function = match protocol {
        MasterProtocol::Legacy => FC_SERVER_REQUEST,
        MasterProtocol::New => FC_SERVER_REQUEST_NEW,
    };
    let request = PacketHeader::new(PacketType::Command, 0)
        .with_function(function)
        .with_body_size(server_name.len());
    write_packet(stream, &request, server_name.as_bytes())?;

    let (reply, body) = read_packet(stream)?;
    match reply.function_code {
        FC_SERVER_REQUEST_ACCEPTED => {
            let path = String::from_utf8(body.unwrap_or_default())
                .map_err(|_| DbError::Network("bad datagram path in master reply".to_string()))?;
            info!(path, "registered with master over legacy datagram protocol");
            Ok(MasterReply::DatagramPath(path))
        }
        FC_SERVER_REQUEST_ACCEPTED_NEW => {
            let body = body.unwrap_or_default();
            if body.len() < 2 {
                return Err(DbError::Network("master reply without port".to_string()));
            }
            let port = u16::from_be_bytes([body[0], body[1]]);
            info!(port, "registered with master; listening port assigned");
            Ok(MasterReply::ListenPort(port))
        }
        FC_SERVER_ALREADY_EXISTS => Err(DbError::AlreadyExists(format!(
            "server '{}' is already registered with the master",
            server_name
        ))),
        other => Err(DbError::Network(format!(
            "unexpected master reply code {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A scripted peer: replies are read from `input`, writes land in
    /// `output`.
    struct FakeStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl FakeStream {
        fn replying(header: PacketHeader, body: &[u8]) -> Self {
            let mut input = header.encode().to_vec();
            input.extend_from_slice(body);
            Self { input: Cursor::new(input), output: Vec::new() }
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_s2s_accepted() {
        let reply = PacketHeader::new(PacketType::Data, 0)
            .with_function(FC_SERVER_REQUEST_ACCEPTED);
        let mut stream = FakeStream::replying(reply, &[]);
        let outcome = s2s_client_handshake(&mut stream, "demo", true).unwrap();
        assert_eq!(outcome, S2sHandshake::Accepted);

        // First bytes written must be the magic packet's header + payload
        let (header, body) = read_packet(&mut Cursor::new(stream.output.clone())).unwrap();
        assert_eq!(header.ptype, PacketType::Magic);
        assert_eq!(body.unwrap(), MAGIC.to_vec());
    }

    #[test]
    fn test_s2s_without_magic_skips_magic_packet() {
        let reply = PacketHeader::new(PacketType::Data, 0)
            .with_function(FC_SERVER_REQUEST_ACCEPTED);
        let mut stream = FakeStream::replying(reply, &[]);
        s2s_client_handshake(&mut stream, "demo", false).unwrap();
        let (header, body) = read_packet(&mut Cursor::new(stream.output.clone())).unwrap();
        assert_eq!(header.ptype, PacketType::Data);
        assert_eq!(header.function_code, FC_DATA_REQUEST);
        assert_eq!(body.unwrap(), b"demo".to_vec());
    }

    #[test]
    fn test_s2s_reconnect_new_port() {
        let reply = PacketHeader::new(PacketType::Data, 0)
            .with_function(FC_RECONNECT_NEW_PORT)
            .with_body_size(2);
        let mut stream = FakeStream::replying(reply, &9099u16.to_be_bytes());
        let outcome = s2s_client_handshake(&mut stream, "demo", true).unwrap();
        assert_eq!(outcome, S2sHandshake::ReconnectNewPort(9099));
    }

    #[test]
    fn test_master_new_protocol_port() {
        let reply = PacketHeader::new(PacketType::Data, 0)
            .with_function(FC_SERVER_REQUEST_ACCEPTED_NEW)
            .with_body_size(2);
        let mut stream = FakeStream::replying(reply, &4321u16.to_be_bytes());
        let got = master_handshake(&mut stream, "demo", MasterProtocol::New).unwrap();
        assert_eq!(got, MasterReply::ListenPort(4321));
    }

    #[test]
    fn test_master_already_exists_is_fatal() {
        let reply = PacketHeader::new(PacketType::Data, 0)
            .with_function(FC_SERVER_ALREADY_EXISTS);
        let mut stream = FakeStream::replying(reply, &[]);
        assert!(matches!(
            master_handshake(&mut stream, "demo", MasterProtocol::New),
            Err(DbError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_read_packet_eof_is_connection_closed() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(matches!(read_packet(&mut empty), Err(DbError::ConnectionClosed)));
    }
}
