//! TFTP server implementation.
//!
//! Serves read requests only. Each transfer runs on its own thread with a
//! fresh ephemeral socket; the listener socket never carries transfer
//! traffic.

use std::io::Read;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ServerError, TftpError};
use crate::tftp::packet::{
    self, ClientReply, ERROR_ACCESS_VIOLATION, ERROR_FILE_NOT_FOUND, ERROR_ILLEGAL_OPERATION,
    ERROR_NOT_DEFINED, OPCODE_RRQ, OPCODE_WRQ,
};

/// Block size used when the client does not negotiate one (RFC 1350).
const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Largest block size we volunteer. Fits an Ethernet MTU without IP
/// fragmentation; clients on exotic media can still ask for less.
const DEFAULT_MAX_BLOCK_SIZE: u16 = 1468;

/// Hard protocol limit for negotiated block sizes (RFC 2348).
const PROTOCOL_MAX_BLOCK_SIZE: u16 = 65464;

/// Retransmissions of one packet before the transfer is abandoned.
const MAX_RETRIES: u32 = 5;

/// Decides what bytes a TFTP path maps to.
pub trait Handler: Send + Sync + 'static {
    /// Open the file for `path`, returning its byte stream and total size
    /// when known. The size answers the `tsize` option; `None` omits it.
    fn open(
        &self,
        path: &str,
        client: SocketAddr,
    ) -> Result<(Box<dyn Read + Send>, Option<u64>), TftpError>;

    /// Called once a transfer has been fully acknowledged.
    fn transfer_done(&self, _path: &str, _client: SocketAddr, _bytes: u64) {}

    /// Called when a transfer is abandoned.
    fn transfer_failed(&self, _path: &str, _client: SocketAddr, _err: &TftpError) {}
}

/// TFTP server for serving boot files.
pub struct TftpServer {
    handler: Arc<dyn Handler>,
    /// Upper clamp for negotiated block sizes; defaults to 1468.
    max_block_size: Option<u16>,
    /// Per-block wait for the client's ACK.
    write_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl TftpServer {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            max_block_size: None,
            write_timeout: Duration::from_secs(3),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Clamp negotiated block sizes to at most `size`.
    pub fn with_max_block_size(mut self, size: u16) -> Self {
        self.max_block_size = Some(size);
        self
    }

    /// Per-block ACK timeout (default 3s).
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Get a handle to stop the server.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Serve read requests on `socket` until the running flag is cleared.
    pub fn run(&self, socket: UdpSocket) -> Result<(), ServerError> {
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .map_err(|source| ServerError::Listener {
                what: "TFTP",
                source,
            })?;

        let local = socket.local_addr().map_err(|source| ServerError::Listener {
            what: "TFTP",
            source,
        })?;
        debug!("TFTP server listening on {}", local);

        self.running.store(true, Ordering::SeqCst);

        let mut buf = [0u8; 2048];
        while self.running.load(Ordering::SeqCst) {
            let (len, client) = match socket.recv_from(&mut buf) {
                Ok(pair) => pair,
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(source) => {
                    return Err(ServerError::Listener {
                        what: "TFTP",
                        source,
                    });
                }
            };
            if len < 2 {
                continue;
            }

            let opcode = u16::from_be_bytes([buf[0], buf[1]]);
            match opcode {
                OPCODE_RRQ => self.start_transfer(&buf[2..len], client, local),
                OPCODE_WRQ => {
                    warn!("TFTP write request from {} denied (read-only)", client);
                    send_error_to(&socket, client, ERROR_ACCESS_VIOLATION, "writes not supported");
                }
                _ => {
                    debug!("TFTP: unexpected opcode {} from {}", opcode, client);
                }
            }
        }

        debug!("TFTP server stopped");
        Ok(())
    }

    /// Parse an RRQ and hand the transfer to its own thread.
    fn start_transfer(&self, body: &[u8], client: SocketAddr, local: SocketAddr) {
        let request = match packet::parse_read_request(body) {
            Ok(r) => r,
            Err(e) => {
                debug!("TFTP: malformed request from {}: {}", client, e);
                return;
            }
        };

        let handler = self.handler.clone();
        let max_block_size = self.max_block_size;
        let write_timeout = self.write_timeout;

        let spawned = thread::Builder::new()
            .name(format!("tftp-{client}"))
            .spawn(move || {
                let path = request.filename.clone();
                let mut transfer =
                    match Transfer::begin(handler.clone(), request, client, local, max_block_size, write_timeout) {
                        Ok(t) => t,
                        Err(e) => {
                            debug!("TFTP: refusing {:?} for {}: {}", path, client, e);
                            handler.transfer_failed(&path, client, &e);
                            return;
                        }
                    };
                match transfer.run() {
                    Ok(bytes) => {
                        info!("TFTP: sent {:?} to {} ({} bytes)", path, client, bytes);
                        handler.transfer_done(&path, client, bytes);
                    }
                    Err(e) => {
                        info!("TFTP: send of {:?} to {} failed: {}", path, client, e);
                        handler.transfer_failed(&path, client, &e);
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("TFTP: could not spawn transfer thread: {}", e);
        }
    }
}

/// One in-flight transfer: isolated socket, negotiated parameters, lockstep
/// block counter.
struct Transfer {
    socket: UdpSocket,
    client: SocketAddr,
    path: String,
    reader: Box<dyn Read + Send>,
    block_size: u16,
    timeout: Duration,
    block: u16,
    oack: Vec<(String, String)>,
}

impl Transfer {
    /// Open the file, negotiate options and bind the transfer socket. Sends
    /// a TFTP ERROR to the client when the handler rejects the path.
    fn begin(
        handler: Arc<dyn Handler>,
        request: packet::ReadRequest,
        client: SocketAddr,
        local: SocketAddr,
        max_block_size: Option<u16>,
        write_timeout: Duration,
    ) -> Result<Transfer, TftpError> {
        let socket = UdpSocket::bind(SocketAddr::new(local.ip(), 0))?;
        socket.connect(client)?;

        let (reader, size) = match handler.open(&request.filename, client) {
            Ok(opened) => opened,
            Err(e) => {
                let (code, message) = error_reply(&e);
                let _ = socket.send(&packet::error_packet(code, &message));
                return Err(e);
            }
        };

        let (block_size, timeout, oack) =
            negotiate(&request.options, size, max_block_size, write_timeout);
        socket.set_read_timeout(Some(timeout))?;

        Ok(Transfer {
            socket,
            client,
            path: request.filename,
            reader,
            block_size,
            timeout,
            block: 1,
            oack,
        })
    }

    /// Run the transfer to completion, returning the bytes sent.
    fn run(&mut self) -> Result<u64, TftpError> {
        if !self.oack.is_empty() {
            let oack = packet::oack_packet(&self.oack);
            self.send_and_await_ack(&oack, 0, false)?;
        }

        let mut buf = vec![0u8; self.block_size as usize];
        let mut total = 0u64;

        loop {
            let n = read_full(&mut self.reader, &mut buf)?;
            let data = packet::data_packet(self.block, &buf[..n]);
            let last = n < self.block_size as usize;

            match self.send_and_await_ack(&data, self.block, last) {
                Ok(()) => {}
                // The final ACK gets a best-effort wait; if it never comes
                // the client almost certainly has the file.
                Err(TftpError::Timeout { .. }) if last => {
                    debug!(
                        "TFTP: {} never acknowledged the final block of {:?}",
                        self.client, self.path
                    );
                }
                Err(e) => return Err(e),
            }
            total += n as u64;

            if last {
                return Ok(total);
            }
            self.block = self.block.wrapping_add(1);
        }
    }

    /// Send a packet and wait for ACK of `block`, retransmitting the
    /// identical packet on timeout.
    fn send_and_await_ack(&self, data: &[u8], block: u16, last: bool) -> Result<(), TftpError> {
        // The final ACK only matters for tidiness; do not hold the thread
        // for the full pacing interval waiting for it.
        if last {
            let _ = self.socket.set_read_timeout(Some(self.timeout / 2));
        }

        let mut retries = 0u32;
        let mut reply = [0u8; 64];
        loop {
            self.socket.send(data)?;

            match self.socket.recv(&mut reply) {
                Ok(len) => match packet::parse_client_reply(&reply[..len]) {
                    Some(ClientReply::Ack(acked)) if acked == block => {
                        if last {
                            let _ = self.socket.set_read_timeout(Some(self.timeout));
                        }
                        return Ok(());
                    }
                    Some(ClientReply::Error(message)) => {
                        return Err(TftpError::PeerError(message));
                    }
                    // Duplicate ACK or noise; resend and keep waiting.
                    _ => {
                        retries += 1;
                        if retries > MAX_RETRIES {
                            if !last {
                                self.abort(block)?;
                            }
                            return Err(TftpError::Timeout { block });
                        }
                    }
                },
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        if !last {
                            self.abort(block)?;
                        }
                        return Err(TftpError::Timeout { block });
                    }
                    debug!("TFTP: retry {} for block {} to {}", retries, block, self.client);
                }
                Err(e) => return Err(TftpError::Io(e)),
            }
        }
    }

    fn abort(&self, block: u16) -> Result<(), TftpError> {
        let message = format!("no ACK for block {block} after {MAX_RETRIES} retries");
        self.socket
            .send(&packet::error_packet(ERROR_NOT_DEFINED, &message))?;
        Ok(())
    }
}

/// Negotiate RFC 2347 options. Returns the effective block size, the ACK
/// timeout, and the options to acknowledge in an OACK (empty = no OACK).
fn negotiate(
    options: &[(String, String)],
    size: Option<u64>,
    max_block_size: Option<u16>,
    default_timeout: Duration,
) -> (u16, Duration, Vec<(String, String)>) {
    let mut block_size = DEFAULT_BLOCK_SIZE;
    let mut timeout = default_timeout;
    let mut oack = Vec::new();

    let clamp_high = max_block_size
        .unwrap_or(DEFAULT_MAX_BLOCK_SIZE)
        .min(PROTOCOL_MAX_BLOCK_SIZE);

    for (name, value) in options {
        match name.as_str() {
            "blksize" => {
                if let Ok(requested) = value.parse::<u32>() {
                    block_size = (requested.min(u16::MAX as u32) as u16)
                        .min(clamp_high)
                        .max(8);
                    oack.push(("blksize".to_string(), block_size.to_string()));
                }
            }
            "tsize" => {
                if let Some(size) = size {
                    oack.push(("tsize".to_string(), size.to_string()));
                }
            }
            // Honored for retry pacing only.
            "timeout" => {
                if let Ok(secs @ 1..=255) = value.parse::<u64>() {
                    timeout = Duration::from_secs(secs);
                    oack.push(("timeout".to_string(), secs.to_string()));
                }
            }
            // Lockstep only; any other window size is refused by omission.
            "windowsize" => {
                if value == "1" {
                    oack.push(("windowsize".to_string(), "1".to_string()));
                }
            }
            _ => {}
        }
    }

    (block_size, timeout, oack)
}

/// Fill `buf` from `reader`, short only at end of stream.
fn read_full(reader: &mut (impl Read + ?Sized), buf: &mut [u8]) -> Result<usize, TftpError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn error_reply(err: &TftpError) -> (u16, String) {
    match err {
        TftpError::UnknownPath(_) | TftpError::NotFound(_) => {
            (ERROR_FILE_NOT_FOUND, err.to_string())
        }
        TftpError::BadRequest(_) => (ERROR_ILLEGAL_OPERATION, err.to_string()),
        _ => (ERROR_NOT_DEFINED, err.to_string()),
    }
}

fn send_error_to(socket: &UdpSocket, addr: SocketAddr, code: u16, message: &str) {
    let _ = socket.send_to(&packet::error_packet(code, message), addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::packet::{OPCODE_ACK, OPCODE_DATA, OPCODE_ERROR, OPCODE_OACK};
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, SocketAddrV4};

    /// Serves the same bytes for every path, like a boot binary map with a
    /// single entry.
    struct ConstantHandler(Vec<u8>);

    impl Handler for ConstantHandler {
        fn open(
            &self,
            path: &str,
            _client: SocketAddr,
        ) -> Result<(Box<dyn Read + Send>, Option<u64>), TftpError> {
            if path == "missing" {
                return Err(TftpError::UnknownPath(path.to_string()));
            }
            Ok((
                Box::new(std::io::Cursor::new(self.0.clone())),
                Some(self.0.len() as u64),
            ))
        }
    }

    fn test_file() -> Vec<u8> {
        b"This is a test file.\n\nMy, what a pretty test file.\n\nI wonder if TFTP clients will be able to retrieve it!\n"
            .repeat(12)
    }

    fn start_server(file: Vec<u8>, write_timeout: Duration) -> (SocketAddr, Arc<AtomicBool>) {
        let server = TftpServer::new(Arc::new(ConstantHandler(file)))
            .with_write_timeout(write_timeout);
        let flag = server.running_flag();
        let socket =
            UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).unwrap();
        let addr = socket.local_addr().unwrap();
        thread::spawn(move || server.run(socket).unwrap());
        // Wait for the listener loop to come up.
        for _ in 0..100 {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        (addr, flag)
    }

    fn rrq(path: &str, options: &[(&str, &str)]) -> Vec<u8> {
        let mut out = OPCODE_RRQ.to_be_bytes().to_vec();
        out.extend_from_slice(path.as_bytes());
        out.push(0);
        out.extend_from_slice(b"octet\0");
        for (name, value) in options {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
        out
    }

    fn ack(block: u16) -> Vec<u8> {
        let mut out = OPCODE_ACK.to_be_bytes().to_vec();
        out.extend_from_slice(&block.to_be_bytes());
        out
    }

    /// Minimal lockstep TFTP client. Returns the fetched bytes, the OACK
    /// options (if any), and the number of DATA packets seen.
    fn fetch(
        server: SocketAddr,
        path: &str,
        options: &[(&str, &str)],
    ) -> (Vec<u8>, HashMap<String, String>, usize) {
        let sock =
            UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.send_to(&rrq(path, options), server).unwrap();

        let block_size = options
            .iter()
            .find(|(n, _)| *n == "blksize")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(512);

        let mut file = Vec::new();
        let mut oack_opts = HashMap::new();
        let mut blocks = 0usize;
        let mut expected: u16 = 1;
        let mut buf = [0u8; 65536];

        loop {
            let (len, from) = sock.recv_from(&mut buf).unwrap();
            let opcode = u16::from_be_bytes([buf[0], buf[1]]);
            match opcode {
                OPCODE_OACK => {
                    for pair in buf[2..len].split(|&b| b == 0).collect::<Vec<_>>().chunks(2) {
                        if let [name, value] = pair {
                            if !name.is_empty() {
                                oack_opts.insert(
                                    String::from_utf8_lossy(name).into_owned(),
                                    String::from_utf8_lossy(value).into_owned(),
                                );
                            }
                        }
                    }
                    sock.send_to(&ack(0), from).unwrap();
                }
                OPCODE_DATA => {
                    let block = u16::from_be_bytes([buf[2], buf[3]]);
                    if block == expected {
                        file.extend_from_slice(&buf[4..len]);
                        blocks += 1;
                        expected = expected.wrapping_add(1);
                    }
                    sock.send_to(&ack(block), from).unwrap();
                    if len - 4 < block_size {
                        return (file, oack_opts, blocks);
                    }
                }
                OPCODE_ERROR => {
                    panic!(
                        "server error: {}",
                        String::from_utf8_lossy(&buf[4..len])
                    );
                }
                other => panic!("unexpected opcode {other}"),
            }
        }
    }

    #[test]
    fn test_plain_transfer_without_options() {
        let file = test_file();
        let (server, flag) = start_server(file.clone(), Duration::from_secs(1));

        let (fetched, oack, _) = fetch(server, "foo", &[]);
        assert_eq!(fetched, file);
        assert!(oack.is_empty());

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_blksize_negotiation_and_block_count() {
        let file = test_file();
        let (server, flag) = start_server(file.clone(), Duration::from_secs(1));

        let (fetched, oack, blocks) =
            fetch(server, "aa:bb:cc:dd:ee:ff/7", &[("blksize", "500"), ("tsize", "0")]);
        assert_eq!(fetched, file);
        assert_eq!(oack.get("blksize").map(String::as_str), Some("500"));
        assert_eq!(oack.get("tsize"), Some(&file.len().to_string()));
        assert_eq!(blocks, file.len() / 500 + 1);

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_windowsize_one_acknowledged() {
        let file = test_file();
        let (server, flag) = start_server(file.clone(), Duration::from_secs(1));

        let (_, oack, _) = fetch(server, "foo", &[("blksize", "500"), ("windowsize", "1")]);
        assert_eq!(oack.get("windowsize").map(String::as_str), Some("1"));

        let (_, oack, _) = fetch(server, "foo", &[("blksize", "500"), ("windowsize", "8")]);
        assert!(!oack.contains_key("windowsize"));

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_unknown_path_gets_error_packet() {
        let (server, flag) = start_server(test_file(), Duration::from_secs(1));

        let sock =
            UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.send_to(&rrq("missing", &[]), server).unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = sock.recv_from(&mut buf).unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_ERROR);
        let message = String::from_utf8_lossy(&buf[4..len]);
        assert!(message.contains("unknown path"), "got {message:?}");

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_dropped_ack_triggers_identical_retransmit() {
        let (server, flag) = start_server(test_file(), Duration::from_millis(150));

        let sock =
            UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.send_to(&rrq("foo", &[("blksize", "500")]), server).unwrap();

        let mut buf = [0u8; 2048];

        // OACK, acknowledged normally.
        let (_, from) = sock.recv_from(&mut buf).unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_OACK);
        sock.send_to(&ack(0), from).unwrap();

        // First DATA arrives; withhold the ACK.
        let (len1, _) = sock.recv_from(&mut buf).unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), OPCODE_DATA);
        let first = buf[..len1].to_vec();

        // The retransmit must be byte-identical.
        let (len2, from) = sock.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len2], &first[..]);

        // Resume the transfer to completion.
        sock.send_to(&ack(1), from).unwrap();
        loop {
            let (len, from) = sock.recv_from(&mut buf).unwrap();
            if u16::from_be_bytes([buf[0], buf[1]]) != OPCODE_DATA {
                continue;
            }
            let block = u16::from_be_bytes([buf[2], buf[3]]);
            sock.send_to(&ack(block), from).unwrap();
            if len - 4 < 500 {
                break;
            }
        }

        flag.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_negotiate_clamps_block_size() {
        let t = Duration::from_secs(3);
        let opts = |v: &str| vec![("blksize".to_string(), v.to_string())];

        // Default upper clamp is 1468.
        let (bs, _, oack) = negotiate(&opts("4000"), None, None, t);
        assert_eq!(bs, 1468);
        assert_eq!(oack[0].1, "1468");

        // Requested size below the clamp is taken as-is.
        let (bs, _, _) = negotiate(&opts("500"), None, None, t);
        assert_eq!(bs, 500);

        // Configured maximum wins over the default.
        let (bs, _, _) = negotiate(&opts("4000"), None, Some(500), t);
        assert_eq!(bs, 500);

        // Lower clamp is 8.
        let (bs, _, _) = negotiate(&opts("1"), None, None, t);
        assert_eq!(bs, 8);

        // A configured maximum beyond the protocol limit is capped.
        let (bs, _, _) = negotiate(&opts("65535"), None, Some(u16::MAX), t);
        assert_eq!(bs, PROTOCOL_MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_negotiate_tsize_omitted_when_unknown() {
        let t = Duration::from_secs(3);
        let opts = vec![("tsize".to_string(), "0".to_string())];

        let (_, _, oack) = negotiate(&opts, Some(1234), None, t);
        assert_eq!(oack, vec![("tsize".to_string(), "1234".to_string())]);

        let (_, _, oack) = negotiate(&opts, None, None, t);
        assert!(oack.is_empty());
    }

    #[test]
    fn test_negotiate_timeout_sets_pacing() {
        let t = Duration::from_secs(3);
        let opts = vec![("timeout".to_string(), "7".to_string())];
        let (bs, timeout, oack) = negotiate(&opts, None, None, t);
        assert_eq!(bs, DEFAULT_BLOCK_SIZE);
        assert_eq!(timeout, Duration::from_secs(7));
        assert_eq!(oack, vec![("timeout".to_string(), "7".to_string())]);

        // Out-of-range values are ignored.
        let opts = vec![("timeout".to_string(), "0".to_string())];
        let (_, timeout, oack) = negotiate(&opts, None, None, t);
        assert_eq!(timeout, t);
        assert!(oack.is_empty());
    }
}
