// TCP transport. Request/response framing is hand-parsed over the socket,
// optionally wrapped in TLS; routes split into the `/node` peer router and
// the read-only `/api` router. Errors render as problem+json.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use rustls::{
    Certificate, ClientConfig, ClientConnection, PrivateKey, RootCertStore, ServerConfig,
    ServerConnection, ServerName, StreamOwned,
};
use tracing::{debug, warn};

use crate::ballot::Ballot;
use crate::block::{Block, BlockAccount};
use crate::common::Hash;
use crate::endpoint::{Endpoint, Scheme};
use crate::error::Error;
use crate::network::{Message, Network, NetworkClient, Problem};
use crate::node::LocalNode;
use crate::storage::Storage;
use crate::transaction::Transaction;

const INBOX_CAPACITY: usize = 1024;
const MAX_BODY_BYTES: usize = 8_000_000;
const READY_PROBE_TIMEOUT: Duration = Duration::from_millis(50);

pub struct TlsIdentity {
    pub cert_chain: Vec<Certificate>,
    pub key: PrivateKey,
}

pub struct HttpConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tls_identity: Option<TlsIdentity>,
    /// Certificates of every peer, the trust roots for outbound https.
    pub peer_certs: Vec<Certificate>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            tls_identity: None,
            peer_certs: Vec::new(),
        }
    }
}

struct TlsSetup {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

enum ServerStream {
    Plain(TcpStream),
    Tls(StreamOwned<ServerConnection, TcpStream>),
}

impl Read for ServerStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ServerStream::Plain(s) => s.read(buf),
            ServerStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ServerStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ServerStream::Plain(s) => s.write(buf),
            ServerStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ServerStream::Plain(s) => s.flush(),
            ServerStream::Tls(s) => s.flush(),
        }
    }
}

impl ServerStream {
    fn set_timeouts(&self, read: Duration, write: Duration) {
        let tcp: &TcpStream = match self {
            ServerStream::Plain(s) => s,
            ServerStream::Tls(s) => s.get_ref(),
        };
        let _ = tcp.set_read_timeout(Some(read));
        let _ = tcp.set_write_timeout(Some(write));
    }
}

pub struct HttpNetwork {
    endpoint: Endpoint,
    read_timeout: Duration,
    write_timeout: Duration,
    tls: Option<Arc<TlsSetup>>,
    local_node: Mutex<Option<Arc<LocalNode>>>,
    storage: Mutex<Option<Arc<Storage>>>,
    sender: Arc<Mutex<Option<mpsc::SyncSender<Message>>>>,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    ready: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl HttpNetwork {
    pub fn new(endpoint: Endpoint, config: HttpConfig) -> Result<Arc<HttpNetwork>, Error> {
        let tls = match endpoint.scheme {
            Scheme::Https => {
                let identity = config
                    .tls_identity
                    .ok_or_else(|| Error::NetworkProblem("https endpoint without TLS identity".into()))?;
                Some(Arc::new(build_tls_setup(identity, &config.peer_certs)?))
            }
            Scheme::Http => None,
            Scheme::Memory => {
                return Err(Error::InvalidEndpoint(endpoint.to_string()));
            }
        };

        let (sender, receiver) = mpsc::sync_channel(INBOX_CAPACITY);
        Ok(Arc::new(HttpNetwork {
            endpoint,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            tls,
            local_node: Mutex::new(None),
            storage: Mutex::new(None),
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver: Mutex::new(Some(receiver)),
            ready: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn client_for(&self, endpoint: &Endpoint, read: Duration, write: Duration) -> HttpClient {
        HttpClient {
            endpoint: endpoint.clone(),
            read_timeout: read,
            write_timeout: write,
            tls: self.tls.as_ref().map(|t| Arc::clone(&t.client)),
        }
    }
}

impl Network for HttpNetwork {
    fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn set_local_node(&self, node: Arc<LocalNode>) {
        *self.local_node.lock().unwrap() = Some(node);
    }

    fn set_storage(&self, storage: Arc<Storage>) {
        *self.storage.lock().unwrap() = Some(storage);
    }

    fn start(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.endpoint.addr())
            .map_err(|e| Error::NetworkProblem(format!("bind {}: {}", self.endpoint.addr(), e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::NetworkProblem(format!("listener: {}", e)))?;

        let shutdown = Arc::clone(&self.shutdown);
        let ready = Arc::clone(&self.ready);
        let sender = Arc::clone(&self.sender);
        let tls = self.tls.clone();
        let local_node = self.local_node.lock().unwrap().clone();
        let storage = self.storage.lock().unwrap().clone();
        let read_timeout = self.read_timeout;
        let write_timeout = self.write_timeout;

        thread::spawn(move || loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let state = ConnState {
                        ready: Arc::clone(&ready),
                        sender: Arc::clone(&sender),
                        local_node: local_node.clone(),
                        storage: storage.clone(),
                    };
                    let tls = tls.clone();
                    thread::spawn(move || {
                        let stream = match make_server_stream(stream, tls.as_deref()) {
                            Ok(s) => s,
                            Err(_) => return,
                        };
                        handle_connection(stream, state, read_timeout, write_timeout);
                    });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(_) => break,
            }
        });

        Ok(())
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // Dropping the inbox sender closes the receive channel, which is the
        // shutdown signal for the runner's drain loop.
        self.sender.lock().unwrap().take();
    }

    fn ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    fn is_ready(&self) -> bool {
        let client = self.client_for(&self.endpoint, READY_PROBE_TIMEOUT, READY_PROBE_TIMEOUT);
        client.get_node_info().is_ok()
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<Message>> {
        self.receiver.lock().unwrap().take()
    }

    fn get_client(&self, endpoint: &Endpoint) -> Option<Arc<dyn NetworkClient>> {
        match endpoint.scheme {
            Scheme::Http | Scheme::Https => Some(Arc::new(self.client_for(
                endpoint,
                self.read_timeout,
                self.write_timeout,
            ))),
            Scheme::Memory => None,
        }
    }
}

struct ConnState {
    ready: Arc<AtomicBool>,
    sender: Arc<Mutex<Option<mpsc::SyncSender<Message>>>>,
    local_node: Option<Arc<LocalNode>>,
    storage: Option<Arc<Storage>>,
}

impl ConnState {
    fn push(&self, message: Message) -> Result<(), Error> {
        let sender = {
            let guard = self.sender.lock().unwrap();
            guard
                .clone()
                .ok_or_else(|| Error::NetworkProblem("inbox closed".into()))?
        };
        sender
            .send(message)
            .map_err(|_| Error::NetworkProblem("inbox closed".into()))
    }
}

fn handle_connection(
    stream: ServerStream,
    state: ConnState,
    read_timeout: Duration,
    write_timeout: Duration,
) {
    stream.set_timeouts(read_timeout, write_timeout);
    let mut reader = BufReader::new(stream);
    let request = match read_request(&mut reader) {
        Ok(r) => r,
        Err(_) => return,
    };
    let mut stream = reader.into_inner();
    debug!(method = %request.method, path = %request.path, "http request");

    if !state.ready.load(Ordering::Relaxed) {
        let problem = Problem::from_status(503, "Service Unavailable");
        write_problem(&mut stream, 503, &problem);
        return;
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => write_json(&mut stream, 200, b"{}"),
        ("GET", "/node") => match &state.local_node {
            Some(node) => {
                let info = node.serialize();
                write_json(&mut stream, 200, &info);
            }
            None => write_error(&mut stream, &Error::NetworkProblem("no local node".into())),
        },
        ("POST", "/node/connect") => {
            if serde_json::from_slice::<serde_json::Value>(&request.body).is_err() {
                let err = Error::MessageNotWellFormed("connect body is not JSON".into());
                return write_error(&mut stream, &err);
            }
            match &state.local_node {
                Some(node) => {
                    let validator = node.as_validator();
                    let body = serde_json::to_vec(&validator).expect("validator encoding");
                    write_json(&mut stream, 200, &body);
                }
                None => write_error(&mut stream, &Error::NetworkProblem("no local node".into())),
            }
        }
        ("POST", "/node/message") => {
            let tx: Transaction = match serde_json::from_slice(&request.body) {
                Ok(tx) => tx,
                Err(e) => {
                    let err = Error::MessageNotWellFormed(format!("transaction: {}", e));
                    return write_error(&mut stream, &err);
                }
            };
            match state.push(Message::Transaction(tx)) {
                Ok(()) => write_json(&mut stream, 200, b"{}"),
                Err(err) => write_error(&mut stream, &err),
            }
        }
        ("POST", "/node/ballot") => {
            let ballot: Ballot = match serde_json::from_slice(&request.body) {
                Ok(b) => b,
                Err(e) => {
                    let err = Error::MessageNotWellFormed(format!("ballot: {}", e));
                    return write_error(&mut stream, &err);
                }
            };
            match state.push(Message::Ballot(ballot)) {
                Ok(()) => write_json(&mut stream, 200, b"{}"),
                Err(err) => write_error(&mut stream, &err),
            }
        }
        ("GET", path) if path.starts_with("/api/account/") => {
            let address = path.trim_start_matches("/api/account/");
            let Some(storage) = &state.storage else {
                return write_error(&mut stream, &Error::StorageRecordDoesNotExist);
            };
            match BlockAccount::get(storage, address) {
                Ok(account) => {
                    let body = serde_json::to_vec(&account).expect("account encoding");
                    write_json(&mut stream, 200, &body);
                }
                Err(err) => write_error(&mut stream, &err),
            }
        }
        ("GET", path) if path.starts_with("/api/block/") => {
            let selector = path.trim_start_matches("/api/block/");
            let Some(storage) = &state.storage else {
                return write_error(&mut stream, &Error::BlockNotFound);
            };
            let found = if let Ok(height) = selector.parse::<u64>() {
                Block::get_by_height(storage, height)
            } else {
                match parse_hash(selector) {
                    Some(hash) => Block::get(storage, &hash),
                    None => Err(Error::BlockNotFound),
                }
            };
            match found {
                Ok(block) => {
                    let body = serde_json::to_vec(&block).expect("block encoding");
                    write_json(&mut stream, 200, &body);
                }
                Err(err) => write_error(&mut stream, &err),
            }
        }
        _ => {
            let problem = Problem::from_status(404, "Not Found");
            write_problem(&mut stream, 404, &problem);
        }
    }
}

fn parse_hash(raw: &str) -> Option<Hash> {
    let bytes = hex::decode(raw).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Some(hash)
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

const MAX_HEADER_LINE_BYTES: usize = 8192;

/// Line-oriented request framing: the request line, headers until the blank
/// separator, then exactly Content-Length bytes of body (zero when absent).
fn read_request<S: Read>(reader: &mut BufReader<S>) -> Result<Request, Error> {
    let request_line = next_line(reader)?;
    let mut words = request_line.split(' ').filter(|w| !w.is_empty());
    let method = words
        .next()
        .ok_or_else(|| Error::NetworkProblem("empty request line".into()))?
        .to_string();
    let path = words
        .next()
        .ok_or_else(|| Error::NetworkProblem("request line without a path".into()))?
        .to_string();

    let mut content_length = 0usize;
    loop {
        let header = next_line(reader)?;
        if header.is_empty() {
            break;
        }
        let Some((name, value)) = header.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse()
                .map_err(|_| Error::NetworkProblem("unparsable content-length".into()))?;
        }
    }
    if content_length > MAX_BODY_BYTES {
        return Err(Error::NetworkProblem("request body too large".into()));
    }

    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::NetworkProblem(format!("body read: {}", e)))?;

    Ok(Request { method, path, body })
}

/// One CRLF-terminated line, terminator stripped. EOF mid-request is an
/// error: a request arrives whole or not at all.
fn next_line<S: Read>(reader: &mut BufReader<S>) -> Result<String, Error> {
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| Error::NetworkProblem(format!("header read: {}", e)))?;
    if n == 0 {
        return Err(Error::NetworkProblem("connection closed mid-request".into()));
    }
    if n > MAX_HEADER_LINE_BYTES {
        return Err(Error::NetworkProblem("header line too long".into()));
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(line)
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        409 => "HTTP/1.1 409 Conflict",
        502 => "HTTP/1.1 502 Bad Gateway",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_response<S: Write>(stream: &mut S, status: u16, content_type: &str, body: &[u8]) {
    let head = format!(
        "{}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status_line(status),
        content_type,
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

fn write_json<S: Write>(stream: &mut S, status: u16, body: &[u8]) {
    write_response(stream, status, "application/json", body);
}

fn write_problem<S: Write>(stream: &mut S, status: u16, problem: &Problem) {
    let body = serde_json::to_vec(problem).expect("problem encoding");
    write_response(stream, status, "application/problem+json", &body);
}

fn write_error<S: Write>(stream: &mut S, err: &Error) {
    write_problem(stream, err.http_status(), &Problem::from_error(err));
}

pub struct HttpClient {
    endpoint: Endpoint,
    read_timeout: Duration,
    write_timeout: Duration,
    tls: Option<Arc<ClientConfig>>,
}

enum ClientStream {
    Plain(TcpStream),
    Tls(StreamOwned<ClientConnection, TcpStream>),
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Plain(s) => s.read(buf),
            ClientStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Plain(s) => s.write(buf),
            ClientStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ClientStream::Plain(s) => s.flush(),
            ClientStream::Tls(s) => s.flush(),
        }
    }
}

impl HttpClient {
    fn open(&self) -> Result<ClientStream, Error> {
        let tcp = TcpStream::connect(self.endpoint.addr())
            .map_err(|e| Error::NetworkProblem(format!("connect {}: {}", self.endpoint.addr(), e)))?;
        let _ = tcp.set_read_timeout(Some(self.read_timeout));
        let _ = tcp.set_write_timeout(Some(self.write_timeout));

        match (&self.endpoint.scheme, &self.tls) {
            (Scheme::Https, Some(config)) => {
                let name = ServerName::try_from(self.endpoint.host.as_str())
                    .map_err(|_| Error::NetworkProblem("invalid server name".into()))?;
                let conn = ClientConnection::new(Arc::clone(config), name)
                    .map_err(|e| Error::NetworkProblem(format!("tls: {}", e)))?;
                Ok(ClientStream::Tls(StreamOwned::new(conn, tcp)))
            }
            (Scheme::Https, None) => Err(Error::NetworkProblem("no TLS client config".into())),
            _ => Ok(ClientStream::Plain(tcp)),
        }
    }

    fn request(&self, method: &str, path: &str, body: &[u8]) -> Result<Vec<u8>, Error> {
        let mut stream = self.open()?;
        let head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            method,
            path,
            self.endpoint.addr(),
            body.len()
        );
        stream
            .write_all(head.as_bytes())
            .and_then(|_| stream.write_all(body))
            .and_then(|_| stream.flush())
            .map_err(|e| Error::NetworkProblem(format!("write: {}", e)))?;

        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    raw.extend_from_slice(&buf[..n]);
                    if raw.len() > MAX_BODY_BYTES {
                        return Err(Error::NetworkProblem("response too large".into()));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(Error::NetworkProblem("timeout".into()));
                }
                Err(e) => {
                    if raw.is_empty() {
                        return Err(Error::NetworkProblem(format!("read: {}", e)));
                    }
                    break;
                }
            }
        }

        let header_end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| Error::NetworkProblem("bad response".into()))?
            + 4;
        let header_str = String::from_utf8_lossy(&raw[..header_end]);
        let status = header_str
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| Error::NetworkProblem("bad status line".into()))?;
        let body = raw[header_end..].to_vec();

        if (200..300).contains(&status) {
            return Ok(body);
        }
        match serde_json::from_slice::<Problem>(&body) {
            Ok(problem) => {
                warn!(status, title = %problem.title, "peer returned problem");
                Err(Error::NetworkProblem(problem.title))
            }
            Err(_) => Err(Error::NetworkProblem(format!("status {}", status))),
        }
    }
}

impl NetworkClient for HttpClient {
    fn connect(&self, node: &LocalNode) -> Result<Vec<u8>, Error> {
        self.request("POST", "/node/connect", &node.serialize())
    }

    fn get_node_info(&self) -> Result<Vec<u8>, Error> {
        self.request("GET", "/node", b"")
    }

    fn send_message(&self, transaction: &Transaction) -> Result<(), Error> {
        let body = serde_json::to_vec(transaction)
            .map_err(|e| Error::NetworkProblem(format!("encode: {}", e)))?;
        self.request("POST", "/node/message", &body).map(|_| ())
    }

    fn send_ballot(&self, ballot: &Ballot) -> Result<(), Error> {
        let body = serde_json::to_vec(ballot)
            .map_err(|e| Error::NetworkProblem(format!("encode: {}", e)))?;
        self.request("POST", "/node/ballot", &body).map(|_| ())
    }
}

fn make_server_stream(stream: TcpStream, tls: Option<&TlsSetup>) -> Result<ServerStream, Error> {
    match tls {
        Some(setup) => {
            let conn = ServerConnection::new(Arc::clone(&setup.server))
                .map_err(|e| Error::NetworkProblem(format!("tls: {}", e)))?;
            Ok(ServerStream::Tls(StreamOwned::new(conn, stream)))
        }
        None => Ok(ServerStream::Plain(stream)),
    }
}

fn build_tls_setup(identity: TlsIdentity, peer_certs: &[Certificate]) -> Result<TlsSetup, Error> {
    let mut roots = RootCertStore::empty();
    for cert in peer_certs {
        roots
            .add(cert)
            .map_err(|_| Error::NetworkProblem("invalid peer certificate".into()))?;
    }

    let client = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(identity.cert_chain, identity.key)
        .map_err(|_| Error::NetworkProblem("invalid TLS key or certificate".into()))?;

    Ok(TlsSetup {
        server: Arc::new(server),
        client: Arc::new(client),
    })
}

pub fn load_tls_identity(cert_path: &str, key_path: &str) -> Result<TlsIdentity, Error> {
    let cert_file = File::open(cert_path)
        .map_err(|e| Error::NetworkProblem(format!("open {}: {}", cert_path, e)))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| Error::NetworkProblem(format!("certs: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::NetworkProblem("no certs in TLS cert file".into()));
    }

    let key_file = File::open(key_path)
        .map_err(|e| Error::NetworkProblem(format!("open {}: {}", key_path, e)))?;
    let mut key_reader = BufReader::new(key_file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(|e| Error::NetworkProblem(format!("keys: {}", e)))?;
    if keys.is_empty() {
        return Err(Error::NetworkProblem("no pkcs8 private key found".into()));
    }

    Ok(TlsIdentity {
        cert_chain: certs.into_iter().map(Certificate).collect(),
        key: PrivateKey(keys[0].clone()),
    })
}
