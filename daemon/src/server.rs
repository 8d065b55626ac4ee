use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;

use appdepot_core::manager::CreateDownload;
use appdepot_core::{CoreError, DownloadManager, TaskId};

use crate::auth::AccessGate;

const MAX_HEADER_LINES: usize = 64;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

pub struct Server {
    manager: Arc<DownloadManager>,
    gate: AccessGate,
    started_at: Instant,
}

pub fn serve(manager: Arc<DownloadManager>) -> io::Result<()> {
    let port = manager.config().port;
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    tracing::info!("listening on port {}", port);

    let gate = AccessGate::new(manager.config().access_password.as_deref());
    let server = Arc::new(Server {
        manager,
        gate,
        started_at: Instant::now(),
    });

    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                let server = Arc::clone(&server);
                thread::spawn(move || {
                    if let Err(err) = server.handle(stream) {
                        tracing::debug!("connection error from {}: {}", remote, err);
                    }
                });
            }
            Err(err) => {
                tracing::warn!("accept error: {}", err);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn auth_token(&self) -> Option<&str> {
        if let Some(value) = self.header("authorization") {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim());
            }
        }
        self.header("x-access-token")
    }

    fn account_hash(&self) -> Option<&str> {
        self.query
            .get("accountHash")
            .map(String::as_str)
            .or_else(|| self.header("x-account-hash"))
    }
}

impl Server {
    fn handle(&self, mut stream: TcpStream) -> io::Result<()> {
        stream.set_read_timeout(Some(Duration::from_secs(8)))?;
        stream.set_write_timeout(Some(Duration::from_secs(12)))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let Some(request) = read_request(&mut reader)? else {
            return Ok(());
        };

        if let Some(location) = self.https_redirect(&request) {
            return write_redirect(&mut stream, &location);
        }

        if !self.gate.allows(&request.path, request.auth_token()) {
            return write_json(&mut stream, 401, &json!({ "error": "Unauthorized" }));
        }

        self.route(stream, request)
    }

    fn route(&self, mut stream: TcpStream, request: Request) -> io::Result<()> {
        let path = request.path.clone();
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["api", "auth", "status"]) => {
                write_json(&mut stream, 200, &json!({ "enabled": self.gate.enabled() }))
            }
            ("POST", ["api", "auth", "verify"]) => self.verify_token(stream, &request),
            ("GET", ["api", "settings"]) => self.settings(stream),
            ("POST", ["api", "downloads"]) => self.create(stream, &request),
            ("GET", ["api", "downloads"]) => self.list(stream, &request),
            ("GET", ["api", "downloads", id]) => self.read(stream, &request, id),
            ("GET", ["api", "downloads", id, "progress"]) => self.progress(stream, id),
            ("POST", ["api", "downloads", id, "pause"]) => self.pause(stream, id),
            ("POST", ["api", "downloads", id, "resume"]) => self.resume(stream, id),
            ("DELETE", ["api", "downloads", id]) => self.delete(stream, id),
            _ => write_json(&mut stream, 404, &json!({ "error": "Not found" })),
        }
    }

    fn verify_token(&self, mut stream: TcpStream, request: &Request) -> io::Result<()> {
        #[derive(Deserialize)]
        struct VerifyBody {
            token: String,
        }
        let ok = serde_json::from_slice::<VerifyBody>(&request.body)
            .map(|body| self.gate.verify(&body.token))
            .unwrap_or(false);
        write_json(&mut stream, 200, &json!({ "ok": ok }))
    }

    fn settings(&self, mut stream: TcpStream) -> io::Result<()> {
        let config = self.manager.config();
        write_json(
            &mut stream,
            200,
            &json!({
                "maxDownloadMB": config.max_download_mb,
                "downloadThreads": config.download_threads,
                "autoCleanupDays": config.auto_cleanup_days,
                "autoCleanupMaxMB": config.auto_cleanup_max_mb,
                "uptimeSeconds": self.started_at.elapsed().as_secs(),
                "buildCommit": config.build_commit,
                "buildDate": config.build_date,
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )
    }

    fn create(&self, mut stream: TcpStream, request: &Request) -> io::Result<()> {
        let body: CreateDownload = match serde_json::from_slice(&request.body) {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!("bad create body: {}", err);
                return write_json(&mut stream, 400, &json!({ "error": "Invalid request body" }));
            }
        };
        match self.manager.create(body) {
            Ok(task) => write_json(&mut stream, 200, &task.to_public()),
            Err(err) => write_error(&mut stream, &err),
        }
    }

    fn list(&self, mut stream: TcpStream, request: &Request) -> io::Result<()> {
        let hashes: Vec<String> = request
            .query
            .get("accountHashes")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if hashes.is_empty() {
            return write_json(&mut stream, 200, &json!([]));
        }
        match self.manager.list(&hashes) {
            Ok(tasks) => {
                let public: Vec<_> = tasks.iter().map(|task| task.to_public()).collect();
                write_json(&mut stream, 200, &public)
            }
            Err(err) => write_error(&mut stream, &err),
        }
    }

    fn read(&self, mut stream: TcpStream, request: &Request, id: &str) -> io::Result<()> {
        let Some(id) = parse_task_id(id) else {
            return write_json(&mut stream, 404, &json!({ "error": "Not found" }));
        };
        let task = match self.manager.get(&id) {
            Ok(task) => task,
            Err(err) => return write_error(&mut stream, &err),
        };
        match request.account_hash() {
            Some(owner) if owner == task.account_hash => {
                write_json(&mut stream, 200, &task.to_public())
            }
            _ => write_json(&mut stream, 403, &json!({ "error": "Forbidden" })),
        }
    }

    fn progress(&self, mut stream: TcpStream, id: &str) -> io::Result<()> {
        let Some(id) = parse_task_id(id) else {
            return write_json(&mut stream, 404, &json!({ "error": "Not found" }));
        };
        let task = match self.manager.get(&id) {
            Ok(task) => task,
            Err(err) => return write_error(&mut stream, &err),
        };

        let (subscriber_id, events) = self.manager.subscribe(&id);
        let result = stream_events(&mut stream, &task.to_public(), &events);
        self.manager.unsubscribe(&id, subscriber_id);
        result
    }

    fn pause(&self, mut stream: TcpStream, id: &str) -> io::Result<()> {
        let Some(id) = parse_task_id(id) else {
            return write_json(&mut stream, 404, &json!({ "error": "Not found" }));
        };
        match self.manager.pause(&id) {
            Ok(()) => write_json(&mut stream, 200, &json!({ "ok": true })),
            Err(err) => write_error(&mut stream, &err),
        }
    }

    fn resume(&self, mut stream: TcpStream, id: &str) -> io::Result<()> {
        let Some(id) = parse_task_id(id) else {
            return write_json(&mut stream, 404, &json!({ "error": "Not found" }));
        };
        match self.manager.resume(&id) {
            Ok(()) => write_json(&mut stream, 200, &json!({ "ok": true })),
            Err(err) => write_error(&mut stream, &err),
        }
    }

    fn delete(&self, mut stream: TcpStream, id: &str) -> io::Result<()> {
        let Some(id) = parse_task_id(id) else {
            return write_json(&mut stream, 404, &json!({ "error": "Not found" }));
        };
        match self.manager.delete(&id) {
            Ok(()) => write_json(&mut stream, 200, &json!({ "ok": true })),
            Err(err) => write_error(&mut stream, &err),
        }
    }

    /// Behind a reverse proxy, plain-HTTP requests get bounced to the public
    /// HTTPS base unless the operator explicitly turned that off.
    fn https_redirect(&self, request: &Request) -> Option<String> {
        let config = self.manager.config();
        if config.disable_https_redirect {
            return None;
        }
        let base = config.public_base_url.as_ref()?;
        if !base.starts_with("https://") {
            return None;
        }
        let proto = request.header("x-forwarded-proto")?;
        if !proto.eq_ignore_ascii_case("http") {
            return None;
        }
        Some(format!("{}{}", base.trim_end_matches('/'), request.path))
    }
}

fn parse_task_id(raw: &str) -> Option<TaskId> {
    TaskId::parse_str(raw).ok()
}

/// First event is the current task; every fan-out notification follows.
/// A failed write means the client went away and ends the stream.
fn stream_events(
    stream: &mut TcpStream,
    first: &appdepot_core::PublicTask,
    events: &std::sync::mpsc::Receiver<appdepot_core::PublicTask>,
) -> io::Result<()> {
    let header = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n";
    stream.write_all(header.as_bytes())?;
    write_event(stream, first)?;

    loop {
        match events.recv_timeout(SSE_KEEPALIVE) {
            Ok(task) => {
                if write_event(stream, &task).is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if stream.write_all(b": keepalive\n\n").is_err() {
                    break;
                }
                if stream.flush().is_err() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn write_event(stream: &mut TcpStream, task: &appdepot_core::PublicTask) -> io::Result<()> {
    let payload = serde_json::to_string(task)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    stream.write_all(format!("data: {payload}\n\n").as_bytes())?;
    stream.flush()
}

pub fn read_request<R: BufRead>(reader: &mut R) -> io::Result<Option<Request>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("").to_ascii_uppercase();
    let raw_path = parts.next().unwrap_or("/");
    let (path, query) = split_query(raw_path);

    let mut headers = HashMap::new();
    for _ in 0..MAX_HEADER_LINES {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line)? == 0 {
            break;
        }
        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let mut body = Vec::new();
    if let Some(length) = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
    {
        if length > MAX_BODY_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request body too large",
            ));
        }
        body.resize(length, 0);
        reader.read_exact(&mut body)?;
    }

    Ok(Some(Request {
        method,
        path,
        query,
        headers,
        body,
    }))
}

fn split_query(raw_path: &str) -> (String, HashMap<String, String>) {
    match raw_path.split_once('?') {
        Some((path, query)) => {
            let mut map = HashMap::new();
            for pair in query.split('&') {
                if let Some((name, value)) = pair.split_once('=') {
                    map.insert(name.to_string(), value.to_string());
                } else if !pair.is_empty() {
                    map.insert(pair.to_string(), String::new());
                }
            }
            (path.to_string(), map)
        }
        None => (raw_path.to_string(), HashMap::new()),
    }
}

fn write_json<T: serde::Serialize>(
    stream: &mut TcpStream,
    status: u16,
    body: &T,
) -> io::Result<()> {
    let payload = serde_json::to_vec(body)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status,
        status_text(status),
        payload.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()
}

fn write_error(stream: &mut TcpStream, err: &CoreError) -> io::Result<()> {
    write_json(stream, error_status(err), &json!({ "error": err.to_string() }))
}

fn write_redirect(stream: &mut TcpStream, location: &str) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 301 Moved Permanently\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(head.as_bytes())?;
    stream.flush()
}

fn error_status(err: &CoreError) -> u16 {
    match err {
        CoreError::Validation(_) | CoreError::InvalidState(_) => 400,
        CoreError::SizeLimit => 413,
        CoreError::Preflight(_) => 502,
        CoreError::NotFound(_) => 404,
        _ => 500,
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Unknown",
    }
}
