//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lb_node::error::{InstallError, RegistryError, SupervisorError};
use lb_node::install::{ConfigValidator, Installer};
use lb_node::process::{ProcessSupervisor, ProxyLauncher};
use lb_node::reconcile::Reconciler;
use lb_node::registry::{
    EventKind, KeyValue, Registry, Revision, Snapshot, WatchBatch, WatchEvent, WatchStream,
};
use lb_node::render::RenderSettings;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

pub const PREFIX: &str = "/services/backend/";

pub fn snapshot(revision: i64, backends: &[(&str, &str)]) -> Snapshot {
    Snapshot {
        revision: Revision(revision),
        kvs: backends
            .iter()
            .map(|(name, addr)| KeyValue::new(format!("{}{}", PREFIX, name), *addr))
            .collect(),
    }
}

pub fn put(name: &str, address: &str) -> WatchEvent {
    WatchEvent {
        kind: EventKind::Put,
        key: format!("{}{}", PREFIX, name),
        value: address.to_string(),
    }
}

pub fn delete(name: &str) -> WatchEvent {
    WatchEvent {
        kind: EventKind::Delete,
        key: format!("{}{}", PREFIX, name),
        value: String::new(),
    }
}

pub fn batch(revision: i64, events: Vec<WatchEvent>) -> WatchBatch {
    WatchBatch {
        revision: Revision(revision),
        events,
    }
}

/// One scripted answer to `Registry::watch`
pub enum Session {
    /// Stream these items, then end
    Stream(Vec<Result<WatchBatch, RegistryError>>),
    /// Fail to open the stream
    Refuse(RegistryError),
}

/// In-memory registry with scripted snapshots and watch sessions
///
/// Snapshots are answered from a queue whose last element repeats. Once the
/// scripted watch sessions run out, `watch` returns a stream that never
/// yields and signals `exhausted`.
#[derive(Default)]
pub struct FakeRegistry {
    snapshots: Mutex<VecDeque<Result<Snapshot, RegistryError>>>,
    sessions: Mutex<VecDeque<Session>>,
    watch_starts: Mutex<Vec<Revision>>,
    snapshot_calls: Mutex<usize>,
    pub exhausted: Notify,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_snapshot(&self, snapshot: Snapshot) {
        self.snapshots.lock().push_back(Ok(snapshot));
    }

    pub fn push_snapshot_error(&self, error: RegistryError) {
        self.snapshots.lock().push_back(Err(error));
    }

    pub fn push_session(&self, session: Session) {
        self.sessions.lock().push_back(session);
    }

    pub fn watch_starts(&self) -> Vec<Revision> {
        self.watch_starts.lock().clone()
    }

    pub fn snapshot_calls(&self) -> usize {
        *self.snapshot_calls.lock()
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn status(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn snapshot(&self, _prefix: &str) -> Result<Snapshot, RegistryError> {
        *self.snapshot_calls.lock() += 1;
        let mut queue = self.snapshots.lock();
        // Errors are answered once; the last snapshot repeats
        if queue.len() > 1 || matches!(queue.front(), Some(Err(_))) {
            return queue.pop_front().unwrap_or_else(|| Ok(Snapshot::default()));
        }
        Ok(queue
            .front()
            .and_then(|answer| answer.as_ref().ok())
            .cloned()
            .unwrap_or_default())
    }

    async fn watch(&self, _prefix: &str, start: Revision) -> Result<WatchStream, RegistryError> {
        self.watch_starts.lock().push(start);
        let session = self.sessions.lock().pop_front();
        match session {
            Some(Session::Stream(items)) => Ok(stream::iter(items).boxed()),
            Some(Session::Refuse(e)) => Err(e),
            None => {
                self.exhausted.notify_one();
                Ok(stream::pending().boxed())
            }
        }
    }
}

/// Launcher handing out sequential pids, optionally failing from some call on
pub struct RecordingLauncher {
    next_pid: Mutex<u32>,
    fail_from: Option<usize>,
    pub calls: Mutex<Vec<(PathBuf, Option<u32>)>>,
}

impl RecordingLauncher {
    pub fn new(first_pid: u32) -> Arc<Self> {
        Arc::new(Self {
            next_pid: Mutex::new(first_pid),
            fail_from: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Launches numbered `n` and later (zero-based) fail to spawn
    pub fn failing_from(first_pid: u32, n: usize) -> Arc<Self> {
        Arc::new(Self {
            next_pid: Mutex::new(first_pid),
            fail_from: Some(n),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn handoffs(&self) -> Vec<Option<u32>> {
        self.calls.lock().iter().map(|(_, h)| *h).collect()
    }
}

impl ProxyLauncher for RecordingLauncher {
    fn launch(&self, config_path: &Path, handoff_from: Option<u32>) -> Result<u32, SupervisorError> {
        let mut calls = self.calls.lock();
        let index = calls.len();
        calls.push((config_path.to_path_buf(), handoff_from));
        if self.fail_from.is_some_and(|n| index >= n) {
            return Err(SupervisorError::Spawn {
                binary: "haproxy".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let mut next = self.next_pid.lock();
        let pid = *next;
        *next += 1;
        Ok(pid)
    }
}

/// Validator answering from a queue of verdicts (accepting once it runs dry)
#[derive(Default)]
pub struct ScriptedValidator {
    verdicts: Mutex<VecDeque<bool>>,
    pub checked: Mutex<Vec<String>>,
}

impl ScriptedValidator {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_verdicts(verdicts: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.iter().copied().collect()),
            checked: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ConfigValidator for ScriptedValidator {
    async fn check(&self, path: &Path) -> Result<(), InstallError> {
        let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
        self.checked.lock().push(content);
        if self.verdicts.lock().pop_front().unwrap_or(true) {
            Ok(())
        } else {
            Err(InstallError::ValidationFailed {
                path: path.to_path_buf(),
                detail: "[ALERT] parsing error".to_string(),
            })
        }
    }
}

/// A reconciler wired to fakes, with its config files in a temp dir
pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<FakeRegistry>,
    pub launcher: Arc<RecordingLauncher>,
    pub validator: Arc<ScriptedValidator>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(RecordingLauncher::new(1000), ScriptedValidator::accepting())
    }

    pub fn with(launcher: Arc<RecordingLauncher>, validator: Arc<ScriptedValidator>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let registry = FakeRegistry::new();
        let installer = Installer::new(
            dir.path().join("haproxy.cfg"),
            dir.path().join("haproxy.cfg.tmp"),
            validator.clone(),
        );
        let supervisor = Arc::new(ProcessSupervisor::new(launcher.clone()));
        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            PREFIX,
            Duration::from_secs(5),
            RenderSettings::default(),
            installer,
            supervisor.clone(),
        ));

        Self {
            dir,
            registry,
            launcher,
            validator,
            supervisor,
            reconciler,
        }
    }

    pub fn live_path(&self) -> PathBuf {
        self.dir.path().join("haproxy.cfg")
    }

    pub fn live_config(&self) -> Option<String> {
        std::fs::read_to_string(self.live_path()).ok()
    }
}

/// Minimal HTTP/1.1 stand-in for the etcd JSON gateway
///
/// Answers each request path with a canned status and body, then closes the
/// connection. Request paths and bodies are recorded.
pub struct MockGateway {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl MockGateway {
    pub async fn start(routes: HashMap<&'static str, (u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock gateway");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let routes = Arc::new(routes);

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = routes.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, &routes, &recorded).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(p, _)| p.clone()).collect()
    }
}

async fn serve(
    mut stream: TcpStream,
    routes: &HashMap<&'static str, (u16, String)>,
    recorded: &Mutex<Vec<(String, serde_json::Value)>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = serde_json::from_slice(&buf[header_end..]).unwrap_or(serde_json::Value::Null);
    recorded.lock().push((path.clone(), body));

    let (status, payload) = routes
        .get(path.as_str())
        .cloned()
        .unwrap_or((404, r#"{"error":"Not Found","code":5}"#.to_string()));
    let response = format!(
        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
        status, payload
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
