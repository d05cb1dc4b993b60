//! CDP wire transport.
//!
//! The engine speaks raw DevTools commands; this module owns the websocket
//! connection, the command/response correlation loop, and the browser
//! process lifecycle. A `NoopTransport` stands in when no browser is
//! available so the crate stays loadable in headless-less environments.

use std::collections::HashMap;
use std::convert::TryInto;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::io::{AsyncBufReadExt, BufReader};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use which::which;

use crate::driver::DriverConfig;
use crate::errors::DriverError;

/// A CDP event forwarded from the wire.
#[derive(Clone, Debug)]
pub struct WireEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

/// Where a command is addressed.
#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), DriverError>;
    async fn next_event(&self) -> Option<WireEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError>;
}

/// Transport used when no browser can be reached; every command fails
/// loudly so misconfiguration surfaces immediately.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn start(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<WireEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, DriverError> {
        Err(DriverError::Transport(format!(
            "no browser transport available for {method}"
        )))
    }
}

/// Transport backed by a launched (or attached) Chromium instance.
pub struct ChromiumTransport {
    cfg: DriverConfig,
    link: Mutex<Option<Arc<Link>>>,
}

impl ChromiumTransport {
    pub fn new(cfg: DriverConfig) -> Self {
        Self {
            cfg,
            link: Mutex::new(None),
        }
    }

    async fn link(&self) -> Result<Arc<Link>, DriverError> {
        let mut guard = self.link.lock().await;
        if let Some(link) = guard.as_ref() {
            if link.is_alive() {
                return Ok(link.clone());
            }
        }
        let link = Arc::new(Link::open(self.cfg.clone()).await?);
        *guard = Some(link.clone());
        Ok(link)
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), DriverError> {
        let link = self.link().await?;
        let deadline = Duration::from_millis(self.cfg.command_deadline_ms);
        link.send(
            CommandTarget::Browser,
            "Target.setDiscoverTargets",
            serde_json::json!({ "discover": true }),
            deadline,
        )
        .await?;
        Ok(())
    }

    async fn next_event(&self) -> Option<WireEvent> {
        match self.link().await {
            Ok(link) => link.next_event().await,
            Err(err) => {
                warn!(target: "pacts::driver", ?err, "transport not ready");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, DriverError> {
        let link = self.link().await?;
        link.send(
            target,
            method,
            params,
            Duration::from_millis(self.cfg.command_deadline_ms),
        )
        .await
    }
}

struct Pending {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, DriverError>>,
}

/// One live connection: browser child process (when launched here), the
/// command loop task, and a keep-alive heartbeat.
struct Link {
    command_tx: mpsc::Sender<Pending>,
    events_rx: Mutex<mpsc::Receiver<WireEvent>>,
    loop_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl Link {
    async fn open(cfg: DriverConfig) -> Result<Self, DriverError> {
        let (child, ws_url) = match cfg.websocket_url.clone() {
            Some(url) => (None, url),
            None => launch_browser(&cfg).await?,
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| DriverError::Transport(err.to_string()))?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let loop_task = tokio::spawn(async move {
            let result = run_loop(conn, command_rx, events_tx).await;
            loop_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                error!(target: "pacts::driver", ?err, "cdp command loop terminated");
            }
        });

        let heartbeat_task = spawn_heartbeat(
            command_tx.clone(),
            alive.clone(),
            Duration::from_millis(cfg.heartbeat_interval_ms),
        );

        info!(target: "pacts::driver", url = %ws_url, "devtools connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            loop_task,
            heartbeat_task,
            child: Mutex::new(child),
            alive,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn send(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, DriverError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx
            .send(Pending {
                target,
                method: method.to_string(),
                params,
                responder: resp_tx,
            })
            .await
            .map_err(|err| DriverError::Transport(err.to_string()))?;

        match timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DriverError::Transport(
                "command response channel closed".into(),
            )),
            Err(_) => Err(DriverError::Timeout(format!("cdp command {method}"))),
        }
    }

    async fn next_event(&self) -> Option<WireEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Some(task) = &self.heartbeat_task {
            task.abort();
        }
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(err) = child.kill().await {
                            warn!(target: "pacts::driver", ?err, "failed to kill browser child");
                        }
                    });
                }
            }
        }
    }
}

async fn run_loop(
    mut conn: Connection<CdpEventMessage>,
    mut command_rx: mpsc::Receiver<Pending>,
    event_tx: mpsc::Sender<WireEvent>,
) -> Result<(), DriverError> {
    let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, DriverError>>> = HashMap::new();

    loop {
        tokio::select! {
            Some(cmd) = command_rx.recv() => {
                let session = match cmd.target {
                    CommandTarget::Browser => None,
                    CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
                };
                let method_id: MethodId = cmd.method.clone().into();
                match conn.submit_command(method_id, session, cmd.params) {
                    Ok(call_id) => {
                        inflight.insert(call_id, cmd.responder);
                    }
                    Err(err) => {
                        let _ = cmd
                            .responder
                            .send(Err(DriverError::Transport(err.to_string())));
                    }
                }
            }
            message = conn.next() => {
                match message {
                    Some(Ok(Message::Response(resp))) => {
                        if let Some(sender) = inflight.remove(&resp.id) {
                            let _ = sender.send(extract_payload(resp));
                        }
                    }
                    Some(Ok(Message::Event(event))) => {
                        forward_event(event, &event_tx).await;
                    }
                    Some(Err(err)) => {
                        let mapped = map_cdp_error(err);
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(mapped.clone()));
                        }
                        return Err(mapped);
                    }
                    None => {
                        let err = DriverError::Transport("cdp connection closed".into());
                        for (_, sender) in inflight.drain() {
                            let _ = sender.send(Err(err.clone()));
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn forward_event(event: CdpEventMessage, event_tx: &mpsc::Sender<WireEvent>) {
    let raw: Result<CdpJsonEventMessage, _> = event.try_into();
    match raw {
        Ok(raw) => {
            let payload = WireEvent {
                method: raw.method.into_owned(),
                params: raw.params,
                session_id: raw.session_id,
            };
            if event_tx.send(payload).await.is_err() {
                debug!(target: "pacts::driver", "event channel closed");
            }
        }
        Err(err) => {
            debug!(target: "pacts::driver", ?err, "undecodable cdp event");
        }
    }
}

fn extract_payload(resp: Response) -> Result<Value, DriverError> {
    if let Some(result) = resp.result {
        Ok(result)
    } else if let Some(error) = resp.error {
        Err(DriverError::Transport(format!(
            "cdp error {}: {}",
            error.code, error.message
        )))
    } else {
        Err(DriverError::Internal("empty cdp response".into()))
    }
}

fn map_cdp_error(err: CdpError) -> DriverError {
    match err {
        CdpError::Timeout => DriverError::Timeout("cdp connection".into()),
        other => DriverError::Transport(other.to_string()),
    }
}

fn spawn_heartbeat(
    sender: mpsc::Sender<Pending>,
    alive: Arc<AtomicBool>,
    every: Duration,
) -> Option<JoinHandle<()>> {
    if every.as_millis() == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while alive.load(Ordering::Relaxed) {
            ticker.tick().await;
            if !alive.load(Ordering::Relaxed) {
                break;
            }
            let (resp_tx, resp_rx) = oneshot::channel();
            let ping = Pending {
                target: CommandTarget::Browser,
                method: "Browser.getVersion".to_string(),
                params: Value::Object(Default::default()),
                responder: resp_tx,
            };
            if sender.send(ping).await.is_err() {
                break;
            }
            match timeout(Duration::from_secs(5), resp_rx).await {
                Ok(Ok(Ok(_))) => {}
                _ => {
                    warn!(target: "pacts::driver", "browser heartbeat failed");
                    break;
                }
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Browser process lifecycle
// ---------------------------------------------------------------------------

async fn launch_browser(cfg: &DriverConfig) -> Result<(Option<Child>, String), DriverError> {
    let browser_cfg = browser_config(cfg)?;
    let mut child = browser_cfg
        .launch()
        .map_err(|err| DriverError::Launch(format!("failed to launch browser: {err}")))?;
    let ws_url = extract_ws_url(&mut child).await?;
    Ok((Some(child), ws_url))
}

fn browser_config(cfg: &DriverConfig) -> Result<BrowserConfig, DriverError> {
    let executable = if cfg.executable.as_os_str().is_empty() {
        detect_browser_executable().ok_or_else(|| {
            DriverError::Launch(
                "no Chrome/Chromium executable found; set PACTS_CHROME or pass --chrome-path"
                    .into(),
            )
        })?
    } else if cfg.executable.exists() {
        cfg.executable.clone()
    } else {
        return Err(DriverError::Launch(format!(
            "browser executable not found at {}",
            cfg.executable.display()
        )));
    };

    let profile_dir = if cfg.user_data_dir.is_absolute() {
        cfg.user_data_dir.clone()
    } else {
        env::current_dir()
            .map_err(|err| DriverError::Launch(err.to_string()))?
            .join(&cfg.user_data_dir)
    };
    fs::create_dir_all(&profile_dir).map_err(|err| DriverError::Launch(err.to_string()))?;

    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.command_deadline_ms))
        .launch_timeout(Duration::from_secs(20));

    if !cfg.headless {
        builder = builder.with_head();
    }
    if env::var("PACTS_NO_SANDBOX")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        builder = builder.no_sandbox();
    }

    let mut args = vec![
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-breakpad",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-hang-monitor",
        "--disable-popup-blocking",
        "--disable-prompt-on-repost",
        "--disable-sync",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
        "--use-mock-keychain",
    ];
    if cfg.headless {
        args.push("--headless=new");
        args.push("--hide-scrollbars");
        args.push("--mute-audio");
    }
    builder = builder
        .args(args)
        .chrome_executable(executable)
        .user_data_dir(profile_dir);

    builder
        .build()
        .map_err(|err| DriverError::Launch(format!("browser config error: {err}")))
}

/// Read the DevTools websocket URL off the browser's stderr.
async fn extract_ws_url(child: &mut Child) -> Result<String, DriverError> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| DriverError::Launch("browser process missing stderr handle".into()))?;
    let mut lines = BufReader::new(stderr).lines();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| DriverError::Launch(err.to_string()))?;
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") && ws.contains("devtools/browser") {
                    return Ok(ws.to_string());
                }
            }
        }
        Err(DriverError::Launch(
            "browser exited before exposing a devtools websocket url".into(),
        ))
    };

    timeout(Duration::from_secs(20), reader)
        .await
        .map_err(|_| DriverError::Timeout("devtools websocket url".into()))?
}

/// Find a Chromium-family executable: explicit env override, PATH, then
/// well-known install locations.
pub fn detect_browser_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("PACTS_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in [
        "google-chrome-stable",
        "google-chrome",
        "chromium",
        "chromium-browser",
    ] {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    [
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium-browser",
        "/usr/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|candidate| candidate.exists())
}
