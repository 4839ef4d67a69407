// DevTools-protocol session. Connects to an existing websocket endpoint
// (local Chrome with --remote-debugging-port, or a Browserless instance)
// and keeps a single page open for the lifetime of a run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::log::{EnableParams as LogEnableParams, EventEntryAdded};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, Handler, Page};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{wrap_script, BrowserError, BrowserLogEntry, BrowserSession, Result};

/// Max buffered log entries; older entries are dropped first.
const MAX_LOG_ENTRIES: usize = 500;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct Connection {
    _browser: Browser,
    page: Page,
    closed: Arc<AtomicBool>,
    logs: Arc<StdMutex<Vec<BrowserLogEntry>>>,
    handler_task: JoinHandle<()>,
    log_task: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handler_task.abort();
        self.log_task.abort();
    }
}

pub struct CdpSession {
    endpoint: String,
    conn: Mutex<Option<Connection>>,
}

impl CdpSession {
    /// Connect to a DevTools websocket URL and open a blank page.
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let conn = open_connection(endpoint).await?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn page(&self) -> Result<(Page, Arc<AtomicBool>)> {
        let guard = self.conn.lock().await;
        match guard.as_ref() {
            Some(c) if !c.closed.load(Ordering::SeqCst) => Ok((c.page.clone(), c.closed.clone())),
            _ => Err(BrowserError::Disconnected(
                "no live DevTools connection".to_string(),
            )),
        }
    }

    async fn evaluate(&self, expression: String) -> Result<Value> {
        let (page, closed) = self.page().await?;
        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BrowserError::Script)?;

        let result = page
            .evaluate_expression(params)
            .await
            .map_err(|e| classify(e, &closed))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }
}

async fn open_connection(endpoint: &str) -> Result<Connection> {
    info!(endpoint, "Connecting to DevTools endpoint");
    let (browser, handler) = Browser::connect(endpoint)
        .await
        .map_err(|e| BrowserError::Disconnected(format!("connect failed: {e}")))?;

    let closed = Arc::new(AtomicBool::new(false));
    let handler_task = spawn_handler_task(handler, closed.clone());

    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|e| classify(e, &closed))?;

    page.execute(LogEnableParams::default())
        .await
        .map_err(|e| classify(e, &closed))?;

    let logs = Arc::new(StdMutex::new(Vec::new()));
    let mut entries = page
        .event_listener::<EventEntryAdded>()
        .await
        .map_err(|e| classify(e, &closed))?;
    let sink = logs.clone();
    let log_task = tokio::spawn(async move {
        while let Some(event) = entries.next().await {
            let entry = BrowserLogEntry {
                level: format!("{:?}", event.entry.level).to_lowercase(),
                source: format!("{:?}", event.entry.source).to_lowercase(),
                message: event.entry.text.clone(),
                url: event.entry.url.clone(),
            };
            if let Ok(mut buf) = sink.lock() {
                if buf.len() >= MAX_LOG_ENTRIES {
                    buf.remove(0);
                }
                buf.push(entry);
            }
        }
    });

    Ok(Connection {
        _browser: browser,
        page,
        closed,
        logs,
        handler_task,
        log_task,
    })
}

fn spawn_handler_task(mut handler: Handler, closed: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!(error = %e, "DevTools handler event error");
            }
        }
        closed.store(true, Ordering::SeqCst);
    })
}

fn classify(err: CdpError, closed: &AtomicBool) -> BrowserError {
    let message = err.to_string();
    if closed.load(Ordering::SeqCst) || matches!(err, CdpError::Ws(_)) || looks_disconnected(&message)
    {
        BrowserError::Disconnected(message)
    } else if message.to_lowercase().contains("exception") {
        BrowserError::Script(message)
    } else {
        BrowserError::Protocol(message)
    }
}

fn looks_disconnected(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["connection closed", "channel closed", "send failed", "target closed", "websocket"]
        .iter()
        .any(|m| lower.contains(m))
}

#[async_trait]
impl BrowserSession for CdpSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let (page, closed) = self.page().await?;
        debug!(url, "Navigating");
        page.goto(url).await.map_err(|e| match classify(e, &closed) {
            BrowserError::Disconnected(m) => BrowserError::Disconnected(m),
            other => BrowserError::Navigation {
                url: url.to_string(),
                message: other.to_string(),
            },
        })?;
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>> {
        let (page, closed) = self.page().await?;
        page.url().await.map_err(|e| classify(e, &closed))
    }

    async fn run_script(&self, body: &str, args: Value) -> Result<Value> {
        self.evaluate(wrap_script(body, &args, false)).await
    }

    async fn run_async_script(&self, body: &str, args: Value) -> Result<Value> {
        self.evaluate(wrap_script(body, &args, true)).await
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        let args = serde_json::json!({ "selector": selector });
        loop {
            let found = self
                .run_script("return document.querySelector(args.selector) !== null;", args.clone())
                .await?;
            if found.as_bool().unwrap_or(false) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let (page, closed) = self.page().await?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        page.screenshot(params).await.map_err(|e| classify(e, &closed))
    }

    async fn read_logs(&self) -> Result<Vec<BrowserLogEntry>> {
        let guard = self.conn.lock().await;
        let Some(conn) = guard.as_ref() else {
            return Err(BrowserError::Disconnected("no live DevTools connection".into()));
        };
        let mut buf = conn
            .logs
            .lock()
            .map_err(|_| BrowserError::Protocol("log buffer poisoned".into()))?;
        Ok(std::mem::take(&mut *buf))
    }

    async fn is_alive(&self) -> bool {
        let guard = self.conn.lock().await;
        guard
            .as_ref()
            .map(|c| !c.closed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn reconnect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        guard.take();
        warn!(endpoint = %self.endpoint, "Reconnecting browser session");
        *guard = Some(open_connection(&self.endpoint).await?);
        Ok(())
    }
}
