pub mod cdp;
pub mod error;

pub use cdp::CdpSession;
pub use error::{BrowserError, Result};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry from the browser-level log (console, network, security).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserLogEntry {
    pub level: String,
    pub source: String,
    pub message: String,
    pub url: Option<String>,
}

/// Thin handle around a controllable browser page. Absence of an element is
/// a normal outcome (`false`, `Value::Null`), never an error.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<Option<String>>;

    /// Run a synchronous script body. `args` is bound to `args` inside the body;
    /// the body's `return` value comes back as JSON (`Null` for undefined).
    async fn run_script(&self, body: &str, args: Value) -> Result<Value>;

    /// Run an async script body; awaited promises resolve before returning.
    async fn run_async_script(&self, body: &str, args: Value) -> Result<Value>;

    /// Wait until `selector` matches an element, bounded by `timeout`.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool>;

    async fn screenshot(&self) -> Result<Vec<u8>>;

    /// Log entries collected since the last call (drained).
    async fn read_logs(&self) -> Result<Vec<BrowserLogEntry>>;

    async fn is_alive(&self) -> bool;

    /// Drop the current connection and open a fresh page on the same endpoint.
    async fn reconnect(&self) -> Result<()>;
}

/// Wrap a script body as an immediately-invoked function taking `args`.
pub fn wrap_script(body: &str, args: &Value, is_async: bool) -> String {
    let prefix = if is_async { "async " } else { "" };
    format!("({prefix}function(args) {{\n{body}\n}})({args})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wraps_sync_script_with_args() {
        let js = wrap_script("return args.x + 1;", &json!({"x": 1}), false);
        assert!(js.starts_with("(function(args) {"));
        assert!(js.ends_with(r#"({"x":1})"#));
    }

    #[test]
    fn wraps_async_script() {
        let js = wrap_script("return await Promise.resolve(1);", &Value::Null, true);
        assert!(js.starts_with("(async function(args)"));
        assert!(js.ends_with("(null)"));
    }
}
