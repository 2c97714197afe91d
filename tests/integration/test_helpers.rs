//! Shared fixtures for integration tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mcp_stdio_bridge::jsonrpc::Message;
use mcp_stdio_bridge::process::ChildListener;
use mcp_stdio_bridge::transport::http::{bind_http, serve_http};
use mcp_stdio_bridge::{Bridge, BridgeConfig};

/// Child script answering every request with `"pong"`.
///
/// A request for method `broadcast` first emits an unrelated log
/// notification, a request carrying a progress token first emits one
/// progress notification for it, and method `die` makes the child exit.
pub const PONG_SCRIPT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"die"'*) exit 3 ;;
    *'"method":"broadcast"'*)
      printf '%s\n' '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","data":"hello"}}' ;;
  esac
  case "$line" in
    *'"progressToken"'*)
      printf '{"jsonrpc":"2.0","method":"notifications/progress","params":{"progressToken":%s,"progress":1,"total":2}}\n' "$id" ;;
  esac
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":"pong"}\n' "$id"
  fi
done
"#;

/// Configuration running `sh -c <script>` with fast restarts.
pub fn sh_config(script: &str) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.listen = "127.0.0.1:0".parse().expect("addr");
    config.process.command = "sh".into();
    config.process.args = vec!["-c".into(), script.into()];
    config.process.stop_grace_seconds = 1;
    config.restart.initial_backoff_ms = 50;
    config.restart.max_backoff_ms = 200;
    config.timeouts.request_seconds = 10;
    config
}

/// A running bridge behind a real HTTP listener.
pub struct TestServer {
    pub base_url: String,
    pub bridge: Arc<Bridge>,
    ct: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn start(config: BridgeConfig) -> Self {
        let listener = bind_http(config.listen).await.expect("bind ephemeral");
        let addr = listener.local_addr().expect("local addr");
        let bridge = Arc::new(Bridge::new(config));
        bridge.start().await.expect("child starts");

        let ct = CancellationToken::new();
        let server = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            let ct = ct.clone();
            async move {
                serve_http(bridge, listener, ct).await.expect("serve");
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            bridge,
            ct,
            server,
        }
    }

    pub fn mcp_url(&self) -> String {
        format!("{}/mcp", self.base_url)
    }

    pub async fn stop(self) {
        self.ct.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server).await;
        self.bridge.shutdown().await;
    }
}

/// Listener that records everything the child emits.
#[derive(Default)]
pub struct Collector {
    pub messages: Mutex<Vec<Message>>,
    pub exits: Mutex<Vec<String>>,
}

impl ChildListener for Collector {
    fn on_message(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
    }

    fn on_exit(&self, reason: &str) {
        self.exits.lock().unwrap().push(reason.to_owned());
    }
}

/// Poll `cond` every 10 ms for up to `secs` seconds.
pub async fn eventually(secs: u64, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
