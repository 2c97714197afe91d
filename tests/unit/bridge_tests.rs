//! Unit tests for the bridge's background sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use mcp_stdio_bridge::{Bridge, BridgeConfig};

fn quick_sweep_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.timeouts.session_idle_seconds = 1;
    config.timeouts.sweep_interval_seconds = 1;
    config
}

#[tokio::test]
async fn sweeper_closes_idle_sessions_and_stops_on_cancel() {
    let bridge = Arc::new(Bridge::new(quick_sweep_config()));
    let session = bridge.open_session(None).expect("session");
    let ct = CancellationToken::new();
    let sweeper = bridge.spawn_sweeper(ct.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bridge.sessions().state_of(&session).is_some() {
        assert!(tokio::time::Instant::now() < deadline, "idle session never swept");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(bridge.open_session(Some(&session)).is_err());

    ct.cancel();
    let joined = tokio::time::timeout(Duration::from_secs(2), sweeper).await;
    assert!(matches!(joined, Ok(Ok(()))), "sweeper exits cleanly on cancel");
}
