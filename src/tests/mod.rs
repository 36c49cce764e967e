mod mgmtbus_test;

use std::time::Duration;

/// Poll `cond` every 10ms; panics after `limit`.
pub(crate) async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in {limit:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// `RUST_LOG=minemeld_core=debug cargo test` shows the bus traffic.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
