use tracing_subscriber::{fmt, EnvFilter};

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tokio_tungstenite=warn,tungstenite=warn"));

    // A host application may already own the global subscriber
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

/// JSON lines, for log shipping from long-running probes
pub fn init_json_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tokio_tungstenite=warn,tungstenite=warn"));

    let _ = fmt().json().with_env_filter(env_filter).try_init();
}
