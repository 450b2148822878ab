//! TCP listener setup: preferred-port binding with bounded fallback, and the
//! process shutdown signal.

use anyhow::{bail, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BindOptions {
    pub preferred_port: u16,
    pub max_port: u16,
    pub host: String,
}

impl BindOptions {
    pub fn new(preferred_port: u16, max_port: u16) -> Self {
        Self {
            preferred_port,
            max_port,
            host: "0.0.0.0".to_string(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}

/// Probe a port with a throwaway listener.
pub async fn is_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).await.is_ok()
}

/// First free port in `from..=to`, if any.
pub async fn find_available(host: &str, from: u16, to: u16) -> Option<u16> {
    for port in from..=to {
        if is_available(host, port).await {
            return Some(port);
        }
    }
    None
}

/// Bind the preferred port, walking upward through the range when occupied.
pub async fn bind_with_fallback(opts: &BindOptions) -> Result<(TcpListener, u16)> {
    for port in opts.preferred_port..=opts.max_port {
        match TcpListener::bind((opts.host.as_str(), port)).await {
            Ok(listener) => {
                if port != opts.preferred_port {
                    warn!(
                        preferred = opts.preferred_port,
                        bound = port,
                        "preferred port was busy; using fallback"
                    );
                }
                info!(host = %opts.host, port, "listener bound");
                return Ok((listener, port));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    bail!(
        "No available ports found in {}..={}",
        opts.preferred_port,
        opts.max_port
    )
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "installing ctrl-c handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!(error = %e, "installing SIGTERM handler failed"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
