//! Device-operation seam.
//!
//! The engine sequences opaque device operations; this trait is where they
//! actually happen. The daemon ships [`TcpDeviceOps`], which probes panels
//! over their TCP control port; tests substitute scripted implementations.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use helio_core::{PanelSummary, Stage};

/// Default TCP control port panels listen on.
pub const DEFAULT_CONTROL_PORT: u16 = 4911;

/// Outcome of a liveness probe against one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Something is listening, or actively refused (a live host either way).
    Responsive,
    /// Nothing answered within the probe timeout.
    NoResponse,
    /// The probe failed unexpectedly.
    Error(String),
}

/// Outcome of a panel identification attempt against a responsive address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// The device speaks the panel protocol.
    Panel(PanelSummary),
    /// Responsive, but not a panel (wrong banner, no banner, or hung up).
    NotPanel,
}

/// Failure of a stage operation or compensating halt.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The opaque device operations the job engine sequences.
///
/// Implementations must be cancel-safe at call granularity: the engine
/// never aborts a call mid-flight, it only declines to issue the next one.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    /// Probes `address` for liveness.
    async fn probe(&self, address: Ipv4Addr) -> ProbeOutcome;

    /// Attempts panel identification against a responsive `address`.
    async fn identify(&self, address: Ipv4Addr) -> IdentifyOutcome;

    /// Runs one stage's device operations against `profile_id`.
    async fn run_stage(&self, profile_id: i64, stage: &Stage) -> Result<(), StageError>;

    /// Compensating stop: halts any actuator the interrupted execution left
    /// mid-motion (e.g. a moving shade). `interrupted` is the last stage
    /// that issued device commands, when one ran at all.
    async fn halt(&self, profile_id: i64, interrupted: Option<&Stage>) -> Result<(), StageError>;
}

// ============================================================================
// TCP implementation
// ============================================================================

/// Probes and drives panels over their TCP control port.
///
/// Panels announce themselves with a one-line banner on connect:
/// `SPC/1 <model> [firmware]`. Stage payloads are sent as one JSON line and
/// acknowledged with `ok` or `err <detail>`.
#[derive(Debug, Clone)]
pub struct TcpDeviceOps {
    control_port: u16,
    connect_timeout: Duration,
    banner_timeout: Duration,
}

/// Banner prefix identifying the shade panel control protocol, version 1.
const PANEL_BANNER_PREFIX: &str = "SPC/1";

impl TcpDeviceOps {
    pub fn new(control_port: u16, connect_timeout: Duration, banner_timeout: Duration) -> Self {
        Self {
            control_port,
            connect_timeout,
            banner_timeout,
        }
    }

    fn socket(&self, address: Ipv4Addr) -> SocketAddr {
        SocketAddr::from((address, self.control_port))
    }

    /// Reads one banner line (up to 256 bytes) with a short timeout.
    async fn read_banner(&self, stream: &mut TcpStream) -> Option<String> {
        let mut buf = vec![0u8; 256];
        match timeout(self.banner_timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                buf.truncate(n);
                let line = String::from_utf8_lossy(&buf);
                Some(line.lines().next().unwrap_or_default().trim().to_string())
            }
            _ => None,
        }
    }

    async fn send_command(
        &self,
        address: Ipv4Addr,
        command: &str,
    ) -> Result<(), StageError> {
        let connect = timeout(self.connect_timeout, TcpStream::connect(self.socket(address)));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(StageError::new(format!("connect failed: {e}"))),
            Err(_) => return Err(StageError::new("connect timed out")),
        };

        // Skip the banner before issuing the command.
        let _ = self.read_banner(&mut stream).await;

        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| StageError::new(format!("write failed: {e}")))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|e| StageError::new(format!("write failed: {e}")))?;

        match self.read_banner(&mut stream).await {
            Some(reply) if reply == "ok" => Ok(()),
            Some(reply) => Err(StageError::new(format!("panel rejected command: {reply}"))),
            None => Err(StageError::new("panel did not acknowledge command")),
        }
    }
}

impl Default for TcpDeviceOps {
    fn default() -> Self {
        Self::new(
            DEFAULT_CONTROL_PORT,
            Duration::from_millis(500),
            Duration::from_millis(300),
        )
    }
}

#[async_trait]
impl DeviceOps for TcpDeviceOps {
    async fn probe(&self, address: Ipv4Addr) -> ProbeOutcome {
        match timeout(self.connect_timeout, TcpStream::connect(self.socket(address))).await {
            Ok(Ok(_stream)) => ProbeOutcome::Responsive,
            // An active refusal (RST) still proves a host is present.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                ProbeOutcome::Responsive
            }
            Ok(Err(e)) => ProbeOutcome::Error(e.to_string()),
            Err(_) => ProbeOutcome::NoResponse,
        }
    }

    async fn identify(&self, address: Ipv4Addr) -> IdentifyOutcome {
        let connect = timeout(self.connect_timeout, TcpStream::connect(self.socket(address)));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            _ => return IdentifyOutcome::NotPanel,
        };

        let Some(banner) = self.read_banner(&mut stream).await else {
            return IdentifyOutcome::NotPanel;
        };

        let mut parts = banner.split_whitespace();
        if parts.next() != Some(PANEL_BANNER_PREFIX) {
            debug!(%address, banner = %banner, "Responsive device is not a panel");
            return IdentifyOutcome::NotPanel;
        }

        let model = match parts.next() {
            Some(model) => model.to_string(),
            None => return IdentifyOutcome::NotPanel,
        };
        let firmware = parts.next().map(str::to_string);

        IdentifyOutcome::Panel(PanelSummary {
            address,
            model,
            firmware,
        })
    }

    async fn run_stage(&self, profile_id: i64, stage: &Stage) -> Result<(), StageError> {
        let address = stage_address(stage)
            .ok_or_else(|| StageError::new("stage payload carries no panel address"))?;

        // Stage payloads are opaque to the engine; serialize verbatim.
        let command = serde_json::json!({
            "profile": profile_id,
            "stage": stage.name,
            "payload": stage.payload,
        })
        .to_string();

        self.send_command(address, &command).await
    }

    async fn halt(&self, profile_id: i64, interrupted: Option<&Stage>) -> Result<(), StageError> {
        // No stage ran yet: nothing can be mid-motion.
        let Some(stage) = interrupted else {
            return Ok(());
        };
        let address = stage_address(stage)
            .ok_or_else(|| StageError::new("interrupted stage carries no panel address"))?;

        debug!(profile_id, %address, stage = %stage.name, "Sending compensating halt");
        let command = serde_json::json!({ "profile": profile_id, "halt": true }).to_string();
        self.send_command(address, &command).await
    }
}

/// Extracts the target panel address from a stage payload. The profile
/// store resolves addresses and embeds them when it assembles the action.
fn stage_address(stage: &Stage) -> Option<Ipv4Addr> {
    stage
        .payload
        .get("address")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    fn ops_for(port: u16) -> TcpDeviceOps {
        TcpDeviceOps::new(port, Duration::from_millis(300), Duration::from_millis(300))
    }

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_probe_responsive_listener() {
        let (listener, port) = local_listener().await;
        let _server = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let outcome = ops_for(port).probe(Ipv4Addr::LOCALHOST).await;
        assert_eq!(outcome, ProbeOutcome::Responsive);
    }

    #[tokio::test]
    async fn test_probe_refused_counts_as_responsive() {
        // Port freed immediately after binding: connecting gets an RST.
        let (listener, port) = local_listener().await;
        drop(listener);

        let outcome = ops_for(port).probe(Ipv4Addr::LOCALHOST).await;
        assert_eq!(outcome, ProbeOutcome::Responsive);
    }

    #[tokio::test]
    async fn test_identify_parses_panel_banner() {
        let (listener, port) = local_listener().await;
        let _server = tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"SPC/1 SP-200 2.4.1\n").await;
            }
        });

        let outcome = ops_for(port).identify(Ipv4Addr::LOCALHOST).await;
        match outcome {
            IdentifyOutcome::Panel(summary) => {
                assert_eq!(summary.model, "SP-200");
                assert_eq!(summary.firmware.as_deref(), Some("2.4.1"));
                assert_eq!(summary.address, Ipv4Addr::LOCALHOST);
            }
            other => panic!("expected panel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_identify_rejects_foreign_banner() {
        let (listener, port) = local_listener().await;
        let _server = tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(b"SSH-2.0-OpenSSH_9.6\n").await;
            }
        });

        let outcome = ops_for(port).identify(Ipv4Addr::LOCALHOST).await;
        assert_eq!(outcome, IdentifyOutcome::NotPanel);
    }

    #[tokio::test]
    async fn test_identify_silent_peer_is_not_panel() {
        let (listener, port) = local_listener().await;
        let _server = tokio::spawn(async move {
            if let Ok((_stream, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });

        let outcome = ops_for(port).identify(Ipv4Addr::LOCALHOST).await;
        assert_eq!(outcome, IdentifyOutcome::NotPanel);
    }

    #[tokio::test]
    async fn test_run_stage_requires_address() {
        let ops = TcpDeviceOps::default();
        let stage = Stage::new("lower-shades", 100);
        let err = ops.run_stage(1, &stage).await.expect_err("no address");
        assert!(err.message.contains("no panel address"));
    }

    #[tokio::test]
    async fn test_halt_without_interrupted_stage_is_a_noop() {
        let ops = TcpDeviceOps::default();
        assert!(ops.halt(1, None).await.is_ok());
    }
}
