//! WebSocket teleoperation transport.
//!
//! [`WsTransport`] runs a small WebSocket server on its own thread with its
//! own Tokio runtime.  A device (phone AR app, VR headset bridge, scripted
//! client) connects and streams JSON text frames, one per sample:
//!
//! ```json
//! { "position": [0.1, 0.0, 0.0],
//!   "rotation": [[1,0,0],[0,1,0],[0,0,1]],
//!   "button": 0.0,
//!   "toggle": false }
//! ```
//!
//! Poses are deltas from the device's own origin.  `rotation`, `button` and
//! `toggle` are optional.  Malformed frames are logged and skipped; a client
//! closing its socket is reported as
//! [`ArmError::StreamDisconnected`] and the server keeps accepting.

use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use armlink_types::{ArmError, DeviceSample};
use futures_util::StreamExt;
use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::transport::TeleopTransport;

/// What the server thread hands to the listener.
#[derive(Debug)]
pub enum TransportEvent {
    Sample(DeviceSample),
    Disconnected(String),
}

#[derive(Debug, Deserialize)]
struct DeviceFrame {
    position: [f64; 3],
    #[serde(default = "identity_rows")]
    rotation: [[f64; 3]; 3],
    #[serde(default)]
    button: f64,
    #[serde(default)]
    toggle: bool,
}

fn identity_rows() -> [[f64; 3]; 3] {
    [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]
}

/// Parse one JSON device frame.
///
/// # Errors
///
/// Returns [`ArmError::Transport`] for malformed JSON or non-finite values.
pub fn parse_device_frame(text: &str) -> Result<DeviceSample, ArmError> {
    let frame: DeviceFrame = serde_json::from_str(text)
        .map_err(|e| ArmError::Transport(format!("malformed device frame: {e}")))?;
    let [r0, r1, r2] = frame.rotation;
    let rotation = Matrix3::new(
        r0[0], r0[1], r0[2], //
        r1[0], r1[1], r1[2], //
        r2[0], r2[1], r2[2],
    );
    let sample = DeviceSample {
        position: Vector3::from(frame.position),
        rotation,
        button: frame.button,
        toggle: frame.toggle,
    };
    let finite = sample.position.iter().all(|v| v.is_finite())
        && sample.rotation.iter().all(|v| v.is_finite())
        && sample.button.is_finite();
    if finite {
        Ok(sample)
    } else {
        Err(ArmError::Transport("device frame has non-finite values".to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Server
// ────────────────────────────────────────────────────────────────────────────

/// Accept device connections on `listener` until `shutdown` flips to
/// `true`, forwarding every parsed sample to `tx`.
pub async fn serve(
    listener: TcpListener,
    tx: Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let tx = tx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_device(stream, peer, tx, shutdown).await {
                                warn!(peer = %peer, error = %e, "device connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "teleop accept error"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn handle_device(
    stream: TcpStream,
    peer: SocketAddr,
    tx: Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ArmError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ArmError::Transport(format!("ws handshake from {peer}: {e}")))?;
    info!(peer = %peer, "teleop device connected");

    let (_ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_device_frame(text.as_str()) {
                        Ok(sample) => {
                            if tx.send(TransportEvent::Sample(sample)).is_err() {
                                // Listener is gone.
                                return Ok(());
                            }
                        }
                        Err(e) => debug!(peer = %peer, error = %e, "skipping device frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = tx.send(TransportEvent::Disconnected(format!("device {peer} closed the connection")));
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(TransportEvent::Disconnected(format!("device {peer}: {e}")));
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transport
// ────────────────────────────────────────────────────────────────────────────

/// [`TeleopTransport`] backed by a WebSocket server.
pub struct WsTransport {
    addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    rx: Option<Receiver<TransportEvent>>,
    shutdown: Option<watch::Sender<bool>>,
    server: Option<JoinHandle<()>>,
}

impl WsTransport {
    /// A transport that will listen on `addr` once started.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            local_addr: None,
            rx: None,
            shutdown: None,
            server: None,
        }
    }

    /// Listen on every interface at `port`.
    pub fn on_port(port: u16) -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Address actually bound, available after [`TeleopTransport::start`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl TeleopTransport for WsTransport {
    fn start(&mut self) -> Result<(), ArmError> {
        let std_listener = std::net::TcpListener::bind(self.addr)
            .map_err(|e| ArmError::Transport(format!("ws bind error on {}: {e}", self.addr)))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| ArmError::Transport(format!("ws listener setup: {e}")))?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|e| ArmError::Transport(format!("ws listener address: {e}")))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ArmError::Transport(format!("teleop runtime: {e}")))?;

        let (tx, rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = thread::Builder::new()
            .name("teleop-ws".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(std_listener) {
                        Ok(listener) => serve(listener, tx, shutdown_rx).await,
                        Err(e) => error!(error = %e, "teleop listener registration failed"),
                    }
                });
            })
            .map_err(|e| ArmError::Transport(format!("spawning teleop server: {e}")))?;

        info!(addr = %local_addr, "teleop websocket server listening");
        self.local_addr = Some(local_addr);
        self.rx = Some(rx);
        self.shutdown = Some(shutdown_tx);
        self.server = Some(server);
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<DeviceSample>, ArmError> {
        let Some(rx) = self.rx.as_ref() else {
            return Err(ArmError::Transport("websocket transport not started".to_string()));
        };
        match rx.recv_timeout(timeout) {
            Ok(TransportEvent::Sample(sample)) => Ok(Some(sample)),
            Ok(TransportEvent::Disconnected(reason)) => Err(ArmError::StreamDisconnected(reason)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ArmError::Transport("websocket server exited".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(server) = self.server.take() {
            if server.join().is_err() {
                error!("teleop websocket server panicked");
            }
        }
        self.rx = None;
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
