//! Generic `TeleopTransport` trait and an in-process channel transport.
//!
//! A transport delivers [`DeviceSample`]s to the listener thread.  It owns
//! whatever connection the device uses (socket, USB, in-process channel)
//! and hides it behind a blocking, timeout-bounded receive.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use armlink_types::{ArmError, DeviceSample};

/// Source of device samples, driven from the listener thread.
pub trait TeleopTransport: Send + 'static {
    /// Open the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns [`ArmError::Transport`] if the connection cannot be opened.
    fn start(&mut self) -> Result<(), ArmError>;

    /// Wait up to `timeout` for the next sample.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    ///
    /// # Errors
    ///
    /// [`ArmError::StreamDisconnected`] is returned once each time the
    /// device goes away; the transport keeps accepting a reconnect.  Any
    /// other error stops the listener.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<DeviceSample>, ArmError>;

    /// Release the connection.  Called once from the listener thread on
    /// shutdown.
    fn stop(&mut self) {}
}

// ────────────────────────────────────────────────────────────────────────────
// ChannelTransport
// ────────────────────────────────────────────────────────────────────────────

/// In-process transport fed through a [`Sender<DeviceSample>`].
///
/// Used for scripted demos and tests.  Dropping every sender counts as a
/// device disconnect.
///
/// # Example
///
/// ```
/// use armlink_teleop::transport::ChannelTransport;
/// use armlink_types::DeviceSample;
///
/// let (transport, tx) = ChannelTransport::new();
/// tx.send(DeviceSample::at_origin()).unwrap();
/// # drop(transport);
/// ```
pub struct ChannelTransport {
    rx: Receiver<DeviceSample>,
    disconnected: bool,
}

impl ChannelTransport {
    /// Create the transport and the sender that feeds it.
    pub fn new() -> (Self, Sender<DeviceSample>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                rx,
                disconnected: false,
            },
            tx,
        )
    }
}

impl TeleopTransport for ChannelTransport {
    fn start(&mut self) -> Result<(), ArmError> {
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<DeviceSample>, ArmError> {
        if self.disconnected {
            // A channel cannot reconnect; idle like a quiet device.
            thread::sleep(timeout);
            return Ok(None);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnected = true;
                Err(ArmError::StreamDisconnected(
                    "device channel closed".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_samples_in_order() {
        let (mut transport, tx) = ChannelTransport::new();
        transport.start().unwrap();
        let mut first = DeviceSample::at_origin();
        first.button = 0.25;
        tx.send(first).unwrap();
        tx.send(DeviceSample::at_origin()).unwrap();

        let got = transport.recv_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(got.map(|s| s.button), Some(0.25));
        let got = transport.recv_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(got.map(|s| s.button), Some(0.0));
    }

    #[test]
    fn times_out_without_samples() {
        let (mut transport, _tx) = ChannelTransport::new();
        assert_eq!(transport.recv_timeout(Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn dropped_sender_reports_disconnect_once() {
        let (mut transport, tx) = ChannelTransport::new();
        drop(tx);
        assert!(matches!(
            transport.recv_timeout(Duration::from_millis(5)),
            Err(ArmError::StreamDisconnected(_))
        ));
        assert_eq!(transport.recv_timeout(Duration::from_millis(5)).unwrap(), None);
    }
}
