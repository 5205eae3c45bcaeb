//! Real CAN reader backed by Linux SocketCAN, with a reconnect/backoff state
//! machine layered on top (the original agent had none — dropped connections
//! simply stopped the pipeline).

use std::sync::Arc;
use std::time::Duration;

use socketcan::{
    CanFdSocket, CanFilter, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as SocketCanFrame, Socket,
    StandardId,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::CanConfig;
use crate::error::ReaderError;
use crate::frame::{Frame, ReaderStats};

/// 29-bit extended-frame flag bit, per the Linux SocketCAN ABI
/// (`linux/can.h`'s `CAN_EFF_FLAG`), ORed into a filter's `id` so the kernel
/// matches it against extended-format frames.
const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// Connection state for the reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connected,
    Reconnecting,
}

/// Either a classic-only or an FD-capable SocketCAN socket, so the reader can
/// apply the same filter/option setup regardless of `can.fd`.
enum CanBus {
    Classic(CanSocket),
    Fd(CanFdSocket),
}

impl CanBus {
    fn try_clone(&self) -> std::io::Result<CanBus> {
        match self {
            CanBus::Classic(s) => s.try_clone().map(CanBus::Classic),
            CanBus::Fd(s) => s.try_clone().map(CanBus::Fd),
        }
    }

    fn set_read_timeout(&self, timeout: Duration) -> std::io::Result<()> {
        match self {
            CanBus::Classic(s) => s.set_read_timeout(timeout),
            CanBus::Fd(s) => s.set_read_timeout(timeout),
        }
    }

    fn receive(&self) -> std::io::Result<CanFrame> {
        match self {
            CanBus::Classic(s) => s.receive(),
            CanBus::Fd(s) => s.receive(),
        }
    }
}

/// Reads frames from a real SocketCAN interface, reconnecting with doubling
/// backoff (1s initial, 30s cap) whenever the bus becomes unavailable.
pub struct RealCanReader {
    config: CanConfig,
    stats: Arc<ReaderStats>,
    fps_window: Duration,
}

impl RealCanReader {
    const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);
    const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

    /// Construct a reader bound to `config.channel`, applying `config.fd`,
    /// `config.filters`, and `config.receive_own_messages` at socket-open time.
    pub fn new(config: CanConfig, stats: Arc<ReaderStats>, fps_window: Duration) -> Self {
        Self { config, stats, fps_window }
    }

    fn channel(&self) -> &str {
        &self.config.channel
    }

    /// Run the read loop until `cancel` fires, pushing frames onto `tx`.
    ///
    /// Bus-open and receive failures do not return an error: they drive the
    /// reconnect state machine instead. A [`ReaderError`] only escapes this
    /// function if `tx` is dropped out from under it, which never happens
    /// under normal supervisor wiring.
    pub async fn run(self, tx: mpsc::Sender<Frame>, cancel: CancellationToken) {
        let mut state = ConnState::Disconnected;
        let mut backoff = Self::INITIAL_BACKOFF;

        loop {
            if cancel.is_cancelled() {
                tracing::info!(channel = %self.channel(), "CAN reader stopping on shutdown request");
                return;
            }

            match state {
                ConnState::Disconnected | ConnState::Reconnecting => {
                    match self.open_socket() {
                        Ok(socket) => {
                            tracing::info!(channel = %self.channel(), "CAN bus connected");
                            state = ConnState::Connected;
                            backoff = Self::INITIAL_BACKOFF;
                            if !self.receive_loop(&socket, &tx, &cancel).await {
                                return;
                            }
                            state = ConnState::Reconnecting;
                        }
                        Err(err) => {
                            tracing::warn!(
                                channel = %self.channel(),
                                error = %err,
                                backoff_secs = backoff.as_secs(),
                                "failed to open CAN bus, retrying"
                            );
                            state = ConnState::Reconnecting;
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = cancel.cancelled() => {
                                    tracing::info!(channel = %self.channel(), "CAN reader stopping during reconnect backoff");
                                    return;
                                }
                            }
                            backoff = (backoff * 2).min(Self::MAX_BACKOFF);
                        }
                    }
                }
                ConnState::Connected => unreachable!("receive_loop always transitions out of Connected"),
            }
        }
    }

    /// Open the socket for `config.channel`, selecting an FD-capable socket
    /// when `config.fd` is set, then applying kernel-level receive filters
    /// and the loopback/receive-own-messages options before returning it.
    fn open_socket(&self) -> Result<CanBus, ReaderError> {
        let bus = if self.config.fd {
            CanFdSocket::open(&self.config.channel).map(CanBus::Fd).map_err(|e| ReaderError::BusOpen {
                interface: self.config.interface.clone(),
                channel: self.config.channel.clone(),
                source: e,
            })?
        } else {
            CanSocket::open(&self.config.channel).map(CanBus::Classic).map_err(|e| ReaderError::BusOpen {
                interface: self.config.interface.clone(),
                channel: self.config.channel.clone(),
                source: e,
            })?
        };

        self.apply_options(&bus);
        Ok(bus)
    }

    /// Install kernel-level receive filters and the receive-own-messages
    /// option. Failures here are logged but not fatal: the bus stays open and
    /// simply delivers unfiltered (or own-message-excluded) traffic instead.
    fn apply_options(&self, bus: &CanBus) {
        if !self.config.filters.is_empty() {
            let filters: Vec<CanFilter> = self
                .config
                .filters
                .iter()
                .map(|f| {
                    let id = if f.extended { f.id | CAN_EFF_FLAG } else { f.id };
                    CanFilter::new(id, f.mask)
                })
                .collect();

            let result = match bus {
                CanBus::Classic(s) => s.set_filters(&filters),
                CanBus::Fd(s) => s.set_filters(&filters),
            };
            if let Err(e) = result {
                tracing::warn!(channel = %self.channel(), error = %e, "failed to install CAN receive filters");
            }
        }

        let result = match bus {
            CanBus::Classic(s) => s.set_recv_own_msgs(self.config.receive_own_messages),
            CanBus::Fd(s) => s.set_recv_own_msgs(self.config.receive_own_messages),
        };
        if let Err(e) = result {
            tracing::warn!(channel = %self.channel(), error = %e, "failed to set receive-own-messages option");
        }
    }

    /// Receive frames until the bus errors out or shutdown is requested.
    /// Returns `false` if the caller should stop entirely (channel closed or
    /// cancelled), `true` if it should fall back to reconnecting.
    async fn receive_loop(
        &self,
        socket: &CanBus,
        tx: &mpsc::Sender<Frame>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }

            let socket = socket.try_clone().expect("socket fd clone");
            let recv = tokio::task::spawn_blocking(move || {
                socket.set_read_timeout(Self::RECEIVE_TIMEOUT).ok();
                socket.receive()
            });

            let outcome = tokio::select! {
                result = recv => result,
                _ = cancel.cancelled() => return false,
            };

            let frame = match outcome {
                Ok(Ok(frame)) => frame,
                Ok(Err(ref e)) if is_timeout(e) => continue,
                Ok(Err(e)) => {
                    self.stats.record_error();
                    tracing::warn!(channel = %self.channel(), error = %e, "CAN bus operation failed, reconnecting");
                    return true;
                }
                Err(join_err) => {
                    tracing::error!(channel = %self.channel(), error = %join_err, "blocking receive task panicked");
                    return true;
                }
            };

            if frame.is_error_frame() {
                self.stats.record_error();
                if is_bus_off(&frame) {
                    self.stats.record_bus_off();
                    tracing::error!(channel = %self.channel(), "bus-off condition detected, reconnecting");
                    return true;
                }
                continue;
            }

            let arb_id = match frame.id() {
                socketcan::Id::Standard(id) => id.as_raw() as u32,
                socketcan::Id::Extended(id) => id.as_raw(),
            };

            let value = Frame {
                timestamp: chrono::Utc::now(),
                arb_id,
                dlc: frame.data().len() as u8,
                data: frame.data().to_vec(),
                fd: matches!(frame, CanFrame::Fd(_)),
                channel: self.channel().to_string(),
            };

            self.stats.record_frame(self.fps_window);
            if tx.send(value).await.is_err() {
                tracing::debug!("CAN frame channel closed, stopping reader");
                return false;
            }
        }
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

/// SocketCAN reports bus-off via the error frame's class bits; a full
/// decode of the CAN error frame format belongs to the (external)
/// diagnostics tooling, so this only checks the one bit the health monitor
/// needs.
fn is_bus_off(frame: &CanFrame) -> bool {
    const CAN_ERR_BUSOFF: u32 = 0x00000004;
    match frame.id() {
        socketcan::Id::Standard(id) => (id.as_raw() as u32) & CAN_ERR_BUSOFF != 0,
        socketcan::Id::Extended(id) => id.as_raw() & CAN_ERR_BUSOFF != 0,
    }
}

#[allow(dead_code)]
fn standard_id(raw: u16) -> Option<StandardId> {
    StandardId::new(raw)
}

#[allow(dead_code)]
fn extended_id(raw: u32) -> Option<ExtendedId> {
    ExtendedId::new(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_errors_are_recognized() {
        let err = std::io::Error::new(std::io::ErrorKind::WouldBlock, "timed out");
        assert!(is_timeout(&err));
        let err = std::io::Error::new(std::io::ErrorKind::Other, "nope");
        assert!(!is_timeout(&err));
    }

    #[tokio::test]
    async fn stops_immediately_when_already_cancelled() {
        let stats = Arc::new(ReaderStats::default());
        let config = CanConfig { channel: "vcan0".to_string(), ..Default::default() };
        let reader = RealCanReader::new(config, stats, Duration::from_secs(10));
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_millis(200), reader.run(tx, cancel))
            .await
            .expect("run() must return promptly when already cancelled");
    }
}
