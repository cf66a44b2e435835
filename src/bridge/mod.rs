//! Clipboard bridge between the host clipboard and the vdagentd peer.
//!
//! Architecture: channel-based actor. A single bridge loop owns the
//! [`Controller`] and with it the retained connection, the ownership
//! tracker, the poll timer and every host clipboard call the bridge makes.
//! The udscs client task forwards inbound events as [`BridgeCommand`]s and
//! awaits each result over a oneshot channel.
//!
//! The pending request slot is the one piece of state shared across tasks:
//! reply data is matched against it on the client task, so a host paste
//! blocked on the remote side completes even while the actor is busy.

mod controller;
pub mod format;
pub mod lifecycle;
pub mod ownership;
pub mod pending;
pub mod timer;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use controller::{Controller, RemoteFetcher, check_selection};
use pending::{Fulfillment, PendingSlot};

use crate::host::{HostClipboard, HostError};
use crate::proto::{FormatId, Selection};
use crate::transport::udscs::{self, ClientConfig, UdscsTransport};
use crate::transport::{ConnectionId, RemoteHandler, TransportError};

/// Bridge errors, reported back to the transport for inbound events.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("unsupported selection: {0}")]
    UnsupportedSelection(Selection),
    #[error("unsupported clipboard format")]
    UnsupportedFormat,
    #[error("clipboard data not available")]
    DataNotAvailable,
    #[error("failed to write host clipboard: {0}")]
    FailedToWrite(#[source] HostError),
    #[error("timed out waiting for remote clipboard data")]
    RequestTimeout,
    #[error("remote clipboard request failed")]
    RequestFailed,
    #[error("no peer connected")]
    NotConnected,
    #[error("fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Bridge timing settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the host clipboard revision is checked while connected.
    pub poll_interval: Duration,
    /// How long a host paste waits for remote data.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            request_timeout: pending::REQUEST_TIMEOUT,
        }
    }
}

/// Inbound clipboard event from the peer.
#[derive(Debug)]
pub enum RemoteEvent {
    Request {
        selection: Selection,
        format: FormatId,
    },
    Grab {
        selection: Selection,
        formats: Vec<FormatId>,
    },
    Data {
        selection: Selection,
        format: FormatId,
        data: Vec<u8>,
    },
    Release {
        selection: Selection,
    },
}

/// Work submitted to the bridge actor.
#[derive(Debug)]
pub enum BridgeCommand {
    Remote {
        conn: ConnectionId,
        event: RemoteEvent,
        response_tx: oneshot::Sender<Result<(), BridgeError>>,
    },
    PeerConnected(ConnectionId),
    PeerDisconnected(ConnectionId),
    ClientDisconnected(ConnectionId),
    /// Send the request for the fetch waiting in the pending slot.
    SendRequest(FormatId),
}

/// [`RemoteHandler`] that hands events to the bridge actor.
pub struct Dispatcher {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    pending: Arc<PendingSlot>,
}

impl Dispatcher {
    pub fn new(commands: mpsc::UnboundedSender<BridgeCommand>, pending: Arc<PendingSlot>) -> Self {
        Self { commands, pending }
    }

    async fn call(&self, conn: ConnectionId, event: RemoteEvent) -> Result<(), BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.commands
            .send(BridgeCommand::Remote {
                conn,
                event,
                response_tx,
            })
            .map_err(|_| BridgeError::Fatal("bridge actor stopped".into()))?;
        response_rx
            .await
            .map_err(|_| BridgeError::Fatal("bridge actor dropped the response".into()))?
    }

    fn notify(&self, command: BridgeCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("bridge actor stopped, dropping notification");
        }
    }
}

impl RemoteHandler for Dispatcher {
    type Error = BridgeError;

    async fn clipboard_request(
        &self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
    ) -> Result<(), BridgeError> {
        self.call(conn, RemoteEvent::Request { selection, format })
            .await
    }

    async fn clipboard_grab(
        &self,
        conn: ConnectionId,
        selection: Selection,
        formats: Vec<FormatId>,
    ) -> Result<(), BridgeError> {
        self.call(conn, RemoteEvent::Grab { selection, formats })
            .await
    }

    async fn clipboard_data(
        &self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
        data: Vec<u8>,
    ) -> Result<(), BridgeError> {
        // Replies only answer CLIPBOARD requests; other selections never
        // reach the pending slot.
        check_selection(selection)?;
        match self.pending.fulfill(format, data) {
            Fulfillment::Delivered => {
                tracing::debug!(%format, "delivered reply to waiting paste");
                Ok(())
            }
            Fulfillment::Mismatched { expected } => {
                tracing::warn!(%expected, got = %format, "reply type mismatch, dropping data");
                Ok(())
            }
            Fulfillment::Settled => {
                tracing::debug!(%format, "request already settled, dropping data");
                Ok(())
            }
            Fulfillment::NotPending(data) => {
                self.call(
                    conn,
                    RemoteEvent::Data {
                        selection,
                        format,
                        data,
                    },
                )
                .await
            }
        }
    }

    async fn clipboard_release(
        &self,
        conn: ConnectionId,
        selection: Selection,
    ) -> Result<(), BridgeError> {
        self.call(conn, RemoteEvent::Release { selection }).await
    }

    async fn client_disconnected(&self, conn: ConnectionId) {
        self.notify(BridgeCommand::ClientDisconnected(conn));
    }

    async fn peer_connected(&self, conn: ConnectionId) {
        self.notify(BridgeCommand::PeerConnected(conn));
    }

    async fn peer_disconnected(&self, conn: ConnectionId) {
        self.notify(BridgeCommand::PeerDisconnected(conn));
    }
}

/// Run the bridge until shutdown is requested.
///
/// # Errors
///
/// Returns `BridgeError::Transport` if the daemon socket cannot be reached.
pub async fn run(
    config: Config,
    client: ClientConfig,
    host: Arc<dyn HostClipboard>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    let transport = Arc::new(UdscsTransport::new());
    let pending = Arc::new(PendingSlot::with_timeout(config.request_timeout));
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<BridgeCommand>();

    let dispatcher = Arc::new(Dispatcher::new(cmd_tx.clone(), Arc::clone(&pending)));
    let fetcher = Arc::new(RemoteFetcher::new(Arc::clone(&pending), cmd_tx));
    let mut controller = Controller::new(
        host,
        transport.clone(),
        pending,
        fetcher,
        config.poll_interval,
    );

    let mut client_task = tokio::spawn(udscs::run_client(client, transport, dispatcher, shutdown));

    loop {
        tokio::select! {
            Some(cmd) = cmd_rx.recv() => {
                handle_command(&mut controller, cmd);
            }

            _ = controller.tick() => {
                controller.poll_local_clipboard();
            }

            result = &mut client_task => {
                // The client raised its final disconnect before exiting.
                while let Ok(cmd) = cmd_rx.try_recv() {
                    handle_command(&mut controller, cmd);
                }
                tracing::info!("bridge stopped");
                return match result {
                    Ok(result) => result.map_err(BridgeError::from),
                    Err(e) => Err(BridgeError::Fatal(format!("udscs client task failed: {e}"))),
                };
            }
        }
    }
}

fn handle_command(controller: &mut Controller, cmd: BridgeCommand) {
    match cmd {
        BridgeCommand::Remote {
            conn,
            event,
            response_tx,
        } => {
            let result = match event {
                RemoteEvent::Request { selection, format } => {
                    controller.on_remote_request(conn, selection, format)
                }
                RemoteEvent::Grab { selection, formats } => {
                    controller.on_remote_grab(conn, selection, &formats)
                }
                RemoteEvent::Data {
                    selection,
                    format,
                    data,
                } => controller.on_remote_data(conn, selection, format, &data),
                RemoteEvent::Release { selection } => controller.on_remote_release(conn, selection),
            };
            let _ = response_tx.send(result);
        }
        BridgeCommand::PeerConnected(conn) => controller.on_peer_connected(conn),
        BridgeCommand::PeerDisconnected(conn) => controller.on_peer_disconnected(conn),
        BridgeCommand::ClientDisconnected(conn) => controller.on_client_disconnected(conn),
        BridgeCommand::SendRequest(format) => controller.send_remote_request(format),
    }
}
