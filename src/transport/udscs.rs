//! udscs client: the spice-vdagentd Unix socket transport.
//!
//! One task owns the socket. It connects (with retry), raises
//! `peer_connected`, then multiplexes inbound frames, queued outbound
//! messages and shutdown. When the daemon goes away it raises
//! `peer_disconnected` and reconnects unless shutting down.
//!
//! Outbound sends from other tasks go through [`UdscsTransport`], which
//! maps each [`ConnectionId`] to that connection's writer queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use super::{ConnectionId, RemoteHandler, Transport, TransportError};
use crate::proto::codec::UdscsCodec;
use crate::proto::message::kind_name;
use crate::proto::{FormatId, Message, Selection};

/// Where spice-vdagentd listens for session agents.
pub const DEFAULT_SOCKET: &str = "/run/spice-vdagentd/spice-vdagent-sock";

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    /// Connection attempts before giving up.
    pub connect_attempts: u32,
    /// Delay between connection attempts.
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET),
            connect_attempts: 60,
            retry_delay: Duration::from_secs(1),
        }
    }
}

struct Peer {
    writer: mpsc::UnboundedSender<Message>,
    open: bool,
    refs: usize,
}

/// Registry of live daemon connections.
///
/// An entry stays until its connection has closed and every reference
/// taken through [`Transport::acquire`] has been released.
#[derive(Default)]
pub struct UdscsTransport {
    peers: Mutex<HashMap<ConnectionId, Peer>>,
    next_id: AtomicU64,
}

impl UdscsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (writer, writer_rx) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            Peer {
                writer,
                open: true,
                refs: 0,
            },
        );
        (id, writer_rx)
    }

    fn close(&self, id: ConnectionId) {
        let mut peers = self.lock();
        if let Some(peer) = peers.get_mut(&id) {
            peer.open = false;
            if peer.refs == 0 {
                peers.remove(&id);
            }
        }
    }

    fn send(&self, id: ConnectionId, msg: Message) -> Result<(), TransportError> {
        match self.lock().get(&id) {
            Some(peer) if peer.open => peer
                .writer
                .send(msg)
                .map_err(|_| TransportError::Closed(id)),
            _ => Err(TransportError::Closed(id)),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.lock().len()
    }
}

impl Transport for UdscsTransport {
    fn send_grab(
        &self,
        conn: ConnectionId,
        selection: Selection,
        formats: &[FormatId],
    ) -> Result<(), TransportError> {
        self.send(
            conn,
            Message::ClipboardGrab {
                selection,
                formats: formats.to_vec(),
            },
        )
    }

    fn send_request(
        &self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
    ) -> Result<(), TransportError> {
        self.send(conn, Message::ClipboardRequest { selection, format })
    }

    fn send_data(
        &self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.send(
            conn,
            Message::ClipboardData {
                selection,
                format,
                data: data.to_vec(),
            },
        )
    }

    fn send_release(&self, conn: ConnectionId, selection: Selection) -> Result<(), TransportError> {
        self.send(conn, Message::ClipboardRelease { selection })
    }

    fn acquire(&self, conn: ConnectionId) -> Result<(), TransportError> {
        match self.lock().get_mut(&conn) {
            Some(peer) if peer.open => {
                peer.refs += 1;
                Ok(())
            }
            _ => Err(TransportError::Closed(conn)),
        }
    }

    fn release(&self, conn: ConnectionId) {
        let mut peers = self.lock();
        if let Some(peer) = peers.get_mut(&conn) {
            peer.refs = peer.refs.saturating_sub(1);
            if !peer.open && peer.refs == 0 {
                peers.remove(&conn);
            }
        }
    }
}

/// Run the daemon client until shutdown is requested.
///
/// # Errors
///
/// Returns [`TransportError::Connect`] when the daemon socket stays
/// unreachable for every configured attempt.
pub async fn run_client<H: RemoteHandler>(
    config: ClientConfig,
    transport: Arc<UdscsTransport>,
    handler: Arc<H>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    loop {
        let stream = tokio::select! {
            result = connect_with_retry(&config) => result?,
            _ = shutdown_requested(&mut shutdown) => return Ok(()),
        };

        let (id, writer_rx) = transport.register();
        tracing::info!(conn = %id, path = %config.socket_path.display(), "connected to vdagentd");
        handler.peer_connected(id).await;

        let result = serve(stream, id, writer_rx, handler.as_ref(), &mut shutdown).await;

        transport.close(id);
        handler.peer_disconnected(id).await;

        match result {
            Ok(()) => tracing::info!(conn = %id, "vdagentd connection closed"),
            Err(e) => tracing::warn!(conn = %id, error = %e, "vdagentd connection failed"),
        }

        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            return Ok(());
        }
        tracing::info!("reconnecting to vdagentd");
    }
}

async fn connect_with_retry(config: &ClientConfig) -> Result<UnixStream, TransportError> {
    let attempts = config.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < attempts => {
                if attempt == 1 {
                    tracing::debug!(
                        path = %config.socket_path.display(),
                        error = %e,
                        "vdagentd not reachable, retrying"
                    );
                }
                attempt += 1;
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(source) => {
                tracing::warn!(
                    path = %config.socket_path.display(),
                    attempts,
                    "giving up connecting to vdagentd"
                );
                return Err(TransportError::Connect {
                    path: config.socket_path.clone(),
                    source,
                });
            }
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn serve<H: RemoteHandler>(
    stream: UnixStream,
    id: ConnectionId,
    mut writer_rx: mpsc::UnboundedReceiver<Message>,
    handler: &H,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let (mut sink, mut frames) = Framed::new(stream, UdscsCodec::new()).split();

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(msg)) => {
                    if let Some(reply) = dispatch(handler, id, msg).await {
                        sink.send(reply).await?;
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },

            Some(msg) = writer_rx.recv() => {
                sink.send(msg).await?;
            }

            _ = shutdown_requested(shutdown) => return Ok(()),
        }
    }
}

/// Hand one inbound message to the handler. Returns a reply to write back,
/// if any.
async fn dispatch<H: RemoteHandler>(handler: &H, id: ConnectionId, msg: Message) -> Option<Message> {
    match msg {
        Message::ClipboardRequest { selection, format } => {
            if let Err(e) = handler.clipboard_request(id, selection, format).await {
                tracing::warn!(%selection, %format, error = %e, "clipboard request failed");
                return Some(Message::ClipboardData {
                    selection,
                    format: FormatId::Unsupported,
                    data: Vec::new(),
                });
            }
        }
        Message::ClipboardGrab { selection, formats } => {
            if let Err(e) = handler.clipboard_grab(id, selection, formats).await {
                tracing::warn!(%selection, error = %e, "clipboard grab failed");
            }
        }
        Message::ClipboardData {
            selection,
            format,
            data,
        } => {
            if let Err(e) = handler.clipboard_data(id, selection, format, data).await {
                tracing::warn!(%selection, %format, error = %e, "clipboard data dropped");
            }
        }
        Message::ClipboardRelease { selection } => {
            if let Err(e) = handler.clipboard_release(id, selection).await {
                tracing::warn!(%selection, error = %e, "clipboard release failed");
            }
        }
        Message::Version(version) => {
            tracing::info!(%version, "vdagentd version");
        }
        Message::ClientDisconnected => handler.client_disconnected(id).await,
        Message::Other { kind, .. } => {
            tracing::debug!(kind = kind_name(kind), "ignoring message");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use tokio::net::UnixListener;
    use tokio::time::timeout;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Seen {
        Connected(ConnectionId),
        Disconnected(ConnectionId),
        Request(Selection, FormatId),
        Grab(Selection, Vec<FormatId>),
        Data(FormatId, Vec<u8>),
        Release(Selection),
        ClientDisconnected,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("refused")]
    struct Refused;

    struct Recorder {
        seen: mpsc::UnboundedSender<Seen>,
        refuse_requests: bool,
    }

    impl RemoteHandler for Recorder {
        type Error = Refused;

        async fn clipboard_request(
            &self,
            _conn: ConnectionId,
            selection: Selection,
            format: FormatId,
        ) -> Result<(), Refused> {
            let _ = self.seen.send(Seen::Request(selection, format));
            if self.refuse_requests {
                Err(Refused)
            } else {
                Ok(())
            }
        }

        async fn clipboard_grab(
            &self,
            _conn: ConnectionId,
            selection: Selection,
            formats: Vec<FormatId>,
        ) -> Result<(), Refused> {
            let _ = self.seen.send(Seen::Grab(selection, formats));
            Ok(())
        }

        async fn clipboard_data(
            &self,
            _conn: ConnectionId,
            _selection: Selection,
            format: FormatId,
            data: Vec<u8>,
        ) -> Result<(), Refused> {
            let _ = self.seen.send(Seen::Data(format, data));
            Ok(())
        }

        async fn clipboard_release(
            &self,
            _conn: ConnectionId,
            selection: Selection,
        ) -> Result<(), Refused> {
            let _ = self.seen.send(Seen::Release(selection));
            Ok(())
        }

        async fn client_disconnected(&self, _conn: ConnectionId) {
            let _ = self.seen.send(Seen::ClientDisconnected);
        }

        async fn peer_connected(&self, conn: ConnectionId) {
            let _ = self.seen.send(Seen::Connected(conn));
        }

        async fn peer_disconnected(&self, conn: ConnectionId) {
            let _ = self.seen.send(Seen::Disconnected(conn));
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        listener: UnixListener,
        transport: Arc<UdscsTransport>,
        seen: mpsc::UnboundedReceiver<Seen>,
        shutdown: watch::Sender<bool>,
        client: tokio::task::JoinHandle<Result<(), TransportError>>,
    }

    fn start(refuse_requests: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdagent.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (seen_tx, seen) = mpsc::unbounded_channel();
        let handler = Arc::new(Recorder {
            seen: seen_tx,
            refuse_requests,
        });
        let transport = Arc::new(UdscsTransport::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = ClientConfig {
            socket_path: path,
            connect_attempts: 5,
            retry_delay: Duration::from_millis(10),
        };
        let client = tokio::spawn(run_client(
            config,
            Arc::clone(&transport),
            handler,
            shutdown_rx,
        ));

        Harness {
            _dir: dir,
            listener,
            transport,
            seen,
            shutdown,
            client,
        }
    }

    async fn accept(listener: &UnixListener) -> Framed<UnixStream, UdscsCodec> {
        let (stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        Framed::new(stream, UdscsCodec::new())
    }

    async fn next_seen(seen: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn inbound_messages_reach_handler() {
        let mut h = start(false);
        let mut daemon = accept(&h.listener).await;
        let Seen::Connected(_) = next_seen(&mut h.seen).await else {
            panic!("expected connect first");
        };

        daemon
            .send(Message::Version("0.22.1".into()))
            .await
            .unwrap();
        daemon
            .send(Message::ClipboardGrab {
                selection: Selection::Clipboard,
                formats: vec![FormatId::Utf8Text, FormatId::ImagePng],
            })
            .await
            .unwrap();
        daemon
            .send(Message::ClipboardData {
                selection: Selection::Clipboard,
                format: FormatId::Utf8Text,
                data: b"hi".to_vec(),
            })
            .await
            .unwrap();
        daemon
            .send(Message::ClipboardRelease {
                selection: Selection::Primary,
            })
            .await
            .unwrap();
        daemon.send(Message::ClientDisconnected).await.unwrap();

        assert_eq!(
            next_seen(&mut h.seen).await,
            Seen::Grab(
                Selection::Clipboard,
                vec![FormatId::Utf8Text, FormatId::ImagePng]
            )
        );
        assert_eq!(
            next_seen(&mut h.seen).await,
            Seen::Data(FormatId::Utf8Text, b"hi".to_vec())
        );
        assert_eq!(
            next_seen(&mut h.seen).await,
            Seen::Release(Selection::Primary)
        );
        assert_eq!(next_seen(&mut h.seen).await, Seen::ClientDisconnected);

        h.shutdown.send(true).unwrap();
        h.client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_request_is_answered_with_empty_data() {
        let mut h = start(true);
        let mut daemon = accept(&h.listener).await;
        next_seen(&mut h.seen).await;

        daemon
            .send(Message::ClipboardRequest {
                selection: Selection::Clipboard,
                format: FormatId::ImageTiff,
            })
            .await
            .unwrap();

        let reply = timeout(Duration::from_secs(2), daemon.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            reply,
            Message::ClipboardData {
                selection: Selection::Clipboard,
                format: FormatId::Unsupported,
                data: Vec::new(),
            }
        );

        h.shutdown.send(true).unwrap();
        h.client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transport_sends_reach_daemon() {
        let mut h = start(false);
        let mut daemon = accept(&h.listener).await;
        let Seen::Connected(id) = next_seen(&mut h.seen).await else {
            panic!("expected connect first");
        };

        h.transport
            .send_grab(id, Selection::Clipboard, &[FormatId::ImagePng])
            .unwrap();
        h.transport
            .send_request(id, Selection::Clipboard, FormatId::Utf8Text)
            .unwrap();
        h.transport.send_release(id, Selection::Clipboard).unwrap();

        let first = daemon.next().await.unwrap().unwrap();
        let second = daemon.next().await.unwrap().unwrap();
        let third = daemon.next().await.unwrap().unwrap();
        assert_eq!(
            first,
            Message::ClipboardGrab {
                selection: Selection::Clipboard,
                formats: vec![FormatId::ImagePng],
            }
        );
        assert_eq!(
            second,
            Message::ClipboardRequest {
                selection: Selection::Clipboard,
                format: FormatId::Utf8Text,
            }
        );
        assert_eq!(
            third,
            Message::ClipboardRelease {
                selection: Selection::Clipboard,
            }
        );

        h.shutdown.send(true).unwrap();
        h.client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn daemon_hangup_closes_connection_and_reconnects() {
        let mut h = start(false);
        let daemon = accept(&h.listener).await;
        let Seen::Connected(first) = next_seen(&mut h.seen).await else {
            panic!("expected connect first");
        };
        h.transport.acquire(first).unwrap();

        drop(daemon);
        assert_eq!(next_seen(&mut h.seen).await, Seen::Disconnected(first));
        assert!(matches!(
            h.transport.send_release(first, Selection::Clipboard),
            Err(TransportError::Closed(_))
        ));

        let _daemon = accept(&h.listener).await;
        let Seen::Connected(second) = next_seen(&mut h.seen).await else {
            panic!("expected reconnect");
        };
        assert_ne!(first, second);

        // The closed entry lingers until its last reference goes.
        assert_eq!(h.transport.tracked(), 2);
        h.transport.release(first);
        assert_eq!(h.transport.tracked(), 1);

        h.shutdown.send(true).unwrap();
        h.client.await.unwrap().unwrap();
        assert_eq!(next_seen(&mut h.seen).await, Seen::Disconnected(second));
    }

    #[tokio::test]
    async fn gives_up_after_configured_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            socket_path: dir.path().join("missing.sock"),
            connect_attempts: 3,
            retry_delay: Duration::from_millis(5),
        };
        let err = connect_with_retry(&config).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
