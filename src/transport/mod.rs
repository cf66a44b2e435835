//! Remote peer transport contract.
//!
//! The bridge talks to the remote agent daemon through two seams:
//!
//! - [`Transport`]: outbound sends plus per-connection reference counting.
//! - [`RemoteHandler`]: inbound events, raised on the transport's own task.
//!
//! [`RemoteConnection`] is the owned handle the bridge retains for the
//! connected peer; it holds one transport reference for its lifetime.

pub mod udscs;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::proto::codec::CodecError;
use crate::proto::{FormatId, Selection};

/// Identifies one daemon connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-level errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Outbound side of a peer connection.
///
/// Sends never block: they queue the message for the connection's writer
/// and fail with [`TransportError::Closed`] once the connection is gone.
pub trait Transport: Send + Sync {
    fn send_grab(
        &self,
        conn: ConnectionId,
        selection: Selection,
        formats: &[FormatId],
    ) -> Result<(), TransportError>;

    fn send_request(
        &self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
    ) -> Result<(), TransportError>;

    fn send_data(
        &self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Completes the daemon's message set. The bridge never releases the
    /// remote clipboard itself: a host change is announced as a new grab,
    /// and a host that stops owning the clipboard sends nothing.
    fn send_release(&self, conn: ConnectionId, selection: Selection) -> Result<(), TransportError>;

    /// Take a reference on `conn`. Fails if the connection already closed.
    fn acquire(&self, conn: ConnectionId) -> Result<(), TransportError>;

    /// Drop a reference taken by [`Transport::acquire`].
    fn release(&self, conn: ConnectionId);
}

/// Inbound events from the peer.
///
/// Called on the transport's task, one event at a time per connection.
/// Clipboard events return an error to have the failure logged; a failed
/// request is additionally answered with an empty reply.
pub trait RemoteHandler: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn clipboard_request(
        &self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn clipboard_grab(
        &self,
        conn: ConnectionId,
        selection: Selection,
        formats: Vec<FormatId>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn clipboard_data(
        &self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn clipboard_release(
        &self,
        conn: ConnectionId,
        selection: Selection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// The remote viewer went away while the daemon connection stays up.
    fn client_disconnected(&self, conn: ConnectionId) -> impl Future<Output = ()> + Send;

    fn peer_connected(&self, conn: ConnectionId) -> impl Future<Output = ()> + Send;

    fn peer_disconnected(&self, conn: ConnectionId) -> impl Future<Output = ()> + Send;
}

/// Owned handle on a peer connection.
///
/// Construction acquires a transport reference and `Drop` releases it, so
/// acquire and release calls always balance.
pub struct RemoteConnection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
}

impl RemoteConnection {
    pub fn acquire(transport: Arc<dyn Transport>, id: ConnectionId) -> Result<Self, TransportError> {
        transport.acquire(id)?;
        Ok(Self { id, transport })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send_grab(&self, selection: Selection, formats: &[FormatId]) -> Result<(), TransportError> {
        self.transport.send_grab(self.id, selection, formats)
    }

    pub fn send_request(&self, selection: Selection, format: FormatId) -> Result<(), TransportError> {
        self.transport.send_request(self.id, selection, format)
    }

    pub fn send_data(
        &self,
        selection: Selection,
        format: FormatId,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.transport.send_data(self.id, selection, format, data)
    }
}

impl fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConnection").field("id", &self.id).finish()
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.transport.release(self.id);
    }
}

/// Recording transport shared by the bridge tests.
#[cfg(test)]
pub mod mock {
    use std::sync::Mutex;

    use super::*;

    /// A send observed by [`RecordingTransport`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Grab(ConnectionId, Selection, Vec<FormatId>),
        Request(ConnectionId, Selection, FormatId),
        Data(ConnectionId, Selection, FormatId, Vec<u8>),
        Release(ConnectionId, Selection),
    }

    #[derive(Default)]
    struct State {
        sent: Vec<Sent>,
        acquired: Vec<ConnectionId>,
        released: Vec<ConnectionId>,
        closed: Vec<ConnectionId>,
        refused: usize,
    }

    /// Records every call. Connections marked closed refuse sends and
    /// acquires; refused sends are only counted.
    #[derive(Default)]
    pub struct RecordingTransport {
        state: Mutex<State>,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn close(&self, conn: ConnectionId) {
            self.state.lock().unwrap().closed.push(conn);
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.state.lock().unwrap().sent.clone()
        }

        pub fn acquired(&self) -> Vec<ConnectionId> {
            self.state.lock().unwrap().acquired.clone()
        }

        pub fn released(&self) -> Vec<ConnectionId> {
            self.state.lock().unwrap().released.clone()
        }

        pub fn refused(&self) -> usize {
            self.state.lock().unwrap().refused
        }

        fn record(&self, conn: ConnectionId, sent: Sent) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            if state.closed.contains(&conn) {
                state.refused += 1;
                return Err(TransportError::Closed(conn));
            }
            state.sent.push(sent);
            Ok(())
        }
    }

    impl Transport for RecordingTransport {
        fn send_grab(
            &self,
            conn: ConnectionId,
            selection: Selection,
            formats: &[FormatId],
        ) -> Result<(), TransportError> {
            self.record(conn, Sent::Grab(conn, selection, formats.to_vec()))
        }

        fn send_request(
            &self,
            conn: ConnectionId,
            selection: Selection,
            format: FormatId,
        ) -> Result<(), TransportError> {
            self.record(conn, Sent::Request(conn, selection, format))
        }

        fn send_data(
            &self,
            conn: ConnectionId,
            selection: Selection,
            format: FormatId,
            data: &[u8],
        ) -> Result<(), TransportError> {
            self.record(conn, Sent::Data(conn, selection, format, data.to_vec()))
        }

        fn send_release(&self, conn: ConnectionId, selection: Selection) -> Result<(), TransportError> {
            self.record(conn, Sent::Release(conn, selection))
        }

        fn acquire(&self, conn: ConnectionId) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            if state.closed.contains(&conn) {
                return Err(TransportError::Closed(conn));
            }
            state.acquired.push(conn);
            Ok(())
        }

        fn release(&self, conn: ConnectionId) {
            self.state.lock().unwrap().released.push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::RecordingTransport;
    use super::*;

    #[test]
    fn handle_releases_on_drop() {
        let transport = RecordingTransport::new();
        let conn = RemoteConnection::acquire(transport.clone(), ConnectionId(3)).unwrap();
        assert_eq!(transport.acquired(), vec![ConnectionId(3)]);
        assert!(transport.released().is_empty());

        drop(conn);
        assert_eq!(transport.released(), vec![ConnectionId(3)]);
    }

    #[test]
    fn acquire_on_closed_connection_fails_without_release() {
        let transport = RecordingTransport::new();
        transport.close(ConnectionId(1));
        let err = RemoteConnection::acquire(transport.clone(), ConnectionId(1)).unwrap_err();
        assert!(matches!(err, TransportError::Closed(ConnectionId(1))));
        assert!(transport.released().is_empty());
    }
}
