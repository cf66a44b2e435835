//! Retained peer connection: disconnected or connected with one handle.

use std::sync::Arc;

use super::BridgeError;
use crate::transport::{ConnectionId, RemoteConnection, Transport, TransportError};

pub struct ConnectionLifecycle {
    transport: Arc<dyn Transport>,
    current: Option<RemoteConnection>,
}

impl ConnectionLifecycle {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            current: None,
        }
    }

    /// Retain `id`, releasing any handle held before.
    ///
    /// The old handle is released before the new one is acquired, so two
    /// handles are never retained at once.
    pub fn connect(&mut self, id: ConnectionId) -> Result<(), BridgeError> {
        if let Some(old) = self.current.take() {
            tracing::debug!(old = %old.id(), new = %id, "replacing retained connection");
        }
        self.current = Some(RemoteConnection::acquire(Arc::clone(&self.transport), id)?);
        Ok(())
    }

    /// Release the retained handle, if any.
    pub fn disconnect(&mut self) {
        self.current = None;
    }

    pub fn current(&self) -> Option<&RemoteConnection> {
        self.current.as_ref()
    }

    pub fn is_current(&self, id: ConnectionId) -> bool {
        self.current.as_ref().is_some_and(|c| c.id() == id)
    }

    /// The retained handle, provided it is `id`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Transport`] when `id` is not the retained connection.
    pub fn current_for(&self, id: ConnectionId) -> Result<&RemoteConnection, BridgeError> {
        self.current
            .as_ref()
            .filter(|c| c.id() == id)
            .ok_or(BridgeError::Transport(TransportError::Closed(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::RecordingTransport;

    #[test]
    fn connect_disconnect_connect_balances_references() {
        let transport = RecordingTransport::new();
        let mut lifecycle = ConnectionLifecycle::new(transport.clone());

        lifecycle.connect(ConnectionId(1)).unwrap();
        lifecycle.disconnect();
        lifecycle.connect(ConnectionId(2)).unwrap();

        assert_eq!(transport.acquired(), vec![ConnectionId(1), ConnectionId(2)]);
        assert_eq!(transport.released(), vec![ConnectionId(1)]);
        assert!(lifecycle.is_current(ConnectionId(2)));
    }

    #[test]
    fn reconnect_releases_old_handle_first() {
        let transport = RecordingTransport::new();
        let mut lifecycle = ConnectionLifecycle::new(transport.clone());

        lifecycle.connect(ConnectionId(1)).unwrap();
        lifecycle.connect(ConnectionId(2)).unwrap();

        assert_eq!(transport.released(), vec![ConnectionId(1)]);
        assert!(lifecycle.is_current(ConnectionId(2)));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let transport = RecordingTransport::new();
        let mut lifecycle = ConnectionLifecycle::new(transport.clone());

        lifecycle.disconnect();
        lifecycle.connect(ConnectionId(4)).unwrap();
        lifecycle.disconnect();
        lifecycle.disconnect();

        assert_eq!(transport.released(), vec![ConnectionId(4)]);
        assert!(lifecycle.current().is_none());
    }

    #[test]
    fn stale_id_is_rejected() {
        let transport = RecordingTransport::new();
        let mut lifecycle = ConnectionLifecycle::new(transport);
        lifecycle.connect(ConnectionId(5)).unwrap();

        assert!(lifecycle.current_for(ConnectionId(5)).is_ok());
        assert!(matches!(
            lifecycle.current_for(ConnectionId(4)),
            Err(BridgeError::Transport(_))
        ));
    }

    #[test]
    fn failed_acquire_leaves_nothing_retained() {
        let transport = RecordingTransport::new();
        transport.close(ConnectionId(9));
        let mut lifecycle = ConnectionLifecycle::new(transport.clone());

        assert!(lifecycle.connect(ConnectionId(9)).is_err());
        assert!(lifecycle.current().is_none());
        assert!(transport.released().is_empty());
    }
}
