//! Bridge controller: the state owned by the bridge actor.
//!
//! Every method here runs on the actor task. Inbound remote events reach it
//! as commands from the transport task; outbound host events come from the
//! poll timer and from [`RemoteFetcher`] on the host's paste thread.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::format::{to_native, to_remote};
use super::lifecycle::ConnectionLifecycle;
use super::ownership::OwnershipTracker;
use super::pending::PendingSlot;
use super::timer::PollTimer;
use super::{BridgeCommand, BridgeError};
use crate::host::{DataProvider, HostClipboard, NativeFormat};
use crate::proto::{FormatId, Selection};
use crate::transport::{ConnectionId, Transport};

pub struct Controller {
    host: Arc<dyn HostClipboard>,
    lifecycle: ConnectionLifecycle,
    ownership: OwnershipTracker,
    timer: PollTimer,
    pending: Arc<PendingSlot>,
    provider: Arc<dyn DataProvider>,
}

impl Controller {
    pub fn new(
        host: Arc<dyn HostClipboard>,
        transport: Arc<dyn Transport>,
        pending: Arc<PendingSlot>,
        provider: Arc<dyn DataProvider>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            host,
            lifecycle: ConnectionLifecycle::new(transport),
            ownership: OwnershipTracker::new(),
            timer: PollTimer::new(poll_interval),
            pending,
            provider,
        }
    }

    /// Wait for the next poll tick. Never resolves while no peer is connected.
    pub async fn tick(&mut self) {
        self.timer.tick().await;
    }

    /// The remote side wants the host clipboard in `format`.
    pub fn on_remote_request(
        &mut self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
    ) -> Result<(), BridgeError> {
        check_selection(selection)?;
        let native = to_native(format).ok_or(BridgeError::UnsupportedFormat)?;

        if self.ownership.holds_placeholder(self.host.revision()) {
            return Err(BridgeError::DataNotAvailable);
        }

        let data = self.host.read(&native).map_err(|e| {
            tracing::debug!(error = %e, "host clipboard read failed");
            BridgeError::DataNotAvailable
        })?;

        self.lifecycle
            .current_for(conn)?
            .send_data(selection, format, &data)?;
        tracing::debug!(%format, size = data.len(), "sent clipboard data");
        Ok(())
    }

    /// The remote side took the clipboard; offer its formats on the host.
    pub fn on_remote_grab(
        &mut self,
        conn: ConnectionId,
        selection: Selection,
        formats: &[FormatId],
    ) -> Result<(), BridgeError> {
        check_selection(selection)?;

        let mut natives: Vec<NativeFormat> = Vec::new();
        for native in formats.iter().copied().filter_map(to_native) {
            if !natives.contains(&native) {
                natives.push(native);
            }
        }
        if natives.is_empty() {
            return Err(BridgeError::UnsupportedFormat);
        }

        let current = self.host.revision();
        self.ownership.expect_write(current);
        self.host
            .provide_deferred(&natives, Arc::clone(&self.provider))
            .map_err(BridgeError::FailedToWrite)?;
        self.ownership.claim_remote(current.next());

        tracing::info!(conn = %conn, formats = natives.len(), "remote side grabbed the clipboard");
        Ok(())
    }

    /// Data arrived with no request outstanding: write it straight through.
    pub fn on_remote_data(
        &mut self,
        conn: ConnectionId,
        selection: Selection,
        format: FormatId,
        data: &[u8],
    ) -> Result<(), BridgeError> {
        check_selection(selection)?;
        let native = to_native(format).ok_or(BridgeError::UnsupportedFormat)?;

        self.ownership.expect_write(self.host.revision());
        self.host
            .write(&native, data)
            .map_err(BridgeError::FailedToWrite)?;
        self.ownership.clear_remote();

        tracing::debug!(conn = %conn, %format, size = data.len(), "wrote unsolicited clipboard data");
        Ok(())
    }

    pub fn on_remote_release(
        &mut self,
        conn: ConnectionId,
        selection: Selection,
    ) -> Result<(), BridgeError> {
        check_selection(selection)?;
        if self.ownership.clear_remote() {
            tracing::info!(conn = %conn, "remote side released the clipboard");
        } else {
            tracing::debug!(conn = %conn, "release without a remote claim");
        }
        Ok(())
    }

    pub fn on_client_disconnected(&mut self, conn: ConnectionId) {
        tracing::info!(conn = %conn, "remote client disconnected");
        self.ownership.clear_remote();
    }

    pub fn on_peer_connected(&mut self, conn: ConnectionId) {
        match self.lifecycle.connect(conn) {
            Ok(()) => {
                self.timer.arm();
                tracing::debug!(conn = %conn, "peer connected, polling host clipboard");
            }
            Err(e) => tracing::warn!(conn = %conn, error = %e, "could not retain connection"),
        }
    }

    pub fn on_peer_disconnected(&mut self, conn: ConnectionId) {
        if !self.lifecycle.is_current(conn) {
            tracing::debug!(conn = %conn, "ignoring disconnect of stale connection");
            return;
        }
        self.timer.disarm();
        self.lifecycle.disconnect();
        tracing::debug!(conn = %conn, "peer disconnected");
    }

    /// Send the request for an outstanding fetch, failing it if that's
    /// not possible.
    pub fn send_remote_request(&mut self, format: FormatId) {
        let result = match self.lifecycle.current() {
            Some(conn) => conn
                .send_request(Selection::Clipboard, format)
                .map_err(BridgeError::from),
            None => Err(BridgeError::NotConnected),
        };
        if let Err(e) = result {
            tracing::warn!(%format, error = %e, "could not request clipboard data");
            self.pending.fail(format);
        }
    }

    /// Announce a local clipboard change to the remote side.
    pub fn poll_local_clipboard(&mut self) {
        let current = self.host.revision();
        if !self.ownership.changed(current) {
            return;
        }
        let Some(conn) = self.lifecycle.current() else {
            return;
        };

        let natives = match self.host.available_formats() {
            Ok(natives) => natives,
            Err(e) => {
                tracing::warn!(error = %e, "could not list host clipboard formats");
                return;
            }
        };

        let mut formats: Vec<FormatId> = Vec::new();
        for format in natives.iter().filter_map(to_remote) {
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        if formats.is_empty() {
            tracing::debug!(revision = %current, "host clipboard has nothing to offer");
            return;
        }

        // Recorded even if the send fails, so a dead connection is not
        // re-enumerated on every tick until its disconnect is processed.
        self.ownership.claim_host(current);
        match conn.send_grab(Selection::Clipboard, &formats) {
            Ok(()) => {
                tracing::info!(revision = %current, formats = formats.len(), "grabbed remote clipboard");
            }
            Err(e) => tracing::warn!(revision = %current, error = %e, "could not announce host clipboard"),
        }
    }

    #[cfg(test)]
    fn timer_armed(&self) -> bool {
        self.timer.is_armed()
    }
}

pub(super) fn check_selection(selection: Selection) -> Result<(), BridgeError> {
    match selection {
        Selection::Clipboard => Ok(()),
        other => Err(BridgeError::UnsupportedSelection(other)),
    }
}

/// Deferred data provider handed to the host for remote-owned content.
///
/// Runs on the host's paste thread: claims the pending slot, asks the actor
/// to send the request, and blocks until the reply arrives or times out.
pub struct RemoteFetcher {
    pending: Arc<PendingSlot>,
    commands: mpsc::UnboundedSender<BridgeCommand>,
}

impl RemoteFetcher {
    pub fn new(pending: Arc<PendingSlot>, commands: mpsc::UnboundedSender<BridgeCommand>) -> Self {
        Self { pending, commands }
    }

    pub fn request_remote_format(&self, format: FormatId) -> Result<Vec<u8>, BridgeError> {
        let ticket = self.pending.begin(format)?;
        self.commands
            .send(BridgeCommand::SendRequest(format))
            .map_err(|_| BridgeError::Fatal("bridge actor stopped".into()))?;
        ticket.wait()
    }
}

impl DataProvider for RemoteFetcher {
    fn provide(&self, format: &NativeFormat) -> Option<Vec<u8>> {
        let remote = to_remote(format)?;
        match self.request_remote_format(remote) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::warn!(%format, error = %e, "paste of remote clipboard failed");
                None
            }
        }
    }
}
