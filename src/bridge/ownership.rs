//! Which side last claimed the clipboard, and the last host revision seen.

use crate::host::Revision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Owner {
    #[default]
    None,
    Host,
    Remote,
}

#[derive(Debug, Default)]
pub struct OwnershipTracker {
    owner: Owner,
    last_seen: Option<Revision>,
    placeholder: Option<Revision>,
}

impl OwnershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Whether `current` differs from the last revision seen.
    pub fn changed(&self, current: Revision) -> bool {
        self.last_seen != Some(current)
    }

    /// Record that the bridge is about to write once on top of `current`,
    /// so the resulting revision is not mistaken for a local change.
    pub fn expect_write(&mut self, current: Revision) {
        self.last_seen = Some(current.next());
    }

    /// A local change at `revision` was announced to the remote side.
    pub fn claim_host(&mut self, revision: Revision) {
        self.owner = Owner::Host;
        self.last_seen = Some(revision);
    }

    /// The remote side's formats were registered as deferred placeholders,
    /// producing host revision `revision`.
    pub fn claim_remote(&mut self, revision: Revision) {
        self.owner = Owner::Remote;
        self.placeholder = Some(revision);
    }

    /// Whether the host clipboard at `current` still holds the remote
    /// side's placeholders. Reading it would ask the remote for its own data.
    pub fn holds_placeholder(&self, current: Revision) -> bool {
        self.placeholder == Some(current)
    }

    /// Forget a remote claim. Returns whether there was one.
    pub fn clear_remote(&mut self) -> bool {
        if self.owner == Owner::Remote {
            self.owner = Owner::None;
            true
        } else {
            false
        }
    }
}
