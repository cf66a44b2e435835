//! X11 clipboard adapter: owns `CLIPBOARD` through a hidden window.
//!
//! Writes and deferred placeholders make the hidden window the selection
//! owner; `SelectionRequest` events are answered on a dedicated event
//! thread, which is also where deferred providers run. Foreign content is
//! read with `ConvertSelection` into a property on the hidden window.
//!
//! The revision counter advances on every write made through this adapter
//! and on every XFixes owner-change notification naming another client, so
//! it behaves like a pasteboard change count. Only `SelectionClear` drops
//! the owned content, and neither event counts once the hidden window has
//! taken the selection back.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::Event;
use x11rb::protocol::xfixes::{ConnectionExt as _, SelectionEventMask};
use x11rb::protocol::xproto::{
    Atom, AtomEnum, ConnectionExt as _, CreateWindowAux, EventMask, PropMode,
    SELECTION_NOTIFY_EVENT, SelectionNotifyEvent, SelectionRequestEvent, Window, WindowClass,
};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, CURRENT_TIME, NONE};

use super::{DataProvider, HostClipboard, HostError, NativeFormat, Revision};

/// How long a foreign selection owner gets to answer a conversion.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Event thread poll timeout; also bounds the stop-flag latency.
const EVENT_POLL_MS: u16 = 100;

/// Property on the hidden window that receives converted selections.
const TRANSFER_PROPERTY: &[u8] = b"CLIPBRIDGE_SELECTION";

struct Atoms {
    clipboard: Atom,
    targets: Atom,
    incr: Atom,
    transfer: Atom,
}

/// What the hidden window currently offers.
struct Owned {
    revision: u64,
    formats: Vec<NativeFormat>,
    source: Source,
    realized: HashMap<NativeFormat, Vec<u8>>,
}

enum Source {
    Data(Vec<u8>),
    Deferred(Arc<dyn DataProvider>),
}

/// State shared between API callers and the event thread.
struct Shared {
    conn: RustConnection,
    window: Window,
    atoms: Atoms,
    revision: AtomicU64,
    owned: Mutex<Option<Owned>>,
    atom_names: Mutex<HashMap<Atom, NativeFormat>>,
}

/// X11 implementation of [`HostClipboard`].
pub struct X11Clipboard {
    shared: Arc<Shared>,
    /// `SelectionNotify` events for conversions we asked for. Holding the
    /// lock serializes reads.
    notify_rx: Mutex<Receiver<SelectionNotifyEvent>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl X11Clipboard {
    /// Connect to the X11 display, create the hidden owner window and
    /// start the event thread.
    pub fn connect() -> Result<Self, HostError> {
        let (conn, screen_num) = RustConnection::connect(None).map_err(x11("X11 connect failed"))?;
        let root = conn.setup().roots[screen_num].root;

        let window = conn.generate_id().map_err(x11("generate_id"))?;
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            root,
            0,
            0,
            1,
            1,
            0,
            WindowClass::INPUT_OUTPUT,
            COPY_FROM_PARENT,
            &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
        )
        .map_err(x11("create_window"))?
        .check()
        .map_err(x11("create_window"))?;

        let atoms = Atoms {
            clipboard: intern(&conn, b"CLIPBOARD")?,
            targets: intern(&conn, b"TARGETS")?,
            incr: intern(&conn, b"INCR")?,
            transfer: intern(&conn, TRANSFER_PROPERTY)?,
        };

        let version = conn
            .xfixes_query_version(5, 0)
            .map_err(x11("xfixes_query_version"))?
            .reply()
            .map_err(x11("XFixes unavailable"))?;
        conn.xfixes_select_selection_input(
            window,
            atoms.clipboard,
            SelectionEventMask::SET_SELECTION_OWNER
                | SelectionEventMask::SELECTION_WINDOW_DESTROY
                | SelectionEventMask::SELECTION_CLIENT_CLOSE,
        )
        .map_err(x11("xfixes_select_selection_input"))?;
        conn.flush().map_err(x11("flush"))?;

        tracing::debug!(
            window,
            xfixes = format_args!("{}.{}", version.major_version, version.minor_version),
            "X11 clipboard ready"
        );

        let shared = Arc::new(Shared {
            conn,
            window,
            atoms,
            revision: AtomicU64::new(0),
            owned: Mutex::new(None),
            atom_names: Mutex::new(HashMap::new()),
        });

        let (notify_tx, notify_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn_event_thread(Arc::clone(&shared), notify_tx, Arc::clone(&stop));

        Ok(Self {
            shared,
            notify_rx: Mutex::new(notify_rx),
            stop,
            thread: Some(thread),
        })
    }

    /// Convert the clipboard to `target` and fetch the result.
    ///
    /// Returns `Ok(None)` when the owner refused (or there is no owner).
    fn convert(&self, target: Atom) -> Result<Option<Vec<u8>>, HostError> {
        let shared = &self.shared;
        let rx = self.notify_rx.lock().unwrap_or_else(PoisonError::into_inner);
        while rx.try_recv().is_ok() {}

        shared
            .conn
            .convert_selection(
                shared.window,
                shared.atoms.clipboard,
                target,
                shared.atoms.transfer,
                CURRENT_TIME,
            )
            .map_err(x11("convert_selection"))?;
        shared.conn.flush().map_err(x11("flush"))?;

        let deadline = Instant::now() + READ_TIMEOUT;
        let notify = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(ev) if ev.target == target => break ev,
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(HostError::Backend(
                        "selection owner did not answer".into(),
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(HostError::Backend("X11 event thread stopped".into()));
                }
            }
        };

        if notify.property == NONE {
            return Ok(None);
        }

        let reply = shared
            .conn
            .get_property(
                true,
                shared.window,
                shared.atoms.transfer,
                AtomEnum::ANY,
                0,
                u32::MAX,
            )
            .map_err(x11("get_property"))?
            .reply()
            .map_err(x11("get_property reply"))?;

        if reply.type_ == shared.atoms.incr {
            return Err(HostError::Backend(
                "incremental (INCR) transfers are not supported".into(),
            ));
        }
        Ok(Some(reply.value))
    }

    fn owns_selection(&self) -> bool {
        self.shared.lock_owned().is_some()
    }

    /// Install `owned` and make the hidden window the selection owner.
    fn take_ownership(&self, formats: Vec<NativeFormat>, source: Source) -> Result<(), HostError> {
        let shared = &self.shared;
        let revision = shared.revision.fetch_add(1, Ordering::SeqCst) + 1;
        *shared.lock_owned() = Some(Owned {
            revision,
            formats,
            source,
            realized: HashMap::new(),
        });

        shared
            .conn
            .set_selection_owner(shared.window, shared.atoms.clipboard, CURRENT_TIME)
            .map_err(x11("set_selection_owner"))?;
        if shared.current_owner()? != shared.window {
            *shared.lock_owned() = None;
            return Err(HostError::Backend(
                "another client kept the CLIPBOARD selection".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for X11Clipboard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take()
            && let Err(e) = thread.join()
        {
            tracing::warn!("X11 clipboard thread panicked: {e:?}");
        }
    }
}

impl HostClipboard for X11Clipboard {
    fn revision(&self) -> Revision {
        Revision(self.shared.revision.load(Ordering::SeqCst))
    }

    fn available_formats(&self) -> Result<Vec<NativeFormat>, HostError> {
        if let Some(owned) = self.shared.lock_owned().as_ref() {
            return Ok(owned.formats.clone());
        }

        let Some(raw) = self.convert(self.shared.atoms.targets)? else {
            return Ok(Vec::new());
        };

        let mut formats = Vec::new();
        for atom in parse_atom_list(&raw) {
            let format = self.shared.format_for_atom(atom)?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        Ok(formats)
    }

    fn read(&self, format: &NativeFormat) -> Result<Vec<u8>, HostError> {
        if self.owns_selection() {
            return self
                .shared
                .realize(format)
                .ok_or_else(|| HostError::NotAvailable(format.clone()));
        }

        let target = intern(&self.shared.conn, target_names(format)[0].as_bytes())?;
        self.convert(target)?
            .ok_or_else(|| HostError::NotAvailable(format.clone()))
    }

    fn write(&self, format: &NativeFormat, data: &[u8]) -> Result<(), HostError> {
        self.take_ownership(vec![format.clone()], Source::Data(data.to_vec()))
    }

    fn provide_deferred(
        &self,
        formats: &[NativeFormat],
        provider: Arc<dyn DataProvider>,
    ) -> Result<(), HostError> {
        self.take_ownership(formats.to_vec(), Source::Deferred(provider))
    }
}

impl Shared {
    fn lock_owned(&self) -> MutexGuard<'_, Option<Owned>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Produce the bytes we offer for `format`, running a deferred
    /// provider outside the lock if needed.
    fn realize(&self, format: &NativeFormat) -> Option<Vec<u8>> {
        let (revision, provider) = {
            let guard = self.lock_owned();
            let owned = guard.as_ref()?;
            if !owned.formats.contains(format) {
                return None;
            }
            if let Some(data) = owned.realized.get(format) {
                return Some(data.clone());
            }
            match &owned.source {
                Source::Data(data) => return Some(data.clone()),
                Source::Deferred(provider) => (owned.revision, Arc::clone(provider)),
            }
        };

        let data = provider.provide(format)?;

        if let Some(owned) = self.lock_owned().as_mut()
            && owned.revision == revision
        {
            owned.realized.insert(format.clone(), data.clone());
        }
        Some(data)
    }

    fn format_for_atom(&self, atom: Atom) -> Result<NativeFormat, HostError> {
        if let Some(format) = self
            .atom_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&atom)
        {
            return Ok(format.clone());
        }

        let name = self
            .conn
            .get_atom_name(atom)
            .map_err(x11("get_atom_name"))?
            .reply()
            .map_err(x11("get_atom_name reply"))?
            .name;
        let format = native_for_target(&String::from_utf8_lossy(&name));
        self.atom_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(atom, format.clone());
        Ok(format)
    }

    fn current_owner(&self) -> Result<Window, HostError> {
        Ok(self
            .conn
            .get_selection_owner(self.atoms.clipboard)
            .map_err(x11("get_selection_owner"))?
            .reply()
            .map_err(x11("get_selection_owner reply"))?
            .owner)
    }

    /// The current `CLIPBOARD` owner, or `fallback` if the query fails.
    fn owner_or(&self, fallback: Window) -> Window {
        self.current_owner().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not query CLIPBOARD owner");
            fallback
        })
    }

    fn handle_event(&self, event: Event, notify_tx: &Sender<SelectionNotifyEvent>) {
        match event {
            Event::SelectionRequest(req) => {
                if let Err(e) = self.answer_request(req) {
                    tracing::warn!(error = %e, "failed to answer selection request");
                }
            }
            Event::SelectionNotify(ev) if ev.requestor == self.window => {
                let _ = notify_tx.send(ev);
            }
            Event::SelectionClear(ev) if ev.selection == self.atoms.clipboard => {
                // Queued before a later take_ownership won the selection back.
                if self.owner_or(ev.owner) == self.window {
                    tracing::debug!("ignoring superseded CLIPBOARD clear");
                    return;
                }
                tracing::debug!("lost CLIPBOARD ownership");
                *self.lock_owned() = None;
            }
            Event::XfixesSelectionNotify(ev) if ev.selection == self.atoms.clipboard => {
                let current = self.owner_or(ev.owner);
                match classify_owner_change(ev.owner, current, self.window) {
                    OwnerChange::Ours => {}
                    OwnerChange::Superseded => {
                        tracing::debug!(owner = ev.owner, "ignoring superseded owner change");
                    }
                    OwnerChange::Foreign => {
                        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
                        tracing::debug!(owner = ev.owner, revision, "CLIPBOARD owner changed");
                    }
                }
            }
            _ => {}
        }
    }

    fn answer_request(&self, req: SelectionRequestEvent) -> Result<(), HostError> {
        // Obsolete clients pass NONE and expect the target as property.
        let property = if req.property == NONE {
            req.target
        } else {
            req.property
        };

        let answered = if req.selection != self.atoms.clipboard {
            false
        } else if req.target == self.atoms.targets {
            self.send_targets(req.requestor, property)?
        } else {
            self.send_data(req.requestor, property, req.target)?
        };

        let notify = SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: req.time,
            requestor: req.requestor,
            selection: req.selection,
            target: req.target,
            property: if answered { property } else { NONE },
        };
        self.conn
            .send_event(false, req.requestor, EventMask::NO_EVENT, notify)
            .map_err(x11("send_event"))?;
        self.conn.flush().map_err(x11("flush"))?;
        Ok(())
    }

    fn send_targets(&self, requestor: Window, property: Atom) -> Result<bool, HostError> {
        let formats = match self.lock_owned().as_ref() {
            Some(owned) => owned.formats.clone(),
            None => return Ok(false),
        };

        let mut atoms = vec![self.atoms.targets];
        for format in &formats {
            for name in target_names(format) {
                atoms.push(intern(&self.conn, name.as_bytes())?);
            }
        }
        self.conn
            .change_property32(PropMode::REPLACE, requestor, property, AtomEnum::ATOM, &atoms)
            .map_err(x11("change_property"))?;
        Ok(true)
    }

    fn send_data(&self, requestor: Window, property: Atom, target: Atom) -> Result<bool, HostError> {
        let format = self.format_for_atom(target)?;
        let Some(data) = self.realize(&format) else {
            tracing::debug!(%format, "nothing to offer for requested target");
            return Ok(false);
        };

        // Leave room for the ChangeProperty request header.
        let limit = self.conn.maximum_request_bytes().saturating_sub(64);
        if data.len() > limit {
            tracing::warn!(
                %format,
                size = data.len(),
                limit,
                "clipboard data exceeds a single request; INCR is not supported"
            );
            return Ok(false);
        }

        self.conn
            .change_property8(PropMode::REPLACE, requestor, property, target, &data)
            .map_err(x11("change_property"))?;
        Ok(true)
    }
}

/// Spawn the thread that drains X11 events.
///
/// Polls the connection fd with a short timeout and drains queued events
/// on every wakeup, since replies read by other threads can leave events
/// buffered without the fd becoming readable.
fn spawn_event_thread(
    shared: Arc<Shared>,
    notify_tx: Sender<SelectionNotifyEvent>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("x11-clipboard".into())
        .spawn(move || {
            let raw_fd = shared.conn.stream().as_raw_fd();

            while !stop.load(Ordering::Relaxed) {
                // SAFETY: raw_fd is the X11 connection fd, valid while `shared` is alive.
                let borrowed = unsafe { BorrowedFd::borrow_raw(raw_fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];

                match poll(&mut fds, PollTimeout::from(EVENT_POLL_MS)) {
                    Ok(_) => {}
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "poll error on X11 fd");
                        return;
                    }
                }

                loop {
                    match shared.conn.poll_for_event() {
                        Ok(Some(event)) => shared.handle_event(event, &notify_tx),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(error = %e, "X11 connection error");
                            return;
                        }
                    }
                }
            }
        })
        .expect("failed to spawn x11 clipboard thread")
}

fn intern(conn: &RustConnection, name: &[u8]) -> Result<Atom, HostError> {
    Ok(conn
        .intern_atom(false, name)
        .map_err(x11("intern_atom"))?
        .reply()
        .map_err(x11("intern_atom reply"))?
        .atom)
}

fn x11<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> HostError {
    move |e| HostError::Backend(format!("{context}: {e}"))
}

/// Normalize an X11 target name to a native format identifier.
fn native_for_target(name: &str) -> NativeFormat {
    match name {
        "UTF8_STRING" | "text/plain;charset=utf-8" | "text/plain;charset=UTF-8" => {
            NativeFormat::PLAIN_TEXT
        }
        other => NativeFormat::named(other),
    }
}

/// Target names advertised for a native format, preferred first.
fn target_names(format: &NativeFormat) -> Vec<&str> {
    if *format == NativeFormat::PLAIN_TEXT {
        vec!["UTF8_STRING", "text/plain;charset=utf-8"]
    } else {
        vec![format.as_str()]
    }
}

/// Decode a 32-bit ATOM property value.
fn parse_atom_list(raw: &[u8]) -> impl Iterator<Item = Atom> + '_ {
    raw.chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
}

/// How an XFixes owner-change notification relates to the hidden window.
#[derive(Debug, PartialEq, Eq)]
enum OwnerChange {
    /// Our own `SetSelectionOwner`.
    Ours,
    /// Another client took the selection, but the hidden window has since
    /// taken it back. The event was queued before that.
    Superseded,
    /// Another client holds the selection now.
    Foreign,
}

fn classify_owner_change(notified: Window, current: Window, ours: Window) -> OwnerChange {
    if notified == ours {
        OwnerChange::Ours
    } else if current == ours {
        OwnerChange::Superseded
    } else {
        OwnerChange::Foreign
    }
}
