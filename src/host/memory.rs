//! In-process clipboard for tests.
//!
//! Behaves like a native pasteboard with a change counter: every write
//! or placeholder registration replaces all content and bumps the
//! revision by one. Deferred entries call their provider on the reading
//! thread, outside the internal lock.

use std::sync::{Arc, Mutex, PoisonError};

use super::{DataProvider, HostClipboard, HostError, NativeFormat, Revision};

enum Entry {
    Data(Vec<u8>),
    Deferred(Arc<dyn DataProvider>),
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    entries: Vec<(NativeFormat, Entry)>,
}

#[derive(Default)]
pub struct MemoryClipboard {
    inner: Mutex<Inner>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a local application copying `data`.
    pub fn copy(&self, format: NativeFormat, data: &[u8]) {
        let mut inner = self.lock();
        inner.revision = inner.revision.next();
        inner.entries = vec![(format, Entry::Data(data.to_vec()))];
    }

    /// Simulate a local application adding another representation to the
    /// current content without replacing it.
    pub fn copy_also(&self, format: NativeFormat, data: &[u8]) {
        let mut inner = self.lock();
        inner.entries.push((format, Entry::Data(data.to_vec())));
    }

    /// Simulate a local paste.
    pub fn paste(&self, format: &NativeFormat) -> Option<Vec<u8>> {
        self.read(format).ok()
    }

    /// Whether `format` is currently a deferred placeholder.
    pub fn is_deferred(&self, format: &NativeFormat) -> bool {
        self.lock()
            .entries
            .iter()
            .any(|(f, e)| f == format && matches!(e, Entry::Deferred(_)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HostClipboard for MemoryClipboard {
    fn revision(&self) -> Revision {
        self.lock().revision
    }

    fn available_formats(&self) -> Result<Vec<NativeFormat>, HostError> {
        Ok(self.lock().entries.iter().map(|(f, _)| f.clone()).collect())
    }

    fn read(&self, format: &NativeFormat) -> Result<Vec<u8>, HostError> {
        let provider = {
            let inner = self.lock();
            match inner.entries.iter().find(|(f, _)| f == format) {
                Some((_, Entry::Data(data))) => return Ok(data.clone()),
                Some((_, Entry::Deferred(provider))) => Arc::clone(provider),
                None => return Err(HostError::NotAvailable(format.clone())),
            }
        };
        provider
            .provide(format)
            .ok_or_else(|| HostError::NotAvailable(format.clone()))
    }

    fn write(&self, format: &NativeFormat, data: &[u8]) -> Result<(), HostError> {
        self.copy(format.clone(), data);
        Ok(())
    }

    fn provide_deferred(
        &self,
        formats: &[NativeFormat],
        provider: Arc<dyn DataProvider>,
    ) -> Result<(), HostError> {
        let mut inner = self.lock();
        inner.revision = inner.revision.next();
        inner.entries = formats
            .iter()
            .map(|f| (f.clone(), Entry::Deferred(Arc::clone(&provider))))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<u8>);

    impl DataProvider for Fixed {
        fn provide(&self, _format: &NativeFormat) -> Option<Vec<u8>> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn copy_bumps_revision_once() {
        let clip = MemoryClipboard::new();
        let before = clip.revision();
        clip.copy(NativeFormat::PLAIN_TEXT, b"a");
        assert_eq!(clip.revision(), before.next());
    }

    #[test]
    fn deferred_entry_calls_provider_on_read() {
        let clip = MemoryClipboard::new();
        clip.provide_deferred(&[NativeFormat::PNG], Arc::new(Fixed(b"png".to_vec())))
            .unwrap();
        assert!(clip.is_deferred(&NativeFormat::PNG));
        assert_eq!(clip.read(&NativeFormat::PNG).unwrap(), b"png");
    }

    #[test]
    fn missing_format_is_not_available() {
        let clip = MemoryClipboard::new();
        clip.copy(NativeFormat::PLAIN_TEXT, b"a");
        assert!(matches!(
            clip.read(&NativeFormat::TIFF),
            Err(HostError::NotAvailable(_))
        ));
    }
}
