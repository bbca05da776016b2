//! Fakes shared by the unit tests

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::logger::Logger;
use crate::platform::{LoadEvent, LoadHandler, Loader, ObserverError};

/// Severity of a recorded line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Logger keeping every line in memory
#[derive(Debug, Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<(Level, String)>>,
}

impl RecordingLogger {
    fn contains(&self, level: Level, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(l, line)| *l == level && line.contains(needle))
    }

    pub fn contains_info(&self, needle: &str) -> bool {
        self.contains(Level::Info, needle)
    }

    pub fn contains_warn(&self, needle: &str) -> bool {
        self.contains(Level::Warn, needle)
    }

    pub fn contains_error(&self, needle: &str) -> bool {
        self.contains(Level::Error, needle)
    }

    fn push(&self, level: Level, message: &str) {
        self.lines.lock().unwrap().push((level, message.to_owned()));
    }
}

impl Logger for RecordingLogger {
    fn info(&self, message: &str) {
        self.push(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(Level::Error, message);
    }
}

/// A minimal PE image laid out in a heap buffer
///
/// The DOS header points at NT headers at [`PeImage::NT_OFFSET`], followed by a zeroed optional header and the section table.
pub struct PeImage {
    data: Vec<u8>,
}

impl PeImage {
    /// Value of `e_lfanew`
    pub const NT_OFFSET: usize = 0x40;
    /// Size of the backing buffer
    const SIZE: usize = 0x4000;
    /// Size of a PE32+ optional header
    const OPTIONAL_HEADER_SIZE: u16 = 0xf0;

    /// Builds an image with `(virtual_address, pointer_to_raw_data, size_of_raw_data)` sections
    pub fn new(sections: &[(u32, u32, u32)]) -> Self {
        let mut data = vec![0u8; Self::SIZE];
        data[..2].copy_from_slice(b"MZ");
        data[0x3c..0x40].copy_from_slice(&(Self::NT_OFFSET as u32).to_le_bytes());

        let nt = Self::NT_OFFSET;
        data[nt..nt + 4].copy_from_slice(b"PE\0\0");
        let file_header = nt + 4;
        data[file_header + 2..file_header + 4]
            .copy_from_slice(&(sections.len() as u16).to_le_bytes());
        data[file_header + 16..file_header + 18]
            .copy_from_slice(&Self::OPTIONAL_HEADER_SIZE.to_le_bytes());

        let table = file_header + 20 + Self::OPTIONAL_HEADER_SIZE as usize;
        for (i, &(virtual_address, raw_pointer, raw_size)) in sections.iter().enumerate() {
            let header = table + i * 40;
            data[header..header + 8].copy_from_slice(b".sect\0\0\0");
            data[header + 8..header + 12].copy_from_slice(&raw_size.to_le_bytes());
            data[header + 12..header + 16].copy_from_slice(&virtual_address.to_le_bytes());
            data[header + 16..header + 20].copy_from_slice(&raw_size.to_le_bytes());
            data[header + 20..header + 24].copy_from_slice(&raw_pointer.to_le_bytes());
        }

        Self { data }
    }

    pub fn base(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Handlers registered with a [`FakeLoader`], keyed by subscription id
type Handlers = Arc<Mutex<Vec<(u64, LoadHandler)>>>;

/// In-memory [`Loader`] whose load events are fired by hand
#[derive(Default)]
pub struct FakeLoader {
    host: Option<usize>,
    images: Mutex<HashMap<String, usize>>,
    handlers: Handlers,
    next_id: AtomicU64,
    subscribe_calls: AtomicUsize,
    refuse: AtomicBool,
    late: Mutex<Option<(String, usize)>>,
}

impl FakeLoader {
    pub fn with_host(base: *mut u8) -> Self {
        Self {
            host: Some(base as usize),
            ..Self::default()
        }
    }

    /// Makes subscriptions fail with a registration error
    pub fn refuse_subscriptions(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Maps an image, without an event, during the next `subscribe` before the handler is registered
    pub fn map_during_subscribe(&self, name: &str, base: *mut u8) {
        *self.late.lock().unwrap() = Some((name.to_owned(), base as usize));
    }

    /// Registers an image as already mapped, without an event
    pub fn map(&self, name: &str, base: *mut u8) {
        self.images
            .lock()
            .unwrap()
            .insert(name.to_owned(), base as usize);
    }

    /// Maps an image and fires the load event to every current handler
    pub fn load(&self, name: &str, base: *mut u8) {
        self.map(name, base);
        let handlers = self
            .handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect::<Vec<_>>();
        let event = LoadEvent { name, base };
        for handler in handlers {
            handler(&event);
        }
    }

    /// How often `subscribe` has been called
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Handlers currently registered
    pub fn listeners(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }
}

/// Removes its handler from the [`FakeLoader`] when dropped
pub struct FakeSubscription {
    id: u64,
    handlers: Handlers,
}

impl Drop for FakeSubscription {
    fn drop(&mut self) {
        self.handlers.lock().unwrap().retain(|(id, _)| *id != self.id);
    }
}

impl Loader for FakeLoader {
    type Subscription = FakeSubscription;

    fn host_image(&self) -> Option<NonNull<u8>> {
        self.host.and_then(|base| NonNull::new(base as *mut u8))
    }

    fn find_image(&self, name: &str) -> Option<NonNull<u8>> {
        let base = *self.images.lock().unwrap().get(name)?;
        NonNull::new(base as *mut u8)
    }

    fn subscribe(&self, handler: LoadHandler) -> Result<Self::Subscription, ObserverError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ObserverError::Register(-1));
        }
        if let Some((name, base)) = self.late.lock().unwrap().take() {
            self.images.lock().unwrap().insert(name, base);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().push((id, handler));
        Ok(FakeSubscription {
            id,
            handlers: self.handlers.clone(),
        })
    }
}
