//! Per-sender reassembly scratch for fragmented frames.
//!
//! A buffer exists only between a fragment-begin and fragment-end from the
//! same sender; reading with `clear` erases the entry entirely.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::chat::payload::UserId;

#[derive(Default)]
pub struct FrameBuffer {
    buffers: Mutex<HashMap<UserId, Vec<u8>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` to the sender's buffer, creating it if absent.
    /// `clear_first` resets the buffer before writing (fragment-begin).
    pub fn write(&self, sender: UserId, chunk: &[u8], clear_first: bool) {
        let mut buffers = self.buffers.lock().expect("frame buffer lock poisoned");
        let buffer = buffers.entry(sender).or_default();
        if clear_first {
            buffer.clear();
        }
        buffer.extend_from_slice(chunk);
    }

    /// Accumulated bytes for the sender; with `clear`, the entry is erased.
    pub fn read(&self, sender: UserId, clear: bool) -> Vec<u8> {
        let mut buffers = self.buffers.lock().expect("frame buffer lock poisoned");
        if clear {
            buffers.remove(&sender).unwrap_or_default()
        } else {
            buffers.get(&sender).cloned().unwrap_or_default()
        }
    }

    pub fn has(&self, sender: UserId) -> bool {
        self.buffers
            .lock()
            .expect("frame buffer lock poisoned")
            .contains_key(&sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_concatenate_in_arrival_order() {
        let buffer = FrameBuffer::new();
        buffer.write(10, b"A", true);
        buffer.write(10, b"B", false);
        buffer.write(10, b"C", false);
        assert_eq!(buffer.read(10, true), b"ABC");
        assert!(!buffer.has(10));
    }

    #[test]
    fn clear_first_resets_stale_content() {
        let buffer = FrameBuffer::new();
        buffer.write(10, b"stale", true);
        // a new BEGIN discards whatever an aborted sequence left behind
        buffer.write(10, b"fresh", true);
        assert_eq!(buffer.read(10, true), b"fresh");
    }

    #[test]
    fn read_without_clear_keeps_buffer() {
        let buffer = FrameBuffer::new();
        buffer.write(10, b"keep", true);
        assert_eq!(buffer.read(10, false), b"keep");
        assert!(buffer.has(10));
        assert_eq!(buffer.read(10, true), b"keep");
        assert!(!buffer.has(10));
    }

    #[test]
    fn senders_do_not_interleave() {
        let buffer = FrameBuffer::new();
        buffer.write(10, b"one", true);
        buffer.write(20, b"two", true);
        buffer.write(10, b"!", false);
        assert_eq!(buffer.read(10, true), b"one!");
        assert_eq!(buffer.read(20, true), b"two");
    }

    #[test]
    fn reading_absent_sender_yields_empty() {
        let buffer = FrameBuffer::new();
        assert_eq!(buffer.read(42, true), Vec::<u8>::new());
        assert!(!buffer.has(42));
    }
}
