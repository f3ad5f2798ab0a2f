//! File registry (C4): per-filename reader-count + writer-exclusion
//! coordination. Consulted only from the single event-loop task, so
//! acquisition can be a plain, non-blocking decision over a `RefCell` —
//! no mutex is needed (§5: "the file registry... is consulted only from
//! the loop thread and is therefore effectively serialized").

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Default)]
struct Entry {
    readers: u32,
    writer: bool,
}

#[derive(Debug, Default)]
pub struct FileRegistry {
    entries: HashMap<String, Entry>,
}

impl FileRegistry {
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::default()))
    }

    fn release_read(&mut self, filename: &str) {
        if let Some(entry) = self.entries.get_mut(filename) {
            entry.readers = entry.readers.saturating_sub(1);
            if entry.readers == 0 && !entry.writer {
                self.entries.remove(filename);
            }
        }
    }

    fn release_write(&mut self, filename: &str) {
        if let Some(entry) = self.entries.get_mut(filename) {
            entry.writer = false;
            if entry.readers == 0 {
                self.entries.remove(filename);
            }
        }
    }

    #[cfg(test)]
    fn reader_count(&self, filename: &str) -> u32 {
        self.entries.get(filename).map(|e| e.readers).unwrap_or(0)
    }

    #[cfg(test)]
    fn writer_held(&self, filename: &str) -> bool {
        self.entries.get(filename).map(|e| e.writer).unwrap_or(false)
    }
}

/// Attempt a non-blocking read acquisition. Fails if a writer currently
/// holds the filename.
pub fn acquire_read(registry: &Rc<RefCell<FileRegistry>>, filename: &str) -> Option<ReadGuard> {
    let mut reg = registry.borrow_mut();
    let entry = reg.entries.entry(filename.to_string()).or_default();
    if entry.writer {
        return None;
    }
    entry.readers += 1;
    drop(reg);
    Some(ReadGuard {
        registry: Rc::clone(registry),
        filename: filename.to_string(),
        released: false,
    })
}

/// Attempt a non-blocking write acquisition. Fails if any entry exists at
/// all for the filename (a reader or a writer already holds it).
pub fn acquire_write(registry: &Rc<RefCell<FileRegistry>>, filename: &str) -> Option<WriteGuard> {
    let mut reg = registry.borrow_mut();
    if reg.entries.contains_key(filename) {
        return None;
    }
    reg.entries.insert(
        filename.to_string(),
        Entry {
            readers: 0,
            writer: true,
        },
    );
    drop(reg);
    Some(WriteGuard {
        registry: Rc::clone(registry),
        filename: filename.to_string(),
        released: false,
    })
}

/// RAII reservation: releases the read count on drop (or earlier, via
/// `release()`), so a session's teardown path can never forget to give
/// the filename back (§5: "Destruction always releases... the
/// file-registry reservation").
pub struct ReadGuard {
    registry: Rc<RefCell<FileRegistry>>,
    filename: String,
    released: bool,
}

impl ReadGuard {
    pub fn release(mut self) {
        self.registry.borrow_mut().release_read(&self.filename);
        self.released = true;
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        if !self.released {
            self.registry.borrow_mut().release_read(&self.filename);
        }
    }
}

pub struct WriteGuard {
    registry: Rc<RefCell<FileRegistry>>,
    filename: String,
    released: bool,
}

impl WriteGuard {
    pub fn release(mut self) {
        self.registry.borrow_mut().release_write(&self.filename);
        self.released = true;
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.released {
            self.registry.borrow_mut().release_write(&self.filename);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_readers_allowed() {
        let reg = FileRegistry::new();
        let a = acquire_read(&reg, "f").unwrap();
        let b = acquire_read(&reg, "f").unwrap();
        assert_eq!(reg.borrow().reader_count("f"), 2);
        drop(a);
        assert_eq!(reg.borrow().reader_count("f"), 1);
        drop(b);
        assert_eq!(reg.borrow().reader_count("f"), 0);
        assert!(!reg.borrow().entries.contains_key("f"));
    }

    #[test]
    fn writer_excludes_readers_and_writers() {
        let reg = FileRegistry::new();
        let _w = acquire_write(&reg, "f").unwrap();
        assert!(acquire_read(&reg, "f").is_none());
        assert!(acquire_write(&reg, "f").is_none());
    }

    #[test]
    fn readers_exclude_writer() {
        let reg = FileRegistry::new();
        let _r = acquire_read(&reg, "f").unwrap();
        assert!(acquire_write(&reg, "f").is_none());
    }

    #[test]
    fn entry_garbage_collected_on_last_release() {
        let reg = FileRegistry::new();
        let w = acquire_write(&reg, "f").unwrap();
        w.release();
        assert!(!reg.borrow().entries.contains_key("f"));
        // and the filename becomes available again
        assert!(acquire_write(&reg, "f").is_some());
    }

    #[test]
    fn explicit_release_then_drop_does_not_double_release() {
        let reg = FileRegistry::new();
        let r = acquire_read(&reg, "f").unwrap();
        r.release();
        // A second acquire should see reader_count reset to 0, not -1/underflow.
        let r2 = acquire_read(&reg, "f").unwrap();
        assert_eq!(reg.borrow().reader_count("f"), 1);
        drop(r2);
    }

    #[test]
    fn writer_held_implies_zero_readers_invariant() {
        let reg = FileRegistry::new();
        let _w = acquire_write(&reg, "f").unwrap();
        assert!(reg.borrow().writer_held("f"));
        assert_eq!(reg.borrow().reader_count("f"), 0);
    }
}
