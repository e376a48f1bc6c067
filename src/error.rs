//! Error surface: the failure taxonomy, the thread-local last-error cell
//! and the installable corruption handler.
//!
//! Recoverable failures (out of memory, invalid size) make the offending
//! call return null and leave the reason in a thread-local cell. Fatal
//! failures (bad pointer, corrupted header, double free) mean the heap can
//! no longer be trusted; they are routed through an injected handler so the
//! process can choose its own diagnostic subsystem, and abort if the
//! handler returns.

use std::{
    cell::Cell,
    fmt,
    io::Write,
    process,
    sync::{Mutex, PoisonError},
};

/// Everything that can go wrong, one kind per failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused to hand out more memory, or a size computation
    /// overflowed in `allocate_zeroed`.
    OutOfMemory,
    /// Zero or overflowing size, or `allocate_aligned` parameter misuse.
    InvalidSize,
    /// A pointer passed to `deallocate`/`reallocate` that the allocator
    /// never produced: misaligned or outside every registered region.
    InvalidPointer,
    /// A header failed its integrity check: magic mismatch, impossible
    /// size, bad free flag or broken free list link.
    Corruption,
    /// `deallocate` of a block that is already free.
    DoubleFree,
}

impl AllocError {
    /// Fatal kinds terminate the process; recoverable kinds surface as null
    /// returns plus [`last_error`].
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            AllocError::InvalidPointer | AllocError::Corruption | AllocError::DoubleFree
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            AllocError::OutOfMemory => "out of memory",
            AllocError::InvalidSize => "invalid size",
            AllocError::InvalidPointer => "invalid pointer",
            AllocError::Corruption => "heap corruption detected",
            AllocError::DoubleFree => "double free detected",
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked on fatal faults with the kind, the offending address
/// and a short description. Installed process-wide. The handler may log and
/// exit cleanly; if it returns, the process is aborted.
pub type CorruptionHandler = fn(kind: AllocError, address: *const u8, message: &str);

static HANDLER: Mutex<Option<CorruptionHandler>> = Mutex::new(None);

thread_local! {
    static LAST_ERROR: Cell<Option<AllocError>> = const { Cell::new(None) };
}

/// The most recent failure observed by the calling thread, or `None` if it
/// has not failed yet.
pub fn last_error() -> Option<AllocError> {
    LAST_ERROR.with(Cell::get)
}

pub(crate) fn set_last_error(error: AllocError) {
    LAST_ERROR.with(|cell| cell.set(Some(error)));
}

/// Installs the process-wide fatal fault handler, replacing any previous
/// one.
pub fn install_corruption_handler(handler: CorruptionHandler) {
    *HANDLER.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
}

/// Reports a fatal fault and terminates. By the time this runs, arbitrary
/// memory may already be compromised, so no recovery is attempted.
pub(crate) fn report_fatal(kind: AllocError, address: *const u8, message: &str) -> ! {
    set_last_error(kind);

    log::error!("{kind}: {message} (address {address:p})");

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "[hybralloc] fatal: {kind}: {message}");
    let _ = writeln!(stderr, "  address: {address:p}");

    let handler = *HANDLER.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handler) = handler {
        handler(kind, address, message);
    }

    process::abort();
}
