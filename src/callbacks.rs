//! Typed user callbacks.
//!
//! Every callback is a boxed closure owned by the command (or, for option
//! callbacks, by the handle) from enqueue until the command retires. The
//! closure's destructor is its release hook: it runs exactly once, at
//! retirement, at abort, or when the handle is dropped with the command
//! still live.

/// Status delivered with each chunk of a structured read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// The chunk carries data read from the export.
    ReadData,
    /// The chunk describes a hole; the corresponding buffer region has been
    /// zero-filled.
    ReadHole,
    /// The server reported an error for this range; the slice is empty.
    ReadError,
}

/// Invoked when a command completes, before retirement. Receives the
/// command's buffer (which it may take) and a mutable error slot; writing a
/// non-zero value fails the command if it had not already failed. Returning
/// a positive value retires the command immediately.
pub type CompletionCallback = Box<dyn FnMut(&mut Vec<u8>, &mut i32) -> i32 + Send>;

/// Invoked once per chunk of a structured read with the chunk's bytes, its
/// absolute offset, and its status. Returning a negative value aborts
/// further chunk delivery for the command and records a protocol error
/// unless the server already reported one.
pub type ChunkCallback = Box<dyn FnMut(&[u8], u64, ChunkStatus, &mut i32) -> i32 + Send>;

/// Invoked once per metadata context in a block-status reply with the
/// context name, the base offset of the request, and `(length, status)`
/// extent pairs. Negative return behaves as for [`ChunkCallback`].
pub type ExtentCallback = Box<dyn FnMut(&str, u64, &[(u32, u32)], &mut i32) -> i32 + Send>;

/// Invoked once per export during option-mode LIST with name and
/// description.
pub type ListCallback = Box<dyn FnMut(&str, &str) + Send>;

/// Invoked once per metadata context name during option-mode meta-context
/// negotiation.
pub type ContextCallback = Box<dyn FnMut(&str) + Send>;

/// Receives engine debug messages (handle name, message) when debugging is
/// enabled; replaces the default `log` output.
pub type DebugCallback = Box<dyn FnMut(&str, &str) + Send>;

/// Callbacks attached to an option-mode negotiation in progress.
#[derive(Default)]
pub(crate) struct OptionCallbacks {
    pub completion: Option<CompletionCallback>,
    pub list: Option<ListCallback>,
    pub context: Option<ContextCallback>,
}

impl OptionCallbacks {
    /// Deliver the option completion exactly once.
    pub fn complete(&mut self, err: i32) {
        if let Some(mut cb) = self.completion.take() {
            let mut slot = err;
            let mut empty = Vec::new();
            cb(&mut empty, &mut slot);
        }
        self.list = None;
        self.context = None;
    }
}
