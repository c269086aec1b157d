use std::sync::atomic::{AtomicU64, Ordering};

/// Generation captured when an asynchronous operation is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceToken(u64);

impl FenceToken {
    pub fn generation(self) -> u64 {
        self.0
    }
}

/// Monotonic generation counter. A result may only be applied while the token
/// it was dispatched with is still the current generation.
#[derive(Debug, Default)]
pub struct RequestFence {
    generation: AtomicU64,
}

impl RequestFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation, invalidating every earlier token.
    pub fn begin(&self) -> FenceToken {
        FenceToken(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The current generation, without superseding it. Used for additive work
    /// (appending a page) that must not invalidate the query it extends.
    pub fn current(&self) -> FenceToken {
        FenceToken(self.generation.load(Ordering::SeqCst))
    }

    pub fn is_current(&self, token: FenceToken) -> bool {
        self.generation.load(Ordering::SeqCst) == token.0
    }

    pub fn invalidate_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a fenced operation settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The result was applied to controller state.
    Applied,
    /// A newer operation superseded this one; the result was dropped.
    Discarded,
    /// The work was deferred (debounced search).
    Scheduled,
    /// Preconditions did not hold, nothing was dispatched.
    Skipped,
}
