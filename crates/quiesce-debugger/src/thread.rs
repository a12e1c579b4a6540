use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_THREAD_ID: ThreadId = ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
}

/// Identity of an OS thread, unique for the whole lifetime of the process.
///
/// Identities are never reused, even after the thread exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Returns the identity of the calling thread.
    pub fn current() -> Self {
        CURRENT_THREAD_ID.with(|id| *id)
    }

    /// Creates an identity from its raw value (e.g., received from a
    /// debugger front-end).
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of this identity.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::ThreadId;

    #[test]
    fn identity_is_stable_per_thread() {
        assert_eq!(ThreadId::current(), ThreadId::current());
    }

    #[test]
    fn identities_differ_across_threads() {
        let here = ThreadId::current();
        let there = std::thread::spawn(ThreadId::current).join().unwrap();

        assert_ne!(here, there);
        assert_eq!(ThreadId::from_raw(there.as_u64()), there);
    }
}
