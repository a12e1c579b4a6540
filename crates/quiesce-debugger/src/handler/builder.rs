use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{ExecutionHandler, HandlerConfig, SessionPhase};
use crate::registry::VmRegistry;
use crate::thread::ThreadId;

/// Builder for [ExecutionHandler].
///
/// It is usually created by calling [ExecutionHandler::builder].
pub struct Builder {
    registry: Arc<VmRegistry>,
    config: HandlerConfig,
}

impl Builder {
    pub(super) fn new(registry: Arc<VmRegistry>) -> Self {
        Self {
            registry,
            config: HandlerConfig {
                host_thread: ThreadId::current(),
                host_poll_interval: Duration::from_millis(1),
                stall_warning: Duration::from_secs(5),
            },
        }
    }

    /// Specifies the host thread, which services its own run loop while
    /// waiting on the world.
    ///
    /// Defaults to the thread creating the builder.
    pub fn with_host_thread(mut self, thread_id: ThreadId) -> Self {
        self.config.host_thread = thread_id;
        self
    }

    /// Specifies the maximum time the host thread waits for callbacks before
    /// re-checking the world.
    pub fn with_host_poll_interval(mut self, interval: Duration) -> Self {
        self.config.host_poll_interval = interval;
        self
    }

    /// Specifies how long a wait may make no progress before a warning is
    /// logged.
    pub fn with_stall_warning(mut self, after: Duration) -> Self {
        self.config.stall_warning = after;
        self
    }

    /// Builds the execution handler.
    pub fn build(self) -> ExecutionHandler {
        ExecutionHandler {
            registry: self.registry,
            config: self.config,
            phase: Mutex::new(SessionPhase::RunningAll),
        }
    }
}
