//! The seam at which an out-of-scope instrumentation "skin" would be
//! wired in: helper registration, event-hook subscription, and error
//! reporting. `NullTool` is the default — no hooks, no helpers beyond the
//! core's own — and is what the test suite runs against.

use dynamo_types::{GuestAddr, ThreadId};

/// A condition the core wants the plugin to observe without aborting —
/// "report, don't abort".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEvent {
    /// A client request referenced an unmapped or otherwise invalid guest
    /// pointer.
    InvalidClientRequestPointer { tid: ThreadId, addr: GuestAddr },
    /// A pthread API was misused (unlock of unowned, self-join, etc); the
    /// guest already received the mapped errno, this is purely observable.
    PthreadError { tid: ThreadId, errno: i32 },
    /// A guest syscall argument pointed outside any mapped page.
    InvalidSyscallPointer { tid: ThreadId, addr: GuestAddr },
}

/// Boolean event-hook subscription set: which hooks this tool wants called.
/// Checked by dispatch to decide whether the (non-free) instrumentation
/// call sites need to be taken at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookSubscriptions {
    pub pre_mutex_lock: bool,
    pub post_mutex_lock: bool,
    pub post_mutex_unlock: bool,
    pub post_thread_join: bool,
    pub thread_run: bool,
}

/// An instrumentation plugin. All methods have a default no-op body so a
/// tool only needs to override the hooks it actually subscribes to.
pub trait Tool {
    fn hooks(&self) -> HookSubscriptions {
        HookSubscriptions::default()
    }

    /// Registers up to 8 compact and 50 non-compact helper addresses; the
    /// returned addresses are assigned base-block call-site slots by
    /// [`crate::helper_table::HelperTable`].
    fn register_helpers(&mut self, _helpers: &mut crate::helper_table::HelperTable) {}

    fn on_error_event(&mut self, _event: ToolEvent) {}

    fn on_thread_run(&mut self, _tid: ThreadId) {}
    fn on_pre_mutex_lock(&mut self, _tid: ThreadId, _mutex: GuestAddr) {}
    fn on_post_mutex_lock(&mut self, _tid: ThreadId, _mutex: GuestAddr) {}
    fn on_post_mutex_unlock(&mut self, _tid: ThreadId, _mutex: GuestAddr) {}
    fn on_post_thread_join(&mut self, _joiner: ThreadId, _joinee: ThreadId) {}

    /// Events reported so far, for a tool that keeps them around. Empty by
    /// default; only [`NullTool`] (what the scenario tests run against)
    /// overrides it.
    fn events(&self) -> &[ToolEvent] {
        &[]
    }
}

/// No hooks, no extra helpers; what the test suite and an unconfigured
/// `Machine` run with.
#[derive(Default)]
pub struct NullTool {
    pub events: Vec<ToolEvent>,
}

impl Tool for NullTool {
    fn on_error_event(&mut self, event: ToolEvent) {
        self.events.push(event);
    }

    fn events(&self) -> &[ToolEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_tool_records_every_error_event_it_is_given() {
        let mut tool = NullTool::default();
        tool.on_error_event(ToolEvent::PthreadError { tid: ThreadId::new(1), errno: 16 });
        assert_eq!(tool.events.len(), 1);
    }

    #[test]
    fn default_hook_subscriptions_are_all_off() {
        let tool = NullTool::default();
        let hooks = tool.hooks();
        assert!(!hooks.post_mutex_lock);
        assert!(!hooks.thread_run);
    }
}
