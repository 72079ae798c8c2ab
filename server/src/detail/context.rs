//! Type-erased base for per-call method state machines.
//!
//! Every supported method kind implements [`MethodContext`]; tags
//! pulled from a completion queue are decoded back into contexts here.
//!
//! Ownership model: a context lives in a shared cell and every
//! outstanding completion-queue tag holds one strong count on it, taken
//! with [`retain_event`] when the operation is armed and consumed by
//! [`take_event`] when the worker dispatches the event. A user-facing
//! handle holds its own count for the window it exists. The context is
//! freed when the last count drops, which is the Rust rendering of the
//! self-destroy-on-terminal idiom: a terminal transition simply arms
//! nothing further.

use std::sync::{Arc, Weak};

use grapnel_core::tag::{ContextAddr, TagFlags, check_flags_fit};

/// Every supported method type implements this; the worker loop
/// dispatches decoded tags through it.
pub(crate) trait MethodContext: Send + Sync {
    /// Wire the context's own address and cell in; called exactly once,
    /// before `run`, while the cell is still unshared.
    fn install(&mut self, addr: ContextAddr, cell: WeakCell);

    /// Start the method: arm acceptance of the next inbound RPC.
    fn run(&self);

    /// Process one completion-queue event.
    fn on_event(&self, ok: bool, flags: TagFlags);
}

/// The shared cell a tag addresses. Double indirection keeps the tag a
/// thin pointer.
pub(crate) type ContextCell = Arc<Box<dyn MethodContext>>;
pub(crate) type WeakCell = Weak<Box<dyn MethodContext>>;

const _: () = check_flags_fit::<Box<dyn MethodContext>>();

/// Allocate, install, and start a context. The local strong count is
/// dropped on return; from here the outstanding tags own it.
pub(crate) fn spawn(context: Box<dyn MethodContext>) {
    let mut context = context;
    let cell: ContextCell = Arc::new_cyclic(|weak: &WeakCell| {
        let addr = ContextAddr::new(weak.as_ptr() as *const () as usize);
        context.install(addr, weak.clone());
        context
    });
    cell.run();
}

/// Take one strong count for an operation that will post a tag; the
/// matching event consumes it in [`take_event`].
pub(crate) fn retain_event(cell: &WeakCell) {
    std::mem::forget(cell.upgrade().expect("context cell live while arming an operation"));
}

/// Reconstruct the cell behind a dispatched event, consuming the count
/// taken when the operation was armed.
///
/// # Safety
/// `addr` must originate from a tag produced by [`spawn`]'s install,
/// with exactly one posted event per retained count.
pub(crate) unsafe fn take_event(addr: ContextAddr) -> ContextCell {
    unsafe { ContextCell::from_raw(addr.as_usize() as *const Box<dyn MethodContext>) }
}

/// Drop one retained count without an event, for an armed operation
/// that is known to never post (an unfired done probe).
///
/// # Safety
/// Must pair with exactly one [`retain_event`] whose event will not be
/// posted.
pub(crate) unsafe fn release_event(addr: ContextAddr) {
    drop(unsafe { ContextCell::from_raw(addr.as_usize() as *const Box<dyn MethodContext>) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use grapnel_core::tag::split;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        queue: Option<std::sync::Arc<grapnel_core::CompletionQueue>>,
        drops: Arc<AtomicUsize>,
        addr: Option<ContextAddr>,
        cell: Option<WeakCell>,
    }

    impl MethodContext for Probe {
        fn install(&mut self, addr: ContextAddr, cell: WeakCell) {
            self.addr = Some(addr);
            self.cell = Some(cell);
        }

        fn run(&self) {
            // Arm one pretend operation and post its completion.
            retain_event(self.cell.as_ref().unwrap());
            if let Some(queue) = &self.queue {
                queue.post(self.addr.unwrap().tag(TagFlags::new(0b01)), true);
            }
        }

        fn on_event(&self, ok: bool, flags: TagFlags) {
            assert!(ok);
            assert_eq!(flags.bits(), 0b01);
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn event_count_keeps_context_alive_until_dispatch() {
        let drops = Arc::new(AtomicUsize::new(0));
        let queue = grapnel_core::CompletionQueue::new();

        spawn(Box::new(Probe {
            queue: Some(queue.clone()),
            drops: drops.clone(),
            addr: None,
            cell: None,
        }));
        // The spawn-local count is gone but the armed event's count
        // keeps the context alive.
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let event = queue.next().unwrap();
        let (addr, flags) = split(event.tag);
        let cell = unsafe { take_event(addr) };
        cell.on_event(event.ok, flags);
        drop(cell);

        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_drops_unposted_count() {
        let drops = Arc::new(AtomicUsize::new(0));

        // Spawn with no queue: the retained count is never posted, as
        // for a done probe that will never fire.
        let mut installed = None;
        let mut context: Box<dyn MethodContext> =
            Box::new(Probe { queue: None, drops: drops.clone(), addr: None, cell: None });
        let cell: ContextCell = Arc::new_cyclic(|weak: &WeakCell| {
            let addr = ContextAddr::new(weak.as_ptr() as *const () as usize);
            context.install(addr, weak.clone());
            installed = Some(addr);
            context
        });
        cell.run();
        drop(cell);

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        unsafe { release_event(installed.unwrap()) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
