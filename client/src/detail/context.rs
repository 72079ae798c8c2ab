//! Type-erased base for client call state machines.
//!
//! Unlike the server side, a client context has at most one operation
//! outstanding at any instant and every event is dispatched on the
//! strand, so plain exclusive ownership works: the context is leaked
//! into its tag at spawn and reclaimed when `on_event` reports it dead
//! (or when an orphaned relaunch guard drops it).

use grapnel_core::tag::{ContextAddr, TagFlags, check_flags_fit};

use crate::call::ClientState;

/// Whether the context survives the event it just handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Aliveness {
    Alive,
    Dead,
}

pub(crate) trait CallContext: Send {
    /// Wire the context's own address in; called once before `run`.
    fn install(&mut self, addr: ContextAddr);

    /// Start the RPC; pending events will arrive off the queue.
    fn run(&mut self);

    /// Handle one event. `Dead` means the dispatcher reclaims the
    /// context afterwards.
    fn on_event(&mut self, ok: bool, client_state: ClientState, flags: TagFlags) -> Aliveness;
}

type Cell = Box<dyn CallContext>;

const _: () = check_flags_fit::<Cell>();

/// Thin raw handle to a leaked call context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawCall(usize);

unsafe impl Send for RawCall {}

impl RawCall {
    /// Leak a context into a raw handle, installing its address.
    pub fn spawn(context: Box<dyn CallContext>) -> RawCall {
        let mut cell = Box::new(context);
        let addr = ContextAddr::new(&*cell as *const Cell as usize);
        cell.install(addr);
        RawCall(Box::into_raw(cell) as usize)
    }

    pub fn from_addr(addr: ContextAddr) -> RawCall {
        RawCall(addr.as_usize())
    }

    /// # Safety
    /// Callers must be serialized (the strand) and must not use the
    /// handle after `reclaim`.
    pub unsafe fn context(&self) -> &mut Cell {
        unsafe { &mut *(self.0 as *mut Cell) }
    }

    /// # Safety
    /// Must be the final use of this handle.
    pub unsafe fn reclaim(self) {
        drop(unsafe { Box::from_raw(self.0 as *mut Cell) });
    }
}

/// Owns a parked context (a pending relaunch) and reclaims it if the
/// park is abandoned before it runs.
pub(crate) struct RunGuard(Option<RawCall>);

impl RunGuard {
    pub fn new(raw: RawCall) -> Self {
        RunGuard(Some(raw))
    }

    /// Take the context out for running; the guard stands down.
    pub fn disarm(&mut self) -> RawCall {
        self.0.take().expect("relaunch guard fired once")
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Some(raw) = self.0.take() {
            unsafe { raw.reclaim() };
        }
    }
}
