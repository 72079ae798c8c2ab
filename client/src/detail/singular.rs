//! Runtime of a singular (unary) call.

use grapnel_core::tag::{ContextAddr, TagFlags};
use grapnel_wire::{ClientContext, Message, SingularReader};

use super::context::{Aliveness, CallContext};
use crate::call::{ClientState, CompletionCallback, Summary};

pub(crate) struct SingularCallContext<Req: Message, Resp: Message> {
    request: Option<Req>,
    callback: Option<CompletionCallback<Req, Resp>>,
    _context: ClientContext,
    reader: SingularReader<Resp>,
    addr: Option<ContextAddr>,
}

impl<Req: Message, Resp: Message> SingularCallContext<Req, Resp> {
    /// The deadline is already set on `context`; the reader was built
    /// against it.
    pub(crate) fn new(
        request: Req,
        callback: CompletionCallback<Req, Resp>,
        context: ClientContext,
        reader: SingularReader<Resp>,
    ) -> Self {
        SingularCallContext {
            request: Some(request),
            callback: Some(callback),
            _context: context,
            reader,
            addr: None,
        }
    }
}

impl<Req: Message, Resp: Message> CallContext for SingularCallContext<Req, Resp> {
    fn install(&mut self, addr: ContextAddr) {
        self.addr = Some(addr);
    }

    fn run(&mut self) {
        let tag = self.addr.expect("context installed before run").tag(TagFlags::NONE);
        self.reader.start_call();
        self.reader.finish(tag);
    }

    fn on_event(&mut self, ok: bool, _client_state: ClientState, _flags: TagFlags) -> Aliveness {
        let (response, status) = self.reader.take_result();
        let result = if !ok || !status.is_ok() {
            Err(status)
        } else {
            Ok(response.expect("response present on OK status"))
        };

        let callback = self.callback.take().expect("completion delivered once");
        let request = self.request.take().expect("request released once");
        callback(Summary { request, result });
        Aliveness::Dead
    }
}
