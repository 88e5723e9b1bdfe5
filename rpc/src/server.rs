//! The application side of a call.

use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use crate::Promise;
use crate::error::Error;
use crate::error::Result;
use crate::payload::Payload;
use crate::pipeline::PipelineHook;
use crate::queued::QueuedPipeline;
use crate::request::Request;

/// An object that can receive calls.
///
/// `dispatch_call` runs synchronously when the call is delivered, so a server
/// observes calls in the order they were sent. Work that has to wait should
/// happen inside the returned promise.
pub trait Server {
    fn dispatch_call(&self, interface_id: u64, method_id: u16, context: CallContext)
    -> Promise<()>;
}

/// Failure for a method the server does not know about.
pub fn unimplemented_method(interface_id: u64, method_id: u16) -> Promise<()> {
    Box::pin(async move {
        Err(Error::unimplemented(format!(
            "Method not implemented: 0x{interface_id:x}.{method_id}"
        )))
    })
}

/// Parameters, results and control of one incoming call.
#[derive(Clone)]
pub struct CallContext {
    hook: Rc<dyn CallContextHook>,
}

impl CallContext {
    pub(crate) fn new(hook: Rc<dyn CallContextHook>) -> Self {
        Self { hook }
    }

    /// Fails once `release_params` has been called.
    pub fn params(&self) -> Result<Rc<Payload>> {
        self.hook.params()
    }

    /// Drop the parameters early so the capabilities they carry can be
    /// released before the call finishes.
    pub fn release_params(&self) {
        self.hook.release_params();
    }

    pub fn set_results(&self, results: Payload) {
        let results_cell = self.hook.results();
        let previous = std::mem::replace(&mut *results_cell.borrow_mut(), results);
        drop(previous);
    }

    /// Run `f` against the results being built.
    pub fn with_results<R>(&self, f: impl FnOnce(&mut Payload) -> R) -> R {
        let results = self.hook.results();
        let mut results = results.borrow_mut();
        f(&mut results)
    }

    /// Complete this call with the results of `request`.
    ///
    /// When `request` targets the same peer that made this call, the peer is
    /// told to take the results from the new question directly.
    pub fn tail_call(&self, request: Request) -> Promise<()> {
        self.hook.tail_call(request)
    }

    /// Let the caller cancel this call. Until this is called, a cancellation
    /// request is recorded but the server's promise keeps running.
    pub fn allow_cancellation(&self) {
        self.hook.allow_cancellation();
    }
}

pub(crate) trait CallContextHook {
    fn params(&self) -> Result<Rc<Payload>>;

    fn release_params(&self);

    fn results(&self) -> Rc<RefCell<Payload>>;

    /// The pipeline handed out for this call before the server finished, so a
    /// tail call can resolve it early.
    fn pipeline(&self) -> Weak<QueuedPipeline>;

    fn set_pipeline(&self, pipeline: Weak<QueuedPipeline>);

    fn allow_cancellation(&self);

    fn direct_tail_call(&self, request: Request) -> (Promise<()>, Rc<dyn PipelineHook>);

    fn tail_call(&self, request: Request) -> Promise<()> {
        let (promise, pipeline) = self.direct_tail_call(request);
        if let Some(early) = self.pipeline().upgrade() {
            early.resolve(Ok(pipeline));
        }
        promise
    }
}
