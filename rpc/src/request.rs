//! Outgoing calls and their results.

use std::cell::Ref;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use caprpc_protocol::PipelineOp;
use caprpc_protocol::Value;

use crate::Promise;
use crate::client::Client;
use crate::connection::clients::QuestionRef;
use crate::error::Error;
use crate::payload::Payload;
use crate::pipeline::BrokenPipeline;
use crate::pipeline::PipelineHook;

/// A call being built. Nothing is sent until [`Request::send`].
pub struct Request {
    target: Client,
    interface_id: u64,
    method_id: u16,
    params: Payload,
}

impl Request {
    pub(crate) fn new(target: Client, interface_id: u64, method_id: u16) -> Self {
        Self {
            target,
            interface_id,
            method_id,
            params: Payload::default(),
        }
    }

    pub fn with_params(mut self, params: Payload) -> Self {
        self.params = params;
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.params.content = content;
        self
    }

    pub fn params_mut(&mut self) -> &mut Payload {
        &mut self.params
    }

    pub fn send(self) -> RemotePromise {
        self.target
            .send(self.interface_id, self.method_id, self.params)
    }

    pub(crate) fn target(&self) -> &Client {
        &self.target
    }

    pub(crate) fn into_parts(self) -> (Client, u64, u16, Payload) {
        (self.target, self.interface_id, self.method_id, self.params)
    }
}

/// Completed results of a call.
///
/// For a remote call, the question stays open (and its result capabilities
/// stay alive on the peer) until every clone of the response is dropped.
#[derive(Clone)]
pub struct Response {
    payload: Rc<RefCell<Payload>>,
    question: Option<Rc<QuestionRef>>,
}

impl Response {
    pub(crate) fn local(payload: Rc<RefCell<Payload>>) -> Self {
        Self {
            payload,
            question: None,
        }
    }

    pub(crate) fn remote(payload: Rc<RefCell<Payload>>, question: Rc<QuestionRef>) -> Self {
        Self {
            payload,
            question: Some(question),
        }
    }

    pub(crate) fn payload(&self) -> Rc<RefCell<Payload>> {
        self.payload.clone()
    }

    pub fn get(&self) -> Ref<'_, Payload> {
        self.payload.borrow()
    }

    /// Shorthand for a clone of the result document.
    pub fn content(&self) -> Value {
        self.payload.borrow().content.clone()
    }

    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Client {
        self.payload.borrow().get_pipelined_cap(ops)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("payload", &*self.payload.borrow())
            .field("remote", &self.question.is_some())
            .finish()
    }
}

/// Handle for making calls on capabilities a call has not returned yet.
#[derive(Clone)]
pub struct Pipeline {
    hook: Rc<dyn PipelineHook>,
}

impl Pipeline {
    pub(crate) fn new(hook: Rc<dyn PipelineHook>) -> Self {
        Self { hook }
    }

    pub(crate) fn into_hook(self) -> Rc<dyn PipelineHook> {
        self.hook
    }

    pub fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Client {
        self.hook.get_pipelined_cap(ops)
    }

    /// The capability in field `index` of the result struct.
    pub fn get_field(&self, index: u16) -> Client {
        self.get_pipelined_cap(&[PipelineOp::GetPointerField(index)])
    }
}

/// A sent call: the eventual response plus a pipeline into it.
pub struct RemotePromise {
    pub promise: Promise<Response>,
    pub pipeline: Pipeline,
}

impl RemotePromise {
    pub(crate) fn broken(error: Error) -> Self {
        let pipeline = Pipeline::new(Rc::new(BrokenPipeline::new(error.clone())));
        Self {
            promise: Box::pin(async move { Err(error) }),
            pipeline,
        }
    }
}
