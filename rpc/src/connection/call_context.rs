//! Context for a call that arrived over a connection.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::rc::Weak;

use caprpc_protocol::AnswerId;
use caprpc_protocol::ExportId;
use caprpc_protocol::Message;
use caprpc_protocol::Payload as WirePayload;
use caprpc_protocol::Return;
use caprpc_protocol::ReturnBody;
use tokio_util::sync::CancellationToken;

use crate::Promise;
use crate::cancel::CancelGate;
use crate::client::Brand;
use crate::client::Client;
use crate::connection::ConnectionState;
use crate::error::Error;
use crate::error::Result;
use crate::local::forward_results;
use crate::payload::Payload;
use crate::pipeline::PipelineHook;
use crate::queued::QueuedPipeline;
use crate::request::Request;
use crate::server::CallContextHook;

pub(crate) struct RpcCallContext {
    connection: Rc<ConnectionState>,
    answer_id: AnswerId,
    params: RefCell<Option<Rc<Payload>>>,
    results: Rc<RefCell<Payload>>,
    /// The caller asked for the results to stay here (`sendResultsTo =
    /// yourself`), to be picked up by a later `takeFromOtherQuestion`.
    redirect_results: bool,
    /// Set once a Return, of any kind, has been sent for this answer.
    response_sent: Cell<bool>,
    cancel: CancelGate,
    pipeline: RefCell<Weak<QueuedPipeline>>,
}

impl RpcCallContext {
    pub(crate) fn new(
        connection: Rc<ConnectionState>,
        answer_id: AnswerId,
        params: Payload,
        redirect_results: bool,
    ) -> Self {
        Self {
            connection,
            answer_id,
            params: RefCell::new(Some(Rc::new(params))),
            results: Rc::new(RefCell::new(Payload::default())),
            redirect_results,
            response_sent: Cell::new(false),
            cancel: CancelGate::default(),
            pipeline: RefCell::new(Weak::new()),
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.token().clone()
    }

    /// The caller sent Finish.
    pub(crate) fn request_cancel(&self) {
        self.cancel.request();
    }

    /// Claim the right to send this answer's Return. Only the first caller
    /// gets `true`.
    fn is_first_responder(&self) -> bool {
        !self.response_sent.replace(true)
    }

    fn send_return_message(&self, body: ReturnBody) {
        if self.connection.is_connected() {
            self.connection.send_message(Message::Return(Return {
                answer_id: self.answer_id,
                release_param_caps: false,
                body,
            }));
        }
    }

    /// The server finished successfully.
    pub(crate) fn send_return(&self) {
        if self.cancel.is_requested() {
            self.send_canceled();
            return;
        }
        if !self.is_first_responder() {
            return;
        }

        let caps = self.results.borrow().cap_table.clone();
        let mut exports = Vec::new();
        let descriptors = caps
            .iter()
            .map(|cap| {
                let (descriptor, export) = self.connection.write_descriptor(cap);
                exports.extend(export);
                descriptor
            })
            .collect();
        let content = self.results.borrow().content.clone();
        self.send_return_message(ReturnBody::Results(WirePayload {
            content,
            cap_table: descriptors,
        }));

        // Pipelined calls arriving after this Return must reach the objects
        // the peer now knows about, not the promises they came from.
        let innermost = caps.iter().map(Client::innermost).collect();
        let previous = std::mem::replace(&mut self.results.borrow_mut().cap_table, innermost);
        drop(previous);
        drop(caps);

        self.cleanup_answer_table(exports);
    }

    pub(crate) fn send_error_return(&self, error: Error) {
        if self.cancel.is_requested() {
            self.send_canceled();
            return;
        }
        if !self.is_first_responder() {
            return;
        }
        self.send_return_message(ReturnBody::Exception(error.to_exception()));
        self.cleanup_answer_table(Vec::new());
    }

    /// The call was cancelled, or finished after the caller sent Finish.
    pub(crate) fn send_canceled(&self) {
        if !self.is_first_responder() {
            return;
        }
        self.send_return_message(ReturnBody::Canceled);
        self.cleanup_answer_table(Vec::new());
    }

    /// A call with redirected results finished; its results wait in the
    /// answer table for the caller to claim them.
    pub(crate) fn send_results_sent_elsewhere(&self) {
        if !self.is_first_responder() {
            return;
        }
        let body = if self.cancel.is_requested() {
            ReturnBody::Canceled
        } else {
            ReturnBody::ResultsSentElsewhere
        };
        self.send_return_message(body);
        self.cleanup_answer_table(Vec::new());
    }

    /// Detach this context from its answer. If Finish already arrived the
    /// answer is erased; otherwise it waits for Finish holding the exports
    /// that were sent in the results.
    fn cleanup_answer_table(&self, result_exports: Vec<ExportId>) {
        if self.cancel.is_requested() {
            let answer = self.connection.answers.borrow_mut().erase(self.answer_id);
            drop(answer);
            if !result_exports.is_empty() {
                tracing::warn!(
                    "Answer {} was finished with {} unreleased exports.",
                    self.answer_id,
                    result_exports.len()
                );
            }
            return;
        }

        let context = {
            let mut answers = self.connection.answers.borrow_mut();
            match answers.find_mut(self.answer_id) {
                Some(answer) => {
                    answer.result_exports = result_exports;
                    answer.call_context.take()
                }
                None => None,
            }
        };
        drop(context);
    }
}

impl CallContextHook for RpcCallContext {
    fn params(&self) -> Result<Rc<Payload>> {
        self.params
            .borrow()
            .clone()
            .ok_or_else(|| Error::failed("Can't get params after release_params()."))
    }

    fn release_params(&self) {
        let params = self.params.borrow_mut().take();
        drop(params);
    }

    fn results(&self) -> Rc<RefCell<Payload>> {
        self.results.clone()
    }

    fn pipeline(&self) -> Weak<QueuedPipeline> {
        self.pipeline.borrow().clone()
    }

    fn set_pipeline(&self, pipeline: Weak<QueuedPipeline>) {
        *self.pipeline.borrow_mut() = pipeline;
    }

    fn allow_cancellation(&self) {
        self.cancel.allow();
    }

    fn direct_tail_call(&self, request: Request) -> (Promise<()>, Rc<dyn PipelineHook>) {
        let same_connection =
            request.target().brand() == Brand::Connection(self.connection.id());
        if !same_connection || self.redirect_results {
            return forward_results(self.results.clone(), request);
        }

        match self.connection.tail_send(request) {
            Ok(tail) => {
                if self.is_first_responder() {
                    self.send_return_message(ReturnBody::TakeFromOtherQuestion(
                        tail.question_id,
                    ));
                    // The tail call's results may carry caps, so pipelined
                    // calls on this answer must still be honored.
                    self.cleanup_answer_table(Vec::new());
                }
                (tail.promise, tail.pipeline)
            }
            Err(request) => forward_results(self.results.clone(), request),
        }
    }
}
