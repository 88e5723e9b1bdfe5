//! Capability references that live on a connection.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use caprpc_protocol::CapDescriptor;
use caprpc_protocol::Disembargo;
use caprpc_protocol::DisembargoContext;
use caprpc_protocol::Finish;
use caprpc_protocol::ImportId;
use caprpc_protocol::Message;
use caprpc_protocol::MessageTarget;
use caprpc_protocol::PipelineOp;
use caprpc_protocol::PromisedAnswer;
use caprpc_protocol::QuestionId;
use caprpc_protocol::Release;
use tokio::sync::oneshot;

use crate::Promise;
use crate::client::Brand;
use crate::client::Client;
use crate::client::Hook;
use crate::connection::ConnectionState;
use crate::connection::WriteTarget;
use crate::connection::tables::Embargo;
use crate::error::Error;
use crate::error::Result;
use crate::payload::Payload;
use crate::pipeline::PipelineHook;
use crate::queued::QueuedClient;

// ─────────────────────────────────────────────────────────────────────────────
// Imports
// ─────────────────────────────────────────────────────────────────────────────

/// Stub for an object the peer exported to us.
pub(crate) struct ImportClient {
    connection: Rc<ConnectionState>,
    import_id: ImportId,
    /// How many times the peer has sent us this id; released in one go.
    remote_ref_count: Cell<u32>,
}

impl ImportClient {
    pub(crate) fn new(connection: Rc<ConnectionState>, import_id: ImportId) -> Self {
        Self {
            connection,
            import_id,
            remote_ref_count: Cell::new(0),
        }
    }

    pub(crate) fn connection(&self) -> &Rc<ConnectionState> {
        &self.connection
    }

    pub(crate) fn import_id(&self) -> ImportId {
        self.import_id
    }

    pub(crate) fn add_remote_ref(&self) {
        self.remote_ref_count
            .set(self.remote_ref_count.get().saturating_add(1));
    }

    pub(crate) fn write_target(&self) -> MessageTarget {
        MessageTarget::ImportedCap(self.import_id)
    }

    pub(crate) fn write_descriptor(&self) -> CapDescriptor {
        CapDescriptor::ReceiverHosted(self.import_id)
    }
}

impl Drop for ImportClient {
    fn drop(&mut self) {
        {
            let mut imports = self.connection.imports.borrow_mut();
            let is_current = imports
                .find(self.import_id)
                .and_then(|import| import.import_client.as_ref())
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self));
            if is_current {
                imports.erase(self.import_id);
            }
        }

        if self.connection.is_connected() {
            self.connection.send_message(Message::Release(Release {
                id: self.import_id,
                reference_count: self.remote_ref_count.get(),
            }));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Questions
// ─────────────────────────────────────────────────────────────────────────────

enum PipelineState {
    /// Promise clients handed out so far, resolved when the Return arrives.
    Waiting(Vec<(Vec<PipelineOp>, std::rc::Weak<PromiseClient>)>),
    Resolved(Rc<RefCell<Payload>>),
    Broken(Error),
    /// The results go to someone else; pipelined calls keep targeting the
    /// question on the peer.
    Detached,
}

/// Application-side ownership of a question. Dropping the last reference
/// sends `Finish`.
pub(crate) struct QuestionRef {
    connection: Rc<ConnectionState>,
    id: QuestionId,
    fulfiller: RefCell<Option<oneshot::Sender<Result<Rc<RefCell<Payload>>>>>>,
    pipeline: RefCell<PipelineState>,
}

impl QuestionRef {
    pub(crate) fn new(
        connection: Rc<ConnectionState>,
        id: QuestionId,
        fulfiller: oneshot::Sender<Result<Rc<RefCell<Payload>>>>,
        detached: bool,
    ) -> Self {
        let pipeline = if detached {
            PipelineState::Detached
        } else {
            PipelineState::Waiting(Vec::new())
        };
        Self {
            connection,
            id,
            fulfiller: RefCell::new(Some(fulfiller)),
            pipeline: RefCell::new(pipeline),
        }
    }

    pub(crate) fn id(&self) -> QuestionId {
        self.id
    }

    /// Deliver the outcome of the question.
    ///
    /// Pipelined promise clients are resolved first so that their resolution
    /// is visible by the time the application sees the response.
    pub(crate) fn fulfill(&self, result: Result<Rc<RefCell<Payload>>>) {
        let waiting = {
            let mut pipeline = self.pipeline.borrow_mut();
            if matches!(*pipeline, PipelineState::Detached) {
                Vec::new()
            } else {
                let next = match &result {
                    Ok(payload) => PipelineState::Resolved(payload.clone()),
                    Err(e) => PipelineState::Broken(e.clone()),
                };
                match std::mem::replace(&mut *pipeline, next) {
                    PipelineState::Waiting(waiting) => waiting,
                    _ => Vec::new(),
                }
            }
        };

        for (ops, weak) in waiting {
            let Some(promise) = weak.upgrade() else {
                continue;
            };
            match &result {
                Ok(payload) => {
                    let cap = payload.borrow().get_pipelined_cap(&ops);
                    promise.resolve(cap, false);
                }
                Err(e) => promise.resolve(Client::broken(e.clone()), true),
            }
        }

        let fulfiller = self.fulfiller.borrow_mut().take();
        if let Some(fulfiller) = fulfiller {
            let _ = fulfiller.send(result);
        }
    }

    pub(crate) fn reject(&self, error: Error) {
        self.fulfill(Err(error));
    }

    fn get_pipelined_cap(self: &Rc<Self>, ops: &[PipelineOp]) -> Client {
        let resolved = match &*self.pipeline.borrow() {
            PipelineState::Resolved(payload) => Some(Ok(payload.clone())),
            PipelineState::Broken(e) => Some(Err(e.clone())),
            PipelineState::Detached => {
                return PipelineClient::wrap(self.clone(), ops.to_vec());
            }
            PipelineState::Waiting(_) => None,
        };
        match resolved {
            Some(Ok(payload)) => return payload.borrow().get_pipelined_cap(ops),
            Some(Err(e)) => return Client::broken(e),
            None => {}
        }

        let mut pipeline = self.pipeline.borrow_mut();
        let PipelineState::Waiting(waiting) = &mut *pipeline else {
            return Client::broken(Error::failed("Question pipeline changed state."));
        };
        waiting.retain(|(_, weak)| weak.strong_count() > 0);
        if let Some(existing) = waiting
            .iter()
            .find(|(existing, _)| existing.as_slice() == ops)
            .and_then(|(_, weak)| weak.upgrade())
        {
            return Client::from_hook(Hook::Promise(existing));
        }

        let promise = Rc::new(PromiseClient::new(
            self.connection.clone(),
            PipelineClient::wrap(self.clone(), ops.to_vec()),
            None,
        ));
        waiting.push((ops.to_vec(), Rc::downgrade(&promise)));
        Client::from_hook(Hook::Promise(promise))
    }
}

impl Drop for QuestionRef {
    fn drop(&mut self) {
        let this: *const QuestionRef = self;
        let release_result_caps = {
            let mut questions = self.connection.questions.borrow_mut();
            match questions.find_mut(self.id) {
                // The id may already belong to a newer question after a
                // disconnect or an Unimplemented echo.
                Some(question)
                    if question
                        .self_ref
                        .as_ref()
                        .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), this)) =>
                {
                    let release = !question.result_caps_imported;
                    if question.is_awaiting_return {
                        // Erased once the Return arrives.
                        question.self_ref = None;
                        Some((release, false))
                    } else {
                        Some((release, true))
                    }
                }
                _ => None,
            }
        };

        let Some((release_result_caps, erase)) = release_result_caps else {
            return;
        };

        if self.connection.is_connected() {
            self.connection.send_message(Message::Finish(Finish {
                question_id: self.id,
                release_result_caps,
            }));
        }

        if erase {
            let question = self.connection.questions.borrow_mut().erase(self.id);
            drop(question);
        }
    }
}

/// Pipeline for a call sent over a connection.
pub(crate) struct RpcPipeline {
    question_ref: Rc<QuestionRef>,
}

impl RpcPipeline {
    pub(crate) fn new(question_ref: Rc<QuestionRef>) -> Self {
        Self { question_ref }
    }
}

impl PipelineHook for RpcPipeline {
    fn get_pipelined_cap(&self, ops: &[PipelineOp]) -> Client {
        self.question_ref.get_pipelined_cap(ops)
    }
}

/// "Capability at `ops` in the results of question `question_ref`", before
/// those results exist.
pub(crate) struct PipelineClient {
    question_ref: Rc<QuestionRef>,
    ops: Vec<PipelineOp>,
}

impl PipelineClient {
    fn wrap(question_ref: Rc<QuestionRef>, ops: Vec<PipelineOp>) -> Client {
        Client::from_hook(Hook::Pipeline(Rc::new(PipelineClient { question_ref, ops })))
    }

    pub(crate) fn connection(&self) -> &Rc<ConnectionState> {
        &self.question_ref.connection
    }

    fn promised_answer(&self) -> PromisedAnswer {
        PromisedAnswer {
            question_id: self.question_ref.id,
            transform: self.ops.clone(),
        }
    }

    pub(crate) fn write_target(&self) -> MessageTarget {
        MessageTarget::PromisedAnswer(self.promised_answer())
    }

    pub(crate) fn write_descriptor(&self) -> CapDescriptor {
        CapDescriptor::ReceiverAnswer(self.promised_answer())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Promises
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolutionType {
    Unresolved,
    /// Resolved to another object on the same connection.
    Remote,
    /// Resolved to an object that is not on this connection.
    Reflected,
    /// Forwarding to another unresolved promise on the same connection.
    Merged,
    Broken,
}

/// A promise for a capability on this connection: a promise import or a
/// pipelined answer.
pub(crate) struct PromiseClient {
    connection: Rc<ConnectionState>,
    cap: RefCell<Client>,
    import_id: Option<ImportId>,
    /// Whether any call has gone through this promise to the peer. Decides
    /// whether a reflected resolution needs an embargo.
    received_call: Cell<bool>,
    resolution: Cell<ResolutionType>,
    waiters: RefCell<Vec<oneshot::Sender<Client>>>,
}

impl PromiseClient {
    pub(crate) fn new(
        connection: Rc<ConnectionState>,
        initial: Client,
        import_id: Option<ImportId>,
    ) -> Self {
        Self {
            connection,
            cap: RefCell::new(initial),
            import_id,
            received_call: Cell::new(false),
            resolution: Cell::new(ResolutionType::Unresolved),
            waiters: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn connection(&self) -> &Rc<ConnectionState> {
        &self.connection
    }

    pub(crate) fn import_id(&self) -> Option<ImportId> {
        self.import_id
    }

    pub(crate) fn cap(&self) -> Client {
        self.cap.borrow().clone()
    }

    pub(crate) fn mark_received_call(&self) {
        self.received_call.set(true);
    }

    fn is_resolved(&self) -> bool {
        self.resolution.get() != ResolutionType::Unresolved
    }

    pub(crate) fn resolved(&self) -> Option<Client> {
        self.is_resolved().then(|| self.cap())
    }

    pub(crate) fn when_more_resolved(&self) -> Promise<Client> {
        if let Some(cap) = self.resolved() {
            return Box::pin(async move { Ok(cap) });
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.borrow_mut().push(tx);
        Box::pin(async move {
            rx.await
                .map_err(|_| Error::failed("Promise was dropped without being resolved."))
        })
    }

    pub(crate) fn write_target(&self) -> WriteTarget {
        self.received_call.set(true);
        self.connection.write_target(&self.cap())
    }

    pub(crate) fn write_descriptor(&self) -> (CapDescriptor, Option<u32>) {
        self.received_call.set(true);
        self.connection.write_descriptor(&self.cap())
    }

    /// Switch this promise to `replacement`.
    ///
    /// If calls already went to the peer through this promise and the
    /// replacement is not on this connection, new calls must not overtake
    /// them. In that case a `Disembargo` is sent along the old path and calls
    /// queue locally until it loops back.
    pub(crate) fn resolve(&self, replacement: Client, is_error: bool) {
        if self.is_resolved() {
            return;
        }
        let mut replacement = replacement;
        let brand = replacement.brand();

        if brand == Brand::Connection(self.connection.id()) {
            if let Hook::Promise(other) = &replacement.hook {
                let mut other = other.clone();
                while other.resolution.get() == ResolutionType::Merged {
                    let next = other.cap();
                    let Hook::Promise(next_promise) = &next.hook else {
                        break;
                    };
                    let next_promise = next_promise.clone();
                    replacement = next;
                    other = next_promise;
                }
                if other.is_resolved() {
                    self.resolution.set(other.resolution.get());
                } else {
                    other
                        .received_call
                        .set(other.received_call.get() || self.received_call.get());
                    self.resolution.set(ResolutionType::Merged);
                }
            } else {
                self.resolution.set(ResolutionType::Remote);
            }
        } else if brand == Brand::Broken {
            self.resolution.set(ResolutionType::Broken);
        } else {
            self.resolution.set(ResolutionType::Reflected);
        }

        if self.resolution.get() == ResolutionType::Reflected
            && self.received_call.get()
            && !is_error
            && self.connection.is_connected()
        {
            match self.connection.write_target(&self.cap()) {
                WriteTarget::Target(target) => {
                    let (queued, resolver) = QueuedClient::new();
                    let embargo_id = self.connection.embargoes.borrow_mut().next(Embargo {
                        target: replacement,
                        resolver,
                    });
                    self.connection
                        .send_message(Message::Disembargo(Disembargo {
                            target,
                            context: DisembargoContext::SenderLoopback(embargo_id),
                        }));
                    replacement = queued;
                }
                WriteTarget::Redirect(_) => {
                    tracing::warn!("Embargoed promise no longer points at the peer.");
                }
            }
        }

        let previous = self.cap.replace(replacement.clone());
        drop(previous);

        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waiter in waiters {
            let _ = waiter.send(replacement.clone());
        }
    }
}
