//! The per-connection protocol engine.
//!
//! A [`ConnectionState`] owns the question, answer, export, import and
//! embargo tables for one peer. Incoming messages are handled one at a time
//! to completion; nothing here is shared across threads.
//!
//! Tables hold clients, and clients hold the connection, so a live connection
//! is kept alive by its own tables. [`ConnectionState::disconnect`] empties
//! every table, which is what finally lets it go.

pub(crate) mod call_context;
pub(crate) mod clients;
pub(crate) mod tables;

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use caprpc_protocol::Bootstrap;
use caprpc_protocol::Call;
use caprpc_protocol::CapDescriptor;
use caprpc_protocol::Disembargo;
use caprpc_protocol::DisembargoContext;
use caprpc_protocol::ExportId;
use caprpc_protocol::Finish;
use caprpc_protocol::ImportId;
use caprpc_protocol::Message;
use caprpc_protocol::MessageDump;
use caprpc_protocol::MessageTarget;
use caprpc_protocol::Payload as WirePayload;
use caprpc_protocol::QuestionId;
use caprpc_protocol::Resolve;
use caprpc_protocol::ResolveBody;
use caprpc_protocol::Return;
use caprpc_protocol::ReturnBody;
use caprpc_protocol::SendResultsTo;
use caprpc_protocol::Value;
use futures::FutureExt;
use tokio::sync::oneshot;

use crate::Promise;
use crate::cancel::CancelErr;
use crate::cancel::OrCancelExt;
use crate::client::Brand;
use crate::client::Client;
use crate::client::Hook;
use crate::client::TribbleRaceBlocker;
use crate::connection::call_context::RpcCallContext;
use crate::connection::clients::ImportClient;
use crate::connection::clients::PromiseClient;
use crate::connection::clients::QuestionRef;
use crate::connection::clients::RpcPipeline;
use crate::connection::tables::Answer;
use crate::connection::tables::Embargo;
use crate::connection::tables::Export;
use crate::connection::tables::ExportTable;
use crate::connection::tables::Import;
use crate::connection::tables::ImportTable;
use crate::connection::tables::Question;
use crate::error::Error;
use crate::error::Result;
use crate::network::Transport;
use crate::payload::Payload;
use crate::pipeline::BrokenPipeline;
use crate::pipeline::LocalPipeline;
use crate::pipeline::PipelineHook;
use crate::request::Pipeline;
use crate::request::RemotePromise;
use crate::request::Request;
use crate::request::Response;
use crate::server::CallContextHook;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a call on a client should go.
pub(crate) enum WriteTarget {
    /// Address it to the peer with this target.
    Target(MessageTarget),
    /// The client is not on this connection (any more); send it there instead.
    Redirect(Client),
}

/// A tail call sent back to the peer the original call came from.
pub(crate) struct TailInfo {
    pub(crate) question_id: QuestionId,
    pub(crate) promise: Promise<()>,
    pub(crate) pipeline: Rc<dyn PipelineHook>,
}

type DisconnectHook = Box<dyn FnOnce(&Error)>;

pub(crate) struct ConnectionState {
    id: u64,
    bootstrap_cap: Client,
    /// `Err` holds the cause once disconnected.
    connection: RefCell<std::result::Result<Rc<dyn Transport>, Error>>,
    pub(crate) questions: RefCell<ExportTable<Question>>,
    pub(crate) answers: RefCell<ImportTable<Answer>>,
    pub(crate) exports: RefCell<ExportTable<Export>>,
    pub(crate) imports: RefCell<ImportTable<Import>>,
    pub(crate) embargoes: RefCell<ExportTable<Embargo>>,
    /// Export id of each client currently in the export table, by identity.
    exports_by_cap: RefCell<HashMap<usize, ExportId>>,
    on_disconnect: RefCell<Option<DisconnectHook>>,
    trace_messages: bool,
}

impl ConnectionState {
    pub(crate) fn new(
        transport: Rc<dyn Transport>,
        bootstrap_cap: Client,
        trace_messages: bool,
    ) -> Rc<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Connection {id} established");
        Rc::new(Self {
            id,
            bootstrap_cap,
            connection: RefCell::new(Ok(transport)),
            questions: RefCell::new(ExportTable::default()),
            answers: RefCell::new(ImportTable::default()),
            exports: RefCell::new(ExportTable::default()),
            imports: RefCell::new(ImportTable::default()),
            embargoes: RefCell::new(ExportTable::default()),
            exports_by_cap: RefCell::new(HashMap::new()),
            on_disconnect: RefCell::new(None),
            trace_messages,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn brand(&self) -> Brand {
        Brand::Connection(self.id)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connection.borrow().is_ok()
    }

    fn disconnect_error(&self) -> Option<Error> {
        self.connection.borrow().as_ref().err().cloned()
    }

    pub(crate) fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self.on_disconnect.borrow_mut() = Some(hook);
    }

    /// Hand a message to the transport. Does nothing once disconnected.
    pub(crate) fn send_message(&self, message: Message) {
        let transport = match &*self.connection.borrow() {
            Ok(transport) => transport.clone(),
            Err(_) => return,
        };
        if self.trace_messages {
            tracing::debug!("[{}] > {}", self.id, MessageDump(&message));
        }
        if let Err(e) = transport.send(message) {
            tracing::warn!("Connection {}: failed to send message: {e}", self.id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask the peer for its bootstrap capability.
    pub(crate) fn bootstrap(self: &Rc<Self>) -> Client {
        if let Some(error) = self.disconnect_error() {
            return Client::broken(error);
        }
        // Nobody waits on the response itself; the pipeline cap is resolved
        // from the question directly.
        let (fulfiller, _) = oneshot::channel();
        let question_ref = self.new_question(Vec::new(), false, fulfiller);
        self.send_message(Message::Bootstrap(Bootstrap {
            question_id: question_ref.id(),
        }));
        RpcPipeline::new(question_ref).get_pipelined_cap(&[])
    }

    fn new_question(
        self: &Rc<Self>,
        param_exports: Vec<ExportId>,
        is_tail_call: bool,
        fulfiller: oneshot::Sender<Result<Rc<RefCell<Payload>>>>,
    ) -> Rc<QuestionRef> {
        let question_id = self.questions.borrow_mut().next(Question {
            param_exports,
            is_tail_call,
            ..Question::default()
        });
        let question_ref = Rc::new(QuestionRef::new(
            self.clone(),
            question_id,
            fulfiller,
            is_tail_call,
        ));
        if let Some(question) = self.questions.borrow_mut().find_mut(question_id) {
            question.self_ref = Some(Rc::downgrade(&question_ref));
        }
        question_ref
    }

    /// Send a call to `target`, which is a client on this connection.
    pub(crate) fn send_request(
        self: &Rc<Self>,
        target: Client,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> RemotePromise {
        if let Some(error) = self.disconnect_error() {
            return RemotePromise::broken(error);
        }
        let message_target = match self.write_target(&target) {
            WriteTarget::Target(message_target) => message_target,
            WriteTarget::Redirect(redirect) => {
                return redirect.send(interface_id, method_id, params);
            }
        };

        let (question_ref, response) =
            self.send_call(message_target, interface_id, method_id, params, false);
        let pipeline = Pipeline::new(Rc::new(RpcPipeline::new(question_ref.clone())));
        let promise = Box::pin(async move {
            let payload = match response.await {
                Ok(result) => result?,
                Err(_) => return Err(Error::failed("Question was dropped before it returned.")),
            };
            Ok(Response::remote(payload, question_ref))
        });
        RemotePromise { promise, pipeline }
    }

    /// Send `request` with `sendResultsTo = yourself`, so the peer keeps the
    /// results for a later `takeFromOtherQuestion`. Hands the request back if
    /// its target is not on this connection.
    pub(crate) fn tail_send(
        self: &Rc<Self>,
        request: Request,
    ) -> std::result::Result<TailInfo, Request> {
        if !self.is_connected() {
            return Err(request);
        }
        let message_target = match self.write_target(request.target()) {
            WriteTarget::Target(message_target) => message_target,
            WriteTarget::Redirect(_) => return Err(request),
        };
        let (_, interface_id, method_id, params) = request.into_parts();
        let (question_ref, response) =
            self.send_call(message_target, interface_id, method_id, params, true);
        let question_id = question_ref.id();
        let pipeline: Rc<dyn PipelineHook> = Rc::new(RpcPipeline::new(question_ref.clone()));
        let promise = Box::pin(async move {
            let _question = question_ref;
            match response.await {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(Error::failed("Question was dropped before it returned.")),
            }
        });
        Ok(TailInfo {
            question_id,
            promise,
            pipeline,
        })
    }

    fn send_call(
        self: &Rc<Self>,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: Payload,
        is_tail_call: bool,
    ) -> (
        Rc<QuestionRef>,
        oneshot::Receiver<Result<Rc<RefCell<Payload>>>>,
    ) {
        let Payload { content, cap_table } = params;
        let (descriptors, param_exports) = self.write_descriptors(&cap_table);

        let (fulfiller, response) = oneshot::channel();
        let question_ref = self.new_question(param_exports, is_tail_call, fulfiller);

        self.send_message(Message::Call(Call {
            question_id: question_ref.id(),
            target,
            interface_id,
            method_id,
            params: WirePayload {
                content,
                cap_table: descriptors,
            },
            send_results_to: if is_tail_call {
                SendResultsTo::Yourself
            } else {
                SendResultsTo::Caller
            },
        }));
        drop(cap_table);
        (question_ref, response)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Capability descriptors
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn write_target(&self, client: &Client) -> WriteTarget {
        if client.brand() != self.brand() {
            return WriteTarget::Redirect(client.clone());
        }
        match &client.hook {
            Hook::Import(import) => WriteTarget::Target(import.write_target()),
            Hook::Pipeline(pipeline) => WriteTarget::Target(pipeline.write_target()),
            Hook::Promise(promise) => promise.write_target(),
            _ => WriteTarget::Redirect(client.clone()),
        }
    }

    fn write_descriptors(self: &Rc<Self>, caps: &[Client]) -> (Vec<CapDescriptor>, Vec<ExportId>) {
        let mut exports = Vec::new();
        let descriptors = caps
            .iter()
            .map(|cap| {
                let (descriptor, export) = self.write_descriptor(cap);
                exports.extend(export);
                descriptor
            })
            .collect();
        (descriptors, exports)
    }

    /// Describe `client` to the peer, exporting it if it lives outside this
    /// connection. Returns the export id when an export reference was added.
    pub(crate) fn write_descriptor(
        self: &Rc<Self>,
        client: &Client,
    ) -> (CapDescriptor, Option<ExportId>) {
        let inner = client.innermost();
        if inner.brand() == self.brand() {
            return match &inner.hook {
                Hook::Import(import) => (import.write_descriptor(), None),
                Hook::Pipeline(pipeline) => (pipeline.write_descriptor(), None),
                Hook::Promise(promise) => promise.write_descriptor(),
                _ => (CapDescriptor::None, None),
            };
        }
        if inner.is_null() {
            return (CapDescriptor::None, None);
        }

        let identity = inner.identity();
        let existing = self.exports_by_cap.borrow().get(&identity).copied();
        if let Some(export_id) = existing {
            let mut exports = self.exports.borrow_mut();
            if let Some(export) = exports.find_mut(export_id) {
                export.refcount += 1;
                let descriptor = if export.resolve_op.is_some() {
                    CapDescriptor::SenderPromise(export_id)
                } else {
                    CapDescriptor::SenderHosted(export_id)
                };
                return (descriptor, Some(export_id));
            }
        }

        let export_id = self.exports.borrow_mut().next(Export {
            refcount: 1,
            client: inner.clone(),
            resolve_op: None,
        });
        self.exports_by_cap
            .borrow_mut()
            .insert(identity, export_id);

        match inner.when_more_resolved() {
            Some(promise) => {
                let op = tokio::task::spawn_local(resolve_exported_promise(
                    Rc::downgrade(self),
                    export_id,
                    promise,
                ));
                if let Some(export) = self.exports.borrow_mut().find_mut(export_id) {
                    export.resolve_op = Some(op);
                }
                (CapDescriptor::SenderPromise(export_id), Some(export_id))
            }
            None => (CapDescriptor::SenderHosted(export_id), Some(export_id)),
        }
    }

    fn receive_caps(self: &Rc<Self>, descriptors: Vec<CapDescriptor>) -> Vec<Client> {
        descriptors
            .into_iter()
            .map(|descriptor| self.receive_cap(descriptor))
            .collect()
    }

    fn receive_cap(self: &Rc<Self>, descriptor: CapDescriptor) -> Client {
        match descriptor {
            CapDescriptor::None => Client::null(),
            CapDescriptor::SenderHosted(id) => self.import(id, false),
            CapDescriptor::SenderPromise(id) => self.import(id, true),
            CapDescriptor::ReceiverHosted(id) => {
                let client = self.exports.borrow().find(id).map(|e| e.client.clone());
                match client {
                    Some(client) => self.block_loopback(client),
                    None => Client::broken(Error::failed(format!(
                        "Invalid 'receiverHosted' export ID: {id}"
                    ))),
                }
            }
            CapDescriptor::ReceiverAnswer(promised) => {
                let pipeline = self
                    .answers
                    .borrow()
                    .find(promised.question_id)
                    .filter(|answer| answer.active)
                    .and_then(|answer| answer.pipeline.clone());
                match pipeline {
                    Some(pipeline) => {
                        self.block_loopback(pipeline.get_pipelined_cap(&promised.transform))
                    }
                    None => Client::broken(Error::failed(format!(
                        "Invalid 'receiverAnswer' question ID: {}",
                        promised.question_id
                    ))),
                }
            }
            CapDescriptor::ThirdPartyHosted(_) => Client::broken(Error::unimplemented(
                "Three-party capability handoff is not supported.",
            )),
        }
    }

    /// A capability we hosted came back to us. If it still points at the
    /// peer, shortening it could let new calls overtake ones in flight.
    fn block_loopback(&self, client: Client) -> Client {
        if client.brand() == self.brand() {
            TribbleRaceBlocker::wrap(client)
        } else {
            client
        }
    }

    fn import(self: &Rc<Self>, import_id: ImportId, is_promise: bool) -> Client {
        let mut imports = self.imports.borrow_mut();
        let import = imports.get_or_default(import_id);
        let import_client = match import.import_client.as_ref().and_then(Weak::upgrade) {
            Some(existing) => existing,
            None => {
                let created = Rc::new(ImportClient::new(self.clone(), import_id));
                import.import_client = Some(Rc::downgrade(&created));
                created
            }
        };
        import_client.add_remote_ref();

        if !is_promise {
            import.app_client = None;
            drop(imports);
            return Client::from_hook(Hook::Import(import_client));
        }

        match import.app_client.as_ref().and_then(Weak::upgrade) {
            Some(existing) => {
                drop(imports);
                drop(import_client);
                Client::from_hook(Hook::Promise(existing))
            }
            None => {
                let promise = Rc::new(PromiseClient::new(
                    self.clone(),
                    Client::from_hook(Hook::Import(import_client)),
                    Some(import_id),
                ));
                import.app_client = Some(Rc::downgrade(&promise));
                drop(imports);
                Client::from_hook(Hook::Promise(promise))
            }
        }
    }

    fn get_message_target(&self, target: &MessageTarget) -> Result<Client> {
        match target {
            MessageTarget::ImportedCap(id) => self
                .exports
                .borrow()
                .find(*id)
                .map(|export| export.client.clone())
                .ok_or_else(|| {
                    Error::failed(format!("Message target is not a current export ID: {id}"))
                }),
            MessageTarget::PromisedAnswer(promised) => {
                let pipeline = {
                    let answers = self.answers.borrow();
                    match answers.find(promised.question_id) {
                        Some(answer) if answer.active => answer.pipeline.clone(),
                        _ => {
                            return Err(Error::failed(format!(
                                "PromisedAnswer.questionId is not a current question: {}",
                                promised.question_id
                            )));
                        }
                    }
                };
                Ok(match pipeline {
                    Some(pipeline) => pipeline.get_pipelined_cap(&promised.transform),
                    None => Client::broken(Error::failed(
                        "Pipeline call on a request that returned no capabilities or was already closed.",
                    )),
                })
            }
        }
    }

    fn release_export(&self, id: ExportId, count: u32) -> Result<()> {
        let erased = {
            let mut exports = self.exports.borrow_mut();
            let Some(export) = exports.find_mut(id) else {
                return Err(Error::failed(format!(
                    "Tried to release invalid export ID: {id}"
                )));
            };
            if count > export.refcount {
                return Err(Error::failed(format!(
                    "Tried to drop export {id}'s refcount below zero."
                )));
            }
            export.refcount -= count;
            let remaining = export.refcount;
            if remaining == 0 { exports.erase(id) } else { None }
        };

        if let Some(export) = erased {
            let identity = export.client.identity();
            {
                let mut by_cap = self.exports_by_cap.borrow_mut();
                if by_cap.get(&identity) == Some(&id) {
                    by_cap.remove(&identity);
                }
            }
            drop(export);
        }
        Ok(())
    }

    fn release_exports(&self, ids: &[ExportId]) -> Result<()> {
        for id in ids {
            self.release_export(*id, 1)?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Incoming
    // ─────────────────────────────────────────────────────────────────────────

    /// Process one message. An `Err` is a protocol violation (or an Abort
    /// from the peer) and must end the connection.
    pub(crate) fn handle_message(self: &Rc<Self>, message: Message) -> Result<()> {
        if self.trace_messages {
            tracing::debug!("[{}] < {}", self.id, MessageDump(&message));
        }
        match message {
            Message::Unimplemented(echoed) => {
                self.handle_unimplemented(*echoed);
                Ok(())
            }
            Message::Abort(exception) => Err(Error::from(exception)),
            Message::Bootstrap(bootstrap) => self.handle_bootstrap(bootstrap),
            Message::Call(call) => self.handle_call(call),
            Message::Return(ret) => self.handle_return(ret),
            Message::Finish(finish) => self.handle_finish(finish),
            Message::Resolve(resolve) => {
                self.handle_resolve(resolve);
                Ok(())
            }
            Message::Release(release) => self.release_export(release.id, release.reference_count),
            Message::Disembargo(disembargo) => self.handle_disembargo(disembargo),
            other @ (Message::Provide(_)
            | Message::Accept(_)
            | Message::Join(_)
            | Message::Unknown(_)) => {
                tracing::debug!("Connection {}: echoing unsupported '{}'", self.id, other.kind());
                self.send_message(Message::Unimplemented(Box::new(other)));
                Ok(())
            }
        }
    }

    fn insert_answer(&self, answer_id: u32, answer: Answer) -> Result<()> {
        let previous = {
            let mut answers = self.answers.borrow_mut();
            if answers.find(answer_id).is_some_and(|existing| existing.active) {
                return Err(Error::failed(format!(
                    "questionId {answer_id} is already in use"
                )));
            }
            answers.insert(answer_id, answer)
        };
        drop(previous);
        Ok(())
    }

    fn handle_bootstrap(self: &Rc<Self>, bootstrap: Bootstrap) -> Result<()> {
        let answer_id = bootstrap.question_id;
        if self
            .answers
            .borrow()
            .find(answer_id)
            .is_some_and(|existing| existing.active)
        {
            return Err(Error::failed(format!(
                "bootstrap questionId {answer_id} is already in use"
            )));
        }

        let cap = self.bootstrap_cap.clone();
        if let Some(error) = cap.broken_error().filter(|_| !cap.is_null()) {
            let error = error.clone();
            self.insert_answer(
                answer_id,
                Answer {
                    active: true,
                    pipeline: Some(Rc::new(BrokenPipeline::new(error.clone()))),
                    ..Answer::default()
                },
            )?;
            self.send_message(Message::Return(Return {
                answer_id,
                release_param_caps: false,
                body: ReturnBody::Exception(error.to_exception()),
            }));
            return Ok(());
        }

        let (descriptor, export) = self.write_descriptor(&cap);
        let results = Payload::with_caps(Value::Capability(0), vec![cap.innermost()]);

        self.insert_answer(
            answer_id,
            Answer {
                active: true,
                pipeline: Some(Rc::new(LocalPipeline::new(Rc::new(RefCell::new(results))))),
                result_exports: export.into_iter().collect(),
                ..Answer::default()
            },
        )?;
        self.send_message(Message::Return(Return {
            answer_id,
            release_param_caps: false,
            body: ReturnBody::Results(WirePayload {
                content: Value::Capability(0),
                cap_table: vec![descriptor],
            }),
        }));
        Ok(())
    }

    fn handle_call(self: &Rc<Self>, call: Call) -> Result<()> {
        let redirect_results = match &call.send_results_to {
            SendResultsTo::Caller => false,
            SendResultsTo::Yourself => true,
            SendResultsTo::ThirdParty(_) => {
                self.send_message(Message::Unimplemented(Box::new(Message::Call(call))));
                return Ok(());
            }
        };
        let Call {
            question_id: answer_id,
            target,
            interface_id,
            method_id,
            params,
            ..
        } = call;

        let capability = self.get_message_target(&target)?;
        if self
            .answers
            .borrow()
            .find(answer_id)
            .is_some_and(|existing| existing.active)
        {
            return Err(Error::failed(format!(
                "questionId {answer_id} is already in use"
            )));
        }

        let params = Payload::with_caps(params.content, self.receive_caps(params.cap_table));
        let context = Rc::new(RpcCallContext::new(
            self.clone(),
            answer_id,
            params,
            redirect_results,
        ));
        self.insert_answer(
            answer_id,
            Answer {
                active: true,
                call_context: Some(context.clone()),
                ..Answer::default()
            },
        )?;

        let (promise, pipeline) = capability.call(interface_id, method_id, context.clone());
        drop(capability);

        let token = context.cancel_token();
        if redirect_results {
            let results = context.results();
            let redirected = async move {
                match promise.or_cancel(&token).await {
                    Ok(Ok(())) => Ok(Response::local(results)),
                    Ok(Err(e)) => Err(e),
                    Err(CancelErr::Cancelled) => Err(Error::failed("Call was canceled.")),
                }
            }
            .boxed_local()
            .shared();
            if let Some(answer) = self.answers.borrow_mut().find_mut(answer_id) {
                answer.pipeline = Some(pipeline);
                answer.redirected_results = Some(redirected.clone());
            }
            tokio::task::spawn_local(async move {
                let _ = redirected.await;
                context.send_results_sent_elsewhere();
            });
        } else {
            if let Some(answer) = self.answers.borrow_mut().find_mut(answer_id) {
                answer.pipeline = Some(pipeline);
            }
            tokio::task::spawn_local(async move {
                match promise.or_cancel(&token).await {
                    Ok(Ok(())) => context.send_return(),
                    Ok(Err(e)) => context.send_error_return(e),
                    Err(CancelErr::Cancelled) => context.send_canceled(),
                }
            });
        }
        Ok(())
    }

    fn handle_return(self: &Rc<Self>, ret: Return) -> Result<()> {
        let question_id = ret.answer_id;
        let (question_ref, param_exports, is_tail_call) = {
            let mut questions = self.questions.borrow_mut();
            let Some(question) = questions.find_mut(question_id) else {
                return Err(Error::failed(format!(
                    "Invalid question ID in Return message: {question_id}"
                )));
            };
            if !question.is_awaiting_return {
                return Err(Error::failed(format!(
                    "Duplicate Return for question {question_id}"
                )));
            }
            question.is_awaiting_return = false;
            let param_exports = if ret.release_param_caps {
                std::mem::take(&mut question.param_exports)
            } else {
                Vec::new()
            };
            (
                question.self_ref.as_ref().and_then(Weak::upgrade),
                param_exports,
                question.is_tail_call,
            )
        };
        self.release_exports(&param_exports)?;

        let Some(question_ref) = question_ref else {
            // The application already dropped the question, and Finish went
            // out with releaseResultCaps set, so there is nothing to import.
            if let ReturnBody::TakeFromOtherQuestion(other) = ret.body {
                let redirected = self
                    .answers
                    .borrow_mut()
                    .find_mut(other)
                    .and_then(|answer| answer.redirected_results.take());
                drop(redirected);
            }
            let question = self.questions.borrow_mut().erase(question_id);
            drop(question);
            return Ok(());
        };

        match ret.body {
            ReturnBody::Results(payload) => {
                let imports_caps = payload.cap_table.iter().any(|descriptor| {
                    matches!(
                        descriptor,
                        CapDescriptor::SenderHosted(_) | CapDescriptor::SenderPromise(_)
                    )
                });
                if imports_caps {
                    if let Some(question) = self.questions.borrow_mut().find_mut(question_id) {
                        question.result_caps_imported = true;
                    }
                }
                let caps = self.receive_caps(payload.cap_table);
                question_ref.fulfill(Ok(Rc::new(RefCell::new(Payload::with_caps(
                    payload.content,
                    caps,
                )))));
            }
            ReturnBody::Exception(exception) => question_ref.reject(Error::from(exception)),
            ReturnBody::Canceled => {
                return Err(Error::failed(
                    "Return message falsely claims call was canceled.",
                ));
            }
            ReturnBody::ResultsSentElsewhere => {
                if !is_tail_call {
                    return Err(Error::failed(
                        "`Return` had `resultsSentElsewhere` but this was not a tail call.",
                    ));
                }
                question_ref.fulfill(Ok(Rc::new(RefCell::new(Payload::default()))));
            }
            ReturnBody::TakeFromOtherQuestion(other) => {
                let redirected = self
                    .answers
                    .borrow_mut()
                    .find_mut(other)
                    .and_then(|answer| answer.redirected_results.take());
                let Some(redirected) = redirected else {
                    return Err(Error::failed(format!(
                        "`Return.takeFromOtherQuestion` referenced a call that did not use `sendResultsTo.yourself`: {other}"
                    )));
                };
                tokio::task::spawn_local(async move {
                    let result = redirected.await;
                    question_ref.fulfill(result.map(|response| response.payload()));
                });
            }
        }
        Ok(())
    }

    fn handle_finish(self: &Rc<Self>, finish: Finish) -> Result<()> {
        let answer_id = finish.question_id;
        let (exports_to_release, pipeline, context) = {
            let mut answers = self.answers.borrow_mut();
            let Some(answer) = answers.find_mut(answer_id) else {
                return Err(Error::failed(format!(
                    "'Finish' for invalid question ID: {answer_id}"
                )));
            };
            if !answer.active {
                return Err(Error::failed(format!(
                    "'Finish' for invalid question ID: {answer_id}"
                )));
            }
            let exports = std::mem::take(&mut answer.result_exports);
            let exports = if finish.release_result_caps {
                exports
            } else {
                Vec::new()
            };
            (exports, answer.pipeline.take(), answer.call_context.clone())
        };

        // If the call isn't done yet, cancel it; it erases the answer itself
        // when it completes.
        let erased = match &context {
            Some(context) => {
                context.request_cancel();
                None
            }
            None => self.answers.borrow_mut().erase(answer_id),
        };
        drop(context);
        drop(pipeline);
        drop(erased);

        self.release_exports(&exports_to_release)
    }

    fn handle_resolve(self: &Rc<Self>, resolve: Resolve) {
        let (replacement, is_error) = match resolve.body {
            ResolveBody::Cap(descriptor) => (self.receive_cap(descriptor), false),
            ResolveBody::Exception(exception) => (Client::broken(Error::from(exception)), true),
        };

        let app_client = self
            .imports
            .borrow()
            .find(resolve.promise_id)
            .map(|import| import.app_client.as_ref().and_then(Weak::upgrade));
        match app_client {
            // Already released; dropping the replacement releases anything it
            // named.
            None => {}
            Some(None) => {
                tracing::warn!(
                    "Connection {}: got 'Resolve' for non-promise import {}",
                    self.id,
                    resolve.promise_id
                );
            }
            Some(Some(promise)) => promise.resolve(replacement, is_error),
        }
    }

    fn handle_disembargo(self: &Rc<Self>, disembargo: Disembargo) -> Result<()> {
        match disembargo.context {
            DisembargoContext::SenderLoopback(embargo_id) => {
                let target = self.get_message_target(&disembargo.target)?.innermost();
                if target.brand() != self.brand() {
                    return Err(Error::failed(
                        "'Disembargo' of type 'senderLoopback' sent to an object that does not point back to the sender.",
                    ));
                }

                // Calls that reached `target` before this Disembargo may still
                // be on their way out; let them go first.
                let connection = self.clone();
                tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    match connection.write_target(&target) {
                        WriteTarget::Target(message_target) => {
                            connection.send_message(Message::Disembargo(Disembargo {
                                target: message_target,
                                context: DisembargoContext::ReceiverLoopback(embargo_id),
                            }));
                        }
                        WriteTarget::Redirect(_) => connection.disconnect(Error::failed(
                            "'Disembargo' of type 'senderLoopback' sent to an object that does not appear to have been the subject of a previous 'Resolve' message.",
                        )),
                    }
                });
                Ok(())
            }
            DisembargoContext::ReceiverLoopback(embargo_id) => {
                let embargo = self.embargoes.borrow_mut().erase(embargo_id);
                match embargo {
                    Some(Embargo { target, resolver }) => {
                        resolver.resolve(Ok(target));
                        Ok(())
                    }
                    None => Err(Error::failed(format!(
                        "Invalid embargo ID in 'Disembargo.receiverLoopback': {embargo_id}"
                    ))),
                }
            }
            DisembargoContext::Accept | DisembargoContext::Provide(_) => {
                self.send_message(Message::Unimplemented(Box::new(Message::Disembargo(
                    disembargo,
                ))));
                Ok(())
            }
        }
    }

    fn handle_unimplemented(self: &Rc<Self>, echoed: Message) {
        match echoed {
            Message::Resolve(Resolve {
                body:
                    ResolveBody::Cap(
                        CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id),
                    ),
                ..
            }) => {
                // The peer never imported the cap we resolved to.
                if let Err(e) = self.release_export(id, 1) {
                    tracing::warn!("Connection {}: {e}", self.id);
                }
            }
            Message::Bootstrap(Bootstrap { question_id })
            | Message::Call(Call { question_id, .. }) => {
                self.fail_question(question_id, Error::unimplemented(format!(
                    "Peer does not implement the message that started question {question_id}."
                )));
            }
            other => {
                tracing::debug!(
                    "Connection {}: peer did not implement '{}'",
                    self.id,
                    other.kind()
                );
            }
        }
    }

    /// Drop a question the peer never saw as an answer.
    fn fail_question(&self, question_id: QuestionId, error: Error) {
        let question = {
            let mut questions = self.questions.borrow_mut();
            match questions.find(question_id) {
                Some(question) if question.is_awaiting_return => questions.erase(question_id),
                _ => None,
            }
        };
        let Some(question) = question else {
            return;
        };
        if let Err(e) = self.release_exports(&question.param_exports) {
            tracing::warn!("Connection {}: {e}", self.id);
        }
        if let Some(question_ref) = question.self_ref.as_ref().and_then(Weak::upgrade) {
            question_ref.reject(error);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────────

    /// Move to the terminal disconnected state. Later calls are no-ops.
    pub(crate) fn disconnect(self: &Rc<Self>, error: Error) {
        let network_error = Error::disconnected(error.description.clone());
        let previous = {
            let mut connection = self.connection.borrow_mut();
            if connection.is_err() {
                return;
            }
            std::mem::replace(&mut *connection, Err(network_error.clone()))
        };
        let Ok(transport) = previous else {
            return;
        };
        tracing::info!("Connection {} closed: {error}", self.id);

        let questions = self.questions.borrow_mut().take_all();
        let answers = self.answers.borrow_mut().take_all();
        let exports = self.exports.borrow_mut().take_all();
        let exports_by_cap = std::mem::take(&mut *self.exports_by_cap.borrow_mut());
        let imports = self.imports.borrow_mut().take_all();
        let embargoes = self.embargoes.borrow_mut().take_all();

        for (_, question) in &questions {
            if let Some(question_ref) = question.self_ref.as_ref().and_then(Weak::upgrade) {
                question_ref.reject(network_error.clone());
            }
        }
        for (_, answer) in &answers {
            if let Some(context) = &answer.call_context {
                context.request_cancel();
            }
        }
        for (_, import) in &imports {
            if let Some(promise) = import.app_client.as_ref().and_then(Weak::upgrade) {
                promise.resolve(Client::broken(network_error.clone()), true);
            }
        }
        for (_, embargo) in embargoes {
            embargo.resolver.resolve(Err(network_error.clone()));
        }
        drop(questions);
        drop(answers);
        drop(exports);
        drop(exports_by_cap);
        drop(imports);

        if let Err(e) = transport.send(Message::Abort(error.to_exception())) {
            tracing::debug!("Connection {}: could not send Abort: {e}", self.id);
        }
        let id = self.id;
        tokio::task::spawn_local(async move {
            if let Err(e) = transport.shutdown().await {
                tracing::debug!("Connection {id}: shutdown failed: {e}");
            }
        });

        let hook = self.on_disconnect.borrow_mut().take();
        if let Some(hook) = hook {
            hook(&network_error);
        }
    }
}

/// Drive a connection: read and handle messages until it ends.
pub(crate) async fn message_loop(connection: Rc<ConnectionState>) {
    loop {
        let transport = match &*connection.connection.borrow() {
            Ok(transport) => transport.clone(),
            Err(_) => return,
        };
        let received = transport.receive_incoming_message().await;
        drop(transport);
        if !connection.is_connected() {
            return;
        }
        match received {
            Ok(Some(message)) => {
                if let Err(e) = connection.handle_message(message) {
                    tracing::warn!("Connection {}: {e}", connection.id);
                    connection.disconnect(e);
                    return;
                }
            }
            Ok(None) => {
                connection.disconnect(Error::disconnected("Peer disconnected."));
                return;
            }
            Err(e) => {
                connection.disconnect(e);
                return;
            }
        }
    }
}

/// Wait for an exported promise to settle and tell the peer what it became.
async fn resolve_exported_promise(
    connection: Weak<ConnectionState>,
    export_id: ExportId,
    mut promise: Promise<Client>,
) {
    loop {
        let result = promise.await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if !connection.is_connected() {
            return;
        }

        let resolution = match result {
            Ok(resolution) => resolution.innermost(),
            Err(e) => {
                connection.send_message(Message::Resolve(Resolve {
                    promise_id: export_id,
                    body: ResolveBody::Exception(e.to_exception()),
                }));
                return;
            }
        };

        let previous = {
            let mut exports = connection.exports.borrow_mut();
            let Some(export) = exports.find_mut(export_id) else {
                return;
            };
            std::mem::replace(&mut export.client, resolution.clone())
        };
        {
            let mut by_cap = connection.exports_by_cap.borrow_mut();
            let previous_identity = previous.identity();
            if by_cap.get(&previous_identity) == Some(&export_id) {
                by_cap.remove(&previous_identity);
            }
        }
        drop(previous);

        if resolution.brand() != connection.brand() {
            // Resolving to another local promise: if that promise has no
            // export of its own, this entry can stand for it and no Resolve
            // is needed yet.
            if let Some(more) = resolution.when_more_resolved() {
                let reused = match connection
                    .exports_by_cap
                    .borrow_mut()
                    .entry(resolution.identity())
                {
                    Entry::Vacant(slot) => {
                        slot.insert(export_id);
                        true
                    }
                    Entry::Occupied(_) => false,
                };
                if reused {
                    promise = more;
                    continue;
                }
            }
        }

        let (descriptor, _) = connection.write_descriptor(&resolution);
        connection.send_message(Message::Resolve(Resolve {
            promise_id: export_id,
            body: ResolveBody::Cap(descriptor),
        }));
        return;
    }
}
