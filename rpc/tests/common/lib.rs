use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use caprpc::CallContext;
use caprpc::Client;
use caprpc::Connection;
use caprpc::Error;
use caprpc::Payload;
use caprpc::Promise;
use caprpc::Request;
use caprpc::RpcConfig;
use caprpc::Server;
use caprpc::VatNetwork;
use caprpc::Value;
use caprpc::protocol::Message;
use caprpc::two_party::TwoPartyClient;
use caprpc::two_party::TwoPartyServer;
use caprpc::unimplemented_method;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

pub const TEST_INTERFACE_ID: u64 = 0x88eb_12a0_e0af_84b2;
pub const TEST_PIPELINE_ID: u64 = 0xa5a4_04ca_a1d2_3e2f;
pub const TEST_CALL_ORDER_ID: u64 = 0xa0e7_7035_bdff_0051;
pub const TEST_MORE_STUFF_ID: u64 = 0xddc7_0bf9_784a_a2b7;
pub const TEST_TAIL_CALLER_ID: u64 = 0x8701_4b56_a2a6_86b6;
pub const TEST_TAIL_CALLEE_ID: u64 = 0xddd6_99e3_9d58_6a39;

pub mod test_interface {
    pub const FOO: u16 = 0;
    pub const BAR: u16 = 1;
}

pub mod test_pipeline {
    pub const GET_CAP: u16 = 0;
}

pub mod test_call_order {
    pub const GET_CALL_SEQUENCE: u16 = 0;
}

pub mod test_more_stuff {
    pub const CALL_FOO: u16 = 0;
    pub const HOLD: u16 = 1;
    pub const CALL_HELD: u16 = 2;
    pub const GET_HELD: u16 = 3;
    pub const ECHO: u16 = 4;
    pub const NEVER_RETURN: u16 = 5;
    pub const CALL_FOO_WHEN_RESOLVED: u16 = 6;
}

/// Let spawned local tasks and in-flight messages run to quiescence.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Yield until `condition` holds, giving up after a generous number of
/// scheduler turns.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..2048 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}

fn ready(result: caprpc::Result<()>) -> Promise<()> {
    Box::pin(futures::future::ready(result))
}

/// The capability a struct field of `params` points at.
pub fn cap_param(params: &Payload, name: &str) -> caprpc::Result<Client> {
    params
        .content
        .get(name)
        .and_then(Value::as_capability)
        .map(|index| params.get_cap(index))
        .ok_or_else(|| Error::failed(format!("missing capability parameter '{name}'")))
}

/// `foo(i, j = true)` on a `TestInterface`.
pub fn foo_request(cap: &Client, i: i64) -> Request {
    cap.new_call(TEST_INTERFACE_ID, test_interface::FOO)
        .with_content(Value::structure([
            ("i", Value::Int(i)),
            ("j", Value::Bool(true)),
        ]))
}

pub fn call_sequence_request(cap: &Client) -> Request {
    cap.new_call(TEST_CALL_ORDER_ID, test_call_order::GET_CALL_SEQUENCE)
}

/// Request whose only parameter is the capability `cap` in field `cap`.
pub fn cap_request(target: &Client, interface_id: u64, method_id: u16, cap: Client) -> Request {
    let mut params = Payload::default();
    let index = params.add_cap(cap);
    params.content = Value::structure([("cap", index)]);
    target.new_call(interface_id, method_id).with_params(params)
}

// ─────────────────────────────────────────────────────────────────────────────
// Test services
// ─────────────────────────────────────────────────────────────────────────────

/// `foo(i: 123, j: true) -> (x: "foo")`; `bar` is not implemented.
pub struct TestInterface {
    call_count: Rc<Cell<u32>>,
}

impl TestInterface {
    pub fn new(call_count: Rc<Cell<u32>>) -> Self {
        Self { call_count }
    }
}

impl Server for TestInterface {
    fn dispatch_call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        if interface_id != TEST_INTERFACE_ID || method_id != test_interface::FOO {
            return unimplemented_method(interface_id, method_id);
        }
        self.call_count.set(self.call_count.get() + 1);
        let params = match context.params() {
            Ok(params) => params,
            Err(e) => return ready(Err(e)),
        };
        let i = params.content.get("i").and_then(Value::as_int);
        let j = params.content.get("j").and_then(Value::as_bool);
        if i != Some(123) || j != Some(true) {
            return ready(Err(Error::failed(format!(
                "unexpected foo params: i={i:?} j={j:?}"
            ))));
        }
        context.set_results(Payload::new(Value::structure([(
            "x",
            Value::text("foo"),
        )])));
        ready(Ok(()))
    }
}

/// `getCap(n, inCap) -> (s: "bar", outBox: (cap))`: calls `inCap.foo` before
/// returning a fresh `TestInterface`.
pub struct TestPipeline {
    call_count: Rc<Cell<u32>>,
}

impl TestPipeline {
    pub fn new(call_count: Rc<Cell<u32>>) -> Self {
        Self { call_count }
    }
}

impl Server for TestPipeline {
    fn dispatch_call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        if interface_id != TEST_PIPELINE_ID || method_id != test_pipeline::GET_CAP {
            return unimplemented_method(interface_id, method_id);
        }
        self.call_count.set(self.call_count.get() + 1);
        let in_cap = match context.params().and_then(|params| cap_param(&params, "inCap")) {
            Ok(cap) => cap,
            Err(e) => return ready(Err(e)),
        };
        let request = foo_request(&in_cap, 123);
        let call_count = self.call_count.clone();
        Box::pin(async move {
            let response = request.send().promise.await?;
            if response.content().get("x").and_then(Value::as_text) != Some("foo") {
                return Err(Error::failed("inCap.foo returned the wrong value"));
            }
            let mut results = Payload::default();
            let cap = results.add_cap(Client::new(TestInterface::new(call_count)));
            results.content = Value::structure([
                ("s", Value::text("bar")),
                ("outBox", Value::structure([("cap", cap)])),
            ]);
            context.set_results(results);
            Ok(())
        })
    }
}

/// `getCallSequence() -> (n)`, counting calls in delivery order.
#[derive(Default)]
pub struct TestCallOrder {
    count: Cell<u32>,
}

impl Server for TestCallOrder {
    fn dispatch_call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        if interface_id != TEST_CALL_ORDER_ID
            || method_id != test_call_order::GET_CALL_SEQUENCE
        {
            return unimplemented_method(interface_id, method_id);
        }
        let n = self.count.get();
        self.count.set(n + 1);
        context.set_results(Payload::new(Value::structure([(
            "n",
            Value::UInt(u64::from(n)),
        )])));
        ready(Ok(()))
    }
}

/// Grab bag of capability-passing methods.
pub struct TestMoreStuff {
    call_count: Rc<Cell<u32>>,
    held: Rc<RefCell<Option<Client>>>,
}

impl TestMoreStuff {
    pub fn new(call_count: Rc<Cell<u32>>) -> Self {
        Self {
            call_count,
            held: Rc::new(RefCell::new(None)),
        }
    }

    /// Observe what `hold` stored.
    pub fn held(&self) -> Rc<RefCell<Option<Client>>> {
        self.held.clone()
    }
}

fn call_foo_on(cap: Client, context: CallContext) -> Promise<()> {
    Box::pin(async move {
        let response = foo_request(&cap, 123).send().promise.await?;
        let x = response.content().get("x").cloned().unwrap_or_default();
        context.set_results(Payload::new(Value::structure([("s", x)])));
        Ok(())
    })
}

impl Server for TestMoreStuff {
    fn dispatch_call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        use test_more_stuff::*;

        if interface_id != TEST_MORE_STUFF_ID {
            return unimplemented_method(interface_id, method_id);
        }
        self.call_count.set(self.call_count.get() + 1);
        let param_cap = || context.params().and_then(|params| cap_param(&params, "cap"));

        match method_id {
            CALL_FOO => match param_cap() {
                Ok(cap) => call_foo_on(cap, context),
                Err(e) => ready(Err(e)),
            },
            HOLD => match param_cap() {
                Ok(cap) => {
                    *self.held.borrow_mut() = Some(cap);
                    ready(Ok(()))
                }
                Err(e) => ready(Err(e)),
            },
            CALL_HELD => match self.held.borrow().clone() {
                Some(cap) => call_foo_on(cap, context),
                None => ready(Err(Error::failed("nothing held"))),
            },
            GET_HELD | ECHO => {
                let cap = if method_id == GET_HELD {
                    self.held.borrow().clone().ok_or_else(|| Error::failed("nothing held"))
                } else {
                    param_cap()
                };
                match cap {
                    Ok(cap) => {
                        let mut results = Payload::default();
                        let index = results.add_cap(cap);
                        results.content = Value::structure([("cap", index)]);
                        context.set_results(results);
                        ready(Ok(()))
                    }
                    Err(e) => ready(Err(e)),
                }
            }
            NEVER_RETURN => match param_cap() {
                Ok(cap) => {
                    context.allow_cancellation();
                    Box::pin(async move {
                        let _cap = cap;
                        futures::future::pending::<()>().await;
                        Ok(())
                    })
                }
                Err(e) => ready(Err(e)),
            },
            CALL_FOO_WHEN_RESOLVED => match param_cap() {
                Ok(cap) => Box::pin(async move {
                    cap.when_resolved().await?;
                    call_foo_on(cap, context).await
                }),
                Err(e) => ready(Err(e)),
            },
            _ => unimplemented_method(interface_id, method_id),
        }
    }
}

/// `foo(i, callee)` completes by tail-calling `callee.foo(i, t)`.
pub struct TestTailCaller;

impl Server for TestTailCaller {
    fn dispatch_call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        if interface_id != TEST_TAIL_CALLER_ID || method_id != 0 {
            return unimplemented_method(interface_id, method_id);
        }
        let (i, callee) = match context.params().and_then(|params| {
            let i = params.content.get("i").cloned().unwrap_or_default();
            Ok((i, cap_param(&params, "callee")?))
        }) {
            Ok(parts) => parts,
            Err(e) => return ready(Err(e)),
        };
        let request = callee
            .new_call(TEST_TAIL_CALLEE_ID, 0)
            .with_content(Value::structure([
                ("i", i),
                ("t", Value::text("from TestTailCaller")),
            ]));
        context.tail_call(request)
    }
}

/// `foo(i, t) -> (i, t, c)` where `c` is a fresh `TestCallOrder`.
pub struct TestTailCallee {
    call_count: Rc<Cell<u32>>,
}

impl TestTailCallee {
    pub fn new(call_count: Rc<Cell<u32>>) -> Self {
        Self { call_count }
    }
}

impl Server for TestTailCallee {
    fn dispatch_call(
        &self,
        interface_id: u64,
        method_id: u16,
        context: CallContext,
    ) -> Promise<()> {
        if interface_id != TEST_TAIL_CALLEE_ID || method_id != 0 {
            return unimplemented_method(interface_id, method_id);
        }
        self.call_count.set(self.call_count.get() + 1);
        let params = match context.params() {
            Ok(params) => params,
            Err(e) => return ready(Err(e)),
        };
        let mut results = Payload::default();
        let c = results.add_cap(Client::new(TestCallOrder::default()));
        results.content = Value::structure([
            ("i", params.content.get("i").cloned().unwrap_or_default()),
            ("t", params.content.get("t").cloned().unwrap_or_default()),
            ("c", c),
        ]);
        context.set_results(results);
        ready(Ok(()))
    }
}

/// A server that implements nothing and records when it is destroyed.
pub struct Canary {
    dropped: Rc<Cell<bool>>,
}

impl Canary {
    pub fn with_flag() -> (Self, Rc<Cell<bool>>) {
        let dropped = Rc::new(Cell::new(false));
        (
            Self {
                dropped: dropped.clone(),
            },
            dropped,
        )
    }
}

impl Server for Canary {
    fn dispatch_call(
        &self,
        interface_id: u64,
        method_id: u16,
        _context: CallContext,
    ) -> Promise<()> {
        unimplemented_method(interface_id, method_id)
    }
}

impl Drop for Canary {
    fn drop(&mut self) {
        self.dropped.set(true);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vat plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// A client and server joined by an in-memory stream. Call inside a
/// `LocalSet`.
pub fn two_party_pair(bootstrap: Client) -> (TwoPartyClient, Rc<TwoPartyServer>) {
    let (client_stream, server_stream) = tokio::io::duplex(1 << 16);

    let server = Rc::new(TwoPartyServer::new(bootstrap));
    let (server_reader, server_writer) = tokio::io::split(server_stream);
    let served = server.accept(server_reader, server_writer);
    tokio::task::spawn_local(async move {
        let _ = served.await;
    });

    let (client_reader, client_writer) = tokio::io::split(client_stream);
    let client = TwoPartyClient::new(client_reader, client_writer, &RpcConfig::default());
    (client, server)
}

pub const SCRIPTED_PEER: &str = "peer";

/// A peer whose side of the protocol is played by the test: messages the
/// engine sends are recorded, and the test pushes the replies.
pub struct ScriptedPeer {
    sent: RefCell<Vec<Message>>,
    incoming: RefCell<Option<mpsc::UnboundedSender<Message>>>,
    receiver: Rc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    shut_down: Cell<bool>,
}

impl ScriptedPeer {
    /// Deliver `message` to the engine.
    pub fn push(&self, message: Message) {
        if let Some(incoming) = self.incoming.borrow().as_ref() {
            let _ = incoming.send(message);
        }
    }

    /// Everything the engine sent since the last call.
    pub fn take_sent(&self) -> Vec<Message> {
        std::mem::take(&mut *self.sent.borrow_mut())
    }

    /// End the incoming stream, as if the peer hung up.
    pub fn hang_up(&self) {
        self.incoming.borrow_mut().take();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.get()
    }
}

impl Connection<&'static str> for ScriptedPeer {
    fn peer_vat_id(&self) -> &'static str {
        SCRIPTED_PEER
    }

    fn send(&self, message: Message) -> caprpc::Result<()> {
        self.sent.borrow_mut().push(message);
        Ok(())
    }

    fn receive_incoming_message(&self) -> Promise<Option<Message>> {
        let receiver = self.receiver.clone();
        Box::pin(async move { Ok(receiver.lock().await.recv().await) })
    }

    fn shutdown(&self) -> Promise<()> {
        self.shut_down.set(true);
        ready(Ok(()))
    }
}

pub struct ScriptedNetwork {
    peer: Rc<ScriptedPeer>,
    inbound: bool,
    accepted: Cell<bool>,
}

/// A network with a single scripted peer. With `inbound`, the peer connects
/// to us as soon as the system starts accepting.
pub fn scripted_network(inbound: bool) -> (ScriptedNetwork, Rc<ScriptedPeer>) {
    let (incoming, receiver) = mpsc::unbounded_channel();
    let peer = Rc::new(ScriptedPeer {
        sent: RefCell::new(Vec::new()),
        incoming: RefCell::new(Some(incoming)),
        receiver: Rc::new(Mutex::new(receiver)),
        shut_down: Cell::new(false),
    });
    let network = ScriptedNetwork {
        peer: peer.clone(),
        inbound,
        accepted: Cell::new(false),
    };
    (network, peer)
}

impl VatNetwork<&'static str> for ScriptedNetwork {
    fn connect(&self, host: &'static str) -> Option<Rc<dyn Connection<&'static str>>> {
        if host == SCRIPTED_PEER {
            Some(self.peer.clone())
        } else {
            None
        }
    }

    fn accept(&self) -> Promise<Rc<dyn Connection<&'static str>>> {
        if self.inbound && !self.accepted.replace(true) {
            let peer: Rc<dyn Connection<&'static str>> = self.peer.clone();
            return Box::pin(async move { Ok(peer) });
        }
        Box::pin(futures::future::pending())
    }
}
