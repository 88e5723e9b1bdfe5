use std::cell::Cell;
use std::rc::Rc;

use caprpc::Client;
use caprpc::ErrorKind;
use caprpc::Payload;
use caprpc::RpcSystem;
use caprpc::Value;
use caprpc::protocol::Bootstrap;
use caprpc::protocol::Call;
use caprpc::protocol::CapDescriptor;
use caprpc::protocol::Exception;
use caprpc::protocol::ExceptionType;
use caprpc::protocol::Finish;
use caprpc::protocol::Message;
use caprpc::protocol::MessageTarget;
use caprpc::protocol::Payload as WirePayload;
use caprpc::protocol::Release;
use caprpc::protocol::Return;
use caprpc::protocol::ReturnBody;
use caprpc::protocol::SendResultsTo;
use caprpc_test_support::ScriptedPeer;
use caprpc_test_support::SCRIPTED_PEER;
use caprpc_test_support::TEST_INTERFACE_ID;
use caprpc_test_support::TEST_TAIL_CALLEE_ID;
use caprpc_test_support::TEST_TAIL_CALLER_ID;
use caprpc_test_support::TestInterface;
use caprpc_test_support::TestTailCallee;
use caprpc_test_support::TestTailCaller;
use caprpc_test_support::call_sequence_request;
use caprpc_test_support::foo_request;
use caprpc_test_support::scripted_network;
use caprpc_test_support::settle;
use caprpc_test_support::test_interface;
use caprpc_test_support::two_party_pair;
use pretty_assertions::assert_eq;
use tokio::task::LocalSet;

fn tail_request(caller: &Client, callee: Client) -> caprpc::Request {
    let mut params = Payload::default();
    let callee = params.add_cap(callee);
    params.content = Value::structure([("i", Value::Int(456)), ("callee", callee)]);
    caller.new_call(TEST_TAIL_CALLER_ID, 0).with_params(params)
}

#[tokio::test]
async fn remote_tail_call_returns_the_callee_results() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (client, _server) = two_party_pair(Client::new(TestTailCaller));
            let caller = client.bootstrap();

            let callee_calls = Rc::new(Cell::new(0));
            let remote = tail_request(
                &caller,
                Client::new(TestTailCallee::new(callee_calls.clone())),
            )
            .send();

            // `c` in the callee's results, reached before anything returned.
            let dependent = call_sequence_request(&remote.pipeline.get_field(2))
                .send()
                .promise;

            let response = remote.promise.await?;
            let content = response.content();
            assert_eq!(Some(456), content.get("i").and_then(Value::as_int));
            assert_eq!(
                Some("from TestTailCaller"),
                content.get("t").and_then(Value::as_text)
            );

            let dependent = dependent.await?;
            assert_eq!(
                Some(0),
                dependent.content().get("n").and_then(Value::as_uint)
            );
            assert_eq!(1, callee_calls.get());
            Ok(())
        })
        .await
}

#[tokio::test]
async fn local_tail_call_returns_the_callee_results() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let callee_calls = Rc::new(Cell::new(0));
            let caller = Client::new(TestTailCaller);

            let remote = tail_request(
                &caller,
                Client::new(TestTailCallee::new(callee_calls.clone())),
            )
            .send();
            let dependent = call_sequence_request(&remote.pipeline.get_field(2))
                .send()
                .promise;

            let response = remote.promise.await?;
            assert_eq!(
                Some("from TestTailCaller"),
                response.content().get("t").and_then(Value::as_text)
            );
            let dependent = dependent.await?;
            assert_eq!(
                Some(0),
                dependent.content().get("n").and_then(Value::as_uint)
            );
            assert_eq!(1, callee_calls.get());
            Ok(())
        })
        .await
}

#[tokio::test]
async fn tail_call_back_to_the_caller_returns_take_from_other_question() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (network, peer) = scripted_network(true);
            let _system = RpcSystem::new(Box::new(network), Some(Client::new(TestTailCaller)));
            settle().await;
            peer.push(Message::Bootstrap(Bootstrap { question_id: 0 }));
            settle().await;
            peer.take_sent();

            // The callee handed to the tail caller is the peer's own export 7.
            peer.push(Message::Call(Call {
                question_id: 1,
                target: MessageTarget::ImportedCap(0),
                interface_id: TEST_TAIL_CALLER_ID,
                method_id: 0,
                params: WirePayload {
                    content: Value::structure([
                        ("i", Value::Int(456)),
                        ("callee", Value::Capability(0)),
                    ]),
                    cap_table: vec![CapDescriptor::SenderHosted(7)],
                },
                send_results_to: SendResultsTo::Caller,
            }));
            settle().await;

            assert_eq!(
                vec![
                    Message::Call(Call {
                        question_id: 0,
                        target: MessageTarget::ImportedCap(7),
                        interface_id: TEST_TAIL_CALLEE_ID,
                        method_id: 0,
                        params: WirePayload {
                            content: Value::structure([
                                ("i", Value::Int(456)),
                                ("t", Value::text("from TestTailCaller")),
                            ]),
                            cap_table: Vec::new(),
                        },
                        send_results_to: SendResultsTo::Yourself,
                    }),
                    Message::Return(Return {
                        answer_id: 1,
                        release_param_caps: false,
                        body: ReturnBody::TakeFromOtherQuestion(0),
                    }),
                ],
                peer.take_sent()
            );

            peer.push(Message::Return(Return {
                answer_id: 0,
                release_param_caps: false,
                body: ReturnBody::ResultsSentElsewhere,
            }));
            peer.push(Message::Finish(Finish {
                question_id: 1,
                release_result_caps: false,
            }));
            settle().await;

            let sent = peer.take_sent();
            assert!(
                sent.contains(&Message::Finish(Finish {
                    question_id: 0,
                    release_result_caps: true,
                })),
                "{sent:?}"
            );
            assert!(
                sent.contains(&Message::Release(Release {
                    id: 7,
                    reference_count: 1,
                })),
                "{sent:?}"
            );
            assert!(!peer.is_shut_down());
            Ok(())
        })
        .await
}

fn foo_params() -> WirePayload {
    WirePayload {
        content: Value::structure([("i", Value::Int(123)), ("j", Value::Bool(true))]),
        cap_table: Vec::new(),
    }
}

/// Import the peer's bootstrap (its export 0) and let the peer import ours
/// (our export 0). Leaves nothing in the sent log.
async fn bootstrap_both_ways(
    system: &RpcSystem<&'static str>,
    peer: &ScriptedPeer,
) -> anyhow::Result<Client> {
    let cap = system.bootstrap(SCRIPTED_PEER);
    peer.push(Message::Return(Return {
        answer_id: 0,
        release_param_caps: false,
        body: ReturnBody::Results(WirePayload {
            content: Value::Capability(0),
            cap_table: vec![CapDescriptor::SenderHosted(0)],
        }),
    }));
    cap.when_resolved().await?;
    peer.push(Message::Bootstrap(Bootstrap { question_id: 0 }));
    settle().await;
    peer.take_sent();
    Ok(cap)
}

#[tokio::test]
async fn caller_takes_results_the_peer_left_with_us() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let call_count = Rc::new(Cell::new(0));
            let (network, peer) = scripted_network(false);
            let system = RpcSystem::new(
                Box::new(network),
                Some(Client::new(TestInterface::new(call_count.clone()))),
            );
            let cap = bootstrap_both_ways(&system, &peer).await?;

            let promise = foo_request(&cap, 123).send().promise;
            peer.take_sent();

            // The peer tail-calls our own export and keeps the results here.
            peer.push(Message::Call(Call {
                question_id: 1,
                target: MessageTarget::ImportedCap(0),
                interface_id: TEST_INTERFACE_ID,
                method_id: test_interface::FOO,
                params: foo_params(),
                send_results_to: SendResultsTo::Yourself,
            }));
            settle().await;
            assert_eq!(
                vec![Message::Return(Return {
                    answer_id: 1,
                    release_param_caps: false,
                    body: ReturnBody::ResultsSentElsewhere,
                })],
                peer.take_sent()
            );

            peer.push(Message::Return(Return {
                answer_id: 0,
                release_param_caps: false,
                body: ReturnBody::TakeFromOtherQuestion(1),
            }));
            let response = promise.await?;

            assert_eq!(
                Some("foo"),
                response.content().get("x").and_then(Value::as_text)
            );
            assert_eq!(1, call_count.get());
            assert!(!peer.is_shut_down());
            Ok(())
        })
        .await
}

#[tokio::test]
async fn take_from_an_answer_that_kept_nothing_aborts() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (network, peer) = scripted_network(false);
            let system = RpcSystem::new(
                Box::new(network),
                Some(Client::new(TestInterface::new(Rc::new(Cell::new(0))))),
            );
            let cap = bootstrap_both_ways(&system, &peer).await?;
            let promise = foo_request(&cap, 123).send().promise;
            peer.take_sent();

            // Answer 0 is the peer's bootstrap, which returned normally.
            peer.push(Message::Return(Return {
                answer_id: 0,
                release_param_caps: false,
                body: ReturnBody::TakeFromOtherQuestion(0),
            }));

            let err = promise.await.err();
            assert_eq!(Some(ErrorKind::Disconnected), err.map(|e| e.kind));
            settle().await;
            assert_eq!(
                vec![Message::Abort(Exception::new(
                    ExceptionType::Failed,
                    "`Return.takeFromOtherQuestion` referenced a call that did not use `sendResultsTo.yourself`: 0",
                ))],
                peer.take_sent()
            );
            assert!(peer.is_shut_down());
            Ok(())
        })
        .await
}

#[tokio::test]
async fn results_sent_elsewhere_for_an_ordinary_call_aborts() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (network, peer) = scripted_network(false);
            let system = RpcSystem::new(
                Box::new(network),
                Some(Client::new(TestInterface::new(Rc::new(Cell::new(0))))),
            );
            let cap = bootstrap_both_ways(&system, &peer).await?;
            let promise = foo_request(&cap, 123).send().promise;
            peer.take_sent();

            peer.push(Message::Return(Return {
                answer_id: 0,
                release_param_caps: false,
                body: ReturnBody::ResultsSentElsewhere,
            }));

            let err = promise.await.err();
            assert_eq!(Some(ErrorKind::Disconnected), err.map(|e| e.kind));
            settle().await;
            assert_eq!(
                vec![Message::Abort(Exception::new(
                    ExceptionType::Failed,
                    "`Return` had `resultsSentElsewhere` but this was not a tail call.",
                ))],
                peer.take_sent()
            );
            assert!(peer.is_shut_down());
            assert_eq!(0, system.connection_count());
            Ok(())
        })
        .await
}
