use std::cell::Cell;
use std::rc::Rc;

use caprpc::Client;
use caprpc::RpcSystem;
use caprpc::Value;
use caprpc::protocol::Bootstrap;
use caprpc::protocol::Call;
use caprpc::protocol::CapDescriptor;
use caprpc::protocol::Finish;
use caprpc::protocol::Message;
use caprpc::protocol::MessageTarget;
use caprpc::protocol::Payload as WirePayload;
use caprpc::protocol::Release;
use caprpc::protocol::Return;
use caprpc::protocol::ReturnBody;
use caprpc::protocol::SendResultsTo;
use caprpc_test_support::Canary;
use caprpc_test_support::TEST_INTERFACE_ID;
use caprpc_test_support::TEST_MORE_STUFF_ID;
use caprpc_test_support::TestInterface;
use caprpc_test_support::TestMoreStuff;
use caprpc_test_support::cap_request;
use caprpc_test_support::eventually;
use caprpc_test_support::scripted_network;
use caprpc_test_support::settle;
use caprpc_test_support::test_interface;
use caprpc_test_support::test_more_stuff;
use caprpc_test_support::two_party_pair;
use pretty_assertions::assert_eq;
use tokio::task::LocalSet;

fn call_with_cap(question_id: u32, method_id: u16, import_id: u32) -> Message {
    Message::Call(Call {
        question_id,
        target: MessageTarget::ImportedCap(0),
        interface_id: TEST_MORE_STUFF_ID,
        method_id,
        params: WirePayload {
            content: Value::structure([("cap", Value::Capability(0))]),
            cap_table: vec![CapDescriptor::SenderHosted(import_id)],
        },
        send_results_to: SendResultsTo::Caller,
    })
}

fn foo_call(question_id: u32) -> Message {
    Message::Call(Call {
        question_id,
        target: MessageTarget::ImportedCap(0),
        interface_id: TEST_INTERFACE_ID,
        method_id: test_interface::FOO,
        params: WirePayload {
            content: Value::structure([("i", Value::Int(123)), ("j", Value::Bool(true))]),
            cap_table: Vec::new(),
        },
        send_results_to: SendResultsTo::Caller,
    })
}

#[tokio::test]
async fn finish_before_completion_cancels_and_frees_the_answer() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (network, peer) = scripted_network(true);
            let _system = RpcSystem::new(
                Box::new(network),
                Some(Client::new(TestMoreStuff::new(Rc::new(Cell::new(0))))),
            );
            settle().await;
            peer.push(Message::Bootstrap(Bootstrap { question_id: 0 }));
            settle().await;
            peer.take_sent();

            peer.push(call_with_cap(1, test_more_stuff::NEVER_RETURN, 5));
            settle().await;
            assert_eq!(Vec::<Message>::new(), peer.take_sent());

            peer.push(Message::Finish(Finish {
                question_id: 1,
                release_result_caps: true,
            }));
            settle().await;
            let sent = peer.take_sent();
            assert!(sent.contains(&Message::Return(Return {
                answer_id: 1,
                release_param_caps: false,
                body: ReturnBody::Canceled,
            })));
            // The cancelled call let go of the capability it was holding.
            assert!(sent.contains(&Message::Release(Release {
                id: 5,
                reference_count: 1,
            })));

            // The answer slot is free again.
            peer.push(call_with_cap(1, test_more_stuff::HOLD, 6));
            settle().await;
            assert_eq!(
                vec![Message::Return(Return {
                    answer_id: 1,
                    release_param_caps: false,
                    body: ReturnBody::Results(WirePayload {
                        content: Value::Null,
                        cap_table: Vec::new(),
                    }),
                })],
                peer.take_sent()
            );
            Ok(())
        })
        .await
}

#[tokio::test]
async fn completion_before_finish_keeps_the_answer_until_finish() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (network, peer) = scripted_network(true);
            let _system = RpcSystem::new(
                Box::new(network),
                Some(Client::new(TestInterface::new(Rc::new(Cell::new(0))))),
            );
            settle().await;
            peer.push(Message::Bootstrap(Bootstrap { question_id: 0 }));
            peer.push(foo_call(1));
            settle().await;
            assert_eq!(2, peer.take_sent().len());

            peer.push(Message::Finish(Finish {
                question_id: 1,
                release_result_caps: true,
            }));
            settle().await;
            assert_eq!(Vec::<Message>::new(), peer.take_sent());

            peer.push(foo_call(1));
            settle().await;
            let sent = peer.take_sent();
            assert_eq!(1, sent.len());
            assert!(matches!(
                &sent[0],
                Message::Return(Return {
                    answer_id: 1,
                    body: ReturnBody::Results(_),
                    ..
                })
            ));
            Ok(())
        })
        .await
}

#[tokio::test]
async fn dropping_a_remote_promise_cancels_the_call() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let server_calls = Rc::new(Cell::new(0));
            let (client, _server) =
                two_party_pair(Client::new(TestMoreStuff::new(server_calls.clone())));
            let server = client.bootstrap();

            let (canary, dropped) = Canary::with_flag();
            let remote = cap_request(
                &server,
                TEST_MORE_STUFF_ID,
                test_more_stuff::NEVER_RETURN,
                Client::new(canary),
            )
            .send();

            assert!(eventually(|| server_calls.get() == 1).await);
            assert!(!dropped.get());

            drop(remote);
            assert!(eventually(|| dropped.get()).await);
            Ok(())
        })
        .await
}
