use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use caprpc::Client;
use caprpc::ErrorKind;
use caprpc::RpcConfig;
use caprpc::Value;
use caprpc::config::TransportConfig;
use caprpc::protocol::DEFAULT_MAX_FRAME_BYTES;
use caprpc::protocol::Exception;
use caprpc::protocol::ExceptionType;
use caprpc::protocol::Message;
use caprpc::protocol::Return;
use caprpc::protocol::ReturnBody;
use caprpc::protocol::decode_frame;
use caprpc::two_party::TwoPartyClient;
use caprpc::two_party::TwoPartyServer;
use caprpc_test_support::TestInterface;
use caprpc_test_support::foo_request;
use caprpc_test_support::two_party_pair;
use pretty_assertions::assert_eq;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::DuplexStream;
use tokio::io::Lines;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::LocalSet;

#[tokio::test]
async fn foo_over_an_in_memory_stream() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let call_count = Rc::new(Cell::new(0));
            let (client, server) =
                two_party_pair(Client::new(TestInterface::new(call_count.clone())));

            let cap = client.bootstrap();
            let response = foo_request(&cap, 123).send().promise.await?;

            assert_eq!(
                Some("foo"),
                response.content().get("x").and_then(Value::as_text)
            );
            assert_eq!(1, call_count.get());
            assert_eq!(1, server.connection_count());
            Ok(())
        })
        .await
}

#[tokio::test]
async fn foo_over_tcp() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let call_count = Rc::new(Cell::new(0));
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            let server = Rc::new(TwoPartyServer::new(Client::new(TestInterface::new(
                call_count.clone(),
            ))));
            let serving = server.clone();
            let listen = tokio::task::spawn_local(async move { serving.listen(listener).await });

            let stream = TcpStream::connect(addr).await?;
            let (reader, writer) = stream.into_split();
            let client = TwoPartyClient::new(reader, writer, &RpcConfig::default());
            let cap = client.bootstrap();

            for _ in 0..3 {
                let response = foo_request(&cap, 123).send().promise.await?;
                assert_eq!(
                    Some("foo"),
                    response.content().get("x").and_then(Value::as_text)
                );
            }
            assert_eq!(3, call_count.get());

            drop(cap);
            drop(client);
            tokio::time::timeout(Duration::from_secs(5), server.drain()).await?;
            assert_eq!(0, server.connection_count());

            listen.abort();
            Ok(())
        })
        .await
}

#[tokio::test]
async fn dropping_the_client_drains_the_server() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (mut client, server) =
                two_party_pair(Client::new(TestInterface::new(Rc::new(Cell::new(0)))));
            let cap = client.bootstrap();
            foo_request(&cap, 123).send().promise.await?;
            assert_eq!(1, server.connection_count());

            let disconnected = client.on_disconnect();
            assert!(client.on_disconnect().is_none());
            drop(cap);
            drop(client);

            tokio::time::timeout(Duration::from_secs(5), server.drain()).await?;
            assert_eq!(0, server.connection_count());
            if let Some(disconnected) = disconnected {
                tokio::time::timeout(Duration::from_secs(5), disconnected).await??;
            }
            Ok(())
        })
        .await
}

#[tokio::test]
async fn calls_fail_after_the_server_goes_away() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (client_stream, server_stream) = tokio::io::duplex(1 << 16);
            let server = TwoPartyServer::new(Client::new(TestInterface::new(Rc::new(Cell::new(0)))));
            let (server_reader, server_writer) = tokio::io::split(server_stream);
            let served = server.accept(server_reader, server_writer);

            let (client_reader, client_writer) = tokio::io::split(client_stream);
            let client = TwoPartyClient::new(client_reader, client_writer, &RpcConfig::default());
            let cap = client.bootstrap();

            // The connection lives only as long as the accept promise.
            drop(served);

            let err = foo_request(&cap, 123).send().promise.await.unwrap_err();
            assert_eq!(ErrorKind::Disconnected, err.kind);
            Ok(())
        })
        .await
}

/// A hand-driven peer speaking raw frames to a served connection.
struct RawPeer<R> {
    replies: Lines<BufReader<R>>,
    writer: WriteHalf<DuplexStream>,
}

impl<R: AsyncRead + Unpin> RawPeer<R> {
    async fn write(&mut self, frames: &str) -> anyhow::Result<()> {
        self.writer.write_all(frames.as_bytes()).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> anyhow::Result<Option<Message>> {
        let line = tokio::time::timeout(Duration::from_secs(5), self.replies.next_line()).await??;
        Ok(match line {
            Some(line) => Some(decode_frame(&line, DEFAULT_MAX_FRAME_BYTES)?),
            None => None,
        })
    }
}

fn serve_raw_peer(config: RpcConfig) -> (RawPeer<ReadHalf<DuplexStream>>, caprpc::Promise<()>) {
    let (peer, server_stream) = tokio::io::duplex(1 << 16);
    let server = TwoPartyServer::with_config(
        Client::new(TestInterface::new(Rc::new(Cell::new(0)))),
        config,
    );
    let (server_reader, server_writer) = tokio::io::split(server_stream);
    let served = server.accept(server_reader, server_writer);
    let (reader, writer) = tokio::io::split(peer);
    (
        RawPeer {
            replies: BufReader::new(reader).lines(),
            writer,
        },
        served,
    )
}

#[tokio::test]
async fn unknown_messages_are_echoed_and_the_connection_survives() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (mut peer, _served) = serve_raw_peer(RpcConfig::default());

            peer.write("{\"obsolete_save\":{\"object\":1}}\n{\"bootstrap\":{\"question_id\":0}}\n")
                .await?;

            assert_eq!(
                Some(Message::Unimplemented(Box::new(Message::Unknown(
                    serde_json::json!({"obsolete_save": {"object": 1}})
                )))),
                peer.next_message().await?
            );
            let bootstrap_return = peer.next_message().await?;
            assert!(
                matches!(
                    bootstrap_return,
                    Some(Message::Return(Return {
                        answer_id: 0,
                        body: ReturnBody::Results(_),
                        ..
                    }))
                ),
                "{bootstrap_return:?}"
            );
            Ok(())
        })
        .await
}

#[tokio::test]
async fn malformed_frames_abort_with_their_own_reason() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let (mut peer, served) = serve_raw_peer(RpcConfig::default());

            peer.write("{\"bootstrap\":{\"question\":\"zero\"}}\n").await?;
            tokio::time::timeout(Duration::from_secs(5), served).await??;

            assert_eq!(
                Some(Message::Abort(Exception::new(
                    ExceptionType::Failed,
                    "malformed bootstrap message"
                ))),
                peer.next_message().await?
            );
            assert_eq!(None, peer.next_message().await?);
            Ok(())
        })
        .await
}

#[tokio::test]
async fn an_unterminated_oversized_frame_is_refused() -> anyhow::Result<()> {
    LocalSet::new()
        .run_until(async {
            let config = RpcConfig {
                transport: TransportConfig {
                    max_frame_bytes: 16,
                },
                ..RpcConfig::default()
            };
            let (mut peer, served) = serve_raw_peer(config);

            // No newline: the limit has to trip while the line is still open.
            peer.write(&"x".repeat(64)).await?;
            tokio::time::timeout(Duration::from_secs(5), served).await??;

            assert_eq!(
                Some(Message::Abort(Exception::new(
                    ExceptionType::Failed,
                    "frame exceeds the 16 byte limit"
                ))),
                peer.next_message().await?
            );
            Ok(())
        })
        .await
}
