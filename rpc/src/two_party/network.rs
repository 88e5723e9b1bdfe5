use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use caprpc_protocol::Message;
use caprpc_protocol::ProtocolError;
use caprpc_protocol::decode_frame;
use caprpc_protocol::encode_frame;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::codec::LinesCodec;
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::CancellationToken;

use super::Side;
use crate::Promise;
use crate::config::TransportConfig;
use crate::error::Error;
use crate::error::Result;
use crate::network::Connection;
use crate::network::VatNetwork;

/// The single connection of a two-party network, as seen from `side`.
///
/// Reading and writing happen on two local tasks so that a slow peer never
/// blocks message handling.
pub struct TwoPartyVatNetwork {
    side: Side,
    connection: Rc<StreamConnection>,
    accepted: Cell<bool>,
}

struct StreamConnection {
    peer: Side,
    outgoing: RefCell<Option<mpsc::UnboundedSender<Message>>>,
    incoming: Rc<Mutex<mpsc::UnboundedReceiver<Result<Message>>>>,
    writer: RefCell<Option<JoinHandle<()>>>,
    disconnected: CancellationToken,
}

impl TwoPartyVatNetwork {
    /// Start framing `reader` and `writer`. Must be called inside a
    /// [`tokio::task::LocalSet`].
    pub fn new<R, W>(reader: R, writer: W, side: Side, config: &TransportConfig) -> Self
    where
        R: AsyncRead + Unpin + 'static,
        W: AsyncWrite + Unpin + 'static,
    {
        let disconnected = CancellationToken::new();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        tokio::task::spawn_local(read_frames(
            reader,
            incoming_tx,
            config.max_frame_bytes,
            disconnected.clone(),
        ));
        let writer = tokio::task::spawn_local(write_frames(
            writer,
            outgoing_rx,
            disconnected.clone(),
        ));

        Self {
            side,
            connection: Rc::new(StreamConnection {
                peer: side.peer(),
                outgoing: RefCell::new(Some(outgoing_tx)),
                incoming: Rc::new(Mutex::new(incoming_rx)),
                writer: RefCell::new(Some(writer)),
                disconnected,
            }),
            accepted: Cell::new(false),
        }
    }

    /// Completes once the stream has closed in either direction.
    pub fn on_disconnect(&self) -> Promise<()> {
        let disconnected = self.connection.disconnected.clone();
        Box::pin(async move {
            disconnected.cancelled().await;
            Ok(())
        })
    }
}

impl VatNetwork<Side> for TwoPartyVatNetwork {
    fn connect(&self, host: Side) -> Option<Rc<dyn Connection<Side>>> {
        if host == self.side {
            None
        } else {
            Some(self.connection.clone())
        }
    }

    fn accept(&self) -> Promise<Rc<dyn Connection<Side>>> {
        // The server side hands out its one connection once; after that
        // (and always on the client side) nothing more will arrive.
        if self.side == Side::Server && !self.accepted.replace(true) {
            let connection: Rc<dyn Connection<Side>> = self.connection.clone();
            return Box::pin(async move { Ok(connection) });
        }
        Box::pin(futures::future::pending())
    }
}

impl Connection<Side> for StreamConnection {
    fn peer_vat_id(&self) -> Side {
        self.peer
    }

    fn send(&self, message: Message) -> Result<()> {
        let outgoing = self.outgoing.borrow();
        let Some(outgoing) = outgoing.as_ref() else {
            return Err(Error::disconnected("Connection was shut down."));
        };
        outgoing
            .send(message)
            .map_err(|_| Error::disconnected("Peer stream is closed."))
    }

    fn receive_incoming_message(&self) -> Promise<Option<Message>> {
        let incoming = self.incoming.clone();
        Box::pin(async move {
            let mut incoming = incoming.lock().await;
            match incoming.recv().await {
                Some(Ok(message)) => Ok(Some(message)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }

    fn shutdown(&self) -> Promise<()> {
        let outgoing = self.outgoing.borrow_mut().take();
        drop(outgoing);
        let writer = self.writer.borrow_mut().take();
        Box::pin(async move {
            if let Some(writer) = writer {
                writer
                    .await
                    .map_err(|e| Error::failed(format!("writer task failed: {e}")))?;
            }
            Ok(())
        })
    }
}

async fn read_frames<R>(
    reader: R,
    incoming: mpsc::UnboundedSender<Result<Message>>,
    max_frame_bytes: usize,
    disconnected: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    // The codec errors as soon as a line outgrows the limit, newline or not.
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes));
    loop {
        let next = tokio::select! {
            next = lines.next() => next,
            () = disconnected.cancelled() => break,
        };
        let Some(line) = next else {
            break;
        };
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let _ = incoming.send(Err(Error::from(ProtocolError::FrameTooLarge {
                    limit: max_frame_bytes,
                })));
                break;
            }
            Err(LinesCodecError::Io(e)) => {
                let _ = incoming.send(Err(Error::from(e)));
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let decoded = decode_frame(&line, max_frame_bytes).map_err(Error::from);
        let failed = decoded.is_err();
        if incoming.send(decoded).is_err() || failed {
            break;
        }
    }
    disconnected.cancel();
}

async fn write_frames<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    disconnected: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        let frame = match encode_frame(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping unencodable {} message: {e}", message.kind());
                continue;
            }
        };
        if let Err(e) = writer.write_all(&frame).await {
            tracing::debug!("write failed: {e}");
            disconnected.cancel();
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!("flush failed: {e}");
            disconnected.cancel();
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("shutdown failed: {e}");
    }
}
