//! Connection pump
//!
//! Two tasks per connection: the read task decodes requests and hands them
//! to the router, the write task drains the outbound queue onto the socket
//! and runs the liveness timer. Whichever ends first closes the
//! connection; the other is joined before the connection leaves its hub.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use super::{ConnectionError, OutboundMessage, WebConn};
use crate::hub::HubSet;
use crate::protocol::{EventEnvelope, Request};
use crate::router::RequestRouter;

/// Renders queued messages to wire text, stamping event sequence numbers.
///
/// The counter starts at 0 and only advances after an event was rendered,
/// so delivered events carry strictly increasing numbers with no gaps.
#[derive(Debug, Default)]
pub struct OutboundEncoder {
    next_seq: i64,
}

impl OutboundEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next event will carry
    pub fn next_seq(&self) -> i64 {
        self.next_seq
    }

    pub fn encode(&mut self, message: &OutboundMessage) -> Result<String, serde_json::Error> {
        match message {
            OutboundMessage::Event(event) => {
                let text = serde_json::to_string(&EventEnvelope::render(event, self.next_seq))?;
                self.next_seq += 1;
                Ok(text)
            }
            OutboundMessage::Response(response) => serde_json::to_string(response),
            OutboundMessage::Error(error) => serde_json::to_string(error),
        }
    }
}

/// Drives one upgraded socket until either side stops
pub struct Pump {
    conn: Arc<WebConn>,
    queue: mpsc::Receiver<OutboundMessage>,
    hubs: Arc<HubSet>,
    router: Arc<RequestRouter>,
}

impl Pump {
    pub fn new(
        conn: Arc<WebConn>,
        queue: mpsc::Receiver<OutboundMessage>,
        hubs: Arc<HubSet>,
        router: Arc<RequestRouter>,
    ) -> Self {
        Self {
            conn,
            queue,
            hubs,
            router,
        }
    }

    /// Run both tasks to completion, then leave the hub
    pub async fn run<S>(self, socket: S)
    where
        S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        let Pump {
            conn,
            queue,
            hubs,
            router,
        } = self;
        conn.attach_pump();
        let (sink, stream) = socket.split();

        let writer = tokio::spawn(write_loop(conn.clone(), queue, sink));

        match read_loop(&conn, stream, &router).await {
            Ok(()) => debug!("Read task for {} ended", conn.id()),
            Err(e) => debug!("Read task for {} ended: {}", conn.id(), e),
        }
        conn.close();

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Write task for {} ended: {}", conn.id(), e),
            Err(e) => warn!("Write task for {} failed: {}", conn.id(), e),
        }

        if let Err(e) = hubs.unregister(conn.clone()).await {
            debug!("Unregister of {} skipped: {}", conn.id(), e);
        }
        conn.finish();
    }
}

async fn read_loop<R>(
    conn: &Arc<WebConn>,
    stream: R,
    router: &RequestRouter,
) -> Result<(), ConnectionError>
where
    R: Stream<Item = Result<Message, WsError>>,
{
    tokio::pin!(stream);
    let pong_timeout = conn.settings().pong_timeout;
    let mut deadline = Instant::now() + pong_timeout;

    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.closed() => return Ok(()),
            _ = tokio::time::sleep_until(deadline) => return Err(ConnectionError::ReadTimeout),
            frame = stream.next() => frame,
        };
        deadline = Instant::now() + pong_timeout;

        let request: Request = match frame {
            None | Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => {
                serde_json::from_str(&text).map_err(ConnectionError::Decode)?
            }
            Some(Ok(Message::Binary(data))) => {
                serde_json::from_slice(&data).map_err(ConnectionError::Decode)?
            }
            // ping/pong answered by tungstenite, only the deadline matters
            Some(Ok(_)) => continue,
        };

        router.serve(conn, request).await;
    }
}

async fn write_loop<W>(
    conn: Arc<WebConn>,
    mut queue: mpsc::Receiver<OutboundMessage>,
    mut sink: W,
) -> Result<(), ConnectionError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    let write_timeout = conn.settings().write_timeout;
    let ping_interval = conn.settings().ping_interval;
    let mut encoder = OutboundEncoder::new();
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    let result = loop {
        tokio::select! {
            biased;
            _ = conn.closed() => break Ok(()),
            message = queue.recv() => {
                // queue closed by the hub: slow consumer or shutdown
                let Some(message) = message else { break Ok(()) };
                let text = match encoder.encode(&message) {
                    Ok(text) => text,
                    Err(e) => break Err(ConnectionError::Encode(e)),
                };
                if let Err(e) = write_frame(&mut sink, Message::Text(text), write_timeout).await {
                    break Err(e);
                }
            }
            _ = ticker.tick() => {
                if !conn.check_liveness().await {
                    debug!("Session gone for {}, closing", conn.id());
                    break Err(ConnectionError::SessionRevoked);
                }
                if let Err(e) = write_frame(&mut sink, Message::Ping(Vec::new()), write_timeout).await {
                    break Err(e);
                }
            }
        }
    };

    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    let _ = write_frame(&mut sink, Message::Close(Some(frame)), write_timeout).await;
    let _ = timeout(write_timeout, sink.close()).await;

    conn.close();
    result
}

async fn write_frame<W>(
    sink: &mut W,
    message: Message,
    write_timeout: Duration,
) -> Result<(), ConnectionError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match timeout(write_timeout, sink.send(message)).await {
        Ok(result) => result.map_err(ConnectionError::from),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}
