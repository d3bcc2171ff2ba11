//! One connected client, from upgrade to teardown.
//!
//! A session owns its socket. The read half stays here; the write half moves
//! into a writer task fed by the bounded queue behind the session's
//! [`ConnectionHandle`]. Teardown always runs in the same order: deregister,
//! announce the departure to whoever is left, let the writer drain. A session
//! whose client stopped reading is evicted by the dispatcher and goes through
//! the same teardown.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{select, sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info};

use crate::{
    dispatcher::BroadcastDispatcher,
    message::{chat_line, join_notice, leave_notice},
    registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Eviction},
    server::Hub,
};

/// Membership of one connection in the registry.
///
/// [`Registration::release`] deregisters explicitly. If the guard is dropped
/// instead (the session task was cancelled or panicked) the drop does it, so a
/// handle never outlives its session.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    released: bool,
}

impl Registration {
    pub fn new(registry: Arc<ConnectionRegistry>, handle: ConnectionHandle) -> Self {
        let id = handle.id();
        registry.register(handle);
        Self {
            registry,
            id,
            released: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn release(mut self) -> Option<ConnectionHandle> {
        self.released = true;
        self.registry.deregister(self.id)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.released && self.registry.deregister(self.id).is_some() {
            debug!(conn_id = %self.id, "deregistered by guard");
        }
    }
}

/// Why a session's read loop stopped.
#[derive(Debug)]
pub enum Disconnect {
    /// The client sent a close frame.
    Closed { code: Option<u16> },
    /// The socket ended without a close frame.
    StreamEnded,
    TransportError(axum::Error),
    /// Binary frames are not part of the protocol.
    UnsupportedFrame,
    /// The writer task stopped, so nothing more can reach the client.
    WriterGone,
    /// A broadcast timed out on this client's full queue.
    Evicted,
}

#[derive(Debug)]
enum Step {
    Relay(String),
    Skip,
    End(Disconnect),
}

fn classify(frame: Option<Result<Message, axum::Error>>) -> Step {
    match frame {
        Some(Ok(Message::Text(text))) => Step::Relay(text),
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Step::Skip,
        Some(Ok(Message::Binary(_))) => Step::End(Disconnect::UnsupportedFrame),
        Some(Ok(Message::Close(frame))) => Step::End(Disconnect::Closed {
            code: frame.map(|frame| frame.code),
        }),
        Some(Err(error)) => Step::End(Disconnect::TransportError(error)),
        None => Step::End(Disconnect::StreamEnded),
    }
}

/// Drive one client's session to completion. Never fails: every way a
/// connection can end is a [`Disconnect`], followed by the same cleanup.
pub async fn run(socket: WebSocket, client_id: String, hub: Arc<Hub>) {
    let config = hub.config();
    let (sink, mut stream) = socket.split();
    let (outbox, inbox) = mpsc::channel(config.outbound_capacity.max(1));
    let mut writer = tokio::spawn(write_outbound(sink, inbox));

    let registry = Arc::clone(hub.registry());
    let handle = ConnectionHandle::new(registry.next_id(), client_id.as_str(), outbox);
    let eviction = handle.eviction();
    let registration = Registration::new(registry, handle);
    let conn_id = registration.id();
    info!(%conn_id, client_id = %client_id, "client joined");

    let dispatcher = hub.dispatcher();
    dispatcher.broadcast(&join_notice(&client_id)).await;

    let reason = relay_inbound(&mut stream, &mut writer, &eviction, dispatcher, &client_id).await;

    // Dropping the released handle closes our end of the outbox.
    drop(registration.release());
    info!(%conn_id, client_id = %client_id, ?reason, "client left");
    dispatcher.broadcast(&leave_notice(&client_id)).await;

    if !matches!(reason, Disconnect::WriterGone) {
        drain_writer(writer, config.drain_timeout).await;
    }
}

async fn relay_inbound(
    stream: &mut SplitStream<WebSocket>,
    writer: &mut JoinHandle<()>,
    eviction: &Eviction,
    dispatcher: &BroadcastDispatcher,
    client_id: &str,
) -> Disconnect {
    loop {
        select! {
            frame = stream.next() => match classify(frame) {
                Step::Relay(payload) => {
                    dispatcher.broadcast(&chat_line(client_id, &payload)).await;
                }
                Step::Skip => {}
                Step::End(reason) => return reason,
            },
            _ = &mut *writer => return Disconnect::WriterGone,
            _ = eviction.requested() => return Disconnect::Evicted,
        }
    }
}

async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut inbox: mpsc::Receiver<String>,
) {
    while let Some(text) = inbox.recv().await {
        if let Err(error) = sink.send(Message::Text(text)).await {
            debug!(?error, "failed to deliver frame to client");
            return;
        }
    }

    if let Err(error) = sink.close().await {
        debug!(?error, "failed to close websocket cleanly");
    }
}

// Broadcasts still holding a snapshot clone of our handle keep the writer
// alive until their send resolves; past the drain window we stop waiting.
async fn drain_writer(mut writer: JoinHandle<()>, drain_timeout: Duration) {
    if timeout(drain_timeout, &mut writer).await.is_err() {
        debug!("writer still busy after drain window, aborting");
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use axum::extract::ws::CloseFrame;

    use super::*;

    fn registered(
        registry: &Arc<ConnectionRegistry>,
        client_id: &str,
    ) -> (Registration, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new(registry.next_id(), client_id, tx);
        (Registration::new(Arc::clone(registry), handle), rx)
    }

    #[test]
    fn release_deregisters_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (alice, _alice_rx) = registered(&registry, "alice");
        let (bob, _bob_rx) = registered(&registry, "bob");
        let bob_id = bob.id();

        let released = alice.release().expect("alice was registered");
        assert_eq!(released.client_id(), "alice");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(bob_id));
        drop(bob);
        assert!(registry.is_empty());
    }

    #[test]
    fn dropping_the_guard_deregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        {
            let (_alice, _alice_rx) = registered(&registry, "alice");
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancelled_session_task_still_deregisters() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (alice, _alice_rx) = registered(&registry, "alice");
        let task = tokio::spawn(async move {
            let _alice = alice;
            std::future::pending::<()>().await;
        });

        assert_eq!(registry.len(), 1);
        task.abort();
        let _ = task.await;
        assert!(registry.is_empty());
    }

    #[test]
    fn text_frames_are_relayed_verbatim() {
        assert!(matches!(
            classify(Some(Ok(Message::Text("hi".into())))),
            Step::Relay(text) if text == "hi"
        ));
        assert!(matches!(
            classify(Some(Ok(Message::Text(String::new())))),
            Step::Relay(text) if text.is_empty()
        ));
    }

    #[test]
    fn control_frames_are_skipped() {
        assert!(matches!(classify(Some(Ok(Message::Ping(vec![1])))), Step::Skip));
        assert!(matches!(classify(Some(Ok(Message::Pong(Vec::new())))), Step::Skip));
    }

    #[test]
    fn every_disconnect_signal_ends_the_loop() {
        assert!(matches!(
            classify(Some(Ok(Message::Binary(vec![0xff])))),
            Step::End(Disconnect::UnsupportedFrame)
        ));
        assert!(matches!(
            classify(Some(Ok(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "bye".into(),
            }))))),
            Step::End(Disconnect::Closed { code: Some(1000) })
        ));
        assert!(matches!(
            classify(Some(Ok(Message::Close(None)))),
            Step::End(Disconnect::Closed { code: None })
        ));
        assert!(matches!(
            classify(Some(Err(axum::Error::new(io::Error::from(
                io::ErrorKind::ConnectionReset
            ))))),
            Step::End(Disconnect::TransportError(_))
        ));
        assert!(matches!(classify(None), Step::End(Disconnect::StreamEnded)));
    }
}
