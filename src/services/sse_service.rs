use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, watch,
};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{debug, info, warn};

use crate::{
    dto::{
        session::SessionSnapshot,
        sse::{Handshake, ServerEvent},
    },
    services::notices::Notice,
    state::SharedState,
};

/// Event name of full session snapshots.
pub const SNAPSHOT_EVENT: &str = "snapshot";
/// Event name of passive notices.
pub const NOTICE_EVENT: &str = "notice";
/// Event name of the connection handshake.
pub const HANDSHAKE_EVENT: &str = "handshake";

/// Open the session stream: a handshake, the current snapshot, then every
/// subsequent snapshot change and notice.
pub fn session_stream(state: &SharedState) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let session = state.session();
    let handshake = Handshake {
        stream: "session".into(),
        message: "session stream connected".into(),
        phase: session.snapshot().phase,
        degraded: state.is_degraded(),
    };

    let receiver = spawn_forwarder(
        ServerEvent::json(Some(HANDSHAKE_EVENT.to_string()), &handshake).ok(),
        session.subscribe(),
        state.notices().subscribe(),
    );
    to_sse_stream(receiver)
}

/// Merge snapshot changes and notices into a single bounded channel of
/// server events; the task ends once the receiving side is dropped.
pub fn spawn_forwarder(
    handshake: Option<ServerEvent>,
    mut snapshots: watch::Receiver<SessionSnapshot>,
    mut notices: broadcast::Receiver<Notice>,
) -> mpsc::Receiver<ServerEvent> {
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<ServerEvent>(8);

    tokio::spawn(async move {
        let current = snapshots.borrow_and_update().clone();
        let opening = handshake.into_iter().chain(snapshot_event(&current));
        for event in opening {
            if tx.send(event).await.is_err() {
                return;
            }
        }

        loop {
            let event = tokio::select! {
                _ = tx.closed() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    snapshot_event(&snapshot)
                }
                received = notices.recv() => match received {
                    Ok(notice) => notice_event(&notice),
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "session stream lagged behind notices");
                        continue;
                    }
                },
            };

            let Some(event) = event else {
                continue;
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }

        info!("Session SSE stream disconnected");
    });

    rx
}

/// Turn forwarded server events into an SSE response with keep-alives.
pub fn to_sse_stream(
    receiver: mpsc::Receiver<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // when the client disconnects axum drops this stream, closing the forwarder
    let stream = ReceiverStream::new(receiver).map(|payload| {
        let mut event = Event::default().data(payload.data);
        if let Some(name) = payload.event {
            event = event.event(name);
        }
        Ok(event)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn snapshot_event(snapshot: &SessionSnapshot) -> Option<ServerEvent> {
    ServerEvent::json(Some(SNAPSHOT_EVENT.to_string()), snapshot)
        .inspect_err(|err| warn!(error = %err, "failed to serialize session snapshot"))
        .ok()
}

fn notice_event(notice: &Notice) -> Option<ServerEvent> {
    ServerEvent::json(Some(NOTICE_EVENT.to_string()), notice)
        .inspect_err(|err| warn!(error = %err, "failed to serialize notice"))
        .ok()
}
