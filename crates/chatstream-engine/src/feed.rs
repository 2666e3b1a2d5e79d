//! Async feed loop connecting a transport stream to the engine.
//!
//! The engine itself is synchronous; this loop awaits one raw event at a
//! time so the single-threaded ordering guarantee holds, and it owns the one
//! deferred operation (the post-completion purge timer).

use std::sync::Arc;

use futures::{Stream, StreamExt as _};
use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::StreamEngine;
use crate::event::{EventKind, RawEvent};

/// Pumps a stream of raw events into the engine until the stream ends.
///
/// The generation token is captured when the loop starts, so a concurrent
/// `reset` turns the remainder of the loop into a no-op instead of letting a
/// cancelled stream corrupt the state of its successor. After a `done` event
/// the loop sleeps out the purge grace window and applies the purge if the
/// generation is still valid.
pub async fn feed_events<S>(engine: Arc<Mutex<StreamEngine>>, events: S)
where
    S: Stream<Item = RawEvent>,
{
    let generation = engine.lock().await.generation();
    let mut saw_done = false;

    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        if EventKind::from_name(&event.name) == Some(EventKind::Done) {
            saw_done = true;
        }
        engine
            .lock()
            .await
            .handle_from(generation, &event.name, &event.payload);
    }

    if saw_done {
        let grace = engine.lock().await.options().purge_grace;
        tokio::time::sleep(grace).await;
        let mut guard = engine.lock().await;
        if guard.generation() == generation && guard.purge_now_if_due() {
            debug!(%generation, "purged completed message buffer after grace window");
        }
    }
}

/// Spawns [`feed_events`] on the current tokio runtime.
pub fn spawn_feed<S>(
    engine: Arc<Mutex<StreamEngine>>,
    events: S,
) -> tokio::task::JoinHandle<()>
where
    S: Stream<Item = RawEvent> + Send + 'static,
{
    tokio::spawn(feed_events(engine, events))
}
