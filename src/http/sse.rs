//! `GET /events` (§4.9, §9 "generator-style SSE stream").
//!
//! Models the stream as a bounded async queue per subscriber: the event
//! bus's broadcast receiver is wrapped so a lagging client drops old
//! events rather than blocking publishers, matching §4.9's "no
//! backpressure, drop on full buffer" rule.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;

use crate::bus::BusEvent;

/// Forward the bus onto an SSE stream until the client disconnects.
pub fn stream(rx: broadcast::Receiver<BusEvent>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().event(event.topic).data(data)), rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("keep-alive"))
}
