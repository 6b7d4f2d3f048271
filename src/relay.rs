//! Relay facade composing the event cache and the subscription router.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::EventCache;
use crate::config::Settings;
use crate::event::{self, Event};
use crate::filter::FilterSet;
use crate::msg::ServerMsg;
use crate::router::{Router, RouterError};

/// Errors surfaced to the connection layer. Each is recovered per frame:
/// the connection logs it and moves on.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("too many filters ({0})")]
    TooManyFilters(usize),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("created_at {0} outside accepted window")]
    InvalidTimestamp(u64),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("connection send queue closed")]
    SinkClosed,
}

/// Composes the cache and the router behind the operations the connection
/// layer calls.
pub struct Relay {
    cache: EventCache,
    router: Router,
    max_filters_per_req: usize,
    max_event_age: Option<u64>,
}

impl Relay {
    pub fn new(settings: &Settings) -> Self {
        Relay {
            cache: EventCache::new(settings.cache_capacity, settings.admission.clone()),
            router: Router::new(settings.max_subs_per_conn),
            max_filters_per_req: settings.max_filters_per_req,
            max_event_age: settings.max_event_age,
        }
    }

    /// Serve a `REQ`: replay matching history into `sink`, mark the end of
    /// stored events, then register the subscription for live delivery.
    ///
    /// Replay awaits the sink, which only stalls the requesting
    /// connection's own reader. An event published between the history
    /// snapshot and registration can be missed by this subscription.
    pub async fn handle_req(
        &self,
        conn_id: &str,
        sub_id: &str,
        filters: FilterSet,
        sink: mpsc::Sender<ServerMsg>,
    ) -> Result<(), RelayError> {
        if filters.len() > self.max_filters_per_req {
            return Err(RelayError::TooManyFilters(filters.len()));
        }
        let backlog = self.cache.find_all(&filters).await;
        debug!(conn = %conn_id, sub = %sub_id, events = backlog.len(), "replaying stored events");
        for ev in backlog {
            sink.send(ServerMsg::event(sub_id, ev))
                .await
                .map_err(|_| RelayError::SinkClosed)?;
        }
        sink.send(ServerMsg::eose(sub_id))
            .await
            .map_err(|_| RelayError::SinkClosed)?;
        self.router.subscribe(conn_id, sub_id, filters, sink).await?;
        Ok(())
    }

    /// Accept a published event: check timestamp sanity, admit it to the
    /// cache, then fan it out. Returns the number of live deliveries.
    pub async fn handle_event(&self, ev: Event) -> Result<usize, RelayError> {
        if !event::created_at_ok(ev.created_at, unix_now(), self.max_event_age) {
            return Err(RelayError::InvalidTimestamp(ev.created_at));
        }
        let ev = Arc::new(ev);
        let stored = self.cache.save(ev.clone()).await;
        let delivered = self.router.publish(&ev).await;
        debug!(id = %ev.id, stored, delivered, "event accepted");
        Ok(delivered)
    }

    /// Close one subscription.
    pub async fn handle_close(&self, conn_id: &str, sub_id: &str) -> Result<(), RelayError> {
        self.router.close(conn_id, sub_id).await?;
        Ok(())
    }

    /// Release every subscription owned by a connection.
    pub async fn drop_connection(&self, conn_id: &str) {
        self.router.delete(conn_id).await;
    }

    /// Number of events currently cached.
    pub async fn cached_events(&self) -> usize {
        self.cache.len().await
    }

    /// Size bound of the event history.
    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    /// Total live deliveries lost to full subscriber queues.
    pub fn dropped_deliveries(&self) -> u64 {
        self.router.dropped()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
