//! Subscription registry and live event fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::event::Event;
use crate::filter::FilterSet;
use crate::msg::ServerMsg;

/// Errors returned by subscription registry operations.
#[derive(Debug, Error, PartialEq)]
pub enum RouterError {
    #[error("too many subscriptions")]
    TooManySubscriptions,

    #[error("subscription not found")]
    NotFound,
}

/// A standing query registered by one connection.
///
/// The sink is the connection's bounded outbound queue; frames for this
/// subscription are tagged with its id.
struct Subscription {
    sub_id: String,
    filters: FilterSet,
    sink: mpsc::Sender<ServerMsg>,
}

/// Process-wide registry of live subscriptions, keyed by connection id.
///
/// All operations take the registry lock, so each is atomic with respect
/// to concurrent publishes: once `close` or `delete` returns, no further
/// frames are enqueued for the removed subscriptions.
pub struct Router {
    max_subs_per_conn: usize,
    conns: Mutex<HashMap<String, HashMap<String, Subscription>>>,
    dropped: AtomicU64,
}

impl Router {
    pub fn new(max_subs_per_conn: usize) -> Self {
        Router {
            max_subs_per_conn,
            conns: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a subscription and make it visible to subsequent publishes.
    ///
    /// Reusing a (connection, subscription) id pair replaces the previous
    /// subscription; a replacement never counts against the cap.
    pub async fn subscribe(
        &self,
        conn_id: &str,
        sub_id: &str,
        filters: FilterSet,
        sink: mpsc::Sender<ServerMsg>,
    ) -> Result<(), RouterError> {
        let mut conns = self.conns.lock().await;
        let subs = conns.entry(conn_id.to_string()).or_default();
        if !subs.contains_key(sub_id) && subs.len() >= self.max_subs_per_conn {
            if subs.is_empty() {
                conns.remove(conn_id);
            }
            return Err(RouterError::TooManySubscriptions);
        }
        let replaced = subs
            .insert(
                sub_id.to_string(),
                Subscription {
                    sub_id: sub_id.to_string(),
                    filters,
                    sink,
                },
            )
            .is_some();
        debug!(conn = %conn_id, sub = %sub_id, replaced, "subscribed");
        Ok(())
    }

    /// Remove one subscription; no frames are enqueued for it afterwards.
    pub async fn close(&self, conn_id: &str, sub_id: &str) -> Result<(), RouterError> {
        let mut conns = self.conns.lock().await;
        let subs = conns.get_mut(conn_id).ok_or(RouterError::NotFound)?;
        subs.remove(sub_id).ok_or(RouterError::NotFound)?;
        if subs.is_empty() {
            conns.remove(conn_id);
        }
        debug!(conn = %conn_id, sub = %sub_id, "closed subscription");
        Ok(())
    }

    /// Remove every subscription owned by a connection. Idempotent.
    pub async fn delete(&self, conn_id: &str) {
        if self.conns.lock().await.remove(conn_id).is_some() {
            debug!(conn = %conn_id, "deleted connection subscriptions");
        }
    }

    /// Fan an event out to every live subscription whose filters match.
    ///
    /// Sends never block: a full sink loses this delivery (the drop counter
    /// records it) so one slow subscriber cannot stall the publisher.
    /// Returns the number of frames enqueued.
    pub async fn publish(&self, ev: &Arc<Event>) -> usize {
        let conns = self.conns.lock().await;
        let mut delivered = 0;
        for (conn_id, subs) in conns.iter() {
            for sub in subs.values() {
                if !sub.filters.matches(ev) {
                    continue;
                }
                match sub.sink.try_send(ServerMsg::event(&sub.sub_id, ev.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(conn = %conn_id, sub = %sub.sub_id, "subscriber queue full, event dropped");
                    }
                    // receiver gone; the connection is unwinding and will
                    // deregister itself
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        delivered
    }

    /// Total deliveries lost to full subscriber queues.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
