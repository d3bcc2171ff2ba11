//! Fan-out of one message to every registered connection.

use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Why a single delivery attempt failed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    /// An earlier send timed out and the connection is on its way out.
    #[error("connection evicted")]
    Evicted,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

/// Outcome counts for one broadcast.
///
/// This is the only way failures leave [`BroadcastDispatcher::broadcast`];
/// they are never returned as errors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Recipients that were gone or already evicted.
    pub closed: usize,
    pub timed_out: usize,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed()
    }

    pub fn failed(&self) -> usize {
        self.closed + self.timed_out
    }

    fn record(&mut self, outcome: Result<(), SendError>) {
        match outcome {
            Ok(()) => self.delivered += 1,
            Err(SendError::Closed | SendError::Evicted) => self.closed += 1,
            Err(SendError::TimedOut(_)) => self.timed_out += 1,
        }
    }
}

/// Sends text to every connection in a registry snapshot.
///
/// Deliveries run concurrently and each one is bounded by `send_timeout`, so
/// a stalled recipient costs at most one timeout for the whole broadcast. A
/// recipient that times out is evicted: its session is told to close, and
/// later broadcasts skip it without waiting.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn broadcast(&self, message: &str) -> DeliveryReport {
        let targets = self.registry.snapshot();
        let attempts = targets.iter().map(|target| self.deliver(target, message));
        let outcomes = join_all(attempts).await;

        let mut report = DeliveryReport::default();
        for outcome in outcomes {
            report.record(outcome);
        }

        if report.failed() > 0 {
            debug!(
                delivered = report.delivered,
                closed = report.closed,
                timed_out = report.timed_out,
                "broadcast completed with failures"
            );
        }
        report
    }

    async fn deliver(&self, target: &ConnectionHandle, message: &str) -> Result<(), SendError> {
        let outcome = match timeout(self.send_timeout, target.send(message.to_owned())).await {
            Ok(sent) => sent,
            Err(_) => {
                if target.eviction().request() {
                    info!(
                        conn_id = %target.id(),
                        client_id = target.client_id(),
                        "evicting connection that stopped reading"
                    );
                }
                Err(SendError::TimedOut(self.send_timeout))
            }
        };

        if let Err(error) = &outcome {
            debug!(
                conn_id = %target.id(),
                client_id = target.client_id(),
                %error,
                "dropping message for unreachable connection"
            );
        }
        outcome
    }
}
