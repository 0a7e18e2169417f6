//! Fair, capacity-aware turn-taking for rate-limited remote resources
//!
//! Callers in any process take a ticket from the shared ledger and wait until
//! the queue's serving cursor reaches it and the resource reports spare
//! capacity. Tickets are served strictly in issue order. A holder renews its
//! lease while its operation runs; one that never releases (crashed process)
//! is force-expired once its lease runs out, and the expiry is logged as an
//! anomaly.

pub mod capacity;

pub use capacity::{CapacityProbe, FixedCapacity, HttpCapacityProbe, UnlimitedCapacity};

use crate::config::SchedulerConfig;
use crate::error::{ErrorClass, Result, SyncError};
use crate::models::Ticket;
use crate::store::{heartbeat_interval, Store};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Queue names for the remote resources
pub const FEED_QUEUE: &str = "notes-api";
pub const DUMP_QUEUE: &str = "dumps";
pub const BOUNDARY_QUEUE: &str = "boundaries";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Granted,
    TimedOut,
}

#[derive(Clone)]
pub struct TicketQueue {
    name: String,
    store: Arc<dyn Store>,
    capacity: Arc<dyn CapacityProbe>,
    poll_interval: Duration,
    lease: Duration,
    turn_timeout: Duration,
    holder: String,
    cancel: CancellationToken,
}

impl TicketQueue {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn Store>,
        capacity: Arc<dyn CapacityProbe>,
        config: &SchedulerConfig,
        holder: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            capacity,
            poll_interval: config.poll_interval(),
            lease: config.ticket_lease(),
            turn_timeout: config.turn_timeout(),
            holder: holder.into(),
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the next ticket; refused once shutdown has been requested
    pub async fn acquire(&self) -> Result<Ticket> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let ticket = self.store.issue_ticket(&self.name, &self.holder).await?;
        debug!(queue = %self.name, ticket = ticket.seq, "Ticket issued");
        Ok(ticket)
    }

    /// Poll until `ticket` is being served and capacity is available
    ///
    /// Returns `TimedOut` after `timeout`; the ticket is still ours and must
    /// be released. Fails with [`SyncError::TicketExpired`] if another waiter
    /// expired this ticket, and [`SyncError::Cancelled`] on shutdown.
    pub async fn wait_turn(&self, ticket: &Ticket, timeout: Duration) -> Result<TurnOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            let state = self.store.queue_state(&self.name).await?;

            if state.now_serving > ticket.seq {
                return Err(SyncError::TicketExpired {
                    queue: self.name.clone(),
                    ticket: ticket.seq,
                });
            }

            if state.now_serving == ticket.seq {
                match self.capacity.available_capacity().await {
                    Ok(slots) if slots > 0 => {
                        debug!(queue = %self.name, ticket = ticket.seq, slots, "Turn granted");
                        return Ok(TurnOutcome::Granted);
                    },
                    Ok(_) => debug!(queue = %self.name, ticket = ticket.seq, "No capacity, waiting"),
                    Err(e)
                        if matches!(e.class(), ErrorClass::TransientIo | ErrorClass::Capacity) =>
                    {
                        debug!(queue = %self.name, error = %e, "Capacity check failed, waiting")
                    },
                    Err(e) => return Err(e),
                }
            } else {
                let held_for = (Utc::now() - state.serving_since).to_std().unwrap_or_default();
                if held_for > self.lease
                    && self.store.expire_ticket(&self.name, state.now_serving).await?
                {
                    warn!(
                        queue = %self.name,
                        ticket = state.now_serving,
                        held_secs = held_for.as_secs(),
                        lease_secs = self.lease.as_secs(),
                        anomaly = "ticket_lease_expired",
                        "Force-expired ticket whose holder never released it"
                    );
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(queue = %self.name, ticket = ticket.seq, "Timed out waiting for turn");
                return Ok(TurnOutcome::TimedOut);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval.min(deadline - now)) => {},
            }
        }
    }

    /// Run `work` while renewing the lease on `ticket`
    pub async fn hold_turn<Fut: Future>(&self, ticket: &Ticket, work: Fut) -> Fut::Output {
        let every = heartbeat_interval(self.lease);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = heartbeat.tick() => match self.store.renew_ticket(&self.name, ticket.seq).await {
                    Ok(true) => debug!(queue = %self.name, ticket = ticket.seq, "Ticket lease renewed"),
                    Ok(false) => warn!(
                        queue = %self.name,
                        ticket = ticket.seq,
                        anomaly = "ticket_lost",
                        "Ticket no longer served while its operation was still running"
                    ),
                    Err(e) => warn!(queue = %self.name, ticket = ticket.seq, error = %e, "Failed to renew ticket"),
                },
            }
        }
    }

    pub async fn release(&self, ticket: &Ticket) -> Result<()> {
        self.store.release_ticket(&self.name, ticket.seq).await?;
        debug!(queue = %self.name, ticket = ticket.seq, "Ticket released");
        Ok(())
    }

    /// Take a ticket, wait for the turn, run `op`, release
    ///
    /// The ticket's lease is renewed while `op` runs, so other waiters never
    /// expire a live holder. The ticket is released on every path, including
    /// timeout and failure. A timeout surfaces as [`SyncError::TicketTimeout`].
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ticket = self.acquire().await?;

        let result = match self.wait_turn(&ticket, self.turn_timeout).await {
            Ok(TurnOutcome::Granted) => self.hold_turn(&ticket, op()).await,
            Ok(TurnOutcome::TimedOut) => Err(SyncError::TicketTimeout {
                queue: self.name.clone(),
                ticket: ticket.seq,
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = self.release(&ticket).await {
            warn!(queue = %self.name, ticket = ticket.seq, error = %e, "Failed to release ticket");
        }
        result
    }
}
