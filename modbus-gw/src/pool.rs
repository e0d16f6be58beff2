//! Register pools: contiguous blocks polled as one unit.
//!
//! A pool reads `length` registers of one unit through its [`Transport`] on
//! a [`ScheduledTask`], keeps the last snapshot and broadcasts
//! [`PoolEvent`]s. Concurrent refreshes share one transport read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::mutex::POLL_PRIORITY;
use crate::schedule::{Action, ScheduledTask};
use crate::transport::{OperationOptions, Transport, TransportError};

const EVENT_CAPACITY: usize = 64;

/// Pool errors. Cloneable so every caller joined to one refresh gets the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Fields {field}..{end} are outside pool '{pool}' (length {length})")]
    OutOfRange {
        pool: String,
        field: u16,
        end: usize,
        length: u16,
    },
    #[error("Refresh aborted")]
    Aborted,
}

/// Notifications from a pool, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// The snapshot changed.
    Update(Arc<[u16]>),
    /// A refresh failed.
    Error(String),
    /// A refresh finished. Always follows `Update` or `Error` of the same refresh.
    Done { changed: bool },
}

type PendingRefresh = Shared<BoxFuture<'static, Result<(), PoolError>>>;

/// A periodically refreshed block of holding registers.
pub struct RegisterPool {
    name: String,
    unit: u8,
    offset: u16,
    length: u16,
    interval: Duration,
    dilation: u32,
    read_timeout: Duration,
    write_timeout: Duration,
    ttl: u32,
    transport: Arc<Transport>,
    values: RwLock<Option<Arc<[u16]>>>,
    available: AtomicBool,
    in_flight: Mutex<Option<PendingRefresh>>,
    events: broadcast::Sender<PoolEvent>,
    task: ScheduledTask,
}

impl std::fmt::Debug for RegisterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterPool")
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("transport", &self.transport.name())
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

impl RegisterPool {
    /// Create a pool on `transport`. Polling starts with [`start_polling`](Self::start_polling).
    ///
    /// Unset timeouts inherit the transport default.
    pub fn new(config: &PoolConfig, transport: Arc<Transport>) -> Arc<Self> {
        let interval = Duration::from_millis(config.interval_ms);
        let read_timeout = config
            .read_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| transport.default_timeout());
        let write_timeout = config
            .write_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| transport.default_timeout());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let poller = weak.clone();
            let action: Action = Arc::new(move || {
                let poller = poller.clone();
                async move {
                    if let Some(pool) = poller.upgrade() {
                        let _ = pool.refresh(POLL_PRIORITY).await;
                    }
                }
                .boxed()
            });

            Self {
                name: config.name.clone(),
                unit: config.unit,
                offset: config.offset,
                length: config.length,
                interval,
                dilation: config.interval_dilation.max(1),
                read_timeout,
                write_timeout,
                ttl: config.ttl,
                transport,
                values: RwLock::new(None),
                available: AtomicBool::new(true),
                in_flight: Mutex::new(None),
                events,
                task: ScheduledTask::new(format!("pool:{}", config.name), interval, action),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Last snapshot, `None` until the first successful read.
    pub fn values(&self) -> Option<Arc<[u16]>> {
        self.values.read().clone()
    }

    /// Whether the transport is up and the last refresh succeeded.
    pub fn available(&self) -> bool {
        self.transport.is_connected() && self.available.load(Ordering::SeqCst)
    }

    /// Current polling interval, dilated after a failure.
    pub fn poll_interval(&self) -> Duration {
        self.task.interval()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Start periodic refreshes. A zero interval disables polling.
    pub fn start_polling(&self) {
        self.task.start();
        debug!(pool = %self.name, interval_ms = self.interval.as_millis() as u64, "Polling started");
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    /// Read the block and update the snapshot.
    ///
    /// Joins the refresh already in flight, if any. The read runs on its own
    /// task, so it completes even if every caller stops waiting.
    pub async fn refresh(self: &Arc<Self>, priority: u32) -> Result<(), PoolError> {
        let pending = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.as_ref() {
                Some(pending) => {
                    trace!(pool = %self.name, "Joining in-flight refresh");
                    pending.clone()
                }
                None => {
                    let pool = Arc::clone(self);
                    let handle = tokio::spawn(async move { pool.refresh_once(priority).await });
                    let pending = async move { handle.await.unwrap_or(Err(PoolError::Aborted)) }
                        .boxed()
                        .shared();
                    *in_flight = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Write `words` at `field` and reconcile with a fresh read.
    ///
    /// The snapshot is patched as soon as the write succeeds. The follow-up
    /// read waits for any refresh already in flight; its failure is logged,
    /// not returned.
    pub async fn set(self: &Arc<Self>, field: u16, words: &[u16], priority: u32) -> Result<(), PoolError> {
        let start = usize::from(field);
        let end = start + words.len();
        if words.is_empty() || end > usize::from(self.length) {
            return Err(PoolError::OutOfRange {
                pool: self.name.clone(),
                field,
                end,
                length: self.length,
            });
        }

        let options = OperationOptions::new(priority, self.write_timeout, self.ttl);
        self.transport
            .write_block(self.unit, self.offset.wrapping_add(field), words, options)
            .await?;
        debug!(pool = %self.name, field, ?words, "Registers written");

        let patched = {
            let mut current = self.values.write();
            let next = match current.as_deref() {
                Some(values) if &values[start..end] != words => {
                    let mut next = values.to_vec();
                    next[start..end].copy_from_slice(words);
                    Some(next)
                }
                _ => None,
            };
            next.map(|next| {
                let snapshot: Arc<[u16]> = next.into();
                *current = Some(Arc::clone(&snapshot));
                snapshot
            })
        };
        if let Some(snapshot) = patched {
            let _ = self.events.send(PoolEvent::Update(snapshot));
        }

        let pending = self.in_flight.lock().clone();
        if let Some(pending) = pending {
            let _ = pending.await;
        }
        if let Err(err) = self.refresh(priority).await {
            debug!(pool = %self.name, error = %err, "Read-back after write failed");
        }

        Ok(())
    }

    async fn refresh_once(&self, priority: u32) -> Result<(), PoolError> {
        let options = OperationOptions::new(priority, self.read_timeout, self.ttl);
        let result = self
            .transport
            .read_block(self.unit, self.offset, self.length, options)
            .await;

        let outcome = match result {
            Ok(values) => {
                if !self.available.swap(true, Ordering::SeqCst) {
                    info!(pool = %self.name, "Pool available again");
                }
                let changed = self.store(values);
                if let Some(snapshot) = &changed {
                    trace!(pool = %self.name, values = ?snapshot, "Pool data changed");
                    let _ = self.events.send(PoolEvent::Update(Arc::clone(snapshot)));
                }
                let _ = self.events.send(PoolEvent::Done {
                    changed: changed.is_some(),
                });
                self.task.set_interval(self.interval);
                Ok(())
            }
            Err(err) => {
                if self.available.swap(false, Ordering::SeqCst) {
                    warn!(pool = %self.name, error = %err, "Pool refresh failed");
                } else {
                    debug!(pool = %self.name, error = %err, "Pool still unavailable");
                }
                let _ = self.events.send(PoolEvent::Error(err.to_string()));
                let _ = self.events.send(PoolEvent::Done { changed: false });
                self.task.set_interval(self.interval * self.dilation);
                Err(PoolError::Transport(err))
            }
        };

        *self.in_flight.lock() = None;
        outcome
    }

    /// Replace the snapshot if `values` differ from it.
    fn store(&self, values: Vec<u16>) -> Option<Arc<[u16]>> {
        let mut current = self.values.write();
        if current.as_deref() == Some(values.as_slice()) {
            return None;
        }
        let snapshot: Arc<[u16]> = values.into();
        *current = Some(Arc::clone(&snapshot));
        Some(snapshot)
    }
}

impl Drop for RegisterPool {
    fn drop(&mut self) {
        self.task.stop();
    }
}
