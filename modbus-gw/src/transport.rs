//! One physical bus shared by every pool bound to it.
//!
//! All operations are serialized through the bus's [`PriorityMutex`]. When
//! the link drops, the transport flips to disconnected, fails new calls
//! immediately and reopens the channel on a fixed delay in the background.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::channel::RegisterChannel;
use crate::mutex::{COMMAND_PRIORITY, LockCanceled, PriorityMutex};

/// Errors from bus operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bus is not connected")]
    Disconnected,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Device exception: {0}")]
    Exception(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Canceled(#[from] LockCanceled),
}

impl TransportError {
    /// Errors that mean the link itself is gone.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Connection(_))
    }

    /// Errors worth spending retry budget on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Exception(_) | Self::Protocol(_))
    }
}

/// Per-call scheduling options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOptions {
    /// Queue priority, lower is sooner.
    pub priority: u32,
    /// Bound on the channel call itself; the bus default when `None`.
    pub timeout: Option<Duration>,
    /// Retries after a retryable failure.
    pub ttl: u32,
}

impl Default for OperationOptions {
    fn default() -> Self {
        Self {
            priority: COMMAND_PRIORITY,
            timeout: None,
            ttl: 0,
        }
    }
}

impl OperationOptions {
    pub fn new(priority: u32, timeout: Duration, ttl: u32) -> Self {
        Self {
            priority,
            timeout: Some(timeout),
            ttl,
        }
    }
}

/// Owner of one register channel.
pub struct Transport {
    name: String,
    default_timeout: Duration,
    reconnect_delay: Duration,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    mutex: PriorityMutex,
    channel: tokio::sync::Mutex<Box<dyn RegisterChannel>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("mutex", &self.mutex)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Wrap `channel`. Nothing is opened until [`connect`](Self::connect).
    pub fn new(
        name: impl Into<String>,
        channel: Box<dyn RegisterChannel>,
        default_timeout: Duration,
        reconnect_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            default_timeout,
            reconnect_delay,
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            mutex: PriorityMutex::new(),
            channel: tokio::sync::Mutex::new(channel),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Whether an operation currently holds the bus.
    pub fn is_busy(&self) -> bool {
        self.mutex.is_locked()
    }

    /// Open the channel. On failure the reconnect loop takes over.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let result = {
            let mut channel = self.channel.lock().await;
            info!(transport = %self.name, endpoint = %channel.describe(), "Opening bus");
            channel.open().await
        };

        match result {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(transport = %self.name, "Bus connected");
                Ok(())
            }
            Err(err) => {
                warn!(transport = %self.name, error = %err, "Bus connection failed");
                self.connected.store(false, Ordering::SeqCst);
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// Read `length` holding registers.
    pub async fn read_block(
        self: &Arc<Self>,
        unit: u8,
        offset: u16,
        length: u16,
        options: OperationOptions,
    ) -> Result<Vec<u16>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let this: &Transport = self;
        let result = self
            .mutex
            .run_exclusive_if(
                move || this.read_once(unit, offset, length, timeout),
                options.priority,
                options.ttl,
                TransportError::is_retryable,
            )
            .await;

        self.observe(result)
    }

    /// Write a single holding register.
    pub async fn write_value(
        self: &Arc<Self>,
        unit: u8,
        offset: u16,
        value: u16,
        options: OperationOptions,
    ) -> Result<(), TransportError> {
        self.write_block(unit, offset, &[value], options).await
    }

    /// Write consecutive holding registers.
    pub async fn write_block(
        self: &Arc<Self>,
        unit: u8,
        offset: u16,
        values: &[u16],
        options: OperationOptions,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let this: &Transport = self;
        let result = self
            .mutex
            .run_exclusive_if(
                move || this.write_once(unit, offset, values, timeout),
                options.priority,
                options.ttl,
                TransportError::is_retryable,
            )
            .await;

        self.observe(result)
    }

    /// Reject every operation still waiting for the bus.
    pub fn cancel_pending(&self) {
        self.mutex.cancel_all();
    }

    /// Close the channel for good. No reconnection is attempted afterwards.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.mutex.cancel_all();
        self.channel.lock().await.close().await;
        debug!(transport = %self.name, "Bus closed");
    }

    async fn read_once(
        &self,
        unit: u8,
        offset: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, TransportError> {
        let mut channel = self.channel.lock().await;
        if !channel.is_open() {
            return Err(TransportError::Disconnected);
        }

        trace!(transport = %self.name, unit, offset, length, "Read block");
        match tokio::time::timeout(timeout, channel.read_block(unit, offset, length)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn write_once(
        &self,
        unit: u8,
        offset: u16,
        values: &[u16],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        if !channel.is_open() {
            return Err(TransportError::Disconnected);
        }

        trace!(transport = %self.name, unit, offset, ?values, "Write block");
        match tokio::time::timeout(timeout, channel.write_block(unit, offset, values)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Flip to disconnected on connectivity errors.
    fn observe<T>(self: &Arc<Self>, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(err) = &result {
            if err.is_connectivity() && self.connected.swap(false, Ordering::SeqCst) {
                warn!(transport = %self.name, error = %err, "Bus connection lost");
                self.schedule_reconnect();
            }
        }
        result
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let delay = self.reconnect_delay;
        let name = self.name.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                if transport.closed.load(Ordering::SeqCst) {
                    transport.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }

                let result = {
                    let mut channel = transport.channel.lock().await;
                    channel.close().await;
                    channel.open().await
                };

                match result {
                    Ok(()) => {
                        transport.reconnecting.store(false, Ordering::SeqCst);
                        transport.connected.store(true, Ordering::SeqCst);
                        info!(transport = %name, "Bus reconnected");
                        return;
                    }
                    Err(err) => {
                        debug!(transport = %name, error = %err, "Reconnect attempt failed");
                    }
                }
            }
        });
    }
}
