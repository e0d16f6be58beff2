//! In-memory register bank standing in for field devices.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::RegisterChannel;
use crate::transport::TransportError;

#[derive(Default)]
struct BankState {
    registers: HashMap<(u8, u16), u16>,
    read_failures: VecDeque<TransportError>,
    write_failures: VecDeque<TransportError>,
    latency: Duration,
}

/// Shared register storage behind one or more [`SimulatedChannel`]s.
///
/// Registers never written read back as `seed + address + unit`, saturated
/// to `u16::MAX`. Writes persist.
pub struct SimulatedBank {
    seed: u16,
    state: Mutex<BankState>,
    offline: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
    opens: AtomicUsize,
}

impl std::fmt::Debug for SimulatedBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBank")
            .field("seed", &self.seed)
            .field("reads", &self.reads())
            .field("writes", &self.writes())
            .finish_non_exhaustive()
    }
}

impl SimulatedBank {
    pub fn new(seed: u16) -> Arc<Self> {
        Arc::new(Self {
            seed,
            state: Mutex::new(BankState::default()),
            offline: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        })
    }

    /// A closed channel onto this bank.
    pub fn channel(self: &Arc<Self>) -> SimulatedChannel {
        SimulatedChannel {
            bank: Arc::clone(self),
            open: false,
        }
    }

    fn seed_value(&self, unit: u8, address: u16) -> u16 {
        let value = u32::from(self.seed) + u32::from(address) + u32::from(unit);
        value.min(u32::from(u16::MAX)) as u16
    }

    pub fn get(&self, unit: u8, address: u16) -> u16 {
        self.state
            .lock()
            .registers
            .get(&(unit, address))
            .copied()
            .unwrap_or_else(|| self.seed_value(unit, address))
    }

    pub fn set(&self, unit: u8, address: u16, value: u16) {
        self.state.lock().registers.insert((unit, address), value);
    }

    /// Store consecutive registers starting at `offset`.
    pub fn load(&self, unit: u8, offset: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (address, value) in (offset..).zip(values) {
            state.registers.insert((unit, address), *value);
        }
    }

    /// Make the next read fail with `err`. Queued failures are consumed in order.
    pub fn fail_next_read(&self, err: TransportError) {
        self.state.lock().read_failures.push_back(err);
    }

    /// Make the next write fail with `err`.
    pub fn fail_next_write(&self, err: TransportError) {
        self.state.lock().write_failures.push_back(err);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Take the link down or bring it back.
    ///
    /// While offline, opening fails and open channels fail their next operation.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Number of block reads served or failed.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }
}

/// [`RegisterChannel`] over a [`SimulatedBank`].
#[derive(Debug)]
pub struct SimulatedChannel {
    bank: Arc<SimulatedBank>,
    open: bool,
}

impl SimulatedChannel {
    pub fn bank(&self) -> &Arc<SimulatedBank> {
        &self.bank
    }

    async fn enter(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        let latency = self.bank.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.bank.is_offline() {
            self.open = false;
            return Err(TransportError::Connection("Link down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RegisterChannel for SimulatedChannel {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.bank.opens.fetch_add(1, Ordering::SeqCst);
        if self.bank.is_offline() {
            self.open = false;
            return Err(TransportError::Connection("Link down".to_string()));
        }
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn read_block(
        &mut self,
        unit: u8,
        offset: u16,
        length: u16,
    ) -> Result<Vec<u16>, TransportError> {
        self.bank.reads.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        if let Some(err) = self.bank.state.lock().read_failures.pop_front() {
            return Err(err);
        }

        Ok((0..length)
            .map(|i| self.bank.get(unit, offset.wrapping_add(i)))
            .collect())
    }

    async fn write_block(
        &mut self,
        unit: u8,
        offset: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        self.bank.writes.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        if let Some(err) = self.bank.state.lock().write_failures.pop_front() {
            return Err(err);
        }

        self.bank.load(unit, offset, values);
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
    }

    fn describe(&self) -> String {
        format!("simulated(seed={})", self.bank.seed)
    }
}
