//! Register channels: the byte-level side of a bus.
//!
//! [`RegisterChannel`] is what a [`Transport`](crate::transport::Transport)
//! drives. [`ModbusChannel`] talks Modbus TCP or RTU through `tokio-modbus`.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::transport::TransportError;

/// Physical access to holding registers.
#[async_trait]
pub trait RegisterChannel: Send {
    /// Open (or reopen) the underlying link.
    async fn open(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Read `length` holding registers of `unit` starting at `offset`.
    async fn read_block(
        &mut self,
        unit: u8,
        offset: u16,
        length: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write consecutive holding registers of `unit` starting at `offset`.
    async fn write_block(
        &mut self,
        unit: u8,
        offset: u16,
        values: &[u16],
    ) -> Result<(), TransportError>;

    async fn close(&mut self);

    /// Human readable endpoint, for logs.
    fn describe(&self) -> String;
}

/// Modbus TCP or RTU link.
pub struct ModbusChannel {
    connection: ConnectionConfig,
    connect_timeout: Duration,
    ctx: Option<Context>,
}

impl ModbusChannel {
    /// Create a closed channel for `connection`.
    ///
    /// `connection` must be TCP or RTU; opening a simulated connection fails.
    pub fn new(connection: ConnectionConfig, connect_timeout: Duration) -> Self {
        Self {
            connection,
            connect_timeout,
            ctx: None,
        }
    }

    fn context(&mut self) -> Result<&mut Context, TransportError> {
        self.ctx.as_mut().ok_or(TransportError::Disconnected)
    }

    /// The returned future borrows nothing from the channel.
    async fn connect(
        connection: ConnectionConfig,
        connect_timeout: Duration,
    ) -> Result<Context, TransportError> {
        match connection {
            ConnectionConfig::Tcp { host, port } => {
                let addr: SocketAddr = tokio::net::lookup_host((host.as_str(), port))
                    .await
                    .map_err(|e| TransportError::Connection(format!("Invalid address: {}", e)))?
                    .next()
                    .ok_or_else(|| {
                        TransportError::Connection(format!("No address for {}:{}", host, port))
                    })?;

                let ctx = tokio::time::timeout(connect_timeout, tcp::connect(addr))
                    .await
                    .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
                    .map_err(|e| TransportError::Connection(e.to_string()))?;

                Ok(ctx)
            }
            ConnectionConfig::Rtu {
                port,
                baud_rate,
                data_bits,
                parity,
                stop_bits,
            } => {
                let parity = match parity.to_lowercase().as_str() {
                    "even" => tokio_serial::Parity::Even,
                    "odd" => tokio_serial::Parity::Odd,
                    _ => tokio_serial::Parity::None,
                };

                let stop_bits = match stop_bits {
                    2 => tokio_serial::StopBits::Two,
                    _ => tokio_serial::StopBits::One,
                };

                let data_bits = match data_bits {
                    5 => tokio_serial::DataBits::Five,
                    6 => tokio_serial::DataBits::Six,
                    7 => tokio_serial::DataBits::Seven,
                    _ => tokio_serial::DataBits::Eight,
                };

                let builder = tokio_serial::new(port.as_str(), baud_rate)
                    .parity(parity)
                    .stop_bits(stop_bits)
                    .data_bits(data_bits);

                let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    TransportError::Connection(format!("Serial open failed: {}", e))
                })?;

                Ok(rtu::attach(serial))
            }
            ConnectionConfig::Simulated { .. } => Err(TransportError::Connection(
                "Simulated connections have no Modbus link".to_string(),
            )),
        }
    }

    /// Drop the context after an I/O failure so the reconnect loop reopens it.
    fn fail<T>(&mut self, err: impl std::fmt::Display) -> Result<T, TransportError> {
        self.ctx = None;
        Err(TransportError::Connection(err.to_string()))
    }
}

#[async_trait]
impl RegisterChannel for ModbusChannel {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.ctx = None;
        let ctx = Self::connect(self.connection.clone(), self.connect_timeout).await?;
        debug!(endpoint = %self.describe(), "Modbus link open");
        self.ctx = Some(ctx);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_block(
        &mut self,
        unit: u8,
        offset: u16,
        length: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.context()?;
        ctx.set_slave(Slave(unit));
        trace!(unit, offset, length, "Reading holding registers");

        match ctx.read_holding_registers(offset, length).await {
            Ok(Ok(values)) if values.len() == usize::from(length) => Ok(values),
            Ok(Ok(values)) => Err(TransportError::Protocol(format!(
                "Expected {} registers, got {}",
                length,
                values.len()
            ))),
            Ok(Err(exception)) => Err(TransportError::Exception(format!("{:?}", exception))),
            Err(e) => self.fail(e),
        }
    }

    async fn write_block(
        &mut self,
        unit: u8,
        offset: u16,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let ctx = self.context()?;
        ctx.set_slave(Slave(unit));
        trace!(unit, offset, ?values, "Writing holding registers");

        let result = match values {
            [] => return Ok(()),
            [value] => ctx.write_single_register(offset, *value).await,
            _ => ctx.write_multiple_registers(offset, values).await,
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => Err(TransportError::Exception(format!("{:?}", exception))),
            Err(e) => self.fail(e),
        }
    }

    async fn close(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
    }

    fn describe(&self) -> String {
        match &self.connection {
            ConnectionConfig::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            ConnectionConfig::Rtu {
                port, baud_rate, ..
            } => format!("rtu://{}@{}", port, baud_rate),
            ConnectionConfig::Simulated { .. } => "simulated".to_string(),
        }
    }
}
