//! Framed byte I/O over TCP sockets and serial lines
//!
//! The polling core talks to the bus through the [`Port`] trait: write a
//! request, then collect a response frame with three stop conditions (a
//! completion predicate, the inter-byte gap, the total budget). The same
//! implementation serves TCP-attached RTU gateways and local serial
//! adapters; only the stream type differs.
//!
//! `read_frame` returning `Ok(0)` means "no response within the total
//! timeout" — the caller decides whether that is an error.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{ModbusError, ModbusResult};
use crate::register::PortConfig;

/// TCP connection establishment budget
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame completion predicate: gets the bytes received so far, returns
/// true when they form a complete frame
pub type FrameCompletePred = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Per-port transfer counters
#[derive(Debug, Clone, Default)]
pub struct PortStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Framed transport used by the transaction engine
#[async_trait]
pub trait Port: Send {
    /// Transmit the whole buffer
    async fn write_bytes(&mut self, buf: &[u8]) -> ModbusResult<()>;

    /// Collect a response frame into `buf`
    ///
    /// Reads until `frame_complete` accepts the received prefix, the
    /// inter-byte gap exceeds `frame_timeout`, or `total_timeout` elapses.
    /// Returns the number of bytes read; 0 means no response at all.
    async fn read_frame(
        &mut self,
        buf: &mut [u8],
        total_timeout: Duration,
        frame_timeout: Duration,
        frame_complete: &FrameCompletePred,
    ) -> ModbusResult<usize>;

    /// Drain incoming bytes until the line has been silent for one
    /// frame timeout
    async fn skip_noise(&mut self) -> ModbusResult<()>;

    /// Enforce the bus guard interval since the previous transaction
    async fn sleep_since_last_interaction(&mut self, min_gap: Duration);

    /// Snapshot of the transfer counters
    fn stats(&self) -> PortStats;
}

/// [`Port`] implementation over any async byte stream
pub struct FramedPort<S> {
    stream: S,
    config: PortConfig,
    last_interaction: Option<Instant>,
    stats: PortStats,
}

impl<S> FramedPort<S> {
    pub fn new(stream: S, config: PortConfig) -> Self {
        Self {
            stream,
            config,
            last_interaction: None,
            stats: PortStats::default(),
        }
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }
}

#[async_trait]
impl<S> Port for FramedPort<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_bytes(&mut self, buf: &[u8]) -> ModbusResult<()> {
        let budget = self.config.response_timeout();
        timeout(budget, self.stream.write_all(buf))
            .await
            .map_err(|_| ModbusError::timeout("write bytes", budget.as_millis() as u64))??;
        timeout(budget, self.stream.flush())
            .await
            .map_err(|_| ModbusError::timeout("flush", budget.as_millis() as u64))??;

        debug!("-> {}", hex::encode(buf));
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        self.last_interaction = Some(Instant::now());
        Ok(())
    }

    async fn read_frame(
        &mut self,
        buf: &mut [u8],
        total_timeout: Duration,
        frame_timeout: Duration,
        frame_complete: &FrameCompletePred,
    ) -> ModbusResult<usize> {
        let deadline = Instant::now() + total_timeout;
        let mut n = 0;

        while n < buf.len() && !frame_complete(&buf[..n]) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            // the first byte may take the whole budget, later bytes only
            // the inter-byte gap
            let wait = if n == 0 {
                remaining
            } else {
                frame_timeout.min(remaining)
            };
            match timeout(wait, self.stream.read(&mut buf[n..])).await {
                Ok(Ok(0)) => {
                    return Err(ModbusError::connection("connection closed by peer"));
                }
                Ok(Ok(read)) => {
                    n += read;
                    self.stats.bytes_received += read as u64;
                    self.last_interaction = Some(Instant::now());
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => break,
            }
        }

        if n > 0 {
            debug!("<- {}", hex::encode(&buf[..n]));
            self.stats.responses_received += 1;
        } else {
            self.stats.timeouts += 1;
        }
        Ok(n)
    }

    async fn skip_noise(&mut self) -> ModbusResult<()> {
        let mut scratch = [0u8; 256];
        loop {
            match timeout(self.config.frame_timeout(), self.stream.read(&mut scratch)).await {
                Ok(Ok(0)) => {
                    return Err(ModbusError::connection("connection closed by peer"));
                }
                Ok(Ok(read)) => {
                    debug!("skipping {} byte(s) of noise", read);
                    self.stats.bytes_received += read as u64;
                    self.last_interaction = Some(Instant::now());
                }
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => return Ok(()),
            }
        }
    }

    async fn sleep_since_last_interaction(&mut self, min_gap: Duration) {
        if let Some(last) = self.last_interaction {
            let elapsed = last.elapsed();
            if elapsed < min_gap {
                tokio::time::sleep(min_gap - elapsed).await;
            }
        }
    }

    fn stats(&self) -> PortStats {
        self.stats.clone()
    }
}

/// RTU-over-TCP port (serial gateway)
pub type TcpPort = FramedPort<TcpStream>;

impl TcpPort {
    /// Connect to a TCP gateway, e.g. `"192.168.1.50:23"`
    pub async fn connect(address: &str, config: PortConfig) -> ModbusResult<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| {
                ModbusError::connection(format!("connect to {} timed out", address))
            })?
            .map_err(|err| {
                ModbusError::connection(format!("failed to connect to {}: {}", address, err))
            })?;
        stream
            .set_nodelay(true)
            .map_err(|err| ModbusError::connection(err.to_string()))?;
        Ok(Self::new(stream, config))
    }
}

/// Local serial adapter port
pub type SerialPort = FramedPort<SerialStream>;

impl SerialPort {
    /// Open a serial device with 8N1 framing
    pub fn open(device: &str, baud_rate: u32, config: PortConfig) -> ModbusResult<Self> {
        Self::open_with_settings(
            device,
            baud_rate,
            tokio_serial::DataBits::Eight,
            tokio_serial::StopBits::One,
            tokio_serial::Parity::None,
            config,
        )
    }

    /// Open a serial device with explicit line settings
    pub fn open_with_settings(
        device: &str,
        baud_rate: u32,
        data_bits: tokio_serial::DataBits,
        stop_bits: tokio_serial::StopBits,
        parity: tokio_serial::Parity,
        config: PortConfig,
    ) -> ModbusResult<Self> {
        let stream = tokio_serial::new(device, baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|err| {
                ModbusError::connection(format!("failed to open {}: {}", device, err))
            })?;
        Ok(Self::new(stream, config))
    }
}

/// Standard RTU inter-frame gap (3.5 character times) for a baud rate
///
/// Characters are counted as 11 bits (start + 8 data + parity + stop).
/// Above 19200 baud the specification fixes a 1750µs floor.
pub fn frame_gap(baud_rate: u32) -> Duration {
    let char_time_us = 11 * 1_000_000 / u64::from(baud_rate);
    let gap = char_time_us * 35 / 10;
    if baud_rate > 19200 {
        Duration::from_micros(gap.max(1750))
    } else {
        Duration::from_micros(gap)
    }
}
