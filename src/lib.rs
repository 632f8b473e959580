//! # Modbus Poller - Modbus RTU Polling Core
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! The protocol core of a multi-device serial/TCP polling daemon: it turns
//! a heterogeneous list of logical registers (sub-word, multi-word or
//! bit-packed) into an economical sequence of Modbus RTU requests,
//! dispatches them over a framed transport and reconciles the responses
//! back into logical register values — including recovery from partial
//! failures (holes, unsupported registers, malformed frames).
//!
//! ## Features
//!
//! - **Range planning**: registers are coalesced into read batches that
//!   respect protocol limits, per-device caps, hole budgets and polling
//!   cadences
//! - **Bit-accurate register model**: any `(address, bit_offset, bit_width)`
//!   window over one or more 16-bit words; sub-word writes preserve
//!   untouched bits through a per-device write-through cache
//! - **Adaptive failure recovery**: permanent device errors disable hole
//!   bridging, fall back to one-by-one reads and mark individual registers
//!   unavailable
//! - **RTU framing**: CRC16 validation, exception detection, PDU size
//!   inference from the first bytes of a streaming read
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_poller::{
//!     read_register_range, split_register_list, Device, DeviceConfig, PortConfig,
//!     Register, RegisterType, SerialPort,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> modbus_poller::ModbusResult<()> {
//!     let port_config = PortConfig::default();
//!     let mut port = SerialPort::open("/dev/ttyUSB0", 9600, port_config.clone())?;
//!
//!     let device = Device::new(DeviceConfig {
//!         slave_id: 1,
//!         max_reg_hole: 2,
//!         ..DeviceConfig::default()
//!     });
//!     let registers = vec![
//!         Arc::new(Register::new(RegisterType::Holding, 100)),
//!         Arc::new(Register::new(RegisterType::Holding, 101)),
//!         Arc::new(Register::new(RegisterType::Holding, 104)),
//!     ];
//!
//!     let mut ranges = split_register_list(&registers, device.config(), true)?;
//!     let mut next_tick = Vec::new();
//!     for range in ranges.drain(..) {
//!         next_tick.extend(read_register_range(&mut port, &port_config, &device, range).await?);
//!     }
//!
//!     for reg in &registers {
//!         println!("{}: {:?} (error: {})", reg, reg.value(), reg.has_error());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  Range planner   │  registers -> batches
//! └──────────────────┘
//!          │
//! ┌──────────────────┐
//! │ Transaction      │  read/write a batch, adaptive recovery
//! │ engine           │
//! └──────────────────┘
//!          │
//! ┌──────────────────┐    ┌──────────────────┐
//! │  PDU codec       │◄──►│ Register model + │
//! │  (bit windows)   │    │ write-through    │
//! └──────────────────┘    │ cache            │
//!          │              └──────────────────┘
//! ┌──────────────────┐
//! │  RTU framer      │  ADU = slave + PDU + CRC16
//! └──────────────────┘
//!          │
//! ┌──────────────────┐
//! │  Port            │  serial / TCP gateway, framed reads
//! └──────────────────┘
//! ```

/// Core error types and recovery classification
pub mod error;

/// Register descriptors, device model and write-through cache
pub mod register;

/// Range planner: batching registers into reads
pub mod planner;

/// Modbus PDU composition and parsing
pub mod protocol;

/// CRC16 and RTU frame assembly/validation
pub mod frame;

/// Framed byte I/O over serial and TCP transports
pub mod port;

/// Read/write transactions with adaptive failure recovery
pub mod transaction;

/// Scripted device initialization writes
pub mod setup;

/// Raw-frame RPC transaction windows
pub mod rpc;

// Re-export main types for convenience
pub use error::{ErrorKind, ModbusError, ModbusResult};
pub use frame::{calculate_crc16, compose_read_request, compose_write_requests, make_adu};
pub use planner::{split_range_by_holes, split_register_list, RangeStatus, RegisterRange};
pub use port::{frame_gap, FrameCompletePred, FramedPort, Port, PortStats, SerialPort, TcpPort};
pub use protocol::{ModbusFunction, OperationType};
pub use register::{
    CacheKey, Device, DeviceConfig, PortConfig, Register, RegisterConfig, RegisterType, SetupItem,
    SlaveId,
};
pub use rpc::{transceive, PortArbiter, RpcRequest};
pub use setup::write_setup_registers;
pub use transaction::{read_register_range, write_register};

/// Maximum bit values (coils/discrete inputs) per read request
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum bit values per write request
pub const MAX_WRITE_BITS: u16 = 1968;

/// Maximum 16-bit registers per read request
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum 16-bit registers per write request
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
