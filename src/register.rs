//! Register and device model for the polling core
//!
//! A [`Register`] is an immutable descriptor (type, address, bit window,
//! polling cadence) plus a small amount of mutable status: the last value,
//! an error flag and an availability flag. Registers are shared between the
//! device that owns them and the ranges that borrow them, so the status
//! lives behind a mutex.
//!
//! A [`Device`] owns the per-device write-through cache: the last 16-bit
//! word observed for every `(type, address)` the poller has touched. The
//! cache is split into a `committed` and a `pending` half so that a failed
//! write never poisons the values used to preserve untouched bits.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Modbus slave/station address (1-247)
pub type SlaveId = u8;

/// Logical register classes understood by the polling core
///
/// `HoldingSingle` and `HoldingMulti` pin the write function code to 0x06
/// and 0x10 respectively; plain `Holding` picks 0x10 only when the register
/// spans more than one word.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Holding,
    HoldingSingle,
    HoldingMulti,
    Input,
    Coil,
    Discrete,
}

impl RegisterType {
    /// True for coil and discrete registers (one bit per address)
    pub fn is_single_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Discrete)
    }

    /// True if the type accepts writes at all
    pub fn is_writable(self) -> bool {
        !matches!(self, RegisterType::Input | RegisterType::Discrete)
    }

    /// Name used in device templates and log messages
    pub fn name(self) -> &'static str {
        match self {
            RegisterType::Holding => "holding",
            RegisterType::HoldingSingle => "holding_single",
            RegisterType::HoldingMulti => "holding_multi",
            RegisterType::Input => "input",
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
        }
    }
}

impl std::fmt::Display for RegisterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Default)]
struct RegisterState {
    value: Option<u64>,
    available: bool,
    error: bool,
}

/// A logical register: immutable descriptor plus mutable status
///
/// The bit window `(bit_offset, bit_width)` selects which bits of the
/// underlying word(s) this register represents. A plain 16-bit register is
/// `(0, 16)`; a flag in the high nibble of one word is `(12, 4)`; a 32-bit
/// counter spanning two words is `(0, 32)`.
#[derive(Debug)]
pub struct Register {
    reg_type: RegisterType,
    address: u16,
    bit_offset: u8,
    bit_width: u8,
    poll_interval: Option<Duration>,
    unsupported_value: Option<u64>,
    read_only: bool,
    poll: bool,
    state: Mutex<RegisterState>,
}

impl Register {
    /// Create a register with the default bit window for its type
    /// (one bit for coil/discrete, a full word otherwise)
    pub fn new(reg_type: RegisterType, address: u16) -> Self {
        let bit_width = if reg_type.is_single_bit() { 1 } else { 16 };
        Self {
            reg_type,
            address,
            bit_offset: 0,
            bit_width,
            poll_interval: None,
            unsupported_value: None,
            read_only: false,
            poll: true,
            state: Mutex::new(RegisterState {
                value: None,
                available: true,
                // never observed successfully, so reported as errored
                error: true,
            }),
        }
    }

    /// Set an explicit bit window
    ///
    /// The window must hold at least one bit and fit the 64-bit value
    /// accumulator; coils and discrete inputs only support one-bit windows.
    pub fn with_bit_field(mut self, bit_offset: u8, bit_width: u8) -> ModbusResult<Self> {
        if bit_width == 0 {
            return Err(ModbusError::configuration("register bit width cannot be zero"));
        }
        if bit_offset as u32 + bit_width as u32 > 64 {
            return Err(ModbusError::configuration(format!(
                "register value window too wide: offset {} + width {} exceeds 64 bits",
                bit_offset, bit_width
            )));
        }
        if self.reg_type.is_single_bit() && (bit_offset != 0 || bit_width != 1) {
            return Err(ModbusError::configuration(format!(
                "width other than 1 is not supported for register type {}",
                self.reg_type
            )));
        }
        self.bit_offset = bit_offset;
        self.bit_width = bit_width;
        Ok(self)
    }

    /// Override the polling cadence (`None` inherits the device default)
    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the sentinel value the device reports for unsupported registers
    pub fn with_unsupported_value(mut self, value: u64) -> Self {
        self.unsupported_value = Some(value);
        self
    }

    /// Mark the register read-only
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Exclude the register from periodic polling (write-only use)
    pub fn with_poll(mut self, poll: bool) -> Self {
        self.poll = poll;
        self
    }

    /// Build a register from a deserialized template entry
    pub fn from_config(config: &RegisterConfig) -> ModbusResult<Self> {
        if let Some(order) = &config.word_order {
            if order != "big_endian" && order != "little_endian" {
                return Err(ModbusError::configuration(format!(
                    "unknown word order: {}",
                    order
                )));
            }
        }

        let mut reg = Register::new(config.reg_type, config.address);
        if config.bit_offset != 0 || config.bit_width.is_some() {
            let width = config.bit_width.unwrap_or(reg.bit_width);
            reg = reg.with_bit_field(config.bit_offset, width)?;
        }
        reg.poll_interval = config.poll_interval_ms.map(Duration::from_millis);
        reg.unsupported_value = config.error_value;
        reg.read_only = config.readonly;
        Ok(reg)
    }

    pub fn reg_type(&self) -> RegisterType {
        self.reg_type
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    /// Width of the value window in bits
    pub fn bit_width(&self) -> u8 {
        self.bit_width
    }

    /// Number of 16-bit Modbus words covered by the value window
    pub fn word_count(&self) -> u16 {
        ((self.bit_offset as u16 + self.bit_width as u16) + 15) / 16
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    pub fn unsupported_value(&self) -> Option<u64> {
        self.unsupported_value
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_polled(&self) -> bool {
        self.poll
    }

    /// Store a successfully read value; clears the error flag
    pub fn set_value(&self, value: u64) {
        let mut state = self.state.lock().unwrap();
        state.value = Some(value);
        state.error = false;
    }

    /// Flag the register as errored for this tick
    pub fn set_error(&self) {
        self.state.lock().unwrap().error = true;
    }

    /// Toggle availability (unavailable registers are dropped from ranges)
    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    pub fn value(&self) -> Option<u64> {
        self.state.lock().unwrap().value
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().unwrap().error
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().unwrap().available
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {}", self.reg_type, self.address)?;
        if !self.reg_type.is_single_bit() && (self.bit_offset != 0 || self.bit_width != 16) {
            write!(f, ":{}:{}", self.bit_offset, self.bit_width)?;
        }
        Ok(())
    }
}

/// Key into the device word cache: register type plus word address
pub type CacheKey = (RegisterType, u16);

/// A polled Modbus device: slave id, limits and the write-through word cache
///
/// The cache maps `(type, word_address)` to the last 16-bit value observed
/// on a read or confirmed by a write. Keys are logical addresses; the
/// configured `shift` is applied only when a request is encoded.
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    committed: Mutex<HashMap<CacheKey, u16>>,
    pending: Mutex<HashMap<CacheKey, u16>>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            committed: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn slave_id(&self) -> SlaveId {
        self.config.slave_id
    }

    /// Last committed word for the key, if any
    ///
    /// Write composition falls back to the low 16 bits of the value being
    /// written when the key was never observed; bits outside the register's
    /// window then come from the caller-supplied integer. Callers writing
    /// sparse bit fields should read the word once to seed the cache.
    pub fn cached_word(&self, key: CacheKey) -> Option<u16> {
        self.committed.lock().unwrap().get(&key).copied()
    }

    /// Record a word observed in a read response
    pub fn update_committed(&self, key: CacheKey, word: u16) {
        self.committed.lock().unwrap().insert(key, word);
    }

    /// Stage a word composed for an outgoing write
    pub fn stage_word(&self, key: CacheKey, word: u16) {
        self.pending.lock().unwrap().insert(key, word);
    }

    /// Promote all staged words after a fully acknowledged write
    pub fn apply_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        let mut committed = self.committed.lock().unwrap();
        for (key, word) in pending.drain() {
            committed.insert(key, word);
        }
    }

    /// Drop all staged words; called before every write and on any failure
    pub fn dismiss_pending(&self) {
        self.pending.lock().unwrap().clear();
    }
}

fn default_max_read_registers() -> u16 {
    crate::MAX_READ_REGISTERS
}

fn default_device_timeout_ms() -> u64 {
    3000
}

fn default_scale() -> f64 {
    1.0
}

/// Per-port options consumed by the transaction engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Guard interval before each transaction, microseconds
    pub request_delay_us: u64,
    /// Maximum wait for the first response byte, milliseconds
    pub response_timeout_ms: u64,
    /// Maximum inter-byte gap within a frame, milliseconds
    pub frame_timeout_ms: u64,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            request_delay_us: 0,
            response_timeout_ms: 500,
            frame_timeout_ms: 20,
        }
    }
}

impl PortConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_micros(self.request_delay_us)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// Per-device options consumed by the planner and the transaction engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// RTU station address, 1-247
    pub slave_id: SlaveId,
    /// Added to every register address before wire encoding
    pub shift: i32,
    /// Maximum word gap to bridge inside one read batch
    pub max_reg_hole: u16,
    /// Same for coil/discrete batches
    pub max_bit_hole: u16,
    /// Device-specific cap on registers per read, clamped to the protocol cap
    pub max_read_registers: u16,
    /// Bus quiet time before addressing this device, microseconds
    pub guard_interval_us: u64,
    /// Device-specific inter-byte timeout override, milliseconds
    pub frame_timeout_ms: u64,
    /// Backoff window for the scheduler after repeated failures, milliseconds
    pub device_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            slave_id: 1,
            shift: 0,
            max_reg_hole: 0,
            max_bit_hole: 0,
            max_read_registers: default_max_read_registers(),
            guard_interval_us: 0,
            frame_timeout_ms: 0,
            device_timeout_ms: default_device_timeout_ms(),
        }
    }
}

impl DeviceConfig {
    /// Apply the configured address shift, wrapping in the 16-bit space
    pub fn wire_address(&self, address: u16) -> u16 {
        (address as i32).wrapping_add(self.shift) as u16
    }
}

/// One entry of a device template's register list
///
/// `format`, `word_order`, `scale`, `offset` and `round_to` are carried for
/// the publishing layer; the core only validates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub address: u16,
    pub reg_type: RegisterType,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub word_order: Option<String>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub round_to: f64,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub error_value: Option<u64>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub bit_offset: u8,
    #[serde(default)]
    pub bit_width: Option<u8>,
}

/// One scripted initialization write: `(name, register, value)`
#[derive(Debug)]
pub struct SetupItem {
    pub name: String,
    pub register: std::sync::Arc<Register>,
    pub value: u64,
}
