//! Range planning: coalescing registers into economical read batches
//!
//! The planner walks a `(type, address)`-sorted register list once and
//! greedily grows a batch while the next register keeps the same type and
//! polling cadence, does not overlap the batch, stays within the configured
//! hole budget and does not push the batch past the protocol (or device)
//! size cap. Anything else flushes the batch and starts a new one.
//!
//! Bridged gaps are recorded in [`RegisterRange::has_holes`]; the
//! transaction engine uses that flag to decide how to recover from a
//! permanent device error (see `transaction`).

use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::register::{DeviceConfig, Register, RegisterType};
use crate::{MAX_READ_BITS, MAX_READ_REGISTERS};

/// Outcome of the last transaction on a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStatus {
    /// Never read, or the last attempt did not produce a classified result
    UnknownError,
    /// Last read completed
    Ok,
    /// Last read failed with a device-side error
    DeviceError,
}

/// A contiguous read batch over registers of one type and cadence
///
/// The range borrows its registers; re-splitting during recovery produces
/// new ranges over the same `Arc<Register>` objects.
#[derive(Debug)]
pub struct RegisterRange {
    registers: Vec<Arc<Register>>,
    start: u16,
    count: u16,
    has_holes: bool,
    read_one_by_one: bool,
    status: RangeStatus,
}

impl RegisterRange {
    /// Build a range over the given registers
    ///
    /// Fails with a configuration error when the list is empty, mixes
    /// register types, contains a multi-bit coil/discrete register, or
    /// spans more words than the protocol allows for its type.
    pub fn new(registers: Vec<Arc<Register>>, has_holes: bool) -> ModbusResult<Self> {
        let first = registers
            .first()
            .ok_or_else(|| ModbusError::configuration("cannot construct empty register range"))?;
        let reg_type = first.reg_type();

        let mut start = u32::from(first.address());
        let mut end = start + u32::from(first.word_count());
        for reg in &registers[1..] {
            if reg.reg_type() != reg_type {
                return Err(ModbusError::configuration(
                    "registers of different type in the same range",
                ));
            }
            let addr = u32::from(reg.address());
            start = start.min(addr);
            end = end.max(addr + u32::from(reg.word_count()));
        }

        if reg_type.is_single_bit() {
            for reg in &registers {
                if reg.word_count() != 1 {
                    return Err(ModbusError::configuration(format!(
                        "width other than 1 is not supported for register type {}",
                        reg_type
                    )));
                }
            }
        }

        let count = end - start;
        let cap = if reg_type.is_single_bit() {
            u32::from(MAX_READ_BITS)
        } else {
            u32::from(MAX_READ_REGISTERS)
        };
        if count > cap {
            return Err(ModbusError::configuration(format!(
                "modbus register range too large: {} {}(s), cap is {}",
                count, reg_type, cap
            )));
        }

        Ok(Self {
            registers,
            start: start as u16,
            count: count as u16,
            has_holes,
            read_one_by_one: false,
            status: RangeStatus::UnknownError,
        })
    }

    pub fn registers(&self) -> &[Arc<Register>] {
        &self.registers
    }

    pub fn reg_type(&self) -> RegisterType {
        self.registers[0].reg_type()
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.registers[0].poll_interval()
    }

    /// First word address covered by the range
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Number of words (or bits, for bit types) the range spans
    pub fn count(&self) -> u16 {
        self.count
    }

    /// True when the range bridges at least one unrequested address gap
    pub fn has_holes(&self) -> bool {
        self.has_holes
    }

    /// Sticky recovery hint: read each register with its own request
    pub fn read_one_by_one(&self) -> bool {
        self.read_one_by_one
    }

    pub fn set_read_one_by_one(&mut self, read_one_by_one: bool) {
        self.read_one_by_one = read_one_by_one;
    }

    pub fn status(&self) -> RangeStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RangeStatus) {
        self.status = status;
    }

    /// Flag every register in the range as errored for this tick
    pub fn mark_all_errored(&self) {
        for reg in &self.registers {
            reg.set_error();
        }
    }
}

impl std::fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}(s) @ {}",
            self.count,
            self.reg_type(),
            self.start
        )
    }
}

/// Read-size cap for a batch of the given type, honoring the device limit
fn max_regs_for(reg_type: RegisterType, config: &DeviceConfig) -> u32 {
    if reg_type.is_single_bit() {
        u32::from(MAX_READ_BITS)
    } else if config.max_read_registers > 0 && config.max_read_registers <= MAX_READ_REGISTERS {
        u32::from(config.max_read_registers)
    } else {
        u32::from(MAX_READ_REGISTERS)
    }
}

/// Hole budget for a batch of the given type
fn max_hole_for(reg_type: RegisterType, config: &DeviceConfig, enable_holes: bool) -> u32 {
    if !enable_holes {
        0
    } else if reg_type.is_single_bit() {
        u32::from(config.max_bit_hole)
    } else {
        u32::from(config.max_reg_hole)
    }
}

/// Split a register list into read batches
///
/// The input must be sorted by `(type, address)`; the scan is linear and
/// never reorders registers. Registers marked unavailable, and write-only
/// registers excluded from polling, are left out. `enable_holes` is the
/// global switch that the recovery path clears after a permanent failure
/// on a holey range.
pub fn split_register_list(
    registers: &[Arc<Register>],
    config: &DeviceConfig,
    enable_holes: bool,
) -> ModbusResult<Vec<RegisterRange>> {
    let mut ranges = Vec::new();
    if registers.is_empty() {
        return Ok(ranges);
    }

    let mut batch: Vec<Arc<Register>> = Vec::new();
    let mut has_holes = false;
    let mut prev_start = 0u32;
    let mut prev_end: Option<u32> = None;
    let mut prev_type = registers[0].reg_type();
    let mut prev_interval = registers[0].poll_interval();

    for reg in registers {
        if !reg.is_polled() || !reg.is_available() {
            continue;
        }
        let address = u32::from(reg.address());
        let new_end = address + u32::from(reg.word_count());
        let max_hole = max_hole_for(reg.reg_type(), config, enable_holes);
        let max_regs = max_regs_for(reg.reg_type(), config);

        let joins = match prev_end {
            Some(end) => {
                reg.reg_type() == prev_type
                    && reg.poll_interval() == prev_interval
                    && address >= end
                    && address <= end + max_hole
                    && new_end - prev_start <= max_regs
            }
            None => false,
        };

        if !joins {
            if !batch.is_empty() {
                let range = RegisterRange::new(std::mem::take(&mut batch), has_holes)?;
                debug!("adding range: {}", range);
                ranges.push(range);
                has_holes = false;
            }
            prev_start = address;
            prev_type = reg.reg_type();
            prev_interval = reg.poll_interval();
        }
        if !batch.is_empty() {
            has_holes |= address != prev_end.unwrap_or(address);
        }
        batch.push(reg.clone());
        prev_end = Some(new_end);
    }

    if !batch.is_empty() {
        let range = RegisterRange::new(batch, has_holes)?;
        debug!("adding range: {}", range);
        ranges.push(range);
    }
    Ok(ranges)
}

/// Re-split registers into strictly contiguous ranges (no holes)
///
/// Used by the recovery path: after a permanent failure the bridged gaps
/// are dropped and every contiguous run of word extents becomes its own
/// range. With `only_available` set, registers marked unavailable are left
/// out entirely; a dropped register still breaks contiguity for its
/// neighbors.
pub fn split_range_by_holes(
    registers: &[Arc<Register>],
    only_available: bool,
) -> ModbusResult<Vec<RegisterRange>> {
    let mut ranges = Vec::new();
    let mut batch: Vec<Arc<Register>> = Vec::new();
    let mut last_end = 0u32;

    for reg in registers {
        if !batch.is_empty() && last_end != u32::from(reg.address()) {
            ranges.push(RegisterRange::new(std::mem::take(&mut batch), false)?);
        }
        if !only_available || reg.is_available() {
            last_end = u32::from(reg.address()) + u32::from(reg.word_count());
            batch.push(reg.clone());
        }
    }
    if !batch.is_empty() {
        ranges.push(RegisterRange::new(batch, false)?);
    }
    Ok(ranges)
}
