//! Modbus PDU codec
//!
//! Composes read and write request PDUs, parses read responses back into
//! logical register values and translates exception responses into errors.
//! This is where the bit-accurate work happens: a register's
//! `(bit_offset, bit_width)` window is extracted from (or merged into) the
//! 16-bit words actually on the wire, using the device's write-through
//! cache to preserve bits the register does not own.
//!
//! Word order across multi-word registers is big-endian: the word at the
//! register's base address is the most significant one.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::planner::RegisterRange;
use crate::register::{Device, Register, RegisterType};

/// Exception flag in the response function code byte
pub const EXCEPTION_BIT: u8 = 0x80;

/// PDU size of an exception response (function code + exception code)
pub const EXCEPTION_RESPONSE_PDU_SIZE: usize = 2;

/// PDU size of a write acknowledgement (fc + address + value/quantity)
pub const WRITE_RESPONSE_PDU_SIZE: usize = 5;

/// PDU size of every read request (fc + address + quantity)
pub const READ_REQUEST_PDU_SIZE: usize = 5;

/// Modbus function codes used by the polling core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Direction of an operation, for function code selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Read,
    Write,
}

/// True when the register must be written with one packed FC 0x10 request
///
/// `HoldingMulti` always packs; plain `Holding` packs when it spans more
/// than one word. Everything else is written word by word (or as a coil).
pub fn is_packing(reg: &Register) -> bool {
    reg.reg_type() == RegisterType::HoldingMulti
        || (reg.reg_type() == RegisterType::Holding && reg.word_count() > 1)
}

/// Select the function code for a register type and operation
///
/// Unsupported combinations (writing an input or discrete register) are
/// configuration errors.
pub fn function_for(
    reg_type: RegisterType,
    op: OperationType,
    many: bool,
) -> ModbusResult<ModbusFunction> {
    match (reg_type, op) {
        (RegisterType::Holding, OperationType::Read)
        | (RegisterType::HoldingSingle, OperationType::Read)
        | (RegisterType::HoldingMulti, OperationType::Read) => {
            Ok(ModbusFunction::ReadHoldingRegisters)
        }
        (RegisterType::Holding, OperationType::Write)
        | (RegisterType::HoldingSingle, OperationType::Write)
        | (RegisterType::HoldingMulti, OperationType::Write) => Ok(if many {
            ModbusFunction::WriteMultipleRegisters
        } else {
            ModbusFunction::WriteSingleRegister
        }),
        (RegisterType::Input, OperationType::Read) => Ok(ModbusFunction::ReadInputRegisters),
        (RegisterType::Coil, OperationType::Read) => Ok(ModbusFunction::ReadCoils),
        (RegisterType::Coil, OperationType::Write) => Ok(if many {
            ModbusFunction::WriteMultipleCoils
        } else {
            ModbusFunction::WriteSingleCoil
        }),
        (RegisterType::Discrete, OperationType::Read) => Ok(ModbusFunction::ReadDiscreteInputs),
        (reg_type, OperationType::Write) => Err(ModbusError::configuration(format!(
            "can't write to {}",
            reg_type
        ))),
    }
}

/// Check the exception bit of a response PDU
pub fn is_exception(pdu: &[u8]) -> bool {
    !pdu.is_empty() && pdu[0] & EXCEPTION_BIT != 0
}

/// Exception code of a response PDU, or 0 when it is a normal response
pub fn exception_code(pdu: &[u8]) -> u8 {
    if is_exception(pdu) && pdu.len() >= 2 {
        pdu[1]
    } else {
        0
    }
}

/// Turn an exception response into the matching error
fn check_exception(pdu: &[u8]) -> ModbusResult<()> {
    let code = exception_code(pdu);
    if code == 0 {
        Ok(())
    } else {
        Err(ModbusError::exception(pdu[0] & !EXCEPTION_BIT, code))
    }
}

/// Size in bytes of a read response PDU, inferred from its second byte
///
/// Modbus stores the data byte count in the second PDU byte, so the PDU
/// size is data size + 2 (function code + the count byte itself).
pub fn read_response_pdu_size(pdu: &[u8]) -> usize {
    if is_exception(pdu) {
        EXCEPTION_RESPONSE_PDU_SIZE
    } else {
        pdu.get(1).map_or(EXCEPTION_RESPONSE_PDU_SIZE, |&n| n as usize + 2)
    }
}

/// Size in bytes of a write response PDU
pub fn write_response_pdu_size(pdu: &[u8]) -> usize {
    if is_exception(pdu) {
        EXCEPTION_RESPONSE_PDU_SIZE
    } else {
        WRITE_RESPONSE_PDU_SIZE
    }
}

/// Expected read response PDU size for a range, for frame completion
pub fn infer_read_response_pdu_size(range: &RegisterRange) -> usize {
    let count = range.count() as usize;
    if range.reg_type().is_single_bit() {
        // bit values are packed eight to a byte
        2 + (count + 7) / 8
    } else {
        2 + count * 2
    }
}

/// Size of the write request PDU for a register
pub fn infer_write_request_pdu_size(reg: &Register) -> usize {
    if is_packing(reg) {
        6 + reg.word_count() as usize * 2
    } else {
        WRITE_RESPONSE_PDU_SIZE
    }
}

/// Number of requests needed to write a register
pub fn write_requests_count(reg: &Register) -> u16 {
    if is_packing(reg) {
        1
    } else {
        reg.word_count()
    }
}

/// Compose a read request PDU for a range: `[fc][addr:2 BE][quantity:2 BE]`
pub fn compose_read_request_pdu(range: &RegisterRange, device: &Device) -> ModbusResult<Vec<u8>> {
    let function = function_for(range.reg_type(), OperationType::Read, false)?;
    let address = device.config().wire_address(range.start());

    let mut pdu = Vec::with_capacity(READ_REQUEST_PDU_SIZE);
    pdu.push(function.to_u8());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&range.count().to_be_bytes());
    Ok(pdu)
}

/// Merge the register's value window into one 16-bit word
///
/// `word_lsb` is the window-space bit index of this word's bit 0 (the word
/// at the register's highest address has `word_lsb = 0`). Bits of `cached`
/// outside the window survive untouched; bits inside are replaced by the
/// matching slice of `value`.
fn merge_window_into_word(
    cached: u16,
    value: u64,
    bit_offset: u32,
    bit_width: u32,
    word_lsb: u32,
) -> u16 {
    let lo = bit_offset.max(word_lsb);
    let hi = (bit_offset + bit_width).min(word_lsb + 16);
    if hi <= lo {
        return cached;
    }
    let bit_count = hi - lo;
    let local_offset = lo - word_lsb;
    let mask = ((((1u32 << bit_count) - 1) << local_offset) & 0xFFFF) as u16;
    let slice = ((value >> (lo - bit_offset)) & ((1u64 << bit_count) - 1)) as u16;
    (cached & !mask) | ((slice << local_offset) & mask)
}

/// Extract the register's value window slice held by one 16-bit word
///
/// Returns the slice and its position within the register value, or `None`
/// when the word carries no window bits.
fn extract_window_from_word(
    word: u16,
    bit_offset: u32,
    bit_width: u32,
    word_lsb: u32,
) -> Option<(u64, u32)> {
    let lo = bit_offset.max(word_lsb);
    let hi = (bit_offset + bit_width).min(word_lsb + 16);
    if hi <= lo {
        return None;
    }
    let bit_count = hi - lo;
    let chunk = (u64::from(word) >> (lo - word_lsb)) & ((1u64 << bit_count) - 1);
    Some((chunk, lo - bit_offset))
}

/// Compose one single-write request PDU: `[fc][addr:2 BE][value:2 BE]`
///
/// `word_index` selects which of the register's words this request targets
/// (0 is the most significant word at the base address). Coils bypass the
/// mask/merge path entirely: the wire value is `0xFF00` or `0x0000`.
pub fn compose_single_write_request_pdu(
    reg: &Register,
    value: u64,
    word_index: u16,
    device: &Device,
) -> ModbusResult<Vec<u8>> {
    let function = function_for(reg.reg_type(), OperationType::Write, false)?;
    let address = reg.address().wrapping_add(word_index);
    let key = (reg.reg_type(), address);

    let word_value = if reg.reg_type() == RegisterType::Coil {
        if value != 0 {
            0xFF00
        } else {
            0x0000
        }
    } else {
        let word_count = u32::from(reg.word_count());
        let word_lsb = word_count.saturating_sub(1 + u32::from(word_index)) * 16;
        let cached = device
            .cached_word(key)
            .unwrap_or(((value >> word_lsb) & 0xFFFF) as u16);
        merge_window_into_word(
            cached,
            value,
            u32::from(reg.bit_offset()),
            u32::from(reg.bit_width()),
            word_lsb,
        )
    };

    device.stage_word(key, word_value);

    let mut pdu = Vec::with_capacity(WRITE_RESPONSE_PDU_SIZE);
    pdu.push(function.to_u8());
    pdu.extend_from_slice(&device.config().wire_address(address).to_be_bytes());
    pdu.extend_from_slice(&word_value.to_be_bytes());
    Ok(pdu)
}

/// Compose a packed multi-word write request PDU (FC 0x10)
///
/// `[fc][addr:2 BE][quantity:2 BE][byte_count][data...]` covering all
/// `word_count` words, most significant word first. Every word is merged
/// against the committed cache; absent cache entries fall back to the low
/// 16 bits of `value`.
pub fn compose_multiple_write_request_pdu(
    reg: &Register,
    value: u64,
    device: &Device,
) -> ModbusResult<Vec<u8>> {
    let function = function_for(reg.reg_type(), OperationType::Write, true)?;
    let word_count = reg.word_count();
    let base_address = device.config().wire_address(reg.address());

    let mut pdu = Vec::with_capacity(6 + word_count as usize * 2);
    pdu.push(function.to_u8());
    pdu.extend_from_slice(&base_address.to_be_bytes());
    pdu.extend_from_slice(&word_count.to_be_bytes());
    pdu.push((word_count * 2) as u8);

    for i in 0..word_count {
        let key = (reg.reg_type(), reg.address().wrapping_add(i));
        let cached = device.cached_word(key).unwrap_or((value & 0xFFFF) as u16);
        let word_lsb = u32::from(word_count - 1 - i) * 16;
        let word_value = merge_window_into_word(
            cached,
            value,
            u32::from(reg.bit_offset()),
            u32::from(reg.bit_width()),
            word_lsb,
        );
        device.stage_word(key, word_value);
        pdu.extend_from_slice(&word_value.to_be_bytes());
    }
    Ok(pdu)
}

/// Parse a read response PDU and store the results
///
/// Updates every register in the range (value, or errored/unavailable when
/// the device answered with the register's `unsupported_value` sentinel)
/// and records each raw word in the device's committed cache.
pub fn parse_read_response(
    pdu: &[u8],
    range: &RegisterRange,
    device: &Device,
) -> ModbusResult<()> {
    check_exception(pdu)?;

    if pdu.len() < 2 {
        return Err(ModbusError::malformed("read response too short"));
    }
    let byte_count = pdu[1] as usize;
    if pdu.len() < 2 + byte_count {
        return Err(ModbusError::malformed("invalid data size"));
    }
    let data = &pdu[2..2 + byte_count];

    if range.reg_type().is_single_bit() {
        let count = range.count() as usize;
        if byte_count * 8 < count {
            return Err(ModbusError::malformed("invalid data size"));
        }
        for reg in range.registers() {
            let index = (reg.address() - range.start()) as usize;
            let bit = data[index / 8] >> (index % 8) & 1;
            reg.set_value(u64::from(bit));
        }
        return Ok(());
    }

    let words: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if words.len() < range.count() as usize {
        return Err(ModbusError::malformed("invalid data size"));
    }
    for (i, &word) in words.iter().enumerate().take(range.count() as usize) {
        device.update_committed((range.reg_type(), range.start() + i as u16), word);
    }

    for reg in range.registers() {
        let offset = (reg.address() - range.start()) as usize;
        let word_count = reg.word_count() as usize;
        let bit_offset = u32::from(reg.bit_offset());
        let bit_width = u32::from(reg.bit_width());

        let mut value: u64 = 0;
        for i in 0..word_count {
            // words run most-significant first; the window counts from
            // bit 0 of the word at the highest address
            let word = words[offset + i];
            let word_lsb = (word_count - 1 - i) as u32 * 16;
            if let Some((chunk, position)) =
                extract_window_from_word(word, bit_offset, bit_width, word_lsb)
            {
                value |= chunk << position;
            }
        }

        match reg.unsupported_value() {
            Some(sentinel) if sentinel == value => {
                reg.set_error();
                reg.set_available(false);
            }
            _ => reg.set_value(value),
        }
    }
    Ok(())
}

/// Check a write acknowledgement for an exception response
pub fn parse_write_response(pdu: &[u8]) -> ModbusResult<()> {
    check_exception(pdu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::DeviceConfig;
    use std::sync::Arc;

    fn device() -> Device {
        Device::new(DeviceConfig::default())
    }

    fn range_of(registers: Vec<Register>) -> RegisterRange {
        RegisterRange::new(registers.into_iter().map(Arc::new).collect(), false).unwrap()
    }

    #[test]
    fn test_function_selection() {
        use ModbusFunction::*;
        use OperationType::*;
        use RegisterType::*;

        assert_eq!(function_for(Holding, Read, false).unwrap(), ReadHoldingRegisters);
        assert_eq!(function_for(HoldingSingle, Read, false).unwrap(), ReadHoldingRegisters);
        assert_eq!(function_for(HoldingMulti, Read, false).unwrap(), ReadHoldingRegisters);
        assert_eq!(function_for(Input, Read, false).unwrap(), ReadInputRegisters);
        assert_eq!(function_for(Coil, Read, false).unwrap(), ReadCoils);
        assert_eq!(function_for(Discrete, Read, false).unwrap(), ReadDiscreteInputs);

        assert_eq!(function_for(Holding, Write, false).unwrap(), WriteSingleRegister);
        assert_eq!(function_for(Holding, Write, true).unwrap(), WriteMultipleRegisters);
        assert_eq!(function_for(Coil, Write, false).unwrap(), WriteSingleCoil);
        assert_eq!(function_for(Coil, Write, true).unwrap(), WriteMultipleCoils);

        assert!(function_for(Input, Write, false).unwrap_err().is_fatal());
        assert!(function_for(Discrete, Write, false).unwrap_err().is_fatal());
    }

    #[test]
    fn test_packing_predicate() {
        let holding = Register::new(RegisterType::Holding, 0);
        assert!(!is_packing(&holding));

        let wide = Register::new(RegisterType::Holding, 0)
            .with_bit_field(0, 32)
            .unwrap();
        assert!(is_packing(&wide));

        let multi = Register::new(RegisterType::HoldingMulti, 0);
        assert!(is_packing(&multi));

        // holding_single never packs, even across words
        let single = Register::new(RegisterType::HoldingSingle, 0)
            .with_bit_field(0, 32)
            .unwrap();
        assert!(!is_packing(&single));
    }

    #[test]
    fn test_compose_read_request() {
        let range = range_of(vec![Register::new(RegisterType::Holding, 0x0102)]);
        let pdu = compose_read_request_pdu(&range, &device()).unwrap();
        assert_eq!(pdu, vec![0x03, 0x01, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_compose_read_request_applies_shift() {
        let dev = Device::new(DeviceConfig {
            shift: -2,
            ..DeviceConfig::default()
        });
        let range = range_of(vec![Register::new(RegisterType::Input, 100)]);
        let pdu = compose_read_request_pdu(&range, &dev).unwrap();
        assert_eq!(pdu, vec![0x04, 0x00, 0x62, 0x00, 0x01]);
    }

    #[test]
    fn test_parse_simple_read() {
        let range = range_of(vec![Register::new(RegisterType::Holding, 100)]);
        let dev = device();
        let pdu = [0x03, 0x02, 0xAB, 0xCD];
        parse_read_response(&pdu, &range, &dev).unwrap();

        let reg = &range.registers()[0];
        assert_eq!(reg.value(), Some(0xABCD));
        assert!(!reg.has_error());
        assert_eq!(dev.cached_word((RegisterType::Holding, 100)), Some(0xABCD));
    }

    #[test]
    fn test_parse_bit_field_read() {
        let reg = Register::new(RegisterType::Holding, 200)
            .with_bit_field(4, 4)
            .unwrap();
        let range = range_of(vec![reg]);

        parse_read_response(&[0x03, 0x02, 0x00, 0xF0], &range, &device()).unwrap();
        assert_eq!(range.registers()[0].value(), Some(0x0F));

        parse_read_response(&[0x03, 0x02, 0x00, 0x70], &range, &device()).unwrap();
        assert_eq!(range.registers()[0].value(), Some(0x07));
    }

    #[test]
    fn test_parse_multi_word_read_big_endian() {
        let reg = Register::new(RegisterType::Holding, 10)
            .with_bit_field(0, 32)
            .unwrap();
        let range = range_of(vec![reg]);

        let pdu = [0x03, 0x04, 0x12, 0x34, 0x56, 0x78];
        parse_read_response(&pdu, &range, &device()).unwrap();
        assert_eq!(range.registers()[0].value(), Some(0x12345678));
    }

    #[test]
    fn test_parse_window_spanning_words() {
        // window bits 20..28 of a two-word value live in the first word
        let reg = Register::new(RegisterType::Holding, 10)
            .with_bit_field(20, 8)
            .unwrap();
        let range = range_of(vec![reg]);

        let pdu = [0x03, 0x04, 0x0A, 0xB0, 0x00, 0x00];
        parse_read_response(&pdu, &range, &device()).unwrap();
        assert_eq!(range.registers()[0].value(), Some(0xAB));
    }

    #[test]
    fn test_parse_register_offset_inside_range() {
        let first = Register::new(RegisterType::Holding, 10);
        let second = Register::new(RegisterType::Holding, 11)
            .with_bit_field(8, 8)
            .unwrap();
        let range = range_of(vec![first, second]);

        let pdu = [0x03, 0x04, 0x11, 0x22, 0x9A, 0x33];
        parse_read_response(&pdu, &range, &device()).unwrap();
        assert_eq!(range.registers()[0].value(), Some(0x1122));
        assert_eq!(range.registers()[1].value(), Some(0x9A));
    }

    #[test]
    fn test_parse_coil_read() {
        let regs: Vec<_> = (8..12)
            .map(|addr| Register::new(RegisterType::Coil, addr))
            .collect();
        let range = range_of(regs);

        // bits are packed LSB-first: coil 8 -> bit 0 of the first byte
        let pdu = [0x01, 0x01, 0b0000_0101];
        parse_read_response(&pdu, &range, &device()).unwrap();

        let values: Vec<_> = range.registers().iter().map(|r| r.value()).collect();
        assert_eq!(values, vec![Some(1), Some(0), Some(1), Some(0)]);
    }

    #[test]
    fn test_parse_unsupported_value_sentinel() {
        let reg = Register::new(RegisterType::Holding, 7).with_unsupported_value(0xFFFF);
        let range = range_of(vec![reg]);

        parse_read_response(&[0x03, 0x02, 0xFF, 0xFF], &range, &device()).unwrap();
        let reg = &range.registers()[0];
        assert!(reg.has_error());
        assert!(!reg.is_available());
        assert_eq!(reg.value(), None);
    }

    #[test]
    fn test_parse_exception_response() {
        let range = range_of(vec![Register::new(RegisterType::Holding, 0)]);
        let err = parse_read_response(&[0x83, 0x02], &range, &device()).unwrap_err();
        assert!(err.is_permanent());

        let err = parse_read_response(&[0x83, 0x06], &range, &device()).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_parse_truncated_data_is_malformed() {
        let range = range_of(vec![
            Register::new(RegisterType::Holding, 0),
            Register::new(RegisterType::Holding, 1),
        ]);
        let err = parse_read_response(&[0x03, 0x02, 0xAB, 0xCD], &range, &device()).unwrap_err();
        assert!(matches!(err, ModbusError::Malformed { .. }));

        let err = parse_read_response(&[0x03, 0x08, 0x00, 0x00], &range, &device()).unwrap_err();
        assert!(matches!(err, ModbusError::Malformed { .. }));
    }

    #[test]
    fn test_single_write_preserves_untouched_bits() {
        let reg = Register::new(RegisterType::Holding, 5)
            .with_bit_field(4, 4)
            .unwrap();
        let dev = device();
        dev.update_committed((RegisterType::Holding, 5), 0xAB00);

        let pdu = compose_single_write_request_pdu(&reg, 0x5, 0, &dev).unwrap();
        assert_eq!(pdu, vec![0x06, 0x00, 0x05, 0xAB, 0x50]);
    }

    #[test]
    fn test_single_write_cache_miss_falls_back_to_value() {
        let reg = Register::new(RegisterType::Holding, 5)
            .with_bit_field(4, 4)
            .unwrap();
        // untouched bits come from the caller-supplied integer on a cold cache
        let pdu = compose_single_write_request_pdu(&reg, 0xAB05, 0, &device()).unwrap();
        assert_eq!(pdu, vec![0x06, 0x00, 0x05, 0xAB, 0x55]);
    }

    #[test]
    fn test_single_write_stages_pending_word() {
        let reg = Register::new(RegisterType::Holding, 9);
        let dev = device();
        compose_single_write_request_pdu(&reg, 0x1234, 0, &dev).unwrap();

        assert_eq!(dev.cached_word((RegisterType::Holding, 9)), None);
        dev.apply_pending();
        assert_eq!(dev.cached_word((RegisterType::Holding, 9)), Some(0x1234));
    }

    #[test]
    fn test_coil_write_bypasses_merge() {
        let reg = Register::new(RegisterType::Coil, 3);
        let dev = device();
        dev.update_committed((RegisterType::Coil, 3), 0x0000);

        let pdu = compose_single_write_request_pdu(&reg, 1, 0, &dev).unwrap();
        assert_eq!(pdu, vec![0x05, 0x00, 0x03, 0xFF, 0x00]);

        let pdu = compose_single_write_request_pdu(&reg, 0, 0, &dev).unwrap();
        assert_eq!(pdu, vec![0x05, 0x00, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_multiple_write_two_words() {
        let reg = Register::new(RegisterType::HoldingMulti, 20)
            .with_bit_field(0, 32)
            .unwrap();
        let pdu = compose_multiple_write_request_pdu(&reg, 0x12345678, &device()).unwrap();
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0x14, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[test]
    fn test_multiple_write_window_merge() {
        // window bits 4..32: both words keep their cached bits outside it
        let reg = Register::new(RegisterType::HoldingMulti, 0)
            .with_bit_field(4, 28)
            .unwrap();
        let dev = device();
        dev.update_committed((RegisterType::HoldingMulti, 1), 0x000C);

        let pdu = compose_multiple_write_request_pdu(&reg, 0x0FFF_FFFF, &dev).unwrap();
        // high word fully owned by the window, low word keeps its bottom nibble
        assert_eq!(&pdu[6..], &[0xFF, 0xFF, 0xFF, 0xFC]);
    }

    #[test]
    fn test_write_request_sizing() {
        let plain = Register::new(RegisterType::Holding, 0);
        assert_eq!(infer_write_request_pdu_size(&plain), 5);
        assert_eq!(write_requests_count(&plain), 1);

        let wide = Register::new(RegisterType::HoldingSingle, 0)
            .with_bit_field(0, 48)
            .unwrap();
        assert_eq!(infer_write_request_pdu_size(&wide), 5);
        assert_eq!(write_requests_count(&wide), 3);

        let packed = Register::new(RegisterType::HoldingMulti, 0)
            .with_bit_field(0, 48)
            .unwrap();
        assert_eq!(infer_write_request_pdu_size(&packed), 12);
        assert_eq!(write_requests_count(&packed), 1);
    }

    #[test]
    fn test_response_size_inference() {
        let words = range_of(vec![
            Register::new(RegisterType::Holding, 0),
            Register::new(RegisterType::Holding, 1),
        ]);
        assert_eq!(infer_read_response_pdu_size(&words), 6);

        let bits = range_of(
            (0..10)
                .map(|addr| Register::new(RegisterType::Coil, addr))
                .collect(),
        );
        assert_eq!(infer_read_response_pdu_size(&bits), 4);

        assert_eq!(read_response_pdu_size(&[0x03, 0x04]), 6);
        assert_eq!(read_response_pdu_size(&[0x83, 0x02]), 2);
        assert_eq!(write_response_pdu_size(&[0x06, 0, 0, 0, 0]), 5);
        assert_eq!(write_response_pdu_size(&[0x86, 0x03]), 2);
    }
}
