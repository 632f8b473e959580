//! RTU framing: CRC16, ADU assembly and response validation
//!
//! An ADU is `[slave_id][PDU][crc16 low][crc16 high]`. The CRC is the
//! Modbus variant (polynomial 0xA001, initial 0xFFFF, reflected) computed
//! over slave id and PDU and transmitted low byte first.
//!
//! Responses are validated in wire order: infer the PDU size from the
//! first bytes (exception responses collapse to five bytes), check the
//! CRC, then cross-check slave id and function code against the request.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::planner::RegisterRange;
use crate::port::FrameCompletePred;
use crate::protocol::{
    self, compose_multiple_write_request_pdu, compose_read_request_pdu,
    compose_single_write_request_pdu, is_packing, OperationType,
};
use crate::register::{Device, Register, SlaveId};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Bytes an ADU adds around the PDU: slave id plus two CRC bytes
pub const ADU_OVERHEAD: usize = 3;

/// Full size of an exception response ADU
pub const EXCEPTION_RESPONSE_ADU_SIZE: usize =
    protocol::EXCEPTION_RESPONSE_PDU_SIZE + ADU_OVERHEAD;

/// Full size of a write acknowledgement ADU
pub const WRITE_RESPONSE_ADU_SIZE: usize = protocol::WRITE_RESPONSE_PDU_SIZE + ADU_OVERHEAD;

/// Full size of a read request ADU
pub const READ_REQUEST_ADU_SIZE: usize = protocol::READ_REQUEST_PDU_SIZE + ADU_OVERHEAD;

/// Modbus CRC16 over a byte slice
pub fn calculate_crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Frame a PDU into an ADU for the given station
pub fn make_adu(slave_id: SlaveId, pdu: &[u8]) -> Vec<u8> {
    let mut adu = BytesMut::with_capacity(pdu.len() + ADU_OVERHEAD);
    adu.put_u8(slave_id);
    adu.put_slice(pdu);
    let crc = calculate_crc16(&adu);
    adu.put_u16_le(crc);
    adu.to_vec()
}

/// Compose the read request ADU for a range
pub fn compose_read_request(range: &RegisterRange, device: &Device) -> ModbusResult<Vec<u8>> {
    let pdu = compose_read_request_pdu(range, device)?;
    Ok(make_adu(device.slave_id(), &pdu))
}

/// Expected full read response ADU size for a range
pub fn infer_read_response_size(range: &RegisterRange) -> usize {
    protocol::infer_read_response_pdu_size(range) + ADU_OVERHEAD
}

/// Compose the write request ADUs for one register
///
/// A packing register produces a single FC 0x10 request; anything else
/// produces one single-write request per covered word, in descending word
/// index order (the value's low word goes out first, to the highest
/// address). Word values are staged into the device's pending cache as a
/// side effect.
pub fn compose_write_requests(
    reg: &Register,
    value: u64,
    device: &Device,
) -> ModbusResult<Vec<Vec<u8>>> {
    if is_packing(reg) {
        let pdu = compose_multiple_write_request_pdu(reg, value, device)?;
        return Ok(vec![make_adu(device.slave_id(), &pdu)]);
    }

    let word_count = reg.word_count();
    let mut requests = Vec::with_capacity(word_count as usize);
    for word_index in (0..word_count).rev() {
        let pdu = compose_single_write_request_pdu(reg, value, word_index, device)?;
        requests.push(make_adu(device.slave_id(), &pdu));
    }
    Ok(requests)
}

/// Frame completion predicate for an expected ADU size
///
/// Accepts once `expected` bytes arrived, or five bytes when the response
/// function code carries the exception bit.
pub fn expect_n_bytes(expected: usize) -> FrameCompletePred {
    Box::new(move |buf: &[u8]| {
        if buf.len() < 2 {
            return false;
        }
        if protocol::is_exception(&buf[1..]) {
            return buf.len() >= EXCEPTION_RESPONSE_ADU_SIZE;
        }
        buf.len() >= expected
    })
}

/// Validate a response ADU against its request
///
/// Checks, in order: the PDU size inferred from the leading bytes fits
/// what was actually received, the CRC matches, the slave id echoes the
/// request, and the function code (with the exception bit stripped)
/// echoes the request. Returns the PDU slice on success.
pub fn check_response<'a>(
    request: &[u8],
    response: &'a [u8],
    op: OperationType,
) -> ModbusResult<&'a [u8]> {
    if response.len() < EXCEPTION_RESPONSE_ADU_SIZE {
        return Err(ModbusError::malformed("response too short"));
    }

    let pdu_size = match op {
        OperationType::Read => protocol::read_response_pdu_size(&response[1..]),
        OperationType::Write => protocol::write_response_pdu_size(&response[1..]),
    };
    if pdu_size + ADU_OVERHEAD > response.len() {
        return Err(ModbusError::malformed("invalid data size"));
    }

    let received = u16::from_le_bytes([response[pdu_size + 1], response[pdu_size + 2]]);
    let computed = calculate_crc16(&response[..pdu_size + 1]);
    if received != computed {
        return Err(ModbusError::crc_mismatch(computed, received));
    }

    if response[0] != request[0] {
        return Err(ModbusError::protocol("request and response slave id mismatch"));
    }
    if response[1] & !protocol::EXCEPTION_BIT != request[1] {
        return Err(ModbusError::protocol(
            "request and response function code mismatch",
        ));
    }

    Ok(&response[1..pdu_size + 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{DeviceConfig, RegisterType};
    use std::sync::Arc;

    fn device() -> Device {
        Device::new(DeviceConfig::default())
    }

    fn single_register_range(address: u16) -> RegisterRange {
        RegisterRange::new(
            vec![Arc::new(Register::new(RegisterType::Holding, address))],
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_crc_vectors() {
        assert_eq!(calculate_crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(calculate_crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
    }

    #[test]
    fn test_crc_round_trip() {
        let frames: Vec<Vec<u8>> = vec![
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01],
            vec![0x11, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
            vec![0xF7],
        ];
        for frame in frames {
            let adu = make_adu(frame[0], &frame[1..]);
            let crc_field = u16::from_le_bytes([adu[adu.len() - 2], adu[adu.len() - 1]]);
            assert_eq!(calculate_crc16(&adu[..adu.len() - 2]), crc_field);
        }
    }

    #[test]
    fn test_compose_read_request_wire_format() {
        let range = single_register_range(0);
        let request = compose_read_request(&range, &device()).unwrap();
        assert_eq!(request, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert_eq!(request.len(), READ_REQUEST_ADU_SIZE);
    }

    #[test]
    fn test_write_single_register_wire_format() {
        let reg = Register::new(RegisterType::Holding, 1);
        let requests = compose_write_requests(&reg, 0x0003, &device()).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0],
            vec![0x01, 0x06, 0x00, 0x01, 0x00, 0x03, 0x98, 0x0B]
        );
    }

    #[test]
    fn test_multi_word_writes_go_out_low_word_first() {
        let reg = Register::new(RegisterType::HoldingSingle, 10)
            .with_bit_field(0, 32)
            .unwrap();
        let requests = compose_write_requests(&reg, 0x12345678, &device()).unwrap();
        assert_eq!(requests.len(), 2);
        // word index 1 (address 11, least significant half) first
        assert_eq!(&requests[0][..6], &[0x01, 0x06, 0x00, 0x0B, 0x56, 0x78]);
        assert_eq!(&requests[1][..6], &[0x01, 0x06, 0x00, 0x0A, 0x12, 0x34]);
    }

    #[test]
    fn test_packed_write_is_one_request() {
        let reg = Register::new(RegisterType::HoldingMulti, 1)
            .with_bit_field(0, 32)
            .unwrap();
        let requests = compose_write_requests(&reg, 0x000A0102, &device()).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0],
            vec![0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02, 0x92, 0x30]
        );
    }

    #[test]
    fn test_expect_n_bytes_predicate() {
        let pred = expect_n_bytes(8);
        assert!(!pred(&[]));
        assert!(!pred(&[0x01]));
        assert!(!pred(&[0x01, 0x03, 0x04, 0x00]));
        assert!(pred(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B, 0x9A]));

        // exception responses complete at five bytes
        assert!(!pred(&[0x01, 0x83, 0x02, 0x00]));
        assert!(pred(&[0x01, 0x83, 0x02, 0xC0, 0xF1]));
    }

    #[test]
    fn test_check_response_accepts_valid_read() {
        let request = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        let response = make_adu(0x01, &[0x03, 0x02, 0xAB, 0xCD]);
        let pdu = check_response(&request, &response, OperationType::Read).unwrap();
        assert_eq!(pdu, &[0x03, 0x02, 0xAB, 0xCD]);
    }

    #[test]
    fn test_check_response_accepts_exception() {
        let request = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        let response = make_adu(0x01, &[0x83, 0x02]);
        let pdu = check_response(&request, &response, OperationType::Read).unwrap();
        assert_eq!(pdu, &[0x83, 0x02]);
    }

    #[test]
    fn test_check_response_rejects_bad_crc() {
        let request = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        let mut response = make_adu(0x01, &[0x03, 0x02, 0xAB, 0xCD]);
        let last = response.len() - 1;
        response[last] ^= 0xFF;

        let err = check_response(&request, &response, OperationType::Read).unwrap_err();
        assert!(matches!(err, ModbusError::CrcMismatch { .. }));
        assert!(err.needs_line_flush());
    }

    #[test]
    fn test_check_response_rejects_slave_mismatch() {
        let request = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        let response = make_adu(0x02, &[0x03, 0x02, 0xAB, 0xCD]);
        let err = check_response(&request, &response, OperationType::Read).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol { .. }));
    }

    #[test]
    fn test_check_response_rejects_function_mismatch() {
        let request = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        let response = make_adu(0x01, &[0x04, 0x02, 0xAB, 0xCD]);
        let err = check_response(&request, &response, OperationType::Read).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol { .. }));
    }

    #[test]
    fn test_check_response_rejects_overlong_claim() {
        let request = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A];
        // claims 0x10 data bytes but carries only two
        let response = make_adu(0x01, &[0x03, 0x10, 0xAB, 0xCD]);
        let err = check_response(&request, &response, OperationType::Read).unwrap_err();
        assert!(matches!(err, ModbusError::Malformed { .. }));
        assert!(err.needs_line_flush());
    }
}
