//! Transaction engine: end-to-end reads and writes with adaptive recovery
//!
//! A range read normally goes out as one request. What comes back decides
//! the next step:
//!
//! - success: unsupported registers are trimmed from the borders and the
//!   range is returned with `Ok` status;
//! - transient error: every register is flagged errored and the range is
//!   returned unchanged, to be retried next tick;
//! - permanent error on a range with holes: the holes were the likely
//!   offense, so the range is re-split into strictly contiguous pieces;
//! - permanent error without holes: the range switches to one-by-one mode,
//!   where each register gets its own request and permanently failing
//!   registers are marked unavailable individually.
//!
//! Writes stage every composed word in the device's pending cache and only
//! promote it after all acknowledgements arrived.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::frame::{
    check_response, compose_read_request, compose_write_requests, expect_n_bytes,
    infer_read_response_size, WRITE_RESPONSE_ADU_SIZE,
};
use crate::planner::{split_range_by_holes, RangeStatus, RegisterRange};
use crate::port::Port;
use crate::protocol::{self, OperationType};
use crate::register::{Device, PortConfig, Register};

/// Effective timeouts for one device on one port
#[derive(Debug, Clone, Copy)]
struct Timing {
    request_delay: Duration,
    response_timeout: Duration,
    frame_timeout: Duration,
}

impl Timing {
    /// Merge port defaults with the device's own overrides
    fn for_device(port_config: &PortConfig, device: &Device) -> Self {
        let config = device.config();
        let frame_timeout = if config.frame_timeout_ms > 0 {
            Duration::from_millis(config.frame_timeout_ms)
        } else {
            port_config.frame_timeout()
        };
        let request_delay = port_config
            .request_delay()
            .max(Duration::from_micros(config.guard_interval_us));
        Self {
            request_delay,
            response_timeout: port_config.response_timeout(),
            frame_timeout,
        }
    }
}

/// One guarded request/response round trip
///
/// Enforces the bus guard interval, sends the request, collects a frame
/// sized by `expected_size` (or the short exception form) and validates
/// it. CRC and malformed-frame failures flush the line before
/// propagating, so the next transaction starts clean.
async fn process_request(
    port: &mut dyn Port,
    timing: Timing,
    request: &[u8],
    expected_size: usize,
    op: OperationType,
) -> ModbusResult<Vec<u8>> {
    port.sleep_since_last_interaction(timing.request_delay).await;
    port.write_bytes(request).await?;

    let total_timeout = timing.response_timeout + timing.frame_timeout;
    let mut response = vec![0u8; expected_size];
    let read = port
        .read_frame(
            &mut response,
            total_timeout,
            timing.frame_timeout,
            &expect_n_bytes(expected_size),
        )
        .await?;
    if read == 0 {
        return Err(ModbusError::timeout(
            "no response",
            total_timeout.as_millis() as u64,
        ));
    }

    match check_response(request, &response[..read], op) {
        Ok(pdu) => Ok(pdu.to_vec()),
        Err(err) => {
            if err.needs_line_flush() {
                if let Err(flush_err) = port.skip_noise().await {
                    warn!("skip_noise failed: {}", flush_err);
                }
            }
            Err(err)
        }
    }
}

/// Read one range and store the results, tracking the range status
async fn read_range(
    port: &mut dyn Port,
    timing: Timing,
    device: &Device,
    range: &mut RegisterRange,
) -> ModbusResult<()> {
    range.set_status(RangeStatus::UnknownError);
    let request = compose_read_request(range, device)?;
    let expected_size = infer_read_response_size(range);

    let result = match process_request(port, timing, &request, expected_size, OperationType::Read)
        .await
    {
        Ok(pdu) => protocol::parse_read_response(&pdu, range, device),
        Err(err) => Err(err),
    };

    match &result {
        Ok(()) => range.set_status(RangeStatus::Ok),
        Err(err) if err.is_fatal() => {}
        Err(_) => range.set_status(RangeStatus::DeviceError),
    }
    result
}

fn log_range_error(device: &Device, range: &RegisterRange, err: &ModbusError) {
    range.mark_all_errored();
    warn!(
        "failed to read {} of device {}: {}",
        range,
        device.slave_id(),
        err
    );
}

/// Drop unavailable registers from both ends of the list
fn remove_unsupported_from_borders(registers: &[Arc<Register>]) -> Vec<Arc<Register>> {
    let first = registers.iter().position(|r| r.is_available());
    let last = registers.iter().rposition(|r| r.is_available());
    match (first, last) {
        (Some(first), Some(last)) => registers[first..=last].to_vec(),
        _ => Vec::new(),
    }
}

async fn read_whole_range(
    port: &mut dyn Port,
    timing: Timing,
    device: &Device,
    mut range: RegisterRange,
) -> ModbusResult<Vec<RegisterRange>> {
    match read_range(port, timing, device, &mut range).await {
        Ok(()) => {
            let trimmed = remove_unsupported_from_borders(range.registers());
            if trimmed.is_empty() {
                return Ok(Vec::new());
            }
            let mut new_range = RegisterRange::new(trimmed, range.has_holes())?;
            new_range.set_status(range.status());
            Ok(vec![new_range])
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            log_range_error(device, &range, &err);
            if err.is_permanent() {
                if range.has_holes() {
                    debug!("disabling holes feature for {}", range);
                    return split_range_by_holes(range.registers(), false);
                }
                range.set_read_one_by_one(true);
            }
            Ok(vec![range])
        }
    }
}

async fn read_one_by_one(
    port: &mut dyn Port,
    timing: Timing,
    device: &Device,
    mut range: RegisterRange,
) -> ModbusResult<Vec<RegisterRange>> {
    range.set_status(RangeStatus::UnknownError);

    let registers: Vec<Arc<Register>> = range.registers().to_vec();
    for reg in &registers {
        let mut single = RegisterRange::new(vec![reg.clone()], false)?;
        match read_range(port, timing, device, &mut single).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) if err.is_permanent() => {
                reg.set_available(false);
                reg.set_error();
                warn!(
                    "register {} of device {} is not supported",
                    reg,
                    device.slave_id()
                );
            }
            Err(err) => {
                // one transient failure aborts the whole pass
                log_range_error(device, &range, &err);
                range.set_status(RangeStatus::DeviceError);
                return Ok(vec![range]);
            }
        }
    }

    range.set_status(RangeStatus::Ok);
    split_range_by_holes(&registers, true)
}

/// Read a register range end to end
///
/// Returns the range(s) to poll on the next tick: the same range, a
/// trimmed copy, or a re-split produced by the recovery logic. Only fatal
/// configuration errors surface as `Err`.
pub async fn read_register_range(
    port: &mut dyn Port,
    port_config: &PortConfig,
    device: &Device,
    range: RegisterRange,
) -> ModbusResult<Vec<RegisterRange>> {
    let timing = Timing::for_device(port_config, device);
    debug!("modbus: read {} of device {}", range, device.slave_id());

    if range.read_one_by_one() {
        read_one_by_one(port, timing, device, range).await
    } else {
        read_whole_range(port, timing, device, range).await
    }
}

async fn write_requests(
    port: &mut dyn Port,
    timing: Timing,
    device: &Device,
    reg: &Register,
    value: u64,
) -> ModbusResult<()> {
    let requests = compose_write_requests(reg, value, device)?;
    for request in &requests {
        let pdu = process_request(
            port,
            timing,
            request,
            WRITE_RESPONSE_ADU_SIZE,
            OperationType::Write,
        )
        .await?;
        protocol::parse_write_response(&pdu)?;
    }
    Ok(())
}

/// Write a value to a single logical register
///
/// Composes one packed request or a descending sequence of single-word
/// requests, sends them all, and commits the staged cache words only when
/// every acknowledgement arrived. Any failure discards the staged words.
pub async fn write_register(
    port: &mut dyn Port,
    port_config: &PortConfig,
    device: &Device,
    reg: &Register,
    value: u64,
) -> ModbusResult<()> {
    if reg.is_read_only() || !reg.reg_type().is_writable() {
        return Err(ModbusError::configuration(format!(
            "can't write to read-only register {}",
            reg
        )));
    }

    let timing = Timing::for_device(port_config, device);
    device.dismiss_pending();

    debug!(
        "modbus: write {} {}(s) @ {} of device {}",
        reg.word_count(),
        reg.reg_type(),
        reg.address(),
        device.slave_id()
    );

    match write_requests(port, timing, device, reg, value).await {
        Ok(()) => {
            device.apply_pending();
            Ok(())
        }
        Err(err) => {
            device.dismiss_pending();
            Err(err)
        }
    }
}
