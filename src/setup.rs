//! Device initialization: scripted setup writes
//!
//! Runs the device template's setup items in declaration order. A register
//! the device rejects permanently is logged and skipped; a transient
//! failure aborts the whole pass so the caller can retry the device later.

use log::{info, warn};

use crate::error::{ErrorKind, ModbusResult};
use crate::port::Port;
use crate::register::{Device, PortConfig, SetupItem};
use crate::transaction::write_register;

/// Apply all setup items to a device
///
/// Returns `Ok(true)` when the pass completed (possibly skipping
/// unsupported registers), `Ok(false)` when a transient failure aborted
/// it. Fatal configuration errors propagate.
pub async fn write_setup_registers(
    port: &mut dyn Port,
    port_config: &PortConfig,
    device: &Device,
    items: &[SetupItem],
) -> ModbusResult<bool> {
    for item in items {
        info!(
            "Init: {}: setup register {} <-- {}",
            item.name, item.register, item.value
        );
        match write_register(port, port_config, device, &item.register, item.value).await {
            Ok(()) => {}
            Err(err) => {
                warn!("register {} setup failed: {}", item.register, err);
                match err.kind() {
                    ErrorKind::Permanent => continue,
                    ErrorKind::Transient => return Ok(false),
                    ErrorKind::Fatal => return Err(err),
                }
            }
        }
    }
    Ok(true)
}
