//! Raw-frame transaction windows for RPC passthrough
//!
//! An external RPC handler may need to push an arbitrary frame through a
//! port the poller owns. Arbitration is a binary semaphore: whoever holds
//! the window runs exactly one write/read transaction. The poller acquires
//! the same window around each of its own transactions, so the RPC side
//! can only slot in between them, never inside one.

use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{ModbusError, ModbusResult};
use crate::port::{FrameCompletePred, Port};

/// Binary semaphore guarding a port's transaction window
#[derive(Debug)]
pub struct PortArbiter {
    semaphore: Semaphore,
}

impl PortArbiter {
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
        }
    }

    /// Wait for the next transaction window
    pub async fn acquire(&self) -> ModbusResult<SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| ModbusError::connection("port arbiter closed"))
    }
}

impl Default for PortArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// One raw passthrough request
#[derive(Debug, Clone)]
pub struct RpcRequest {
    /// Complete frame to transmit, as-is
    pub message: Vec<u8>,
    /// Number of response bytes the caller expects
    pub response_size: usize,
    /// Wait budget for the first response byte
    pub response_timeout: Duration,
    /// Inter-byte gap within the response
    pub frame_timeout: Duration,
}

/// Run one raw write/read transaction under the arbiter
///
/// Returns the response bytes actually received (possibly fewer than
/// requested, if the device stopped early); an empty line is a timeout.
pub async fn transceive(
    port: &mut dyn Port,
    arbiter: &PortArbiter,
    request: &RpcRequest,
) -> ModbusResult<Vec<u8>> {
    let _window = arbiter.acquire().await?;

    port.write_bytes(&request.message).await?;

    let expected = request.response_size;
    let complete: FrameCompletePred = Box::new(move |buf: &[u8]| buf.len() >= expected);
    let total_timeout = request.response_timeout + request.frame_timeout;

    let mut response = vec![0u8; expected.max(1)];
    let read = port
        .read_frame(&mut response, total_timeout, request.frame_timeout, &complete)
        .await?;
    if read == 0 {
        return Err(ModbusError::timeout(
            "rpc transceive",
            total_timeout.as_millis() as u64,
        ));
    }
    response.truncate(read);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::FramedPort;
    use crate::register::PortConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_transceive_round_trip() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut port = FramedPort::new(client, PortConfig::default());
        let arbiter = PortArbiter::new();

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            server.write_all(&[0xCA, 0xFE]).await.unwrap();
            buf
        });

        let request = RpcRequest {
            message: vec![1, 2, 3, 4],
            response_size: 2,
            response_timeout: Duration::from_millis(200),
            frame_timeout: Duration::from_millis(20),
        };
        let response = transceive(&mut port, &arbiter, &request).await.unwrap();
        assert_eq!(response, vec![0xCA, 0xFE]);
        assert_eq!(echo.await.unwrap(), [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_transceive_timeout() {
        let (client, _server) = tokio::io::duplex(64);
        let mut port = FramedPort::new(client, PortConfig::default());
        let arbiter = PortArbiter::new();

        let request = RpcRequest {
            message: vec![1],
            response_size: 2,
            response_timeout: Duration::from_millis(30),
            frame_timeout: Duration::from_millis(10),
        };
        let err = transceive(&mut port, &arbiter, &request).await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_window_is_exclusive() {
        let arbiter = PortArbiter::new();
        let first = arbiter.acquire().await.unwrap();
        assert!(arbiter.semaphore.try_acquire().is_err());
        drop(first);
        assert!(arbiter.semaphore.try_acquire().is_ok());
    }
}
