//! Peripheral links: one chip-select plus one transact operation.
//!
//! A link never touches the bus on its own initiative. `transact` borrows
//! the bus handle from its caller, which is how the one-transaction-at-a-time
//! invariant is enforced structurally: the arbiter owns the handle and lends
//! it to exactly one link at a time. Assert, exchange, deassert form one
//! atomic unit; the select is released on every exit path.

use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PeripheralId;
use crate::frame::{Frame, FRAME_MARKER};

/// Malformed responses tolerated within one `transact` before declaring the
/// link faulted.
pub const MAX_MALFORMED_PER_TRANSACT: u32 = 3;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("bus transfer timed out")]
    TimedOut,
    #[error("bus transfer failed: {0}")]
    Failed(String),
}

/// A synchronous full-duplex byte exchange of one transaction width.
pub trait BusTransport {
    fn exchange(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;
}

/// Per-peripheral select line. Implementations must be cheap and must not
/// block; the exclusivity guarantee lives in the arbiter, not here.
pub trait ChipSelect {
    fn assert(&mut self);
    fn deassert(&mut self);
}

/// Select line driven as part of the controller's native device addressing.
/// Asserting is a no-op because the transport does it for us on exchange.
pub struct HardwareManagedSelect;

impl ChipSelect for HardwareManagedSelect {
    fn assert(&mut self) {}
    fn deassert(&mut self) {}
}

/// General-purpose output pin, active low.
pub trait PinDriver {
    fn set_low(&mut self);
    fn set_high(&mut self);
}

pub struct SoftwarePinSelect<P: PinDriver> {
    pin: P,
}

impl<P: PinDriver> SoftwarePinSelect<P> {
    pub fn new(mut pin: P) -> Self {
        // Deselected until told otherwise.
        pin.set_high();
        Self { pin }
    }
}

impl<P: PinDriver> ChipSelect for SoftwarePinSelect<P> {
    fn assert(&mut self) {
        self.pin.set_low();
    }

    fn deassert(&mut self) {
        self.pin.set_high();
    }
}

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("no valid response within timeout")]
    Timeout,
    #[error("bus fault after {malformed} malformed response(s)")]
    BusFault { malformed: u32 },
    #[error("transport failure: {0}")]
    Transport(String),
}

/// One logical peripheral's end of the bus.
pub struct PeripheralLink {
    id: PeripheralId,
    select: Box<dyn ChipSelect>,
    transaction_size: usize,
}

impl PeripheralLink {
    pub fn new(id: PeripheralId, select: Box<dyn ChipSelect>, transaction_size: usize) -> Self {
        Self {
            id,
            select,
            transaction_size,
        }
    }

    pub fn id(&self) -> PeripheralId {
        self.id
    }

    /// Executes one request/response transaction: assert this peripheral's
    /// select, clock the command out, clock the response in, deassert.
    ///
    /// The bus is a blind exchange, so the response needs its own transfer;
    /// the peripheral prepares it while the command transfer completes. A
    /// malformed response counts against a small budget and the whole cycle
    /// is retried until the timeout or the budget runs out.
    pub fn transact(
        &mut self,
        bus: &mut dyn BusTransport,
        frame: &Frame,
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        let tx = frame
            .encode(self.transaction_size)
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        let clock_out = vec![0u8; self.transaction_size];
        let deadline = Instant::now() + timeout;
        let mut malformed = 0u32;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(LinkError::Timeout)?;

            self.select.assert();
            let exchanged = self.exchange_pair(bus, &tx, &clock_out, remaining);
            self.select.deassert();

            match exchanged {
                Ok(rx) => match Frame::decode(&rx) {
                    Ok(response) => {
                        debug!(peripheral = self.id.0, ?response, "transaction complete");
                        return Ok(response);
                    }
                    Err(e) => {
                        malformed += 1;
                        warn!(
                            peripheral = self.id.0,
                            attempt = malformed,
                            error = %e,
                            "malformed response"
                        );
                        if malformed >= MAX_MALFORMED_PER_TRANSACT {
                            return Err(LinkError::BusFault { malformed });
                        }
                    }
                },
                Err(TransportError::TimedOut) => return Err(LinkError::Timeout),
                Err(TransportError::Failed(msg)) => return Err(LinkError::Transport(msg)),
            }
        }
    }

    fn exchange_pair(
        &mut self,
        bus: &mut dyn BusTransport,
        tx: &[u8],
        clock_out: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        debug_assert_eq!(tx[0], FRAME_MARKER);

        let mut scratch = vec![0u8; self.transaction_size];
        bus.exchange(tx, &mut scratch, timeout)?;

        let mut rx = vec![0u8; self.transaction_size];
        bus.exchange(clock_out, &mut rx, timeout)?;
        Ok(rx)
    }
}
