//! Bus arbiter: the single serialization point for one physical bus.
//!
//! The arbiter owns the bus handle and every peripheral link on it. All
//! traffic flows through `broadcast` and `collect`, both strictly
//! sequential; at no instant is more than one select line asserted. Hosts
//! with several physical buses run one arbiter per bus.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BusConfig, PeripheralId, MAX_PERIPHERALS};
use crate::frame::{CommandOp, Frame, StatusCode};
use crate::link::{BusTransport, LinkError, PeripheralLink};
use crate::packet::DataChunk;
use thiserror::Error;

/// Attempts per transaction before the peripheral is written off. The bus is
/// low-latency and deterministic, so no backoff between attempts.
pub const MAX_TRANSACT_ATTEMPTS: u32 = 3;

/// Consecutive failed chunk pulls before collection of a peripheral is
/// abandoned mid-stream. Keeps a peripheral that dies after acknowledging
/// from costing a full per-chunk retry scan.
const MAX_CONSECUTIVE_PULL_FAILURES: u32 = 3;

pub type BroadcastReplies =
    heapless::Vec<(PeripheralId, Result<Frame, LinkError>), MAX_PERIPHERALS>;

#[derive(Debug, Clone, Error)]
pub enum CollectError {
    #[error("unknown peripheral")]
    UnknownPeripheral,
    #[error("peripheral never became ready")]
    NotReady,
    #[error("peripheral reported capture failure: {0}")]
    CaptureFailed(String),
    #[error("peripheral rejected request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

pub struct BusArbiter<T: BusTransport> {
    bus: T,
    links: heapless::Vec<PeripheralLink, MAX_PERIPHERALS>,
    transact_timeout: Duration,
    ready_poll_interval: Duration,
    ready_poll_attempts: u32,
    chunk_retry_sweeps: u32,
}

impl<T: BusTransport> BusArbiter<T> {
    pub fn new(bus: T, config: &BusConfig) -> Self {
        Self {
            bus,
            links: heapless::Vec::new(),
            transact_timeout: Duration::from_millis(config.transact_timeout_ms),
            ready_poll_interval: Duration::from_millis(config.ready_poll_interval_ms),
            ready_poll_attempts: config.ready_poll_attempts,
            chunk_retry_sweeps: config.chunk_retry_sweeps,
        }
    }

    /// Registers a link. Links are kept sorted by id so every sweep of the
    /// bus happens in the same deterministic order.
    pub fn add_link(&mut self, link: PeripheralLink) -> Result<(), PeripheralLink> {
        if self.links.iter().any(|l| l.id() == link.id()) {
            return Err(link);
        }
        let at = self
            .links
            .iter()
            .position(|l| l.id() > link.id())
            .unwrap_or(self.links.len());
        self.links.insert(at, link)
    }

    pub fn peripheral_ids(&self) -> Vec<PeripheralId> {
        self.links.iter().map(PeripheralLink::id).collect()
    }

    /// Issues the capture command to every peripheral, one at a time in
    /// ascending id order. The bus has no true multicast, so "broadcast" is
    /// a sequential sweep; a failure on one link never stops the sweep.
    pub fn broadcast(&mut self, session_id: u64) -> BroadcastReplies {
        info!(session = session_id, "broadcasting capture command");
        let mut replies = BroadcastReplies::new();
        let command = Frame::command(CommandOp::Capture, session_id);

        let bus = &mut self.bus;
        for link in &mut self.links {
            let id = link.id();
            let result = Self::transact_with_retry(bus, link, &command, self.transact_timeout);
            if let Err(e) = &result {
                warn!(peripheral = id.0, error = %e, "capture command failed");
            }
            // Capacity matches the link table; push cannot fail.
            let _ = replies.push((id, result));
        }

        replies
    }

    /// Pulls one peripheral's packetized image: poll readiness (capture time
    /// dominates and is not a fault), learn the total from the first chunk,
    /// pull every index, then sweep missing indices within the retry budget.
    ///
    /// Returns whatever chunks were gathered; completeness is the
    /// assembler's verdict, not the arbiter's.
    pub fn collect(
        &mut self,
        id: PeripheralId,
        session_id: u64,
    ) -> Result<Vec<DataChunk>, CollectError> {
        let idx = self
            .links
            .iter()
            .position(|l| l.id() == id)
            .ok_or(CollectError::UnknownPeripheral)?;

        self.wait_ready(idx, session_id)?;

        let mut chunks: Vec<DataChunk> = Vec::new();
        let first = self.pull_chunk(idx, session_id, 0)?;
        let total = first.total;
        chunks.push(first);
        debug!(peripheral = id.0, total, "collection started");

        let mut consecutive_failures = 0u32;
        for index in 1..total {
            match self.pull_chunk(idx, session_id, index) {
                Ok(chunk) => {
                    consecutive_failures = 0;
                    chunks.push(chunk);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(peripheral = id.0, index, error = %e, "chunk pull failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_PULL_FAILURES {
                        warn!(peripheral = id.0, "abandoning collection mid-stream");
                        return Ok(chunks);
                    }
                }
            }
        }

        for sweep in 0..self.chunk_retry_sweeps {
            let have: std::collections::BTreeSet<u16> =
                chunks.iter().map(|c| c.index).collect();
            let missing: Vec<u16> = (0..total).filter(|i| !have.contains(i)).collect();
            if missing.is_empty() {
                break;
            }
            debug!(
                peripheral = id.0,
                sweep,
                missing = missing.len(),
                "re-requesting missing chunks"
            );
            for index in missing {
                if let Ok(chunk) = self.pull_chunk(idx, session_id, index) {
                    chunks.push(chunk);
                }
            }
        }

        info!(
            peripheral = id.0,
            received = chunks.len(),
            expected = total,
            "collection finished"
        );
        Ok(chunks)
    }

    pub fn bus_mut(&mut self) -> &mut T {
        &mut self.bus
    }

    fn wait_ready(&mut self, idx: usize, session_id: u64) -> Result<(), CollectError> {
        let id = self.links[idx].id();
        for attempt in 0..self.ready_poll_attempts {
            let reply = Self::transact_with_retry(
                &mut self.bus,
                &mut self.links[idx],
                &Frame::command(CommandOp::QueryReady, session_id),
                self.transact_timeout,
            )?;

            match reply {
                Frame::Status { code: StatusCode::Ready, .. } => {
                    debug!(peripheral = id.0, attempt, "peripheral ready");
                    return Ok(());
                }
                Frame::Status { code: StatusCode::CaptureFailed, detail } => {
                    return Err(CollectError::CaptureFailed(detail.to_string()));
                }
                Frame::Status {
                    code: StatusCode::NotReady | StatusCode::Busy,
                    ..
                } => {}
                other => {
                    warn!(peripheral = id.0, ?other, "unexpected readiness reply");
                }
            }
            std::thread::sleep(self.ready_poll_interval);
        }
        Err(CollectError::NotReady)
    }

    fn pull_chunk(
        &mut self,
        idx: usize,
        session_id: u64,
        index: u16,
    ) -> Result<DataChunk, CollectError> {
        let id = self.links[idx].id();
        let reply = Self::transact_with_retry(
            &mut self.bus,
            &mut self.links[idx],
            &Frame::command(CommandOp::RequestChunk { index }, session_id),
            self.transact_timeout,
        )?;

        match reply {
            Frame::Chunk(chunk) if chunk.index == index => Ok(chunk),
            Frame::Chunk(chunk) => {
                warn!(
                    peripheral = id.0,
                    requested = index,
                    got = chunk.index,
                    "chunk index mismatch"
                );
                Err(CollectError::Link(LinkError::BusFault { malformed: 1 }))
            }
            Frame::Status { code: StatusCode::CaptureFailed, detail } => {
                Err(CollectError::CaptureFailed(detail.to_string()))
            }
            Frame::Status { code, detail } => {
                Err(CollectError::Rejected(format!("{code:?}: {detail}")))
            }
            other => {
                warn!(peripheral = id.0, ?other, "unexpected chunk reply");
                Err(CollectError::Link(LinkError::BusFault { malformed: 1 }))
            }
        }
    }

    /// One transaction with the fixed local retry bound. A malformed decode
    /// inside the link already counts as a failed attempt there; here we
    /// retry whole transactions on timeout and bus fault alike.
    fn transact_with_retry(
        bus: &mut T,
        link: &mut PeripheralLink,
        frame: &Frame,
        timeout: Duration,
    ) -> Result<Frame, LinkError> {
        let mut last = LinkError::Timeout;
        for attempt in 1..=MAX_TRANSACT_ATTEMPTS {
            match link.transact(bus, frame, timeout) {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    debug!(
                        peripheral = link.id().0,
                        attempt,
                        error = %e,
                        "transact attempt failed"
                    );
                    last = e;
                }
            }
        }
        Err(last)
    }
}
