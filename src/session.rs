//! Capture session state machine and the interactive control surface.
//!
//! One `CaptureSession` exists per capture request and is driven to a
//! terminal state in a single call: broadcast, per-peripheral collection,
//! finalization. Failures are scoped to the narrowest entity (one
//! transaction, one peripheral) and never abort the session for the
//! others. The bus being exclusive means at most one session is ever
//! active, by construction.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::arbiter::BusArbiter;
use crate::config::{BusConfig, PeripheralId};
use crate::frame::{Frame, StatusCode};
use crate::link::BusTransport;
use crate::packet::PacketAssembler;

pub type SessionId = u64;

/// Terminal state of a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    /// Every targeted peripheral delivered a complete image.
    Complete,
    /// At least one, but not all, delivered a complete image.
    PartiallyComplete,
    /// No peripheral delivered, or the deadline elapsed first.
    Failed,
}

/// Per-peripheral progress through one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeripheralPhase {
    Pending,
    Acknowledged,
    Collecting,
    Complete,
    Failed,
}

/// A fully reassembled (or attempted) image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledImage {
    pub peripheral: PeripheralId,
    pub session: SessionId,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub chunks_received: u32,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralReport {
    pub id: PeripheralId,
    pub phase: PeripheralPhase,
    pub chunks_received: u32,
    pub chunks_expected: Option<u32>,
    pub error: Option<String>,
    pub image: Option<AssembledImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub outcome: SessionOutcome,
    pub started_at_ms: u64,
    pub elapsed_ms: u64,
    pub peripherals: Vec<PeripheralReport>,
}

/// Internal machine states; the terminal ones collapse into
/// [`SessionOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Broadcasting,
    Collecting,
    Finalizing,
}

pub struct CaptureSession {
    id: SessionId,
    deadline: Duration,
    state: SessionState,
    reports: Vec<PeripheralReport>,
}

impl CaptureSession {
    pub fn new(id: SessionId, targets: &[PeripheralId], deadline: Duration) -> Self {
        let reports = targets
            .iter()
            .map(|&id| PeripheralReport {
                id,
                phase: PeripheralPhase::Pending,
                chunks_received: 0,
                chunks_expected: None,
                error: None,
                image: None,
            })
            .collect();
        Self {
            id,
            deadline,
            state: SessionState::Idle,
            reports,
        }
    }

    /// Drives the session to a terminal state. Always returns a report;
    /// single-peripheral trouble shows up in the table, never as an error.
    pub fn run<T: BusTransport>(mut self, arbiter: &mut BusArbiter<T>) -> SessionReport {
        let started = Instant::now();
        let started_at_ms = unix_millis();

        self.enter(SessionState::Broadcasting);
        info!(session = self.id, peripherals = self.reports.len(), "session starting");

        for (id, result) in arbiter.broadcast(self.id) {
            let Some(report) = self.reports.iter_mut().find(|r| r.id == id) else {
                continue;
            };
            match result {
                Ok(Frame::Status { code: StatusCode::Accepted, .. }) => {
                    report.phase = PeripheralPhase::Acknowledged;
                }
                Ok(Frame::Status { code, detail }) => {
                    report.phase = PeripheralPhase::Failed;
                    report.error = Some(format!("capture command refused: {code:?} {detail}"));
                }
                Ok(other) => {
                    report.phase = PeripheralPhase::Failed;
                    report.error = Some(format!("unexpected broadcast reply: {other:?}"));
                }
                Err(e) => {
                    report.phase = PeripheralPhase::Failed;
                    report.error = Some(e.to_string());
                }
            }
        }

        self.enter(SessionState::Collecting);
        let mut deadline_hit = false;

        for i in 0..self.reports.len() {
            if self.reports[i].phase != PeripheralPhase::Acknowledged {
                continue;
            }

            // Cooperative cancellation point: between peripherals, never
            // mid-transaction.
            if started.elapsed() >= self.deadline {
                deadline_hit = true;
                warn!(session = self.id, "session deadline elapsed during collection");
                for report in self.reports[i..]
                    .iter_mut()
                    .filter(|r| r.phase == PeripheralPhase::Acknowledged)
                {
                    report.phase = PeripheralPhase::Failed;
                    report.error = Some("session deadline elapsed".to_string());
                }
                break;
            }

            let id = self.reports[i].id;
            self.reports[i].phase = PeripheralPhase::Collecting;
            match arbiter.collect(id, self.id) {
                Ok(chunks) => {
                    let report = &mut self.reports[i];
                    let mut assembler = PacketAssembler::new();
                    let mut offer_error = None;
                    for chunk in chunks {
                        if let Err(e) = assembler.offer(chunk) {
                            offer_error = Some(e);
                            break;
                        }
                    }
                    report.chunks_received = assembler.received() as u32;
                    report.chunks_expected = assembler.total().map(u32::from);

                    match offer_error.map(Err).unwrap_or_else(|| assembler.assemble()) {
                        Ok(payload) => {
                            report.phase = PeripheralPhase::Complete;
                            report.image = Some(AssembledImage {
                                peripheral: id,
                                session: self.id,
                                chunks_received: report.chunks_received,
                                complete: true,
                                payload,
                            });
                        }
                        Err(e) => {
                            report.phase = PeripheralPhase::Failed;
                            report.error = Some(e.to_string());
                        }
                    }
                }
                Err(e) => {
                    let report = &mut self.reports[i];
                    report.phase = PeripheralPhase::Failed;
                    report.error = Some(e.to_string());
                }
            }
        }

        self.enter(SessionState::Finalizing);
        let completed = self
            .reports
            .iter()
            .filter(|r| r.phase == PeripheralPhase::Complete)
            .count();
        let outcome = if deadline_hit {
            SessionOutcome::Failed
        } else if completed == self.reports.len() && completed > 0 {
            SessionOutcome::Complete
        } else if completed > 0 {
            SessionOutcome::PartiallyComplete
        } else {
            SessionOutcome::Failed
        };

        info!(
            session = self.id,
            ?outcome,
            completed,
            total = self.reports.len(),
            "session finished"
        );

        SessionReport {
            session_id: self.id,
            outcome,
            started_at_ms,
            elapsed_ms: started.elapsed().as_millis() as u64,
            peripherals: self.reports,
        }
    }

    fn enter(&mut self, next: SessionState) {
        debug!(session = self.id, from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }
}

/// The `status` / `start` surface. Holds at most one terminal report; a new
/// `start` replaces it. `status` never creates a session.
pub struct CaptureController<T: BusTransport> {
    arbiter: BusArbiter<T>,
    deadline: Duration,
    last_report: Option<SessionReport>,
}

impl<T: BusTransport> CaptureController<T> {
    pub fn new(arbiter: BusArbiter<T>, config: &BusConfig) -> Self {
        Self {
            arbiter,
            deadline: Duration::from_millis(config.session_deadline_ms),
            last_report: None,
        }
    }

    /// The last terminal session's table, if any capture ran yet. No side
    /// effects; asking before the first `start` is not an error.
    pub fn status(&self) -> Option<&SessionReport> {
        self.last_report.as_ref()
    }

    /// Runs exactly one capture session to a terminal state and returns its
    /// report.
    pub fn start(&mut self) -> &SessionReport {
        self.start_with_id(unix_millis())
    }

    /// Like [`start`](Self::start) but with a caller-chosen correlation
    /// token, which tests use for determinism.
    pub fn start_with_id(&mut self, session_id: SessionId) -> &SessionReport {
        let targets = self.arbiter.peripheral_ids();
        let session = CaptureSession::new(session_id, &targets, self.deadline);
        let report = session.run(&mut self.arbiter);
        self.last_report.insert(report)
    }

    pub fn arbiter_mut(&mut self) -> &mut BusArbiter<T> {
        &mut self.arbiter
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
