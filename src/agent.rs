//! Peripheral-side agent: the local mirror of a capture session.
//!
//! `Idle -> Capturing -> Ready -> Streaming -> Idle`. The camera runs on a
//! worker thread so the agent can keep answering bus transactions while the
//! capture is in flight; the controller's readiness polls see `NotReady`
//! instead of a stalled bus. The agent never initiates traffic, it only
//! answers the frame it was just handed.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::PeripheralId;
use crate::frame::{CommandOp, Frame, FrameError, StatusCode};
use crate::packet::{disassemble, DataChunk};

#[derive(Debug, Clone, Error)]
pub enum CameraError {
    #[error("sensor failure: {0}")]
    Sensor(String),
    #[error("camera driver unavailable")]
    Unavailable,
}

/// Camera collaborator. Consumed only by the agent; acquisition itself is
/// out of scope.
pub trait Camera: Send {
    fn capture_image(&mut self) -> Result<Vec<u8>, CameraError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    Idle,
    Capturing,
    Ready,
    Streaming,
}

pub struct PeripheralAgent {
    id: PeripheralId,
    chunk_size: usize,
    transaction_size: usize,
    camera: Arc<Mutex<dyn Camera>>,
    phase: AgentPhase,
    session_id: Option<u64>,
    chunks: Vec<DataChunk>,
    served: Vec<bool>,
    served_count: usize,
    capture_rx: Option<mpsc::Receiver<Result<Vec<u8>, CameraError>>>,
    capture_error: Option<String>,
}

impl PeripheralAgent {
    pub fn new(
        id: PeripheralId,
        chunk_size: usize,
        transaction_size: usize,
        camera: Arc<Mutex<dyn Camera>>,
    ) -> Self {
        Self {
            id,
            chunk_size,
            transaction_size,
            camera,
            phase: AgentPhase::Idle,
            session_id: None,
            chunks: Vec::new(),
            served: Vec::new(),
            served_count: 0,
            capture_rx: None,
            capture_error: None,
        }
    }

    pub fn id(&self) -> PeripheralId {
        self.id
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    /// Polls the capture worker. Cheap; called before handling every frame
    /// and from the service loop between transactions.
    pub fn update(&mut self) {
        if self.phase != AgentPhase::Capturing {
            return;
        }
        let Some(rx) = &self.capture_rx else { return };

        match rx.try_recv() {
            Ok(Ok(image)) => {
                self.capture_rx = None;
                match disassemble(&image, self.chunk_size) {
                    Ok(chunks) => {
                        info!(
                            peripheral = self.id.0,
                            bytes = image.len(),
                            chunks = chunks.len(),
                            "capture complete"
                        );
                        self.served = vec![false; chunks.len()];
                        self.served_count = 0;
                        self.chunks = chunks;
                        self.phase = AgentPhase::Ready;
                    }
                    Err(e) => {
                        warn!(peripheral = self.id.0, error = %e, "packetization failed");
                        self.capture_error = Some(e.to_string());
                        self.phase = AgentPhase::Idle;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(peripheral = self.id.0, error = %e, "capture failed");
                self.capture_rx = None;
                self.capture_error = Some(e.to_string());
                self.phase = AgentPhase::Idle;
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => {
                self.capture_rx = None;
                self.capture_error = Some("capture worker vanished".into());
                self.phase = AgentPhase::Idle;
            }
        }
    }

    /// Answers one decoded frame. Bounded work per call; nothing here ever
    /// blocks on the camera.
    pub fn handle_frame(&mut self, frame: &Frame) -> Frame {
        self.update();

        match frame {
            Frame::Command { op: CommandOp::Capture, session_id } => {
                self.handle_capture(*session_id)
            }
            Frame::Command { op: CommandOp::QueryReady, session_id } => {
                self.handle_query_ready(*session_id)
            }
            Frame::Command { op: CommandOp::RequestChunk { index }, session_id } => {
                self.handle_request_chunk(*session_id, *index)
            }
            _ => Frame::status(StatusCode::Rejected, "unexpected frame"),
        }
    }

    /// Decodes raw transaction bytes, dispatches, and re-encodes the reply
    /// padded to the transaction width. This is the entry point a slave-mode
    /// bus driver feeds.
    pub fn handle_transaction(&mut self, raw: &[u8]) -> Vec<u8> {
        let response = match Frame::decode(raw) {
            Ok(frame) => self.handle_frame(&frame),
            Err(FrameError::Malformed(reason)) => {
                warn!(peripheral = self.id.0, reason, "malformed transaction");
                Frame::status(StatusCode::Rejected, reason)
            }
        };
        // A status frame always fits the minimum transaction width.
        response
            .encode(self.transaction_size)
            .unwrap_or_else(|_| vec![0u8; self.transaction_size])
    }

    fn handle_capture(&mut self, session_id: u64) -> Frame {
        match self.phase {
            AgentPhase::Capturing | AgentPhase::Streaming => {
                Frame::status(StatusCode::Busy, &active_session_text(self.session_id))
            }
            AgentPhase::Ready if self.session_id == Some(session_id) => {
                // Re-broadcast of a session we already captured for.
                Frame::status(StatusCode::Accepted, "already captured")
            }
            AgentPhase::Idle | AgentPhase::Ready => {
                self.start_capture(session_id);
                Frame::status(StatusCode::Accepted, "")
            }
        }
    }

    fn handle_query_ready(&mut self, session_id: u64) -> Frame {
        if self.session_id != Some(session_id) {
            return Frame::status(StatusCode::Busy, &active_session_text(self.session_id));
        }
        match self.phase {
            AgentPhase::Capturing => Frame::status(StatusCode::NotReady, ""),
            AgentPhase::Ready | AgentPhase::Streaming => Frame::status(StatusCode::Ready, ""),
            AgentPhase::Idle => match &self.capture_error {
                Some(reason) => Frame::status(StatusCode::CaptureFailed, reason),
                // Retained chunks from a finished stream still answer polls.
                None if !self.chunks.is_empty() => Frame::status(StatusCode::Ready, ""),
                None => Frame::status(StatusCode::NotReady, ""),
            },
        }
    }

    fn handle_request_chunk(&mut self, session_id: u64, index: u16) -> Frame {
        if self.session_id != Some(session_id) {
            return Frame::status(StatusCode::Busy, &active_session_text(self.session_id));
        }
        if let Some(reason) = self.capture_error.clone() {
            return Frame::status(StatusCode::CaptureFailed, &reason);
        }

        let Some(chunk) = self.chunks.get(index as usize).cloned() else {
            return Frame::status(StatusCode::ChunkUnavailable, "index out of range");
        };

        if self.phase == AgentPhase::Ready {
            debug!(peripheral = self.id.0, "streaming started");
            self.phase = AgentPhase::Streaming;
        }

        if let Some(flag) = self.served.get_mut(index as usize) {
            if !*flag {
                *flag = true;
                self.served_count += 1;
            }
        }

        // After every chunk has gone out at least once the machine returns
        // to Idle, but the buffer is retained so a re-request for a reply
        // lost on the wire still gets an answer.
        if self.served_count == self.chunks.len() && self.phase == AgentPhase::Streaming {
            info!(peripheral = self.id.0, chunks = self.chunks.len(), "stream complete");
            self.phase = AgentPhase::Idle;
        }

        Frame::Chunk(chunk)
    }

    fn start_capture(&mut self, session_id: u64) {
        info!(peripheral = self.id.0, session = session_id, "capture starting");
        self.session_id = Some(session_id);
        self.capture_error = None;
        self.chunks.clear();
        self.served.clear();
        self.served_count = 0;
        self.phase = AgentPhase::Capturing;

        let (tx, rx) = mpsc::channel();
        self.capture_rx = Some(rx);
        let camera = Arc::clone(&self.camera);
        thread::spawn(move || {
            let result = match camera.lock() {
                Ok(mut cam) => cam.capture_image(),
                Err(_) => Err(CameraError::Unavailable),
            };
            // Receiver may be gone if a newer session superseded this one.
            let _ = tx.send(result);
        });
    }
}

fn active_session_text(session: Option<u64>) -> String {
    match session {
        Some(id) => format!("active session {id}"),
        None => "no active session".to_string(),
    }
}
