use camlink::agent::{AgentPhase, Camera, CameraError, PeripheralAgent};
use camlink::config::PeripheralId;
use camlink::frame::{CommandOp, Frame, StatusCode};
use camlink::sim::{FailingCamera, SimCamera};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CHUNK: usize = 200;
const TRANSACTION: usize = 256;

/// Camera that blocks until the test releases an image through the channel,
/// pinning the agent in the Capturing phase.
struct GatedCamera {
    gate: mpsc::Receiver<Vec<u8>>,
}

impl Camera for GatedCamera {
    fn capture_image(&mut self) -> Result<Vec<u8>, CameraError> {
        self.gate
            .recv()
            .map_err(|_| CameraError::Sensor("gate dropped".into()))
    }
}

fn sim_agent(id: u8, image_size: usize) -> PeripheralAgent {
    PeripheralAgent::new(
        PeripheralId(id),
        CHUNK,
        TRANSACTION,
        Arc::new(Mutex::new(SimCamera::new(PeripheralId(id), image_size))),
    )
}

fn gated_agent(id: u8) -> (PeripheralAgent, mpsc::Sender<Vec<u8>>) {
    let (tx, rx) = mpsc::channel();
    let agent = PeripheralAgent::new(
        PeripheralId(id),
        CHUNK,
        TRANSACTION,
        Arc::new(Mutex::new(GatedCamera { gate: rx })),
    );
    (agent, tx)
}

fn status_code(frame: &Frame) -> StatusCode {
    match frame {
        Frame::Status { code, .. } => *code,
        other => panic!("expected status frame, got {other:?}"),
    }
}

fn wait_for_phase(agent: &mut PeripheralAgent, phase: AgentPhase) {
    for _ in 0..500 {
        agent.update();
        if agent.phase() == phase {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("agent never reached {phase:?}, stuck in {:?}", agent.phase());
}

#[test]
fn test_capture_command_is_acknowledged_and_runs_off_thread() {
    let (mut agent, gate) = gated_agent(1);

    let reply = agent.handle_frame(&Frame::command(CommandOp::Capture, 10));
    assert_eq!(status_code(&reply), StatusCode::Accepted);
    assert_eq!(agent.phase(), AgentPhase::Capturing);

    // Still answering while the sensor is busy.
    let reply = agent.handle_frame(&Frame::command(CommandOp::QueryReady, 10));
    assert_eq!(status_code(&reply), StatusCode::NotReady);

    gate.send(vec![5u8; 300]).unwrap();
    wait_for_phase(&mut agent, AgentPhase::Ready);

    let reply = agent.handle_frame(&Frame::command(CommandOp::QueryReady, 10));
    assert_eq!(status_code(&reply), StatusCode::Ready);
}

#[test]
fn test_capture_while_capturing_reports_busy() {
    let (mut agent, _gate) = gated_agent(1);

    agent.handle_frame(&Frame::command(CommandOp::Capture, 10));
    let reply = agent.handle_frame(&Frame::command(CommandOp::Capture, 11));
    assert_eq!(status_code(&reply), StatusCode::Busy);
}

#[test]
fn test_queries_for_a_different_session_report_busy() {
    let (mut agent, gate) = gated_agent(1);

    agent.handle_frame(&Frame::command(CommandOp::Capture, 10));
    gate.send(vec![1u8; 100]).unwrap();
    wait_for_phase(&mut agent, AgentPhase::Ready);

    let reply = agent.handle_frame(&Frame::command(CommandOp::QueryReady, 99));
    assert_eq!(status_code(&reply), StatusCode::Busy);

    let reply = agent.handle_frame(&Frame::command(CommandOp::RequestChunk { index: 0 }, 99));
    assert_eq!(status_code(&reply), StatusCode::Busy);
}

#[test]
fn test_rebroadcast_of_same_session_does_not_recapture() {
    let mut agent = sim_agent(1, 500);

    agent.handle_frame(&Frame::command(CommandOp::Capture, 10));
    wait_for_phase(&mut agent, AgentPhase::Ready);

    let reply = agent.handle_frame(&Frame::command(CommandOp::Capture, 10));
    assert_eq!(status_code(&reply), StatusCode::Accepted);
    assert_eq!(agent.phase(), AgentPhase::Ready);
}

#[test]
fn test_failed_capture_is_reported_on_query() {
    let mut agent = PeripheralAgent::new(
        PeripheralId(2),
        CHUNK,
        TRANSACTION,
        Arc::new(Mutex::new(FailingCamera::new("lens cover stuck"))),
    );

    agent.handle_frame(&Frame::command(CommandOp::Capture, 10));
    wait_for_phase(&mut agent, AgentPhase::Idle);

    let reply = agent.handle_frame(&Frame::command(CommandOp::QueryReady, 10));
    assert_eq!(status_code(&reply), StatusCode::CaptureFailed);

    let reply = agent.handle_frame(&Frame::command(CommandOp::RequestChunk { index: 0 }, 10));
    assert_eq!(status_code(&reply), StatusCode::CaptureFailed);
}

#[test]
fn test_chunk_streaming_covers_every_index_then_idles() {
    let mut agent = sim_agent(3, 450);
    agent.handle_frame(&Frame::command(CommandOp::Capture, 20));
    wait_for_phase(&mut agent, AgentPhase::Ready);

    // 450 bytes at 200 per chunk means three chunks.
    for index in 0..3u16 {
        let reply = agent.handle_frame(&Frame::command(CommandOp::RequestChunk { index }, 20));
        match reply {
            Frame::Chunk(chunk) => {
                assert_eq!(chunk.index, index);
                assert_eq!(chunk.total, 3);
            }
            other => panic!("expected chunk {index}, got {other:?}"),
        }
    }
    assert_eq!(agent.phase(), AgentPhase::Idle);

    // The buffer outlives the stream so a reply lost on the wire can be
    // re-requested.
    let reply = agent.handle_frame(&Frame::command(CommandOp::RequestChunk { index: 1 }, 20));
    assert!(matches!(reply, Frame::Chunk(_)));
}

#[test]
fn test_out_of_range_chunk_request_is_refused() {
    let mut agent = sim_agent(1, 100);
    agent.handle_frame(&Frame::command(CommandOp::Capture, 5));
    wait_for_phase(&mut agent, AgentPhase::Ready);

    let reply = agent.handle_frame(&Frame::command(CommandOp::RequestChunk { index: 1 }, 5));
    assert_eq!(status_code(&reply), StatusCode::ChunkUnavailable);
}

#[test]
fn test_malformed_transaction_is_rejected_not_fatal() {
    let mut agent = sim_agent(1, 100);

    let response = agent.handle_transaction(&[0u8; TRANSACTION]);
    assert_eq!(response.len(), TRANSACTION);
    assert_eq!(status_code(&Frame::decode(&response).unwrap()), StatusCode::Rejected);

    // Still fully functional afterwards.
    let reply = agent.handle_frame(&Frame::command(CommandOp::Capture, 1));
    assert_eq!(status_code(&reply), StatusCode::Accepted);
}

#[test]
fn test_raw_transaction_dispatch_round_trips() {
    let mut agent = sim_agent(4, 250);

    let capture = Frame::command(CommandOp::Capture, 8).encode(TRANSACTION).unwrap();
    let response = agent.handle_transaction(&capture);
    assert_eq!(status_code(&Frame::decode(&response).unwrap()), StatusCode::Accepted);

    wait_for_phase(&mut agent, AgentPhase::Ready);

    let request = Frame::command(CommandOp::RequestChunk { index: 0 }, 8)
        .encode(TRANSACTION)
        .unwrap();
    let response = agent.handle_transaction(&request);
    match Frame::decode(&response).unwrap() {
        Frame::Chunk(chunk) => assert_eq!(chunk.total, 2),
        other => panic!("expected chunk, got {other:?}"),
    }
}
