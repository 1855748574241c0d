use camlink::agent::{Camera, CameraError, PeripheralAgent};
use camlink::arbiter::BusArbiter;
use camlink::config::{BusConfig, PeripheralId};
use camlink::link::PeripheralLink;
use camlink::session::{CaptureController, PeripheralPhase, SessionOutcome};
use camlink::sim::{self, FailingCamera, SimCamera, SimRig};
use camlink::storage::{MemoryStorage, Storage};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.transact_timeout_ms = 20;
    config.ready_poll_interval_ms = 1;
    config.ready_poll_attempts = 500;
    config.session_deadline_ms = 30_000;
    config
}

#[test]
fn test_status_before_any_session_is_none() {
    let config = test_config();
    let (arbiter, _rig) = sim::build_rig(&config, 256);
    let controller = CaptureController::new(arbiter, &config);

    assert!(controller.status().is_none());
}

#[test]
fn test_full_rig_capture_completes_for_all_five() {
    let config = test_config();
    let (arbiter, _rig) = sim::build_rig(&config, 4096);
    let mut controller = CaptureController::new(arbiter, &config);

    let report = controller.start_with_id(42);

    assert_eq!(report.session_id, 42);
    assert_eq!(report.outcome, SessionOutcome::Complete);
    assert_eq!(report.peripherals.len(), 5);

    for p in &report.peripherals {
        assert_eq!(p.phase, PeripheralPhase::Complete, "{} failed: {:?}", p.id, p.error);
        // 4096 bytes at 200 per chunk.
        assert_eq!(p.chunks_expected, Some(21));
        assert_eq!(p.chunks_received, 21);

        let image = p.image.as_ref().unwrap();
        assert!(image.complete);
        assert_eq!(image.payload, SimCamera::expected_image(p.id, 4096));
    }

    // The report is retained for later status queries.
    let report = controller.status().unwrap();
    assert_eq!(report.session_id, 42);
}

#[test]
fn test_dead_peripheral_fails_alone() {
    let config = test_config();
    let (arbiter, rig) = sim::build_rig(&config, 1024);
    rig.kill(PeripheralId(3));

    let mut controller = CaptureController::new(arbiter, &config);
    let report = controller.start_with_id(7);

    assert_eq!(report.outcome, SessionOutcome::PartiallyComplete);
    for p in &report.peripherals {
        if p.id == PeripheralId(3) {
            assert_eq!(p.phase, PeripheralPhase::Failed);
            assert!(p.error.is_some());
            assert!(p.image.is_none());
        } else {
            assert_eq!(p.phase, PeripheralPhase::Complete, "{} failed: {:?}", p.id, p.error);
        }
    }
}

#[test]
fn test_sensor_fault_fails_alone() {
    let config = test_config();
    let (arbiter, _rig) = sim::build_rig_with(&config, |id| {
        if id == PeripheralId(2) {
            Arc::new(Mutex::new(FailingCamera::new("lens cover stuck")))
        } else {
            Arc::new(Mutex::new(SimCamera::new(id, 1024)))
        }
    });

    let mut controller = CaptureController::new(arbiter, &config);
    let report = controller.start_with_id(8);

    assert_eq!(report.outcome, SessionOutcome::PartiallyComplete);
    let failed = report
        .peripherals
        .iter()
        .find(|p| p.id == PeripheralId(2))
        .unwrap();
    assert_eq!(failed.phase, PeripheralPhase::Failed);
    assert!(failed.error.as_ref().unwrap().contains("lens cover stuck"));

    let healthy = report
        .peripherals
        .iter()
        .filter(|p| p.phase == PeripheralPhase::Complete)
        .count();
    assert_eq!(healthy, 4);
}

/// Camera whose peripheral's wiring drops partway through the session:
/// the capture command is acknowledged, then the device goes silent.
struct VanishingCamera {
    rig: SimRig,
    id: PeripheralId,
}

impl Camera for VanishingCamera {
    fn capture_image(&mut self) -> Result<Vec<u8>, CameraError> {
        // Let the broadcast sweep finish before the wiring drops.
        std::thread::sleep(Duration::from_millis(20));
        self.rig.kill(self.id);
        Ok(vec![0u8; 256])
    }
}

#[test]
fn test_peripheral_going_silent_during_collection_fails_alone() {
    let config = test_config();
    let rig = SimRig::new();
    let mut arbiter = BusArbiter::new(rig.bus(), &config);

    for p in &config.peripherals {
        let camera: Arc<Mutex<dyn Camera>> = if p.id == PeripheralId(3) {
            Arc::new(Mutex::new(VanishingCamera { rig: rig.clone(), id: p.id }))
        } else {
            Arc::new(Mutex::new(SimCamera::new(p.id, 1024)))
        };
        rig.install_agent(PeripheralAgent::new(
            p.id,
            config.chunk_payload_size,
            config.transaction_size,
            camera,
        ));
        let link = PeripheralLink::new(
            p.id,
            Box::new(rig.select_for(p.id)),
            config.transaction_size,
        );
        assert!(arbiter.add_link(link).is_ok());
    }

    let mut controller = CaptureController::new(arbiter, &config);
    let report = controller.start_with_id(14);

    assert_eq!(report.outcome, SessionOutcome::PartiallyComplete);
    for p in &report.peripherals {
        if p.id == PeripheralId(3) {
            assert_eq!(p.phase, PeripheralPhase::Failed);
            assert!(p.error.as_ref().unwrap().contains("timeout"));
        } else {
            assert_eq!(p.phase, PeripheralPhase::Complete, "{} failed: {:?}", p.id, p.error);
        }
    }
}

#[test]
fn test_every_peripheral_dead_fails_the_session() {
    let config = test_config();
    let (arbiter, rig) = sim::build_rig(&config, 512);
    for p in &config.peripherals {
        rig.kill(p.id);
    }

    let mut controller = CaptureController::new(arbiter, &config);
    let report = controller.start_with_id(9);

    assert_eq!(report.outcome, SessionOutcome::Failed);
    assert!(report.peripherals.iter().all(|p| p.phase == PeripheralPhase::Failed));
}

#[test]
fn test_expired_deadline_fails_remaining_peripherals() {
    let mut config = test_config();
    config.session_deadline_ms = 0;
    let (arbiter, _rig) = sim::build_rig(&config, 512);

    let mut controller = CaptureController::new(arbiter, &config);
    let report = controller.start_with_id(10);

    assert_eq!(report.outcome, SessionOutcome::Failed);
    for p in &report.peripherals {
        assert_eq!(p.phase, PeripheralPhase::Failed);
        assert!(p.error.as_ref().unwrap().contains("deadline"));
    }
}

#[test]
fn test_new_session_replaces_the_previous_report() {
    let config = test_config();
    let (arbiter, _rig) = sim::build_rig(&config, 512);
    let mut controller = CaptureController::new(arbiter, &config);

    controller.start_with_id(1);
    controller.start_with_id(2);

    assert_eq!(controller.status().unwrap().session_id, 2);
}

#[test]
fn test_completed_images_can_be_stored() {
    let config = test_config();
    let (arbiter, _rig) = sim::build_rig(&config, 800);
    let mut controller = CaptureController::new(arbiter, &config);
    let report = controller.start_with_id(12).clone();

    let mut storage = MemoryStorage::new();
    for p in &report.peripherals {
        if let Some(image) = &p.image {
            storage.save(p.id, report.session_id, &image.payload).unwrap();
        }
    }

    assert_eq!(storage.len(), 5);
    assert_eq!(
        storage.get(PeripheralId(5), 12).unwrap(),
        &SimCamera::expected_image(PeripheralId(5), 800)
    );
}
