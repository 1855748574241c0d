//! In-process simulation of the capture rig.
//!
//! One `SimRig` stands in for the wiring harness: it holds every peripheral
//! agent, tracks which select line is asserted, and plays the role of the
//! bus controller's driver. Transactions execute synchronously inside
//! `exchange`, so tests and the demo binary run the full protocol with no
//! hardware and no sleeping beyond the controller's own poll intervals.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::agent::{Camera, CameraError, PeripheralAgent};
use crate::arbiter::BusArbiter;
use crate::config::{BusConfig, PeripheralId};
use crate::frame::FRAME_MARKER;
use crate::link::{BusTransport, ChipSelect, PeripheralLink, TransportError};

struct RigInner {
    agents: BTreeMap<u8, PeripheralAgent>,
    selected: Option<u8>,
    pending_response: Option<Vec<u8>>,
    dead: BTreeSet<u8>,
}

/// Shared handle to the simulated harness. Cloning is cheap; every clone
/// sees the same agents and select state.
#[derive(Clone)]
pub struct SimRig {
    inner: Arc<Mutex<RigInner>>,
}

impl SimRig {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RigInner {
                agents: BTreeMap::new(),
                selected: None,
                pending_response: None,
                dead: BTreeSet::new(),
            })),
        }
    }

    pub fn install_agent(&self, agent: PeripheralAgent) {
        let mut inner = self.lock();
        inner.agents.insert(agent.id().0, agent);
    }

    /// Makes a peripheral stop responding entirely, as if its wiring came
    /// loose. Every transfer addressed to it times out from then on.
    pub fn kill(&self, id: PeripheralId) {
        debug!(peripheral = id.0, "simulated peripheral killed");
        self.lock().dead.insert(id.0);
    }

    /// Runs a closure against one agent, for test assertions on its state.
    pub fn with_agent<R>(
        &self,
        id: PeripheralId,
        f: impl FnOnce(&mut PeripheralAgent) -> R,
    ) -> Option<R> {
        let mut inner = self.lock();
        inner.agents.get_mut(&id.0).map(f)
    }

    pub fn bus(&self) -> SimBus {
        SimBus { rig: self.clone() }
    }

    pub fn select_for(&self, id: PeripheralId) -> SimSelect {
        SimSelect {
            rig: self.clone(),
            id: id.0,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RigInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SimRig {
    fn default() -> Self {
        Self::new()
    }
}

/// The simulated bus driver. A transfer whose first byte is the frame
/// marker is handed to the selected agent, which prepares its reply; the
/// following all-zeros transfer clocks that reply back out, mirroring the
/// two-transfer shape of a real exchange.
pub struct SimBus {
    rig: SimRig,
}

impl BusTransport for SimBus {
    fn exchange(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut inner = self.rig.lock();

        let Some(selected) = inner.selected else {
            // Nobody listening; the wire floats low.
            rx.fill(0);
            return Ok(());
        };
        if inner.dead.contains(&selected) {
            return Err(TransportError::TimedOut);
        }

        if tx.first() == Some(&FRAME_MARKER) {
            let response = inner
                .agents
                .get_mut(&selected)
                .map(|agent| agent.handle_transaction(tx));
            inner.pending_response = response;
            rx.fill(0);
        } else {
            match inner.pending_response.take() {
                Some(response) => {
                    let n = response.len().min(rx.len());
                    rx[..n].copy_from_slice(&response[..n]);
                    rx[n..].fill(0);
                }
                None => rx.fill(0),
            }
        }
        Ok(())
    }
}

/// Select line for one simulated peripheral.
pub struct SimSelect {
    rig: SimRig,
    id: u8,
}

impl ChipSelect for SimSelect {
    fn assert(&mut self) {
        self.rig.lock().selected = Some(self.id);
    }

    fn deassert(&mut self) {
        let mut inner = self.rig.lock();
        if inner.selected == Some(self.id) {
            inner.selected = None;
            // A deselected peripheral drops any reply it had staged.
            inner.pending_response = None;
        }
    }
}

#[derive(Default)]
struct MonitorInner {
    active: BTreeSet<u8>,
    max_concurrent: usize,
    assert_log: Vec<u8>,
}

/// Observes select-line activity across a whole rig. Used to check that no
/// two lines are ever asserted at the same instant.
#[derive(Clone, Default)]
pub struct SelectMonitor {
    inner: Arc<Mutex<MonitorInner>>,
}

impl SelectMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of simultaneously asserted lines ever observed.
    pub fn max_concurrent(&self) -> usize {
        self.lock().max_concurrent
    }

    /// Peripheral ids in the order their lines were asserted.
    pub fn assert_order(&self) -> Vec<u8> {
        self.lock().assert_log.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Wraps a select line and reports every edge to a shared monitor.
pub struct RecordingSelect<S: ChipSelect> {
    inner: S,
    id: u8,
    monitor: SelectMonitor,
}

impl<S: ChipSelect> RecordingSelect<S> {
    pub fn new(inner: S, id: PeripheralId, monitor: SelectMonitor) -> Self {
        Self {
            inner,
            id: id.0,
            monitor,
        }
    }
}

impl<S: ChipSelect> ChipSelect for RecordingSelect<S> {
    fn assert(&mut self) {
        {
            let mut m = self.monitor.lock();
            m.active.insert(self.id);
            m.max_concurrent = m.max_concurrent.max(m.active.len());
            m.assert_log.push(self.id);
        }
        self.inner.assert();
    }

    fn deassert(&mut self) {
        self.inner.deassert();
        self.monitor.lock().active.remove(&self.id);
    }
}

/// Deterministic image source: byte `i` of peripheral `id` is always
/// `i * 31 + id`, so reassembly mistakes show up as content mismatches.
pub struct SimCamera {
    id: u8,
    image_size: usize,
}

impl SimCamera {
    pub fn new(id: PeripheralId, image_size: usize) -> Self {
        Self {
            id: id.0,
            image_size,
        }
    }

    pub fn expected_image(id: PeripheralId, image_size: usize) -> Vec<u8> {
        (0..image_size)
            .map(|i| (i.wrapping_mul(31).wrapping_add(id.0 as usize)) as u8)
            .collect()
    }
}

impl Camera for SimCamera {
    fn capture_image(&mut self) -> Result<Vec<u8>, CameraError> {
        Ok((0..self.image_size)
            .map(|i| (i.wrapping_mul(31).wrapping_add(self.id as usize)) as u8)
            .collect())
    }
}

/// A sensor that fails every capture with a fixed diagnostic.
pub struct FailingCamera {
    reason: String,
}

impl FailingCamera {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

impl Camera for FailingCamera {
    fn capture_image(&mut self) -> Result<Vec<u8>, CameraError> {
        Err(CameraError::Sensor(self.reason.clone()))
    }
}

/// Builds a full simulated rig from a configuration, one `SimCamera` of
/// `image_size` bytes per configured peripheral.
pub fn build_rig(config: &BusConfig, image_size: usize) -> (BusArbiter<SimBus>, SimRig) {
    build_rig_with(config, |id| {
        Arc::new(Mutex::new(SimCamera::new(id, image_size)))
    })
}

/// Builds a simulated rig with a caller-chosen camera per peripheral.
pub fn build_rig_with(
    config: &BusConfig,
    mut camera_for: impl FnMut(PeripheralId) -> Arc<Mutex<dyn Camera>>,
) -> (BusArbiter<SimBus>, SimRig) {
    let rig = SimRig::new();
    let mut arbiter = BusArbiter::new(rig.bus(), config);

    for p in &config.peripherals {
        rig.install_agent(PeripheralAgent::new(
            p.id,
            config.chunk_payload_size,
            config.transaction_size,
            camera_for(p.id),
        ));
        let link = PeripheralLink::new(
            p.id,
            Box::new(rig.select_for(p.id)),
            config.transaction_size,
        );
        // Ids come from a validated config; duplicates cannot reach here.
        let _ = arbiter.add_link(link);
    }

    (arbiter, rig)
}

/// Like [`build_rig`] but wires every select through a shared
/// [`SelectMonitor`].
pub fn build_monitored_rig(
    config: &BusConfig,
    image_size: usize,
) -> (BusArbiter<SimBus>, SimRig, SelectMonitor) {
    let rig = SimRig::new();
    let monitor = SelectMonitor::new();
    let mut arbiter = BusArbiter::new(rig.bus(), config);

    for p in &config.peripherals {
        rig.install_agent(PeripheralAgent::new(
            p.id,
            config.chunk_payload_size,
            config.transaction_size,
            Arc::new(Mutex::new(SimCamera::new(p.id, image_size))),
        ));
        let select = RecordingSelect::new(rig.select_for(p.id), p.id, monitor.clone());
        let link = PeripheralLink::new(p.id, Box::new(select), config.transaction_size);
        let _ = arbiter.add_link(link);
    }

    (arbiter, rig, monitor)
}
