//! # Multi-Camera Capture Bus
//!
//! A controller/peripheral capture system for rigs where several camera
//! peripherals share one synchronous serial bus, each behind its own
//! chip-select line.
//!
//! ## Features
//!
//! - **Fixed-width frame codec**: marker-prefixed command, status, and
//!   chunk frames padded to the bus transaction size
//! - **Packetization**: images split into indexed chunks and reassembled
//!   order-independently, with exact missing-index reporting
//! - **Bus arbitration**: one owner for the bus handle, so at most one
//!   select line is ever asserted
//! - **Capture sessions**: broadcast, poll readiness, pull every chunk,
//!   and report per-peripheral outcomes with single-fault isolation
//! - **Simulation rig**: the full protocol runs in-process with no
//!   hardware attached
//!
//! ## Quick Start
//!
//! ```rust
//! use camlink::config::BusConfig;
//! use camlink::session::CaptureController;
//! use camlink::sim;
//!
//! let config = BusConfig::default();
//! let (arbiter, _rig) = sim::build_rig(&config, 1024);
//!
//! let mut controller = CaptureController::new(arbiter, &config);
//! let report = controller.start();
//! println!("session {} -> {:?}", report.session_id, report.outcome);
//! ```
//!
//! ## Architecture
//!
//! - [`frame`] - Wire codec for command, status, and chunk frames
//! - [`packet`] - Image packetization and order-independent reassembly
//! - [`link`] - Per-peripheral chip-select plus the transact operation
//! - [`arbiter`] - Bus ownership, broadcast, and chunk collection
//! - [`session`] - Capture session state machine and control surface
//! - [`agent`] - Peripheral-side protocol agent
//! - [`config`] - Bus, timing, and chip-select configuration
//! - [`storage`] - Sinks for assembled images
//! - [`sim`] - In-process simulation of the whole rig

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod agent;
pub mod arbiter;
pub mod config;
pub mod frame;
pub mod link;
pub mod packet;
pub mod session;
pub mod sim;
pub mod storage;

// Re-export main public types for convenience
pub use agent::PeripheralAgent;
pub use arbiter::BusArbiter;
pub use config::{BusConfig, PeripheralId};
pub use frame::{Frame, FrameError};
pub use link::{LinkError, PeripheralLink};
pub use packet::{AssemblyError, PacketAssembler};
pub use session::{CaptureController, SessionOutcome, SessionReport};
