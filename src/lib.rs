//! Bridge between a C2 platform and MAVLink-family multirotor UAVs.
//!
//! Each configured vehicle is advertised to the C2 as a live, taskable asset
//! with rate-bounded telemetry; tasks assigned by the C2 are validated,
//! translated into flight plans, executed, and reported back under a strictly
//! monotonic status-version protocol.
//!
//! Component map:
//! - [`uav`] — flight-link contract, operational adapter, simulated link
//! - [`session`] — per-UAV telemetry pump, smoothing, snapshots
//! - [`store`] — process-wide drone state with change notifications
//! - [`publisher`] — entity assembly and the dual-rate publish loops
//! - [`tasks`] — mapping / relay / dropping executors
//! - [`agent`] — C2 long-poll loop, task lifecycle, status versions
//! - [`supervisor`] — bring-up, health monitoring, ordered shutdown

pub mod agent;
pub mod c2;
pub mod config;
pub mod drone_id;
pub mod publisher;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod tasks;
pub mod telemetry;
pub mod uav;

pub mod c2_proto {
    include!(concat!(env!("OUT_DIR"), "/lattice.rs"));
}

pub use drone_id::DroneId;
