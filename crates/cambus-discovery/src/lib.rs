//! cambus discovery - finding and provisioning GigE cameras
//!
//! Cameras may sit on a subnet the host cannot route to. Discovery and
//! forced IP assignment therefore go out as broadcasts on each host
//! adapter, and auto-assignment picks free addresses from the adapter's
//! own subnet.

pub mod adapter;
pub mod arp;
pub mod config;
pub mod discovery;
pub mod provision;

pub use adapter::detect_adapters;
pub use config::DiscoveryConfig;
pub use discovery::GigeNetwork;
pub use provision::{plan_assignments, AssignmentReport, IpAssignment};
