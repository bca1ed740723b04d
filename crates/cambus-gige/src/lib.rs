//! cambus GigE - GVCP wire protocol for Ethernet-attached cameras
//!
//! This crate encodes and decodes the GigE Vision Control Protocol messages
//! used for out-of-subnet discovery, forced IP assignment and control
//! privilege queries, and moves them over UDP (or a simulated segment).

pub mod protocol;
pub mod sim;
pub mod transport;

pub use protocol::{DiscoveryAck, ForceIpCommand, ProtocolError, GVCP_PORT};
pub use sim::{SimCamera, SimulatedGigeNetwork};
pub use transport::{GvcpLink, UdpGvcpLink};
