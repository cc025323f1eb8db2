//! Edge connectivity core for HQ.
//!
//! Two subsystems run side by side: an outbound reverse tunnel that dials an
//! ingress relay and bridges tunneled TLS connections to loopback services by
//! SNI, and a mesh overlay client that joins an authenticated peer network
//! and exposes loopback services to peers. The [`supervisor::Supervisor`]
//! wires both together and owns their lifecycle.

pub mod certs;
pub mod config;
pub mod mesh;
pub mod secrets;
pub mod supervisor;
pub mod tunnel;

pub use config::Config;
pub use supervisor::{EdgeStatus, Supervisor};
pub use tunnel::TunnelEvent;
