//! UDP plumbing for the name resolver.

pub mod endpoint;
pub mod socket;

pub use endpoint::{Endpoint, EndpointError};
pub use socket::UdpSocket;
