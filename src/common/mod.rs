//! Wire-format types shared by the receiver: LCT/ALC headers, FDT instance
//! bodies and the session endpoint.

pub mod alc;
pub mod fdtinstance;
pub mod lct;
pub mod udpendpoint;

pub use udpendpoint::UDPEndpoint;
