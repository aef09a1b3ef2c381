//! The protocol stack: frame/packet definitions, PHY reception model,
//! radio duty cycling, unslotted CSMA/CA MAC, and TARP routing.

pub mod mac;
pub mod packets;
pub mod phy;
pub mod rdc;
pub mod tarp;

pub use mac::CsmaMac;
pub use packets::LinkAddr;
pub use phy::{PhyLayer, Transmission};
pub use rdc::NullRdc;
pub use tarp::Tarp;
