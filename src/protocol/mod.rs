//! Protocol header parsing and construction
//!
//! Zero-copy header views over received buffers, and in-place writers for the
//! pre-cooked frame buffers used on the transmit side.

pub mod checksum;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod types;
pub mod udp;

pub use types::{EtherType, InAny, MacAddr};
