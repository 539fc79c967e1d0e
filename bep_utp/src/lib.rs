extern crate bep_util;
extern crate byteorder;
extern crate bytes;
extern crate futures;
#[macro_use]
extern crate log;
#[macro_use]
extern crate nom;
extern crate rand;
extern crate tokio_core;

mod buffer;
mod delay;
mod mtu;
mod mux;
mod packet;
mod socket;

pub mod error;

pub use crate::error::UtpError;
pub use crate::mux::{IUtpMessage, OUtpMessage, UtpSocketManager, UtpToken};
pub use crate::packet::{PacketExtension, PacketType, UtpPacket};
pub use crate::socket::{SocketState, UtpEvent, UtpSocket, UtpStats};

/// uTP wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
