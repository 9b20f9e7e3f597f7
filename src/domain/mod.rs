//! Domain models - wire codec and canonical data types
//!
//! This module contains the types shared across the bridge:
//! - `codec` - hex payload encoding and `EVT:RXP2P` frame parsing
//! - `types` - enrollment records, roster entries, command schema

pub mod codec;
pub mod types;

pub use codec::ReplyFrame;
pub use types::{Command, CommandResponse, GatewayEnrollment, NodeRecord, ResponseEnvelope};
