//! Guacamole instruction framing (C1): the wire protocol spoken with the rendering daemon and,
//! for RDP sessions, with the browser client.

mod codec;

pub use codec::{decode, encode, Instruction};
