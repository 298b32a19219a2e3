//! Session recorders: text mode for SSH (C2), framed mode for RDP (C3).

pub mod framed;
pub mod text;

pub use framed::{FramedRecording, IDLE_CAP_MS};
pub use text::TextRecording;
