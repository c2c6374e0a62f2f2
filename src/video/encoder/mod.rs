//! Video encoding
//!
//! - `traits`: the `HardwareEncoder` / `EncoderFactory` seam and session parameters
//! - `registry`: backend selection (hardware first, then priority)
//! - `session`: one encoder instance with an asynchronous output channel
//! - `openh264`: software H.264 backend (cargo feature `openh264`)

#[cfg(feature = "openh264")]
pub mod openh264;
pub mod registry;
pub mod session;
pub mod traits;

pub use registry::{AvailableEncoder, EncoderRegistry};
pub use session::{EncoderOutput, EncoderSession};
pub use traits::{EncodedPacket, EncoderFactory, EncoderParams, HardwareEncoder};

#[cfg(test)]
pub(crate) use session::testing;
