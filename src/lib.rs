//! autocast - subscriber-driven adaptive video streaming
//!
//! Capture runs only while viewers are connected to the transport sink.
//! Frames are either converted to BGRA or compressed, then delivered in
//! capture order.

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod stream;
pub mod transport;
pub mod utils;
pub mod video;

pub use error::{Result, StreamError};
