//! Hardware light gateway
//!
//! Bridges software light modules to physical LED hardware: grid controllers
//! on SysEx MIDI, addressable strips on HTTP JSON, raw UDP, or a relay
//! socket. Modules submit full frames; the gateway composites them, diffs
//! against resident hardware state, throttles the wire, and decodes button
//! input back into normalized events.

pub mod color;
pub mod compositor;
pub mod config;
pub mod device;
pub mod events;
pub mod gateway;
pub mod midi;
pub mod queue;
pub mod transport;

pub use color::Rgb;
pub use compositor::{BlendMode, Frame};
pub use config::AppConfig;
pub use device::{ConnectionStatus, DeviceKind, TransportId};
pub use events::{CoreEvent, InputEvent, InputKind};
pub use gateway::{Gateway, GatewayError};
pub use queue::Priority;
