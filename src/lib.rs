//! Cavern Egress Library
//!
//! Audio egress pipeline: drains a cyclic audio buffer, classifies the
//! bitstream and forwards it to an external sink process.

pub mod audio;
pub mod engine;
pub mod transport;

pub use audio::{FormatInfo, FormatTag, SharedBuffer};
pub use engine::{DrainEngine, DrainState, EngineConfig, EngineError};
pub use transport::{PipeTransport, Transport, TransportConfig, TransportError};
