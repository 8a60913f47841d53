//! Message formats exchanged over the bus
//!
//! This module defines the envelope every published payload is wrapped in,
//! the status notices reported to the event sink and channel validation.

pub mod channels;
pub mod envelope;
pub mod notices;

pub use channels::*;
pub use envelope::*;
pub use notices::*;
