//! Core protocol, codec, and signal-simulation library for the OpenHPSDR
//! radio emulator.
//!
//! Everything here is `!Send`-friendly by design: `RadioState`, `SignalGenerator`,
//! and `EchoBuffer` are meant to be shared behind `Rc<RefCell<_>>` on a single
//! current-thread Tokio executor, not across OS threads.

pub mod codec;
pub mod echo;
pub mod errors;
pub mod protocol1;
pub mod protocol2;
pub mod radio;
pub mod siggen;

pub use echo::EchoBuffer;
pub use errors::{BindError, ConfigError, RadioError, Result};
pub use radio::{HardwareProfile, RadioState};
pub use siggen::SignalGenerator;
