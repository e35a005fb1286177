//! HPSDR emulator error types with granular categories

use thiserror::Error;

/// Top-level error type for all radio-emulator operations
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("socket bind error: {0}")]
    Bind(#[from] BindError),
}

/// Errors raised while turning CLI input into a `RadioState`/`SignalGenerator`
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown radio hardware profile: {name}")]
    UnknownHardware { name: String },

    #[error("MAC address must be exactly 6 bytes, got {actual}")]
    InvalidMacLength { actual: usize },

    #[error("invalid MAC address hex string: {hex}")]
    InvalidMacHex { hex: String },
}

/// Socket bind failures: fatal at startup, one radio-side UDP port per variant
#[derive(Debug, Error)]
pub enum BindError {
    #[error("could not bind UDP port {port}: {source}")]
    Port {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for radio-emulator operations
pub type Result<T> = std::result::Result<T, RadioError>;
