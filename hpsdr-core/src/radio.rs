//! Hardware identity and shared mutable radio state.

use std::collections::HashMap;

use rand::Rng;

use crate::errors::ConfigError;

/// Board identity from the Thetis `HPSDRHW` enum: `(board_code, max_ddcs)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareProfile {
    pub name: &'static str,
    pub code: u8,
    pub max_ddcs: u8,
}

macro_rules! hw_profiles {
    ($($variant:ident => ($name:literal, $code:expr, $max_ddcs:expr)),+ $(,)?) => {
        impl HardwareProfile {
            $(pub const $variant: HardwareProfile = HardwareProfile {
                name: $name,
                code: $code,
                max_ddcs: $max_ddcs,
            };)+

            /// All known hardware profiles, in declaration order.
            pub const ALL: &'static [HardwareProfile] = &[$(HardwareProfile::$variant),+];
        }
    };
}

hw_profiles! {
    ATLAS => ("atlas", 0, 2),
    HERMES => ("hermes", 1, 4),
    HERMESII => ("hermesii", 2, 4),
    ANGELIA => ("angelia", 3, 5),
    ORION => ("orion", 4, 5),
    ORIONMKII => ("orionmkii", 5, 8),
    HERMESLITE => ("hermeslite", 6, 2),
    SATURN => ("saturn", 10, 10),
    SATURNMKII => ("saturnmkii", 11, 10),
}

impl HardwareProfile {
    /// Look up a profile by its lowercase CLI name (e.g. `"hermeslite"`).
    pub fn by_name(name: &str) -> Result<HardwareProfile, ConfigError> {
        HardwareProfile::ALL
            .iter()
            .copied()
            .find(|hw| hw.name == name)
            .ok_or_else(|| ConfigError::UnknownHardware {
                name: name.to_string(),
            })
    }
}

/// Protocol 1 sample-rate encoding: {48000, 96000, 192000, 384000} -> {0, 1, 2, 3}.
pub const SAMPLE_RATES_P1: [(u32, u8); 4] = [(48_000, 0), (96_000, 1), (192_000, 2), (384_000, 3)];

/// Number of receiver frequency slots a `RadioState` carries (Protocol 2's HP packet
/// addresses twelve regardless of how many DDCs are actually active).
pub const MAX_RX_SLOTS: usize = 12;

/// Mutable radio configuration shared across both protocol engines.
///
/// Single-owner: the protocol engines run on a current-thread Tokio executor and
/// share this behind an `Rc<RefCell<_>>`, never across OS threads (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct RadioState {
    pub hw: HardwareProfile,
    pub mac: [u8; 6],
    pub firmware_version: u8,
    pub mercury_versions: [u8; 4],
    pub penny_version: u8,
    pub metis_version: u8,

    pub sample_rate: u32,
    pub nddc: u8,
    pub rx_frequencies: [u32; MAX_RX_SLOTS],
    pub tx_frequency: u32,
    pub tx_drive: u8,
    pub running: bool,
    pub ptt: bool,

    seq: HashMap<String, u32>,
}

impl RadioState {
    /// Build a fresh radio state for the given hardware profile.
    ///
    /// `sample_rate` and `nddc` should reflect the protocol-appropriate defaults
    /// (48 kHz/any DDC count for Protocol 1, 192 kHz/`hw.max_ddcs` for Protocol 2);
    /// the caller decides, mirroring the original CLI's per-protocol defaults.
    pub fn new(hw: HardwareProfile, mac: [u8; 6], sample_rate: u32, nddc: u8) -> Self {
        Self {
            hw,
            mac,
            firmware_version: 25,
            mercury_versions: [25; 4],
            penny_version: 25,
            metis_version: 25,
            sample_rate,
            nddc: nddc.max(1),
            rx_frequencies: [7_074_000; MAX_RX_SLOTS],
            tx_frequency: 7_074_000,
            tx_drive: 0,
            running: false,
            ptt: false,
            seq: HashMap::new(),
        }
    }

    /// Return the current counter for `stream` and post-increment it modulo 2^32.
    pub fn next_seq(&mut self, stream: &str) -> u32 {
        let entry = self.seq.entry(stream.to_string()).or_insert(0);
        let val = *entry;
        *entry = entry.wrapping_add(1);
        val
    }

    /// Generate a random locally-administered, unicast MAC address.
    pub fn random_mac() -> [u8; 6] {
        let mut mac: [u8; 6] = rand::thread_rng().gen();
        mac[0] = (mac[0] | 0x02) & 0xFE;
        mac
    }

    /// Parse a `aa:bb:cc:dd:ee:ff` / `aa-bb-cc-dd-ee-ff` / bare-hex MAC string.
    pub fn parse_mac(text: &str) -> Result<[u8; 6], ConfigError> {
        let cleaned: String = text.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex_decode(&cleaned).ok_or_else(|| ConfigError::InvalidMacHex {
            hex: text.to_string(),
        })?;
        if bytes.len() != 6 {
            return Err(ConfigError::InvalidMacLength {
                actual: bytes.len(),
            });
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes);
        Ok(mac)
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
