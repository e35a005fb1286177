//! Pure byte <-> complex-sample codecs for the host wire formats.
//!
//! Every function here is a deterministic, allocation-bounded transform: no I/O,
//! no shared state. Sample components are clipped to `[-1.0, 1.0]` on encode and
//! never rejected, matching the emulator's "liberal inbound, strict outbound"
//! error-handling stance.

use num_complex::Complex64;

const MAX_24BIT: f64 = 8_388_607.0; // 2^23 - 1

/// Pack complex I/Q samples into 24-bit big-endian bytes: 3B I + 3B Q per sample.
pub fn pack_iq_24bit(samples: &[Complex64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 6);
    for s in samples {
        push_i24(&mut out, s.re);
        push_i24(&mut out, s.im);
    }
    out
}

fn push_i24(out: &mut Vec<u8>, value: f64) {
    let [a, b, c] = encode_i24(value);
    out.push(a);
    out.push(b);
    out.push(c);
}

/// Encode a single real-valued component as three big-endian 24-bit bytes.
/// Used directly by the protocol engines when interleaving per-DDC I/Q into a
/// wider frame layout that `pack_iq_24bit`'s flat encoding doesn't match.
pub fn encode_i24(value: f64) -> [u8; 3] {
    let clipped = value.clamp(-1.0, 1.0) * MAX_24BIT;
    let iv = (clipped as i32) & 0x00FF_FFFF;
    [
        ((iv >> 16) & 0xFF) as u8,
        ((iv >> 8) & 0xFF) as u8,
        (iv & 0xFF) as u8,
    ]
}

/// Unpack host-supplied 24-bit big-endian TX I/Q (Protocol 2 ports 1028/1029).
/// Trailing bytes shorter than one 6-byte block are discarded.
pub fn unpack_tx_iq_24bit(data: &[u8]) -> Vec<Complex64> {
    data.chunks_exact(6)
        .map(|b| {
            let i = sign_extend_24(u32::from(b[0]) << 16 | u32::from(b[1]) << 8 | u32::from(b[2]));
            let q = sign_extend_24(u32::from(b[3]) << 16 | u32::from(b[4]) << 8 | u32::from(b[5]));
            Complex64::new(f64::from(i) / MAX_24BIT, f64::from(q) / MAX_24BIT)
        })
        .collect()
}

fn sign_extend_24(v: u32) -> i32 {
    if v & 0x0080_0000 != 0 {
        (v | 0xFF00_0000) as i32
    } else {
        v as i32
    }
}

/// Unpack a Protocol 1 host sub-frame's TX I/Q. Each 8-byte block is
/// `L(2B) R(2B) I(2B) Q(2B)`, all big-endian signed; L/R are discarded.
pub fn unpack_tx_iq_16bit(data: &[u8]) -> Vec<Complex64> {
    data.chunks_exact(8)
        .map(|b| {
            let i = i16::from_be_bytes([b[4], b[5]]);
            let q = i16::from_be_bytes([b[6], b[7]]);
            Complex64::new(f64::from(i) / 32768.0, f64::from(q) / 32768.0)
        })
        .collect()
}

/// Unpack Protocol 2 TX audio: 4-byte blocks of `L(2B) R(2B)` big-endian signed,
/// treated as real + imaginary to form a complex I/Q stream.
pub fn unpack_tx_audio_16bit(data: &[u8]) -> Vec<Complex64> {
    data.chunks_exact(4)
        .map(|b| {
            let l = i16::from_be_bytes([b[0], b[1]]);
            let r = i16::from_be_bytes([b[2], b[3]]);
            Complex64::new(f64::from(l) / 32768.0, f64::from(r) / 32768.0)
        })
        .collect()
}

/// `n` samples of 16-bit silence, for the mic stream.
pub fn pack_silence_16bit(n: usize) -> Vec<u8> {
    vec![0u8; n * 2]
}
