//! The `signal` module defines the pure numerical primitives the line
//! decoder is built from: gaussian smoothing, linear interpolation between
//! two non-uniform grids, normalization, and the fixed byte alphabets used
//! to constrain the discrete search (Hamming 8/4 and odd-parity).
//!
//! Everything here is stateless and operates on plain `&[f64]` slices; there
//! is no dependency on the rest of the crate.

use std::sync::OnceLock;

/// Number of samples in one captured scanline, the default for a bt8x8-class
/// capture card.
pub const N_SAMPLES: usize = 2048;

/// Length of the guess/mask buffers: 47 bytes (42 data + 3 framing + 2 pad)
/// expanded to bit level.
pub const GUESS_LEN: usize = 47 * 8;

/// Number of data byte positions in a teletext packet.
pub const PACKET_LEN: usize = 42;

/// 1-D gaussian smoothing of `v` with standard deviation `sigma` samples.
///
/// Boundary samples are handled by clamping the kernel window to the valid
/// index range (equivalent to edge-replicated padding). The decoder's
/// optimizer is insensitive to this choice as long as it's applied
/// consistently within a line, which it is — every call in this crate goes
/// through this one function.
pub fn gauss(v: &[f64], sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 || v.is_empty() {
        return v.to_vec();
    }

    // Truncate the kernel at 4 standard deviations, as scipy's
    // gaussian_filter1d does by default.
    let radius = (4.0 * sigma).ceil() as isize;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let mut sum = 0.0;
    for k in -radius..=radius {
        let w = (-((k * k) as f64) / (2.0 * sigma * sigma)).exp();
        kernel.push(w);
        sum += w;
    }
    for w in kernel.iter_mut() {
        *w /= sum;
    }

    let n = v.len() as isize;
    let mut out = Vec::with_capacity(v.len());
    for i in 0..n {
        let mut acc = 0.0;
        for (j, w) in kernel.iter().enumerate() {
            let k = i + (j as isize - radius);
            let idx = k.clamp(0, n - 1) as usize;
            acc += v[idx] * w;
        }
        out.push(acc);
    }
    out
}

#[test]
fn test_gauss() {
    let mut v = vec![0.0; 21];
    v[10] = 100.0;
    let smoothed = gauss(&v, 2.0);
    assert_eq!(smoothed.len(), v.len());
    assert!(smoothed[10] < 100.0);
    assert!(smoothed[10] > 0.0);
}

/// Piecewise-linear interpolation of `ys` sampled at the monotone grid `xs`,
/// evaluated at each point in `query`. Queries outside `[xs[0], xs[last]]`
/// return `fill`.
pub fn interp_linear(xs: &[f64], ys: &[f64], query: &[f64], fill: f64) -> Vec<f64> {
    debug_assert_eq!(xs.len(), ys.len());

    query
        .iter()
        .map(|&q| interp_one(xs, ys, q, fill))
        .collect()
}

#[test]
fn test_interp_linear() {
    let xs = vec![0.0, 1.0, 2.0, 3.0];
    let ys = vec![0.0, 10.0, 20.0, 30.0];
    let out = interp_linear(&xs, &ys, &[0.0, 1.5, 3.0], -1.0);
    assert_eq!(out[0], 0.0);
    assert_eq!(out[1], 15.0);
    assert_eq!(out[2], 30.0);

    let xs = vec![0.0, 1.0];
    let ys = vec![0.0, 1.0];
    let out = interp_linear(&xs, &ys, &[-1.0, 2.0], 42.0);
    assert_eq!(out, vec![42.0, 42.0]);
}

fn interp_one(xs: &[f64], ys: &[f64], q: f64, fill: f64) -> f64 {
    if xs.is_empty() || q < xs[0] || q > xs[xs.len() - 1] {
        return fill;
    }
    // Binary search for the rightmost xs[i] <= q.
    match xs.binary_search_by(|probe| probe.partial_cmp(&q).unwrap()) {
        Ok(i) => ys[i],
        Err(0) => ys[0],
        Err(i) => {
            let (x0, x1) = (xs[i - 1], xs[i]);
            let (y0, y1) = (ys[i - 1], ys[i]);
            if x1 == x0 {
                y0
            } else {
                y0 + (y1 - y0) * (q - x0) / (x1 - x0)
            }
        }
    }
}

/// Shifts and scales `v` in place so its minimum maps to 0 and its maximum
/// maps to 255. A constant input (zero range) normalises to all-zero rather
/// than dividing by zero.
pub fn normalise(v: &mut [f64]) {
    let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
    for &x in v.iter() {
        if x < lo {
            lo = x;
        }
        if x > hi {
            hi = x;
        }
    }
    let range = hi - lo;
    if range == 0.0 {
        for x in v.iter_mut() {
            *x = 0.0;
        }
        return;
    }
    for x in v.iter_mut() {
        *x = (*x - lo) * 255.0 / range;
    }
}

#[test]
fn test_normalise() {
    let mut v = vec![10.0, 20.0, 5.0, 25.0];
    normalise(&mut v);
    assert!((v.iter().cloned().fold(f64::INFINITY, f64::min) - 0.0).abs() < 1e-9);
    assert!((v.iter().cloned().fold(f64::NEG_INFINITY, f64::max) - 255.0).abs() < 1e-9);

    let mut constant = vec![7.0; 5];
    normalise(&mut constant);
    assert!(constant.iter().all(|&x| x == 0.0));
}

/// Writes byte `b` into the bit-level buffer `buf` at byte position `n + 1`
/// (the `+1` accounts for the one-byte pre-roll padding at the front of the
/// guess/mask buffers). Bits are written low-bit-first: a 0 bit becomes
/// level 0.0, a 1 bit becomes level 255.0, across 8 consecutive slots.
///
/// `n == -1` addresses the pre-roll padding byte itself.
pub fn set_byte(buf: &mut [f64], n: i32, b: u8) {
    let base = ((n + 1) * 8) as usize;
    for i in 0..8 {
        buf[base + i] = if (b >> i) & 1 == 1 { 255.0 } else { 0.0 };
    }
}

#[test]
fn test_set_byte() {
    let mut buf = vec![0.0; GUESS_LEN];
    set_byte(&mut buf, 0, 0b1010_0101);
    let bit = |i: usize| buf[8 + i];
    assert_eq!(bit(0), 255.0); // bit0 = 1
    assert_eq!(bit(1), 0.0); // bit1 = 0
    assert_eq!(bit(2), 255.0); // bit2 = 1
    assert_eq!(bit(7), 255.0); // bit7 = 1

    let mut buf = vec![0.0; GUESS_LEN];
    set_byte(&mut buf, -1, 0xff);
    assert!(buf[0..8].iter().all(|&x| x == 255.0));
}

/// Encodes a 4-bit nibble (`0..16`) as an 8-bit Hamming(8,4) codeword.
///
/// Bit layout, transmitted LSB-first: `P1 P2 D1 P3 D2 D3 D4 P4`, where `P1`
/// covers `D1,D2,D4`, `P2` covers `D1,D3,D4`, `P3` covers `D2,D3,D4`, and
/// `P4` is an overall even-parity bit over the other seven. This crate only
/// consumes the resulting 16-codeword set as a closed alphabet for
/// constraining the byte search (see `hamm_bytes`) — it never decodes a
/// transmitted magazine/row byte back into a page-number semantic, which
/// would require matching a broadcast standard's exact bit layout and is
/// explicitly out of scope.
fn hamming_encode(nibble: u8) -> u8 {
    let d1 = (nibble) & 1;
    let d2 = (nibble >> 1) & 1;
    let d3 = (nibble >> 2) & 1;
    let d4 = (nibble >> 3) & 1;

    let p1 = d1 ^ d2 ^ d4;
    let p2 = d1 ^ d3 ^ d4;
    let p3 = d2 ^ d3 ^ d4;
    let p4 = p1 ^ p2 ^ d1 ^ p3 ^ d2 ^ d3 ^ d4;

    p1 | (p2 << 1) | (d1 << 2) | (p3 << 3) | (d2 << 4) | (d3 << 5) | (d4 << 6) | (p4 << 7)
}

static HAMM_BYTES: OnceLock<[u8; 16]> = OnceLock::new();
static PARITY_BYTES: OnceLock<[u8; 128]> = OnceLock::new();
static ALL_BYTES: OnceLock<[u8; 256]> = OnceLock::new();

/// The 16 valid Hamming(8,4) codewords, computed once on first use.
pub fn hamm_bytes() -> &'static [u8; 16] {
    HAMM_BYTES.get_or_init(|| {
        let mut table = [0u8; 16];
        for (nibble, slot) in table.iter_mut().enumerate() {
            *slot = hamming_encode(nibble as u8);
        }
        table
    })
}

#[test]
fn test_hamm_bytes() {
    let table = hamm_bytes();
    let mut sorted = table.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 16);
}

/// The 128 odd-parity bytes (those whose population count is odd),
/// computed once on first use.
pub fn parity_bytes() -> &'static [u8; 128] {
    PARITY_BYTES.get_or_init(|| {
        let mut table = [0u8; 128];
        let mut i = 0;
        for b in 0..=255u8 {
            if b.count_ones() % 2 == 1 {
                table[i] = b;
                i += 1;
            }
        }
        debug_assert_eq!(i, 128);
        table
    })
}

#[test]
fn test_parity_bytes() {
    for &b in parity_bytes() {
        assert_eq!(b.count_ones() % 2, 1);
    }
    assert_eq!(parity_bytes().len(), 128);
}

/// All 256 byte values, for positions with no alphabet constraint.
pub fn all_bytes() -> &'static [u8; 256] {
    ALL_BYTES.get_or_init(|| {
        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = i as u8;
        }
        table
    })
}

#[test]
fn test_all_bytes() {
    for (i, &b) in all_bytes().iter().enumerate() {
        assert_eq!(b as usize, i);
    }
}
