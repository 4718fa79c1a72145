//! The `synth` module renders a known 42-byte packet back into a synthetic
//! raw scanline — the inverse of decoding. Used by this crate's own tests
//! to generate ground-truth input with a known-correct answer, and exposed
//! publicly since downstream consumers exercising their own pipeline wiring
//! face the same need (e.g. testing against a simulated capture card before
//! real hardware is available).

use crate::signal::{gauss, interp_linear, GUESS_LEN, PACKET_LEN};

const GAUSS_SD: f64 = 5.5;

/// Renders `payload` into `n_samples` raw samples at the given `bit_width`
/// and CRI `offset`, as if captured by a bt8x8-class card. The framing
/// bytes (pad, CRI, FC) are synthesized automatically ahead of the payload.
pub fn render_line(payload: &[u8; PACKET_LEN], bit_width: f64, offset: f64, n_samples: usize) -> Vec<f64> {
    let mut levels = vec![0.0; GUESS_LEN];
    crate::signal::set_byte(&mut levels, -1, 0x00);
    crate::signal::set_byte(&mut levels, 0, 0x55);
    crate::signal::set_byte(&mut levels, 1, 0x55);
    crate::signal::set_byte(&mut levels, 2, 0x27);
    for (n, &b) in payload.iter().enumerate() {
        crate::signal::set_byte(&mut levels, (n + 3) as i32, b);
    }

    let mut interp_x = vec![0.0; GUESS_LEN];
    for (i, x) in interp_x.iter_mut().enumerate() {
        *x = i as f64 * bit_width - 8.0 * bit_width;
    }

    let query: Vec<f64> = (0..n_samples).map(|i| i as f64 - offset).collect();
    let rendered = interp_linear(&interp_x, &levels, &query, 0.0);
    gauss(&rendered, GAUSS_SD)
}

#[test]
fn test_render_line() {
    let payload = [0x20u8; PACKET_LEN];
    let samples = render_line(&payload, 5.112, 100.0, crate::signal::N_SAMPLES);
    assert_eq!(samples.len(), crate::signal::N_SAMPLES);
}

/// Adds a small deterministic perturbation to `samples`, standing in for
/// sensor noise in repeatable tests (not a true gaussian sampler — this
/// crate has no need for one outside of tests, so it doesn't carry a `rand`
/// dependency for it).
pub fn with_deterministic_noise(samples: &[f64], amplitude: f64, seed: u32) -> Vec<f64> {
    let mut state = seed | 1;
    samples
        .iter()
        .map(|&x| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let unit = (state as f64 / u32::MAX as f64) * 2.0 - 1.0;
            x + unit * amplitude
        })
        .collect()
}

#[test]
fn test_with_deterministic_noise() {
    let payload = [0x20u8; PACKET_LEN];
    let samples = render_line(&payload, 5.112, 100.0, crate::signal::N_SAMPLES);
    let a = with_deterministic_noise(&samples, 0.5, 42);
    let b = with_deterministic_noise(&samples, 0.5, 42);
    assert_eq!(a, b);
    for (raw, noisy) in samples.iter().zip(&a) {
        assert!((raw - noisy).abs() <= 0.5 + 1e-9);
    }
}
