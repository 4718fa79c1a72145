//! `vbi-teletext` recovers 42-byte teletext packets from a raw, imprecisely
//! sampled Vertical Blanking Interval waveform.
//!
//! The crate is organized around three collaborating pieces:
//!
//! - [`signal`] — stateless numerical primitives (smoothing, interpolation,
//!   byte alphabets) the rest of the crate is built from.
//! - [`decoder`] — the [`decoder::LineDecoder`], which aligns a bit grid to
//!   one captured scanline and iteratively refines a 42-byte guess against
//!   it.
//! - [`pipeline`] — an ordered, multi-threaded [`pipeline::Pipeline`] that
//!   runs many `LineDecoder`s concurrently while preserving input order.
//!
//! [`finders`] supplies optional packet-0 header recognizers that the line
//! decoder consults after its generic refinement pass, and [`config`]
//! carries the fixed capture parameters both the decoder and pipeline are
//! built from.
//!
//! # Example
//!
//! ```
//! use vbi_teletext::{config::Config, decoder::LineDecoder, signal, synth};
//!
//! // Positions 0 and 1 are Hamming(8,4)-coded address bytes, not free-form
//! // payload; every other position just needs to be a valid odd-parity byte.
//! let mut payload = [0x20u8; 42];
//! payload[0] = *signal::hamm_bytes().first().unwrap();
//! payload[1] = *signal::hamm_bytes().last().unwrap();
//! let samples = synth::render_line(&payload, 5.112, 100.0, 2048);
//!
//! let mut decoder = LineDecoder::new(Config::bt8x8(), Vec::new());
//! let (packet, diagnostics) = decoder.decode(&samples);
//! assert_eq!(packet, payload);
//! assert!(diagnostics.alignment_ok);
//! ```

pub mod config;
pub mod decoder;
pub mod errors;
pub mod finders;
pub mod pipeline;
pub mod signal;
pub mod synth;

pub use errors::Error;

/// This crate's result type, used throughout the pipeline for anything that
/// can fail fatally. Per-line numerical degeneracies are not failures — see
/// [`decoder::Diagnostics`].
pub type Result<T> = std::result::Result<T, Error>;
