//! The `config` module defines the fixed, externally supplied capture
//! parameters the core treats as constants. Nothing in this crate parses a
//! config file, an environment variable, or a CLI flag into one of these —
//! that belongs to the out-of-scope command-line surface. A `Config` is
//! simply handed to the decoder and pipeline at construction.

use std::fmt;

/// Capture-card parameters and pipeline sizing, fixed for the lifetime of a
/// run: a plain data-carrying struct with sensible defaults and a `Display`
/// impl for diagnostic dumps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Capture sample rate, in Hz.
    pub sample_rate: u32,

    /// Samples per captured scanline.
    pub line_length: usize,

    /// `(min, max)` sample offset, in samples, within which the Clock
    /// Run-In may begin. Bounds the alignment search.
    pub line_start_range: (f64, f64),

    /// Nominal samples-per-transmitted-bit of the bit grid.
    pub bit_width: f64,

    /// Number of worker threads the pipeline should use. `1` selects the
    /// degenerate single-process mode.
    pub workers: usize,
}

impl Config {
    /// Typical parameters for a bt8x8-class capture card digitizing PAL
    /// teletext: 2048 samples/line, CRI expected within samples 96-110, a
    /// nominal bit width of 5.112 samples, single-threaded by default.
    pub fn bt8x8() -> Config {
        Config {
            sample_rate: 27_000_000,
            line_length: crate::signal::N_SAMPLES,
            line_start_range: (96.0, 110.0),
            bit_width: 5.112,
            workers: 1,
        }
    }

    /// Returns a copy of this configuration with `workers` worker threads.
    pub fn with_workers(mut self, workers: usize) -> Config {
        self.workers = workers;
        self
    }
}

#[test]
fn test_with_workers() {
    let cfg = Config::bt8x8().with_workers(8);
    assert_eq!(cfg.workers, 8);
    assert_eq!(cfg.line_length, Config::bt8x8().line_length);
}

impl Default for Config {
    fn default() -> Config {
        Config::bt8x8()
    }
}

#[test]
fn test_default() {
    assert_eq!(Config::default(), Config::bt8x8());
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "| Sample rate:        {} Hz", self.sample_rate)?;
        writeln!(f, "| Line length:        {} samples", self.line_length)?;
        writeln!(
            f,
            "| CRI search range:   [{}, {}]",
            self.line_start_range.0, self.line_start_range.1
        )?;
        writeln!(f, "| Bit width:          {} samples/bit", self.bit_width)?;
        write!(f, "| Workers:            {}", self.workers)?;
        Ok(())
    }
}
