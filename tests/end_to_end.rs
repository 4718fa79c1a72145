//! End-to-end scenarios exercising the public crate API across module
//! boundaries: synthesizing a line, decoding it, running it through finders,
//! and streaming many lines through the ordered parallel pipeline.

use vbi_teletext::config::Config;
use vbi_teletext::decoder::LineDecoder;
use vbi_teletext::finders::{Finder, HeaderFinder};
use vbi_teletext::pipeline::{decode_lines, Pipeline};
use vbi_teletext::signal::{self, PACKET_LEN};
use vbi_teletext::synth::{render_line, with_deterministic_noise};

fn odd_parity_payload() -> [u8; PACKET_LEN] {
    let mut payload = [0x41u8; PACKET_LEN];
    payload[0] = *signal::hamm_bytes().first().unwrap();
    payload[1] = *signal::hamm_bytes().last().unwrap();
    for b in payload.iter_mut().skip(2) {
        *b = *signal::parity_bytes()
            .iter()
            .min_by_key(|&&p| (p as i16 - 0x41).abs())
            .unwrap();
    }
    payload
}

/// Scenario 1: a clean synthetic line, lightly noised, decodes to exactly
/// the bytes it was rendered from.
#[test]
fn synthetic_clean_line_recovers_exact_bytes() {
    let payload = odd_parity_payload();
    let clean = render_line(&payload, 5.112, 100.0, signal::N_SAMPLES);
    let samples = with_deterministic_noise(&clean, 0.5, 7);

    let mut decoder = LineDecoder::new(Config::bt8x8(), Vec::new());
    let (packet, diagnostics) = decoder.decode(&samples);

    assert_eq!(packet, payload);
    assert!(diagnostics.alignment_ok);
}

/// Scenario 2: the same payload rendered at four different CRI offsets all
/// decode to the same bytes.
#[test]
fn offset_robustness_across_the_cri_search_range() {
    let payload = odd_parity_payload();
    let mut decoded = Vec::new();

    for &offset in &[97.0, 100.0, 103.0, 107.0] {
        let samples = render_line(&payload, 5.112, offset, signal::N_SAMPLES);
        let mut decoder = LineDecoder::new(Config::bt8x8(), Vec::new());
        let (packet, diagnostics) = decoder.decode(&samples);
        assert!(diagnostics.alignment_ok, "offset {offset} failed to align");
        decoded.push(packet);
    }

    assert!(decoded.iter().all(|p| *p == decoded[0]));
}

/// Scenario 3: a packet-0 line carrying the `BBC1` finder's station
/// identifier decodes, after finder fixup, with authoritative header bytes
/// while the rest of the payload matches the un-fixed decode.
#[test]
fn bbc1_header_finder_regenerates_address_bytes() {
    let mut payload = odd_parity_payload();
    payload[8..12].copy_from_slice(b"BBC1");
    let samples = render_line(&payload, 5.112, 100.0, signal::N_SAMPLES);

    let mut unfixed_decoder = LineDecoder::new(Config::bt8x8(), Vec::new());
    let (unfixed, _) = unfixed_decoder.decode(&samples);

    let mut decoder = LineDecoder::new(Config::bt8x8(), vec![Box::new(HeaderFinder::bbc1()) as Box<dyn Finder>]);
    let (fixed, _) = decoder.decode(&samples);

    assert_eq!(fixed[2..], unfixed[2..]);
    assert!(signal::hamm_bytes().contains(&fixed[0]));
    assert!(signal::hamm_bytes().contains(&fixed[1]));
}

/// Scenario 4: 2000 identical lines streamed through an 8-worker pipeline
/// come back as 2000 packets, in strict input order.
#[test]
fn pipeline_preserves_order_across_many_workers() {
    let payload = odd_parity_payload();
    let samples = render_line(&payload, 5.112, 100.0, signal::N_SAMPLES);

    const N: usize = 2000;
    let lines: Vec<Vec<f64>> = (0..N).map(|_| samples.clone()).collect();

    let pipeline = decode_lines(Config::bt8x8().with_workers(8), Vec::new, lines).unwrap();

    let mut count = 0usize;
    for result in pipeline {
        let (packet, diagnostics) = result.expect("pipeline should not fail on clean synthetic lines");
        assert_eq!(packet, payload);
        assert!(diagnostics.alignment_ok);
        count += 1;
    }
    assert_eq!(count, N);
}

/// The single-process (`P == 1`) path and the multi-threaded path must
/// agree byte-for-byte on the same input stream.
#[test]
fn single_process_and_threaded_pipelines_agree() {
    let payload = odd_parity_payload();
    let samples = render_line(&payload, 5.112, 100.0, signal::N_SAMPLES);
    let lines: Vec<Vec<f64>> = (0..64).map(|_| samples.clone()).collect();

    let single = decode_lines(Config::bt8x8().with_workers(1), Vec::new, lines.clone()).unwrap();
    let threaded = decode_lines(Config::bt8x8().with_workers(5), Vec::new, lines).unwrap();

    let single_packets: Vec<[u8; PACKET_LEN]> = single.map(|r| r.unwrap().0).collect();
    let threaded_packets: Vec<[u8; PACKET_LEN]> = threaded.map(|r| r.unwrap().0).collect();

    assert_eq!(single_packets, threaded_packets);
}

/// A line with no signal at all fails alignment but still yields a
/// deterministic 42-byte packet rather than aborting the stream.
#[test]
fn all_black_line_degrades_gracefully_through_the_pipeline() {
    let lines: Vec<Vec<f64>> = vec![vec![0.0; signal::N_SAMPLES]];
    let pipeline: Pipeline<_, _> = decode_lines(Config::bt8x8(), Vec::new, lines).unwrap();

    let results: Vec<_> = pipeline.collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(results.len(), 1);
    assert!(!results[0].1.alignment_ok);
}
