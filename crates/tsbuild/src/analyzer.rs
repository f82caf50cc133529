//! Structural and pattern verification of built timeslices.
//!
//! Used by the worker binary and the end-to-end tests: re-derives the
//! deterministic pattern of the synthetic source and checks component
//! sizes, microslice index monotonicity, payload bytes and (on request)
//! the CRC field. CRC failures never abort the build path; they are
//! reported here, downstream consumers decide.

use crate::source::pattern_word;
use log::error;
use tsipc::desc::MicrosliceDescriptor;
use tsipc::timeslice::Timeslice;

/// Accumulating timeslice checker.
#[derive(Debug, Default)]
pub struct TimesliceAnalyzer {
    timeslices_checked: u64,
    timeslices_failed: u64,
    microslices_checked: u64,
    check_crc: bool,
}

impl TimesliceAnalyzer {
    /// Creates an analyzer; `check_crc` enables the CRC comparison.
    pub fn new(check_crc: bool) -> Self {
        Self {
            check_crc,
            ..Default::default()
        }
    }

    /// Timeslices checked so far.
    pub fn timeslices_checked(&self) -> u64 {
        self.timeslices_checked
    }

    /// Timeslices that failed a check.
    pub fn timeslices_failed(&self) -> u64 {
        self.timeslices_failed
    }

    /// Microslices checked so far.
    pub fn microslices_checked(&self) -> u64 {
        self.microslices_checked
    }

    /// Checks one timeslice; returns true if everything holds.
    pub fn check_timeslice<T: Timeslice + ?Sized>(&mut self, ts: &T) -> bool {
        self.timeslices_checked += 1;
        let mut ok = true;
        for c in 0..ts.num_components() {
            if !self.check_component(ts, c) {
                ok = false;
            }
        }
        if !ok {
            self.timeslices_failed += 1;
        }
        ok
    }

    fn check_component<T: Timeslice + ?Sized>(&mut self, ts: &T, c: usize) -> bool {
        let tcd = ts.component_descriptor(c);
        if tcd.ts_num != ts.index() {
            error!(
                "component {c} of timeslice {} carries index {}",
                ts.index(),
                tcd.ts_num
            );
            return false;
        }
        if tcd.num_microslices == 0 {
            error!("component {c} of timeslice {} is empty", ts.index());
            return false;
        }

        // component size must equal payloads plus the descriptor table
        let content_total: u64 = (0..tcd.num_microslices)
            .map(|m| u64::from(ts.microslice_descriptor(c, m).size))
            .sum();
        let expected =
            content_total + tcd.num_microslices * std::mem::size_of::<MicrosliceDescriptor>() as u64;
        if tcd.size != expected {
            error!(
                "component {c} of timeslice {}: size {} != expected {expected}",
                ts.index(),
                tcd.size
            );
            return false;
        }

        let mut previous_idx: Option<u64> = None;
        for m in 0..tcd.num_microslices {
            let desc = ts.microslice_descriptor(c, m);
            if let Some(previous) = previous_idx {
                if desc.idx <= previous {
                    error!(
                        "component {c} of timeslice {}: microslice index not monotone ({} after {previous})",
                        ts.index(),
                        desc.idx
                    );
                    return false;
                }
            }
            previous_idx = Some(desc.idx);
            if !self.check_microslice_content(ts, c, m, &desc) {
                return false;
            }
            self.microslices_checked += 1;
        }
        true
    }

    fn check_microslice_content<T: Timeslice + ?Sized>(
        &self,
        ts: &T,
        c: usize,
        m: u64,
        desc: &MicrosliceDescriptor,
    ) -> bool {
        let content = ts.content(c, m);
        if content.len() != desc.size as usize {
            error!(
                "component {c} microslice {m}: {} content bytes, descriptor says {}",
                content.len(),
                desc.size
            );
            return false;
        }
        // the synthetic pattern: little-endian words of
        // (input_index << 48) | byte_offset, component index == input index
        let mut offset = 0usize;
        while offset < content.len() {
            let word = pattern_word(c as u64, offset as u64).to_le_bytes();
            let n = word.len().min(content.len() - offset);
            if content[offset..offset + n] != word[..n] {
                error!(
                    "component {c} microslice {m}: pattern mismatch at byte {offset}"
                );
                return false;
            }
            offset += n;
        }
        if self.check_crc {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(content);
            let crc = hasher.finalize();
            if crc != desc.crc {
                error!(
                    "component {c} microslice {m}: crc {crc:#010x} != descriptor {:#010x}",
                    desc.crc
                );
                return false;
            }
        }
        true
    }
}
