//! Reconstruction of one transport object from out-of-order encoding symbols.

use crate::tools::error::{FluteError, Result};
use std::time::SystemTime;

/// Reassembles a transport object from encoding symbols, in any order, with
/// duplicates tolerated. The buffer is sized to the exact transfer length
/// announced by EXT_FTI or the FDT entry, never to a symbol-count
/// approximation.
#[derive(Debug)]
pub struct ObjectReceiver {
    toi: u128,
    transfer_length: u64,
    symbol_length: u64,
    buffer: Vec<u8>,
    /// Covered byte ranges, half-open, sorted, non-overlapping.
    ranges: Vec<(u64, u64)>,
    /// Regions where a re-delivered symbol disagreed with the first-seen
    /// bytes. Kept for diagnostics, the first-seen bytes stay in the buffer.
    suspect: Vec<(u64, u64)>,
    /// Updated on every accepted symbol, drives the inactivity eviction.
    pub last_activity: SystemTime,
    complete: bool,
}

impl ObjectReceiver {
    pub fn new(toi: u128, transfer_length: u64, symbol_length: u64, now: SystemTime) -> Result<Self> {
        if symbol_length == 0 && transfer_length != 0 {
            return Err(FluteError::new(format!(
                "TOI {} declares a zero symbol length",
                toi
            )));
        }
        Ok(ObjectReceiver {
            toi,
            transfer_length,
            symbol_length,
            buffer: vec![0; transfer_length as usize],
            ranges: Vec::new(),
            suspect: Vec::new(),
            last_activity: now,
            // an empty object needs no symbols
            complete: transfer_length == 0,
        })
    }

    pub fn transfer_length(&self) -> u64 {
        self.transfer_length
    }

    /// Place one encoding symbol at `esi * symbol_length`, clamped to the
    /// transfer length for the short final symbol.
    ///
    /// Placement is idempotent: a re-delivery with identical bytes is a
    /// no-op. A re-delivery with different bytes keeps the first-seen bytes,
    /// flags the region suspect and reports `InconsistentSymbol`; the object
    /// is not aborted.
    pub fn push_symbol(&mut self, esi: u64, symbol: &[u8], now: SystemTime) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        self.last_activity = now;

        // esi and symbol_length are wire-controlled, the product can exceed u64
        let offset = match esi.checked_mul(self.symbol_length) {
            Some(offset) if offset < self.transfer_length => offset,
            _ => {
                log::warn!(
                    "TOI {} symbol {} starts beyond the transfer length {}, ignored",
                    self.toi,
                    esi,
                    self.transfer_length
                );
                return Ok(());
            }
        };

        // expected size of this symbol, short for the last one
        let expected = self.symbol_length.min(self.transfer_length - offset);
        let len = (symbol.len() as u64).min(expected);
        if symbol.len() as u64 > expected {
            log::warn!(
                "TOI {} symbol {} carries {} bytes, expected at most {}, truncated",
                self.toi,
                esi,
                symbol.len(),
                expected
            );
        }
        if len == 0 {
            return Ok(());
        }
        let end = offset + len;

        // copy only into uncovered gaps, first-seen bytes win
        let mut inconsistent = false;
        for (gap_start, gap_end) in self.gaps(offset, end) {
            let src = &symbol[(gap_start - offset) as usize..(gap_end - offset) as usize];
            self.buffer[gap_start as usize..gap_end as usize].copy_from_slice(src);
        }
        for (cov_start, cov_end) in self.covered(offset, end) {
            let src = &symbol[(cov_start - offset) as usize..(cov_end - offset) as usize];
            if &self.buffer[cov_start as usize..cov_end as usize] != src {
                inconsistent = true;
                merge_range(&mut self.suspect, cov_start, cov_end);
            }
        }

        merge_range(&mut self.ranges, offset, end);
        self.complete = self.ranges == [(0, self.transfer_length)];

        if inconsistent {
            log::warn!(
                "TOI {} symbol {} disagrees with previously received bytes, keeping first-seen content",
                self.toi,
                esi
            );
            return Err(FluteError::InconsistentSymbol {
                toi: self.toi,
                esi,
            });
        }
        Ok(())
    }

    /// True exactly when the covered ranges span `[0, transfer_length)`.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes received so far, for diagnostics.
    pub fn bytes_covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    /// True when some region was flagged by an inconsistent re-delivery.
    pub fn has_suspect_regions(&self) -> bool {
        !self.suspect.is_empty()
    }

    /// Hand the reconstructed object out. Only callable once complete.
    pub fn take_data(self) -> Result<Vec<u8>> {
        if !self.complete {
            return Err(FluteError::new(format!(
                "TOI {} is not complete ({}/{} bytes)",
                self.toi,
                self.bytes_covered(),
                self.transfer_length
            )));
        }
        Ok(self.buffer)
    }

    /// Sub-ranges of `[start, end)` not yet covered.
    fn gaps(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut cursor = start;
        for &(s, e) in &self.ranges {
            if e <= cursor {
                continue;
            }
            if s >= end {
                break;
            }
            if s > cursor {
                gaps.push((cursor, s.min(end)));
            }
            cursor = cursor.max(e);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        gaps
    }

    /// Sub-ranges of `[start, end)` already covered.
    fn covered(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        self.ranges
            .iter()
            .filter(|&&(s, e)| s < end && e > start)
            .map(|&(s, e)| (s.max(start), e.min(end)))
            .collect()
    }
}

/// Insert `[start, end)` into a sorted non-overlapping range set, merging
/// adjacent and overlapping entries.
fn merge_range(ranges: &mut Vec<(u64, u64)>, start: u64, end: u64) {
    let mut merged = Vec::with_capacity(ranges.len() + 1);
    let mut new = (start, end);
    let mut placed = false;
    for &(s, e) in ranges.iter() {
        if e < new.0 {
            merged.push((s, e));
        } else if s > new.1 {
            if !placed {
                merged.push(new);
                placed = true;
            }
            merged.push((s, e));
        } else {
            new = (new.0.min(s), new.1.max(e));
        }
    }
    if !placed {
        merged.push(new);
    }
    *ranges = merged;
}
