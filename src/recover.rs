//! Best-effort structural recovery.
//!
//! Used when an input has no container header to declare its segment
//! boundaries (memory-dump-style images), and for auxiliary outputs that
//! downstream analysis tooling consumes. Everything here is heuristic:
//! results are optional, and whenever the caller also has header-declared
//! layout the two must agree or the parse fails. The guesses never
//! silently override known-good data.

use std::collections::BTreeSet;

use crate::error::{NxoError, Result};
use crate::utils::{align_up, PAGE_SIZE};

/// Zero 32-bit words required immediately before a page boundary for it to
/// count as the rodata/data split. Tunable.
const ZERO_RUN_WORDS: usize = 7;

/// Segment sizes inferred without a container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuessedBoundaries {
    pub text_size: u64,
    pub rodata_size: u64,
    pub data_size: u64,
}

/// Infers the code/rodata/data split of a flat image.
///
/// Code is assumed to start at offset 0. The rodata boundary is the lowest
/// nonzero relocation target rounded down to a page. The data boundary is
/// the first page boundary at or after the MOD0 descriptor preceded by a
/// run of zero words (padding between rodata and data).
pub fn guess_boundaries(
    image: &[u8],
    modoff: u64,
    reloc_targets: &BTreeSet<u64>,
) -> Option<GuessedBoundaries> {
    let rodata_start = reloc_targets.iter().copied().find(|&t| t != 0)? & !(PAGE_SIZE - 1);

    let mut candidate = align_up(modoff, PAGE_SIZE);
    let data_start = loop {
        let at = candidate as usize;
        if at > image.len() {
            return None;
        }
        if at >= ZERO_RUN_WORDS * 4 && image[at - ZERO_RUN_WORDS * 4..at].iter().all(|&b| b == 0) {
            break candidate;
        }
        candidate += PAGE_SIZE;
    };

    if rodata_start > data_start || data_start > image.len() as u64 {
        return None;
    }
    Some(GuessedBoundaries {
        text_size: rodata_start,
        rodata_size: data_start - rodata_start,
        data_size: image.len() as u64 - data_start,
    })
}

/// Verifies inferred boundaries against caller-supplied declared sizes.
/// Disagreement is fatal: proceeding would yield a corrupt image that
/// looks successful.
pub fn cross_check(
    guess: &GuessedBoundaries,
    text_size: Option<u64>,
    rodata_size: Option<u64>,
    data_size: Option<u64>,
) -> Result<()> {
    let checks = [
        ("text", guess.text_size, text_size),
        ("rodata", guess.rodata_size, rodata_size),
        ("data", guess.data_size, data_size),
    ];
    for (name, guessed, declared) in checks {
        if let Some(declared) = declared {
            if declared != guessed {
                return Err(NxoError::LayoutConsistency(format!(
                    "heuristic {} size 0x{:X} disagrees with declared 0x{:X}",
                    name, guessed, declared
                )));
            }
        }
    }
    Ok(())
}

/// Collects BL-instruction targets inside the code segment (AArch64).
/// Consumed by external analysis tooling as candidate function starts.
pub fn find_branch_targets(image: &[u8], text_size: u64) -> BTreeSet<u64> {
    let text = &image[..(text_size as usize).min(image.len())];
    let mut targets = BTreeSet::new();
    for pc in (0..text.len().saturating_sub(3)).step_by(4) {
        let word = u32::from_le_bytes(text[pc..pc + 4].try_into().unwrap());
        if word & 0xFC00_0000 != 0x9400_0000 {
            continue;
        }
        let mut imm = i64::from(word & 0x03FF_FFFF);
        if imm & 0x0200_0000 != 0 {
            imm |= !0x01FF_FFFF;
        }
        // Tiny forward hops are padding or tail stubs, not calls.
        if (0..=2).contains(&imm) {
            continue;
        }
        let target = pc as i64 + imm * 4;
        if target >= 0 && (target as u64) < text_size {
            targets.insert(target as u64);
        }
    }
    targets
}

/// Walks the MOD0 exception-unwind range as (function offset, info) pairs,
/// keeping function offsets that land inside the code segment. A zero pair
/// ends the table early.
pub fn unwind_entries(image: &[u8], unwind_start: u64, unwind_end: u64, text_size: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let start = unwind_start as usize;
    let end = (unwind_end as usize).min(image.len());
    if start >= end {
        return out;
    }
    for chunk in image[start..end].chunks_exact(8) {
        let func = u32::from_le_bytes(chunk[0..4].try_into().unwrap()) as u64;
        let info = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
        if func == 0 && info == 0 {
            break;
        }
        if func != 0 && func < text_size {
            out.push(func);
        }
    }
    out
}
