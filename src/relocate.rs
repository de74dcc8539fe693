//! Relocation application and PLT/GOT discovery.
//!
//! `apply` patches the flattened image in place against a caller-chosen
//! load base. Structural failures were already ruled out during parsing;
//! the only per-entry failure mode here is an unresolved external symbol,
//! which is accumulated as a diagnostic while processing continues.
//!
//! PLT discovery is pure pattern matching over the code segment (no
//! disassembler): it anchors on the AArch64 `BR X17` word and decodes the
//! preceding ADRP/LDR pair to find the GOT slot each trampoline loads.
//! False negatives are acceptable.

use std::collections::{BTreeSet, HashMap};

use crate::dynamic::{ElfSym, RelocKind, RelocationEntry};
use crate::error::NxoError;

/// A discovered PLT trampoline: the call site and the GOT slot it loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PltEntry {
    pub call_site_offset: u64,
    pub got_target_offset: u64,
}

/// Fills each symbol's `resolved` address. Defined symbols resolve to
/// `load_base + value`; the null entry resolves to zero; named undefined
/// externals stay unresolved and surface later as per-entry diagnostics.
pub fn resolve_symbols(symbols: &mut [ElfSym], load_base: u64) {
    for (index, sym) in symbols.iter_mut().enumerate() {
        if index == 0 {
            sym.resolved = Some(0);
        } else if sym.shndx != 0 {
            sym.resolved = Some(load_base + sym.value);
        }
    }
}

/// Applies every relocation to `image`. Returns the diagnostics list and
/// the GOT-slot-to-symbol-name map used for PLT call-site naming.
pub fn apply(
    image: &mut [u8],
    symbols: &[ElfSym],
    relocations: &[RelocationEntry],
    load_base: u64,
    is_32bit: bool,
) -> (Vec<NxoError>, HashMap<u64, String>) {
    let mut diagnostics = Vec::new();
    let mut got_names = HashMap::new();

    for entry in relocations {
        let resolved = entry
            .symbol
            .and_then(|index| symbols.get(index))
            .and_then(|sym| sym.resolved.map(|addr| (addr, sym)));

        match entry.kind {
            RelocKind::AbsAddr32 | RelocKind::GlobDat | RelocKind::JumpSlot
                if is_32bit =>
            {
                match resolved {
                    Some((addr, _)) => {
                        write_val(image, entry.offset, addr, 4, &mut diagnostics);
                    }
                    None => diagnostics.push(unresolved(entry, symbols)),
                }
            }
            RelocKind::AbsAddr64 | RelocKind::GlobDat | RelocKind::JumpSlot => {
                match resolved {
                    Some((addr, sym)) => {
                        let addend = entry.addend.unwrap_or(0);
                        let value = addr.wrapping_add(addend as u64);
                        write_val(image, entry.offset, value, 8, &mut diagnostics);
                        if addend == 0 {
                            got_names.insert(entry.offset, sym.name.clone());
                        }
                    }
                    None => diagnostics.push(unresolved(entry, symbols)),
                }
            }
            RelocKind::AbsAddr32 => {
                // 32-bit absolute relocation in a 64-bit image never occurs
                // by construction; treat it as unresolved if it does.
                diagnostics.push(unresolved(entry, symbols));
            }
            RelocKind::Relative => match entry.addend {
                Some(addend) => {
                    let width = if is_32bit { 4 } else { 8 };
                    let value = load_base.wrapping_add(addend as u64);
                    write_val(image, entry.offset, value, width, &mut diagnostics);
                }
                None => {
                    let width = if is_32bit { 4 } else { 8 };
                    adjust_in_place(image, entry.offset, load_base, width, &mut diagnostics);
                }
            },
            // The addend is implicit in the pre-existing image bytes.
            RelocKind::RelrPacked => {
                adjust_in_place(image, entry.offset, load_base, 8, &mut diagnostics);
            }
            // Thread-local descriptors are out of scope: neither read nor
            // written.
            RelocKind::TlsDesc => {}
        }
    }

    (diagnostics, got_names)
}

fn unresolved(entry: &RelocationEntry, symbols: &[ElfSym]) -> NxoError {
    let name = entry
        .symbol
        .and_then(|index| symbols.get(index))
        .map(|sym| sym.name.clone())
        .unwrap_or_default();
    NxoError::UnresolvedSymbol {
        offset: entry.offset,
        name,
    }
}

fn write_val(image: &mut [u8], offset: u64, value: u64, width: usize, diagnostics: &mut Vec<NxoError>) {
    let start = offset as usize;
    let Some(slot) = start
        .checked_add(width)
        .and_then(|end| image.get_mut(start..end))
    else {
        diagnostics.push(NxoError::Truncated {
            offset,
            len: width,
            size: image.len(),
        });
        return;
    };
    slot.copy_from_slice(&value.to_le_bytes()[..width]);
}

fn adjust_in_place(image: &mut [u8], offset: u64, load_base: u64, width: usize, diagnostics: &mut Vec<NxoError>) {
    let start = offset as usize;
    let Some(slot) = start
        .checked_add(width)
        .and_then(|end| image.get(start..end))
    else {
        diagnostics.push(NxoError::Truncated {
            offset,
            len: width,
            size: image.len(),
        });
        return;
    };
    let old = if width == 4 {
        u32::from_le_bytes(slot.try_into().unwrap()) as u64
    } else {
        u64::from_le_bytes(slot.try_into().unwrap())
    };
    let new = old.wrapping_add(load_base);
    image[start..start + width].copy_from_slice(&new.to_le_bytes()[..width]);
}

const BR_X17: u32 = 0xD61F0220;

/// Scans the code segment for PLT trampolines (64-bit images only).
///
/// A trampoline is `ADRP X16 / LDR X17, [X16, #off] / ... / BR X17`; the
/// ADRP page immediate plus the scaled LDR offset give the GOT slot the
/// stub dereferences. Matches are kept only when that slot falls inside the
/// JMPREL-derived PLT/GOT window.
pub fn discover_plt(image: &[u8], text_size: u64, window: (u64, u64)) -> Vec<PltEntry> {
    let text = &image[..(text_size as usize).min(image.len())];
    let anchor = BR_X17.to_le_bytes();
    let (window_start, window_end) = window;
    let mut entries = Vec::new();

    let mut pos = 12;
    while pos + 4 <= text.len() {
        if text[pos..pos + 4] != anchor {
            pos += 1;
            continue;
        }
        let found = pos;
        pos += 1;
        if found % 4 != 0 {
            continue;
        }
        let off = found - 12;
        let word = |at: usize| u32::from_le_bytes(text[at..at + 4].try_into().unwrap());
        let a = word(off);
        let b = word(off + 4);
        if (a & 0x9F00_001F) != 0x9000_0010 || (b & 0xFFE0_03FF) != 0xF940_0211 {
            continue;
        }
        let page = (off as u64) & !0xFFF;
        let immhi = u64::from((a >> 5) & 0x7FFFF);
        let immlo = u64::from((a >> 29) & 3);
        let paddr = page + ((immlo << 12) | (immhi << 14));
        let ldr_off = u64::from((b >> 10) & 0xFFF) << 3;
        let target = paddr + ldr_off;
        if (window_start..window_end).contains(&target) {
            entries.push(PltEntry {
                call_site_offset: off as u64,
                got_target_offset: target,
            });
        }
    }
    entries
}

/// Walks word-sized slots beyond the PLT/GOT window while they remain in
/// the set of relocation-touched offsets, yielding the `.got` range. Stops
/// at `.init_array` when the dynamic table declares one.
pub fn discover_got(
    visited: &BTreeSet<u64>,
    plt_got_end: u64,
    word: u64,
    init_array: Option<u64>,
) -> Option<(u64, u64)> {
    let mut got_end = plt_got_end + word;
    let mut any = false;
    while visited.contains(&got_end) && init_array.map(|limit| got_end < limit).unwrap_or(true) {
        any = true;
        got_end += word;
    }
    any.then_some((plt_got_end, got_end))
}

/// Joins discovered PLT entries with the GOT naming map, producing the
/// call-site-to-imported-name association list.
pub fn plt_names(plt_entries: &[PltEntry], got_names: &HashMap<u64, String>) -> Vec<(u64, String)> {
    plt_entries
        .iter()
        .filter_map(|entry| {
            got_names
                .get(&entry.got_target_offset)
                .map(|name| (entry.call_site_offset, name.clone()))
        })
        .collect()
}
