//! Container loading orchestration.
//!
//! `NxoFile` ties the pipeline together:
//! 1. Container parsing: magic sniffing, decompression, image flattening.
//! 2. Dynamic metadata: MOD0, tag table, symbols, relocation tables.
//! 3. Layout: authoritative segment bounds from MOD0, section discovery,
//!    flattened gapless section list.
//! 4. Relocation: in-place patching against a caller-chosen load base,
//!    with per-entry diagnostics and PLT call-site naming.

use std::collections::HashMap;

use object::elf;

use crate::container::{Format, RawImage};
use crate::dynamic::{self, DynamicMetadata, ElfSym, Mod0, RelocationEntry};
use crate::error::{NxoError, Result};
use crate::layout::{SectionInfo, SegmentBuilder, SegmentKind};
use crate::recover;
use crate::relocate::{self, PltEntry};

/// A fully parsed container: the flattened image plus every structure
/// recovered from it. Immutable after [`NxoFile::relocate`], except that
/// relocation itself patches `image` and fills each symbol's `resolved`
/// address exactly once.
pub struct NxoFile {
    pub format: Format,
    pub is_32bit: bool,
    pub image: Vec<u8>,
    pub text_off: u64,
    pub text_size: u64,
    pub rodata_off: u64,
    pub rodata_size: u64,
    pub data_off: u64,
    pub data_size: u64,
    pub bss_off: u64,
    pub bss_size: u64,
    pub mod0: Mod0,
    pub needed: Vec<String>,
    pub symbols: Vec<ElfSym>,
    pub relocations: Vec<RelocationEntry>,
    pub plt_entries: Vec<PltEntry>,
    /// Ordered, gapless partition of the full address range.
    pub sections: Vec<SectionInfo>,
    got_names: HashMap<u64, String>,
    relocated: bool,
}

impl NxoFile {
    /// Parses raw container bytes into a laid-out, unrelocated image.
    pub fn parse(data: &[u8]) -> Result<NxoFile> {
        let raw = RawImage::parse(data)?;
        let meta = DynamicMetadata::parse(&raw.image)?;
        let mod0 = meta.mod0.clone();

        // MOD0 is the source of truth for the data/bss split; the header
        // fields are advisory.
        let data_size = mod0
            .bss_start
            .checked_sub(raw.data_off)
            .ok_or_else(|| {
                NxoError::LayoutConsistency(format!(
                    "MOD0 bss start 0x{:X} precedes data segment at 0x{:X}",
                    mod0.bss_start, raw.data_off
                ))
            })?;
        let bss_size = mod0.bss_end.checked_sub(mod0.bss_start).ok_or_else(|| {
            NxoError::LayoutConsistency(format!(
                "MOD0 bss bounds inverted: 0x{:X} > 0x{:X}",
                mod0.bss_start, mod0.bss_end
            ))
        })?;

        if raw.format == Format::Kip {
            // Two header field placements exist across KIP versions; accept
            // whichever agrees with MOD0, complain if neither does.
            let candidates = [Some(raw.bss_size), raw.alt_bss_size];
            if !candidates.iter().flatten().any(|&c| c == bss_size) {
                tracing::warn!(
                    header = raw.bss_size,
                    alt = raw.alt_bss_size,
                    mod0 = bss_size,
                    "KIP header bss size disagrees with MOD0 bounds, trusting MOD0"
                );
            }
        }

        let plt_entries = match (meta.is_32bit, meta.plt_got_window) {
            (false, Some(window)) => relocate::discover_plt(&raw.image, raw.text_size, window),
            _ => Vec::new(),
        };

        let sections = build_sections(&raw, &meta, data_size, bss_size, &plt_entries)?;

        Ok(NxoFile {
            format: raw.format,
            is_32bit: meta.is_32bit,
            image: raw.image,
            text_off: raw.text_off,
            text_size: raw.text_size,
            rodata_off: raw.rodata_off,
            rodata_size: raw.rodata_size,
            data_off: raw.data_off,
            data_size,
            bss_off: mod0.bss_start,
            bss_size,
            mod0,
            needed: meta.needed,
            symbols: meta.symbols,
            relocations: meta.relocations,
            plt_entries,
            sections,
            got_names: HashMap::new(),
            relocated: false,
        })
    }

    /// Resolves every symbol against `load_base` and applies all
    /// relocations to the image in place. Per-entry resolution failures
    /// are returned as diagnostics; the image is still usable afterwards.
    pub fn relocate(&mut self, load_base: u64) -> Vec<NxoError> {
        if self.relocated {
            tracing::warn!("relocate called twice, ignoring");
            return Vec::new();
        }
        self.relocated = true;
        relocate::resolve_symbols(&mut self.symbols, load_base);
        let (diagnostics, got_names) = relocate::apply(
            &mut self.image,
            &self.symbols,
            &self.relocations,
            load_base,
            self.is_32bit,
        );
        self.got_names = got_names;
        diagnostics
    }

    /// Call-site-to-imported-name associations for the discovered PLT
    /// trampolines. Only meaningful after [`NxoFile::relocate`].
    pub fn plt_name_associations(&self) -> Vec<(u64, String)> {
        relocate::plt_names(&self.plt_entries, &self.got_names)
    }

    /// Candidate function starts from BL-target scanning, for external
    /// analysis tooling.
    pub fn branch_targets(&self) -> std::collections::BTreeSet<u64> {
        recover::find_branch_targets(&self.image, self.text_size)
    }

    /// Function offsets recovered from the MOD0 exception-unwind range.
    pub fn unwind_functions(&self) -> Vec<u64> {
        recover::unwind_entries(
            &self.image,
            self.mod0.unwind_start,
            self.mod0.unwind_end,
            self.text_size,
        )
    }
}

/// Registers the four segments and every section the dynamic metadata
/// names, then flattens into the final gapless list.
fn build_sections(
    raw: &RawImage,
    meta: &DynamicMetadata,
    data_size: u64,
    bss_size: u64,
    plt_entries: &[PltEntry],
) -> Result<Vec<SectionInfo>> {
    let mut builder = SegmentBuilder::new();
    builder.add_segment(raw.text_off, raw.text_size, ".text", SegmentKind::Code)?;
    builder.add_segment(raw.rodata_off, raw.rodata_size, ".rodata", SegmentKind::Const)?;
    builder.add_segment(raw.data_off, data_size, ".data", SegmentKind::Data)?;
    builder.add_segment(meta.mod0.bss_start, bss_size, ".bss", SegmentKind::Bss)?;

    let dynamic = &meta.dynamic;
    builder.add_section(".dynamic", meta.mod0.dynamic_off, dynamic.end)?;

    for (start_tag, size_tag, name) in [
        (elf::DT_STRTAB, elf::DT_STRSZ, ".dynstr"),
        (elf::DT_INIT_ARRAY, elf::DT_INIT_ARRAYSZ, ".init_array"),
        (elf::DT_FINI_ARRAY, elf::DT_FINI_ARRAYSZ, ".fini_array"),
        (elf::DT_RELA, elf::DT_RELASZ, ".rela.dyn"),
        (elf::DT_REL, elf::DT_RELSZ, ".rel.dyn"),
    ] {
        if let Some((start, size)) = dynamic.pair(start_tag, size_tag) {
            builder.add_section(name, start, start + size)?;
        }
    }
    if let Some((start, size)) = dynamic.pair(elf::DT_JMPREL, elf::DT_PLTRELSZ) {
        let name = if meta.is_32bit { ".rel.plt" } else { ".rela.plt" };
        builder.add_section(name, start, start + size)?;
    }
    if !meta.is_32bit {
        if let Some((start, size)) = dynamic.pair(dynamic::DT_RELR, dynamic::DT_RELRSZ) {
            builder.add_section(".relr.dyn", start, start + size)?;
        }
    }
    if let Some((start, end)) = meta.symtab_range {
        builder.add_section(".dynsym", start, end)?;
    }

    if let Some((_, plt_got_end)) = meta.plt_got_window {
        if let Some(pltgot) = dynamic.get(elf::DT_PLTGOT) {
            builder.add_section(".got.plt", pltgot, plt_got_end)?;
        }
        match meta.mod0.libnx_got {
            Some((start, end)) => builder.add_section(".got", start, end)?,
            None => {
                let word = meta.word_size();
                let init_array = dynamic.get(elf::DT_INIT_ARRAY);
                if let Some((start, end)) =
                    relocate::discover_got(&meta.visited, plt_got_end, word, init_array)
                {
                    builder.add_section(".got", start, end)?;
                }
            }
        }
    } else if let Some((start, end)) = meta.mod0.libnx_got {
        builder.add_section(".got", start, end)?;
    }

    if let (Some(first), Some(last)) = (
        plt_entries.iter().map(|e| e.call_site_offset).min(),
        plt_entries.iter().map(|e| e.call_site_offset).max(),
    ) {
        builder.add_section(".plt", first, last + 0x10)?;
    }

    Ok(builder.flatten())
}
