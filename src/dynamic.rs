//! Dynamic-linking metadata embedded in the flattened image.
//!
//! Locates the MOD0 descriptor, walks the dynamic tag table, and slices out
//! the string table, symbol table and every relocation list (REL, RELA,
//! PLT-associated JMPREL, and the bit-packed RELR table on 64-bit images).
//! ELF numerology comes from `object::elf` rather than local constants.

use std::collections::{BTreeSet, HashMap};

use object::elf;

use crate::cursor::ByteCursor;
use crate::error::{NxoError, Result};

// Packed-relative table tags, absent from object's constant set.
pub const DT_RELR: u32 = 36;
pub const DT_RELRSZ: u32 = 35;

/// The MOD0 module descriptor: six offsets relative to its own position,
/// plus the optional libnx `LNY0` extension carrying explicit GOT bounds.
#[derive(Debug, Clone)]
pub struct Mod0 {
    pub modoff: u64,
    pub dynamic_off: u64,
    pub bss_start: u64,
    pub bss_end: u64,
    pub unwind_start: u64,
    pub unwind_end: u64,
    pub module_off: u64,
    pub libnx_got: Option<(u64, u64)>,
}

impl Mod0 {
    /// Reads the descriptor whose offset is stored at image offset 4.
    pub fn parse(image: &[u8]) -> Result<Mod0> {
        let mut cur = ByteCursor::new(image);
        let modoff = cur.u32_at(4)? as u64;
        cur.seek(modoff);
        if cur.read_bytes(4).map(|m| m != b"MOD0").unwrap_or(true) {
            return Err(NxoError::InvalidModuleDescriptor);
        }
        let rel = |c: &mut ByteCursor| -> Result<u64> {
            Ok((modoff as i64 + c.read_i32()? as i64) as u64)
        };
        let dynamic_off = rel(&mut cur)?;
        let bss_start = rel(&mut cur)?;
        let bss_end = rel(&mut cur)?;
        let unwind_start = rel(&mut cur)?;
        let unwind_end = rel(&mut cur)?;
        let module_off = rel(&mut cur)?;

        let libnx_got = if cur.clone().read_bytes(4).map(|m| m == b"LNY0").unwrap_or(false) {
            cur.skip(4);
            Some((rel(&mut cur)?, rel(&mut cur)?))
        } else {
            None
        };

        Ok(Mod0 {
            modoff,
            dynamic_off,
            bss_start,
            bss_end,
            unwind_start,
            unwind_end,
            module_off,
            libnx_got,
        })
    }
}

/// The dynamic tag table. `DT_NEEDED` legitimately repeats and accumulates
/// in encounter order; every other tag keeps its first occurrence, and
/// later duplicates are warned about rather than silently overwriting.
#[derive(Debug, Default)]
pub struct DynamicTable {
    tags: HashMap<u64, u64>,
    pub needed: Vec<u64>,
    /// Image offset one past the terminating null entry.
    pub end: u64,
}

impl DynamicTable {
    pub fn parse(image: &[u8], offset: u64, is_32bit: bool) -> Result<DynamicTable> {
        let mut cur = ByteCursor::new(image);
        cur.seek(offset);
        let entry_len = if is_32bit { 8 } else { 16 };
        let mut table = DynamicTable::default();
        while (cur.pos() as usize) + entry_len <= image.len() {
            let tag = cur.read_word(is_32bit)?;
            let value = cur.read_word(is_32bit)?;
            if tag == u64::from(elf::DT_NULL) {
                break;
            }
            if tag == u64::from(elf::DT_NEEDED) {
                table.needed.push(value);
            } else if let Some(first) = table.tags.get(&tag) {
                tracing::warn!(tag, first, duplicate = value, "duplicate dynamic tag, keeping first");
            } else {
                table.tags.insert(tag, value);
            }
        }
        table.end = cur.pos();
        Ok(table)
    }

    pub fn get(&self, tag: u32) -> Option<u64> {
        self.tags.get(&u64::from(tag)).copied()
    }

    /// Both tags present, or nothing.
    pub fn pair(&self, start: u32, size: u32) -> Option<(u64, u64)> {
        Some((self.get(start)?, self.get(size)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymType {
    NoType,
    Object,
    Func,
    Section,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymBind {
    Local,
    Global,
    Weak,
    Other(u8),
}

/// One dynamic symbol table entry. `resolved` is filled exactly once, by
/// the relocator, and holds the load-base-adjusted address (or stays `None`
/// for undefined externals).
#[derive(Debug, Clone)]
pub struct ElfSym {
    pub name: String,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
    pub visibility: u8,
    pub kind: SymType,
    pub bind: SymBind,
    pub resolved: Option<u64>,
}

impl ElfSym {
    fn new(name: String, info: u8, other: u8, shndx: u16, value: u64, size: u64) -> Self {
        let kind = match info & 0xF {
            elf::STT_NOTYPE => SymType::NoType,
            elf::STT_OBJECT => SymType::Object,
            elf::STT_FUNC => SymType::Func,
            elf::STT_SECTION => SymType::Section,
            t => SymType::Other(t),
        };
        let bind = match info >> 4 {
            elf::STB_LOCAL => SymBind::Local,
            elf::STB_GLOBAL => SymBind::Global,
            elf::STB_WEAK => SymBind::Weak,
            b => SymBind::Other(b),
        };
        Self {
            name,
            shndx,
            value,
            size,
            visibility: other & 3,
            kind,
            bind,
            resolved: None,
        }
    }

    /// Undefined external reference (SHN_UNDEF with a real name).
    pub fn is_external(&self) -> bool {
        self.shndx == 0 && !self.name.is_empty()
    }
}

/// Relocation kinds the relocator understands, mapped from the raw ARM /
/// AArch64 type numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    AbsAddr32,
    AbsAddr64,
    GlobDat,
    JumpSlot,
    Relative,
    RelrPacked,
    TlsDesc,
}

impl RelocKind {
    fn from_raw(r_type: u32, is_32bit: bool) -> Option<RelocKind> {
        let kind = if is_32bit {
            match r_type {
                elf::R_ARM_ABS32 => RelocKind::AbsAddr32,
                elf::R_ARM_GLOB_DAT => RelocKind::GlobDat,
                elf::R_ARM_JUMP_SLOT => RelocKind::JumpSlot,
                elf::R_ARM_RELATIVE => RelocKind::Relative,
                elf::R_ARM_TLS_DESC => RelocKind::TlsDesc,
                _ => return None,
            }
        } else {
            match r_type {
                elf::R_AARCH64_ABS64 => RelocKind::AbsAddr64,
                elf::R_AARCH64_GLOB_DAT => RelocKind::GlobDat,
                elf::R_AARCH64_JUMP_SLOT => RelocKind::JumpSlot,
                elf::R_AARCH64_RELATIVE => RelocKind::Relative,
                elf::R_AARCH64_TLSDESC => RelocKind::TlsDesc,
                _ => return None,
            }
        };
        Some(kind)
    }
}

/// One relocation. `symbol` indexes the owning container's symbol list.
#[derive(Debug, Clone)]
pub struct RelocationEntry {
    pub offset: u64,
    pub kind: RelocKind,
    pub symbol: Option<usize>,
    pub addend: Option<i64>,
}

/// Everything recovered from the dynamic-linking block of one image.
pub struct DynamicMetadata {
    pub mod0: Mod0,
    pub is_32bit: bool,
    pub dynamic: DynamicTable,
    dynstr: Vec<u8>,
    pub needed: Vec<String>,
    pub symbols: Vec<ElfSym>,
    pub relocations: Vec<RelocationEntry>,
    /// Offsets targeted by any non-TlsDesc relocation. Consumed by the
    /// `.got` discovery walk, which cares about the set of touched slots,
    /// not about resolution success.
    pub visited: BTreeSet<u64>,
    /// `[min, max + word)` over the JMPREL relocation targets.
    pub plt_got_window: Option<(u64, u64)>,
    /// Image range occupied by the symbol table, when one was found.
    pub symtab_range: Option<(u64, u64)>,
    /// Decoded RELR target offsets (64-bit only), also present in
    /// `relocations` as `RelrPacked` entries.
    pub relr_offsets: Vec<u64>,
}

impl DynamicMetadata {
    pub fn word_size(&self) -> u64 {
        if self.is_32bit { 4 } else { 8 }
    }

    pub fn get_str(&self, offset: u64) -> String {
        read_cstr(&self.dynstr, offset)
    }

    /// Parses the dynamic block of a flattened image.
    pub fn parse(image: &[u8]) -> Result<DynamicMetadata> {
        let mod0 = Mod0::parse(image)?;
        let cur = ByteCursor::new(image);

        // Pointer width is probed, not declared: two known-64-bit-aligned
        // fields of the dynamic table exceed the 32-bit range only when the
        // image packs two 32-bit entries per slot.
        let is_32bit = cur.u64_at(mod0.dynamic_off)? > u64::from(u32::MAX)
            || cur.u64_at(mod0.dynamic_off + 0x10)? > u64::from(u32::MAX);

        let dynamic = DynamicTable::parse(image, mod0.dynamic_off, is_32bit)?;

        let dynstr = match dynamic.pair(elf::DT_STRTAB, elf::DT_STRSZ) {
            Some((start, size)) => cur.bytes_at(start, size as usize)?.to_vec(),
            None => {
                tracing::warn!("no dynamic string table");
                vec![0]
            }
        };
        let needed = dynamic
            .needed
            .iter()
            .map(|&off| read_cstr(&dynstr, off))
            .collect();

        let (symbols, symtab_range) = match dynamic.get(elf::DT_SYMTAB) {
            Some(symtab) => {
                let (syms, end) =
                    parse_symbols(image, symtab, dynamic.get(elf::DT_STRTAB), &dynstr, is_32bit)?;
                (syms, Some((symtab, end)))
            }
            None => (Vec::new(), None),
        };

        let mut relocations = Vec::new();
        let mut visited = BTreeSet::new();
        let mut plt_got_window = None;

        fn ingest(
            entries: Vec<RelocationEntry>,
            relocations: &mut Vec<RelocationEntry>,
            visited: &mut BTreeSet<u64>,
        ) {
            for entry in &entries {
                if entry.kind != RelocKind::TlsDesc {
                    visited.insert(entry.offset);
                }
            }
            relocations.extend(entries);
        }

        if let Some((off, size)) = dynamic.pair(elf::DT_REL, elf::DT_RELSZ) {
            let entries = parse_reloc_table(image, off, size, is_32bit, false)?;
            ingest(entries, &mut relocations, &mut visited);
        }
        if let Some((off, size)) = dynamic.pair(elf::DT_RELA, elf::DT_RELASZ) {
            let entries = parse_reloc_table(image, off, size, is_32bit, true)?;
            ingest(entries, &mut relocations, &mut visited);
        }
        if let Some((off, size)) = dynamic.pair(elf::DT_JMPREL, elf::DT_PLTRELSZ) {
            // Observed images use REL on 32-bit targets and RELA on 64-bit.
            let entries = parse_reloc_table(image, off, size, is_32bit, !is_32bit)?;
            let word = if is_32bit { 4 } else { 8 };
            let targets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
            if let (Some(&min), Some(&max)) = (targets.iter().min(), targets.iter().max()) {
                plt_got_window = Some((min, max + word));
            }
            ingest(entries, &mut relocations, &mut visited);
        }

        let mut relr_offsets = Vec::new();
        if !is_32bit {
            if let Some((off, size)) = dynamic.pair(DT_RELR, DT_RELRSZ) {
                relr_offsets = decode_relr(image, off, size)?;
                for &target in &relr_offsets {
                    visited.insert(target);
                    relocations.push(RelocationEntry {
                        offset: target,
                        kind: RelocKind::RelrPacked,
                        symbol: None,
                        addend: None,
                    });
                }
            }
        }

        Ok(DynamicMetadata {
            mod0,
            is_32bit,
            dynamic,
            dynstr,
            needed,
            symbols,
            relocations,
            visited,
            plt_got_window,
            symtab_range,
            relr_offsets,
        })
    }
}

fn read_cstr(strtab: &[u8], offset: u64) -> String {
    let start = (offset as usize).min(strtab.len());
    let bytes = &strtab[start..];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reads dynamic symbols starting at `symtab`. The table has no declared
/// length: it ends where the string table begins (when adjacent above it),
/// or at the first entry whose name offset falls outside the string table.
fn parse_symbols(
    image: &[u8],
    symtab: u64,
    strtab: Option<u64>,
    dynstr: &[u8],
    is_32bit: bool,
) -> Result<(Vec<ElfSym>, u64)> {
    let mut cur = ByteCursor::new(image);
    cur.seek(symtab);
    let entry_len = if is_32bit { 16 } else { 24 };
    let mut symbols = Vec::new();
    loop {
        if let Some(strtab) = strtab {
            if symtab < strtab && cur.pos() + entry_len > strtab {
                break;
            }
        }
        if (cur.pos() as usize) + entry_len as usize > image.len() {
            break;
        }
        let mark = cur.pos();
        let (st_name, st_info, st_other, st_shndx, st_value, st_size) = if is_32bit {
            let name = cur.read_u32()?;
            let value = cur.read_u32()? as u64;
            let size = cur.read_u32()? as u64;
            let info = cur.read_u8()?;
            let other = cur.read_u8()?;
            let shndx = cur.read_u16()?;
            (name, info, other, shndx, value, size)
        } else {
            let name = cur.read_u32()?;
            let info = cur.read_u8()?;
            let other = cur.read_u8()?;
            let shndx = cur.read_u16()?;
            let value = cur.read_u64()?;
            let size = cur.read_u64()?;
            (name, info, other, shndx, value, size)
        };
        if st_name as usize > dynstr.len() {
            cur.seek(mark);
            break;
        }
        symbols.push(ElfSym::new(
            read_cstr(dynstr, st_name as u64),
            st_info,
            st_other,
            st_shndx,
            st_value,
            st_size,
        ));
    }
    Ok((symbols, cur.pos()))
}

/// Parses one REL/RELA-style relocation table. Unknown relocation types are
/// logged and skipped rather than failing the parse.
fn parse_reloc_table(
    image: &[u8],
    offset: u64,
    size: u64,
    is_32bit: bool,
    has_addend: bool,
) -> Result<Vec<RelocationEntry>> {
    let mut cur = ByteCursor::new(image);
    cur.seek(offset);
    let word = if is_32bit { 4u64 } else { 8 };
    let entry_len = word * if has_addend { 3 } else { 2 };
    let mut entries = Vec::new();
    for _ in 0..size / entry_len {
        let r_offset = cur.read_word(is_32bit)?;
        let info = cur.read_word(is_32bit)?;
        let addend = if has_addend {
            Some(if is_32bit {
                cur.read_i32()? as i64
            } else {
                cur.read_u64()? as i64
            })
        } else {
            None
        };
        let (r_type, r_sym) = if is_32bit {
            ((info & 0xFF) as u32, (info >> 8) as usize)
        } else {
            ((info & 0xFFFF_FFFF) as u32, (info >> 32) as usize)
        };
        let Some(kind) = RelocKind::from_raw(r_type, is_32bit) else {
            tracing::warn!(r_type, offset = r_offset, "unhandled relocation type, skipping");
            continue;
        };
        entries.push(RelocationEntry {
            offset: r_offset,
            kind,
            symbol: (r_sym != 0).then_some(r_sym),
            addend,
        });
    }
    Ok(entries)
}

/// Decodes a bit-packed RELR relative-relocation table into target offsets.
///
/// An even word is a literal target; the slot after it becomes the base for
/// subsequent bitmaps. An odd word is a bitmap: after shifting out the
/// marker bit, bit `i` selects the slot at `base + i * 8`, and the base
/// advances by 63 slots per bitmap word.
pub fn decode_relr(image: &[u8], offset: u64, size: u64) -> Result<Vec<u64>> {
    let mut cur = ByteCursor::new(image);
    cur.seek(offset);
    let mut offsets = Vec::new();
    let mut base = 0u64;
    for _ in 0..size / 8 {
        let word = cur.read_u64()?;
        if word & 1 == 0 {
            offsets.push(word);
            base = word + 8;
        } else {
            let mut bits = word >> 1;
            let mut slot = base;
            while bits != 0 {
                if bits & 1 != 0 {
                    offsets.push(slot);
                }
                slot += 8;
                bits >>= 1;
            }
            base += 63 * 8;
        }
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn image_with_dynamic(entries: &[(u64, u64)]) -> (Vec<u8>, u64) {
        // MOD0 at 0x20, dynamic table right after the descriptor.
        let dynamic_off = 0x40u64;
        let mut image = vec![0u8; 0x40 + entries.len() * 16 + 16];
        image[4..8].copy_from_slice(&0x20u32.to_le_bytes());
        image[0x20..0x24].copy_from_slice(b"MOD0");
        let dyn_rel = (dynamic_off - 0x20) as i32;
        image[0x24..0x28].copy_from_slice(&dyn_rel.to_le_bytes());
        // bss start == bss end == unwind bounds == end of image.
        let end_rel = (image.len() as i32) - 0x20;
        for field in 1..5 {
            let at = 0x24 + field * 4;
            image[at..at + 4].copy_from_slice(&end_rel.to_le_bytes());
        }
        for (i, (tag, value)) in entries.iter().enumerate() {
            let at = dynamic_off as usize + i * 16;
            image[at..at + 8].copy_from_slice(&tag.to_le_bytes());
            image[at + 8..at + 16].copy_from_slice(&value.to_le_bytes());
        }
        (image, dynamic_off)
    }

    #[test]
    fn missing_mod0_magic_is_fatal() {
        let mut image = vec![0u8; 0x40];
        image[4..8].copy_from_slice(&0x20u32.to_le_bytes());
        assert!(matches!(
            Mod0::parse(&image),
            Err(NxoError::InvalidModuleDescriptor)
        ));
    }

    #[test]
    fn needed_entries_accumulate_in_encounter_order() {
        let (image, off) = image_with_dynamic(&[
            (u64::from(elf::DT_NEEDED), 5),
            (u64::from(elf::DT_NEEDED), 9),
            (u64::from(elf::DT_NULL), 0),
        ]);
        let table = DynamicTable::parse(&image, off, false).unwrap();
        assert_eq!(table.needed, vec![5, 9]);
    }

    #[test]
    fn duplicate_tags_keep_first_occurrence() {
        let (image, off) = image_with_dynamic(&[
            (u64::from(elf::DT_STRTAB), 0x100),
            (u64::from(elf::DT_STRTAB), 0x200),
            (u64::from(elf::DT_NULL), 0),
        ]);
        let table = DynamicTable::parse(&image, off, false).unwrap();
        assert_eq!(table.get(elf::DT_STRTAB), Some(0x100));
    }

    #[test]
    fn dynamic_table_end_covers_null_terminator() {
        let (image, off) = image_with_dynamic(&[(u64::from(elf::DT_NULL), 0)]);
        let table = DynamicTable::parse(&image, off, false).unwrap();
        assert_eq!(table.end, off + 16);
    }

    #[test]
    fn relr_decodes_literal_then_bitmap() {
        let mut image = vec![0u8; 0x20];
        image[0..8].copy_from_slice(&0x1000u64.to_le_bytes());
        // Bitmap word: marker bit plus bits 1 and 3 (slots 0 and 2 past the base).
        let bitmap: u64 = 1 | (1 << 1) | (1 << 3);
        image[8..16].copy_from_slice(&bitmap.to_le_bytes());
        let offsets = decode_relr(&image, 0, 16).unwrap();
        assert_eq!(offsets, vec![0x1000, 0x1000 + 8, 0x1000 + 24]);
    }

    #[test]
    fn relr_consecutive_literals() {
        let mut image = vec![0u8; 0x10];
        image[0..8].copy_from_slice(&0x2000u64.to_le_bytes());
        image[8..16].copy_from_slice(&0x3000u64.to_le_bytes());
        assert_eq!(decode_relr(&image, 0, 16).unwrap(), vec![0x2000, 0x3000]);
    }

    #[test]
    fn relr_tags_are_ingested_as_packed_relocations() {
        let (mut image, _) = image_with_dynamic(&[
            (u64::from(DT_RELR), 0x70),
            (u64::from(DT_RELRSZ), 8),
            (u64::from(elf::DT_NULL), 0),
        ]);
        // One literal RELR word past the dynamic table, where DT_RELR points.
        image[0x70..0x78].copy_from_slice(&0x20u64.to_le_bytes());
        let meta = DynamicMetadata::parse(&image).unwrap();
        assert_eq!(meta.relr_offsets, vec![0x20]);
        assert_eq!(meta.relocations.len(), 1);
        assert_eq!(meta.relocations[0].kind, RelocKind::RelrPacked);
        assert!(meta.visited.contains(&0x20));
    }

    #[test]
    fn reloc_table_maps_types_and_symbol_indices() {
        let mut image = vec![0u8; 0x60];
        // Entry 0: RELATIVE at 0x100, addend 0x40, no symbol.
        image[0..8].copy_from_slice(&0x100u64.to_le_bytes());
        image[8..16].copy_from_slice(&u64::from(elf::R_AARCH64_RELATIVE).to_le_bytes());
        image[16..24].copy_from_slice(&0x40u64.to_le_bytes());
        // Entry 1: GLOB_DAT at 0x108 against symbol 2.
        image[24..32].copy_from_slice(&0x108u64.to_le_bytes());
        let info = (2u64 << 32) | u64::from(elf::R_AARCH64_GLOB_DAT);
        image[32..40].copy_from_slice(&info.to_le_bytes());
        let entries = parse_reloc_table(&image, 0, 48, false, true).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, RelocKind::Relative);
        assert_eq!(entries[0].addend, Some(0x40));
        assert_eq!(entries[0].symbol, None);
        assert_eq!(entries[1].kind, RelocKind::GlobDat);
        assert_eq!(entries[1].symbol, Some(2));
    }

    #[test]
    fn unknown_reloc_types_are_skipped() {
        let mut image = vec![0u8; 0x18];
        image[0..8].copy_from_slice(&0x100u64.to_le_bytes());
        image[8..16].copy_from_slice(&9999u64.to_le_bytes());
        let entries = parse_reloc_table(&image, 0, 24, false, true).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn symbols_stop_at_adjacent_string_table() {
        // One 24-byte symbol followed directly by the string table.
        let mut image = vec![0u8; 0x40];
        let dynstr = b"\0main\0";
        // Symbol: name offset 1 ("main"), defined in section 1, value 0x80.
        image[0..4].copy_from_slice(&1u32.to_le_bytes());
        image[4] = (elf::STB_GLOBAL << 4) | elf::STT_FUNC;
        image[6..8].copy_from_slice(&1u16.to_le_bytes());
        image[8..16].copy_from_slice(&0x80u64.to_le_bytes());
        image[24..24 + dynstr.len()].copy_from_slice(dynstr);
        let (syms, end) = parse_symbols(&image, 0, Some(24), dynstr, false).unwrap();
        assert_eq!(end, 24);
        assert_eq!(syms.len(), 1);
        assert_eq!(syms[0].name, "main");
        assert_eq!(syms[0].kind, SymType::Func);
        assert_eq!(syms[0].bind, SymBind::Global);
        assert_eq!(syms[0].value, 0x80);
        assert!(!syms[0].is_external());
    }
}
