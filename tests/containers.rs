//! End-to-end container tests: a synthetic image with a MOD0 descriptor,
//! dynamic table, symbols and relocations is packed into KIP and NSO
//! containers, parsed, and relocated.

use object::elf;
use pretty_assertions::assert_eq;

use nxo::container::Format;
use nxo::NxoFile;

const TEXT_SIZE: usize = 0x1000;
const RODATA_OFF: usize = 0x1000;
const DATA_OFF: usize = 0x2000;
const IMAGE_SIZE: usize = 0x3000;
const BSS_START: u64 = 0x3000;
const BSS_END: u64 = 0x4000;

const MODOFF: usize = 0x200;
const SYMTAB: usize = 0x10C0;
const STRTAB: usize = 0x1100;
const RELA: usize = 0x1200;
const UNWIND: usize = 0x1300;
const DYNAMIC: usize = 0x2000;

const DYNSTR: &[u8] = b"\0f\0libc.so\0";
const LOAD_BASE: u64 = 0x71_0000_0000;

fn put32(image: &mut [u8], at: usize, v: u32) {
    image[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(image: &mut [u8], at: usize, v: u64) {
    image[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// The flattened image both containers carry: one defined function symbol,
/// one needed library, one relative relocation, one unwind entry.
fn build_image() -> Vec<u8> {
    let mut image = vec![0u8; IMAGE_SIZE];
    put32(&mut image, 4, MODOFF as u32);

    image[MODOFF..MODOFF + 4].copy_from_slice(b"MOD0");
    let rels: [i32; 6] = [
        (DYNAMIC - MODOFF) as i32,
        (BSS_START as usize - MODOFF) as i32,
        (BSS_END as usize - MODOFF) as i32,
        (UNWIND - MODOFF) as i32,
        (UNWIND + 0x10 - MODOFF) as i32,
        0,
    ];
    for (i, rel) in rels.iter().enumerate() {
        image[MODOFF + 4 + i * 4..MODOFF + 8 + i * 4].copy_from_slice(&rel.to_le_bytes());
    }

    // .dynsym: null entry, then "f" at 0x100.
    let sym = SYMTAB + 24;
    put32(&mut image, sym, 1); // st_name -> "f"
    image[sym + 4] = (elf::STB_GLOBAL << 4) | elf::STT_FUNC;
    image[sym + 6..sym + 8].copy_from_slice(&1u16.to_le_bytes()); // shndx
    put64(&mut image, sym + 8, 0x100);

    image[STRTAB..STRTAB + DYNSTR.len()].copy_from_slice(DYNSTR);

    // One RELATIVE relocation patching a data word.
    put64(&mut image, RELA, 0x2100);
    put64(&mut image, RELA + 8, u64::from(elf::R_AARCH64_RELATIVE));
    put64(&mut image, RELA + 16, 0x300);

    // Unwind table: (function, info), zero-terminated.
    put32(&mut image, UNWIND, 0x100);
    put32(&mut image, UNWIND + 4, 1);

    let tags: [(u32, u64); 7] = [
        (elf::DT_SYMTAB, SYMTAB as u64),
        (elf::DT_STRTAB, STRTAB as u64),
        (elf::DT_STRSZ, DYNSTR.len() as u64),
        (elf::DT_RELA, RELA as u64),
        (elf::DT_RELASZ, 24),
        (elf::DT_NEEDED, 3), // "libc.so"
        (elf::DT_NULL, 0),
    ];
    for (i, (tag, value)) in tags.iter().enumerate() {
        put64(&mut image, DYNAMIC + i * 16, u64::from(*tag));
        put64(&mut image, DYNAMIC + i * 16 + 8, *value);
    }

    image
}

fn pack_kip(image: &[u8]) -> Vec<u8> {
    let mut file = vec![0u8; 0x100];
    file[0..4].copy_from_slice(b"KIP1");
    let descriptors = [
        (0u32, TEXT_SIZE as u32),
        (RODATA_OFF as u32, 0x1000),
        (DATA_OFF as u32, 0x1000),
    ];
    for (i, (loc, size)) in descriptors.iter().enumerate() {
        let at = 0x20 + i * 0x10;
        put32(&mut file, at, *loc);
        put32(&mut file, at + 4, *size);
        put32(&mut file, at + 8, *size); // uncompressed: file size == virt size
    }
    put32(&mut file, 0x54, (BSS_END - BSS_START) as u32);
    file.extend_from_slice(image);
    file
}

fn pack_nso(image: &[u8]) -> Vec<u8> {
    let mut file = vec![0u8; 0x100];
    file[0..4].copy_from_slice(b"NSO0");
    put32(&mut file, 0xC, 7); // all three segments LZ4-compressed
    put32(&mut file, 0x3C, (BSS_END - BSS_START) as u32);

    let segments = [
        (0usize, TEXT_SIZE, 0x10usize, 0x60usize),
        (RODATA_OFF, 0x1000, 0x20, 0x64),
        (DATA_OFF, 0x1000, 0x30, 0x68),
    ];
    for (virt_off, size, desc_at, file_size_at) in segments {
        let compressed = lz4_flex::block::compress(&image[virt_off..virt_off + size]);
        let file_off = file.len() as u32;
        put32(&mut file, desc_at, file_off);
        put32(&mut file, desc_at + 4, virt_off as u32);
        put32(&mut file, desc_at + 8, size as u32);
        put32(&mut file, file_size_at, compressed.len() as u32);
        file.extend_from_slice(&compressed);
    }
    file
}

fn check_parsed(nxo: &NxoFile) {
    assert!(!nxo.is_32bit);
    assert_eq!(nxo.image.len(), IMAGE_SIZE);
    assert_eq!(nxo.needed, vec!["libc.so".to_string()]);
    assert_eq!(nxo.symbols.len(), 2);
    assert_eq!(nxo.symbols[1].name, "f");
    assert_eq!(nxo.data_size, 0x1000);
    assert_eq!(nxo.bss_off, BSS_START);
    assert_eq!(nxo.bss_size, BSS_END - BSS_START);

    // The section list tiles the whole address range without gaps.
    assert_eq!(nxo.sections.first().unwrap().start, 0);
    assert_eq!(nxo.sections.last().unwrap().end, BSS_END);
    for pair in nxo.sections.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
    }
    let names: Vec<&str> = nxo.sections.iter().map(|s| s.name.as_str()).collect();
    for expected in [".dynsym", ".dynstr", ".rela.dyn", ".dynamic", ".bss"] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }
}

fn check_relocated(nxo: &mut NxoFile) {
    let diagnostics = nxo.relocate(LOAD_BASE);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    let patched = u64::from_le_bytes(nxo.image[0x2100..0x2108].try_into().unwrap());
    assert_eq!(patched, LOAD_BASE + 0x300);
    assert_eq!(nxo.symbols[1].resolved, Some(LOAD_BASE + 0x100));
    assert_eq!(nxo.unwind_functions(), vec![0x100]);

    // A second relocate call is refused and leaves the image untouched.
    let before = nxo.image.clone();
    assert!(nxo.relocate(LOAD_BASE).is_empty());
    assert_eq!(nxo.image, before);
}

#[test]
fn kip_round_trip() {
    let file = pack_kip(&build_image());
    let mut nxo = NxoFile::parse(&file).unwrap();
    assert_eq!(nxo.format, Format::Kip);
    check_parsed(&nxo);
    check_relocated(&mut nxo);
}

#[test]
fn nso_round_trip_with_lz4_segments() {
    let file = pack_nso(&build_image());
    let mut nxo = NxoFile::parse(&file).unwrap();
    assert_eq!(nxo.format, Format::Nso);
    check_parsed(&nxo);
    check_relocated(&mut nxo);
}

#[test]
fn kip_and_nso_yield_identical_images() {
    let image = build_image();
    let kip = NxoFile::parse(&pack_kip(&image)).unwrap();
    let nso = NxoFile::parse(&pack_nso(&image)).unwrap();
    assert_eq!(kip.image, nso.image);
    assert_eq!(kip.sections, nso.sections);
}
