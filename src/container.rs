//! Container header parsing and image flattening.
//!
//! Three closely related position-independent executable containers are
//! supported, selected by magic-signature sniffing: NSO (LZ4-compressed
//! segments), KIP (back-reference-compressed segments) and NRO (never
//! compressed). Each parser reads the three segment descriptors, inflates
//! the payloads, and concatenates them at their declared virtual offsets
//! into one flat buffer addressable from zero.

use crate::compress::{blz_decompress, lz4_decompress};
use crate::cursor::ByteCursor;
use crate::error::{NxoError, Result};

/// The three terminal container format variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Nso,
    Nro,
    Kip,
}

/// One decompressed (or raw) segment plus its declared virtual placement.
struct SegmentData {
    bytes: Vec<u8>,
    virt_off: u64,
    virt_size: u64,
}

/// A parsed container before dynamic-metadata analysis: the flattened image
/// plus the raw segment offsets taken from the header.
pub struct RawImage {
    pub format: Format,
    pub image: Vec<u8>,
    pub text_off: u64,
    pub text_size: u64,
    pub rodata_off: u64,
    pub rodata_size: u64,
    pub data_off: u64,
    pub data_size: u64,
    /// Header-declared bss size. Advisory for KIP, where the MOD0 bounds
    /// are the source of truth.
    pub bss_size: u64,
    /// Second bss-size candidate seen in older KIP headers (field at 0x18
    /// instead of 0x54). Validated against MOD0 by the loader.
    pub alt_bss_size: Option<u64>,
}

impl RawImage {
    /// Sniffs the magic signature and parses the matching variant.
    pub fn parse(data: &[u8]) -> Result<RawImage> {
        let cur = ByteCursor::new(data);
        if cur.bytes_at(0, 4).map(|m| m == b"NSO0").unwrap_or(false) {
            parse_nso(&cur)
        } else if cur.bytes_at(0, 4).map(|m| m == b"KIP1").unwrap_or(false) {
            parse_kip(&cur)
        } else if cur.bytes_at(0x10, 4).map(|m| m == b"NRO0").unwrap_or(false) {
            parse_nro(&cur)
        } else {
            Err(NxoError::UnknownContainerFormat)
        }
    }
}

fn read_triple(cur: &ByteCursor, offset: u64) -> Result<(u64, u64, u64)> {
    Ok((
        cur.u32_at(offset)? as u64,
        cur.u32_at(offset + 4)? as u64,
        cur.u32_at(offset + 8)? as u64,
    ))
}

fn parse_nso(cur: &ByteCursor) -> Result<RawImage> {
    let flags = cur.u32_at(0xC)?;

    let (toff, tloc, tsize) = read_triple(cur, 0x10)?;
    let (roff, rloc, rsize) = read_triple(cur, 0x20)?;
    let (doff, dloc, dsize) = read_triple(cur, 0x30)?;
    let bss_size = cur.u32_at(0x3C)? as u64;
    let tfilesize = cur.u32_at(0x60)? as u64;
    let rfilesize = cur.u32_at(0x64)? as u64;
    let dfilesize = cur.u32_at(0x68)? as u64;

    let load = |file_off: u64, file_size: u64, loc: u64, size: u64, compressed: bool| -> Result<SegmentData> {
        let raw = cur.bytes_at(file_off, file_size as usize)?;
        let bytes = if compressed {
            lz4_decompress(raw, size as usize)?
        } else {
            raw.to_vec()
        };
        Ok(SegmentData { bytes, virt_off: loc, virt_size: size })
    };

    let text = load(toff, tfilesize, tloc, tsize, flags & 1 != 0)?;
    let rodata = load(roff, rfilesize, rloc, rsize, flags & 2 != 0)?;
    let data = load(doff, dfilesize, dloc, dsize, flags & 4 != 0)?;

    Ok(assemble(Format::Nso, text, rodata, data, bss_size, None))
}

fn parse_kip(cur: &ByteCursor) -> Result<RawImage> {
    let flags = cur.bytes_at(0x1F, 1)?[0];

    let (tloc, tsize, tfilesize) = read_triple(cur, 0x20)?;
    let (rloc, rsize, rfilesize) = read_triple(cur, 0x30)?;
    let (dloc, dsize, dfilesize) = read_triple(cur, 0x40)?;

    // Segment file data is packed sequentially after the fixed header.
    let toff = 0x100u64;
    let roff = toff + tfilesize;
    let doff = roff + rfilesize;

    // Two bss-size field placements exist across KIP versions. Both are
    // reported; the loader validates them against the MOD0 bss bounds.
    let bss_size = cur.u32_at(0x54)? as u64;
    let alt_bss_size = cur.u32_at(0x18).ok().map(u64::from);

    let load = |file_off: u64, file_size: u64, loc: u64, size: u64, compressed: bool| -> Result<SegmentData> {
        let raw = cur.bytes_at(file_off, file_size as usize)?;
        let bytes = if compressed { blz_decompress(raw)? } else { raw.to_vec() };
        Ok(SegmentData { bytes, virt_off: loc, virt_size: size })
    };

    let text = load(toff, tfilesize, tloc, tsize, flags & 1 != 0)?;
    let rodata = load(roff, rfilesize, rloc, rsize, flags & 2 != 0)?;
    let data = load(doff, dfilesize, dloc, dsize, flags & 4 != 0)?;

    Ok(assemble(Format::Kip, text, rodata, data, bss_size, alt_bss_size))
}

fn parse_nro(cur: &ByteCursor) -> Result<RawImage> {
    // NRO segments live uncompressed at their virtual offsets.
    let tloc = cur.u32_at(0x20)? as u64;
    let tsize = cur.u32_at(0x24)? as u64;
    let rloc = cur.u32_at(0x28)? as u64;
    let rsize = cur.u32_at(0x2C)? as u64;
    let dloc = cur.u32_at(0x30)? as u64;
    let dsize = cur.u32_at(0x34)? as u64;
    let bss_size = cur.u32_at(0x38)? as u64;

    let load = |loc: u64, size: u64| -> Result<SegmentData> {
        Ok(SegmentData {
            bytes: cur.bytes_at(loc, size as usize)?.to_vec(),
            virt_off: loc,
            virt_size: size,
        })
    };

    let text = load(tloc, tsize)?;
    let rodata = load(rloc, rsize)?;
    let data = load(dloc, dsize)?;

    Ok(assemble(Format::Nro, text, rodata, data, bss_size, None))
}

/// Concatenates the three segments into one buffer addressable by virtual
/// offset. Gaps before a segment's declared offset are zero-filled; data
/// spilling past the next segment's offset is truncated with a warning.
fn assemble(
    format: Format,
    text: SegmentData,
    rodata: SegmentData,
    data: SegmentData,
    bss_size: u64,
    alt_bss_size: Option<u64>,
) -> RawImage {
    let mut image = text.bytes;
    pad_or_truncate(&mut image, rodata.virt_off, ".text");
    image.extend_from_slice(&rodata.bytes);
    pad_or_truncate(&mut image, data.virt_off, ".rodata");
    image.extend_from_slice(&data.bytes);

    RawImage {
        format,
        image,
        text_off: text.virt_off,
        text_size: text.virt_size,
        rodata_off: rodata.virt_off,
        rodata_size: rodata.virt_size,
        data_off: data.virt_off,
        data_size: data.virt_size,
        bss_size,
        alt_bss_size,
    }
}

fn pad_or_truncate(image: &mut Vec<u8>, next_off: u64, name: &str) {
    let next_off = next_off as usize;
    if next_off < image.len() {
        tracing::warn!(
            segment = name,
            have = image.len(),
            want = next_off,
            "segment spills past next virtual offset, truncating"
        );
    }
    image.resize(next_off, 0);
}
