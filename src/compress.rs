//! Segment decompression.
//!
//! KIP segments use a backward-scanning back-reference scheme (a BLZ
//! variant) decoded here by hand. NSO segments use standard LZ4 block
//! compression, delegated to `lz4_flex`. The two formats are unrelated.

use crate::error::{NxoError, Result};

const FOOTER_LEN: usize = 12;

/// Decompresses one KIP back-reference-compressed segment.
///
/// The trailing 12-byte footer holds `(compressed_size, init_index,
/// extra_uncompressed_size)`. The logical compressed region is the *last*
/// `compressed_size` bytes of `input`; any earlier bytes are discarded.
/// Decoding runs backward from the end of the output buffer, one control
/// byte per eight back-reference-or-literal decisions, and stops when the
/// destination cursor reaches zero.
///
/// Every computed index is validated before use; malformed streams fail
/// with [`NxoError::MalformedCompression`] instead of reading out of range.
pub fn blz_decompress(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < FOOTER_LEN {
        return Err(NxoError::MalformedCompression("input shorter than footer"));
    }
    let footer = &input[input.len() - FOOTER_LEN..];
    let compressed_size = u32::from_le_bytes(footer[0..4].try_into().unwrap()) as usize;
    let init_index = u32::from_le_bytes(footer[4..8].try_into().unwrap()) as usize;
    let addl_size = u32::from_le_bytes(footer[8..12].try_into().unwrap()) as usize;

    if compressed_size > input.len() {
        return Err(NxoError::MalformedCompression(
            "footer compressed size exceeds input length",
        ));
    }
    let comp = &input[input.len() - compressed_size..];

    let out_len = compressed_size + addl_size;
    if out_len == 0 {
        return Ok(Vec::new());
    }

    let mut index = compressed_size
        .checked_sub(init_index)
        .ok_or(NxoError::MalformedCompression("initial index underflow"))?;
    let mut out = vec![0u8; out_len];
    let mut outindex = out_len;

    while outindex > 0 {
        if index == 0 {
            return Err(NxoError::MalformedCompression("control byte underflow"));
        }
        index -= 1;
        let mut control = comp[index];
        for _ in 0..8 {
            if control & 0x80 != 0 {
                if index < 2 {
                    return Err(NxoError::MalformedCompression("back-reference underflow"));
                }
                index -= 2;
                let pair = comp[index] as usize | (comp[index + 1] as usize) << 8;
                let seg_size = ((pair >> 12) & 0xF) + 3;
                let seg_offset = (pair & 0x0FFF) + 2;
                if outindex < seg_size {
                    return Err(NxoError::MalformedCompression("back-reference overruns output"));
                }
                // Byte-by-byte copy: sources may overlap the bytes written
                // by earlier iterations of this same reference.
                for _ in 0..seg_size {
                    let src = outindex + seg_offset;
                    if src >= out_len {
                        return Err(NxoError::MalformedCompression("back-reference source out of range"));
                    }
                    let byte = out[src];
                    outindex -= 1;
                    out[outindex] = byte;
                }
            } else {
                if index == 0 {
                    return Err(NxoError::MalformedCompression("literal source underflow"));
                }
                index -= 1;
                outindex -= 1;
                out[outindex] = comp[index];
            }
            control <<= 1;
            if outindex == 0 {
                break;
            }
        }
    }
    Ok(out)
}

/// Decompresses one LZ4-block-compressed NSO segment to its declared size.
pub fn lz4_decompress(input: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    lz4_flex::block::decompress(input, uncompressed_size)
        .map_err(|_| NxoError::MalformedCompression("lz4 block decode failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn footer(compressed_size: u32, init_index: u32, addl: u32) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&compressed_size.to_le_bytes());
        f.extend_from_slice(&init_index.to_le_bytes());
        f.extend_from_slice(&addl.to_le_bytes());
        f
    }

    /// Three literals then back-references covering the rest: decodes to
    /// 64 bytes of 0x55. Control 0x1E = decisions L,L,L,B,B,B,B (MSB first).
    fn run_of_0x55() -> Vec<u8> {
        let mut blob = vec![
            0x00, 0x40, // size 7, offset 2 (decision 7)
            0x00, 0xF0, // size 18, offset 2 (decision 6)
            0x00, 0xF0, // size 18, offset 2 (decision 5)
            0x00, 0xF0, // size 18, offset 2 (decision 4)
            0x55, 0x55, 0x55, // literals (decisions 3, 2, 1)
            0x1E, // control byte
        ];
        blob.extend_from_slice(&footer(24, 12, 40));
        blob
    }

    #[test]
    fn decodes_literals_and_overlapping_back_references() {
        let out = blz_decompress(&run_of_0x55()).unwrap();
        assert_eq!(out, vec![0x55u8; 64]);
    }

    #[test]
    fn decompression_is_deterministic() {
        let blob = run_of_0x55();
        assert_eq!(blz_decompress(&blob).unwrap(), blz_decompress(&blob).unwrap());
    }

    #[test]
    fn unrelated_prefix_bytes_are_discarded() {
        let mut blob = vec![0xDE, 0xAD, 0xBE, 0xEF];
        blob.extend_from_slice(&run_of_0x55());
        assert_eq!(blz_decompress(&blob).unwrap(), vec![0x55u8; 64]);
    }

    #[test]
    fn footer_larger_than_input_is_rejected() {
        let blob = footer(0x1000, 12, 0);
        assert!(matches!(
            blz_decompress(&blob),
            Err(NxoError::MalformedCompression(_))
        ));
    }

    #[test]
    fn input_shorter_than_footer_is_rejected() {
        assert!(blz_decompress(&[0u8; 5]).is_err());
    }

    #[test]
    fn zero_sized_stream_decodes_to_empty() {
        let blob = footer(0, 0, 0);
        // compressed_size of 0 excludes even the footer itself.
        assert_eq!(blz_decompress(&blob).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn truncated_control_stream_is_rejected() {
        // Claims a literal but the source cursor starts at zero.
        let mut blob = vec![0x00];
        blob.extend_from_slice(&footer(13, 12, 8));
        assert!(matches!(
            blz_decompress(&blob),
            Err(NxoError::MalformedCompression(_))
        ));
    }

    #[test]
    fn lz4_round_trip_via_external_codec() {
        let data = b"segment payload segment payload segment payload";
        let compressed = lz4_flex::block::compress(data);
        assert_eq!(lz4_decompress(&compressed, data.len()).unwrap(), data);
    }

    #[test]
    fn lz4_garbage_is_malformed() {
        assert!(matches!(
            lz4_decompress(&[0xFF, 0xFF, 0xFF], 64),
            Err(NxoError::MalformedCompression(_))
        ));
    }
}
