//! Address-space layout.
//!
//! Models the segments (.text/.rodata/.data/.bss) and named sections of a
//! flattened image, and produces the final sorted, gapless section list.
//! Overlap among declared ranges is a construction error: these are
//! load-bearing facts about the binary, not recoverable corruption.

use crate::error::{NxoError, Result};

/// Half-open address range `[start, start+size)`. Never zero-sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub size: u64,
}

impl Range {
    pub fn new(start: u64, size: u64) -> Self {
        debug_assert!(size > 0);
        Self { start, size }
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    fn incl_end(&self) -> u64 {
        self.start + self.size - 1
    }

    /// Whether the closed intervals of the two ranges intersect.
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start <= other.incl_end() && other.start <= self.incl_end()
    }

    /// Whether `other` lies entirely within this range.
    pub fn includes(&self, other: &Range) -> bool {
        other.start >= self.start && other.incl_end() <= self.incl_end()
    }
}

/// The four major region kinds of an executable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Const,
    Data,
    Bss,
}

/// A named sub-range of a segment, declared explicitly or synthesized to
/// fill a gap during [`SegmentBuilder::flatten`].
#[derive(Debug, Clone)]
pub struct Section {
    pub range: Range,
    pub name: String,
}

/// One major region plus its child sections, kept sorted at flatten time.
#[derive(Debug)]
pub struct Segment {
    pub range: Range,
    pub name: String,
    pub kind: SegmentKind,
    sections: Vec<Section>,
}

impl Segment {
    fn add_section(&mut self, section: Section) -> Result<()> {
        for existing in &self.sections {
            if existing.range.overlaps(&section.range) {
                return Err(NxoError::LayoutConsistency(format!(
                    "section {} [0x{:X}, 0x{:X}) overlaps {} [0x{:X}, 0x{:X})",
                    section.name,
                    section.range.start,
                    section.range.end(),
                    existing.name,
                    existing.range.start,
                    existing.range.end(),
                )));
            }
        }
        self.sections.push(section);
        Ok(())
    }
}

/// One entry of the flattened section list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    pub start: u64,
    pub end: u64,
    pub name: String,
    pub kind: SegmentKind,
}

fn suffixed_name(name: &str, suffix: u32) -> String {
    if suffix == 0 {
        name.to_string()
    } else {
        format!("{}.{}", name, suffix)
    }
}

/// Collects segment and section declarations, then flattens them into a
/// complete non-overlapping partition of the covered address range.
#[derive(Debug, Default)]
pub struct SegmentBuilder {
    segments: Vec<Segment>,
}

impl SegmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a segment. Zero-sized segments are ignored; an overlap with
    /// an existing segment is fatal.
    pub fn add_segment(&mut self, start: u64, size: u64, name: &str, kind: SegmentKind) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let range = Range::new(start, size);
        for existing in &self.segments {
            if range.overlaps(&existing.range) {
                return Err(NxoError::LayoutConsistency(format!(
                    "segment {} [0x{:X}, 0x{:X}) overlaps {}",
                    name,
                    start,
                    range.end(),
                    existing.name,
                )));
            }
        }
        self.segments.push(Segment {
            range,
            name: name.to_string(),
            kind,
            sections: Vec::new(),
        });
        Ok(())
    }

    /// Assigns a section to the unique segment that fully contains it.
    /// Zero-sized sections are silently skipped.
    pub fn add_section(&mut self, name: &str, start: u64, end: u64) -> Result<()> {
        if end <= start {
            return Ok(());
        }
        let range = Range::new(start, end - start);
        for segment in &mut self.segments {
            if segment.range.includes(&range) {
                return segment.add_section(Section {
                    range,
                    name: name.to_string(),
                });
            }
        }
        Err(NxoError::LayoutConsistency(format!(
            "no containing segment for section {} [0x{:X}, 0x{:X})",
            name, start, end
        )))
    }

    /// Sorts segments and sections by start address and fills every gap with
    /// a synthetic section named after the segment (numeric suffix per gap).
    /// The result tiles the union of all segment ranges exactly.
    pub fn flatten(mut self) -> Vec<SectionInfo> {
        self.segments.sort_by_key(|s| s.range.start);
        let mut parts = Vec::new();
        for segment in &mut self.segments {
            segment.sections.sort_by_key(|s| s.range.start);
            let mut suffix = 0;
            let mut pos = segment.range.start;
            for section in &segment.sections {
                if pos < section.range.start {
                    parts.push(SectionInfo {
                        start: pos,
                        end: section.range.start,
                        name: suffixed_name(&segment.name, suffix),
                        kind: segment.kind,
                    });
                    suffix += 1;
                }
                parts.push(SectionInfo {
                    start: section.range.start,
                    end: section.range.end(),
                    name: section.name.clone(),
                    kind: segment.kind,
                });
                pos = section.range.end();
            }
            if pos < segment.range.end() {
                parts.push(SectionInfo {
                    start: pos,
                    end: segment.range.end(),
                    name: suffixed_name(&segment.name, suffix),
                    kind: segment.kind,
                });
            }
        }
        parts
    }
}
