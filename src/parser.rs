//! Goblin-based MZ executable parser.

use std::collections::BTreeMap;
use std::fmt;

use goblin::pe::header::{DosHeader, DOS_MAGIC};
use log::debug;

use crate::{Address, AnalysisError};

/// Minimum length of a printable run reported as a string.
const MIN_STRING_LEN: usize = 4;

/// Segment role inside the load image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    Data,
}

/// A region of the executable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    /// File offset of the first byte
    pub start: Address,
    pub size: usize,
    pub kind: SegmentKind,
}

impl Segment {
    pub fn new(name: &str, start: Address, size: usize, kind: SegmentKind) -> Self {
        Self {
            name: name.to_string(),
            start,
            size,
            kind,
        }
    }

    /// Slice this segment out of the full file image.
    pub fn data<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        let start = self.start as usize;
        let end = (start + self.size).min(image.len());
        &image[start.min(image.len())..end]
    }
}

/// A parsed MZ executable: header fields, segments, and extracted strings.
#[derive(Debug, Clone)]
pub struct MzImage {
    pub header: DosHeader,
    /// File size in bytes
    pub file_size: usize,
    /// Linear entry point: (cs << 4) + ip
    pub entry_point: Address,
    /// Header size in bytes (paragraph count * 16)
    pub header_size: usize,
    pub segments: Vec<Segment>,
    /// Printable ASCII runs in the code segment, keyed by file offset
    pub strings: BTreeMap<Address, String>,
}

impl MzImage {
    /// The code segment (always present after a successful parse).
    pub fn code_segment(&self) -> &Segment {
        self.segments
            .iter()
            .find(|s| s.kind == SegmentKind::Code)
            .expect("MzImage always has a code segment")
    }

    /// Human-readable header dump for the report output.
    pub fn header_report(&self) -> String {
        let h = &self.header;
        let mut out = String::new();
        out.push_str("MZ Header\n");
        out.push_str("=========\n");
        out.push_str(&format!("File size:            {} bytes\n", self.file_size));
        out.push_str(&format!("Last page size:       {}\n", h.bytes_on_last_page));
        out.push_str(&format!("Pages in file:        {}\n", h.pages_in_file));
        out.push_str(&format!("Relocations:          {}\n", h.relocations));
        out.push_str(&format!(
            "Header size:          {} paragraphs ({} bytes)\n",
            h.size_of_header_in_paragraphs, self.header_size
        ));
        out.push_str(&format!("Min extra paragraphs: {}\n", h.minimum_extra_paragraphs_needed));
        out.push_str(&format!("Max extra paragraphs: {}\n", h.maximum_extra_paragraphs_needed));
        out.push_str(&format!("Initial SS:SP:        {:04X}:{:04X}\n", h.initial_relative_ss, h.initial_sp));
        out.push_str(&format!("Initial CS:IP:        {:04X}:{:04X}\n", h.initial_relative_cs, h.initial_ip));
        out.push_str(&format!("Entry point:          0x{:08X}\n", self.entry_point));
        out.push_str(&format!("Overlay number:       {}\n", h.overlay_number));
        out
    }
}

/// Parser for 16-bit DOS MZ executables.
#[derive(Debug, Default)]
pub struct MzParser;

impl MzParser {
    pub fn new() -> Self {
        MzParser
    }

    /// Parse the MZ header and lay out segments.
    ///
    /// A missing or wrong signature is the only fatal condition in the
    /// whole pipeline.
    pub fn parse(&self, image: &[u8]) -> Result<MzImage, AnalysisError> {
        let header = Self::parse_header(image)?;

        let file_size = image.len();
        let header_size = header.size_of_header_in_paragraphs as usize * 16;
        if header_size >= file_size {
            return Err(AnalysisError::InvalidImage(format!(
                "header size {header_size} exceeds file size {file_size}"
            )));
        }

        let entry_point =
            ((header.initial_relative_cs as Address) << 4) + header.initial_ip as Address;
        debug!(
            "MZ header parsed: entry point 0x{:08X}, header {} bytes",
            entry_point, header_size
        );

        // Everything after the header is treated as code; the relocation
        // table and header padding become the data segment.
        let segments = vec![
            Segment::new(
                "CODE",
                header_size as Address,
                file_size - header_size,
                SegmentKind::Code,
            ),
            Segment::new("DATA", 0, header_size, SegmentKind::Data),
        ];

        let mut mz = MzImage {
            header,
            file_size,
            entry_point,
            header_size,
            segments,
            strings: BTreeMap::new(),
        };
        mz.strings = find_strings(&mz, image);
        Ok(mz)
    }

    /// Read the 28 MZ header bytes into goblin's `DosHeader`.
    ///
    /// `DosHeader::parse` insists on a valid PE signature behind
    /// `pe_pointer`; a plain DOS executable has no PE header and the
    /// bytes at 0x3C are arbitrary, so the fields are read directly.
    fn parse_header(image: &[u8]) -> Result<DosHeader, AnalysisError> {
        const MZ_HEADER_LEN: usize = 28;
        if image.len() < MZ_HEADER_LEN {
            return Err(AnalysisError::InvalidImage(format!(
                "{} bytes is too small for an MZ header",
                image.len()
            )));
        }
        let word = |off: usize| u16::from_le_bytes([image[off], image[off + 1]]);

        let signature = word(0);
        if signature != DOS_MAGIC {
            return Err(AnalysisError::InvalidImage(format!(
                "bad signature 0x{signature:04X}"
            )));
        }

        Ok(DosHeader {
            signature,
            bytes_on_last_page: word(2),
            pages_in_file: word(4),
            relocations: word(6),
            size_of_header_in_paragraphs: word(8),
            minimum_extra_paragraphs_needed: word(10),
            maximum_extra_paragraphs_needed: word(12),
            initial_relative_ss: word(14),
            initial_sp: word(16),
            checksum: word(18),
            initial_ip: word(20),
            initial_relative_cs: word(22),
            file_address_of_relocation_table: word(24),
            overlay_number: word(26),
            ..DosHeader::default()
        })
    }
}

impl fmt::Display for MzParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MzParser")
    }
}

/// Collect printable ASCII runs of at least `MIN_STRING_LEN` bytes from the
/// code segment, keyed by absolute file offset.
fn find_strings(mz: &MzImage, image: &[u8]) -> BTreeMap<Address, String> {
    let mut strings = BTreeMap::new();
    for segment in &mz.segments {
        if segment.kind != SegmentKind::Code {
            continue;
        }
        let data = segment.data(image);
        let mut current = String::new();
        let mut start = 0usize;
        for (i, &byte) in data.iter().enumerate() {
            if (0x20..=0x7E).contains(&byte) {
                if current.is_empty() {
                    start = i;
                }
                current.push(byte as char);
            } else {
                if current.len() >= MIN_STRING_LEN {
                    strings.insert(segment.start + start as Address, current.clone());
                }
                current.clear();
            }
        }
        if current.len() >= MIN_STRING_LEN {
            strings.insert(segment.start + start as Address, current);
        }
    }
    strings
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal MZ image: 64-byte header (4 paragraphs) plus payload.
    pub(crate) fn synthetic_mz(cs: u16, ip: u16, payload: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 64];
        image[0] = b'M';
        image[1] = b'Z';
        image[8] = 4; // header size in paragraphs
        image[20..22].copy_from_slice(&ip.to_le_bytes());
        image[22..24].copy_from_slice(&cs.to_le_bytes());
        image.extend_from_slice(payload);
        image
    }

    #[test]
    fn test_rejects_non_mz_buffer() {
        let parser = MzParser::new();
        let err = parser.parse(&[0u8; 128]).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidImage(_)));
    }

    #[test]
    fn test_entry_point_from_cs_ip() {
        let image = synthetic_mz(0x0001, 0x0010, &[0xC3]);
        let mz = MzParser::new().parse(&image).unwrap();
        assert_eq!(mz.entry_point, 0x20);
        assert_eq!(mz.header_size, 64);
    }

    #[test]
    fn test_segment_layout() {
        let image = synthetic_mz(0, 0, &[0x90, 0x90, 0xC3]);
        let mz = MzParser::new().parse(&image).unwrap();
        let code = mz.code_segment();
        assert_eq!(code.start, 64);
        assert_eq!(code.size, 3);
        assert_eq!(code.data(&image), &[0x90, 0x90, 0xC3]);
        let data = mz.segments.iter().find(|s| s.kind == SegmentKind::Data).unwrap();
        assert_eq!(data.start, 0);
        assert_eq!(data.size, 64);
    }

    #[test]
    fn test_find_strings_minimum_length() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"\x00ABC\x00");      // too short
        payload.extend_from_slice(b"TITLE.PC8\x00");    // reported
        payload.extend_from_slice(b"HI\x00");           // too short
        let image = synthetic_mz(0, 0, &payload);
        let mz = MzParser::new().parse(&image).unwrap();
        let values: Vec<&str> = mz.strings.values().map(String::as_str).collect();
        assert_eq!(values, vec!["TITLE.PC8"]);
        // keyed by absolute file offset
        assert_eq!(*mz.strings.keys().next().unwrap(), 64 + 5);
    }

    #[test]
    fn test_parses_mz_without_pe_header() {
        // a real DOS program has no PE header; the dword at 0x3C is
        // whatever the linker left there
        let mut image = synthetic_mz(0, 0x0010, &[0xC3]);
        image[0x3C..0x40].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        image[10] = 0x11; // minimum extra paragraphs
        image[12] = 0x22; // maximum extra paragraphs

        let mz = MzParser::new().parse(&image).unwrap();
        assert_eq!(mz.entry_point, 0x10);
        assert_eq!(mz.header.minimum_extra_paragraphs_needed, 0x11);
        assert_eq!(mz.header.maximum_extra_paragraphs_needed, 0x22);
        let report = mz.header_report();
        assert!(report.contains("Min extra paragraphs: 17"));
        assert!(report.contains("Max extra paragraphs: 34"));
    }

    #[test]
    fn test_truncated_header_is_fatal() {
        let err = MzParser::new().parse(b"MZ").unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidImage(_)));
    }

    #[test]
    fn test_header_size_larger_than_file_is_fatal() {
        let mut image = vec![0u8; 64];
        image[0] = b'M';
        image[1] = b'Z';
        image[8] = 0xFF; // 255 paragraphs, way past EOF
        let err = MzParser::new().parse(&image).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidImage(_)));
    }
}
