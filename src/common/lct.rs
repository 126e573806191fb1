//! LCT (Layered Coding Transport, RFC 5651) header decoding.
//!
//! The LCT header delimits the fixed fields (CCI, TSI, TOI), the extension
//! header region and the packet payload. Parsing is a pure function over the
//! datagram bytes, no state is touched.

use crate::tools::error::{FluteError, Result};

/// EXT_FDT, announces the FDT instance this packet belongs to (RFC 3926).
pub const EXT_FDT: u8 = 192;
/// EXT_CENC, in-band content encoding of the FDT instance (RFC 3926).
pub const EXT_CENC: u8 = 193;
/// EXT_FTI, FEC Object Transmission Information (RFC 5052).
pub const EXT_FTI: u8 = 64;

/// Content encoding applied to a transport object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cenc {
    /// No encoding, symbols carry the object bytes directly.
    Null = 0,
    /// RFC 1950
    Zlib = 1,
    /// RFC 1951
    Deflate = 2,
    /// RFC 1952
    Gzip = 3,
}

impl TryFrom<u8> for Cenc {
    type Error = FluteError;

    fn try_from(value: u8) -> Result<Cenc> {
        match value {
            0 => Ok(Cenc::Null),
            1 => Ok(Cenc::Zlib),
            2 => Ok(Cenc::Deflate),
            3 => Ok(Cenc::Gzip),
            _ => Err(FluteError::new(format!("unknown Cenc code {}", value))),
        }
    }
}

impl Cenc {
    /// Map an FDT `Content-Encoding` attribute to a codec, `None` when the
    /// scheme is not one we can decode.
    pub fn from_content_encoding(name: &str) -> Option<Cenc> {
        match name {
            "null" => Some(Cenc::Null),
            "zlib" => Some(Cenc::Zlib),
            "deflate" => Some(Cenc::Deflate),
            "gzip" => Some(Cenc::Gzip),
            _ => None,
        }
    }
}

/// Decoded fixed portion of an LCT header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LCTHeader {
    /// Total header length in bytes (HDR_LEN * 4).
    pub len: usize,
    /// Congestion Control Information.
    pub cci: u128,
    /// Transport Session Identifier.
    pub tsi: u64,
    /// Transport Object Identifier.
    pub toi: u128,
    /// Codepoint. For ALC this carries the FEC Encoding ID.
    pub cp: u8,
    /// Close Object flag (B), the sender will not send more packets for this TOI.
    pub close_object: bool,
    /// Close Session flag (A), the sender is about to stop the session.
    pub close_session: bool,
    /// Byte offset of the first extension header within the packet.
    pub header_ext_offset: usize,
}

/// LCT protocol version implemented here.
const LCT_VERSION: u8 = 1;
/// Fixed part of the header: flags word, HDR_LEN, codepoint.
const LCT_MIN_LEN: usize = 4;

/// Iterator over the extension headers delimited by an already-validated
/// `LCTHeader`. Yields `(HET, full extension slice)` pairs, HET byte included.
pub struct ExtIter<'a> {
    data: &'a [u8],
    offset: usize,
    end: usize,
}

impl<'a> ExtIter<'a> {
    pub fn new(data: &'a [u8], lct: &LCTHeader) -> Self {
        ExtIter {
            data,
            offset: lct.header_ext_offset,
            end: lct.len,
        }
    }
}

impl<'a> Iterator for ExtIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        // parse_lct_header() already checked the list is well formed
        let het = self.data[self.offset];
        let len = ext_len(self.data, self.offset);
        let ext = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some((het, ext))
    }
}

/// Length in bytes of the extension starting at `offset`. HET >= 128 means a
/// fixed 32-bit extension, otherwise the second byte carries HEL in 32-bit
/// words.
fn ext_len(data: &[u8], offset: usize) -> usize {
    match data[offset] {
        het if het >= 128 => 4,
        _ => data[offset + 1] as usize * 4,
    }
}

/// Parse the LCT header of a datagram.
///
/// Unknown extension type codes are tolerated (skipped by their declared
/// length); any structural inconsistency yields `MalformedHeader` and the
/// packet should be discarded.
pub fn parse_lct_header(data: &[u8]) -> Result<LCTHeader> {
    if data.len() < LCT_MIN_LEN {
        return Err(FluteError::MalformedHeader(format!(
            "packet too short for LCT header ({} bytes)",
            data.len()
        )));
    }

    let version = data[0] >> 4;
    if version != LCT_VERSION {
        return Err(FluteError::MalformedHeader(format!(
            "unsupported LCT version {}",
            version
        )));
    }

    let c = ((data[0] >> 2) & 0x3) as usize;
    let s = ((data[1] >> 7) & 0x1) as usize;
    let o = ((data[1] >> 5) & 0x3) as usize;
    let h = ((data[1] >> 4) & 0x1) as usize;
    let res = (data[1] >> 2) & 0x3;
    let close_session = (data[1] >> 1) & 0x1 == 1;
    let close_object = data[1] & 0x1 == 1;

    if res != 0 {
        return Err(FluteError::MalformedHeader(
            "reserved bits are not zero".to_owned(),
        ));
    }

    let len = data[2] as usize * 4;
    let cp = data[3];

    if len < LCT_MIN_LEN {
        return Err(FluteError::MalformedHeader(format!(
            "declared header length {} below minimum",
            len
        )));
    }
    if len > data.len() {
        return Err(FluteError::MalformedHeader(format!(
            "declared header length {} exceeds packet length {}",
            len,
            data.len()
        )));
    }

    let cci_len = (c + 1) * 4;
    let tsi_len = s * 4 + h * 2;
    let toi_len = o * 4 + h * 2;

    let mut offset = LCT_MIN_LEN;
    if offset + cci_len + tsi_len + toi_len > len {
        return Err(FluteError::MalformedHeader(
            "CCI/TSI/TOI fields overrun the declared header length".to_owned(),
        ));
    }

    let cci = read_be(&data[offset..offset + cci_len]);
    offset += cci_len;
    let tsi = read_be(&data[offset..offset + tsi_len]) as u64;
    offset += tsi_len;
    let toi = read_be(&data[offset..offset + toi_len]);
    offset += toi_len;

    validate_extensions(data, offset, len)?;

    Ok(LCTHeader {
        len,
        cci,
        tsi,
        toi,
        cp,
        close_object,
        close_session,
        header_ext_offset: offset,
    })
}

/// Locate an extension with the given HET within the header region.
/// Returns the full extension slice (HET byte included) when present.
pub fn get_ext<'a>(data: &'a [u8], lct: &LCTHeader, het: u8) -> Option<&'a [u8]> {
    ExtIter::new(data, lct).find(|(t, _)| *t == het).map(|(_, e)| e)
}

/// Big-endian read of up to 16 bytes. Zero-width fields read as 0.
fn read_be(bytes: &[u8]) -> u128 {
    bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128)
}

/// Walk the extension list once, checking that every extension fits inside
/// the declared header length and that no variable extension declares HEL 0.
fn validate_extensions(data: &[u8], start: usize, end: usize) -> Result<()> {
    let mut offset = start;
    while offset < end {
        let het = data[offset];
        let len = if het >= 128 {
            4
        } else {
            if offset + 1 >= end {
                return Err(FluteError::MalformedHeader(format!(
                    "extension HET {} truncated",
                    het
                )));
            }
            let hel = data[offset + 1] as usize * 4;
            if hel == 0 {
                return Err(FluteError::MalformedHeader(format!(
                    "extension HET {} declares HEL 0",
                    het
                )));
            }
            hel
        };
        if offset + len > end {
            return Err(FluteError::MalformedHeader(format!(
                "extension HET {} overruns the header (offset {} len {} end {})",
                het, offset, len, end
            )));
        }
        offset += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn parse_reference_datagram() {
        // V=1, S=1 O=1, HDR_LEN 9 words, CP 0, CCI 0, TSI 1, TOI 2,
        // EXT_FDT (V1, instance 3), EXT_FTI for a 16-byte object
        let pkt = hex!(
            "10 a0 09 00"
            "00 00 00 00"
            "00 00 00 01"
            "00 00 00 02"
            "c0 10 00 03"
            "40 04 0000 00000010"
            "0000 0010 00000000"
            "deadbeef"
        );
        let lct = parse_lct_header(&pkt).unwrap();
        assert_eq!(lct.tsi, 1);
        assert_eq!(lct.toi, 2);
        assert_eq!(lct.len, 36);
        assert_eq!(lct.header_ext_offset, 16);
        assert_eq!(
            get_ext(&pkt, &lct, EXT_FDT).unwrap(),
            &hex!("c0 10 00 03")
        );
        assert_eq!(get_ext(&pkt, &lct, EXT_FTI).unwrap().len(), 16);
        assert_eq!(&pkt[lct.len..], &hex!("deadbeef"));
    }

    /// Build a minimal LCT header: 32-bit CCI, 32-bit TSI, 32-bit TOI,
    /// followed by the given extension bytes and payload.
    fn build_packet(tsi: u32, toi: u32, exts: &[u8], payload: &[u8]) -> Vec<u8> {
        assert_eq!(exts.len() % 4, 0);
        let hdr_len = 16 + exts.len();
        let mut pkt = Vec::new();
        pkt.push(0x10); // V=1 C=0 PSI=0
        pkt.push(0xa0); // S=1 O=1 H=0 Res=0 A=0 B=0
        pkt.push((hdr_len / 4) as u8);
        pkt.push(0); // codepoint 0
        pkt.extend_from_slice(&0u32.to_be_bytes()); // CCI
        pkt.extend_from_slice(&tsi.to_be_bytes());
        pkt.extend_from_slice(&toi.to_be_bytes());
        pkt.extend_from_slice(exts);
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn parse_minimal_header() {
        let pkt = build_packet(42, 7, &[], b"payload");
        let lct = parse_lct_header(&pkt).unwrap();
        assert_eq!(lct.tsi, 42);
        assert_eq!(lct.toi, 7);
        assert_eq!(lct.len, 16);
        assert_eq!(lct.header_ext_offset, 16);
        assert!(!lct.close_object);
        assert!(!lct.close_session);
    }

    #[test]
    fn parse_wide_toi() {
        // O=2 H=1 -> 48-bit TSI, 80-bit TOI
        let mut pkt = vec![0x10, 0xd0, 0, 0];
        pkt.extend_from_slice(&0u32.to_be_bytes()); // CCI
        pkt.extend_from_slice(&[0, 0, 0, 0, 0x12, 0x34]); // TSI 48 bits
        pkt.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0xab, 0xcd]); // TOI 80 bits
        pkt[2] = (pkt.len() / 4) as u8;
        let lct = parse_lct_header(&pkt).unwrap();
        assert_eq!(lct.tsi, 0x1234);
        assert_eq!(lct.toi, 0xabcd);
    }

    #[test]
    fn reject_short_packet() {
        assert!(matches!(
            parse_lct_header(&[0x10, 0x00]),
            Err(FluteError::MalformedHeader(_))
        ));
    }

    #[test]
    fn reject_bad_version() {
        let mut pkt = build_packet(1, 1, &[], &[]);
        pkt[0] = 0x20;
        assert!(matches!(
            parse_lct_header(&pkt),
            Err(FluteError::MalformedHeader(_))
        ));
    }

    #[test]
    fn reject_reserved_bits() {
        let mut pkt = build_packet(1, 1, &[], &[]);
        pkt[1] |= 0x04;
        assert!(matches!(
            parse_lct_header(&pkt),
            Err(FluteError::MalformedHeader(_))
        ));
    }

    #[test]
    fn reject_header_longer_than_packet() {
        let mut pkt = build_packet(1, 1, &[], &[]);
        pkt[2] = 0xff;
        assert!(matches!(
            parse_lct_header(&pkt),
            Err(FluteError::MalformedHeader(_))
        ));
    }

    #[test]
    fn reject_extension_overrun() {
        // variable-length extension declaring more words than the header holds
        let exts = [0x40, 0x08, 0x00, 0x00];
        let pkt = build_packet(1, 1, &exts, &[]);
        assert!(matches!(
            parse_lct_header(&pkt),
            Err(FluteError::MalformedHeader(_))
        ));
    }

    #[test]
    fn reject_extension_hel_zero() {
        let exts = [0x40, 0x00, 0x00, 0x00];
        let pkt = build_packet(1, 1, &exts, &[]);
        assert!(matches!(
            parse_lct_header(&pkt),
            Err(FluteError::MalformedHeader(_))
        ));
    }

    #[test]
    fn skip_unknown_extension() {
        // HET 200 (fixed 32-bit, unknown) followed by EXT_FDT
        let exts = [200, 0xaa, 0xbb, 0xcc, EXT_FDT, 0x10, 0x00, 0x05];
        let pkt = build_packet(1, 0, &exts, b"x");
        let lct = parse_lct_header(&pkt).unwrap();
        let fdt = get_ext(&pkt, &lct, EXT_FDT).unwrap();
        assert_eq!(fdt, &[EXT_FDT, 0x10, 0x00, 0x05]);
        assert!(get_ext(&pkt, &lct, EXT_FTI).is_none());
    }

    #[test]
    fn close_flags() {
        let mut pkt = build_packet(1, 1, &[], &[]);
        pkt[1] |= 0x03;
        let lct = parse_lct_header(&pkt).unwrap();
        assert!(lct.close_object);
        assert!(lct.close_session);
    }
}
