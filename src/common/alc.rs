//! ALC packet decoding (RFC 5775): the LCT header plus the extension headers
//! relevant to file reconstruction and the FEC payload ID.
//!
//! Only FEC Encoding ID 0 (Compact No-Code) is handled here. FEC-encoded
//! sessions are repaired by an external collaborator which hands this core
//! fully recovered source symbols.

use super::lct::{self, Cenc, LCTHeader};
use crate::tools::error::{FluteError, Result};

/// FEC Encoding ID accepted in the LCT codepoint field.
const FEC_ENCODING_ID_NO_CODE: u8 = 0;

/// EXT_FDT, association of a packet with an FDT instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtFDT {
    /// FLUTE version advertised by the sender.
    pub version: u8,
    /// FDT instance ID, 20 bits, wraps modulo 2^20.
    pub fdt_instance_id: u32,
}

/// EXT_FTI for FEC Encoding ID 0 (RFC 5052).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtFTI {
    /// Exact object length in bytes, 48 bits on the wire. This full-width
    /// field is authoritative for sizing the reconstruction buffer.
    pub transfer_length: u64,
    /// FEC Instance ID, reserved for under-specified schemes.
    pub fec_instance_id: u16,
    /// Length of every encoding symbol except possibly the last one.
    pub encoding_symbol_length: u16,
    /// Number of source symbols per source block.
    pub maximum_source_block_length: u32,
}

/// FEC payload ID for FEC Encoding ID 0: source block number and encoding
/// symbol ID, 16 bits each.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadID {
    pub sbn: u32,
    pub esi: u32,
}

impl PayloadID {
    /// Flat source-symbol index within the whole object. With a known block
    /// length the ESI restarts at every block boundary, without one the ESI
    /// already addresses the whole object. Widened to `u64`: both factors are
    /// wire-controlled and their product does not fit in `u32`.
    pub fn flat_esi(&self, maximum_source_block_length: u32) -> u64 {
        match maximum_source_block_length {
            0 => self.esi as u64,
            msbl => self.sbn as u64 * msbl as u64 + self.esi as u64,
        }
    }
}

/// An extension the interpreter does not know. Preserved for forward
/// compatibility, never an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownExt<'a> {
    pub het: u8,
    pub data: &'a [u8],
}

/// One decoded ALC/LCT packet. Borrows the datagram, lives for the duration
/// of processing that packet.
#[derive(Debug)]
pub struct AlcPkt<'a> {
    pub lct: LCTHeader,
    /// FDT instance association, present on FDT packets (TOI 0).
    pub fdt: Option<ExtFDT>,
    /// FEC transfer information when delivered in-band.
    pub fti: Option<ExtFTI>,
    /// In-band content encoding (EXT_CENC).
    pub cenc: Option<Cenc>,
    /// Extensions with unrecognized type codes, raw.
    pub unknown_exts: Vec<UnknownExt<'a>>,
    /// FEC payload ID, absent on header-only packets (e.g. close-session).
    pub payload_id: Option<PayloadID>,
    /// The whole datagram.
    pub data: &'a [u8],
    /// Offset of the encoding symbol(s) within `data`.
    pub data_payload_offset: usize,
}

impl<'a> AlcPkt<'a> {
    /// Encoding symbol bytes carried by this packet.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.data_payload_offset..]
    }
}

/// Decode a raw datagram into an `AlcPkt`.
pub fn parse_alc_pkt(data: &[u8]) -> Result<AlcPkt<'_>> {
    let lct = lct::parse_lct_header(data)?;

    if lct.cp != FEC_ENCODING_ID_NO_CODE {
        return Err(FluteError::MalformedHeader(format!(
            "unsupported FEC Encoding ID {} in codepoint",
            lct.cp
        )));
    }

    let mut fdt = None;
    let mut fti = None;
    let mut cenc = None;
    let mut unknown_exts = Vec::new();

    for (het, ext) in lct::ExtIter::new(data, &lct) {
        match het {
            lct::EXT_FDT => fdt = Some(parse_ext_fdt(ext)?),
            lct::EXT_FTI => fti = Some(parse_ext_fti(ext)?),
            lct::EXT_CENC => cenc = Some(parse_ext_cenc(ext)?),
            _ => unknown_exts.push(UnknownExt { het, data: ext }),
        }
    }

    let remaining = data.len() - lct.len;
    let (payload_id, data_payload_offset) = match remaining {
        0 => (None, data.len()),
        1..=3 => {
            return Err(FluteError::MalformedHeader(
                "truncated FEC payload ID".to_owned(),
            ))
        }
        _ => {
            let sbn = u16::from_be_bytes([data[lct.len], data[lct.len + 1]]) as u32;
            let esi = u16::from_be_bytes([data[lct.len + 2], data[lct.len + 3]]) as u32;
            (Some(PayloadID { sbn, esi }), lct.len + 4)
        }
    };

    Ok(AlcPkt {
        lct,
        fdt,
        fti,
        cenc,
        unknown_exts,
        payload_id,
        data,
        data_payload_offset,
    })
}

fn parse_ext_fdt(ext: &[u8]) -> Result<ExtFDT> {
    if ext.len() != 4 {
        return Err(FluteError::UnsupportedExtension {
            het: lct::EXT_FDT,
            len: ext.len(),
        });
    }
    let version = ext[1] >> 4;
    let fdt_instance_id =
        ((ext[1] as u32 & 0xF) << 16) | ((ext[2] as u32) << 8) | ext[3] as u32;
    Ok(ExtFDT {
        version,
        fdt_instance_id,
    })
}

fn parse_ext_fti(ext: &[u8]) -> Result<ExtFTI> {
    // HET + HEL + Transfer-Length(48) + FEC Instance ID(16)
    // + Encoding Symbol Length(16) + Maximum Source Block Length(32)
    if ext.len() != 16 {
        return Err(FluteError::UnsupportedExtension {
            het: lct::EXT_FTI,
            len: ext.len(),
        });
    }
    let transfer_length = ((ext[2] as u64) << 40)
        | ((ext[3] as u64) << 32)
        | ((ext[4] as u64) << 24)
        | ((ext[5] as u64) << 16)
        | ((ext[6] as u64) << 8)
        | ext[7] as u64;
    let fec_instance_id = u16::from_be_bytes([ext[8], ext[9]]);
    let encoding_symbol_length = u16::from_be_bytes([ext[10], ext[11]]);
    let maximum_source_block_length = u32::from_be_bytes([ext[12], ext[13], ext[14], ext[15]]);
    Ok(ExtFTI {
        transfer_length,
        fec_instance_id,
        encoding_symbol_length,
        maximum_source_block_length,
    })
}

fn parse_ext_cenc(ext: &[u8]) -> Result<Cenc> {
    if ext.len() != 4 {
        return Err(FluteError::UnsupportedExtension {
            het: lct::EXT_CENC,
            len: ext.len(),
        });
    }
    Cenc::try_from(ext[1]).map_err(|_| FluteError::UnsupportedExtension {
        het: lct::EXT_CENC,
        len: ext.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tsi: u32, toi: u32, exts: &[u8]) -> Vec<u8> {
        let hdr_len = 16 + exts.len();
        let mut pkt = vec![0x10, 0xa0, (hdr_len / 4) as u8, 0];
        pkt.extend_from_slice(&0u32.to_be_bytes());
        pkt.extend_from_slice(&tsi.to_be_bytes());
        pkt.extend_from_slice(&toi.to_be_bytes());
        pkt.extend_from_slice(exts);
        pkt
    }

    fn ext_fti(transfer_length: u64, esl: u16, msbl: u32) -> Vec<u8> {
        let mut ext = vec![lct::EXT_FTI, 4];
        ext.extend_from_slice(&transfer_length.to_be_bytes()[2..]);
        ext.extend_from_slice(&0u16.to_be_bytes());
        ext.extend_from_slice(&esl.to_be_bytes());
        ext.extend_from_slice(&msbl.to_be_bytes());
        ext
    }

    #[test]
    fn parse_fdt_packet() {
        let mut exts = vec![lct::EXT_FDT, 0x10, 0x00, 0x2a]; // V=1 instance 42
        exts.extend_from_slice(&[lct::EXT_CENC, 0x03, 0, 0]); // gzip
        exts.extend_from_slice(&ext_fti(1200, 512, 0));
        let mut pkt = header(1, 0, &exts);
        pkt.extend_from_slice(&[0, 0, 0, 0]); // SBN 0, ESI 0
        pkt.extend_from_slice(b"fdt body");

        let alc = parse_alc_pkt(&pkt).unwrap();
        assert_eq!(
            alc.fdt,
            Some(ExtFDT {
                version: 1,
                fdt_instance_id: 42
            })
        );
        assert_eq!(alc.cenc, Some(Cenc::Gzip));
        let fti = alc.fti.unwrap();
        assert_eq!(fti.transfer_length, 1200);
        assert_eq!(fti.encoding_symbol_length, 512);
        assert_eq!(alc.payload_id, Some(PayloadID { sbn: 0, esi: 0 }));
        assert_eq!(alc.payload(), b"fdt body");
    }

    #[test]
    fn parse_large_transfer_length() {
        // 48-bit field, above the 32-bit range
        let exts = ext_fti(0x1_0000_0001, 1400, 0);
        let mut pkt = header(1, 3, &exts);
        pkt.extend_from_slice(&[0, 0, 0, 5]);
        let alc = parse_alc_pkt(&pkt).unwrap();
        assert_eq!(alc.fti.unwrap().transfer_length, 0x1_0000_0001);
        assert_eq!(alc.payload_id.unwrap().esi, 5);
    }

    #[test]
    fn unknown_extension_preserved() {
        let exts = [150, 1, 0xde, 0xad];
        let mut pkt = header(1, 3, &exts);
        pkt.extend_from_slice(&[0, 0, 0, 0]);
        let alc = parse_alc_pkt(&pkt).unwrap();
        assert_eq!(alc.unknown_exts.len(), 1);
        assert_eq!(alc.unknown_exts[0].het, 150);
        assert_eq!(alc.unknown_exts[0].data, &[150, 1, 0xde, 0xad]);
    }

    #[test]
    fn reject_bad_fti_layout() {
        // EXT_FTI with HEL 2 (8 bytes), valid LCT but wrong FTI size
        let exts = [lct::EXT_FTI, 2, 0, 0, 0, 0, 0, 0];
        let mut pkt = header(1, 3, &exts);
        pkt.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            parse_alc_pkt(&pkt),
            Err(FluteError::UnsupportedExtension { het, .. }) if het == lct::EXT_FTI
        ));
    }

    #[test]
    fn reject_unknown_codepoint() {
        let mut pkt = header(1, 3, &[]);
        pkt[3] = 6; // RaptorQ, handled by an external repair stage
        pkt.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            parse_alc_pkt(&pkt),
            Err(FluteError::MalformedHeader(_))
        ));
    }

    #[test]
    fn reject_truncated_payload_id() {
        let mut pkt = header(1, 3, &[]);
        pkt.extend_from_slice(&[0, 0]);
        assert!(matches!(
            parse_alc_pkt(&pkt),
            Err(FluteError::MalformedHeader(_))
        ));
    }

    #[test]
    fn header_only_packet() {
        let mut pkt = header(1, 0, &[]);
        pkt[1] |= 0x02; // close session
        let alc = parse_alc_pkt(&pkt).unwrap();
        assert!(alc.lct.close_session);
        assert!(alc.payload_id.is_none());
        assert!(alc.payload().is_empty());
    }

    #[test]
    fn flat_esi_spans_blocks() {
        let pid = PayloadID { sbn: 2, esi: 3 };
        assert_eq!(pid.flat_esi(10), 23);
        assert_eq!(pid.flat_esi(0), 3);
    }

    #[test]
    fn flat_esi_does_not_overflow_on_wire_extremes() {
        // sbn and msbl both come straight off the wire, their product
        // exceeds u32
        let pid = PayloadID {
            sbn: 0x8000,
            esi: 1,
        };
        assert_eq!(pid.flat_esi(0x20000), (1u64 << 32) + 1);
        let pid = PayloadID {
            sbn: u16::MAX as u32,
            esi: u16::MAX as u32,
        };
        assert_eq!(
            pid.flat_esi(u32::MAX),
            u16::MAX as u64 * u32::MAX as u64 + u16::MAX as u64
        );
    }
}
