//! File Delivery Table instance body, the in-band XML catalog mapping TOIs to
//! file metadata (RFC 3926 section 3.4.2).
//!
//! Only the attributes needed for reconstruction are read, the body is not
//! validated against the FLUTE schema.

use super::lct::Cenc;
use crate::tools::error::{FluteError, Result};
use crate::tools::ntp_to_system_time;
use serde::Deserialize;
use std::time::SystemTime;

/// One `FDT-Instance` element.
#[derive(Clone, Debug, Deserialize)]
pub struct FdtInstance {
    /// NTP seconds after which this instance must not be used anymore.
    #[serde(rename = "@Expires")]
    pub expires: String,
    /// True when the instance describes every file of the session.
    #[serde(rename = "@Complete")]
    pub complete: Option<bool>,
    /// Instance-level default, files may override it.
    #[serde(rename = "@Content-Type")]
    pub content_type: Option<String>,
    /// Instance-level default, files may override it.
    #[serde(rename = "@Content-Encoding")]
    pub content_encoding: Option<String>,
    /// Instance-level FEC OTI default.
    #[serde(rename = "@FEC-OTI-Encoding-Symbol-Length")]
    pub fec_oti_encoding_symbol_length: Option<u64>,
    /// Instance-level FEC OTI default.
    #[serde(rename = "@FEC-OTI-Maximum-Source-Block-Length")]
    pub fec_oti_maximum_source_block_length: Option<u64>,
    #[serde(rename = "File")]
    pub file: Option<Vec<File>>,
}

/// One `File` element of an FDT instance.
#[derive(Clone, Debug, Deserialize)]
pub struct File {
    #[serde(rename = "@Content-Location")]
    pub content_location: String,
    /// Decimal TOI, up to 112 bits.
    #[serde(rename = "@TOI")]
    pub toi: String,
    /// Size of the file after content decoding.
    #[serde(rename = "@Content-Length")]
    pub content_length: Option<u64>,
    /// Size of the transport object carrying the file.
    #[serde(rename = "@Transfer-Length")]
    pub transfer_length: Option<u64>,
    #[serde(rename = "@Content-Type")]
    pub content_type: Option<String>,
    #[serde(rename = "@Content-Encoding")]
    pub content_encoding: Option<String>,
    /// Base64 of the raw MD5 digest of the file content.
    #[serde(rename = "@Content-MD5")]
    pub content_md5: Option<String>,
    #[serde(rename = "@FEC-OTI-Encoding-Symbol-Length")]
    pub fec_oti_encoding_symbol_length: Option<u64>,
    #[serde(rename = "@FEC-OTI-Maximum-Source-Block-Length")]
    pub fec_oti_maximum_source_block_length: Option<u64>,
}

impl FdtInstance {
    /// Parse an FDT instance body.
    pub fn parse(xml: &str) -> Result<FdtInstance> {
        quick_xml::de::from_str(xml)
            .map_err(|e| FluteError::new(format!("invalid FDT instance: {}", e)))
    }

    /// Expiry of this instance, `None` when the attribute is unparsable.
    pub fn get_expiration_date(&self) -> Option<SystemTime> {
        let ntp = self.expires.trim().parse::<u64>().ok()?;
        ntp_to_system_time(ntp)
    }

    /// Find the file entry describing `toi`.
    pub fn get_file(&self, toi: u128) -> Option<&File> {
        self.file
            .as_deref()?
            .iter()
            .find(|f| f.toi().ok() == Some(toi))
    }

    /// Symbol length for `file`, file attribute first, instance default next.
    pub fn encoding_symbol_length(&self, file: &File) -> Option<u64> {
        file.fec_oti_encoding_symbol_length
            .or(self.fec_oti_encoding_symbol_length)
    }

    /// Source block length for `file`, file attribute first, instance default next.
    pub fn maximum_source_block_length(&self, file: &File) -> Option<u64> {
        file.fec_oti_maximum_source_block_length
            .or(self.fec_oti_maximum_source_block_length)
    }
}

impl File {
    /// The TOI this entry describes.
    pub fn toi(&self) -> Result<u128> {
        self.toi
            .trim()
            .parse::<u128>()
            .map_err(|e| FluteError::new(format!("invalid TOI {:?}: {}", self.toi, e)))
    }

    /// Object length on the transport, falling back to the content length
    /// when the sender omits `Transfer-Length` (identical unless the content
    /// is encoded).
    pub fn object_transfer_length(&self) -> Option<u64> {
        self.transfer_length.or(self.content_length)
    }

    /// Content encoding declared for this file.
    pub fn cenc(&self) -> Option<Cenc> {
        self.content_encoding
            .as_deref()
            .and_then(Cenc::from_content_encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FDT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<FDT-Instance xmlns="urn:ietf:params:xml:ns:fdt"
    Expires="4133980800"
    Complete="true"
    FEC-OTI-Encoding-Symbol-Length="1400">
  <File Content-Location="flute://example/files/a.bin"
        TOI="1"
        Content-Length="1000"
        Content-Type="application/octet-stream"/>
  <File Content-Location="files/b.txt.gz"
        TOI="2"
        Content-Length="420"
        Transfer-Length="260"
        Content-Encoding="gzip"
        Content-MD5="XrY7u+Ae7tCTyyK7j1rNww=="
        FEC-OTI-Encoding-Symbol-Length="100"/>
</FDT-Instance>"#;

    #[test]
    fn parse_instance() {
        let fdt = FdtInstance::parse(FDT_XML).unwrap();
        assert_eq!(fdt.complete, Some(true));
        assert!(fdt.get_expiration_date().is_some());
        let files = fdt.file.as_ref().unwrap();
        assert_eq!(files.len(), 2);

        let a = fdt.get_file(1).unwrap();
        assert_eq!(a.content_location, "flute://example/files/a.bin");
        assert_eq!(a.object_transfer_length(), Some(1000));
        assert_eq!(fdt.encoding_symbol_length(a), Some(1400));
        assert!(a.cenc().is_none());

        let b = fdt.get_file(2).unwrap();
        assert_eq!(b.object_transfer_length(), Some(260));
        assert_eq!(b.cenc(), Some(Cenc::Gzip));
        assert_eq!(fdt.encoding_symbol_length(b), Some(100));
        assert!(b.content_md5.is_some());

        assert!(fdt.get_file(3).is_none());
    }

    #[test]
    fn reject_invalid_body() {
        assert!(FdtInstance::parse("not xml at all").is_err());
        assert!(FdtInstance::parse("<FDT-Instance/>").is_err()); // missing Expires
    }
}
