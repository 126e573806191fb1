//! Hand-off of completed objects to the downstream consumer.

use crate::common::lct::Cenc;
use crate::common::udpendpoint::UDPEndpoint;
use crate::tools::error::Result;
use std::time::SystemTime;

mod objectwriterbuffer;
mod objectwriterfs;

pub use objectwriterbuffer::{ObjectWriterBuffer, ObjectWriterBufferBuilder};
pub use objectwriterfs::ObjectWriterFSBuilder;

/// Metadata attached to a completed object.
///
/// When the object completed without any matching FDT entry (length learnt
/// from EXT_FTI only), a synthetic entry is emitted with `from_fdt` false and
/// a location derived from the TOI.
#[derive(Clone, Debug)]
pub struct ObjectMetadata {
    /// Content location from the FDT entry, or `toi-<toi>` when synthetic.
    pub content_location: String,
    /// Size of the file after content decoding, when advertised.
    pub content_length: Option<u64>,
    /// Exact size of the transport object.
    pub transfer_length: u64,
    pub content_type: Option<String>,
    /// Content encoding the object was delivered with.
    pub cenc: Cenc,
    /// Base64 MD5 digest advertised by the FDT, when present.
    pub content_md5: Option<String>,
    /// False when no FDT entry described this object.
    pub from_fdt: bool,
}

/// Consumer of one completed object.
pub trait ObjectWriter {
    /// Called once before any data is written.
    fn open(&self, now: SystemTime) -> Result<()>;
    /// Receives the reconstructed (and content-decoded) object bytes.
    fn write(&self, data: &[u8], now: SystemTime) -> Result<()>;
    /// The object was delivered in full.
    fn complete(&self, now: SystemTime);
    /// Reconstruction failed after `open` (decoding error, MD5 mismatch).
    fn error(&self, now: SystemTime);
    /// True when the consumer wants Content-MD5 verification.
    fn enable_md5_check(&self) -> bool;
}

/// Decision of the builder for a completed object.
pub enum ObjectWriterBuilderResult {
    /// Deliver the object to this writer.
    StoreObject(Box<dyn ObjectWriter>),
    /// Drop the object silently.
    Skip,
}

/// Creates writers for completed objects, one per object.
pub trait ObjectWriterBuilder {
    fn new_object_writer(
        &self,
        endpoint: &UDPEndpoint,
        tsi: u64,
        toi: u128,
        meta: &ObjectMetadata,
        now: SystemTime,
    ) -> ObjectWriterBuilderResult;

    /// Notification that an FDT instance completed, with its raw XML body.
    fn fdt_received(
        &self,
        endpoint: &UDPEndpoint,
        tsi: u64,
        fdt_xml: &str,
        expires: Option<SystemTime>,
        now: SystemTime,
    );
}
