//! Reception of FDT instances and the table of instances known to a session.
//!
//! The FDT body is a transport object like any other (TOI 0), so every
//! instance is reassembled through an [`ObjectReceiver`] before its XML is
//! decoded.

use super::objectreceiver::ObjectReceiver;
use super::uncompress;
use crate::common::alc::AlcPkt;
use crate::common::fdtinstance::{FdtInstance, File};
use crate::common::lct::Cenc;
use crate::tools::error::{FluteError, Result};
use std::time::{Duration, SystemTime};

/// FDT instance IDs live in a 20-bit space and wrap around.
const FDT_INSTANCE_ID_SPACE: u32 = 1 << 20;

/// True when `candidate` is a more recent instance ID than `reference`,
/// accounting for wrap-around.
pub fn id_is_newer(candidate: u32, reference: u32) -> bool {
    candidate != reference
        && (candidate.wrapping_sub(reference) & (FDT_INSTANCE_ID_SPACE - 1))
            < FDT_INSTANCE_ID_SPACE / 2
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdtState {
    /// Fragments are still being collected.
    Receiving,
    /// The body was reassembled and parsed, entries are available.
    Complete,
    /// The body was reassembled but could not be decoded.
    Error,
}

/// Reassembles and decodes one FDT instance.
pub struct FdtReceiver {
    pub fdt_instance_id: u32,
    obj: Option<ObjectReceiver>,
    cenc: Cenc,
    maximum_source_block_length: u32,
    fdt: Option<FdtInstance>,
    xml: Option<String>,
    expires: Option<SystemTime>,
    state: FdtState,
    pub last_activity: SystemTime,
}

impl FdtReceiver {
    pub fn new(fdt_instance_id: u32, now: SystemTime) -> FdtReceiver {
        FdtReceiver {
            fdt_instance_id,
            obj: None,
            cenc: Cenc::Null,
            maximum_source_block_length: 0,
            fdt: None,
            xml: None,
            expires: None,
            state: FdtState::Receiving,
            last_activity: now,
        }
    }

    pub fn state(&self) -> FdtState {
        self.state
    }

    /// Ingest one fragment of the FDT body. Fragments may arrive in any
    /// order and duplicated; the first packet must carry EXT_FTI so the
    /// body can be sized.
    pub fn push(&mut self, pkt: &AlcPkt, now: SystemTime) -> Result<()> {
        if self.state != FdtState::Receiving {
            return Ok(());
        }
        self.last_activity = now;

        if self.obj.is_none() {
            let fti = pkt.fti.ok_or_else(|| {
                FluteError::new(format!(
                    "FDT instance {} announced without EXT_FTI, cannot size the body",
                    self.fdt_instance_id
                ))
            })?;
            self.obj = Some(ObjectReceiver::new(
                pkt.lct.toi,
                fti.transfer_length,
                fti.encoding_symbol_length as u64,
                now,
            )?);
            self.maximum_source_block_length = fti.maximum_source_block_length;
            if let Some(cenc) = pkt.cenc {
                self.cenc = cenc;
            }
        }

        if let (Some(obj), Some(pid)) = (self.obj.as_mut(), pkt.payload_id) {
            let esi = pid.flat_esi(self.maximum_source_block_length);
            if let Err(e) = obj.push_symbol(esi, pkt.payload(), now) {
                log::warn!("FDT instance {}: {}", self.fdt_instance_id, e);
            }
            if obj.is_complete() {
                self.decode();
            }
        }
        Ok(())
    }

    fn decode(&mut self) {
        let obj = match self.obj.take() {
            Some(obj) => obj,
            None => return,
        };
        let decoded = obj
            .take_data()
            .and_then(|data| uncompress::decompress(self.cenc, data))
            .and_then(|data| {
                String::from_utf8(data)
                    .map_err(|e| FluteError::new(format!("FDT body is not UTF-8: {}", e)))
            });
        let xml = match decoded {
            Ok(xml) => xml,
            Err(e) => {
                log::error!("FDT instance {}: {}", self.fdt_instance_id, e);
                self.state = FdtState::Error;
                return;
            }
        };
        match FdtInstance::parse(&xml) {
            Ok(fdt) => {
                self.expires = fdt.get_expiration_date();
                if self.expires.is_none() {
                    log::warn!(
                        "FDT instance {} has an unparsable Expires attribute {:?}",
                        self.fdt_instance_id,
                        fdt.expires
                    );
                }
                self.fdt = Some(fdt);
                self.xml = Some(xml);
                self.state = FdtState::Complete;
            }
            Err(e) => {
                log::error!("FDT instance {}: {}", self.fdt_instance_id, e);
                self.state = FdtState::Error;
            }
        }
    }

    pub fn fdt(&self) -> Option<&FdtInstance> {
        self.fdt.as_ref()
    }

    pub fn fdt_xml(&self) -> Option<&str> {
        self.xml.as_deref()
    }

    pub fn expires(&self) -> Option<SystemTime> {
        self.expires
    }

    fn expired(&self, now: SystemTime) -> bool {
        matches!(self.expires, Some(expires) if now >= expires)
    }
}

/// Metadata resolved for a TOI out of a complete FDT instance.
pub struct FdtMatch<'a> {
    pub fdt_instance_id: u32,
    pub fdt: &'a FdtInstance,
    pub file: &'a File,
}

/// Set of FDT instances known to one session.
///
/// A newer instance supersedes an older one but the older instance survives
/// while objects that resolved their metadata through it are still in flight
/// (a reference count per instance) and is evicted only at refcount zero once
/// expired or superseded.
pub struct FdtTable {
    instances: Vec<FdtSlot>,
}

struct FdtSlot {
    receiver: FdtReceiver,
    refcount: u32,
}

impl FdtTable {
    pub fn new() -> FdtTable {
        FdtTable {
            instances: Vec::new(),
        }
    }

    /// The receiver for an instance ID, created on first reference.
    pub fn receiver_mut(&mut self, fdt_instance_id: u32, now: SystemTime) -> &mut FdtReceiver {
        if let Some(idx) = self.index_of(fdt_instance_id) {
            return &mut self.instances[idx].receiver;
        }
        log::debug!("New FDT instance {} announced", fdt_instance_id);
        self.instances.push(FdtSlot {
            receiver: FdtReceiver::new(fdt_instance_id, now),
            refcount: 0,
        });
        &mut self.instances.last_mut().unwrap().receiver
    }

    /// Find the file entry for `toi` in the newest complete instance that
    /// describes it, newest by wrap-around instance ID, not by arrival order.
    /// Entries become visible only once their instance is complete.
    pub fn lookup_file(&self, toi: u128, now: SystemTime) -> Option<FdtMatch<'_>> {
        self.instances
            .iter()
            .filter(|slot| slot.receiver.state == FdtState::Complete)
            .filter(|slot| !slot.receiver.expired(now))
            .filter_map(|slot| {
                let fdt = slot.receiver.fdt()?;
                let file = fdt.get_file(toi)?;
                Some(FdtMatch {
                    fdt_instance_id: slot.receiver.fdt_instance_id,
                    fdt,
                    file,
                })
            })
            .reduce(|best, candidate| {
                if id_is_newer(candidate.fdt_instance_id, best.fdt_instance_id) {
                    candidate
                } else {
                    best
                }
            })
    }

    /// An object resolved its metadata through this instance.
    pub fn acquire(&mut self, fdt_instance_id: u32) {
        if let Some(idx) = self.index_of(fdt_instance_id) {
            self.instances[idx].refcount += 1;
        }
    }

    /// The object completed or was evicted.
    pub fn release(&mut self, fdt_instance_id: u32) {
        if let Some(idx) = self.index_of(fdt_instance_id) {
            let slot = &mut self.instances[idx];
            slot.refcount = slot.refcount.saturating_sub(1);
        }
    }

    /// Evict instances that can no longer contribute: decode failures, stale
    /// partial receptions, and unreferenced instances that are expired or
    /// superseded by a newer complete instance.
    pub fn housekeeping(&mut self, now: SystemTime, receive_timeout: Duration) {
        let newest_complete = self
            .instances
            .iter()
            .filter(|slot| slot.receiver.state == FdtState::Complete)
            .map(|slot| slot.receiver.fdt_instance_id)
            .reduce(|a, b| if id_is_newer(b, a) { b } else { a });

        self.instances.retain(|slot| {
            let recv = &slot.receiver;
            match recv.state {
                FdtState::Error => {
                    log::debug!("Dropping undecodable FDT instance {}", recv.fdt_instance_id);
                    false
                }
                FdtState::Receiving => {
                    let idle = now
                        .duration_since(recv.last_activity)
                        .unwrap_or(Duration::ZERO);
                    if idle > receive_timeout {
                        log::warn!(
                            "Dropping partial FDT instance {} after inactivity",
                            recv.fdt_instance_id
                        );
                        false
                    } else {
                        true
                    }
                }
                FdtState::Complete => {
                    if slot.refcount > 0 {
                        return true;
                    }
                    let superseded = matches!(newest_complete,
                        Some(newest) if id_is_newer(newest, recv.fdt_instance_id));
                    if recv.expired(now) || superseded {
                        log::debug!(
                            "Evicting FDT instance {} (expired: {}, superseded: {})",
                            recv.fdt_instance_id,
                            recv.expired(now),
                            superseded
                        );
                        false
                    } else {
                        true
                    }
                }
            }
        });
    }

    /// Instance IDs currently held, oldest first.
    pub fn instance_ids(&self) -> Vec<u32> {
        self.instances
            .iter()
            .map(|slot| slot.receiver.fdt_instance_id)
            .collect()
    }

    fn index_of(&self, fdt_instance_id: u32) -> Option<usize> {
        self.instances
            .iter()
            .position(|slot| slot.receiver.fdt_instance_id == fdt_instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_instance(id: u32, location: &str) -> FdtSlot {
        let xml = format!(
            r#"<FDT-Instance Expires="4133980800">
  <File Content-Location="{}" TOI="1" Transfer-Length="100"/>
</FDT-Instance>"#,
            location
        );
        let fdt = FdtInstance::parse(&xml).unwrap();
        let mut receiver = FdtReceiver::new(id, SystemTime::UNIX_EPOCH);
        receiver.expires = fdt.get_expiration_date();
        receiver.fdt = Some(fdt);
        receiver.xml = Some(xml);
        receiver.state = FdtState::Complete;
        FdtSlot {
            receiver,
            refcount: 0,
        }
    }

    #[test]
    fn lookup_prefers_newest_instance_id_over_arrival_order() {
        let now = SystemTime::UNIX_EPOCH;
        let mut table = FdtTable::new();
        // the newer instance arrives first
        table.instances.push(complete_instance(2, "files/new.bin"));
        table.instances.push(complete_instance(1, "files/old.bin"));

        let m = table.lookup_file(1, now).unwrap();
        assert_eq!(m.fdt_instance_id, 2);
        assert_eq!(m.file.content_location, "files/new.bin");
    }

    #[test]
    fn lookup_orders_across_instance_id_wraparound() {
        let now = SystemTime::UNIX_EPOCH;
        let mut table = FdtTable::new();
        table.instances.push(complete_instance(3, "files/new.bin"));
        table
            .instances
            .push(complete_instance(FDT_INSTANCE_ID_SPACE - 2, "files/old.bin"));

        // 3 is newer than 2^20 - 2 once the ID space has wrapped
        let m = table.lookup_file(1, now).unwrap();
        assert_eq!(m.fdt_instance_id, 3);
        assert_eq!(m.file.content_location, "files/new.bin");
    }

    #[test]
    fn instance_id_wraparound() {
        assert!(id_is_newer(2, 1));
        assert!(!id_is_newer(1, 2));
        assert!(!id_is_newer(5, 5));
        // rotation across the 20-bit boundary
        assert!(id_is_newer(3, FDT_INSTANCE_ID_SPACE - 2));
        assert!(!id_is_newer(FDT_INSTANCE_ID_SPACE - 2, 3));
    }

    #[test]
    fn stale_partial_instance_is_dropped() {
        let now = SystemTime::UNIX_EPOCH;
        let mut table = FdtTable::new();
        table.receiver_mut(7, now);
        assert_eq!(table.instance_ids(), vec![7]);

        table.housekeeping(now + Duration::from_secs(5), Duration::from_secs(10));
        assert_eq!(table.instance_ids(), vec![7]);

        table.housekeeping(now + Duration::from_secs(60), Duration::from_secs(10));
        assert!(table.instance_ids().is_empty());
    }
}
