//! Per-session packet dispatch: routes decoded packets to the FDT table or
//! to the object being reconstructed, enforces the memory budget and evicts
//! stale state.

use super::fdtreceiver::{FdtMatch, FdtState, FdtTable};
use super::objectreceiver::ObjectReceiver;
use super::uncompress;
use super::writer::{ObjectMetadata, ObjectWriter, ObjectWriterBuilder, ObjectWriterBuilderResult};
use crate::common::alc::{AlcPkt, PayloadID};
use crate::common::lct::Cenc;
use crate::common::udpendpoint::UDPEndpoint;
use crate::tools::error::{FluteError, Result};
use base64::Engine;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// TOI reserved for FDT instances.
pub const TOI_FDT: u128 = 0;

/// Completed TOIs remembered so late duplicates are ignored silently.
const MAX_COMPLETED_TOI_TRACKED: usize = 1024;

/// Receiver tuning knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Partial objects (and partial FDT instances) idle longer than this are
    /// evicted and never delivered.
    pub object_timeout: Duration,
    /// Symbols queued per TOI while waiting for an FDT entry. When the queue
    /// is full the oldest symbol is dropped.
    pub max_pending_symbols_per_toi: usize,
    /// Byte budget for all in-flight objects of a session. Opening an object
    /// that would exceed it is refused. `None` removes the bound.
    pub object_max_cache_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            object_timeout: Duration::from_secs(10),
            max_pending_symbols_per_toi: 32,
            object_max_cache_size: None,
        }
    }
}

/// Cloneable handle that requests the teardown of a session. Safe to invoke
/// from another thread while a packet is being processed: the flag is checked
/// between packets and teardown happens on the owning thread.
#[derive(Clone, Debug)]
pub struct CloseHandle(Arc<AtomicBool>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct PendingSymbol {
    sbn: u32,
    esi: u32,
    payload: Vec<u8>,
}

/// Symbols buffered for a TOI whose transfer length is not known yet.
struct PendingSymbols {
    symbols: VecDeque<PendingSymbol>,
    last_activity: SystemTime,
}

struct AssemblingObject {
    recv: ObjectReceiver,
    meta: ObjectMetadata,
    maximum_source_block_length: u32,
    /// FDT instance the transfer length was resolved through, reference
    /// counted until this object completes or is evicted.
    fdt_instance: Option<u32>,
}

/// Per-TOI state machine. `Unknown` is implicit (no entry), `Complete` and
/// `TimedOut` are terminal (entry removed, buffers freed).
enum ObjectState {
    PendingMetadata(PendingSymbols),
    Assembling(Box<AssemblingObject>),
}

/// Everything needed to open a reconstruction buffer for a TOI.
struct ResolvedInfo {
    transfer_length: u64,
    symbol_length: u64,
    maximum_source_block_length: u32,
    meta: ObjectMetadata,
    fdt_instance: Option<u32>,
}

/// One FLUTE session (one TSI on one endpoint). Owns the FDT table and the
/// map of objects being reconstructed. Single-threaded by ownership: packets
/// are handled to completion in arrival order.
pub struct Receiver {
    tsi: u64,
    endpoint: UDPEndpoint,
    config: Config,
    writer: Rc<dyn ObjectWriterBuilder>,
    fdt_table: FdtTable,
    objects: BTreeMap<u128, ObjectState>,
    completed: BTreeSet<u128>,
    completed_order: VecDeque<u128>,
    /// Bytes held by in-flight objects and pending queues.
    allocated: usize,
    closed: Arc<AtomicBool>,
}

impl Receiver {
    pub fn new(
        endpoint: UDPEndpoint,
        tsi: u64,
        writer: Rc<dyn ObjectWriterBuilder>,
        config: Config,
    ) -> Receiver {
        Receiver {
            tsi,
            endpoint,
            config,
            writer,
            fdt_table: FdtTable::new(),
            objects: BTreeMap::new(),
            completed: BTreeSet::new(),
            completed_order: VecDeque::new(),
            allocated: 0,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tsi(&self) -> u64 {
        self.tsi
    }

    /// Handle for closing this session from another thread.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(self.closed.clone())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Process one decoded packet belonging to this session.
    pub fn push(&mut self, pkt: &AlcPkt, now: SystemTime) -> Result<()> {
        debug_assert_eq!(pkt.lct.tsi, self.tsi);
        if self.is_closed() {
            self.teardown();
            return Ok(());
        }

        if pkt.lct.close_session {
            log::info!("TSI {}: sender signalled end of session", self.tsi);
        }

        if let Some(fdt) = pkt.fdt {
            return self.push_fdt_packet(pkt, fdt.fdt_instance_id, now);
        }
        if pkt.lct.toi == TOI_FDT {
            return Err(FluteError::MalformedHeader(
                "TOI 0 packet without EXT_FDT".to_owned(),
            ));
        }
        self.push_object_packet(pkt, now)
    }

    /// Evict stale state: timed-out partial objects and pending queues,
    /// expired or superseded FDT instances.
    pub fn cleanup(&mut self, now: SystemTime) {
        if self.is_closed() {
            self.teardown();
            return;
        }
        let timeout = self.config.object_timeout;
        let stale: Vec<u128> = self
            .objects
            .iter()
            .filter(|(_, state)| {
                let last = match state {
                    ObjectState::Assembling(obj) => obj.recv.last_activity,
                    ObjectState::PendingMetadata(pending) => pending.last_activity,
                };
                now.duration_since(last).unwrap_or(Duration::ZERO) > timeout
            })
            .map(|(toi, _)| *toi)
            .collect();
        for toi in stale {
            log::warn!("TSI {}: {}", self.tsi, FluteError::Timeout { toi });
            self.drop_object(toi);
        }
        self.fdt_table.housekeeping(now, timeout);
    }

    fn teardown(&mut self) {
        if !self.objects.is_empty() {
            log::info!(
                "TSI {}: session closed, releasing {} in-flight object(s)",
                self.tsi,
                self.objects.len()
            );
        }
        self.objects.clear();
        self.fdt_table = FdtTable::new();
        self.allocated = 0;
    }

    fn push_fdt_packet(&mut self, pkt: &AlcPkt, instance_id: u32, now: SystemTime) -> Result<()> {
        if pkt.lct.toi != TOI_FDT {
            return Err(FluteError::MalformedHeader(format!(
                "EXT_FDT present on TOI {}",
                pkt.lct.toi
            )));
        }
        let newly_complete = {
            let recv = self.fdt_table.receiver_mut(instance_id, now);
            if recv.state() != FdtState::Receiving {
                // duplicate fragment of an already decoded instance
                return Ok(());
            }
            recv.push(pkt, now)?;
            recv.state() == FdtState::Complete
        };
        if newly_complete {
            log::info!("TSI {}: FDT instance {} complete", self.tsi, instance_id);
            let (xml, expires) = {
                let recv = self.fdt_table.receiver_mut(instance_id, now);
                (recv.fdt_xml().unwrap_or_default().to_owned(), recv.expires())
            };
            self.writer
                .fdt_received(&self.endpoint, self.tsi, &xml, expires, now);
            self.resolve_pending(now);
        }
        Ok(())
    }

    fn push_object_packet(&mut self, pkt: &AlcPkt, now: SystemTime) -> Result<()> {
        let toi = pkt.lct.toi;
        if self.completed.contains(&toi) {
            return Ok(());
        }

        let pid = match pkt.payload_id {
            Some(pid) => pid,
            None => {
                if pkt.lct.close_object {
                    self.abandon_object(toi);
                }
                return Ok(());
            }
        };

        let result = if matches!(self.objects.get(&toi), Some(ObjectState::Assembling(_))) {
            self.push_to_assembling(toi, pid, pkt.payload(), now)
        } else {
            match self.resolve_transmission_info(pkt, toi, now) {
                Some(info) => {
                    self.open_object(toi, info, now)?;
                    self.push_to_assembling(toi, pid, pkt.payload(), now)
                }
                None => self.queue_pending(toi, pid, pkt.payload(), now),
            }
        };

        if pkt.lct.close_object {
            self.abandon_object(toi);
        }
        result
    }

    /// Place one symbol into an assembling object, finishing it when the
    /// last gap closes. An `InconsistentSymbol` is reported to the caller but
    /// does not stop the object.
    fn push_to_assembling(
        &mut self,
        toi: u128,
        pid: PayloadID,
        payload: &[u8],
        now: SystemTime,
    ) -> Result<()> {
        let (result, complete) = match self.objects.get_mut(&toi) {
            Some(ObjectState::Assembling(obj)) => {
                let esi = pid.flat_esi(obj.maximum_source_block_length);
                let result = obj.recv.push_symbol(esi, payload, now);
                (result, obj.recv.is_complete())
            }
            _ => return Ok(()),
        };
        if complete {
            self.finish_object(toi, now);
        }
        result
    }

    /// Transfer length and metadata for a TOI: EXT_FTI is authoritative for
    /// the lengths, the FDT entry contributes metadata, and is the fallback
    /// for the lengths when EXT_FTI is absent.
    fn resolve_transmission_info(
        &self,
        pkt: &AlcPkt,
        toi: u128,
        now: SystemTime,
    ) -> Option<ResolvedInfo> {
        let fdt_match = self.fdt_table.lookup_file(toi, now);

        if let Some(fti) = pkt.fti {
            let meta = match &fdt_match {
                Some(m) => metadata_from_fdt(m, fti.transfer_length, pkt.cenc),
                None => synthetic_metadata(toi, fti.transfer_length, pkt.cenc),
            };
            return Some(ResolvedInfo {
                transfer_length: fti.transfer_length,
                symbol_length: fti.encoding_symbol_length as u64,
                maximum_source_block_length: fti.maximum_source_block_length,
                meta,
                // length came in-band, no FDT instance reference held
                fdt_instance: None,
            });
        }

        let m = fdt_match?;
        resolved_from_fdt(&m, pkt.cenc)
    }

    /// Allocate the reconstruction buffer for a TOI and drain any symbols
    /// queued while the metadata was pending.
    fn open_object(&mut self, toi: u128, info: ResolvedInfo, now: SystemTime) -> Result<()> {
        if let Some(budget) = self.config.object_max_cache_size {
            let requested = info.transfer_length as usize;
            if self.allocated + requested > budget {
                // drop the queued symbols as well, a later FDT re-announcement
                // may find enough space
                self.drop_object(toi);
                let err = FluteError::ResourceExhausted {
                    requested: requested as u64,
                    available: budget.saturating_sub(self.allocated) as u64,
                };
                log::warn!("TSI {}: TOI {}: {}", self.tsi, toi, err);
                return Err(err);
            }
        }

        let recv = ObjectReceiver::new(toi, info.transfer_length, info.symbol_length, now)?;
        if let Some(instance_id) = info.fdt_instance {
            self.fdt_table.acquire(instance_id);
        }
        self.allocated += info.transfer_length as usize;
        log::debug!(
            "TSI {}: opening TOI {} ({} bytes, {} byte symbols)",
            self.tsi,
            toi,
            info.transfer_length,
            info.symbol_length
        );

        let previous = self.objects.insert(
            toi,
            ObjectState::Assembling(Box::new(AssemblingObject {
                recv,
                meta: info.meta,
                maximum_source_block_length: info.maximum_source_block_length,
                fdt_instance: info.fdt_instance,
            })),
        );
        let queued = match previous {
            Some(ObjectState::PendingMetadata(pending)) => {
                self.allocated -= pending_bytes(&pending);
                pending.symbols
            }
            _ => VecDeque::new(),
        };
        for symbol in queued {
            let pid = PayloadID {
                sbn: symbol.sbn,
                esi: symbol.esi,
            };
            // inconsistencies are logged by the object receiver
            let _ = self.push_to_assembling(toi, pid, &symbol.payload, now);
            if !self.objects.contains_key(&toi) {
                // completed (or was evicted) mid-drain
                break;
            }
        }
        Ok(())
    }

    /// Buffer a symbol for a TOI whose transfer length is still unknown.
    fn queue_pending(
        &mut self,
        toi: u128,
        pid: PayloadID,
        payload: &[u8],
        now: SystemTime,
    ) -> Result<()> {
        if let Some(budget) = self.config.object_max_cache_size {
            if self.allocated + payload.len() > budget {
                let err = FluteError::ResourceExhausted {
                    requested: payload.len() as u64,
                    available: budget.saturating_sub(self.allocated) as u64,
                };
                log::warn!("TSI {}: TOI {}: {}", self.tsi, toi, err);
                return Err(err);
            }
        }

        let entry = self.objects.entry(toi).or_insert_with(|| {
            ObjectState::PendingMetadata(PendingSymbols {
                symbols: VecDeque::new(),
                last_activity: now,
            })
        });
        let ObjectState::PendingMetadata(pending) = entry else {
            return Ok(());
        };
        pending.last_activity = now;

        let mut result = Ok(());
        if pending.symbols.len() >= self.config.max_pending_symbols_per_toi {
            if let Some(dropped) = pending.symbols.pop_front() {
                self.allocated -= dropped.payload.len();
                let err = FluteError::PendingOverflow { toi };
                log::warn!("TSI {}: {}", self.tsi, err);
                result = Err(err);
            }
        }
        self.allocated += payload.len();
        pending.symbols.push_back(PendingSymbol {
            sbn: pid.sbn,
            esi: pid.esi,
            payload: payload.to_vec(),
        });
        result
    }

    /// Re-check every TOI stuck in `PendingMetadata` after a new FDT instance
    /// completed.
    fn resolve_pending(&mut self, now: SystemTime) {
        let pending_tois: Vec<u128> = self
            .objects
            .iter()
            .filter(|(_, state)| matches!(state, ObjectState::PendingMetadata(_)))
            .map(|(toi, _)| *toi)
            .collect();
        for toi in pending_tois {
            let info = match self.fdt_table.lookup_file(toi, now) {
                Some(m) => resolved_from_fdt(&m, None),
                None => None,
            };
            if let Some(info) = info {
                if let Err(e) = self.open_object(toi, info, now) {
                    log::warn!("TSI {}: TOI {} stays unresolved: {}", self.tsi, toi, e);
                }
            }
        }
    }

    /// Hand a completed object to the writer and evict its state.
    fn finish_object(&mut self, toi: u128, now: SystemTime) {
        let obj = match self.objects.remove(&toi) {
            Some(ObjectState::Assembling(obj)) => *obj,
            _ => return,
        };
        self.allocated -= obj.recv.transfer_length() as usize;
        if let Some(instance_id) = obj.fdt_instance {
            self.fdt_table.release(instance_id);
        }
        self.mark_completed(toi);

        if obj.recv.has_suspect_regions() {
            log::warn!(
                "TSI {}: TOI {} completed with suspect regions, first-seen bytes were kept",
                self.tsi,
                toi
            );
        }

        let meta = obj.meta;
        let data = match obj.recv.take_data() {
            Ok(data) => data,
            Err(e) => {
                log::error!("TSI {}: TOI {}: {}", self.tsi, toi, e);
                return;
            }
        };
        let data = match uncompress::decompress(meta.cenc, data) {
            Ok(data) => data,
            Err(e) => {
                log::error!("TSI {}: TOI {}: {}", self.tsi, toi, e);
                self.deliver_error(toi, &meta, now);
                return;
            }
        };

        let writer = match self
            .writer
            .new_object_writer(&self.endpoint, self.tsi, toi, &meta, now)
        {
            ObjectWriterBuilderResult::StoreObject(writer) => writer,
            ObjectWriterBuilderResult::Skip => return,
        };
        if let Err(e) = writer.open(now) {
            log::error!("TSI {}: TOI {}: fail to open writer: {}", self.tsi, toi, e);
            return;
        }
        if writer.enable_md5_check() {
            if let Some(expected) = meta.content_md5.as_deref() {
                let digest = base64::engine::general_purpose::STANDARD.encode(md5::compute(&data).0);
                if digest != expected {
                    log::error!(
                        "TSI {}: TOI {}: MD5 mismatch, expected {} got {}",
                        self.tsi,
                        toi,
                        expected,
                        digest
                    );
                    writer.error(now);
                    return;
                }
            }
        }
        if let Err(e) = writer.write(&data, now) {
            log::error!("TSI {}: TOI {}: {}", self.tsi, toi, e);
            writer.error(now);
            return;
        }
        writer.complete(now);
        log::debug!(
            "TSI {}: TOI {} delivered ({} bytes)",
            self.tsi,
            toi,
            meta.transfer_length
        );
    }

    /// Report an object that reconstructed but could not be delivered.
    fn deliver_error(&self, toi: u128, meta: &ObjectMetadata, now: SystemTime) {
        if let ObjectWriterBuilderResult::StoreObject(writer) = self
            .writer
            .new_object_writer(&self.endpoint, self.tsi, toi, meta, now)
        {
            writer.open(now).ok();
            writer.error(now);
        }
    }

    /// The sender closed the object before it completed, release its state.
    fn abandon_object(&mut self, toi: u128) {
        if self.objects.contains_key(&toi) {
            log::debug!(
                "TSI {}: TOI {} closed by the sender before completion",
                self.tsi,
                toi
            );
            self.drop_object(toi);
        }
    }

    fn drop_object(&mut self, toi: u128) {
        match self.objects.remove(&toi) {
            Some(ObjectState::Assembling(obj)) => {
                self.allocated -= obj.recv.transfer_length() as usize;
                if let Some(instance_id) = obj.fdt_instance {
                    self.fdt_table.release(instance_id);
                }
            }
            Some(ObjectState::PendingMetadata(pending)) => {
                self.allocated -= pending_bytes(&pending);
            }
            None => {}
        }
    }

    fn mark_completed(&mut self, toi: u128) {
        if self.completed.insert(toi) {
            self.completed_order.push_back(toi);
            if self.completed_order.len() > MAX_COMPLETED_TOI_TRACKED {
                if let Some(oldest) = self.completed_order.pop_front() {
                    self.completed.remove(&oldest);
                }
            }
        }
    }
}

fn pending_bytes(pending: &PendingSymbols) -> usize {
    pending.symbols.iter().map(|s| s.payload.len()).sum()
}

/// Metadata for an object described by an FDT entry.
fn metadata_from_fdt(m: &FdtMatch<'_>, transfer_length: u64, in_band_cenc: Option<Cenc>) -> ObjectMetadata {
    ObjectMetadata {
        content_location: m.file.content_location.clone(),
        content_length: m.file.content_length,
        transfer_length,
        content_type: m
            .file
            .content_type
            .clone()
            .or_else(|| m.fdt.content_type.clone()),
        cenc: in_band_cenc.or_else(|| m.file.cenc()).unwrap_or(Cenc::Null),
        content_md5: m.file.content_md5.clone(),
        from_fdt: true,
    }
}

/// Synthetic metadata for an object whose length was learnt from EXT_FTI
/// with no FDT entry describing it.
fn synthetic_metadata(toi: u128, transfer_length: u64, in_band_cenc: Option<Cenc>) -> ObjectMetadata {
    ObjectMetadata {
        content_location: format!("toi-{}", toi),
        content_length: None,
        transfer_length,
        content_type: None,
        cenc: in_band_cenc.unwrap_or(Cenc::Null),
        content_md5: None,
        from_fdt: false,
    }
}

/// Full resolution out of an FDT entry, used when EXT_FTI is absent.
fn resolved_from_fdt(m: &FdtMatch<'_>, in_band_cenc: Option<Cenc>) -> Option<ResolvedInfo> {
    let transfer_length = m.file.object_transfer_length()?;
    let symbol_length = m.fdt.encoding_symbol_length(m.file)?;
    if symbol_length == 0 && transfer_length > 0 {
        log::warn!(
            "FDT instance {} declares a zero symbol length for {:?}",
            m.fdt_instance_id,
            m.file.content_location
        );
        return None;
    }
    let maximum_source_block_length = match m.fdt.maximum_source_block_length(m.file) {
        None => 0,
        Some(msbl) => match u32::try_from(msbl) {
            Ok(msbl) => msbl,
            Err(_) => {
                log::warn!(
                    "FDT instance {} declares an out-of-range source block length {} for {:?}",
                    m.fdt_instance_id,
                    msbl,
                    m.file.content_location
                );
                return None;
            }
        },
    };
    Some(ResolvedInfo {
        transfer_length,
        symbol_length,
        maximum_source_block_length,
        meta: metadata_from_fdt(m, transfer_length, in_band_cenc),
        fdt_instance: Some(m.fdt_instance_id),
    })
}
