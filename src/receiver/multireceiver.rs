//! Demultiplexing of raw datagrams to per-session receivers.

use super::receiver::{CloseHandle, Config, Receiver};
use super::writer::ObjectWriterBuilder;
use crate::common::alc;
use crate::common::udpendpoint::UDPEndpoint;
use crate::tools::error::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::SystemTime;

/// Receives several FLUTE sessions over one or more endpoints, decoding each
/// datagram once and routing it by (endpoint, TSI).
pub struct MultiReceiver {
    writer: Rc<dyn ObjectWriterBuilder>,
    config: Config,
    sessions: BTreeMap<(UDPEndpoint, u64), Receiver>,
    /// When filtering is enabled, only TSIs in this set are accepted.
    tsi_allowlist: BTreeSet<u64>,
    enable_tsi_filtering: bool,
}

impl MultiReceiver {
    /// `enable_tsi_filtering` restricts reception to the TSIs registered with
    /// [`add_listen_tsi`](Self::add_listen_tsi); otherwise sessions are
    /// created on demand for every TSI seen on the wire.
    pub fn new(
        writer: Rc<dyn ObjectWriterBuilder>,
        config: Option<Config>,
        enable_tsi_filtering: bool,
    ) -> MultiReceiver {
        MultiReceiver {
            writer,
            config: config.unwrap_or_default(),
            sessions: BTreeMap::new(),
            tsi_allowlist: BTreeSet::new(),
            enable_tsi_filtering,
        }
    }

    pub fn add_listen_tsi(&mut self, tsi: u64) {
        self.tsi_allowlist.insert(tsi);
    }

    pub fn remove_listen_tsi(&mut self, tsi: u64) {
        self.tsi_allowlist.remove(&tsi);
    }

    /// Decode one raw datagram received on `endpoint` and dispatch it.
    pub fn push(&mut self, endpoint: &UDPEndpoint, data: &[u8], now: SystemTime) -> Result<()> {
        let pkt = alc::parse_alc_pkt(data)?;

        if self.enable_tsi_filtering && !self.tsi_allowlist.contains(&pkt.lct.tsi) {
            log::debug!("Ignoring packet for unregistered TSI {}", pkt.lct.tsi);
            return Ok(());
        }

        let key = (endpoint.clone(), pkt.lct.tsi);
        let session = self.sessions.entry(key).or_insert_with(|| {
            log::info!(
                "New session TSI {} on {}:{}",
                pkt.lct.tsi,
                endpoint.destination_group_address,
                endpoint.port
            );
            Receiver::new(
                endpoint.clone(),
                pkt.lct.tsi,
                self.writer.clone(),
                self.config.clone(),
            )
        });
        session.push(&pkt, now)
    }

    /// Housekeeping across all sessions. Sessions whose close flag is set are
    /// torn down and removed.
    pub fn cleanup(&mut self, now: SystemTime) {
        self.sessions.retain(|(_, tsi), session| {
            if session.is_closed() {
                log::info!("Removing closed session TSI {}", tsi);
                false
            } else {
                session.cleanup(now);
                true
            }
        });
    }

    /// Close handle for one session, when it exists.
    pub fn close_handle(&self, endpoint: &UDPEndpoint, tsi: u64) -> Option<CloseHandle> {
        self.sessions
            .get(&(endpoint.clone(), tsi))
            .map(|session| session.close_handle())
    }
}
