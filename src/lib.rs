//! Kernel-side glue for an SCTP transport engine.
//!
//! This crate carries the resource lifecycle, locking, and buffer-chain
//! machinery an SCTP protocol engine runs on, without implementing the
//! protocol itself:
//!
//! - **Buffer chains** ([`buf`]): pooled segments, zero-copy duplication
//!   over an offset/length window, header prepending.
//! - **Resource handles** ([`handle`]): per-association lock + use-count
//!   discipline with post-mortem diagnostics, the live-handle table, and
//!   the periodic reaper that frees quiesced handles.
//! - **Extraction** ([`peeloff`]): peeling one ready sub-connection out of
//!   a listening handle into its own descriptor slot without deadlocking
//!   against concurrent readiness waits.
//! - **Host bridges** ([`udp_tunnel`], [`addr_monitor`]): reconstructing
//!   network framing for SCTP-over-UDP datagrams and relaying interface
//!   address changes.
//!
//! The protocol state machine (handshake, congestion control,
//! retransmission, SACK processing) lives outside, behind the
//! [`ProtocolEngine`] trait. Nothing here is ambient: [`Glue`] owns every
//! service and tears them down explicitly.

pub mod addr_monitor;
pub mod buf;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod handle;
pub mod peeloff;
pub mod udp_tunnel;

use std::sync::Arc;

use crossbeam::channel::Receiver;

pub use crate::addr_monitor::{AddrMonitor, IfTable};
pub use crate::buf::{AllocMode, Chain, CopyLen, PacketHeader, SegKind, Segment, SegmentPool};
pub use crate::config::GlueConfig;
pub use crate::descriptor::{DescriptorTable, SlotId};
pub use crate::engine::{AccessPolicy, AllowAll, IfAddrRecord, ProtocolEngine};
pub use crate::error::{GlueError, Result};
pub use crate::handle::reaper::Reaper;
pub use crate::handle::table::HandleTable;
pub use crate::handle::{AssocId, Handle, HandleGuard, HandleState};
pub use crate::udp_tunnel::UdpTunnel;

/// The assembled glue services: segment pool, handle and descriptor
/// tables, reaper, tunnel ingress, and address monitor, wired to one
/// protocol engine and access policy.
pub struct Glue {
    config: GlueConfig,
    pool: Arc<SegmentPool>,
    handles: Arc<HandleTable>,
    descriptors: Arc<DescriptorTable>,
    engine: Arc<dyn ProtocolEngine>,
    policy: Arc<dyn AccessPolicy>,
    reaper: Option<Reaper>,
    tunnel: UdpTunnel,
    monitor: Option<AddrMonitor>,
}

impl Glue {
    /// Build the services. Nothing starts running until the `start_*`
    /// hooks are called.
    pub fn new(
        config: GlueConfig,
        engine: Arc<dyn ProtocolEngine>,
        policy: Arc<dyn AccessPolicy>,
    ) -> Glue {
        let pool = SegmentPool::new(config.segment_limit);
        let handles = HandleTable::new();
        let descriptors = Arc::new(DescriptorTable::new(config.descriptor_slots));
        let tunnel = UdpTunnel::new(engine.clone(), pool.clone(), config.tunnel_port);
        Glue {
            config,
            pool,
            handles,
            descriptors,
            engine,
            policy,
            reaper: None,
            tunnel,
            monitor: None,
        }
    }

    pub fn pool(&self) -> &Arc<SegmentPool> {
        &self.pool
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn descriptors(&self) -> &Arc<DescriptorTable> {
        &self.descriptors
    }

    /// Start the periodic reaper.
    pub fn start_reaper(&mut self) {
        if self.reaper.is_none() {
            self.reaper = Some(Reaper::start(
                self.handles.clone(),
                self.descriptors.clone(),
                self.config.reaper_interval(),
            ));
        }
    }

    /// Bind the tunnel ingress socket and start its receive loop.
    pub fn start_tunnel(&self) -> Result<()> {
        self.tunnel.start()
    }

    /// Start relaying host address-change notifications from `feed`.
    pub fn start_addr_monitor(&mut self, iftable: Arc<dyn IfTable>, feed: Receiver<Vec<u8>>) {
        if self.monitor.is_none() {
            self.monitor = Some(AddrMonitor::start(self.engine.clone(), iftable, feed));
        }
    }

    /// Peel `assoc` off the listening handle published at `listener_sd`.
    pub fn peel_off(&self, listener_sd: SlotId, assoc: AssocId) -> Result<SlotId> {
        peeloff::peel_off(
            &self.descriptors,
            &*self.engine,
            &*self.policy,
            listener_sd,
            assoc,
        )
    }

    /// Stop every running service. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        self.tunnel.stop();
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(mut reaper) = self.reaper.take() {
            reaper.stop();
        }
    }
}

impl Drop for Glue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
