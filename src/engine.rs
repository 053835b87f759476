//! The narrow seams to the protocol engine and the access policy.
//!
//! The glue layer never reaches into protocol state (association tables,
//! address lists) directly; everything goes through these traits. The
//! engine is the protocol state machine living outside this crate; the
//! policy mirrors the host's mandatory-access hooks around descriptor
//! handover.

use std::net::IpAddr;
use std::sync::Arc;

use crate::buf::Chain;
use crate::error::Result;
use crate::handle::{AssocId, Handle, HandleGuard};

/// One live address record of a host interface, as handed to the engine's
/// address-change handler. The flags come from the live interface table,
/// not from the notification, which is why the monitor re-resolves them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfAddrRecord {
    pub if_index: u32,
    pub addr: IpAddr,
    pub flags: u32,
}

/// Entry points the protocol engine must provide to this crate.
pub trait ProtocolEngine: Send + Sync {
    /// Eligibility check: may `assoc` be extracted from this listening
    /// handle at all? Called with the listening handle locked.
    fn can_extract(&self, listener: &HandleGuard<'_>, assoc: AssocId) -> Result<()>;

    /// Detach the sub-connection for `assoc` and return its handle. Called
    /// with the listening handle locked and its effective backlog capacity
    /// raised to at least one for the duration of the call.
    fn extract_subconnection(
        &self,
        listener: &mut HandleGuard<'_>,
        assoc: AssocId,
    ) -> Result<Arc<Handle>>;

    /// Hand a reconstructed packet to the protocol input path.
    /// `net_header_len` is the length of the synthesized network-layer
    /// header at the front of the chain.
    fn packet_input(&self, chain: Chain, net_header_len: usize, src_port: u16);

    /// An interface address appeared (`added`) or went away.
    fn address_changed(&self, record: &IfAddrRecord, added: bool);
}

/// Host access-policy hooks around extraction. Both default to allow.
pub trait AccessPolicy: Send + Sync {
    /// May the caller extract from this listening handle?
    fn check_accept(&self, _listener: &HandleGuard<'_>) -> Result<()> {
        Ok(())
    }

    /// Re-check at publication time, against the freshly extracted handle.
    fn check_accepted(&self, _handle: &Arc<Handle>) -> Result<()> {
        Ok(())
    }
}

/// Policy that allows everything.
pub struct AllowAll;

impl AccessPolicy for AllowAll {}
