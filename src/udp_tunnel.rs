//! SCTP-over-UDP tunnel ingress.
//!
//! Protocol traffic can arrive encapsulated in UDP datagrams. The ingress
//! socket receives each datagram together with its ancillary destination
//! address, rebuilds the network-layer framing the protocol input path
//! expects, and forwards the result:
//!
//! ```text
//! received:       [UDP payload = SCTP packet]
//! reconstructed:  [IPv4 header][SCTP packet]
//!                  ^ synthesized, carries the chain metadata
//! ```
//!
//! Malformed datagrams are freed and dropped without touching protocol
//! state; nobody is there to report an error to.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::buf::{AllocMode, Chain, PacketHeader, SegKind, SegmentPool};
use crate::engine::ProtocolEngine;
use crate::error::Result;

/// Length of the synthesized IPv4 header.
pub const IPV4_HEADER_LEN: usize = 20;

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 1 << 16;

/// How often the receive loop rechecks the shutdown flag.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Destination metadata delivered alongside a datagram.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ancillary {
    /// Destination address from the socket layer, when reported.
    pub dst: Option<Ipv4Addr>,
    /// Receiving interface index, when reported.
    pub ifindex: Option<u32>,
}

/// Rebuild network-layer framing around a tunneled payload.
///
/// The payload chain must carry packet metadata on its head; a chain
/// without it cannot have come off the tunnel socket intact and is
/// dropped. The synthesized header segment takes over the chain metadata
/// (arrival interface preserved, declared total = header plus payload)
/// and the payload is linked behind it.
pub fn reassemble_frame(
    pool: &Arc<SegmentPool>,
    mut payload: Chain,
    src: SocketAddrV4,
    dst: Option<Ipv4Addr>,
) -> Option<Chain> {
    let phdr = match payload.first_mut().and_then(|s| s.take_header()) {
        Some(h) => h,
        None => {
            debug!("tunnel ingress: datagram without packet metadata, dropping");
            return None;
        }
    };
    let payload_len = payload.len();

    let mut hdr_seg = match pool.alloc(AllocMode::DontWait, SegKind::Header) {
        Some(s) => s,
        None => {
            debug!("tunnel ingress: no segment for network header, dropping");
            return None;
        }
    };
    hdr_seg.set_window(0, IPV4_HEADER_LEN);

    let total = IPV4_HEADER_LEN + payload_len;
    let dst = dst.unwrap_or(Ipv4Addr::UNSPECIFIED);
    let buf = hdr_seg.data_mut();
    buf.fill(0);
    buf[0] = 0x45; // version 4, five-word header
    buf[2..4].copy_from_slice(&(total.min(u16::MAX as usize) as u16).to_be_bytes());
    buf[12..16].copy_from_slice(&src.ip().octets());
    buf[16..20].copy_from_slice(&dst.octets());
    hdr_seg.set_header(PacketHeader {
        total_len: total,
        rcvif: phdr.rcvif,
    });

    let mut chain = Chain::from_segment(hdr_seg);
    chain.append(payload);
    Some(chain)
}

/// Reconstruct one tunneled datagram and hand it to the protocol engine.
pub fn tunnel_input(
    engine: &dyn ProtocolEngine,
    pool: &Arc<SegmentPool>,
    payload: Chain,
    src: SocketAddrV4,
    dst: Option<Ipv4Addr>,
) {
    if let Some(chain) = reassemble_frame(pool, payload, src, dst) {
        trace!(%src, "tunnel ingress reconstructed:\n{}", chain.dump());
        engine.packet_input(chain, IPV4_HEADER_LEN, src.port());
    }
}

struct Ingress {
    shutdown: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    local: SocketAddr,
}

/// The tunnel ingress socket and its receive loop.
pub struct UdpTunnel {
    engine: Arc<dyn ProtocolEngine>,
    pool: Arc<SegmentPool>,
    port: u16,
    running: Mutex<Option<Ingress>>,
}

impl UdpTunnel {
    pub fn new(engine: Arc<dyn ProtocolEngine>, pool: Arc<SegmentPool>, port: u16) -> UdpTunnel {
        UdpTunnel {
            engine,
            pool,
            port,
            running: Mutex::new(None),
        }
    }

    /// Bind the tunnel socket and start the receive loop. An already
    /// running ingress is shut down first, so `start` doubles as restart.
    pub fn start(&self) -> Result<()> {
        self.stop();

        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port))?;
        enable_dst_addr(&sock)?;
        sock.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let local = sock.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let engine = self.engine.clone();
            let pool = self.pool.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("sctp-udp-tunnel".into())
                .spawn(move || recv_loop(sock, engine, pool, shutdown))
                .expect("spawn tunnel ingress thread")
        };
        *self.running.lock() = Some(Ingress {
            shutdown,
            thread,
            local,
        });
        info!(%local, "tunnel ingress bound");
        Ok(())
    }

    /// Stop the receive loop and close the socket. Idempotent.
    pub fn stop(&self) {
        if let Some(ingress) = self.running.lock().take() {
            ingress.shutdown.store(true, Ordering::Release);
            let _ = ingress.thread.join();
        }
    }

    /// Local address of the bound socket while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|i| i.local)
    }
}

impl Drop for UdpTunnel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn recv_loop(
    sock: UdpSocket,
    engine: Arc<dyn ProtocolEngine>,
    pool: Arc<SegmentPool>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while !shutdown.load(Ordering::Acquire) {
        let (n, src, anc) = match recv_with_dst(&sock, &mut buf) {
            Ok(v) => v,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("tunnel ingress: receive error: {e}");
                continue;
            }
        };
        let SocketAddr::V4(src) = src else {
            continue; // v4 tunnel only
        };

        let region = Bytes::copy_from_slice(&buf[..n]);
        let Some(mut payload) = pool.alloc_shared(AllocMode::DontWait, SegKind::Data, region)
        else {
            debug!("tunnel ingress: no segment for datagram, dropping");
            continue;
        };
        payload.set_header(PacketHeader {
            total_len: n,
            rcvif: anc.ifindex,
        });
        tunnel_input(&*engine, &pool, Chain::from_segment(payload), src, anc.dst);
    }
}

/// Ask the socket layer to report each datagram's destination address.
#[cfg(unix)]
fn enable_dst_addr(sock: &UdpSocket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let on: libc::c_int = 1;
    #[cfg(target_os = "linux")]
    let optname = libc::IP_PKTINFO;
    #[cfg(not(target_os = "linux"))]
    let optname = libc::IP_RECVDSTADDR;
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_IP,
            optname,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn enable_dst_addr(_sock: &UdpSocket) -> io::Result<()> {
    Ok(())
}

/// `recvmsg` with ancillary data: returns the datagram length, source
/// address, and whatever destination metadata the socket layer reported.
#[cfg(unix)]
fn recv_with_dst(sock: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Ancillary)> {
    use std::os::unix::io::AsRawFd;

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut name: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut cmsg_space = [0u64; 16];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut name as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_space.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = std::mem::size_of_val(&cmsg_space) as _;

    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let src = decode_sockaddr(&name)?;
    let mut anc = Ancillary::default();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let c = &*cmsg;
            #[cfg(target_os = "linux")]
            {
                if c.cmsg_level == libc::IPPROTO_IP && c.cmsg_type == libc::IP_PKTINFO {
                    let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                    anc.dst = Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
                    anc.ifindex = Some(info.ipi_ifindex as u32);
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                if c.cmsg_level == libc::IPPROTO_IP && c.cmsg_type == libc::IP_RECVDSTADDR {
                    let addr = &*(libc::CMSG_DATA(cmsg) as *const libc::in_addr);
                    anc.dst = Some(Ipv4Addr::from(u32::from_be(addr.s_addr)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok((n as usize, src, anc))
}

#[cfg(not(unix))]
fn recv_with_dst(sock: &UdpSocket, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Ancillary)> {
    let (n, src) = sock.recv_from(buf)?;
    Ok((n, src, Ancillary::default()))
}

#[cfg(unix)]
fn decode_sockaddr(ss: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(ss as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected source address family",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<SegmentPool> {
        SegmentPool::new(16)
    }

    fn payload_chain(pool: &Arc<SegmentPool>, bytes: &[u8], rcvif: Option<u32>) -> Chain {
        let mut seg = pool
            .alloc_shared(
                AllocMode::DontWait,
                SegKind::Data,
                Bytes::copy_from_slice(bytes),
            )
            .unwrap();
        seg.set_header(PacketHeader {
            total_len: bytes.len(),
            rcvif,
        });
        Chain::from_segment(seg)
    }

    #[test]
    fn reassembled_frame_declares_header_plus_payload() {
        let pool = pool();
        let payload = payload_chain(&pool, b"sctp packet bytes", Some(4));
        let src = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 10), 9899);
        let dst = Ipv4Addr::new(198, 51, 100, 1);

        let chain = reassemble_frame(&pool, payload, src, Some(dst)).unwrap();
        let hdr = chain.header().unwrap();
        assert_eq!(hdr.total_len, IPV4_HEADER_LEN + 17);
        assert_eq!(hdr.rcvif, Some(4), "arrival interface preserved");

        let bytes = chain.to_vec();
        assert_eq!(bytes.len(), IPV4_HEADER_LEN + 17);
        assert_eq!(bytes[0], 0x45);
        assert_eq!(&bytes[12..16], &src.ip().octets());
        assert_eq!(&bytes[16..20], &dst.octets());
        assert_eq!(&bytes[IPV4_HEADER_LEN..], b"sctp packet bytes");

        let with_hdr = chain.iter().filter(|s| s.header().is_some()).count();
        assert_eq!(with_hdr, 1, "metadata moved to the synthesized head");
    }

    #[test]
    fn datagram_without_metadata_is_dropped() {
        let pool = pool();
        let mut seg = pool.alloc(AllocMode::DontWait, SegKind::Data).unwrap();
        seg.copy_in(b"junk");
        let bare = Chain::from_segment(seg); // no packet header
        let src = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1234);

        assert!(reassemble_frame(&pool, bare, src, None).is_none());
        assert_eq!(pool.stats().outstanding, 0, "dropped datagram released");
    }

    #[test]
    fn header_allocation_failure_drops_datagram() {
        let pool = SegmentPool::new(1);
        let payload = payload_chain(&pool, b"xyz", None);
        let src = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1234);

        assert!(reassemble_frame(&pool, payload, src, None).is_none());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn missing_ancillary_dst_falls_back_to_unspecified() {
        let pool = pool();
        let payload = payload_chain(&pool, b"abc", None);
        let src = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7);

        let chain = reassemble_frame(&pool, payload, src, None).unwrap();
        assert_eq!(&chain.to_vec()[16..20], &[0, 0, 0, 0]);
    }
}
