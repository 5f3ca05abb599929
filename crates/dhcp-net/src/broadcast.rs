use std::net::Ipv4Addr;
use std::sync::Mutex;

use dhcproto::Encodable;
use nix::libc;
use tracing::{debug, info};

use crate::error::{NetError, NetResult};

const ETH_P_IP: u16 = 0x0800;
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

/// Sends a DHCPv4 reply as a raw, broadcast Ethernet frame, for clients
/// that can't yet receive a unicast UDP datagram (no IP configured).
/// One instance is created lazily per interface and kept in
/// `UnicastSocket`'s responder map.
///
/// Grounded on the "build static eth/ip/udp layers once, mutate the
/// per-send fields" shape `original_source/dhcp/broadcast_responder.go`
/// uses, adapted to hand-rolled header serialization over an
/// `AF_PACKET`/`SOCK_RAW` socket since this engine does not carry a
/// packet-layering crate (the teacher's unused `pnet` dependency is
/// dropped, see DESIGN.md).
pub struct BroadcastResponder {
    fd: i32,
    ifindex: i32,
    src_mac: [u8; 6],
    send_lock: Mutex<()>,
}

impl BroadcastResponder {
    pub fn new(interface: &str) -> NetResult<BroadcastResponder> {
        let ifindex = if_nametoindex(interface)?;
        let src_mac = interface_hw_addr(interface)?;

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (ETH_P_IP.to_be() as i32) as i32,
            )
        };
        if fd < 0 {
            return Err(NetError::SocketPermanent(std::io::Error::last_os_error()));
        }
        let reuse: i32 = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &reuse as *const _ as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(NetError::SocketPermanent(std::io::Error::last_os_error()));
        }

        Ok(BroadcastResponder {
            fd,
            ifindex,
            src_mac,
            send_lock: Mutex::new(()),
        })
    }

    /// Serialize `message` into an Ethernet/IPv4/UDP broadcast frame
    /// addressed to `client_mac` and send it out the raw socket.
    /// `client_ip` becomes the frame's IPv4 destination (`resp.yourIpAddr`
    /// per `original_source/dhcp/broadcast_responder.go`) — the client
    /// has no address configured yet, so this only matters to the kernel
    /// stack reading the frame off the wire, but it must still match
    /// what the client was offered.
    pub fn send(
        &self,
        message: &dhcproto::v4::Message,
        client_mac: [u8; 6],
        client_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
    ) -> NetResult<()> {
        let _guard = self.send_lock.lock().unwrap();
        let payload = message
            .to_vec()
            .map_err(|e| NetError::Codec(e.to_string()))?;
        let frame = build_frame(self.src_mac, client_mac, server_ip, client_ip, &payload);

        let dest = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: ETH_P_IP.to_be(),
            sll_ifindex: self.ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 6,
            sll_addr: {
                let mut a = [0u8; 8];
                a[..6].copy_from_slice(&client_mac);
                a
            },
        };

        let sent = unsafe {
            libc::sendto(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &dest as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(NetError::SocketPermanent(std::io::Error::last_os_error()));
        }
        debug!(bytes = sent, "sent broadcast DHCP reply");
        Ok(())
    }
}

impl Drop for BroadcastResponder {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn if_nametoindex(name: &str) -> NetResult<i32> {
    let cname = std::ffi::CString::new(name)
        .map_err(|_| NetError::InvalidInterface(name.to_string()))?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(NetError::InvalidInterface(name.to_string()));
    }
    Ok(idx as i32)
}

fn interface_hw_addr(name: &str) -> NetResult<[u8; 6]> {
    for ifaddr in nix::ifaddrs::getifaddrs()
        .map_err(|e| NetError::SocketPermanent(std::io::Error::from_raw_os_error(e as i32)))?
    {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(addr) = ifaddr.address {
            if let Some(link) = addr.as_link_addr() {
                if let Some(bytes) = link.addr() {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&bytes[..6]);
                    return Ok(mac);
                }
            }
        }
    }
    Err(NetError::InvalidInterface(name.to_string()))
}

fn build_frame(src_mac: [u8; 6], dst_mac: [u8; 6], server_ip: Ipv4Addr, dst_ip: Ipv4Addr, dhcp: &[u8]) -> Vec<u8> {
    let udp_len = 8 + dhcp.len();
    let ip_len = 20 + udp_len;

    let mut frame = Vec::with_capacity(14 + ip_len);

    // Ethernet header
    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ETH_P_IP.to_be_bytes());

    // IPv4 header (checksum patched in after assembly)
    let mut ip_header = Vec::with_capacity(20);
    ip_header.push(0x45); // version 4, IHL 5
    ip_header.push(0); // DSCP/ECN
    ip_header.extend_from_slice(&(ip_len as u16).to_be_bytes());
    ip_header.extend_from_slice(&[0, 0]); // identification
    ip_header.extend_from_slice(&[0x40, 0]); // flags: don't fragment
    ip_header.push(64); // TTL
    ip_header.push(17); // protocol: UDP
    ip_header.extend_from_slice(&[0, 0]); // checksum placeholder
    ip_header.extend_from_slice(&server_ip.octets());
    ip_header.extend_from_slice(&dst_ip.octets());
    let ip_checksum = checksum16(&ip_header);
    ip_header[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    frame.extend_from_slice(&ip_header);

    // UDP header (checksum left as zero: optional over IPv4, matches the
    // original Go implementation which also leaves it unset)
    frame.extend_from_slice(&DHCP_SERVER_PORT.to_be_bytes());
    frame.extend_from_slice(&DHCP_CLIENT_PORT.to_be_bytes());
    frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);

    frame.extend_from_slice(dhcp);
    frame
}

fn checksum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
