use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dhcp_core::model::Request;
use dhcproto::v4::Message;
use dhcproto::{Decodable, Decoder, Encodable};
use nix::libc;
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn};
use nix::sys::uio::IoSliceMut;
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::broadcast::BroadcastResponder;
use crate::error::{NetError, NetResult};

/// Transport abstraction a `RequestProcessor` drives. Mirrors
/// `original_source/dhcp/socket.go`'s `Socket` interface: one call to
/// receive the next inbound datagram, one to unicast a reply, one to
/// broadcast a reply at the link layer for clients without an IP yet.
#[async_trait]
pub trait Socket: Send + Sync {
    async fn next_request(&self) -> NetResult<Request>;
    async fn send_unicast(&self, dst: SocketAddr, giaddr: Ipv4Addr, message: &Message) -> NetResult<()>;
    async fn send_broadcast(&self, interface: &str, client_ip: Ipv4Addr, message: &Message) -> NetResult<()>;
}

/// A UDP socket bound to port 67 (or a configured port), recovering the
/// arrival interface from `IP_PKTINFO`-equivalent ancillary data the way
/// the Go implementation recovers it from `ipv4.ControlMessage.IfIndex`.
///
/// Broadcast responders are created lazily, one per interface, and kept
/// alive for the socket's lifetime (`original_source/dhcp/socket.go`'s
/// `bcResponders` map).
pub struct UnicastSocket {
    inner: Arc<UdpSocket>,
    interface_index: HashMap<i32, String>,
    responders: RwLock<HashMap<String, Arc<BroadcastResponder>>>,
}

impl UnicastSocket {
    pub async fn bind(listen_address: &str, interface_index: HashMap<i32, String>) -> NetResult<UnicastSocket> {
        let inner = UdpSocket::bind(listen_address).await?;
        inner.set_broadcast(true)?;
        setsockopt(&inner, sockopt::Ipv4PacketInfo, &true)
            .map_err(|e| NetError::SocketPermanent(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(UnicastSocket {
            inner: Arc::new(inner),
            interface_index,
            responders: RwLock::new(HashMap::new()),
        })
    }

    fn responder_for(&self, interface: &str) -> NetResult<Arc<BroadcastResponder>> {
        if let Some(r) = self.responders.read().unwrap().get(interface) {
            return Ok(r.clone());
        }
        let mut responders = self.responders.write().unwrap();
        if let Some(r) = responders.get(interface) {
            return Ok(r.clone());
        }
        let responder = Arc::new(BroadcastResponder::new(interface)?);
        responders.insert(interface.to_string(), responder.clone());
        Ok(responder)
    }
}

#[async_trait]
impl Socket for UnicastSocket {
    async fn next_request(&self) -> NetResult<Request> {
        let mut buf = vec![0u8; 1 << 16];
        let (n, src, ifindex) = loop {
            self.inner.readable().await?;
            let fd = self.inner.as_raw_fd();
            let mut iov = [IoSliceMut::new(&mut buf)];
            let mut cmsg_buf = nix::cmsg_space!(libc::in_pktinfo);
            let io_result = self.inner.try_io(Interest::READABLE, || {
                recvmsg::<SockaddrIn>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
            match io_result {
                Ok(msg) => {
                    let n = msg.bytes;
                    let src = msg
                        .address
                        .map(|sin| SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::from(sin.ip())), sin.port()))
                        .ok_or_else(|| NetError::Codec("datagram had no sender address".to_string()))?;
                    let ifindex = msg
                        .cmsgs()
                        .ok()
                        .into_iter()
                        .flatten()
                        .find_map(|cmsg| match cmsg {
                            ControlMessageOwned::Ipv4PacketInfo(pktinfo) => Some(pktinfo.ipi_ifindex),
                            _ => None,
                        });
                    break (n, src, ifindex);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        };

        let message = Message::decode(&mut Decoder::new(&buf[..n]))
            .map_err(|e| NetError::Codec(e.to_string()))?;

        // Arrival interface recovered from IP_PKTINFO's ifindex (set via
        // `bind`'s `IP_PKTINFO` sockopt), looked up against the real
        // ifindex->name map `main.rs` builds from `getifaddrs`.
        let interface_name = ifindex
            .and_then(|idx| self.interface_index.get(&idx).cloned())
            .unwrap_or_else(|| "*".to_string());

        Ok(Request {
            message,
            src,
            interface_name,
            dst: Ipv4Addr::UNSPECIFIED,
        })
    }

    async fn send_unicast(&self, dst: SocketAddr, giaddr: Ipv4Addr, message: &Message) -> NetResult<()> {
        // Resolve the local address the kernel would pick to reach
        // `giaddr`/`dst` via a transient dial, the same trick
        // `original_source/dhcp/socket.go::getSrcAddr` uses, so the
        // server-identifier option matches the interface actually used.
        let src = transient_local_addr(if giaddr.is_unspecified() { dst.ip() } else { std::net::IpAddr::V4(giaddr) }).await?;
        debug!(%src, %dst, "unicast reply");
        let bytes = message
            .to_vec()
            .map_err(|e| NetError::Codec(e.to_string()))?;
        self.inner.send_to(&bytes, dst).await?;
        Ok(())
    }

    async fn send_broadcast(&self, interface: &str, client_ip: Ipv4Addr, message: &Message) -> NetResult<()> {
        let chaddr = message.chaddr();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&chaddr[..6]);
        let responder = self.responder_for(interface)?;
        let server_ip = match message.opts().get(dhcproto::v4::OptionCode::ServerIdentifier) {
            Some(&dhcproto::v4::DhcpOption::ServerIdentifier(ip)) => ip,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        let message = message.clone();
        tokio::task::spawn_blocking(move || responder.send(&message, mac, client_ip, server_ip))
            .await
            .map_err(|e| NetError::Codec(e.to_string()))??;
        Ok(())
    }
}

async fn transient_local_addr(dst: std::net::IpAddr) -> NetResult<std::net::IpAddr> {
    let probe = UdpSocket::bind("0.0.0.0:0").await?;
    probe.connect(SocketAddr::new(dst, 123)).await?;
    Ok(probe.local_addr()?.ip())
}

/// In-memory `Socket` used by pipeline tests: requests are fed in, sent
/// replies are captured for assertions.
#[cfg(test)]
pub struct MockSocket {
    pub inbox: tokio::sync::Mutex<std::collections::VecDeque<Request>>,
    pub unicast_sent: tokio::sync::Mutex<Vec<(SocketAddr, Message)>>,
    pub broadcast_sent: tokio::sync::Mutex<Vec<(String, Message)>>,
}

#[cfg(test)]
impl MockSocket {
    pub fn new(requests: Vec<Request>) -> MockSocket {
        MockSocket {
            inbox: tokio::sync::Mutex::new(requests.into()),
            unicast_sent: tokio::sync::Mutex::new(Vec::new()),
            broadcast_sent: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Socket for MockSocket {
    async fn next_request(&self) -> NetResult<Request> {
        loop {
            if let Some(req) = self.inbox.lock().await.pop_front() {
                return Ok(req);
            }
            tokio::task::yield_now().await;
        }
    }

    async fn send_unicast(&self, dst: SocketAddr, _giaddr: Ipv4Addr, message: &Message) -> NetResult<()> {
        self.unicast_sent.lock().await.push((dst, message.clone()));
        Ok(())
    }

    async fn send_broadcast(&self, interface: &str, _client_ip: Ipv4Addr, message: &Message) -> NetResult<()> {
        self.broadcast_sent
            .lock()
            .await
            .push((interface.to_string(), message.clone()));
        Ok(())
    }
}
