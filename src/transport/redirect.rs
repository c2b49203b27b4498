//! Transparent-redirect socket helpers (Linux)
//!
//! The packet filter diverts flows here with TPROXY, which requires sockets
//! carrying `IP_TRANSPARENT`; redirected UDP additionally needs
//! `IP_RECVORIGDSTADDR` so the pre-redirect destination arrives as ancillary
//! data on `recvmsg`. Reply sockets bind the original destination as a
//! non-local source address.
//!
//! Expected host configuration (documented, not managed here):
//!
//! ```text
//! iptables -t mangle -A PREROUTING -p tcp -j TPROXY --on-port 7300 --tproxy-mark 0x1
//! iptables -t mangle -A PREROUTING -p udp -j TPROXY --on-port 7300 --tproxy-mark 0x1
//! ip rule add fwmark 0x1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! ```

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::debug;

use crate::error::{Error, Result};

const IP_TRANSPARENT: libc::c_int = 19;
const IP_RECVORIGDSTADDR: libc::c_int = 20;
const IPV6_TRANSPARENT: libc::c_int = 75;
const IPV6_RECVORIGDSTADDR: libc::c_int = 74;

fn setsockopt_int(fd: RawFd, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_transparent(socket: &Socket, v6: bool) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    if v6 {
        setsockopt_int(fd, libc::SOL_IPV6, IPV6_TRANSPARENT, 1)
    } else {
        setsockopt_int(fd, libc::SOL_IP, IP_TRANSPARENT, 1)
    }
}

/// Listen for redirected TCP connections. `local_addr()` of an accepted
/// connection reports the original destination, not ours.
pub fn listen_transparent_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    set_transparent(&socket, addr.is_ipv6())?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Open the redirected-UDP receive socket with original-dst ancillary data
/// enabled.
pub fn listen_transparent_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    set_transparent(&socket, addr.is_ipv6())?;
    let fd = socket.as_raw_fd();
    if addr.is_ipv6() {
        setsockopt_int(fd, libc::SOL_IPV6, IPV6_RECVORIGDSTADDR, 1)?;
    } else {
        setsockopt_int(fd, libc::SOL_IP, IP_RECVORIGDSTADDR, 1)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Open a UDP socket whose *source* is `bind`, which is not a local address.
/// Replies sent through it appear to come from the original destination.
pub fn dial_spoofed_udp(bind: SocketAddr) -> Result<UdpSocket> {
    let domain = if bind.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::DialRemote(e.to_string()))?;
    // Without CAP_NET_ADMIN the option is refused; the bind below still
    // succeeds for genuinely local addresses.
    if let Err(e) = set_transparent(&socket, bind.is_ipv6()) {
        debug!("IP_TRANSPARENT unavailable on reply socket: {}", e);
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::DialRemote(e.to_string()))?;
    socket
        .bind(&bind.into())
        .map_err(|e| Error::DialRemote(format!("bind {}: {}", bind, e)))?;
    Ok(UdpSocket::from_std(socket.into()).map_err(|e| Error::DialRemote(e.to_string()))?)
}

/// Enable keep-alive on the remote side of a relay.
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_keepalive(true)
}

/// Receive one redirected datagram along with its ancillary blob.
///
/// Returns (payload length, ancillary length, source address). The caller
/// passes the ancillary bytes to [`decode_original_dst`].
pub async fn recv_redirected(
    socket: &UdpSocket,
    buf: &mut [u8],
    oob: &mut [u8],
) -> io::Result<(usize, usize, SocketAddr)> {
    loop {
        socket.readable().await?;
        match socket.try_io(Interest::READABLE, || {
            recvmsg_raw(socket.as_raw_fd(), buf, oob)
        }) {
            Ok(res) => return Ok(res),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn recvmsg_raw(fd: RawFd, buf: &mut [u8], oob: &mut [u8]) -> io::Result<(usize, usize, SocketAddr)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut name as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = oob.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = oob.len();

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let src = sockaddr_to_std(&name)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown source family"))?;
    Ok((n as usize, msg.msg_controllen as usize, src))
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let v4: libc::sockaddr_in =
                unsafe { std::ptr::read_unaligned(storage as *const _ as *const _) };
            let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
            Some(SocketAddr::new(ip.into(), u16::from_be(v4.sin_port)))
        }
        libc::AF_INET6 => {
            let v6: libc::sockaddr_in6 =
                unsafe { std::ptr::read_unaligned(storage as *const _ as *const _) };
            let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(v6.sin6_port)))
        }
        _ => None,
    }
}

/// Recover the pre-redirect destination from an ancillary-data blob.
///
/// Pure function over the bytes `recvmsg` wrote into the control buffer; no
/// live socket involved, so it is unit-testable with synthetic blobs.
pub fn decode_original_dst(oob: &[u8]) -> Result<SocketAddr> {
    let hdr_len = mem::size_of::<libc::cmsghdr>();
    let align = mem::size_of::<libc::size_t>();
    let mut off = 0usize;

    while off + hdr_len <= oob.len() {
        let cmsg: libc::cmsghdr =
            unsafe { std::ptr::read_unaligned(oob.as_ptr().add(off) as *const _) };
        let cmsg_len = cmsg.cmsg_len as usize;
        if cmsg_len < hdr_len || off + cmsg_len > oob.len() {
            break;
        }
        let data = &oob[off + hdr_len..off + cmsg_len];

        if cmsg.cmsg_level == libc::SOL_IP
            && cmsg.cmsg_type == IP_RECVORIGDSTADDR
            && data.len() >= mem::size_of::<libc::sockaddr_in>()
        {
            let v4: libc::sockaddr_in =
                unsafe { std::ptr::read_unaligned(data.as_ptr() as *const _) };
            let ip = Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr));
            return Ok(SocketAddr::new(ip.into(), u16::from_be(v4.sin_port)));
        }

        if cmsg.cmsg_level == libc::SOL_IPV6
            && cmsg.cmsg_type == IPV6_RECVORIGDSTADDR
            && data.len() >= mem::size_of::<libc::sockaddr_in6>()
        {
            let v6: libc::sockaddr_in6 =
                unsafe { std::ptr::read_unaligned(data.as_ptr() as *const _) };
            let ip = Ipv6Addr::from(v6.sin6_addr.s6_addr);
            return Ok(SocketAddr::new(ip.into(), u16::from_be(v6.sin6_port)));
        }

        // CMSG_NXTHDR alignment
        off += (cmsg_len + align - 1) & !(align - 1);
    }

    Err(Error::NoOriginalDst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_v4_blob(ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = u32::from(ip).to_be();

        let mut cmsg: libc::cmsghdr = unsafe { mem::zeroed() };
        cmsg.cmsg_len =
            (mem::size_of::<libc::cmsghdr>() + mem::size_of::<libc::sockaddr_in>()) as _;
        cmsg.cmsg_level = libc::SOL_IP;
        cmsg.cmsg_type = IP_RECVORIGDSTADDR;

        let mut blob = Vec::new();
        blob.extend_from_slice(unsafe {
            std::slice::from_raw_parts(
                &cmsg as *const _ as *const u8,
                mem::size_of::<libc::cmsghdr>(),
            )
        });
        blob.extend_from_slice(unsafe {
            std::slice::from_raw_parts(
                &addr as *const _ as *const u8,
                mem::size_of::<libc::sockaddr_in>(),
            )
        });
        blob
    }

    #[test]
    fn test_decode_v4_original_dst() {
        let blob = synthetic_v4_blob(Ipv4Addr::new(8, 8, 8, 8), 53);
        let dst = decode_original_dst(&blob).unwrap();
        assert_eq!(dst, "8.8.8.8:53".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_decode_skips_foreign_cmsg() {
        // A timestamp cmsg first, then the one we want.
        let mut cmsg: libc::cmsghdr = unsafe { mem::zeroed() };
        cmsg.cmsg_len = (mem::size_of::<libc::cmsghdr>() + 8) as _;
        cmsg.cmsg_level = libc::SOL_SOCKET;
        cmsg.cmsg_type = libc::SCM_TIMESTAMP;

        let mut blob = Vec::new();
        blob.extend_from_slice(unsafe {
            std::slice::from_raw_parts(
                &cmsg as *const _ as *const u8,
                mem::size_of::<libc::cmsghdr>(),
            )
        });
        blob.extend_from_slice(&[0u8; 8]);
        blob.extend_from_slice(&synthetic_v4_blob(Ipv4Addr::new(93, 184, 216, 34), 443));

        let dst = decode_original_dst(&blob).unwrap();
        assert_eq!(dst, "93.184.216.34:443".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_decode_missing_is_no_original_dst() {
        assert!(matches!(
            decode_original_dst(&[]),
            Err(Error::NoOriginalDst)
        ));
        assert!(matches!(
            decode_original_dst(&[0u8; 7]),
            Err(Error::NoOriginalDst)
        ));
    }
}
