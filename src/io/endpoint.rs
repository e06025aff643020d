//! IPv4 endpoint conversions between `SocketAddr` and the C socket types.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub(crate) fn to_sockaddr_in(addr: &SocketAddr) -> io::Result<libc::sockaddr_in> {
    let v4 = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only IPv4 endpoints are supported",
            ));
        }
    };

    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = v4.port().to_be();
    raw.sin_addr = libc::in_addr {
        s_addr: u32::from(*v4.ip()).to_be(),
    };
    Ok(raw)
}

pub(crate) fn from_sockaddr_in(raw: &libc::sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
    SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(raw.sin_port)))
}

pub(crate) fn local_endpoint(fd: i32) -> io::Result<SocketAddr> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr_in(&raw))
}

pub(crate) fn peer_endpoint(fd: i32) -> io::Result<SocketAddr> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(from_sockaddr_in(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr: SocketAddr = "192.0.2.7:4455".parse().unwrap();
        let raw = to_sockaddr_in(&addr).unwrap();
        assert_eq!(from_sockaddr_in(&raw), addr);
    }

    #[test]
    fn v6_is_rejected() {
        let addr: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(to_sockaddr_in(&addr).is_err());
    }
}
