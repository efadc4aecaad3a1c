//! Local interface discovery
//!
//! The service hail advertises an endpoint other peers on the same network
//! can reach directly, which is not the wildcard address the socket is
//! bound to.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Enumerate local network interface addresses using libc
///
/// Returns IPv4 and IPv6 addresses from non-loopback interfaces, IPv6
/// link-local addresses excluded.
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() {
                let family = (*ifa.ifa_addr).sa_family as i32;
                if family == libc::AF_INET {
                    let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                    let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                    let ip = Ipv4Addr::from(ip_bytes);

                    if !ip.is_loopback() && !ip.is_unspecified() {
                        addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                    }
                } else if family == libc::AF_INET6 {
                    let sockaddr_in6 = ifa.ifa_addr as *const libc::sockaddr_in6;
                    let ip = Ipv6Addr::from((*sockaddr_in6).sin6_addr.s6_addr);

                    if !ip.is_loopback() && !ip.is_unspecified() && !is_unicast_link_local(&ip) {
                        addrs.push(SocketAddr::new(IpAddr::V6(ip), port));
                    }
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(_port: u16) -> Vec<SocketAddr> {
    Vec::new()
}

/// Endpoint to advertise for a socket bound to `bound`
///
/// A socket bound to a concrete address advertises it as is. A wildcard
/// socket advertises the first interface address of the same family, or the
/// bound address when there is none.
pub fn reachable_endpoint(bound: SocketAddr) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }

    enumerate_local_addresses(bound.port())
        .into_iter()
        .find(|addr| addr.is_ipv4() == bound.is_ipv4())
        .unwrap_or(bound)
}

/// fe80::/10
fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}
