use std::ffi::CStr;
use std::net::Ipv4Addr;

use crate::error::{Result, TransportError};

/// An IPv4 address configured on a local network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: Ipv4Addr,
    pub up: bool,
    pub loopback: bool,
    pub multicast: bool,
}

/// List every IPv4 address configured on the host's interfaces.
pub fn ipv4_interfaces() -> Result<Vec<InterfaceAddr>> {
    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();

    // SAFETY: `addrs` is a valid out-pointer; on success the list is released
    // below with `freeifaddrs`.
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }

    let mut found = Vec::new();
    let mut cursor = addrs;
    while !cursor.is_null() {
        // SAFETY: `cursor` is a node of the list returned by `getifaddrs`,
        // which stays alive until `freeifaddrs`.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }

        // SAFETY: `ifa_addr` is non-null and points to a `sockaddr`.
        let family = unsafe { (*entry.ifa_addr).sa_family };
        if i32::from(family) != libc::AF_INET {
            continue;
        }

        // SAFETY: the family is AF_INET, so the address is a `sockaddr_in`.
        let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
        // SAFETY: `ifa_name` is a NUL-terminated string owned by the list.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) };

        let flags = entry.ifa_flags as libc::c_int;
        found.push(InterfaceAddr {
            name: name.to_string_lossy().into_owned(),
            addr: Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
            up: flags & libc::IFF_UP != 0,
            loopback: flags & libc::IFF_LOOPBACK != 0,
            multicast: flags & libc::IFF_MULTICAST != 0,
        });
    }

    // SAFETY: `addrs` came from a successful `getifaddrs` call and is freed once.
    unsafe { libc::freeifaddrs(addrs) };

    Ok(found)
}

/// Resolve a network interface name (for example `eth0`) to its first IPv4 address.
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr> {
    ipv4_interfaces()?
        .into_iter()
        .find(|iface| iface.name == name)
        .map(|iface| iface.addr)
        .ok_or_else(|| TransportError::InterfaceNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn loopback_resolves() {
        let addr = interface_ipv4("lo").expect("loopback should have an IPv4 address");
        assert!(addr.is_loopback());
    }

    #[test]
    fn listing_includes_a_loopback_address() {
        let all = ipv4_interfaces().expect("interfaces should be listable");
        assert!(all.iter().any(|iface| iface.loopback && iface.addr.is_loopback()));
    }

    #[test]
    fn unknown_interface_is_not_found() {
        let err = interface_ipv4("subwire-none0").unwrap_err();
        assert!(matches!(err, TransportError::InterfaceNotFound(name) if name == "subwire-none0"));
    }
}
