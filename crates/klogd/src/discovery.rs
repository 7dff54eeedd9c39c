//! Address discovery - decides whether there is anywhere worth serving.
//!
//! Before a listener is bound the supervisor enumerates the local network
//! interfaces and keeps the IPv4 addresses a remote client could actually
//! reach. Each one is announced; when there are none the attempt is
//! skipped, since the network is most likely still coming up.

use std::ffi::CStr;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// An address assigned to a named network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub addr: IpAddr,
}

impl InterfaceAddr {
    pub fn new(name: impl Into<String>, addr: impl Into<IpAddr>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }

    /// Returns true if a remote client could reach the daemon here.
    ///
    /// Only IPv4 addresses count. Loopback interfaces and addresses in
    /// `0.0.0.0/8` (interfaces without a configured address) are skipped.
    pub fn is_servable(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => {
                !self.name.starts_with("lo") && !v4.is_loopback() && v4.octets()[0] != 0
            }
            IpAddr::V6(_) => false,
        }
    }
}

impl fmt::Display for InterfaceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.name)
    }
}

/// Source of interface addresses.
pub trait InterfaceSource: Send + Sync {
    /// Lists every address currently assigned to a local interface.
    fn interfaces(&self) -> io::Result<Vec<InterfaceAddr>>;
}

/// Reads interface addresses from the operating system via `getifaddrs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> io::Result<Vec<InterfaceAddr>> {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();

        // SAFETY: on success getifaddrs stores the head of a linked list that
        // stays valid until it is passed to freeifaddrs below.
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut found = Vec::new();
        let mut cursor = head;
        while !cursor.is_null() {
            // SAFETY: cursor is a non-null node of the list returned above.
            let entry = unsafe { &*cursor };
            // SAFETY: the entry's name and address pointers come from the same list.
            if let Some(addr) = unsafe { decode_entry(entry) } {
                found.push(addr);
            }
            cursor = entry.ifa_next;
        }

        // SAFETY: head came from a successful getifaddrs call and is freed once.
        unsafe { libc::freeifaddrs(head) };

        Ok(found)
    }
}

/// Converts one `ifaddrs` node into an [`InterfaceAddr`].
///
/// # Safety
///
/// `entry` must be a node of a list returned by `getifaddrs` that has not
/// been freed yet.
unsafe fn decode_entry(entry: &libc::ifaddrs) -> Option<InterfaceAddr> {
    if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
        return None;
    }

    let name = CStr::from_ptr(entry.ifa_name).to_string_lossy().into_owned();
    let family = i32::from((*entry.ifa_addr).sa_family);

    let addr = if family == libc::AF_INET {
        let sin = &*(entry.ifa_addr as *const libc::sockaddr_in);
        IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
    } else if family == libc::AF_INET6 {
        let sin6 = &*(entry.ifa_addr as *const libc::sockaddr_in6);
        IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr))
    } else {
        return None;
    };

    Some(InterfaceAddr { name, addr })
}

/// A fixed interface list, for hosts where enumeration is not wanted and
/// for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticInterfaces(pub Vec<InterfaceAddr>);

impl InterfaceSource for StaticInterfaces {
    fn interfaces(&self) -> io::Result<Vec<InterfaceAddr>> {
        Ok(self.0.clone())
    }
}

/// Keeps only the addresses a remote client could connect to.
pub fn servable_addresses(interfaces: &[InterfaceAddr]) -> Vec<InterfaceAddr> {
    interfaces
        .iter()
        .filter(|iface| iface.is_servable())
        .cloned()
        .collect()
}

/// Human-readable "now serving" line for one address.
pub fn announcement(source: &Path, iface: &InterfaceAddr, port: u16) -> String {
    format!(
        "Serving {} on {}:{} ({})",
        source.display(),
        iface.addr,
        port,
        iface.name
    )
}
