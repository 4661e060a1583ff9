//! Link endpoints — where frames meet the wire.
//!
//! The engine talks to the link through the narrow [`RawLink`] contract:
//! opaque byte buffers in, opaque byte buffers out, plus the local MAC.
//! [`PacketSocket`] is the production implementation over an AF_PACKET
//! socket; [`memory::MemoryHub`] wires engines together in-process for
//! tests and demos.

use std::io;

use qbol_core::mac::MacAddr;

pub mod memory;

#[cfg(target_os = "linux")]
pub use packet::PacketSocket;

/// A raw L2 endpoint.
///
/// Must be usable concurrently by one sending and one receiving thread.
/// `recv` blocks with a short internal timeout and reports it as
/// `WouldBlock` or `TimedOut`, so a polling loop can observe a stop flag.
pub trait RawLink: Send + Sync + 'static {
    /// Write one fully-formed Ethernet frame to the wire.
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Read the next frame of any EtherType into `buf`, returning its
    /// length. The receiver filters.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// The hardware address of the local endpoint.
    fn local_mac(&self) -> MacAddr;

    /// Release the endpoint. Default: no-op; reads drain via their timeout.
    fn close(&self) {}
}

#[cfg(target_os = "linux")]
mod packet {
    use std::io;
    use std::mem;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    use socket2::{Domain, Protocol, Socket, Type};

    use qbol_core::mac::MacAddr;

    use super::RawLink;
    use crate::error::EngineError;

    /// How long one blocking read waits before surfacing `WouldBlock`.
    const READ_TIMEOUT: Duration = Duration::from_millis(200);

    /// An AF_PACKET/SOCK_RAW socket bound to one interface.
    pub struct PacketSocket {
        socket: Socket,
        mac: MacAddr,
        interface: String,
    }

    impl PacketSocket {
        /// Open a raw socket on the named interface.
        ///
        /// Requires CAP_NET_RAW. Failures map to the two fatal engine
        /// errors: a missing interface is `InterfaceUnavailable`, a
        /// privilege problem is `PermissionDenied`.
        pub fn bind(interface: &str) -> Result<Self, EngineError> {
            let index = if_index(interface)?;

            // ETH_P_ALL in network byte order; the receiver filters by
            // EtherType itself.
            let protocol = (libc::ETH_P_ALL as u16).to_be() as i32;
            let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(protocol)))
                .map_err(|e| classify(interface, e))?;

            let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
            addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
            addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
            addr.sll_ifindex = index as libc::c_int;

            let rc = unsafe {
                libc::bind(
                    socket.as_raw_fd(),
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                return Err(classify(interface, io::Error::last_os_error()));
            }

            socket
                .set_read_timeout(Some(READ_TIMEOUT))
                .map_err(|e| classify(interface, e))?;

            let mac = hardware_addr(socket.as_raw_fd(), interface)?;

            tracing::info!(interface, %mac, "raw socket bound");
            Ok(Self {
                socket,
                mac,
                interface: interface.to_string(),
            })
        }

        pub fn interface(&self) -> &str {
            &self.interface
        }
    }

    impl RawLink for PacketSocket {
        fn send(&self, frame: &[u8]) -> io::Result<()> {
            self.socket.send(frame)?;
            Ok(())
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            // recv never writes uninitialized bytes into the buffer, it
            // only fills a prefix; the cast satisfies socket2's signature.
            let uninit = unsafe {
                &mut *(buf as *mut [u8] as *mut [mem::MaybeUninit<u8>])
            };
            self.socket.recv(uninit)
        }

        fn local_mac(&self) -> MacAddr {
            self.mac
        }
    }

    /// Get the OS interface index for a named network interface.
    fn if_index(name: &str) -> Result<u32, EngineError> {
        let name_cstr = std::ffi::CString::new(name)
            .map_err(|_| EngineError::InterfaceUnavailable(name.to_string()))?;
        let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
        if index == 0 {
            return Err(EngineError::InterfaceUnavailable(name.to_string()));
        }
        Ok(index)
    }

    /// Read the interface's hardware address via SIOCGIFHWADDR.
    fn hardware_addr(fd: i32, interface: &str) -> Result<MacAddr, EngineError> {
        let name = interface.as_bytes();
        if name.len() >= libc::IFNAMSIZ {
            return Err(EngineError::InterfaceUnavailable(interface.to_string()));
        }

        let mut req: libc::ifreq = unsafe { mem::zeroed() };
        for (dst, src) in req.ifr_name.iter_mut().zip(name) {
            *dst = *src as libc::c_char;
        }

        let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR as _, &mut req as *mut libc::ifreq) };
        if rc != 0 {
            return Err(classify(interface, io::Error::last_os_error()));
        }

        let hw = unsafe { req.ifr_ifru.ifru_hwaddr };
        let mut octets = [0u8; 6];
        for (dst, src) in octets.iter_mut().zip(hw.sa_data.iter()) {
            *dst = *src as u8;
        }
        Ok(MacAddr::new(octets))
    }

    fn classify(interface: &str, err: io::Error) -> EngineError {
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => {
                EngineError::PermissionDenied(interface.to_string())
            }
            Some(libc::ENODEV) | Some(libc::ENXIO) => {
                EngineError::InterfaceUnavailable(interface.to_string())
            }
            _ => EngineError::Io(err),
        }
    }
}
