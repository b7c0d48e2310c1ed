/*! Native socket transport.

Two UDP endpoints per module, both bound to the any-address so loopback and
LAN traffic coexist: the control endpoint on [`CONTROL_PORT`] and the sample
endpoint on [`SAMPLE_PORT`]. On a real network the control plane is the
well-known multicast group; when the local address is loopback (simulator on
one host) it falls back to limited broadcast, which is what survives
loopback's unreliable multicast delivery.

Both sockets allow address reuse so that several modules can share one host.
The protocol only ever exchanges UDP datagrams on well-known ports, which is
what makes the reuse acceptable.
*/

use core::mem::MaybeUninit;
use std::io;
use std::net::IpAddr::V4;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use ipnet::Ipv4Net;
use local_ip_address::list_afinet_netifas;
use socket2::{Domain, Protocol, Socket, Type};

use crate::{derive_output_group, Error, Transport, CONTROL_GROUP, CONTROL_PORT, SAMPLE_PORT};

const PREFERRED_SUBNET: &str = "10.0.0.0/8";
const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);
const SAMPLE_TIMEOUT: Duration = Duration::from_millis(10);
const BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

impl From<local_ip_address::Error> for Error {
    fn from(_: local_ip_address::Error) -> Self {
        Error::Network
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(_: ipnet::AddrParseError) -> Self {
        Error::Parse
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(_: std::net::AddrParseError) -> Self {
        Error::Parse
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::NoData,
            _ => Error::Network,
        }
    }
}

pub struct NativeTransport {
    control_socket: Socket,
    sample_socket: Socket,
    control_dest: SocketAddrV4,
    local_addr: Ipv4Addr,
}

impl NativeTransport {
    /// Discover the local address and bind both endpoints. A bind failure
    /// here aborts module construction; there is no partial operation.
    pub fn new() -> Result<Self, Error> {
        Self::with_addr(discover_local_addr()?)
    }

    pub fn with_addr(local_addr: Ipv4Addr) -> Result<Self, Error> {
        let control_socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        control_socket.set_reuse_address(true)?;
        #[cfg(unix)]
        control_socket.set_reuse_port(true)?;
        control_socket.set_read_timeout(Some(CONTROL_TIMEOUT))?;
        control_socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, CONTROL_PORT)).into())?;
        let control_dest = if local_addr.is_loopback() {
            control_socket.set_broadcast(true)?;
            SocketAddrV4::new(BROADCAST, CONTROL_PORT)
        } else {
            control_socket.join_multicast_v4(&CONTROL_GROUP, &local_addr)?;
            control_socket.set_multicast_loop_v4(true)?;
            SocketAddrV4::new(CONTROL_GROUP, CONTROL_PORT)
        };
        info!("control plane at {} via {}", local_addr, control_dest);

        let sample_socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sample_socket.set_reuse_address(true)?;
        #[cfg(unix)]
        sample_socket.set_reuse_port(true)?;
        sample_socket.set_read_timeout(Some(SAMPLE_TIMEOUT))?;
        sample_socket.set_multicast_loop_v4(true)?;
        sample_socket.set_multicast_ttl_v4(1)?;
        sample_socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, SAMPLE_PORT)).into())?;

        Ok(NativeTransport {
            control_socket,
            sample_socket,
            control_dest,
            local_addr,
        })
    }
}

fn discover_local_addr() -> Result<Ipv4Addr, Error> {
    let ips = list_afinet_netifas()?;
    let preferred: Ipv4Net = PREFERRED_SUBNET.parse()?;
    let mut local_addr = Ipv4Addr::LOCALHOST;
    for (name, ip) in ips {
        if let V4(addr) = ip {
            info!("found address {:?} on {:?}", addr, name);
            if preferred.contains(&addr) {
                local_addr = addr;
            } else if local_addr.is_loopback() && !addr.is_loopback() {
                local_addr = addr;
            }
        }
    }
    info!("using local address {:?}", local_addr);
    Ok(local_addr)
}

fn recv_from(socket: &Socket, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
    // Safety: `recv_from` promises not to write uninitialised bytes into the
    // buffer, so viewing it as MaybeUninit is sound.
    let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let (size, addr) = socket.recv_from(uninit)?;
    let addr = addr.as_socket().ok_or(Error::Network)?;
    Ok((size, addr))
}

fn send_to(socket: &Socket, dest: SocketAddrV4, buf: &[u8]) -> Result<(), Error> {
    match socket.send_to(buf, &dest.into()) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(_) => Err(Error::Network),
    }
}

impl Transport for NativeTransport {
    fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    fn recv_control(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let (size, _) = recv_from(&self.control_socket, buf)?;
        Ok(size)
    }

    fn send_control(&self, buf: &[u8]) -> Result<(), Error> {
        send_to(&self.control_socket, self.control_dest, buf)
    }

    fn send_control_to(&self, addr: Ipv4Addr, buf: &[u8]) -> Result<(), Error> {
        send_to(&self.control_socket, SocketAddrV4::new(addr, CONTROL_PORT), buf)
    }

    fn recv_sample(&self, buf: &mut [u8]) -> Result<(usize, Ipv4Addr), Error> {
        let (size, addr) = recv_from(&self.sample_socket, buf)?;
        match addr {
            SocketAddr::V4(src) => Ok((size, derive_output_group(*src.ip()))),
            _ => Err(Error::Network),
        }
    }

    fn send_sample(&self, group: Ipv4Addr, buf: &[u8]) -> Result<(), Error> {
        send_to(&self.sample_socket, SocketAddrV4::new(group, SAMPLE_PORT), buf)
    }

    fn join_group(&self, group: Ipv4Addr) -> Result<(), Error> {
        self.sample_socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        Ok(())
    }

    fn leave_group(&self, group: Ipv4Addr) -> Result<(), Error> {
        self.sample_socket
            .leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        Ok(())
    }
}
