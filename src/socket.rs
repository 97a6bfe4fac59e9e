//! UDP 소켓 생성
//!
//! 세션마다 두 개의 소켓을 사용한다.
//! - rx: 세션 포트에 바인드, 멀티캐스트 그룹 가입 (포트 공유 허용)
//! - tx: 임의 포트 (또는 `tx_port`), TTL / TOS / 루프백 / 인터페이스 적용
//!
//! tokio `UdpSocket`은 생성 후 버퍼 크기 등을 바꿀 수 없으므로 socket2로
//! 옵션을 먼저 적용한 뒤 std 소켓으로 넘긴다.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::{Error, Result};

/// 멀티캐스트 인터페이스 지정
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interface {
    /// IPv4 인터페이스 주소
    Addr(Ipv4Addr),
    /// 인터페이스 이름 (예: eth0)
    Name(String),
}

impl Interface {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("빈 인터페이스 이름".into()));
        }
        Ok(match s.parse::<Ipv4Addr>() {
            Ok(addr) => Interface::Addr(addr),
            Err(_) => Interface::Name(s.to_string()),
        })
    }
}

fn new_socket(address: &SocketAddr) -> Result<Socket> {
    let socket = Socket::new(
        Domain::for_address(*address),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;
    if address.is_ipv6() {
        socket.set_only_v6(false).ok();
    }
    Ok(socket)
}

fn unspecified(address: &SocketAddr, port: u16) -> SocketAddr {
    match address.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    }
}

/// 인터페이스 이름으로 소켓 묶기
#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_device(socket: &Socket, name: &str) -> Result<()> {
    socket.bind_device(Some(name.as_bytes()))?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_device(_socket: &Socket, name: &str) -> Result<()> {
    Err(Error::InvalidAddress(format!(
        "이 플랫폼에서는 인터페이스 이름을 지원하지 않음: {}",
        name
    )))
}

/// 세션 수신 소켓
///
/// 멀티캐스트 주소면 `0.0.0.0:port`에 바인드하고 그룹에 가입한다.
/// 유니캐스트면 세션 포트에 바인드한다.
pub fn bind_rx(address: SocketAddr, config: &SessionConfig) -> Result<std::net::UdpSocket> {
    let socket = new_socket(&address)?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    if let Some(size) = config.rx_socket_buffer {
        socket.set_recv_buffer_size(size)?;
    }

    let interface = config.interface.as_deref().map(Interface::parse).transpose()?;
    let bind_addr = if address.ip().is_multicast() || address.ip().is_unspecified() {
        unspecified(&address, address.port())
    } else {
        address
    };
    socket.bind(&bind_addr.into())?;

    match address.ip() {
        IpAddr::V4(group) if group.is_multicast() => {
            let iface = match &interface {
                Some(Interface::Addr(addr)) => *addr,
                Some(Interface::Name(name)) => {
                    bind_device(&socket, name)?;
                    Ipv4Addr::UNSPECIFIED
                }
                None => Ipv4Addr::UNSPECIFIED,
            };
            socket.join_multicast_v4(&group, &iface)?;
            debug!("멀티캐스트 그룹 가입: {} (interface {})", group, iface);
        }
        IpAddr::V6(group) if group.is_multicast() => {
            if let Some(Interface::Name(name)) = &interface {
                bind_device(&socket, name)?;
            }
            socket.join_multicast_v6(&group, 0)?;
            debug!("멀티캐스트 그룹 가입: {}", group);
        }
        _ => {}
    }

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// 세션 송신 소켓
pub fn bind_tx(address: SocketAddr, config: &SessionConfig) -> Result<std::net::UdpSocket> {
    let socket = new_socket(&address)?;
    if config.tx_port.is_some() {
        socket.set_reuse_address(true)?;
    }
    if let Some(size) = config.tx_socket_buffer {
        socket.set_send_buffer_size(size)?;
    }
    let local = unspecified(&address, config.tx_port.unwrap_or(0));
    socket.bind(&local.into())?;

    let interface = config.interface.as_deref().map(Interface::parse).transpose()?;
    match address.ip() {
        IpAddr::V4(_) => {
            socket.set_multicast_ttl_v4(config.ttl)?;
            socket.set_multicast_loop_v4(config.loopback)?;
            match &interface {
                Some(Interface::Addr(addr)) => socket.set_multicast_if_v4(addr)?,
                Some(Interface::Name(name)) => bind_device(&socket, name)?,
                None => {}
            }
            if let Some(tos) = config.tos {
                // 일부 플랫폼은 TOS 설정을 막는다
                if let Err(e) = socket.set_tos(tos) {
                    warn!("TOS {} 설정 실패: {}", tos, e);
                }
            }
        }
        IpAddr::V6(_) => {
            socket.set_multicast_hops_v6(config.ttl)?;
            socket.set_multicast_loop_v6(config.loopback)?;
            if let Some(Interface::Name(name)) = &interface {
                bind_device(&socket, name)?;
            }
        }
    }

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
