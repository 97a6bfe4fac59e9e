//! 엔진 인스턴스
//!
//! 여러 세션과 그 소켓을 소유하고, `next_event`에서 소켓 수신 / 타이머 /
//! 페이싱된 전송을 한 번에 구동한다. 애플리케이션 코드는 엔진 안에서
//! 실행되지 않는다 (pull 방식).
//!
//! 세션당 소켓:
//! - tx: 항상 생성. 유니캐스트 피드백(NACK / ACK)도 이 소켓으로 들어온다
//! - rx: 수신자 시작 시, 또는 멀티캐스트 송신자 시작 시 생성

use std::collections::{BTreeMap, VecDeque};
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::time::Sleep;
use tracing::{debug, info, trace, warn};

use crate::config::{InstanceConfig, SenderParams, SessionAddress, SessionConfig};
use crate::event::Event;
use crate::session::{Session, SessionId, Transmit};
use crate::socket;
use crate::{Error, NodeId, Result};

/// 한 번의 poll에서 소켓당 처리할 최대 데이터그램 수
const RECV_BATCH: usize = 64;

struct SessionEntry {
    session: Session,
    tx: UdpSocket,
    rx: Option<UdpSocket>,
    /// WouldBlock으로 보내지 못한 데이터그램
    stalled: Option<Transmit>,
}

impl SessionEntry {
    /// 페이싱이 허락하는 만큼 전송
    fn flush(&mut self, now: Instant) {
        loop {
            let transmit = match self.stalled.take() {
                Some(transmit) => transmit,
                None => match self.session.poll_transmit(now) {
                    Some(transmit) => transmit,
                    None => return,
                },
            };
            match self.tx.try_send_to(&transmit.contents, transmit.destination) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.stalled = Some(transmit);
                    return;
                }
                Err(e) => {
                    warn!(
                        "세션 {} 전송 실패 ({}): {}",
                        self.session.id(),
                        transmit.destination,
                        e
                    );
                    self.session.handle_send_error(&e);
                }
            }
        }
    }

    /// 수신 가능한 데이터그램 처리. 하나라도 처리하면 true
    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<bool>> {
        let mut progressed = false;
        let Self { session, tx, rx, .. } = &mut *self;
        for socket in std::iter::once(&*tx).chain(rx.as_ref()) {
            for _ in 0..RECV_BATCH {
                let mut read = ReadBuf::new(buf);
                match socket.poll_recv_from(cx, &mut read) {
                    Poll::Ready(Ok(src)) => {
                        session.handle_datagram(Instant::now(), src, read.filled(), false);
                        progressed = true;
                    }
                    // ICMP port unreachable 등 (Windows)
                    Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                        trace!("세션 {} 수신 무시: {}", session.id(), e);
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => break,
                }
            }
        }
        if self.stalled.is_some() {
            if let Poll::Ready(ready) = self.tx.poll_send_ready(cx) {
                ready?;
                progressed = true;
            }
        }
        Poll::Ready(Ok(progressed))
    }
}

/// NORM 엔진 인스턴스
pub struct Instance {
    config: InstanceConfig,
    cache_dir: PathBuf,
    sessions: BTreeMap<SessionId, SessionEntry>,
    next_session_id: SessionId,
    events: VecDeque<Event>,
    recv_buf: Vec<u8>,
}

impl Instance {
    /// 새 인스턴스 (tokio 런타임 안에서 호출)
    pub fn new(config: InstanceConfig) -> Result<Self> {
        tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let cache_dir = config.cache_dir.clone().unwrap_or_else(std::env::temp_dir);
        let recv_buf = vec![0u8; config.recv_buffer_size.max(1)];
        info!("NORM 인스턴스 생성 (cache: {})", cache_dir.display());
        Ok(Self {
            config,
            cache_dir,
            sessions: BTreeMap::new(),
            next_session_id: 1,
            events: VecDeque::new(),
            recv_buf,
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn cache_directory(&self) -> &Path {
        &self.cache_dir
    }

    /// 수신 FILE 객체 캐시 디렉토리 (이후 생성하는 세션부터 적용)
    pub fn set_cache_directory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::InvalidParameter(format!(
                "캐시 디렉토리가 아님: {}",
                path.display()
            )));
        }
        self.cache_dir = path.to_path_buf();
        Ok(())
    }

    /// 세션 생성 (tx 소켓 바인드)
    pub fn create_session(
        &mut self,
        address: SessionAddress,
        node_id: NodeId,
        config: SessionConfig,
    ) -> Result<SessionId> {
        let id = self.next_session_id;
        let addr = address.socket_addr();
        let seed = self.config.rng_seed.map(|seed| seed.wrapping_add(id as u64));
        let tx = socket::bind_tx(addr, &config)?;
        let tx = UdpSocket::from_std(tx)?;
        let session = Session::new(id, addr, node_id, config, &self.cache_dir, seed, Instant::now())?;

        self.next_session_id += 1;
        self.sessions.insert(
            id,
            SessionEntry {
                session,
                tx,
                rx: None,
                stalled: None,
            },
        );
        Ok(id)
    }

    /// 세션 삭제 (송수신 즉시 중단)
    pub fn destroy_session(&mut self, id: SessionId) -> Result<()> {
        let mut entry = self.sessions.remove(&id).ok_or(Error::UnknownSession(id))?;
        entry.session.stop_sender(false);
        entry.session.stop_receiver();
        self.events.retain(|e| e.session != id);
        info!("세션 {} 삭제", id);
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn session(&self, id: SessionId) -> Result<&Session> {
        self.sessions
            .get(&id)
            .map(|e| &e.session)
            .ok_or(Error::UnknownSession(id))
    }

    pub fn session_mut(&mut self, id: SessionId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&id)
            .map(|e| &mut e.session)
            .ok_or(Error::UnknownSession(id))
    }

    fn entry_mut(&mut self, id: SessionId) -> Result<&mut SessionEntry> {
        self.sessions.get_mut(&id).ok_or(Error::UnknownSession(id))
    }

    fn open_rx(entry: &mut SessionEntry) -> Result<()> {
        if entry.rx.is_none() {
            let rx = socket::bind_rx(entry.session.address(), entry.session.config())?;
            let rx = UdpSocket::from_std(rx)?;
            debug!("세션 {} rx 소켓: {:?}", entry.session.id(), rx.local_addr());
            entry.rx = Some(rx);
        }
        Ok(())
    }

    /// 송신자 시작 (멀티캐스트 세션은 그룹의 NACK 청취용 rx 소켓도 연다)
    pub fn start_sender(&mut self, id: SessionId, params: SenderParams) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.session.start_sender(params, Instant::now())?;
        if entry.session.address().ip().is_multicast() {
            if let Err(e) = Self::open_rx(entry) {
                entry.session.stop_sender(false);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn stop_sender(&mut self, id: SessionId, graceful: bool) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.session.stop_sender(graceful);
        if !entry.session.is_receiver_started() && !entry.session.is_sender_started() {
            entry.rx = None;
        }
        Ok(())
    }

    /// 수신자 시작 (세션 포트 바인드 + 그룹 가입)
    pub fn start_receiver(&mut self, id: SessionId, buffer_space: u64) -> Result<()> {
        let entry = self.entry_mut(id)?;
        Self::open_rx(entry)?;
        if let Err(e) = entry.session.start_receiver(buffer_space) {
            if !entry.session.is_sender_started() {
                entry.rx = None;
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn stop_receiver(&mut self, id: SessionId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.session.stop_receiver();
        let keep = entry.session.is_sender_started() && entry.session.address().ip().is_multicast();
        if !keep {
            entry.rx = None;
        }
        Ok(())
    }

    /// rx 소켓 로컬 주소 (열려 있으면)
    pub fn rx_local_addr(&self, id: SessionId) -> Result<Option<SocketAddr>> {
        let entry = self.sessions.get(&id).ok_or(Error::UnknownSession(id))?;
        entry.rx.as_ref().map(|rx| rx.local_addr()).transpose().map_err(Error::from)
    }

    /// tx 소켓 로컬 주소
    pub fn tx_local_addr(&self, id: SessionId) -> Result<SocketAddr> {
        let entry = self.sessions.get(&id).ok_or(Error::UnknownSession(id))?;
        Ok(entry.tx.local_addr()?)
    }

    /// 타이머 처리 + 전송 + 이벤트 수집
    fn service(&mut self) {
        let now = Instant::now();
        for entry in self.sessions.values_mut() {
            if matches!(entry.session.poll_timeout(), Some(at) if at <= now) {
                entry.session.handle_timeout(now);
            }
            entry.flush(now);
            while let Some(event) = entry.session.poll_event() {
                self.events.push_back(event);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.sessions
            .values()
            .filter(|e| e.stalled.is_none())
            .filter_map(|e| e.session.poll_timeout())
            .min()
    }

    /// 다음 이벤트
    ///
    /// - `Ok(Some(event))`: 이벤트
    /// - `Ok(None)`: `timeout` 만료, 또는 세션이 하나도 없음 (`timeout`이 None일 때)
    /// - `Err`: 소켓 오류 (인스턴스를 다시 만들어야 함)
    ///
    /// 취소해도 안전하다 (처리한 데이터그램과 이벤트는 유실되지 않음).
    pub async fn next_event(&mut self, timeout: Option<Duration>) -> Result<Option<Event>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.service();
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if matches!(deadline, Some(at) if Instant::now() >= at) {
                return Ok(None);
            }
            if self.sessions.is_empty() && deadline.is_none() {
                return Ok(None);
            }

            let wake = [self.next_wakeup(), deadline].into_iter().flatten().min();
            self.wait(wake).await?;
        }
    }

    /// 소켓 수신 또는 `wake`까지 대기
    async fn wait(&mut self, wake: Option<Instant>) -> Result<()> {
        let mut sleep: Option<Pin<Box<Sleep>>> =
            wake.map(|at| Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(at))));
        let Self {
            sessions, recv_buf, ..
        } = &mut *self;

        poll_fn(|cx| {
            let mut progressed = false;
            for entry in sessions.values_mut() {
                match entry.poll_recv(cx, &mut recv_buf[..]) {
                    Poll::Ready(Ok(p)) => progressed |= p,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(Error::Io(e))),
                    Poll::Pending => {}
                }
            }
            if progressed {
                return Poll::Ready(Ok(()));
            }
            match sleep.as_mut() {
                Some(sleep) => sleep.as_mut().poll(cx).map(Ok),
                None => Poll::Pending,
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            Instance::new(InstanceConfig::default()),
            Err(Error::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let mut instance = Instance::new(InstanceConfig::default()).unwrap();
        let address: SessionAddress = "127.0.0.1/0".parse().unwrap();
        let id = instance.create_session(address, 5, SessionConfig::default()).unwrap();
        assert_eq!(instance.session_ids(), vec![id]);
        assert_eq!(instance.session(id).unwrap().node_id(), 5);
        assert!(instance.rx_local_addr(id).unwrap().is_none());

        instance.start_receiver(id, 1 << 20).unwrap();
        assert!(instance.rx_local_addr(id).unwrap().is_some());
        instance.stop_receiver(id).unwrap();
        assert!(instance.rx_local_addr(id).unwrap().is_none());

        instance.destroy_session(id).unwrap();
        assert!(matches!(instance.session(id), Err(Error::UnknownSession(_))));
        assert!(instance.next_event(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_user_timer_event() {
        let mut instance = Instance::new(InstanceConfig::default()).unwrap();
        let id = instance
            .create_session("127.0.0.1/0".parse().unwrap(), 1, SessionConfig::default())
            .unwrap();
        instance
            .session_mut(id)
            .unwrap()
            .set_user_timer(Duration::from_millis(20), Instant::now());

        let event = instance
            .next_event(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .expect("USER_TIMEOUT");
        assert_eq!(event.kind, crate::EventKind::UserTimeout);
        assert!(instance
            .next_event(Some(Duration::from_millis(10)))
            .await
            .unwrap()
            .is_none());
    }
}
