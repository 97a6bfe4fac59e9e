//! Sans-IO 세션
//!
//! 하나의 (주소, 포트, 로컬 노드 ID)에 묶인 송신자 / 수신자 역할.
//! 소켓을 직접 다루지 않고 시간(`now`)과 데이터그램을 입력받아 전송할
//! 데이터그램과 이벤트를 내놓는다.
//!
//! ```text
//! handle_datagram ─┐                ┌─ poll_transmit
//! handle_timeout ──┼─ Sender/Receiver ┼─ poll_event
//!                  └────────────────┘  └─ poll_timeout
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, trace, warn};

use crate::cache::TxCacheBounds;
use crate::config::{
    AckTarget, CongestionMode, NackingMode, ProbingMode, RepairBoundary, SenderParams,
    SessionConfig, SyncPolicy, TrackingStatus,
};
use crate::event::{Event, EventKind};
use crate::message::{Message, MessageBody};
use crate::node::{AckingNodeTable, AckingStatus};
use crate::object::Object;
use crate::receiver::ReceiverRole;
use crate::sender::SenderRole;
use crate::stats::TransferStats;
use crate::{Error, NodeId, Result, NODE_ANY, NODE_NONE};

/// 세션 ID (인스턴스 내 고유)
pub type SessionId = u32;

/// 전송할 데이터그램
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub contents: Vec<u8>,
}

/// 역할들이 공유하는 세션 상태
pub(crate) struct Context {
    pub(crate) id: SessionId,
    pub(crate) node_id: NodeId,
    /// 세션 (그룹) 주소
    pub(crate) address: SocketAddr,
    pub(crate) config: SessionConfig,
    pub(crate) events: VecDeque<Event>,
    pub(crate) stats: TransferStats,
    pub(crate) rng: StdRng,
    pub(crate) cache_dir: PathBuf,
    /// 타임스탬프 기준 시각
    pub(crate) epoch: Instant,
    pub(crate) acking: AckingNodeTable,
    /// 수신자 피드백 (페이싱 없이 전송)
    pub(crate) feedback: VecDeque<Transmit>,
}

impl Context {
    pub(crate) fn emit(&mut self, event: Event) {
        trace!("이벤트: {}", event);
        self.events.push_back(event);
    }

    pub(crate) fn event(&mut self, kind: EventKind) {
        let event = Event::new(self.id, kind);
        self.emit(event);
    }

    pub(crate) fn object_event(&mut self, kind: EventKind, object: &Object) {
        let mut event = Event::new(self.id, kind).with_object(object.clone());
        event.sender = object.sender();
        self.emit(event);
    }

    pub(crate) fn node_event(&mut self, kind: EventKind, node: NodeId) {
        let event = Event::new(self.id, kind).with_sender(node);
        self.emit(event);
    }

    /// `now`의 세션 기준 마이크로초
    pub(crate) fn micros(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// 자동 추적: 새 acking 노드 등록
    pub(crate) fn track_node(&mut self, node: NodeId, is_receiver: bool) {
        let tracking = self.config.tracking;
        let wanted = if is_receiver {
            tracking.tracks_receivers()
        } else {
            tracking.tracks_senders()
        };
        if wanted && node != self.node_id && self.acking.add(node) {
            debug!("acking 노드 자동 추가: {}", node);
            self.node_event(EventKind::AckingNodeNew, node);
        }
    }

    /// 메시지 직렬화 (실패는 로그만)
    pub(crate) fn encode(&mut self, message: &Message, destination: SocketAddr) -> Option<Transmit> {
        match message.to_bytes() {
            Ok(contents) => Some(Transmit {
                destination,
                contents,
            }),
            Err(e) => {
                warn!("{} 직렬화 실패: {}", message.body().name(), e);
                None
            }
        }
    }
}

#[cfg(test)]
impl Context {
    /// 역할 단위 테스트용 (그룹 239.1.2.3:6003)
    pub(crate) fn for_test(node_id: NodeId, config: SessionConfig, now: Instant) -> Self {
        Self {
            id: 1,
            node_id,
            address: SocketAddr::from(([239, 1, 2, 3], 6003)),
            config,
            events: VecDeque::new(),
            stats: TransferStats::new(),
            rng: StdRng::seed_from_u64(7),
            cache_dir: std::env::temp_dir(),
            epoch: now,
            acking: AckingNodeTable::new(),
            feedback: VecDeque::new(),
        }
    }
}

/// NORM 세션
pub struct Session {
    ctx: Context,
    sender: Option<SenderRole>,
    receiver: Option<ReceiverRole>,
    user_timer: Option<Instant>,
}

impl Session {
    /// 새 세션 생성
    ///
    /// `cache_dir`은 수신 FILE 객체의 임시 파일 위치, `rng_seed`는 결정적
    /// 백오프가 필요할 때 (테스트) 지정한다.
    pub fn new(
        id: SessionId,
        address: SocketAddr,
        node_id: NodeId,
        config: SessionConfig,
        cache_dir: impl AsRef<Path>,
        rng_seed: Option<u64>,
        now: Instant,
    ) -> Result<Self> {
        if node_id == NODE_NONE || node_id == NODE_ANY {
            return Err(Error::InvalidParameter(format!("node_id: {}", node_id)));
        }
        config.validate()?;

        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut ctx = Context {
            id,
            node_id,
            address,
            config,
            events: VecDeque::new(),
            stats: TransferStats::new(),
            rng,
            cache_dir: cache_dir.as_ref().to_path_buf(),
            epoch: now,
            acking: AckingNodeTable::new(),
            feedback: VecDeque::new(),
        };
        if let AckTarget::Nodes(nodes) = ctx.config.ack.clone() {
            for node in nodes {
                ctx.acking.add(node);
            }
        }

        info!("세션 {} 생성: {} node={}", id, address, node_id);
        Ok(Self {
            ctx,
            sender: None,
            receiver: None,
            user_timer: None,
        })
    }

    pub fn id(&self) -> SessionId {
        self.ctx.id
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn address(&self) -> SocketAddr {
        self.ctx.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn stats(&self) -> &TransferStats {
        &self.ctx.stats
    }

    pub fn is_sender_started(&self) -> bool {
        self.sender.is_some()
    }

    pub fn is_receiver_started(&self) -> bool {
        self.receiver.is_some()
    }

    fn sender_mut(&mut self) -> Result<&mut SenderRole> {
        self.sender.as_mut().ok_or(Error::SenderNotStarted)
    }

    fn receiver_mut(&mut self) -> Result<&mut ReceiverRole> {
        self.receiver.as_mut().ok_or(Error::ReceiverNotStarted)
    }

    // ===== 송신자 =====

    /// 송신자 시작
    pub fn start_sender(&mut self, params: SenderParams, now: Instant) -> Result<()> {
        if self.sender.is_some() {
            return Err(Error::SenderAlreadyStarted);
        }
        let sender = SenderRole::new(params, &self.ctx, now)?;
        self.sender = Some(sender);
        Ok(())
    }

    /// 송신자 중지
    ///
    /// `graceful`이면 남은 데이터와 flush를 마친 뒤 LOCAL_SENDER_CLOSED를
    /// 알리고, 아니면 즉시 모든 송신 상태를 버린다.
    pub fn stop_sender(&mut self, graceful: bool) {
        match self.sender.as_mut() {
            Some(sender) if graceful => sender.close(),
            Some(sender) => {
                sender.abort();
                self.sender = None;
                info!("세션 {} 송신자 중지", self.ctx.id);
            }
            None => {}
        }
    }

    /// DATA 객체 enqueue. 캐시가 가득 차면 `Ok(None)`
    pub fn enqueue_data(&mut self, data: Bytes, info: Option<Bytes>) -> Result<Option<Object>> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(Error::SenderNotStarted);
        };
        sender.enqueue_data(&mut self.ctx, data, info)
    }

    /// FILE 객체 enqueue. 캐시가 가득 차면 `Ok(None)`
    pub fn enqueue_file(
        &mut self,
        path: impl AsRef<Path>,
        info: Option<Bytes>,
    ) -> Result<Option<Object>> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(Error::SenderNotStarted);
        };
        sender.enqueue_file(&mut self.ctx, path.as_ref(), info)
    }

    /// STREAM 객체 열기 (`buffer_bytes`: 송신 스트림 버퍼 크기)
    pub fn open_stream(&mut self, buffer_bytes: usize, info: Option<Bytes>) -> Result<Option<Object>> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(Error::SenderNotStarted);
        };
        sender.open_stream(&mut self.ctx, buffer_bytes, info)
    }

    /// 캐시에 남아 있는 객체 재전송
    pub fn requeue_object(&mut self, object: &Object) -> Result<()> {
        self.sender_mut()?.requeue(object)
    }

    /// 워터마크 설정
    ///
    /// `override_flush`이면 큐가 빌 때의 일반 flush 대신 워터마크 flush만 보낸다.
    pub fn set_watermark(&mut self, object: &Object, override_flush: bool) -> Result<()> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(Error::SenderNotStarted);
        };
        sender.set_watermark(&mut self.ctx, object, override_flush, None)
    }

    /// 워터마크 설정 + 수신자에게 전달할 데이터 (RX_ACK_REQUEST)
    pub fn set_watermark_ex(&mut self, object: &Object, payload: Bytes) -> Result<()> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(Error::SenderNotStarted);
        };
        sender.set_watermark(&mut self.ctx, object, false, Some(payload))
    }

    /// 워터마크 취소 (이벤트 없음)
    pub fn cancel_watermark(&mut self) {
        if let Some(sender) = self.sender.as_mut() {
            sender.cancel_watermark(&mut self.ctx);
        }
    }

    /// FAILURE 노드를 PENDING으로 되돌리고 워터마크 재시도
    pub fn reset_watermark(&mut self) -> Result<()> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(Error::SenderNotStarted);
        };
        sender.reset_watermark(&mut self.ctx)
    }

    pub fn add_acking_node(&mut self, node: NodeId) -> Result<()> {
        if node == NODE_NONE || node == NODE_ANY {
            return Err(Error::InvalidParameter(format!("acking 노드: {}", node)));
        }
        self.ctx.acking.add(node);
        Ok(())
    }

    pub fn remove_acking_node(&mut self, node: NodeId) -> bool {
        self.ctx.acking.remove(node)
    }

    /// 노드의 워터마크 상태 (`NODE_ANY`: 전체 요약)
    pub fn acking_status(&self, node: NodeId) -> AckingStatus {
        self.ctx.acking.status(node)
    }

    pub fn acking_nodes(&self) -> Vec<NodeId> {
        self.ctx.acking.ids()
    }

    /// 노드가 워터마크 ACK에 실어 보낸 데이터
    pub fn ack_payload(&self, node: NodeId) -> Option<Bytes> {
        self.ctx.acking.ack_payload(node)
    }

    pub fn set_tracking(&mut self, tracking: TrackingStatus) {
        self.ctx.config.tracking = tracking;
    }

    /// 애플리케이션 명령 전송. 이전 명령이 전송 중이면 `Ok(false)`
    pub fn send_command(&mut self, data: Bytes, robust: bool) -> Result<bool> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(Error::SenderNotStarted);
        };
        sender.send_command(&self.ctx, data, robust)
    }

    pub fn cancel_command(&mut self) {
        if let Some(sender) = self.sender.as_mut() {
            sender.cancel_command();
        }
    }

    /// 송신 속도 (bits/sec). fixed 모드에서는 설정값 그대로
    pub fn tx_rate(&self) -> f64 {
        match &self.sender {
            Some(sender) => sender.rate_bps(),
            None => self.ctx.config.tx_rate,
        }
    }

    pub fn set_tx_rate(&mut self, bps: f64) -> Result<()> {
        if !(bps > 0.0) {
            return Err(Error::InvalidParameter(format!("tx_rate: {}", bps)));
        }
        self.ctx.config.tx_rate = bps;
        if let Some(sender) = self.sender.as_mut() {
            sender.set_rate_bps(bps);
        }
        Ok(())
    }

    /// 혼잡 제어 속도 범위 (bits/sec, None은 제한 없음)
    pub fn set_tx_rate_bounds(&mut self, min: Option<f64>, max: Option<f64>) -> Result<()> {
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(Error::InvalidParameter(format!(
                    "tx_rate 범위: min {} > max {}",
                    lo, hi
                )));
            }
        }
        self.ctx.config.tx_rate_min = min;
        self.ctx.config.tx_rate_max = max;
        if let Some(sender) = self.sender.as_mut() {
            sender.set_rate_bounds(min, max);
        }
        Ok(())
    }

    pub fn set_congestion_mode(&mut self, mode: CongestionMode) {
        self.ctx.config.congestion = mode;
        if let Some(sender) = self.sender.as_mut() {
            sender.set_congestion_mode(mode);
        }
    }

    pub fn set_tx_cache_bounds(&mut self, bounds: TxCacheBounds) -> Result<()> {
        bounds.validate()?;
        self.ctx.config.tx_cache = bounds;
        if let Some(sender) = self.sender.as_mut() {
            sender.set_cache_bounds(bounds);
        }
        Ok(())
    }

    pub fn set_tx_robust_factor(&mut self, robust: u32) -> Result<()> {
        if robust == 0 {
            return Err(Error::InvalidParameter("robust factor는 1 이상".into()));
        }
        self.ctx.config.tx_robust_factor = robust;
        Ok(())
    }

    pub fn set_auto_parity(&mut self, enabled: bool) {
        self.ctx.config.auto_parity = enabled;
    }

    /// 현재 GRTT (초). 송신자가 없으면 설정된 초기값
    pub fn grtt_estimate(&self) -> f64 {
        match &self.sender {
            Some(sender) => sender.grtt(),
            None => self.ctx.config.grtt_estimate,
        }
    }

    pub fn set_grtt_estimate(&mut self, grtt: f64) -> Result<()> {
        if !(grtt > 0.0) {
            return Err(Error::InvalidParameter(format!("grtt: {}", grtt)));
        }
        self.ctx.config.grtt_estimate = grtt;
        if let Some(sender) = self.sender.as_mut() {
            sender.set_grtt_estimate(grtt);
        }
        Ok(())
    }

    pub fn set_grtt_max(&mut self, grtt_max: f64) -> Result<()> {
        if !(grtt_max > 0.0) {
            return Err(Error::InvalidParameter(format!("grtt_max: {}", grtt_max)));
        }
        self.ctx.config.grtt_max = grtt_max;
        if let Some(sender) = self.sender.as_mut() {
            sender.set_grtt_max(grtt_max);
        }
        Ok(())
    }

    pub fn set_grtt_probing_mode(&mut self, mode: ProbingMode) {
        self.ctx.config.grtt_probing = mode;
        if let Some(sender) = self.sender.as_mut() {
            sender.set_probing_mode(mode);
        }
    }

    /// GRTT 프로빙 간격 범위 (초)
    pub fn set_grtt_probing_interval(&mut self, min: f64, max: f64) -> Result<()> {
        if !(min > 0.0) || min > max {
            return Err(Error::InvalidParameter(format!(
                "GRTT 프로빙 간격: {} ~ {}",
                min, max
            )));
        }
        self.ctx.config.grtt_interval_min = min;
        self.ctx.config.grtt_interval_max = max;
        if let Some(sender) = self.sender.as_mut() {
            sender.set_probing_interval(min, max);
        }
        Ok(())
    }

    pub fn set_backoff_factor(&mut self, backoff: f64) -> Result<()> {
        if backoff < 0.0 {
            return Err(Error::InvalidParameter(format!("backoff_factor: {}", backoff)));
        }
        self.ctx.config.backoff_factor = backoff;
        Ok(())
    }

    pub fn set_group_size(&mut self, group_size: f64) -> Result<()> {
        if !(group_size >= 1.0) {
            return Err(Error::InvalidParameter(format!("group_size: {}", group_size)));
        }
        self.ctx.config.group_size = group_size;
        Ok(())
    }

    // ===== 수신자 =====

    /// 수신자 시작 (`buffer_space`: 원격 송신자당 수신 버퍼 바이트)
    pub fn start_receiver(&mut self, buffer_space: u64) -> Result<()> {
        if self.receiver.is_some() {
            return Err(Error::ReceiverAlreadyStarted);
        }
        if buffer_space == 0 {
            return Err(Error::InvalidParameter("buffer_space는 0보다 커야 함".into()));
        }
        self.receiver = Some(ReceiverRole::new(buffer_space));
        info!("세션 {} 수신자 시작: buffer {} bytes", self.ctx.id, buffer_space);
        Ok(())
    }

    pub fn stop_receiver(&mut self) {
        if self.receiver.take().is_some() {
            info!("세션 {} 수신자 중지", self.ctx.id);
        }
    }

    pub fn set_silent_receiver(&mut self, silent: bool) {
        self.ctx.config.silent_receiver = silent;
    }

    pub fn set_default_unicast_nack(&mut self, unicast: bool) {
        self.ctx.config.unicast_nack = unicast;
    }

    pub fn set_nacking_mode(&mut self, mode: NackingMode) {
        self.ctx.config.nacking_mode = mode;
    }

    pub fn set_repair_boundary(&mut self, boundary: RepairBoundary) {
        self.ctx.config.repair_boundary = boundary;
    }

    pub fn set_sync_policy(&mut self, policy: SyncPolicy) {
        self.ctx.config.sync_policy = policy;
    }

    pub fn set_rx_robust_factor(&mut self, robust: u32) -> Result<()> {
        if robust == 0 {
            return Err(Error::InvalidParameter("robust factor는 1 이상".into()));
        }
        self.ctx.config.rx_robust_factor = robust;
        Ok(())
    }

    /// 원격 송신자당 동시 수신 객체 수 한계
    pub fn set_rx_cache_limit(&mut self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(Error::InvalidParameter("rx_cache_limit는 1 이상".into()));
        }
        self.ctx.config.rx_cache_limit = limit;
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.set_cache_limit(limit);
        }
        Ok(())
    }

    /// 워터마크 ACK에 실어 보낼 데이터
    pub fn set_ack_payload(&mut self, payload: Option<Bytes>) -> Result<()> {
        self.receiver_mut()?.set_ack_payload(payload);
        Ok(())
    }

    pub fn remote_senders(&self) -> Vec<NodeId> {
        self.receiver
            .as_ref()
            .map(ReceiverRole::remote_senders)
            .unwrap_or_default()
    }

    pub fn remote_sender_address(&self, node: NodeId) -> Option<SocketAddr> {
        self.receiver.as_ref()?.remote_sender_address(node)
    }

    /// 원격 송신자 상태 삭제 (REMOTE_SENDER_PURGED)
    pub fn delete_remote_sender(&mut self, node: NodeId) -> Result<()> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(Error::ReceiverNotStarted);
        };
        if receiver.delete_remote_sender(&mut self.ctx, node) {
            Ok(())
        } else {
            Err(Error::UnknownNode(node))
        }
    }

    // ===== 타이머 =====

    /// 사용자 타이머 (만료 시 USER_TIMEOUT)
    pub fn set_user_timer(&mut self, after: Duration, now: Instant) {
        self.user_timer = Some(now + after);
    }

    pub fn cancel_user_timer(&mut self) {
        self.user_timer = None;
    }

    // ===== Sans-IO 구동 =====

    /// 수신 데이터그램 처리
    pub fn handle_datagram(&mut self, now: Instant, src: SocketAddr, data: &[u8], ecn_ce: bool) {
        let message = match Message::from_bytes(data) {
            Ok(message) => message,
            Err(e @ Error::InvalidFecInfo(_)) => {
                warn!("세션 {} 패킷 폐기 ({}): {}", self.ctx.id, src, e);
                self.ctx.stats.invalid_packets += 1;
                return;
            }
            Err(e) => {
                trace!("세션 {} 잘못된 패킷 ({}): {}", self.ctx.id, src, e);
                self.ctx.stats.invalid_packets += 1;
                return;
            }
        };

        let source = message.source();
        let own = source == self.ctx.node_id;
        if own && !self.ctx.config.loopback {
            return;
        }

        match message.body() {
            MessageBody::Info(_) | MessageBody::Data(_) | MessageBody::Cmd(_) => {
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.handle_sender_message(&mut self.ctx, now, src, &message, ecn_ce);
                }
            }
            MessageBody::Nack(nack) => {
                if nack.receiver.sender_id == self.ctx.node_id {
                    if let Some(sender) = self.sender.as_mut() {
                        sender.handle_nack(&mut self.ctx, now, source, nack);
                        self.ctx.track_node(source, true);
                    }
                } else if !own {
                    if let Some(receiver) = self.receiver.as_mut() {
                        receiver.overhear_nack(nack);
                    }
                }
            }
            MessageBody::Ack(ack) => {
                if ack.receiver.sender_id == self.ctx.node_id {
                    if let Some(sender) = self.sender.as_mut() {
                        self.ctx.track_node(source, true);
                        sender.handle_ack(&mut self.ctx, now, source, ack, &message.payload);
                    }
                }
            }
        }
        self.reap_sender();
    }

    /// 다음 전송 데이터그램
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if let Some(transmit) = self.ctx.feedback.pop_front() {
            return Some(transmit);
        }
        let transmit = self
            .sender
            .as_mut()
            .and_then(|sender| sender.poll_transmit(&mut self.ctx, now));
        self.reap_sender();
        transmit
    }

    /// 다음 타이머 만료 시각
    pub fn poll_timeout(&self) -> Option<Instant> {
        if !self.ctx.feedback.is_empty() {
            return Some(self.ctx.epoch);
        }
        [
            self.user_timer,
            self.sender.as_ref().and_then(SenderRole::poll_timeout),
            self.receiver.as_ref().and_then(ReceiverRole::poll_timeout),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// 만료된 타이머 처리
    pub fn handle_timeout(&mut self, now: Instant) {
        if matches!(self.user_timer, Some(at) if at <= now) {
            self.user_timer = None;
            self.ctx.event(EventKind::UserTimeout);
        }
        if let Some(sender) = self.sender.as_mut() {
            sender.handle_timeout(&mut self.ctx, now);
        }
        if let Some(receiver) = self.receiver.as_mut() {
            receiver.handle_timeout(&mut self.ctx, now);
        }
        self.reap_sender();
    }

    /// 다음 이벤트
    pub fn poll_event(&mut self) -> Option<Event> {
        self.ctx.events.pop_front()
    }

    /// 소켓 전송 실패 통지 (SEND_ERROR)
    pub fn handle_send_error(&mut self, error: &std::io::Error) {
        debug!("세션 {} 전송 실패: {}", self.ctx.id, error);
        self.ctx.event(EventKind::SendError);
    }

    /// graceful 종료가 끝난 송신자 정리
    fn reap_sender(&mut self) {
        if matches!(&self.sender, Some(sender) if sender.is_closed()) {
            self.sender = None;
            info!("세션 {} 송신자 종료 완료", self.ctx.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(node: NodeId) -> Session {
        let addr: SocketAddr = "239.1.2.3:6003".parse().unwrap();
        Session::new(1, addr, node, SessionConfig::default(), std::env::temp_dir(), Some(1), Instant::now())
            .unwrap()
    }

    #[test]
    fn test_rejects_reserved_node_ids() {
        let addr: SocketAddr = "239.1.2.3:6003".parse().unwrap();
        let now = Instant::now();
        for node in [NODE_NONE, NODE_ANY] {
            assert!(matches!(
                Session::new(1, addr, node, SessionConfig::default(), ".", None, now),
                Err(Error::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_role_gating() {
        let now = Instant::now();
        let mut s = session(1);
        assert!(matches!(
            s.enqueue_data(Bytes::from_static(b"x"), None),
            Err(Error::SenderNotStarted)
        ));
        s.start_sender(SenderParams::default(), now).unwrap();
        assert!(matches!(
            s.start_sender(SenderParams::default(), now),
            Err(Error::SenderAlreadyStarted)
        ));
        s.start_receiver(1 << 20).unwrap();
        assert!(matches!(s.start_receiver(1 << 20), Err(Error::ReceiverAlreadyStarted)));

        s.stop_sender(false);
        assert!(!s.is_sender_started());
        s.start_sender(SenderParams::default(), now).unwrap();
    }

    #[test]
    fn test_user_timer() {
        let now = Instant::now();
        let mut s = session(1);
        s.set_user_timer(Duration::from_millis(50), now);
        assert_eq!(s.poll_timeout(), Some(now + Duration::from_millis(50)));

        s.handle_timeout(now + Duration::from_millis(10));
        assert!(s.poll_event().is_none());

        s.handle_timeout(now + Duration::from_millis(50));
        assert_eq!(s.poll_event().map(|e| e.kind), Some(EventKind::UserTimeout));
        assert_eq!(s.poll_timeout(), None);

        s.set_user_timer(Duration::from_millis(50), now);
        s.cancel_user_timer();
        assert_eq!(s.poll_timeout(), None);
    }

    #[test]
    fn test_garbage_is_counted_and_dropped() {
        let now = Instant::now();
        let mut s = session(1);
        s.start_receiver(1 << 20).unwrap();
        s.handle_datagram(now, "10.0.0.2:5000".parse().unwrap(), &[1, 2, 3], false);
        assert_eq!(s.stats().invalid_packets, 1);
        assert!(s.poll_event().is_none());
        assert!(s.poll_transmit(now).is_none());
    }

    #[test]
    fn test_malformed_datagrams_are_dropped() {
        use crate::message::{DataHeader, NackHeader, ReceiverFields, RepairRequest, SenderFields};
        use crate::object::ObjectType;
        use crate::segment::FecObjectInfo;

        let now = Instant::now();
        let src: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        let mut s = session(1);
        s.start_receiver(1 << 20).unwrap();

        let data = |fec: FecObjectInfo| {
            let header = DataHeader {
                sender: SenderFields {
                    instance_id: 1,
                    sequence: 1,
                    grtt: 100,
                    backoff: 4,
                    gsize: 30,
                },
                object: 0,
                object_type: ObjectType::Data,
                fec,
                block: 0,
                symbol: 0,
                flags: 0,
                crc32: 0,
            };
            Message::new(7, MessageBody::Data(header), Bytes::from(vec![3u8; 100]))
        };

        let mut datagrams = Vec::new();
        datagrams.push(data(FecObjectInfo::new(1000, 0, 16, 4)).to_bytes().unwrap());
        datagrams.push(data(FecObjectInfo::new(1000, 2, 16, 4)).to_bytes().unwrap());
        datagrams.push(data(FecObjectInfo::new(1000, 100, 0, 4)).to_bytes().unwrap());
        datagrams.push(data(FecObjectInfo::new(1000, 100, 255, 1)).to_bytes().unwrap());

        let mut corrupt = data(FecObjectInfo::new(1000, 100, 16, 4)).to_bytes().unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0x55;
        datagrams.push(corrupt);

        let mut old = data(FecObjectInfo::new(1000, 100, 16, 4));
        old.header.version = crate::PROTOCOL_VERSION + 1;
        datagrams.push(old.to_bytes().unwrap());

        let nack = Message::new(
            7,
            MessageBody::Nack(NackHeader {
                receiver: ReceiverFields {
                    sender_id: 1,
                    instance_id: 1,
                    grtt_response: None,
                    cc: None,
                },
                requests: vec![RepairRequest::Info { object: 0 }],
            }),
            Bytes::new(),
        )
        .to_bytes()
        .unwrap();
        datagrams.push(nack[..nack.len() - 2].to_vec());
        datagrams.push(Vec::new());

        let count = datagrams.len() as u64;
        for datagram in &datagrams {
            s.handle_datagram(now, src, datagram, false);
        }
        assert_eq!(s.stats().invalid_packets, count);
        assert!(s.poll_event().is_none());
        assert!(s.poll_transmit(now).is_none());
        assert!(s.remote_senders().is_empty());

        // 정상 패킷은 그대로 처리
        let valid = data(FecObjectInfo::new(1000, 100, 16, 4)).to_bytes().unwrap();
        s.handle_datagram(now, src, &valid, false);
        assert_eq!(s.stats().invalid_packets, count);
        assert_eq!(s.remote_senders(), vec![7]);
        assert_eq!(s.poll_event().map(|e| e.kind), Some(EventKind::RemoteSenderNew));
    }

    #[test]
    fn test_rate_setters() {
        let mut s = session(1);
        assert!(s.set_tx_rate(0.0).is_err());
        s.set_tx_rate(2_000_000.0).unwrap();
        assert_eq!(s.tx_rate(), 2_000_000.0);
        assert!(s.set_tx_rate_bounds(Some(10.0), Some(5.0)).is_err());
        assert!(s.set_grtt_probing_interval(2.0, 1.0).is_err());
    }
}
