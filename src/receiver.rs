//! 수신자 역할
//!
//! 원격 송신자별 상태를 유지하며:
//! - 블록 조립과 FEC 복구 후 객체에 기록
//! - 손실 감지 시 랜덤 백오프 후 NACK (다른 수신자의 NACK을 들으면 억제)
//! - 워터마크 / CC 프로브에 ACK 응답
//! - 송신자 활동 감시 (active / inactive)

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::cache::{RxAdmission, RxCache};
use crate::config::{NackingMode, RepairBoundary, SyncPolicy};
use crate::event::EventKind;
use crate::fec::CodecCache;
use crate::grtt::{
    exponential_rand, quantize_loss, quantize_rtt, unquantize_group_size, unquantize_rtt,
    HEADER_OVERHEAD,
};
use crate::message::{
    AckHeader, AckKind, CcFeedback, Command, DataHeader, GrttResponse, InfoHeader, Message,
    MessageBody, NackHeader, ReceiverFields, RepairRequest, SenderFields, CC_FLAG_CLR,
    CC_FLAG_START, DATA_FLAG_INFO, DATA_FLAG_REPAIR,
};
use crate::object::{Object, ObjectId, ObjectType};
use crate::segment::{BlockId, FecObjectInfo, RxBlock, SymbolId};
use crate::session::Context;
use crate::stats::{LossEstimator, RateMeter, LOSS_WINDOW};
use crate::NodeId;

/// NACK 한 번에 싣는 요청 크기 한계 (심볼 단위)
const NACK_WEIGHT_MAX: usize = 1024;

/// 활동 타이머 최소 간격
const ACTIVITY_MIN: Duration = Duration::from_secs(1);

/// 수신 속도 측정 윈도우
const RATE_WINDOW: Duration = Duration::from_secs(1);

type Position = (ObjectId, BlockId, SymbolId);

/// 수신 중인 객체
struct RxObject {
    object: Object,
    object_type: ObjectType,
    fec: FecObjectInfo,
    /// 송신자가 info를 보낸다고 표시
    needs_info: bool,
    info_received: bool,
    blocks: BTreeMap<BlockId, RxBlock>,
    completed: BTreeSet<BlockId>,
    completed_bytes: u64,
}

impl RxObject {
    fn is_complete(&self) -> bool {
        let info_ok = !self.needs_info || self.info_received;
        match self.object_type {
            ObjectType::Stream => false,
            _ => info_ok && self.completed.len() as u64 >= self.fec.num_blocks() as u64,
        }
    }

    fn is_untouched(&self) -> bool {
        self.blocks.is_empty() && self.completed.is_empty() && !self.info_received
    }

    /// `(block, symbol)`까지 모두 받았는지
    fn has_through(&self, block: BlockId, symbol: SymbolId) -> bool {
        if self.needs_info && !self.info_received {
            return false;
        }
        match self.object_type {
            ObjectType::Stream => {
                let index = self.fec.stream_index(block, symbol);
                self.object.rx_stream(|s| s.frontier() > index).unwrap_or(true)
            }
            _ => (0..=block.min(self.fec.num_blocks().saturating_sub(1)))
                .all(|b| self.completed.contains(&b)),
        }
    }

    /// 복구 요청 목록. `limit`은 NACK 가능한 마지막 위치
    fn requests(&self, id: ObjectId, limit: Option<Position>, mode: NackingMode, out: &mut Vec<RepairRequest>) {
        if self.needs_info && !self.info_received {
            out.push(RepairRequest::Info { object: id });
        }
        if mode == NackingMode::InfoOnly {
            return;
        }
        let Some((_, last_block, last_symbol)) = limit else {
            return;
        };

        if self.object_type == ObjectType::Stream {
            let end = self.fec.stream_index(last_block, last_symbol);
            let missing: Vec<u64> = self
                .object
                .rx_stream(|s| {
                    if !s.is_synced() {
                        return Vec::new();
                    }
                    (s.frontier()..=end)
                        .filter(|&i| !s.has_segment(i))
                        .take(NACK_WEIGHT_MAX)
                        .collect()
                })
                .unwrap_or_default();
            let mut by_block: BTreeMap<BlockId, Vec<SymbolId>> = BTreeMap::new();
            for index in missing {
                let (block, symbol) = self.fec.stream_position(index);
                by_block.entry(block).or_default().push(symbol);
            }
            for (block, symbols) in by_block {
                out.push(RepairRequest::Block {
                    object: id,
                    block,
                    erasures: symbols.len() as u16,
                    symbols,
                });
            }
            return;
        }

        let last_block = last_block.min(self.fec.num_blocks().saturating_sub(1));
        if self.is_untouched() && last_block + 1 >= self.fec.num_blocks() {
            out.push(RepairRequest::Object { object: id });
            return;
        }
        for block in 0..=last_block {
            if self.completed.contains(&block) {
                continue;
            }
            match self.blocks.get(&block) {
                Some(rx) => out.push(RepairRequest::Block {
                    object: id,
                    block,
                    erasures: rx.erasures(),
                    symbols: rx.missing_source(),
                }),
                None => out.push(RepairRequest::Block {
                    object: id,
                    block,
                    erasures: self.fec.block_len(block),
                    symbols: Vec::new(),
                }),
            }
        }
    }
}

/// NACK 사이클 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NackState {
    Idle,
    /// 랜덤 백오프 대기 (다른 수신자 NACK 청취)
    Backoff { until: Instant },
    /// NACK 후 복구 대기
    Holdoff { until: Instant },
}

/// 마지막 CC 프로브 (GRTT 응답용)
#[derive(Debug, Clone, Copy)]
struct ProbeEcho {
    send_time_us: u64,
    received_at: Instant,
    cc_sequence: u16,
}

/// 원격 송신자 상태
struct RemoteSender {
    node: NodeId,
    addr: SocketAddr,
    instance_id: u16,
    /// 마지막으로 관측한 세그먼트 크기 (변경 시 리셋)
    segment_size: Option<u16>,

    /// 송신자가 알린 GRTT / 백오프 / 그룹 크기
    grtt: f64,
    backoff: f64,
    gsize: f64,

    loss: LossEstimator,
    meter: RateMeter,

    objects: BTreeMap<ObjectId, RxObject>,
    /// 이 ID 미만 객체는 완료 또는 포기 (None이면 아직 동기화 전)
    floor: Option<ObjectId>,
    /// floor 이상에서 완료 / 포기한 객체
    finished: BTreeSet<ObjectId>,
    /// 송신자가 도달한 위치
    horizon: Option<Position>,
    /// horizon이 flush로 알려짐 (해당 위치까지 전송 끝)
    horizon_flushed: bool,
    cache: RxCache,
    codecs: HashMap<u16, CodecCache>,

    activity_deadline: Instant,
    misses: u32,
    active: bool,

    nack: NackState,
    /// 백오프 중 들은 다른 수신자의 요청
    heard_blocks: HashMap<(ObjectId, BlockId), u16>,
    heard_objects: BTreeSet<ObjectId>,
    heard_info: BTreeSet<ObjectId>,

    probe: Option<ProbeEcho>,
    is_clr: bool,
    cc_pending: Option<Instant>,
    ack_pending: Option<(Instant, Position)>,
    last_cmd_id: Option<u16>,
    last_ack_request: Option<Position>,
}

impl RemoteSender {
    fn new(
        ctx: &Context,
        node: NodeId,
        addr: SocketAddr,
        fields: &SenderFields,
        buffer_space: u64,
        now: Instant,
    ) -> Self {
        let grtt = unquantize_rtt(fields.grtt);
        let mut remote = Self {
            node,
            addr,
            instance_id: fields.instance_id,
            segment_size: None,
            grtt,
            backoff: fields.backoff as f64,
            gsize: unquantize_group_size(fields.gsize),
            loss: LossEstimator::new(LOSS_WINDOW),
            meter: RateMeter::new(RATE_WINDOW),
            objects: BTreeMap::new(),
            floor: None,
            finished: BTreeSet::new(),
            horizon: None,
            horizon_flushed: false,
            cache: RxCache::new(buffer_space, ctx.config.rx_cache_limit),
            codecs: HashMap::new(),
            activity_deadline: now,
            misses: 0,
            active: true,
            nack: NackState::Idle,
            heard_blocks: HashMap::new(),
            heard_objects: BTreeSet::new(),
            heard_info: BTreeSet::new(),
            probe: None,
            is_clr: false,
            cc_pending: None,
            ack_pending: None,
            last_cmd_id: None,
            last_ack_request: None,
        };
        remote.activity_deadline = now + remote.activity_interval(ctx.config.rx_robust_factor);
        remote
    }

    fn activity_interval(&self, robust: u32) -> Duration {
        Duration::from_secs_f64(2.0 * robust.max(1) as f64 * self.grtt).max(ACTIVITY_MIN)
    }

    fn grtt_duration(&self, factor: f64) -> Duration {
        Duration::from_secs_f64((self.grtt * factor).max(0.0))
    }

    /// 송신자 공통 필드 반영
    fn update(&mut self, ctx: &mut Context, now: Instant, src: SocketAddr, fields: &SenderFields, len: usize, ecn_ce: bool) {
        if fields.instance_id != self.instance_id {
            info!(
                "원격 송신자 {} 재시작: instance {} → {}",
                self.node, self.instance_id, fields.instance_id
            );
            self.reset(ctx);
            self.instance_id = fields.instance_id;
            ctx.node_event(EventKind::RemoteSenderReset, self.node);
        }
        if src != self.addr {
            debug!("원격 송신자 {} 주소 변경: {} → {}", self.node, self.addr, src);
            self.addr = src;
            ctx.node_event(EventKind::RemoteSenderAddress, self.node);
        }

        self.grtt = unquantize_rtt(fields.grtt);
        self.backoff = fields.backoff as f64;
        self.gsize = unquantize_group_size(fields.gsize);
        self.loss.record(fields.sequence, ecn_ce);
        self.meter.record(now, len + HEADER_OVERHEAD);

        self.misses = 0;
        self.activity_deadline = now + self.activity_interval(ctx.config.rx_robust_factor);
        if !self.active {
            self.active = true;
            ctx.node_event(EventKind::RemoteSenderActive, self.node);
        }
    }

    /// FEC 파라미터 변경 감지
    fn check_fec(&mut self, ctx: &mut Context, fec: &FecObjectInfo) {
        match self.segment_size {
            Some(size) if size != fec.segment_size => {
                info!(
                    "원격 송신자 {} FEC 변경: segment {} → {}",
                    self.node, size, fec.segment_size
                );
                self.reset(ctx);
                ctx.node_event(EventKind::RemoteSenderReset, self.node);
            }
            _ => {}
        }
        self.segment_size = Some(fec.segment_size);
    }

    /// 인스턴스 변경: 모든 수신 상태 폐기
    fn reset(&mut self, ctx: &mut Context) {
        let ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        for id in ids {
            self.abort_object(ctx, id);
        }
        self.floor = None;
        self.segment_size = None;
        self.finished.clear();
        self.horizon = None;
        self.horizon_flushed = false;
        self.nack = NackState::Idle;
        self.clear_heard();
        self.probe = None;
        self.is_clr = false;
        self.cc_pending = None;
        self.ack_pending = None;
        self.last_cmd_id = None;
        self.last_ack_request = None;
        self.loss.reset();
    }

    fn clear_heard(&mut self) {
        self.heard_blocks.clear();
        self.heard_objects.clear();
        self.heard_info.clear();
    }

    fn advance_horizon(&mut self, position: Position, flushed: bool) {
        match self.horizon {
            Some(h) if h > position => {}
            Some(h) if h == position => self.horizon_flushed |= flushed,
            _ => {
                self.horizon = Some(position);
                self.horizon_flushed = flushed;
            }
        }
    }

    /// 동기화 (첫 새 데이터 관측 시)
    fn sync(&mut self, ctx: &Context, id: ObjectId) {
        if self.floor.is_some() {
            return;
        }
        let floor = match ctx.config.sync_policy {
            SyncPolicy::Current => id,
            SyncPolicy::All => 0,
        };
        debug!("원격 송신자 {} 동기화: 객체 {}부터", self.node, floor);
        self.floor = Some(floor);
    }

    fn is_done(&self, id: ObjectId) -> bool {
        match self.floor {
            Some(floor) => id < floor || self.finished.contains(&id),
            None => true,
        }
    }

    fn advance_floor(&mut self) {
        let Some(mut floor) = self.floor else {
            return;
        };
        while !self.objects.contains_key(&floor) && self.finished.remove(&floor) {
            floor = floor.wrapping_add(1);
        }
        self.floor = Some(floor);
    }

    fn finish(&mut self, id: ObjectId) {
        if matches!(self.floor, Some(floor) if id >= floor) {
            self.finished.insert(id);
        }
        self.advance_floor();
    }

    fn abort_object(&mut self, ctx: &mut Context, id: ObjectId) {
        if let Some(rx) = self.objects.remove(&id) {
            rx.object.abort_rx();
            ctx.stats.objects_aborted += 1;
            ctx.object_event(EventKind::RxObjectAborted, &rx.object);
            debug!("원격 송신자 {} 객체 {} 중단", self.node, id);
        }
        self.finish(id);
    }

    /// 새 수신 객체 수용. 수용하지 못하면 false
    fn admit(&mut self, ctx: &mut Context, id: ObjectId, object_type: ObjectType, fec: FecObjectInfo) -> bool {
        if self.objects.contains_key(&id) {
            return true;
        }
        let size = match object_type {
            ObjectType::Stream => fec.object_size.min(self.cache.buffer_space()),
            _ => fec.object_size,
        };
        let active: Vec<ObjectId> = self.objects.keys().copied().collect();
        match self.cache.admit(size, &active) {
            RxAdmission::Overflow => {
                warn!(
                    "원격 송신자 {} 객체 {} 수용 불가: {} bytes > buffer {}",
                    self.node,
                    id,
                    size,
                    self.cache.buffer_space()
                );
                let object = Object::new_rx_rejected(id, ctx.id, self.node, object_type, fec.object_size);
                ctx.object_event(EventKind::RxObjectNew, &object);
                ctx.object_event(EventKind::RxObjectAborted, &object);
                ctx.stats.objects_aborted += 1;
                self.finish(id);
                return false;
            }
            RxAdmission::EvictOldest(oldest) => self.abort_object(ctx, oldest),
            RxAdmission::Accept => {}
        }

        let capacity = (fec.object_size as usize / fec.stream_payload_capacity().max(1)).max(1);
        let object = match Object::new_rx(id, ctx.id, self.node, object_type, fec.object_size, capacity, &ctx.cache_dir) {
            Ok(object) => object,
            Err(e) => {
                warn!("수신 객체 {} 생성 실패: {}", id, e);
                let object = Object::new_rx_rejected(id, ctx.id, self.node, object_type, fec.object_size);
                ctx.object_event(EventKind::RxObjectNew, &object);
                ctx.object_event(EventKind::RxObjectAborted, &object);
                self.finish(id);
                return false;
            }
        };
        trace!("원격 송신자 {} 새 객체 {}: {:?} {} bytes", self.node, id, object_type, fec.object_size);
        ctx.object_event(EventKind::RxObjectNew, &object);
        self.objects.insert(
            id,
            RxObject {
                object,
                object_type,
                fec,
                needs_info: false,
                info_received: false,
                blocks: BTreeMap::new(),
                completed: BTreeSet::new(),
                completed_bytes: 0,
            },
        );
        true
    }

    fn complete_object(&mut self, ctx: &mut Context, id: ObjectId) {
        let Some(rx) = self.objects.remove(&id) else {
            return;
        };
        match rx.object.complete_rx() {
            Ok(()) => {
                ctx.stats.objects_completed += 1;
                debug!("원격 송신자 {} 객체 {} 수신 완료", self.node, id);
                ctx.object_event(EventKind::RxObjectCompleted, &rx.object);
            }
            Err(e) => {
                warn!("객체 {} 완료 처리 실패: {}", id, e);
                rx.object.abort_rx();
                ctx.stats.objects_aborted += 1;
                ctx.object_event(EventKind::RxObjectAborted, &rx.object);
            }
        }
        self.finish(id);
    }

    fn handle_info(&mut self, ctx: &mut Context, header: &InfoHeader, payload: &Bytes) {
        let id = header.object;
        self.sync(ctx, id);
        if self.is_done(id) {
            return;
        }
        if !self.admit(ctx, id, header.object_type, header.fec) {
            return;
        }
        let Some(rx) = self.objects.get_mut(&id) else {
            return;
        };
        if rx.info_received {
            ctx.stats.duplicate_segments += 1;
            return;
        }
        rx.needs_info = true;
        rx.info_received = true;
        rx.object.set_info(payload.clone());
        let object = rx.object.clone();
        ctx.object_event(EventKind::RxObjectInfo, &object);
        if rx.is_complete() {
            self.complete_object(ctx, id);
        }
    }

    fn handle_data(&mut self, ctx: &mut Context, header: &DataHeader, payload: &Bytes) {
        let id = header.object;
        let repair = header.flags & DATA_FLAG_REPAIR != 0;
        if !repair {
            self.advance_horizon((id, header.block, header.symbol), false);
        }
        if self.floor.is_none() {
            // 복구 데이터로는 동기화하지 않음
            if repair {
                return;
            }
            self.sync(ctx, id);
        }
        if self.is_done(id) {
            ctx.stats.duplicate_segments += 1;
            return;
        }
        if !self.admit(ctx, id, header.object_type, header.fec) {
            return;
        }
        let Some(rx) = self.objects.get_mut(&id) else {
            return;
        };
        if header.flags & DATA_FLAG_INFO != 0 {
            rx.needs_info = true;
        }

        if rx.object_type == ObjectType::Stream {
            let index = rx.fec.stream_index(header.block, header.symbol);
            let block_size = rx.fec.block_size as u64;
            let state = rx.object.rx_stream(|s| {
                if !s.is_synced() {
                    s.sync(if index < block_size { 0 } else { index });
                }
                (s.insert(index, payload), s.is_ended())
            });
            let object = rx.object.clone();
            match state {
                Some((true, ended)) => {
                    ctx.object_event(EventKind::RxObjectUpdated, &object);
                    if ended {
                        self.complete_object(ctx, id);
                    }
                }
                Some((false, _)) => ctx.stats.duplicate_segments += 1,
                None => {}
            }
            return;
        }

        let (block, symbol) = (header.block, header.symbol);
        let fec = rx.fec;
        if block >= fec.num_blocks() || symbol >= fec.block_len(block) + fec.num_parity {
            trace!("범위 밖 심볼: 객체 {} 블록 {} 심볼 {}", id, block, symbol);
            return;
        }
        if rx.completed.contains(&block) {
            ctx.stats.duplicate_segments += 1;
            return;
        }
        let block_len = fec.block_len(block);
        let rx_block = rx
            .blocks
            .entry(block)
            .or_insert_with(|| RxBlock::new(block_len, fec.num_parity, fec.segment_size as usize));
        if !rx_block.insert(symbol, payload) {
            ctx.stats.duplicate_segments += 1;
            return;
        }
        if !rx_block.is_decodable() {
            return;
        }

        let Some(rx_block) = rx.blocks.remove(&block) else {
            return;
        };
        let codec = match self
            .codecs
            .entry(fec.num_parity)
            .or_insert_with(|| CodecCache::new(fec.num_parity as usize))
            .get(block_len as usize)
        {
            Ok(codec) => codec,
            Err(e) => {
                warn!("객체 {} FEC 구성 오류: {}", id, e);
                self.abort_object(ctx, id);
                return;
            }
        };
        let written = rx_block.decode(codec).and_then(|segments| {
            for (s, segment) in segments.iter().enumerate() {
                let s = s as SymbolId;
                let len = fec.segment_len(block, s);
                rx.object.write_at(fec.segment_offset(block, s), &segment[..len])?;
            }
            Ok(())
        });
        if let Err(e) = written {
            warn!("객체 {} 블록 {} 기록 실패: {}", id, block, e);
            self.abort_object(ctx, id);
            return;
        }

        rx.completed.insert(block);
        rx.completed_bytes += fec.block_bytes(block);
        rx.object
            .set_bytes_pending(fec.object_size.saturating_sub(rx.completed_bytes));
        let object = rx.object.clone();
        let complete = rx.is_complete();
        ctx.object_event(EventKind::RxObjectUpdated, &object);
        if complete {
            self.complete_object(ctx, id);
        }
    }

    fn handle_command(&mut self, ctx: &mut Context, now: Instant, command: &Command, payload: &Bytes) {
        match command {
            Command::Flush {
                object,
                block,
                symbol,
                watermark,
            } => {
                let position = (*object, *block, *symbol);
                self.advance_horizon(position, true);
                let Some(request) = watermark else {
                    return;
                };
                if ctx.config.silent_receiver || !request.acking_nodes.contains(&ctx.node_id) {
                    return;
                }
                if request.with_payload && self.last_ack_request != Some(position) {
                    self.last_ack_request = Some(position);
                    ctx.node_event(EventKind::RxAckRequest(payload.clone()), self.node);
                }
                if self.ack_pending.is_none() && !self.missing_through(position) {
                    let delay = ctx.rng.gen::<f64>() * self.grtt;
                    self.ack_pending = Some((now + Duration::from_secs_f64(delay), position));
                }
            }
            Command::Squelch {
                object,
                block,
                symbol,
                invalid,
            } => self.handle_squelch(ctx, (*object, *block, *symbol), invalid),
            Command::Cc {
                cc_sequence,
                send_time_us,
                clr,
                respond,
                ..
            } => {
                self.probe = Some(ProbeEcho {
                    send_time_us: *send_time_us,
                    received_at: now,
                    cc_sequence: *cc_sequence,
                });
                self.is_clr = *clr == Some(ctx.node_id);
                if !*respond || ctx.config.silent_receiver {
                    return;
                }
                let delay = if self.is_clr {
                    0.0
                } else {
                    exponential_rand(&mut ctx.rng, self.backoff * self.grtt, self.gsize)
                };
                self.cc_pending = Some(now + Duration::from_secs_f64(delay));
            }
            Command::Application { id } => {
                if self.last_cmd_id == Some(*id) {
                    return;
                }
                self.last_cmd_id = Some(*id);
                ctx.node_event(EventKind::RxCmdNew(payload.clone()), self.node);
            }
        }
    }

    fn handle_squelch(&mut self, ctx: &mut Context, (object, block, symbol): Position, invalid: &[ObjectId]) {
        if self.floor.is_none() {
            return;
        }
        debug!("원격 송신자 {} SQUELCH: 객체 {} 이전 / 무효 {:?}", self.node, object, invalid);
        let stale: Vec<ObjectId> = self.objects.range(..object).map(|(&id, _)| id).collect();
        for id in stale {
            self.abort_object(ctx, id);
        }
        if matches!(self.floor, Some(floor) if object > floor) {
            self.floor = Some(object);
            self.finished = self.finished.split_off(&object);
        }
        for &id in invalid {
            if self.objects.contains_key(&id) {
                self.abort_object(ctx, id);
            } else {
                self.finish(id);
            }
        }
        if let Some(rx) = self.objects.get(&object) {
            if rx.object_type == ObjectType::Stream {
                let index = rx.fec.stream_index(block, symbol);
                rx.object.rx_stream(|s| s.skip_to(index));
            }
        }
        self.advance_floor();
    }

    /// `position`까지 누락된 데이터가 있는지
    fn missing_through(&self, (object, block, symbol): Position) -> bool {
        let Some(floor) = self.floor else {
            return true;
        };
        if object < floor {
            return false;
        }
        (floor..=object).any(|id| {
            if self.finished.contains(&id) {
                return false;
            }
            match self.objects.get(&id) {
                None => true,
                Some(rx) if id == object => !rx.has_through(block, symbol),
                Some(rx) => !rx.is_complete(),
            }
        })
    }

    /// NACK 가능한 위치 한계
    fn nack_limit(&self, id: ObjectId, rx: &RxObject, boundary: RepairBoundary) -> Option<Position> {
        let (h_object, h_block, h_symbol) = self.horizon?;
        if id < h_object {
            let last = rx.fec.num_blocks().saturating_sub(1);
            return match rx.object_type {
                ObjectType::Stream => {
                    let end = rx.object.rx_stream(|s| s.frontier()).unwrap_or(0);
                    let (b, s) = rx.fec.stream_position(end);
                    Some((id, b, s))
                }
                _ => Some((id, last, rx.fec.block_len(last).saturating_sub(1))),
            };
        }
        if id > h_object {
            return None;
        }
        if rx.object_type == ObjectType::Stream {
            return Some((id, h_block, h_symbol));
        }

        let block_done = self.horizon_flushed || h_symbol + 1 >= rx.fec.block_len(h_block);
        match boundary {
            RepairBoundary::Block if block_done => Some((id, h_block, h_symbol)),
            RepairBoundary::Block if h_block > 0 => Some((id, h_block - 1, 0)),
            RepairBoundary::Block => None,
            RepairBoundary::Object => {
                let last = rx.fec.num_blocks().saturating_sub(1);
                (h_block >= last && block_done).then_some((id, last, 0))
            }
        }
    }

    /// 현재 필요한 복구 요청
    fn build_requests(&self, ctx: &Context) -> Vec<RepairRequest> {
        let mode = ctx.config.nacking_mode;
        if mode == NackingMode::None || ctx.config.silent_receiver {
            return Vec::new();
        }
        let (Some(floor), Some((h_object, _, _))) = (self.floor, self.horizon) else {
            return Vec::new();
        };

        let mut requests = Vec::new();
        let mut weight = 0;
        let mut id = floor;
        while id <= h_object && weight < NACK_WEIGHT_MAX {
            if !self.finished.contains(&id) {
                let before = requests.len();
                match self.objects.get(&id) {
                    Some(rx) => {
                        let limit = self.nack_limit(id, rx, ctx.config.repair_boundary);
                        rx.requests(id, limit, mode, &mut requests);
                    }
                    None if mode == NackingMode::Normal
                        && (id < h_object || self.horizon_flushed) =>
                    {
                        requests.push(RepairRequest::Object { object: id });
                    }
                    None => {}
                }
                weight += requests[before..].iter().map(RepairRequest::weight).sum::<usize>();
            }
            match id.checked_add(1) {
                Some(next) => id = next,
                None => break,
            }
        }
        requests
    }

    fn overhear(&mut self, nack: &NackHeader) {
        if !matches!(self.nack, NackState::Backoff { .. }) || nack.receiver.instance_id != self.instance_id {
            return;
        }
        for request in &nack.requests {
            match request {
                RepairRequest::Info { object } => {
                    self.heard_info.insert(*object);
                }
                RepairRequest::Object { object } => {
                    self.heard_objects.insert(*object);
                }
                RepairRequest::Block {
                    object,
                    block,
                    erasures,
                    ..
                } => {
                    let heard = self.heard_blocks.entry((*object, *block)).or_insert(0);
                    *heard = (*heard).max(*erasures);
                }
            }
        }
    }

    /// 다른 수신자의 NACK이 이미 덮는 요청인지
    fn is_covered(&self, request: &RepairRequest) -> bool {
        match request {
            RepairRequest::Info { object } => {
                self.heard_info.contains(object) || self.heard_objects.contains(object)
            }
            RepairRequest::Object { object } => self.heard_objects.contains(object),
            RepairRequest::Block {
                object,
                block,
                erasures,
                ..
            } => {
                self.heard_objects.contains(object)
                    || matches!(self.heard_blocks.get(&(*object, *block)), Some(h) if h >= erasures)
            }
        }
    }

    fn receiver_fields(&mut self, now: Instant) -> ReceiverFields {
        let grtt_response = self.probe.map(|p| GrttResponse {
            send_time_us: p.send_time_us,
            hold_us: now
                .saturating_duration_since(p.received_at)
                .as_micros()
                .min(u32::MAX as u128) as u32,
        });
        let cc = match self.probe {
            Some(p) => {
                let mut flags = 0;
                if self.is_clr {
                    flags |= CC_FLAG_CLR;
                }
                if !self.loss.loss_seen {
                    flags |= CC_FLAG_START;
                }
                Some(CcFeedback {
                    flags,
                    cc_sequence: p.cc_sequence,
                    loss: quantize_loss(self.loss.loss_fraction()),
                    ecn: quantize_loss(self.loss.ecn_fraction()),
                    rate: self.meter.rate(now) as f32,
                    rtt: quantize_rtt(self.grtt),
                })
            }
            None => None,
        };
        ReceiverFields {
            sender_id: self.node,
            instance_id: self.instance_id,
            grtt_response,
            cc,
        }
    }

    fn send_nack(&mut self, ctx: &mut Context, now: Instant, requests: Vec<RepairRequest>) {
        let header = NackHeader {
            receiver: self.receiver_fields(now),
            requests,
        };
        // 유니캐스트 세션은 항상 송신자에게
        let destination = if ctx.config.unicast_nack || !ctx.address.ip().is_multicast() {
            self.addr
        } else {
            ctx.address
        };
        trace!("원격 송신자 {}에 NACK: {} 요청", self.node, header.requests.len());
        let message = Message::new(ctx.node_id, MessageBody::Nack(header), Bytes::new());
        if let Some(transmit) = ctx.encode(&message, destination) {
            ctx.feedback.push_back(transmit);
            ctx.stats.nacks_sent += 1;
            // NACK이 CC 피드백을 대신함
            self.cc_pending = None;
        }
    }

    fn send_ack(&mut self, ctx: &mut Context, now: Instant, kind: AckKind, payload: Bytes) {
        let header = AckHeader {
            receiver: self.receiver_fields(now),
            kind,
        };
        let message = Message::new(ctx.node_id, MessageBody::Ack(header), payload);
        if let Some(transmit) = ctx.encode(&message, self.addr) {
            ctx.feedback.push_back(transmit);
        }
    }

    fn service(&mut self, ctx: &mut Context, now: Instant, ack_payload: Option<&Bytes>) {
        self.reap_canceled();

        if now >= self.activity_deadline {
            self.misses += 1;
            self.activity_deadline = now + self.activity_interval(ctx.config.rx_robust_factor);
            if self.active && self.misses >= ctx.config.rx_robust_factor {
                self.active = false;
                self.nack = NackState::Idle;
                info!("원격 송신자 {} 비활성", self.node);
                ctx.node_event(EventKind::RemoteSenderInactive, self.node);
            }
        }

        if let Some((at, (object, block, symbol))) = self.ack_pending {
            if now >= at {
                self.ack_pending = None;
                let payload = ack_payload.cloned().unwrap_or_default();
                self.send_ack(ctx, now, AckKind::Flush { object, block, symbol }, payload);
            }
        }
        if matches!(self.cc_pending, Some(at) if now >= at) {
            self.cc_pending = None;
            self.send_ack(ctx, now, AckKind::Cc, Bytes::new());
        }

        self.service_nack(ctx, now);
    }

    fn service_nack(&mut self, ctx: &mut Context, now: Instant) {
        match self.nack {
            NackState::Holdoff { until } if now >= until => self.nack = NackState::Idle,
            NackState::Backoff { until } if now >= until => {
                let requests = self.build_requests(ctx);
                let wanted = !requests.is_empty();
                let requests: Vec<RepairRequest> =
                    requests.into_iter().filter(|r| !self.is_covered(r)).collect();
                self.clear_heard();
                if requests.is_empty() {
                    if wanted {
                        ctx.stats.nacks_suppressed += 1;
                        trace!("원격 송신자 {} NACK 억제", self.node);
                    }
                } else {
                    self.send_nack(ctx, now, requests);
                }
                let holdoff = self.grtt_duration(self.backoff + 2.0);
                self.nack = NackState::Holdoff { until: now + holdoff };
                return;
            }
            _ => {}
        }

        if self.nack == NackState::Idle && self.active && !self.build_requests(ctx).is_empty() {
            let delay = exponential_rand(&mut ctx.rng, self.backoff * self.grtt, self.gsize);
            self.nack = NackState::Backoff {
                until: now + Duration::from_secs_f64(delay),
            };
            self.clear_heard();
        }
    }

    /// 애플리케이션이 취소한 객체 정리
    fn reap_canceled(&mut self) {
        let canceled: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, rx)| rx.object.is_canceled())
            .map(|(&id, _)| id)
            .collect();
        for id in canceled {
            self.objects.remove(&id);
            self.finish(id);
        }
    }

    fn poll_timeout(&self) -> Option<Instant> {
        let nack = match self.nack {
            NackState::Idle => None,
            NackState::Backoff { until } | NackState::Holdoff { until } => Some(until),
        };
        [
            Some(self.activity_deadline),
            nack,
            self.ack_pending.map(|(at, _)| at),
            self.cc_pending,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

/// 수신자 역할
pub(crate) struct ReceiverRole {
    buffer_space: u64,
    ack_payload: Option<Bytes>,
    senders: BTreeMap<NodeId, RemoteSender>,
}

impl ReceiverRole {
    pub(crate) fn new(buffer_space: u64) -> Self {
        Self {
            buffer_space,
            ack_payload: None,
            senders: BTreeMap::new(),
        }
    }

    pub(crate) fn set_cache_limit(&mut self, limit: usize) {
        for remote in self.senders.values_mut() {
            remote.cache.set_count_max(limit);
        }
    }

    pub(crate) fn set_ack_payload(&mut self, payload: Option<Bytes>) {
        self.ack_payload = payload;
    }

    pub(crate) fn remote_senders(&self) -> Vec<NodeId> {
        self.senders.keys().copied().collect()
    }

    pub(crate) fn remote_sender_address(&self, node: NodeId) -> Option<SocketAddr> {
        self.senders.get(&node).map(|r| r.addr)
    }

    /// 원격 송신자 상태 삭제. 없으면 false
    pub(crate) fn delete_remote_sender(&mut self, ctx: &mut Context, node: NodeId) -> bool {
        let Some(mut remote) = self.senders.remove(&node) else {
            return false;
        };
        remote.reap_canceled();
        let ids: Vec<ObjectId> = remote.objects.keys().copied().collect();
        for id in ids {
            remote.abort_object(ctx, id);
        }
        info!("원격 송신자 {} 삭제", node);
        ctx.node_event(EventKind::RemoteSenderPurged, node);
        true
    }

    /// INFO / DATA / CMD 처리
    pub(crate) fn handle_sender_message(
        &mut self,
        ctx: &mut Context,
        now: Instant,
        src: SocketAddr,
        message: &Message,
        ecn_ce: bool,
    ) {
        let Some(fields) = message.body().sender_fields() else {
            return;
        };
        let node = message.source();
        ctx.stats.bytes_received += message.payload.len() as u64;

        if !self.senders.contains_key(&node) {
            info!("새 원격 송신자 {} ({})", node, src);
            let remote = RemoteSender::new(ctx, node, src, fields, self.buffer_space, now);
            self.senders.insert(node, remote);
            ctx.node_event(EventKind::RemoteSenderNew, node);
            ctx.node_event(EventKind::RemoteSenderActive, node);
            ctx.track_node(node, false);
        }
        let Some(remote) = self.senders.get_mut(&node) else {
            return;
        };
        remote.update(ctx, now, src, fields, message.payload.len(), ecn_ce);
        remote.reap_canceled();

        match message.body() {
            MessageBody::Info(header) => {
                remote.check_fec(ctx, &header.fec);
                remote.handle_info(ctx, header, &message.payload);
            }
            MessageBody::Data(header) => {
                remote.check_fec(ctx, &header.fec);
                remote.handle_data(ctx, header, &message.payload);
            }
            MessageBody::Cmd(header) => remote.handle_command(ctx, now, &header.command, &message.payload),
            MessageBody::Nack(_) | MessageBody::Ack(_) => {}
        }
        remote.service(ctx, now, self.ack_payload.as_ref());
    }

    /// 다른 수신자의 NACK (억제용)
    pub(crate) fn overhear_nack(&mut self, nack: &NackHeader) {
        if let Some(remote) = self.senders.get_mut(&nack.receiver.sender_id) {
            remote.overhear(nack);
        }
    }

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        self.senders.values().filter_map(RemoteSender::poll_timeout).min()
    }

    pub(crate) fn handle_timeout(&mut self, ctx: &mut Context, now: Instant) {
        for remote in self.senders.values_mut() {
            remote.service(ctx, now, self.ack_payload.as_ref());
        }
    }
}
