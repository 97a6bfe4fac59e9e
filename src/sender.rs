//! 송신자 역할
//!
//! - 객체 첫 전송: INFO → 소스 세그먼트 → (auto parity) 사전 패리티
//! - NACK 집계 후 새 패리티 우선 복구, 패리티가 모자라면 소스 재전송
//! - flush / 워터마크 / 애플리케이션 명령 / CC 프로브
//! - 속도 제어기에 맞춘 페이싱

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::cache::{TxCache, TxCacheBounds};
use crate::config::{CongestionMode, ProbingMode, SenderParams};
use crate::congestion::{CcReport, RateController, RateOutcome};
use crate::event::EventKind;
use crate::fec::CodecCache;
use crate::grtt::{
    quantize_backoff, quantize_group_size, unquantize_loss, unquantize_rtt, GrttEstimator,
    RTT_MIN,
};
use crate::message::{
    AckHeader, AckKind, CmdHeader, Command, DataHeader, InfoHeader, Message, MessageBody,
    NackHeader, ReceiverFields, RepairRequest, SenderFields, WatermarkRequest, DATA_FLAG_INFO,
    DATA_FLAG_REPAIR,
};
use crate::object::{Content, Object, ObjectId, ObjectState, ObjectType, StreamTx};
use crate::segment::{BlockId, FecObjectInfo, SymbolId};
use crate::session::{Context, Transmit};
use crate::{Error, NodeId, Result, NODE_ANY};

/// SQUELCH 한 번에 싣는 무효 객체 수
const SQUELCH_MAX_INVALID: usize = 64;

/// 전송 위치 (객체, 블록, 심볼)
type Position = (ObjectId, BlockId, SymbolId);

/// 송신 캐시의 객체
struct TxObject {
    object: Object,
    object_type: ObjectType,
    size: u64,
    fec: FecObjectInfo,
    info: Option<Bytes>,
    /// DATA / FILE 내용
    payload: Option<Bytes>,

    /// 첫 전송 커서
    info_pending: bool,
    block: BlockId,
    symbol: SymbolId,
    /// 현재 블록의 사전 패리티 수
    block_parity: u16,
    /// 스트림: 다음 첫 전송 인덱스
    stream_next: u64,

    sent_bytes: u64,
    first_pass_done: bool,

    /// 블록별 이미 쓴 패리티 수 (다음 새 패리티 인덱스)
    parity_used: HashMap<BlockId, u16>,
}

impl TxObject {
    fn stream_end(&self) -> u64 {
        self.object.tx_stream(|s| s.end()).unwrap_or(0)
    }

    fn has_new_data(&self) -> bool {
        if self.info_pending {
            return true;
        }
        match self.object_type {
            ObjectType::Stream => self.stream_next < self.stream_end(),
            _ => !self.first_pass_done,
        }
    }

    /// 마지막 소스 심볼 위치
    fn last_position(&self, id: ObjectId) -> Position {
        match self.object_type {
            ObjectType::Stream => {
                let (block, symbol) = self.fec.stream_position(self.stream_end().saturating_sub(1));
                (id, block, symbol)
            }
            _ => {
                let block = self.fec.num_blocks().saturating_sub(1);
                (id, block, self.fec.block_len(block).saturating_sub(1))
            }
        }
    }

    /// 첫 전송이 위치를 지났는지
    fn passed(&self, block: BlockId, symbol: SymbolId) -> bool {
        match self.object_type {
            ObjectType::Stream => self.stream_next > self.fec.stream_index(block, symbol),
            _ => self.first_pass_done,
        }
    }
}

/// 블록 단위 사전 계산 패리티 (LRU)
struct ParityCache {
    capacity: usize,
    order: VecDeque<(ObjectId, BlockId)>,
    blocks: HashMap<(ObjectId, BlockId), Vec<Bytes>>,
}

impl ParityCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            blocks: HashMap::new(),
        }
    }

    fn get(&self, key: (ObjectId, BlockId), index: usize) -> Option<Bytes> {
        self.blocks.get(&key).and_then(|p| p.get(index).cloned())
    }

    fn insert(&mut self, key: (ObjectId, BlockId), parity: Vec<Bytes>) {
        while self.blocks.len() >= self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.blocks.remove(&old);
                }
                None => break,
            }
        }
        self.order.push_back(key);
        self.blocks.insert(key, parity);
    }

    fn remove_object(&mut self, id: ObjectId) {
        self.order.retain(|&(obj, _)| obj != id);
        self.blocks.retain(|&(obj, _), _| obj != id);
    }
}

/// 집계 중인 블록 복구 요청
#[derive(Debug)]
struct BlockRepair {
    /// 수신자들이 요청한 최대 소거 수
    erasures: u16,
    /// 요청된 소스 심볼
    symbols: BTreeSet<SymbolId>,
    /// 블록 전체 요청
    whole: bool,
    ready_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairItem {
    Info(ObjectId),
    Symbol {
        object: ObjectId,
        block: BlockId,
        symbol: SymbolId,
    },
}

#[derive(Debug)]
struct FlushState {
    remaining: u32,
    next_at: Instant,
    due: bool,
}

#[derive(Debug)]
struct Watermark {
    position: Position,
    payload: Option<Bytes>,
    override_flush: bool,
    /// 첫 전송이 위치를 지남
    armed: bool,
    attempts: u32,
    next_at: Instant,
    due: bool,
    done: bool,
}

#[derive(Debug)]
struct PendingCommand {
    id: u16,
    data: Bytes,
    remaining: u32,
    next_at: Option<Instant>,
    due: bool,
}

/// 송신자 역할
pub(crate) struct SenderRole {
    params: SenderParams,
    sequence: u32,
    next_object_id: ObjectId,

    objects: BTreeMap<ObjectId, TxObject>,
    cache: TxCache,
    codecs: CodecCache,
    parity: ParityCache,

    grtt: GrttEstimator,
    rate: RateController,
    next_send: Instant,

    repair_pending: BTreeMap<(ObjectId, BlockId), BlockRepair>,
    info_repairs: BTreeMap<ObjectId, Instant>,
    repair_queue: VecDeque<RepairItem>,
    /// 복구 직후 늦게 도착한 NACK 무시
    holdoff: HashMap<(ObjectId, BlockId), Instant>,

    squelch_pending: bool,
    squelch_invalid: BTreeSet<ObjectId>,

    flush: Option<FlushState>,
    /// 스트림 능동 flush 요청
    flush_requested: bool,
    watermark: Option<Watermark>,
    command: Option<PendingCommand>,
    command_id: u16,

    next_probe: Option<Instant>,
    last_probe_at: Instant,
    probe_due: bool,

    /// 캐시 거부 후 공간을 기다리는 중
    vacancy_wanted: bool,
    /// 마지막 새 데이터 위치 (flush 위치)
    last_pos: Option<Position>,
    /// 수신자 보고 손실률 (auto parity)
    loss_estimate: f64,

    closing: bool,
    close_flush_started: bool,
    closed: bool,
}

impl SenderRole {
    pub(crate) fn new(params: SenderParams, ctx: &Context, now: Instant) -> Result<Self> {
        params.validate()?;
        let config = &ctx.config;

        let mut rate = RateController::new(config.congestion, config.tx_rate, params.segment_size as usize);
        rate.set_bounds_bps(config.tx_rate_min, config.tx_rate_max);
        let grtt = GrttEstimator::new(
            config.grtt_estimate,
            config.grtt_max,
            config.grtt_interval_min,
            config.grtt_interval_max,
            config.grtt_probing,
        );

        let parity_blocks = params.buffer_space
            / (params.segment_size as usize * params.num_parity.max(1) as usize);

        info!(
            "세션 {} 송신자 시작: instance={} segment={} block={} parity={} rate={:.0} bps",
            ctx.id,
            params.instance_id,
            params.segment_size,
            params.block_size,
            params.num_parity,
            rate.rate_bps()
        );

        Ok(Self {
            sequence: 0,
            next_object_id: 0,
            objects: BTreeMap::new(),
            cache: TxCache::new(config.tx_cache),
            codecs: CodecCache::new(params.num_parity as usize),
            parity: ParityCache::new(parity_blocks),
            grtt,
            rate,
            next_send: now,
            repair_pending: BTreeMap::new(),
            info_repairs: BTreeMap::new(),
            repair_queue: VecDeque::new(),
            holdoff: HashMap::new(),
            squelch_pending: false,
            squelch_invalid: BTreeSet::new(),
            flush: None,
            flush_requested: false,
            watermark: None,
            command: None,
            command_id: 0,
            next_probe: None,
            last_probe_at: now,
            probe_due: false,
            vacancy_wanted: false,
            last_pos: None,
            loss_estimate: 0.0,
            closing: false,
            close_flush_started: false,
            closed: false,
            params,
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn rate_bps(&self) -> f64 {
        self.rate.rate_bps()
    }

    pub(crate) fn grtt(&self) -> f64 {
        self.grtt.advertised()
    }

    /// 세그먼트 하나의 전송 간격 (초)
    fn pkt_interval(&self) -> f64 {
        self.params.segment_size as f64 / self.rate.rate()
    }

    fn grtt_duration(&self, factor: f64) -> Duration {
        Duration::from_secs_f64((self.grtt.advertised() * factor).max(0.0))
    }

    // ===== 설정 =====

    pub(crate) fn set_rate_bps(&mut self, bps: f64) {
        self.rate.set_rate_bps(bps);
    }

    pub(crate) fn set_rate_bounds(&mut self, min: Option<f64>, max: Option<f64>) {
        self.rate.set_bounds_bps(min, max);
    }

    pub(crate) fn set_congestion_mode(&mut self, mode: CongestionMode) {
        self.rate.set_mode(mode);
    }

    pub(crate) fn set_cache_bounds(&mut self, bounds: TxCacheBounds) {
        self.cache.set_bounds(bounds);
    }

    pub(crate) fn set_grtt_estimate(&mut self, grtt: f64) {
        let pkt = self.pkt_interval();
        self.grtt.set_estimate(grtt, pkt);
    }

    pub(crate) fn set_grtt_max(&mut self, grtt_max: f64) {
        let pkt = self.pkt_interval();
        self.grtt.set_max(grtt_max, pkt);
    }

    pub(crate) fn set_probing_mode(&mut self, mode: ProbingMode) {
        self.grtt.set_mode(mode);
    }

    pub(crate) fn set_probing_interval(&mut self, min: f64, max: f64) {
        self.grtt.set_interval(min, max);
    }

    // ===== 객체 enqueue =====

    fn check_open(&self, info: &Option<Bytes>) -> Result<()> {
        if self.closing {
            return Err(Error::SenderNotStarted);
        }
        if let Some(info) = info {
            let max = self.params.segment_size as usize;
            if info.len() > max {
                return Err(Error::InfoTooLarge {
                    len: info.len(),
                    max,
                });
            }
        }
        Ok(())
    }

    fn is_purgeable(&self, id: ObjectId) -> bool {
        self.objects.get(&id).map_or(true, |tx| tx.first_pass_done)
    }

    /// 캐시 한계 확인 후 필요한 퍼지 수행. 수용 불가면 false
    fn admit(&mut self, ctx: &mut Context, size: u64) -> bool {
        let plan = self.cache.plan_admission(size, |id| self.is_purgeable(id));
        match plan {
            Some(evict) => {
                for id in evict {
                    self.purge(ctx, id, true);
                }
                true
            }
            None => {
                debug!(
                    "세션 {} 송신 캐시 가득 참: {} objects / {} bytes",
                    ctx.id,
                    self.cache.len(),
                    self.cache.total_size()
                );
                self.vacancy_wanted = true;
                false
            }
        }
    }

    fn insert(&mut self, ctx: &mut Context, object: Object, fec: FecObjectInfo, payload: Option<Bytes>) -> Object {
        let id = object.id();
        let info = object.info().ok();
        let tx = TxObject {
            object: object.clone(),
            object_type: object.object_type(),
            size: object.size(),
            fec,
            info_pending: info.is_some(),
            info,
            payload,
            block: 0,
            symbol: 0,
            block_parity: 0,
            stream_next: 0,
            sent_bytes: 0,
            first_pass_done: false,
            parity_used: HashMap::new(),
        };
        self.cache.insert(id, tx.size);
        self.objects.insert(id, tx);
        self.next_object_id = id.wrapping_add(1);

        // 새 데이터가 생기면 진행 중인 flush는 의미 없음
        self.flush = None;
        debug!(
            "세션 {} 객체 {} enqueue: {:?} {} bytes",
            ctx.id,
            id,
            object.object_type(),
            object.size()
        );
        object
    }

    fn fec_info(&self, size: u64, num_parity: u16) -> FecObjectInfo {
        FecObjectInfo::new(size, self.params.segment_size, self.params.block_size, num_parity)
    }

    pub(crate) fn enqueue_data(
        &mut self,
        ctx: &mut Context,
        data: Bytes,
        info: Option<Bytes>,
    ) -> Result<Option<Object>> {
        self.check_open(&info)?;
        let size = data.len() as u64;
        if !self.admit(ctx, size) {
            return Ok(None);
        }
        let object = Object::new_tx(
            self.next_object_id,
            ctx.id,
            ObjectType::Data,
            size,
            info,
            Content::Buffer(data.clone()),
        );
        let fec = self.fec_info(size, self.params.num_parity);
        Ok(Some(self.insert(ctx, object, fec, Some(data))))
    }

    pub(crate) fn enqueue_file(
        &mut self,
        ctx: &mut Context,
        path: &Path,
        info: Option<Bytes>,
    ) -> Result<Option<Object>> {
        self.check_open(&info)?;
        let data = Bytes::from(std::fs::read(path)?);
        let size = data.len() as u64;
        if !self.admit(ctx, size) {
            return Ok(None);
        }
        let object = Object::new_tx(
            self.next_object_id,
            ctx.id,
            ObjectType::File,
            size,
            info,
            Content::TxFile {
                path: path.to_path_buf(),
                data: data.clone(),
            },
        );
        let fec = self.fec_info(size, self.params.num_parity);
        Ok(Some(self.insert(ctx, object, fec, Some(data))))
    }

    pub(crate) fn open_stream(
        &mut self,
        ctx: &mut Context,
        buffer_bytes: usize,
        info: Option<Bytes>,
    ) -> Result<Option<Object>> {
        self.check_open(&info)?;
        if buffer_bytes == 0 {
            return Err(Error::InvalidParameter("스트림 버퍼는 0보다 커야 함".into()));
        }
        let size = buffer_bytes as u64;
        if !self.admit(ctx, size) {
            return Ok(None);
        }
        // 스트림은 사전 패리티 없이 NACK 복구만 사용
        let fec = self.fec_info(size, 0);
        let payload_capacity = fec.stream_payload_capacity();
        let capacity = (buffer_bytes / payload_capacity).max(1);
        let object = Object::new_tx(
            self.next_object_id,
            ctx.id,
            ObjectType::Stream,
            size,
            info,
            Content::TxStream(StreamTx::new(capacity, payload_capacity)),
        );
        Ok(Some(self.insert(ctx, object, fec, None)))
    }

    pub(crate) fn requeue(&mut self, object: &Object) -> Result<()> {
        let id = object.id();
        let tx = self.objects.get_mut(&id).ok_or(Error::ObjectNotCached(id))?;
        if tx.object_type == ObjectType::Stream {
            return Err(Error::WrongObjectType {
                expected: ObjectType::Data,
                got: ObjectType::Stream,
            });
        }
        tx.info_pending = tx.info.is_some();
        tx.block = 0;
        tx.symbol = 0;
        tx.block_parity = 0;
        tx.sent_bytes = 0;
        tx.first_pass_done = false;
        tx.object.set_state(ObjectState::Active);
        tx.object.set_bytes_pending(tx.size);
        self.flush = None;
        debug!("객체 {} 재전송 예약", id);
        Ok(())
    }

    /// 캐시에서 객체 해제
    fn purge(&mut self, ctx: &mut Context, id: ObjectId, notify: bool) {
        self.cache.remove(id);
        self.parity.remove_object(id);
        self.repair_pending.retain(|&(obj, _), _| obj != id);
        self.info_repairs.remove(&id);
        self.repair_queue.retain(|item| match item {
            RepairItem::Info(obj) | RepairItem::Symbol { object: obj, .. } => *obj != id,
        });
        if let Some(tx) = self.objects.remove(&id) {
            tx.object.purge_tx();
            if notify {
                ctx.object_event(EventKind::TxObjectPurged, &tx.object);
            }
            trace!("객체 {} 퍼지", id);
        }
    }

    // ===== 워터마크 / 명령 =====

    pub(crate) fn set_watermark(
        &mut self,
        ctx: &mut Context,
        object: &Object,
        override_flush: bool,
        payload: Option<Bytes>,
    ) -> Result<()> {
        let id = object.id();
        let tx = self.objects.get(&id).ok_or(Error::ObjectNotCached(id))?;
        let position = tx.last_position(id);
        ctx.acking.arm();
        self.watermark = Some(Watermark {
            position,
            payload,
            override_flush,
            armed: false,
            attempts: 0,
            next_at: self.next_send,
            due: false,
            done: false,
        });
        debug!("세션 {} 워터마크 설정: {:?}", ctx.id, position);
        Ok(())
    }

    pub(crate) fn cancel_watermark(&mut self, ctx: &mut Context) {
        if self.watermark.take().is_some() {
            ctx.acking.disarm();
        }
    }

    pub(crate) fn reset_watermark(&mut self, ctx: &mut Context) -> Result<()> {
        let wm = self
            .watermark
            .as_mut()
            .ok_or_else(|| Error::InvalidParameter("설정된 워터마크 없음".into()))?;
        ctx.acking.rearm_failures();
        wm.done = false;
        wm.attempts = 0;
        wm.due = false;
        wm.next_at = self.next_send;
        Ok(())
    }

    pub(crate) fn send_command(&mut self, ctx: &Context, data: Bytes, robust: bool) -> Result<bool> {
        if self.closing {
            return Err(Error::SenderNotStarted);
        }
        let max = self.params.segment_size as usize;
        if data.len() > max {
            return Err(Error::InvalidParameter(format!(
                "명령 크기 {} > {}",
                data.len(),
                max
            )));
        }
        if self.command.is_some() {
            return Ok(false);
        }
        self.command_id = self.command_id.wrapping_add(1);
        let remaining = if robust { ctx.config.tx_robust_factor } else { 1 };
        self.command = Some(PendingCommand {
            id: self.command_id,
            data,
            remaining,
            next_at: None,
            due: true,
        });
        Ok(true)
    }

    pub(crate) fn cancel_command(&mut self) {
        self.command = None;
    }

    // ===== 종료 =====

    /// graceful 종료 시작
    pub(crate) fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        for tx in self.objects.values() {
            if tx.object_type == ObjectType::Stream {
                let _ = tx.object.close(true);
            }
        }
        debug!("송신자 종료 중");
    }

    /// 즉시 중단
    pub(crate) fn abort(&mut self) {
        for tx in self.objects.values() {
            tx.object.purge_tx();
        }
        self.objects.clear();
        self.closed = true;
    }

    // ===== 수신자 메시지 =====

    fn handle_receiver_fields(&mut self, ctx: &mut Context, now: Instant, source: NodeId, fields: &ReceiverFields) {
        let now_us = ctx.micros(now);
        let mut measured_rtt = None;
        if let Some(response) = fields.grtt_response {
            let elapsed = now_us
                .saturating_sub(response.send_time_us)
                .saturating_sub(response.hold_us as u64);
            let rtt = (elapsed as f64 / 1e6).max(RTT_MIN);
            measured_rtt = Some(rtt);
            if self.grtt.mode() != ProbingMode::None {
                let pkt = self.pkt_interval();
                if self.grtt.on_response(rtt, pkt, false) {
                    debug!("GRTT 갱신: {:.6}s (node {} rtt {:.6}s)", self.grtt.advertised(), source, rtt);
                    ctx.event(EventKind::GrttUpdated);
                }
            }
        }

        if let Some(cc) = fields.cc {
            let report = CcReport {
                node: source,
                rtt: measured_rtt.unwrap_or_else(|| unquantize_rtt(cc.rtt)),
                loss: unquantize_loss(cc.loss),
                ecn: unquantize_loss(cc.ecn),
                recv_rate: cc.rate as f64,
            };
            self.loss_estimate = 0.75 * self.loss_estimate + 0.25 * report.loss;
            let outcome = self.rate.on_feedback(report, self.grtt.advertised());
            self.emit_rate_outcome(ctx, outcome);
        }
    }

    fn emit_rate_outcome(&self, ctx: &mut Context, outcome: RateOutcome) {
        if outcome.cc_activated {
            ctx.event(EventKind::CcActive);
        }
        if outcome.cc_deactivated {
            ctx.event(EventKind::CcInactive);
        }
        if outcome.rate_changed && self.rate.mode().is_adaptive() {
            ctx.event(EventKind::TxRateChanged);
        }
    }

    pub(crate) fn handle_nack(&mut self, ctx: &mut Context, now: Instant, source: NodeId, nack: &NackHeader) {
        if nack.receiver.instance_id != self.params.instance_id {
            trace!("다른 인스턴스 대상 NACK 무시 (node {})", source);
            return;
        }
        ctx.stats.nacks_received += 1;
        self.handle_receiver_fields(ctx, now, source, &nack.receiver);

        let aggregate = if ctx.address.ip().is_multicast() {
            self.grtt_duration(ctx.config.backoff_factor + 1.0)
        } else {
            Duration::ZERO
        };
        let ready_at = now + aggregate;
        self.holdoff.retain(|_, until| *until > now);

        for request in &nack.requests {
            let id = request.object();
            let Some(tx) = self.objects.get(&id) else {
                self.squelch_object(id);
                continue;
            };
            match request {
                RepairRequest::Info { .. } => {
                    if tx.info.is_some() {
                        self.info_repairs.entry(id).or_insert(ready_at);
                    }
                }
                RepairRequest::Object { .. } => {
                    if tx.info.is_some() {
                        self.info_repairs.entry(id).or_insert(ready_at);
                    }
                    let last_block = match tx.object_type {
                        ObjectType::Stream => tx.fec.stream_position(tx.stream_next.saturating_sub(1)).0,
                        _ if tx.first_pass_done => tx.fec.num_blocks().saturating_sub(1),
                        _ => tx.block,
                    };
                    let full = tx.fec.block_size;
                    let blocks: Vec<(BlockId, u16)> = (0..=last_block)
                        .map(|b| {
                            let len = match tx.object_type {
                                ObjectType::Stream => full,
                                _ => tx.fec.block_len(b),
                            };
                            (b, len)
                        })
                        .collect();
                    for (block, erasures) in blocks {
                        self.add_repair(now, ready_at, id, block, erasures, &[]);
                    }
                }
                RepairRequest::Block {
                    block,
                    erasures,
                    symbols,
                    ..
                } => {
                    self.add_repair(now, ready_at, id, *block, *erasures, symbols);
                }
            }
        }
    }

    fn add_repair(
        &mut self,
        now: Instant,
        ready_at: Instant,
        object: ObjectId,
        block: BlockId,
        erasures: u16,
        symbols: &[SymbolId],
    ) {
        if matches!(self.holdoff.get(&(object, block)), Some(until) if *until > now) {
            return;
        }
        let repair = self
            .repair_pending
            .entry((object, block))
            .or_insert_with(|| BlockRepair {
                erasures: 0,
                symbols: BTreeSet::new(),
                whole: false,
                ready_at,
            });
        repair.erasures = repair.erasures.max(erasures);
        if symbols.is_empty() {
            repair.whole = true;
        } else {
            repair.symbols.extend(symbols.iter().copied());
        }
    }

    fn squelch_object(&mut self, id: ObjectId) {
        if self.squelch_invalid.len() < SQUELCH_MAX_INVALID {
            self.squelch_invalid.insert(id);
        }
        self.squelch_pending = true;
    }

    pub(crate) fn handle_ack(
        &mut self,
        ctx: &mut Context,
        now: Instant,
        source: NodeId,
        ack: &AckHeader,
        payload: &Bytes,
    ) {
        if ack.receiver.instance_id != self.params.instance_id {
            return;
        }
        self.handle_receiver_fields(ctx, now, source, &ack.receiver);

        if let AckKind::Flush {
            object,
            block,
            symbol,
        } = ack.kind
        {
            let Some(wm) = self.watermark.as_ref() else {
                return;
            };
            if wm.done || wm.position != (object, block, symbol) {
                return;
            }
            let payload = (!payload.is_empty()).then(|| payload.clone());
            if ctx.acking.acknowledge(source, payload) {
                debug!("워터마크 ACK: node {}", source);
            }
            if !ctx.acking.has_pending() {
                self.complete_watermark(ctx);
            }
        }
    }

    fn complete_watermark(&mut self, ctx: &mut Context) {
        if let Some(wm) = self.watermark.as_mut() {
            if wm.done {
                return;
            }
            wm.done = true;
            wm.due = false;
            let status = ctx.acking.status(NODE_ANY);
            info!("세션 {} 워터마크 완료: {:?}", ctx.id, status);
            ctx.event(EventKind::TxWatermarkCompleted(status));
        }
    }

    // ===== 타이머 / 상태 처리 =====

    pub(crate) fn handle_timeout(&mut self, ctx: &mut Context, now: Instant) {
        self.service(ctx, now);
    }

    fn service(&mut self, ctx: &mut Context, now: Instant) {
        if self.closed {
            return;
        }
        self.reap_canceled();
        self.service_streams(ctx, now);
        self.promote_repairs(now);
        self.service_watermark(ctx, now);
        self.service_flush(ctx, now);
        self.service_command(now);
        self.service_probe(ctx, now);
        self.service_vacancy(ctx);
        self.service_close(now);
    }

    /// 애플리케이션이 취소한 객체 정리 (이벤트 없음)
    fn reap_canceled(&mut self) {
        let canceled: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, tx)| tx.object.is_canceled())
            .map(|(&id, _)| id)
            .collect();
        for id in canceled {
            self.cache.remove(id);
            self.parity.remove_object(id);
            self.repair_pending.retain(|&(obj, _), _| obj != id);
            self.info_repairs.remove(&id);
            if let Some(tx) = self.objects.remove(&id) {
                tx.object.purge_tx();
            }
        }
    }

    fn service_streams(&mut self, ctx: &mut Context, now: Instant) {
        let mut aborted = Vec::new();
        let mut vacancies = Vec::new();
        let mut finished = Vec::new();

        for (&id, tx) in self.objects.iter() {
            if tx.object_type != ObjectType::Stream || tx.first_pass_done {
                continue;
            }
            let floor = self
                .repair_pending
                .iter()
                .filter(|((obj, _), _)| *obj == id)
                .map(|(&(_, block), repair)| {
                    let symbol = match repair.whole {
                        true => 0,
                        false => repair.symbols.iter().next().copied().unwrap_or(0),
                    };
                    tx.fec.stream_index(block, symbol)
                })
                .chain(self.repair_queue.iter().filter_map(|item| match *item {
                    RepairItem::Symbol {
                        object,
                        block,
                        symbol,
                    } if object == id => Some(tx.fec.stream_index(block, symbol)),
                    _ => None,
                }))
                .min()
                .unwrap_or(u64::MAX);

            let stream_next = tx.stream_next;
            let state = tx.object.tx_stream(|s| {
                s.set_tx_index(stream_next);
                s.set_repair_floor(floor);
                s.service();
                (
                    s.is_aborted(),
                    s.take_vacancy(),
                    s.take_active_flush(),
                    s.is_finished() && stream_next >= s.end(),
                )
            });
            let Some((is_aborted, vacancy, active_flush, done)) = state else {
                continue;
            };
            if is_aborted {
                aborted.push(id);
                continue;
            }
            if vacancy {
                vacancies.push(tx.object.clone());
            }
            if active_flush {
                self.flush_requested = true;
            }
            if done {
                finished.push(id);
            }
        }

        for object in vacancies {
            ctx.object_event(EventKind::TxQueueVacancy, &object);
        }
        for id in aborted {
            debug!("스트림 {} 중단", id);
            self.purge(ctx, id, true);
        }
        for id in finished {
            if let Some(tx) = self.objects.get_mut(&id) {
                tx.first_pass_done = true;
                tx.object.set_state(ObjectState::Completed);
                let object = tx.object.clone();
                ctx.object_event(EventKind::TxObjectSent, &object);
            }
        }

        if self.flush_requested && !self.has_new_data() {
            self.flush_requested = false;
            self.start_flush(ctx, now);
        }
    }

    /// 집계가 끝난 복구 요청을 전송 큐로
    fn promote_repairs(&mut self, now: Instant) {
        let ready: Vec<ObjectId> = self
            .info_repairs
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in ready {
            self.info_repairs.remove(&id);
            self.repair_queue.push_back(RepairItem::Info(id));
        }

        let ready: Vec<(ObjectId, BlockId)> = self
            .repair_pending
            .iter()
            .filter(|(_, repair)| repair.ready_at <= now)
            .map(|(&key, _)| key)
            .collect();
        let holdoff = self.grtt_duration(1.0);
        for key in ready {
            if let Some(repair) = self.repair_pending.remove(&key) {
                self.promote(key, repair);
                self.holdoff.insert(key, now + holdoff);
            }
        }
    }

    fn promote(&mut self, (id, block): (ObjectId, BlockId), repair: BlockRepair) {
        let num_parity = self.params.num_parity;
        let Some(tx) = self.objects.get_mut(&id) else {
            self.squelch_object(id);
            return;
        };

        let mut items = Vec::new();
        let mut too_old = false;
        match tx.object_type {
            ObjectType::Stream => {
                let base = tx.object.tx_stream(|s| s.base()).unwrap_or(0);
                let symbols: Vec<SymbolId> = if repair.whole {
                    (0..tx.fec.block_size).collect()
                } else {
                    repair.symbols.iter().copied().collect()
                };
                for symbol in symbols {
                    let index = tx.fec.stream_index(block, symbol);
                    if index < base {
                        too_old = true;
                    } else if index < tx.stream_next {
                        items.push(symbol);
                    }
                }
            }
            _ => {
                if block >= tx.fec.num_blocks() || (!tx.first_pass_done && block > tx.block) {
                    return;
                }
                let block_len = tx.fec.block_len(block);
                let used = tx.parity_used.entry(block).or_insert(0);
                let fresh = num_parity.saturating_sub(*used);
                if repair.erasures > 0 && repair.erasures <= fresh {
                    items.extend((0..repair.erasures).map(|i| block_len + *used + i));
                    *used += repair.erasures;
                } else if repair.whole || repair.symbols.is_empty() {
                    items.extend(0..block_len);
                } else {
                    items.extend(repair.symbols.iter().copied().filter(|&s| s < block_len));
                }
                // 첫 전송 중인 블록은 아직 보내지 않은 심볼 제외
                if !tx.first_pass_done && block == tx.block {
                    let sent = tx.symbol;
                    items.retain(|&s| s < sent || s >= block_len);
                }
            }
        }

        trace!("객체 {} 블록 {} 복구 {} 심볼", id, block, items.len());
        for symbol in items {
            self.repair_queue.push_back(RepairItem::Symbol {
                object: id,
                block,
                symbol,
            });
        }
        if too_old {
            self.squelch_pending = true;
        }
    }

    fn has_repairs(&self) -> bool {
        !self.repair_pending.is_empty() || !self.info_repairs.is_empty() || !self.repair_queue.is_empty()
    }

    fn service_watermark(&mut self, ctx: &mut Context, now: Instant) {
        let robust = ctx.config.tx_robust_factor;
        let retry = self.grtt_duration(1.0);
        let has_repairs = self.has_repairs();
        let Some(wm) = self.watermark.as_mut() else {
            return;
        };
        if wm.done || wm.due {
            return;
        }
        if !wm.armed {
            let (id, block, symbol) = wm.position;
            let passed = self
                .objects
                .get(&id)
                .map_or(true, |tx| tx.passed(block, symbol));
            if !passed {
                return;
            }
            wm.armed = true;
            wm.next_at = now;
        }
        if !ctx.acking.has_pending() {
            self.complete_watermark(ctx);
            return;
        }
        if now < wm.next_at {
            return;
        }
        if has_repairs {
            wm.next_at = now + retry;
            return;
        }
        if wm.attempts >= robust {
            ctx.acking.fail_pending();
            self.complete_watermark(ctx);
            return;
        }
        wm.due = true;
    }

    fn start_flush(&mut self, ctx: &Context, now: Instant) {
        self.flush = Some(FlushState {
            remaining: ctx.config.tx_robust_factor,
            next_at: now,
            due: false,
        });
    }

    fn service_flush(&mut self, ctx: &mut Context, now: Instant) {
        let Some(flush) = self.flush.as_mut() else {
            return;
        };
        if flush.due || now < flush.next_at {
            return;
        }
        if flush.remaining > 0 {
            flush.due = true;
            return;
        }
        self.flush = None;
        debug!("세션 {} flush 완료", ctx.id);
        ctx.event(EventKind::TxFlushCompleted);
        if self.closing && !self.has_new_data() {
            self.closed = true;
            info!("세션 {} 송신자 종료", ctx.id);
            ctx.event(EventKind::LocalSenderClosed);
        }
    }

    fn service_command(&mut self, now: Instant) {
        if let Some(cmd) = self.command.as_mut() {
            if !cmd.due && cmd.remaining > 0 && cmd.next_at.map_or(true, |at| now >= at) {
                cmd.due = true;
            }
        }
    }

    fn probing_enabled(&self) -> bool {
        self.grtt.mode() != ProbingMode::None || self.rate.mode().is_adaptive()
    }

    fn service_probe(&mut self, ctx: &mut Context, now: Instant) {
        if !self.probing_enabled() {
            self.next_probe = None;
            return;
        }
        let next = *self.next_probe.get_or_insert(now);
        if now < next {
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_probe_at).as_secs_f64();
        let pkt = self.pkt_interval();
        if self.grtt.on_probe(elapsed, pkt, false) {
            ctx.event(EventKind::GrttUpdated);
        }
        let outcome = self.rate.on_probe(self.grtt.advertised());
        self.emit_rate_outcome(ctx, outcome);

        self.last_probe_at = now;
        let interval = self.grtt.next_interval(self.rate.mode().is_adaptive());
        self.next_probe = Some(now + Duration::from_secs_f64(interval.max(0.001)));
        self.probe_due = true;
    }

    fn service_vacancy(&mut self, ctx: &mut Context) {
        if !self.vacancy_wanted {
            return;
        }
        if self.cache.plan_admission(0, |id| self.is_purgeable(id)).is_some() {
            self.vacancy_wanted = false;
            ctx.event(EventKind::TxQueueVacancy);
        }
    }

    fn service_close(&mut self, now: Instant) {
        if !self.closing || self.close_flush_started || self.has_new_data() {
            return;
        }
        self.close_flush_started = true;
        if self.flush.is_none() {
            self.flush = Some(FlushState {
                remaining: 1,
                next_at: now,
                due: false,
            });
        }
    }

    fn has_new_data(&self) -> bool {
        self.objects.values().any(TxObject::has_new_data)
    }

    fn has_open_stream(&self) -> bool {
        self.objects
            .values()
            .any(|tx| tx.object_type == ObjectType::Stream && !tx.first_pass_done)
    }

    /// 새 데이터가 모두 나감
    fn queue_empty(&mut self, ctx: &mut Context, now: Instant) {
        ctx.event(EventKind::TxQueueEmpty);
        let overridden = matches!(&self.watermark, Some(wm) if wm.override_flush && !wm.done);
        if overridden {
            return;
        }
        if self.flush_requested || self.closing || !self.has_open_stream() {
            self.flush_requested = false;
            self.start_flush(ctx, now);
        }
    }

    // ===== 전송 =====

    pub(crate) fn poll_timeout(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        if self.has_ready_work() {
            return Some(self.next_send);
        }
        let repair = self.repair_pending.values().map(|r| r.ready_at).min();
        let info = self.info_repairs.values().copied().min();
        let flush = self.flush.as_ref().map(|f| f.next_at);
        let watermark = self
            .watermark
            .as_ref()
            .filter(|wm| wm.armed && !wm.done)
            .map(|wm| wm.next_at);
        let command = self.command.as_ref().and_then(|c| c.next_at);
        [repair, info, flush, watermark, command, self.next_probe]
            .into_iter()
            .flatten()
            .min()
    }

    fn has_ready_work(&self) -> bool {
        self.command.as_ref().map_or(false, |c| c.due)
            || self.probe_due
            || !self.repair_queue.is_empty()
            || self.squelch_pending
            || self.flush.as_ref().map_or(false, |f| f.due)
            || self.watermark.as_ref().map_or(false, |w| w.due)
            || self.has_new_data()
    }

    pub(crate) fn poll_transmit(&mut self, ctx: &mut Context, now: Instant) -> Option<Transmit> {
        self.service(ctx, now);
        if self.closed || now < self.next_send {
            return None;
        }
        let message = self.next_message(ctx, now)?;
        let transmit = ctx.encode(&message, ctx.address)?;

        let delay = self.rate.pacing_delay(transmit.contents.len());
        let base = if now > self.next_send + delay {
            now
        } else {
            self.next_send
        };
        self.next_send = base + delay;
        ctx.stats.bytes_sent += transmit.contents.len() as u64;
        trace!("{} 전송 {} bytes", message.body().name(), transmit.contents.len());
        Some(transmit)
    }

    fn sender_fields(&mut self, ctx: &Context) -> SenderFields {
        self.sequence = self.sequence.wrapping_add(1);
        SenderFields {
            instance_id: self.params.instance_id,
            sequence: self.sequence,
            grtt: self.grtt.quantized(),
            backoff: quantize_backoff(ctx.config.backoff_factor),
            gsize: quantize_group_size(ctx.config.group_size),
        }
    }

    fn command_message(&mut self, ctx: &Context, command: Command, payload: Bytes) -> Message {
        let header = CmdHeader {
            sender: self.sender_fields(ctx),
            command,
        };
        Message::new(ctx.node_id, MessageBody::Cmd(header), payload)
    }

    fn next_message(&mut self, ctx: &mut Context, now: Instant) -> Option<Message> {
        if let Some(message) = self.next_command(ctx, now) {
            return Some(message);
        }
        if self.probe_due {
            self.probe_due = false;
            return Some(self.probe_message(ctx, now));
        }
        if let Some(message) = self.next_repair(ctx) {
            return Some(message);
        }
        if let Some(message) = self.next_new_data(ctx, now) {
            return Some(message);
        }
        if let Some(message) = self.next_watermark(ctx, now) {
            return Some(message);
        }
        if let Some(message) = self.next_flush(ctx, now) {
            return Some(message);
        }
        if self.squelch_pending {
            self.squelch_pending = false;
            return Some(self.squelch_message(ctx));
        }
        None
    }

    fn next_command(&mut self, ctx: &mut Context, now: Instant) -> Option<Message> {
        let retry = self.grtt_duration(2.0);
        let cmd = self.command.as_mut().filter(|c| c.due)?;
        cmd.due = false;
        cmd.remaining -= 1;
        cmd.next_at = Some(now + retry);
        let (id, data, done) = (cmd.id, cmd.data.clone(), cmd.remaining == 0);
        if done {
            self.command = None;
            ctx.event(EventKind::TxCmdSent);
        }
        Some(self.command_message(ctx, Command::Application { id }, data))
    }

    fn probe_message(&mut self, ctx: &Context, now: Instant) -> Message {
        let command = Command::Cc {
            cc_sequence: self.rate.next_sequence(),
            send_time_us: ctx.micros(now),
            rate: self.rate.rate() as f32,
            clr: self.rate.clr(),
            respond: self.grtt.mode() == ProbingMode::Active || self.rate.mode().is_adaptive(),
        };
        self.command_message(ctx, command, Bytes::new())
    }

    fn next_repair(&mut self, ctx: &mut Context) -> Option<Message> {
        while let Some(item) = self.repair_queue.pop_front() {
            let message = match item {
                RepairItem::Info(id) => self.info_message(ctx, id),
                RepairItem::Symbol {
                    object,
                    block,
                    symbol,
                } => self.data_message(ctx, object, block, symbol, DATA_FLAG_REPAIR),
            };
            if let Some(message) = message {
                ctx.stats.repair_segments_sent += 1;
                if let Some(flush) = self.flush.as_mut() {
                    flush.remaining = ctx.config.tx_robust_factor;
                }
                return Some(message);
            }
        }
        None
    }

    fn info_message(&mut self, ctx: &Context, id: ObjectId) -> Option<Message> {
        let tx = self.objects.get(&id)?;
        let info = tx.info.clone()?;
        let (object_type, fec) = (tx.object_type, tx.fec);
        let header = InfoHeader {
            sender: self.sender_fields(ctx),
            object: id,
            object_type,
            fec,
        };
        Some(Message::new(ctx.node_id, MessageBody::Info(header), info))
    }

    fn data_message(
        &mut self,
        ctx: &Context,
        id: ObjectId,
        block: BlockId,
        symbol: SymbolId,
        flags: u8,
    ) -> Option<Message> {
        let payload = self.segment_payload(id, block, symbol)?;
        let tx = self.objects.get(&id)?;
        let (object_type, fec) = (tx.object_type, tx.fec);
        let flags = if tx.info.is_some() {
            flags | DATA_FLAG_INFO
        } else {
            flags
        };
        let header = DataHeader {
            sender: self.sender_fields(ctx),
            object: id,
            object_type,
            fec,
            block,
            symbol,
            flags,
            crc32: 0,
        };
        Some(Message::new(ctx.node_id, MessageBody::Data(header), payload))
    }

    /// 심볼 내용 (소스 조각 또는 패리티)
    fn segment_payload(&mut self, id: ObjectId, block: BlockId, symbol: SymbolId) -> Option<Bytes> {
        let tx = self.objects.get(&id)?;
        let fec = tx.fec;
        if tx.object_type == ObjectType::Stream {
            let index = fec.stream_index(block, symbol);
            return tx
                .object
                .tx_stream(|s| s.segment(index).map(Bytes::copy_from_slice))
                .flatten();
        }

        let payload = tx.payload.clone()?;
        let source = |s: SymbolId| {
            let offset = fec.segment_offset(block, s) as usize;
            let len = fec.segment_len(block, s);
            payload.slice(offset..offset + len)
        };
        let block_len = fec.block_len(block);
        if symbol < block_len {
            return Some(source(symbol));
        }

        let index = (symbol - block_len) as usize;
        if let Some(parity) = self.parity.get((id, block), index) {
            return Some(parity);
        }
        let sources: Vec<Bytes> = (0..block_len).map(source).collect();
        let codec = match self.codecs.get(block_len as usize) {
            Ok(codec) => codec,
            Err(e) => {
                warn!("패리티 계산 실패 (객체 {} 블록 {}): {}", id, block, e);
                return None;
            }
        };
        let parity: Vec<Bytes> = match codec.encode(&sources) {
            Ok(parity) => parity.into_iter().map(Bytes::from).collect(),
            Err(e) => {
                warn!("패리티 계산 실패 (객체 {} 블록 {}): {}", id, block, e);
                return None;
            }
        };
        let segment = parity.get(index).cloned();
        self.parity.insert((id, block), parity);
        segment
    }

    fn auto_parity_count(&self, ctx: &Context, block_len: u16) -> u16 {
        if !ctx.config.auto_parity || self.params.num_parity == 0 {
            return 0;
        }
        let ratio = ctx.config.calculate_redundancy(self.loss_estimate);
        ((ratio * block_len as f64).ceil() as u16).min(self.params.num_parity)
    }

    fn next_new_data(&mut self, ctx: &mut Context, now: Instant) -> Option<Message> {
        let id = self
            .objects
            .iter()
            .find(|(_, tx)| tx.has_new_data())
            .map(|(&id, _)| id)?;

        let message = if self.objects.get(&id)?.info_pending {
            if let Some(tx) = self.objects.get_mut(&id) {
                tx.info_pending = false;
            }
            self.info_message(ctx, id)
        } else {
            match self.objects.get(&id)?.object_type {
                ObjectType::Stream => self.next_stream_segment(ctx, id),
                _ => self.next_object_segment(ctx, id),
            }
        };

        if !self.has_new_data() {
            self.queue_empty(ctx, now);
        }
        message
    }

    fn next_stream_segment(&mut self, ctx: &mut Context, id: ObjectId) -> Option<Message> {
        let tx = self.objects.get_mut(&id)?;
        let index = tx.stream_next;
        tx.stream_next += 1;
        let next = tx.stream_next;
        tx.object.tx_stream(|s| s.set_tx_index(next));
        let (block, symbol) = tx.fec.stream_position(index);

        self.last_pos = Some((id, block, symbol));
        ctx.stats.data_segments_sent += 1;
        self.rate.on_data_sent();
        self.data_message(ctx, id, block, symbol, 0)
    }

    fn next_object_segment(&mut self, ctx: &mut Context, id: ObjectId) -> Option<Message> {
        let (fec, block, symbol) = {
            let tx = self.objects.get(&id)?;
            (tx.fec, tx.block, tx.symbol)
        };
        let block_len = fec.block_len(block);
        let auto = if symbol == 0 {
            Some(self.auto_parity_count(ctx, block_len))
        } else {
            None
        };

        let tx = self.objects.get_mut(&id)?;
        if let Some(auto) = auto {
            tx.block_parity = auto;
        }
        let is_source = symbol < block_len;
        if is_source {
            tx.sent_bytes += fec.segment_len(block, symbol) as u64;
            tx.object.set_bytes_pending(tx.size.saturating_sub(tx.sent_bytes));
        } else {
            let used = tx.parity_used.entry(block).or_insert(0);
            *used = (*used).max(symbol - block_len + 1);
        }

        tx.symbol += 1;
        let mut sent_event = None;
        if tx.symbol >= block_len + tx.block_parity {
            tx.block += 1;
            tx.symbol = 0;
            if tx.block >= fec.num_blocks() {
                tx.first_pass_done = true;
                tx.object.set_bytes_pending(0);
                tx.object.set_state(ObjectState::Completed);
                sent_event = Some(tx.object.clone());
            }
        }

        if is_source {
            self.last_pos = Some((id, block, symbol));
            ctx.stats.data_segments_sent += 1;
            self.rate.on_data_sent();
        } else {
            ctx.stats.parity_segments_sent += 1;
        }
        let message = self.data_message(ctx, id, block, symbol, 0);
        if let Some(object) = sent_event {
            debug!("객체 {} 첫 전송 완료", id);
            ctx.object_event(EventKind::TxObjectSent, &object);
        }
        message
    }

    fn next_watermark(&mut self, ctx: &Context, now: Instant) -> Option<Message> {
        let retry = self.grtt_duration(2.0);
        let max_nodes = (self.params.segment_size as usize / 4).max(1);
        let wm = self.watermark.as_mut().filter(|wm| wm.due)?;
        wm.due = false;
        wm.attempts += 1;
        wm.next_at = now + retry;
        let (object, block, symbol) = wm.position;
        let payload = wm.payload.clone();

        let mut acking_nodes = ctx.acking.pending();
        acking_nodes.truncate(max_nodes);
        let command = Command::Flush {
            object,
            block,
            symbol,
            watermark: Some(WatermarkRequest {
                acking_nodes,
                with_payload: payload.is_some(),
            }),
        };
        Some(self.command_message(ctx, command, payload.unwrap_or_default()))
    }

    fn next_flush(&mut self, ctx: &Context, now: Instant) -> Option<Message> {
        let retry = self.grtt_duration(2.0);
        let flush = self.flush.as_mut().filter(|f| f.due)?;
        flush.due = false;
        flush.remaining = flush.remaining.saturating_sub(1);
        flush.next_at = now + retry;

        let (object, block, symbol) = self.last_pos.unwrap_or((self.next_object_id, 0, 0));
        let command = Command::Flush {
            object,
            block,
            symbol,
            watermark: None,
        };
        Some(self.command_message(ctx, command, Bytes::new()))
    }

    fn squelch_message(&mut self, ctx: &Context) -> Message {
        let (object, block, symbol) = match self.cache.oldest().and_then(|id| self.objects.get(&id).map(|tx| (id, tx))) {
            Some((id, tx)) if tx.object_type == ObjectType::Stream => {
                let base = tx.object.tx_stream(|s| s.base()).unwrap_or(0);
                let (block, symbol) = tx.fec.stream_position(base);
                (id, block, symbol)
            }
            Some((id, _)) => (id, 0, 0),
            None => (self.next_object_id, 0, 0),
        };
        let invalid: Vec<ObjectId> = std::mem::take(&mut self.squelch_invalid).into_iter().collect();
        debug!("SQUELCH: 가장 오래된 위치 {:?}, 무효 {:?}", (object, block, symbol), invalid);
        let command = Command::Squelch {
            object,
            block,
            symbol,
            invalid,
        };
        self.command_message(ctx, command, Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;

    fn context(config: SessionConfig, now: Instant) -> Context {
        Context::for_test(1, config, now)
    }

    fn fixed_config() -> SessionConfig {
        SessionConfig {
            tx_rate: 8_000_000.0,
            grtt_probing: ProbingMode::None,
            tx_robust_factor: 2,
            ..SessionConfig::default()
        }
    }

    /// 전송 가능한 메시지를 모두 꺼냄
    fn drain(sender: &mut SenderRole, ctx: &mut Context, now: &mut Instant) -> Vec<Message> {
        let mut out = Vec::new();
        for _ in 0..10_000 {
            match sender.poll_transmit(ctx, *now) {
                Some(t) => out.push(Message::from_bytes(&t.contents).unwrap()),
                None => match sender.poll_timeout() {
                    Some(at) if at > *now => *now = at,
                    Some(_) => {}
                    None => break,
                },
            }
            if sender.is_closed() {
                break;
            }
        }
        out
    }

    fn kinds(ctx: &mut Context) -> Vec<EventKind> {
        ctx.events.drain(..).map(|e| e.kind).collect()
    }

    #[test]
    fn test_first_pass_sends_info_then_sources() {
        let mut now = Instant::now();
        let mut ctx = context(fixed_config(), now);
        let mut sender = SenderRole::new(SenderParams::new(1 << 20, 100, 4, 2), &ctx, now).unwrap();

        let obj = sender
            .enqueue_data(&mut ctx, Bytes::from(vec![7u8; 650]), Some(Bytes::from_static(b"name")))
            .unwrap()
            .unwrap();
        let messages = drain(&mut sender, &mut ctx, &mut now);
        assert!(matches!(messages[0].body(), MessageBody::Info(_)));
        assert_eq!(messages[0].payload.as_ref(), b"name");

        let data: Vec<&DataHeader> = messages
            .iter()
            .filter_map(|m| match m.body() {
                MessageBody::Data(h) => Some(h),
                _ => None,
            })
            .collect();
        assert_eq!(data.len(), 7);
        assert!(data.iter().all(|h| h.flags & DATA_FLAG_INFO != 0));
        assert_eq!((data[4].block, data[4].symbol), (1, 0));

        assert_eq!(obj.state(), ObjectState::Completed);
        assert_eq!(obj.bytes_pending(), 0);
        assert_eq!(ctx.stats.data_segments_sent, 7);

        let events = kinds(&mut ctx);
        let sent = events.iter().position(|k| *k == EventKind::TxObjectSent).unwrap();
        let empty = events.iter().position(|k| *k == EventKind::TxQueueEmpty).unwrap();
        assert!(sent < empty);
        assert!(events.contains(&EventKind::TxFlushCompleted));
    }

    #[test]
    fn test_pacing_follows_fixed_rate() {
        let start = Instant::now();
        let mut ctx = context(fixed_config(), start);
        let mut sender = SenderRole::new(SenderParams::new(1 << 20, 1000, 16, 0), &ctx, start).unwrap();
        sender
            .enqueue_data(&mut ctx, Bytes::from(vec![1u8; 100_000]), None)
            .unwrap()
            .unwrap();

        let mut now = start;
        let mut bytes = 0usize;
        let mut last = start;
        loop {
            let Some(t) = sender.poll_transmit(&mut ctx, now) else {
                now = sender.poll_timeout().unwrap();
                continue;
            };
            if !matches!(Message::from_bytes(&t.contents).unwrap().body(), MessageBody::Data(_)) {
                break;
            }
            bytes += t.contents.len();
            last = now;
        }
        // 마지막 패킷의 전송 슬롯 제외
        let rate = bytes as f64 * 8.0 / last.duration_since(start).as_secs_f64();
        assert!((rate - 8_000_000.0).abs() / 8_000_000.0 < 0.05, "rate {}", rate);
        assert!(!kinds(&mut ctx).contains(&EventKind::TxRateChanged));
    }

    #[test]
    fn test_nack_answered_with_fresh_parity() {
        let mut now = Instant::now();
        let mut ctx = context(fixed_config(), now);
        let mut sender = SenderRole::new(SenderParams::new(1 << 20, 100, 4, 2), &ctx, now).unwrap();
        sender
            .enqueue_data(&mut ctx, Bytes::from(vec![3u8; 400]), None)
            .unwrap()
            .unwrap();
        drain(&mut sender, &mut ctx, &mut now);
        ctx.stats.repair_segments_sent = 0;

        let nack = NackHeader {
            receiver: ReceiverFields {
                sender_id: 1,
                instance_id: 1,
                grtt_response: None,
                cc: None,
            },
            requests: vec![RepairRequest::Block {
                object: 0,
                block: 0,
                erasures: 2,
                symbols: vec![1, 3],
            }],
        };
        sender.handle_nack(&mut ctx, now, 9, &nack);
        let repairs: Vec<SymbolId> = drain(&mut sender, &mut ctx, &mut now)
            .into_iter()
            .filter_map(|m| match m.body() {
                MessageBody::Data(h) if h.flags & DATA_FLAG_REPAIR != 0 => Some(h.symbol),
                _ => None,
            })
            .collect();
        assert_eq!(repairs, vec![4, 5]);

        // 패리티 소진 후에는 요청된 소스 심볼
        sender.holdoff.clear();
        sender.handle_nack(&mut ctx, now, 9, &nack);
        let repairs: Vec<SymbolId> = drain(&mut sender, &mut ctx, &mut now)
            .into_iter()
            .filter_map(|m| match m.body() {
                MessageBody::Data(h) if h.flags & DATA_FLAG_REPAIR != 0 => Some(h.symbol),
                _ => None,
            })
            .collect();
        assert_eq!(repairs, vec![1, 3]);
    }

    #[test]
    fn test_nack_for_unknown_object_is_squelched() {
        let mut now = Instant::now();
        let mut ctx = context(fixed_config(), now);
        let mut sender = SenderRole::new(SenderParams::default(), &ctx, now).unwrap();
        let nack = NackHeader {
            receiver: ReceiverFields {
                sender_id: 1,
                instance_id: 1,
                grtt_response: None,
                cc: None,
            },
            requests: vec![RepairRequest::Object { object: 42 }],
        };
        sender.handle_nack(&mut ctx, now, 9, &nack);
        let squelch = drain(&mut sender, &mut ctx, &mut now)
            .into_iter()
            .find_map(|m| match m.body() {
                MessageBody::Cmd(CmdHeader {
                    command: Command::Squelch { invalid, .. },
                    ..
                }) => Some(invalid.clone()),
                _ => None,
            });
        assert_eq!(squelch, Some(vec![42]));
    }

    #[test]
    fn test_cache_rejection_and_vacancy() {
        let mut now = Instant::now();
        let mut config = fixed_config();
        config.tx_cache = TxCacheBounds {
            size_max: 1000,
            count_min: 1,
            count_max: 2,
        };
        let mut ctx = context(config, now);
        let mut sender = SenderRole::new(SenderParams::new(1 << 20, 100, 4, 0), &ctx, now).unwrap();

        let a = sender.enqueue_data(&mut ctx, Bytes::from(vec![0u8; 400]), None).unwrap();
        let b = sender.enqueue_data(&mut ctx, Bytes::from(vec![0u8; 400]), None).unwrap();
        assert!(a.is_some() && b.is_some());
        // 아직 전송되지 않은 객체는 퍼지 불가 → 거부
        assert!(sender
            .enqueue_data(&mut ctx, Bytes::from(vec![0u8; 400]), None)
            .unwrap()
            .is_none());

        drain(&mut sender, &mut ctx, &mut now);
        let events = kinds(&mut ctx);
        assert!(events.contains(&EventKind::TxQueueVacancy));

        let c = sender.enqueue_data(&mut ctx, Bytes::from(vec![0u8; 400]), None).unwrap();
        assert!(c.is_some());
        assert!(kinds(&mut ctx).contains(&EventKind::TxObjectPurged));
        assert_eq!(a.unwrap().state(), ObjectState::Purged);
    }

    #[test]
    fn test_info_too_large() {
        let now = Instant::now();
        let mut ctx = context(fixed_config(), now);
        let mut sender = SenderRole::new(SenderParams::new(1 << 20, 100, 4, 0), &ctx, now).unwrap();
        let result = sender.enqueue_data(&mut ctx, Bytes::new(), Some(Bytes::from(vec![0u8; 101])));
        assert!(matches!(result, Err(Error::InfoTooLarge { len: 101, max: 100 })));
    }

    #[test]
    fn test_watermark_without_nodes_succeeds() {
        let mut now = Instant::now();
        let mut ctx = context(fixed_config(), now);
        let mut sender = SenderRole::new(SenderParams::new(1 << 20, 100, 4, 0), &ctx, now).unwrap();
        let obj = sender
            .enqueue_data(&mut ctx, Bytes::from(vec![0u8; 200]), None)
            .unwrap()
            .unwrap();
        sender.set_watermark(&mut ctx, &obj, false, None).unwrap();
        drain(&mut sender, &mut ctx, &mut now);
        assert!(kinds(&mut ctx).contains(&EventKind::TxWatermarkCompleted(crate::AckingStatus::Success)));
    }

    #[test]
    fn test_watermark_fails_after_robust_attempts() {
        let mut now = Instant::now();
        let mut ctx = context(fixed_config(), now);
        ctx.acking.add(5);
        let mut sender = SenderRole::new(SenderParams::new(1 << 20, 100, 4, 0), &ctx, now).unwrap();
        let obj = sender
            .enqueue_data(&mut ctx, Bytes::from(vec![0u8; 200]), None)
            .unwrap()
            .unwrap();
        sender.set_watermark(&mut ctx, &obj, false, Some(Bytes::from_static(b"req"))).unwrap();

        let flushes = drain(&mut sender, &mut ctx, &mut now)
            .into_iter()
            .filter(|m| {
                matches!(
                    m.body(),
                    MessageBody::Cmd(CmdHeader {
                        command: Command::Flush { watermark: Some(_), .. },
                        ..
                    })
                )
            })
            .count();
        assert_eq!(flushes, 2);
        assert!(kinds(&mut ctx).contains(&EventKind::TxWatermarkCompleted(crate::AckingStatus::Failure)));
        assert_eq!(ctx.acking.status(5), crate::AckingStatus::Failure);

        // reset: FAILURE → PENDING, ACK 수신으로 성공
        sender.reset_watermark(&mut ctx).unwrap();
        assert_eq!(ctx.acking.status(5), crate::AckingStatus::Pending);
        let ack = AckHeader {
            receiver: ReceiverFields {
                sender_id: 1,
                instance_id: 1,
                grtt_response: None,
                cc: None,
            },
            kind: AckKind::Flush {
                object: 0,
                block: 0,
                symbol: 1,
            },
        };
        sender.handle_ack(&mut ctx, now, 5, &ack, &Bytes::from_static(b"ok"));
        assert!(kinds(&mut ctx).contains(&EventKind::TxWatermarkCompleted(crate::AckingStatus::Success)));
        assert_eq!(ctx.acking.ack_payload(5), Some(Bytes::from_static(b"ok")));
    }

    #[test]
    fn test_command_robust_repeats() {
        let mut now = Instant::now();
        let mut ctx = context(fixed_config(), now);
        let mut sender = SenderRole::new(SenderParams::default(), &ctx, now).unwrap();
        assert!(sender.send_command(&ctx, Bytes::from_static(b"go"), true).unwrap());
        assert!(!sender.send_command(&ctx, Bytes::from_static(b"again"), false).unwrap());

        let sent = drain(&mut sender, &mut ctx, &mut now)
            .into_iter()
            .filter(|m| {
                matches!(
                    m.body(),
                    MessageBody::Cmd(CmdHeader {
                        command: Command::Application { .. },
                        ..
                    })
                )
            })
            .count();
        assert_eq!(sent, 2);
        assert_eq!(
            kinds(&mut ctx).iter().filter(|k| **k == EventKind::TxCmdSent).count(),
            1
        );
    }

    #[test]
    fn test_graceful_close() {
        let mut now = Instant::now();
        let mut ctx = context(fixed_config(), now);
        let mut sender = SenderRole::new(SenderParams::new(1 << 20, 100, 4, 0), &ctx, now).unwrap();
        sender
            .enqueue_data(&mut ctx, Bytes::from(vec![0u8; 100]), None)
            .unwrap()
            .unwrap();
        sender.close();
        assert!(matches!(
            sender.enqueue_data(&mut ctx, Bytes::new(), None),
            Err(Error::SenderNotStarted)
        ));
        drain(&mut sender, &mut ctx, &mut now);
        assert!(sender.is_closed());
        assert_eq!(kinds(&mut ctx).last(), Some(&EventKind::LocalSenderClosed));
    }
}
