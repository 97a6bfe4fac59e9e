//! 전송 객체 (DATA / FILE / STREAM)
//!
//! `Object`는 애플리케이션과 이벤트 스트림이 동시에 들고 있을 수 있는 공유
//! 핸들이다. 마지막 참조가 사라질 때 해제된다. 엔진만 내부 상태를 바꾸며,
//! 애플리케이션은 공개 메서드(cancel, 스트림 write/read 등)로만 접근한다.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::config::FlushMode;
use crate::segment::{
    decode_stream_segment, encode_stream_segment, STREAM_FLAG_MSG_START, STREAM_FLAG_STREAM_END,
};
use crate::session::SessionId;
use crate::{Error, NodeId, Result};

/// 객체 전송 ID (송신자 인스턴스 내 단조 증가)
pub type ObjectId = u32;

/// 수신 FILE 임시 파일 접두사
pub const TEMP_FILE_PREFIX: &str = "normTemp";

/// 객체 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    /// 메모리 버퍼
    Data,
    /// 파일
    File,
    /// 연속 바이트 스트림
    Stream,
}

/// 객체 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// 송신 대기/전송 중 또는 수신 중
    Active,
    /// 송신: 첫 전송 완료 / 수신: 수신 완료
    Completed,
    /// 수신 중단
    Aborted,
    /// 송신 캐시에서 해제됨
    Purged,
}

/// 송신 스트림 버퍼
#[derive(Debug)]
pub(crate) struct StreamTx {
    /// 버퍼에 담을 수 있는 세그먼트 수
    capacity: usize,

    /// 세그먼트당 데이터 바이트 수
    payload_capacity: usize,

    /// 아직 세그먼트로 만들어지지 않은 데이터
    staging: Vec<u8>,
    staging_flags: u8,

    /// 다음 바이트가 새 메시지의 시작
    msg_start: bool,

    /// 인코딩된 세그먼트 (`segments[0]`의 인덱스가 `base`)
    segments: VecDeque<Vec<u8>>,
    base: u64,

    /// 첫 전송이 끝난 다음 인덱스 (송신자가 갱신)
    tx_index: u64,

    /// 복구 대기 중인 가장 낮은 인덱스 (송신자가 갱신)
    repair_floor: u64,

    auto_flush: FlushMode,

    /// 버퍼가 차서 부분 세그먼트 push가 밀림
    push_pending: bool,

    /// 능동 flush 요청 (송신자가 CMD(FLUSH) 전송)
    active_flush: bool,

    /// 버퍼 부족으로 write가 잘림 → QUEUE_VACANCY 대기
    vacancy_wanted: bool,

    closing: bool,
    end_pushed: bool,
    aborted: bool,
}

impl StreamTx {
    pub(crate) fn new(capacity: usize, payload_capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            payload_capacity,
            staging: Vec::with_capacity(payload_capacity),
            staging_flags: 0,
            msg_start: true,
            segments: VecDeque::new(),
            base: 0,
            tx_index: 0,
            repair_floor: u64::MAX,
            auto_flush: FlushMode::None,
            push_pending: false,
            active_flush: false,
            vacancy_wanted: false,
            closing: false,
            end_pushed: false,
            aborted: false,
        }
    }

    fn evictable(&self) -> bool {
        !self.segments.is_empty() && self.base < self.tx_index.min(self.repair_floor)
    }

    fn has_room(&mut self) -> bool {
        if self.segments.len() < self.capacity {
            return true;
        }
        if self.evictable() {
            self.segments.pop_front();
            self.base += 1;
            return true;
        }
        false
    }

    fn push_segment(&mut self, flags: u8, data: &[u8]) -> bool {
        if !self.has_room() {
            return false;
        }
        self.segments.push_back(encode_stream_segment(flags, data));
        true
    }

    fn push_staging(&mut self) -> bool {
        if self.staging.is_empty() {
            return true;
        }
        let flags = self.staging_flags;
        let staging = std::mem::take(&mut self.staging);
        if self.push_segment(flags, &staging) {
            self.staging_flags = 0;
            true
        } else {
            self.staging = staging;
            false
        }
    }

    fn write(&mut self, data: &[u8]) -> usize {
        if self.closing || self.aborted {
            return 0;
        }
        if self.push_pending && !self.service() {
            self.vacancy_wanted = true;
            return 0;
        }

        let mut written = 0;
        while written < data.len() {
            let must_push = self.staging.len() == self.payload_capacity
                || (self.msg_start && !self.staging.is_empty());
            if must_push && !self.push_staging() {
                break;
            }

            if self.staging.is_empty() && self.msg_start {
                self.staging_flags |= STREAM_FLAG_MSG_START;
                self.msg_start = false;
            }

            let n = (self.payload_capacity - self.staging.len()).min(data.len() - written);
            self.staging.extend_from_slice(&data[written..written + n]);
            written += n;
        }

        if written < data.len() {
            self.vacancy_wanted = true;
        } else if self.auto_flush != FlushMode::None {
            self.flush(false, self.auto_flush);
        }
        written
    }

    fn flush(&mut self, eom: bool, mode: FlushMode) {
        if eom {
            self.msg_start = true;
        }
        match mode {
            FlushMode::None => {}
            FlushMode::Passive | FlushMode::Active => {
                if !self.push_staging() {
                    self.push_pending = true;
                }
                if mode == FlushMode::Active {
                    self.active_flush = true;
                }
            }
        }
    }

    /// 밀린 push / 종료 세그먼트 처리
    pub(crate) fn service(&mut self) -> bool {
        if self.push_pending {
            if !self.push_staging() {
                return false;
            }
            self.push_pending = false;
        }
        if self.closing && !self.end_pushed {
            if !self.push_staging() {
                return false;
            }
            if !self.push_segment(STREAM_FLAG_STREAM_END, &[]) {
                return false;
            }
            self.end_pushed = true;
        }
        true
    }

    fn has_vacancy(&self) -> bool {
        self.segments.len() < self.capacity || self.evictable()
    }

    /// 첫 인덱스
    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    /// 다음에 만들어질 세그먼트 인덱스
    pub(crate) fn end(&self) -> u64 {
        self.base + self.segments.len() as u64
    }

    pub(crate) fn segment(&self, index: u64) -> Option<&[u8]> {
        if index < self.base {
            return None;
        }
        self.segments
            .get((index - self.base) as usize)
            .map(Vec::as_slice)
    }

    pub(crate) fn set_tx_index(&mut self, index: u64) {
        self.tx_index = index;
    }

    pub(crate) fn set_repair_floor(&mut self, floor: u64) {
        self.repair_floor = floor;
    }

    pub(crate) fn take_active_flush(&mut self) -> bool {
        std::mem::take(&mut self.active_flush)
    }

    /// 공간이 생겼고 애플리케이션이 기다리는 중이면 true (한 번만)
    pub(crate) fn take_vacancy(&mut self) -> bool {
        if self.vacancy_wanted && self.has_vacancy() {
            self.vacancy_wanted = false;
            return true;
        }
        false
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// 종료 세그먼트까지 모두 버퍼에 들어감
    pub(crate) fn is_finished(&self) -> bool {
        self.end_pushed
    }
}

/// 수신 스트림 버퍼
#[derive(Debug)]
pub(crate) struct StreamRx {
    capacity: usize,
    segments: BTreeMap<u64, Vec<u8>>,
    synced: bool,
    read_index: u64,
    read_pos: usize,
    offset: u64,
    /// 연속 수신된 다음 인덱스
    frontier: u64,
    end_index: Option<u64>,
    broken: bool,
}

impl StreamRx {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            segments: BTreeMap::new(),
            synced: false,
            read_index: 0,
            read_pos: 0,
            offset: 0,
            frontier: 0,
            end_index: None,
            broken: false,
        }
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.synced
    }

    pub(crate) fn sync(&mut self, index: u64) {
        self.synced = true;
        self.read_index = index;
        self.frontier = index;
    }

    /// 세그먼트 삽입. 새로 읽을 수 있는 데이터가 생기면 true
    pub(crate) fn insert(&mut self, index: u64, segment: &[u8]) -> bool {
        if !self.synced {
            self.sync(index);
        }
        if index < self.frontier || self.segments.contains_key(&index) {
            return false;
        }
        if let Some((flags, _)) = decode_stream_segment(segment) {
            if flags & STREAM_FLAG_STREAM_END != 0 {
                self.end_index = Some(index);
            }
        }
        self.segments.insert(index, segment.to_vec());

        // 창을 벗어나면 가장 오래된 누락 구간을 포기
        if index >= self.read_index + self.capacity as u64 {
            let new_start = index + 1 - self.capacity as u64;
            self.skip_to(new_start);
        }

        let before = self.frontier;
        while self.segments.contains_key(&self.frontier) {
            self.frontier += 1;
        }
        self.frontier > before
    }

    /// `index` 이전 데이터는 복구 불가: 건너뛰고 gap 표시
    pub(crate) fn skip_to(&mut self, index: u64) {
        if index <= self.read_index {
            return;
        }
        let lost = (self.read_index..index).any(|i| !self.segments.contains_key(&i));
        if !lost {
            return;
        }
        self.segments = self.segments.split_off(&index);
        self.read_index = index;
        self.read_pos = 0;
        self.frontier = self.frontier.max(index);
        while self.segments.contains_key(&self.frontier) {
            self.frontier += 1;
        }
        self.broken = true;
    }

    pub(crate) fn frontier(&self) -> u64 {
        self.frontier
    }

    pub(crate) fn has_segment(&self, index: u64) -> bool {
        index < self.read_index || self.segments.contains_key(&index)
    }

    pub(crate) fn is_ended(&self) -> bool {
        matches!(self.end_index, Some(end) if self.frontier > end)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.broken {
            self.broken = false;
            return Err(Error::StreamBroken);
        }

        let mut n = 0;
        while n < buf.len() {
            let Some(seg) = self.segments.get(&self.read_index) else {
                break;
            };
            let data = decode_stream_segment(seg).map(|(_, d)| d).unwrap_or(&[]);
            let avail = &data[self.read_pos.min(data.len())..];
            let take = avail.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&avail[..take]);
            n += take;
            self.read_pos += take;

            if self.read_pos >= data.len() {
                self.segments.remove(&self.read_index);
                self.read_index += 1;
                self.read_pos = 0;
            }
        }
        self.offset += n as u64;
        Ok(n)
    }

    fn seek_msg_start(&mut self) -> bool {
        let from = if self.read_pos > 0 {
            self.read_index + 1
        } else {
            self.read_index
        };
        let found = self.segments.range(from..).find_map(|(&index, seg)| {
            decode_stream_segment(seg)
                .filter(|(flags, _)| flags & STREAM_FLAG_MSG_START != 0)
                .map(|_| index)
        });

        match found {
            Some(index) => {
                self.segments = self.segments.split_off(&index);
                self.read_index = index;
                self.read_pos = 0;
                self.frontier = self.frontier.max(index);
                while self.segments.contains_key(&self.frontier) {
                    self.frontier += 1;
                }
                true
            }
            None => false,
        }
    }
}

/// 객체 내용
#[derive(Debug)]
pub(crate) enum Content {
    /// 송신 DATA 또는 수신 완료 DATA
    Buffer(Bytes),
    /// 수신 중 DATA
    Assembling(Vec<u8>),
    /// 송신 FILE (전송용으로 메모리에 적재)
    TxFile { path: PathBuf, data: Bytes },
    /// 수신 FILE (완료 전에는 임시 파일)
    RxFile {
        temp: Option<NamedTempFile>,
        path: Option<PathBuf>,
    },
    TxStream(StreamTx),
    RxStream(StreamRx),
    /// 중단 / 해제로 내용 폐기
    Released,
}

/// 객체 내부 상태
#[derive(Debug)]
pub(crate) struct ObjectInner {
    pub(crate) id: ObjectId,
    pub(crate) object_type: ObjectType,
    pub(crate) session: SessionId,
    /// 수신 객체의 원격 송신자
    pub(crate) sender: Option<NodeId>,
    pub(crate) size: u64,
    pub(crate) bytes_pending: u64,
    pub(crate) info: Option<Bytes>,
    pub(crate) state: ObjectState,
    pub(crate) canceled: bool,
    pub(crate) content: Content,
}

/// 공유 객체 핸들
#[derive(Clone)]
pub struct Object {
    inner: Arc<Mutex<ObjectInner>>,
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Object {}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Object")
            .field("id", &inner.id)
            .field("type", &inner.object_type)
            .field("session", &inner.session)
            .field("sender", &inner.sender)
            .field("size", &inner.size)
            .field("bytes_pending", &inner.bytes_pending)
            .field("state", &inner.state)
            .finish()
    }
}

impl Object {
    fn from_inner(inner: ObjectInner) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub(crate) fn new_tx(
        id: ObjectId,
        session: SessionId,
        object_type: ObjectType,
        size: u64,
        info: Option<Bytes>,
        content: Content,
    ) -> Self {
        Self::from_inner(ObjectInner {
            id,
            object_type,
            session,
            sender: None,
            size,
            bytes_pending: size,
            info,
            state: ObjectState::Active,
            canceled: false,
            content,
        })
    }

    /// 수신 객체 생성 (FILE은 캐시 디렉토리에 임시 파일 생성)
    pub(crate) fn new_rx(
        id: ObjectId,
        session: SessionId,
        sender: NodeId,
        object_type: ObjectType,
        size: u64,
        stream_capacity: usize,
        cache_dir: &Path,
    ) -> Result<Self> {
        let content = match object_type {
            ObjectType::Data => Content::Assembling(vec![0u8; size as usize]),
            ObjectType::File => {
                let temp = tempfile::Builder::new()
                    .prefix(TEMP_FILE_PREFIX)
                    .tempfile_in(cache_dir)?;
                temp.as_file().set_len(size)?;
                debug!("수신 임시 파일 생성: {}", temp.path().display());
                Content::RxFile {
                    temp: Some(temp),
                    path: None,
                }
            }
            ObjectType::Stream => Content::RxStream(StreamRx::new(stream_capacity)),
        };

        Ok(Self::from_inner(ObjectInner {
            id,
            object_type,
            session,
            sender: Some(sender),
            size,
            bytes_pending: size,
            info: None,
            state: ObjectState::Active,
            canceled: false,
            content,
        }))
    }

    /// 수용하지 못한 수신 객체 (이벤트 전달용, 내용 없음)
    pub(crate) fn new_rx_rejected(
        id: ObjectId,
        session: SessionId,
        sender: NodeId,
        object_type: ObjectType,
        size: u64,
    ) -> Self {
        Self::from_inner(ObjectInner {
            id,
            object_type,
            session,
            sender: Some(sender),
            size,
            bytes_pending: size,
            info: None,
            state: ObjectState::Aborted,
            canceled: false,
            content: Content::Released,
        })
    }

    /// 전송 ID
    pub fn id(&self) -> ObjectId {
        self.inner.lock().id
    }

    pub fn object_type(&self) -> ObjectType {
        self.inner.lock().object_type
    }

    pub fn session(&self) -> SessionId {
        self.inner.lock().session
    }

    /// 원격 송신자 (수신 객체만)
    pub fn sender(&self) -> Option<NodeId> {
        self.inner.lock().sender
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// 남은 바이트 (송신: 첫 전송 전, 수신: 아직 받지 못한)
    pub fn bytes_pending(&self) -> u64 {
        self.inner.lock().bytes_pending
    }

    pub fn state(&self) -> ObjectState {
        self.inner.lock().state
    }

    pub fn has_info(&self) -> bool {
        self.inner.lock().info.is_some()
    }

    /// 애플리케이션 info (파일 전송에서는 파일 이름)
    pub fn info(&self) -> Result<Bytes> {
        self.inner.lock().info.clone().ok_or(Error::NoObjectInfo)
    }

    /// DATA 객체 내용
    pub fn data(&self) -> Result<Bytes> {
        let inner = self.inner.lock();
        match &inner.content {
            Content::Buffer(data) => Ok(data.clone()),
            Content::Assembling(_) | Content::Released => Err(Error::ObjectNotReady),
            _ => Err(Error::WrongObjectType {
                expected: ObjectType::Data,
                got: inner.object_type,
            }),
        }
    }

    /// FILE 객체 경로 (수신 객체는 완료 후)
    pub fn file_path(&self) -> Result<PathBuf> {
        let inner = self.inner.lock();
        match &inner.content {
            Content::TxFile { path, .. } => Ok(path.clone()),
            Content::RxFile { path: Some(path), .. } => Ok(path.clone()),
            Content::RxFile { temp: Some(temp), .. } => Ok(temp.path().to_path_buf()),
            Content::RxFile { .. } | Content::Released => Err(Error::ObjectNotReady),
            _ => Err(Error::WrongObjectType {
                expected: ObjectType::File,
                got: inner.object_type,
            }),
        }
    }

    /// 수신 완료된 파일을 최종 경로로 이동
    pub fn rename_file(&self, dest: impl AsRef<Path>) -> Result<()> {
        let dest = dest.as_ref();
        let mut inner = self.inner.lock();
        let object_type = inner.object_type;
        match &mut inner.content {
            Content::RxFile { path: Some(path), .. } | Content::TxFile { path, .. } => {
                std::fs::rename(&*path, dest)?;
                *path = dest.to_path_buf();
                Ok(())
            }
            Content::RxFile { .. } | Content::Released => Err(Error::ObjectNotReady),
            _ => Err(Error::WrongObjectType {
                expected: ObjectType::File,
                got: object_type,
            }),
        }
    }

    /// 취소 (즉시, 종료 상태, 멱등)
    ///
    /// 수신 객체는 부분 데이터가 폐기되고 이후 COMPLETED 이벤트가 발생하지 않는다.
    /// 엔진은 다음 처리 시점에 상태를 정리한다.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.canceled {
            return;
        }
        inner.canceled = true;
        if inner.state == ObjectState::Active && inner.sender.is_some() {
            inner.state = ObjectState::Aborted;
            inner.content = Content::Released;
        }
        debug!("객체 {} 취소", inner.id);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.lock().canceled
    }

    fn with_tx_stream<R>(&self, f: impl FnOnce(&mut StreamTx) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let object_type = inner.object_type;
        match &mut inner.content {
            Content::TxStream(stream) => Ok(f(stream)),
            _ if object_type == ObjectType::Stream => Err(Error::StreamClosed),
            _ => Err(Error::WrongObjectType {
                expected: ObjectType::Stream,
                got: object_type,
            }),
        }
    }

    fn with_rx_stream<R>(&self, f: impl FnOnce(&mut StreamRx) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let object_type = inner.object_type;
        match &mut inner.content {
            Content::RxStream(stream) => Ok(f(stream)),
            _ if object_type == ObjectType::Stream => Err(Error::StreamClosed),
            _ => Err(Error::WrongObjectType {
                expected: ObjectType::Stream,
                got: object_type,
            }),
        }
    }

    /// 스트림 쓰기. 버퍼가 받아들인 바이트 수 반환
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.with_tx_stream(|s| {
            if s.closing {
                return Err(Error::StreamClosed);
            }
            Ok(s.write(data))
        })?
    }

    /// 스트림 flush (`eom`이면 다음 쓰기가 새 메시지로 시작)
    pub fn flush(&self, eom: bool, mode: FlushMode) -> Result<()> {
        self.with_tx_stream(|s| s.flush(eom, mode))
    }

    /// 매 write 후 자동 flush 모드
    pub fn set_auto_flush(&self, mode: FlushMode) -> Result<()> {
        self.with_tx_stream(|s| s.auto_flush = mode)
    }

    /// 메시지 끝 표시
    pub fn mark_eom(&self) -> Result<()> {
        self.with_tx_stream(|s| s.msg_start = true)
    }

    /// 쓰기 공간 여부
    pub fn has_vacancy(&self) -> Result<bool> {
        self.with_tx_stream(|s| s.has_vacancy())
    }

    /// 스트림 닫기
    ///
    /// `graceful`이면 남은 데이터와 종료 표시를 전송한 뒤 닫고, 아니면 즉시 중단한다.
    pub fn close(&self, graceful: bool) -> Result<()> {
        self.with_tx_stream(|s| {
            if graceful {
                s.closing = true;
                s.service();
            } else {
                s.closing = true;
                s.aborted = true;
            }
        })
    }

    /// 스트림 읽기 (gap이 있으면 한 번 `StreamBroken`)
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.with_rx_stream(|s| s.read(buf))??;
        if n > 0 {
            let mut inner = self.inner.lock();
            inner.bytes_pending = inner.bytes_pending.saturating_sub(n as u64);
        }
        Ok(n)
    }

    /// 다음 메시지 시작으로 이동
    pub fn seek_msg_start(&self) -> Result<bool> {
        self.with_rx_stream(|s| s.seek_msg_start())
    }

    /// 지금까지 읽은 바이트 수
    pub fn read_offset(&self) -> Result<u64> {
        self.with_rx_stream(|s| s.offset)
    }

    /// 수신 데이터를 객체 오프셋에 기록
    pub(crate) fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.content {
            Content::Assembling(buf) => {
                let start = offset as usize;
                let end = (start + data.len()).min(buf.len());
                if start < end {
                    buf[start..end].copy_from_slice(&data[..end - start]);
                }
                Ok(())
            }
            Content::RxFile { temp: Some(temp), .. } => {
                let file = temp.as_file_mut();
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
                Ok(())
            }
            _ => Err(Error::ObjectNotReady),
        }
    }

    /// 수신 완료 처리 (임시 파일은 유지)
    pub(crate) fn complete_rx(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let content = std::mem::replace(&mut inner.content, Content::Released);
        inner.content = match content {
            Content::Assembling(buf) => Content::Buffer(Bytes::from(buf)),
            Content::RxFile {
                temp: Some(temp), ..
            } => {
                temp.as_file().sync_all()?;
                let (_, path) = temp.keep().map_err(|e| Error::Io(e.error))?;
                Content::RxFile {
                    temp: None,
                    path: Some(path),
                }
            }
            other => other,
        };
        inner.bytes_pending = 0;
        inner.state = ObjectState::Completed;
        Ok(())
    }

    /// 수신 중단 (부분 데이터 폐기)
    pub(crate) fn abort_rx(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ObjectState::Active {
            inner.state = ObjectState::Aborted;
        }
        if !matches!(inner.content, Content::RxStream(_)) {
            inner.content = Content::Released;
        }
    }

    /// 송신 캐시에서 해제
    pub(crate) fn purge_tx(&self) {
        let mut inner = self.inner.lock();
        inner.state = ObjectState::Purged;
        if let Content::TxStream(stream) = &mut inner.content {
            stream.aborted = true;
        }
    }

    pub(crate) fn set_info(&self, info: Bytes) {
        self.inner.lock().info = Some(info);
    }

    pub(crate) fn set_bytes_pending(&self, pending: u64) {
        self.inner.lock().bytes_pending = pending;
    }

    pub(crate) fn set_state(&self, state: ObjectState) {
        self.inner.lock().state = state;
    }

    /// 송신 DATA/FILE 페이로드
    pub(crate) fn tx_payload(&self) -> Option<Bytes> {
        match &self.inner.lock().content {
            Content::Buffer(data) | Content::TxFile { data, .. } => Some(data.clone()),
            _ => None,
        }
    }

    /// 송신 스트림 버퍼 접근 (엔진 내부)
    pub(crate) fn tx_stream<R>(&self, f: impl FnOnce(&mut StreamTx) -> R) -> Option<R> {
        match &mut self.inner.lock().content {
            Content::TxStream(stream) => Some(f(stream)),
            _ => None,
        }
    }

    /// 수신 스트림 버퍼 접근 (엔진 내부)
    pub(crate) fn rx_stream<R>(&self, f: impl FnOnce(&mut StreamRx) -> R) -> Option<R> {
        match &mut self.inner.lock().content {
            Content::RxStream(stream) => Some(f(stream)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_stream(capacity: usize, payload: usize) -> Object {
        Object::new_tx(
            0,
            1,
            ObjectType::Stream,
            (capacity * payload) as u64,
            None,
            Content::TxStream(StreamTx::new(capacity, payload)),
        )
    }

    fn rx_stream(capacity: usize) -> Object {
        let dir = std::env::temp_dir();
        Object::new_rx(0, 1, 7, ObjectType::Stream, 0, capacity, &dir).unwrap()
    }

    #[test]
    fn test_data_accessors() {
        let obj = Object::new_tx(
            3,
            1,
            ObjectType::Data,
            5,
            None,
            Content::Buffer(Bytes::from_static(b"hello")),
        );
        assert_eq!(obj.id(), 3);
        assert_eq!(obj.data().unwrap(), Bytes::from_static(b"hello"));
        assert!(matches!(obj.info(), Err(Error::NoObjectInfo)));
        assert!(matches!(
            obj.file_path(),
            Err(Error::WrongObjectType { .. })
        ));
        assert!(matches!(obj.write(b"x"), Err(Error::WrongObjectType { .. })));

        let clone = obj.clone();
        assert_eq!(obj, clone);
    }

    #[test]
    fn test_rx_data_not_ready_until_complete() {
        let dir = std::env::temp_dir();
        let obj = Object::new_rx(1, 1, 7, ObjectType::Data, 4, 0, &dir).unwrap();
        assert!(matches!(obj.data(), Err(Error::ObjectNotReady)));

        obj.write_at(0, &[1, 2]).unwrap();
        obj.write_at(2, &[3, 4, 5]).unwrap();
        obj.complete_rx().unwrap();
        assert_eq!(obj.data().unwrap().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(obj.bytes_pending(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let dir = std::env::temp_dir();
        let obj = Object::new_rx(1, 1, 7, ObjectType::Data, 4, 0, &dir).unwrap();
        obj.cancel();
        obj.cancel();
        assert!(obj.is_canceled());
        assert_eq!(obj.state(), ObjectState::Aborted);
        assert!(matches!(obj.data(), Err(Error::ObjectNotReady)));
    }

    #[test]
    fn test_rx_file_rename() {
        let dir = tempfile::tempdir().unwrap();
        let obj = Object::new_rx(1, 1, 7, ObjectType::File, 6, 0, dir.path()).unwrap();
        let temp_path = obj.file_path().unwrap();
        assert!(temp_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(TEMP_FILE_PREFIX));

        obj.write_at(0, b"abc").unwrap();
        obj.write_at(3, b"def").unwrap();
        obj.complete_rx().unwrap();

        let dest = dir.path().join("final.bin");
        obj.rename_file(&dest).unwrap();
        assert_eq!(obj.file_path().unwrap(), dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
        assert!(!temp_path.exists());
    }

    #[test]
    fn test_stream_write_respects_capacity() {
        let obj = tx_stream(2, 4);
        // 2 세그먼트 + staging 4 바이트까지 수용
        assert_eq!(obj.write(b"0123456789abcdef").unwrap(), 12);
        assert!(!obj.has_vacancy().unwrap());

        obj.tx_stream(|s| {
            assert_eq!(s.end(), 2);
            assert!(!s.take_vacancy());
            // 첫 세그먼트 전송 완료 → 교체 가능
            s.set_tx_index(1);
            assert!(s.take_vacancy());
        });
        assert_eq!(obj.write(b"cdef").unwrap(), 4);
    }

    #[test]
    fn test_stream_message_boundaries() {
        let obj = tx_stream(8, 16);
        obj.write(b"abc").unwrap();
        obj.flush(true, FlushMode::Passive).unwrap();
        obj.write(b"de").unwrap();
        obj.flush(false, FlushMode::Active).unwrap();

        let segments: Vec<Vec<u8>> = obj
            .tx_stream(|s| {
                assert!(s.take_active_flush());
                (s.base()..s.end())
                    .filter_map(|i| s.segment(i).map(<[u8]>::to_vec))
                    .collect()
            })
            .unwrap();
        assert_eq!(segments.len(), 2);
        let (flags, data) = decode_stream_segment(&segments[1]).unwrap();
        assert_eq!(flags & STREAM_FLAG_MSG_START, STREAM_FLAG_MSG_START);
        assert_eq!(data, b"de");
    }

    #[test]
    fn test_stream_close_pushes_end_marker() {
        let obj = tx_stream(4, 16);
        obj.write(b"tail").unwrap();
        obj.close(true).unwrap();
        assert!(matches!(obj.write(b"more"), Err(Error::StreamClosed)));
        let finished = obj.tx_stream(|s| (s.is_finished(), s.end())).unwrap();
        assert_eq!(finished, (true, 2));
    }

    #[test]
    fn test_rx_stream_reads_in_order() {
        let obj = rx_stream(16);
        obj.rx_stream(|s| {
            s.sync(0);
            assert!(!s.insert(1, &encode_stream_segment(0, b"world")));
            assert!(s.insert(0, &encode_stream_segment(STREAM_FLAG_MSG_START, b"hello ")));
            assert_eq!(s.frontier(), 2);
        });

        let mut buf = [0u8; 32];
        let n = obj.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(obj.read_offset().unwrap(), 11);
    }

    #[test]
    fn test_rx_stream_gap_reports_broken_once() {
        let obj = rx_stream(16);
        obj.rx_stream(|s| {
            s.sync(0);
            s.insert(2, &encode_stream_segment(STREAM_FLAG_MSG_START, b"xy"));
            s.skip_to(2);
        });

        let mut buf = [0u8; 8];
        assert!(matches!(obj.read(&mut buf), Err(Error::StreamBroken)));
        assert_eq!(obj.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"xy");
    }

    #[test]
    fn test_rx_stream_seek_msg_start() {
        let obj = rx_stream(16);
        obj.rx_stream(|s| {
            s.sync(0);
            s.insert(0, &encode_stream_segment(0, b"partial"));
            s.insert(1, &encode_stream_segment(STREAM_FLAG_MSG_START, b"msg"));
        });
        assert!(obj.seek_msg_start().unwrap());

        let mut buf = [0u8; 8];
        let n = obj.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"msg");
        assert!(!obj.seek_msg_start().unwrap());
    }
}
