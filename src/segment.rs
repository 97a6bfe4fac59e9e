//! 세그먼트 / 블록 구조
//!
//! - Segment: UDP 패킷 하나에 실리는 고정 크기 데이터 조각
//! - Block: `block_size`개 소스 세그먼트 + `num_parity`개 패리티 세그먼트
//!
//! 마지막 블록은 소스 세그먼트 수가 적고(짧은 블록), 마지막 세그먼트는 실제
//! 길이로 전송되며 FEC 계산 시에만 0으로 패딩한다.

use serde::{Deserialize, Serialize};

use crate::fec::{RsCodec, MAX_SYMBOLS};
use crate::{Error, Result};

/// 블록 ID (객체 내 인덱스)
pub type BlockId = u32;

/// 심볼 ID (블록 내 인덱스, 소스 `0..k`, 패리티 `k..k+p`)
pub type SymbolId = u16;

/// 스트림 세그먼트 프레이밍 헤더: len(u16 LE) + flags(u8)
pub const STREAM_HEADER_LEN: usize = 3;

/// 이 세그먼트에서 새 메시지가 시작됨
pub const STREAM_FLAG_MSG_START: u8 = 0x01;

/// 스트림 종료 (close)
pub const STREAM_FLAG_STREAM_END: u8 = 0x04;

/// FEC 객체 전송 정보 (모든 DATA / INFO 메시지에 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecObjectInfo {
    /// 객체 크기 (스트림은 송신 버퍼 크기)
    pub object_size: u64,

    /// 세그먼트 크기 (바이트)
    pub segment_size: u16,

    /// 블록당 소스 세그먼트 수
    pub block_size: u16,

    /// 블록당 패리티 세그먼트 수
    pub num_parity: u16,
}

impl FecObjectInfo {
    pub fn new(object_size: u64, segment_size: u16, block_size: u16, num_parity: u16) -> Self {
        Self {
            object_size,
            segment_size,
            block_size,
            num_parity,
        }
    }

    /// 수신한 전송 정보 검증 (세그먼트 / 블록 계산 전에 호출)
    pub fn validate(&self) -> Result<()> {
        if (self.segment_size as usize) <= STREAM_HEADER_LEN {
            return Err(Error::InvalidFecInfo(format!("segment_size {}", self.segment_size)));
        }
        if self.block_size == 0 {
            return Err(Error::InvalidFecInfo("block_size 0".into()));
        }
        if self.block_size as usize + self.num_parity as usize > MAX_SYMBOLS {
            return Err(Error::InvalidFecInfo(format!(
                "block_size {} + num_parity {} > {}",
                self.block_size, self.num_parity, MAX_SYMBOLS
            )));
        }
        let blocks = self.num_segments().div_ceil(self.block_size as u64);
        if blocks > BlockId::MAX as u64 {
            return Err(Error::InvalidFecInfo(format!("object_size {}", self.object_size)));
        }
        Ok(())
    }

    /// 총 소스 세그먼트 수 (빈 객체도 빈 세그먼트 1개)
    pub fn num_segments(&self) -> u64 {
        self.object_size.div_ceil(self.segment_size as u64).max(1)
    }

    /// 총 블록 수
    pub fn num_blocks(&self) -> u32 {
        self.num_segments().div_ceil(self.block_size as u64) as BlockId
    }

    /// 블록의 소스 세그먼트 수 (마지막 블록은 짧을 수 있음)
    pub fn block_len(&self, block: BlockId) -> u16 {
        let bs = self.block_size as u64;
        let first = block as u64 * bs;
        let remaining = self.num_segments().saturating_sub(first);
        remaining.min(bs) as u16
    }

    /// 세그먼트 시작 오프셋
    pub fn segment_offset(&self, block: BlockId, symbol: SymbolId) -> u64 {
        (block as u64 * self.block_size as u64 + symbol as u64) * self.segment_size as u64
    }

    /// 소스 세그먼트의 실제 바이트 수
    pub fn segment_len(&self, block: BlockId, symbol: SymbolId) -> usize {
        let offset = self.segment_offset(block, symbol);
        self.object_size
            .saturating_sub(offset)
            .min(self.segment_size as u64) as usize
    }

    /// 블록 시작 오프셋
    pub fn block_offset(&self, block: BlockId) -> u64 {
        self.segment_offset(block, 0)
    }

    /// 블록의 실제 바이트 수
    pub fn block_bytes(&self, block: BlockId) -> u64 {
        let offset = self.block_offset(block);
        let span = self.block_len(block) as u64 * self.segment_size as u64;
        self.object_size.saturating_sub(offset).min(span)
    }

    /// 심볼이 패리티인지
    pub fn is_parity(&self, block: BlockId, symbol: SymbolId) -> bool {
        symbol >= self.block_len(block)
    }

    /// 스트림 세그먼트 인덱스 → (블록, 심볼)
    pub fn stream_position(&self, index: u64) -> (BlockId, SymbolId) {
        let bs = self.block_size as u64;
        ((index / bs) as BlockId, (index % bs) as SymbolId)
    }

    /// (블록, 심볼) → 스트림 세그먼트 인덱스
    pub fn stream_index(&self, block: BlockId, symbol: SymbolId) -> u64 {
        block as u64 * self.block_size as u64 + symbol as u64
    }

    /// 세그먼트 하나에 담을 수 있는 스트림 데이터 바이트 수
    pub fn stream_payload_capacity(&self) -> usize {
        self.segment_size as usize - STREAM_HEADER_LEN
    }
}

/// 수신 블록 (소스 + 패리티 조립)
#[derive(Debug)]
pub struct RxBlock {
    /// 블록의 소스 심볼 수
    block_len: u16,

    /// 패리티 심볼 수
    num_parity: u16,

    /// 세그먼트 크기 (FEC 패딩 기준)
    segment_size: usize,

    /// 수신된 심볼 (`block_len + num_parity` 슬롯)
    symbols: Vec<Option<Vec<u8>>>,

    /// 수신된 심볼 수
    received: u16,
}

impl RxBlock {
    pub fn new(block_len: u16, num_parity: u16, segment_size: usize) -> Self {
        Self {
            block_len,
            num_parity,
            segment_size,
            symbols: vec![None; (block_len + num_parity) as usize],
            received: 0,
        }
    }

    /// 심볼 삽입 (중복 / 범위 밖이면 false)
    pub fn insert(&mut self, symbol: SymbolId, payload: &[u8]) -> bool {
        let slot = match self.symbols.get_mut(symbol as usize) {
            Some(slot) if slot.is_none() => slot,
            _ => return false,
        };

        let mut data = vec![0u8; self.segment_size];
        let len = payload.len().min(self.segment_size);
        data[..len].copy_from_slice(&payload[..len]);
        *slot = Some(data);
        self.received += 1;
        true
    }

    pub fn block_len(&self) -> u16 {
        self.block_len
    }

    pub fn received(&self) -> u16 {
        self.received
    }

    pub fn has_symbol(&self, symbol: SymbolId) -> bool {
        matches!(self.symbols.get(symbol as usize), Some(Some(_)))
    }

    /// 복구에 더 필요한 심볼 수
    pub fn erasures(&self) -> u16 {
        self.block_len.saturating_sub(self.received)
    }

    /// 복구 가능 여부
    pub fn is_decodable(&self) -> bool {
        self.received >= self.block_len
    }

    /// 누락된 소스 심볼 ID 목록
    pub fn missing_source(&self) -> Vec<SymbolId> {
        self.symbols[..self.block_len as usize]
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(id, _)| id as SymbolId)
            .collect()
    }

    /// 블록 복구 후 소스 심볼 반환 (세그먼트 크기로 패딩된 상태)
    pub fn decode(mut self, codec: &RsCodec) -> Result<Vec<Vec<u8>>> {
        if !self.is_decodable() {
            return Err(Error::InsufficientSymbols {
                available: self.received as usize,
                required: self.block_len as usize,
            });
        }
        if self.missing_source().is_empty() {
            self.symbols.truncate(self.block_len as usize);
        } else {
            codec.reconstruct(&mut self.symbols)?;
        }

        self.symbols
            .into_iter()
            .take(self.block_len as usize)
            .map(|s| {
                s.ok_or(Error::InsufficientSymbols {
                    available: 0,
                    required: 1,
                })
            })
            .collect()
    }

    pub fn num_parity(&self) -> u16 {
        self.num_parity
    }
}

/// 스트림 세그먼트 인코딩: [len u16][flags u8][data]
pub fn encode_stream_segment(flags: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STREAM_HEADER_LEN + data.len());
    buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
    buf.push(flags);
    buf.extend_from_slice(data);
    buf
}

/// 스트림 세그먼트 디코딩
pub fn decode_stream_segment(bytes: &[u8]) -> Option<(u8, &[u8])> {
    if bytes.len() < STREAM_HEADER_LEN {
        return None;
    }
    let len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    let flags = bytes[2];
    let data = bytes.get(STREAM_HEADER_LEN..STREAM_HEADER_LEN + len)?;
    Some((flags, data))
}
