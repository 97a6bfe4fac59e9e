//! 프로토콜 메시지 정의
//!
//! 모든 메시지는 같은 프레이밍을 쓴다.
//!
//! ```text
//! [header_len: u16 LE][bincode(MessageHeader)][payload]
//! ```
//!
//! payload는 메시지 종류에 따라 세그먼트 데이터(DATA), info(INFO),
//! 애플리케이션 명령(CMD), 워터마크 확장 데이터(CMD FLUSH), ACK 데이터(ACK)다.
//! 송신자 메시지(INFO / DATA / CMD)와 수신자 메시지(NACK / ACK)로 나뉜다.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::object::{ObjectId, ObjectType};
use crate::segment::{BlockId, FecObjectInfo, SymbolId};
use crate::{Error, NodeId, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// DATA 플래그: 복구 전송
pub const DATA_FLAG_REPAIR: u8 = 0x01;

/// DATA 플래그: 객체에 info가 있음
pub const DATA_FLAG_INFO: u8 = 0x02;

/// CC 피드백 플래그: 현재 제한 수신자 (CLR)
pub const CC_FLAG_CLR: u8 = 0x01;

/// CC 피드백 플래그: RTT가 실측값
pub const CC_FLAG_RTT: u8 = 0x04;

/// CC 피드백 플래그: 슬로우 스타트 중 (손실 미관측)
pub const CC_FLAG_START: u8 = 0x08;

/// 송신자 메시지 공통 필드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderFields {
    /// 송신자 인스턴스 ID
    pub instance_id: u16,

    /// 메시지 시퀀스 (수신자 손실 추정용)
    pub sequence: u32,

    /// 양자화된 GRTT
    pub grtt: u8,

    /// 백오프 계수
    pub backoff: u8,

    /// 양자화된 그룹 크기
    pub gsize: u8,
}

/// GRTT 응답 (프로브 타임스탬프 에코)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrttResponse {
    /// 송신자가 프로브에 넣은 시간 (송신자 기준 마이크로초)
    pub send_time_us: u64,

    /// 수신자가 프로브를 받고 응답하기까지 지연 (마이크로초)
    pub hold_us: u32,
}

/// 혼잡 제어 피드백
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CcFeedback {
    pub flags: u8,

    /// 응답 대상 CC 프로브 시퀀스
    pub cc_sequence: u16,

    /// 양자화된 손실 이벤트 비율
    pub loss: u16,

    /// 양자화된 ECN 마킹 비율
    pub ecn: u16,

    /// 수신자가 측정한 수신 속도 (bytes/sec)
    pub rate: f32,

    /// 양자화된 RTT (수신자가 알고 있는 값)
    pub rtt: u8,
}

/// 수신자 메시지 공통 필드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverFields {
    /// 대상 송신자
    pub sender_id: NodeId,

    /// 대상 송신자 인스턴스
    pub instance_id: u16,

    /// 가장 최근 프로브에 대한 응답
    pub grtt_response: Option<GrttResponse>,

    /// 혼잡 제어 피드백
    pub cc: Option<CcFeedback>,
}

/// INFO 메시지 헤더 (payload = info)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoHeader {
    pub sender: SenderFields,
    pub object: ObjectId,
    pub object_type: ObjectType,
    pub fec: FecObjectInfo,
}

/// DATA 메시지 헤더 (payload = 세그먼트)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataHeader {
    pub sender: SenderFields,
    pub object: ObjectId,
    pub object_type: ObjectType,
    pub fec: FecObjectInfo,
    pub block: BlockId,
    pub symbol: SymbolId,
    pub flags: u8,

    /// payload CRC32
    pub crc32: u32,
}

/// 워터마크 ACK 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRequest {
    /// 아직 ACK하지 않은 노드
    pub acking_nodes: Vec<NodeId>,

    /// payload에 애플리케이션 데이터 포함 (RX_ACK_REQUEST)
    pub with_payload: bool,
}

/// 송신자 명령
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// 전송 위치 알림 (+ 워터마크 ACK 요청)
    Flush {
        object: ObjectId,
        block: BlockId,
        symbol: SymbolId,
        watermark: Option<WatermarkRequest>,
    },

    /// 더 이상 복구할 수 없는 객체 알림
    Squelch {
        /// 캐시의 가장 오래된 위치
        object: ObjectId,
        block: BlockId,
        symbol: SymbolId,
        /// 복구 불가 객체
        invalid: Vec<ObjectId>,
    },

    /// 혼잡 제어 / GRTT 프로브
    Cc {
        cc_sequence: u16,
        send_time_us: u64,
        /// 현재 송신 속도 (bytes/sec)
        rate: f32,
        /// 현재 제한 수신자
        clr: Option<NodeId>,
        /// 명시적 응답 요청 (active 프로빙 / 혼잡 제어)
        respond: bool,
    },

    /// 애플리케이션 정의 명령 (payload = 명령 데이터)
    Application { id: u16 },
}

/// CMD 메시지 헤더
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdHeader {
    pub sender: SenderFields,
    pub command: Command,
}

/// 복구 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairRequest {
    /// 객체 info 재전송
    Info { object: ObjectId },

    /// 객체 전체 (아무것도 받지 못함)
    Object { object: ObjectId },

    /// 블록 복구: 필요한 심볼 수 + 누락 소스 심볼
    Block {
        object: ObjectId,
        block: BlockId,
        erasures: u16,
        symbols: Vec<SymbolId>,
    },
}

impl RepairRequest {
    pub fn object(&self) -> ObjectId {
        match self {
            RepairRequest::Info { object }
            | RepairRequest::Object { object }
            | RepairRequest::Block { object, .. } => *object,
        }
    }

    /// 요청 크기 (심볼 단위 대략치, NACK 크기 제한용)
    pub fn weight(&self) -> usize {
        match self {
            RepairRequest::Block { symbols, .. } => 1 + symbols.len(),
            _ => 1,
        }
    }
}

/// NACK 메시지 헤더
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackHeader {
    pub receiver: ReceiverFields,
    pub requests: Vec<RepairRequest>,
}

/// ACK 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckKind {
    /// CC / GRTT 프로브 응답
    Cc,

    /// 워터마크 ACK (payload = 수신자 ACK 데이터)
    Flush {
        object: ObjectId,
        block: BlockId,
        symbol: SymbolId,
    },
}

/// ACK 메시지 헤더
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckHeader {
    pub receiver: ReceiverFields,
    pub kind: AckKind,
}

/// 메시지 본문
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Info(InfoHeader),
    Data(DataHeader),
    Cmd(CmdHeader),
    Nack(NackHeader),
    Ack(AckHeader),
}

impl MessageBody {
    /// 송신자 메시지 여부
    pub fn sender_fields(&self) -> Option<&SenderFields> {
        match self {
            MessageBody::Info(h) => Some(&h.sender),
            MessageBody::Data(h) => Some(&h.sender),
            MessageBody::Cmd(h) => Some(&h.sender),
            MessageBody::Nack(_) | MessageBody::Ack(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::Info(_) => "INFO",
            MessageBody::Data(_) => "DATA",
            MessageBody::Cmd(_) => "CMD",
            MessageBody::Nack(_) => "NACK",
            MessageBody::Ack(_) => "ACK",
        }
    }
}

/// 메시지 헤더
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 보낸 노드
    pub source: NodeId,

    pub body: MessageBody,
}

/// 완성된 메시지 (헤더 + payload)
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Message {
    pub fn new(source: NodeId, body: MessageBody, payload: Bytes) -> Self {
        let mut body = body;
        if let MessageBody::Data(data) = &mut body {
            data.crc32 = crc32fast::hash(&payload);
        }
        Self {
            header: MessageHeader {
                magic: MAGIC_NUMBER,
                version: PROTOCOL_VERSION,
                source,
                body,
            },
            payload,
        }
    }

    pub fn source(&self) -> NodeId {
        self.header.source
    }

    pub fn body(&self) -> &MessageBody {
        &self.header.body
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header_bytes = bincode::serialize(&self.header)?;
        let header_len = u16::try_from(header_bytes.len()).map_err(|_| {
            Error::InvalidParameter(format!("메시지 헤더가 너무 큼: {} bytes", header_bytes.len()))
        })?;

        let mut buf = Vec::with_capacity(2 + header_bytes.len() + self.payload.len());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// 바이트에서 역직렬화 (매직 / 버전 / DATA CRC 검증)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::Truncated { len: bytes.len() });
        }

        let header_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return Err(Error::Truncated { len: bytes.len() });
        }

        let header: MessageHeader = bincode::deserialize(&bytes[2..2 + header_len])?;
        if header.magic != MAGIC_NUMBER {
            return Err(Error::NotNormPacket {
                expected: MAGIC_NUMBER,
                got: header.magic,
            });
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                got: header.version,
            });
        }

        match &header.body {
            MessageBody::Info(info) => info.fec.validate()?,
            MessageBody::Data(data) => data.fec.validate()?,
            _ => {}
        }

        let payload = Bytes::copy_from_slice(&bytes[2 + header_len..]);
        if let MessageBody::Data(data) = &header.body {
            let crc = crc32fast::hash(&payload);
            if crc != data.crc32 {
                return Err(Error::SegmentCorrupted {
                    expected: data.crc32,
                    got: crc,
                });
            }
        }

        Ok(Self { header, payload })
    }
}
