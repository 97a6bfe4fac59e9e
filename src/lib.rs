//! # NORM Engine
//!
//! UDP 기반 NACK 지향 신뢰성 멀티캐스트 (NACK-Oriented Reliable Multicast) 엔진
//!
//! ## 핵심 특징
//! - **FEC**: GF(2^8) 체계적 Reed-Solomon, 블록당 `k`개 중 아무 `k`개로 복구
//! - **NACK 기반 복구**: 랜덤 백오프 + 억제로 피드백 폭주 방지
//! - **GRTT 추정**: 그룹 왕복 시간 프로빙 (none / passive / active)
//! - **혼잡 제어**: TCP 친화 (cc), ECN 전용 (cce), 손실 허용 (ccl), 고정 속도
//! - **워터마크**: 지정 노드들의 positive ACK 기반 흐름 제어
//! - **Sans-IO 코어**: [`Session`]은 소켓을 모르고, [`Instance`]가 I/O를 구동
//!
//! ## 구성
//! ```text
//! Instance ─┬─ Session ─┬─ SenderRole   (tx 캐시, 복구, 워터마크, 속도 제어)
//!           │           └─ ReceiverRole (원격 송신자, rx 객체, NACK 사이클)
//!           └─ UDP 소켓 (tx / rx)
//! ```

pub mod cache;
pub mod config;
pub mod congestion;
pub mod engine;
pub mod error;
pub mod event;
pub mod fec;
pub mod grtt;
pub mod instance;
pub mod message;
pub mod node;
pub mod object;
pub mod receiver;
pub mod segment;
pub mod sender;
pub mod session;
pub mod socket;
pub mod stats;

pub use cache::TxCacheBounds;
pub use config::{
    AckTarget, CongestionMode, CongestionSetting, FlushMode, InstanceConfig, NackingMode,
    ProbingMode, RepairBoundary, SenderParams, SessionAddress, SessionConfig, SyncPolicy,
    TrackingStatus,
};
pub use engine::EngineThread;
pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use instance::Instance;
pub use node::AckingStatus;
pub use object::{Object, ObjectId, ObjectState, ObjectType};
pub use session::{Session, SessionId, Transmit};
pub use stats::TransferStats;

/// 노드 ID (세션 내 로컬 노드 식별자)
pub type NodeId = u32;

/// "모든 노드" 와일드카드 (acking 상태 조회용)
pub const NODE_ANY: NodeId = u32::MAX;

/// 유효하지 않은 노드 ID
pub const NODE_NONE: NodeId = 0;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u32 = 0x4E4F_524D; // "NORM"

/// 기본 세션 포트
pub const DEFAULT_PORT: u16 = 6003;

/// 기본 세그먼트 크기 (바이트)
pub const DEFAULT_SEGMENT_SIZE: u16 = 1400;

/// 기본 블록 크기 (세그먼트 수)
pub const DEFAULT_BLOCK_SIZE: u16 = 64;

/// 기본 블록당 패리티 수
pub const DEFAULT_NUM_PARITY: u16 = 8;

/// 최대 UDP 데이터그램 크기
pub const MAX_DATAGRAM_SIZE: usize = 65535;
