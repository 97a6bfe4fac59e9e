//! 에러 타입 정의

use thiserror::Error;

use crate::object::ObjectType;

/// NORM 엔진 에러 타입
///
/// 흐름 제어 거부(캐시 가득 참)는 에러가 아니다. enqueue 계열 함수는
/// `Ok(None)`을 반환하고 애플리케이션은 QUEUE_VACANCY 이벤트 후 재시도한다.
#[derive(Error, Debug)]
pub enum Error {
    /// 소켓 / 캐시 파일 입출력
    #[error("소켓 또는 캐시 파일 I/O 실패: {0}")]
    Io(#[from] std::io::Error),

    /// 메시지 헤더 인코딩 / 디코딩
    #[error("NORM 헤더 인코딩 실패: {0}")]
    HeaderCodec(#[from] bincode::Error),

    #[error("NORM 패킷 아님 (magic {got:08X}, 기대값 {expected:08X})")]
    NotNormPacket { expected: u32, got: u32 },

    #[error("지원하지 않는 NORM 버전 {got} (이 노드는 {expected})")]
    UnsupportedVersion { expected: u8, got: u8 },

    #[error("DATA 세그먼트 손상: crc32 {got:08X}, 헤더 값 {expected:08X}")]
    SegmentCorrupted { expected: u32, got: u32 },

    #[error("잘린 메시지: {len} bytes")]
    Truncated { len: usize },

    #[error("유효하지 않은 파라미터: {0}")]
    InvalidParameter(String),

    #[error("유효하지 않은 주소: {0}")]
    InvalidAddress(String),

    #[error("송신자가 이미 시작됨")]
    SenderAlreadyStarted,

    #[error("송신자가 시작되지 않음")]
    SenderNotStarted,

    #[error("수신자가 이미 시작됨")]
    ReceiverAlreadyStarted,

    #[error("수신자가 시작되지 않음")]
    ReceiverNotStarted,

    #[error("알 수 없는 세션: {0}")]
    UnknownSession(u32),

    #[error("알 수 없는 원격 송신자: {0}")]
    UnknownNode(u32),

    #[error("객체가 송신 캐시에 없음: object={0}")]
    ObjectNotCached(u32),

    #[error("객체 info 없음")]
    NoObjectInfo,

    #[error("객체 info 크기 초과: {len} bytes (최대 {max})")]
    InfoTooLarge { len: usize, max: usize },

    #[error("객체가 아직 준비되지 않음")]
    ObjectNotReady,

    #[error("객체 타입 불일치: expected {expected:?}, got {got:?}")]
    WrongObjectType { expected: ObjectType, got: ObjectType },

    #[error("스트림이 닫힘")]
    StreamClosed,

    #[error("스트림 데이터 손실 (gap) 발생")]
    StreamBroken,

    #[error("FEC 복구 불가: {available}/{required} 심볼")]
    InsufficientSymbols { available: usize, required: usize },

    #[error("유효하지 않은 FEC 전송 정보: {0}")]
    InvalidFecInfo(String),

    #[error("유효하지 않은 FEC 구성: data={num_data}, parity={num_parity}")]
    InvalidFecGeometry { num_data: usize, num_parity: usize },

    #[error("Reed-Solomon 부호화 실패: {0}")]
    ErasureCode(#[from] reed_solomon_erasure::Error),

    #[error("tokio 런타임 밖에서 호출됨")]
    NoRuntime,

    #[error("엔진이 종료됨")]
    EngineStopped,
}

/// 엔진 API 공통 반환 타입
pub type Result<T> = std::result::Result<T, Error>;
