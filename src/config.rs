//! 엔진 / 세션 설정
//!
//! - `InstanceConfig`: 프로세스 단위 엔진 설정
//! - `SessionConfig`: 세션별 전송 / 신뢰성 스위치
//! - `SenderParams`: 송신자 시작 파라미터
//!
//! 명령행 옵션 값 (`address/port`, `cc|cce|ccl|rate <bps>`, `none|passive|active`,
//! `auto|<node-list>`)은 `FromStr`로 파싱한다.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::cache::TxCacheBounds;
use crate::fec::MAX_SYMBOLS;
use crate::{
    Error, NodeId, Result, DEFAULT_BLOCK_SIZE, DEFAULT_NUM_PARITY, DEFAULT_PORT,
    DEFAULT_SEGMENT_SIZE,
};

/// 최소 세그먼트 크기 (스트림 프레이밍 헤더 + 1바이트)
pub const MIN_SEGMENT_SIZE: u16 = 16;

/// 혼잡 제어 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionMode {
    /// 고정 속도 (혼잡 제어 비활성)
    Fixed,
    /// TCP 친화 (손실 기반, ECN 비활성)
    Cc,
    /// ECN 전용 (일반 손실 무시)
    Cce,
    /// 손실 허용 (허용 마진 이하 손실 무시)
    Ccl,
}

impl CongestionMode {
    pub fn is_adaptive(&self) -> bool {
        !matches!(self, CongestionMode::Fixed)
    }
}

/// `cc|cce|ccl|fixed|rate <bps>` 파싱 결과
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionSetting {
    pub mode: CongestionMode,
    /// `rate <bps>`로 지정된 고정 속도
    pub rate: Option<f64>,
}

impl FromStr for CongestionSetting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| Error::InvalidParameter("빈 혼잡 제어 옵션".into()))?;

        let setting = match keyword.to_ascii_lowercase().as_str() {
            "cc" => Self { mode: CongestionMode::Cc, rate: None },
            "cce" => Self { mode: CongestionMode::Cce, rate: None },
            "ccl" => Self { mode: CongestionMode::Ccl, rate: None },
            "fixed" => Self { mode: CongestionMode::Fixed, rate: None },
            "rate" => {
                let bps = parts
                    .next()
                    .ok_or_else(|| Error::InvalidParameter("rate 값 누락".into()))?
                    .parse::<f64>()
                    .map_err(|e| Error::InvalidParameter(format!("rate 값: {}", e)))?;
                if !(bps > 0.0) {
                    return Err(Error::InvalidParameter(format!("rate는 양수여야 함: {}", bps)));
                }
                Self { mode: CongestionMode::Fixed, rate: Some(bps) }
            }
            other => {
                return Err(Error::InvalidParameter(format!("알 수 없는 혼잡 제어 모드: {}", other)))
            }
        };

        if parts.next().is_some() {
            return Err(Error::InvalidParameter(format!("혼잡 제어 옵션 형식 오류: {}", s)));
        }
        Ok(setting)
    }
}

/// GRTT 프로빙 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbingMode {
    /// 프로빙 없음 (GRTT 고정)
    None,
    /// 프로브 전송, 응답은 NACK에 실려올 때만 사용
    Passive,
    /// 프로브 전송 + 수신자 명시적 응답 요청
    Active,
}

impl FromStr for ProbingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ProbingMode::None),
            "passive" => Ok(ProbingMode::Passive),
            "active" => Ok(ProbingMode::Active),
            other => Err(Error::InvalidParameter(format!("알 수 없는 GRTT 프로빙 모드: {}", other))),
        }
    }
}

/// ACK 대상 (`auto` 또는 노드 목록)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AckTarget {
    #[default]
    None,
    /// 응답하는 수신자를 자동 추적
    Auto,
    /// 지정 노드 목록
    Nodes(Vec<NodeId>),
}

impl FromStr for AckTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => return Ok(AckTarget::None),
            "auto" => return Ok(AckTarget::Auto),
            _ => {}
        }

        let nodes = s
            .split(',')
            .map(|n| {
                n.trim()
                    .parse::<NodeId>()
                    .map_err(|e| Error::InvalidParameter(format!("노드 ID '{}': {}", n, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(AckTarget::Nodes(nodes))
    }
}

/// 세션 주소 (`address[/port]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAddress {
    pub addr: IpAddr,
    pub port: u16,
}

impl SessionAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.is_multicast()
    }
}

impl FromStr for SessionAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, port) = match s.trim().split_once('/') {
            Some((addr, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| Error::InvalidAddress(format!("{}: {}", s, e)))?;
                (addr, port)
            }
            None => (s.trim(), DEFAULT_PORT),
        };

        let addr = addr
            .parse::<IpAddr>()
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", s, e)))?;
        Ok(Self { addr, port })
    }
}

/// 수신자 NACK 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackingMode {
    None,
    /// 객체 info만 요청
    InfoOnly,
    Normal,
}

/// NACK 발생 경계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairBoundary {
    /// 송신자가 다음 블록으로 넘어가면 이전 블록 NACK
    Block,
    /// 송신자가 다음 객체로 넘어가야 NACK
    Object,
}

/// 수신자 동기화 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// 처음 관측한 객체부터 수신
    Current,
    /// 송신자가 캐시한 모든 객체 수신 시도
    All,
}

/// acking 노드 자동 추적 범위
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    None,
    /// 피드백을 보낸 수신자
    Receivers,
    /// 관측된 원격 송신자
    Senders,
    All,
}

impl TrackingStatus {
    pub fn tracks_receivers(&self) -> bool {
        matches!(self, TrackingStatus::Receivers | TrackingStatus::All)
    }

    pub fn tracks_senders(&self) -> bool {
        matches!(self, TrackingStatus::Senders | TrackingStatus::All)
    }
}

/// 스트림 flush 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// 경계만 표시
    None,
    /// 부분 세그먼트를 즉시 전송 대기열로
    Passive,
    /// Passive + CMD(FLUSH) 능동 전송
    Active,
}

/// 엔진(Instance) 설정
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// 수신 FILE 객체 캐시 디렉토리 (None이면 시스템 임시 디렉토리)
    pub cache_dir: Option<PathBuf>,

    /// 이벤트 큐 용량 (EngineThread 채널 크기)
    pub event_queue_capacity: usize,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 난수 시드 (결정적 실행용)
    pub rng_seed: Option<u64>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            event_queue_capacity: 1024,
            recv_buffer_size: crate::MAX_DATAGRAM_SIZE,
            rng_seed: None,
        }
    }
}

/// 세션 설정
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 멀티캐스트 루프백 (자기 메시지 수신)
    pub loopback: bool,

    /// 멀티캐스트 인터페이스 (IPv4 주소 또는 인터페이스 이름)
    pub interface: Option<String>,

    /// 멀티캐스트 TTL
    pub ttl: u32,

    /// IP TOS
    pub tos: Option<u32>,

    /// 송신 소켓 버퍼 크기
    pub tx_socket_buffer: Option<usize>,

    /// 수신 소켓 버퍼 크기
    pub rx_socket_buffer: Option<usize>,

    /// 송신 소켓 포트 (None이면 임의 포트)
    pub tx_port: Option<u16>,

    /// ACK 대상
    pub ack: AckTarget,

    /// NACK을 송신자에게 유니캐스트
    pub unicast_nack: bool,

    /// 혼잡 제어 모드
    pub congestion: CongestionMode,

    /// 송신 속도 (bps) - 고정 모드의 속도, 적응 모드의 초기 속도
    pub tx_rate: f64,

    /// 송신 속도 하한 (bps)
    pub tx_rate_min: Option<f64>,

    /// 송신 속도 상한 (bps)
    pub tx_rate_max: Option<f64>,

    /// GRTT 프로빙 모드
    pub grtt_probing: ProbingMode,

    /// GRTT 프로빙 간격 최소 (초)
    pub grtt_interval_min: f64,

    /// GRTT 프로빙 간격 최대 (초)
    pub grtt_interval_max: f64,

    /// 초기 GRTT 추정값 (초)
    pub grtt_estimate: f64,

    /// GRTT 상한 (초)
    pub grtt_max: f64,

    /// NACK 백오프 계수 (GRTT 배수)
    pub backoff_factor: f64,

    /// 그룹 크기 추정값
    pub group_size: f64,

    /// 송신측 반복 횟수 (flush, 워터마크, 명령)
    pub tx_robust_factor: u32,

    /// 수신측 반복 횟수 (송신자 활동 타이머)
    pub rx_robust_factor: u32,

    /// 송신 캐시 한계
    pub tx_cache: TxCacheBounds,

    /// 원격 송신자당 동시 수신 객체 수 한계
    pub rx_cache_limit: usize,

    /// 손실률 기반 선제 패리티
    pub auto_parity: bool,

    /// 기본 중복 전송 비율 (0.0 ~ 1.0)
    pub base_redundancy_ratio: f64,

    /// 최대 중복 전송 비율
    pub max_redundancy_ratio: f64,

    /// 최소 중복 전송 비율
    pub min_redundancy_ratio: f64,

    /// 수신자 NACK 모드
    pub nacking_mode: NackingMode,

    /// 피드백을 전혀 보내지 않는 수신자
    pub silent_receiver: bool,

    /// NACK 경계
    pub repair_boundary: RepairBoundary,

    /// 동기화 정책
    pub sync_policy: SyncPolicy,

    /// acking 노드 자동 추적
    pub tracking: TrackingStatus,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            loopback: false,
            interface: None,
            ttl: 255,
            tos: None,
            tx_socket_buffer: None,
            rx_socket_buffer: None,
            tx_port: None,
            ack: AckTarget::None,
            unicast_nack: false,
            congestion: CongestionMode::Fixed,
            tx_rate: 64_000.0,               // 64 kbps
            tx_rate_min: None,
            tx_rate_max: None,
            grtt_probing: ProbingMode::Active,
            grtt_interval_min: 1.0,
            grtt_interval_max: 30.0,
            grtt_estimate: 0.25,             // 250ms
            grtt_max: 10.0,
            backoff_factor: 4.0,
            group_size: 1000.0,
            tx_robust_factor: 20,
            rx_robust_factor: 20,
            tx_cache: TxCacheBounds::default(),
            rx_cache_limit: 256,
            auto_parity: false,
            base_redundancy_ratio: 0.15,      // 15% 기본 중복
            max_redundancy_ratio: 0.70,       // 최대 70%
            min_redundancy_ratio: 0.05,       // 최소 5%
            nacking_mode: NackingMode::Normal,
            silent_receiver: false,
            repair_boundary: RepairBoundary::Block,
            sync_policy: SyncPolicy::Current,
            tracking: TrackingStatus::None,
        }
    }
}

impl SessionConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 손실률 기반 중복 비율 계산
    pub fn calculate_redundancy(&self, loss_rate: f64) -> f64 {
        // loss_rate 0.0 -> base_redundancy
        // loss_rate 0.3 -> max_redundancy에 가까워짐
        let ratio = self.base_redundancy_ratio + (loss_rate * 2.0);
        ratio.clamp(self.min_redundancy_ratio, self.max_redundancy_ratio)
    }

    /// 혼잡 제어 옵션 적용
    pub fn apply_congestion(&mut self, setting: CongestionSetting) {
        self.congestion = setting.mode;
        if let Some(rate) = setting.rate {
            self.tx_rate = rate;
        }
    }

    /// ACK 대상 적용 (auto면 수신자 자동 추적)
    pub fn apply_ack_target(&mut self, target: AckTarget) {
        if target == AckTarget::Auto && self.tracking == TrackingStatus::None {
            self.tracking = TrackingStatus::Receivers;
        }
        self.ack = target;
    }

    /// 파라미터 조합 검증
    pub fn validate(&self) -> Result<()> {
        if !(self.tx_rate > 0.0) {
            return Err(Error::InvalidParameter(format!("tx_rate: {}", self.tx_rate)));
        }
        if let (Some(min), Some(max)) = (self.tx_rate_min, self.tx_rate_max) {
            if min > max {
                return Err(Error::InvalidParameter(format!(
                    "tx_rate 범위: min {} > max {}",
                    min, max
                )));
            }
        }
        if !(self.grtt_interval_min > 0.0) || self.grtt_interval_min > self.grtt_interval_max {
            return Err(Error::InvalidParameter(format!(
                "GRTT 프로빙 간격: {} ~ {}",
                self.grtt_interval_min, self.grtt_interval_max
            )));
        }
        if !(self.grtt_estimate > 0.0) || !(self.grtt_max > 0.0) {
            return Err(Error::InvalidParameter("GRTT 값은 양수여야 함".into()));
        }
        if self.backoff_factor < 0.0 {
            return Err(Error::InvalidParameter(format!(
                "backoff_factor: {}",
                self.backoff_factor
            )));
        }
        if !(self.group_size >= 1.0) {
            return Err(Error::InvalidParameter(format!("group_size: {}", self.group_size)));
        }
        if self.tx_robust_factor == 0 || self.rx_robust_factor == 0 {
            return Err(Error::InvalidParameter("robust factor는 1 이상".into()));
        }
        if self.rx_cache_limit == 0 {
            return Err(Error::InvalidParameter("rx_cache_limit는 1 이상".into()));
        }
        self.tx_cache.validate()
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            tx_rate: 1_000_000.0,             // 1 Mbps
            grtt_probing: ProbingMode::Passive,
            tx_cache: TxCacheBounds {
                size_max: 4 * 1024 * 1024,    // 4MB
                count_min: 8,
                count_max: 64,
            },
            rx_cache_limit: 32,
            ..Self::default()
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            congestion: CongestionMode::Cc,
            tx_rate: 10_000_000.0,            // 10 Mbps에서 시작
            grtt_estimate: 0.05,
            grtt_interval_min: 0.5,
            tx_cache: TxCacheBounds {
                size_max: 128 * 1024 * 1024,  // 128MB
                count_min: 8,
                count_max: 1024,
            },
            rx_cache_limit: 1024,
            tx_socket_buffer: Some(8 * 1024 * 1024),
            rx_socket_buffer: Some(8 * 1024 * 1024),
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            congestion: CongestionMode::Ccl,
            tx_rate: 1_000_000.0,
            auto_parity: true,
            base_redundancy_ratio: 0.35,      // 35%
            max_redundancy_ratio: 0.80,
            min_redundancy_ratio: 0.20,
            backoff_factor: 6.0,
            tx_robust_factor: 30,
            rx_robust_factor: 30,
            ..Self::default()
        }
    }
}

/// 송신자 시작 파라미터
#[derive(Debug, Clone)]
pub struct SenderParams {
    /// 송신자 인스턴스 ID (재시작 식별)
    pub instance_id: u16,

    /// 송신 버퍼 공간 (바이트) - 패리티 캐시 / 스트림 기본 버퍼 한계
    pub buffer_space: usize,

    /// 세그먼트 크기 (바이트)
    pub segment_size: u16,

    /// 블록당 소스 세그먼트 수
    pub block_size: u16,

    /// 블록당 패리티 세그먼트 수
    pub num_parity: u16,
}

impl Default for SenderParams {
    fn default() -> Self {
        Self {
            instance_id: 1,
            buffer_space: 1024 * 1024,        // 1MB
            segment_size: DEFAULT_SEGMENT_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            num_parity: DEFAULT_NUM_PARITY,
        }
    }
}

impl SenderParams {
    pub fn new(buffer_space: usize, segment_size: u16, block_size: u16, num_parity: u16) -> Self {
        Self {
            buffer_space,
            segment_size,
            block_size,
            num_parity,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::InvalidParameter(format!(
                "segment_size {} < {}",
                self.segment_size, MIN_SEGMENT_SIZE
            )));
        }
        if self.block_size == 0
            || self.block_size as usize + self.num_parity as usize > MAX_SYMBOLS
        {
            return Err(Error::InvalidFecGeometry {
                num_data: self.block_size as usize,
                num_parity: self.num_parity as usize,
            });
        }
        if self.buffer_space == 0 {
            return Err(Error::InvalidParameter("buffer_space는 0보다 커야 함".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(SessionConfig::low_spec().validate().is_ok());
        assert!(SessionConfig::high_performance().validate().is_ok());
        assert!(SessionConfig::unstable_network().validate().is_ok());
        assert!(SenderParams::default().validate().is_ok());
    }

    #[test]
    fn test_calculate_redundancy() {
        let config = SessionConfig::default();
        assert!((config.calculate_redundancy(0.0) - 0.15).abs() < 1e-9);
        assert!((config.calculate_redundancy(0.1) - 0.35).abs() < 1e-9);
        assert!((config.calculate_redundancy(0.9) - 0.70).abs() < 1e-9);
    }

    #[test]
    fn test_parse_congestion() {
        let cc: CongestionSetting = "cc".parse().unwrap();
        assert_eq!(cc.mode, CongestionMode::Cc);
        assert_eq!(cc.rate, None);

        let rate: CongestionSetting = "rate 1000000".parse().unwrap();
        assert_eq!(rate.mode, CongestionMode::Fixed);
        assert_eq!(rate.rate, Some(1_000_000.0));

        assert!("rate".parse::<CongestionSetting>().is_err());
        assert!("rate -5".parse::<CongestionSetting>().is_err());
        assert!("bbr".parse::<CongestionSetting>().is_err());

        let mut config = SessionConfig::default();
        config.apply_congestion(rate);
        assert_eq!(config.tx_rate, 1_000_000.0);
    }

    #[test]
    fn test_parse_probing_and_ack() {
        assert_eq!("active".parse::<ProbingMode>().unwrap(), ProbingMode::Active);
        assert_eq!("NONE".parse::<ProbingMode>().unwrap(), ProbingMode::None);
        assert!("sometimes".parse::<ProbingMode>().is_err());

        assert_eq!("auto".parse::<AckTarget>().unwrap(), AckTarget::Auto);
        assert_eq!(
            "1, 2,3".parse::<AckTarget>().unwrap(),
            AckTarget::Nodes(vec![1, 2, 3])
        );
        assert!("1,x".parse::<AckTarget>().is_err());

        let mut config = SessionConfig::default();
        config.apply_ack_target(AckTarget::Auto);
        assert_eq!(config.tracking, TrackingStatus::Receivers);
    }

    #[test]
    fn test_parse_session_address() {
        let addr: SessionAddress = "224.1.2.3/6003".parse().unwrap();
        assert!(addr.is_multicast());
        assert_eq!(addr.port, 6003);

        let addr: SessionAddress = "127.0.0.1".parse().unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);
        assert!(!addr.is_multicast());

        assert!("224.1.2.3/abc".parse::<SessionAddress>().is_err());
        assert!("host.invalid/5000".parse::<SessionAddress>().is_err());
    }

    #[test]
    fn test_sender_params_geometry() {
        assert!(SenderParams::new(1024, 1400, 200, 55).validate().is_ok());
        assert!(matches!(
            SenderParams::new(1024, 1400, 200, 56).validate(),
            Err(Error::InvalidFecGeometry { .. })
        ));
        assert!(SenderParams::new(1024, 8, 64, 8).validate().is_err());
    }
}
