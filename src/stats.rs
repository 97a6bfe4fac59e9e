//! 전송 통계
//!
//! - `LossEstimator`: 송신자 메시지 시퀀스 기반 손실률 / ECN 마킹 비율
//! - `RateMeter`: 수신 속도 (혼잡 제어 피드백용)
//! - `TransferStats`: 세션 누적 카운터

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 손실 추정 윈도우 (패킷 수)
pub const LOSS_WINDOW: usize = 256;

/// 시퀀스 기반 손실 추정기
#[derive(Debug, Clone)]
pub struct LossEstimator {
    /// 최근 패킷 (true = 수신, false = 손실)
    window: VecDeque<bool>,

    /// 최근 수신 패킷의 ECN CE 마킹
    ecn_window: VecDeque<bool>,

    window_size: usize,

    /// 다음 기대 시퀀스
    next_seq: Option<u32>,

    /// 총 손실 수
    pub lost_total: u64,

    /// 손실 관측 여부 (슬로우 스타트 종료 판단)
    pub loss_seen: bool,
}

impl LossEstimator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            ecn_window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            next_seq: None,
            lost_total: 0,
            loss_seen: false,
        }
    }

    fn push(window: &mut VecDeque<bool>, size: usize, value: bool) {
        if window.len() >= size {
            window.pop_front();
        }
        window.push_back(value);
    }

    /// 패킷 수신 기록
    pub fn record(&mut self, seq: u32, ecn_ce: bool) {
        Self::push(&mut self.ecn_window, self.window_size, ecn_ce);

        let expected = match self.next_seq {
            Some(expected) => expected,
            None => {
                self.next_seq = Some(seq.wrapping_add(1));
                Self::push(&mut self.window, self.window_size, true);
                return;
            }
        };

        let gap = seq.wrapping_sub(expected);
        if gap > u32::MAX / 2 {
            // 순서가 바뀐 늦은 패킷
            return;
        }

        let missing = (gap as usize).min(self.window_size);
        for _ in 0..missing {
            Self::push(&mut self.window, self.window_size, false);
        }
        if gap > 0 {
            self.lost_total += gap as u64;
            self.loss_seen = true;
        }
        Self::push(&mut self.window, self.window_size, true);
        self.next_seq = Some(seq.wrapping_add(1));
    }

    /// 윈도우 손실률
    pub fn loss_fraction(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let lost = self.window.iter().filter(|r| !**r).count();
        lost as f64 / self.window.len() as f64
    }

    /// 윈도우 ECN 마킹 비율
    pub fn ecn_fraction(&self) -> f64 {
        if self.ecn_window.is_empty() {
            return 0.0;
        }
        let marked = self.ecn_window.iter().filter(|m| **m).count();
        marked as f64 / self.ecn_window.len() as f64
    }

    /// 송신자 재시작 시 초기화
    pub fn reset(&mut self) {
        self.window.clear();
        self.ecn_window.clear();
        self.next_seq = None;
        self.lost_total = 0;
        self.loss_seen = false;
    }
}

impl Default for LossEstimator {
    fn default() -> Self {
        Self::new(LOSS_WINDOW)
    }
}

/// 수신 기록
#[derive(Debug, Clone, Copy)]
struct Arrival {
    timestamp: Instant,
    size: usize,
}

/// 슬라이딩 윈도우 속도 측정기
#[derive(Debug, Clone)]
pub struct RateMeter {
    arrivals: VecDeque<Arrival>,
    window: Duration,
    bytes_in_window: usize,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            arrivals: VecDeque::new(),
            window,
            bytes_in_window: 0,
        }
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    fn expire(&mut self, now: Instant) {
        while let Some(front) = self.arrivals.front() {
            if now.saturating_duration_since(front.timestamp) <= self.window {
                break;
            }
            self.bytes_in_window -= front.size;
            self.arrivals.pop_front();
        }
    }

    pub fn record(&mut self, now: Instant, size: usize) {
        self.expire(now);
        self.arrivals.push_back(Arrival {
            timestamp: now,
            size,
        });
        self.bytes_in_window += size;
    }

    /// 바이트 처리율 (bytes/sec)
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.expire(now);
        let Some(first) = self.arrivals.front() else {
            return 0.0;
        };
        let span = now
            .saturating_duration_since(first.timestamp)
            .max(Duration::from_millis(1))
            .as_secs_f64();
        self.bytes_in_window as f64 / span
    }
}

/// 세션 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 송신 바이트 (UDP payload 기준)
    pub bytes_sent: u64,

    /// 첫 전송 데이터 세그먼트 수
    pub data_segments_sent: u64,

    /// 사전 (auto) 패리티 세그먼트 수
    pub parity_segments_sent: u64,

    /// 복구 전송 세그먼트 수
    pub repair_segments_sent: u64,

    /// 수신 NACK 수
    pub nacks_received: u64,

    /// 송신 NACK 수
    pub nacks_sent: u64,

    /// 억제된 NACK 사이클 수
    pub nacks_suppressed: u64,

    /// 수신 바이트
    pub bytes_received: u64,

    /// 중복 수신 세그먼트
    pub duplicate_segments: u64,

    /// 폐기된 잘못된 패킷
    pub invalid_packets: u64,

    pub objects_completed: u64,
    pub objects_aborted: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_sent: 0,
            data_segments_sent: 0,
            parity_segments_sent: 0,
            repair_segments_sent: 0,
            nacks_received: 0,
            nacks_sent: 0,
            nacks_suppressed: 0,
            bytes_received: 0,
            duplicate_segments: 0,
            invalid_packets: 0,
            objects_completed: 0,
            objects_aborted: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 복구 비율 (복구 / 첫 전송)
    pub fn repair_ratio(&self) -> f64 {
        if self.data_segments_sent == 0 {
            return 0.0;
        }
        self.repair_segments_sent as f64 / self.data_segments_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} bytes ({} data, {} parity, {} repair) | Recv: {} bytes | NACKs: {} sent / {} recv / {} suppressed | Objects: {} done / {} aborted",
            self.elapsed().as_secs_f64(),
            self.bytes_sent,
            self.data_segments_sent,
            self.parity_segments_sent,
            self.repair_segments_sent,
            self.bytes_received,
            self.nacks_sent,
            self.nacks_received,
            self.nacks_suppressed,
            self.objects_completed,
            self.objects_aborted,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_fraction_from_gaps() {
        let mut loss = LossEstimator::new(10);
        loss.record(100, false);
        loss.record(101, false);
        assert_eq!(loss.loss_fraction(), 0.0);
        assert!(!loss.loss_seen);

        // 102, 103 손실
        loss.record(104, false);
        assert!(loss.loss_seen);
        assert_eq!(loss.lost_total, 2);
        assert!((loss.loss_fraction() - 2.0 / 5.0).abs() < 1e-9);

        // 늦게 온 패킷은 무시
        loss.record(102, false);
        assert!((loss.loss_fraction() - 2.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_loss_window_slides() {
        let mut loss = LossEstimator::new(4);
        loss.record(0, false);
        loss.record(2, false);
        for seq in 3..10 {
            loss.record(seq, false);
        }
        assert_eq!(loss.loss_fraction(), 0.0);
        assert_eq!(loss.lost_total, 1);
    }

    #[test]
    fn test_ecn_fraction() {
        let mut loss = LossEstimator::new(4);
        loss.record(0, true);
        loss.record(1, false);
        loss.record(2, false);
        loss.record(3, true);
        assert_eq!(loss.ecn_fraction(), 0.5);
        assert_eq!(loss.loss_fraction(), 0.0);
    }

    #[test]
    fn test_rate_meter() {
        let start = Instant::now();
        let mut meter = RateMeter::new(Duration::from_secs(1));
        for i in 0..=10 {
            meter.record(start + Duration::from_millis(i * 100), 1000);
        }
        let rate = meter.rate(start + Duration::from_secs(1));
        assert!((rate - 11_000.0).abs() < 1.0, "rate {}", rate);

        // 윈도우 밖 기록은 제외
        let rate = meter.rate(start + Duration::from_millis(1950));
        assert_eq!(rate, 1000.0 / 0.95);
    }

    #[test]
    fn test_summary() {
        let mut stats = TransferStats::new();
        stats.data_segments_sent = 10;
        stats.repair_segments_sent = 5;
        assert_eq!(stats.repair_ratio(), 0.5);
        assert!(stats.summary().contains("5 repair"));
    }
}
