//! 송신 속도 제어
//!
//! - fixed: 설정된 속도로 고정, 속도 변경 이벤트 없음
//! - cc: TCP 친화 방정식 (손실률 + RTT)
//! - cce: ECN 마킹 비율만 혼잡 신호로 사용
//! - ccl: 허용 마진 이하의 손실은 무시
//!
//! 가장 낮은 속도를 계산해 준 수신자를 CLR(current limiting receiver)로 추적하고,
//! 피드백마다 속도를 조정한다. 한 번에 최대 2배까지만 증가한다.

use std::time::Duration;

use tracing::debug;

use crate::config::CongestionMode;
use crate::NodeId;

/// ccl 모드에서 무시하는 손실률
pub const LOSS_TOLERANCE: f64 = 0.02;

/// CLR 피드백이 이 프로브 횟수만큼 없으면 비활성으로 본다
const CLR_MAX_MISSED: u32 = 4;

/// TCP 친화 속도 (bytes/sec)
///
/// `size / (rtt * (sqrt(2p/3) + 12 * sqrt(3p/8) * p * (1 + 32p²)))`
pub fn tcp_friendly_rate(segment_size: f64, rtt: f64, loss: f64) -> f64 {
    if loss <= 0.0 || rtt <= 0.0 {
        return f64::INFINITY;
    }
    let denom = rtt
        * ((2.0 / 3.0 * loss).sqrt() + 12.0 * (3.0 / 8.0 * loss).sqrt() * loss * (1.0 + 32.0 * loss * loss));
    segment_size / denom
}

/// 수신자 혼잡 제어 보고
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CcReport {
    pub node: NodeId,

    /// 송신자가 측정한 RTT (초)
    pub rtt: f64,

    /// 손실 이벤트 비율
    pub loss: f64,

    /// ECN 마킹 비율
    pub ecn: f64,

    /// 수신자가 측정한 수신 속도 (bytes/sec)
    pub recv_rate: f64,
}

/// 현재 제한 수신자
#[derive(Debug, Clone, Copy)]
struct Clr {
    node: NodeId,
    rate: f64,
    rtt: f64,
    slow_start: bool,
    missed: u32,
}

/// 속도 조정 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateOutcome {
    pub rate_changed: bool,
    pub cc_activated: bool,
    pub cc_deactivated: bool,
}

/// 송신 속도 제어기
#[derive(Debug)]
pub struct RateController {
    mode: CongestionMode,

    /// 현재 속도 (bytes/sec)
    rate: f64,

    /// 하한 / 상한 (bytes/sec)
    rate_min: Option<f64>,
    rate_max: Option<f64>,

    segment_size: usize,

    cc_active: bool,
    clr: Option<Clr>,

    /// 프로브 시퀀스
    cc_sequence: u16,

    /// 마지막 조정 이후 데이터 전송 여부
    data_active: bool,
}

impl RateController {
    /// `tx_rate_bps`: 비트/초
    pub fn new(mode: CongestionMode, tx_rate_bps: f64, segment_size: usize) -> Self {
        Self {
            mode,
            rate: tx_rate_bps / 8.0,
            rate_min: None,
            rate_max: None,
            segment_size,
            cc_active: false,
            clr: None,
            cc_sequence: 0,
            data_active: false,
        }
    }

    pub fn mode(&self) -> CongestionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: CongestionMode) {
        if !mode.is_adaptive() {
            self.cc_active = false;
            self.clr = None;
        }
        self.mode = mode;
    }

    /// 현재 속도 (bits/sec)
    pub fn rate_bps(&self) -> f64 {
        self.rate * 8.0
    }

    /// 현재 속도 (bytes/sec)
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// 애플리케이션이 지정한 속도 (bits/sec). 이벤트는 발생시키지 않는다
    pub fn set_rate_bps(&mut self, bps: f64) {
        self.rate = self.bounded(bps / 8.0);
    }

    /// 속도 범위 (bits/sec). 음수나 None은 제한 없음
    pub fn set_bounds_bps(&mut self, min: Option<f64>, max: Option<f64>) {
        self.rate_min = min.filter(|v| *v >= 0.0).map(|v| v / 8.0);
        self.rate_max = max.filter(|v| *v >= 0.0).map(|v| v / 8.0);
        if let (Some(lo), Some(hi)) = (self.rate_min, self.rate_max) {
            if lo > hi {
                self.rate_min = Some(hi);
            }
        }
        self.rate = self.bounded(self.rate);
    }

    pub fn set_segment_size(&mut self, segment_size: usize) {
        self.segment_size = segment_size;
    }

    fn bounded(&self, rate: f64) -> f64 {
        let mut rate = rate;
        if let Some(max) = self.rate_max {
            rate = rate.min(max);
        }
        if let Some(min) = self.rate_min {
            rate = rate.max(min);
        }
        rate.max(1.0)
    }

    pub fn is_cc_active(&self) -> bool {
        self.cc_active
    }

    /// 현재 제한 수신자
    pub fn clr(&self) -> Option<NodeId> {
        self.clr.map(|c| c.node)
    }

    pub fn cc_sequence(&self) -> u16 {
        self.cc_sequence
    }

    /// 새 프로브 시퀀스
    pub fn next_sequence(&mut self) -> u16 {
        self.cc_sequence = self.cc_sequence.wrapping_add(1);
        self.cc_sequence
    }

    pub fn on_data_sent(&mut self) {
        self.data_active = true;
    }

    /// `len` 바이트 패킷 다음 전송까지 간격
    pub fn pacing_delay(&self, len: usize) -> Duration {
        let sec = (len as f64 / self.rate).max(0.000_001);
        Duration::from_secs_f64(sec)
    }

    /// 모드별 혼잡 신호 (손실률)
    fn effective_loss(&self, report: &CcReport) -> f64 {
        match self.mode {
            CongestionMode::Fixed | CongestionMode::Cc => report.loss,
            CongestionMode::Cce => report.ecn,
            CongestionMode::Ccl => (report.loss - LOSS_TOLERANCE).max(0.0),
        }
    }

    /// 수신자가 허용하는 속도 (bytes/sec)와 슬로우 스타트 여부
    pub fn calculate_rate(&self, report: &CcReport) -> (f64, bool) {
        let loss = self.effective_loss(report);
        if loss <= 0.0 {
            (2.0 * report.recv_rate, true)
        } else {
            (tcp_friendly_rate(self.segment_size as f64, report.rtt, loss), false)
        }
    }

    /// 최소 속도: 설정값, 없으면 GRTT당 세그먼트 하나
    fn min_rate(&self, grtt: f64) -> f64 {
        match self.rate_min {
            Some(min) => min,
            None if grtt > 1.0 => self.segment_size as f64 / grtt,
            None => self.segment_size as f64,
        }
    }

    /// 수신자 피드백 처리
    pub fn on_feedback(&mut self, report: CcReport, grtt: f64) -> RateOutcome {
        if !self.mode.is_adaptive() {
            return RateOutcome::default();
        }

        let (rate, slow_start) = self.calculate_rate(&report);
        let candidate = Clr {
            node: report.node,
            rate,
            rtt: report.rtt,
            slow_start,
            missed: 0,
        };

        let is_clr = match self.clr {
            Some(clr) if clr.node == report.node => true,
            Some(clr) if clr.missed <= CLR_MAX_MISSED && rate >= clr.rate => false,
            _ => true,
        };
        if !is_clr {
            return RateOutcome::default();
        }
        if self.clr.map(|c| c.node) != Some(report.node) {
            debug!("CLR 변경: node={} rate={:.0} B/s", report.node, rate);
        }
        self.clr = Some(candidate);
        self.adjust(true, grtt)
    }

    /// 프로브 주기마다 호출 (피드백 없는 조정)
    pub fn on_probe(&mut self, grtt: f64) -> RateOutcome {
        if !self.mode.is_adaptive() {
            return RateOutcome::default();
        }
        if let Some(clr) = self.clr.as_mut() {
            clr.missed += 1;
        }
        let outcome = self.adjust(false, grtt);
        self.data_active = false;
        outcome
    }

    fn clr_active(&self) -> bool {
        matches!(self.clr, Some(clr) if clr.missed <= CLR_MAX_MISSED)
    }

    fn adjust(&mut self, on_response: bool, grtt: f64) -> RateOutcome {
        let mut outcome = RateOutcome::default();
        let old_rate = self.rate;
        let mut rate = self.rate;

        if on_response {
            if let Some(clr) = self.clr {
                if !self.cc_active {
                    self.cc_active = true;
                    outcome.cc_activated = true;
                }
                rate = if clr.slow_start {
                    clr.rate
                } else if clr.rate > rate {
                    clr.rate.min(2.0 * rate)
                } else {
                    clr.rate
                };
            }
        } else if !self.data_active || !self.clr_active() {
            rate *= 0.5;
        }

        let min_rate = self.min_rate(grtt);
        if rate <= min_rate {
            rate = min_rate;
            if !self.clr_active() && self.cc_active {
                self.cc_active = false;
                outcome.cc_deactivated = true;
            }
        }
        if let Some(max) = self.rate_max {
            rate = rate.min(max);
        }

        self.rate = rate.max(1.0);
        if (self.rate - old_rate).abs() > f64::EPSILON * old_rate.max(1.0) {
            outcome.rate_changed = true;
            debug!(
                "송신 속도 {:.0} -> {:.0} B/s (clr={:?})",
                old_rate,
                self.rate,
                self.clr.map(|c| (c.node, c.rtt))
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(node: NodeId, loss: f64, recv_rate: f64) -> CcReport {
        CcReport {
            node,
            rtt: 0.1,
            loss,
            ecn: 0.0,
            recv_rate,
        }
    }

    #[test]
    fn test_tcp_friendly_rate_decreases_with_loss() {
        let low = tcp_friendly_rate(1400.0, 0.1, 0.01);
        let high = tcp_friendly_rate(1400.0, 0.1, 0.1);
        assert!(low > high);
        assert!(tcp_friendly_rate(1400.0, 0.1, 0.0).is_infinite());
        assert!(tcp_friendly_rate(1400.0, 0.2, 0.01) < low);
    }

    #[test]
    fn test_fixed_mode_never_changes() {
        let mut cc = RateController::new(CongestionMode::Fixed, 1_000_000.0, 1400);
        let out = cc.on_feedback(report(1, 0.5, 10.0), 0.1);
        assert_eq!(out, RateOutcome::default());
        assert_eq!(cc.on_probe(0.1), RateOutcome::default());
        assert_eq!(cc.rate_bps(), 1_000_000.0);
        assert_eq!(cc.pacing_delay(125_000), Duration::from_secs(1));
    }

    #[test]
    fn test_slow_start_doubles_receive_rate() {
        let mut cc = RateController::new(CongestionMode::Cc, 800_000.0, 1400);
        let out = cc.on_feedback(report(1, 0.0, 100_000.0), 0.1);
        assert!(out.cc_activated);
        assert!(out.rate_changed);
        assert_eq!(cc.rate(), 200_000.0);
        assert_eq!(cc.clr(), Some(1));
    }

    #[test]
    fn test_increase_is_limited_to_double() {
        let mut cc = RateController::new(CongestionMode::Cc, 800_000.0, 1400);
        // 손실 있는 수신자: 방정식 속도가 현재의 2배 초과
        let out = cc.on_feedback(report(1, 0.0001, 0.0), 0.1);
        assert!(out.rate_changed);
        assert_eq!(cc.rate(), 200_000.0);
    }

    #[test]
    fn test_slowest_receiver_becomes_clr() {
        let mut cc = RateController::new(CongestionMode::Cc, 800_000.0, 1400);
        cc.on_feedback(report(1, 0.01, 0.0), 0.1);
        cc.on_feedback(report(2, 0.2, 0.0), 0.1);
        assert_eq!(cc.clr(), Some(2));
        // 더 빠른 수신자는 CLR을 빼앗지 못함
        cc.on_feedback(report(3, 0.001, 0.0), 0.1);
        assert_eq!(cc.clr(), Some(2));
    }

    #[test]
    fn test_modes_pick_their_signal() {
        let r = CcReport {
            node: 1,
            rtt: 0.1,
            loss: 0.015,
            ecn: 0.0,
            recv_rate: 50_000.0,
        };
        let ccl = RateController::new(CongestionMode::Ccl, 800_000.0, 1400);
        assert_eq!(ccl.calculate_rate(&r), (100_000.0, true));

        let cce = RateController::new(CongestionMode::Cce, 800_000.0, 1400);
        assert!(cce.calculate_rate(&r).1);

        let tcp = RateController::new(CongestionMode::Cc, 800_000.0, 1400);
        assert!(!tcp.calculate_rate(&r).1);
    }

    #[test]
    fn test_halves_without_feedback() {
        let mut cc = RateController::new(CongestionMode::Cc, 800_000.0, 1400);
        cc.on_feedback(report(1, 0.0, 50_000.0), 0.1);
        let before = cc.rate();
        let out = cc.on_probe(0.1);
        assert!(out.rate_changed);
        assert_eq!(cc.rate(), before * 0.5);

        for _ in 0..32 {
            cc.on_probe(0.1);
        }
        assert_eq!(cc.rate(), 1400.0);
        assert!(!cc.is_cc_active());
    }

    #[test]
    fn test_rate_bounds() {
        let mut cc = RateController::new(CongestionMode::Cc, 800_000.0, 1400);
        cc.set_bounds_bps(Some(80_000.0), Some(160_000.0));
        assert_eq!(cc.rate_bps(), 160_000.0);
        cc.on_feedback(report(1, 0.0, 1_000_000.0), 0.1);
        assert_eq!(cc.rate_bps(), 160_000.0);
    }
}
