//! GRTT (그룹 왕복 시간) 추정
//!
//! - RTT / 그룹 크기 / 손실률 양자화 (메시지 헤더용)
//! - 송신자 GRTT 추정기: 큰 RTT는 즉시 반영, 감소는 프로브 주기마다 천천히
//! - NACK 백오프용 지수 분포 난수

use rand::Rng;

use crate::config::ProbingMode;

/// 양자화 가능한 최소 RTT (초)
pub const RTT_MIN: f64 = 1.0e-6;

/// 양자화 가능한 최대 RTT (초)
pub const RTT_MAX: f64 = 1000.0;

/// GRTT 추정 하한 (초)
pub const GRTT_MIN: f64 = 0.001;

/// 패킷 간격 계산 시 헤더 오버헤드 추정 (바이트)
pub const HEADER_OVERHEAD: usize = 44;

/// RTT 양자화 (올림, 보수적)
pub fn quantize_rtt(rtt: f64) -> u8 {
    let rtt = rtt.clamp(RTT_MIN, RTT_MAX);
    if rtt < 3.3e-5 {
        ((rtt / RTT_MIN) as u8).saturating_sub(1)
    } else {
        (255.0 - 13.0 * (RTT_MAX / rtt).ln()).ceil().clamp(0.0, 255.0) as u8
    }
}

pub fn unquantize_rtt(qrtt: u8) -> f64 {
    if qrtt < 31 {
        (qrtt as f64 + 1.0) * RTT_MIN
    } else {
        RTT_MAX / ((255.0 - qrtt as f64) / 13.0).exp()
    }
}

/// 그룹 크기 양자화 (4비트: 가수 1 또는 5, 지수 1~8, 올림)
pub fn quantize_group_size(gsize: f64) -> u8 {
    let exponent = gsize.max(1.0).log10() as i32;
    if exponent > 8 {
        return 0x0f;
    }
    if exponent < 1 {
        return 0x00;
    }

    let mantissa = (gsize / 10f64.powi(exponent)).ceil() as i32;
    if mantissa > 5 {
        if exponent > 7 {
            0x0f
        } else {
            exponent as u8
        }
    } else if mantissa > 1 {
        (exponent + 0x07) as u8
    } else {
        (exponent - 1) as u8
    }
}

pub fn unquantize_group_size(gsize: u8) -> f64 {
    let exponent = ((gsize & 0x07) + 1) as i32;
    let mantissa = if gsize & 0x08 != 0 { 5.0 } else { 1.0 };
    mantissa * 10f64.powi(exponent)
}

/// 손실률 양자화 (0.0 ~ 1.0 → 0 ~ 65535)
pub fn quantize_loss(loss: f64) -> u16 {
    (loss.max(0.0) * 65535.0 + 0.5).min(65535.0) as u16
}

pub fn unquantize_loss(loss: u16) -> f64 {
    loss as f64 / 65535.0
}

/// 백오프 계수 양자화
pub fn quantize_backoff(backoff: f64) -> u8 {
    backoff.round().clamp(0.0, 255.0) as u8
}

/// `[0, max]` 범위의 절단 지수 분포 난수
///
/// 그룹이 클수록 대부분의 수신자가 `max` 근처를 뽑아 소수만 먼저 NACK한다.
pub fn exponential_rand<R: Rng + ?Sized>(rng: &mut R, max: f64, group_size: f64) -> f64 {
    if !(max > 0.0) {
        return 0.0;
    }
    let lambda = group_size.max(1.0).ln() + 1.0;
    let scale = lambda.exp() - 1.0;
    let x = rng.gen::<f64>() * (lambda / max) + lambda / (max * scale);
    ((max / lambda) * (x * scale * (max / lambda)).ln()).clamp(0.0, max)
}

/// 송신자 GRTT 추정기
#[derive(Debug, Clone)]
pub struct GrttEstimator {
    /// 측정값 (초)
    measured: f64,

    /// 광고값 (양자화)
    quantized: u8,

    /// 광고값 (초, 양자화로 올림된 값)
    advertised: f64,

    /// 상한 (초)
    max: f64,

    /// 이번 주기 최대 응답 RTT
    current_peak: f64,

    /// 이번 주기 응답 수신 여부
    response: bool,

    /// 마지막 감소 판단 이후 경과 (초)
    age: f64,

    /// 현재 프로빙 간격 (초)
    interval: f64,
    interval_min: f64,
    interval_max: f64,

    mode: ProbingMode,
}

impl GrttEstimator {
    pub fn new(initial: f64, max: f64, interval_min: f64, interval_max: f64, mode: ProbingMode) -> Self {
        let mut estimator = Self {
            measured: initial.clamp(GRTT_MIN, max),
            quantized: 0,
            advertised: 0.0,
            max,
            current_peak: 0.0,
            response: false,
            age: 0.0,
            interval: 0.0,
            interval_min,
            interval_max,
            mode,
        };
        estimator.requantize(0.0);
        estimator
    }

    /// 광고 GRTT (초)
    pub fn advertised(&self) -> f64 {
        self.advertised
    }

    pub fn quantized(&self) -> u8 {
        self.quantized
    }

    pub fn measured(&self) -> f64 {
        self.measured
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mode(&self) -> ProbingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ProbingMode) {
        self.mode = mode;
    }

    pub fn set_interval(&mut self, min: f64, max: f64) {
        self.interval_min = min;
        self.interval_max = max.max(min);
        self.interval = self.interval.clamp(0.0, self.interval_max);
    }

    /// 추정값 직접 설정. 광고값이 바뀌면 true
    pub fn set_estimate(&mut self, grtt: f64, pkt_interval: f64) -> bool {
        self.measured = grtt.clamp(GRTT_MIN, self.max);
        self.requantize(pkt_interval)
    }

    pub fn set_max(&mut self, max: f64, pkt_interval: f64) -> bool {
        self.max = max.max(GRTT_MIN);
        self.measured = self.measured.min(self.max);
        self.requantize(pkt_interval)
    }

    /// 광고값 재계산 (패킷 간격보다 작게 광고하지 않음)
    fn requantize(&mut self, pkt_interval: f64) -> bool {
        let old = self.quantized;
        self.quantized = quantize_rtt(self.measured.max(pkt_interval));
        self.advertised = unquantize_rtt(self.quantized);
        if self.advertised > self.max {
            self.quantized = quantize_rtt(self.max);
            self.advertised = unquantize_rtt(self.quantized);
        }
        old != self.quantized
    }

    /// 수신자 RTT 응답 반영. 광고값이 바뀌면 true
    pub fn on_response(&mut self, rtt: f64, pkt_interval: f64, unicast: bool) -> bool {
        self.response = true;
        if rtt > self.measured || unicast {
            // 큰 RTT는 즉시 반영
            self.measured = (0.25 * self.measured + 0.75 * rtt).min(self.max);
            self.current_peak = self.measured;
            self.requantize(pkt_interval)
        } else {
            if rtt > self.current_peak {
                self.current_peak = rtt;
            }
            false
        }
    }

    /// 프로브 주기 처리 (`elapsed`: 지난 프로브 이후 경과). 광고값이 바뀌면 true
    pub fn on_probe(&mut self, elapsed: f64, pkt_interval: f64, fast_decrease: bool) -> bool {
        self.age += elapsed;

        let age_max = if fast_decrease {
            self.advertised
        } else {
            self.advertised.max(self.interval_min)
        };
        if self.age < age_max {
            return false;
        }
        self.age = 0.0;

        if !self.response {
            return false;
        }
        self.response = false;

        if self.current_peak < self.measured {
            self.measured *= 0.9;
            if self.current_peak > self.measured {
                self.measured = self.current_peak;
            }
        } else {
            self.current_peak = 0.0;
        }
        self.measured = self.measured.clamp(GRTT_MIN, self.max);
        self.requantize(pkt_interval)
    }

    /// 다음 프로브까지 간격 (초)
    ///
    /// 혼잡 제어 중이면 GRTT마다, 아니면 최소 간격에서 시작해 1.5배씩 늘린다.
    pub fn next_interval(&mut self, cc_enabled: bool) -> f64 {
        if cc_enabled {
            return self.advertised;
        }
        if self.interval < self.interval_min {
            self.interval = self.interval_min;
        } else {
            self.interval *= 1.5;
        }
        if self.interval > self.interval_max {
            self.interval = self.interval_max;
        }
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_rtt_quantization_rounds_up() {
        for &rtt in &[1.0e-5, 1.0e-4, 0.001, 0.01, 0.25, 1.0, 10.0, 100.0] {
            let q = quantize_rtt(rtt);
            let back = unquantize_rtt(q);
            assert!(back >= rtt * 0.999, "rtt {} -> {} -> {}", rtt, q, back);
            assert!(back <= rtt * 1.1, "rtt {} -> {} -> {}", rtt, q, back);
        }
        assert_eq!(quantize_rtt(RTT_MAX), 255);
        assert_eq!(quantize_rtt(0.0), 0);
    }

    #[test]
    fn test_group_size_quantization() {
        assert_eq!(quantize_group_size(1000.0), 0x02);
        assert_eq!(unquantize_group_size(0x02), 1000.0);
        assert_eq!(unquantize_group_size(quantize_group_size(300.0)), 500.0);
        assert_eq!(unquantize_group_size(quantize_group_size(600.0)), 1000.0);
        assert_eq!(unquantize_group_size(quantize_group_size(5.0)), 10.0);
        assert_eq!(quantize_group_size(1.0e12), 0x0f);
    }

    #[test]
    fn test_loss_quantization() {
        assert_eq!(quantize_loss(0.0), 0);
        assert_eq!(quantize_loss(1.0), 65535);
        assert_eq!(quantize_loss(2.0), 65535);
        assert!((unquantize_loss(quantize_loss(0.2)) - 0.2).abs() < 1e-4);
    }

    #[test]
    fn test_exponential_rand_bounds() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let mut sum = 0.0;
        for _ in 0..1000 {
            let v = exponential_rand(&mut rng, 1.0, 1000.0);
            assert!((0.0..=1.0).contains(&v));
            sum += v;
        }
        // 큰 그룹에서는 max 쪽으로 치우침
        assert!(sum / 1000.0 > 0.6);
        assert_eq!(exponential_rand(&mut rng, 0.0, 1000.0), 0.0);
    }

    #[test]
    fn test_grtt_increase_is_immediate() {
        let mut grtt = GrttEstimator::new(0.25, 10.0, 1.0, 30.0, ProbingMode::Active);
        let before = grtt.advertised();
        assert!(before >= 0.25);

        assert!(grtt.on_response(1.0, 0.0, false));
        assert!((grtt.measured() - (0.25 * 0.25 + 0.75 * 1.0)).abs() < 1e-9);
        assert!(grtt.advertised() > before);

        // 상한
        grtt.on_response(100.0, 0.0, false);
        assert!(grtt.measured() <= 10.0);
        assert!(grtt.advertised() <= 10.0);
    }

    #[test]
    fn test_grtt_decreases_slowly() {
        let mut grtt = GrttEstimator::new(1.0, 10.0, 1.0, 30.0, ProbingMode::Active);
        grtt.on_response(0.01, 0.0, false);
        assert!((grtt.measured() - 1.0).abs() < 1e-9);

        // 한 주기 후 10% 감소
        grtt.on_probe(2.0, 0.0, false);
        assert!((grtt.measured() - 0.9).abs() < 1e-9);

        // 응답이 없으면 유지
        grtt.on_probe(2.0, 0.0, false);
        assert!((grtt.measured() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_probe_interval_backs_off() {
        let mut grtt = GrttEstimator::new(0.25, 10.0, 1.0, 4.0, ProbingMode::Active);
        assert_eq!(grtt.next_interval(false), 1.0);
        assert_eq!(grtt.next_interval(false), 1.5);
        assert_eq!(grtt.next_interval(false), 2.25);
        assert_eq!(grtt.next_interval(false), 3.375);
        assert_eq!(grtt.next_interval(false), 4.0);
        assert_eq!(grtt.next_interval(true), grtt.advertised());
    }

    #[test]
    fn test_packet_interval_floor() {
        let mut grtt = GrttEstimator::new(0.001, 10.0, 1.0, 30.0, ProbingMode::None);
        grtt.set_estimate(0.001, 0.5);
        assert!(grtt.advertised() >= 0.5);
    }
}
