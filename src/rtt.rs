//! RTT 추정기
//!
//! RFC 6298 방식의 SRTT/RTTVAR 갱신에 동시 미해결 요청 수 보정을 더한 형태.
//! 응답 하나가 도착할 때 여러 요청이 동시에 나가 있으면 같은 구간의 샘플이
//! 여러 번 들어오므로, 가중치를 미해결 요청 수로 나눠서 반영한다.

use std::time::Duration;

use crate::{Config, Error, Result};

/// SRTT 가중치 (1/8)
const ALPHA: f64 = 0.125;

/// RTTVAR 가중치 (1/4)
const BETA: f64 = 0.25;

/// RTO = SRTT + K * RTTVAR
const K: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f64,
    rttvar_ms: f64,
    rto_ms: f64,
    sample_count: u64,

    // bounds
    min_rto_ms: f64,
    max_rto_ms: f64,
}

impl RttEstimator {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        let min_rto_ms = min_rto.as_secs_f64() * 1000.0;
        let max_rto_ms = (max_rto.as_secs_f64() * 1000.0).max(min_rto_ms);
        Self {
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            rto_ms: (initial_rto.as_secs_f64() * 1000.0).clamp(min_rto_ms, max_rto_ms),
            sample_count: 0,
            min_rto_ms,
            max_rto_ms,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Duration::from_millis(config.initial_rto_ms),
            Duration::from_millis(config.min_rto_ms),
            Duration::from_millis(config.max_rto_ms),
        )
    }

    // 호출 위치: 재전송되지 않은 요청의 응답 도착 시
    //
    // `outstanding`이 0이면 계수 로직이 이미 깨진 상태이므로 추정값을 건드리지 않고
    // 에러를 돌려준다.
    pub fn add_measurement(&mut self, sample: Duration, outstanding: usize) -> Result<()> {
        if outstanding == 0 {
            return Err(Error::InvalidRttMeasurement { outstanding });
        }

        let rtt = sample.as_secs_f64() * 1000.0;

        if self.sample_count == 0 {
            self.srtt_ms = rtt;
            self.rttvar_ms = rtt / 2.0;
        } else {
            let n = outstanding as f64;
            let alpha = ALPHA / n;
            let beta = BETA / n;
            self.rttvar_ms = (1.0 - beta) * self.rttvar_ms + beta * (self.srtt_ms - rtt).abs();
            self.srtt_ms = (1.0 - alpha) * self.srtt_ms + alpha * rtt;
        }

        self.sample_count += 1;
        self.rto_ms = (self.srtt_ms + K * self.rttvar_ms).clamp(self.min_rto_ms, self.max_rto_ms);
        Ok(())
    }

    /// 현재 RTO ([min, max] 범위로 제한됨)
    pub fn estimated_rto(&self) -> Duration {
        ms_to_duration(self.rto_ms)
    }

    /// 평활 RTT (샘플이 없으면 None)
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        if self.sample_count == 0 {
            return None;
        }
        Some(ms_to_duration(self.srtt_ms))
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}

fn ms_to_duration(ms: f64) -> Duration {
    Duration::from_micros((ms * 1000.0).round() as u64)
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
