//! 스트림 세션 설정

use std::time::Duration;

use crate::{
    Error, Result, DEFAULT_FRAMES_PER_SEGMENT, DEFAULT_MAX_CWND, DEFAULT_SAMPLING_RATE,
    SAMPLES_PER_ADTS_FRAME,
};

/// PSA 세션 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 생산자 샘플링 레이트 (Hz)
    pub sampling_rate: u32,

    /// 세그먼트당 프레임 수
    pub frames_per_segment: u64,

    /// 프레임당 샘플 수 (AAC ADTS = 1024)
    pub samples_per_frame: u64,

    /// 지터 버퍼 깊이 (프레임 단위)
    /// 재생 시작 전에 흡수할 초기 지연
    pub jitter_buffer_frames: u64,

    /// 세션 틱 주기 (밀리초)
    pub tick_interval_ms: u64,

    /// 최대 동시 미해결 요청 수
    pub max_cwnd: usize,

    /// 첫 RTT 샘플 전 RTO (밀리초)
    pub initial_rto_ms: u64,

    /// RTO 하한 (밀리초)
    pub min_rto_ms: u64,

    /// RTO 상한 (밀리초)
    pub max_rto_ms: u64,

    /// 재생 데드라인을 모를 때 요청 수명 (밀리초)
    pub default_request_lifetime_ms: u64,

    /// 재생 데드라인 기반 요청 수명/스킵 활성화
    pub deadline_aware_requests: bool,

    /// 세션 이벤트 채널 크기
    pub event_channel_capacity: usize,

    /// 재생 프레임 채널 크기
    pub frame_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_rate: DEFAULT_SAMPLING_RATE,
            frames_per_segment: DEFAULT_FRAMES_PER_SEGMENT,
            samples_per_frame: SAMPLES_PER_ADTS_FRAME,
            jitter_buffer_frames: 5,
            tick_interval_ms: 50,              // 50ms
            max_cwnd: DEFAULT_MAX_CWND,
            initial_rto_ms: 1000,              // 1초
            min_rto_ms: 200,                   // 200ms
            max_rto_ms: 60_000,                // 60초
            default_request_lifetime_ms: 4000, // 4초
            deadline_aware_requests: true,
            event_channel_capacity: 1024,
            frame_channel_capacity: 1024,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 스트림 파라미터로 설정 생성
    pub fn for_stream(sampling_rate: u32, frames_per_segment: u64, jitter_buffer_frames: u64) -> Self {
        Self {
            sampling_rate,
            frames_per_segment,
            jitter_buffer_frames,
            ..Self::default()
        }
    }

    /// 저지연 설정 (얕은 지터 버퍼, 빠른 틱)
    pub fn low_latency() -> Self {
        Self {
            jitter_buffer_frames: 2,
            tick_interval_ms: 20,
            max_cwnd: 32,
            initial_rto_ms: 500,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            jitter_buffer_frames: 20,
            tick_interval_ms: 100,
            max_cwnd: 64,
            initial_rto_ms: 2000,
            max_rto_ms: 30_000,
            ..Self::default()
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.sampling_rate == 0 {
            return Err(Error::InvalidConfig("sampling_rate must be positive".into()));
        }
        if self.frames_per_segment == 0 {
            return Err(Error::InvalidConfig("frames_per_segment must be positive".into()));
        }
        if self.samples_per_frame == 0 {
            return Err(Error::InvalidConfig("samples_per_frame must be positive".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick_interval_ms must be positive".into()));
        }
        if self.max_cwnd == 0 {
            return Err(Error::InvalidConfig("max_cwnd must be positive".into()));
        }
        if self.min_rto_ms == 0 || self.min_rto_ms > self.max_rto_ms {
            return Err(Error::InvalidConfig(format!(
                "rto bounds out of order: min={} max={}",
                self.min_rto_ms, self.max_rto_ms
            )));
        }
        if self.ms_per_segment() == 0 {
            return Err(Error::InvalidConfig(
                "segment duration rounds down to 0ms".into(),
            ));
        }
        Ok(())
    }

    /// 세그먼트 하나의 생산 주기 (밀리초, 정수 나눗셈)
    ///
    /// `frames_per_segment * samples_per_frame * 1000 / sampling_rate`
    pub fn ms_per_segment(&self) -> u64 {
        (self.frames_per_segment * self.samples_per_frame * 1000) / self.sampling_rate as u64
    }

    /// 프레임 하나의 재생 시간
    pub fn frame_period(&self) -> Duration {
        Duration::from_micros(self.samples_per_frame * 1_000_000 / self.sampling_rate as u64)
    }

    /// 초기 지터 버퍼 지연
    pub fn jitter_delay(&self) -> Duration {
        Duration::from_micros(
            self.jitter_buffer_frames * self.samples_per_frame * 1_000_000
                / self.sampling_rate as u64,
        )
    }

    /// 틱 주기
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn default_request_lifetime(&self) -> Duration {
        Duration::from_millis(self.default_request_lifetime_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_math() {
        let config = Config::for_stream(8000, 10, 0);
        assert_eq!(config.ms_per_segment(), 1280);
        assert_eq!(config.frame_period(), Duration::from_millis(128));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_jitter_delay() {
        let config = Config::for_stream(8000, 10, 3);
        assert_eq!(config.jitter_delay(), Duration::from_millis(384));
    }

    #[test]
    fn test_invalid_config() {
        let mut config = Config::default();
        config.sampling_rate = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.min_rto_ms = 5000;
        config.max_rto_ms = 1000;
        assert!(config.validate().is_err());

        // 1 프레임 * 1 샘플 / 48kHz -> 0ms
        let mut config = Config::for_stream(48_000, 1, 0);
        config.samples_per_frame = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(Config::low_latency().validate().is_ok());
        assert!(Config::unstable_network().validate().is_ok());
    }
}
