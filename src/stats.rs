//! 세션 통계

use std::time::{Duration, Instant};

/// 페치 스케줄러 카운터
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchCounters {
    /// 수신한 오디오 세그먼트 수
    pub segments_fetched: u64,

    /// 수신한 스트림 종료 NACK 수
    pub nacks_fetched: u64,

    /// 전송한 요청 수 (재전송 포함)
    pub requests_transmitted: u64,

    /// 재전송 수
    pub retransmissions: u64,

    /// RTO 만료 수
    pub timeouts: u64,

    /// 재생 데드라인 때문에 보내지 않은 요청 수
    pub requests_skipped: u64,

    /// 미해결 요청이 없는 세그먼트의 응답 (중복, 생략된 재전송 뒤 도착)
    pub unmatched_responses: u64,
}

/// 재생 버퍼 카운터
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackCounters {
    /// 버퍼에 들어간 프레임 수
    pub frames_buffered: u64,

    pub frames_played: u64,

    /// 데드라인까지 도착하지 않은 프레임 수
    pub frames_skipped: u64,

    /// 데드라인이 지난 뒤 도착해서 버린 프레임 수
    pub frames_late: u64,

    /// 프레임 분할에 실패해 거부한 세그먼트 수
    pub segments_rejected: u64,
}

/// 세션 전체 통계 스냅샷
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// 시작 시간
    pub start_time: Instant,

    pub fetch: FetchCounters,
    pub playback: PlaybackCounters,

    /// 현재 RTO
    pub rto: Duration,

    /// 평활 RTT (샘플 전에는 None)
    pub srtt: Option<Duration>,

    /// 현재 미해결 요청 수
    pub outstanding: usize,
}

impl SessionStats {
    pub fn new(rto: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            fetch: FetchCounters::default(),
            playback: PlaybackCounters::default(),
            rto,
            srtt: None,
            outstanding: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 요청 손실률 (RTO 만료 / 전송)
    pub fn loss_rate(&self) -> f64 {
        if self.fetch.requests_transmitted == 0 {
            return 0.0;
        }
        self.fetch.timeouts as f64 / self.fetch.requests_transmitted as f64
    }

    /// 재생 완료율 (재생 / (재생 + 스킵))
    pub fn play_ratio(&self) -> f64 {
        let total = self.playback.frames_played + self.playback.frames_skipped;
        if total == 0 {
            return 0.0;
        }
        self.playback.frames_played as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let srtt = self
            .srtt
            .map(|d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
            .unwrap_or_else(|| "-".into());

        format!(
            "Elapsed: {:.2}s | Segments: {} (+{} NACK) | Requests: {} (retx {}, skip {}) | Loss: {:.2}% | Frames: {} played, {} skipped ({:.1}%) | RTO: {}ms | SRTT: {}",
            self.elapsed().as_secs_f64(),
            self.fetch.segments_fetched,
            self.fetch.nacks_fetched,
            self.fetch.requests_transmitted,
            self.fetch.retransmissions,
            self.fetch.requests_skipped,
            self.loss_rate() * 100.0,
            self.playback.frames_played,
            self.playback.frames_skipped,
            self.play_ratio() * 100.0,
            self.rto.as_millis(),
            srtt,
        )
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}
