//! 스트림 공유 컨텍스트
//!
//! 페치 스케줄러와 재생 버퍼가 서로를 직접 참조하지 않도록, 두 컴포넌트가
//! 공유하는 값(최종 블록 ID, 재생 데드라인 계산)을 세션이 소유하고 빌려준다.
//! - 최종 블록 ID: 페치 스케줄러가 기록, 재생 버퍼가 조회
//! - 재생 시작 시각: 재생 버퍼가 기록, 페치 스케줄러가 데드라인 조회

use std::time::{Duration, Instant};

use tracing::warn;

use crate::frame::FrameNumber;
use crate::message::SegmentNumber;
use crate::Config;

/// 최종 블록 ID 갱신 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalBlockUpdate {
    /// 처음 알게 되었거나 더 큰 값으로 갱신
    Learned(SegmentNumber),
    /// 기존 값과 동일
    Unchanged,
    /// 기존 값보다 작아서 무시됨
    Rejected { current: SegmentNumber, offered: SegmentNumber },
}

#[derive(Debug, Clone)]
pub struct StreamContext {
    final_block_id: Option<SegmentNumber>,
    play_start: Option<Instant>,
    jitter_delay: Duration,
    samples_per_frame: u64,
    sampling_rate: u64,
    frames_per_segment: u64,
}

impl StreamContext {
    pub fn new(config: &Config) -> Self {
        Self {
            final_block_id: None,
            play_start: None,
            jitter_delay: config.jitter_delay(),
            samples_per_frame: config.samples_per_frame,
            sampling_rate: config.sampling_rate as u64,
            frames_per_segment: config.frames_per_segment,
        }
    }

    pub fn final_block_id(&self) -> Option<SegmentNumber> {
        self.final_block_id
    }

    /// 최종 블록 ID 기록. 한번 알려진 값은 절대 줄어들지 않는다.
    pub fn learn_final_block_id(&mut self, id: SegmentNumber) -> FinalBlockUpdate {
        match self.final_block_id {
            None => {
                self.final_block_id = Some(id);
                FinalBlockUpdate::Learned(id)
            }
            Some(current) if id > current => {
                self.final_block_id = Some(id);
                FinalBlockUpdate::Learned(id)
            }
            Some(current) if id == current => FinalBlockUpdate::Unchanged,
            Some(current) => {
                warn!(
                    "최종 블록 ID 역행 무시: current={}, offered={}",
                    current, id
                );
                FinalBlockUpdate::Rejected {
                    current,
                    offered: id,
                }
            }
        }
    }

    /// 세그먼트 번호가 알려진 최종 블록 ID를 넘는지
    pub fn is_beyond_final(&self, segment: SegmentNumber) -> bool {
        matches!(self.final_block_id, Some(id) if segment > id)
    }

    pub fn start_playback(&mut self, at: Instant) {
        if self.play_start.is_none() {
            self.play_start = Some(at);
        }
    }

    pub fn play_start(&self) -> Option<Instant> {
        self.play_start
    }

    pub fn frames_per_segment(&self) -> u64 {
        self.frames_per_segment
    }

    /// 세그먼트의 첫 프레임 번호
    pub fn first_frame_of(&self, segment: SegmentNumber) -> FrameNumber {
        segment * self.frames_per_segment
    }

    /// 스트림 시작부터 해당 프레임까지의 재생 오프셋
    pub fn frame_offset(&self, frame: FrameNumber) -> Duration {
        let micros = (frame as u128 * self.samples_per_frame as u128 * 1_000_000)
            / self.sampling_rate as u128;
        Duration::from_micros(micros as u64)
    }

    /// 프레임의 재생 데드라인
    ///
    /// `play_start + jitter_delay + frame * samples_per_frame / sampling_rate`.
    /// 재생이 시작되지 않았으면 None.
    pub fn frame_deadline(&self, frame: FrameNumber) -> Option<Instant> {
        self.play_start
            .map(|start| start + self.jitter_delay + self.frame_offset(frame))
    }

    /// 모든 값 초기화 (세션 종료 시)
    pub fn clear(&mut self) {
        self.final_block_id = None;
        self.play_start = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_block_id_monotonic() {
        let mut ctx = StreamContext::new(&Config::default());
        assert_eq!(ctx.final_block_id(), None);
        assert!(!ctx.is_beyond_final(1_000));

        assert_eq!(ctx.learn_final_block_id(4), FinalBlockUpdate::Learned(4));
        assert_eq!(ctx.learn_final_block_id(4), FinalBlockUpdate::Unchanged);
        assert_eq!(
            ctx.learn_final_block_id(2),
            FinalBlockUpdate::Rejected { current: 4, offered: 2 }
        );
        assert_eq!(ctx.final_block_id(), Some(4));
        assert_eq!(ctx.learn_final_block_id(6), FinalBlockUpdate::Learned(6));

        assert!(!ctx.is_beyond_final(6));
        assert!(ctx.is_beyond_final(7));
    }

    #[test]
    fn test_deadline_unknown_before_play() {
        let ctx = StreamContext::new(&Config::default());
        assert!(ctx.frame_deadline(0).is_none());
    }

    #[test]
    fn test_deadline_formula() {
        // 8kHz, 1024 샘플/프레임 -> 128ms/프레임, 지터 2프레임 -> 256ms
        let config = Config::for_stream(8000, 10, 2);
        let mut ctx = StreamContext::new(&config);
        let t0 = Instant::now();
        ctx.start_playback(t0);

        assert_eq!(ctx.frame_deadline(0), Some(t0 + Duration::from_millis(256)));
        assert_eq!(
            ctx.frame_deadline(10),
            Some(t0 + Duration::from_millis(256 + 1280))
        );

        // 두번째 시작 요청은 무시
        ctx.start_playback(t0 + Duration::from_secs(5));
        assert_eq!(ctx.play_start(), Some(t0));
    }
}
