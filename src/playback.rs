//! 재생 버퍼 (지터 버퍼)
//!
//! - 세그먼트 페이로드를 프레임으로 분할해 프레임 번호 순으로 보관
//! - 재생 커서가 데드라인마다 한 프레임씩 전진하며 프레임을 내보냄
//! - 데드라인까지 없던 프레임은 스킵, 데드라인 지나 도착한 프레임은 버림
//! - 프레임 수가 `frames_per_segment`보다 적은 세그먼트 = 스트림의 마지막 세그먼트

use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::context::StreamContext;
use crate::frame::{self, FrameNumber};
use crate::message::SegmentNumber;
use crate::session::{SessionEventKind, TickOutput};
use crate::stats::PlaybackCounters;
use crate::Result;

/// 렌더러로 넘기는 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub frame_number: FrameNumber,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct PlaybackBuffer {
    /// 도착했지만 아직 재생되지 않은 프레임
    frames: BTreeMap<FrameNumber, Bytes>,

    /// 스트림 끝 (마지막 프레임 번호 + 1)
    end_frame: Option<FrameNumber>,

    /// 다음에 재생할 프레임
    next_frame: FrameNumber,

    buffering_complete: bool,
    complete: bool,
    counters: PlaybackCounters,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            end_frame: None,
            next_frame: 0,
            buffering_complete: false,
            complete: false,
            counters: PlaybackCounters::default(),
        }
    }

    pub fn next_frame(&self) -> FrameNumber {
        self.next_frame
    }

    /// 알려진 마지막 프레임 번호
    pub fn final_frame(&self) -> Option<FrameNumber> {
        self.end_frame.and_then(|end| end.checked_sub(1))
    }

    pub fn buffered(&self) -> usize {
        self.frames.len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn counters(&self) -> &PlaybackCounters {
        &self.counters
    }

    /// 세그먼트 페이로드 추가. 버퍼에 들어간 프레임 수를 반환.
    ///
    /// 프레임 분할에 실패하면 세그먼트 전체를 거부한다.
    pub fn push_segment(
        &mut self,
        segment: SegmentNumber,
        data: Bytes,
        ctx: &StreamContext,
        out: &mut TickOutput,
    ) -> Result<usize> {
        if self.complete {
            return Ok(0);
        }

        let frames = match frame::split_all(data) {
            Ok(frames) => frames,
            Err(e) => {
                self.counters.segments_rejected += 1;
                return Err(e);
            }
        };

        let frames_per_segment = ctx.frames_per_segment();
        let first = ctx.first_frame_of(segment);
        let count = frames.len() as u64;

        if count < frames_per_segment {
            match ctx.final_block_id() {
                // 알려진 최종 블록 앞의 짧은 세그먼트로는 스트림을 자르지 않는다
                Some(final_id) if segment < final_id => {
                    warn!(
                        "최종 블록 {} 이전의 짧은 세그먼트: segment={}, {} frames",
                        final_id, segment, count
                    );
                }
                _ => {
                    self.narrow_end(first + count, out);
                    info!(
                        "스트림 끝 감지: segment={}, {} frames (final frame {:?})",
                        segment,
                        count,
                        self.final_frame()
                    );
                }
            }
        }

        let mut inserted = 0;
        for (i, data) in frames.into_iter().enumerate() {
            let frame_number = first + i as u64;

            if matches!(self.end_frame, Some(end) if frame_number >= end) {
                break;
            }
            if frame_number < self.next_frame {
                self.counters.frames_late += 1;
                continue;
            }
            if self.frames.insert(frame_number, data).is_none() {
                self.counters.frames_buffered += 1;
                inserted += 1;
            }
        }

        debug!(
            "세그먼트 {} -> 프레임 {}개 버퍼링 (buffered {}, next {})",
            segment,
            inserted,
            self.frames.len(),
            self.next_frame
        );
        Ok(inserted)
    }

    /// 스트림 끝을 앞당긴다 (더 큰 값은 무시)
    fn narrow_end(&mut self, end: FrameNumber, out: &mut TickOutput) {
        if matches!(self.end_frame, Some(current) if current <= end) {
            return;
        }
        self.end_frame = Some(end);
        self.frames.retain(|&frame_number, _| frame_number < end);

        if let Some(frame_number) = end.checked_sub(1) {
            out.events.push(SessionEventKind::FinalFrameLearned { frame_number });
        }
    }

    /// 주기 작업
    ///
    /// 데드라인이 지난 프레임을 순서대로 내보내고, 끝에 도달하면 `PlaybackComplete`.
    pub fn tick(&mut self, now: Instant, ctx: &StreamContext, out: &mut TickOutput) {
        if self.complete {
            return;
        }

        // 짧은 세그먼트를 못 봤으면 최종 블록 ID로 끝을 정한다
        if self.end_frame.is_none() {
            if let Some(final_id) = ctx.final_block_id() {
                self.narrow_end(ctx.first_frame_of(final_id + 1), out);
            }
        }

        while let Some(deadline) = ctx.frame_deadline(self.next_frame) {
            if self.reached_end() || now < deadline {
                break;
            }

            if !self.buffering_complete {
                self.buffering_complete = true;
                out.events.push(SessionEventKind::BufferingComplete);
                info!("버퍼링 완료, 재생 시작 (buffered {})", self.frames.len());
            }

            let frame_number = self.next_frame;
            match self.frames.remove(&frame_number) {
                Some(data) => {
                    self.counters.frames_played += 1;
                    out.events.push(SessionEventKind::FramePlayed { frame_number });
                    out.frames.push(AudioFrame { frame_number, data });
                }
                None => {
                    self.counters.frames_skipped += 1;
                    out.events.push(SessionEventKind::FrameSkipped { frame_number });
                    debug!("프레임 {} 스킵 (데드라인까지 미도착)", frame_number);
                }
            }
            self.next_frame += 1;
        }

        if self.reached_end() {
            self.complete = true;
            out.events.push(SessionEventKind::PlaybackComplete);
            info!(
                "재생 완료: {} played, {} skipped",
                self.counters.frames_played, self.counters.frames_skipped
            );
        }
    }

    fn reached_end(&self) -> bool {
        matches!(self.end_frame, Some(end) if self.next_frame >= end)
    }

    /// 버퍼 비우기 (세션 종료)
    pub fn clear(&mut self) {
        self.frames.clear();
        self.complete = true;
    }
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::new()
    }
}
