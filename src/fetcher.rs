//! 페치 스케줄러
//!
//! 세그먼트 요청의 전송/재전송/종료 판정을 담당하는 상태 머신.
//!
//! ```text
//! Idle --start--> Fetching --(최종 세그먼트까지 전송)--> Draining --(모두 해결)--> Done
//! ```
//!
//! 틱마다:
//! 1. RTO가 지난 요청을 타임아웃 처리하고 재전송 큐로 이동
//! 2. 윈도우가 허용하는 만큼 재전송 (세그먼트 번호 오름차순)
//! 3. 재전송 큐와 미해결 요청이 비었고 최종 블록 ID를 알면 완료
//! 4. 생산 속도에 맞춰 다음 세그먼트 첫 전송
//!
//! 재전송한 요청은 RTT 샘플을 남기지 않는다 (Karn).

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::context::{FinalBlockUpdate, StreamContext};
use crate::cwnd::{CongestionWindow, FixedWindow};
use crate::message::{ResponseContent, SegmentNumber, SegmentRequest, SegmentResponse, StreamName};
use crate::network::Network;
use crate::rtt::RttEstimator;
use crate::session::{SessionEventKind, TickOutput};
use crate::stats::FetchCounters;
use crate::{Config, Error, Result};

/// 페치 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    /// 시작 전
    Idle,
    /// 새 세그먼트 요청 중
    Fetching,
    /// 최종 세그먼트까지 요청함, 남은 응답 대기
    Draining,
    /// 모든 세그먼트 해결됨 (또는 세션 종료)
    Done,
}

/// 응답 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// 재생 버퍼로 넘길 오디오
    Audio { segment: SegmentNumber, data: Bytes },
    /// 스트림 종료 NACK
    EndOfStream { segment: SegmentNumber },
    /// 인식하지 못한 응답 (다른 스트림, 종료 후 도착)
    Dropped,
}

pub struct FetchScheduler {
    name: StreamName,
    state: FetchState,

    window: Box<dyn CongestionWindow>,
    rtt: RttEstimator,

    /// 재전송 대기 (세그먼트 번호 오름차순)
    retx_queue: BTreeSet<SegmentNumber>,
    /// 미해결 요청의 RTO 만료 시각
    rto_deadlines: HashMap<SegmentNumber, Instant>,
    /// 첫 전송 시각 (재전송 시 제거)
    send_times: HashMap<SegmentNumber, Instant>,
    outstanding: usize,

    highest_sent: Option<SegmentNumber>,
    fetch_start: Option<Instant>,

    ms_per_segment: u64,
    deadline_aware: bool,
    default_lifetime: Duration,

    counters: FetchCounters,
}

impl FetchScheduler {
    pub fn new(config: &Config, name: StreamName) -> Self {
        Self::with_window(config, name, Box::new(FixedWindow::new(config.max_cwnd)))
    }

    /// 혼잡 윈도우 정책 지정
    pub fn with_window(config: &Config, name: StreamName, window: Box<dyn CongestionWindow>) -> Self {
        Self {
            name,
            state: FetchState::Idle,
            window,
            rtt: RttEstimator::from_config(config),
            retx_queue: BTreeSet::new(),
            rto_deadlines: HashMap::new(),
            send_times: HashMap::new(),
            outstanding: 0,
            highest_sent: None,
            fetch_start: None,
            ms_per_segment: config.ms_per_segment().max(1),
            deadline_aware: config.deadline_aware_requests,
            default_lifetime: config.default_request_lifetime(),
            counters: FetchCounters::default(),
        }
    }

    /// 페치 시작 (Idle에서만 가능)
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != FetchState::Idle {
            return Err(Error::AlreadyStarted);
        }
        self.state = FetchState::Fetching;
        self.fetch_start = Some(now);
        info!(
            "페치 시작: {} ({}ms/segment, window {})",
            self.name,
            self.ms_per_segment,
            self.window.current_window()
        );
        Ok(())
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, FetchState::Fetching | FetchState::Draining)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn highest_sent(&self) -> Option<SegmentNumber> {
        self.highest_sent
    }

    pub fn retx_queue_len(&self) -> usize {
        self.retx_queue.len()
    }

    pub fn current_window(&self) -> usize {
        self.window.current_window()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn counters(&self) -> &FetchCounters {
        &self.counters
    }

    /// 주기 작업
    pub fn tick(
        &mut self,
        now: Instant,
        ctx: &StreamContext,
        net: &mut dyn Network,
        out: &mut TickOutput,
    ) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        // 1. RTO 만료
        let mut expired: Vec<SegmentNumber> = self
            .rto_deadlines
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(segment, _)| *segment)
            .collect();
        expired.sort_unstable();

        for segment in expired {
            self.rto_deadlines.remove(&segment);
            self.send_times.remove(&segment);
            self.decrement_outstanding(segment, 1)?;
            self.window.on_timeout();
            self.counters.timeouts += 1;
            out.events.push(SessionEventKind::RequestTimedOut { segment });
            debug!("RTO 만료: segment={}, outstanding={}", segment, self.outstanding);

            if ctx.is_beyond_final(segment) {
                continue;
            }
            self.retx_queue.insert(segment);
        }

        // 2. 재전송 (가장 낮은 번호부터)
        while self.window.within_window(self.outstanding) {
            let Some(segment) = self.retx_queue.pop_first() else {
                break;
            };
            if ctx.is_beyond_final(segment) {
                continue;
            }
            if self.transmit(segment, true, now, ctx, net, out) {
                self.counters.retransmissions += 1;
            }
        }

        // 3. 완료 판정
        if let Some(final_id) = ctx.final_block_id() {
            let all_sent = self.highest_sent.map_or(false, |h| h >= final_id);
            if all_sent && self.retx_queue.is_empty() && self.outstanding == 0 {
                self.state = FetchState::Done;
                out.events.push(SessionEventKind::FetchComplete);
                info!(
                    "페치 완료: {} (final block {}, {} segments, {} NACKs)",
                    self.name, final_id, self.counters.segments_fetched, self.counters.nacks_fetched
                );
                return Ok(());
            }
        }

        // 4. 생산 속도에 맞춘 첫 전송
        loop {
            let next = self.highest_sent.map_or(0, |h| h + 1);
            if ctx.is_beyond_final(next)
                || !self.pacing_allows(next, now)
                || !self.window.within_window(self.outstanding)
            {
                break;
            }
            self.highest_sent = Some(next);
            out.events.push(SessionEventKind::ProductionWindowGrow { highest_segment: next });
            self.transmit(next, false, now, ctx, net, out);
        }

        if self.state == FetchState::Fetching {
            if let (Some(final_id), Some(highest)) = (ctx.final_block_id(), self.highest_sent) {
                if highest >= final_id {
                    debug!("모든 세그먼트 요청됨, 응답 대기: final block {}", final_id);
                    self.state = FetchState::Draining;
                }
            }
        }

        Ok(())
    }

    /// `elapsed / ms_per_segment >= segment`
    fn pacing_allows(&self, segment: SegmentNumber, now: Instant) -> bool {
        let Some(start) = self.fetch_start else {
            return false;
        };
        let elapsed_ms = now.saturating_duration_since(start).as_millis() as u64;
        elapsed_ms / self.ms_per_segment >= segment
    }

    /// 세그먼트의 마지막 프레임 재생 데드라인
    ///
    /// 응답이 이 시각까지 오면 일부 프레임이라도 재생할 수 있다.
    fn segment_deadline(&self, segment: SegmentNumber, ctx: &StreamContext) -> Option<Instant> {
        if !self.deadline_aware {
            return None;
        }
        let last_frame = ctx.first_frame_of(segment + 1).saturating_sub(1);
        ctx.frame_deadline(last_frame)
    }

    /// 요청 전송. 데드라인 안에 응답이 올 수 없으면 보내지 않고 false.
    fn transmit(
        &mut self,
        segment: SegmentNumber,
        retransmission: bool,
        now: Instant,
        ctx: &StreamContext,
        net: &mut dyn Network,
        out: &mut TickOutput,
    ) -> bool {
        let rto = self.rtt.estimated_rto();

        let lifetime = match self.segment_deadline(segment, ctx) {
            Some(deadline) if now + rto > deadline => {
                self.send_times.remove(&segment);
                self.counters.requests_skipped += 1;
                out.events.push(SessionEventKind::InterestSkipped { segment });
                debug!(
                    "데드라인 초과로 요청 생략: segment={}, rto={}ms",
                    segment,
                    rto.as_millis()
                );
                return false;
            }
            Some(deadline) => rto.min(deadline.saturating_duration_since(now)),
            None => self.default_lifetime,
        };

        self.rto_deadlines.insert(segment, now + rto);
        if retransmission {
            self.send_times.remove(&segment);
        } else {
            self.send_times.insert(segment, now);
        }
        self.outstanding += 1;
        self.counters.requests_transmitted += 1;

        net.send_request(SegmentRequest {
            name: self.name.clone(),
            segment,
            lifetime,
        });

        debug!(
            "요청 전송: segment={}, rto={}ms, lifetime={}ms, retx={}, outstanding={}",
            segment,
            rto.as_millis(),
            lifetime.as_millis(),
            retransmission,
            self.outstanding
        );
        true
    }

    /// 응답 처리
    ///
    /// 불변식 위반(RTT 측정 시 미해결 요청 0개, 카운터 언더플로우)은 `Err`로 돌려주며
    /// 세션이 즉시 종료해야 한다.
    pub fn on_response(
        &mut self,
        response: SegmentResponse,
        now: Instant,
        ctx: &mut StreamContext,
        out: &mut TickOutput,
    ) -> Result<Delivery> {
        let segment = response.segment;

        if !self.is_active() || response.name != self.name {
            debug!(
                "인식하지 못한 응답 무시: {} segment={} (state {:?})",
                response.name, segment, self.state
            );
            return Ok(Delivery::Dropped);
        }

        let in_flight = self.rto_deadlines.contains_key(&segment);
        let queued = self.retx_queue.contains(&segment);
        if !in_flight && !queued {
            // 생략/폐기된 요청의 늦은 응답 또는 중복: 미해결 수와 RTT는 그대로 두고
            // 최종 블록 ID와 오디오만 반영 (늦은 프레임은 재생 버퍼가 버린다)
            self.counters.unmatched_responses += 1;
            debug!("미해결 요청이 없는 응답: segment={}", segment);
            return self.accept_content(segment, response.content, ctx, out);
        }

        if let Some(sent_at) = self.send_times.remove(&segment) {
            let sample = now.saturating_duration_since(sent_at);
            self.rtt.add_measurement(sample, self.outstanding)?;
        }

        // 타임아웃으로 이미 감소한 요청은 다시 빼지 않는다
        let delta = if queued { 0 } else { 1 };
        self.decrement_outstanding(segment, delta)?;
        self.window.on_response();

        self.rto_deadlines.remove(&segment);
        self.retx_queue.remove(&segment);

        self.accept_content(segment, response.content, ctx, out)
    }

    /// 응답 내용 반영: 최종 블록 ID 학습, 오디오 전달
    fn accept_content(
        &mut self,
        segment: SegmentNumber,
        content: ResponseContent,
        ctx: &mut StreamContext,
        out: &mut TickOutput,
    ) -> Result<Delivery> {
        match content {
            ResponseContent::Content {
                data,
                final_block_id,
            } => {
                self.counters.segments_fetched += 1;
                out.events.push(SessionEventKind::AudioRetrieved { segment });
                debug!(
                    "오디오 수신: segment={}, {} bytes, outstanding={}",
                    segment,
                    data.len(),
                    self.outstanding
                );
                if let Some(id) = final_block_id {
                    self.learn_final_block_id(id, ctx, out)?;
                }
                Ok(Delivery::Audio { segment, data })
            }
            ResponseContent::EndOfStream { final_block_id } => {
                self.counters.nacks_fetched += 1;
                out.events.push(SessionEventKind::NackRetrieved { segment });
                debug!("NACK 수신: segment={}, final block {}", segment, final_block_id);
                self.learn_final_block_id(final_block_id, ctx, out)?;
                Ok(Delivery::EndOfStream { segment })
            }
        }
    }

    /// 요청 수명 만료 보고 (네트워크). 다음 틱에서 RTO 만료로 처리된다.
    pub fn on_request_expired(&mut self, segment: SegmentNumber, now: Instant) {
        if let Some(deadline) = self.rto_deadlines.get_mut(&segment) {
            if *deadline > now {
                *deadline = now;
            }
        }
    }

    /// 최종 블록 ID 기록. 그 너머의 요청은 버린다.
    fn learn_final_block_id(
        &mut self,
        id: SegmentNumber,
        ctx: &mut StreamContext,
        out: &mut TickOutput,
    ) -> Result<()> {
        if let FinalBlockUpdate::Learned(id) = ctx.learn_final_block_id(id) {
            out.events.push(SessionEventKind::FinalBlockIdLearned { final_block_id: id });
            info!("최종 블록 ID: {} ({})", id, self.name);

            self.retx_queue.retain(|&segment| segment <= id);

            let beyond: Vec<SegmentNumber> = self
                .rto_deadlines
                .keys()
                .copied()
                .filter(|&segment| segment > id)
                .collect();
            for segment in beyond {
                self.rto_deadlines.remove(&segment);
                self.send_times.remove(&segment);
                self.decrement_outstanding(segment, 1)?;
                debug!("최종 블록 너머 요청 폐기: segment={}", segment);
            }
        }
        Ok(())
    }

    fn decrement_outstanding(&mut self, segment: SegmentNumber, delta: usize) -> Result<()> {
        match self.outstanding.checked_sub(delta) {
            Some(v) => {
                self.outstanding = v;
                Ok(())
            }
            None => {
                error!(
                    "미해결 요청 수 언더플로우: segment={}, outstanding={}",
                    segment, self.outstanding
                );
                Err(Error::OutstandingUnderflow { segment })
            }
        }
    }

    /// 모든 타이머/큐 정리 (세션 종료)
    pub fn clear(&mut self) {
        self.retx_queue.clear();
        self.rto_deadlines.clear();
        self.send_times.clear();
        self.outstanding = 0;
        self.state = FetchState::Done;
    }
}

impl std::fmt::Debug for FetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchScheduler")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("outstanding", &self.outstanding)
            .field("highest_sent", &self.highest_sent)
            .field("retx_queue", &self.retx_queue)
            .field("window", &self.window)
            .finish()
    }
}
