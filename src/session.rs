//! 스트림 세션
//!
//! 페치 스케줄러, 재생 버퍼, 공유 컨텍스트, 네트워크를 소유하고 틱 하나로 구동한다.
//!
//! - [`SessionCore`]: 동기 상태 머신. 시간(`Instant`)을 인자로 받아 결정적으로 동작
//! - [`StreamSession`]: tokio 태스크 하나에서 명령, 네트워크 이벤트, 틱 타이머를
//!   `select!`로 직렬화해 `SessionCore`를 돌리는 핸들
//!
//! 틱 순서: 네트워크 이벤트 → 페치 스케줄러 → 재생 버퍼

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::context::StreamContext;
use crate::fetcher::{Delivery, FetchScheduler, FetchState};
use crate::frame::FrameNumber;
use crate::message::{SegmentNumber, StreamName};
use crate::network::{Network, NetworkEvent, NetworkEventReceiver};
use crate::playback::{AudioFrame, PlaybackBuffer};
use crate::stats::SessionStats;
use crate::{Config, Error, Result};

/// 세션 이벤트 종류
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
    /// 페치 시작
    Started,
    /// 생산 속도에 맞춰 새 세그먼트 요청
    ProductionWindowGrow { highest_segment: SegmentNumber },
    /// 재생 데드라인 때문에 요청 생략
    InterestSkipped { segment: SegmentNumber },
    /// RTO 만료
    RequestTimedOut { segment: SegmentNumber },
    AudioRetrieved { segment: SegmentNumber },
    NackRetrieved { segment: SegmentNumber },
    FinalBlockIdLearned { final_block_id: SegmentNumber },
    /// 모든 세그먼트 해결
    FetchComplete,
    FinalFrameLearned { frame_number: FrameNumber },
    /// 첫 프레임 데드라인 도달
    BufferingComplete,
    FramePlayed { frame_number: FrameNumber },
    FrameSkipped { frame_number: FrameNumber },
    /// 마지막 프레임 데드라인 도달
    PlaybackComplete,
    /// 세션 종료. 비정상 종료면 사유 포함.
    Closed { reason: Option<String> },
}

/// 스트림 이름이 붙은 세션 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub stream: StreamName,
    pub kind: SessionEventKind,
}

/// 한 번의 처리에서 나온 이벤트와 재생 프레임
#[derive(Debug, Default)]
pub struct TickOutput {
    pub events: Vec<SessionEventKind>,
    pub frames: Vec<AudioFrame>,
}

impl TickOutput {
    pub fn append(&mut self, mut other: TickOutput) {
        self.events.append(&mut other.events);
        self.frames.append(&mut other.frames);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.frames.is_empty()
    }
}

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Closed,
}

/// 세션 상태 머신 (단일 소유자에서만 접근)
pub struct SessionCore {
    name: StreamName,
    state: SessionState,
    ctx: StreamContext,
    fetcher: FetchScheduler,
    buffer: PlaybackBuffer,
    network: Box<dyn Network>,
    stats_start: Instant,
}

impl SessionCore {
    pub fn new(config: &Config, name: StreamName, network: Box<dyn Network>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx: StreamContext::new(config),
            fetcher: FetchScheduler::new(config, name.clone()),
            buffer: PlaybackBuffer::new(),
            name,
            state: SessionState::Created,
            network,
            stats_start: Instant::now(),
        })
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn fetch_state(&self) -> FetchState {
        self.fetcher.state()
    }

    /// 페치와 재생 시계를 함께 시작하고 첫 틱 실행
    pub fn start(&mut self, now: Instant) -> Result<TickOutput> {
        match self.state {
            SessionState::Closed => return Err(Error::SessionClosed),
            SessionState::Running => return Err(Error::AlreadyStarted),
            SessionState::Created => {}
        }

        self.fetcher.start(now)?;
        self.ctx.start_playback(now);
        self.state = SessionState::Running;
        self.stats_start = now;
        info!("세션 시작: {}", self.name);

        let mut out = TickOutput::default();
        out.events.push(SessionEventKind::Started);
        out.append(self.tick(now));
        Ok(out)
    }

    /// 네트워크 이벤트 처리
    pub fn on_network_event(&mut self, event: NetworkEvent, now: Instant) -> TickOutput {
        let mut out = TickOutput::default();

        match event {
            NetworkEvent::Response(response) => {
                if self.state != SessionState::Running {
                    debug!(
                        "세션 비활성 상태 응답 무시: {} segment={}",
                        response.name, response.segment
                    );
                    return out;
                }

                match self
                    .fetcher
                    .on_response(response, now, &mut self.ctx, &mut out)
                {
                    Ok(Delivery::Audio { segment, data }) => {
                        if let Err(e) = self.buffer.push_segment(segment, data, &self.ctx, &mut out) {
                            warn!("세그먼트 {} 거부: {}", segment, e);
                        }
                    }
                    Ok(Delivery::EndOfStream { .. }) | Ok(Delivery::Dropped) => {}
                    Err(e) => self.abort(e, &mut out),
                }
            }
            NetworkEvent::Timeout { name, segment } => {
                if name == self.name {
                    self.fetcher.on_request_expired(segment, now);
                }
            }
        }

        out
    }

    /// 주기 작업: 페치 스케줄러 → 재생 버퍼
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        let mut out = TickOutput::default();
        if self.state != SessionState::Running {
            return out;
        }

        if let Err(e) = self
            .fetcher
            .tick(now, &self.ctx, self.network.as_mut(), &mut out)
        {
            self.abort(e, &mut out);
            return out;
        }

        self.buffer.tick(now, &self.ctx, &mut out);

        if self.buffer.is_complete() {
            out.append(self.close(None));
        }
        out
    }

    /// 세션 종료. 두번째 호출부터는 아무 일도 하지 않는다.
    pub fn close(&mut self, reason: Option<String>) -> TickOutput {
        let mut out = TickOutput::default();
        if self.state == SessionState::Closed {
            return out;
        }

        self.state = SessionState::Closed;
        self.fetcher.clear();
        self.buffer.clear();
        self.ctx.clear();

        match &reason {
            Some(r) => error!("세션 비정상 종료: {} ({})", self.name, r),
            None => info!("세션 종료: {}", self.name),
        }
        out.events.push(SessionEventKind::Closed { reason });
        out
    }

    fn abort(&mut self, err: Error, out: &mut TickOutput) {
        if !err.is_invariant_violation() {
            warn!("세션 처리 에러: {}", err);
        }
        out.append(self.close(Some(err.to_string())));
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            start_time: self.stats_start,
            fetch: self.fetcher.counters().clone(),
            playback: self.buffer.counters().clone(),
            rto: self.fetcher.rtt().estimated_rto(),
            srtt: self.fetcher.rtt().smoothed_rtt(),
            outstanding: self.fetcher.outstanding(),
        }
    }
}

/// 세션 이벤트 채널 수신기 타입
pub type SessionEventReceiver = mpsc::Receiver<SessionEvent>;

/// 재생 프레임 채널 수신기 타입
pub type FrameReceiver = mpsc::Receiver<AudioFrame>;

/// 내부 명령
enum SessionCmd {
    Start,
    Close,
}

/// 세션 핸들 (외부에서 제어용)
pub struct StreamSession {
    name: StreamName,
    cmd_tx: mpsc::Sender<SessionCmd>,
    stats: Arc<RwLock<SessionStats>>,
    running: Arc<AtomicBool>,
}

impl StreamSession {
    /// 세션 태스크 생성. `start()` 전까지는 틱만 돈다.
    ///
    /// tokio 런타임 안에서 호출해야 한다.
    pub fn spawn<N>(
        config: Config,
        name: StreamName,
        network: N,
        mut net_rx: NetworkEventReceiver,
    ) -> Result<(Self, SessionEventReceiver, FrameReceiver)>
    where
        N: Network + 'static,
    {
        let mut core = SessionCore::new(&config, name.clone(), Box::new(network))?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCmd>(16);
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(config.event_channel_capacity);
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(config.frame_channel_capacity);

        let stats = Arc::new(RwLock::new(core.stats()));
        let running = Arc::new(AtomicBool::new(true));

        let stats_main = stats.clone();
        let running_main = running.clone();
        let stream = name.clone();
        let tick_interval = config.tick_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let out = tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(SessionCmd::Start) => match core.start(Instant::now()) {
                            Ok(out) => out,
                            Err(e) => {
                                warn!("세션 시작 실패: {}", e);
                                TickOutput::default()
                            }
                        },
                        Some(SessionCmd::Close) | None => core.close(None),
                    },
                    Some(event) = net_rx.recv() => core.on_network_event(event, Instant::now()),
                    _ = ticker.tick() => core.tick(Instant::now()),
                };

                dispatch(&stream, out, &event_tx, &frame_tx);

                // 통계 업데이트
                *stats_main.write() = core.stats();

                if core.is_closed() {
                    break;
                }
            }

            running_main.store(false, Ordering::SeqCst);
        });

        Ok((
            Self {
                name,
                cmd_tx,
                stats,
                running,
            },
            event_rx,
            frame_rx,
        ))
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    /// 페치 시작
    pub async fn start(&self) -> Result<()> {
        self.cmd_tx
            .send(SessionCmd::Start)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// 세션 종료 (이미 종료됐으면 무시)
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(SessionCmd::Close).await;
    }

    /// 통계 반환
    pub fn stats(&self) -> SessionStats {
        self.stats.read().clone()
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 틱 결과를 채널로 전달. 틱을 막지 않도록 가득 차면 버린다.
fn dispatch(
    stream: &StreamName,
    out: TickOutput,
    event_tx: &mpsc::Sender<SessionEvent>,
    frame_tx: &mpsc::Sender<AudioFrame>,
) {
    for frame in out.frames {
        if let Err(mpsc::error::TrySendError::Full(f)) = frame_tx.try_send(frame) {
            warn!("프레임 채널 가득 참, 프레임 {} 버림", f.frame_number);
        }
    }

    for kind in out.events {
        let event = SessionEvent {
            stream: stream.clone(),
            kind,
        };
        if let Err(mpsc::error::TrySendError::Full(e)) = event_tx.try_send(event) {
            warn!("이벤트 채널 가득 참, 버림: {:?}", e.kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::{BufMut, Bytes, BytesMut};
    use parking_lot::Mutex;

    use super::*;
    use crate::frame;
    use crate::message::{SegmentRequest, SegmentResponse};

    fn name() -> StreamName {
        StreamName::parse("/test/session").unwrap()
    }

    /// 프레임 수 목록으로 세그먼트 페이로드 생성
    fn stream_segments(frame_counts: &[u64]) -> Vec<Bytes> {
        let mut next = 0u8;
        frame_counts
            .iter()
            .map(|&count| {
                let mut buf = BytesMut::new();
                for _ in 0..count {
                    buf.put_slice(&frame::build_frame(&[next, 1, 2, 3], 8000).unwrap());
                    next += 1;
                }
                buf.freeze()
            })
            .collect()
    }

    /// 세그먼트 요청에 대한 생산자 응답
    fn produce(segments: &[Bytes], segment: SegmentNumber) -> SegmentResponse {
        let last = segments.len() as u64 - 1;
        match segments.get(segment as usize) {
            Some(data) if segment == last => {
                SegmentResponse::content(name(), segment, data.clone()).with_final_block_id(last)
            }
            Some(data) => SegmentResponse::content(name(), segment, data.clone()),
            None => SegmentResponse::end_of_stream(name(), segment, last),
        }
    }

    #[derive(Clone, Default)]
    struct SharedNetwork(Arc<Mutex<Vec<SegmentRequest>>>);

    impl Network for SharedNetwork {
        fn send_request(&mut self, request: SegmentRequest) {
            self.0.lock().push(request);
        }
    }

    /// 요청을 받자마자 응답하는 네트워크
    struct InstantNetwork {
        segments: Vec<Bytes>,
        tx: mpsc::Sender<NetworkEvent>,
    }

    impl Network for InstantNetwork {
        fn send_request(&mut self, request: SegmentRequest) {
            let response = produce(&self.segments, request.segment);
            let _ = self.tx.try_send(NetworkEvent::Response(response));
        }
    }

    /// 8kHz, 2 프레임/세그먼트 (256ms), 지터 4 프레임 (512ms)
    fn test_config() -> Config {
        let mut config = Config::for_stream(8000, 2, 4);
        config.initial_rto_ms = 200;
        config.tick_interval_ms = 20;
        config
    }

    #[test]
    fn test_full_stream_in_simulated_time() {
        let config = test_config();
        let segments = stream_segments(&[2, 2, 1]);
        let net = SharedNetwork::default();
        let mut core = SessionCore::new(&config, name(), Box::new(net.clone())).unwrap();

        let t0 = Instant::now();
        let mut out = core.start(t0).unwrap();

        let mut now = t0;
        while !core.is_closed() && now < t0 + Duration::from_secs(5) {
            let requests: Vec<SegmentRequest> = net.0.lock().drain(..).collect();
            for request in requests {
                let response = produce(&segments, request.segment);
                out.append(core.on_network_event(NetworkEvent::Response(response), now));
            }
            now += Duration::from_millis(20);
            out.append(core.tick(now));
        }

        assert!(core.is_closed());
        let played: Vec<FrameNumber> = out.frames.iter().map(|f| f.frame_number).collect();
        assert_eq!(played, vec![0, 1, 2, 3, 4]);

        assert_eq!(out.events.first(), Some(&SessionEventKind::Started));
        assert_eq!(out.events.last(), Some(&SessionEventKind::Closed { reason: None }));

        let pos = |kind: &SessionEventKind| out.events.iter().position(|e| e == kind).unwrap();
        assert!(pos(&SessionEventKind::FetchComplete) < pos(&SessionEventKind::PlaybackComplete));
        assert!(out
            .events
            .contains(&SessionEventKind::FinalFrameLearned { frame_number: 4 }));

        let stats = core.stats();
        assert_eq!(stats.fetch.segments_fetched, 3);
        assert_eq!(stats.playback.frames_played, 5);
        assert_eq!(stats.playback.frames_skipped, 0);
    }

    #[test]
    fn test_slow_network_still_finishes() {
        // 모든 응답이 요청 1500ms 뒤 도착: 초기 RTO(1s)보다 늦어 재전송은 모두 생략된다
        let config = Config::default();
        let segments = stream_segments(&[10, 10, 3]);
        let net = SharedNetwork::default();
        let mut core = SessionCore::new(&config, name(), Box::new(net.clone())).unwrap();

        let t0 = Instant::now();
        let mut out = core.start(t0).unwrap();
        let delay = Duration::from_millis(1500);

        let mut in_flight: Vec<(Instant, SegmentNumber)> = Vec::new();
        let mut now = t0;
        while !core.is_closed() && now < t0 + Duration::from_secs(120) {
            in_flight.extend(net.0.lock().drain(..).map(|r| (now + delay, r.segment)));

            let (due, pending): (Vec<_>, Vec<_>) = in_flight.into_iter().partition(|(at, _)| *at <= now);
            in_flight = pending;
            for (_, segment) in due {
                let response = produce(&segments, segment);
                out.append(core.on_network_event(NetworkEvent::Response(response), now));
            }

            now += Duration::from_millis(20);
            out.append(core.tick(now));
        }

        assert!(core.is_closed());
        assert_eq!(out.events.last(), Some(&SessionEventKind::Closed { reason: None }));
        assert!(out
            .events
            .contains(&SessionEventKind::FinalBlockIdLearned { final_block_id: 2 }));
        assert!(out.events.contains(&SessionEventKind::FetchComplete));
        assert!(out.events.contains(&SessionEventKind::PlaybackComplete));

        let stats = core.stats();
        assert!(stats.fetch.unmatched_responses > 0);
        assert!(stats.playback.frames_played > 0);
        assert!(now < t0 + Duration::from_secs(10));
    }

    #[test]
    fn test_close_is_idempotent() {
        let config = test_config();
        let mut core = SessionCore::new(&config, name(), Box::new(SharedNetwork::default())).unwrap();
        core.start(Instant::now()).unwrap();

        let first = core.close(None);
        assert_eq!(first.events, vec![SessionEventKind::Closed { reason: None }]);
        assert!(core.close(None).is_empty());
        assert!(core.tick(Instant::now()).is_empty());
        assert!(matches!(core.start(Instant::now()), Err(Error::SessionClosed)));
    }

    #[test]
    fn test_start_twice_rejected() {
        let config = test_config();
        let mut core = SessionCore::new(&config, name(), Box::new(SharedNetwork::default())).unwrap();
        core.start(Instant::now()).unwrap();
        assert!(matches!(core.start(Instant::now()), Err(Error::AlreadyStarted)));
        assert!(!core.is_closed());
    }

    #[test]
    fn test_invariant_violation_closes_with_reason() {
        let config = test_config();
        let mut core = SessionCore::new(&config, name(), Box::new(SharedNetwork::default())).unwrap();
        core.start(Instant::now()).unwrap();

        let mut out = TickOutput::default();
        core.abort(Error::OutstandingUnderflow { segment: 3 }, &mut out);
        assert!(core.is_closed());
        match out.events.as_slice() {
            [SessionEventKind::Closed { reason: Some(reason) }] => assert!(reason.contains("segment=3")),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_response_after_close_ignored() {
        let config = test_config();
        let net = SharedNetwork::default();
        let mut core = SessionCore::new(&config, name(), Box::new(net.clone())).unwrap();
        let t0 = Instant::now();
        core.start(t0).unwrap();
        core.close(None);

        let segments = stream_segments(&[2]);
        let out = core.on_network_event(NetworkEvent::Response(produce(&segments, 0)), t0);
        assert!(out.is_empty());
        assert_eq!(core.stats().fetch.segments_fetched, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.max_cwnd = 0;
        assert!(SessionCore::new(&config, name(), Box::new(SharedNetwork::default())).is_err());
    }

    #[tokio::test]
    async fn test_driver_plays_stream_to_completion() {
        let config = test_config();
        let (tx, rx) = mpsc::channel(64);
        let network = InstantNetwork {
            segments: stream_segments(&[2, 2, 1]),
            tx,
        };

        let (session, mut events, mut frames) =
            StreamSession::spawn(config, name(), network, rx).unwrap();
        session.start().await.unwrap();

        let mut kinds = Vec::new();
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                assert_eq!(event.stream, name());
                let done = matches!(event.kind, SessionEventKind::Closed { .. });
                kinds.push(event.kind);
                if done {
                    break;
                }
            }
        })
        .await;
        assert!(result.is_ok(), "session did not finish in time");

        assert_eq!(kinds.last(), Some(&SessionEventKind::Closed { reason: None }));
        assert!(kinds.contains(&SessionEventKind::FetchComplete));
        assert!(kinds.contains(&SessionEventKind::PlaybackComplete));

        let mut played = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            played.push(frame.frame_number);
        }
        assert_eq!(played, vec![0, 1, 2, 3, 4]);

        // 종료 후 close는 아무 일도 하지 않는다
        session.close().await;
        session.close().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!session.is_running());
        assert_eq!(session.stats().playback.frames_played, 5);
    }

    #[tokio::test]
    async fn test_driver_close_before_start() {
        let (_tx, rx) = mpsc::channel(4);
        let (session, mut events, _frames) =
            StreamSession::spawn(test_config(), name(), SharedNetwork::default(), rx).unwrap();

        session.close().await;
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, SessionEventKind::Closed { reason: None });

        assert!(tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .is_none());
        assert!(session.start().await.is_err());
    }
}
