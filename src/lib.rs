//! # PSA (Pull Stream Audio)
//!
//! 이름 기반 풀(pull) 네트워크 위의 실시간 오디오 수신 엔진
//!
//! ## 핵심 특징
//! - **생산 속도 페이싱**: 샘플링 레이트로 계산한 세그먼트 생산 주기에 맞춰 요청
//! - **적응형 RTO**: 동시 미해결 요청 수를 반영한 SRTT/RTTVAR 추정
//! - **혼잡 윈도우**: 교체 가능한 정책 (기본 고정 크기)
//! - **지터 버퍼**: 프레임 단위 재생 데드라인, 늦을 요청은 미리 생략
//! - **단일 틱 루프**: 세션 하나당 태스크 하나, 네트워크 이벤트와 틱을 직렬화

pub mod config;
pub mod context;
pub mod cwnd;
pub mod error;
pub mod fetcher;
pub mod frame;
pub mod message;
pub mod network;
pub mod playback;
pub mod rtt;
pub mod session;
pub mod stats;

pub use config::Config;
pub use context::StreamContext;
pub use cwnd::{CongestionWindow, FixedWindow};
pub use error::{Error, Result};
pub use fetcher::{FetchScheduler, FetchState};
pub use frame::FrameNumber;
pub use message::{ResponseContent, SegmentNumber, SegmentRequest, SegmentResponse, StreamName};
pub use network::{Network, NetworkEvent, UdpNetwork};
pub use playback::{AudioFrame, PlaybackBuffer};
pub use rtt::RttEstimator;
pub use session::{SessionCore, SessionEvent, SessionEventKind, StreamSession};
pub use stats::SessionStats;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u32 = 0x50534150; // "PSAP"

/// AAC ADTS 프레임당 샘플 수
pub const SAMPLES_PER_ADTS_FRAME: u64 = 1024;

/// 기본 샘플링 레이트 (Hz)
pub const DEFAULT_SAMPLING_RATE: u32 = 8000;

/// 기본 세그먼트당 프레임 수
pub const DEFAULT_FRAMES_PER_SEGMENT: u64 = 10;

/// 기본 최대 동시 요청 수
pub const DEFAULT_MAX_CWND: usize = 50;
