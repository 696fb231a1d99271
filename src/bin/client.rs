//! PSA 클라이언트 (소비자) - Pull Stream Audio
//!
//! 스트림 세션 하나를 돌려 세그먼트를 받아오고, 재생 데드라인에 맞춰 나온
//! 프레임을 순서대로 파일에 기록한다 (렌더러 대용).
//!
//! 사용법:
//!   cargo run --release --bin psa-client -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신
//!   cargo run --release --bin psa-client -- --server 127.0.0.1:9000 --output played.aac
//!
//!   # 불안정 네트워크 프리셋
//!   cargo run --release --bin psa-client -- -s 127.0.0.1:9000 --preset unstable

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use psa::{Config, SessionEventKind, StreamName, StreamSession, UdpNetwork};

/// 클라이언트 설정
struct ClientConfig {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,
    stream_name: String,
    output_path: Option<PathBuf>,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            stream_name: "/psa/demo/audio".into(),
            output_path: None,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    config.stream_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            // 프리셋은 스트림 파라미터보다 먼저 지정
            "--preset" => {
                if i + 1 < args.len() {
                    config.config = match args[i + 1].as_str() {
                        "low-latency" => Config::low_latency(),
                        "unstable" => Config::unstable_network(),
                        _ => Config::default(),
                    };
                    i += 1;
                }
            }
            "--rate" => {
                if i + 1 < args.len() {
                    config.config.sampling_rate = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--fps" => {
                if i + 1 < args.len() {
                    config.config.frames_per_segment =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--jitter" | "-j" => {
                if i + 1 < args.len() {
                    config.config.jitter_buffer_frames =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--tick" => {
                if i + 1 < args.len() {
                    config.config.tick_interval_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--no-deadline" => {
                config.config.deadline_aware_requests = false;
            }
            "--help" | "-h" => {
                println!(
                    r#"PSA Client - Pull Stream Audio 소비자

생산 속도에 맞춰 세그먼트를 요청하고 지터 버퍼를 거쳐 프레임을 재생

사용법:
  cargo run --release --bin psa-client -- [OPTIONS]

옵션:
  -b, --bind <ADDR>      로컬 바인드 주소 (기본: 0.0.0.0:0 = 자동 할당)
  -s, --server <ADDR>    서버 주소 (기본: 127.0.0.1:9000)
  -n, --name <NAME>      스트림 이름 (기본: /psa/demo/audio)
  -o, --output <PATH>    재생된 프레임 저장 경로
  --preset <NAME>        low-latency | unstable
  --rate <HZ>            생산자 샘플링 레이트 (기본: 8000)
  --fps <N>              세그먼트당 프레임 수 (기본: 10)
  -j, --jitter <N>       지터 버퍼 깊이, 프레임 단위 (기본: 5)
  --tick <MS>            틱 주기 (기본: 50)
  --no-deadline          재생 데드라인 기반 요청 생략 끄기
  -h, --help             이 도움말 출력
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();
    let config = client_config.config.clone();
    config.validate()?;

    let name = StreamName::parse(&client_config.stream_name)?;

    info!("PSA Client starting...");
    info!("Server address: {}", client_config.server_addr);
    info!("Stream: {}", name);
    info!(
        "Sampling rate: {} Hz, {} frames/segment, jitter {} frames ({}ms)",
        config.sampling_rate,
        config.frames_per_segment,
        config.jitter_buffer_frames,
        config.jitter_delay().as_millis()
    );

    let (network, net_rx) = UdpNetwork::connect(
        client_config.bind_addr,
        client_config.server_addr,
        config.event_channel_capacity,
    )
    .await?;
    info!("Bound to local address: {}", network.local_addr());

    let mut output = match &client_config.output_path {
        Some(path) => Some(BufWriter::new(File::create(path)?)),
        None => None,
    };

    let (session, mut events, mut frames) = StreamSession::spawn(config, name, network, net_rx)?;
    session.start().await?;

    let mut stats_interval = tokio::time::interval(Duration::from_secs(2));
    let mut bytes_written = 0usize;
    let mut close_reason = None;

    loop {
        tokio::select! {
            Some(frame) = frames.recv() => {
                if let Some(out) = output.as_mut() {
                    out.write_all(&frame.data)?;
                }
                bytes_written += frame.data.len();
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event.kind {
                    SessionEventKind::Started => info!("Fetch started: {}", event.stream),
                    SessionEventKind::FinalBlockIdLearned { final_block_id } => {
                        info!("Final block id learned: {}", final_block_id)
                    }
                    SessionEventKind::FinalFrameLearned { frame_number } => {
                        info!("Final frame learned: {}", frame_number)
                    }
                    SessionEventKind::BufferingComplete => info!("Buffering complete, playback started"),
                    SessionEventKind::FetchComplete => info!("Fetch complete: {}", event.stream),
                    SessionEventKind::PlaybackComplete => info!("Playback complete: {}", event.stream),
                    SessionEventKind::InterestSkipped { segment } => {
                        warn!("Request skipped (too late to play): segment {}", segment)
                    }
                    SessionEventKind::Closed { reason } => {
                        close_reason = reason;
                        break;
                    }
                    other => debug!("{:?}", other),
                }
            }
            _ = stats_interval.tick() => {
                info!("{}", session.stats().summary());
            }
        }
    }

    // 남은 프레임 기록
    while let Ok(frame) = frames.try_recv() {
        if let Some(out) = output.as_mut() {
            out.write_all(&frame.data)?;
        }
        bytes_written += frame.data.len();
    }
    if let Some(mut out) = output {
        out.flush()?;
    }

    let stats = session.stats();
    match close_reason {
        Some(reason) => warn!("Session closed abnormally: {}", reason),
        None => info!("Session finished"),
    }
    info!("  Frames played: {}", stats.playback.frames_played);
    info!("  Frames skipped: {}", stats.playback.frames_skipped);
    info!("  Bytes written: {}", bytes_written);
    info!("{}", stats.summary());

    session.close().await;
    Ok(())
}
