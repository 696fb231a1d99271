//! PSA 데모 생산자 - Pull Stream Audio
//!
//! ADTS 프레임 스트림을 실시간 속도로 "생산"하면서 세그먼트 요청에 응답한다.
//! - 세그먼트 N은 시작 후 N * ms_per_segment 시점부터 응답 가능
//! - 아직 생산되지 않은 세그먼트 요청은 요청 수명 안에 생산되면 그때 응답
//! - 마지막 세그먼트에는 최종 블록 ID 메타데이터
//! - 스트림 끝을 넘는 요청에는 NACK (최종 블록 ID)
//!
//! 사용법:
//!   cargo run --release --bin psa-server -- [OPTIONS]
//!
//! 예시:
//!   # 합성 프레임 200개
//!   cargo run --release --bin psa-server -- --frames 200
//!
//!   # ADTS 파일, 10% 응답 손실
//!   cargo run --release --bin psa-server -- -f voice.aac --rate 16000 --loss 0.1

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use psa::frame;
use psa::message::{DataMessage, Message, NackMessage, RequestMessage};
use psa::{Config, StreamName};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    stream_name: String,
    file_path: Option<PathBuf>,
    synthetic_frames: usize,
    loss_rate: f64,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            stream_name: "/psa/demo/audio".into(),
            file_path: None,
            synthetic_frames: 100,
            loss_rate: 0.0,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    config.stream_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--frames" => {
                if i + 1 < args.len() {
                    config.synthetic_frames = args[i + 1].parse().expect("유효한 숫자 필요");
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
            "--loss" => {
                if i + 1 < args.len() {
                    config.loss_rate = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"PSA Server - Pull Stream Audio 데모 생산자

ADTS 프레임을 실시간 속도로 세그먼트 단위 생산, 이름 기반 요청에 응답

사용법:
  cargo run --release --bin psa-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9000)
  -n, --name <NAME>       스트림 이름 (기본: /psa/demo/audio)
  -f, --file <PATH>       ADTS 파일 (없으면 합성 프레임)
  --frames <N>            합성 프레임 수 (기본: 100)
  --rate <HZ>             샘플링 레이트 (기본: 8000)
  --fps <N>               세그먼트당 프레임 수 (기본: 10)
  --loss <RATIO>          응답 드롭 비율 0.0~1.0 (기본: 0.0)
  -h, --help              이 도움말 출력
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

/// 합성 ADTS 프레임 (무작위 페이로드)
fn synthetic_frames(count: usize, sampling_rate: u32) -> psa::Result<Vec<Bytes>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let len = rng.gen_range(24..96);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            frame::build_frame(&payload, sampling_rate)
        })
        .collect()
}

/// 프레임을 세그먼트 단위로 묶기
///
/// 프레임 수가 세그먼트 크기로 나누어떨어지면 빈 세그먼트를 하나 더 붙여
/// 마지막 세그먼트가 항상 짧도록 한다.
fn build_segments(frames: &[Bytes], frames_per_segment: usize) -> Vec<Bytes> {
    let mut segments: Vec<Bytes> = frames
        .chunks(frames_per_segment)
        .map(|group| {
            let mut buf = BytesMut::with_capacity(group.iter().map(|f| f.len()).sum());
            for f in group {
                buf.put_slice(f);
            }
            buf.freeze()
        })
        .collect();

    if frames.len() % frames_per_segment == 0 {
        segments.push(Bytes::new());
    }
    segments
}

/// 라이브 스트림 상태
struct LiveStream {
    name: StreamName,
    segments: Vec<Bytes>,
    start: Instant,
    ms_per_segment: u64,
}

impl LiveStream {
    fn final_block_id(&self) -> u64 {
        self.segments.len() as u64 - 1
    }

    fn available_at(&self, segment: u64) -> Instant {
        self.start + Duration::from_millis(segment * self.ms_per_segment)
    }

    fn response_bytes(&self, segment: u64) -> psa::Result<Vec<u8>> {
        let final_id = self.final_block_id();
        match self.segments.get(segment as usize) {
            Some(data) => {
                let meta = (segment == final_id).then_some(final_id);
                DataMessage::new(&self.name, segment, data, meta).to_bytes()
            }
            None => NackMessage::new(&self.name, segment, final_id).to_bytes(),
        }
    }
}

async fn handle_request(
    stream: Arc<LiveStream>,
    socket: Arc<UdpSocket>,
    request: RequestMessage,
    addr: SocketAddr,
    loss_rate: f64,
) {
    let segment = request.segment;

    // 아직 생산되지 않았으면 수명 안에서 기다린다
    if segment <= stream.final_block_id() {
        let now = Instant::now();
        let available = stream.available_at(segment);
        if available > now {
            let wait = available - now;
            if wait > request.lifetime() {
                debug!("segment {} 생산 전 요청 만료 예정, 무시", segment);
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    if loss_rate > 0.0 && rand::thread_rng().gen_bool(loss_rate.min(1.0)) {
        debug!("segment {} 응답 드롭 (loss 시뮬레이션)", segment);
        return;
    }

    match stream.response_bytes(segment) {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, addr).await {
                warn!("응답 전송 실패: {}", e);
            }
        }
        Err(e) => warn!("응답 인코딩 실패: segment={}, {}", segment, e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    let config = server_config.config.clone();
    config.validate()?;

    let name = StreamName::parse(&server_config.stream_name)?;

    // 프레임 준비
    let frames = if let Some(path) = &server_config.file_path {
        info!("Loading ADTS file: {:?}", path);
        frame::split_all(Bytes::from(std::fs::read(path)?))?
    } else {
        info!("Using {} synthetic frames", server_config.synthetic_frames);
        synthetic_frames(server_config.synthetic_frames, config.sampling_rate)?
    };

    let segments = build_segments(&frames, config.frames_per_segment as usize);

    info!("PSA Server starting...");
    info!("Stream: {}", name);
    info!("Frames: {} ({} segments)", frames.len(), segments.len());
    info!(
        "Sampling rate: {} Hz, {} frames/segment, {}ms/segment",
        config.sampling_rate,
        config.frames_per_segment,
        config.ms_per_segment()
    );
    if server_config.loss_rate > 0.0 {
        info!("Simulated loss: {:.1}%", server_config.loss_rate * 100.0);
    }

    let socket = Arc::new(UdpSocket::bind(server_config.bind_addr).await?);
    info!("Server listening on {}", server_config.bind_addr);

    let stream = Arc::new(LiveStream {
        name: name.clone(),
        segments,
        start: Instant::now(),
        ms_per_segment: config.ms_per_segment(),
    });

    let mut buf = vec![0u8; 65535];

    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;

        let request = match Message::from_bytes(&buf[..len]) {
            Ok(Message::Request(r)) => r,
            Ok(other) => {
                debug!("요청이 아닌 메시지 무시: {:?}", other.msg_type());
                continue;
            }
            Err(e) => {
                warn!("손상된 패킷 무시 ({}): {}", addr, e);
                continue;
            }
        };

        if request.name != name.as_str() {
            debug!("알 수 없는 스트림 요청 무시: {}", request.name);
            continue;
        }

        debug!("요청 수신: segment={} from {}", request.segment, addr);
        tokio::spawn(handle_request(
            stream.clone(),
            socket.clone(),
            request,
            addr,
            server_config.loss_rate,
        ));
    }
}
