//! SSP 송신 프로세스 - Striped Shard Protocol
//!
//! 파일을 샤딩해 여러 TCP 레인으로 병렬 전송하는 송신자
//! - 포트당 영속 연결 + 길이 프리픽스 프레이밍
//! - drain 임계값 기반 배치 플러시
//! - 일부 레인이 실패해도 나머지 레인으로 계속 전송
//!
//! 사용법:
//!   cargo run --release --bin ssp-sender -- [OPTIONS]
//!
//! 예시:
//!   # 기본 전송 (127.0.0.1, 포트 9001~9006)
//!   cargo run --release --bin ssp-sender -- --file massive.log
//!
//!   # 대상 호스트 + 포트 지정
//!   cargo run --release --bin ssp-sender -- -f data.bin --host 10.0.0.2 --ports 9001,9002,9003

use std::path::PathBuf;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ssp::{Config, StripeSender};

/// 송신 프로세스 설정
struct SenderArgs {
    file_path: Option<PathBuf>,
    test_size_mb: Option<usize>,
    config: Config,
}

impl Default for SenderArgs {
    fn default() -> Self {
        Self {
            file_path: None,
            test_size_mb: None,
            config: Config::default(),
        }
    }
}

fn parse_ports(value: &str) -> Vec<u16> {
    value
        .split(',')
        .map(|p| p.trim().parse().expect("유효한 포트 필요"))
        .collect()
}

fn parse_args() -> SenderArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SenderArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    parsed.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    parsed.config.host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--ports" | "-p" => {
                if i + 1 < args.len() {
                    parsed.config.ports = parse_ports(&args[i + 1]);
                    i += 1;
                }
            }
            "--shard-size" => {
                if i + 1 < args.len() {
                    parsed.config.shard_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--drain-batch" => {
                if i + 1 < args.len() {
                    parsed.config.drain_batch_bytes =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--queue-depth" => {
                if i + 1 < args.len() {
                    parsed.config.lane_queue_depth =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--sndbuf" => {
                if i + 1 < args.len() {
                    parsed.config.send_buffer_size =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--test-size" => {
                if i + 1 < args.len() {
                    parsed.test_size_mb = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"SSP Sender - Striped Shard Protocol 송신자

파일을 고정 크기 샤드로 분할해 여러 TCP 레인으로 병렬 전송

사용법:
  cargo run --release --bin ssp-sender -- [OPTIONS]

옵션:
  -f, --file <PATH>       전송할 파일 경로
  --host <HOST>           대상 호스트 (기본: 127.0.0.1)
  -p, --ports <P1,P2,..>  레인 포트 목록 (기본: 9001~9006)
  --shard-size <BYTES>    샤드 크기 (기본: 4194304 = 4MiB)
  --drain-batch <BYTES>   레인별 플러시 임계값 (기본: 16777216 = 16MiB)
  --queue-depth <N>       레인별 큐 용량 (기본: 8)
  --sndbuf <BYTES>        SO_SNDBUF (기본: 8388608 = 8MB)
  --test-size <MB>        파일 대신 테스트 데이터 전송 (MB)
  -h, --help              이 도움말 출력

예시:
  # 파일 전송
  cargo run --release --bin ssp-sender -- --file massive.log

  # 3개 레인으로 100MB 테스트 데이터 전송
  cargo run --release --bin ssp-sender -- --test-size 100 --ports 9001,9002,9003
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    parsed
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();

    info!("SSP Sender starting...");
    info!("Target: {} on ports {:?}", args.config.host, args.config.ports);
    info!("Shard size: {} bytes", args.config.shard_size);
    info!("Drain batch: {} bytes", args.config.drain_batch_bytes);
    info!("Lanes: {}", args.config.ports.len());

    let sender = StripeSender::new(args.config)?;

    // Ctrl-C: 공급을 멈추고 정상 종료 절차 (센티널 + 제한 시간 join)
    let abort = sender.abort_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("인터럽트 수신, 송신 중단");
            abort.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let report = if let Some(path) = &args.file_path {
        info!("Sending file: {:?}", path);
        sender.send_file(path).await?
    } else if let Some(size_mb) = args.test_size_mb {
        // 테스트용 더미 데이터
        info!("Using test data ({} MB)", size_mb);
        let data = vec![0xABu8; size_mb * 1024 * 1024];
        sender.send_bytes(&data).await?
    } else {
        eprintln!("전송할 파일이 없습니다: --file 또는 --test-size를 지정하세요 (--help 참고)");
        std::process::exit(1);
    };

    // 일부 레인이 실패해도 전송된 바이트 기준으로 결과를 남긴다
    for lane in report.failed_lanes() {
        warn!(
            "lane failed: port={}: {}",
            lane.port,
            lane.error.as_deref().unwrap_or("unknown")
        );
    }

    info!("Transfer complete!");
    info!("  Session: {:016x}", report.session_id);
    info!(
        "  Shards: {}/{}",
        report.shards_dispatched, report.total_shards
    );
    info!("  Bytes: {}", report.total_bytes);
    info!("  Time: {:.2}s", report.elapsed.as_secs_f64());
    info!("  Throughput: {:.2} Gbps", report.throughput_gbps());

    println!(
        "[TX] Sent {:.2} GB in {:.2}s → {:.2} Gbps",
        report.total_bytes as f64 / 1e9,
        report.elapsed.as_secs_f64(),
        report.throughput_gbps()
    );

    Ok(())
}
