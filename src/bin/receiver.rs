//! SSP 수신 프로세스 - Striped Shard Protocol
//!
//! 여러 포트에서 동시에 샤드 프레임을 받아 바이트를 집계하는 수신자
//! - 전 포트 바인드 성공 후에만 [RX_READY] 신호 출력 (all-or-nothing)
//! - 연결별 독립 프레임 디코드 루프
//! - 인터럽트 후에도 총 수신 바이트를 항상 출력
//!
//! 사용법:
//!   cargo run --release --bin ssp-receiver -- [OPTIONS]
//!
//! 예시:
//!   # 기본 수신 (포트 9001~9006)
//!   cargo run --release --bin ssp-receiver
//!
//!   # 디스크 싱크 활성화
//!   cargo run --release --bin ssp-receiver -- --write-to-disk --output recv.bin

use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ssp::{Config, Receiver};

fn parse_ports(value: &str) -> Vec<u16> {
    value
        .split(',')
        .map(|p| p.trim().parse().expect("유효한 포트 필요"))
        .collect()
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.host = args[i + 1].clone();
                    i += 1;
                }
            }
            "--ports" | "-p" => {
                if i + 1 < args.len() {
                    config.ports = parse_ports(&args[i + 1]);
                    i += 1;
                }
            }
            "--write-to-disk" | "-d" => {
                config.write_to_disk = true;
            }
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--record-sessions" => {
                config.record_sessions = true;
            }
            "--verify-hashes" => {
                config.verify_hashes = true;
            }
            "--rcvbuf" => {
                if i + 1 < args.len() {
                    config.recv_buffer_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"SSP Receiver - Striped Shard Protocol 수신자

여러 포트에서 동시에 샤드 프레임을 수신하고 바이트를 집계

사용법:
  cargo run --release --bin ssp-receiver -- [OPTIONS]

옵션:
  -b, --bind <HOST>       바인드 호스트 (기본: 127.0.0.1)
  -p, --ports <P1,P2,..>  수신 포트 목록 (기본: 9001~9006)
  -d, --write-to-disk     페이로드를 디스크에 기록 (기본: 꺼짐)
  -o, --output <PATH>     디스크 기록 경로 (기본: ssp_recv.bin)
  --record-sessions       세션 맵에 페이로드 보관 (진단용, 메모리 무한 증가)
  --verify-hashes         수신 시 콘텐츠 해시 검증 (기본: 꺼짐)
  --rcvbuf <BYTES>        SO_RCVBUF (기본: 8388608 = 8MB)
  -h, --help              이 도움말 출력

출력 계약:
  바인드된 포트마다 "[RX] Listening on HOST:PORT" 한 줄,
  전 포트 준비 후 "[RX_READY]" 정확히 한 줄,
  종료 시 "[RX] Total received: ..." 한 줄
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
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = parse_args();
    let host = config.host.clone();

    info!("SSP Receiver starting...");
    info!("Bind: {} on ports {:?}", host, config.ports);
    info!("Disk sink: {}", config.write_to_disk);

    // 전 포트 바인드 실패 시 여기서 비정상 종료 — [RX_READY]는 출력되지 않는다
    let receiver = Receiver::start(config).await?;

    for port in receiver.ports() {
        println!("[RX] Listening on {}:{}", host, port);
    }
    println!("[RX_READY]");

    // 인터럽트까지 수신 유지
    tokio::signal::ctrl_c().await?;
    info!("인터럽트 수신, 수신 종료 중...");

    let stats = receiver.stats();
    let total = receiver.shutdown().await;

    info!("{}", stats.summary());
    println!("[RX] Total received: {:.2} GB", total as f64 / 1e9);

    Ok(())
}
