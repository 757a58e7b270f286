//! 송신측: 레인 센더 + 스트라이핑 디스패처
//!
//! - 포트당 영속 연결 하나 (레인), 레인별 바운디드 큐
//! - `port = ports[index % lanes]` 결정적 스트라이핑
//! - drain 임계값 기반 배치 플러시
//! - 한 레인의 실패는 해당 레인의 결과로만 보고, 다른 레인은 계속

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::net::{tune_socket, write_frame, write_terminator};
use crate::shard::{new_session_id, shard_bytes, SessionId, Shard, ShardStream};
use crate::stats::LaneStats;
use crate::{Config, Error, Result, HEADER_SIZE, LEN_PREFIX_SIZE};

/// 레인 큐 명령
enum LaneCmd {
    /// 전송할 패킷 (헤더 ++ 페이로드)
    Packet(Bytes),

    /// 종료 센티널: 종료 프레임을 쓰고 연결을 닫는다
    Shutdown,
}

/// 레인 수행 결과 (실패 시 error 필드에 기록)
pub type LaneOutcome = LaneStats;

/// 샤드 인덱스의 레인 배정
///
/// 정적 라운드로빈. 레인 간 조율 없이 샤드 수 기준 균등 분배를 보장한다.
fn lane_index(shard_index: u32, lane_count: usize) -> usize {
    shard_index as usize % lane_count
}

/// 레인 태스크 본체
///
/// 연결 수립과 쓰기 실패는 이 레인의 결과로만 남긴다. 실패한 뒤에도
/// 큐를 계속 비워서 디스패처가 백프레셔에 걸려 멈추지 않게 한다.
async fn run_lane(
    host: String,
    port: u16,
    mut queue: mpsc::Receiver<LaneCmd>,
    sndbuf: usize,
    rcvbuf: usize,
    drain_batch_bytes: usize,
) -> LaneOutcome {
    let mut stats = LaneStats::new(port);

    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("레인 연결 실패: {}:{}: {}", host, port, e);
            stats.error = Some(e.to_string());
            while queue.recv().await.is_some() {}
            return stats;
        }
    };

    if !tune_socket(&stream, sndbuf, rcvbuf) {
        debug!("소켓 튜닝 일부 실패: port={}", port);
    }

    let mut writer = BufWriter::with_capacity(drain_batch_bytes.max(64 * 1024), stream);
    let mut pending = 0usize;

    let io_result: std::io::Result<()> = async {
        while let Some(cmd) = queue.recv().await {
            match cmd {
                LaneCmd::Packet(packet) => {
                    write_frame(&mut writer, &packet).await?;
                    stats.record_frame(packet.len() - HEADER_SIZE);

                    pending += LEN_PREFIX_SIZE + packet.len();
                    if pending >= drain_batch_bytes {
                        writer.flush().await?;
                        pending = 0;
                    }
                }
                LaneCmd::Shutdown => {
                    write_terminator(&mut writer).await?;
                    // BufWriter::shutdown은 내부 버퍼 플러시 후 쓰기 방향을 닫는다
                    writer.shutdown().await?;
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = io_result {
        warn!("레인 쓰기 실패: port={}: {}", port, e);
        stats.error = Some(e.to_string());
        while queue.recv().await.is_some() {}
    } else {
        debug!(
            "레인 완료: port={}, frames={}, bytes={}",
            port, stats.frames, stats.bytes
        );
    }

    stats
}

/// 송신 결과 리포트
#[derive(Debug)]
pub struct SendReport {
    /// 이 전송 런의 세션 ID
    pub session_id: SessionId,

    /// 헤더에 실린 총 샤드 수
    pub total_shards: u32,

    /// 실제로 큐에 공급된 샤드 수 (중단 시 total_shards보다 작을 수 있음)
    pub shards_dispatched: u64,

    /// 성공 전송된 페이로드 바이트 (실패 레인 제외)
    pub total_bytes: u64,

    /// 전송 경과 시간
    pub elapsed: Duration,

    /// 레인별 결과
    pub lanes: Vec<LaneOutcome>,
}

impl SendReport {
    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / secs
    }

    /// 처리율 (Gbps)
    pub fn throughput_gbps(&self) -> f64 {
        self.throughput() * 8.0 / 1e9
    }

    /// 실패한 레인 목록
    pub fn failed_lanes(&self) -> Vec<&LaneOutcome> {
        self.lanes.iter().filter(|l| l.failed()).collect()
    }

    /// 결과 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Sent {} shards ({:.2} GB) in {:.2}s → {:.2} Gbps | Lanes: {} ok / {} failed",
            self.shards_dispatched,
            self.total_bytes as f64 / 1e9,
            self.elapsed.as_secs_f64(),
            self.throughput_gbps(),
            self.lanes.len() - self.failed_lanes().len(),
            self.failed_lanes().len(),
        )
    }
}

/// 스트라이핑 디스패처
///
/// 생성 시 포트당 레인 태스크를 하나씩 띄우고, 샤드를 생산하며
/// `index % lanes` 규칙으로 각 레인의 바운디드 큐에 공급한다.
/// 큐가 가득 차면 공급이 대기한다 (백프레셔) — 메모리 사용량은
/// O(큐 용량 × 샤드 크기 × 레인 수)로 상한된다.
pub struct StripeSender {
    config: Config,
    queues: Vec<mpsc::Sender<LaneCmd>>,
    lanes: Vec<(u16, JoinHandle<LaneOutcome>)>,
    aborted: Arc<AtomicBool>,
}

impl StripeSender {
    /// 레인 수립 및 디스패처 생성
    pub fn new(config: Config) -> Result<Self> {
        if config.ports.is_empty() {
            return Err(Error::EmptyPortList);
        }

        let aborted = Arc::new(AtomicBool::new(false));
        let mut queues = Vec::with_capacity(config.ports.len());
        let mut lanes = Vec::with_capacity(config.ports.len());

        for &port in &config.ports {
            let (tx, rx) = mpsc::channel::<LaneCmd>(config.lane_queue_depth);
            let handle = tokio::spawn(run_lane(
                config.host.clone(),
                port,
                rx,
                config.send_buffer_size,
                config.recv_buffer_size,
                config.drain_batch_bytes,
            ));
            queues.push(tx);
            lanes.push((port, handle));
        }

        info!(
            "StripeSender: {} lanes → {} (queue depth {})",
            config.ports.len(),
            config.host,
            config.lane_queue_depth
        );

        Ok(Self {
            config,
            queues,
            lanes,
            aborted,
        })
    }

    /// 외부 인터럽트용 중단 플래그
    ///
    /// true로 바뀌면 샤드 공급을 멈추고 정상 종료 절차로 넘어간다.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.aborted.clone()
    }

    /// 파일을 스트리밍 샤딩하며 전송
    pub async fn send_file(self, path: impl AsRef<Path>) -> Result<SendReport> {
        let mut stream = ShardStream::open(path, self.config.shard_size).await?;
        let session_id = new_session_id();
        let total_shards = stream.total_shards();

        info!(
            "송신 시작: session={:016x}, {} shards ({} bytes)",
            session_id,
            total_shards,
            stream.file_size()
        );

        let started = Instant::now();
        let mut dispatched = 0u64;

        while let Some(shard) = stream.next_shard().await? {
            if self.aborted.load(Ordering::SeqCst) {
                warn!("송신 중단: {}개 샤드 공급 후 인터럽트", dispatched);
                break;
            }
            self.dispatch(shard, session_id, total_shards).await;
            dispatched += 1;

            if dispatched % 256 == 0 {
                debug!("진행: {}/{} shards", dispatched, total_shards);
            }
        }

        self.finish(session_id, total_shards, dispatched, started).await
    }

    /// 메모리 버퍼를 일괄 샤딩하여 전송
    pub async fn send_bytes(self, data: &[u8]) -> Result<SendReport> {
        let shards = shard_bytes(data, self.config.shard_size)?;
        let session_id = new_session_id();
        let total_shards = shards.len() as u32;

        info!(
            "송신 시작: session={:016x}, {} shards ({} bytes)",
            session_id,
            total_shards,
            data.len()
        );

        let started = Instant::now();
        let mut dispatched = 0u64;

        for shard in shards {
            if self.aborted.load(Ordering::SeqCst) {
                warn!("송신 중단: {}개 샤드 공급 후 인터럽트", dispatched);
                break;
            }
            self.dispatch(shard, session_id, total_shards).await;
            dispatched += 1;
        }

        self.finish(session_id, total_shards, dispatched, started).await
    }

    /// 샤드 하나를 담당 레인 큐에 공급 (큐가 가득 차면 대기)
    async fn dispatch(&self, shard: Shard, session_id: SessionId, total_shards: u32) {
        let lane = lane_index(shard.index, self.queues.len());
        let packet = shard.packet(session_id, total_shards);

        if self.queues[lane].send(LaneCmd::Packet(packet)).await.is_err() {
            // 레인 태스크 소멸 — 해당 레인 몫의 샤드는 유실되고 결과에 반영된다
            warn!("레인 큐 닫힘: port={}", self.config.ports[lane]);
        }
    }

    /// 종료 센티널 송출 후 전 레인 join, 결과 집계
    async fn finish(
        mut self,
        session_id: SessionId,
        total_shards: u32,
        shards_dispatched: u64,
        started: Instant,
    ) -> Result<SendReport> {
        for queue in &self.queues {
            let _ = queue.send(LaneCmd::Shutdown).await;
        }
        // 센더를 내려놓아 실패 레인의 drain 루프도 끝나게 한다
        self.queues.clear();

        let join_timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        let mut lanes = Vec::with_capacity(self.lanes.len());

        for (port, mut handle) in self.lanes.drain(..) {
            match tokio::time::timeout(join_timeout, &mut handle).await {
                Ok(Ok(outcome)) => lanes.push(outcome),
                Ok(Err(join_err)) => {
                    let mut stats = LaneStats::new(port);
                    stats.error = Some(format!("lane task panicked: {}", join_err));
                    lanes.push(stats);
                }
                Err(_) => {
                    // 타임아웃: 강제 종료
                    handle.abort();
                    warn!("레인 join 타임아웃: port={}, abort", port);
                    let mut stats = LaneStats::new(port);
                    stats.error = Some(format!("join timeout after {:?}", join_timeout));
                    lanes.push(stats);
                }
            }
        }

        let failed = lanes.iter().filter(|l| l.failed()).count();
        if failed == lanes.len() {
            return Err(Error::AllLanesFailed {
                failed,
                total: lanes.len(),
            });
        }

        let report = SendReport {
            session_id,
            total_shards,
            shards_dispatched,
            // 실패 레인의 바이트는 버퍼에만 쓰였을 수 있으므로 집계에서 제외
            total_bytes: lanes.iter().filter(|l| !l.failed()).map(|l| l.bytes).sum(),
            elapsed: started.elapsed(),
            lanes,
        };

        info!("{}", report.summary());
        Ok(report)
    }
}
