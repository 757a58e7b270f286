//! 수신측: 멀티포트 리시버
//!
//! - 포트당 리스너 하나, 전 포트 바인드 성공 후에만 수신 시작 (all-or-nothing)
//! - 연결별 독립 프레임 디코드 루프
//! - 공유 바이트 카운터는 원자 연산, 세션 맵은 진단 전용
//! - 디스크 싱크는 프로세스당 한 번 열리는 단일 append 파일
//!   (원본 순서 복원 없음 — 처리율 측정용 싱크)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::header::ShardHeader;
use crate::net::{read_frame, tune_socket};
use crate::shard::SessionId;
use crate::stats::TransferStats;
use crate::{Config, Error, Result, HEADER_SIZE};

/// 포트(레인)별 수신 카운터
struct PortCounter {
    port: u16,
    bytes: AtomicU64,
    frames: AtomicU64,
}

/// 연결 핸들러들이 공유하는 상태
struct Shared {
    config: Config,
    total_bytes: AtomicU64,
    total_frames: AtomicU64,
    /// 진단용 세션 맵: sessions[session_id][shard_index] = payload
    /// 프로세스 수명 동안 무한 증가하므로 record_sessions일 때만 기록
    sessions: DashMap<SessionId, HashMap<u32, Bytes>>,
    /// 단일 공유 디스크 싱크 (append 전용, 핸들러 간 인터리브 허용)
    sink: Option<Mutex<tokio::fs::File>>,
}

/// 멀티포트 리시버 핸들 (관찰/제어용)
///
/// `start`가 전 포트를 바인드한 뒤에만 생성된다.
pub struct Receiver {
    bound_ports: Vec<u16>,
    shared: Arc<Shared>,
    counters: Vec<Arc<PortCounter>>,
    accept_tasks: Vec<JoinHandle<()>>,
    conn_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    shutdown_tx: watch::Sender<bool>,
    started_at: Instant,
}

/// 하위 호환 별칭
pub type ReceiverHandle = Receiver;

impl Receiver {
    /// 전 포트 바인드 후 수신 시작
    ///
    /// 포트 하나라도 바인드에 실패하면 아무 연결도 받지 않고 에러를
    /// 돌려준다. Ok 반환 자체가 준비 완료 신호다 — 오케스트레이터는
    /// 표준출력 파싱 없이 이 반환을 기다리면 된다.
    pub async fn start(config: Config) -> Result<Receiver> {
        if config.ports.is_empty() {
            return Err(Error::EmptyPortList);
        }

        let mut listeners = Vec::with_capacity(config.ports.len());
        for &port in &config.ports {
            let addr = (config.host.as_str(), port);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| Error::Bind { port, source })?;
            listeners.push(listener);
        }

        // 실제 바인드된 포트 (설정 포트 0 = OS 할당)
        let bound_ports: Vec<u16> = listeners
            .iter()
            .map(|l| l.local_addr().map(|a| a.port()))
            .collect::<std::io::Result<_>>()?;

        let sink = if config.write_to_disk {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output_path)
                .await?;
            info!("디스크 싱크 열림: {:?}", config.output_path);
            Some(Mutex::new(file))
        } else {
            None
        };

        let shared = Arc::new(Shared {
            config,
            total_bytes: AtomicU64::new(0),
            total_frames: AtomicU64::new(0),
            sessions: DashMap::new(),
            sink,
        });

        let (shutdown_tx, _) = watch::channel(false);
        let conn_tasks = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut counters = Vec::with_capacity(bound_ports.len());
        let mut accept_tasks = Vec::with_capacity(bound_ports.len());

        for (listener, &port) in listeners.into_iter().zip(&bound_ports) {
            let counter = Arc::new(PortCounter {
                port,
                bytes: AtomicU64::new(0),
                frames: AtomicU64::new(0),
            });
            counters.push(counter.clone());

            let shared = shared.clone();
            let conn_tasks = conn_tasks.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();

            accept_tasks.push(tokio::spawn(async move {
                info!("수신 대기: port={}", port);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            debug!("수신 중지: port={}", port);
                            break;
                        }
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => {
                                    let task = tokio::spawn(handle_connection(
                                        stream,
                                        peer,
                                        shared.clone(),
                                        counter.clone(),
                                    ));
                                    let mut tasks = conn_tasks.lock();
                                    tasks.retain(|t: &JoinHandle<()>| !t.is_finished());
                                    tasks.push(task);
                                }
                                Err(e) => {
                                    warn!("accept 실패: port={}: {}", port, e);
                                }
                            }
                        }
                    }
                }
            }));
        }

        info!("전 포트 바인드 완료: {:?}", bound_ports);

        Ok(Receiver {
            bound_ports,
            shared,
            counters,
            accept_tasks,
            conn_tasks,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    /// 실제 바인드된 포트 목록 (설정 순서 유지)
    pub fn ports(&self) -> &[u16] {
        &self.bound_ports
    }

    /// 총 수신 페이로드 바이트
    pub fn total_bytes(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Relaxed)
    }

    /// 총 수신 프레임 수 (종료 프레임 제외)
    pub fn total_frames(&self) -> u64 {
        self.shared.total_frames.load(Ordering::Relaxed)
    }

    /// 레인별 수신 통계 스냅샷
    pub fn stats(&self) -> TransferStats {
        let mut stats = TransferStats::new(&self.bound_ports);
        stats.start_time = self.started_at;
        for (lane, counter) in stats.lanes.iter_mut().zip(&self.counters) {
            lane.bytes = counter.bytes.load(Ordering::Relaxed);
            lane.frames = counter.frames.load(Ordering::Relaxed);
        }
        stats.aggregate();
        stats
    }

    /// 세션 맵에서 기록된 샤드 인덱스 목록 (정렬)
    pub fn recorded_shards(&self, session_id: SessionId) -> Option<Vec<u32>> {
        self.shared.sessions.get(&session_id).map(|entry| {
            let mut indices: Vec<u32> = entry.keys().copied().collect();
            indices.sort_unstable();
            indices
        })
    }

    /// 세션 맵에서 특정 샤드 페이로드 조회
    pub fn recorded_payload(&self, session_id: SessionId, shard_index: u32) -> Option<Bytes> {
        self.shared
            .sessions
            .get(&session_id)
            .and_then(|entry| entry.get(&shard_index).cloned())
    }

    /// 수신 중지: 리스너를 닫고 진행 중 연결은 포기한다
    ///
    /// 중지 후에도 카운터는 조회 가능 — 총 수신 바이트는 항상 보고된다.
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown_tx.send(true);

        for task in self.accept_tasks {
            let _ = task.await;
        }
        for task in self.conn_tasks.lock().drain(..) {
            task.abort();
        }

        if let Some(sink) = &self.shared.sink {
            let mut file = sink.lock().await;
            if let Err(e) = file.flush().await {
                warn!("싱크 플러시 실패: {}", e);
            }
        }

        let total = self.shared.total_bytes.load(Ordering::Relaxed);
        info!("수신 종료: total {} bytes", total);
        total
    }
}

/// 연결 하나의 프레임 디코드 루프
///
/// 종료 경로: 길이 0 프레임(정상), 프레임 중간 단절(정상 단절 취급),
/// 헤더 불일치(해당 연결만 종료). 어느 경로든 소켓은 회수된다.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    counter: Arc<PortCounter>,
) {
    tune_socket(
        &stream,
        shared.config.send_buffer_size,
        shared.config.recv_buffer_size,
    );
    debug!("연결 수락: port={}, peer={}", counter.port, peer);

    let mut reader = BufReader::with_capacity(256 * 1024, stream);

    loop {
        let packet = match read_frame(&mut reader).await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("정상 종료 프레임: peer={}", peer);
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // 피어가 프레임 중간에 닫음 — 정상 단절로 처리
                debug!("피어 단절: peer={}", peer);
                break;
            }
            Err(e) => {
                warn!("프레임 읽기 실패: peer={}: {}", peer, e);
                break;
            }
        };

        // 헤더보다 짧은 패킷: 기형 패킷으로 버리고 다음 프레임 계속
        if packet.len() < HEADER_SIZE {
            warn!(
                "기형 패킷 스킵: peer={}, {} bytes (< header {})",
                peer,
                packet.len(),
                HEADER_SIZE
            );
            continue;
        }

        let header = match ShardHeader::decode(&packet) {
            Ok(header) => header,
            Err(e) => {
                // magic/version 불일치 — 스트림 오염으로 보고 연결 종료
                warn!("헤더 디코드 실패: peer={}: {}", peer, e);
                break;
            }
        };

        let payload = packet.slice(HEADER_SIZE..);

        // 선언 길이와 실제 잔여 길이가 어긋나면 스트림을 신뢰할 수 없다
        if payload.len() != header.data_len as usize {
            warn!(
                "페이로드 길이 불일치: peer={}, header={}, actual={}",
                peer,
                header.data_len,
                payload.len()
            );
            break;
        }

        if shared.config.verify_hashes {
            if let Err(e) = header.verify_payload(&payload) {
                warn!("해시 검증 실패, 패킷 드롭: peer={}: {}", peer, e);
                continue;
            }
        }

        counter.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        counter.frames.fetch_add(1, Ordering::Relaxed);
        shared
            .total_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        shared.total_frames.fetch_add(1, Ordering::Relaxed);

        if let Some(sink) = &shared.sink {
            let mut file = sink.lock().await;
            if let Err(e) = file.write_all(&payload).await {
                warn!("싱크 기록 실패: {}", e);
            }
        }

        if shared.config.record_sessions {
            shared
                .sessions
                .entry(header.session_id)
                .or_default()
                .insert(header.shard_index, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use crate::sender::StripeSender;
    use crate::shard::shard_bytes;

    /// 루프백 테스트용 설정: 포트 0 (OS 할당)
    fn test_config(lanes: usize) -> Config {
        let mut config = Config::loopback_test();
        config.ports = vec![0; lanes];
        config
    }

    async fn wait_for_bytes(handle: &ReceiverHandle, expected: u64) {
        for _ in 0..250 {
            if handle.total_bytes() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "수신 대기 타임아웃: expected {}, got {}",
            expected,
            handle.total_bytes()
        );
    }

    #[tokio::test]
    async fn test_bind_failure_is_all_or_nothing() {
        // 포트 하나를 선점해 두 번째 바인드를 실패시킨다
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = occupied.local_addr().unwrap().port();

        let mut config = test_config(1);
        config.ports = vec![0, taken_port];

        let result = Receiver::start(config).await;
        assert!(matches!(result, Err(Error::Bind { port, .. }) if port == taken_port));
    }

    #[tokio::test]
    async fn test_end_to_end_striped_transfer() {
        let mut rx_config = test_config(3);
        rx_config.record_sessions = true;
        let handle = Receiver::start(rx_config.clone()).await.unwrap();

        // 10개 샤드: 레인별 {0,3,6,9} / {1,4,7} / {2,5,8}
        let shard_size = rx_config.shard_size;
        let data: Vec<u8> = (0..shard_size * 10).map(|i| (i % 251) as u8).collect();

        let mut tx_config = rx_config.clone();
        tx_config.ports = handle.ports().to_vec();
        let report = StripeSender::new(tx_config)
            .unwrap()
            .send_bytes(&data)
            .await
            .unwrap();

        assert_eq!(report.total_shards, 10);
        assert_eq!(report.shards_dispatched, 10);
        assert_eq!(report.total_bytes, data.len() as u64);
        assert!(report.failed_lanes().is_empty());

        wait_for_bytes(&handle, data.len() as u64).await;
        assert_eq!(handle.total_bytes(), data.len() as u64);
        assert_eq!(handle.total_frames(), 10);

        // 레인별 수신량이 스트라이핑 배분과 일치
        let stats = handle.stats();
        assert_eq!(stats.lanes[0].frames, 4);
        assert_eq!(stats.lanes[1].frames, 3);
        assert_eq!(stats.lanes[2].frames, 3);
        assert_eq!(stats.lanes[0].bytes, 4 * shard_size as u64);

        // 세션 맵에 전 샤드가 기록됨
        let recorded = handle.recorded_shards(report.session_id).unwrap();
        assert_eq!(recorded, (0..10).collect::<Vec<u32>>());

        // 페이로드 내용 검증 (샤드 7 = offset 7 * shard_size)
        let expected = shard_bytes(&data, shard_size).unwrap();
        let payload = handle.recorded_payload(report.session_id, 7).unwrap();
        assert_eq!(payload, expected[7].data);

        assert_eq!(handle.shutdown().await, data.len() as u64);
    }

    #[tokio::test]
    async fn test_isolated_lane_failure() {
        let handle = Receiver::start(test_config(1)).await.unwrap();

        // 리스너 없는 포트를 확보해 두 번째 레인을 실패시킨다
        let dead_port = {
            let tmp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tmp.local_addr().unwrap().port()
        };

        let shard_size = Config::loopback_test().shard_size;
        let data: Vec<u8> = vec![0x42; shard_size * 6];

        let mut tx_config = Config::loopback_test();
        tx_config.ports = vec![handle.ports()[0], dead_port];
        let report = StripeSender::new(tx_config)
            .unwrap()
            .send_bytes(&data)
            .await
            .unwrap();

        // 짝수 인덱스 {0,2,4}만 살아있는 레인으로 전달됨
        let delivered = 3 * shard_size as u64;
        assert_eq!(report.failed_lanes().len(), 1);
        assert_eq!(report.failed_lanes()[0].port, dead_port);
        assert_eq!(report.total_bytes, delivered);

        wait_for_bytes(&handle, delivered).await;
        assert_eq!(handle.total_bytes(), delivered);
        assert_eq!(handle.total_frames(), 3);
    }

    #[tokio::test]
    async fn test_all_lanes_failed() {
        let dead_port = {
            let tmp = TcpListener::bind("127.0.0.1:0").await.unwrap();
            tmp.local_addr().unwrap().port()
        };

        let mut tx_config = Config::loopback_test();
        tx_config.ports = vec![dead_port];
        let result = StripeSender::new(tx_config)
            .unwrap()
            .send_bytes(&[0u8; 1024])
            .await;

        assert!(matches!(
            result,
            Err(Error::AllLanesFailed { failed: 1, total: 1 })
        ));
    }

    #[tokio::test]
    async fn test_malformed_packet_is_skipped() {
        let handle = Receiver::start(test_config(1)).await.unwrap();
        let port = handle.ports()[0];

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        // 헤더(64바이트)보다 짧은 50바이트 프레임 — 스킵되고 연결은 유지
        stream.write_all(&50u32.to_be_bytes()).await.unwrap();
        stream.write_all(&[0xAA; 50]).await.unwrap();

        // 이어서 정상 패킷
        let shards = shard_bytes(b"valid shard payload after a malformed one", 64).unwrap();
        let packet = shards[0].packet(7, 1);
        stream
            .write_all(&(packet.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&packet).await.unwrap();
        stream.write_all(&0u32.to_be_bytes()).await.unwrap();

        let payload_len = (packet.len() - HEADER_SIZE) as u64;
        wait_for_bytes(&handle, payload_len).await;
        assert_eq!(handle.total_bytes(), payload_len);
        assert_eq!(handle.total_frames(), 1);
    }

    #[tokio::test]
    async fn test_midframe_disconnect_counts_nothing() {
        let handle = Receiver::start(test_config(1)).await.unwrap();
        let port = handle.ports()[0];

        {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            // 100바이트를 선언하고 일부만 보낸 채 닫는다
            stream.write_all(&100u32.to_be_bytes()).await.unwrap();
            stream.write_all(&[0xBB; 30]).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.total_bytes(), 0);
        assert_eq!(handle.total_frames(), 0);
    }

    #[tokio::test]
    async fn test_hash_verification_drops_corrupt_payload() {
        let mut config = test_config(1);
        config.verify_hashes = true;
        let handle = Receiver::start(config).await.unwrap();
        let port = handle.ports()[0];

        let shards = shard_bytes(&[0x11u8; 256], 128).unwrap();
        let good = shards[0].packet(99, 2);
        let mut corrupt = shards[1].packet(99, 2).to_vec();
        *corrupt.last_mut().unwrap() ^= 0xFF;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(&(corrupt.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&corrupt).await.unwrap();
        stream
            .write_all(&(good.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&good).await.unwrap();
        stream.write_all(&0u32.to_be_bytes()).await.unwrap();

        wait_for_bytes(&handle, 128).await;
        // 변조 패킷은 버려지고 정상 패킷만 집계됨
        assert_eq!(handle.total_bytes(), 128);
        assert_eq!(handle.total_frames(), 1);
    }

    #[tokio::test]
    async fn test_disk_sink_receives_payload() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sink.bin");

        let mut rx_config = test_config(1);
        rx_config.write_to_disk = true;
        rx_config.output_path = output.clone();
        let handle = Receiver::start(rx_config).await.unwrap();

        let data = vec![0x77u8; Config::loopback_test().shard_size * 2];
        let mut tx_config = Config::loopback_test();
        tx_config.ports = handle.ports().to_vec();
        StripeSender::new(tx_config)
            .unwrap()
            .send_bytes(&data)
            .await
            .unwrap();

        wait_for_bytes(&handle, data.len() as u64).await;
        handle.shutdown().await;

        let written = std::fs::read(&output).unwrap();
        assert_eq!(written.len(), data.len());
    }
}
