//! 전송 통계

use std::time::{Duration, Instant};

/// 레인별 통계
#[derive(Debug, Clone)]
pub struct LaneStats {
    /// 레인 식별자 = 설정된 포트 번호
    pub port: u16,

    /// 전송/수신 페이로드 바이트
    pub bytes: u64,

    /// 프레임 수 (종료 프레임 제외)
    pub frames: u64,

    /// 레인 실패 시 에러 설명
    pub error: Option<String>,
}

impl LaneStats {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bytes: 0,
            frames: 0,
            error: None,
        }
    }

    /// 프레임 하나 기록
    pub fn record_frame(&mut self, payload_len: usize) {
        self.frames += 1;
        self.bytes += payload_len as u64;
    }

    /// 레인 실패 여부
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 총 페이로드 바이트
    pub total_bytes: u64,

    /// 총 프레임 수
    pub total_frames: u64,

    /// 레인별 통계
    pub lanes: Vec<LaneStats>,
}

impl TransferStats {
    pub fn new(ports: &[u16]) -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes: 0,
            total_frames: 0,
            lanes: ports.iter().map(|&p| LaneStats::new(p)).collect(),
        }
    }

    /// 레인 통계 합산으로 전체 집계 갱신
    pub fn aggregate(&mut self) {
        self.total_bytes = self.lanes.iter().map(|l| l.bytes).sum();
        self.total_frames = self.lanes.iter().map(|l| l.frames).sum();
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 처리율 (bytes/sec)
    pub fn overall_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 전체 처리율 (Gbps)
    pub fn throughput_gbps(&self) -> f64 {
        self.overall_throughput() * 8.0 / 1e9
    }

    /// 실패 레인 수
    pub fn failed_lanes(&self) -> usize {
        self.lanes.iter().filter(|l| l.failed()).count()
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Frames: {} | Bytes: {} | Throughput: {:.2} MB/s ({:.2} Gbps) | Lanes: {} ok / {} failed",
            self.elapsed().as_secs_f64(),
            self.total_frames,
            self.total_bytes,
            self.overall_throughput() / 1_000_000.0,
            self.throughput_gbps(),
            self.lanes.len() - self.failed_lanes(),
            self.failed_lanes(),
        )
    }
}
