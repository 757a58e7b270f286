//! 에러 타입 정의

use thiserror::Error;

/// SSP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("포트 바인드 실패: port={port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("포트 목록이 비어 있음")]
    EmptyPortList,

    #[error("샤드 크기가 0")]
    ZeroShardSize,

    #[error("유효하지 않은 매직 태그: expected {expected:02X?}, got {got:02X?}")]
    InvalidMagicTag { expected: [u8; 5], got: [u8; 5] },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("헤더가 너무 짧음: {len} bytes (최소 {min})")]
    HeaderTooShort { len: usize, min: usize },

    #[error("페이로드 길이 불일치: header={declared}, actual={actual}")]
    PayloadLengthMismatch { declared: u32, actual: usize },

    #[error("콘텐츠 해시 불일치: shard_index={shard_index}")]
    HashMismatch { shard_index: u32 },

    #[error("모든 레인 실패: {failed}/{total}")]
    AllLanesFailed { failed: usize, total: usize },
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
