//! 샤드 정의와 샤더
//!
//! - Shard: 원본 파일의 연속 슬라이스, 샤딩/해싱의 단위
//! - 일괄 모드: `shard_bytes` — 메모리 버퍼를 한 번에 분할 (rayon 병렬 해싱)
//! - 스트리밍 모드: `ShardStream` — 파일을 순차로 읽으며 샤드를 지연 생성,
//!   피크 메모리 O(샤드 크기)

use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use rayon::prelude::*;
use tokio::io::AsyncReadExt;

use crate::header::ShardHeader;
use crate::{Error, Result, HEADER_SIZE, PROTOCOL_VERSION};

/// 세션 ID (64비트, 전송 런당 1회 생성)
pub type SessionId = u64;

/// 새 세션 ID 생성
pub fn new_session_id() -> SessionId {
    rand::random()
}

/// 샤드 (전송 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// 샤드 인덱스 (세션 내 0부터)
    pub index: u32,

    /// 원본 파일 내 바이트 오프셋
    pub offset: u64,

    /// 페이로드
    pub data: Bytes,

    /// 페이로드 128비트 콘텐츠 해시 (xxh3-128)
    pub hash: u128,
}

impl Shard {
    /// 새 샤드 생성 (해시 계산 포함)
    pub fn new(index: u32, offset: u64, data: Bytes) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(&data);
        Self {
            index,
            offset,
            data,
            hash,
        }
    }

    /// 이 샤드의 헤더 구성
    ///
    /// total_shards는 세션 전체가 확정된 뒤에만 알 수 있으므로
    /// 샤드 생성과 분리되어 있다.
    pub fn header(&self, session_id: SessionId, total_shards: u32) -> ShardHeader {
        ShardHeader {
            version: PROTOCOL_VERSION,
            flags: 0,
            session_id,
            shard_index: self.index,
            total_shards,
            offset: self.offset,
            data_len: self.data.len() as u32,
            content_hash: self.hash,
        }
    }

    /// 전송용 패킷 생성 (헤더 ++ 페이로드)
    pub fn packet(&self, session_id: SessionId, total_shards: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.data.len());
        buf.put_slice(&self.header(session_id, total_shards).encode());
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// 일괄 샤딩: 버퍼 전체를 한 번에 분할
///
/// 샤드 해시는 rayon으로 병렬 계산한다. 인덱스/오프셋 순서는
/// par_chunks의 enumerate가 보존한다.
pub fn shard_bytes(data: &[u8], shard_size: usize) -> Result<Vec<Shard>> {
    if shard_size == 0 {
        return Err(Error::ZeroShardSize);
    }

    Ok(data
        .par_chunks(shard_size)
        .enumerate()
        .map(|(idx, chunk)| {
            Shard::new(
                idx as u32,
                (idx * shard_size) as u64,
                Bytes::copy_from_slice(chunk),
            )
        })
        .collect())
}

/// 스트리밍 샤더
///
/// 파일 크기는 열 때 메타데이터에서 확정하므로 첫 샤드를 내보내기 전에
/// total_shards를 알 수 있다. 파일 전체를 버퍼링하지 않는다.
pub struct ShardStream {
    file: tokio::fs::File,
    shard_size: usize,
    file_size: u64,
    total_shards: u32,
    next_index: u32,
    offset: u64,
}

impl ShardStream {
    /// 파일을 열고 샤더 초기화
    pub async fn open(path: impl AsRef<Path>, shard_size: usize) -> Result<Self> {
        if shard_size == 0 {
            return Err(Error::ZeroShardSize);
        }

        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        let total_shards = file_size.div_ceil(shard_size as u64) as u32;

        Ok(Self {
            file,
            shard_size,
            file_size,
            total_shards,
            next_index: 0,
            offset: 0,
        })
    }

    /// 파일 크기 (바이트)
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// 총 샤드 수 (= ceil(file_size / shard_size))
    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    /// 다음 샤드 읽기
    ///
    /// 마지막 샤드는 나머지 길이만큼 짧을 수 있다.
    /// 파일 끝에 도달하면 None. 중간 읽기 실패는 IO 에러로 전파.
    pub async fn next_shard(&mut self) -> Result<Option<Shard>> {
        if self.offset >= self.file_size {
            return Ok(None);
        }

        let want = (self.file_size - self.offset).min(self.shard_size as u64) as usize;
        let mut buf = vec![0u8; want];
        self.file.read_exact(&mut buf).await?;

        let shard = Shard::new(self.next_index, self.offset, Bytes::from(buf));
        self.next_index += 1;
        self.offset += want as u64;

        Ok(Some(shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_shard_bytes_coverage() {
        let data: Vec<u8> = (0..=255u8).cycle().take(250).collect();
        let shards = shard_bytes(&data, 100).unwrap();

        assert_eq!(shards.len(), 3);
        assert_eq!(shards[0].offset, 0);
        assert_eq!(shards[1].offset, 100);
        assert_eq!(shards[2].offset, 200);
        assert_eq!(shards[2].data.len(), 50);

        // 갭/중첩 없이 전체를 덮는다
        let total: usize = shards.iter().map(|s| s.data.len()).sum();
        assert_eq!(total, data.len());
        for pair in shards.windows(2) {
            assert_eq!(pair[0].offset + pair[0].data.len() as u64, pair[1].offset);
        }
    }

    #[test]
    fn test_shard_bytes_exact_division() {
        let data = vec![0xABu8; 300];
        let shards = shard_bytes(&data, 100).unwrap();
        assert_eq!(shards.len(), 3);
        assert!(shards.iter().all(|s| s.data.len() == 100));
    }

    #[test]
    fn test_shard_bytes_empty_and_zero() {
        assert!(shard_bytes(&[], 100).unwrap().is_empty());
        assert!(matches!(shard_bytes(b"abc", 0), Err(Error::ZeroShardSize)));
    }

    #[test]
    fn test_hash_determinism() {
        let data = vec![0x5Au8; 1000];
        let first = shard_bytes(&data, 256).unwrap();
        let second = shard_bytes(&data, 256).unwrap();

        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.hash, xxhash_rust::xxh3::xxh3_128(&a.data));
        }
    }

    #[test]
    fn test_packet_layout() {
        let shards = shard_bytes(b"payload bytes here", 8).unwrap();
        let session_id = 0x1122_3344_5566_7788;
        let packet = shards[1].packet(session_id, shards.len() as u32);

        assert_eq!(packet.len(), HEADER_SIZE + shards[1].data.len());

        let header = ShardHeader::decode(&packet).unwrap();
        assert_eq!(header.session_id, session_id);
        assert_eq!(header.shard_index, 1);
        assert_eq!(header.total_shards, 3);
        assert_eq!(header.offset, 8);
        assert_eq!(header.data_len as usize, shards[1].data.len());
        assert_eq!(&packet[HEADER_SIZE..], &shards[1].data[..]);
        assert!(header.verify_payload(&packet[HEADER_SIZE..]).is_ok());
    }

    #[tokio::test]
    async fn test_stream_matches_batch() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|n| n.to_le_bytes()).collect();

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        let batch = shard_bytes(&data, 4096).unwrap();
        let mut stream = ShardStream::open(tmp.path(), 4096).await.unwrap();

        assert_eq!(stream.file_size(), data.len() as u64);
        assert_eq!(stream.total_shards() as usize, batch.len());

        let mut streamed = Vec::new();
        while let Some(shard) = stream.next_shard().await.unwrap() {
            streamed.push(shard);
        }
        assert_eq!(streamed, batch);
    }

    #[tokio::test]
    async fn test_stream_empty_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut stream = ShardStream::open(tmp.path(), 4096).await.unwrap();

        assert_eq!(stream.total_shards(), 0);
        assert!(stream.next_shard().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_missing_file() {
        let result = ShardStream::open("/no/such/ssp_input.bin", 4096).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
