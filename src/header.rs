//! 샤드 헤더 코덱
//!
//! 고정 64바이트 빅엔디언 레이아웃. 직렬화 라이브러리를 쓰지 않고
//! 오프셋을 직접 배치한다. 와이어 포맷이 프로토콜로 고정되어 있기 때문.

use crate::{Error, Result, HEADER_SIZE, MAGIC_TAG, PROTOCOL_VERSION};

// 레이아웃:
// magic(5) + version(1) + flags(1) + session_id(8) + shard_index(4)
// + total_shards(4) + offset(8) + data_len(4) + content_hash(16)
// + reserved(13) = 64
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_FLAGS: usize = 6;
const OFF_SESSION_ID: usize = 7;
const OFF_SHARD_INDEX: usize = 15;
const OFF_TOTAL_SHARDS: usize = 19;
const OFF_OFFSET: usize = 23;
const OFF_DATA_LEN: usize = 31;
const OFF_CONTENT_HASH: usize = 35;
const OFF_RESERVED: usize = 51;

/// 샤드 헤더
///
/// 모든 샤드 패킷의 선두 64바이트. reserved 영역은 인코딩 시 0으로
/// 채우고 디코딩 시 값을 해석하지 않는다 (향후 확장용).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHeader {
    /// 프로토콜 버전
    pub version: u8,

    /// 플래그 (예약, 기본 0)
    pub flags: u8,

    /// 세션 ID (전송 런당 1회 생성)
    pub session_id: u64,

    /// 샤드 인덱스 (세션 내 0부터)
    pub shard_index: u32,

    /// 세션 내 총 샤드 수
    pub total_shards: u32,

    /// 원본 파일 내 바이트 오프셋
    pub offset: u64,

    /// 페이로드 길이 (헤더 직후 바이트 수)
    pub data_len: u32,

    /// 페이로드 128비트 콘텐츠 해시 (xxh3-128)
    pub content_hash: u128,
}

impl ShardHeader {
    /// 헤더를 64바이트로 인코딩
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 5].copy_from_slice(&MAGIC_TAG);
        buf[OFF_VERSION] = self.version;
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_SESSION_ID..OFF_SESSION_ID + 8].copy_from_slice(&self.session_id.to_be_bytes());
        buf[OFF_SHARD_INDEX..OFF_SHARD_INDEX + 4]
            .copy_from_slice(&self.shard_index.to_be_bytes());
        buf[OFF_TOTAL_SHARDS..OFF_TOTAL_SHARDS + 4]
            .copy_from_slice(&self.total_shards.to_be_bytes());
        buf[OFF_OFFSET..OFF_OFFSET + 8].copy_from_slice(&self.offset.to_be_bytes());
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 4].copy_from_slice(&self.data_len.to_be_bytes());
        buf[OFF_CONTENT_HASH..OFF_CONTENT_HASH + 16]
            .copy_from_slice(&self.content_hash.to_be_bytes());
        // OFF_RESERVED..HEADER_SIZE는 0 유지
        buf
    }

    /// 64바이트에서 헤더 디코딩
    ///
    /// 64바이트 미만 입력은 거부. magic/version 불일치도 에러.
    /// reserved 영역은 어떤 값이든 통과시킨다.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::HeaderTooShort {
                len: bytes.len(),
                min: HEADER_SIZE,
            });
        }

        let mut magic = [0u8; 5];
        magic.copy_from_slice(&bytes[OFF_MAGIC..OFF_MAGIC + 5]);
        if magic != MAGIC_TAG {
            return Err(Error::InvalidMagicTag {
                expected: MAGIC_TAG,
                got: magic,
            });
        }

        let version = bytes[OFF_VERSION];
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        Ok(Self {
            version,
            flags: bytes[OFF_FLAGS],
            session_id: u64::from_be_bytes(bytes[OFF_SESSION_ID..OFF_SESSION_ID + 8].try_into().unwrap()),
            shard_index: u32::from_be_bytes(
                bytes[OFF_SHARD_INDEX..OFF_SHARD_INDEX + 4].try_into().unwrap(),
            ),
            total_shards: u32::from_be_bytes(
                bytes[OFF_TOTAL_SHARDS..OFF_TOTAL_SHARDS + 4].try_into().unwrap(),
            ),
            offset: u64::from_be_bytes(bytes[OFF_OFFSET..OFF_OFFSET + 8].try_into().unwrap()),
            data_len: u32::from_be_bytes(bytes[OFF_DATA_LEN..OFF_DATA_LEN + 4].try_into().unwrap()),
            content_hash: u128::from_be_bytes(
                bytes[OFF_CONTENT_HASH..OFF_CONTENT_HASH + 16].try_into().unwrap(),
            ),
        })
    }

    /// 페이로드가 헤더의 data_len/content_hash와 일치하는지 검증
    pub fn verify_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() != self.data_len as usize {
            return Err(Error::PayloadLengthMismatch {
                declared: self.data_len,
                actual: payload.len(),
            });
        }
        let hash = xxhash_rust::xxh3::xxh3_128(payload);
        if hash != self.content_hash {
            return Err(Error::HashMismatch {
                shard_index: self.shard_index,
            });
        }
        Ok(())
    }
}
