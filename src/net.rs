//! 소켓 튜닝과 프레임 I/O
//!
//! 프레임 포맷: `[u32 BE 길이][길이만큼의 패킷 바이트]`, 길이 0은
//! 해당 연결의 정상 스트림 종료 신호.

use std::io;

use bytes::Bytes;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::LEN_PREFIX_SIZE;

/// 소켓 버퍼 크기 설정 + Nagle 비활성화
///
/// 튜닝은 최적화일 뿐 정확성 요건이 아니다. 실패는 모두 삼키고
/// 성공 여부만 돌려준다. 호출자는 반환값을 무시해도 된다.
pub fn tune_socket(stream: &TcpStream, sndbuf: usize, rcvbuf: usize) -> bool {
    let sock = SockRef::from(stream);
    let mut ok = true;

    if sock.set_send_buffer_size(sndbuf).is_err() {
        ok = false;
    }
    if sock.set_recv_buffer_size(rcvbuf).is_err() {
        ok = false;
    }
    if sock.set_nodelay(true).is_err() {
        ok = false;
    }

    ok
}

/// 패킷 하나를 길이 프리픽스 프레임으로 기록
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &[u8]) -> io::Result<()> {
    writer.write_all(&(packet.len() as u32).to_be_bytes()).await?;
    writer.write_all(packet).await
}

/// 길이 0 종료 프레임 기록
pub async fn write_terminator<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&0u32.to_be_bytes()).await
}

/// 프레임 하나 읽기
///
/// Ok(None)은 길이 0 종료 프레임. 프리픽스나 본문을 읽는 중 피어가
/// 닫으면 UnexpectedEof가 그대로 전파된다 (호출측에서 정상 단절로 처리).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; LEN_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;

    let n = u32::from_be_bytes(len_buf) as usize;
    if n == 0 {
        return Ok(None);
    }

    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);

        write_frame(&mut tx, b"first packet").await.unwrap();
        write_frame(&mut tx, b"second").await.unwrap();
        write_terminator(&mut tx).await.unwrap();

        assert_eq!(read_frame(&mut rx).await.unwrap().unwrap(), &b"first packet"[..]);
        assert_eq!(read_frame(&mut rx).await.unwrap().unwrap(), &b"second"[..]);
        assert!(read_frame(&mut rx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_eof() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);

        // 본문이 선언 길이보다 짧은 채로 연결이 끊긴다
        tx.write_all(&100u32.to_be_bytes()).await.unwrap();
        tx.write_all(b"only fifty... not really").await.unwrap();
        drop(tx);

        let err = read_frame(&mut rx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_empty_stream_is_eof() {
        let (tx, mut rx) = tokio::io::duplex(64);
        drop(tx);

        let err = read_frame(&mut rx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
