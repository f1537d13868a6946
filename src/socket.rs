//! 스트라이핑 소켓
//!
//! N개 연결을 읽기/쓰기 반쪽으로 나눠 하나의 송신자와 하나의 수신자로 묶는다.
//! 제어 채널 계층은 연결을 연 뒤 `open_striped`만 호출하면 된다.

use std::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::reader::StripedReader;
use crate::stats::TransferStats;
use crate::writer::StripedWriter;
use crate::{Config, Result};

/// 스트라이핑에 사용할 수 있는 연결
///
/// 연결 내부에서는 순서가 보장되고 신뢰성 있는 바이트 스트림이어야 한다.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 논리 객체 읽기 스트림
pub trait StreamReader {
    /// 최대 buf.len()바이트 읽기, 스트림 끝이면 0
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> impl Future<Output = Result<usize>> + Send + 'a;
}

/// 논리 객체 쓰기 스트림
pub trait StreamWriter {
    /// 최대 세그먼트 길이만큼 쓰고 쓴 길이 반환
    fn write<'a>(&'a mut self, buf: &'a [u8]) -> impl Future<Output = Result<usize>> + Send + 'a;

    /// 종료 마커 전송 후 연결 종료
    fn close(&mut self) -> impl Future<Output = Result<TransferStats>> + Send + '_;
}

impl<R> StreamReader for StripedReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> impl Future<Output = Result<usize>> + Send + 'a {
        StripedReader::read(self, buf)
    }
}

impl<W> StreamWriter for StripedWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn write<'a>(&'a mut self, buf: &'a [u8]) -> impl Future<Output = Result<usize>> + Send + 'a {
        StripedWriter::write(self, buf)
    }

    fn close(&mut self) -> impl Future<Output = Result<TransferStats>> + Send + '_ {
        self.finish()
    }
}

/// 연결들을 송신자/수신자 쌍으로 변환
pub fn open_striped<C>(
    connections: Vec<C>,
    config: &Config,
) -> Result<(StripedWriter<WriteHalf<C>>, StripedReader<ReadHalf<C>>)>
where
    C: Connection,
{
    let (read_halves, write_halves): (Vec<_>, Vec<_>) =
        connections.into_iter().map(tokio::io::split).unzip();

    let writer = StripedWriter::new(write_halves, config.clone())?;
    let reader = StripedReader::new(read_halves, config.clone())?;
    Ok((writer, reader))
}

/// 송신자와 수신자를 함께 소유하는 소켓
pub struct StripedSocket<C> {
    writer: StripedWriter<WriteHalf<C>>,
    reader: StripedReader<ReadHalf<C>>,
}

impl<C> StripedSocket<C>
where
    C: Connection,
{
    pub fn new(connections: Vec<C>, config: &Config) -> Result<Self> {
        let (writer, reader) = open_striped(connections, config)?;
        Ok(Self { writer, reader })
    }

    pub fn writer(&mut self) -> &mut StripedWriter<WriteHalf<C>> {
        &mut self.writer
    }

    pub fn reader(&mut self) -> &mut StripedReader<ReadHalf<C>> {
        &mut self.reader
    }

    /// 전체 바이트 전송 후 종료
    pub async fn send(&mut self, data: Bytes) -> Result<TransferStats> {
        self.writer.write_bytes(data).await?;
        self.writer.finish().await
    }

    /// 상대가 보낸 객체 전체 수신
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.reader.read_to_end(&mut out).await?;
        Ok(out)
    }
}

impl<C> StreamReader for StripedSocket<C>
where
    C: Connection,
{
    fn read<'a>(&'a mut self, buf: &'a mut [u8]) -> impl Future<Output = Result<usize>> + Send + 'a {
        self.reader.read(buf)
    }
}

impl<C> StreamWriter for StripedSocket<C>
where
    C: Connection,
{
    fn write<'a>(&'a mut self, buf: &'a [u8]) -> impl Future<Output = Result<usize>> + Send + 'a {
        self.writer.write(buf)
    }

    fn close(&mut self) -> impl Future<Output = Result<TransferStats>> + Send + '_ {
        self.writer.finish()
    }
}
