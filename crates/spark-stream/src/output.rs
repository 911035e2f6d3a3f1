//! 输出契约：分块序列与每次调用的结果句柄。

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tokio_util::sync::DropGuard;

use crate::error::StreamError;

/// 引擎无法预知条目总数时使用的计数提示。
pub const UNKNOWN_ITEM_COUNT: i64 = -1;

/// 调用成功启动时的状态码。
pub const STATUS_OK: u16 = 200;

/// 输出序列中的单个分块。
///
/// `Data` 与 `Error` 互斥；`Error` 分块一定是序列中的最后一个。
#[derive(Debug)]
pub enum OutputChunk {
    Data(Bytes),
    Error(StreamError),
}

impl OutputChunk {
    /// 数据分块的字节；错误分块返回 `None`。
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            OutputChunk::Data(bytes) => Some(bytes),
            OutputChunk::Error(_) => None,
        }
    }

    /// 错误分块携带的错误；数据分块返回 `None`。
    pub fn error(&self) -> Option<&StreamError> {
        match self {
            OutputChunk::Data(_) => None,
            OutputChunk::Error(error) => Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutputChunk::Error(_))
    }
}

/// 一次性的分块序列。
///
/// # 契约说明（What）
/// - 实现 `futures::Stream<Item = OutputChunk>`，序列有限；消费完毕后持续返回 `None`；
/// - 遇到错误分块后不会再有任何分块；
/// - 提前丢弃该句柄视为“放弃本次调用”：内部持有的取消守卫会触发调用级取消令牌，
///   编排任务与抓取器随之停止并释放资源。
#[derive(Debug)]
pub struct ChunkStream {
    receiver: mpsc::Receiver<OutputChunk>,
    _abandon: Option<DropGuard>,
}

impl ChunkStream {
    pub(crate) fn new(receiver: mpsc::Receiver<OutputChunk>, abandon: DropGuard) -> Self {
        Self {
            receiver,
            _abandon: Some(abandon),
        }
    }

    /// 不会产生任何分块的空序列。
    pub fn empty() -> Self {
        let (_, receiver) = mpsc::channel(1);
        Self {
            receiver,
            _abandon: None,
        }
    }

    /// 等待下一个分块；序列结束时返回 `None`。
    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        self.receiver.recv().await
    }

    /// 拼接全部数据分块，直到序列结束或遇到错误分块。
    pub async fn collect_payload(mut self) -> CollectedPayload {
        let mut payload = BytesMut::new();
        let mut chunks = 0;
        while let Some(chunk) = self.next_chunk().await {
            match chunk {
                OutputChunk::Data(bytes) => {
                    chunks += 1;
                    payload.extend_from_slice(&bytes);
                }
                OutputChunk::Error(error) => {
                    return CollectedPayload {
                        payload: payload.freeze(),
                        chunks,
                        error: Some(error),
                    };
                }
            }
        }
        CollectedPayload {
            payload: payload.freeze(),
            chunks,
            error: None,
        }
    }

    /// 把数据分块依次写入 `writer`，返回写入的字节数。
    ///
    /// 遇到错误分块时停止并返回该错误；已写入的前缀不会回滚，由调用方决定如何收尾。
    pub async fn write_to<W>(mut self, writer: &mut W) -> Result<u64, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await {
            match chunk {
                OutputChunk::Data(bytes) => {
                    writer.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                OutputChunk::Error(error) => return Err(error),
            }
        }
        writer.flush().await?;
        Ok(written)
    }
}

impl Stream for ChunkStream {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// [`ChunkStream::collect_payload`] 的结果。
///
/// - `payload`：全部数据分块按序拼接后的字节；
/// - `chunks`：数据分块的数量；
/// - `error`：终止序列的错误分块（若有）。
#[derive(Debug)]
pub struct CollectedPayload {
    pub payload: Bytes,
    pub chunks: usize,
    pub error: Option<StreamError>,
}

/// 一次流式调用的结果句柄。
///
/// - `item_count_hint`：本引擎总是报告 [`UNKNOWN_ITEM_COUNT`]，需要总数头的调用方自行计算；
/// - `chunks`：输出分块序列，调用方负责排空并转发到传输层；
/// - `status_code` / `init_error`：调用是否成功启动；引擎自身启动的调用总是 `200` 且无初始化错误，
///   协作者可用 [`StreamResult::rejected`] 报告启动前的失败。
#[derive(Debug)]
pub struct StreamResult {
    pub item_count_hint: i64,
    pub chunks: ChunkStream,
    pub status_code: u16,
    pub init_error: Option<StreamError>,
}

impl StreamResult {
    pub(crate) fn started(chunks: ChunkStream) -> Self {
        Self {
            item_count_hint: UNKNOWN_ITEM_COUNT,
            chunks,
            status_code: STATUS_OK,
            init_error: None,
        }
    }

    /// 构造一个未启动的结果：携带状态码与初始化错误，分块序列为空。
    pub fn rejected(status_code: u16, error: StreamError) -> Self {
        Self {
            item_count_hint: UNKNOWN_ITEM_COUNT,
            chunks: ChunkStream::empty(),
            status_code,
            init_error: Some(error),
        }
    }

    /// 是否成功启动。
    pub fn is_started(&self) -> bool {
        self.init_error.is_none()
    }
}
