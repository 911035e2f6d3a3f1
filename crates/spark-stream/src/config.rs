use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 默认刷写阈值：32 KiB。
pub const DEFAULT_CHUNK_THRESHOLD: i64 = 32 * 1024;
/// 默认批大小：1000 条。
pub const DEFAULT_BATCH_SIZE: i64 = 1000;
/// 默认缓冲容量：50 KiB。
pub const DEFAULT_BUFFER_SIZE: i64 = 50 * 1024;
/// 默认队列深度：4。
pub const DEFAULT_QUEUE_DEPTH: i64 = 4;

/// 流式引擎配置。
///
/// # 设计背景（Why）
/// - 配置常来自外部文件或请求参数，可能出现 0 或负数；引擎选择“宽松归一化”：
///   非正数一律替换为默认值，而不是拒绝整个配置；
/// - 字段使用有符号整数，以便原样承载外部输入，再由 [`validate`](Self::validate) 归一化。
///
/// # 契约说明（What）
/// - `chunk_threshold`：缓冲字节数严格超过该值时刷出一个分块；
/// - `batch_size`：批量抓取器建议的每批条数；
/// - `buffer_size`：租借缓冲的最小容量；
/// - `queue_depth`：条目队列与输出分块队列的深度；
/// - 校验永不失败；`usize` 访问器总是返回归一化后的正数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub chunk_threshold: i64,
    pub batch_size: i64,
    pub buffer_size: i64,
    pub queue_depth: i64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl StreamConfig {
    /// 原地归一化：非正数字段替换为默认值。
    pub fn validate(&mut self) {
        normalize(&mut self.chunk_threshold, DEFAULT_CHUNK_THRESHOLD);
        normalize(&mut self.batch_size, DEFAULT_BATCH_SIZE);
        normalize(&mut self.buffer_size, DEFAULT_BUFFER_SIZE);
        normalize(&mut self.queue_depth, DEFAULT_QUEUE_DEPTH);
    }

    /// 返回归一化后的副本。
    pub fn validated(mut self) -> Self {
        self.validate();
        self
    }

    /// 从 TOML 文本解析配置并归一化；缺省字段取默认值。
    ///
    /// ```
    /// let config = spark_stream::StreamConfig::from_toml_str("chunk_threshold = 1024\nqueue_depth = -1")
    ///     .expect("合法的 TOML");
    /// assert_eq!(config.chunk_threshold(), 1024);
    /// assert_eq!(config.queue_depth(), 4);
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let parsed: StreamConfig = toml::from_str(source)?;
        Ok(parsed.validated())
    }

    pub fn chunk_threshold(&self) -> usize {
        positive(self.chunk_threshold, DEFAULT_CHUNK_THRESHOLD)
    }

    pub fn batch_size(&self) -> usize {
        positive(self.batch_size, DEFAULT_BATCH_SIZE)
    }

    pub fn buffer_size(&self) -> usize {
        positive(self.buffer_size, DEFAULT_BUFFER_SIZE)
    }

    pub fn queue_depth(&self) -> usize {
        positive(self.queue_depth, DEFAULT_QUEUE_DEPTH)
    }
}

fn normalize(value: &mut i64, default: i64) {
    if *value <= 0 {
        *value = default;
    }
}

fn positive(value: i64, default: i64) -> usize {
    let effective = if value > 0 { value } else { default };
    usize::try_from(effective).unwrap_or(usize::MAX)
}
