use thiserror::Error;

/// 流水线错误分类
///
/// 按影响范围划分：
/// - ResourceError: 资源打开失败（解码器/硬件设备），仅对该轨道致命
/// - TransformError: 单个单元解码/变换失败，丢弃该单元后继续运行
/// - SyncError: 延迟超出同步窗口，丢弃并计数
/// - ArgumentError: 调用参数非法，直接拒绝，不改变任何状态
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开媒体: {0}")]
    OpenError(String),

    #[error("资源错误: {0}")]
    ResourceError(String),

    #[error("变换错误: {0}")]
    TransformError(String),

    #[error("同步错误: {0}")]
    SyncError(String),

    #[error("参数错误: {0}")]
    ArgumentError(String),

    #[error("音频输出错误: {0}")]
    AudioError(String),

    #[error("其他错误: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PlayerError>;
