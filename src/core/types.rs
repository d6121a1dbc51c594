use crate::core::error::{PlayerError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// 未知时间戳哨兵值
///
/// 容器未携带 pts 时使用。NAN 与任何比较都为假，
/// 同步计算前必须先经 is_valid_pts 检查。
pub const NO_PTS: f64 = f64::NAN;

/// pts 是否可用于同步计算（有限值才有效）
#[inline]
pub fn is_valid_pts(pts: f64) -> bool {
    pts.is_finite()
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    RGBA,
    RGB,
    YUV420P,
    NV12,
}

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
}

/// 视频帧（解码输出，展示级按 Arc 共享分发）
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// 展示时间戳（秒），未知时为 NO_PTS
    pub pts: f64,
    /// 帧时长（秒），由平均帧率推导
    pub duration: f64,
    /// 所属流索引
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

/// 音频帧（重采样后的交织样本）
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: f64,
    pub duration: f64,
    pub stream_index: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub data: Vec<f32>,
}

/// 字幕帧
#[derive(Debug, Clone)]
pub struct SubtitleFrame {
    pub pts: f64,
    /// 显示时长（秒）
    pub duration: f64,
    /// 消失时间 = pts + duration
    pub end_pts: f64,
    pub stream_index: usize,
    pub text: String,
}

/// 主时钟选择
///
/// Audio: 音频轨为主（默认，人耳对音频卡顿最敏感）
/// Video: 视频轨为主
/// None: 不同步，各轨道自由运行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMaster {
    Audio,
    Video,
    None,
}

/// 同步与队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 主时钟轨道，所选轨道缺失时自动回退
    pub master: SyncMaster,
    /// 同步容差（秒）：落后主时钟超过该值的单元被丢弃
    pub sync_tolerance: f64,
    /// 超前断裂阈值（秒）：超前超过该值视为时间戳断裂，同样丢弃
    pub max_sync_gap: f64,
    /// 视频包队列容量
    pub packet_queue_capacity: usize,
    /// 音频包队列容量（音频包小而密，容量略低即可）
    pub audio_packet_capacity: usize,
    pub video_frame_capacity: usize,
    pub audio_frame_capacity: usize,
    pub subtitle_frame_capacity: usize,
    /// 队列取件轮询间隔（毫秒），决定 stop() 响应时间上界
    pub queue_poll_ms: u64,
    /// 是否尝试硬件解码（失败自动回退软解）
    pub use_hw: bool,
    /// 目标音频采样率
    pub audio_sample_rate: u32,
    /// 目标音频声道数
    pub audio_channels: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            master: SyncMaster::Audio,
            sync_tolerance: 0.1,
            max_sync_gap: 10.0,
            packet_queue_capacity: 200,
            audio_packet_capacity: 150,
            video_frame_capacity: 16,
            audio_frame_capacity: 32,
            subtitle_frame_capacity: 16,
            queue_poll_ms: 10,
            use_hw: cfg!(feature = "hwaccel"),
            audio_sample_rate: 48000,
            audio_channels: 2,
        }
    }
}

impl SyncConfig {
    /// 从 JSON 文本解析配置，未出现的字段取默认值
    pub fn from_json(text: &str) -> Result<Self> {
        let config: SyncConfig = serde_json::from_str(text)
            .map_err(|e| PlayerError::ArgumentError(format!("配置解析失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.sync_tolerance.is_finite() || self.sync_tolerance < 0.0 {
            return Err(PlayerError::ArgumentError(format!(
                "同步容差非法: {}",
                self.sync_tolerance
            )));
        }
        if !self.max_sync_gap.is_finite() || self.max_sync_gap <= 0.0 {
            return Err(PlayerError::ArgumentError(format!(
                "断裂阈值非法: {}",
                self.max_sync_gap
            )));
        }
        if self.queue_poll_ms == 0 || self.queue_poll_ms > 1000 {
            return Err(PlayerError::ArgumentError(format!(
                "轮询间隔必须在 1..=1000 毫秒: {}",
                self.queue_poll_ms
            )));
        }
        if self.audio_channels == 0 || self.audio_sample_rate == 0 {
            return Err(PlayerError::ArgumentError("音频参数不能为零".to_string()));
        }
        Ok(())
    }
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Opening,
    Playing,
    Paused,
    Seeking,
    Stopped,
    Error,
}

/// 媒体信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    /// 总时长（毫秒），未知为 0
    pub duration: i64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub has_video: bool,
    pub has_audio: bool,
    pub has_subtitle: bool,
}

impl Default for MediaInfo {
    fn default() -> Self {
        Self {
            duration: 0,
            width: 0,
            height: 0,
            fps: 0.0,
            video_codec: "none".to_string(),
            audio_codec: "none".to_string(),
            sample_rate: 0,
            channels: 0,
            has_video: false,
            has_audio: false,
            has_subtitle: false,
        }
    }
}

/// 单轨运行统计快照
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrackStats {
    /// 已呈现单元数
    pub presented: u64,
    /// 因失步/过期被丢弃的单元数
    pub dropped: u64,
    /// 该轨道是否已排空（上游 EOF 且缓冲耗尽）
    pub finished: bool,
}

/// 轨道运行计数器（工作线程只增，状态查询时做快照）
#[derive(Debug, Default)]
pub struct TrackCounters {
    pub presented: AtomicU64,
    pub dropped: AtomicU64,
}

impl TrackCounters {
    pub fn add_presented(&self) {
        self.presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, finished: bool) -> TrackStats {
        TrackStats {
            presented: self.presented.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            finished,
        }
    }
}

/// 会话状态快照（毫秒粒度，供外部轮询）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerState {
    pub state: PlaybackState,
    /// 当前位置（毫秒）
    pub position: i64,
    /// 总时长（毫秒）
    pub duration: i64,
    pub speed: f64,
    pub media_info: Option<MediaInfo>,
    pub video: TrackStats,
    pub audio: TrackStats,
    pub subtitle: TrackStats,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            state: PlaybackState::Idle,
            position: 0,
            duration: 0,
            speed: 1.0,
            media_info: None,
            video: TrackStats::default(),
            audio: TrackStats::default(),
            subtitle: TrackStats::default(),
        }
    }
}
