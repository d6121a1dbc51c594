use crate::core::{MediaInfo, PlayerError, Result, NO_PTS};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::media;
use log::{debug, info, warn};

/// 包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Video,
    Audio,
    Subtitle,
}

/// 解封装出的原始包
///
/// pts/duration 已在入口换算成秒（各流时间基不同，越早换算
/// 下游越不用携带时间基）。
pub struct MediaPacket {
    pub packet: ffmpeg::Packet,
    pub packet_type: PacketType,
    pub stream_index: usize,
    /// 展示时间戳（秒），容器未携带时为 NO_PTS
    pub pts: f64,
    /// 包时长（秒），未知为 0
    pub duration: f64,
}

// ffmpeg::Packet 内部是引用计数的 AVPacket，所有权在线程间
// 只做单向转移，不共享访问
unsafe impl Send for MediaPacket {}

/// 包来源抽象：喂包线程只依赖该接口
pub trait PacketSource: Send {
    /// 读下一个感兴趣的包；Ok(None) 表示 EOF
    fn read_packet(&mut self) -> Result<Option<MediaPacket>>;

    /// 跳转到目标位置（秒）
    fn seek(&mut self, position: f64) -> Result<()>;

    fn media_info(&self) -> &MediaInfo;

    fn video_stream_index(&self) -> Option<usize>;
    fn audio_stream_index(&self) -> Option<usize>;
    fn subtitle_stream_index(&self) -> Option<usize>;

    fn description(&self) -> String;
}

/// 本地文件解封装器
pub struct Demuxer {
    input_ctx: ffmpeg::format::context::Input,
    video_stream_index: Option<usize>,
    audio_stream_index: Option<usize>,
    subtitle_stream_index: Option<usize>,
    /// 每条流的时间基（秒/刻度），按流索引下标
    time_bases: Vec<f64>,
    media_info: MediaInfo,
    path: String,
}

impl Demuxer {
    /// 打开媒体文件并选出最佳音视频流与首个字幕流
    ///
    /// 视频流缺失不致命（纯音频文件照常播放），音视频都缺失
    /// 才拒绝打开。
    pub fn open(path: &str) -> Result<Self> {
        info!("打开媒体文件: {}", path);
        let input_ctx = ffmpeg::format::input(&path)?;

        let video_stream_index = input_ctx
            .streams()
            .best(media::Type::Video)
            .map(|s| s.index());
        let audio_stream_index = input_ctx
            .streams()
            .best(media::Type::Audio)
            .map(|s| s.index());
        let subtitle_stream_index = input_ctx
            .streams()
            .find(|s| s.parameters().medium() == media::Type::Subtitle)
            .map(|s| s.index());

        if video_stream_index.is_none() && audio_stream_index.is_none() {
            return Err(PlayerError::OpenError(format!(
                "{} 中没有可用的音视频流",
                path
            )));
        }

        let time_bases = input_ctx
            .streams()
            .map(|s| {
                let tb = s.time_base();
                if tb.denominator() != 0 {
                    tb.numerator() as f64 / tb.denominator() as f64
                } else {
                    0.0
                }
            })
            .collect();

        let media_info = Self::extract_media_info(
            &input_ctx,
            video_stream_index,
            audio_stream_index,
            subtitle_stream_index,
        );
        info!(
            "媒体信息: 时长 {}ms, 视频 {} ({}x{} @{:.2}fps), 音频 {} ({}Hz {}声道)",
            media_info.duration,
            media_info.video_codec,
            media_info.width,
            media_info.height,
            media_info.fps,
            media_info.audio_codec,
            media_info.sample_rate,
            media_info.channels
        );

        Ok(Self {
            input_ctx,
            video_stream_index,
            audio_stream_index,
            subtitle_stream_index,
            time_bases,
            media_info,
            path: path.to_string(),
        })
    }

    fn extract_media_info(
        input_ctx: &ffmpeg::format::context::Input,
        video_index: Option<usize>,
        audio_index: Option<usize>,
        subtitle_index: Option<usize>,
    ) -> MediaInfo {
        let mut info = MediaInfo::default();

        // duration 是 AV_TIME_BASE（微秒）刻度
        let duration_us = input_ctx.duration();
        if duration_us > 0 {
            info.duration = duration_us / 1000;
        }

        if let Some(index) = video_index {
            if let Some(stream) = input_ctx.streams().find(|s| s.index() == index) {
                info.has_video = true;
                info.video_codec = format!("{:?}", stream.parameters().id());
                let rate = stream.avg_frame_rate();
                if rate.denominator() != 0 {
                    info.fps = rate.numerator() as f64 / rate.denominator() as f64;
                }
                if let Ok(ctx) =
                    ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                {
                    if let Ok(video) = ctx.decoder().video() {
                        info.width = video.width();
                        info.height = video.height();
                    }
                }
            }
        }
        if let Some(index) = audio_index {
            if let Some(stream) = input_ctx.streams().find(|s| s.index() == index) {
                info.has_audio = true;
                info.audio_codec = format!("{:?}", stream.parameters().id());
                if let Ok(ctx) =
                    ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                {
                    if let Ok(audio) = ctx.decoder().audio() {
                        info.sample_rate = audio.rate();
                        info.channels = audio.channels();
                    }
                }
            }
        }
        info.has_subtitle = subtitle_index.is_some();
        info
    }

    /// 按流索引把刻度时间换算成秒
    fn to_seconds(&self, stream_index: usize, ticks: i64) -> f64 {
        let tb = self.time_bases.get(stream_index).copied().unwrap_or(0.0);
        ticks as f64 * tb
    }

    pub fn video_stream(&self) -> Option<ffmpeg::format::stream::Stream<'_>> {
        self.video_stream_index
            .and_then(|index| self.input_ctx.streams().find(|s| s.index() == index))
    }

    pub fn audio_stream(&self) -> Option<ffmpeg::format::stream::Stream<'_>> {
        self.audio_stream_index
            .and_then(|index| self.input_ctx.streams().find(|s| s.index() == index))
    }

    pub fn subtitle_stream(&self) -> Option<ffmpeg::format::stream::Stream<'_>> {
        self.subtitle_stream_index
            .and_then(|index| self.input_ctx.streams().find(|s| s.index() == index))
    }
}

impl PacketSource for Demuxer {
    fn read_packet(&mut self) -> Result<Option<MediaPacket>> {
        loop {
            // Stream 借用着输入上下文，只把流索引带出语句
            let next = self
                .input_ctx
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            let (stream_index, packet) = match next {
                Some(pair) => pair,
                None => return Ok(None),
            };
            let packet_type = if Some(stream_index) == self.video_stream_index {
                PacketType::Video
            } else if Some(stream_index) == self.audio_stream_index {
                PacketType::Audio
            } else if Some(stream_index) == self.subtitle_stream_index {
                PacketType::Subtitle
            } else {
                // 未选中的流（封面图、数据流等）直接跳过
                continue;
            };
            let pts = match packet.pts().or(packet.dts()) {
                Some(ticks) => self.to_seconds(stream_index, ticks),
                None => NO_PTS,
            };
            let duration = self.to_seconds(stream_index, packet.duration().max(0));
            return Ok(Some(MediaPacket {
                packet,
                packet_type,
                stream_index,
                pts,
                duration,
            }));
        }
    }

    fn seek(&mut self, position: f64) -> Result<()> {
        if !position.is_finite() || position < 0.0 {
            return Err(PlayerError::ArgumentError(format!(
                "seek 位置非法: {}",
                position
            )));
        }
        // seek 以 AV_TIME_BASE（微秒）为刻度，..ts 表示在目标之前找关键帧
        let ts = (position * 1_000_000.0) as i64;
        match self.input_ctx.seek(ts, ..ts) {
            Ok(()) => {
                debug!("解封装器跳转到 {:.3}s", position);
                Ok(())
            }
            Err(e) => {
                warn!("解封装器跳转失败: {}", e);
                Err(e.into())
            }
        }
    }

    fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    fn video_stream_index(&self) -> Option<usize> {
        self.video_stream_index
    }

    fn audio_stream_index(&self) -> Option<usize> {
        self.audio_stream_index
    }

    fn subtitle_stream_index(&self) -> Option<usize> {
        self.subtitle_stream_index
    }

    fn description(&self) -> String {
        format!("file:{}", self.path)
    }
}
