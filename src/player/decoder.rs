use crate::core::{
    is_valid_pts, AudioFrame, PixelFormat, PlayerError, Result, SampleFormat, SubtitleFrame,
    VideoFrame, NO_PTS,
};
use crate::player::demuxer::MediaPacket;
use crate::player::hw_accel::{self, HwAccelContext};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::software;
use ffmpeg_next::util::channel_layout::ChannelLayout;
use ffmpeg_next::util::format::{sample, Pixel, Sample};
use log::{info, warn};

/// 无显示时长的字幕帧兜底显示时间（秒）
const DEFAULT_SUBTITLE_DURATION: f64 = 3.0;

/// 视频解码器
///
/// 优先硬件解码，设备缺失或协商失败回退软解（只在创建时警告
/// 一次）。输出统一转成 RGBA。
pub struct VideoDecoder {
    decoder: ffmpeg::codec::decoder::Video,
    hw: Option<HwAccelContext>,
    scaler: Option<software::scaling::Context>,
    time_base: f64,
    /// 由平均帧率推导的单帧时长（容器不给帧时长时的依据）
    frame_duration: f64,
    stream_index: usize,
}

// scaler 持有 FFmpeg 裸指针；解码器只被创建它的包级线程独占使用
unsafe impl Send for VideoDecoder {}

impl VideoDecoder {
    pub fn from_stream(stream: &ffmpeg::format::stream::Stream, use_hw: bool) -> Result<Self> {
        let mut context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;

        // 低延迟与容错选项
        unsafe {
            let codec_ctx = context.as_mut_ptr();
            (*codec_ctx).flags |= ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
            (*codec_ctx).error_concealment = ffi::FF_EC_GUESS_MVS | ffi::FF_EC_DEBLOCK;
            (*codec_ctx).thread_count = 4;
            (*codec_ctx).thread_type = ffi::FF_THREAD_FRAME | ffi::FF_THREAD_SLICE;
        }

        let hw = if use_hw {
            Self::try_init_hw(&mut context)
        } else {
            None
        };

        let decoder = context.decoder().video()?;

        let tb = stream.time_base();
        let time_base = if tb.denominator() != 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            0.0
        };
        let rate = stream.avg_frame_rate();
        let frame_duration = if rate.numerator() != 0 {
            rate.denominator() as f64 / rate.numerator() as f64
        } else {
            0.0
        };

        info!(
            "✓ 视频解码器就绪: {:?} {}x{} ({})",
            decoder.id(),
            decoder.width(),
            decoder.height(),
            match &hw {
                Some(h) => h.hw_type().name(),
                None => "CPU软解",
            }
        );

        Ok(Self {
            decoder,
            hw,
            scaler: None,
            time_base,
            frame_duration,
            stream_index: stream.index(),
        })
    }

    /// 尝试建立硬件解码，任何一步失败都回退软解
    fn try_init_hw(context: &mut ffmpeg::codec::context::Context) -> Option<HwAccelContext> {
        let hw_type = hw_accel::preferred_hw_type()?;
        let codec = ffmpeg::decoder::find(context.id())?;
        let mut hw = match HwAccelContext::new(hw_type) {
            Ok(hw) => hw,
            Err(e) => {
                warn!("⚠ {} 初始化失败，回退软解: {}", hw_type.name(), e);
                return None;
            }
        };
        hw.negotiate_pixel_format(&codec)?;
        if let Err(e) = hw.bind_device(context) {
            warn!("⚠ 绑定硬件设备失败，回退软解: {}", e);
            return None;
        }
        Some(hw)
    }

    /// 解码一个包，返回解出的帧（可能为空）
    pub fn decode(&mut self, pkt: &MediaPacket) -> Result<Vec<VideoFrame>> {
        let mut frames = Vec::new();
        match self.decoder.send_packet(&pkt.packet) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                // 解码器已进入排空态，重置后继续接收新包
                self.decoder.flush();
                return Ok(frames);
            }
            Err(e) => return Err(e.into()),
        }
        self.receive_all(&mut frames);
        Ok(frames)
    }

    /// 上游 EOF：送空包取出解码器内积压的帧
    pub fn drain(&mut self) -> Vec<VideoFrame> {
        let mut frames = Vec::new();
        if let Err(e) = self.decoder.send_eof() {
            if !matches!(e, ffmpeg::Error::Eof) {
                warn!("视频解码器送入 EOF 失败: {}", e);
            }
        }
        self.receive_all(&mut frames);
        self.decoder.flush();
        frames
    }

    /// seek 后丢弃解码器内部的参考帧缓冲
    pub fn flush(&mut self) {
        self.decoder.flush();
    }

    fn receive_all(&mut self, frames: &mut Vec<VideoFrame>) {
        let mut decoded = ffmpeg::util::frame::Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    // 设备帧先下载到系统内存
                    let mut host_frame = None;
                    if let Some(hw) = &self.hw {
                        if hw.is_hw_frame(&decoded) {
                            match hw.transfer_to_host(&decoded) {
                                Ok(frame) => host_frame = Some(frame),
                                Err(e) => {
                                    warn!("硬件帧下载失败，跳过一帧: {}", e);
                                    continue;
                                }
                            }
                        }
                    }
                    let source = host_frame.as_ref().unwrap_or(&decoded);
                    let pts = match source.timestamp() {
                        Some(ts) => ts as f64 * self.time_base,
                        None => NO_PTS,
                    };
                    match self.convert_frame(source, pts) {
                        Ok(frame) => frames.push(frame),
                        Err(e) => warn!("帧格式转换失败，跳过: {}", e),
                    }
                }
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    warn!("视频解码错误: {}", e);
                    break;
                }
            }
        }
    }

    /// 解码帧 -> RGBA 帧（缩放器惰性创建，源规格变化时重建）
    fn convert_frame(
        &mut self,
        frame: &ffmpeg::util::frame::Video,
        pts: f64,
    ) -> Result<VideoFrame> {
        let width = frame.width();
        let height = frame.height();
        if width == 0 || height == 0 {
            return Err(PlayerError::TransformError("空视频帧".to_string()));
        }

        let needs_rebuild = match &self.scaler {
            Some(scaler) => {
                let input = scaler.input();
                input.format != frame.format() || input.width != width || input.height != height
            }
            None => true,
        };
        if needs_rebuild {
            self.scaler = Some(software::scaling::Context::get(
                frame.format(),
                width,
                height,
                Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?);
        }

        let mut rgba = ffmpeg::util::frame::Video::empty();
        if let Some(scaler) = &mut self.scaler {
            scaler.run(frame, &mut rgba)?;
        }

        // 行步幅可能大于 width*4，逐行拷贝
        let stride = rgba.stride(0);
        let row_len = width as usize * 4;
        let raw = rgba.data(0);
        let mut data = Vec::with_capacity(row_len * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + row_len]);
        }

        Ok(VideoFrame {
            pts,
            duration: self.frame_duration,
            stream_index: self.stream_index,
            width,
            height,
            format: PixelFormat::RGBA,
            data,
        })
    }

    pub fn is_hardware(&self) -> bool {
        self.hw.is_some()
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }
}

/// 音频解码器，输出重采样成目标规格的交织 F32 样本
pub struct AudioDecoder {
    decoder: ffmpeg::codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    time_base: f64,
    stream_index: usize,
    target_rate: u32,
    target_channels: u16,
}

// resampler 持有 FFmpeg 裸指针；只被创建它的包级线程独占使用
unsafe impl Send for AudioDecoder {}

impl AudioDecoder {
    pub fn from_stream(
        stream: &ffmpeg::format::stream::Stream,
        target_rate: u32,
        target_channels: u16,
    ) -> Result<Self> {
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().audio()?;

        let tb = stream.time_base();
        let time_base = if tb.denominator() != 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            0.0
        };

        info!(
            "✓ 音频解码器就绪: {:?} {}Hz {}声道 -> {}Hz {}声道 F32",
            decoder.id(),
            decoder.rate(),
            decoder.channels(),
            target_rate,
            target_channels
        );

        Ok(Self {
            decoder,
            resampler: None,
            time_base,
            stream_index: stream.index(),
            target_rate,
            target_channels,
        })
    }

    pub fn decode(&mut self, pkt: &MediaPacket) -> Result<Vec<AudioFrame>> {
        let mut frames = Vec::new();
        match self.decoder.send_packet(&pkt.packet) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                self.decoder.flush();
                return Ok(frames);
            }
            Err(e) => return Err(e.into()),
        }
        self.receive_all(&mut frames);
        Ok(frames)
    }

    pub fn drain(&mut self) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        if let Err(e) = self.decoder.send_eof() {
            if !matches!(e, ffmpeg::Error::Eof) {
                warn!("音频解码器送入 EOF 失败: {}", e);
            }
        }
        self.receive_all(&mut frames);
        self.decoder.flush();
        frames
    }

    pub fn flush(&mut self) {
        self.decoder.flush();
    }

    fn receive_all(&mut self, frames: &mut Vec<AudioFrame>) {
        let mut decoded = ffmpeg::util::frame::Audio::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => match self.resample(&decoded) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => {}
                    Err(e) => warn!("音频重采样失败，跳过: {}", e),
                },
                Err(ffmpeg::Error::Other { errno: 11 }) | Err(ffmpeg::Error::Eof) => break,
                Err(e) => {
                    warn!("音频解码错误: {}", e);
                    break;
                }
            }
        }
    }

    fn resample(&mut self, frame: &ffmpeg::util::frame::Audio) -> Result<Option<AudioFrame>> {
        // 源规格以首帧为准，解码器声明的布局可能为空
        if self.resampler.is_none() {
            let target_layout = match self.target_channels {
                1 => ChannelLayout::MONO,
                2 => ChannelLayout::STEREO,
                6 => ChannelLayout::_5POINT1,
                _ => ChannelLayout::STEREO,
            };
            self.resampler = Some(software::resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                Sample::F32(sample::Type::Packed),
                target_layout,
                self.target_rate,
            )?);
        }

        let mut resampled = ffmpeg::util::frame::Audio::empty();
        if let Some(resampler) = &mut self.resampler {
            resampler.run(frame, &mut resampled)?;
        }
        if resampled.samples() == 0 {
            return Ok(None);
        }

        // packed F32：data(0) 是交织样本的字节视图
        let total = resampled.samples() * resampled.channels() as usize;
        let samples = unsafe {
            std::slice::from_raw_parts(resampled.data(0).as_ptr() as *const f32, total)
        };

        let pts = match frame.timestamp() {
            Some(ts) => ts as f64 * self.time_base,
            None => NO_PTS,
        };
        let duration = resampled.samples() as f64 / self.target_rate as f64;

        Ok(Some(AudioFrame {
            pts,
            duration,
            stream_index: self.stream_index,
            sample_rate: self.target_rate,
            channels: self.target_channels,
            format: SampleFormat::F32,
            data: samples.to_vec(),
        }))
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }
}

/// 字幕解码器
pub struct SubtitleDecoder {
    decoder: ffmpeg::codec::decoder::Subtitle,
    stream_index: usize,
}

impl SubtitleDecoder {
    pub fn from_stream(stream: &ffmpeg::format::stream::Stream) -> Result<Self> {
        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = context.decoder().subtitle()?;
        info!("✓ 字幕解码器就绪: {:?}", decoder.id());
        Ok(Self {
            decoder,
            stream_index: stream.index(),
        })
    }

    /// 解码一个字幕包；空文本或纯格式包返回空集
    pub fn decode(&mut self, pkt: &MediaPacket) -> Result<Vec<SubtitleFrame>> {
        let mut subtitle = ffmpeg::codec::subtitle::Subtitle::default();
        match self.decoder.decode(&pkt.packet, &mut subtitle) {
            Ok(_) => {}
            Err(ffmpeg::Error::Other { errno: 11 }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        let frames = self.extract_frames(&subtitle, pkt);
        // rects 由解码器分配，包装层不负责释放
        unsafe { ffi::avsubtitle_free(subtitle.as_mut_ptr()) };
        Ok(frames)
    }

    fn extract_frames(
        &self,
        subtitle: &ffmpeg::codec::subtitle::Subtitle,
        pkt: &MediaPacket,
    ) -> Vec<SubtitleFrame> {
        let mut lines = Vec::new();
        for rect in subtitle.rects() {
            match rect {
                ffmpeg::codec::subtitle::Rect::Text(text) => {
                    let trimmed = text.get().trim();
                    if !trimmed.is_empty() {
                        lines.push(trimmed.to_string());
                    }
                }
                ffmpeg::codec::subtitle::Rect::Ass(ass) => {
                    let cleaned = clean_ass_text(ass.get());
                    if !cleaned.is_empty() {
                        lines.push(cleaned);
                    }
                }
                _ => {}
            }
        }
        let text = lines.join("\n");
        if text.is_empty() {
            return Vec::new();
        }

        // 字幕包自己可能不带 pts，退回 AVSubtitle 的展示时刻（微秒）
        let mut pts = pkt.pts;
        if !is_valid_pts(pts) {
            if let Some(ts) = subtitle.pts() {
                pts = ts as f64 / 1_000_000.0;
            }
        }
        // start/end 是相对展示时刻的毫秒偏移
        let mut duration = subtitle.end().saturating_sub(subtitle.start()) as f64 / 1000.0;
        if duration <= 0.0 {
            duration = if pkt.duration > 0.0 {
                pkt.duration
            } else {
                DEFAULT_SUBTITLE_DURATION
            };
        }

        vec![SubtitleFrame {
            pts,
            duration,
            end_pts: pts + duration,
            stream_index: self.stream_index,
            text,
        }]
    }

    pub fn flush(&mut self) {
        self.decoder.flush();
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }
}

/// 取出 ASS 事件行的正文字段
///
/// 嵌入流负载形如 "ReadOrder,Layer,Style,Name,ML,MR,MV,Effect,正文"
/// （8 个逗号），带 "Dialogue:" 前缀时多一个 Start/End 字段（9 个）。
fn ass_payload_text(line: &str) -> &str {
    let (rest, field_commas) = match line.strip_prefix("Dialogue:") {
        Some(rest) => (rest.trim_start(), 9),
        None => (line, 8),
    };
    let mut seen = 0;
    for (i, b) in rest.bytes().enumerate() {
        if b == b',' {
            seen += 1;
            if seen == field_commas {
                return &rest[i + 1..];
            }
        }
    }
    rest
}

/// 清理 ASS 字幕：去掉字段前缀、{\...} 覆写块与 HTML 标签，
/// \N 换行、\h 硬空格还原
fn clean_ass_text(raw: &str) -> String {
    let payload = ass_payload_text(raw.trim_end_matches(['\r', '\n']));
    let mut out = String::with_capacity(payload.len());
    let mut chars = payload.chars().peekable();
    let mut in_override = false;
    let mut in_tag = false;
    while let Some(c) = chars.next() {
        match c {
            '{' => in_override = true,
            '}' if in_override => in_override = false,
            '<' if !in_override => in_tag = true,
            '>' if in_tag => in_tag = false,
            '\\' if !in_override && !in_tag => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('h') => {
                    chars.next();
                    out.push(' ');
                }
                _ => out.push('\\'),
            },
            '\r' => {}
            _ if in_override || in_tag => {}
            _ => out.push(c),
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_ass_strips_override_blocks() {
        assert_eq!(clean_ass_text(r"{\b1}Hello{\b0} World"), "Hello World");
        assert_eq!(clean_ass_text(r"{\pos(400,300)}你好"), "你好");
    }

    #[test]
    fn test_clean_ass_event_payload() {
        assert_eq!(
            clean_ass_text(r"266,0,Default,,0,0,0,,Hello\NWorld"),
            "Hello\nWorld"
        );
    }

    #[test]
    fn test_clean_ass_dialogue_prefix() {
        assert_eq!(
            clean_ass_text("Dialogue: 0,0:00:01.00,0:00:03.00,Default,,0,0,0,,Text here"),
            "Text here"
        );
    }

    #[test]
    fn test_clean_ass_strips_html_tags() {
        assert_eq!(clean_ass_text("<i>斜体</i> 正常"), "斜体 正常");
    }

    #[test]
    fn test_clean_ass_plain_text_passthrough() {
        assert_eq!(clean_ass_text("just a line"), "just a line");
        assert_eq!(clean_ass_text(r"hard\hspace"), "hard space");
    }

    #[test]
    fn test_ass_payload_keeps_commas_in_body() {
        assert_eq!(
            ass_payload_text("1,0,Default,,0,0,0,,a, b, c"),
            "a, b, c"
        );
    }
}
