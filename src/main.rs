use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use playcore::core::{
    PlaybackState, Result as CoreResult, SubtitleFrame, SyncConfig, SyncMaster, VideoFrame,
};
use playcore::player::{AudioOutput, PlaybackManager, SubtitleSink, VideoSink};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 无界面播放器：驱动整条解码流水线从 open 跑到 EOF
#[derive(Parser)]
#[command(name = "playcore")]
#[command(author, version, about = "多轨同步解码流水线的命令行驱动", long_about = None)]
struct Cli {
    /// 媒体文件路径
    input: String,

    /// 禁用硬件解码，强制软解
    #[arg(long)]
    sw: bool,

    /// 不创建音频输出设备（静默跑通管线）
    #[arg(long)]
    mute: bool,

    /// 播放速度，(0, 8]
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// 起播后先跳转到该位置（秒）
    #[arg(long, value_name = "SECONDS")]
    seek: Option<f64>,

    /// 主时钟轨道
    #[arg(long, value_enum)]
    master: Option<MasterArg>,

    /// JSON 配置文件，缺省字段取默认值
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MasterArg {
    Audio,
    Video,
    None,
}

impl From<MasterArg> for SyncMaster {
    fn from(arg: MasterArg) -> Self {
        match arg {
            MasterArg::Audio => SyncMaster::Audio,
            MasterArg::Video => SyncMaster::Video,
            MasterArg::None => SyncMaster::None,
        }
    }
}

/// 视频帧只计数不渲染，让流水线端到端真实跑动
struct FrameStat {
    frames: AtomicU64,
}

impl VideoSink for FrameStat {
    fn present_frame(&self, _frame: &Arc<VideoFrame>) -> CoreResult<()> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "frame-stat"
    }
}

struct SubtitlePrinter;

impl SubtitleSink for SubtitlePrinter {
    fn present_subtitle(&self, frame: &Arc<SubtitleFrame>) -> CoreResult<()> {
        info!(
            "💬 [{:.1}s ~ {:.1}s] {}",
            frame.pts, frame.end_pts, frame.text
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "subtitle-printer"
    }
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    // 初始化 FFmpeg
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("FFmpeg 初始化失败: {}", e))?;

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
            SyncConfig::from_json(&text)?
        }
        None => SyncConfig::default(),
    };
    if let Some(master) = cli.master {
        config.master = master.into();
    }
    if cli.sw {
        config.use_hw = false;
    }

    // 音频输出先就位，让解码器按设备的实际规格重采样
    let audio_output = if cli.mute {
        None
    } else {
        match AudioOutput::new(config.audio_sample_rate, config.audio_channels) {
            Ok(mut output) => {
                output.start()?;
                let (rate, channels) = output.config();
                config.audio_sample_rate = rate;
                config.audio_channels = channels;
                Some(output)
            }
            Err(e) => {
                warn!("⚠ 音频输出不可用，静默播放: {}", e);
                None
            }
        }
    };

    let mut manager = PlaybackManager::new(config);
    let frame_stat = Arc::new(FrameStat {
        frames: AtomicU64::new(0),
    });
    manager.add_video_sink(frame_stat.clone());
    manager.add_subtitle_sink(Arc::new(SubtitlePrinter));
    if let Some(output) = &audio_output {
        manager.add_audio_sink(Arc::new(output.sink()));
    }

    let media_info = manager.open(&cli.input)?;
    info!(
        "媒体: {}x{} @{:.2}fps 视频={} 音频={} 字幕={} 时长={:.1}s",
        media_info.width,
        media_info.height,
        media_info.fps,
        media_info.video_codec,
        media_info.audio_codec,
        media_info.has_subtitle,
        media_info.duration as f64 / 1000.0
    );

    manager.play()?;
    if cli.speed != 1.0 {
        manager.set_speed(cli.speed)?;
    }
    if let Some(target) = cli.seek {
        manager.seek(target)?;
    }

    // 轮询直到播完
    loop {
        thread::sleep(Duration::from_millis(500));
        let state = manager.state();
        if state.state == PlaybackState::Error {
            warn!("播放进入错误状态，退出");
            break;
        }
        info!(
            "⏱ {:.1}s / {:.1}s | 视频 呈现={} 丢弃={} | 音频 呈现={} 丢弃={}",
            state.position as f64 / 1000.0,
            state.duration as f64 / 1000.0,
            state.video.presented,
            state.video.dropped,
            state.audio.presented,
            state.audio.dropped
        );
        if manager.is_finished() {
            info!("✅ 播放完成");
            break;
        }
    }

    manager.stop();
    let state = manager.state();
    info!(
        "最终统计: 渲染帧={} 视频丢弃={} 音频丢弃={} 字幕丢弃={}",
        frame_stat.frames.load(Ordering::Relaxed),
        state.video.dropped,
        state.audio.dropped,
        state.subtitle.dropped
    );
    Ok(())
}
