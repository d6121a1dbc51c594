use crate::core::{
    is_valid_pts, BoundedQueue, Clock, EventKind, EventLatch, MediaInfo, PlaybackState,
    PlayerError, PlayerState, Result, SyncConfig, SyncMaster, TrackEvent, TrackStats,
};
use crate::player::audio_pipeline::AudioPipeline;
use crate::player::decoder::{AudioDecoder, SubtitleDecoder, VideoDecoder};
use crate::player::demuxer::{Demuxer, MediaPacket, PacketSource, PacketType};
use crate::player::render::{
    AudioSink, AudioSinkList, SubtitleSink, SubtitleSinkList, VideoSink, VideoSinkList,
};
use crate::player::subtitle_pipeline::SubtitlePipeline;
use crate::player::video_pipeline::VideoPipeline;
use crate::player::worker::log_ctx;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// seek 闩锁确认的等待上限，超时后强制清队列兜底
const SEEK_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// 喂包线程命令
enum FeederCommand {
    Seek(f64),
    Stop,
}

struct Feeder {
    command_tx: Sender<FeederCommand>,
    handle: Option<JoinHandle<()>>,
}

/// 喂包线程可投递的目标队列（缺失的轨道为 None，对应包直接丢弃）
struct FeederQueues {
    video: Option<Arc<BoundedQueue<MediaPacket>>>,
    audio: Option<Arc<BoundedQueue<MediaPacket>>>,
    subtitle: Option<Arc<BoundedQueue<MediaPacket>>>,
}

/// 播放会话管理器
///
/// 持有喂包线程、至多三条轨道流水线和同步配置，对外提供
/// open/play/pause/seek/set_speed/stop 与状态查询。所有控制
/// 操作都是协作式的：通过命令通道和轨道事件下发，绝不打断
/// 进行中的解码调用。
pub struct PlaybackManager {
    config: SyncConfig,
    state: Arc<Mutex<PlaybackState>>,
    speed: f64,
    paused: bool,

    /// open 与 play 之间暂存的解封装器；play 把它移交给喂包线程
    source: Option<Box<dyn PacketSource>>,
    /// 记录路径，stop/EOF 之后重播时重新打开
    source_path: Option<String>,
    media_info: Option<MediaInfo>,

    video_decoder: Option<VideoDecoder>,
    audio_decoder: Option<AudioDecoder>,
    subtitle_decoder: Option<SubtitleDecoder>,

    feeder: Option<Feeder>,
    video: Option<VideoPipeline>,
    audio: Option<AudioPipeline>,
    subtitle: Option<SubtitlePipeline>,
    video_packets: Option<Arc<BoundedQueue<MediaPacket>>>,
    audio_packets: Option<Arc<BoundedQueue<MediaPacket>>>,
    subtitle_packets: Option<Arc<BoundedQueue<MediaPacket>>>,

    video_sinks: Arc<VideoSinkList>,
    audio_sinks: Arc<AudioSinkList>,
    subtitle_sinks: Arc<SubtitleSinkList>,

    demux_eof: Arc<AtomicBool>,
    /// 会话位置来源：主时钟，无主时钟时退到任一运行轨道的时钟
    position_clock: Option<Clock>,

    /// stop 后保留的末次轨道统计，供外部读取最终结果；play 时清零
    video_last: TrackStats,
    audio_last: TrackStats,
    subtitle_last: TrackStats,
}

impl PlaybackManager {
    pub fn new(config: SyncConfig) -> Self {
        info!("{} 🎮 创建播放管理器", log_ctx());
        Self {
            config,
            state: Arc::new(Mutex::new(PlaybackState::Idle)),
            speed: 1.0,
            paused: false,
            source: None,
            source_path: None,
            media_info: None,
            video_decoder: None,
            audio_decoder: None,
            subtitle_decoder: None,
            feeder: None,
            video: None,
            audio: None,
            subtitle: None,
            video_packets: None,
            audio_packets: None,
            subtitle_packets: None,
            video_sinks: Arc::new(VideoSinkList::new()),
            audio_sinks: Arc::new(AudioSinkList::new()),
            subtitle_sinks: Arc::new(SubtitleSinkList::new()),
            demux_eof: Arc::new(AtomicBool::new(false)),
            position_clock: None,
            video_last: TrackStats::default(),
            audio_last: TrackStats::default(),
            subtitle_last: TrackStats::default(),
        }
    }

    /// 打开媒体：流发现 + 解码器构建（含硬件协商）
    ///
    /// 单轨失败只警告并禁用该轨道；音视频全部失败才报错。
    /// 成功后停在 Opening 状态，等待 play()。
    pub fn open(&mut self, path: &str) -> Result<MediaInfo> {
        info!("{} 🎬 打开媒体: {}", log_ctx(), path);
        self.stop();
        self.set_state(PlaybackState::Opening);

        let demuxer = match Demuxer::open(path) {
            Ok(demuxer) => demuxer,
            Err(e) => {
                self.set_state(PlaybackState::Error);
                return Err(e);
            }
        };
        let media_info = demuxer.media_info().clone();
        if let Err(e) = self.build_decoders(&demuxer) {
            self.set_state(PlaybackState::Error);
            return Err(e);
        }

        self.source = Some(Box::new(demuxer));
        self.source_path = Some(path.to_string());
        self.media_info = Some(media_info.clone());
        self.demux_eof.store(false, Ordering::SeqCst);
        Ok(media_info)
    }

    fn build_decoders(&mut self, demuxer: &Demuxer) -> Result<()> {
        self.video_decoder = demuxer.video_stream().and_then(|stream| {
            match VideoDecoder::from_stream(&stream, self.config.use_hw) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    warn!("{} ⚠ 视频解码器创建失败，禁用视频轨: {}", log_ctx(), e);
                    None
                }
            }
        });
        self.audio_decoder = demuxer.audio_stream().and_then(|stream| {
            match AudioDecoder::from_stream(
                &stream,
                self.config.audio_sample_rate,
                self.config.audio_channels,
            ) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    warn!("{} ⚠ 音频解码器创建失败，禁用音频轨: {}", log_ctx(), e);
                    None
                }
            }
        });
        self.subtitle_decoder = demuxer.subtitle_stream().and_then(|stream| {
            match SubtitleDecoder::from_stream(&stream) {
                Ok(decoder) => Some(decoder),
                Err(e) => {
                    warn!("{} ⚠ 字幕解码器创建失败，继续播放（无字幕）: {}", log_ctx(), e);
                    None
                }
            }
        });

        if self.video_decoder.is_none() && self.audio_decoder.is_none() {
            return Err(PlayerError::ResourceError(
                "没有任何可解码的音视频轨道".to_string(),
            ));
        }
        Ok(())
    }

    /// 开始播放（已在播则仅恢复暂停；stop/EOF 后调用按原路径重播）
    pub fn play(&mut self) -> Result<()> {
        if self.has_pipelines() {
            if self.paused {
                self.pause(false);
            }
            return Ok(());
        }

        let source = self.take_or_reopen_source()?;
        self.demux_eof.store(false, Ordering::SeqCst);
        self.video_last = TrackStats::default();
        self.audio_last = TrackStats::default();
        self.subtitle_last = TrackStats::default();

        // 队列的 stop 是终结性的，每轮播放用全新队列
        let video_packets = self
            .video_decoder
            .is_some()
            .then(|| Arc::new(BoundedQueue::new(self.config.packet_queue_capacity)));
        let audio_packets = self
            .audio_decoder
            .is_some()
            .then(|| Arc::new(BoundedQueue::new(self.config.audio_packet_capacity)));
        let subtitle_packets = self
            .subtitle_decoder
            .is_some()
            .then(|| Arc::new(BoundedQueue::new(self.config.packet_queue_capacity)));

        // 时钟与主从关系：所选主轨缺失时自动回退到另一条
        let video_clock = Clock::with_config(self.config.sync_tolerance, self.config.max_sync_gap);
        let audio_clock = Clock::with_config(self.config.sync_tolerance, self.config.max_sync_gap);
        let subtitle_clock =
            Clock::with_config(self.config.sync_tolerance, self.config.max_sync_gap);
        let effective_master = self.resolve_master();
        match effective_master {
            SyncMaster::Audio => {
                video_clock.set_master(&audio_clock);
                subtitle_clock.set_master(&audio_clock);
                info!("{} 主时钟: 音频轨", log_ctx());
            }
            SyncMaster::Video => {
                audio_clock.set_master(&video_clock);
                subtitle_clock.set_master(&video_clock);
                info!("{} 主时钟: 视频轨", log_ctx());
            }
            SyncMaster::None => {
                info!("{} 主时钟: 无，各轨自由运行", log_ctx());
            }
        }
        self.position_clock = Some(match effective_master {
            SyncMaster::Audio => audio_clock.clone(),
            SyncMaster::Video => video_clock.clone(),
            SyncMaster::None => {
                if self.audio_decoder.is_some() {
                    audio_clock.clone()
                } else if self.video_decoder.is_some() {
                    video_clock.clone()
                } else {
                    subtitle_clock.clone()
                }
            }
        });

        let config = self.config.clone();
        self.video = match (self.video_decoder.take(), video_packets.clone()) {
            (Some(decoder), Some(queue)) => Some(VideoPipeline::start(
                decoder,
                queue,
                self.video_sinks.clone(),
                video_clock,
                &config,
                self.demux_eof.clone(),
            )),
            _ => None,
        };
        self.audio = match (self.audio_decoder.take(), audio_packets.clone()) {
            (Some(decoder), Some(queue)) => Some(AudioPipeline::start(
                decoder,
                queue,
                self.audio_sinks.clone(),
                audio_clock,
                &config,
                self.demux_eof.clone(),
            )),
            _ => None,
        };
        self.subtitle = match (self.subtitle_decoder.take(), subtitle_packets.clone()) {
            (Some(decoder), Some(queue)) => Some(SubtitlePipeline::start(
                decoder,
                queue,
                self.subtitle_sinks.clone(),
                subtitle_clock,
                &config,
                self.demux_eof.clone(),
            )),
            _ => None,
        };

        // 喂包线程最后启动，此时三条流水线都已就位
        let (command_tx, command_rx) = unbounded();
        let queues = FeederQueues {
            video: video_packets.clone(),
            audio: audio_packets.clone(),
            subtitle: subtitle_packets.clone(),
        };
        let eof = self.demux_eof.clone();
        let handle = thread::spawn(move || feeder_loop(source, queues, command_rx, eof));
        self.feeder = Some(Feeder {
            command_tx,
            handle: Some(handle),
        });
        self.video_packets = video_packets;
        self.audio_packets = audio_packets;
        self.subtitle_packets = subtitle_packets;

        self.paused = false;
        if self.speed != 1.0 {
            // 重播沿用上一轮设定的倍速
            self.broadcast(EventKind::SpeedChange(self.speed));
        }
        self.set_state(PlaybackState::Playing);
        info!("{} ▶ 开始播放", log_ctx());
        Ok(())
    }

    fn take_or_reopen_source(&mut self) -> Result<Box<dyn PacketSource>> {
        if let Some(source) = self.source.take() {
            return Ok(source);
        }
        let path = self
            .source_path
            .clone()
            .ok_or_else(|| PlayerError::ArgumentError("尚未打开任何媒体".to_string()))?;
        info!("{} 🔁 重新打开媒体以重播: {}", log_ctx(), path);
        let demuxer = Demuxer::open(&path)?;
        self.media_info = Some(demuxer.media_info().clone());
        self.build_decoders(&demuxer)?;
        Ok(Box::new(demuxer))
    }

    fn resolve_master(&self) -> SyncMaster {
        match self.config.master {
            SyncMaster::Audio if self.audio_decoder.is_some() => SyncMaster::Audio,
            SyncMaster::Audio if self.video_decoder.is_some() => SyncMaster::Video,
            SyncMaster::Video if self.video_decoder.is_some() => SyncMaster::Video,
            SyncMaster::Video if self.audio_decoder.is_some() => SyncMaster::Audio,
            _ => SyncMaster::None,
        }
    }

    /// 暂停 / 恢复；未在播放时为空操作
    pub fn pause(&mut self, paused: bool) {
        if !self.has_pipelines() || self.paused == paused {
            return;
        }
        self.paused = paused;
        self.broadcast(EventKind::Pause(paused));
        self.set_state(if paused {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        });
        info!(
            "{} {}",
            log_ctx(),
            if paused { "⏸ 暂停" } else { "▶ 恢复播放" }
        );
    }

    /// 跳转到目标位置（秒）
    ///
    /// 闩锁跨所有运行中的轨道：每条流水线清空两级队列并确认后
    /// 才返回；确认超时则强制清队列兜底，绝不无限等待。
    pub fn seek(&mut self, position: f64) -> Result<()> {
        if !self.has_pipelines() {
            return Err(PlayerError::ArgumentError(
                "尚未开始播放，无法 seek".to_string(),
            ));
        }
        if !position.is_finite() || position < 0.0 {
            return Err(PlayerError::ArgumentError(format!(
                "seek 目标非法: {}",
                position
            )));
        }
        let duration = self.duration() as f64 / 1000.0;
        if duration > 0.0 && position > duration {
            return Err(PlayerError::ArgumentError(format!(
                "seek 超出媒体时长: {:.3}s > {:.3}s",
                position, duration
            )));
        }

        let previous = self.current_state();
        self.set_state(PlaybackState::Seeking);
        info!("{} ⏩ seek 到 {:.3}s", log_ctx(), position);

        // 源头先行：解封装跳转并复位 EOF
        if let Some(feeder) = &self.feeder {
            let _ = feeder.command_tx.send(FeederCommand::Seek(position));
        }

        // 只对在跑的流水线发闩锁事件，计数与发送目标严格一致
        let video = self.video.as_ref().filter(|p| p.is_running());
        let audio = self.audio.as_ref().filter(|p| p.is_running());
        let subtitle = self.subtitle.as_ref().filter(|p| p.is_running());
        let running =
            video.is_some() as usize + audio.is_some() as usize + subtitle.is_some() as usize;
        if running == 0 {
            self.set_state(previous);
            return Ok(());
        }

        let latch = EventLatch::new(running);
        if let Some(p) = video {
            p.send_event(TrackEvent::with_latch(EventKind::Seek(position), latch.clone()));
        }
        if let Some(p) = audio {
            p.send_event(TrackEvent::with_latch(EventKind::Seek(position), latch.clone()));
        }
        if let Some(p) = subtitle {
            p.send_event(TrackEvent::with_latch(EventKind::Seek(position), latch.clone()));
        }

        if latch.wait_timeout(SEEK_ACK_TIMEOUT) {
            // 正常确认后队列已由各级自清，只需丢掉输出端残余样本
            if let Some(p) = &self.audio {
                p.discard_output();
            }
            debug!("{} seek 确认完成", log_ctx());
        } else {
            warn!(
                "{} ⚠ seek 确认超时（剩余 {} 条未确认），强制清空管线队列",
                log_ctx(),
                latch.pending()
            );
            if let Some(p) = &self.video {
                p.force_flush();
            }
            if let Some(p) = &self.audio {
                p.force_flush();
            }
            if let Some(p) = &self.subtitle {
                p.force_flush();
            }
        }

        self.set_state(previous);
        Ok(())
    }

    /// 设定播放速度，合法区间 (0, 8]
    pub fn set_speed(&mut self, speed: f64) -> Result<()> {
        if !speed.is_finite() || speed <= 0.0 || speed > 8.0 {
            return Err(PlayerError::ArgumentError(format!(
                "播放速度必须在 (0, 8] 区间: {}",
                speed
            )));
        }
        self.speed = speed;
        self.broadcast(EventKind::SpeedChange(speed));
        info!("{} 播放速度调整为 {:.2}x", log_ctx(), speed);
        Ok(())
    }

    /// 停止播放并回收所有线程；可重复调用
    pub fn stop(&mut self) {
        let had_work = self.feeder.is_some() || self.has_pipelines();

        // 先关包队列：喂包线程若阻塞在投递上会立即解除
        if let Some(queue) = &self.video_packets {
            queue.stop();
        }
        if let Some(queue) = &self.audio_packets {
            queue.stop();
        }
        if let Some(queue) = &self.subtitle_packets {
            queue.stop();
        }
        if let Some(mut feeder) = self.feeder.take() {
            let _ = feeder.command_tx.send(FeederCommand::Stop);
            if let Some(handle) = feeder.handle.take() {
                if handle.join().is_err() {
                    warn!("{} ⚠ 喂包线程异常退出", log_ctx());
                }
            }
        }

        // 统计留底，停止后仍可查询末次结果
        if let Some(mut pipeline) = self.video.take() {
            self.video_last = pipeline.counters().snapshot(pipeline.is_finished());
            pipeline.stop();
        }
        if let Some(mut pipeline) = self.audio.take() {
            self.audio_last = pipeline.counters().snapshot(pipeline.is_finished());
            pipeline.stop();
        }
        if let Some(mut pipeline) = self.subtitle.take() {
            self.subtitle_last = pipeline.counters().snapshot(pipeline.is_finished());
            pipeline.stop();
        }
        self.video_packets = None;
        self.audio_packets = None;
        self.subtitle_packets = None;
        self.position_clock = None;
        self.paused = false;

        if had_work {
            self.set_state(PlaybackState::Stopped);
            info!("{} ⏹ 播放已停止", log_ctx());
        }
    }

    /// 会话状态快照（停止后轨道统计读留底值）
    pub fn state(&self) -> PlayerState {
        PlayerState {
            state: self.current_state(),
            position: self.position(),
            duration: self.duration(),
            speed: self.speed,
            media_info: self.media_info.clone(),
            video: self
                .video
                .as_ref()
                .map(|p| p.counters().snapshot(p.is_finished()))
                .unwrap_or(self.video_last),
            audio: self
                .audio
                .as_ref()
                .map(|p| p.counters().snapshot(p.is_finished()))
                .unwrap_or(self.audio_last),
            subtitle: self
                .subtitle
                .as_ref()
                .map(|p| p.counters().snapshot(p.is_finished()))
                .unwrap_or(self.subtitle_last),
        }
    }

    /// 当前播放位置（毫秒），来自主时钟的外推
    pub fn position(&self) -> i64 {
        match &self.position_clock {
            Some(clock) => {
                let pts = clock.now();
                if is_valid_pts(pts) {
                    (pts * 1000.0).max(0.0) as i64
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    /// 媒体总时长（毫秒），未知为 0
    pub fn duration(&self) -> i64 {
        self.media_info.as_ref().map(|info| info.duration).unwrap_or(0)
    }

    /// 所有轨道是否都已播完（解封装 EOF 且各级缓冲排空）
    pub fn is_finished(&self) -> bool {
        if !self.has_pipelines() || !self.demux_eof.load(Ordering::SeqCst) {
            return false;
        }
        self.video.as_ref().map_or(true, |p| p.is_finished())
            && self.audio.as_ref().map_or(true, |p| p.is_finished())
            && self.subtitle.as_ref().map_or(true, |p| p.is_finished())
    }

    pub fn media_info(&self) -> Option<&MediaInfo> {
        self.media_info.as_ref()
    }

    pub fn add_video_sink(&self, sink: Arc<dyn VideoSink>) {
        self.video_sinks.add(sink);
    }

    pub fn add_audio_sink(&self, sink: Arc<dyn AudioSink>) {
        self.audio_sinks.add(sink);
    }

    pub fn add_subtitle_sink(&self, sink: Arc<dyn SubtitleSink>) {
        self.subtitle_sinks.add(sink);
    }

    fn has_pipelines(&self) -> bool {
        self.video.is_some() || self.audio.is_some() || self.subtitle.is_some()
    }

    fn broadcast(&self, kind: EventKind) {
        if let Some(p) = &self.video {
            p.send_event(TrackEvent::new(kind.clone()));
        }
        if let Some(p) = &self.audio {
            p.send_event(TrackEvent::new(kind.clone()));
        }
        if let Some(p) = &self.subtitle {
            p.send_event(TrackEvent::new(kind.clone()));
        }
    }

    fn current_state(&self) -> PlaybackState {
        *self.state.lock()
    }

    fn set_state(&self, state: PlaybackState) {
        *self.state.lock() = state;
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn apply_seek(source: &mut dyn PacketSource, eof: &AtomicBool, target: f64) {
    match source.seek(target) {
        Ok(()) => {
            eof.store(false, Ordering::SeqCst);
            info!("{} ⏩ 解封装已跳转到 {:.3}s", log_ctx(), target);
        }
        Err(e) => warn!("{} ⚠ 解封装 seek 失败: {}", log_ctx(), e),
    }
}

/// 喂包循环：读包 → 按类型路由到轨道包队列（满时阻塞，形成背压）
///
/// 密集 seek 只执行最后一个目标；EOF 后进入待命，等 Seek 复活或
/// Stop 退出。队列在 stop 时先被关闭，因此阻塞中的 put 会立即返回。
fn feeder_loop(
    mut source: Box<dyn PacketSource>,
    queues: FeederQueues,
    command_rx: Receiver<FeederCommand>,
    eof: Arc<AtomicBool>,
) {
    info!("{} 🚀 喂包线程启动: {}", log_ctx(), source.description());
    let mut total: u64 = 0;

    'outer: loop {
        let mut pending_seek = None;
        loop {
            match command_rx.try_recv() {
                Ok(FeederCommand::Seek(target)) => pending_seek = Some(target),
                Ok(FeederCommand::Stop) => break 'outer,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }
        if let Some(target) = pending_seek {
            apply_seek(source.as_mut(), &eof, target);
        }

        if eof.load(Ordering::SeqCst) {
            match command_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(FeederCommand::Seek(target)) => apply_seek(source.as_mut(), &eof, target),
                Ok(FeederCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break 'outer,
                Err(RecvTimeoutError::Timeout) => {}
            }
            continue;
        }

        match source.read_packet() {
            Ok(Some(pkt)) => {
                total += 1;
                let queue = match pkt.packet_type {
                    PacketType::Video => queues.video.as_ref(),
                    PacketType::Audio => queues.audio.as_ref(),
                    PacketType::Subtitle => queues.subtitle.as_ref(),
                };
                if let Some(queue) = queue {
                    if !queue.put(pkt) {
                        debug!("{} 包队列已停止，该包被丢弃", log_ctx());
                    }
                }
            }
            Ok(None) => {
                info!("{} 📄 解封装到达文件末尾，共读取 {} 个包", log_ctx(), total);
                eof.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                warn!("{} ⚠ 读包失败，按 EOF 处理: {}", log_ctx(), e);
                eof.store(true, Ordering::SeqCst);
            }
        }
    }
    info!("{} 🛑 喂包线程退出，共投喂 {} 个包", log_ctx(), total);
}
