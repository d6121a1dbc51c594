use crate::core::{
    is_valid_pts, AudioFrame, BoundedQueue, Clock, EventKind, Result, SyncConfig, TrackCounters,
    TrackEvent,
};
use crate::player::decoder::AudioDecoder;
use crate::player::demuxer::MediaPacket;
use crate::player::render::AudioSinkList;
use crate::player::worker::{EventPort, StageContext, StageTask, StageWorker};
use log::debug;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// seek 后保留帧的时间窗：音频包粒度小，回退窗口收窄到半秒
const SEEK_KEEP_BEHIND: f64 = 0.5;
const SEEK_KEEP_AHEAD: f64 = 10.0;

/// 输出端积压高水位（秒）：超过则暂缓解码侧投喂，防止无限堆积
const BACKLOG_HIGH_WATER_SECS: f64 = 0.5;

fn in_seek_window(target: f64, pts: f64) -> bool {
    if !is_valid_pts(pts) {
        return true;
    }
    pts >= target - SEEK_KEEP_BEHIND && pts <= target + SEEK_KEEP_AHEAD
}

/// 音频轨流水线：解码级 + 投喂级，节奏由输出端积压水位反压
pub struct AudioPipeline {
    packet_worker: StageWorker<MediaPacket>,
    frame_worker: StageWorker<Arc<AudioFrame>>,
    frame_queue: Arc<BoundedQueue<Arc<AudioFrame>>>,
    sinks: Arc<AudioSinkList>,
    clock: Clock,
    counters: Arc<TrackCounters>,
}

impl AudioPipeline {
    pub fn start(
        decoder: AudioDecoder,
        packet_queue: Arc<BoundedQueue<MediaPacket>>,
        sinks: Arc<AudioSinkList>,
        clock: Clock,
        config: &SyncConfig,
        demux_eof: Arc<AtomicBool>,
    ) -> Self {
        let poll = Duration::from_millis(config.queue_poll_ms);
        let frame_queue = Arc::new(BoundedQueue::new(config.audio_frame_capacity));
        let counters = Arc::new(TrackCounters::default());

        let mut packet_worker =
            StageWorker::new("audio-packet", packet_queue, poll, demux_eof);
        let mut frame_worker = StageWorker::new(
            "audio-present",
            frame_queue.clone(),
            poll,
            packet_worker.finished_flag(),
        );

        frame_worker.start(AudioPresentTask {
            clock: clock.clone(),
            sinks: sinks.clone(),
            counters: counters.clone(),
            first_frame: false,
        });
        packet_worker.start(AudioPacketTask {
            decoder,
            frame_queue: frame_queue.clone(),
            downstream: frame_worker.event_port(),
            seek_filter: None,
        });

        Self {
            packet_worker,
            frame_worker,
            frame_queue,
            sinks,
            clock,
            counters,
        }
    }

    pub fn send_event(&self, event: TrackEvent) {
        self.packet_worker.send_event(event);
    }

    /// 停止两级线程并丢掉输出端尚未播出的样本
    pub fn stop(&mut self) {
        self.frame_queue.stop();
        self.packet_worker.stop();
        self.frame_worker.stop();
        self.sinks.discard_all();
        debug!(
            "音频轨停止: 呈现 {} 帧, 丢弃 {} 帧",
            self.counters.presented.load(std::sync::atomic::Ordering::Relaxed),
            self.counters.dropped.load(std::sync::atomic::Ordering::Relaxed)
        );
    }

    /// seek 确认超时后的兜底：清两级队列和输出端缓冲
    pub fn force_flush(&self) {
        self.packet_worker.inbound().clear();
        self.frame_queue.clear();
        self.sinks.discard_all();
    }

    /// seek 正常确认后只需丢输出端缓冲（队列已由各级自清）
    pub fn discard_output(&self) {
        self.sinks.discard_all();
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn counters(&self) -> &Arc<TrackCounters> {
        &self.counters
    }

    pub fn is_finished(&self) -> bool {
        self.frame_worker.is_finished()
    }

    pub fn is_running(&self) -> bool {
        self.packet_worker.is_running() && self.frame_worker.is_running()
    }
}

/// 解码级任务
struct AudioPacketTask {
    decoder: AudioDecoder,
    frame_queue: Arc<BoundedQueue<Arc<AudioFrame>>>,
    downstream: EventPort,
    seek_filter: Option<f64>,
}

impl AudioPacketTask {
    fn deliver(&mut self, frames: Vec<AudioFrame>) {
        for frame in frames {
            if let Some(target) = self.seek_filter {
                if !in_seek_window(target, frame.pts) {
                    continue;
                }
                self.seek_filter = None;
            }
            if !self.frame_queue.put(Arc::new(frame)) {
                break;
            }
        }
    }
}

impl StageTask for AudioPacketTask {
    type Unit = MediaPacket;

    fn handle_event(&mut self, event: &TrackEvent) {
        match &event.kind {
            EventKind::Seek(target) => {
                self.decoder.flush();
                let cleared = self.frame_queue.clear();
                if cleared > 0 {
                    debug!("音频 seek 丢弃 {} 个未投喂帧", cleared);
                }
                self.seek_filter = Some(*target);
                self.downstream.send(event.forwarded());
            }
            EventKind::Pause(_) | EventKind::SpeedChange(_) => {
                self.downstream.send(event.forwarded());
            }
        }
    }

    fn process(&mut self, pkt: MediaPacket, _ctx: &StageContext) -> Result<()> {
        let frames = self.decoder.decode(&pkt)?;
        self.deliver(frames);
        Ok(())
    }

    fn finish(&mut self) {
        let frames = self.decoder.drain();
        if !frames.is_empty() {
            debug!("音频解码器排空，补出 {} 帧", frames.len());
        }
        self.deliver(frames);
    }
}

/// 投喂级任务：时钟锚定 + 同步裁决 + 水位节流
struct AudioPresentTask {
    clock: Clock,
    sinks: Arc<AudioSinkList>,
    counters: Arc<TrackCounters>,
    first_frame: bool,
}

impl StageTask for AudioPresentTask {
    type Unit = Arc<AudioFrame>;

    fn handle_event(&mut self, event: &TrackEvent) {
        match &event.kind {
            EventKind::Pause(paused) => {
                self.clock.set_paused(*paused);
                if *paused {
                    self.first_frame = false;
                }
            }
            EventKind::Seek(target) => {
                self.clock.reset(*target);
                self.first_frame = false;
            }
            EventKind::SpeedChange(speed) => {
                self.clock.set_speed(*speed);
            }
        }
    }

    fn process(&mut self, frame: Arc<AudioFrame>, ctx: &StageContext) -> Result<()> {
        if !self.first_frame {
            self.first_frame = true;
            self.clock.reset(frame.pts);
        } else {
            self.clock.update(frame.pts, Instant::now());
        }

        // 音频多为主时钟，此时 delay_with_master 返回 None 直接投喂；
        // 从属模式下与视频同一套裁决
        match self.clock.delay_with_master() {
            None => {}
            Some(delay) => match self.clock.adjust_delay(delay) {
                None => {
                    self.counters.add_dropped();
                    debug!(
                        "丢弃失步音频帧: pts={:.3}s 延迟={:.0}ms",
                        frame.pts,
                        delay * 1000.0
                    );
                    return Ok(());
                }
                Some(wait) => ctx.pacing_sleep(wait),
            },
        }

        self.sinks.present(&frame);
        self.counters.add_presented();

        // 水位节流：停止请求或新事件到达时立即让路
        let high_water = (frame.sample_rate as f64
            * frame.channels as f64
            * BACKLOG_HIGH_WATER_SECS) as usize;
        while ctx.is_running()
            && !ctx.has_pending_events()
            && self.sinks.max_backlog() > high_water
        {
            thread::sleep(ctx.poll_interval());
        }
        Ok(())
    }

    fn finish(&mut self) {
        debug!(
            "音频轨排空: 呈现 {} 帧, 丢弃 {} 帧",
            self.counters.presented.load(std::sync::atomic::Ordering::Relaxed),
            self.counters.dropped.load(std::sync::atomic::Ordering::Relaxed)
        );
    }
}
