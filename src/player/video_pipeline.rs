use crate::core::{
    is_valid_pts, BoundedQueue, Clock, EventKind, Result, SyncConfig, TrackCounters, TrackEvent,
    VideoFrame,
};
use crate::player::decoder::VideoDecoder;
use crate::player::demuxer::MediaPacket;
use crate::player::render::VideoSinkList;
use crate::player::worker::{EventPort, StageContext, StageTask, StageWorker};
use log::debug;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// seek 后保留帧的时间窗：目标前 1 秒（关键帧回退）到目标后 10 秒
const SEEK_KEEP_BEHIND: f64 = 1.0;
const SEEK_KEEP_AHEAD: f64 = 10.0;

fn in_seek_window(target: f64, pts: f64) -> bool {
    if !is_valid_pts(pts) {
        return true;
    }
    pts >= target - SEEK_KEEP_BEHIND && pts <= target + SEEK_KEEP_AHEAD
}

/// 视频轨流水线：包级（解码）+ 展示级（起搏呈现），两级内部队列衔接
pub struct VideoPipeline {
    packet_worker: StageWorker<MediaPacket>,
    frame_worker: StageWorker<Arc<VideoFrame>>,
    frame_queue: Arc<BoundedQueue<Arc<VideoFrame>>>,
    clock: Clock,
    counters: Arc<TrackCounters>,
}

impl VideoPipeline {
    pub fn start(
        decoder: VideoDecoder,
        packet_queue: Arc<BoundedQueue<MediaPacket>>,
        sinks: Arc<VideoSinkList>,
        clock: Clock,
        config: &SyncConfig,
        demux_eof: Arc<AtomicBool>,
    ) -> Self {
        let poll = Duration::from_millis(config.queue_poll_ms);
        let frame_queue = Arc::new(BoundedQueue::new(config.video_frame_capacity));
        let counters = Arc::new(TrackCounters::default());

        let mut packet_worker =
            StageWorker::new("video-packet", packet_queue, poll, demux_eof);
        let mut frame_worker = StageWorker::new(
            "video-present",
            frame_queue.clone(),
            poll,
            packet_worker.finished_flag(),
        );

        // 展示级先就绪，再让包级开始投喂
        frame_worker.start(VideoPresentTask {
            clock: clock.clone(),
            sinks,
            counters: counters.clone(),
            first_frame: false,
        });
        packet_worker.start(VideoPacketTask {
            decoder,
            frame_queue: frame_queue.clone(),
            downstream: frame_worker.event_port(),
            seek_filter: None,
        });

        Self {
            packet_worker,
            frame_worker,
            frame_queue,
            clock,
            counters,
        }
    }

    /// 事件只投给包级，由它负责向展示级转发
    pub fn send_event(&self, event: TrackEvent) {
        self.packet_worker.send_event(event);
    }

    /// 停止两级线程
    ///
    /// 先停帧队列：包级若阻塞在投递上会立即解除，随后两级按序 join。
    pub fn stop(&mut self) {
        self.frame_queue.stop();
        self.packet_worker.stop();
        self.frame_worker.stop();
        debug!(
            "视频轨停止: 呈现 {} 帧, 丢弃 {} 帧",
            self.counters.presented.load(std::sync::atomic::Ordering::Relaxed),
            self.counters.dropped.load(std::sync::atomic::Ordering::Relaxed)
        );
    }

    /// seek 确认超时后的兜底：强制清两级队列，解除可能的投递阻塞
    pub fn force_flush(&self) {
        self.packet_worker.inbound().clear();
        self.frame_queue.clear();
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

/// 包级任务：解码 + seek 残留过滤 + 事件转发
struct VideoPacketTask {
    decoder: VideoDecoder,
    frame_queue: Arc<BoundedQueue<Arc<VideoFrame>>>,
    downstream: EventPort,
    /// seek 目标；置位期间丢弃窗口外的旧帧，首个窗口内帧关闭过滤
    seek_filter: Option<f64>,
}

impl VideoPacketTask {
    fn deliver(&mut self, frames: Vec<VideoFrame>) {
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

impl StageTask for VideoPacketTask {
    type Unit = MediaPacket;

    fn handle_event(&mut self, event: &TrackEvent) {
        match &event.kind {
            EventKind::Seek(target) => {
                // 入站包队列已由工作线程清空；这里清下游帧队列、
                // 重置解码器状态，最后才转发（顺序保证确认时两级皆空）
                self.decoder.flush();
                let cleared = self.frame_queue.clear();
                if cleared > 0 {
                    debug!("视频 seek 丢弃 {} 个未呈现帧", cleared);
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
            debug!("视频解码器排空，补出 {} 帧", frames.len());
        }
        self.deliver(frames);
    }
}

/// 展示级任务：时钟锚定 + 主从同步起搏 + 渲染分发
struct VideoPresentTask {
    clock: Clock,
    sinks: Arc<VideoSinkList>,
    counters: Arc<TrackCounters>,
    first_frame: bool,
}

impl StageTask for VideoPresentTask {
    type Unit = Arc<VideoFrame>;

    fn handle_event(&mut self, event: &TrackEvent) {
        match &event.kind {
            EventKind::Pause(paused) => {
                self.clock.set_paused(*paused);
                if *paused {
                    // 恢复播放时用第一个新帧重新锚定
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

    fn process(&mut self, frame: Arc<VideoFrame>, ctx: &StageContext) -> Result<()> {
        if !self.first_frame {
            // 起播/跳转后的第一帧：精确锚定到该帧的时间戳
            self.first_frame = true;
            self.clock.reset(frame.pts);
        } else {
            self.clock.update(frame.pts, Instant::now());
        }

        match self.clock.delay_with_master() {
            // 无主时钟（或主时钟尚无位置）：立即呈现
            None => {}
            Some(delay) => match self.clock.adjust_delay(delay) {
                None => {
                    self.counters.add_dropped();
                    debug!(
                        "丢弃失步视频帧: pts={:.3}s 延迟={:.0}ms",
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
        Ok(())
    }

    fn finish(&mut self) {
        debug!(
            "视频轨排空: 呈现 {} 帧, 丢弃 {} 帧",
            self.counters.presented.load(std::sync::atomic::Ordering::Relaxed),
            self.counters.dropped.load(std::sync::atomic::Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PixelFormat, EventLatch};
    use crate::player::render::VideoSink;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::thread;

    struct RecordingSink {
        seen: Mutex<Vec<(f64, Instant)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn pts_list(&self) -> Vec<f64> {
            self.seen.lock().iter().map(|(pts, _)| *pts).collect()
        }
    }

    impl VideoSink for RecordingSink {
        fn present_frame(&self, frame: &Arc<VideoFrame>) -> Result<()> {
            self.seen.lock().push((frame.pts, Instant::now()));
            Ok(())
        }
    }

    fn frame(pts: f64) -> Arc<VideoFrame> {
        Arc::new(VideoFrame {
            pts,
            duration: 0.04,
            stream_index: 0,
            width: 2,
            height: 2,
            format: PixelFormat::RGBA,
            data: vec![0; 16],
        })
    }

    struct PresentHarness {
        worker: StageWorker<Arc<VideoFrame>>,
        queue: Arc<BoundedQueue<Arc<VideoFrame>>>,
        clock: Clock,
        counters: Arc<TrackCounters>,
        sink: Arc<RecordingSink>,
    }

    fn start_present_stage(clock: Clock) -> PresentHarness {
        let queue = Arc::new(BoundedQueue::new(8));
        let counters = Arc::new(TrackCounters::default());
        let sink = RecordingSink::new();
        let sinks = Arc::new(VideoSinkList::new());
        sinks.add(sink.clone());
        let mut worker = StageWorker::new(
            "test-video-present",
            queue.clone(),
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(false)),
        );
        worker.start(VideoPresentTask {
            clock: clock.clone(),
            sinks,
            counters: counters.clone(),
            first_frame: false,
        });
        PresentHarness {
            worker,
            queue,
            clock,
            counters,
            sink,
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn test_seek_window_bounds() {
        assert!(in_seek_window(10.0, 10.0));
        assert!(in_seek_window(10.0, 9.2));
        assert!(in_seek_window(10.0, 19.9));
        assert!(!in_seek_window(10.0, 8.5));
        assert!(!in_seek_window(10.0, 21.0));
        // 无效 pts 放行，交给展示级裁决
        assert!(in_seek_window(10.0, f64::NAN));
    }

    #[test]
    fn test_frames_present_in_order_without_master() {
        let mut h = start_present_stage(Clock::with_config(0.1, 10.0));
        let start = Instant::now();
        for pts in [0.0, 0.04, 0.08] {
            assert!(h.queue.put(frame(pts)));
        }
        assert!(wait_until(Duration::from_secs(2), || h.sink.seen.lock().len() == 3));
        // 无主时钟：按入队顺序立即呈现，不丢帧
        assert!(start.elapsed() < Duration::from_millis(300));
        assert_eq!(h.sink.pts_list(), vec![0.0, 0.04, 0.08]);
        assert_eq!(h.counters.dropped.load(Ordering::Relaxed), 0);
        h.worker.stop();
    }

    #[test]
    fn test_lagging_frames_dropped_against_master() {
        let master = Clock::with_config(0.1, 10.0);
        master.reset(0.2);
        let slave = Clock::with_config(0.1, 10.0);
        slave.set_master(&master);
        let mut h = start_present_stage(slave);

        for pts in [0.0, 0.04, 0.08] {
            assert!(h.queue.put(frame(pts)));
        }
        assert!(wait_until(Duration::from_secs(2), || {
            h.counters.dropped.load(Ordering::Relaxed) == 3
        }));
        // 主时钟在 200ms 处，三帧全部落后超容差：全丢
        assert_eq!(h.counters.presented.load(Ordering::Relaxed), 0);
        assert!(h.sink.seen.lock().is_empty());
        h.worker.stop();
    }

    #[test]
    fn test_ahead_frame_waits_for_master() {
        let master = Clock::with_config(0.1, 10.0);
        master.reset(0.0);
        let slave = Clock::with_config(0.1, 10.0);
        slave.set_master(&master);
        let mut h = start_present_stage(slave);

        // 先用一帧锚定，再投一帧超前 150ms 的
        assert!(h.queue.put(frame(0.0)));
        assert!(wait_until(Duration::from_secs(1), || {
            h.sink.seen.lock().len() == 1
        }));
        let fed_at = Instant::now();
        assert!(h.queue.put(frame(0.15)));
        assert!(wait_until(Duration::from_secs(2), || {
            h.sink.seen.lock().len() == 2
        }));
        let presented_at = h.sink.seen.lock()[1].1;
        let waited = presented_at.duration_since(fed_at);
        assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
        assert_eq!(h.counters.dropped.load(Ordering::Relaxed), 0);
        h.worker.stop();
    }

    #[test]
    fn test_seek_reanchors_to_first_frame_pts() {
        let mut h = start_present_stage(Clock::with_config(0.1, 10.0));
        assert!(h.queue.put(frame(1.0)));
        assert!(wait_until(Duration::from_secs(1), || {
            h.sink.seen.lock().len() == 1
        }));

        let latch = EventLatch::new(1);
        h.worker
            .send_event(TrackEvent::with_latch(EventKind::Seek(30.0), latch.clone()));
        assert!(latch.wait_timeout(Duration::from_secs(1)));

        // 跳转后第一帧必须精确成为新锚点
        assert!(h.queue.put(frame(30.02)));
        assert!(wait_until(Duration::from_secs(1), || {
            h.sink.seen.lock().len() == 2
        }));
        assert_eq!(h.clock.last_pts(), 30.02);
        h.worker.stop();
    }

    #[test]
    fn test_resume_after_pause_reanchors() {
        let mut h = start_present_stage(Clock::with_config(0.1, 10.0));
        assert!(h.queue.put(frame(1.0)));
        assert!(wait_until(Duration::from_secs(1), || {
            h.sink.seen.lock().len() == 1
        }));

        h.worker.send_event(TrackEvent::new(EventKind::Pause(true)));
        assert!(wait_until(Duration::from_secs(1), || h.worker.is_paused()));
        assert!(h.clock.is_paused());

        h.worker.send_event(TrackEvent::new(EventKind::Pause(false)));
        assert!(h.queue.put(frame(1.04)));
        assert!(wait_until(Duration::from_secs(1), || {
            h.sink.seen.lock().len() == 2
        }));
        // 恢复后的第一帧重新锚定
        assert_eq!(h.clock.last_pts(), 1.04);
        assert!(!h.clock.is_paused());
        h.worker.stop();
    }
}
