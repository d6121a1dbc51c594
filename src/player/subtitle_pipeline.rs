use crate::core::{
    BoundedQueue, Clock, EventKind, Result, SubtitleFrame, SyncConfig, TrackCounters, TrackEvent,
};
use crate::player::decoder::SubtitleDecoder;
use crate::player::demuxer::MediaPacket;
use crate::player::render::SubtitleSinkList;
use crate::player::worker::{EventPort, StageContext, StageTask, StageWorker};
use log::debug;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

/// 字幕轨流水线
///
/// 字幕包稀疏且解码无内部缓冲，两级结构与音视频一致但不做 seek 时间窗
/// 过滤：跳转后的陈旧字幕交给展示级按过期规则丢弃。
pub struct SubtitlePipeline {
    packet_worker: StageWorker<MediaPacket>,
    frame_worker: StageWorker<Arc<SubtitleFrame>>,
    frame_queue: Arc<BoundedQueue<Arc<SubtitleFrame>>>,
    clock: Clock,
    counters: Arc<TrackCounters>,
}

impl SubtitlePipeline {
    pub fn start(
        decoder: SubtitleDecoder,
        packet_queue: Arc<BoundedQueue<MediaPacket>>,
        sinks: Arc<SubtitleSinkList>,
        clock: Clock,
        config: &SyncConfig,
        demux_eof: Arc<AtomicBool>,
    ) -> Self {
        let poll = std::time::Duration::from_millis(config.queue_poll_ms);
        let frame_queue = Arc::new(BoundedQueue::new(config.subtitle_frame_capacity));
        let counters = Arc::new(TrackCounters::default());

        let mut packet_worker =
            StageWorker::new("subtitle-packet", packet_queue, poll, demux_eof);
        let mut frame_worker = StageWorker::new(
            "subtitle-present",
            frame_queue.clone(),
            poll,
            packet_worker.finished_flag(),
        );

        frame_worker.start(SubtitlePresentTask {
            clock: clock.clone(),
            sinks,
            counters: counters.clone(),
            first_frame: false,
        });
        packet_worker.start(SubtitlePacketTask {
            decoder,
            frame_queue: frame_queue.clone(),
            downstream: frame_worker.event_port(),
        });

        Self {
            packet_worker,
            frame_worker,
            frame_queue,
            clock,
            counters,
        }
    }

    pub fn send_event(&self, event: TrackEvent) {
        self.packet_worker.send_event(event);
    }

    pub fn stop(&mut self) {
        self.frame_queue.stop();
        self.packet_worker.stop();
        self.frame_worker.stop();
        debug!(
            "字幕轨停止: 呈现 {} 条, 丢弃 {} 条",
            self.counters.presented.load(std::sync::atomic::Ordering::Relaxed),
            self.counters.dropped.load(std::sync::atomic::Ordering::Relaxed)
        );
    }

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

struct SubtitlePacketTask {
    decoder: SubtitleDecoder,
    frame_queue: Arc<BoundedQueue<Arc<SubtitleFrame>>>,
    downstream: EventPort,
}

impl StageTask for SubtitlePacketTask {
    type Unit = MediaPacket;

    fn handle_event(&mut self, event: &TrackEvent) {
        if let EventKind::Seek(_) = &event.kind {
            self.decoder.flush();
            let cleared = self.frame_queue.clear();
            if cleared > 0 {
                debug!("字幕 seek 丢弃 {} 条未呈现字幕", cleared);
            }
        }
        self.downstream.send(event.forwarded());
    }

    fn process(&mut self, pkt: MediaPacket, _ctx: &StageContext) -> Result<()> {
        for frame in self.decoder.decode(&pkt)? {
            if !self.frame_queue.put(Arc::new(frame)) {
                break;
            }
        }
        Ok(())
    }
}

/// 展示级任务：过期裁决分两步
///
/// 字幕有显示时长，落后主时钟不等于过期：先用「消失时刻」判断是否
/// 还在显示窗口内，窗口内的迟到字幕立即显示，只丢真正过期的。
struct SubtitlePresentTask {
    clock: Clock,
    sinks: Arc<SubtitleSinkList>,
    counters: Arc<TrackCounters>,
    first_frame: bool,
}

impl StageTask for SubtitlePresentTask {
    type Unit = Arc<SubtitleFrame>;

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

    fn process(&mut self, frame: Arc<SubtitleFrame>, ctx: &StageContext) -> Result<()> {
        if !self.first_frame {
            self.first_frame = true;
            self.clock.reset(frame.pts);
        } else {
            self.clock.update(frame.pts, Instant::now());
        }

        if let Some(delay) = self.clock.delay_with_master() {
            if self.clock.adjust_delay(delay + frame.duration).is_none() {
                self.counters.add_dropped();
                debug!(
                    "丢弃过期字幕: pts={:.3}s 时长={:.1}s 延迟={:.0}ms",
                    frame.pts,
                    frame.duration,
                    delay * 1000.0
                );
                return Ok(());
            }
            // 迟到但仍在显示窗口内时 adjust_delay 返回 None：不等待直接显示
            if let Some(wait) = self.clock.adjust_delay(delay) {
                ctx.pacing_sleep(wait);
            }
        }

        self.sinks.present(&frame);
        self.counters.add_presented();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::render::SubtitleSink;
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    struct RecordingSink {
        seen: Mutex<Vec<(String, Instant)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl SubtitleSink for RecordingSink {
        fn present_subtitle(&self, frame: &Arc<SubtitleFrame>) -> Result<()> {
            self.seen.lock().push((frame.text.clone(), Instant::now()));
            Ok(())
        }
    }

    fn subtitle(pts: f64, duration: f64, text: &str) -> Arc<SubtitleFrame> {
        Arc::new(SubtitleFrame {
            pts,
            duration,
            end_pts: pts + duration,
            stream_index: 2,
            text: text.to_string(),
        })
    }

    struct Harness {
        worker: StageWorker<Arc<SubtitleFrame>>,
        queue: Arc<BoundedQueue<Arc<SubtitleFrame>>>,
        counters: Arc<TrackCounters>,
        sink: Arc<RecordingSink>,
    }

    fn start_present_stage(master_pts: Option<f64>) -> (Harness, Clock) {
        let master = Clock::with_config(0.1, 10.0);
        let slave = Clock::with_config(0.1, 10.0);
        if let Some(pts) = master_pts {
            master.reset(pts);
            slave.set_master(&master);
        }
        let queue = Arc::new(BoundedQueue::new(8));
        let counters = Arc::new(TrackCounters::default());
        let sink = RecordingSink::new();
        let sinks = Arc::new(SubtitleSinkList::new());
        sinks.add(sink.clone());
        let mut worker = StageWorker::new(
            "test-subtitle-present",
            queue.clone(),
            Duration::from_millis(10),
            Arc::new(AtomicBool::new(false)),
        );
        worker.start(SubtitlePresentTask {
            clock: slave,
            sinks,
            counters: counters.clone(),
            first_frame: false,
        });
        (
            Harness {
                worker,
                queue,
                counters,
                sink,
            },
            master,
        )
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
    fn test_free_running_presents_immediately() {
        let (mut h, _) = start_present_stage(None);
        assert!(h.queue.put(subtitle(3.0, 2.0, "hello")));
        assert!(wait_until(Duration::from_secs(1), || {
            h.sink.seen.lock().len() == 1
        }));
        assert_eq!(h.counters.dropped.load(Ordering::Relaxed), 0);
        h.worker.stop();
    }

    #[test]
    fn test_late_but_active_subtitle_still_shown() {
        // 主时钟 10s，字幕 9s 起、3s 时长：迟到 1s 但 12s 才消失
        let (mut h, _master) = start_present_stage(Some(10.0));
        let fed_at = Instant::now();
        assert!(h.queue.put(subtitle(9.0, 3.0, "late-active")));
        assert!(wait_until(Duration::from_secs(1), || {
            h.sink.seen.lock().len() == 1
        }));
        // 迟到字幕不等待，立即显示
        let presented_at = h.sink.seen.lock()[0].1;
        assert!(presented_at.duration_since(fed_at) < Duration::from_millis(300));
        assert_eq!(h.counters.dropped.load(Ordering::Relaxed), 0);
        h.worker.stop();
    }

    #[test]
    fn test_expired_subtitle_dropped() {
        // 主时钟 10s，字幕 5s 起、3s 时长：8s 已消失，属于过期
        let (mut h, _master) = start_present_stage(Some(10.0));
        assert!(h.queue.put(subtitle(5.0, 3.0, "expired")));
        assert!(wait_until(Duration::from_secs(1), || {
            h.counters.dropped.load(Ordering::Relaxed) == 1
        }));
        assert!(h.sink.seen.lock().is_empty());
        assert_eq!(h.counters.presented.load(Ordering::Relaxed), 0);
        h.worker.stop();
    }

    #[test]
    fn test_ahead_subtitle_waits_until_due() {
        let (mut h, _master) = start_present_stage(Some(10.0));
        let fed_at = Instant::now();
        assert!(h.queue.put(subtitle(10.15, 2.0, "ahead")));
        assert!(wait_until(Duration::from_secs(2), || {
            h.sink.seen.lock().len() == 1
        }));
        let presented_at = h.sink.seen.lock()[0].1;
        assert!(presented_at.duration_since(fed_at) >= Duration::from_millis(100));
        assert_eq!(h.counters.dropped.load(Ordering::Relaxed), 0);
        h.worker.stop();
    }
}
