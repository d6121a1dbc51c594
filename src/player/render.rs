use crate::core::{AudioFrame, Result, SubtitleFrame, VideoFrame};
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

/// 视频渲染目标
///
/// present_frame 在展示级线程内同步调用，实现方不得无限期阻塞；
/// 返回 Err 只影响该目标本次呈现，不影响其他目标与流水线。
pub trait VideoSink: Send + Sync {
    fn present_frame(&self, frame: &Arc<VideoFrame>) -> Result<()>;

    fn name(&self) -> &str {
        "video-sink"
    }
}

/// 音频渲染目标
pub trait AudioSink: Send + Sync {
    fn present_samples(&self, frame: &Arc<AudioFrame>) -> Result<()>;

    /// 尚未播出的积压样本数（展示级据此做水位节流）
    fn backlog(&self) -> usize {
        0
    }

    /// seek / 停止时丢弃内部缓冲
    fn discard_buffered(&self) {}

    fn name(&self) -> &str {
        "audio-sink"
    }
}

/// 字幕渲染目标
pub trait SubtitleSink: Send + Sync {
    fn present_subtitle(&self, frame: &Arc<SubtitleFrame>) -> Result<()>;

    fn name(&self) -> &str {
        "subtitle-sink"
    }
}

/// 渲染目标集合
///
/// 注册（控制线程）与分发（展示线程）并发发生，用专属锁保护，
/// 与队列、时钟的锁互不嵌套。分发全程持锁，保证目标不会在
/// 呈现中途被摘除。
pub struct SinkList<S: ?Sized> {
    sinks: Mutex<Vec<Arc<S>>>,
}

impl<S: ?Sized> SinkList<S> {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, sink: Arc<S>) {
        self.sinks.lock().push(sink);
    }

    pub fn clear(&self) {
        self.sinks.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: ?Sized> Default for SinkList<S> {
    fn default() -> Self {
        Self::new()
    }
}

pub type VideoSinkList = SinkList<dyn VideoSink>;
pub type AudioSinkList = SinkList<dyn AudioSink>;
pub type SubtitleSinkList = SinkList<dyn SubtitleSink>;

impl SinkList<dyn VideoSink> {
    /// 把一帧分发给全部目标；单个目标失败只记日志
    pub fn present(&self, frame: &Arc<VideoFrame>) {
        let sinks = self.sinks.lock();
        for sink in sinks.iter() {
            if let Err(e) = sink.present_frame(frame) {
                warn!("视频目标 {} 呈现失败: {}", sink.name(), e);
            }
        }
    }
}

impl SinkList<dyn AudioSink> {
    pub fn present(&self, frame: &Arc<AudioFrame>) {
        let sinks = self.sinks.lock();
        for sink in sinks.iter() {
            if let Err(e) = sink.present_samples(frame) {
                warn!("音频目标 {} 呈现失败: {}", sink.name(), e);
            }
        }
    }

    /// 所有目标里最深的积压
    pub fn max_backlog(&self) -> usize {
        let sinks = self.sinks.lock();
        sinks.iter().map(|s| s.backlog()).max().unwrap_or(0)
    }

    pub fn discard_all(&self) {
        let sinks = self.sinks.lock();
        for sink in sinks.iter() {
            sink.discard_buffered();
        }
    }
}

impl SinkList<dyn SubtitleSink> {
    pub fn present(&self, frame: &Arc<SubtitleFrame>) {
        let sinks = self.sinks.lock();
        for sink in sinks.iter() {
            if let Err(e) = sink.present_subtitle(frame) {
                warn!("字幕目标 {} 呈现失败: {}", sink.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PixelFormat, PlayerError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        hits: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }
    }

    impl VideoSink for CountingSink {
        fn present_frame(&self, _frame: &Arc<VideoFrame>) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    impl VideoSink for FailingSink {
        fn present_frame(&self, _frame: &Arc<VideoFrame>) -> Result<()> {
            Err(PlayerError::Other("always fails".to_string()))
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    fn test_frame() -> Arc<VideoFrame> {
        Arc::new(VideoFrame {
            pts: 0.0,
            duration: 0.04,
            stream_index: 0,
            width: 2,
            height: 2,
            format: PixelFormat::RGBA,
            data: vec![0; 16],
        })
    }

    #[test]
    fn test_fanout_reaches_all_sinks() {
        let list = VideoSinkList::new();
        let a = CountingSink::new();
        let b = CountingSink::new();
        list.add(a.clone());
        list.add(b.clone());
        list.present(&test_frame());
        list.present(&test_frame());
        assert_eq!(a.hits.load(Ordering::SeqCst), 2);
        assert_eq!(b.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sink_error_does_not_stop_fanout() {
        let list = VideoSinkList::new();
        let counting = CountingSink::new();
        list.add(Arc::new(FailingSink));
        list.add(counting.clone());
        list.present(&test_frame());
        // 前一个目标失败，后面的照常收到
        assert_eq!(counting.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_add_and_clear() {
        let list = VideoSinkList::new();
        assert!(list.is_empty());
        list.add(CountingSink::new());
        assert_eq!(list.len(), 1);
        list.clear();
        assert!(list.is_empty());
    }
}
