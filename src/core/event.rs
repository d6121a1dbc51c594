use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 轨道控制事件
///
/// 会话层构造后推入各运行中流水线的事件通道，工作线程在循环
/// 顶部（安全点）排空处理，绝不打断一个单元的变换中途。
#[derive(Debug, Clone)]
pub enum EventKind {
    /// 暂停 / 恢复
    Pause(bool),
    /// 跳转到目标位置（秒）
    Seek(f64),
    /// 变速（调用方已校验为正）
    SpeedChange(f64),
}

#[derive(Clone)]
pub struct TrackEvent {
    pub kind: EventKind,
    /// 需要同步确认的事件（seek）携带闩锁；普通事件为 None
    pub latch: Option<Arc<EventLatch>>,
}

impl TrackEvent {
    pub fn new(kind: EventKind) -> Self {
        Self { kind, latch: None }
    }

    pub fn with_latch(kind: EventKind, latch: Arc<EventLatch>) -> Self {
        Self {
            kind,
            latch: Some(latch),
        }
    }

    /// 级间转发用的拷贝：剥掉闩锁，确认只在入口级发生一次
    pub fn forwarded(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            latch: None,
        }
    }

    /// 若带闩锁则计数减一
    pub fn count_down(&self) {
        if let Some(latch) = &self.latch {
            latch.count_down();
        }
    }
}

impl fmt::Debug for TrackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackEvent")
            .field("kind", &self.kind)
            .field("latched", &self.latch.is_some())
            .finish()
    }
}

/// 倒计时闩锁
///
/// 发起方以运行中流水线的数量初始化，每条流水线确认一次；
/// 计数到零时唤醒所有等待者。计数为零的闩锁从不阻塞，
/// 因此未运行的轨道视同已确认。
pub struct EventLatch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl EventLatch {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        })
    }

    /// 计数减一；已到零时为空操作（重复确认无害）
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cond.notify_all();
            }
        }
    }

    /// 阻塞直到计数归零
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }

    /// 限时等待，返回 true 表示计数已归零
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    pub fn pending(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_count_never_blocks() {
        let latch = EventLatch::new(0);
        let start = Instant::now();
        latch.wait();
        assert!(latch.wait_timeout(Duration::from_secs(1)));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_countdown_across_threads() {
        let latch = EventLatch::new(3);
        for _ in 0..3 {
            let l = latch.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                l.count_down();
            });
        }
        assert!(latch.wait_timeout(Duration::from_secs(2)));
        assert_eq!(latch.pending(), 0);
    }

    #[test]
    fn test_timeout_reports_missing_acks() {
        let latch = EventLatch::new(2);
        latch.count_down();
        assert!(!latch.wait_timeout(Duration::from_millis(50)));
        assert_eq!(latch.pending(), 1);
    }

    #[test]
    fn test_extra_countdown_is_harmless() {
        let latch = EventLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.pending(), 0);
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_forwarded_event_sheds_latch() {
        let latch = EventLatch::new(1);
        let event = TrackEvent::with_latch(EventKind::Seek(12.5), latch.clone());
        let forwarded = event.forwarded();
        assert!(forwarded.latch.is_none());
        // 转发副本确认不掉计数
        forwarded.count_down();
        assert_eq!(latch.pending(), 1);
        event.count_down();
        assert_eq!(latch.pending(), 0);
    }
}
