use crate::core::{BoundedQueue, EventKind, Result, TrackEvent};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 日志上下文（多线程日志区分用）
pub(crate) fn log_ctx() -> String {
    format!(
        "[pid:{}-tid:{:?}]",
        std::process::id(),
        thread::current().id()
    )
}

/// 阶段任务：由具体流水线的某一级实现，注入通用工作线程
///
/// 工作线程负责事件排空、暂停门、取件轮询与停止；任务只做
/// 本级特有的事情：解码、起搏呈现、向下游转发。
pub trait StageTask: Send + 'static {
    type Unit: Send + 'static;

    /// 在安全点处理一个事件
    ///
    /// 入站队列的清空（seek）与暂停门由工作线程统一完成，
    /// 这里做本级特有部分：刷新解码器、重置时钟、转发给下游。
    fn handle_event(&mut self, event: &TrackEvent);

    /// 处理一个单元；返回 Err 时该单元被丢弃，线程继续运行
    fn process(&mut self, unit: Self::Unit, ctx: &StageContext) -> Result<()>;

    /// 上游枯竭（EOF 且入站队列为空）时调用一次，排空内部缓冲
    fn finish(&mut self) {}
}

/// 任务在运行期可见的线程环境
pub struct StageContext {
    running: Arc<AtomicBool>,
    events: Receiver<TrackEvent>,
    poll: Duration,
}

impl StageContext {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// 是否有事件等待处理（起搏等待据此提前让路）
    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    /// 分片起搏睡眠
    ///
    /// 等待呈现时刻到来，但停止或新事件到达时立即截断返回。
    /// 绝不打断的是单元的变换本身，等待永远是可截断的。
    pub fn pacing_sleep(&self, secs: f64) {
        if !(secs > 0.0) || !secs.is_finite() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs_f64(secs);
        loop {
            if !self.is_running() || self.has_pending_events() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(self.poll));
        }
    }
}

/// 暂停门：暂停中的工作线程在此小睡，事件到达或停止时被唤醒
pub(crate) struct PauseGate {
    paused: Mutex<bool>,
    cond: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn set(&self, paused: bool) {
        *self.paused.lock() = paused;
        if !paused {
            self.cond.notify_all();
        }
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// 暂停期间限时等待；定期返回循环顶部以便排空新事件
    fn wait_while_paused(&self, timeout: Duration) {
        let mut paused = self.paused.lock();
        if *paused {
            let _ = self.cond.wait_for(&mut paused, timeout);
        }
    }

    fn notify(&self) {
        self.cond.notify_all();
    }
}

/// 阶段事件入口的轻量句柄（上游任务借此向下游转发事件）
#[derive(Clone)]
pub struct EventPort {
    tx: Sender<TrackEvent>,
    gate: Arc<PauseGate>,
}

impl EventPort {
    pub fn send(&self, event: TrackEvent) {
        if self.tx.send(event).is_err() {
            debug!("{} 下游事件通道已关闭，事件被丢弃", log_ctx());
        }
        // 唤醒可能停在暂停门里的线程，让它尽快看到新事件
        self.gate.notify();
    }
}

/// 通用阶段工作线程
///
/// 生命周期: Idle -> Running -> (Paused <-> Running) -> Stopping -> Idle。
/// 循环骨架: 排空事件 -> 暂停检查 -> 短超时取件 -> 处理。
/// 短超时轮询保证 stop() 的等待上界在一个轮询间隔量级。
pub struct StageWorker<T: Send + 'static> {
    name: String,
    inbound: Arc<BoundedQueue<T>>,
    poll: Duration,
    event_tx: Sender<TrackEvent>,
    event_rx: Option<Receiver<TrackEvent>>,
    running: Arc<AtomicBool>,
    gate: Arc<PauseGate>,
    /// 上游是否已枯竭（由上游的 finished 或解封装 EOF 提供）
    exhausted: Arc<AtomicBool>,
    /// 本级是否已排空（take 超时 + 上游枯竭 + 队列空之后置位）
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> StageWorker<T> {
    pub fn new(
        name: &str,
        inbound: Arc<BoundedQueue<T>>,
        poll: Duration,
        exhausted: Arc<AtomicBool>,
    ) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            name: name.to_string(),
            inbound,
            poll,
            event_tx,
            event_rx: Some(event_rx),
            running: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(PauseGate::new()),
            exhausted,
            finished: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// 启动工作线程；已在运行时拒绝并返回 false
    pub fn start<S>(&mut self, mut task: S) -> bool
    where
        S: StageTask<Unit = T>,
    {
        if self.handle.is_some() {
            warn!("{} ⚠ 阶段 {} 已在运行，忽略重复启动", log_ctx(), self.name);
            return false;
        }
        let event_rx = match self.event_rx.take() {
            Some(rx) => rx,
            None => {
                // 重启：换一对新通道，旧句柄上的残留事件随之作废
                let (tx, rx) = unbounded();
                self.event_tx = tx;
                rx
            }
        };
        self.running.store(true, Ordering::SeqCst);
        self.finished.store(false, Ordering::SeqCst);
        self.gate.set(false);

        let name = self.name.clone();
        let inbound = self.inbound.clone();
        let running = self.running.clone();
        let gate = self.gate.clone();
        let exhausted = self.exhausted.clone();
        let finished = self.finished.clone();
        let poll = self.poll;

        let handle = thread::spawn(move || {
            info!("{} 🚀 阶段 {} 线程启动", log_ctx(), name);
            let ctx = StageContext {
                running: running.clone(),
                events: event_rx.clone(),
                poll,
            };
            while running.load(Ordering::Relaxed) {
                // ========== 事件排空（安全点） ==========
                loop {
                    match event_rx.try_recv() {
                        Ok(event) => {
                            match event.kind {
                                EventKind::Pause(paused) => gate.set(paused),
                                EventKind::Seek(_) => {
                                    let cleared = inbound.clear();
                                    if cleared > 0 {
                                        debug!(
                                            "{} 阶段 {} seek 清空入站队列 {} 个单元",
                                            log_ctx(),
                                            name,
                                            cleared
                                        );
                                    }
                                    finished.store(false, Ordering::Release);
                                }
                                EventKind::SpeedChange(_) => {}
                            }
                            task.handle_event(&event);
                            // 确认必须发生在本级与任务完成清理之后
                            event.count_down();
                        }
                        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                    }
                }
                // ========== 暂停检查 ==========
                if gate.is_paused() {
                    gate.wait_while_paused(poll);
                    continue;
                }
                // ========== 短超时取件 ==========
                match inbound.take_timeout(poll) {
                    Some(unit) => {
                        if let Err(e) = task.process(unit, &ctx) {
                            // 单个损坏单元不能放倒整条流水线
                            warn!("{} 阶段 {} 丢弃一个单元: {}", log_ctx(), name, e);
                        }
                    }
                    None => {
                        if exhausted.load(Ordering::Acquire)
                            && inbound.is_empty()
                            && !finished.load(Ordering::Acquire)
                        {
                            task.finish();
                            finished.store(true, Ordering::Release);
                            debug!("{} 阶段 {} 上游枯竭，缓冲已排空", log_ctx(), name);
                        }
                    }
                }
            }
            info!("{} 🧹 阶段 {} 线程退出", log_ctx(), name);
        });
        self.handle = Some(handle);
        true
    }

    /// 向本阶段投递一个事件
    pub fn send_event(&self, event: TrackEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("{} 阶段 {} 事件通道异常，事件被丢弃", log_ctx(), self.name);
        }
        self.gate.notify();
    }

    /// 下游转发句柄
    pub fn event_port(&self) -> EventPort {
        EventPort {
            tx: self.event_tx.clone(),
            gate: self.gate.clone(),
        }
    }

    /// 停止并等待线程退出；等待上界在一个轮询间隔量级
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.gate.notify();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} ⚠ 阶段 {} 线程异常退出", log_ctx(), self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// 本级排空标志的共享句柄（接到下一级的 exhausted 上）
    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }

    pub fn inbound(&self) -> &Arc<BoundedQueue<T>> {
        &self.inbound
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Send + 'static> Drop for StageWorker<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!("{} 阶段 {} 析构时仍在运行，执行停止", log_ctx(), self.name);
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventLatch, PlayerError};
    use std::sync::atomic::AtomicUsize;

    struct RecordingTask {
        seen: Arc<Mutex<Vec<u32>>>,
        events: Arc<Mutex<Vec<String>>>,
        fail_on: Option<u32>,
        finish_calls: Arc<AtomicUsize>,
    }

    impl RecordingTask {
        fn new() -> (
            Self,
            Arc<Mutex<Vec<u32>>>,
            Arc<Mutex<Vec<String>>>,
            Arc<AtomicUsize>,
        ) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let events = Arc::new(Mutex::new(Vec::new()));
            let finish_calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    seen: seen.clone(),
                    events: events.clone(),
                    fail_on: None,
                    finish_calls: finish_calls.clone(),
                },
                seen,
                events,
                finish_calls,
            )
        }
    }

    impl StageTask for RecordingTask {
        type Unit = u32;

        fn handle_event(&mut self, event: &TrackEvent) {
            self.events.lock().push(format!("{:?}", event.kind));
        }

        fn process(&mut self, unit: u32, _ctx: &StageContext) -> Result<()> {
            if self.fail_on == Some(unit) {
                return Err(PlayerError::TransformError(format!("unit {}", unit)));
            }
            self.seen.lock().push(unit);
            Ok(())
        }

        fn finish(&mut self) {
            self.finish_calls.fetch_add(1, Ordering::SeqCst);
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

    fn new_worker(
        queue: &Arc<BoundedQueue<u32>>,
        exhausted: &Arc<AtomicBool>,
    ) -> StageWorker<u32> {
        StageWorker::new("test-stage", queue.clone(), Duration::from_millis(10), exhausted.clone())
    }

    #[test]
    fn test_worker_processes_in_order() {
        let queue = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));
        let (task, seen, _, _) = RecordingTask::new();
        let mut worker = new_worker(&queue, &exhausted);
        assert!(worker.start(task));
        for i in 1..=5 {
            assert!(queue.put(i));
        }
        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 5));
        worker.stop();
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_stop_returns_promptly_when_idle() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));
        let (task, _, _, _) = RecordingTask::new();
        let mut worker = new_worker(&queue, &exhausted);
        assert!(worker.start(task));
        thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        worker.stop();
        // 空转中的线程最多一个轮询间隔内退出
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_pause_halts_consumption_and_resume_preserves_queue() {
        let queue = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));
        let (task, seen, _, _) = RecordingTask::new();
        let mut worker = new_worker(&queue, &exhausted);
        assert!(worker.start(task));

        worker.send_event(TrackEvent::new(EventKind::Pause(true)));
        assert!(wait_until(Duration::from_secs(1), || worker.is_paused()));

        for i in 1..=3 {
            assert!(queue.put(i));
        }
        thread::sleep(Duration::from_millis(80));
        // 暂停期间不得消费
        assert!(seen.lock().is_empty());
        assert_eq!(queue.len(), 3);

        worker.send_event(TrackEvent::new(EventKind::Pause(false)));
        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 3));
        worker.stop();
        // 恢复后按原顺序全部处理，一个不少
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_paused_worker_still_acknowledges_events() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));
        let (task, _, events, _) = RecordingTask::new();
        let mut worker = new_worker(&queue, &exhausted);
        assert!(worker.start(task));

        worker.send_event(TrackEvent::new(EventKind::Pause(true)));
        assert!(wait_until(Duration::from_secs(1), || worker.is_paused()));

        let latch = EventLatch::new(1);
        worker.send_event(TrackEvent::with_latch(EventKind::Seek(3.0), latch.clone()));
        // 暂停中的线程仍须在限时内确认 seek
        assert!(latch.wait_timeout(Duration::from_secs(1)));
        assert!(events.lock().iter().any(|e| e.contains("Seek")));
        worker.stop();
    }

    #[test]
    fn test_latched_seek_clears_queues_across_stages() {
        let queue_a = Arc::new(BoundedQueue::new(8));
        let queue_b = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));
        let (task_a, _, _, _) = RecordingTask::new();
        let (task_b, _, _, _) = RecordingTask::new();
        let mut worker_a = StageWorker::new(
            "stage-a",
            queue_a.clone(),
            Duration::from_millis(10),
            exhausted.clone(),
        );
        let mut worker_b = StageWorker::new(
            "stage-b",
            queue_b.clone(),
            Duration::from_millis(10),
            exhausted.clone(),
        );
        assert!(worker_a.start(task_a));
        assert!(worker_b.start(task_b));

        worker_a.send_event(TrackEvent::new(EventKind::Pause(true)));
        worker_b.send_event(TrackEvent::new(EventKind::Pause(true)));
        assert!(wait_until(Duration::from_secs(1), || {
            worker_a.is_paused() && worker_b.is_paused()
        }));
        for i in 0..6 {
            assert!(queue_a.put(i));
            assert!(queue_b.put(i + 100));
        }

        let latch = EventLatch::new(2);
        worker_a.send_event(TrackEvent::with_latch(EventKind::Seek(9.0), latch.clone()));
        worker_b.send_event(TrackEvent::with_latch(EventKind::Seek(9.0), latch.clone()));
        assert!(latch.wait_timeout(Duration::from_secs(2)));
        // 闩锁放行的瞬间两条队列都必须已清空
        assert_eq!(queue_a.len(), 0);
        assert_eq!(queue_b.len(), 0);
        worker_a.stop();
        worker_b.stop();
    }

    #[test]
    fn test_process_error_keeps_worker_running() {
        let queue = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));
        let (mut task, seen, _, _) = RecordingTask::new();
        task.fail_on = Some(2);
        let mut worker = new_worker(&queue, &exhausted);
        assert!(worker.start(task));
        for i in 1..=3 {
            assert!(queue.put(i));
        }
        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 2));
        assert!(worker.is_running());
        worker.stop();
        // 损坏单元被丢弃，其余照常
        assert_eq!(*seen.lock(), vec![1, 3]);
    }

    #[test]
    fn test_finish_fires_once_after_upstream_exhausted() {
        let queue = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));
        let (task, seen, _, finish_calls) = RecordingTask::new();
        let mut worker = new_worker(&queue, &exhausted);
        assert!(worker.start(task));
        assert!(queue.put(7));
        assert!(wait_until(Duration::from_secs(1), || seen.lock().len() == 1));

        exhausted.store(true, Ordering::Release);
        assert!(wait_until(Duration::from_secs(2), || worker.is_finished()));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(finish_calls.load(Ordering::SeqCst), 1);

        // seek 撤销排空状态，允许 EOF 后再跳转
        exhausted.store(false, Ordering::Release);
        worker.send_event(TrackEvent::new(EventKind::Seek(0.0)));
        assert!(wait_until(Duration::from_secs(1), || !worker.is_finished()));
        worker.stop();
    }

    #[test]
    fn test_double_start_rejected() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));
        let (task_a, _, _, _) = RecordingTask::new();
        let (task_b, _, _, _) = RecordingTask::new();
        let mut worker = new_worker(&queue, &exhausted);
        assert!(worker.start(task_a));
        assert!(!worker.start(task_b));
        worker.stop();
        // 停止后允许再次启动
        let (task_c, seen, _, _) = RecordingTask::new();
        assert!(worker.start(task_c));
        assert!(queue.put(1));
        assert!(wait_until(Duration::from_secs(1), || seen.lock().len() == 1));
        worker.stop();
    }

    #[test]
    fn test_pacing_sleep_truncated_by_stop() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(8));
        let exhausted = Arc::new(AtomicBool::new(false));

        struct SleepyTask;
        impl StageTask for SleepyTask {
            type Unit = u32;
            fn handle_event(&mut self, _event: &TrackEvent) {}
            fn process(&mut self, _unit: u32, ctx: &StageContext) -> Result<()> {
                // 故意要求远超停止预算的等待
                ctx.pacing_sleep(10.0);
                Ok(())
            }
        }

        let mut worker = new_worker(&queue, &exhausted);
        assert!(worker.start(SleepyTask));
        assert!(queue.put(1));
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        worker.stop();
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "stop took {:?}",
            start.elapsed()
        );
    }
}
