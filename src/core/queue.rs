use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 级间有界队列
///
/// 流水线相邻两级的唯一交接点：
/// - put 在队列满时阻塞（向上游传递背压）
/// - take_timeout 短超时轮询（消费线程借此保持对停止的响应）
/// - clear 原子清空（seek 路径，同时唤醒被背压阻塞的生产者）
/// - stop 终态：之后 put 返回 false、take 立即返回 None
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    stopped: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// 放入一个单元，队列满时阻塞等待
    ///
    /// 返回 false 表示队列已停止，该单元被丢弃；
    /// 生产方据此结束自己的投递循环。
    pub fn put(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return false;
            }
            if inner.items.len() < self.capacity {
                break;
            }
            self.not_full.wait(&mut inner);
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// 取出一个单元，最多等待 timeout
    ///
    /// 超时或队列已停止时返回 None。停止后即使仍有残留单元也返回
    /// None：停止意味着整条流水线作废，残留单元不再有消费意义。
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
    }

    /// 原子清空全部缓冲单元，返回清掉的数量
    ///
    /// seek 时由事件处理方调用。锁内完成，不存在清空过程中
    /// 其他线程插入旧单元的窗口；同时唤醒被背压阻塞的生产者。
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.items.len();
        inner.items.clear();
        drop(inner);
        self.not_full.notify_all();
        count
    }

    /// 当前长度快照（仅用于水位判断，取到即旧）
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 停止队列并唤醒所有阻塞方，不可逆
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_take_keeps_order() {
        let queue = BoundedQueue::new(8);
        assert!(queue.put(1));
        assert!(queue.put(2));
        assert!(queue.put(3));
        assert_eq!(queue.take_timeout(Duration::from_millis(10)), Some(1));
        assert_eq!(queue.take_timeout(Duration::from_millis(10)), Some(2));
        assert_eq!(queue.take_timeout(Duration::from_millis(10)), Some(3));
        assert_eq!(queue.take_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_take_timeout_elapses() {
        let queue: BoundedQueue<i32> = BoundedQueue::new(4);
        let start = Instant::now();
        assert_eq!(queue.take_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_take_returns_immediately_after_stop() {
        let queue = BoundedQueue::new(4);
        queue.put(42);
        queue.stop();
        let start = Instant::now();
        // 停止后即使有残留单元也返回 None
        assert_eq!(queue.take_timeout(Duration::from_secs(5)), None);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_put_after_stop_returns_false() {
        let queue = BoundedQueue::new(4);
        queue.stop();
        assert!(!queue.put(1));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_stop_wakes_blocked_taker() {
        let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(4));
        let q = queue.clone();
        let handle = thread::spawn(move || q.take_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        queue.stop();
        let start = Instant::now();
        assert_eq!(handle.join().expect("taker panicked"), None);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_full_queue_blocks_producer_until_clear() {
        let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(2));
        assert!(queue.put(1));
        assert!(queue.put(2));

        let q = queue.clone();
        let producer = thread::spawn(move || q.put(3));
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        // clear 唤醒被背压阻塞的生产者
        assert_eq!(queue.clear(), 2);
        assert!(producer.join().expect("producer panicked"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_timeout(Duration::from_millis(10)), Some(3));
    }

    #[test]
    fn test_stop_wakes_blocked_producer() {
        let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1));
        assert!(queue.put(1));
        let q = queue.clone();
        let producer = thread::spawn(move || q.put(2));
        thread::sleep(Duration::from_millis(50));
        queue.stop();
        assert!(!producer.join().expect("producer panicked"));
    }

    #[test]
    fn test_take_unblocks_producer() {
        let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1));
        assert!(queue.put(1));
        let q = queue.clone();
        let producer = thread::spawn(move || q.put(2));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.take_timeout(Duration::from_millis(100)), Some(1));
        assert!(producer.join().expect("producer panicked"));
        assert_eq!(queue.take_timeout(Duration::from_millis(100)), Some(2));
    }
}
