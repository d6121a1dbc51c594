use crate::core::types::{is_valid_pts, NO_PTS};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// 播放时钟 - 音视频同步核心
///
/// 每条轨道的展示级独占持有并写入自己的时钟；从属轨道通过弱引用
/// 只读主时钟的位置。克隆得到的是同一时钟的另一个句柄。
#[derive(Clone)]
pub struct Clock {
    inner: Arc<Mutex<ClockInner>>,
}

struct ClockInner {
    /// 最近一次观测到的展示时间戳（秒），NO_PTS 表示尚未锚定
    pts: f64,
    /// pts 对应的墙钟时刻，二者合起来构成外推基准
    anchor: Instant,
    speed: f64,
    paused: bool,
    /// 暂停时冻结的位置
    paused_at: f64,
    /// 同步容差（秒）：落后超过该值的单元被丢弃
    tolerance: f64,
    /// 超前断裂阈值（秒）：超前超过该值视为时间戳断裂
    max_gap: f64,
    /// 主时钟（弱引用：主时钟先销毁时从属轨道退化为自由运行）
    master: Option<Weak<Mutex<ClockInner>>>,
}

impl Clock {
    pub fn new() -> Self {
        Self::with_config(0.1, 10.0)
    }

    pub fn with_config(tolerance: f64, max_gap: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                pts: NO_PTS,
                anchor: Instant::now(),
                speed: 1.0,
                paused: false,
                paused_at: 0.0,
                tolerance,
                max_gap,
                master: None,
            })),
        }
    }

    /// 重新锚定时钟到给定时间戳（seek 后首个单元、轨道起播）
    pub fn reset(&self, pts: f64) {
        let mut inner = self.inner.lock();
        inner.pts = pts;
        inner.anchor = Instant::now();
        inner.paused_at = if is_valid_pts(pts) { pts } else { 0.0 };
    }

    /// 记录一个单元的展示时刻（展示级每个单元调用一次）
    pub fn update(&self, pts: f64, now: Instant) {
        let mut inner = self.inner.lock();
        inner.pts = pts;
        inner.anchor = now;
    }

    /// 当前播放位置（秒）：按墙钟与速率外推
    ///
    /// 暂停期间冻结在暂停点；从未锚定过时返回 NO_PTS。
    pub fn now(&self) -> f64 {
        let inner = self.inner.lock();
        inner.apparent_position()
    }

    /// 最近锚定/记录的时间戳（不外推）
    pub fn last_pts(&self) -> f64 {
        self.inner.lock().pts
    }

    pub fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if inner.paused == paused {
            return;
        }
        if paused {
            // 冻结在当前外推位置，之后的 update 不再推进表观时间
            inner.paused_at = inner.apparent_position();
            inner.paused = true;
        } else {
            if is_valid_pts(inner.paused_at) {
                inner.pts = inner.paused_at;
            }
            inner.anchor = Instant::now();
            inner.paused = false;
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 调整播放速率（调用方已校验 speed > 0）
    pub fn set_speed(&self, speed: f64) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            // 先把旧速率下的位置折算成新锚点，避免变速瞬间跳变
            let position = inner.apparent_position();
            if is_valid_pts(position) {
                inner.pts = position;
            }
            inner.anchor = Instant::now();
        }
        inner.speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    /// 指定主时钟；自引用会被忽略
    pub fn set_master(&self, master: &Clock) {
        if Arc::ptr_eq(&self.inner, &master.inner) {
            log::warn!("时钟不能以自己为主时钟，忽略");
            return;
        }
        self.inner.lock().master = Some(Arc::downgrade(&master.inner));
    }

    pub fn clear_master(&self) {
        self.inner.lock().master = None;
    }

    pub fn has_master(&self) -> bool {
        match &self.inner.lock().master {
            Some(weak) => weak.upgrade().is_some(),
            None => false,
        }
    }

    /// 相对主时钟的延迟（秒）
    ///
    /// 正值表示本轨道超前，应等待；负值表示落后。
    /// 无主时钟、主时钟已销毁或任一方时间戳无效时返回 None，
    /// 调用方此时应立即呈现。
    pub fn delay_with_master(&self) -> Option<f64> {
        // 先取主时钟快照再锁自己，避免嵌套持锁
        let master_pts = {
            let weak = self.inner.lock().master.clone()?;
            let master = weak.upgrade()?;
            let m = master.lock();
            if !is_valid_pts(m.pts) {
                return None;
            }
            m.pts
        };
        let inner = self.inner.lock();
        if !is_valid_pts(inner.pts) {
            return None;
        }
        let mut delay = (inner.pts - master_pts) / inner.speed;
        if inner.paused {
            // 暂停期间绝不产生正等待
            delay = delay.min(0.0);
        }
        Some(delay)
    }

    /// 按容差窗口裁决延迟
    ///
    /// - 落后超过容差：None，丢弃该单元并计数
    /// - 超前超过断裂阈值：None，时间戳不连续，同样丢弃
    /// - 窗口内：Some(等待时长)，下限截到 0
    pub fn adjust_delay(&self, delay: f64) -> Option<f64> {
        let (tolerance, max_gap) = {
            let inner = self.inner.lock();
            (inner.tolerance, inner.max_gap)
        };
        if !delay.is_finite() {
            return None;
        }
        if delay < -tolerance || delay > max_gap {
            return None;
        }
        Some(delay.max(0.0))
    }
}

impl ClockInner {
    fn apparent_position(&self) -> f64 {
        if self.paused {
            return self.paused_at;
        }
        if !is_valid_pts(self.pts) {
            return NO_PTS;
        }
        self.pts + self.anchor.elapsed().as_secs_f64() * self.speed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_new_clock_has_no_position() {
        let clock = Clock::new();
        assert!(!is_valid_pts(clock.now()));
        assert!(!is_valid_pts(clock.last_pts()));
    }

    #[test]
    fn test_reset_anchors_exact_timestamp() {
        let clock = Clock::new();
        clock.reset(1.5);
        // 锚定的时间戳必须精确等于传入值
        assert_eq!(clock.last_pts(), 1.5);
        let position = clock.now();
        assert!(position >= 1.5 && position < 1.6);
    }

    #[test]
    fn test_now_advances_with_wallclock() {
        let clock = Clock::new();
        clock.reset(0.0);
        thread::sleep(Duration::from_millis(60));
        let position = clock.now();
        assert!(position >= 0.05, "position = {}", position);
        assert!(position < 1.0);
    }

    #[test]
    fn test_speed_scales_advance() {
        let clock = Clock::new();
        clock.reset(0.0);
        clock.set_speed(4.0);
        thread::sleep(Duration::from_millis(50));
        let position = clock.now();
        assert!(position >= 0.15, "position = {}", position);
    }

    #[test]
    fn test_pause_freezes_position() {
        let clock = Clock::new();
        clock.reset(2.0);
        clock.set_paused(true);
        let frozen = clock.now();
        thread::sleep(Duration::from_millis(60));
        // 暂停期间 update 也不推进表观时间
        clock.update(5.0, Instant::now());
        assert!((clock.now() - frozen).abs() < 0.02);
        clock.set_paused(false);
        thread::sleep(Duration::from_millis(30));
        assert!(clock.now() > frozen);
    }

    #[test]
    fn test_delay_without_master_is_none() {
        let clock = Clock::new();
        clock.reset(1.0);
        assert!(clock.delay_with_master().is_none());
    }

    #[test]
    fn test_delay_none_while_master_unanchored() {
        let master = Clock::new();
        let slave = Clock::new();
        slave.set_master(&master);
        slave.reset(1.0);
        // 主时钟尚未锚定
        assert!(slave.delay_with_master().is_none());
        master.reset(0.0);
        assert!(slave.delay_with_master().is_some());
    }

    #[test]
    fn test_delay_sign_follows_lead() {
        let master = Clock::new();
        let slave = Clock::new();
        slave.set_master(&master);
        master.reset(0.2);
        master.set_paused(true);
        slave.set_paused(true);

        slave.reset(0.0);
        let behind = slave.delay_with_master().expect("delay");
        assert!(behind < -0.15 && behind > -0.25, "behind = {}", behind);

        slave.set_paused(false);
        slave.reset(0.3);
        let ahead = slave.delay_with_master().expect("delay");
        assert!(ahead > 0.05 && ahead < 0.15, "ahead = {}", ahead);
    }

    #[test]
    fn test_delay_scaled_by_speed() {
        let master = Clock::new();
        let slave = Clock::new();
        slave.set_master(&master);
        master.reset(0.0);
        master.set_paused(true);
        slave.reset(0.2);
        slave.set_speed(2.0);
        let delay = slave.delay_with_master().expect("delay");
        // 0.2 秒超前在 2 倍速下只需等一半
        assert!((delay - 0.1).abs() < 0.02, "delay = {}", delay);
    }

    #[test]
    fn test_paused_slave_never_waits() {
        let master = Clock::new();
        let slave = Clock::new();
        slave.set_master(&master);
        master.reset(0.0);
        master.set_paused(true);
        slave.reset(0.5);
        slave.set_paused(true);
        let delay = slave.delay_with_master().expect("delay");
        assert!(delay <= 0.0);
    }

    #[test]
    fn test_delay_none_after_master_dropped() {
        let slave = Clock::new();
        {
            let master = Clock::new();
            master.reset(0.0);
            slave.set_master(&master);
            slave.reset(0.1);
            assert!(slave.delay_with_master().is_some());
        }
        // 主时钟销毁，从属轨道退化为自由运行
        assert!(slave.delay_with_master().is_none());
        assert!(!slave.has_master());
    }

    #[test]
    fn test_set_master_to_self_is_ignored() {
        let clock = Clock::new();
        let alias = clock.clone();
        clock.set_master(&alias);
        assert!(!clock.has_master());
    }

    #[test]
    fn test_adjust_delay_window() {
        let clock = Clock::with_config(0.1, 10.0);
        // 窗口内正延迟原样返回
        assert_eq!(clock.adjust_delay(0.05), Some(0.05));
        // 容差内的落后截到 0（立即呈现，不再等待）
        assert_eq!(clock.adjust_delay(-0.05), Some(0.0));
        // 落后超过容差：丢弃
        assert_eq!(clock.adjust_delay(-0.2), None);
        // 超前超过断裂阈值：丢弃
        assert_eq!(clock.adjust_delay(11.0), None);
        // 非法输入
        assert_eq!(clock.adjust_delay(f64::NAN), None);
        assert_eq!(clock.adjust_delay(f64::INFINITY), None);
    }

    #[test]
    fn test_set_speed_keeps_position_continuous() {
        let clock = Clock::new();
        clock.reset(1.0);
        thread::sleep(Duration::from_millis(30));
        let before = clock.now();
        clock.set_speed(2.0);
        let after = clock.now();
        assert!((after - before).abs() < 0.02, "before={} after={}", before, after);
    }
}
