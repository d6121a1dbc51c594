// 核心数据结构和同步原语

pub mod clock;
pub mod error;
pub mod event;
pub mod queue;
pub mod types;

// 重新导出常用类型
pub use clock::Clock;
pub use event::{EventKind, EventLatch, TrackEvent};
pub use queue::BoundedQueue;

pub use error::*;
pub use types::*;
