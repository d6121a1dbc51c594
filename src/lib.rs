//! playcore - 多轨同步解码流水线
//!
//! 核心是三条轨道（视频/音频/字幕）各自独立的两级工作线程：
//! 包级负责解码（可选硬件加速），展示级按共享呈现时钟起搏放行，
//! 轨道之间通过主从时钟对齐。暂停/跳转/变速通过协作式事件协议
//! 下发，绝不打断进行中的解码调用。

pub mod core;
pub mod player;
