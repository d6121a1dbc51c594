// 播放器核心模块

pub mod audio_output;
pub mod audio_pipeline;
pub mod decoder;
pub mod demuxer;
pub mod hw_accel;
pub mod manager;
pub mod render;
pub mod subtitle_pipeline;
pub mod video_pipeline;
pub mod worker;

pub use audio_output::{AudioOutput, AudioOutputSink};
pub use audio_pipeline::AudioPipeline;
pub use decoder::{AudioDecoder, SubtitleDecoder, VideoDecoder};
pub use demuxer::{Demuxer, MediaPacket, PacketSource, PacketType};
pub use hw_accel::{available_hw_types, invalidate_hw_cache, HWAccelType, HwAccelContext};
pub use manager::PlaybackManager;
pub use render::{
    AudioSink, AudioSinkList, SubtitleSink, SubtitleSinkList, VideoSink, VideoSinkList,
};
pub use subtitle_pipeline::SubtitlePipeline;
pub use video_pipeline::VideoPipeline;
pub use worker::{StageContext, StageTask, StageWorker};
