use crate::core::{AudioFrame, PlayerError, Result};
use crate::player::render::AudioSink;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// 音频输出 - 使用 cpal 播放音频
///
/// cpal::Stream 不是 Send，本体留在创建它的线程上；
/// 流水线拿到的是 sink() 返回的无锁队列句柄。
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    buffer: Arc<SegQueue<f32>>,
    volume: Arc<Mutex<f32>>,
}

impl AudioOutput {
    /// 创建音频输出（设备不支持请求配置时自动回退标准配置）
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        info!("初始化音频输出: {} Hz, {} 声道", sample_rate, channels);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let mut config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        if !Self::device_supports(&device, &config)? {
            warn!(
                "⚠ 音频设备不支持 {} Hz {} 声道，回退标准配置",
                sample_rate, channels
            );
            let fallbacks = [(48000, 2), (44100, 2), (48000, 1), (44100, 1)];
            let mut found = false;
            for (fb_rate, fb_channels) in fallbacks {
                let candidate = StreamConfig {
                    channels: fb_channels,
                    sample_rate: cpal::SampleRate(fb_rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                if Self::device_supports(&device, &candidate)? {
                    info!("✅ 使用回退配置: {} Hz, {} 声道", fb_rate, fb_channels);
                    config = candidate;
                    found = true;
                    break;
                }
            }
            if !found {
                return Err(PlayerError::AudioError(format!(
                    "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
                    sample_rate, channels
                )));
            }
        }

        Ok(Self {
            device,
            config,
            stream: None,
            buffer: Arc::new(SegQueue::new()),
            volume: Arc::new(Mutex::new(1.0)),
        })
    }

    fn device_supports(device: &Device, config: &StreamConfig) -> Result<bool> {
        let supported = device
            .supported_output_configs()
            .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
        Ok(supported.into_iter().any(|s| Self::is_compatible(config, &s)))
    }

    fn is_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        rate_in_range && config.channels == supported.channels()
    }

    /// 启动输出流；设备回调从无锁队列取样本，欠载补零
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = self.buffer.clone();
        let volume = self.volume.clone();

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let vol = *volume.lock();
                    for sample in data.iter_mut() {
                        *sample = buffer.pop().unwrap_or(0.0) * vol;
                    }
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;

        stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;

        self.stream = Some(stream);
        info!("音频输出已启动");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            self.clear_buffer();
            info!("音频输出已停止");
        }
    }

    /// 设置音量 (0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume.clamp(0.0, 1.0);
    }

    pub fn clear_buffer(&self) {
        while self.buffer.pop().is_some() {}
    }

    /// 实际使用的音频配置
    pub fn config(&self) -> (u32, u16) {
        (self.config.sample_rate.0, self.config.channels)
    }

    /// 可跨线程的投递句柄（展示级挂到渲染目标列表上）
    pub fn sink(&self) -> AudioOutputSink {
        AudioOutputSink {
            buffer: self.buffer.clone(),
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// AudioOutput 的跨线程投递端
#[derive(Clone)]
pub struct AudioOutputSink {
    buffer: Arc<SegQueue<f32>>,
}

impl AudioSink for AudioOutputSink {
    fn present_samples(&self, frame: &Arc<AudioFrame>) -> Result<()> {
        for sample in &frame.data {
            self.buffer.push(*sample);
        }
        Ok(())
    }

    fn backlog(&self) -> usize {
        self.buffer.len()
    }

    fn discard_buffered(&self) {
        while self.buffer.pop().is_some() {}
    }

    fn name(&self) -> &str {
        "cpal-output"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SampleFormat;

    fn test_frame(samples: usize) -> Arc<AudioFrame> {
        Arc::new(AudioFrame {
            pts: 0.0,
            duration: samples as f64 / 48000.0,
            stream_index: 1,
            sample_rate: 48000,
            channels: 2,
            format: SampleFormat::F32,
            data: vec![0.5; samples],
        })
    }

    #[test]
    fn test_sink_backlog_tracks_pushes() {
        let buffer = Arc::new(SegQueue::new());
        let sink = AudioOutputSink {
            buffer: buffer.clone(),
        };
        assert_eq!(sink.backlog(), 0);
        sink.present_samples(&test_frame(128)).expect("push failed");
        assert_eq!(sink.backlog(), 128);
        sink.discard_buffered();
        assert_eq!(sink.backlog(), 0);
        assert!(buffer.is_empty());
    }
}
