use crate::core::{PlayerError, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;
use ffmpeg_next::util::format::Pixel;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::ffi::CStr;
use std::os::raw::c_void;

/// 硬件加速类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HWAccelType {
    DXVA2,
    D3D11VA,
    VAAPI,
    VideoToolbox,
    CUDA,
    QSV,
}

impl HWAccelType {
    pub fn name(&self) -> &'static str {
        match self {
            HWAccelType::DXVA2 => "DXVA2",
            HWAccelType::D3D11VA => "D3D11VA",
            HWAccelType::VAAPI => "VA-API",
            HWAccelType::VideoToolbox => "VideoToolbox",
            HWAccelType::CUDA => "CUDA/NVDEC",
            HWAccelType::QSV => "Intel QSV",
        }
    }

    pub fn to_ffi(self) -> ffi::AVHWDeviceType {
        match self {
            HWAccelType::DXVA2 => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
            HWAccelType::D3D11VA => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
            HWAccelType::VAAPI => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            HWAccelType::VideoToolbox => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
            HWAccelType::CUDA => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
            HWAccelType::QSV => ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
        }
    }

    pub fn from_ffi(device_type: ffi::AVHWDeviceType) -> Option<Self> {
        match device_type {
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2 => Some(HWAccelType::DXVA2),
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA => Some(HWAccelType::D3D11VA),
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI => Some(HWAccelType::VAAPI),
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX => Some(HWAccelType::VideoToolbox),
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA => Some(HWAccelType::CUDA),
            ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV => Some(HWAccelType::QSV),
            _ => None,
        }
    }
}

/// 进程级设备类型缓存
///
/// 首次查询时惰性探测一次；设备创建失败（设备丢失/驱动重置）后
/// 通过 invalidate_hw_cache 作废，下次查询重新探测。
static HW_TYPE_CACHE: Mutex<Option<Vec<HWAccelType>>> = Mutex::new(None);

/// 本机 FFmpeg 支持的硬件设备类型（缓存结果）
pub fn available_hw_types() -> Vec<HWAccelType> {
    let mut cache = HW_TYPE_CACHE.lock();
    cache.get_or_insert_with(probe_hw_types).clone()
}

/// 作废设备类型缓存，下次查询重新探测
pub fn invalidate_hw_cache() {
    *HW_TYPE_CACHE.lock() = None;
    debug!("硬件设备类型缓存已作废，下次查询重新探测");
}

fn probe_hw_types() -> Vec<HWAccelType> {
    let mut types = Vec::new();
    unsafe {
        let mut device_type = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
        loop {
            device_type = ffi::av_hwdevice_iterate_types(device_type);
            if device_type == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
                break;
            }
            let name_ptr = ffi::av_hwdevice_get_type_name(device_type);
            let label = if name_ptr.is_null() {
                "?".to_string()
            } else {
                CStr::from_ptr(name_ptr).to_string_lossy().into_owned()
            };
            match HWAccelType::from_ffi(device_type) {
                Some(hw_type) => {
                    debug!("✓ FFmpeg 支持硬件设备: {}", label);
                    types.push(hw_type);
                }
                None => debug!("跳过不支持的硬件设备类型: {}", label),
            }
        }
    }
    if types.is_empty() {
        warn!("⚠ 未探测到任何硬件加速设备，将使用 CPU 软解");
    } else {
        info!("探测到 {} 种硬件加速方式", types.len());
    }
    types
}

/// 按平台优先级挑选首选硬件类型；无可用设备时返回 None
pub fn preferred_hw_type() -> Option<HWAccelType> {
    #[cfg(target_os = "windows")]
    const PREFERRED: &[HWAccelType] = &[
        HWAccelType::D3D11VA,
        HWAccelType::DXVA2,
        HWAccelType::CUDA,
        HWAccelType::QSV,
    ];
    #[cfg(target_os = "macos")]
    const PREFERRED: &[HWAccelType] = &[HWAccelType::VideoToolbox];
    #[cfg(target_os = "linux")]
    const PREFERRED: &[HWAccelType] = &[HWAccelType::VAAPI, HWAccelType::CUDA, HWAccelType::QSV];
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    const PREFERRED: &[HWAccelType] = &[];

    let available = available_hw_types();
    PREFERRED.iter().find(|t| available.contains(t)).copied()
}

/// get_format 回调：在解码器给出的候选格式里挑协商好的硬件格式
///
/// 期望格式通过 opaque 带进来；候选里没有时退回第一个候选
/// （软件格式），解码自动退化为软解输出。
unsafe extern "C" fn choose_hw_format(
    ctx: *mut ffi::AVCodecContext,
    formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let wanted = (*ctx).opaque as isize as i32;
    let mut p = formats;
    while (*p) as i32 != ffi::AVPixelFormat::AV_PIX_FMT_NONE as i32 {
        if (*p) as i32 == wanted {
            return *p;
        }
        p = p.add(1);
    }
    *formats
}

/// 硬件加速上下文
///
/// 持有设备引用与协商出的硬件像素格式，负责帧在设备内存与
/// 系统内存之间的双向搬运。解码方向 transfer_to_host，编码
/// 方向 transfer_to_device（帧池惰性创建）。
pub struct HwAccelContext {
    hw_type: HWAccelType,
    device_ref: *mut ffi::AVBufferRef,
    hw_pix_fmt: ffi::AVPixelFormat,
    /// 编码上传用的硬件帧池，首次上传时创建
    frames_ref: *mut ffi::AVBufferRef,
}

// 仅在创建它的解码/编码工作线程内使用，跨线程只做所有权转移
unsafe impl Send for HwAccelContext {}

impl HwAccelContext {
    /// 创建指定类型的硬件设备上下文
    ///
    /// 失败视为设备不可用：作废类型缓存并返回 ResourceError，
    /// 调用方应回退软解。
    pub fn new(hw_type: HWAccelType) -> Result<Self> {
        let mut device_ref: *mut ffi::AVBufferRef = std::ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut device_ref,
                hw_type.to_ffi(),
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            )
        };
        if ret < 0 {
            invalidate_hw_cache();
            return Err(PlayerError::ResourceError(format!(
                "创建 {} 设备上下文失败 (err={})",
                hw_type.name(),
                ret
            )));
        }
        info!("✓ {} 硬件设备上下文创建成功", hw_type.name());
        Ok(Self {
            hw_type,
            device_ref,
            hw_pix_fmt: ffi::AVPixelFormat::AV_PIX_FMT_NONE,
            frames_ref: std::ptr::null_mut(),
        })
    }

    /// 协商硬件像素格式
    ///
    /// 遍历解码器的硬件配置表，找到与本设备类型匹配、且支持
    /// 设备上下文方式的条目。不支持时返回 None，调用方回退软解。
    pub fn negotiate_pixel_format(&mut self, codec: &ffmpeg::Codec) -> Option<Pixel> {
        unsafe {
            let mut index = 0;
            loop {
                let config = ffi::avcodec_get_hw_config(codec.as_ptr(), index);
                if config.is_null() {
                    break;
                }
                if ((*config).methods & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32) != 0
                    && (*config).device_type == self.hw_type.to_ffi()
                {
                    self.hw_pix_fmt = (*config).pix_fmt;
                    let pixel = Pixel::from((*config).pix_fmt);
                    debug!("协商 {} 硬件像素格式: {:?}", self.hw_type.name(), pixel);
                    return Some(pixel);
                }
                index += 1;
            }
        }
        warn!("⚠ 解码器不支持 {} 设备，回退软解", self.hw_type.name());
        None
    }

    /// 把设备引用和格式回调装到解码器上下文上（须在打开解码器之前）
    pub fn bind_device(&self, context: &mut ffmpeg::codec::context::Context) -> Result<()> {
        if self.hw_pix_fmt == ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            return Err(PlayerError::ResourceError(
                "尚未协商硬件像素格式".to_string(),
            ));
        }
        unsafe {
            let ctx = context.as_mut_ptr();
            (*ctx).hw_device_ctx = ffi::av_buffer_ref(self.device_ref);
            if (*ctx).hw_device_ctx.is_null() {
                return Err(PlayerError::ResourceError(
                    "复制硬件设备引用失败".to_string(),
                ));
            }
            (*ctx).opaque = self.hw_pix_fmt as i32 as isize as *mut c_void;
            (*ctx).get_format = Some(choose_hw_format);
        }
        Ok(())
    }

    /// 帧是否位于设备内存
    pub fn is_hw_frame(&self, frame: &ffmpeg::util::frame::Video) -> bool {
        frame.format() == Pixel::from(self.hw_pix_fmt)
    }

    /// 解码方向：设备帧下载到系统内存（时间戳等属性随帧复制）
    pub fn transfer_to_host(
        &self,
        hw_frame: &ffmpeg::util::frame::Video,
    ) -> Result<ffmpeg::util::frame::Video> {
        let mut sw_frame = ffmpeg::util::frame::Video::empty();
        unsafe {
            let ret = ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), hw_frame.as_ptr(), 0);
            if ret < 0 {
                return Err(PlayerError::TransformError(format!(
                    "硬件帧下载失败 (err={})",
                    ret
                )));
            }
            let _ = ffi::av_frame_copy_props(sw_frame.as_mut_ptr(), hw_frame.as_ptr());
        }
        Ok(sw_frame)
    }

    /// 编码方向：系统内存帧上传为设备帧
    pub fn transfer_to_device(
        &mut self,
        sw_frame: &ffmpeg::util::frame::Video,
    ) -> Result<ffmpeg::util::frame::Video> {
        self.ensure_frame_pool(sw_frame.width(), sw_frame.height(), sw_frame.format())?;
        let mut hw_frame = ffmpeg::util::frame::Video::empty();
        unsafe {
            let ret = ffi::av_hwframe_get_buffer(self.frames_ref, hw_frame.as_mut_ptr(), 0);
            if ret < 0 {
                return Err(PlayerError::TransformError(format!(
                    "申请设备帧失败 (err={})",
                    ret
                )));
            }
            let ret = ffi::av_hwframe_transfer_data(hw_frame.as_mut_ptr(), sw_frame.as_ptr(), 0);
            if ret < 0 {
                return Err(PlayerError::TransformError(format!(
                    "帧上传到设备失败 (err={})",
                    ret
                )));
            }
            let _ = ffi::av_frame_copy_props(hw_frame.as_mut_ptr(), sw_frame.as_ptr());
        }
        Ok(hw_frame)
    }

    /// 上传用帧池，首次需要时创建
    fn ensure_frame_pool(&mut self, width: u32, height: u32, sw_format: Pixel) -> Result<()> {
        if !self.frames_ref.is_null() {
            return Ok(());
        }
        unsafe {
            let frames_ref = ffi::av_hwframe_ctx_alloc(self.device_ref);
            if frames_ref.is_null() {
                return Err(PlayerError::ResourceError("分配硬件帧池失败".to_string()));
            }
            let frames_ctx = (*frames_ref).data as *mut ffi::AVHWFramesContext;
            (*frames_ctx).format = self.hw_pix_fmt;
            (*frames_ctx).sw_format = sw_format.into();
            (*frames_ctx).width = width as i32;
            (*frames_ctx).height = height as i32;
            (*frames_ctx).initial_pool_size = 20;
            let ret = ffi::av_hwframe_ctx_init(frames_ref);
            if ret < 0 {
                let mut doomed = frames_ref;
                ffi::av_buffer_unref(&mut doomed);
                return Err(PlayerError::ResourceError(format!(
                    "初始化硬件帧池失败 (err={})",
                    ret
                )));
            }
            self.frames_ref = frames_ref;
        }
        debug!(
            "硬件帧池就绪: {}x{} sw_format={:?}",
            width, height, sw_format
        );
        Ok(())
    }

    pub fn hw_type(&self) -> HWAccelType {
        self.hw_type
    }

    pub fn hw_pixel_format(&self) -> Pixel {
        Pixel::from(self.hw_pix_fmt)
    }
}

impl Drop for HwAccelContext {
    fn drop(&mut self) {
        unsafe {
            if !self.frames_ref.is_null() {
                ffi::av_buffer_unref(&mut self.frames_ref);
            }
            if !self.device_ref.is_null() {
                ffi::av_buffer_unref(&mut self.device_ref);
            }
        }
    }
}
