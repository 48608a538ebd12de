pub mod render_pass;

use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::device::device::DeviceContext;
use crate::device::init::{create_device, DeviceCreateConfig, DeviceCreateError};
use crate::instance::debug_messenger::RustLogDebugMessenger;
use crate::instance::init::{create_instance, InstanceCreateConfig, InstanceCreateError};
use crate::instance::instance::InstanceContext;
use crate::objects::command::CommandPool;
use crate::objects::descriptor::DescriptorManager;
use crate::objects::multisample::{MultisampleError, MultisampleTarget};
use crate::objects::surface::{SurfaceInitError, SurfaceProvider};
use crate::objects::swapchain::{Swapchain, SwapchainError};
use crate::prelude::Vec2u32;
use crate::shader::ShaderCompiler;

/// Result of a single prepare or submit step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameResult {
    Success,
    /// The presentation target no longer matches the surface. Recoverable by
    /// the resize protocol.
    OutOfDate,
    DeviceLost,
    Error,
}

/// Result of one full frame iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RenderResult {
    Success,
    Error,
    Fatal,
}

/// What the frame loop does in response to a [`FrameResult`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FrameAction {
    Continue,
    Resize,
    Abort,
}

fn dispatch_frame_result(result: FrameResult) -> FrameAction {
    match result {
        FrameResult::Success => FrameAction::Continue,
        FrameResult::OutOfDate => FrameAction::Resize,
        FrameResult::DeviceLost | FrameResult::Error => FrameAction::Abort,
    }
}

fn frame_result_from(result: vk::Result) -> FrameResult {
    match result {
        vk::Result::SUCCESS => FrameResult::Success,
        vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => FrameResult::OutOfDate,
        vk::Result::ERROR_DEVICE_LOST => FrameResult::DeviceLost,
        _ => FrameResult::Error,
    }
}

/// View of the kernel resources handed to [`RenderStage`] hooks.
pub struct StageContext<'a> {
    pub device: &'a Arc<DeviceContext>,
    pub render_pass: vk::RenderPass,
    pub pipeline_cache: vk::PipelineCache,
    pub framebuffers: &'a [vk::Framebuffer],
    pub command_buffers: &'a [vk::CommandBuffer],
    pub extent: Vec2u32,
    pub viewport: vk::Viewport,
    pub scissor: vk::Rect2D,
}

/// Pluggable render stage driven by the kernel.
///
/// Stages record the per image command buffers, re-provision their off-screen
/// resources on resize and perform one time setup once the kernel finished
/// its init phases.
pub trait RenderStage {
    /// Records the draw command buffers. Called after initialization and
    /// whenever the presentation target was recreated.
    fn build_commands(&mut self, context: &StageContext) -> bool;

    /// Re-provisions resources that depend on the surface extent.
    fn on_resize(&mut self, context: &StageContext) -> bool;

    /// One time setup after the kernel finished all init phases.
    fn on_complete(&mut self, context: &StageContext) -> bool {
        let _ = context;
        true
    }
}

/// Explicit configuration of the kernel. Nothing is environment driven.
pub struct KernelConfig {
    pub app_name: CString,
    pub engine_name: CString,
    pub width: u32,
    pub height: u32,
    pub enable_validation: bool,
    pub validation_layers: Vec<CString>,
    pub instance_extensions: Vec<CString>,
    pub device_extensions: Vec<CString>,
    pub sample_count: u32,
    pub sample_shading: bool,
    pub vsync: bool,
    pub image_count: u32,
    pub sets_per_pool: u32,
    pub compiler_path: Option<PathBuf>,
}

impl KernelConfig {
    pub fn new(app_name: CString, engine_name: CString, width: u32, height: u32) -> Self {
        Self {
            app_name,
            engine_name,
            width,
            height,
            enable_validation: false,
            validation_layers: Vec::new(),
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            sample_count: 1,
            sample_shading: false,
            vsync: true,
            image_count: 3,
            sets_per_pool: DescriptorManager::DEFAULT_SETS_PER_POOL,
            compiler_path: None,
        }
    }

    pub fn set_compiler_path(&mut self, path: impl Into<PathBuf>) {
        self.compiler_path = Some(path.into());
    }

    pub fn enable_validation(&mut self, layers: &[&CStr]) {
        self.enable_validation = true;
        for layer in layers {
            self.validation_layers.push(CString::from(*layer));
        }
    }

    pub fn add_instance_extension(&mut self, extension: &CStr) {
        self.instance_extensions.push(CString::from(extension));
    }

    pub fn add_device_extension(&mut self, extension: &CStr) {
        self.device_extensions.push(CString::from(extension));
    }

    pub fn set_multisampling(&mut self, sample_count: u32) {
        self.sample_count = sample_count;
    }

    pub fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    pub fn set_swapchain_image_count(&mut self, count: u32) {
        self.image_count = count;
    }
}

#[derive(Debug)]
pub enum KernelError {
    /// A phase was entered out of order or twice.
    InvalidPhase,
    Instance(InstanceCreateError),
    Surface(SurfaceInitError),
    Device(DeviceCreateError),
    Swapchain(SwapchainError),
    Multisample(MultisampleError),
    /// A render stage hook reported failure.
    StageFailed,
    Vulkan(vk::Result),
}

impl From<InstanceCreateError> for KernelError {
    fn from(err: InstanceCreateError) -> Self {
        KernelError::Instance(err)
    }
}

impl From<SurfaceInitError> for KernelError {
    fn from(err: SurfaceInitError) -> Self {
        KernelError::Surface(err)
    }
}

impl From<DeviceCreateError> for KernelError {
    fn from(err: DeviceCreateError) -> Self {
        KernelError::Device(err)
    }
}

impl From<SwapchainError> for KernelError {
    fn from(err: SwapchainError) -> Self {
        KernelError::Swapchain(err)
    }
}

impl From<MultisampleError> for KernelError {
    fn from(err: MultisampleError) -> Self {
        KernelError::Multisample(err)
    }
}

impl From<vk::Result> for KernelError {
    fn from(result: vk::Result) -> Self {
        KernelError::Vulkan(result)
    }
}

/// Handle for reporting window size changes from the windowing thread.
///
/// The windowing callback may run on a different thread than the render loop,
/// so the pending dimensions live behind a mutex. The kernel consumes them at
/// the next resize opportunity.
#[derive(Clone)]
pub struct ResizeSignal {
    pending: Arc<Mutex<Option<(u32, u32)>>>,
}

impl ResizeSignal {
    fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_size(&self, width: u32, height: u32) {
        *self.pending.lock().unwrap() = Some((width, height));
    }

    fn take(&self) -> Option<(u32, u32)> {
        self.pending.lock().unwrap().take()
    }

    fn peek(&self) -> Option<(u32, u32)> {
        *self.pending.lock().unwrap()
    }
}

/// Owns the graphics context and drives the per frame state machine.
///
/// Phases: [`FrameKernel::pre_init`] → [`FrameKernel::init`] →
/// [`FrameKernel::post_init`], then [`FrameKernel::render`] in a loop with
/// [`FrameKernel::resize_window`] as a side transition, finally
/// [`FrameKernel::destroy`]. A failed resize or a fatal frame result sets a
/// sticky error flag that stops the loop.
pub struct FrameKernel {
    config: KernelConfig,

    instance: Option<Arc<InstanceContext>>,
    shader_compiler: Option<ShaderCompiler>,
    surface_provider: Option<Box<dyn SurfaceProvider>>,
    surface: vk::SurfaceKHR,
    device: Option<Arc<DeviceContext>>,
    swapchain: Option<Swapchain>,
    command_pool: Option<CommandPool>,
    descriptor_manager: Option<DescriptorManager>,
    multisample: Option<MultisampleTarget>,

    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pipeline_cache: vk::PipelineCache,

    wait_fences: Vec<vk::Fence>,
    present_complete: vk::Semaphore,
    render_complete: vk::Semaphore,
    submit_pipeline_stages: vk::PipelineStageFlags,

    current_frame: usize,
    current_buffer: u32,

    width: u32,
    height: u32,
    resize_signal: ResizeSignal,

    has_errors: bool,

    is_pre_initialized: bool,
    is_initialized: bool,
    is_post_initialized: bool,
}

impl FrameKernel {
    pub fn new(config: KernelConfig) -> Self {
        let width = config.width;
        let height = config.height;

        Self {
            config,
            instance: None,
            shader_compiler: None,
            surface_provider: None,
            surface: vk::SurfaceKHR::null(),
            device: None,
            swapchain: None,
            command_pool: None,
            descriptor_manager: None,
            multisample: None,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            pipeline_cache: vk::PipelineCache::null(),
            wait_fences: Vec::new(),
            present_complete: vk::Semaphore::null(),
            render_complete: vk::Semaphore::null(),
            submit_pipeline_stages: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            current_frame: 0,
            current_buffer: 0,
            width,
            height,
            resize_signal: ResizeSignal::new(),
            has_errors: false,
            is_pre_initialized: false,
            is_initialized: false,
            is_post_initialized: false,
        }
    }

    /// Validates the configuration and creates the instance and debug layer.
    pub fn pre_init(&mut self) -> Result<(), KernelError> {
        if self.is_pre_initialized {
            return Err(KernelError::InvalidPhase);
        }

        log::info!("Kernel pre-init: app {:?}, engine {:?}", self.config.app_name, self.config.engine_name);

        let mut instance_config = InstanceCreateConfig::new(
            self.config.app_name.clone(),
            1,
            self.config.engine_name.clone(),
        );
        for extension in &self.config.instance_extensions {
            instance_config.add_required_extension(extension.as_c_str());
        }
        if self.config.enable_validation {
            instance_config.enable_validation();
            for layer in &self.config.validation_layers {
                instance_config.add_validation_layer(layer.as_c_str());
            }
            instance_config.add_debug_messenger(Box::new(RustLogDebugMessenger::new()));
        }

        let instance = create_instance(instance_config)?;

        self.shader_compiler = self.config.compiler_path.as_ref()
            .map(|path| ShaderCompiler::new(path.as_path()));
        self.instance = Some(instance);
        self.is_pre_initialized = true;
        Ok(())
    }

    /// Obtains the surface from the injected provider and creates the device,
    /// queues, swapchain, command pool and descriptor manager.
    pub fn init(&mut self, mut surface_provider: Box<dyn SurfaceProvider>) -> Result<(), KernelError> {
        if !self.is_pre_initialized || self.is_initialized {
            return Err(KernelError::InvalidPhase);
        }

        log::info!("Kernel init");

        let instance = self.instance.as_ref().unwrap().clone();

        let surface = surface_provider.init(instance.get_entry(), instance.vk())?;
        if surface == vk::SurfaceKHR::null() {
            log::error!("Surface provider returned a null handle");
            return Err(KernelError::Surface(SurfaceInitError::NullHandle));
        }
        self.surface = surface;
        self.surface_provider = Some(surface_provider);

        let mut device_config = DeviceCreateConfig::new();
        for extension in &self.config.device_extensions {
            device_config.add_required_extension(extension.as_c_str());
        }
        device_config.set_sample_count(self.config.sample_count);
        if self.config.sample_shading {
            device_config.enable_sample_shading();
        }

        let device = create_device(device_config, instance, surface)?;

        let swapchain = Swapchain::create(
            device.clone(),
            surface,
            self.config.vsync,
            self.width,
            self.height,
            self.config.image_count,
        )?;

        let extent = swapchain.get_surface_extent();
        self.width = extent.x;
        self.height = extent.y;

        let command_pool = CommandPool::create(device.clone())?;
        let descriptor_manager = DescriptorManager::new(device.clone(), self.config.sets_per_pool);

        let multisample = MultisampleTarget::create(
            device.clone(),
            swapchain.get_color_format(),
            swapchain.get_depth_format(),
            self.width,
            self.height,
        )?;

        self.device = Some(device);
        self.swapchain = Some(swapchain);
        self.command_pool = Some(command_pool);
        self.descriptor_manager = Some(descriptor_manager);
        self.multisample = Some(multisample);
        self.is_initialized = true;
        Ok(())
    }

    /// Creates the render pass, framebuffers, synchronization primitives and
    /// the pipeline cache, then gives the stage its one time setup callback.
    pub fn post_init(&mut self, stage: &mut dyn RenderStage) -> Result<(), KernelError> {
        if !self.is_initialized || self.is_post_initialized {
            return Err(KernelError::InvalidPhase);
        }

        log::info!("Kernel post-init");

        let device = self.device.as_ref().unwrap().clone();
        let swapchain = self.swapchain.as_ref().unwrap();

        self.render_pass = render_pass::create_render_pass(
            &device,
            swapchain.get_color_format(),
            swapchain.get_depth_format(),
        )?;

        let swapchain = self.swapchain.as_ref().unwrap();
        self.framebuffers = render_pass::create_framebuffers(
            &device,
            self.render_pass,
            swapchain,
            self.multisample.as_ref().unwrap(),
        )?;

        let image_count = swapchain.get_image_count();
        self.create_synchronization(image_count)?;

        self.command_pool.as_mut().unwrap().allocate_buffers(image_count)?;

        let info = vk::PipelineCacheCreateInfo::builder();
        self.pipeline_cache = unsafe {
            device.vk().create_pipeline_cache(&info, None)
        }?;

        self.is_post_initialized = true;

        if !stage.on_complete(&self.stage_context()) {
            log::error!("Render stage on_complete failed");
            return Err(KernelError::StageFailed);
        }

        Ok(())
    }

    fn create_synchronization(&mut self, image_count: u32) -> Result<(), KernelError> {
        let device = self.device.as_ref().unwrap();

        // Fences start signaled so the first wait on a fresh slot passes
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED);
        for _ in 0..image_count {
            let fence = unsafe {
                device.vk().create_fence(&fence_info, None)
            }?;
            self.wait_fences.push(fence);
        }

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        self.present_complete = unsafe {
            device.vk().create_semaphore(&semaphore_info, None)
        }?;
        self.render_complete = unsafe {
            device.vk().create_semaphore(&semaphore_info, None)
        }?;

        self.current_frame = 0;
        Ok(())
    }

    fn destroy_synchronization(&mut self) {
        let device = self.device.as_ref().unwrap();
        unsafe {
            for fence in self.wait_fences.drain(..) {
                device.vk().destroy_fence(fence, None);
            }
            if self.present_complete != vk::Semaphore::null() {
                device.vk().destroy_semaphore(self.present_complete, None);
                self.present_complete = vk::Semaphore::null();
            }
            if self.render_complete != vk::Semaphore::null() {
                device.vk().destroy_semaphore(self.render_complete, None);
                self.render_complete = vk::Semaphore::null();
            }
        }
    }

    pub fn get_instance(&self) -> Option<&Arc<InstanceContext>> {
        self.instance.as_ref()
    }

    pub fn get_shader_compiler(&self) -> Option<&ShaderCompiler> {
        self.shader_compiler.as_ref()
    }

    pub fn get_device(&self) -> Option<&Arc<DeviceContext>> {
        self.device.as_ref()
    }

    pub fn get_surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn get_swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn get_multisample_target(&self) -> Option<&MultisampleTarget> {
        self.multisample.as_ref()
    }

    pub fn is_validation_enabled(&self) -> bool {
        self.config.enable_validation
    }

    pub fn get_descriptor_manager(&mut self) -> Option<&mut DescriptorManager> {
        self.descriptor_manager.as_mut()
    }

    pub fn get_pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    pub fn get_render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn get_draw_command_buffers(&self) -> &[vk::CommandBuffer] {
        self.command_pool.as_ref().map(|pool| pool.get_buffers()).unwrap_or(&[])
    }

    pub fn get_current_buffer(&self) -> u32 {
        self.current_buffer
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    /// Handle for windowing callbacks running on other threads.
    pub fn get_resize_signal(&self) -> ResizeSignal {
        self.resize_signal.clone()
    }

    pub fn get_viewport(&self) -> vk::Viewport {
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.width as f32,
            height: self.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn get_scissor(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width: self.width, height: self.height },
        }
    }

    pub fn get_render_area(&self) -> vk::Rect2D {
        self.get_scissor()
    }

    fn stage_context(&self) -> StageContext {
        StageContext {
            device: self.device.as_ref().unwrap(),
            render_pass: self.render_pass,
            pipeline_cache: self.pipeline_cache,
            framebuffers: self.framebuffers.as_slice(),
            command_buffers: self.command_pool.as_ref().map(|pool| pool.get_buffers()).unwrap_or(&[]),
            extent: Vec2u32::new(self.width, self.height),
            viewport: self.get_viewport(),
            scissor: self.get_scissor(),
        }
    }

    /// Asks the stage to record the draw command buffers.
    pub fn build_commands(&mut self, stage: &mut dyn RenderStage) -> Result<(), KernelError> {
        if !self.is_post_initialized {
            return Err(KernelError::InvalidPhase);
        }

        if !stage.build_commands(&self.stage_context()) {
            log::error!("Render stage failed to build command buffers");
            return Err(KernelError::StageFailed);
        }
        Ok(())
    }

    /// Waits for the about-to-be-reused frame slot and acquires the next
    /// presentable image. Never presents.
    pub fn prepare_frame(&mut self) -> FrameResult {
        if !self.is_post_initialized {
            return FrameResult::Error;
        }

        let device = self.device.as_ref().unwrap();
        let fence = self.wait_fences[self.current_frame];

        // Throttles how far the cpu may race ahead of the gpu
        if let Err(err) = unsafe {
            device.vk().wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
        } {
            log::error!("Fence wait failed: {:?}", err);
            return frame_result_from(err);
        }

        match self.swapchain.as_ref().unwrap().acquire_next_image(self.present_complete) {
            Ok((image_index, _suboptimal)) => {
                // A suboptimal acquire still delivered an image; presentation
                // will report it and trigger the resize then
                self.current_buffer = image_index;
                FrameResult::Success
            }
            Err(err) => {
                if err != vk::Result::ERROR_OUT_OF_DATE_KHR {
                    log::error!("Image acquisition failed: {:?}", err);
                }
                frame_result_from(err)
            }
        }
    }

    /// Submits the caller populated command buffers, then queues the image
    /// for presentation.
    pub fn submit_frame(&mut self, command_buffers: &[vk::CommandBuffer]) -> FrameResult {
        if !self.is_post_initialized {
            return FrameResult::Error;
        }

        let device = self.device.as_ref().unwrap();
        let fence = self.wait_fences[self.current_frame];

        if let Err(err) = unsafe {
            device.vk().reset_fences(std::slice::from_ref(&fence))
        } {
            log::error!("Fence reset failed: {:?}", err);
            return frame_result_from(err);
        }

        let wait_semaphores = [self.present_complete];
        let signal_semaphores = [self.render_complete];
        let wait_stages = [self.submit_pipeline_stages];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        if let Err(err) = unsafe {
            device.vk().queue_submit(
                device.get_graphics_queue().get_handle(),
                std::slice::from_ref(&submit_info),
                fence,
            )
        } {
            log::error!("Queue submission failed: {:?}", err);
            return frame_result_from(err);
        }

        let present_queue = device.get_present_queue().get_handle();
        let result = self.swapchain.as_ref().unwrap().queue_present(
            present_queue,
            self.current_buffer,
            self.render_complete,
        );

        match result {
            Ok(false) => {
                self.current_frame = (self.current_frame + 1) % self.wait_fences.len();
                FrameResult::Success
            }
            Ok(true) => FrameResult::OutOfDate,
            Err(err) => {
                if err != vk::Result::ERROR_OUT_OF_DATE_KHR {
                    log::error!("Presentation failed: {:?}", err);
                }
                frame_result_from(err)
            }
        }
    }

    /// Runs one frame iteration: prepare, submit the stage's prerecorded
    /// command buffer for the acquired image, present, and run the resize
    /// protocol when the presentation target went out of date.
    pub fn render(&mut self, stage: &mut dyn RenderStage) -> RenderResult {
        if self.has_errors {
            return RenderResult::Fatal;
        }

        if self.resize_signal.peek().is_some() {
            if self.resize_window(stage).is_err() {
                return RenderResult::Error;
            }
        }

        match dispatch_frame_result(self.prepare_frame()) {
            FrameAction::Continue => {}
            FrameAction::Resize => {
                return match self.resize_window(stage) {
                    Ok(()) => RenderResult::Success,
                    Err(_) => RenderResult::Error,
                };
            }
            FrameAction::Abort => {
                self.has_errors = true;
                return RenderResult::Fatal;
            }
        }

        let command_buffer = match self.get_draw_command_buffers().get(self.current_buffer as usize) {
            Some(buffer) => *buffer,
            None => {
                log::error!("No command buffer recorded for image {}", self.current_buffer);
                self.has_errors = true;
                return RenderResult::Fatal;
            }
        };

        match dispatch_frame_result(self.submit_frame(&[command_buffer])) {
            FrameAction::Continue => RenderResult::Success,
            FrameAction::Resize => {
                match self.resize_window(stage) {
                    Ok(()) => RenderResult::Success,
                    Err(_) => RenderResult::Error,
                }
            }
            FrameAction::Abort => {
                self.has_errors = true;
                RenderResult::Fatal
            }
        }
    }

    /// Runs the resize protocol against the authoritative platform extent.
    ///
    /// Any failing step sets the sticky error flag; the kernel is no longer
    /// usable afterwards.
    pub fn resize_window(&mut self, stage: &mut dyn RenderStage) -> Result<(), KernelError> {
        let result = self.resize_window_inner(stage);
        if let Err(err) = &result {
            log::error!("Resize failed: {:?}", err);
            self.has_errors = true;
        }
        result
    }

    fn resize_window_inner(&mut self, stage: &mut dyn RenderStage) -> Result<(), KernelError> {
        if !self.is_post_initialized {
            return Err(KernelError::InvalidPhase);
        }

        log::info!("Resizing window");

        let device = self.device.as_ref().unwrap().clone();

        device.wait_idle()?;
        unsafe {
            device.vk().queue_wait_idle(device.get_graphics_queue().get_handle())
        }?;

        let requested = self.resize_signal.take();

        // The platform reported extent is authoritative; the callback
        // supplied dimensions only matter when the platform defers to us
        let capabilities = self.swapchain.as_ref().unwrap().query_surface_capabilities()?;
        let (width, height) = if capabilities.current_extent.width != u32::MAX {
            (capabilities.current_extent.width, capabilities.current_extent.height)
        } else if let Some((width, height)) = requested {
            (width, height)
        } else {
            (self.width, self.height)
        };

        let old_image_count = self.swapchain.as_ref().unwrap().get_image_count();

        self.swapchain.as_mut().unwrap().re_setup(width, height, self.config.image_count)?;

        // The swapchain may have clamped the requested extent
        let extent = self.swapchain.as_ref().unwrap().get_surface_extent();
        self.width = extent.x;
        self.height = extent.y;
        let (width, height) = (self.width, self.height);

        self.multisample.as_mut().unwrap().recreate(width, height)?;

        render_pass::destroy_framebuffers(&device, &mut self.framebuffers);
        self.framebuffers = render_pass::create_framebuffers(
            &device,
            self.render_pass,
            self.swapchain.as_ref().unwrap(),
            self.multisample.as_ref().unwrap(),
        )?;

        let new_image_count = self.swapchain.as_ref().unwrap().get_image_count();
        if new_image_count != old_image_count {
            log::info!("Image count changed from {} to {}", old_image_count, new_image_count);
            device.wait_idle()?;
            self.destroy_synchronization();
            self.create_synchronization(new_image_count)?;
            self.command_pool.as_mut().unwrap().allocate_buffers(new_image_count)?;
        }
        self.current_frame = 0;

        if !stage.on_resize(&self.stage_context()) {
            return Err(KernelError::StageFailed);
        }

        self.build_commands(stage)?;

        log::info!("Resize complete: {}x{}, {} images", width, height, new_image_count);
        Ok(())
    }

    /// Releases everything in strict reverse creation order.
    pub fn destroy(&mut self) {
        log::info!("Destroying kernel");

        if let Some(device) = self.device.clone() {
            let _ = device.wait_idle();

            render_pass::destroy_framebuffers(&device, &mut self.framebuffers);

            if let Some(multisample) = &mut self.multisample {
                multisample.destroy();
            }

            self.destroy_synchronization();

            unsafe {
                if self.pipeline_cache != vk::PipelineCache::null() {
                    device.vk().destroy_pipeline_cache(self.pipeline_cache, None);
                    self.pipeline_cache = vk::PipelineCache::null();
                }
                if self.render_pass != vk::RenderPass::null() {
                    device.vk().destroy_render_pass(self.render_pass, None);
                    self.render_pass = vk::RenderPass::null();
                }
            }

            if let Some(swapchain) = &mut self.swapchain {
                swapchain.destroy();
            }

            if let Some(manager) = &mut self.descriptor_manager {
                manager.reset();
            }

            if let Some(pool) = &mut self.command_pool {
                pool.destroy();
            }
        }

        // Dropping the contexts releases the allocator, device, surface and
        // instance in that order
        self.multisample = None;
        self.swapchain = None;
        self.descriptor_manager = None;
        self.command_pool = None;
        self.device = None;

        if let Some(provider) = &mut self.surface_provider {
            provider.destroy();
        }
        self.surface_provider = None;
        self.surface = vk::SurfaceKHR::null();

        self.instance = None;

        self.is_post_initialized = false;
        self.is_initialized = false;
        self.is_pre_initialized = false;
    }
}

impl Drop for FrameKernel {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_results_map_to_actions() {
        assert_eq!(dispatch_frame_result(FrameResult::Success), FrameAction::Continue);
        assert_eq!(dispatch_frame_result(FrameResult::OutOfDate), FrameAction::Resize);
        assert_eq!(dispatch_frame_result(FrameResult::DeviceLost), FrameAction::Abort);
        assert_eq!(dispatch_frame_result(FrameResult::Error), FrameAction::Abort);
    }

    #[test]
    fn vulkan_results_map_to_frame_results() {
        assert_eq!(frame_result_from(vk::Result::SUCCESS), FrameResult::Success);
        assert_eq!(frame_result_from(vk::Result::ERROR_OUT_OF_DATE_KHR), FrameResult::OutOfDate);
        assert_eq!(frame_result_from(vk::Result::SUBOPTIMAL_KHR), FrameResult::OutOfDate);
        assert_eq!(frame_result_from(vk::Result::ERROR_DEVICE_LOST), FrameResult::DeviceLost);
        assert_eq!(frame_result_from(vk::Result::ERROR_INITIALIZATION_FAILED), FrameResult::Error);
    }

    /// Drives the loop decision logic with an injected out-of-date result and
    /// checks it requests exactly one resize before the next prepare.
    #[test]
    fn single_out_of_date_triggers_single_resize() {
        let injected = [
            FrameResult::Success,
            FrameResult::OutOfDate,
            FrameResult::Success,
            FrameResult::Success,
        ];

        let mut resizes = 0;
        for result in injected {
            match dispatch_frame_result(result) {
                FrameAction::Continue => {}
                FrameAction::Resize => resizes += 1,
                FrameAction::Abort => panic!("Unexpected abort"),
            }
        }

        assert_eq!(resizes, 1);
    }

    #[test]
    fn resize_signal_is_consumed_once() {
        let signal = ResizeSignal::new();
        assert_eq!(signal.peek(), None);

        signal.set_size(1024, 768);
        assert_eq!(signal.peek(), Some((1024, 768)));
        assert_eq!(signal.take(), Some((1024, 768)));
        assert_eq!(signal.take(), None);
    }

    #[test]
    fn phases_must_run_in_order() {
        let config = KernelConfig::new(
            CString::new("Test").unwrap(),
            CString::new("Test").unwrap(),
            800,
            600,
        );
        let mut kernel = FrameKernel::new(config);

        assert!(!kernel.has_errors());
        assert_eq!(kernel.prepare_frame(), FrameResult::Error);
        assert_eq!(kernel.submit_frame(&[]), FrameResult::Error);

        struct NopStage;
        impl RenderStage for NopStage {
            fn build_commands(&mut self, _: &StageContext) -> bool { true }
            fn on_resize(&mut self, _: &StageContext) -> bool { true }
        }

        // post_init before pre_init/init is an invalid phase transition
        match kernel.post_init(&mut NopStage) {
            Err(KernelError::InvalidPhase) => {}
            other => panic!("Expected InvalidPhase, got {:?}", other),
        }
    }

    #[test]
    fn pre_init_rejects_empty_extension_list() {
        let config = KernelConfig::new(
            CString::new("Test").unwrap(),
            CString::new("Test").unwrap(),
            800,
            600,
        );
        let mut kernel = FrameKernel::new(config);

        match kernel.pre_init() {
            Err(KernelError::Instance(InstanceCreateError::NoExtensions)) => {}
            other => panic!("Expected NoExtensions, got {:?}", other),
        }
    }

    #[test]
    fn pre_init_rejects_validation_without_layers() {
        let mut config = KernelConfig::new(
            CString::new("Test").unwrap(),
            CString::new("Test").unwrap(),
            800,
            600,
        );
        config.add_instance_extension(CStr::from_bytes_with_nul(b"VK_KHR_surface\0").unwrap());
        config.enable_validation = true;

        let mut kernel = FrameKernel::new(config);
        match kernel.pre_init() {
            Err(KernelError::Instance(InstanceCreateError::NoValidationLayers)) => {}
            other => panic!("Expected NoValidationLayers, got {:?}", other),
        }
    }
}
