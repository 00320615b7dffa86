//! Renderer - owns the Vulkan object graph and drives recorded frames onto the swapchain.

use std::sync::Arc;

use ash::{vk, Device};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use vesper_core::collections::SmallVec;
use vesper_core::log;

use crate::buffer::{BufferKind, RenderBuffer};
use crate::command::{CommandEncoder, CommandPool};
use crate::config::RendererConfig;
use crate::core::{choose_sample_count, select_physical_device, RhiCore};
use crate::device::RenderDevice;
use crate::error::{Result, RhiError};
use crate::frame::{CommandFrame, ShaderState};
use crate::render_pass::{Framebuffer, RenderPass};
use crate::replay::{is_zero_area, CommandSink, RecordState, Replayer};
use crate::sampler::{Sampler, SamplerConfig};
use crate::shader::{RenderTarget, Shader, ShaderDesc};
use crate::swapchain::{Swapchain, SwapchainWindow};
use crate::synchronization::{Fence, Semaphore};
use crate::texture::{create_sampled_image, Image, ImageInfo, Texture, TextureDesc, TextureExtent};
use crate::MAX_SWAPCHAIN_IMAGES;

type PerImage<T> = SmallVec<[T; MAX_SWAPCHAIN_IMAGES]>;

fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

/// Reset the frame fence, then submit work that signals it.
///
/// A failed submission leaves nothing to signal the fence, so `resignal` puts it
/// back in the signaled state and later waits on it still return.
fn fenced_submit(
    reset: impl FnOnce() -> Result<()>,
    submit: impl FnOnce() -> Result<()>,
    resignal: impl FnOnce() -> Result<()>,
) -> Result<()> {
    reset()?;
    if let Err(err) = submit() {
        if let Err(signal_err) = resignal() {
            log::error!("Could not restore the frame fence after a failed submit: {}", signal_err);
        }
        return Err(err);
    }
    Ok(())
}

/// One primary command buffer per swapchain image, each paired with its framebuffer.
#[derive(Default)]
pub struct SwapchainCommands {
    device: Option<Device>,
    buffers: PerImage<vk::CommandBuffer>,
    framebuffers: PerImage<vk::Framebuffer>,
    extent: vk::Extent2D,
    executable: bool,
}

impl SwapchainCommands {
    fn attach(
        &mut self,
        device: Device,
        buffers: PerImage<vk::CommandBuffer>,
        framebuffers: PerImage<vk::Framebuffer>,
        extent: vk::Extent2D,
    ) {
        self.device = Some(device);
        self.buffers = buffers;
        self.framebuffers = framebuffers;
        self.extent = extent;
        self.executable = false;
    }

    fn detach(&mut self) -> PerImage<vk::CommandBuffer> {
        self.device = None;
        self.framebuffers.clear();
        self.executable = false;
        std::mem::take(&mut self.buffers)
    }

    /// A complete frame is recorded for every image.
    pub fn is_executable(&self) -> bool {
        self.executable && !self.buffers.is_empty()
    }

    /// Command buffer to submit for `image_index`, once a complete frame has been recorded.
    pub fn executable_buffer(&self, image_index: u32) -> Option<vk::CommandBuffer> {
        if !self.executable {
            return None;
        }
        self.buffers.get(image_index as usize).copied()
    }

    pub fn image_count(&self) -> usize {
        self.buffers.len()
    }

    fn for_each(&self, mut f: impl FnMut(&CommandEncoder, vk::Framebuffer)) {
        let Some(device) = &self.device else { return };
        for (&cmd, &framebuffer) in self.buffers.iter().zip(&self.framebuffers) {
            f(&CommandEncoder::new(device, cmd), framebuffer);
        }
    }

    fn try_for_each(&self, mut f: impl FnMut(&CommandEncoder) -> Result<()>) -> Result<()> {
        let Some(device) = &self.device else { return Ok(()) };
        for &cmd in &self.buffers {
            f(&CommandEncoder::new(device, cmd))?;
        }
        Ok(())
    }

    /// Command buffers may still be executing the previous frame.
    fn wait_until_unused(&self) -> Result<()> {
        match &self.device {
            Some(device) => unsafe { device.device_wait_idle() }.map_err(RhiError::device("device_wait_idle")),
            None => Ok(()),
        }
    }
}

impl CommandSink for SwapchainCommands {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn begin(&mut self) -> Result<()> {
        self.wait_until_unused()?;
        self.executable = false;
        self.try_for_each(|encoder| encoder.begin(vk::CommandBufferUsageFlags::empty()))
    }

    fn end(&mut self) -> Result<()> {
        self.try_for_each(|encoder| encoder.end())?;
        self.executable = true;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.wait_until_unused()?;
        self.executable = false;
        self.try_for_each(|encoder| encoder.reset())
    }

    fn begin_render_pass(&mut self, shader: &ShaderState) {
        let extent = self.extent;
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        }; 2];

        self.for_each(|encoder, framebuffer| {
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(shader.render_pass)
                .framebuffer(framebuffer)
                .render_area(full_scissor(extent))
                .clear_values(&clear_values);

            encoder.begin_render_pass(&begin_info);
            encoder.set_viewport(0, &[full_viewport(extent)]);
            encoder.set_scissor(0, &[full_scissor(extent)]);
            if shader.descriptor_set != vk::DescriptorSet::null() {
                encoder.bind_graphics_descriptor_sets(shader.layout, 0, &[shader.descriptor_set]);
            }
        });
    }

    fn set_viewport(&mut self) {
        let viewport = full_viewport(self.extent);
        self.for_each(|encoder, _| encoder.set_viewport(0, &[viewport]));
    }

    fn set_scissor(&mut self) {
        let scissor = full_scissor(self.extent);
        self.for_each(|encoder, _| encoder.set_scissor(0, &[scissor]));
    }

    fn draw(&mut self, shader: &ShaderState, vertex_buffer: vk::Buffer, count: u32, first: u32, instances: u32) {
        self.for_each(|encoder, _| {
            encoder.bind_graphics_pipeline(shader.pipeline);
            encoder.bind_vertex_buffers(0, &[vertex_buffer], &[0]);
            encoder.draw(count, instances, first, 0);
        });
    }

    fn draw_indexed(
        &mut self,
        shader: &ShaderState,
        vertex_buffer: vk::Buffer,
        index_buffer: vk::Buffer,
        count: u32,
        first: u32,
        instances: u32,
    ) {
        self.for_each(|encoder, _| {
            encoder.bind_graphics_pipeline(shader.pipeline);
            encoder.bind_vertex_buffers(0, &[vertex_buffer], &[0]);
            encoder.bind_index_buffer(index_buffer, 0, vk::IndexType::UINT32);
            encoder.draw_indexed(count, instances, first, 0, 0);
        });
    }

    fn end_render_pass(&mut self) {
        self.for_each(|encoder, _| encoder.end_render_pass());
    }
}

/// The single outstanding frame's synchronization.
struct FrameSync {
    in_flight: Fence,
    image_available: Semaphore,
    render_finished: Semaphore,
}

impl FrameSync {
    fn new(device: &Device) -> Result<Self> {
        Ok(Self {
            in_flight: Fence::new(device, true)?,
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
        })
    }
}

fn create_color_target(
    device: &RenderDevice,
    swapchain: &Swapchain,
    samples: vk::SampleCountFlags,
) -> Result<Option<Image>> {
    if samples == vk::SampleCountFlags::TYPE_1 {
        return Ok(None);
    }

    let extent = swapchain.extent();
    let info = ImageInfo {
        image_type: vk::ImageType::TYPE_2D,
        view_type: vk::ImageViewType::TYPE_2D,
        format: swapchain.format(),
        extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
        usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
        samples,
    };
    Image::new(device, &info).map(Some)
}

fn create_framebuffers(
    device: &Device,
    render_pass: &RenderPass,
    swapchain: &Swapchain,
    color_target: Option<&Image>,
) -> Result<PerImage<Framebuffer>> {
    swapchain
        .views()
        .iter()
        .map(|&view| {
            let attachments: SmallVec<[vk::ImageView; 2]> = match color_target {
                Some(color) => [color.view(), view].into_iter().collect(),
                None => [view].into_iter().collect(),
            };
            Framebuffer::new(device, render_pass.handle(), &attachments, swapchain.extent())
        })
        .collect()
}

/// Renders recorded [`CommandFrame`]s to a window.
///
/// Buffers, textures and shaders created here must be dropped before the renderer.
pub struct Renderer {
    core: Option<RhiCore>,
    window: Option<SwapchainWindow>,
    device: Option<Arc<RenderDevice>>,
    swapchain: Option<Swapchain>,
    color_target: Option<Image>,
    render_pass: Option<RenderPass>,
    framebuffers: PerImage<Framebuffer>,
    command_pool: Option<CommandPool>,
    sync: Option<FrameSync>,
    default_texture: Option<Image>,
    default_sampler: Option<Sampler>,

    replayer: Replayer<SwapchainCommands>,
    samples: vk::SampleCountFlags,
    extent: vk::Extent2D,
}

impl Renderer {
    #[profiling::function]
    pub fn new<W>(window: &W, extent: vk::Extent2D, config: RendererConfig) -> Result<Self>
    where
        W: HasWindowHandle + HasDisplayHandle + ?Sized,
    {
        let display_handle = window
            .display_handle()
            .map_err(|e| RhiError::Loading(format!("display handle: {}", e)))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RhiError::Loading(format!("window handle: {}", e)))?
            .as_raw();

        let mut renderer = Self {
            core: None,
            window: None,
            device: None,
            swapchain: None,
            color_target: None,
            render_pass: None,
            framebuffers: SmallVec::new(),
            command_pool: None,
            sync: None,
            default_texture: None,
            default_sampler: None,
            replayer: Replayer::new(SwapchainCommands::default()),
            samples: vk::SampleCountFlags::TYPE_1,
            extent,
        };

        if let Err(err) = renderer.initialize(display_handle, window_handle, extent, &config) {
            log::error!("Renderer construction failed: {}", err);
            renderer.destroy_partial();
            return Err(err);
        }

        Ok(renderer)
    }

    pub fn from_window(window: &winit::window::Window, config: RendererConfig) -> Result<Self> {
        let size = window.inner_size();
        Self::new(
            window,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
            config,
        )
    }

    fn initialize(
        &mut self,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        extent: vk::Extent2D,
        config: &RendererConfig,
    ) -> Result<()> {
        if is_zero_area(extent) {
            return Err(RhiError::invalid_argument("initial extent must be non-zero"));
        }

        let core = self.core.insert(RhiCore::new(display_handle, config)?);
        let window = self.window.insert(SwapchainWindow::new(core, display_handle, window_handle)?);

        let physical_device = select_physical_device(core.instance(), window)?;
        self.samples = choose_sample_count(
            physical_device.properties().limits.framebuffer_color_sample_counts,
            config.msaa_samples,
        );
        log::info!("Using {:?} MSAA", self.samples);

        let device: &Arc<RenderDevice> =
            self.device.insert(Arc::new(RenderDevice::new(core.instance(), &physical_device)?));
        let handle = device.handle();

        let swapchain = self
            .swapchain
            .insert(Swapchain::new(core, device, window, extent, config.present_mode)?);
        self.color_target = create_color_target(device, swapchain, self.samples)?;
        let color_target = self.color_target.as_ref();

        let render_pass = self
            .render_pass
            .insert(RenderPass::new(handle, swapchain.format(), self.samples, true)?);
        self.framebuffers = create_framebuffers(handle, render_pass, swapchain, color_target)?;

        let command_pool = self.command_pool.insert(CommandPool::new(
            handle,
            device.graphics_queue().family_index(),
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?);
        let buffers = command_pool.allocate(swapchain.image_count() as u32)?;

        self.sync = Some(FrameSync::new(handle)?);
        self.default_texture = Some(create_sampled_image(device, &TextureExtent::new_2d(1, 1))?);
        self.default_sampler = Some(Sampler::new(handle, &SamplerConfig::linear())?);

        self.extent = swapchain.extent();
        let framebuffers = self.framebuffers.iter().map(Framebuffer::handle).collect();
        self.replayer
            .sink_mut()
            .attach(handle.clone(), buffers, framebuffers, self.extent);

        log::info!(
            "Renderer ready: {}x{}, {} swapchain images",
            self.extent.width,
            self.extent.height,
            swapchain.image_count()
        );
        Ok(())
    }

    /// Tear down whatever exists, newest first. Safe to call more than once.
    fn destroy_partial(&mut self) {
        if self.replayer.state().in_render_pass {
            if let Err(err) = self.replayer.end_render() {
                log::warn!("Closing the open render pass failed: {}", err);
            }
        }
        if self.replayer.record_state() == RecordState::Recording {
            if let Err(err) = self.replayer.end_record() {
                log::warn!("Closing the open record failed: {}", err);
            }
        }

        if let Some(device) = &self.device {
            if let Err(err) = device.wait_until_idle() {
                log::warn!("Waiting for the device before teardown failed: {}", err);
            }
        }

        self.default_sampler = None;
        self.default_texture = None;
        self.sync = None;

        let buffers = self.replayer.sink_mut().detach();
        if let Some(pool) = self.command_pool.take() {
            pool.free(&buffers);
        }

        self.framebuffers.clear();
        self.color_target = None;
        self.swapchain = None;
        self.render_pass = None;

        if let Some(device) = self.device.take() {
            if Arc::strong_count(&device) > 1 {
                log::warn!("Render device is still shared during teardown");
            }
        }

        self.window = None;
        self.core = None;
    }

    fn device(&self) -> Result<&Arc<RenderDevice>> {
        self.device
            .as_ref()
            .ok_or_else(|| RhiError::invalid_state("renderer is not initialized"))
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| RhiError::invalid_state("renderer is not initialized"))
    }

    /// Submit the recorded frame to the next swapchain image and present it.
    ///
    /// Returns `Ok(false)` when nothing was presented: a zero-area window, no
    /// recorded frame, or a swapchain that needs [`Renderer::resize`].
    #[profiling::function]
    pub fn execute(&mut self) -> Result<bool> {
        if is_zero_area(self.extent) {
            return Ok(false);
        }
        if self.replayer.record_state() == RecordState::Recording {
            return Err(RhiError::invalid_state("execute called while recording"));
        }
        if self.device()?.rebuild_request().take() {
            log::debug!("Descriptors changed under recorded frames, re-recording");
            self.replayer.rebuild()?;
        }
        // An acquired image must be presented, so nothing is acquired without a frame to submit.
        if !self.replayer.sink().is_executable() {
            log::debug!("No recorded frame to execute");
            return Ok(false);
        }

        let device = self.device()?;
        let swapchain = self.swapchain()?;
        let sync = self
            .sync
            .as_ref()
            .ok_or_else(|| RhiError::invalid_state("renderer is not initialized"))?;

        sync.in_flight.wait()?;

        let Some((image_index, acquire_suboptimal)) = swapchain.acquire_next_image(sync.image_available.handle())?
        else {
            log::warn!("Swapchain is out of date, resize required");
            return Ok(false);
        };

        let cmd = self
            .replayer
            .sink()
            .executable_buffer(image_index)
            .ok_or_else(|| RhiError::invalid_state(format!("no command buffer for swapchain image {}", image_index)))?;

        fenced_submit(
            || sync.in_flight.reset(),
            || {
                device.submit_frame(
                    cmd,
                    sync.image_available.handle(),
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    sync.render_finished.handle(),
                    sync.in_flight.handle(),
                )
            },
            || device.signal_fence(sync.in_flight.handle()),
        )?;

        let present_suboptimal = swapchain.present(
            device.present_queue().handle(),
            image_index,
            sync.render_finished.handle(),
        )?;

        if acquire_suboptimal || present_suboptimal {
            log::warn!("Swapchain is suboptimal, resize required");
            return Ok(false);
        }
        Ok(true)
    }

    /// Block until the last executed frame finished on the GPU.
    pub fn wait_executing(&self) -> Result<()> {
        match &self.sync {
            Some(sync) => sync.in_flight.wait(),
            None => Ok(()),
        }
    }

    /// Recreate the swapchain and its targets for `extent`, then replay the live frame.
    #[profiling::function]
    pub fn resize(&mut self, extent: vk::Extent2D) -> Result<()> {
        if self.replayer.record_state() != RecordState::Idle {
            return Err(RhiError::invalid_state("resize called while recording"));
        }

        let device = self.device()?.clone();
        device.wait_until_idle()?;

        if is_zero_area(extent) {
            log::debug!("Window has zero area, pausing presentation");
            self.extent = extent;
            self.replayer.sink_mut().extent = extent;
            return Ok(());
        }

        let (Some(swapchain), Some(window), Some(render_pass), Some(command_pool)) = (
            self.swapchain.as_mut(),
            self.window.as_ref(),
            self.render_pass.as_ref(),
            self.command_pool.as_ref(),
        ) else {
            return Err(RhiError::invalid_state("renderer is not initialized"));
        };

        swapchain.resize(&device, window, extent)?;

        self.framebuffers.clear();
        self.color_target = None;
        self.color_target = create_color_target(&device, swapchain, self.samples)?;
        self.framebuffers = create_framebuffers(device.handle(), render_pass, swapchain, self.color_target.as_ref())?;

        let mut buffers = self.replayer.sink_mut().detach();
        if buffers.len() != swapchain.image_count() {
            command_pool.free(&buffers);
            buffers = command_pool.allocate(swapchain.image_count() as u32)?;
        }

        self.extent = swapchain.extent();
        let framebuffers = self.framebuffers.iter().map(Framebuffer::handle).collect();
        self.replayer
            .sink_mut()
            .attach(device.handle().clone(), buffers, framebuffers, self.extent);

        device.rebuild_request().take();
        self.replayer.rebuild()
    }

    pub fn create_buffer(&self, kind: BufferKind, size: vk::DeviceSize) -> Result<RenderBuffer> {
        let buffer = RenderBuffer::new(self.device()?, kind, size)?;
        log::trace!("Created {:?} buffer of {} bytes", kind, size);
        Ok(buffer)
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Texture> {
        let texture = Texture::new(self.device()?, desc)?;
        log::trace!("Created texture {:?}", desc.extent);
        Ok(texture)
    }

    pub fn create_shader(&self, desc: &ShaderDesc) -> Result<Shader> {
        let (Some(texture), Some(sampler)) = (&self.default_texture, &self.default_sampler) else {
            return Err(RhiError::invalid_state("renderer is not initialized"));
        };

        let target = RenderTarget {
            format: self.swapchain()?.format(),
            samples: self.samples,
        };
        let default_image = vk::DescriptorImageInfo {
            sampler: sampler.handle(),
            image_view: texture.view(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };

        Shader::new(self.device()?, desc, target, default_image)
    }

    /// Copy of the live command frame.
    pub fn get_commands_frame(&self) -> CommandFrame {
        self.replayer.snapshot()
    }

    /// Replace the live frame and re-record every command buffer from it.
    pub fn set_commands_frame(&mut self, frame: CommandFrame) -> Result<()> {
        self.replayer.set_frame(frame)
    }

    pub fn clear_commands_frame(&mut self) -> Result<()> {
        self.replayer.clear_frame()
    }

    /// Append `frame` to the live frame, recording it into the open command buffers.
    pub fn concat_commands_frame(&mut self, frame: &CommandFrame) -> Result<()> {
        self.replayer.concat_frame(frame)
    }

    pub fn begin_record(&mut self) -> Result<()> {
        self.replayer.begin_record()
    }

    pub fn begin_render(&mut self) -> Result<()> {
        self.replayer.begin_render()
    }

    pub fn update_viewport(&mut self) -> Result<()> {
        self.replayer.update_viewport()
    }

    pub fn update_scissor(&mut self) -> Result<()> {
        self.replayer.update_scissor()
    }

    pub fn draw_vertices(&mut self, count: u32, first: u32, instances: u32) -> Result<()> {
        self.replayer.draw_vertices(count, first, instances)
    }

    pub fn draw_indexed(&mut self, count: u32, first: u32, instances: u32) -> Result<()> {
        self.replayer.draw_indexed(count, first, instances)
    }

    pub fn end_render(&mut self) -> Result<()> {
        self.replayer.end_render()
    }

    pub fn end_record(&mut self) -> Result<()> {
        self.replayer.end_record()
    }

    pub fn bind_buffer(&mut self, buffer: &RenderBuffer) -> Result<()> {
        if !buffer.is_owned_by(self.device()?) {
            return Err(RhiError::invalid_argument("buffer belongs to another renderer"));
        }

        if buffer.kind().is_index() {
            self.replayer.bind_index_buffer(buffer.handle())
        } else {
            self.replayer.bind_vertex_buffer(buffer.handle())
        }
    }

    pub fn set_shader(&mut self, shader: &Shader) -> Result<()> {
        if !shader.is_owned_by(self.device()?) {
            return Err(RhiError::invalid_argument("shader belongs to another renderer"));
        }
        self.replayer.set_shader(shader.state())
    }

    pub fn record_state(&self) -> RecordState {
        self.replayer.record_state()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn sample_count(&self) -> vk::SampleCountFlags {
        self.samples
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.destroy_partial();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_and_scissor_cover_the_extent() {
        let extent = vk::Extent2D { width: 800, height: 600 };

        let viewport = full_viewport(extent);
        assert_eq!((viewport.x, viewport.y), (0.0, 0.0));
        assert_eq!((viewport.width, viewport.height), (800.0, 600.0));
        assert_eq!((viewport.min_depth, viewport.max_depth), (0.0, 1.0));

        let scissor = full_scissor(extent);
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 0));
        assert_eq!(scissor.extent, extent);
    }

    #[test]
    fn detached_commands_emit_nothing() {
        let mut commands = SwapchainCommands::default();
        assert!(commands.begin().is_ok());
        assert!(commands.end().is_ok());
        assert_eq!(commands.image_count(), 0);
        assert_eq!(commands.executable_buffer(0), None);
        assert!(commands.reset().is_ok());
    }

    #[test]
    fn execution_is_gated_on_a_completed_frame() {
        let mut commands = SwapchainCommands::default();
        assert!(!commands.is_executable());

        // Ending a frame with no command buffers leaves nothing to submit.
        commands.end().unwrap();
        assert!(!commands.is_executable());

        commands.buffers.push(vk::CommandBuffer::null());
        commands.begin().unwrap();
        assert!(!commands.is_executable());
        commands.end().unwrap();
        assert!(commands.is_executable());

        commands.reset().unwrap();
        assert!(!commands.is_executable());

        commands.end().unwrap();
        commands.detach();
        assert!(!commands.is_executable());
    }

    #[test]
    fn failed_submit_signals_the_fence_again() {
        use std::cell::RefCell;

        let calls = RefCell::new(Vec::new());
        let result = fenced_submit(
            || Ok(calls.borrow_mut().push("reset")),
            || {
                calls.borrow_mut().push("submit");
                Err(RhiError::invalid_state("queue lost"))
            },
            || Ok(calls.borrow_mut().push("resignal")),
        );
        assert!(matches!(result, Err(RhiError::InvalidState(_))));
        assert_eq!(*calls.borrow(), vec!["reset", "submit", "resignal"]);

        calls.borrow_mut().clear();
        fenced_submit(
            || Ok(calls.borrow_mut().push("reset")),
            || Ok(calls.borrow_mut().push("submit")),
            || Ok(calls.borrow_mut().push("resignal")),
        )
        .unwrap();
        assert_eq!(*calls.borrow(), vec!["reset", "submit"]);

        // A fence that cannot be reset is never submitted with.
        calls.borrow_mut().clear();
        let result = fenced_submit(
            || Err(RhiError::invalid_state("reset failed")),
            || Ok(calls.borrow_mut().push("submit")),
            || Ok(calls.borrow_mut().push("resignal")),
        );
        assert!(result.is_err());
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn a_frame_executes_only_after_it_ends() {
        let mut commands = SwapchainCommands::default();
        commands.buffers.push(vk::CommandBuffer::null());

        assert_eq!(commands.executable_buffer(0), None);
        commands.executable = true;
        assert_eq!(commands.executable_buffer(0), Some(vk::CommandBuffer::null()));
        assert_eq!(commands.executable_buffer(1), None);
    }
}
