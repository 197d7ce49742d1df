//! Lumen - Headless frame-loop driver
//!
//! Runs the GPU lifecycle core end to end: every frame transitions a render
//! target, streams light constants through upload memory, stages a
//! descriptor table and submits through the fenced queue.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use glam::Vec3;
use tracing::{debug, info};

use lumen_core::{BackendKind, FrameTimer, RendererConfig};
use lumen_renderer::{DescriptorAllocation, GpuContext, RootSignature, SubresourceSelection};
use lumen_rhi::{
    DescriptorHeapType, DescriptorRange, DescriptorRangeKind, DescriptorWrite,
    InlineDescriptorKind, PipelineBindPoint, RenderTargetBinding, ResourceId, ResourceLayout,
    RootSignatureDesc, TextureDesc, TextureFormat, TextureUsage,
};
use lumen_scene::{GpuLight, Light};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Headless,
    Vulkan,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Headless => BackendKind::Headless,
            Backend::Vulkan => BackendKind::Vulkan,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Drive the Lumen GPU lifecycle core")]
struct Args {
    /// Configuration file; defaults are used if it does not exist.
    #[arg(short, long, default_value = "lumen.toml")]
    config: PathBuf,

    /// Override the configured backend.
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// Override the configured number of frames in flight.
    #[arg(long)]
    frames_in_flight: Option<u32>,

    /// Number of frames to run.
    #[arg(short, long, default_value_t = 240)]
    frames: u64,

    /// Resize the render target every N frames (0 disables).
    #[arg(long, default_value_t = 60)]
    resize_every: u64,
}

/// Root parameter of the light constants.
const LIGHTS_ROOT_INDEX: u32 = 0;
/// Root parameter of the material texture table.
const MATERIAL_ROOT_INDEX: u32 = 1;

struct Demo {
    root_signature: RootSignature,
    material_views: DescriptorAllocation,
    material: ResourceId,
    target: ResourceId,
    target_view: DescriptorAllocation,
    target_size: u32,
    lights: Vec<Light>,
}

impl Demo {
    fn new(context: &GpuContext) -> Result<Self> {
        let root_signature = RootSignature::new(
            context.device().clone(),
            RootSignatureDesc::new()
                .with_inline(InlineDescriptorKind::Cbv, 0)
                .with_table([DescriptorRange::new(DescriptorRangeKind::Srv, 1, 0)]),
        )?;

        let material = context.create_texture(
            &TextureDesc::new_2d(512, 512, TextureFormat::Rgba8Unorm, TextureUsage::SAMPLED)
                .with_mip_levels(10),
        )?;
        let material_views = context.allocate_descriptors(DescriptorHeapType::CbvSrvUav, 1)?;
        if let Some(handle) = material_views.handle(0) {
            let write = DescriptorWrite::ShaderResource { resource: material };
            context.write_descriptor(handle, &write)?;
        }

        let target_size = 256;
        let (target, target_view) = Self::create_target(context, target_size)?;

        let mut sun = Light::directional(Vec3::new(-0.3, -1.0, -0.2))?;
        sun.set_intensity(3.0)?;
        let mut spot = Light::spot(Vec3::new(0.0, 4.0, 0.0), Vec3::NEG_Y, 12.0)?;
        spot.set_cone_angles(0.3, 0.5)?;
        let lights = vec![sun, Light::point(Vec3::ZERO, 6.0)?, spot];

        Ok(Self {
            root_signature,
            material_views,
            material,
            target,
            target_view,
            target_size,
            lights,
        })
    }

    fn create_target(
        context: &GpuContext,
        size: u32,
    ) -> Result<(ResourceId, DescriptorAllocation)> {
        let target = context.create_texture(&TextureDesc::new_2d(
            size,
            size,
            TextureFormat::Rgba16Float,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        ))?;
        let view = context.allocate_descriptors(DescriptorHeapType::Rtv, 1)?;
        if let Some(handle) = view.handle(0) {
            context.write_descriptor(
                handle,
                &DescriptorWrite::RenderTarget {
                    resource: target,
                    mip_slice: 0,
                    array_slice: 0,
                },
            )?;
        }
        Ok((target, view))
    }

    /// Recreates the render target at a new size, like a swap chain resize.
    fn resize(&mut self, context: &mut GpuContext, size: u32) -> Result<()> {
        let desc = TextureDesc::new_2d(
            size,
            size,
            TextureFormat::Rgba16Float,
            TextureUsage::RENDER_TARGET | TextureUsage::SAMPLED,
        );
        self.target = context.resize_texture(self.target, &desc)?;
        if let Some(handle) = self.target_view.handle(0) {
            context.write_descriptor(
                handle,
                &DescriptorWrite::RenderTarget {
                    resource: self.target,
                    mip_slice: 0,
                    array_slice: 0,
                },
            )?;
        }
        self.target_size = size;
        Ok(())
    }

    fn animate(&mut self, seconds: f32) -> Result<()> {
        let orbit = Vec3::new(seconds.cos() * 3.0, 1.0, seconds.sin() * 3.0);
        self.lights[1].set_position(orbit)?;
        Ok(())
    }

    fn render(&self, context: &mut GpuContext) -> Result<u64> {
        let mut list = context.get_command_list()?;

        list.transition_texture(
            self.material,
            SubresourceSelection::All,
            ResourceLayout::ShaderResource,
        )?;
        list.transition_texture(
            self.target,
            SubresourceSelection::All,
            ResourceLayout::RenderTarget,
        )?;

        let Some(view) = self.target_view.handle(0) else {
            anyhow::bail!("render target view is null");
        };
        list.begin_render_pass(
            &[RenderTargetBinding {
                view,
                clear: Some([0.02, 0.02, 0.03, 1.0]),
            }],
            None,
        )?;

        let lights: Vec<GpuLight> = self.lights.iter().map(Light::to_gpu).collect();
        list.set_root_signature(PipelineBindPoint::Graphics, &self.root_signature)?;
        list.set_dynamic_constant_buffer(LIGHTS_ROOT_INDEX, bytemuck::cast_slice(&lights))?;
        list.set_descriptor_table(MATERIAL_ROOT_INDEX, 0, &self.material_views)?;
        list.draw(3, 1, 0, 0)?;
        list.end_render_pass()?;

        list.transition_texture(
            self.target,
            SubresourceSelection::All,
            ResourceLayout::ShaderResource,
        )?;

        Ok(context.submit(list)?)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RendererConfig::load(&args.config)
        .with_context(|| format!("Failed to load {:?}", args.config))?;
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    if let Some(frames_in_flight) = args.frames_in_flight {
        config.frames_in_flight = frames_in_flight;
    }

    lumen_core::init_logging_with(&config.log_filter);
    info!("Starting Lumen ({:?} backend)", config.backend);

    let mut context = GpuContext::from_config(&config).context("Failed to create GPU context")?;
    let mut demo = Demo::new(&context)?;
    let mut timer = FrameTimer::new();

    for frame in 0..args.frames {
        context.begin_frame()?;

        if args.resize_every > 0 && frame > 0 && frame % args.resize_every == 0 {
            let size = if demo.target_size == 256 { 384 } else { 256 };
            demo.resize(&mut context, size)?;
        }

        demo.animate(timer.elapsed().as_secs_f32())?;
        let fence = demo.render(&mut context)?;
        context.end_frame();

        let delta = timer.tick();
        debug!("Frame {} submitted at fence {} ({:?})", frame, fence, delta);
    }

    context.flush()?;
    info!(
        "Ran {} frames, average {:?}; {} command allocators, {} upload pages pooled",
        timer.frame_count(),
        timer.average_frame_time(),
        context.queue().pooled_allocator_count(),
        context.queue().pooled_upload_page_count()
    );

    Ok(())
}
