use bitflags::bitflags;
use cinder_utils::Extent2D;
use slotmap::new_key_type;
use smallvec::SmallVec;
use std::sync::Arc;

new_key_type! {
    pub struct BufferId;
    pub struct ImageId;
    pub struct PipelineId;
    pub struct FenceId;
    pub struct SemaphoreId;
    pub struct SwapchainId;
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const STORAGE = 1 << 2;
        const UNIFORM = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }

    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const COLOR_ATTACHMENT = 1 << 0;
        const DEPTH_ATTACHMENT = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
        const PRESENT = 1 << 6;
    }

    /// Pipeline stages used to scope barriers and semaphore waits.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 7;
        const COMPUTE_SHADER = 1 << 8;
        const TRANSFER = 1 << 9;
        const BOTTOM_OF_PIPE = 1 << 10;
        const HOST = 1 << 11;

        const FRAGMENT_TESTS = Self::EARLY_FRAGMENT_TESTS.bits() | Self::LATE_FRAGMENT_TESTS.bits();
        const ALL_GRAPHICS = Self::DRAW_INDIRECT.bits()
            | Self::VERTEX_INPUT.bits()
            | Self::VERTEX_SHADER.bits()
            | Self::FRAGMENT_SHADER.bits()
            | Self::FRAGMENT_TESTS.bits()
            | Self::COLOR_ATTACHMENT_OUTPUT.bits();
    }

    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const SHADER_READ = 1 << 4;
        const SHADER_WRITE = 1 << 5;
        const COLOR_ATTACHMENT_READ = 1 << 6;
        const COLOR_ATTACHMENT_WRITE = 1 << 7;
        const DEPTH_STENCIL_READ = 1 << 8;
        const DEPTH_STENCIL_WRITE = 1 << 9;
        const TRANSFER_READ = 1 << 10;
        const TRANSFER_WRITE = 1 << 11;
        const HOST_WRITE = 1 << 12;
        const MEMORY_READ = 1 << 13;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device local memory, only reachable through transfer commands.
    GpuOnly,
    /// Host visible memory the CPU writes directly.
    CpuToGpu,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

impl BufferDesc {
    pub fn gpu_only(label: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            location: MemoryLocation::GpuOnly,
        }
    }

    pub fn host_visible(label: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            location: MemoryLocation::CpuToGpu,
        }
    }

    pub fn staging(label: impl Into<String>, size: u64) -> Self {
        Self::host_visible(label, size, BufferUsage::TRANSFER_SRC)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Srgb,
    Rgba16Float,
    Depth32Float,
}

impl ImageFormat {
    pub const fn is_depth(&self) -> bool {
        matches!(self, ImageFormat::Depth32Float)
    }

    pub const fn bytes_per_pixel(&self) -> u32 {
        match self {
            ImageFormat::Rgba8Unorm
            | ImageFormat::Rgba8Srgb
            | ImageFormat::Bgra8Srgb
            | ImageFormat::Depth32Float => 4,
            ImageFormat::Rgba16Float => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub label: String,
    pub extent: Extent2D,
    pub layers: u32,
    /// Sampled as an array even when it has a single layer.
    pub array: bool,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

impl ImageDesc {
    pub fn attachment(label: impl Into<String>, extent: Extent2D, format: ImageFormat) -> Self {
        let attachment = if format.is_depth() {
            ImageUsage::DEPTH_ATTACHMENT
        } else {
            ImageUsage::COLOR_ATTACHMENT
        };

        Self {
            label: label.into(),
            extent,
            layers: 1,
            array: false,
            format,
            usage: attachment | ImageUsage::SAMPLED,
        }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self.array = true;
        self
    }

    pub fn sampled(label: impl Into<String>, extent: Extent2D, format: ImageFormat) -> Self {
        Self {
            label: label.into(),
            extent,
            layers: 1,
            array: false,
            format,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
        }
    }
}

/// Image layouts an image moves through while it is used by different stages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    DepthAttachment,
    ShaderReadOnly,
    TransferDst,
    Present,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Geometry,
    Shadow,
    Lighting,
    Post,
    Gui,
    Composite,
    Skinning,
}

impl ShaderKind {
    pub const ALL: [ShaderKind; 7] = [
        ShaderKind::Geometry,
        ShaderKind::Shadow,
        ShaderKind::Lighting,
        ShaderKind::Post,
        ShaderKind::Gui,
        ShaderKind::Composite,
        ShaderKind::Skinning,
    ];

    pub const fn file_stem(&self) -> &'static str {
        match self {
            ShaderKind::Geometry => "geometry",
            ShaderKind::Shadow => "shadow",
            ShaderKind::Lighting => "lighting",
            ShaderKind::Post => "post",
            ShaderKind::Gui => "gui",
            ShaderKind::Composite => "composite",
            ShaderKind::Skinning => "skinning",
        }
    }
}

/// Compiled shader code as produced by the shader toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinary {
    pub kind: ShaderKind,
    pub code: Arc<[u8]>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum VertexLayout {
    /// Vertices are generated in the shader (fullscreen triangles).
    None,
    /// `Vertex3D` at binding 0.
    Mesh,
    /// `GuiVertex` at binding 0.
    Gui,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineKind {
    Graphics {
        color_formats: SmallVec<[ImageFormat; 4]>,
        depth_format: Option<ImageFormat>,
        vertex_layout: VertexLayout,
        depth_bias: f32,
        blend: bool,
    },
    Compute {
        workgroup_size: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDesc {
    pub label: String,
    pub shader: ShaderBinary,
    pub kind: PipelineKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Timeout,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub image: ImageId,
    pub suboptimal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub extent: Extent2D,
    pub image_count: u32,
    pub format: ImageFormat,
    pub vsync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub id: SwapchainId,
    pub images: Vec<ImageId>,
    pub extent: Extent2D,
    pub format: ImageFormat,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Software,
    Other(u32),
}

impl GpuVendor {
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10de => GpuVendor::Nvidia,
            0x1002 | 0x1022 => GpuVendor::Amd,
            0x8086 => GpuVendor::Intel,
            0x10005 => GpuVendor::Software,
            other => GpuVendor::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub name: String,
    pub vendor: GpuVendor,
    pub multi_draw_indirect: bool,
    pub indirect_first_instance: bool,
    pub compute: bool,
    pub texture_binding_array: bool,
    pub max_image_array_layers: u32,
    pub max_image_dimension: u32,
    pub diagnostic_checkpoints: bool,
}

/// A semaphore wait of a submission, scoped to the stages that must not start
/// before the semaphore is signaled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: SemaphoreId,
    pub stages: PipelineStages,
}

pub struct Submission<'a> {
    pub label: &'static str,
    pub command_buffer: &'a super::CommandBuffer,
    pub wait: &'a [SemaphoreWait],
    pub signal: &'a [SemaphoreId],
    pub fence: Option<FenceId>,
}
