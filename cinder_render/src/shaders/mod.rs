//! Compiled shader binaries used by the passes.
//!
//! The shader toolchain is an external collaborator behind [`ShaderCompiler`].
//! A [`ShaderLibrary`] holds one binary per [`ShaderKind`]. Binaries come from
//! `<shader_dir>/<kind>.bin`, are recompiled from `<kind>.wgsl` when the
//! configuration asks for it and the source is newer, and fall back to the
//! sources built into the crate.

use crate::error::{Result, ShaderCompileErr, ShaderIoErr};
use crate::gpu::{ShaderBinary, ShaderKind};
use cinder_utils::RenderConfig;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use snafu::ResultExt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, trace};

const SHADER_GEOMETRY: &str = concat!(include_str!("frame.wgsl"), include_str!("geometry.wgsl"));
const SHADER_SHADOW: &str = include_str!("shadow.wgsl");
const SHADER_LIGHTING: &str = concat!(
    include_str!("frame.wgsl"),
    include_str!("fullscreen.wgsl"),
    include_str!("lighting.wgsl")
);
const SHADER_POST: &str = concat!(include_str!("fullscreen.wgsl"), include_str!("post.wgsl"));
const SHADER_GUI: &str = concat!(include_str!("frame.wgsl"), include_str!("gui.wgsl"));
const SHADER_COMPOSITE: &str = concat!(
    include_str!("fullscreen.wgsl"),
    include_str!("composite.wgsl")
);
const SHADER_SKINNING: &str = include_str!("skinning.wgsl");

/// Turns shader source text into a binary the GPU backend accepts.
pub trait ShaderCompiler: Send + Sync {
    fn compile(&self, kind: ShaderKind, source: &str) -> Result<Vec<u8>, String>;
}

/// Parses and validates WGSL with naga. The wgpu backend consumes WGSL text
/// directly, so the binary is the validated source.
#[derive(Debug, Default, Copy, Clone)]
pub struct WgslCompiler;

impl WgslCompiler {
    fn required_entry_points(kind: ShaderKind) -> &'static [(naga::ShaderStage, &'static str)] {
        match kind {
            ShaderKind::Skinning => &[(naga::ShaderStage::Compute, "main")],
            _ => &[
                (naga::ShaderStage::Vertex, "vs_main"),
                (naga::ShaderStage::Fragment, "fs_main"),
            ],
        }
    }
}

impl ShaderCompiler for WgslCompiler {
    fn compile(&self, kind: ShaderKind, source: &str) -> Result<Vec<u8>, String> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;

        Validator::new(ValidationFlags::all(), Capabilities::all())
            .validate(&module)
            .map_err(|e| e.emit_to_string(source))?;

        for &(stage, name) in Self::required_entry_points(kind) {
            if !module
                .entry_points
                .iter()
                .any(|ep| ep.stage == stage && ep.name == name)
            {
                return Err(format!("missing {stage:?} entry point `{name}`"));
            }
        }

        Ok(source.as_bytes().to_vec())
    }
}

pub fn builtin_source(kind: ShaderKind) -> &'static str {
    match kind {
        ShaderKind::Geometry => SHADER_GEOMETRY,
        ShaderKind::Shadow => SHADER_SHADOW,
        ShaderKind::Lighting => SHADER_LIGHTING,
        ShaderKind::Post => SHADER_POST,
        ShaderKind::Gui => SHADER_GUI,
        ShaderKind::Composite => SHADER_COMPOSITE,
        ShaderKind::Skinning => SHADER_SKINNING,
    }
}

#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    binaries: Vec<ShaderBinary>,
}

impl ShaderLibrary {
    /// The shaders built into the crate.
    pub fn builtin() -> Self {
        let binaries = ShaderKind::ALL
            .iter()
            .map(|&kind| ShaderBinary {
                kind,
                code: Arc::from(builtin_source(kind).as_bytes()),
            })
            .collect();
        Self { binaries }
    }

    /// Loads every shader from the configured directory.
    ///
    /// A source that fails to compile is fatal. Kinds with neither a binary
    /// nor a source on disk use the built-in shader.
    #[instrument(skip_all)]
    pub fn load(config: &RenderConfig, compiler: &dyn ShaderCompiler) -> Result<Self> {
        let mut library = Self::builtin();
        let dir = config.shader_dir.as_path();

        for kind in ShaderKind::ALL {
            let stem = kind.file_stem();
            let source = dir.join(format!("{stem}.wgsl"));
            let binary = dir.join(format!("{stem}.bin"));

            let code = if config.recompile_shaders
                && source.exists()
                && is_outdated(&source, &binary).context(ShaderIoErr { path: &binary })?
            {
                let text = fs::read_to_string(&source).context(ShaderIoErr { path: &source })?;
                let code = compiler
                    .compile(kind, &text)
                    .map_err(|message| ShaderCompileErr { kind, message }.build())?;
                fs::write(&binary, &code).context(ShaderIoErr { path: &binary })?;
                info!("Recompiled the {stem} shader from {}", source.display());
                code
            } else if binary.exists() {
                trace!("Using the compiled {stem} shader at {}", binary.display());
                fs::read(&binary).context(ShaderIoErr { path: &binary })?
            } else {
                debug!("No {stem} shader in {}, using the built-in one", dir.display());
                continue;
            };

            library.insert(ShaderBinary {
                kind,
                code: Arc::from(code),
            });
        }

        Ok(library)
    }

    pub fn get(&self, kind: ShaderKind) -> &ShaderBinary {
        &self.binaries[kind as usize]
    }

    pub fn insert(&mut self, binary: ShaderBinary) {
        let index = binary.kind as usize;
        self.binaries[index] = binary;
    }
}

impl Default for ShaderLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

/// A missing binary is always outdated.
fn is_outdated(source: &Path, binary: &Path) -> io::Result<bool> {
    let binary_modified = match fs::metadata(binary) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    Ok(fs::metadata(source)?.modified()? > binary_modified)
}
