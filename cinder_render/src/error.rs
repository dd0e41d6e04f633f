use crate::gpu::{GpuError, ShaderKind};
use cinder_asset::AssetError;
use cinder_utils::ConfigError;
use snafu::Snafu;
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

/// How the frame loop reacts to an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Aborts the renderer. Returned to the caller unchanged.
    Fatal,
    /// Handled by moving into the resizing state.
    Recoverable,
    /// The offending item is skipped with a warning.
    Degraded,
}

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)), visibility(pub(crate)))]
pub enum RenderError {
    #[snafu(display("GPU error: {source}"))]
    Gpu { source: GpuError },

    #[snafu(display("Scene data references a missing asset: {source}"))]
    Asset { source: AssetError },

    #[snafu(display("Invalid configuration: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("The device lacks a required capability: {capability}"))]
    MissingCapability { capability: &'static str },

    #[snafu(display("Cannot hold {requested} {kind}, the configured limit is {limit}"))]
    CapacityExceeded {
        kind: &'static str,
        limit: u32,
        requested: usize,
    },

    #[snafu(display("Model {name:?} could not be loaded: {reason}"))]
    ModelLoad { name: String, reason: String },

    #[snafu(display("Texture {name:?} could not be loaded: {reason}"))]
    TextureLoad { name: String, reason: String },

    #[snafu(display("Animation {name:?} could not be loaded: {reason}"))]
    AnimationLoad { name: String, reason: String },

    #[snafu(display("Failed to compile the {kind:?} shader: {message}"))]
    ShaderCompile { kind: ShaderKind, message: String },

    #[snafu(display("Shader file {} could not be accessed: {source}", path.display()))]
    ShaderIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Frame slot {slot} did not finish within {timeout:?}"))]
    FenceTimeout { slot: usize, timeout: Duration },

    #[snafu(display("The renderer was already shut down"))]
    ShutDown,
}

impl RenderError {
    pub fn severity(&self) -> Severity {
        match self {
            RenderError::Gpu { source } if source.is_surface_stale() => Severity::Recoverable,
            RenderError::ModelLoad { .. }
            | RenderError::TextureLoad { .. }
            | RenderError::AnimationLoad { .. } => Severity::Degraded,
            _ => Severity::Fatal,
        }
    }
}

impl From<GpuError> for RenderError {
    fn from(source: GpuError) -> Self {
        RenderError::Gpu { source }
    }
}

impl From<AssetError> for RenderError {
    fn from(source: AssetError) -> Self {
        RenderError::Asset { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(
            RenderError::from(GpuError::SurfaceStale).severity(),
            Severity::Recoverable
        );
        assert_eq!(
            RenderError::from(GpuError::DeviceLost).severity(),
            Severity::Fatal
        );
        assert_eq!(
            RenderError::ModelLoad {
                name: "broken".into(),
                reason: "no meshes".into(),
            }
            .severity(),
            Severity::Degraded
        );
        assert_eq!(
            RenderError::from(AssetError::UnknownAsset {
                kind: "Model",
                name: "ghost".into(),
            })
            .severity(),
            Severity::Fatal
        );
    }
}
