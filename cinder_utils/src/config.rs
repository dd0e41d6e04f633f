use argh::FromArgs;
use bon::Builder;
use snafu::{Snafu, ensure};
use std::path::PathBuf;

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound for shadow cascades. The shadow uniform is laid out for this many.
pub const MAX_CASCADES: u32 = 4;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)))]
pub enum ConfigError {
    #[snafu(display("Cascade count must be within 1..={MAX_CASCADES}, got {count}"))]
    CascadeCount { count: u32 },
    #[snafu(display("Cascade split lambda must be within 0..=1, got {lambda}"))]
    SplitLambda { lambda: f32 },
    #[snafu(display("Shadow map resolution must be a non-zero power of two, got {resolution}"))]
    ShadowResolution { resolution: u32 },
    #[snafu(display("Camera clip planes are invalid (near {near}, far {far})"))]
    ClipPlanes { near: f32, far: f32 },
    #[snafu(display("Updates per second must be positive"))]
    UpdateRate,
    #[snafu(display("Could not parse command line arguments: {message}"))]
    Arguments { message: String },
}

/// Immutable renderer configuration.
///
/// Built once at startup, either from the command line through [`RenderConfig::from_env`]
/// or programmatically through [`RenderConfig::builder`], and then handed to every
/// component by reference.
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct RenderConfig {
    #[builder(default = 60)]
    pub updates_per_second: u32,
    #[builder(default = true)]
    pub vsync: bool,
    #[builder(default = 3)]
    pub swapchain_images: u32,

    #[builder(default = 2048)]
    pub shadow_map_resolution: u32,
    #[builder(default = 0.005)]
    pub shadow_bias: f32,
    #[builder(default = 3)]
    pub cascade_count: u32,
    #[builder(default = 0.75)]
    pub cascade_split_lambda: f32,

    #[builder(default = 256)]
    pub max_textures: u32,
    #[builder(default = 256)]
    pub max_materials: u32,
    #[builder(default = 1024)]
    pub max_descriptors: u32,

    #[builder(default = cfg!(debug_assertions))]
    pub validation: bool,
    #[builder(default = cfg!(debug_assertions))]
    pub debug_labels: bool,
    #[builder(default = false)]
    pub diagnostic_checkpoints: bool,

    #[builder(default = false)]
    pub recompile_shaders: bool,
    #[builder(into, default = PathBuf::from("shaders"))]
    pub shader_dir: PathBuf,

    #[builder(default = 5000)]
    pub fence_timeout_ms: u64,

    #[builder(default = 60f32.to_radians())]
    pub camera_fov_y: f32,
    #[builder(default = 0.1)]
    pub camera_near: f32,
    #[builder(default = 500.0)]
    pub camera_far: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        RenderConfig::builder().build()
    }
}

impl RenderConfig {
    /// Reads the process arguments once and builds the configuration from them.
    pub fn from_env() -> Result<RenderConfig, ConfigError> {
        let mut args = std::env::args();
        let cmd_name = args.next().unwrap_or_default();
        let args: Vec<String> = args.collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let parsed = RenderArgs::from_args(&[&cmd_name], &args).map_err(|exit| {
            ConfigError::Arguments {
                message: exit.output,
            }
        })?;
        let config = parsed.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            (1..=MAX_CASCADES).contains(&self.cascade_count),
            CascadeCountErr {
                count: self.cascade_count
            }
        );
        ensure!(
            (0.0..=1.0).contains(&self.cascade_split_lambda),
            SplitLambdaErr {
                lambda: self.cascade_split_lambda
            }
        );
        ensure!(
            self.shadow_map_resolution.is_power_of_two(),
            ShadowResolutionErr {
                resolution: self.shadow_map_resolution
            }
        );
        ensure!(
            self.camera_near > 0.0 && self.camera_far > self.camera_near,
            ClipPlanesErr {
                near: self.camera_near,
                far: self.camera_far
            }
        );
        ensure!(self.updates_per_second > 0, UpdateRateErr);
        Ok(())
    }

    /// The swapchain image count that is actually requested. Fewer than two images
    /// cannot overlap presentation with rendering.
    pub fn requested_swapchain_images(&self) -> u32 {
        self.swapchain_images.max(2)
    }

    pub fn fence_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn update_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.updates_per_second.max(1) as f64)
    }
}

/// Renderer arguments
#[derive(Default, FromArgs)]
pub struct RenderArgs {
    #[argh(option, hidden_help)]
    pub updates_per_second: Option<u32>,
    #[argh(switch, hidden_help)]
    pub no_vsync: bool,
    #[argh(option, hidden_help)]
    pub swapchain_images: Option<u32>,

    #[argh(option, hidden_help)]
    pub shadow_resolution: Option<u32>,
    #[argh(option, hidden_help)]
    pub shadow_bias: Option<f32>,
    #[argh(option, hidden_help)]
    pub cascades: Option<u32>,

    #[argh(option, hidden_help)]
    pub max_textures: Option<u32>,
    #[argh(option, hidden_help)]
    pub max_materials: Option<u32>,
    #[argh(option, hidden_help)]
    pub max_descriptors: Option<u32>,

    #[argh(switch, hidden_help)]
    pub validation: bool,
    #[argh(switch, hidden_help)]
    pub no_validation: bool,
    #[argh(switch, hidden_help)]
    pub diagnostic_checkpoints: bool,
    #[argh(switch, hidden_help)]
    pub recompile_shaders: bool,
    #[argh(option, hidden_help)]
    pub shader_dir: Option<PathBuf>,
}

impl RenderArgs {
    pub fn into_config(self) -> RenderConfig {
        let defaults = RenderConfig::default();
        let validation = if self.no_validation {
            false
        } else {
            self.validation || defaults.validation
        };

        RenderConfig {
            updates_per_second: self
                .updates_per_second
                .unwrap_or(defaults.updates_per_second),
            vsync: !self.no_vsync,
            swapchain_images: self.swapchain_images.unwrap_or(defaults.swapchain_images),
            shadow_map_resolution: self
                .shadow_resolution
                .unwrap_or(defaults.shadow_map_resolution),
            shadow_bias: self.shadow_bias.unwrap_or(defaults.shadow_bias),
            cascade_count: self.cascades.unwrap_or(defaults.cascade_count),
            max_textures: self.max_textures.unwrap_or(defaults.max_textures),
            max_materials: self.max_materials.unwrap_or(defaults.max_materials),
            max_descriptors: self.max_descriptors.unwrap_or(defaults.max_descriptors),
            validation,
            diagnostic_checkpoints: self.diagnostic_checkpoints,
            recompile_shaders: self.recompile_shaders,
            shader_dir: self.shader_dir.unwrap_or(defaults.shader_dir),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RenderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cascade_count, 3);
        assert_eq!(config.requested_swapchain_images(), 3);
    }

    #[test]
    fn builder_overrides_single_fields() {
        let config = RenderConfig::builder()
            .vsync(false)
            .cascade_count(4)
            .shadow_map_resolution(1024)
            .build();

        assert!(!config.vsync);
        assert_eq!(config.cascade_count, 4);
        assert_eq!(config.shadow_map_resolution, 1024);
        assert_eq!(config.max_textures, RenderConfig::default().max_textures);
    }

    #[test]
    fn rejects_out_of_range_cascades() {
        let config = RenderConfig::builder().cascade_count(0).build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CascadeCount { count: 0 })
        ));

        let config = RenderConfig::builder().cascade_count(5).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_clip_planes() {
        let config = RenderConfig::builder()
            .camera_near(10.0)
            .camera_far(1.0)
            .build();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ClipPlanes { .. })
        ));
    }

    #[test]
    fn args_map_onto_config() {
        let args = RenderArgs::from_args(
            &["cinder"],
            &["--no-vsync", "--cascades", "2", "--shadow-resolution", "512"],
        )
        .unwrap();
        let config = args.into_config();

        assert!(!config.vsync);
        assert_eq!(config.cascade_count, 2);
        assert_eq!(config.shadow_map_resolution, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn update_interval_follows_rate() {
        let config = RenderConfig::builder().updates_per_second(50).build();
        assert_eq!(config.update_interval(), std::time::Duration::from_millis(20));

        let config = RenderConfig::builder().updates_per_second(0).build();
        assert!(matches!(config.validate(), Err(ConfigError::UpdateRate)));
    }

    #[test]
    fn swapchain_image_count_is_clamped() {
        let config = RenderConfig::builder().swapchain_images(1).build();
        assert_eq!(config.requested_swapchain_images(), 2);
    }
}
