use super::{CommandBuffer, DeviceCapabilities, GpuVendor};
use tracing::{info, warn};

/// Vendor specific GPU crash diagnostics, resolved once from the device capabilities.
///
/// Checkpoints are only recorded for an active vendor variant. Requests the device
/// cannot honor fall back to [`DiagnosticCheckpoints::None`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum DiagnosticCheckpoints {
    #[default]
    None,
    Nvidia,
    Amd,
}

impl DiagnosticCheckpoints {
    pub fn resolve(requested: bool, caps: &DeviceCapabilities) -> Self {
        if !requested {
            return DiagnosticCheckpoints::None;
        }

        if !caps.diagnostic_checkpoints {
            warn!(
                "Diagnostic checkpoints were requested but {} does not support them",
                caps.name
            );
            return DiagnosticCheckpoints::None;
        }

        let resolved = match caps.vendor {
            GpuVendor::Nvidia => DiagnosticCheckpoints::Nvidia,
            GpuVendor::Amd => DiagnosticCheckpoints::Amd,
            vendor => {
                warn!("No diagnostic checkpoint extension is known for {vendor:?}");
                DiagnosticCheckpoints::None
            }
        };

        if let Some(ext) = resolved.extension_name() {
            info!("Recording diagnostic checkpoints through {ext}");
        }
        resolved
    }

    pub const fn extension_name(&self) -> Option<&'static str> {
        match self {
            DiagnosticCheckpoints::None => None,
            DiagnosticCheckpoints::Nvidia => Some("VK_NV_device_diagnostic_checkpoints"),
            DiagnosticCheckpoints::Amd => Some("VK_AMD_buffer_marker"),
        }
    }

    pub const fn is_enabled(&self) -> bool {
        !matches!(self, DiagnosticCheckpoints::None)
    }

    pub fn insert(&self, cmd: &mut CommandBuffer, label: &'static str) {
        match self {
            DiagnosticCheckpoints::None => {}
            DiagnosticCheckpoints::Nvidia | DiagnosticCheckpoints::Amd => cmd.checkpoint(label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;
    use crate::gpu::GpuDevice;

    fn caps(vendor: GpuVendor, supported: bool) -> DeviceCapabilities {
        DeviceCapabilities {
            vendor,
            diagnostic_checkpoints: supported,
            ..HeadlessDevice::new().capabilities()
        }
    }

    #[test]
    fn resolves_vendor_variant() {
        assert_eq!(
            DiagnosticCheckpoints::resolve(true, &caps(GpuVendor::Nvidia, true)),
            DiagnosticCheckpoints::Nvidia
        );
        assert_eq!(
            DiagnosticCheckpoints::resolve(true, &caps(GpuVendor::Amd, true)),
            DiagnosticCheckpoints::Amd
        );
    }

    #[test]
    fn unsupported_requests_fall_back_to_none() {
        assert_eq!(
            DiagnosticCheckpoints::resolve(true, &caps(GpuVendor::Nvidia, false)),
            DiagnosticCheckpoints::None
        );
        assert_eq!(
            DiagnosticCheckpoints::resolve(true, &caps(GpuVendor::Intel, true)),
            DiagnosticCheckpoints::None
        );
        assert_eq!(
            DiagnosticCheckpoints::resolve(false, &caps(GpuVendor::Amd, true)),
            DiagnosticCheckpoints::None
        );
    }

    #[test]
    fn none_records_nothing() {
        let mut cmd = CommandBuffer::new("test");
        DiagnosticCheckpoints::None.insert(&mut cmd, "geometry");
        assert!(cmd.is_empty());

        DiagnosticCheckpoints::Amd.insert(&mut cmd, "geometry");
        assert_eq!(cmd.commands().len(), 1);
    }
}
