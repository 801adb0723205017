/// Initialization parameters for the wgpu backend.
///
/// Keep this structure stable and minimal. Add configuration flags only when a
/// concrete platform or backend requirement exists.
#[derive(Debug, Clone)]
pub struct DeviceInit {
    /// Backends wgpu may choose an adapter from.
    pub backends: wgpu::Backends,

    /// Adapter preference when several are available.
    pub power_preference: wgpu::PowerPreference,

    /// Only accept a software adapter.
    ///
    /// Useful on machines without a GPU; much slower.
    pub force_fallback_adapter: bool,

    /// Required wgpu features.
    ///
    /// Favor an empty set for portability unless a feature is strictly necessary.
    pub required_features: wgpu::Features,

    /// Limits requested from the adapter/device.
    pub required_limits: wgpu::Limits,

    /// Allocation strategy hint for the driver.
    pub memory_hints: wgpu::MemoryHints,
}

impl Default for DeviceInit {
    fn default() -> Self {
        Self {
            backends: wgpu::Backends::all(),
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
        }
    }
}
