pub struct Args {
    pub scenario: String,
    pub backend: BackendKind,
    pub detailed_map: bool,
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Simulated device memory in host RAM.
    #[default]
    Host,
    /// One `wgpu::Buffer` per device memory object on the default adapter.
    Wgpu,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// The allocator's statistics string.
    #[default]
    Json,
    /// A human-readable summary of the replay.
    Text,
}
