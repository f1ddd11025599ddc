use clap::{Parser, ValueEnum};

/// Replays a GPU memory allocation scenario and reports the allocator's statistics
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the .json scenario file that will be replayed
    pub scenario: String,

    /// Device memory backend the allocator draws from
    #[arg(short, long, value_enum, default_value_t = Backend::Host)]
    pub backend: Backend,

    /// List every block and suballocation in the JSON statistics
    #[arg(short, long)]
    pub detailed_map: bool,

    /// Output format of the report
    #[arg(short, long, value_enum, default_value_t = Format::Json)]
    pub format: Format,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Backend {
    Host,
    Wgpu,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Format {
    Json,
    Text,
}

impl From<Backend> for gpu_suballocator::args::BackendKind {
    fn from(value: Backend) -> Self {
        match value {
            Backend::Host => gpu_suballocator::args::BackendKind::Host,
            Backend::Wgpu => gpu_suballocator::args::BackendKind::Wgpu,
        }
    }
}

impl From<Format> for gpu_suballocator::args::OutputFormat {
    fn from(value: Format) -> Self {
        match value {
            Format::Json => gpu_suballocator::args::OutputFormat::Json,
            Format::Text => gpu_suballocator::args::OutputFormat::Text,
        }
    }
}
