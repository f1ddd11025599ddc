use anyhow::Result;

use crate::app::App;
use crate::args::Args;

mod app;
pub mod allocator;
pub mod args;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod scenario;
pub mod stats;
pub mod virtual_block;

pub use crate::allocator::Allocator;
pub use crate::error::Error;
pub use crate::virtual_block::VirtualBlock;

pub fn run(args: Args) -> Result<()> {
    env_logger::init();

    let app = App::new(args);
    let output = app.run()?;
    println!("{output}");

    Ok(())
}
