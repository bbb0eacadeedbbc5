//! Configuration system for kptn

pub mod defaults;
mod loader;
mod overrides;
mod types;
pub mod validation;

pub use defaults::*;
pub use loader::*;
pub use overrides::*;
pub use types::*;
pub use validation::*;
