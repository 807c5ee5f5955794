// core.rs splits ledger responsibilities into submodules: block and chain
// management, structural validation, and the persisted snapshot shape.
pub mod chain;
pub mod state;
pub mod validation;

pub use chain::*;
pub use state::*;
pub use validation::*;
