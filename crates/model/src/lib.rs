pub mod args;
pub mod transformer;

pub use args::ModelArgs;
pub use transformer::Transformer;
