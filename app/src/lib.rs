pub mod context;
pub mod render;

pub use context::ClientContext;
