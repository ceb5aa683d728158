pub mod operations;
pub mod pool;

pub use operations::*;
pub use pool::*;
