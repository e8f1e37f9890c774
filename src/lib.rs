pub mod vm;

pub use vm::{Error, Result};
