//! TCP stream reassembly.

pub mod reader;
pub mod reassembler;

pub use reader::{ReaderStream, StreamSender, channel};
pub use reassembler::{Assembler, StreamFactory};
