mod listen;
mod write;

pub use listen::ListenStream;
pub use write::{WriteStream, WriteStreamListener};
