pub mod listen;
pub mod write;

pub use listen::{ListenStream, ListenStreamDelegate};
pub use write::{WriteResponse, WriteStream, WriteStreamDelegate};
