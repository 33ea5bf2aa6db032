//! Concrete server-side handlers (`spec.md` §6): the echo handler
//! (subject of end-to-end scenario S1) and a minimal static file
//! server proving the handler trait is real and pluggable.

pub mod echo;
pub mod file;
pub mod router;

pub use echo::EchoHandler;
pub use file::FileHandler;
pub use router::RouterHandler;
