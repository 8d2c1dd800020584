//! Period-size and sample-format adaptation between a realtime audio server
//! and its clients.
//!
//! The server drives fixed-size float periods; a client may want a different
//! period size, a different sample format, or both. [`BufferConverter`]
//! installs a per-client scheduler that re-blocks server ticks into client
//! periods, and [`PortConverter`] adapts each audio port, converting between
//! the server's f32 samples and the client's format through a preallocated
//! shadow buffer. Nothing allocates on the realtime path.
//!
//! Errors on the realtime path are reported through `tracing`; hosts should
//! install a subscriber whose sink is realtime safe, e.g. a non-blocking
//! appender.

mod cell;
mod convert;
mod port;
mod prefill;
mod scheduler;
mod server;
mod shadow;

pub use cell::RtCell;
pub use convert::{ClientSample, SampleFormat};
pub use port::{PortConfig, PortConverter};
pub use prefill::silence_prefill_frames;
pub use scheduler::BufferConverter;
pub use server::{AudioServer, Control, PortFlags, ProcessHandler, ServerPort};
