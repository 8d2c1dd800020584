use bitflags::bitflags;

bitflags! {
    /// Flag bits a server reports for one of its ports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u32 {
        const INPUT = 0x1;
        const OUTPUT = 0x2;
        const PHYSICAL = 0x4;
        const TERMINAL = 0x8;
    }
}

impl PortFlags {
    pub fn is_output(self) -> bool {
        self.contains(PortFlags::OUTPUT)
    }
}

/// Returned from process callbacks to tell the server whether to keep
/// invoking them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Quit,
}

/// A float-sample audio port owned by the server.
///
/// `buffer()` is only valid while a process callback for the owning client is
/// running; it exposes the port's current period buffer. For input ports the
/// buffer is read-only by contract, for output ports the holder of the port
/// handle has exclusive write access during the tick. Implementations hand
/// out `&mut` through interior mutability; callers must not hold two buffers
/// of the same port at once.
pub trait ServerPort {
    fn flags(&self) -> Result<PortFlags, String>;

    fn name(&self) -> String;

    fn buffer(&self, frames: usize) -> Option<&mut [f32]>;
}

/// Per-tick driver installed with [`AudioServer::register_process_handler`].
pub trait ProcessHandler: Send {
    /// Called once per server period with the period size in frames.
    fn process(&mut self, frames: usize) -> Control;
}

/// The slice of the audio server this crate needs: the period size and a way
/// to install the per-tick driver. Callbacks only fire between the server's
/// activate and deactivate; setup and teardown happen while they are stopped.
pub trait AudioServer {
    type Port: ServerPort;

    /// Current server period size in frames.
    fn buffer_size(&self) -> usize;

    fn register_process_handler(&self, handler: Box<dyn ProcessHandler>) -> Result<(), String>;
}
