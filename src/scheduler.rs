//! The per-client scheduler that re-blocks server ticks into client periods.
//!
//! One [`BufferConverter`] is registered per client; it installs a period
//! scheduler as the server's process handler. Port adapters created with
//! [`crate::PortConverter::new`] attach themselves to the scheduler, which
//! drives them every tick and invokes the client callback whenever all input
//! adapters have staged a full client period.

use crate::cell::RtCell;
use crate::port::{Adapter, NextStatus};
use crate::prefill::silence_prefill_frames;
use crate::server::{AudioServer, Control, ProcessHandler, ServerPort};
use std::sync::Arc;
use tracing::{debug, error};

type AdapterRef<P> = Arc<RtCell<Adapter<P>>>;

struct Shared<P> {
    dst_frames: usize,
    server_frames: usize,
    silence_prefill: usize,
    inputs: RtCell<Vec<AdapterRef<P>>>,
    outputs: RtCell<Vec<AdapterRef<P>>>,
}

/// Client-side handle to the per-client scheduler. Cheap to clone; clones
/// share the scheduler state. Dropping the last handle does not stop the
/// registered process handler; the server owns that until deactivation.
pub struct BufferConverter<P: ServerPort> {
    shared: Arc<Shared<P>>,
}

impl<P: ServerPort> Clone for BufferConverter<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: ServerPort + Send + 'static> BufferConverter<P> {
    /// Installs a period scheduler for `callback`, which will run once per
    /// `dst_frames` frames instead of once per server period.
    ///
    /// Registration with the server is the final fallible step; on error
    /// nothing is left behind.
    pub fn register<S, F>(server: &S, callback: F, dst_frames: usize) -> Result<Self, String>
    where
        S: AudioServer<Port = P>,
        F: FnMut(usize) -> Control + Send + 'static,
    {
        if dst_frames == 0 {
            return Err("Client period size must be at least one frame".into());
        }
        let server_frames = server.buffer_size();
        let silence_prefill = silence_prefill_frames(dst_frames, server_frames);
        let shared = Arc::new(Shared {
            dst_frames,
            server_frames,
            silence_prefill,
            inputs: RtCell::new(Vec::new()),
            outputs: RtCell::new(Vec::new()),
        });
        let scheduler = PeriodScheduler {
            shared: Arc::clone(&shared),
            callback: Box::new(callback),
        };
        server
            .register_process_handler(Box::new(scheduler))
            .map_err(|e| format!("Failed to register process callback: {e}"))?;
        debug!(dst_frames, server_frames, silence_prefill, "period scheduler registered");
        Ok(Self { shared })
    }
}

impl<P: ServerPort> BufferConverter<P> {
    /// Client period size in frames.
    pub fn dst_frames(&self) -> usize {
        self.shared.dst_frames
    }

    /// Server period size in frames, as negotiated at registration.
    pub fn server_frames(&self) -> usize {
        self.shared.server_frames
    }

    /// Zero frames prefilled into every input adapter at construction.
    pub fn silence_prefill(&self) -> usize {
        self.shared.silence_prefill
    }

    pub(crate) fn add(&self, adapter: AdapterRef<P>) {
        let is_output = matches!(*adapter.lock(), Adapter::Out(_));
        if is_output {
            self.shared.outputs.lock().push(adapter);
        } else {
            self.shared.inputs.lock().push(adapter);
        }
    }
}

/// The process handler installed with the server; owns the client callback.
struct PeriodScheduler<P> {
    shared: Arc<Shared<P>>,
    callback: Box<dyn FnMut(usize) -> Control + Send>,
}

impl<P: ServerPort + Send> ProcessHandler for PeriodScheduler<P> {
    fn process(&mut self, frames: usize) -> Control {
        loop {
            match drive_inputs(self.shared.inputs.lock(), frames) {
                Err(msg) => {
                    error!("{msg}");
                    return Control::Quit;
                }
                Ok(NextStatus::NeedMore) => break,
                Ok(NextStatus::Ready) => {
                    if (self.callback)(self.shared.dst_frames) == Control::Quit {
                        return Control::Quit;
                    }
                    // Commit the frames the callback just produced on every
                    // output port; they are drained after the loop.
                    for output in self.shared.outputs.lock().iter() {
                        output.lock().update_client_frames();
                    }
                }
            }
        }

        if let Err(msg) = drain_outputs(self.shared.outputs.lock(), frames) {
            error!("{msg}");
            return Control::Quit;
        }
        Control::Continue
    }
}

fn drive_inputs<P: ServerPort>(
    inputs: &mut [AdapterRef<P>],
    frames: usize,
) -> Result<NextStatus, String> {
    if inputs.is_empty() {
        return Err("Processing called without any audio input ports".into());
    }
    let mut status = NextStatus::Ready;
    for input in inputs.iter() {
        if input.lock().next_input(frames)? == NextStatus::NeedMore {
            status = NextStatus::NeedMore;
        }
    }
    Ok(status)
}

fn drain_outputs<P: ServerPort>(outputs: &mut [AdapterRef<P>], frames: usize) -> Result<(), String> {
    if outputs.is_empty() {
        return Err("Processing called without any audio output ports".into());
    }
    for output in outputs.iter() {
        output.lock().next_output(frames)?;
    }
    Ok(())
}
