//! Per-port adapters and the client-facing [`PortConverter`] handle.
//!
//! Four adapter variants share the operation set `{get, set, next,
//! update_client_frames}`: a pass-through for float ports that need no
//! re-blocking, a format-only adapter for matching periods with differing
//! sample formats, and the input/output re-blocking state machines driven by
//! the scheduler.

use crate::cell::RtCell;
use crate::convert::{ClientSample, SampleFormat};
use crate::scheduler::BufferConverter;
use crate::server::{AudioServer, ServerPort};
use crate::shadow::ShadowPort;
use std::sync::Arc;
use tracing::error;

/// How a port converter should present the port to the client.
#[derive(Debug, Clone, Copy)]
pub struct PortConfig {
    /// Sample format of the client's buffers.
    pub format: SampleFormat,
    /// Zero-fill the shadow buffer of an output port at construction.
    pub init_output_silence: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::Float,
            init_output_silence: false,
        }
    }
}

/// Result of driving an input adapter once within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextStatus {
    /// A full client period is staged; the callback may run.
    Ready,
    /// The tick's server buffer is drained; wait for the next tick.
    NeedMore,
}

fn bytes_of<T: ClientSample>(buf: &[T]) -> &[u8] {
    // SAFETY: T is a plain sample type; any T slice is readable as bytes.
    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<u8>(), std::mem::size_of_val(buf)) }
}

/// Re-type a float slice as the client sample type.
///
/// # Safety
/// The caller has verified `T::FORMAT == SampleFormat::Float`, i.e. T is f32.
unsafe fn retag_mut<T: ClientSample>(buf: &mut [f32]) -> &mut [T] {
    debug_assert_eq!(T::FORMAT, SampleFormat::Float);
    unsafe { std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<T>(), buf.len()) }
}

/// Pass-through for float ports without re-blocking: `get` hands out the
/// server's own period buffer.
struct ForwardAdapter<P> {
    port: P,
    /// The server period; pass-through ports keep it as their own.
    dst_frames: usize,
    /// Address of the buffer returned by the last `get`, so `set` can skip
    /// the copy when the client hands the same buffer back.
    handed_out: usize,
}

impl<P: ServerPort> ForwardAdapter<P> {
    fn new(port: P, dst_frames: usize) -> Self {
        Self {
            port,
            dst_frames,
            handed_out: 0,
        }
    }

    fn get(&mut self, frames: usize) -> Option<&mut [f32]> {
        if frames != self.dst_frames {
            error!(
                "Requested frames ({frames}) differ from configuration ({})",
                self.dst_frames
            );
            return None;
        }
        let buf = match self.port.buffer(frames) {
            Some(buf) => buf,
            None => {
                error!("Failed to get buffer of port {}", self.port.name());
                return None;
            }
        };
        self.handed_out = buf.as_ptr() as usize;
        Some(&mut buf[..frames])
    }

    fn set(&mut self, src: &[f32], frames: usize) {
        if frames != self.dst_frames {
            error!(
                "Requested frames ({frames}) differ from configuration ({})",
                self.dst_frames
            );
            return;
        }
        if src.as_ptr() as usize == self.handed_out {
            return;
        }
        let Some(dst) = self.port.buffer(frames) else {
            error!("Failed to get buffer of port {}", self.port.name());
            return;
        };
        dst[..frames].copy_from_slice(&src[..frames]);
    }
}

/// Per-tick format conversion without re-blocking, for clients whose period
/// matches the server's but whose sample format does not.
struct FormatAdapter<P> {
    shadow: ShadowPort<P>,
}

impl<P: ServerPort> FormatAdapter<P> {
    /// The shadow buffer of a format-only adapter holds exactly one server
    /// period, which is also the period the client must use.
    fn dst_frames(&self) -> usize {
        self.shadow.capacity_frames()
    }

    fn get<T: ClientSample>(&mut self, frames: usize) -> Option<&mut [T]> {
        if frames != self.dst_frames() {
            error!(
                "Requested frames ({frames}) differ from configuration ({})",
                self.dst_frames()
            );
            return None;
        }
        if let Err(msg) = self.shadow.copy_from_server(0, 0, frames, frames) {
            error!("{msg}");
            return None;
        }
        Some(self.shadow.slice_mut(0, frames))
    }

    fn set<T: ClientSample>(&mut self, src: &[T], frames: usize) {
        if frames != self.dst_frames() {
            error!(
                "Requested frames ({frames}) differ from configuration ({})",
                self.dst_frames()
            );
            return;
        }
        if let Err(msg) = self.shadow.write_to_server(bytes_of(&src[..frames]), frames, frames) {
            error!("{msg}");
        }
    }
}

/// Input re-blocking: accumulates server frames until a full client period
/// is staged at the head of the shadow buffer.
pub(crate) struct InputAdapter<P> {
    shadow: ShadowPort<P>,
    dst_frames: usize,
    /// Valid frames at the head of the shadow buffer, waiting for the client.
    shadow_frames: usize,
    /// Read cursor into the current tick's server buffer. Zero between ticks.
    server_offset: usize,
}

impl<P: ServerPort> InputAdapter<P> {
    fn new(mut shadow: ShadowPort<P>, dst_frames: usize, silence_prefill: usize) -> Self {
        shadow.silence(silence_prefill);
        Self {
            shadow,
            dst_frames,
            shadow_frames: silence_prefill,
            server_offset: 0,
        }
    }

    fn next(&mut self, frames: usize) -> Result<NextStatus, String> {
        if self.shadow_frames > self.dst_frames {
            return Err(format!(
                "Input shadow buffer of port {} holds more frames ({}) than the client period ({})",
                self.shadow.port().name(),
                self.shadow_frames,
                self.dst_frames
            ));
        }

        let server_frames = frames.saturating_sub(self.server_offset);
        if self.shadow_frames + server_frames >= self.dst_frames {
            // Copy exactly what completes the block so the client always
            // reads the shadow buffer at offset zero.
            let missing = self.dst_frames - self.shadow_frames;
            self.shadow
                .copy_from_server(self.shadow_frames, self.server_offset, missing, frames)?;
            self.server_offset += missing;
            // Consumed by the client callback right after this returns.
            self.shadow_frames = 0;
            Ok(NextStatus::Ready)
        } else {
            // Not enough for a block; stage the remainder of this tick and
            // start the next tick at the head of the server buffer.
            self.shadow
                .copy_from_server(self.shadow_frames, self.server_offset, server_frames, frames)?;
            self.shadow_frames += server_frames;
            self.server_offset = 0;
            Ok(NextStatus::NeedMore)
        }
    }

    fn get<T: ClientSample>(&mut self, frames: usize) -> Option<&mut [T]> {
        if frames != self.dst_frames {
            error!(
                "Requested frames ({frames}) differ from configuration ({})",
                self.dst_frames
            );
            return None;
        }
        Some(self.shadow.slice_mut(0, self.dst_frames))
    }
}

/// Output re-blocking: stages client periods behind a write cursor and
/// drains one server period per tick once enough frames have accumulated.
pub(crate) struct OutputAdapter<P> {
    shadow: ShadowPort<P>,
    dst_frames: usize,
    /// Frames staged before this tick's callbacks, starting at `shadow_offset`.
    shadow_frames: usize,
    /// Index of the first undrained frame.
    shadow_offset: usize,
    /// Frames written by the client this tick but not yet accounted.
    client_frames: usize,
}

impl<P: ServerPort> OutputAdapter<P> {
    fn new(shadow: ShadowPort<P>, dst_frames: usize) -> Self {
        Self {
            shadow,
            dst_frames,
            shadow_frames: 0,
            shadow_offset: 0,
            client_frames: 0,
        }
    }

    fn write_cursor(&self) -> usize {
        self.shadow_offset + self.shadow_frames + self.client_frames
    }

    fn next(&mut self, frames: usize) -> Result<(), String> {
        let limit = frames.max(self.dst_frames);
        if self.shadow_frames > limit {
            return Err(format!(
                "Output shadow buffer of port {} holds more frames ({}) than expected ({})",
                self.shadow.port().name(),
                self.shadow_frames,
                limit
            ));
        }

        if self.shadow_frames + self.client_frames >= frames {
            self.shadow.drain_to_server(self.shadow_offset, frames, frames)?;
            self.shadow_frames = self.shadow_frames + self.client_frames - frames;
            self.shadow_offset += frames;
            if self.shadow_frames == 0 {
                self.shadow_offset = 0;
            }
        } else {
            // Not enough for a server period; the server buffer is left
            // untouched this tick and the client contribution stays staged.
            self.shadow_frames += self.client_frames;
        }

        // A residue that fits in front of the drain point moves to the head
        // so the write cursor stays bounded. At most one memmove per tick.
        if self.shadow_offset > 0 && self.shadow_frames <= frames {
            self.shadow.compact(self.shadow_offset, self.shadow_frames);
            self.shadow_offset = 0;
        }

        self.client_frames = 0;
        Ok(())
    }

    fn update_client_frames(&mut self) {
        self.client_frames += self.dst_frames;
    }

    fn get<T: ClientSample>(&mut self, frames: usize) -> Option<&mut [T]> {
        if frames != self.dst_frames {
            error!(
                "Requested frames ({frames}) differ from configuration ({})",
                self.dst_frames
            );
            return None;
        }
        let cursor = self.write_cursor();
        Some(self.shadow.slice_mut(cursor, self.dst_frames))
    }

    fn set<T: ClientSample>(&mut self, src: &[T], frames: usize) {
        if frames != self.dst_frames {
            error!(
                "Requested frames ({frames}) differ from configuration ({})",
                self.dst_frames
            );
            return;
        }
        let cursor = self.write_cursor();
        let dst = self.shadow.slice_mut::<T>(cursor, self.dst_frames);
        if src.as_ptr() as usize == dst.as_ptr() as usize {
            return;
        }
        dst.copy_from_slice(&src[..self.dst_frames]);
    }
}

/// The four adapter shapes behind a [`PortConverter`].
pub(crate) enum Adapter<P> {
    Forward(ForwardAdapter<P>),
    Format(FormatAdapter<P>),
    In(InputAdapter<P>),
    Out(OutputAdapter<P>),
}

impl<P: ServerPort> Adapter<P> {
    pub(crate) fn next_input(&mut self, frames: usize) -> Result<NextStatus, String> {
        match self {
            Adapter::In(a) => a.next(frames),
            _ => Err("Port adapter driven as an input but not registered as one".into()),
        }
    }

    pub(crate) fn next_output(&mut self, frames: usize) -> Result<(), String> {
        match self {
            Adapter::Out(a) => a.next(frames),
            _ => Err("Port adapter drained as an output but not registered as one".into()),
        }
    }

    pub(crate) fn update_client_frames(&mut self) {
        if let Adapter::Out(a) = self {
            a.update_client_frames();
        }
    }
}

/// Client-side handle to one adapted port. Cheap to clone; clones share the
/// underlying adapter.
pub struct PortConverter<P: ServerPort> {
    adapter: Arc<RtCell<Adapter<P>>>,
    format: SampleFormat,
}

impl<P: ServerPort> Clone for PortConverter<P> {
    fn clone(&self) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
            format: self.format,
        }
    }
}

impl<P: ServerPort> PortConverter<P> {
    /// Builds the adapter matching `config` and, when `converter` is given,
    /// registers it with that scheduler for re-blocking.
    ///
    /// Without a converter the port keeps the server period: `Float` yields
    /// a pass-through, the integer formats a per-tick conversion adapter.
    /// With a converter the port direction decides between the input and
    /// output re-blocking adapters.
    pub fn new<S>(
        server: &S,
        port: P,
        config: PortConfig,
        converter: Option<&BufferConverter<P>>,
    ) -> Result<Self, String>
    where
        S: AudioServer<Port = P>,
    {
        let server_frames = server.buffer_size();
        let adapter = match converter {
            None => match config.format {
                // No shadow buffer needed; hand out the server's own buffer.
                SampleFormat::Float => Adapter::Forward(ForwardAdapter::new(port, server_frames)),
                SampleFormat::Int16 | SampleFormat::Int32 => Adapter::Format(FormatAdapter {
                    shadow: ShadowPort::new(port, config.format, server_frames),
                }),
            },
            Some(conv) => {
                let flags = port
                    .flags()
                    .map_err(|e| format!("Failed to get flags of port {}: {e}", port.name()))?;
                // The write cursor of an output adapter transiently reaches
                // one client period past the drain point.
                let capacity = conv.dst_frames() + server_frames;
                let mut shadow = ShadowPort::new(port, config.format, capacity);
                if flags.is_output() {
                    if config.init_output_silence {
                        shadow.silence_all();
                    }
                    Adapter::Out(OutputAdapter::new(shadow, conv.dst_frames()))
                } else {
                    Adapter::In(InputAdapter::new(
                        shadow,
                        conv.dst_frames(),
                        conv.silence_prefill(),
                    ))
                }
            }
        };

        let adapter = Arc::new(RtCell::new(adapter));
        if let Some(conv) = converter {
            conv.add(Arc::clone(&adapter));
        }
        Ok(Self {
            adapter,
            format: config.format,
        })
    }

    /// Returns the client-format buffer for this port. `frames` must equal
    /// the configured client period (or the server period for ports created
    /// without a converter).
    pub fn get<T: ClientSample>(&self, frames: usize) -> Option<&mut [T]> {
        if T::FORMAT != self.format {
            error!(
                "Requested sample type {:?} differs from configured format {:?}",
                T::FORMAT,
                self.format
            );
            return None;
        }
        match self.adapter.lock() {
            // SAFETY: format check above pins T to f32.
            Adapter::Forward(a) => a.get(frames).map(|buf| unsafe { retag_mut(buf) }),
            Adapter::Format(a) => a.get(frames),
            Adapter::In(a) => a.get(frames),
            Adapter::Out(a) => a.get(frames),
        }
    }

    /// Overwrites the port's audio with `buf`. Only allowed for output
    /// ports; the copy is skipped when `buf` is the buffer `get` returned.
    pub fn set<T: ClientSample>(&self, buf: &[T], frames: usize) {
        if T::FORMAT != self.format {
            error!(
                "Requested sample type {:?} differs from configured format {:?}",
                T::FORMAT,
                self.format
            );
            return;
        }
        if buf.len() < frames {
            error!(
                "Buffer of {} frames is shorter than the requested {frames}",
                buf.len()
            );
            return;
        }
        match self.adapter.lock() {
            Adapter::Forward(a) => a.set(bytes_to_f32(buf), frames),
            Adapter::Format(a) => a.set(buf, frames),
            Adapter::In(_) => error!("Not allowed to call set() for input ports"),
            Adapter::Out(a) => a.set(buf, frames),
        }
    }
}

fn bytes_to_f32<T: ClientSample>(buf: &[T]) -> &[f32] {
    debug_assert_eq!(T::FORMAT, SampleFormat::Float);
    // SAFETY: callers only reach this after verifying T::FORMAT is Float.
    unsafe { std::slice::from_raw_parts(buf.as_ptr().cast::<f32>(), buf.len()) }
}
