//! Per-port shadow buffers: aligned client-format storage that bridges the
//! server's float period buffers and the client's view of the port.

use crate::convert::{
    convert_float_to_i16, convert_float_to_i32, convert_i16_to_float, convert_i32_to_float,
    ClientSample, SampleFormat,
};
use crate::server::ServerPort;

const SHADOW_ALIGN: usize = 32;

#[repr(C, align(32))]
#[derive(Clone, Copy)]
struct AlignedChunk([u8; SHADOW_ALIGN]);

/// Heap storage for client-format samples, aligned to a 32-byte boundary.
/// Allocated once at construction; the realtime path only reads and writes
/// into it.
struct ShadowBuffer {
    chunks: Vec<AlignedChunk>,
    bytes: usize,
}

impl ShadowBuffer {
    fn with_capacity(bytes: usize) -> Self {
        let chunks = vec![AlignedChunk([0; SHADOW_ALIGN]); bytes.div_ceil(SHADOW_ALIGN)];
        Self { chunks, bytes }
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: chunks is a live allocation of at least `bytes` bytes.
        unsafe { std::slice::from_raw_parts(self.chunks.as_ptr().cast::<u8>(), self.bytes) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.chunks.as_mut_ptr().cast::<u8>(), self.bytes) }
    }
}

/// A server port plus the shadow buffer and format tag that belong to it.
/// All server-buffer access of an adapter funnels through here.
pub(crate) struct ShadowPort<P> {
    port: P,
    format: SampleFormat,
    buf: ShadowBuffer,
    capacity_frames: usize,
}

impl<P: ServerPort> ShadowPort<P> {
    pub(crate) fn new(port: P, format: SampleFormat, capacity_frames: usize) -> Self {
        Self {
            port,
            format,
            buf: ShadowBuffer::with_capacity(capacity_frames * format.sample_size()),
            capacity_frames,
        }
    }

    pub(crate) fn port(&self) -> &P {
        &self.port
    }

    pub(crate) fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    fn sample_size(&self) -> usize {
        self.format.sample_size()
    }

    /// Zero-fill the first `frames` frames of the shadow buffer.
    pub(crate) fn silence(&mut self, frames: usize) {
        let size = frames * self.sample_size();
        self.buf.as_bytes_mut()[..size].fill(0);
    }

    pub(crate) fn silence_all(&mut self) {
        self.buf.as_bytes_mut().fill(0);
    }

    /// Typed view of `frames` frames starting at `frame_offset`. The caller
    /// has already verified that `T` matches the configured format.
    pub(crate) fn slice_mut<T: ClientSample>(
        &mut self,
        frame_offset: usize,
        frames: usize,
    ) -> &mut [T] {
        let size = std::mem::size_of::<T>();
        let bytes = &mut self.buf.as_bytes_mut()[frame_offset * size..(frame_offset + frames) * size];
        // SAFETY: the allocation is 32-byte aligned and the byte offset is a
        // multiple of the element size, so the pointer is aligned for T; the
        // length was sliced to exactly `frames` elements.
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), frames) }
    }

    /// Append `frames` frames of the tick's server buffer, starting at
    /// `server_offset`, into the shadow buffer at `shadow_offset`, converting
    /// to the client format.
    pub(crate) fn copy_from_server(
        &mut self,
        shadow_offset: usize,
        server_offset: usize,
        frames: usize,
        tick_frames: usize,
    ) -> Result<(), String> {
        if frames == 0 {
            return Ok(());
        }
        let src = self
            .port
            .buffer(tick_frames)
            .ok_or_else(|| format!("Failed to get buffer of port {}", self.port.name()))?;
        let src = &src[server_offset..server_offset + frames];
        let size = self.sample_size();
        let dst = &mut self.buf.as_bytes_mut()[shadow_offset * size..(shadow_offset + frames) * size];
        match self.format {
            SampleFormat::Float => {
                // SAFETY: dst is 4-byte aligned (see slice_mut) and frames
                // f32 long.
                let dst =
                    unsafe { std::slice::from_raw_parts_mut(dst.as_mut_ptr().cast::<f32>(), frames) };
                dst.copy_from_slice(src);
            }
            SampleFormat::Int32 => convert_float_to_i32(dst, size, src),
            SampleFormat::Int16 => convert_float_to_i16(dst, size, src),
        }
        Ok(())
    }

    /// Drain `frames` frames of the shadow buffer, starting at
    /// `shadow_offset`, into the tick's server buffer, converting to float.
    pub(crate) fn drain_to_server(
        &mut self,
        shadow_offset: usize,
        frames: usize,
        tick_frames: usize,
    ) -> Result<(), String> {
        let size = self.sample_size();
        let src = &self.buf.as_bytes()[shadow_offset * size..(shadow_offset + frames) * size];
        copy_bytes_to_server(&self.port, self.format, src, frames, tick_frames)
    }

    /// Write `frames` frames of caller-provided client-format bytes straight
    /// to the tick's server buffer.
    pub(crate) fn write_to_server(
        &self,
        src: &[u8],
        frames: usize,
        tick_frames: usize,
    ) -> Result<(), String> {
        copy_bytes_to_server(&self.port, self.format, src, frames, tick_frames)
    }

    /// Move `frames` frames at `from_frame` to the start of the shadow
    /// buffer. The regions may overlap.
    pub(crate) fn compact(&mut self, from_frame: usize, frames: usize) {
        let size = self.sample_size();
        let start = from_frame * size;
        self.buf.as_bytes_mut().copy_within(start..start + frames * size, 0);
    }
}

fn copy_bytes_to_server<P: ServerPort>(
    port: &P,
    format: SampleFormat,
    src: &[u8],
    frames: usize,
    tick_frames: usize,
) -> Result<(), String> {
    if frames == 0 {
        return Ok(());
    }
    let dst = port
        .buffer(tick_frames)
        .ok_or_else(|| format!("Failed to get buffer of port {}", port.name()))?;
    let dst = &mut dst[..frames];
    match format {
        SampleFormat::Float => {
            // SAFETY: src holds `frames` native f32 samples at 4-byte
            // alignment.
            let src = unsafe { std::slice::from_raw_parts(src.as_ptr().cast::<f32>(), frames) };
            dst.copy_from_slice(src);
        }
        SampleFormat::Int32 => convert_i32_to_float(dst, src, format.sample_size()),
        SampleFormat::Int16 => convert_i16_to_float(dst, src, format.sample_size()),
    }
    Ok(())
}
