//! End-to-end tests of the period scheduler and port adapters against a mock
//! audio server: one process handler slot, float period buffers per port.

use reblock::{
    AudioServer, BufferConverter, Control, PortConfig, PortConverter, PortFlags, ProcessHandler,
    RtCell, SampleFormat, ServerPort,
};
use std::sync::Arc;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct PortState {
    name: String,
    flags: PortFlags,
    buffer: RtCell<Vec<f32>>,
}

#[derive(Clone)]
struct MockPort {
    state: Arc<PortState>,
}

impl MockPort {
    fn new(name: &str, flags: PortFlags, frames: usize) -> Self {
        Self {
            state: Arc::new(PortState {
                name: name.into(),
                flags,
                buffer: RtCell::new(vec![0.0; frames]),
            }),
        }
    }

    fn input(name: &str, frames: usize) -> Self {
        Self::new(name, PortFlags::INPUT, frames)
    }

    fn output(name: &str, frames: usize) -> Self {
        Self::new(name, PortFlags::OUTPUT, frames)
    }

    fn write(&self, data: &[f32]) {
        self.state.buffer.lock()[..data.len()].copy_from_slice(data);
    }

    fn read(&self) -> Vec<f32> {
        self.state.buffer.lock().clone()
    }
}

impl ServerPort for MockPort {
    fn flags(&self) -> Result<PortFlags, String> {
        Ok(self.state.flags)
    }

    fn name(&self) -> String {
        self.state.name.clone()
    }

    fn buffer(&self, frames: usize) -> Option<&mut [f32]> {
        Some(&mut self.state.buffer.lock()[..frames])
    }
}

struct MockServer {
    frames: usize,
    handler: RtCell<Option<Box<dyn ProcessHandler>>>,
}

impl MockServer {
    fn new(frames: usize) -> Self {
        Self {
            frames,
            handler: RtCell::new(None),
        }
    }

    fn tick(&self) -> Control {
        self.handler
            .lock()
            .as_mut()
            .expect("no process handler registered")
            .process(self.frames)
    }
}

impl AudioServer for MockServer {
    type Port = MockPort;

    fn buffer_size(&self) -> usize {
        self.frames
    }

    fn register_process_handler(&self, handler: Box<dyn ProcessHandler>) -> Result<(), String> {
        *self.handler.lock() = Some(handler);
        Ok(())
    }
}

fn ramp(start: usize, len: usize) -> Vec<f32> {
    (start..start + len).map(|i| i as f32).collect()
}

/// A client that echoes its input port to its output port through a period
/// converter, recording everything it was handed.
struct EchoClient {
    server: MockServer,
    in_port: MockPort,
    out_port: MockPort,
    conv: BufferConverter<MockPort>,
    input_handle: PortConverter<MockPort>,
    seen: Arc<RtCell<Vec<f32>>>,
    callbacks: Arc<RtCell<usize>>,
    fed: usize,
}

impl EchoClient {
    fn new(server_frames: usize, client_frames: usize) -> Self {
        let server = MockServer::new(server_frames);
        let in_port = MockPort::input("mock:capture_1", server_frames);
        let out_port = MockPort::output("mock:playback_1", server_frames);

        let seen: Arc<RtCell<Vec<f32>>> = Arc::new(RtCell::new(Vec::new()));
        let callbacks = Arc::new(RtCell::new(0usize));
        type Slot = Arc<RtCell<Option<PortConverter<MockPort>>>>;
        let in_slot: Slot = Arc::new(RtCell::new(None));
        let out_slot: Slot = Arc::new(RtCell::new(None));

        let conv = {
            let seen = Arc::clone(&seen);
            let callbacks = Arc::clone(&callbacks);
            let in_slot = Arc::clone(&in_slot);
            let out_slot = Arc::clone(&out_slot);
            BufferConverter::register(
                &server,
                move |frames| {
                    let input = in_slot.lock();
                    let output = out_slot.lock();
                    let (Some(input), Some(output)) = (input.as_ref(), output.as_ref()) else {
                        return Control::Quit;
                    };
                    let Some(data) = input.get::<f32>(frames) else {
                        return Control::Quit;
                    };
                    seen.lock().extend_from_slice(data);
                    let Some(out_buf) = output.get::<f32>(frames) else {
                        return Control::Quit;
                    };
                    out_buf.copy_from_slice(data);
                    output.set(&*out_buf, frames);
                    *callbacks.lock() += 1;
                    Control::Continue
                },
                client_frames,
            )
            .expect("failed to register buffer converter")
        };

        let input_handle =
            PortConverter::new(&server, in_port.clone(), PortConfig::default(), Some(&conv))
                .expect("failed to create input port converter");
        *in_slot.lock() = Some(input_handle.clone());
        *out_slot.lock() = Some(
            PortConverter::new(&server, out_port.clone(), PortConfig::default(), Some(&conv))
                .expect("failed to create output port converter"),
        );

        Self {
            server,
            in_port,
            out_port,
            conv,
            input_handle,
            seen,
            callbacks,
            fed: 0,
        }
    }

    /// Feed the next slice of an endless ramp into the input port, run one
    /// tick, and return the callback count of this tick plus the output
    /// port's buffer.
    fn tick(&mut self) -> (usize, Vec<f32>) {
        let frames = self.server.buffer_size();
        self.in_port.write(&ramp(self.fed, frames));
        self.fed += frames;
        let before = *self.callbacks.lock();
        assert_eq!(self.server.tick(), Control::Continue);
        (*self.callbacks.lock() - before, self.out_port.read())
    }

    /// Everything the client was handed must be the silence prefill followed
    /// by the fed ramp, with nothing lost or duplicated.
    fn assert_conservation(&self) {
        let prefill = self.conv.silence_prefill();
        let seen = self.seen.lock();
        assert!(seen.len() >= prefill);
        assert!(seen[..prefill].iter().all(|&s| s == 0.0));
        assert_eq!(seen[prefill..], ramp(0, seen.len() - prefill)[..]);
        assert!(seen.len() - prefill <= self.fed);
    }
}

#[test]
fn identity_float_equal_periods_passes_through() {
    init_logging();
    let server = MockServer::new(256);
    let in_port = MockPort::input("mock:capture_1", 256);
    let out_port = MockPort::output("mock:playback_1", 256);

    let input = PortConverter::new(&server, in_port.clone(), PortConfig::default(), None).unwrap();
    let output = PortConverter::new(&server, out_port.clone(), PortConfig::default(), None).unwrap();

    let mut signal = vec![0.0f32; 256];
    signal[0] = 1.0;
    signal[1] = 0.5;
    signal[3] = -0.5;
    in_port.write(&signal);

    // What a client callback would do on one tick.
    let data = input.get::<f32>(256).unwrap();
    output.set(&*data, 256);

    assert_eq!(out_port.read(), signal);
}

#[test]
fn pass_through_set_of_own_buffer_is_a_no_op() {
    init_logging();
    let server = MockServer::new(64);
    let out_port = MockPort::output("mock:playback_1", 64);
    let output = PortConverter::new(&server, out_port.clone(), PortConfig::default(), None).unwrap();

    let buf = output.get::<f32>(64).unwrap();
    buf.fill(0.75);
    output.set(&*buf, 64);
    assert!(out_port.read().iter().all(|&s| s == 0.75));
}

#[test]
fn format_only_int32_echo() {
    init_logging();
    let server = MockServer::new(128);
    let in_port = MockPort::input("mock:capture_1", 128);
    let out_port = MockPort::output("mock:playback_1", 128);
    let config = PortConfig {
        format: SampleFormat::Int32,
        ..Default::default()
    };

    let input = PortConverter::new(&server, in_port.clone(), config, None).unwrap();
    let output = PortConverter::new(&server, out_port.clone(), config, None).unwrap();

    let mut signal = vec![0.0f32; 128];
    signal[0] = 1.0;
    signal[1] = -1.0;
    signal[3] = 0.5;
    in_port.write(&signal);

    let data = input.get::<i32>(128).unwrap();
    assert_eq!(data[0], 0x7FFF_FFFF);
    assert_eq!(data[1], -0x7FFF_FFFF);
    assert_eq!(data[2], 0);
    let half = data[3] as f64 / 0x7FFF_FFFF as f64;
    assert!((half - 0.5).abs() < 1e-6);

    output.set(&*data, 128);
    let tolerance = 2.0 / 0x7FFF_FFFFu32 as f64;
    for (echoed, original) in out_port.read().iter().zip(signal.iter()) {
        assert!((*echoed as f64 - *original as f64).abs() <= tolerance);
    }
}

#[test]
fn sub_period_divisible_runs_four_callbacks_per_tick() {
    init_logging();
    let mut client = EchoClient::new(1024, 256);
    assert_eq!(client.conv.silence_prefill(), 0);

    let (callbacks, out) = client.tick();
    assert_eq!(callbacks, 4);
    // With no prefill the whole tick comes back out in one shot.
    assert_eq!(out, ramp(0, 1024));
    client.assert_conservation();
}

#[test]
fn super_period_divisible_fires_every_fourth_tick() {
    init_logging();
    let mut client = EchoClient::new(256, 1024);
    assert_eq!(client.conv.silence_prefill(), 768);

    let mut out_stream = Vec::new();
    let mut per_tick = Vec::new();
    for _ in 0..5 {
        let (callbacks, out) = client.tick();
        per_tick.push(callbacks);
        out_stream.extend_from_slice(&out);
    }
    assert_eq!(per_tick, [1, 0, 0, 0, 1]);
    // The echo comes back delayed by the prefill.
    assert_eq!(out_stream[..768], vec![0.0; 768][..]);
    assert_eq!(out_stream[768..], ramp(0, 512)[..]);
    client.assert_conservation();
}

#[test]
fn super_period_non_divisible_conserves_frames() {
    init_logging();
    let mut client = EchoClient::new(256, 300);
    assert_eq!(client.conv.silence_prefill(), 300);

    let mut out_stream = Vec::new();
    let mut total_callbacks = 0;
    for _ in 0..8 {
        let (callbacks, out) = client.tick();
        total_callbacks += callbacks;
        out_stream.extend_from_slice(&out);
    }
    // 8 ticks feed 2048 frames; with 300 frames of prefill the client has
    // consumed floor(2348 / 300) blocks.
    assert_eq!(total_callbacks, 7);
    assert_eq!(out_stream[..300], vec![0.0; 300][..]);
    assert_eq!(out_stream[300..], ramp(0, 8 * 256 - 300)[..]);
    client.assert_conservation();
}

#[test]
fn sub_period_non_divisible_catches_up_periodically() {
    init_logging();
    let mut client = EchoClient::new(300, 256);
    assert_eq!(client.conv.silence_prefill(), 256);

    let mut out_stream = Vec::new();
    let mut per_tick = Vec::new();
    for _ in 0..6 {
        let (callbacks, out) = client.tick();
        per_tick.push(callbacks);
        out_stream.extend_from_slice(&out);
    }
    // The prefill satisfies one extra block on the first tick; afterwards
    // the leftover 44 frames per tick add up to a double-callback tick.
    assert_eq!(per_tick, [2, 1, 1, 1, 1, 2]);
    assert_eq!(out_stream[..256], vec![0.0; 256][..]);
    assert_eq!(out_stream[256..], ramp(0, 6 * 300 - 256)[..]);
    client.assert_conservation();
}

#[test]
fn set_on_input_port_has_no_effect() {
    init_logging();
    let mut client = EchoClient::new(256, 128);

    // Illegal: input ports are read-only for the client. Neither the server
    // buffer nor what the client subsequently reads may change.
    client.input_handle.set(&vec![0.5f32; 128], 128);
    assert!(client.in_port.read().iter().all(|&s| s == 0.0));

    let (callbacks, _) = client.tick();
    assert_eq!(callbacks, 2);
    client.assert_conservation();
}

#[test]
fn mismatched_sample_type_is_rejected() {
    init_logging();
    let server = MockServer::new(128);
    let out_port = MockPort::output("mock:playback_1", 128);
    let output =
        PortConverter::new(&server, out_port.clone(), PortConfig::default(), None).unwrap();

    // A float port hands out no integer view, and an integer set is dropped.
    assert!(output.get::<i32>(128).is_none());
    output.set(&vec![0x7FFF_FFFFi32; 128], 128);
    assert!(out_port.read().iter().all(|&s| s == 0.0));

    let config = PortConfig {
        format: SampleFormat::Int32,
        ..Default::default()
    };
    let in_port = MockPort::input("mock:capture_1", 128);
    let input = PortConverter::new(&server, in_port, config, None).unwrap();
    assert!(input.get::<i16>(128).is_none());
    assert!(input.get::<f32>(128).is_none());
    assert!(input.get::<i32>(128).is_some());
}

#[test]
fn wrong_frame_count_is_rejected_without_reblocking() {
    init_logging();
    let server = MockServer::new(128);
    let out_port = MockPort::output("mock:playback_1", 128);

    // Pass-through and format-only adapters keep the server period.
    let pass = PortConverter::new(&server, out_port.clone(), PortConfig::default(), None).unwrap();
    assert!(pass.get::<f32>(64).is_none());
    pass.set(&vec![0.5f32; 128], 64);
    assert!(out_port.read().iter().all(|&s| s == 0.0));

    let config = PortConfig {
        format: SampleFormat::Int16,
        ..Default::default()
    };
    let conv = PortConverter::new(&server, out_port.clone(), config, None).unwrap();
    assert!(conv.get::<i16>(64).is_none());
    conv.set(&vec![0x7FFFi16; 128], 64);
    assert!(out_port.read().iter().all(|&s| s == 0.0));
}

#[test]
fn client_quit_propagates() {
    init_logging();
    let server = MockServer::new(128);
    let in_port = MockPort::input("mock:capture_1", 128);
    let out_port = MockPort::output("mock:playback_1", 128);

    let conv = BufferConverter::register(&server, |_| Control::Quit, 128).unwrap();
    let _input =
        PortConverter::new(&server, in_port, PortConfig::default(), Some(&conv)).unwrap();
    let _output =
        PortConverter::new(&server, out_port, PortConfig::default(), Some(&conv)).unwrap();

    assert_eq!(server.tick(), Control::Quit);
}

#[test]
fn tick_without_ports_is_refused() {
    init_logging();
    let server = MockServer::new(128);
    let _conv = BufferConverter::register(&server, |_| Control::Continue, 128).unwrap();
    assert_eq!(server.tick(), Control::Quit);
}

#[test]
fn zero_client_period_is_rejected() {
    init_logging();
    let server = MockServer::new(128);
    assert!(BufferConverter::register(&server, |_| Control::Continue, 0).is_err());
}
