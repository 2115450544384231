mod common;

use std::time::Duration;

use common::*;
use io_backends::port_engine::{LatencyRange, PortError, PortFlags, PortKind};
use io_backends::{Backend, BackendError, ClockMode, DriverError, NullDriver};

#[test]
fn pass_through_output_trails_capture_by_one_period() {
    let (mut backend, handle) = null_backend(ClockMode::Manual);
    backend.set_input_channels(2).unwrap();
    backend.set_output_channels(2).unwrap();
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    for channel in 1..=2 {
        backend
            .connect_by_name(
                &format!("system:capture_{channel}"),
                &format!("system:playback_{channel}"),
            )
            .unwrap();
    }
    let mut connections = 0;
    assert!(wait_for_note(&notes, |note| {
        if matches!(note, Note::Connection(_, _, true)) {
            connections += 1;
        }
        connections == 2
    }));

    assert!(handle.step(1, TIMEOUT));

    let period = PERIOD as usize;
    let left: Vec<f32> = (0..4 * period).map(|i| i as f32 / 1024.0).collect();
    let right: Vec<f32> = left.iter().map(|sample| -sample).collect();
    handle.feed(0, &left);
    handle.feed(1, &right);
    assert!(handle.step(4, TIMEOUT));

    // The first cycle captured silence; playback trails capture by the one
    // period the device holds before the first write.
    let delayed = |captured: &[f32]| {
        let mut stream = vec![0.0; 2 * period];
        stream.extend_from_slice(captured);
        stream
    };
    let expected_left = delayed(&left);
    let expected_right = delayed(&right);
    assert_eq!(handle.output(0), expected_left);
    assert_eq!(handle.output(1), expected_right);
    assert!(eventually(|| backend.sample_time() == 5 * u64::from(PERIOD)));

    backend.stop().unwrap();
}

#[test]
fn start_reports_negotiated_parameters_and_registers_system_ports() {
    let (mut backend, _handle) = null_backend(ClockMode::Realtime);
    backend.set_sample_rate(44_100).unwrap();
    backend.set_buffer_size(300).unwrap();
    backend.set_input_channels(2).unwrap();
    backend.set_output_channels(64).unwrap();
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();

    backend.start(false).unwrap();
    assert!(backend.is_running());
    assert_eq!(backend.sample_rate(), 44_100);
    assert_eq!(backend.buffer_size(), 256);
    assert_eq!(notes.recv_timeout(TIMEOUT).unwrap(), Note::SampleRate(44_100));
    assert_eq!(notes.recv_timeout(TIMEOUT).unwrap(), Note::BufferSize(256));

    let capture = backend.physical_inputs(PortKind::Audio);
    let playback = backend.physical_outputs(PortKind::Audio);
    assert_eq!(capture, vec!["system:capture_1", "system:capture_2"]);
    assert_eq!(playback.len(), 8, "playback is clamped to the device");
    let (inputs, outputs) = backend.physical_counts();
    assert_eq!(inputs.audio, 2);
    assert_eq!(outputs.audio, 8);

    backend.stop().unwrap();
    assert!(backend.ports("system:", PortKind::Audio, PortFlags::empty()).is_empty());
}

#[test]
fn start_and_stop_are_idempotent() {
    let (mut backend, handle) = null_backend(ClockMode::Realtime);
    backend.stop().unwrap();

    backend.start(false).unwrap();
    assert!(matches!(backend.start(false), Err(BackendError::AlreadyRunning)));
    assert!(matches!(
        backend.set_sample_rate(96_000),
        Err(BackendError::AlreadyRunning)
    ));
    assert!(handle.is_running());
    assert!(eventually(|| backend.sample_time() > 0));

    backend.stop().unwrap();
    backend.stop().unwrap();
    assert!(!backend.is_running());
    assert!(!handle.is_open());

    backend.start(false).unwrap();
    assert_eq!(handle.open_count(), 2);
    backend.stop().unwrap();
}

#[test]
fn start_without_device_is_rejected() {
    let (mut backend, handle) = null_backend(ClockMode::Realtime);
    backend.set_device_name(io_backends::NO_DEVICE).unwrap();
    assert!(matches!(backend.start(false), Err(BackendError::NoDeviceSelected)));

    backend.set_device_name("Missing Device").unwrap();
    match backend.start(false) {
        Err(BackendError::AudioDeviceOpen { device, source }) => {
            assert_eq!(device, "Missing Device");
            assert_eq!(source, DriverError::DeviceNotFound("Missing Device".into()));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(handle.open_count(), 0);
}

#[test]
fn failed_open_leaves_backend_closed() {
    let (mut backend, handle) = null_backend(ClockMode::Realtime);
    handle.fail_next_open("device busy");

    let err = backend.start(false).unwrap_err();
    assert!(err.is_device_open_error(), "{err}");
    assert!(!backend.is_running());
    assert!(backend.ports("", PortKind::Audio, PortFlags::PHYSICAL).is_empty());

    backend.start(false).unwrap();
    assert!(backend.is_running());
    backend.stop().unwrap();
}

fn slow_starting_backend() -> (Backend, io_backends::NullHandle) {
    let driver = NullDriver::new(ClockMode::Realtime);
    let handle = driver.handle();
    let backend = Backend::new("test", Box::new(driver))
        .with_config(test_config())
        .with_start_timeout(Duration::from_millis(50));
    handle.delay_next_start(Duration::from_millis(500));
    (backend, handle)
}

#[test]
fn slow_process_thread_start_times_out() {
    let (mut backend, handle) = slow_starting_backend();

    let err = backend.start(false).unwrap_err();
    assert!(matches!(err, BackendError::ProcessThreadStart(_)), "{err}");
    assert!(!backend.is_running());
    assert!(!backend.is_halted());
    assert!(handle.is_open());

    // Joins the late thread and closes the device it handed back.
    backend.stop().unwrap();
    assert!(!handle.is_open());
    assert!(!handle.is_running());
    assert!(backend.ports("system:", PortKind::Audio, PortFlags::empty()).is_empty());

    backend.start(false).unwrap();
    assert!(backend.is_running());
    assert_eq!(handle.open_count(), 2);
    backend.stop().unwrap();
}

#[test]
fn start_after_a_timed_out_start_reaps_the_old_thread() {
    let (mut backend, handle) = slow_starting_backend();
    assert!(matches!(
        backend.start(false),
        Err(BackendError::ProcessThreadStart(_))
    ));

    backend.start(false).unwrap();
    assert!(backend.is_running());
    assert_eq!(handle.open_count(), 2);
    assert_eq!(handle.start_count(), 2);
    assert!(eventually(|| backend.sample_time() > 0));
    backend.stop().unwrap();
    assert!(!handle.is_open());
}

#[test]
fn freewheel_requests_are_idempotent() {
    let (mut backend, handle) = null_backend(ClockMode::Realtime);
    assert!(matches!(backend.freewheel(true), Err(BackendError::NotRunning)));

    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    backend.freewheel(true).unwrap();
    assert_eq!(backend.wait_freewheel_ack(TIMEOUT), Some(true));
    assert!(backend.is_freewheeling());
    assert!(!handle.is_running(), "device is paused while freewheeling");
    backend.freewheel(true).unwrap();

    let before = backend.sample_time();
    assert!(eventually(|| backend.sample_time() > before + 10 * u64::from(PERIOD)));

    backend.freewheel(false).unwrap();
    assert_eq!(backend.wait_freewheel_ack(TIMEOUT), Some(false));
    assert!(!backend.is_freewheeling());
    assert!(handle.is_running());

    backend.stop().unwrap();
    let transitions: Vec<Note> = notes
        .try_iter()
        .filter(|note| matches!(note, Note::Freewheel(_)))
        .collect();
    assert_eq!(transitions, vec![Note::Freewheel(true), Note::Freewheel(false)]);
}

#[test]
fn physical_latency_includes_one_period_and_systemic_latency() {
    let (mut backend, _handle) = null_backend(ClockMode::Realtime);
    backend.set_systemic_input_latency(32);
    backend.set_systemic_output_latency(64);
    backend.start(false).unwrap();

    let capture = backend.port_by_name("system:capture_1").unwrap();
    let playback = backend.port_by_name("system:playback_1").unwrap();
    assert_eq!(
        backend.latency_range(capture, false).unwrap(),
        LatencyRange::fixed(PERIOD + 32)
    );
    assert_eq!(
        backend.latency_range(playback, true).unwrap(),
        LatencyRange::fixed(PERIOD + 64)
    );

    let round_trip = backend.latency_range(capture, false).unwrap().max
        + backend.latency_range(playback, true).unwrap().max;
    assert_eq!(round_trip, 2 * PERIOD + 96);

    backend.set_systemic_output_latency(100);
    assert_eq!(
        backend.latency_range(playback, true).unwrap(),
        LatencyRange::fixed(PERIOD + 100)
    );

    backend.stop().unwrap();
    backend.start(true).unwrap();
    let capture = backend.port_by_name("system:capture_1").unwrap();
    assert_eq!(
        backend.latency_range(capture, false).unwrap(),
        LatencyRange::fixed(PERIOD),
        "measurement sessions leave systemic latency out"
    );
    backend.stop().unwrap();
}

#[test]
fn engine_ports_are_namespaced_and_physical_ports_protected() {
    let (mut backend, _handle) = null_backend(ClockMode::Realtime);
    backend.start(false).unwrap();

    let out = backend
        .register_port("out_1", PortKind::Audio, PortFlags::OUTPUT)
        .unwrap();
    assert_eq!(backend.port_name(out).unwrap(), "test:out_1");
    assert!(matches!(
        backend.register_port("", PortKind::Audio, PortFlags::OUTPUT),
        Err(BackendError::Port(PortError::InvalidName))
    ));
    assert!(matches!(
        backend.register_port("hw", PortKind::Audio, PortFlags::OUTPUT | PortFlags::PHYSICAL),
        Err(BackendError::Port(PortError::PhysicalPortReserved))
    ));

    backend.connect_by_name("test:out_1", "system:playback_1").unwrap();
    assert!(backend.is_connected(out).unwrap());
    assert_eq!(backend.connections(out).unwrap(), vec!["system:playback_1"]);
    let playback = backend.port_by_name("system:playback_1").unwrap();
    assert!(backend.physically_connected(out).unwrap());

    backend.unregister_port(playback);
    assert!(backend.port_by_name("system:playback_1").is_some());

    backend.unregister_port(out);
    assert!(backend.port_by_name("test:out_1").is_none());
    assert!(!backend.is_connected(playback).unwrap());

    backend.stop().unwrap();
}

#[test]
fn topology_changes_announce_latency_before_and_after() {
    let (mut backend, _handle) = null_backend(ClockMode::Realtime);
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    backend
        .connect_by_name("system:capture_1", "system:playback_1")
        .unwrap();
    assert!(wait_for_note(&notes, |note| matches!(note, Note::Connection(_, _, true))));
    let latency: Vec<Note> = std::iter::from_fn(|| notes.recv_timeout(TIMEOUT).ok())
        .filter(|note| matches!(note, Note::Latency(_)))
        .take(2)
        .collect();
    assert_eq!(latency, vec![Note::Latency(false), Note::Latency(true)]);

    backend.stop().unwrap();
}

#[test]
fn cycle_counters_advance_while_running() {
    let (mut backend, _handle) = null_backend(ClockMode::Realtime);
    assert_eq!(backend.samples_since_cycle_start(), 0);
    backend.start(false).unwrap();
    assert!(eventually(|| backend.sample_time() >= 4 * u64::from(PERIOD)));
    assert!(backend.samples_since_cycle_start() <= 2 * PERIOD);
    assert!(backend.dsp_load() >= 0.0);
    assert_eq!(backend.xrun_count(), 0);
    std::thread::sleep(Duration::from_millis(5));
    backend.stop().unwrap();
}
