mod common;

use common::*;
use io_backends::{ClockMode, NullDriver, SlaveMode};

#[test]
fn persistent_xruns_halt_the_backend_once() {
    let mut config = test_config();
    config.xrun_bailout_seconds = 0.01;
    let (mut backend, handle) = null_backend_with(NullDriver::new(ClockMode::Realtime), config);
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    handle.set_xrun_storm(true);
    assert!(wait_for_note(&notes, |note| matches!(note, Note::Halted(_))));
    assert!(eventually(|| !backend.is_running()));
    assert!(backend.is_halted());
    // 0.01 s at 48 kHz with 256 frame periods tolerates two xruns in a row.
    assert!(backend.xrun_count() >= 3);

    handle.set_xrun_storm(false);
    backend.stop().unwrap();
    let halts = notes
        .try_iter()
        .filter(|note| matches!(note, Note::Halted(_)))
        .count();
    assert_eq!(halts, 0, "halted is delivered exactly once");
    assert!(!backend.is_halted());
}

#[test]
fn stalled_device_counts_xruns_and_halts() {
    let mut config = test_config();
    config.xrun_bailout_seconds = 0.01;
    let (mut backend, handle) = null_backend_with(NullDriver::new(ClockMode::Manual), config);
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    // The manual clock never ticks, so every wait times out.
    assert!(wait_for_note(&notes, |note| matches!(note, Note::Halted(_))));
    assert!(eventually(|| backend.is_halted()));
    assert!(backend.xrun_count() >= 3);
    assert_eq!(handle.completed_cycles(), 0);

    backend.stop().unwrap();
    let halts = notes
        .try_iter()
        .filter(|note| matches!(note, Note::Halted(_)))
        .count();
    assert_eq!(halts, 0);
}

#[test]
fn isolated_xruns_are_counted_and_survived() {
    let (mut backend, handle) = null_backend(ClockMode::Realtime);
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    handle.inject_xrun();
    assert!(wait_for_note(&notes, |note| *note == Note::Xrun));
    assert_eq!(backend.xrun_count(), 1);
    let cycles = handle.completed_cycles();
    assert!(eventually(|| handle.completed_cycles() > cycles + 2));
    assert!(backend.is_running());
    backend.stop().unwrap();
}

#[test]
fn device_fault_halts_and_restart_recovers() {
    let (mut backend, handle) = null_backend(ClockMode::Realtime);
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    handle.inject_fault("device unplugged");
    assert!(wait_for_note(&notes, |note| {
        matches!(note, Note::Halted(reason) if reason.contains("device unplugged"))
    }));
    assert!(eventually(|| backend.is_halted()));

    backend.start(false).unwrap();
    assert!(backend.is_running());
    assert_eq!(handle.open_count(), 2);
    backend.stop().unwrap();
}

#[test]
fn process_errors_halt_the_backend() {
    let (mut backend, _handle) = null_backend(ClockMode::Realtime);
    let mut cycles = 0;
    let (engine, notes) = RecordingEngine::new();
    let engine = engine.with_process(move |_scope| {
        cycles += 1;
        if cycles == 3 {
            anyhow::bail!("plugin crashed");
        }
        Ok(())
    });
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    assert!(wait_for_note(&notes, |note| {
        matches!(note, Note::Halted(reason) if reason.contains("plugin crashed"))
    }));
    assert!(eventually(|| !backend.is_running()));
    backend.stop().unwrap();
}

#[test]
fn slave_fault_removes_its_ports_and_spares_the_primary() {
    let (mut backend, handle) = null_backend(ClockMode::Realtime);
    let slave = NullDriver::new(ClockMode::Freerun);
    let slave_handle = slave.handle();
    backend
        .add_slave("usb", Box::new(slave), "Null Device", SlaveMode::Full)
        .unwrap();
    backend.start(false).unwrap();

    assert!(backend.port_by_name("usb:capture_1").is_some());
    assert!(backend.port_by_name("usb:playback_8").is_some());
    assert!(slave_handle.is_running());

    slave_handle.inject_fault("usb cable pulled");
    assert!(eventually(|| backend.port_by_name("usb:capture_1").is_none()));
    assert!(backend.port_by_name("usb:playback_1").is_none());

    let cycles = handle.completed_cycles();
    assert!(eventually(|| handle.completed_cycles() > cycles + 2));
    assert!(backend.is_running());

    backend.stop().unwrap();
    assert!(!slave_handle.is_open());
}

#[test]
fn slaves_are_only_managed_while_stopped() {
    let (mut backend, _handle) = null_backend(ClockMode::Realtime);
    backend
        .add_slave("usb", Box::new(NullDriver::default()), "Null Device", SlaveMode::CaptureOnly)
        .unwrap();
    assert!(backend
        .add_slave("usb", Box::new(NullDriver::default()), "Null Device", SlaveMode::Full)
        .is_err());
    assert!(backend
        .add_slave("system", Box::new(NullDriver::default()), "Null Device", SlaveMode::Full)
        .is_err());

    backend.start(false).unwrap();
    assert!(backend.port_by_name("usb:capture_1").is_some());
    assert!(backend.port_by_name("usb:playback_1").is_none());
    assert!(backend.remove_slave("usb").is_err());
    backend.stop().unwrap();

    assert_eq!(backend.slave_names(), vec!["usb"]);
    assert!(backend.remove_slave("usb").unwrap());
    assert!(backend.slave_names().is_empty());
}

#[test]
fn missing_slave_device_is_skipped() {
    let (mut backend, _handle) = null_backend(ClockMode::Realtime);
    backend
        .add_slave("ghost", Box::new(NullDriver::default()), "No Such Device", SlaveMode::Full)
        .unwrap();
    backend.start(false).unwrap();
    assert!(backend.is_running());
    assert!(backend.port_by_name("ghost:capture_1").is_none());
    backend.stop().unwrap();
}
