mod common;

use common::*;
use io_backends::port_engine::{PortFlags, PortKind};
use io_backends::{ClockMode, MidiDeviceInfo, MidiDirection, NullDriver};

fn keys() -> MidiDeviceInfo {
    MidiDeviceInfo {
        name: "Keys".into(),
        capture: true,
        playback: true,
    }
}

fn midi_backend() -> (io_backends::Backend, io_backends::NullHandle) {
    let mut config = test_config();
    config.midi_option = "Null MIDI".into();
    null_backend_with(
        NullDriver::new(ClockMode::Realtime).with_midi_devices(vec![keys()]),
        config,
    )
}

#[test]
fn midi_devices_become_physical_ports() {
    let (mut backend, _handle) = midi_backend();
    backend.start(false).unwrap();

    assert_eq!(
        backend.physical_inputs(PortKind::Midi),
        vec!["system:midi_capture_1"]
    );
    assert_eq!(
        backend.physical_outputs(PortKind::Midi),
        vec!["system:midi_playback_1"]
    );
    let capture = backend.port_by_name("system:midi_capture_1").unwrap();
    let flags = backend.port_flags(capture).unwrap();
    assert!(flags.contains(PortFlags::OUTPUT | PortFlags::PHYSICAL | PortFlags::TERMINAL));

    backend.stop().unwrap();
    assert!(backend
        .ports("midi", PortKind::Midi, PortFlags::empty())
        .is_empty());
}

#[test]
fn disabled_midi_devices_are_skipped() {
    let (mut backend, _handle) = midi_backend();
    backend.set_midi_device_enabled("Keys", false).unwrap();
    backend.start(false).unwrap();
    assert!(backend.physical_inputs(PortKind::Midi).is_empty());
    backend.stop().unwrap();
}

#[test]
fn midi_is_routed_from_capture_to_playback() {
    let (mut backend, handle) = midi_backend();
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();
    backend
        .connect_by_name("system:midi_capture_1", "system:midi_playback_1")
        .unwrap();
    assert!(wait_for_note(&notes, |note| matches!(note, Note::Connection(_, _, true))));

    handle.feed_midi("Keys", 10, &[0x90, 60, 100]);
    handle.feed_midi("Keys", 20, &[0x80, 60, 0]);
    assert!(eventually(|| handle.sent_midi().len() == 2));
    assert_eq!(
        handle.sent_midi(),
        vec![
            ("Keys".to_string(), 10, vec![0x90, 60, 100]),
            ("Keys".to_string(), 20, vec![0x80, 60, 0]),
        ]
    );
    backend.stop().unwrap();
}

#[test]
fn refused_midi_output_is_counted_and_survived() {
    let (mut backend, handle) = midi_backend();
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();
    backend
        .connect_by_name("system:midi_capture_1", "system:midi_playback_1")
        .unwrap();
    assert!(wait_for_note(&notes, |note| matches!(note, Note::Connection(_, _, true))));

    handle.refuse_midi(true);
    handle.feed_midi("Keys", 3, &[0x90, 64, 90]);
    handle.feed_midi("Keys", 7, &[0x80, 64, 0]);
    assert!(eventually(|| backend.midi_drop_count() == 2));
    assert!(handle.sent_midi().is_empty());
    assert!(backend.is_running());

    handle.refuse_midi(false);
    handle.feed_midi("Keys", 1, &[0x90, 65, 90]);
    assert!(eventually(|| handle.sent_midi().len() == 1));
    assert_eq!(backend.midi_drop_count(), 2);
    backend.stop().unwrap();
}

#[test]
fn hotplugged_midi_devices_add_and_remove_ports() {
    let (mut backend, handle) = midi_backend();
    let (engine, notes) = RecordingEngine::new();
    backend.set_engine(Box::new(engine)).unwrap();
    backend.start(false).unwrap();

    handle.plug_midi("Pads", MidiDirection::Capture);
    assert!(eventually(|| backend.port_by_name("system:midi_capture_2").is_some()));
    assert!(wait_for_note(&notes, |note| *note == Note::PortsRegistered));

    handle.unplug_midi("Keys", MidiDirection::Capture);
    assert!(eventually(|| backend.port_by_name("system:midi_capture_1").is_none()));
    assert_eq!(
        backend.physical_inputs(PortKind::Midi),
        vec!["system:midi_capture_2"]
    );
    assert!(backend.port_by_name("system:midi_playback_1").is_some());

    backend.stop().unwrap();
}
