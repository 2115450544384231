//! Arena of ports and the connection relation between them.
//!
//! Connections are stored on both endpoints as insertion-ordered id lists.
//! Input port buffers are recomputed from their connected outputs every time
//! they are read, so fan-in falls out of the read rule: audio sources are
//! summed, MIDI sources are concatenated and stably sorted by timestamp.

use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{PortError, Result};
use crate::latency::{LatencyDirection, LatencyRange};
use crate::midi::MidiBuffer;
use crate::port::{Port, PortBuffer, PortFlags, PortId, PortKind};

/// A connection or disconnection recorded for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    pub a: String,
    pub b: String,
    pub connected: bool,
}

/// Topology notifications accumulated since the last drain.
#[derive(Debug, Default)]
pub struct TopologyChanges {
    pub ports_changed: bool,
    pub latency_changed: bool,
    pub connections: Vec<ConnectionChange>,
}

impl TopologyChanges {
    pub fn is_empty(&self) -> bool {
        !self.ports_changed && !self.latency_changed && self.connections.is_empty()
    }
}

/// Audio and MIDI port counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChanCount {
    pub audio: usize,
    pub midi: usize,
}

impl ChanCount {
    fn add(&mut self, kind: PortKind) {
        match kind {
            PortKind::Audio => self.audio += 1,
            PortKind::Midi => self.midi += 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct PortGraph {
    slots: Vec<Option<Port>>,
    by_name: HashMap<String, PortId>,
    frames: usize,
    generation: u64,
    changes: TopologyChanges,
}

impl PortGraph {
    /// Creates a graph without audio storage, used as the control-side
    /// topology authority.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(frames: usize) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    /// Creates a graph with the topology of `source` and its own buffers.
    pub fn mirror(source: &PortGraph, frames: usize) -> Self {
        let mut graph = Self::with_buffer_size(frames);
        graph.sync_topology_from(source);
        graph
    }

    pub fn buffer_size(&self) -> usize {
        self.frames
    }

    pub fn set_buffer_size(&mut self, frames: usize) {
        self.frames = frames;
        for port in self.slots.iter_mut().flatten() {
            port.buffer.resize(frames);
        }
    }

    /// Monotonic counter bumped on every topology change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn contains(&self, id: PortId) -> bool {
        self.port(id).is_ok()
    }

    fn port(&self, id: PortId) -> Result<&Port> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(PortError::UnknownPort(id))
    }

    fn port_mut(&mut self, id: PortId) -> Result<&mut Port> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(PortError::UnknownPort(id))
    }

    fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn add_port(&mut self, name: &str, kind: PortKind, flags: PortFlags) -> Result<PortId> {
        if name.is_empty() {
            return Err(PortError::InvalidName);
        }
        if self.by_name.contains_key(name) {
            warn!(port = name, "port already exists");
            return Err(PortError::NameCollision(name.to_string()));
        }
        let id = PortId(self.slots.len() as u32);
        self.slots
            .push(Some(Port::new(name.to_string(), kind, flags, self.frames)));
        self.by_name.insert(name.to_string(), id);
        self.changes.ports_changed = true;
        self.touch();
        Ok(id)
    }

    /// Disconnects every edge of `id` and removes it from the graph.
    pub fn unregister_port(&mut self, id: PortId) -> Result<()> {
        self.disconnect_all(id)?;
        let port = self
            .slots
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(PortError::UnknownPort(id))?;
        self.by_name.remove(&port.name);
        self.changes.ports_changed = true;
        self.touch();
        debug!(port = %port.name, "unregistered port");
        Ok(())
    }

    /// Removes every port matching `predicate`, returning how many went away.
    pub fn remove_ports_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&str, PortKind, PortFlags) -> bool,
    {
        let doomed: Vec<PortId> = self
            .iter()
            .filter(|(_, name, kind, flags)| predicate(name, *kind, *flags))
            .map(|(id, ..)| id)
            .collect();
        for id in &doomed {
            if let Err(err) = self.unregister_port(*id) {
                warn!(?err, "failed to remove port");
            }
        }
        doomed.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PortId, &str, PortKind, PortFlags)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.as_ref()
                .map(|port| (PortId(index as u32), port.name.as_str(), port.kind, port.flags))
        })
    }

    pub fn port_by_name(&self, name: &str) -> Option<PortId> {
        self.by_name.get(name).copied()
    }

    fn require(&self, name: &str) -> Result<PortId> {
        self.port_by_name(name)
            .ok_or_else(|| PortError::NoSuchPort(name.to_string()))
    }

    pub fn port_name(&self, id: PortId) -> Result<&str> {
        self.port(id).map(|port| port.name.as_str())
    }

    pub fn set_port_name(&mut self, id: PortId, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(PortError::InvalidName);
        }
        if let Some(existing) = self.port_by_name(name) {
            if existing == id {
                return Ok(());
            }
            return Err(PortError::NameCollision(name.to_string()));
        }
        let port = self.port_mut(id)?;
        let old = std::mem::replace(&mut port.name, name.to_string());
        self.by_name.remove(&old);
        self.by_name.insert(name.to_string(), id);
        self.changes.ports_changed = true;
        self.touch();
        Ok(())
    }

    pub fn port_kind(&self, id: PortId) -> Result<PortKind> {
        self.port(id).map(|port| port.kind)
    }

    pub fn port_flags(&self, id: PortId) -> Result<PortFlags> {
        self.port(id).map(|port| port.flags)
    }

    /// Names of ports of `kind` sharing at least one flag with `flags` (any
    /// flags when empty) whose name matches `pattern`. An empty or invalid
    /// pattern matches every name.
    pub fn ports(&self, pattern: &str, kind: PortKind, flags: PortFlags) -> Vec<String> {
        let regex = if pattern.is_empty() {
            None
        } else {
            match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(%err, pattern, "ignoring invalid port name pattern");
                    None
                }
            }
        };
        self.iter()
            .filter(|(_, name, port_kind, port_flags)| {
                *port_kind == kind
                    && (flags == PortFlags::empty() || port_flags.intersects(flags))
                    && regex.as_ref().map_or(true, |regex| regex.is_match(name))
            })
            .map(|(_, name, ..)| name.to_string())
            .collect()
    }

    pub fn connect(&mut self, src: PortId, dst: PortId) -> Result<()> {
        if src == dst {
            self.port(src)?;
            return Err(PortError::SelfConnect);
        }
        let a = self.port(src)?;
        let b = self.port(dst)?;
        if a.kind != b.kind {
            return Err(PortError::TypeMismatch);
        }
        if a.flags.is_output() && b.flags.is_output() {
            return Err(PortError::DirectionError("output"));
        }
        if a.flags.is_input() && b.flags.is_input() {
            return Err(PortError::DirectionError("input"));
        }
        if a.is_connected_to(dst) {
            return Err(PortError::AlreadyConnected);
        }
        let change = ConnectionChange {
            a: a.name.clone(),
            b: b.name.clone(),
            connected: true,
        };
        self.port_mut(src)?.connections.push(dst);
        self.port_mut(dst)?.connections.push(src);
        self.changes.connections.push(change);
        self.touch();
        Ok(())
    }

    pub fn connect_by_name(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = self.require(src)?;
        let dst = self.require(dst)?;
        self.connect(src, dst)
    }

    pub fn disconnect(&mut self, src: PortId, dst: PortId) -> Result<()> {
        let a = self.port(src)?;
        let b = self.port(dst)?;
        if !a.is_connected_to(dst) {
            return Err(PortError::NotConnected);
        }
        let change = ConnectionChange {
            a: a.name.clone(),
            b: b.name.clone(),
            connected: false,
        };
        self.port_mut(src)?.connections.retain(|peer| *peer != dst);
        self.port_mut(dst)?.connections.retain(|peer| *peer != src);
        self.changes.connections.push(change);
        self.touch();
        Ok(())
    }

    pub fn disconnect_by_name(&mut self, src: &str, dst: &str) -> Result<()> {
        let src = self.require(src)?;
        let dst = self.require(dst)?;
        self.disconnect(src, dst)
    }

    pub fn disconnect_all(&mut self, id: PortId) -> Result<()> {
        let peers = std::mem::take(&mut self.port_mut(id)?.connections);
        for peer in peers {
            if let Ok(port) = self.port_mut(peer) {
                port.connections.retain(|other| *other != id);
            }
            let change = ConnectionChange {
                a: self.port(id)?.name.clone(),
                b: self.port(peer).map(|p| p.name.clone()).unwrap_or_default(),
                connected: false,
            };
            self.changes.connections.push(change);
            self.touch();
        }
        Ok(())
    }

    pub fn is_connected(&self, id: PortId) -> Result<bool> {
        self.port(id).map(|port| !port.connections.is_empty())
    }

    pub fn connected_to(&self, a: PortId, b: PortId) -> bool {
        self.port(a).map_or(false, |port| port.is_connected_to(b))
    }

    pub fn physically_connected(&self, id: PortId) -> Result<bool> {
        let port = self.port(id)?;
        Ok(port.connections.iter().any(|peer| {
            self.port(*peer)
                .map_or(false, |peer| peer.flags.is_physical())
        }))
    }

    /// Peer handles in connection order.
    pub fn connection_ids(&self, id: PortId) -> Result<&[PortId]> {
        self.port(id).map(|port| port.connections.as_slice())
    }

    /// Peer names in connection order.
    pub fn connections(&self, id: PortId) -> Result<Vec<String>> {
        let port = self.port(id)?;
        Ok(port
            .connections
            .iter()
            .filter_map(|peer| self.port(*peer).ok().map(|peer| peer.name.clone()))
            .collect())
    }

    /// Physical ports that deliver data into the graph (device capture).
    pub fn physical_inputs(&self, kind: PortKind) -> Vec<String> {
        self.physical_where(kind, PortFlags::is_output)
    }

    /// Physical ports that take data out of the graph (device playback).
    pub fn physical_outputs(&self, kind: PortKind) -> Vec<String> {
        self.physical_where(kind, PortFlags::is_input)
    }

    fn physical_where(&self, kind: PortKind, direction: fn(PortFlags) -> bool) -> Vec<String> {
        self.iter()
            .filter(|(_, _, port_kind, flags)| {
                *port_kind == kind && flags.is_physical() && direction(*flags)
            })
            .map(|(_, name, ..)| name.to_string())
            .collect()
    }

    /// `(physical inputs, physical outputs)` counted per data type.
    pub fn physical_counts(&self) -> (ChanCount, ChanCount) {
        let mut inputs = ChanCount::default();
        let mut outputs = ChanCount::default();
        for (_, _, kind, flags) in self.iter() {
            if !flags.is_physical() {
                continue;
            }
            if flags.is_output() {
                inputs.add(kind);
            }
            if flags.is_input() {
                outputs.add(kind);
            }
        }
        (inputs, outputs)
    }

    pub fn set_latency_range(
        &mut self,
        id: PortId,
        for_playback: bool,
        range: LatencyRange,
    ) -> Result<()> {
        let port = self.port_mut(id)?;
        let direction = LatencyDirection::for_playback(for_playback);
        if port.latency(direction) != range {
            port.set_latency(direction, range);
            self.changes.latency_changed = true;
        }
        Ok(())
    }

    pub fn latency_range(&self, id: PortId, for_playback: bool) -> Result<LatencyRange> {
        self.port(id)
            .map(|port| port.latency(LatencyDirection::for_playback(for_playback)))
    }

    /// Flags a latency change without touching any port, e.g. after a slave
    /// device re-measured its latency.
    pub fn mark_latency_changed(&mut self) {
        self.changes.latency_changed = true;
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Drains pending notifications.
    pub fn take_changes(&mut self) -> TopologyChanges {
        std::mem::take(&mut self.changes)
    }

    /// Returns the port buffer for this cycle. Input ports are recomputed from
    /// their connections on every call.
    pub fn get_buffer(&mut self, id: PortId, n_frames: usize) -> Result<&PortBuffer> {
        self.refresh_input(id, n_frames)?;
        self.port(id).map(|port| &port.buffer)
    }

    pub fn audio_buffer(&mut self, id: PortId, n_frames: usize) -> Result<&[f32]> {
        self.refresh_input(id, n_frames)?;
        match &self.port(id)?.buffer {
            PortBuffer::Audio(samples) => Ok(&samples[..n_frames.min(samples.len())]),
            PortBuffer::Midi(_) => Err(PortError::NotAudio(id)),
        }
    }

    /// Raw backing store of an audio port, written by whoever owns the port
    /// this cycle.
    pub fn audio_buffer_mut(&mut self, id: PortId, n_frames: usize) -> Result<&mut [f32]> {
        match &mut self.port_mut(id)?.buffer {
            PortBuffer::Audio(samples) => {
                let frames = n_frames.min(samples.len());
                Ok(&mut samples[..frames])
            }
            PortBuffer::Midi(_) => Err(PortError::NotAudio(id)),
        }
    }

    /// Copies the cycle data of `from` into the audio buffer of `to`.
    pub fn copy_audio(&mut self, from: PortId, to: PortId, n_frames: usize) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.refresh_input(from, n_frames)?;
        let target = self.port_mut(to)?;
        let mut buffer = std::mem::replace(&mut target.buffer, PortBuffer::Audio(Vec::new()));
        let result = match (&mut buffer, &self.port(from)?.buffer) {
            (PortBuffer::Audio(dst), source @ PortBuffer::Audio(_)) => {
                let frames = n_frames.min(dst.len());
                copy_audio(&mut dst[..frames], source);
                Ok(())
            }
            (PortBuffer::Audio(_), PortBuffer::Midi(_)) => Err(PortError::NotAudio(from)),
            (PortBuffer::Midi(_), _) => Err(PortError::NotAudio(to)),
        };
        self.port_mut(to)?.buffer = buffer;
        result
    }

    pub fn midi_buffer(&mut self, id: PortId) -> Result<&MidiBuffer> {
        self.refresh_input(id, 0)?;
        match &self.port(id)?.buffer {
            PortBuffer::Midi(events) => Ok(events),
            PortBuffer::Audio(_) => Err(PortError::NotMidi(id)),
        }
    }

    pub fn midi_buffer_mut(&mut self, id: PortId) -> Result<&mut MidiBuffer> {
        match &mut self.port_mut(id)?.buffer {
            PortBuffer::Midi(events) => Ok(events),
            PortBuffer::Audio(_) => Err(PortError::NotMidi(id)),
        }
    }

    /// Zeroes the backing store of every output port whose physical flag
    /// equals `physical`: silence for audio, no events for MIDI.
    pub fn silence_outputs(&mut self, n_frames: usize, physical: bool) {
        for port in self.slots.iter_mut().flatten() {
            if !port.flags.is_output() || port.flags.is_physical() != physical {
                continue;
            }
            match &mut port.buffer {
                PortBuffer::Audio(samples) => {
                    let frames = n_frames.min(samples.len());
                    samples[..frames].fill(0.0);
                }
                PortBuffer::Midi(events) => events.clear(),
            }
        }
    }

    fn refresh_input(&mut self, id: PortId, n_frames: usize) -> Result<()> {
        let port = self.port_mut(id)?;
        if !port.flags.is_input() {
            return Ok(());
        }
        // Both takes are allocation free; the port cannot be its own source.
        let mut buffer = std::mem::replace(&mut port.buffer, PortBuffer::Audio(Vec::new()));
        let connections = std::mem::take(&mut port.connections);

        let mut sources = connections
            .iter()
            .filter_map(|peer| self.slots.get(peer.index()).and_then(Option::as_ref));
        match &mut buffer {
            PortBuffer::Audio(dst) => {
                let frames = n_frames.min(dst.len());
                let dst = &mut dst[..frames];
                match sources.next() {
                    None => dst.fill(0.0),
                    Some(first) => {
                        copy_audio(dst, &first.buffer);
                        for source in sources {
                            mix_audio(dst, &source.buffer);
                        }
                    }
                }
            }
            PortBuffer::Midi(dst) => {
                dst.clear();
                for source in sources {
                    if let PortBuffer::Midi(events) = &source.buffer {
                        dst.extend_from(events);
                    }
                }
                dst.sort();
            }
        }

        let port = self.port_mut(id)?;
        port.buffer = buffer;
        port.connections = connections;
        Ok(())
    }

    /// Copies ports, flags, connections and latencies from `source`, keeping
    /// existing buffers for ports that survived.
    pub fn sync_topology_from(&mut self, source: &PortGraph) {
        if self.generation == source.generation && self.slots.len() == source.slots.len() {
            return;
        }
        let frames = self.frames;
        self.slots.truncate(source.slots.len());
        self.slots.resize_with(source.slots.len(), || None);
        for (mine, theirs) in self.slots.iter_mut().zip(source.slots.iter()) {
            match (mine.as_mut(), theirs) {
                (_, None) => *mine = None,
                (Some(port), Some(other)) if port.kind == other.kind => {
                    port.name.clone_from(&other.name);
                    port.flags = other.flags;
                    port.connections.clone_from(&other.connections);
                    port.capture_latency = other.capture_latency;
                    port.playback_latency = other.playback_latency;
                }
                (_, Some(other)) => {
                    let mut port = Port::new(other.name.clone(), other.kind, other.flags, frames);
                    port.connections.clone_from(&other.connections);
                    port.capture_latency = other.capture_latency;
                    port.playback_latency = other.playback_latency;
                    *mine = Some(port);
                }
            }
        }
        self.by_name.clone_from(&source.by_name);
        self.generation = source.generation;
    }
}

fn copy_audio(dst: &mut [f32], source: &PortBuffer) {
    match source {
        PortBuffer::Audio(src) => {
            let frames = dst.len().min(src.len());
            dst[..frames].copy_from_slice(&src[..frames]);
            dst[frames..].fill(0.0);
        }
        PortBuffer::Midi(_) => dst.fill(0.0),
    }
}

fn mix_audio(dst: &mut [f32], source: &PortBuffer) {
    if let PortBuffer::Audio(src) = source {
        for (out, sample) in dst.iter_mut().zip(src.iter()) {
            *out += *sample;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output() -> PortFlags {
        PortFlags::OUTPUT
    }

    fn input() -> PortFlags {
        PortFlags::INPUT
    }

    #[test]
    fn removed_slots_are_not_reused() {
        let mut graph = PortGraph::with_buffer_size(4);
        let a = graph.add_port("a", PortKind::Audio, output()).unwrap();
        graph.unregister_port(a).unwrap();
        let b = graph.add_port("a", PortKind::Audio, output()).unwrap();
        assert_ne!(a, b);
        assert_eq!(graph.port_name(a), Err(PortError::UnknownPort(a)));
    }

    #[test]
    fn unregister_disconnects_peers() {
        let mut graph = PortGraph::with_buffer_size(4);
        let src = graph.add_port("src", PortKind::Audio, output()).unwrap();
        let dst = graph.add_port("dst", PortKind::Audio, input()).unwrap();
        graph.connect(src, dst).unwrap();
        graph.take_changes();
        graph.unregister_port(src).unwrap();
        assert!(!graph.is_connected(dst).unwrap());
        let changes = graph.take_changes();
        assert!(changes.ports_changed);
        assert_eq!(
            changes.connections,
            vec![ConnectionChange {
                a: "src".into(),
                b: "dst".into(),
                connected: false
            }]
        );
    }

    #[test]
    fn unconnected_input_reads_silence() {
        let mut graph = PortGraph::with_buffer_size(8);
        let dst = graph.add_port("dst", PortKind::Audio, input()).unwrap();
        graph.audio_buffer_mut(dst, 8).unwrap().fill(1.0);
        assert!(graph.audio_buffer(dst, 8).unwrap().iter().all(|s| *s == 0.0));
    }

    #[test]
    fn rename_keeps_connections() {
        let mut graph = PortGraph::new();
        let src = graph.add_port("src", PortKind::Midi, output()).unwrap();
        let dst = graph.add_port("dst", PortKind::Midi, input()).unwrap();
        graph.connect(src, dst).unwrap();
        graph.set_port_name(src, "renamed").unwrap();
        assert_eq!(graph.port_by_name("renamed"), Some(src));
        assert_eq!(graph.port_by_name("src"), None);
        assert_eq!(graph.connections(dst).unwrap(), vec!["renamed".to_string()]);
    }

    #[test]
    fn port_listing_filters_by_pattern_kind_and_flags() {
        let mut graph = PortGraph::new();
        let physical = PortFlags::PHYSICAL | PortFlags::TERMINAL;
        graph
            .add_port("system:capture_1", PortKind::Audio, output() | physical)
            .unwrap();
        graph
            .add_port("system:playback_1", PortKind::Audio, input() | physical)
            .unwrap();
        graph
            .add_port("system:midi_capture_1", PortKind::Midi, output() | physical)
            .unwrap();
        graph.add_port("app:in", PortKind::Audio, input()).unwrap();

        let capture = graph.ports("^system:capture", PortKind::Audio, PortFlags::empty());
        assert_eq!(capture, vec!["system:capture_1".to_string()]);
        let inputs = graph.ports("", PortKind::Audio, PortFlags::INPUT);
        assert_eq!(inputs.len(), 2);
        assert_eq!(graph.physical_inputs(PortKind::Midi).len(), 1);
        let (ins, outs) = graph.physical_counts();
        assert_eq!(ins, ChanCount { audio: 1, midi: 1 });
        assert_eq!(outs, ChanCount { audio: 1, midi: 0 });
    }

    #[test]
    fn mirror_keeps_buffers_and_tracks_topology() {
        let mut control = PortGraph::new();
        let src = control.add_port("src", PortKind::Audio, output()).unwrap();
        let dst = control.add_port("dst", PortKind::Audio, input()).unwrap();

        let mut mirror = PortGraph::mirror(&control, 4);
        mirror.audio_buffer_mut(src, 4).unwrap().fill(0.5);
        assert!(mirror.audio_buffer(dst, 4).unwrap().iter().all(|s| *s == 0.0));

        control.connect(src, dst).unwrap();
        mirror.sync_topology_from(&control);
        assert_eq!(mirror.generation(), control.generation());
        assert_eq!(mirror.audio_buffer(dst, 4).unwrap(), &[0.5; 4]);

        control.unregister_port(src).unwrap();
        mirror.sync_topology_from(&control);
        assert!(!mirror.contains(src));
        assert!(mirror.audio_buffer(dst, 4).unwrap().iter().all(|s| *s == 0.0));
    }

    #[test]
    fn latency_change_is_reported_once() {
        let mut graph = PortGraph::new();
        let port = graph.add_port("p", PortKind::Audio, output()).unwrap();
        graph.take_changes();
        graph
            .set_latency_range(port, false, LatencyRange::fixed(32))
            .unwrap();
        graph
            .set_latency_range(port, false, LatencyRange::fixed(32))
            .unwrap();
        assert!(graph.take_changes().latency_changed);
        assert!(!graph.has_pending_changes());
        assert_eq!(graph.latency_range(port, true).unwrap(), LatencyRange::ZERO);
    }
}
