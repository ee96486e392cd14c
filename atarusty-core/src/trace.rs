/*
    Copyright (C) 2020  Rafal Michalski

    This file is part of ATARUSTY, a Rust library for building emulators.

    For the full copyright notice, see the lib.rs file.
*/
//! Time-ranged trace channels.
//!
//! A [TraceCollection] is made of named groups, each holding a number of channels. A channel
//! records colored events that span a range of machine cycles.
use core::cell::RefCell;
use core::fmt;
use std::rc::Rc;

use crate::clock::Ticks;

/// A trace collection shared between its producers and a viewer.
pub type SharedTrace = Rc<RefCell<TraceCollection>>;

/// Identifies a channel within a [TraceCollection].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId {
    group: u32,
    channel: u32,
}

/// A single traced event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceEvent {
    pub start: Ticks,
    pub end: Ticks,
    pub label: String,
    /// 0xRRGGBB
    pub color: u32,
}

#[derive(Clone, Debug, Default)]
pub struct TraceChannel {
    pub name: String,
    pub events: Vec<TraceEvent>,
}

#[derive(Clone, Debug, Default)]
pub struct TraceGroup {
    pub name: String,
    pub channels: Vec<TraceChannel>,
}

#[derive(Clone, Debug, Default)]
pub struct TraceCollection {
    groups: Vec<TraceGroup>,
}

impl TraceCollection {
    pub fn new() -> Self {
        TraceCollection::default()
    }

    pub fn new_shared() -> SharedTrace {
        Rc::new(RefCell::new(TraceCollection::new()))
    }
    /// Adds a group and returns its index.
    pub fn add_group<S: Into<String>>(&mut self, name: S) -> u32 {
        self.groups.push(TraceGroup { name: name.into(), channels: Vec::new() });
        (self.groups.len() - 1) as u32
    }
    /// Adds a channel to the group created by [TraceCollection::add_group].
    pub fn add_channel<S: Into<String>>(&mut self, group: u32, name: S) -> Option<ChannelId> {
        let g = self.groups.get_mut(group as usize)?;
        g.channels.push(TraceChannel { name: name.into(), events: Vec::new() });
        Some(ChannelId { group, channel: (g.channels.len() - 1) as u32 })
    }

    pub fn add_event<S: Into<String>>(&mut self, id: ChannelId, start: Ticks, end: Ticks, label: S, color: u32) {
        if let Some(ch) = self.channel_mut(id) {
            ch.events.push(TraceEvent { start, end: end.max(start), label: label.into(), color });
        }
    }

    pub fn channel(&self, id: ChannelId) -> Option<&TraceChannel> {
        self.groups.get(id.group as usize)?.channels.get(id.channel as usize)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut TraceChannel> {
        self.groups.get_mut(id.group as usize)?.channels.get_mut(id.channel as usize)
    }

    pub fn find_channel(&self, group: &str, channel: &str) -> Option<ChannelId> {
        self.groups.iter().enumerate()
            .find(|(_, g)| g.name == group)
            .and_then(|(gi, g)| g.channels.iter().position(|c| c.name == channel)
                .map(|ci| ChannelId { group: gi as u32, channel: ci as u32 }))
    }

    pub fn groups(&self) -> &[TraceGroup] {
        &self.groups
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}] {}", self.start, self.end, self.label)
    }
}
