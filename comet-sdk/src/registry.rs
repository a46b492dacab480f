//! Channels currently subscribed, in wire order.

use crate::error::Error;
use crate::event::{Event, Listener};

#[derive(Debug)]
pub struct Channel {
    pub name: String,
    /// The stream is currently flowing for this channel.
    pub connected: bool,
    /// The channel has connected at least once, so the next connect is
    /// announced as a reconnect.
    pub subscribed: bool,
    pub listener: Listener,
}

/// Result of [`ChannelRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Present but has not seen a successful poll yet.
    Pending,
    /// Present and connected; nothing to do.
    AlreadyListening,
}

/// Lifecycle notice broadcast across every registered channel.
#[derive(Debug, Clone)]
pub enum Notice {
    /// Announce channels that are not connected yet, as connect or
    /// reconnect depending on whether they ever connected.
    Connect,
    /// Announce channels that are connected as reconnected.
    Reconnect,
    /// Announce connected channels as disconnected and clear the flag.
    Disconnect,
    Error(Error),
}

/// Ordered name → channel map. Order is insertion order and is the order
/// used for the channel list on the wire.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, listener: Listener) -> AddOutcome {
        match self.get(name) {
            Some(ch) if ch.connected => AddOutcome::AlreadyListening,
            Some(_) => AddOutcome::Pending,
            None => {
                self.channels.push(Channel {
                    name: name.to_string(),
                    connected: false,
                    subscribed: false,
                    listener,
                });
                AddOutcome::Added
            }
        }
    }

    /// Returns the names that were actually present.
    pub fn remove<S: AsRef<str>>(&mut self, names: &[S]) -> Vec<String> {
        let mut removed = Vec::new();
        for name in names {
            let name = name.as_ref();
            if let Some(idx) = self.channels.iter().position(|c| c.name == name) {
                removed.push(self.channels.remove(idx).name);
            }
        }
        removed
    }

    pub fn remove_all(&mut self) -> Vec<String> {
        self.channels.drain(..).map(|c| c.name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn first(&self) -> Option<&Channel> {
        self.channels.first()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Comma-joined names, or `None` if a name could not survive the
    /// round trip through the server's comma-separated reply.
    pub fn channel_list(&self) -> Option<String> {
        if self
            .channels
            .iter()
            .any(|c| c.name.is_empty() || c.name.contains(','))
        {
            return None;
        }
        Some(
            self.channels
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Broadcast a lifecycle notice. Returns how many channels were told.
    pub fn invoke_on_all(&mut self, notice: &Notice, timetoken: &str) -> usize {
        let mut told = 0;
        for ch in &mut self.channels {
            let event = match notice {
                Notice::Connect if !ch.connected => {
                    let event = if ch.subscribed {
                        Event::Reconnected {
                            channel: ch.name.clone(),
                            timetoken: timetoken.to_string(),
                        }
                    } else {
                        Event::Connected {
                            channel: ch.name.clone(),
                            timetoken: timetoken.to_string(),
                        }
                    };
                    ch.connected = true;
                    ch.subscribed = true;
                    event
                }
                Notice::Reconnect if ch.connected => Event::Reconnected {
                    channel: ch.name.clone(),
                    timetoken: timetoken.to_string(),
                },
                Notice::Disconnect if ch.connected => {
                    ch.connected = false;
                    Event::Disconnected {
                        channel: ch.name.clone(),
                        timetoken: timetoken.to_string(),
                    }
                }
                Notice::Error(error) => Event::Error {
                    channel: ch.name.clone(),
                    error: error.clone(),
                },
                _ => continue,
            };
            ch.listener.emit(event);
            told += 1;
        }
        told
    }

    /// Per-channel delivery. `None` means the channel is not registered,
    /// which the caller treats as an internal inconsistency.
    pub fn deliver(&self, name: &str, event: Event) -> Option<()> {
        let ch = self.get(name)?;
        ch.listener.emit(event);
        Some(())
    }
}
