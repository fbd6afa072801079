//! Channel plugins: the seam between transports (WebSocket today) and
//! message handling. An open set, so a capability interface rather than an
//! enum.

use tracing::info;

pub trait ChannelPlugin: Send + Sync {
    fn id(&self) -> &'static str;

    fn init(&self) {}

    /// Handle an inbound message for a session; the returned text, if any,
    /// is sent back over the transport that delivered the message.
    fn on_message(&self, session_id: &str, text: &str) -> Option<String>;

    fn shutdown(&self) {}
}

/// The built-in web chat channel. Replies echo the inbound text so a
/// browser client sees its own message confirmed end-to-end.
pub struct WebchatChannel;

impl ChannelPlugin for WebchatChannel {
    fn id(&self) -> &'static str {
        "webchat"
    }

    fn init(&self) {
        info!("web chat channel initialized");
    }

    fn on_message(&self, session_id: &str, text: &str) -> Option<String> {
        tracing::debug!(session_id = %session_id, len = text.len(), "webchat message");
        Some(text.to_string())
    }

    fn shutdown(&self) {
        info!("web chat channel shut down");
    }
}

#[derive(Default)]
pub struct ChannelSet {
    channels: Vec<Box<dyn ChannelPlugin>>,
}

impl ChannelSet {
    pub fn new() -> ChannelSet {
        ChannelSet { channels: Vec::new() }
    }

    pub fn register(&mut self, channel: Box<dyn ChannelPlugin>) {
        channel.init();
        self.channels.push(channel);
    }

    pub fn find(&self, id: &str) -> Option<&dyn ChannelPlugin> {
        self.channels
            .iter()
            .find(|c| c.id() == id)
            .map(|c| c.as_ref())
    }

    pub fn shutdown(&self) {
        for channel in &self.channels {
            channel.shutdown();
        }
    }
}
