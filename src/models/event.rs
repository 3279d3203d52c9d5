/// Where an inbound event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Direct,
    Group,
    Channel,
}

/// A platform update normalized for the command layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message {
        kind: ChatKind,
        chat_id: i64,
        name: String,
        text: String,
    },
    Callback {
        chat_id: i64,
        from: String,
        data: String,
    },
}

impl InboundEvent {
    pub fn chat_id(&self) -> i64 {
        match self {
            Self::Message { chat_id, .. } | Self::Callback { chat_id, .. } => *chat_id,
        }
    }

    pub fn sender_name(&self) -> &str {
        match self {
            Self::Message { name, .. } => name,
            Self::Callback { from, .. } => from,
        }
    }

    /// Command text or callback payload, trimmed.
    pub fn body(&self) -> &str {
        match self {
            Self::Message { text, .. } => text.trim(),
            Self::Callback { data, .. } => data.trim(),
        }
    }
}
