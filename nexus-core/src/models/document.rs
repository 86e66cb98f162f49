use serde::{Deserialize, Serialize};

/// A normalized input payload, as produced by the input normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64 (standard alphabet) encoded bytes.
        data: String,
    },
}

impl Document {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Size of the payload as sent over the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Text { text } => text.len(),
            Self::Image { data, .. } => data.len(),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Text { text } => text.trim().is_empty(),
            Self::Image { data, .. } => data.is_empty(),
        }
    }
}
