//! Media references handed to the pipeline.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque caller data carried alongside a URI.
pub type MediaPayload = Arc<dyn Any + Send + Sync>;

/// A playable item: a URI plus an optional caller payload.
///
/// Cloning is cheap; the payload is shared, never copied.
#[derive(Clone, Default)]
pub struct Media {
    uri: String,
    payload: Option<MediaPayload>,
}

impl Media {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            payload: None,
        }
    }

    pub fn with_payload(uri: impl Into<String>, payload: MediaPayload) -> Self {
        Self {
            uri: uri.into(),
            payload: Some(payload),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn payload(&self) -> Option<&MediaPayload> {
        self.payload.as_ref()
    }

    /// Downcast the payload to a concrete type.
    pub fn payload_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    /// A media is valid iff its URI is non-empty.
    pub fn is_valid(&self) -> bool {
        !self.uri.is_empty()
    }
}

impl PartialEq for Media {
    fn eq(&self, other: &Self) -> bool {
        let same_payload = match (&self.payload, &other.payload) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.uri == other.uri && same_payload
    }
}

impl fmt::Debug for Media {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Media")
            .field("uri", &self.uri)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_uri_is_invalid() {
        assert!(!Media::new("").is_valid());
        assert!(!Media::default().is_valid());
        assert!(Media::new("file:///tmp/a.flac").is_valid());
    }

    #[test]
    fn payload_downcasts_to_original_type() {
        let media = Media::with_payload("a.flac", Arc::new(42u32));
        assert_eq!(media.payload_as::<u32>(), Some(&42));
        assert!(media.payload_as::<String>().is_none());
    }

    #[test]
    fn equality_uses_payload_identity() {
        let payload: MediaPayload = Arc::new("x".to_string());
        let a = Media::with_payload("a.flac", payload.clone());
        let b = Media::with_payload("a.flac", payload);
        let c = Media::with_payload("a.flac", Arc::new("x".to_string()));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Media::new("a.flac"));
    }
}
