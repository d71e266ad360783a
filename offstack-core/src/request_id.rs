//! Request ID generation

use base64::{engine::general_purpose, Engine};
use uuid::Uuid;

/// Gateway request ID pair
#[derive(Debug, Clone)]
pub struct RequestId {
    /// Primary request ID (`requestId`, `awsRequestId`)
    pub id: String,
    /// Extended request ID (`extendedRequestId`), base64 encoded
    pub extended_id: String,
}

impl RequestId {
    /// Generate a new request ID pair
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        let extended_id = general_purpose::STANDARD.encode(Uuid::new_v4().as_bytes());

        Self { id, extended_id }
    }

    /// Create a request ID with a specific value (for testing)
    pub fn with_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let extended_id = general_purpose::STANDARD.encode(id.as_bytes());
        Self { id, extended_id }
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Random alphanumeric-ish id used for ids like `resourceId` or `messageId`
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_generation() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();

        // IDs should be unique
        assert_ne!(id1.id, id2.id);
        assert_ne!(id1.extended_id, id2.extended_id);

        assert!(Uuid::parse_str(&id1.id).is_ok());
    }

    #[test]
    fn test_request_id_with_id() {
        let id = RequestId::with_id("test-id-123");
        assert_eq!(id.id, "test-id-123");
        assert_eq!(id.extended_id, "dGVzdC1pZC0xMjM=");
    }

    #[test]
    fn test_short_id_length() {
        assert_eq!(short_id().len(), 10);
    }
}
