//! Bus topic names

/// Match results, consumed by every gateway node
pub const MATCH_TOPIC: &str = "rc:match:pubsub";

/// Chat messages, consumed by every gateway node (broadcast mode) or by the
/// forwarder (selective mode)
pub const MESSAGE_TOPIC: &str = "rc:msg:pubsub";

const MESSAGE_SUBSCRIBER_PREFIX: &str = "rc:msg:sub";

/// Per-node topic that receives only messages for channels with a session
/// on that node
pub fn node_subscriber(node_id: &str) -> String {
    format!("{}:{}", MESSAGE_SUBSCRIBER_PREFIX, node_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_subscriber_topic() {
        assert_eq!(node_subscriber("gw-1"), "rc:msg:sub:gw-1");
        assert_ne!(node_subscriber("gw-1"), MESSAGE_TOPIC);
    }
}
