//! Shared key namespace

/// Sorted set of users waiting for a peer, scored by join time
pub const USER_WAIT_LIST: &str = "rc:userwait";

const CHANNEL_PREFIX: &str = "rc:chan";
const CHANNEL_USERS_PREFIX: &str = "rc:chanusers";
const ONLINE_USERS_PREFIX: &str = "rc:onlineusers";
const USER_PREFIX: &str = "rc:user";
const MESSAGES_PREFIX: &str = "rc:msgs";
const SEEN_MESSAGES_PREFIX: &str = "rc:seenmsgs";
const FORWARD_PREFIX: &str = "rc:forward";
const RATE_LIMIT_PREFIX: &str = "rc:ratelimit";
const MUTEX_PREFIX: &str = "mutex:";

fn join(prefix: &str, id: u64) -> String {
    format!("{}:{}", prefix, id)
}

/// Channel existence marker
pub fn channel(channel_id: u64) -> String {
    join(CHANNEL_PREFIX, channel_id)
}

/// Hash of channel members (`user_id -> 1`)
pub fn channel_users(channel_id: u64) -> String {
    join(CHANNEL_USERS_PREFIX, channel_id)
}

/// Field that keeps the members hash of an existing empty channel present;
/// never a user id
pub const EMPTY_CHANNEL_FIELD: &str = "_";

/// Hash of users currently connected to a channel
pub fn online_users(channel_id: u64) -> String {
    join(ONLINE_USERS_PREFIX, channel_id)
}

/// JSON-encoded user record
pub fn user(user_id: u64) -> String {
    join(USER_PREFIX, user_id)
}

/// List of encoded messages of a channel, oldest first
pub fn messages(channel_id: u64) -> String {
    join(MESSAGES_PREFIX, channel_id)
}

/// Hash of message seen flags (`message_id -> 0|1`)
pub fn seen_messages(channel_id: u64) -> String {
    join(SEEN_MESSAGES_PREFIX, channel_id)
}

/// Hash of forwarding subscriptions (`user_id -> subscriber topic`)
pub fn forward(channel_id: u64) -> String {
    join(FORWARD_PREFIX, channel_id)
}

/// Mutex guarding the cache fill of `key`
pub fn mutex(key: &str) -> String {
    format!("{}{}", MUTEX_PREFIX, key)
}

/// Token bucket keys for `key`, hash-tagged so both land in one cluster slot
pub fn rate_limit(key: &str) -> (String, String) {
    let tagged = format!("{{{}:{}}}", RATE_LIMIT_PREFIX, key);
    (format!("{}:tokens", tagged), format!("{}:ts", tagged))
}
