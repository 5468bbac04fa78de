//! Server-side Lua procedures
//!
//! Each script runs as one atomic step on the store. The in-memory adapter
//! reproduces the same semantics under a single lock.

/// Pop the earliest waiting user, or enqueue the caller.
///
/// KEYS[1] = wait list, ARGV[1] = score, ARGV[2] = member.
/// Returns the popped member, or `""` when the caller was enqueued or was
/// already waiting.
pub const ZPOP_MIN_OR_ADD_ONE: &str = r#"
local key = KEYS[1]
local score = ARGV[1]
local member = ARGV[2]

if redis.call("ZSCORE", key, member) then
  return ""
end

local popped = redis.call("ZPOPMIN", key)
if popped[1] then
  return popped[1]
end

redis.call("ZADD", key, score, member)
return ""
"#;

/// Read a hash field, telling a missing hash apart from a missing field.
///
/// KEYS[1] = hash, ARGV[1] = field.
/// Returns `-1` if the hash does not exist, `0` if the field is absent,
/// otherwise the field value.
pub const HGET_IF_KEY_EXISTS: &str = r#"
local key = KEYS[1]
local field = ARGV[1]

if redis.call("EXISTS", key) == 0 then
  return -1
end

local value = redis.call("HGET", key, field)
if not value then
  return 0
end
return value
"#;

/// Release a lock only if it is still held by the caller.
///
/// KEYS[1] = lock key, ARGV[1] = owner token. Returns 1 when released.
pub const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Token bucket refill and take.
///
/// KEYS[1] = tokens key, KEYS[2] = timestamp key.
/// ARGV = rate (tokens/sec), capacity, now (unix secs), requested, ttl (secs).
/// Returns `{allowed (0|1), remaining tokens}`.
pub const TOKEN_BUCKET: &str = r#"
local tokens_key = KEYS[1]
local timestamp_key = KEYS[2]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local ttl = math.floor(tonumber(ARGV[5]))

local last_tokens = tonumber(redis.call("GET", tokens_key))
if last_tokens == nil then
  last_tokens = capacity
end

local last_refreshed = tonumber(redis.call("GET", timestamp_key))
if last_refreshed == nil then
  last_refreshed = 0
end

local delta = math.max(0, now - last_refreshed)
local filled = math.min(capacity, last_tokens + (delta * rate))
local allowed = 0
local remaining = filled
if filled >= requested then
  allowed = 1
  remaining = filled - requested
end

redis.call("SETEX", tokens_key, ttl, remaining)
redis.call("SETEX", timestamp_key, ttl, now)
return { allowed, math.floor(remaining) }
"#;
