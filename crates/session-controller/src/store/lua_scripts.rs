//! Lua scripts for versioned Redis writes.
//!
//! Each aggregate lives in a HASH with two fields:
//! - `version`: monotonically increasing write counter (starts at 1)
//! - `data`: the JSON document
//!
//! Redis executes a script atomically, so checking every precondition and
//! then writing every key inside one script gives all-or-nothing batches.

/// Conditional multi-key write.
///
/// Arguments:
/// - KEYS[1..N]: Aggregate keys (e.g., `channel:{id}`)
/// - ARGV[2i-1]: Expected version for KEYS[i] (`0` = key must be absent)
/// - ARGV[2i]: JSON document for KEYS[i]
///
/// Returns:
/// - 0: Success (all keys written)
/// - i > 0: Precondition failed on KEYS[i], nothing written
/// - -1: Error (malformed arguments)
pub const CONDITIONAL_COMMIT: &str = r#"
if #ARGV ~= 2 * #KEYS then
    return -1
end

-- Check every precondition before touching anything
for i, key in ipairs(KEYS) do
    local expected = tonumber(ARGV[2 * i - 1])
    if expected == nil then
        return -1
    end

    local raw = redis.call('HGET', key, 'version')
    local current = 0
    if raw then
        current = tonumber(raw) or -1
    end

    if current ~= expected then
        return i
    end
end

for i, key in ipairs(KEYS) do
    local expected = tonumber(ARGV[2 * i - 1])
    redis.call('HSET', key, 'version', expected + 1, 'data', ARGV[2 * i])
end

return 0
"#;

/// Read version and document in one round trip.
///
/// Arguments:
/// - KEYS[1]: Aggregate key
///
/// Returns:
/// - `{version, data}` or an empty array when the key is absent
pub const READ_VERSIONED: &str = r#"
local fields = redis.call('HMGET', KEYS[1], 'version', 'data')
if not fields[1] or not fields[2] then
    return {}
end
return {fields[1], fields[2]}
"#;
