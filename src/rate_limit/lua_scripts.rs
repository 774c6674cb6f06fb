/// Lua script for sliding-log rate limiting in Redis
///
/// Runs as a single script so no other process can interleave between the
/// trim, the insert and the count.
///
/// KEYS[1] = the rate limit key (a sorted set)
/// ARGV[1] = current timestamp (milliseconds)
/// ARGV[2] = window duration (milliseconds)
/// ARGV[3] = exclusive lower score bound, e.g. "(1700000000000"
/// ARGV[4] = unique member for this request
///
/// Returns: number of requests in the window, including this one
pub const SLIDING_LOG_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

-- Drop entries older than the window
redis.call('ZREMRANGEBYSCORE', key, '-inf', ARGV[3])

-- Record this request
redis.call('ZADD', key, now, ARGV[4])

local count = redis.call('ZCARD', key)

-- Abandoned keys clean themselves up
redis.call('PEXPIRE', key, window)

return count
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_is_valid() {
        let trim = SLIDING_LOG_SCRIPT.find("ZREMRANGEBYSCORE").unwrap();
        let add = SLIDING_LOG_SCRIPT.find("ZADD").unwrap();
        let count = SLIDING_LOG_SCRIPT.find("ZCARD").unwrap();
        let expire = SLIDING_LOG_SCRIPT.find("PEXPIRE").unwrap();

        assert!(trim < add && add < count && count < expire);
    }
}
