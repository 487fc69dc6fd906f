//! Lua scripts executed atomically by Redis-compatible servers.
//!
//! The job-record layout they decode (`delay`, `retry`, `ttr`, `done`) is the
//! JSON written by the delay queue.

/// KEYS[1] lock key, ARGV[1] expected value. Returns 1 if deleted, else 0.
pub const LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// KEYS[1] lock key, ARGV[1] expected value, ARGV[2] TTL in milliseconds.
/// Returns 1 if the TTL was reset, else 0.
pub const LOCK_REFRESH: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Per job i (1-based): KEYS[2i-1] pool key, KEYS[2i] index key,
/// ARGV[3i-2] record, ARGV[3i-1] score, ARGV[3i] member (the pool key).
pub const SCHEDULE_JOBS: &str = r#"
for i = 1, #KEYS / 2 do
    redis.call('SET', KEYS[i*2-1], ARGV[i*3-2])
    redis.call('ZADD', KEYS[i*2], ARGV[i*3-1], ARGV[i*3])
end
return 1
"#;

/// Per job i (1-based): KEYS[2i-1] index key, KEYS[2i] dead-letter key,
/// ARGV[i] pool key.
pub const UNSCHEDULE_JOBS: &str = r#"
for i = 1, #ARGV do
    redis.call('ZREM', KEYS[i*2-1], ARGV[i])
    redis.call('SREM', KEYS[i*2], ARGV[i])
    redis.call('DEL', ARGV[i])
end
return 1
"#;

/// KEYS[1] index key, KEYS[2] ready list, KEYS[3] dead-letter set,
/// ARGV[1] now (unix seconds). Returns the number of promoted or
/// dead-lettered entries.
pub const PROMOTE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local handled = 0
for _, member in ipairs(due) do
    local raw = redis.call('GET', member)
    if raw then
        local job = cjson.decode(raw)
        if job.done > job.retry then
            redis.call('SADD', KEYS[3], member)
            redis.call('ZREM', KEYS[1], member)
        else
            job.done = job.done + 1
            redis.call('ZADD', KEYS[1], job.delay + job.ttr * job.done, member)
            redis.call('SET', member, cjson.encode(job))
            redis.call('LPUSH', KEYS[2], member)
        end
        handled = handled + 1
    else
        redis.call('ZREM', KEYS[1], member)
    end
end
return handled
"#;
