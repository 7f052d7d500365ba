use crate::cluster::slot::slot_of;
use crate::cluster::{StepError, StepErrorKind};
use crate::net::codec::RespRequest;
use hashbrown::HashSet;
use lazy_static::lazy_static;

lazy_static! {
    /// Everything the router knows how to route.
    static ref SUPPORTED_CMD: HashSet<&'static str> = [
        "PING", "ECHO", "QUIT", "SELECT",
        // strings
        "APPEND", "BITCOUNT", "BITFIELD", "BITPOS", "DECR", "DECRBY", "GET",
        "GETBIT", "GETRANGE", "GETSET", "INCR", "INCRBY", "INCRBYFLOAT", "MGET",
        "MSET", "MSETNX", "PSETEX", "SET", "SETBIT", "SETEX", "SETNX", "SETRANGE",
        "STRLEN",
        // hashes
        "HDEL", "HEXISTS", "HGET", "HGETALL", "HINCRBY", "HINCRBYFLOAT", "HKEYS",
        "HLEN", "HMGET", "HMSET", "HSET", "HSETNX", "HSTRLEN", "HVALS", "HSCAN",
        // lists
        "LINDEX", "LINSERT", "LLEN", "LPOP", "LPOS", "LPUSH", "LPUSHX", "LRANGE",
        "LREM", "LSET", "LTRIM", "RPOP", "RPOPLPUSH", "RPUSH", "RPUSHX",
        // sets
        "SADD", "SCARD", "SISMEMBER", "SMISMEMBER", "SMEMBERS", "SPOP",
        "SRANDMEMBER", "SREM", "SSCAN",
        // sorted sets
        "ZADD", "ZCARD", "ZCOUNT", "ZINCRBY", "ZLEXCOUNT", "ZPOPMAX", "ZPOPMIN",
        "ZRANGE", "ZRANGEBYLEX", "ZREVRANGEBYLEX", "ZRANGEBYSCORE", "ZRANK",
        "ZREM", "ZREMRANGEBYLEX", "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE",
        "ZREVRANGE", "ZREVRANGEBYSCORE", "ZREVRANK", "ZSCORE", "ZMSCORE", "ZSCAN",
        // keys
        "DEL", "DUMP", "EXISTS", "EXPIRE", "EXPIREAT", "MOVE", "PERSIST", "PEXPIRE",
        "PEXPIREAT", "PTTL", "RANDOMKEY", "RESTORE", "SORT", "TOUCH", "TTL", "TYPE",
        "UNLINK",
        // servers
        "ACL", "COMMAND", "CONFIG", "DBSIZE", "DEBUG", "FLUSHALL", "FLUSHDB", "INFO",
        "LOLWUT", "LASTSAVE", "MEMORY",
    ]
    .iter()
    .cloned()
    .collect();

    /// Commands that mutate keys; supported commands outside this set route
    /// as reads.
    static ref WRITE_CMD: HashSet<&'static str> = [
        // strings
        "APPEND", "BITFIELD", "DECR", "DECRBY", "GETSET", "INCR", "INCRBY", "INCRBYFLOAT",
        "MSET", "MSETNX", "PSETEX", "SET", "SETBIT", "SETEX", "SETNX", "SETRANGE",
        // hashes
        "HDEL", "HINCRBY", "HINCRBYFLOAT", "HMSET", "HSET", "HSETNX",
        // lists
        "LINSERT", "LPOP", "LPUSH", "LPUSHX", "LREM", "LSET", "LTRIM", "RPOP",
        "RPOPLPUSH", "RPUSH", "RPUSHX",
        // sets
        "SADD", "SPOP", "SREM",
        // sorted sets
        "ZADD", "ZINCRBY", "ZPOPMAX", "ZPOPMIN",
        "ZREM", "ZREMRANGEBYLEX", "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE",
        // keys
        "DEL", "EXPIRE", "EXPIREAT", "MOVE", "PERSIST", "PEXPIRE", "PEXPIREAT",
        "RESTORE", "SORT", "TOUCH", "UNLINK",
    ]
    .iter()
    .cloned()
    .collect();

    /// Every parameter is a key.
    static ref MULTI_KEY_CMD: HashSet<&'static str> =
        ["MGET", "DEL", "EXISTS", "TOUCH", "UNLINK"].iter().cloned().collect();

    /// Parameters are interleaved key/value pairs.
    static ref MULTI_KEY_VALUE_CMD: HashSet<&'static str> =
        ["MSET", "MSETNX"].iter().cloned().collect();
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessMode {
    Read,
    Write,
}

/// Where a command's keys land.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KeyLayout {
    /// No key at all (`PING`, `INFO`, ...): any node will do.
    None,
    Single { slot: u16 },
    /// One slot per key in parameter order; `interval` is the parameter
    /// stride (1 for key-only commands, 2 for key/value pairs).
    Multi { slots: Vec<u16>, interval: usize },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandInfo {
    pub name: String,
    pub mode: AccessMode,
    pub layout: KeyLayout,
}

fn invalid<S: Into<String>>(message: S) -> StepError {
    StepError::new(StepErrorKind::InvalidCommand, message)
}

fn key_slot(request: &RespRequest, index: usize) -> Result<u16, StepError> {
    let part = &request.parts[index];
    if part.bytes.is_empty() {
        return Err(invalid(format!("empty key at parameter {}", index)));
    }
    Ok(slot_of(&part.bytes))
}

/// Validates a parsed request and classifies it for routing. Element zero
/// must be a supported command name; every key must be a non-empty bulk
/// string; key/value commands must carry full pairs.
pub fn extract(request: &RespRequest) -> Result<CommandInfo, StepError> {
    let name = match request.command() {
        Some(name) if !name.is_empty() => name,
        _ => return Err(invalid("command name missing or not a string")),
    };

    if !SUPPORTED_CMD.contains(name.as_str()) {
        return Err(invalid(format!("command {} not supported", name)));
    }

    let mode = match WRITE_CMD.contains(name.as_str()) {
        true => AccessMode::Write,
        false => AccessMode::Read,
    };

    if MULTI_KEY_CMD.contains(name.as_str()) {
        if request.len() < 2 {
            return Err(invalid(format!("{} takes at least one key", name)));
        }
        let mut slots = Vec::with_capacity(request.len() - 1);
        for index in 1..request.len() {
            slots.push(key_slot(request, index)?);
        }
        return Ok(CommandInfo {
            name,
            mode,
            layout: KeyLayout::Multi { slots, interval: 1 },
        });
    }

    if MULTI_KEY_VALUE_CMD.contains(name.as_str()) {
        // Command plus pairs: the total element count must be odd.
        if request.len() < 3 || request.len() % 2 == 0 {
            return Err(invalid(format!("{} takes key/value pairs", name)));
        }
        let mut slots = Vec::with_capacity(request.len() / 2);
        for index in (1..request.len()).step_by(2) {
            slots.push(key_slot(request, index)?);
        }
        return Ok(CommandInfo {
            name,
            mode,
            layout: KeyLayout::Multi { slots, interval: 2 },
        });
    }

    if request.len() < 2 {
        return Ok(CommandInfo {
            name,
            mode,
            layout: KeyLayout::None,
        });
    }

    let slot = key_slot(request, 1)?;
    Ok(CommandInfo {
        name,
        mode,
        layout: KeyLayout::Single { slot },
    })
}
