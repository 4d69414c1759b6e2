/// Redis Cluster protocol support
///
/// Covers the operation table and request encoder, RESP framing with the
/// streaming reply decoder, MOVED/ASK parsing, and slot routing.
pub mod redirect;
pub mod resp;
pub mod slots;

pub use redirect::{RedirectParser, RedirectType};
pub use resp::{Emit, FeedStatus, ReplyDecoder, ReplyHead, ReplyKind, RespEncoder};
pub use slots::{key_slot, Route, SlotRange, SlotRouter, SlotTable, SLOT_COUNT};

use crate::error::{GatewayError, GatewayResult};
use bytes::Bytes;
use fnv::FnvHashMap;
use lazy_static::lazy_static;
use std::iter;

/// Shape of a single-key operation the gateway forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub name: &'static str,
    /// Argument count including the command itself. Negative means "at least".
    pub arity: i32,
    pub readonly: bool,
    /// Argument positions (command is 0, key is 1) that must be integers
    pub integer_args: &'static [usize],
    /// Arguments after the key come in pairs
    pub paired: bool,
}

const fn op(name: &'static str, arity: i32, readonly: bool) -> Operation {
    Operation {
        name,
        arity,
        readonly,
        integer_args: &[],
        paired: false,
    }
}

const fn op_int(name: &'static str, arity: i32, readonly: bool, integer_args: &'static [usize]) -> Operation {
    Operation {
        name,
        arity,
        readonly,
        integer_args,
        paired: false,
    }
}

const OPERATIONS: &[Operation] = &[
    // strings
    op("GET", 2, true),
    op("SET", -3, false),
    op("GETSET", 3, false),
    op("SETNX", 3, false),
    op_int("SETEX", 4, false, &[2]),
    op("DEL", 2, false),
    op("EXISTS", 2, true),
    op("INCR", 2, false),
    op("DECR", 2, false),
    op_int("INCRBY", 3, false, &[2]),
    op_int("DECRBY", 3, false, &[2]),
    op("APPEND", 3, false),
    op("STRLEN", 2, true),
    // keyspace
    op_int("EXPIRE", 3, false, &[2]),
    op_int("PEXPIRE", 3, false, &[2]),
    op("TTL", 2, true),
    op("PTTL", 2, true),
    op("PERSIST", 2, false),
    op("TYPE", 2, true),
    // hashes
    op("HGET", 3, true),
    Operation {
        name: "HSET",
        arity: -4,
        readonly: false,
        integer_args: &[],
        paired: true,
    },
    op("HDEL", -3, false),
    op("HGETALL", 2, true),
    op("HLEN", 2, true),
    op("HEXISTS", 3, true),
    op("HKEYS", 2, true),
    op("HVALS", 2, true),
    // lists
    op("LPUSH", -3, false),
    op("RPUSH", -3, false),
    op("LPOP", 2, false),
    op("RPOP", 2, false),
    op("LLEN", 2, true),
    op_int("LRANGE", 4, true, &[2, 3]),
    op_int("LINDEX", 3, true, &[2]),
    // sets
    op("SADD", -3, false),
    op("SREM", -3, false),
    op("SMEMBERS", 2, true),
    op("SCARD", 2, true),
    op("SISMEMBER", 3, true),
    // sorted sets
    op("ZADD", -4, false),
    op("ZREM", -3, false),
    op_int("ZRANGE", -4, true, &[2, 3]),
    op("ZSCORE", 3, true),
    op("ZCARD", 2, true),
    op("ZRANK", 3, true),
];

lazy_static! {
    static ref OPERATION_TABLE: FnvHashMap<&'static str, &'static Operation> =
        OPERATIONS.iter().map(|op| (op.name, op)).collect();
}

impl Operation {
    /// Look up an operation by name, ignoring case
    pub fn lookup(name: &str) -> Option<&'static Operation> {
        OPERATION_TABLE
            .get(name.to_ascii_uppercase().as_str())
            .copied()
    }

    pub fn all() -> &'static [Operation] {
        OPERATIONS
    }

    fn accepts_argc(&self, argc: usize) -> bool {
        if self.arity >= 0 {
            argc == self.arity as usize
        } else {
            argc >= self.arity.unsigned_abs() as usize
        }
    }
}

/// A validated request frame ready to write
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub operation: &'static Operation,
    pub frame: Bytes,
}

/// Translates inbound requests into RESP request frames
pub struct RequestEncoder;

impl RequestEncoder {
    /// Validate the request against its operation's shape and encode it.
    ///
    /// Nothing is produced unless the whole request is valid.
    pub fn encode(operation: &str, key: &[u8], args: &[Bytes]) -> GatewayResult<EncodedRequest> {
        let op = Operation::lookup(operation)
            .ok_or_else(|| GatewayError::malformed(format!("unsupported operation '{}'", operation)))?;

        if key.is_empty() {
            return Err(GatewayError::malformed("empty key"));
        }

        let argc = 2 + args.len();
        if !op.accepts_argc(argc) {
            return Err(GatewayError::malformed(format!(
                "wrong number of arguments for '{}'",
                op.name
            )));
        }
        if op.paired && args.len() % 2 != 0 {
            return Err(GatewayError::malformed(format!(
                "'{}' expects field/value pairs",
                op.name
            )));
        }

        for &pos in op.integer_args {
            // positions count the command and the key
            if let Some(arg) = args.get(pos - 2) {
                if btoi::btoi::<i64>(arg).is_err() {
                    return Err(GatewayError::malformed(format!(
                        "argument {} of '{}' is not an integer",
                        pos, op.name
                    )));
                }
            }
        }

        let parts = iter::once(op.name.as_bytes())
            .chain(iter::once(key))
            .chain(args.iter().map(|a| &a[..]));
        let frame = RespEncoder::encode_command(parts.collect::<Vec<_>>());

        Ok(EncodedRequest { operation: op, frame })
    }
}
