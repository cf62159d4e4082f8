use std::time::Duration;

use thiserror::Error;

use crate::{
    duration::{parse_ttl, DurationError},
    resp_value::RespValue,
};

#[derive(Debug, PartialEq)]
pub enum Request<'data> {
    Ping,
    Echo(&'data str),
    Set(SetRequest<'data>),
    Get(&'data str),
    Ttl(&'data str),
    Keys,
}

#[derive(Debug, PartialEq)]
pub struct SetRequest<'data> {
    pub key: &'data str,
    pub value: &'data str,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("requests must be arrays of bulk strings")]
    NotAnArray,
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("invalid TTL: {0}")]
    InvalidDuration(#[from] DurationError),
    #[error("'{0}' is not supported by this store")]
    Unsupported(&'static str),
    #[error("'set' requires a TTL")]
    MissingTtl,
    #[error("only the '*' pattern is supported, got '{0}'")]
    KeyPattern(String),
}

impl<'data> Request<'data> {
    /// Interpret a decoded RESP frame as a command.
    pub fn parse(request_value: RespValue<'data>) -> Result<Self, RequestError> {
        let RespValue::Array(elements) = request_value else {
            return Err(RequestError::NotAnArray);
        };
        let args = elements
            .iter()
            .map(|element| match element {
                RespValue::BulkString(s) => Ok(*s),
                _ => Err(RequestError::NotAnArray),
            })
            .collect::<Result<Vec<&str>, _>>()?;

        let Some((command, args)) = args.split_first() else {
            return Err(RequestError::NotAnArray);
        };
        let request = match (command.to_ascii_lowercase().as_str(), args) {
            ("ping", &[]) => Request::Ping,
            ("ping", _) => return Err(RequestError::WrongArity("ping")),
            ("echo", &[message]) => Request::Echo(message),
            ("echo", _) => return Err(RequestError::WrongArity("echo")),
            ("set", &[key, value]) => Request::Set(SetRequest {
                key,
                value,
                ttl: None,
            }),
            ("set", &[key, value, ttl]) => Request::Set(SetRequest {
                key,
                value,
                ttl: Some(parse_ttl(ttl)?),
            }),
            ("set", _) => return Err(RequestError::WrongArity("set")),
            ("get", &[key]) => Request::Get(key),
            ("get", _) => return Err(RequestError::WrongArity("get")),
            ("ttl", &[key]) => Request::Ttl(key),
            ("ttl", _) => return Err(RequestError::WrongArity("ttl")),
            // `KEYS *` for redis-cli, `LIST` for the REPL.
            ("keys", &[] | &["*"]) | ("list", &[]) => Request::Keys,
            ("keys", &[pattern]) => return Err(RequestError::KeyPattern(pattern.to_string())),
            ("keys", _) => return Err(RequestError::WrongArity("keys")),
            ("list", _) => return Err(RequestError::WrongArity("list")),
            (other, _) => return Err(RequestError::UnknownCommand(other.to_string())),
        };
        Ok(request)
    }
}
