use std::time::Duration;

use bytes::BytesMut;

use crate::{duration::format_duration, request::RequestError, resp_value::RespValue};

#[derive(Debug, PartialEq)]
pub enum Response<'request> {
    Pong,
    Echo(&'request str),
    Ok,
    Value(Option<String>),
    Ttl(Option<Duration>),
    Keys(Vec<String>),
    Error(String),
}

impl<'request> From<RequestError> for Response<'request> {
    fn from(error: RequestError) -> Self {
        // Simple errors are line-delimited.
        let message = format!("ERR {error}").replace(['\r', '\n'], " ");
        Response::Error(message)
    }
}

impl<'request> Response<'request> {
    pub fn serialize(&self, buf: &mut BytesMut) {
        let response_value = match self {
            Response::Pong => RespValue::SimpleString("PONG"),
            Response::Echo(s) => RespValue::BulkString(s),
            Response::Ok => RespValue::SimpleString("OK"),
            Response::Value(Some(value)) => RespValue::BulkString(value),
            Response::Ttl(Some(remaining)) => RespValue::OwnedBulkString(format_duration(*remaining)),
            Response::Value(None) | Response::Ttl(None) => RespValue::NullBulkString,
            Response::Keys(keys) => {
                RespValue::Array(keys.iter().map(|k| RespValue::BulkString(k)).collect())
            }
            Response::Error(message) => RespValue::SimpleError(message),
        };
        response_value.serialize(buf);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;

    use super::Response;
    use crate::request::RequestError;

    fn serialized(response: Response) -> Vec<u8> {
        let mut buf = BytesMut::new();
        response.serialize(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn found_and_not_found() {
        assert_eq!(
            serialized(Response::Value(Some("Alice".into()))),
            b"$5\r\nAlice\r\n"
        );
        assert_eq!(serialized(Response::Value(None)), b"$-1\r\n");
        assert_eq!(serialized(Response::Ttl(None)), b"$-1\r\n");
    }

    #[test]
    fn ttl_is_textual() {
        assert_eq!(
            serialized(Response::Ttl(Some(Duration::from_secs(90)))),
            b"$5\r\n1m30s\r\n"
        );
    }

    #[test]
    fn keys_and_errors() {
        assert_eq!(
            serialized(Response::Keys(vec!["a".into(), "b".into()])),
            b"*2\r\n$1\r\na\r\n$1\r\nb\r\n"
        );
        assert_eq!(
            serialized(RequestError::MissingTtl.into()),
            b"-ERR 'set' requires a TTL\r\n"
        );
    }
}
