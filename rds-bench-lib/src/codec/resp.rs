use std::io::Cursor;

use redis::{Parser, RedisError};

use super::{Codec, DecodeError, Request, Response};
use crate::config::Action;

/// Sorted array commands of a rich data structure server, framed as RESP
/// arrays of bulk strings.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RdsCodec;

impl RdsCodec {
    pub fn new() -> Self {
        Self
    }
}

fn command(action: Action) -> &'static str {
    match action {
        Action::Create => "SArray.create",
        Action::Delete => "SArray.delete",
        Action::Get => "SArray.get",
        Action::Len => "SArray.len",
        Action::Find => "SArray.find",
        Action::Insert => "SArray.insert",
        Action::Remove => "SArray.remove",
        Action::Truncate => "SArray.truncate",
    }
}

impl Codec for RdsCodec {
    fn encode(&self, request: &Request<'_>, buf: &mut Vec<u8>) {
        let mut cmd = redis::cmd(command(request.action));
        cmd.arg(request.key);
        match request.action {
            Action::Create => {
                cmd.arg(request.element_size);
                if let Some(marks) = request.watermarks {
                    cmd.arg(marks.low).arg(marks.high);
                }
            }
            Action::Delete | Action::Get | Action::Len => {}
            Action::Find => {
                cmd.arg(request.values().next().unwrap_or_default());
            }
            Action::Insert | Action::Remove => {
                for value in request.values() {
                    cmd.arg(value);
                }
            }
            Action::Truncate => {
                cmd.arg(request.items);
            }
        }
        buf.extend_from_slice(&cmd.get_packed_command());
    }

    fn decode(&self, buf: &[u8]) -> Result<Option<(Response, usize)>, DecodeError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut reader = Cursor::new(buf);
        let parsed = Parser::new().parse_value(&mut reader);
        let consumed = usize::try_from(reader.position()).unwrap_or(buf.len());
        match parsed {
            // every reply shape counts as an answer, only errors are not
            Ok(_) => Ok(Some((Response::Success, consumed))),
            // the cursor ran dry before the reply ended
            Err(err) if err.is_io_error() => Ok(None),
            Err(err) if buf.starts_with(b"-") => {
                Ok(Some((Response::Rejected(server_error(&err)), consumed)))
            }
            Err(err) => Err(DecodeError(err.to_string())),
        }
    }
}

/// Error reply as sent by the server, e.g. `ERR no such key`.
fn server_error(err: &RedisError) -> String {
    match (err.code(), err.detail()) {
        (Some(code), Some(detail)) => format!("{code} {detail}"),
        (Some(code), None) => code.to_owned(),
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Watermarks;

    fn request<'a>(action: Action, key: &'a [u8], values: &'a [u8]) -> Request<'a> {
        Request {
            action,
            key,
            values,
            value_len: 2,
            items: 2,
            element_size: 2,
            watermarks: None,
        }
    }

    fn encode(request: Request<'_>) -> String {
        let mut buf = Vec::new();
        RdsCodec::new().encode(&request, &mut buf);
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_encode_commands() {
        assert_eq!(
            encode(request(Action::Len, b"k1", b"")),
            "*2\r\n$10\r\nSArray.len\r\n$2\r\nk1\r\n"
        );
        assert_eq!(
            encode(request(Action::Insert, b"k1", b"aabb")),
            "*4\r\n$13\r\nSArray.insert\r\n$2\r\nk1\r\n$2\r\naa\r\n$2\r\nbb\r\n"
        );
        assert_eq!(
            encode(request(Action::Find, b"k1", b"aabb")),
            "*3\r\n$11\r\nSArray.find\r\n$2\r\nk1\r\n$2\r\naa\r\n"
        );
        assert_eq!(
            encode(request(Action::Truncate, b"k1", b"")),
            "*3\r\n$15\r\nSArray.truncate\r\n$2\r\nk1\r\n$1\r\n2\r\n"
        );
        assert_eq!(
            encode(request(Action::Create, b"k1", b"")),
            "*3\r\n$13\r\nSArray.create\r\n$2\r\nk1\r\n$1\r\n2\r\n"
        );

        let mut create = request(Action::Create, b"k1", b"");
        create.watermarks = Some(Watermarks {
            low: 3000,
            high: 3200,
        });
        assert_eq!(
            encode(create),
            "*5\r\n$13\r\nSArray.create\r\n$2\r\nk1\r\n$1\r\n2\r\n$4\r\n3000\r\n$4\r\n3200\r\n"
        );
    }

    #[test]
    fn test_encode_binary_key() {
        let mut buf = Vec::new();
        RdsCodec::new().encode(&request(Action::Get, &[0, 255], b""), &mut buf);
        assert_eq!(buf, b"*2\r\n$10\r\nSArray.get\r\n$2\r\n\x00\xff\r\n");
    }

    #[test]
    fn test_decode_complete_responses() {
        let codec = RdsCodec::new();
        for input in [
            &b"+OK\r\n"[..],
            b":42\r\n",
            b"$-1\r\n",
            b"$3\r\nabc\r\n",
            b"*2\r\n$1\r\na\r\n:1\r\n",
            b"*-1\r\n",
        ] {
            let (response, consumed) = codec.decode(input).unwrap().unwrap();
            assert_eq!(response, Response::Success, "input: {}", input.escape_ascii());
            assert_eq!(consumed, input.len());
        }
    }

    #[test]
    fn test_decode_server_errors() {
        let codec = RdsCodec::new();
        for input in [&b"-ERR no such key\r\n"[..], b"-NOKEY no such key\r\n"] {
            let (response, consumed) = codec.decode(input).unwrap().unwrap();
            assert!(
                matches!(&response, Response::Rejected(reason) if reason.contains("no such key")),
                "input: {}, got {response:?}",
                input.escape_ascii()
            );
            assert_eq!(consumed, input.len());
        }
    }

    #[test]
    fn test_decode_incomplete_responses() {
        let codec = RdsCodec::new();
        for input in [
            &b""[..],
            b"+OK",
            b"+OK\r",
            b"$3\r\nab",
            b"*2\r\n$1\r\na\r\n",
            b"-ERR no such",
        ] {
            assert_eq!(codec.decode(input).unwrap(), None, "input: {}", input.escape_ascii());
        }
    }

    #[test]
    fn test_decode_malformed_responses() {
        let codec = RdsCodec::new();
        for input in [&b"?what\r\n"[..], b":x\r\n", b"$2\r\nabcd\r\n"] {
            assert!(codec.decode(input).is_err(), "input: {}", input.escape_ascii());
        }
    }
}
