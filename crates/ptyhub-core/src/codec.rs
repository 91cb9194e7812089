//! Newline-delimited JSON framing for the control channel.
//!
//! Wire format: one compact JSON object per line, `\n` terminated.

use crate::error::{PtyError, PtyResult};

/// Encode a serializable value into a single `\n`-terminated line.
pub fn encode_line<T: serde::Serialize>(value: &T) -> PtyResult<Vec<u8>> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one line (trailing newline optional) into a typed value.
pub fn decode_line<T: serde::de::DeserializeOwned>(line: &str) -> PtyResult<T> {
    let trimmed = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
    if trimmed.trim().is_empty() {
        return Err(PtyError::Codec("empty line".into()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Request, RequestEnvelope, Response, ResponseEnvelope};

    #[test]
    fn encoded_line_has_single_trailing_newline() {
        let env = ResponseEnvelope {
            id: None,
            response: Response::Ok,
        };
        let line = encode_line(&env).unwrap();
        assert_eq!(line, b"{\"type\":\"ok\"}\n");
    }

    #[test]
    fn decode_accepts_crlf() {
        let env: RequestEnvelope = decode_line("{\"op\":\"close\",\"session_id\":\"s1\"}\r\n").unwrap();
        assert_eq!(
            env.request,
            Request::Close {
                session_id: "s1".into()
            }
        );
    }

    #[test]
    fn decode_rejects_blank_and_garbage() {
        assert!(matches!(
            decode_line::<RequestEnvelope>("   \n"),
            Err(PtyError::Codec(_))
        ));
        assert!(matches!(
            decode_line::<RequestEnvelope>("{\"op\":\"explode\"}"),
            Err(PtyError::Codec(_))
        ));
    }
}
