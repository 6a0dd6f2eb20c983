//! Line framing for VPN client output
//!
//! Works like `LinesCodec` with a maximum length, plus one addition: a
//! partial line that ends with a known prompt (`Enter Auth Username:`) is
//! emitted without waiting for a newline, because interactive prompts are
//! written without one and the client then blocks reading stdin.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

#[derive(Debug, Clone)]
pub struct PromptAwareLineCodec {
    max_length: usize,
    prompts: Vec<String>,
    next_index: usize,
    discarding: bool,
}

impl PromptAwareLineCodec {
    pub fn new(max_length: usize, prompts: Vec<String>) -> Self {
        Self {
            max_length: max_length.max(1),
            prompts: prompts
                .into_iter()
                .map(|p| p.trim_end().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            next_index: 0,
            discarding: false,
        }
    }

    fn to_line(&self, bytes: &[u8]) -> String {
        let bytes = &bytes[..bytes.len().min(self.max_length)];
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        String::from_utf8_lossy(bytes).into_owned()
    }

    fn ends_with_prompt(&self, buf: &[u8]) -> bool {
        if self.prompts.is_empty() {
            return false;
        }
        let text = String::from_utf8_lossy(buf);
        let text = text.trim_end();
        self.prompts.iter().any(|p| text.ends_with(p.as_str()))
    }
}

impl Decoder for PromptAwareLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match (self.discarding, newline) {
                (true, Some(idx)) => {
                    // Drop the rest of an overlong line
                    buf.advance(idx + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(buf.len());
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(idx)) => {
                    let line = buf.split_to(idx + 1);
                    self.next_index = 0;
                    return Ok(Some(self.to_line(&line[..idx])));
                }
                (false, None) => {
                    if buf.len() > self.max_length {
                        let line = buf.split_to(self.max_length);
                        self.discarding = true;
                        self.next_index = 0;
                        return Ok(Some(self.to_line(&line)));
                    }
                    if !buf.is_empty() && self.ends_with_prompt(buf) {
                        let line = buf.split_to(buf.len());
                        self.next_index = 0;
                        return Ok(Some(self.to_line(&line)));
                    }
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() || self.discarding {
            buf.clear();
            self.discarding = false;
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(self.to_line(&line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PromptAwareLineCodec {
        PromptAwareLineCodec::new(
            32,
            vec![
                "Enter Auth Username:".to_string(),
                "Enter Auth Password:".to_string(),
            ],
        )
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut codec = codec();
        let mut buf = BytesMut::from("TUN/TAP device ");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"tun0 opened\r\nnext");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("TUN/TAP device tun0 opened".to_string())
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("next".to_string()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_prompt_without_newline() {
        let mut codec = codec();
        let mut buf = BytesMut::from("Enter Auth Username:");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("Enter Auth Username:".to_string())
        );
        assert!(buf.is_empty());

        // A colon alone does not make a prompt
        let mut buf = BytesMut::from("Mon Oct 18 12:");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_overlong_line_truncated() {
        let mut codec = codec();
        let long = "x".repeat(40);
        let mut buf = BytesMut::from(format!("{}\nshort\n", long).as_str());

        assert_eq!(codec.decode(&mut buf).unwrap(), Some("x".repeat(32)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("short".to_string()));
    }

    #[test]
    fn test_overlong_line_without_newline_is_discarded() {
        let mut codec = codec();
        let mut buf = BytesMut::from("y".repeat(40).as_str());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("y".repeat(32)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"yyyy\nafter\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("after".to_string()));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"bad \xff byte\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert!(line.starts_with("bad "));
        assert!(line.ends_with(" byte"));
    }
}
