//! NDJSON framing for MCP stdio transport.
//!
//! Both sides of the proxy speak newline-delimited JSON-RPC: one complete
//! JSON object per `\n`-terminated line. [`NdjsonReader`] splits an arbitrary
//! byte stream into lines without assuming valid UTF-8 or valid JSON —
//! garbage lines are returned to the caller, which logs and skips them, and
//! partial trailing bytes survive a cancelled read.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Splits an async byte stream into NDJSON lines.
///
/// A lone `\r` preceding the `\n` is stripped. Blank lines are skipped.
/// The internal buffer persists across calls, so cancelling a pending
/// [`NdjsonReader::next_line`] (e.g. inside `select!`) loses no data.
pub struct NdjsonReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> NdjsonReader<R> {
    /// Wrap the given async reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Read the next non-blank line, returning `None` on EOF.
    ///
    /// Invalid UTF-8 is replaced rather than treated as fatal; the line is
    /// still delivered so the caller can log the parse failure and continue.
    /// A final unterminated line before EOF is delivered as a line.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the underlying read fails.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 && self.buf.is_empty() {
                return Ok(None);
            }
            if n > 0 && !self.buf.ends_with(b"\n") {
                // Mid-line EOF; the next read returns 0 and flushes the tail.
                continue;
            }

            let mut line = std::mem::take(&mut self.buf);
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                if n == 0 {
                    return Ok(None);
                }
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}

/// Write one JSON line: the payload, a `\n`, and a flush.
///
/// The payload must not contain embedded newlines.
///
/// # Errors
///
/// Returns an I/O error if writing or flushing fails.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> io::Result<()> {
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_multiple_lines() {
        let input = b"{\"id\":1}\n{\"id\":2}\n{\"id\":3}\n";
        let mut reader = NdjsonReader::new(&input[..]);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "{\"id\":1}");
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "{\"id\":2}");
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "{\"id\":3}");
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn strips_carriage_return_before_newline() {
        let input = b"{\"id\":1}\r\n";
        let mut reader = NdjsonReader::new(&input[..]);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "{\"id\":1}");
    }

    #[tokio::test]
    async fn skips_blank_lines() {
        let input = b"\n\r\n  \n{\"id\":1}\n\n";
        let mut reader = NdjsonReader::new(&input[..]);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "{\"id\":1}");
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delivers_unterminated_final_line() {
        let input = b"{\"id\":1}\n{\"id\":2}";
        let mut reader = NdjsonReader::new(&input[..]);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "{\"id\":1}");
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "{\"id\":2}");
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_lines_are_delivered_not_fatal() {
        let input = b"not json at all\n{\"id\":1}\n";
        let mut reader = NdjsonReader::new(&input[..]);
        let garbage = reader.next_line().await.unwrap().unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&garbage).is_err());
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "{\"id\":1}");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let input = b"{\"k\":\"\xff\xfe\"}\n";
        let mut reader = NdjsonReader::new(&input[..]);
        let line = reader.next_line().await.unwrap().unwrap();
        assert!(line.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn eof_returns_none() {
        let mut reader = NdjsonReader::new(&b""[..]);
        assert!(reader.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_line_appends_newline() {
        let mut buf = Vec::new();
        write_line(&mut buf, r#"{"id":1}"#).await.unwrap();
        assert_eq!(buf, b"{\"id\":1}\n");
    }
}
