//! Line-framed socket I/O with a hard length cap.
//!
//! Both the worker protocol and the front-end protocol are
//! newline-terminated lines of at most [`MAX_LINE_LENGTH`] bytes; a
//! peer exceeding that is broken and its connection gets dropped.

use std::io;
use tokio::io::AsyncBufReadExt;

/// Maximum accepted line length, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 8192;

#[derive(Debug)]
pub enum LineError {
    /// Peer closed the connection.
    Disconnected,
    /// Line exceeded [`MAX_LINE_LENGTH`].
    TooLong,
    Io(io::Error),
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::TooLong => write!(f, "line longer than {MAX_LINE_LENGTH} bytes"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LineError {}

/// Read one `\n`-terminated line, stripping the terminator (and a
/// preceding `\r` if present).
pub async fn read_line<R>(reader: &mut R) -> Result<String, LineError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        let available = reader.fill_buf().await.map_err(LineError::Io)?;
        if available.is_empty() {
            return Err(LineError::Disconnected);
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            break;
        }
        buf.extend_from_slice(available);
        let n = available.len();
        reader.consume(n);
        if buf.len() > MAX_LINE_LENGTH {
            return Err(LineError::TooLong);
        }
    }
    if buf.len() > MAX_LINE_LENGTH {
        return Err(LineError::TooLong);
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map_err(|_| LineError::Io(io::Error::other("line is not UTF-8")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn read_all(data: &[u8]) -> Vec<Result<String, LineError>> {
        let mut reader = BufReader::new(Cursor::new(data.to_vec()));
        let mut out = Vec::new();
        loop {
            match read_line(&mut reader).await {
                Err(LineError::Disconnected) => break,
                other => {
                    let stop = other.is_err();
                    out.push(other);
                    if stop {
                        break;
                    }
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn reads_lines_and_strips_terminators() {
        let lines = read_all(b"one\ntwo\r\nthree\n").await;
        let got: Vec<String> = lines.into_iter().map(|l| l.unwrap()).collect();
        assert_eq!(got, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn unterminated_tail_is_disconnect() {
        let lines = read_all(b"complete\npartial").await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap(), "complete");
    }

    #[tokio::test]
    async fn oversized_line_rejected() {
        let mut data = vec![b'x'; MAX_LINE_LENGTH + 1];
        data.push(b'\n');
        let lines = read_all(&data).await;
        assert!(matches!(lines[0], Err(LineError::TooLong)));
    }

    #[tokio::test]
    async fn max_length_line_accepted() {
        let mut data = vec![b'y'; MAX_LINE_LENGTH];
        data.push(b'\n');
        let lines = read_all(&data).await;
        assert_eq!(lines[0].as_ref().unwrap().len(), MAX_LINE_LENGTH);
    }
}
