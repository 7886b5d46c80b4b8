use http::StatusCode;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) use self::readahead::ReadAhead;

mod readahead;

/// Writes a synthetic error response and leaves the connection to be closed.
///
/// Always bodyless and `Connection: close`.
pub(crate) async fn send_error_response(
    writer: &mut (impl AsyncWrite + Unpin),
    status: StatusCode,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error"),
    );
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

/// Copies exactly `len` bytes through `buf`.
pub(crate) async fn copy_exact(
    src: &mut (impl AsyncRead + Unpin),
    dst: &mut (impl AsyncWrite + Unpin),
    len: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    let mut remaining = len;
    while remaining > 0 {
        let cap = buf.len().min(remaining.min(usize::MAX as u64) as usize);
        let n = src.read(&mut buf[..cap]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended mid body",
            ));
        }
        dst.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Copies until end of stream, returning the byte count.
pub(crate) async fn copy_until_eof(
    src: &mut (impl AsyncRead + Unpin),
    dst: &mut (impl AsyncWrite + Unpin),
    buf: &mut [u8],
) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = src.read(buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Reads one line (terminator included) out of the read-ahead buffer.
pub(crate) async fn read_line<R: AsyncRead + Unpin>(
    src: &mut ReadAhead<R>,
) -> io::Result<Vec<u8>> {
    loop {
        if let Some(pos) = src.buffer().iter().position(|&b| b == b'\n') {
            let line = src.buffer()[..=pos].to_vec();
            src.consume(pos + 1);
            return Ok(line);
        }
        if src.is_full() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line exceeds buffer limit",
            ));
        }
        if src.fill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended mid line",
            ));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 chunk size line"))?;
    let size = line
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

/// Copies one chunked body, re-emitting the framing byte-for-byte: chunk
/// size lines, chunk data with its trailing CRLF, and the trailer section
/// through the blank line.
pub(crate) async fn copy_chunked<R: AsyncRead + Unpin>(
    src: &mut ReadAhead<R>,
    dst: &mut (impl AsyncWrite + Unpin),
    buf: &mut [u8],
) -> io::Result<()> {
    loop {
        let line = read_line(src).await?;
        dst.write_all(&line).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // trailer section, ends at the first blank line
            loop {
                let line = read_line(src).await?;
                dst.write_all(&line).await?;
                if line.iter().all(|b| matches!(b, b'\r' | b'\n')) {
                    return Ok(());
                }
            }
        }
        // chunk data plus its CRLF
        copy_exact(src, dst, size + 2, buf).await?;
    }
}
