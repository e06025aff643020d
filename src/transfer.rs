//! Composed transfers over the single-shot socket operations.

use crate::error::Error;
use crate::io::socket::Socket;

/// Reads until `buf` is full.
///
/// End-of-stream before the buffer fills yields
/// [`Error::UnexpectedEof`] carrying the bytes read so far; any other
/// error aborts the loop unchanged.
pub async fn read(sock: &Socket, buf: &mut [u8]) -> Result<usize, Error> {
    let total = buf.len();
    let mut filled = 0;

    while filled < total {
        match sock.read_some(&mut buf[filled..]).await {
            Ok(0) => return Err(Error::UnexpectedEof { read: filled }),
            Ok(n) => filled += n,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes all of `buf`, looping over partial writes.
pub async fn write_all(sock: &Socket, buf: &[u8]) -> Result<usize, Error> {
    let mut written = 0;

    while written < buf.len() {
        let n = sock.write_some(&buf[written..]).await?;
        if n == 0 {
            return Err(Error::Os(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write returned zero bytes",
            )));
        }
        written += n;
    }
    Ok(written)
}
