//! Safe TCP bind/connect/read/write helper functions for line frames.

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::PaxosLogError;

/// Receives one newline-terminated frame from TCP readable connection
/// `conn_read`, using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(Some(line))` if successful, without the trailing newline (and
///     without a trailing carriage return, if any)
///   - `Ok(None)` if the peer closed the connection
///   - `Err(err)` if any unexpected error occurs
///
/// CANCELLATION SAFETY: bytes already read are kept in the read buffer across
/// cancellations at the `.await` point and are consumed only once a whole
/// line is present, so this can serve as a `tokio::select!` branch.
pub(crate) async fn safe_tcp_read_line<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<Option<String>, PaxosLogError>
where
    Conn: AsyncReadExt + Unpin,
{
    loop {
        if let Some(pos) = read_buf.iter().position(|&b| b == b'\n') {
            let frame = read_buf.split_to(pos + 1);
            let mut line = String::from_utf8(frame[..pos].to_vec())?;
            if line.ends_with('\r') {
                line.pop();
            }
            return Ok(Some(line));
        }

        if read_buf.capacity() - read_buf.len() < 512 {
            read_buf.reserve(4096);
        }
        if conn_read.read_buf(read_buf).await? == 0 {
            // EOF; an unterminated tail is discarded
            return Ok(None);
        }
    }
}

/// Writes one frame followed by a newline to TCP writable connection
/// `conn_write`. Not cancellation-safe; only used by dedicated writer tasks.
pub(crate) async fn tcp_write_line<Conn>(
    conn_write: &mut Conn,
    line: &str,
) -> Result<(), PaxosLogError>
where
    Conn: AsyncWriteExt + Unpin,
{
    let mut frame = Vec::with_capacity(line.len() + 1);
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');
    conn_write.write_all(&frame).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Wrapper over tokio `TcpSocket::listen()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, PaxosLogError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.bind(bind_addr).and_then(|_| socket.listen(1024)) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(PaxosLogError::msg(format!(
                        "failed to bind {}: {}",
                        bind_addr, err
                    )));
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpSocket::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, PaxosLogError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
