//! Opaque byte relay for CONNECT. No parsing or logging of payload bytes
//! happens here.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const RELAY_BUFFER_SIZE: usize = 8192;

/// Acknowledge the CONNECT to the client, then relay bytes in both
/// directions until either side reads EOF, at which point both sides are
/// torn down together.
pub async fn run<C, S>(client: &mut C, origin: &mut S) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    client.write_all(ESTABLISHED).await?;
    client.flush().await?;

    let mut client_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut origin_buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = client.read(&mut client_buf) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                origin.write_all(&client_buf[..n]).await?;
                origin.flush().await?;
            }
            result = origin.read(&mut origin_buf) => {
                let n = result?;
                if n == 0 {
                    break;
                }
                client.write_all(&origin_buf[..n]).await?;
                client.flush().await?;
            }
        }
    }
    Ok(())
}
