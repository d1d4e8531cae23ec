//! Requests and responses over byte streams.
//!
//! Every message is one frame: its length as a little-endian `u32`, then that many bytes of JSON.
//!
//! [`serve_connection`] wires an input and an output with an [`Executor`] on the target side.
//!
//! [`StreamConnector`] is the controller side: it runs the stream on a dedicated I/O thread and
//! hands requests over to it through a channel, one at a time.
//!
//! [`listen`] and [`StreamConnector::connect_tcp`] set both ends up over TCP.

use std::{io, net::SocketAddr, pin::Pin, thread};

use async_net::{TcpListener, TcpStream};
use async_stream::try_stream;
use futures::{
    channel::{mpsc, oneshot},
    future::Fuse,
    io::{BufReader, BufWriter},
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Future, FutureExt, Stream, StreamExt,
};
use serde::{de::DeserializeOwned, Serialize};

use super::Executor;
use crate::{
    error::TransportError,
    protocol::{FriendlyConnector, Identity, ProtocolInfo, ReturnInfo},
};

/// Largest accepted frame payload, in bytes.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

fn frame_too_large(len: usize) -> TransportError {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame of {len} bytes exceeds {MAX_FRAME_LEN} bytes"),
    )
    .into()
}

/// Writes and flushes one frame.
pub async fn write_frame<W, T>(output: &mut W, message: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec(message)?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|_| bytes.len() <= MAX_FRAME_LEN)
        .ok_or_else(|| frame_too_large(bytes.len()))?;
    output.write_all(&len.to_le_bytes()).await?;
    output.write_all(&bytes).await?;
    output.flush().await?;
    Ok(())
}

/// Reads one frame, or `None` if the input ended before a new frame.
pub async fn read_frame<R, T>(input: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match input.read_exact(&mut header).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(frame_too_large(len));
    }
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes).await?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Runs a target side connection.
///
/// Requests are read from `input` and executed in order, responses are written to `output`. It
/// returns at the end of the input, on the first transport failure, or once `shutdown` resolves.
pub async fn serve_connection<R, W, E, S>(
    input: R,
    output: W,
    executor: E,
    shutdown: S,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    E: Executor,
    S: Future<Output = ()>,
{
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);

    let serve = async {
        while let Some(info) = read_frame::<_, ProtocolInfo>(&mut input).await? {
            tracing::trace!(protocol_type = ?info.protocol_type, "executing request");
            let response = executor.execute(info);
            write_frame(&mut output, &response).await?;
        }
        Ok::<_, TransportError>(())
    }
    .fuse();
    let shutdown = shutdown.fuse();
    futures::pin_mut!(serve, shutdown);

    futures::select! {
        result = serve => {
            tracing::debug!("connection ended");
            result
        }
        () = shutdown => {
            tracing::debug!("connection shut down");
            Ok(())
        }
    }
}

type Request = (
    ProtocolInfo,
    oneshot::Sender<Result<ReturnInfo, TransportError>>,
);

/// [`FriendlyConnector`] speaking the frame protocol over a pair of streams.
///
/// A transport failure is terminal: the stream is closed and every later request fails with
/// [`TransportError::Disconnected`].
#[derive(Debug)]
pub struct StreamConnector {
    identity: Identity,
    requests: mpsc::UnboundedSender<Request>,
}

impl StreamConnector {
    /// Starts the I/O thread over `input` and `output`.
    pub fn spawn<R, W>(input: R, output: W) -> io::Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests, receiver) = mpsc::unbounded();
        thread::Builder::new()
            .name("teleproxy-io".to_owned())
            .spawn(move || async_io::block_on(run_requests(input, output, receiver)))?;
        Ok(Self {
            identity: Identity::unique(),
            requests,
        })
    }

    /// Connects to a target process served by [`listen`].
    pub fn connect_tcp(addr: impl std::net::ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::try_from(std::net::TcpStream::connect(addr)?)?;
        Self::spawn(stream.clone(), stream)
    }
}

async fn run_requests<R, W>(input: R, output: W, mut requests: mpsc::UnboundedReceiver<Request>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut input = BufReader::new(input);
    let mut output = BufWriter::new(output);

    while let Some((info, reply)) = requests.next().await {
        let response = async {
            write_frame(&mut output, &info).await?;
            read_frame(&mut input)
                .await?
                .ok_or(TransportError::Disconnected)
        }
        .await;
        let failed = response.is_err();
        if reply.send(response).is_err() {
            tracing::debug!("response dropped, the caller is gone");
        }
        if failed {
            break;
        }
    }

    tracing::debug!("connection closed");
}

impl FriendlyConnector for StreamConnector {
    fn identity(&self) -> Identity {
        self.identity
    }

    fn send_and_receive(&self, info: ProtocolInfo) -> Result<ReturnInfo, TransportError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .unbounded_send((info, reply))
            .map_err(|_| TransportError::Disconnected)?;
        futures::executor::block_on(response).map_err(|_| TransportError::Disconnected)?
    }
}

/// Accepts connections on `listener` until `shutdown` resolves.
pub fn listen<S>(
    listener: TcpListener,
    shutdown: S,
) -> impl Stream<Item = io::Result<(TcpStream, SocketAddr)>>
where
    S: Future<Output = ()>,
{
    try_stream! {
        let shutdown = shutdown.fuse();
        futures::pin_mut!(shutdown);

        while let Some(conn) = await_connection(&listener, shutdown.as_mut()).await? {
            yield conn;
        }
    }
}

type AwaitConnectionResult = io::Result<Option<(TcpStream, SocketAddr)>>;

async fn await_connection<S>(
    listener: &TcpListener,
    mut shutdown: Pin<&mut Fuse<S>>,
) -> AwaitConnectionResult
where
    S: Future<Output = ()>,
{
    let mut accept = Box::pin(listener.accept().fuse());
    futures::select! {
        conn = accept => {
            drop(accept);
            Ok(Some(conn?))
        }
        () = shutdown => {
            tracing::debug!("listener shut down");
            Ok(None)
        }
    }
}
