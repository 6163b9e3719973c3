use std::{io, net::ToSocketAddrs};

use greeter_core::proto::{
    GoodbyeReply, GoodbyeRequest, HelloReply, HelloRequest, Reply, Request, Status,
};
use monoio::{
    io::{sink::SinkExt, stream::Stream, AsyncReadRent, AsyncWriteRent},
    net::TcpStream,
};
use monoio_codec::Framed;

use crate::{
    codec::{ClientCodec, CodecError},
    wire::{RequestFrame, ResponseFrame},
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("rpc failed: {0}")]
    Status(#[from] Status),
    #[error("connection closed by server")]
    Closed,
    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: u64, got: u64 },
}

/// A greeter client on one connection. Calls are issued one at a time.
pub struct GreeterClient<S = TcpStream> {
    codec: Framed<S, ClientCodec>,
    next_id: u64,
}

impl GreeterClient<TcpStream> {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

#[cfg(unix)]
impl GreeterClient<monoio::net::UnixStream> {
    pub async fn connect_unix<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ClientError> {
        let stream = monoio::net::UnixStream::connect(path).await?;
        Ok(Self::new(stream))
    }
}

impl<S> GreeterClient<S>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    pub fn new(stream: S) -> Self {
        Self {
            codec: Framed::new(stream, ClientCodec::new()),
            next_id: 0,
        }
    }

    pub async fn say_hello(&mut self, name: impl Into<String>) -> Result<HelloReply, ClientError> {
        let request = Request::Greeting(HelloRequest { name: name.into() });
        match self.call(request).await? {
            Reply::Greeting(reply) => Ok(reply),
            other => Err(mismatched(other)),
        }
    }

    pub async fn say_goodbye(
        &mut self,
        name: impl Into<String>,
    ) -> Result<GoodbyeReply, ClientError> {
        let request = Request::Farewell(GoodbyeRequest { name: name.into() });
        match self.call(request).await? {
            Reply::Farewell(reply) => Ok(reply),
            other => Err(mismatched(other)),
        }
    }

    pub async fn call(&mut self, request: Request) -> Result<Reply, ClientError> {
        let method = request.method();
        let frame = RequestFrame::new(self.next_id, &request)?;
        let response = self.call_raw(frame).await?;
        Ok(response.into_reply(method)?)
    }

    /// Send a frame as is and return the server's response frame.
    pub async fn call_raw(&mut self, mut frame: RequestFrame) -> Result<ResponseFrame, ClientError> {
        let expected = self.next_id;
        self.next_id += 1;
        frame.id = expected;
        self.codec.send_and_flush(frame).await?;
        let response = self.codec.next().await.ok_or(ClientError::Closed)??;
        if response.id != expected {
            return Err(ClientError::IdMismatch {
                expected,
                got: response.id,
            });
        }
        Ok(response)
    }
}

fn mismatched(reply: Reply) -> ClientError {
    Status::internal(format!("unexpected {} reply", reply.method())).into()
}
