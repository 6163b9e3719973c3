//! Transport listeners: TCP sockets and Unix sockets behind one accept stream.
use std::{io, net::SocketAddr, path::Path};

use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{stream::Stream, AsyncReadRent, AsyncWriteRent, Split},
    net::{ListenerOpts, TcpListener, TcpStream},
    BufResult,
};
use service_async::{AsyncMakeService, MakeService};

pub enum ListenerBuilder {
    Tcp(SocketAddr, ListenerOpts),
    /// An already bound socket, e.g. one bound to port 0.
    TcpBound(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl ListenerBuilder {
    #[cfg(unix)]
    pub fn bind_unix<P: AsRef<Path>>(path: P) -> io::Result<ListenerBuilder> {
        // Stale socket files from a previous run block the bind.
        let _ = std::fs::remove_file(path.as_ref());
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        // The async listener is built from the raw fd, so it has to be
        // non-blocking on the legacy driver.
        if monoio::utils::is_legacy() {
            listener.set_nonblocking(true)?;
        }
        Ok(Self::Unix(listener))
    }

    pub fn bind_tcp(addr: SocketAddr, opts: ListenerOpts) -> io::Result<ListenerBuilder> {
        Ok(Self::Tcp(addr, opts))
    }

    pub fn from_std_tcp(listener: std::net::TcpListener) -> io::Result<ListenerBuilder> {
        if monoio::utils::is_legacy() {
            listener.set_nonblocking(true)?;
        }
        Ok(Self::TcpBound(listener))
    }

    /// Local TCP address. Unix listeners have none.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            ListenerBuilder::Tcp(addr, _) => Some(*addr),
            ListenerBuilder::TcpBound(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            ListenerBuilder::Unix(_) => None,
        }
    }

    pub fn build(&self) -> io::Result<Listener> {
        match self {
            ListenerBuilder::Tcp(addr, opts) => {
                TcpListener::bind_with_config(addr, opts).map(Listener::Tcp)
            }
            ListenerBuilder::TcpBound(listener) => {
                let sys_listener = listener.try_clone()?;
                TcpListener::from_std(sys_listener).map(Listener::Tcp)
            }
            #[cfg(unix)]
            ListenerBuilder::Unix(listener) => {
                let sys_listener = listener.try_clone()?;
                monoio::net::UnixListener::from_std(sys_listener).map(Listener::Unix)
            }
        }
    }
}

impl MakeService for ListenerBuilder {
    type Service = Listener;
    type Error = io::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}

impl AsyncMakeService for ListenerBuilder {
    type Service = Listener;
    type Error = io::Error;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}

/// Accepts connections from whichever socket was bound.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(monoio::net::UnixListener),
}

impl Stream for Listener {
    type Item = io::Result<(AcceptedStream, AcceptedAddr)>;

    async fn next(&mut self) -> Option<Self::Item> {
        match self {
            Listener::Tcp(l) => {
                let accepted = l.next().await?;
                Some(accepted.map(|(stream, addr)| {
                    (AcceptedStream::Tcp(stream), AcceptedAddr::Tcp(addr))
                }))
            }
            #[cfg(unix)]
            Listener::Unix(l) => {
                let accepted = l.next().await?;
                Some(accepted.map(|(stream, addr)| {
                    (AcceptedStream::Unix(stream), AcceptedAddr::Unix(addr))
                }))
            }
        }
    }
}

/// A connection accepted by [`Listener`].
pub enum AcceptedStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}

unsafe impl Split for AcceptedStream {}

/// Peer address of an [`AcceptedStream`].
#[derive(Debug, Clone)]
pub enum AcceptedAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(monoio::net::unix::SocketAddr),
}

// Forward an io call to whichever socket the stream wraps.
macro_rules! on_socket {
    ($stream:expr, $sock:ident => $call:expr) => {
        match $stream {
            AcceptedStream::Tcp($sock) => $call,
            #[cfg(unix)]
            AcceptedStream::Unix($sock) => $call,
        }
    };
}

impl AsyncReadRent for AcceptedStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        on_socket!(self, sock => sock.read(buf).await)
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        on_socket!(self, sock => sock.readv(buf).await)
    }
}

impl AsyncWriteRent for AcceptedStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        on_socket!(self, sock => sock.write(buf).await)
    }

    async fn writev<T: IoVecBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        on_socket!(self, sock => sock.writev(buf).await)
    }

    async fn flush(&mut self) -> io::Result<()> {
        on_socket!(self, sock => sock.flush().await)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        on_socket!(self, sock => sock.shutdown().await)
    }
}
