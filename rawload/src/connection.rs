use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use rawload_common::{RequestTemplate, Result, RunConfig};
use tracing::warn;

use crate::detector::{ResponseLengthCache, ResponseReader};

/// One persistent connection to the target, driven by a single worker.
pub struct ConnectionWorker {
    stream: TcpStream,
    request: Arc<RequestTemplate>,
    reader: ResponseReader,
}

impl ConnectionWorker {
    /// Open the socket. Failure is fatal to the calling worker; there is no retry.
    pub fn connect(
        config: &RunConfig,
        request: Arc<RequestTemplate>,
        cache: Arc<ResponseLengthCache>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(config.target.authority())?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(config.read_timeout).filter(|t| !t.is_zero()))?;

        Ok(Self {
            stream,
            request,
            reader: ResponseReader::new(config.buffer_capacity(), cache),
        })
    }

    pub fn send_request(&mut self) -> Result<()> {
        self.stream.write_all(self.request.as_bytes())?;
        Ok(())
    }

    /// Block until the whole response was drained; `true` when its status was `200`.
    pub fn await_response(&mut self) -> Result<bool> {
        self.reader.read_response(&mut self.stream)
    }

    /// Shut the socket down. The run is over at this point, so a failure is only logged.
    pub fn close(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            warn!(error = %e, "failed to close connection");
        }
    }
}
