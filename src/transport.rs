#![forbid(unsafe_code)]

//! Blocking HTTP access behind a trait so stages can be exercised without a
//! network. Callers run these methods on the blocking pool.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::FetchError;

const USER_AGENT: &str = concat!("bandfetch/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: u32 = 8;
const COPY_BUFFER: usize = 64 * 1024;

/// Bytes received by a completed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadInfo {
    pub bytes: u64,
    pub content_length: Option<u64>,
}

pub trait Transport: Send + Sync {
    /// One GET, following redirects, body decoded as text.
    fn get_text(&self, url: &str) -> Result<String, FetchError>;

    /// Streams a body into `sink`. `on_progress` receives the running total.
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<DownloadInfo, FetchError>;
}

/// `ureq` agent shared by every stage of a run.
#[derive(Clone)]
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(read_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(read_timeout)
            .redirects(MAX_REDIRECTS)
            .user_agent(USER_AGENT)
            .build();
        Self { agent }
    }

    fn get(&self, url: &str) -> Result<ureq::Response, FetchError> {
        match self.agent.get(url).call() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(status, _)) => Err(FetchError::Status {
                status,
                url: url.to_string(),
            }),
            Err(ureq::Error::Transport(transport)) => Err(classify_transport(&transport)),
        }
    }
}

fn classify_transport(transport: &ureq::Transport) -> FetchError {
    let message = transport.to_string();
    match transport.kind() {
        ureq::ErrorKind::InvalidUrl
        | ureq::ErrorKind::UnknownScheme
        | ureq::ErrorKind::InsecureRequestHttpsOnly
        | ureq::ErrorKind::TooManyRedirects
        | ureq::ErrorKind::InvalidProxyUrl => FetchError::InvalidRequest(message),
        _ if message.contains("timed out") => FetchError::Timeout(message),
        _ => FetchError::Connection(message),
    }
}

impl Transport for HttpTransport {
    fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let response = self.get(url)?;
        response.into_string().map_err(FetchError::from)
    }

    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<DownloadInfo, FetchError> {
        let response = self.get(url)?;
        let content_length = response
            .header("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        let mut reader = response.into_reader();
        let bytes = copy_with_progress(&mut reader, sink, on_progress)?;

        if let Some(expected) = content_length
            && bytes < expected
        {
            return Err(FetchError::Connection(format!(
                "body truncated after {bytes} of {expected} bytes"
            )));
        }

        Ok(DownloadInfo {
            bytes,
            content_length,
        })
    }
}

/// Copies until EOF. Read failures are network errors and may be retried;
/// write failures are local and never are.
pub(crate) fn copy_with_progress(
    reader: &mut dyn Read,
    sink: &mut dyn Write,
    on_progress: &mut dyn FnMut(u64),
) -> Result<u64, FetchError> {
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(FetchError::from(err)),
        };
        sink.write_all(&buffer[..read])
            .map_err(|err| FetchError::Io(err.to_string()))?;
        total += read as u64;
        on_progress(total);
    }
    sink.flush().map_err(|err| FetchError::Io(err.to_string()))?;
    Ok(total)
}
