//! Minimal HTTP/1.0 static-file handler run on the worker threads.
//!
//! Every connection is one-shot: read the request head, write one response,
//! close. Files are read from the document root once at startup and served
//! from memory.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::client::Client;
use crate::metrics;
use crate::reactor::RequestHandler;

pub const SERVER_STRING: &str = concat!("pollpool/", env!("CARGO_PKG_VERSION"));

/// Longest request line or header line accepted.
pub const MAX_LINE: usize = 8192;

/// Blocking read/write timeout while serving one request.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("GET") {
            Method::Get
        } else if s.eq_ignore_ascii_case("POST") {
            Method::Post
        } else {
            Method::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: Method,
    pub url: &'a str,
    pub version: &'a str,
}

/// Parse `METHOD URL VERSION`, tolerating repeated spaces and a trailing
/// CRLF or LF. A missing version is allowed (HTTP/0.9 style).
pub fn parse_request_line(line: &str) -> Option<RequestLine<'_>> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let method = parts.next()?;
    let url = parts.next()?;
    let version = parts.next().unwrap_or("");
    Some(RequestLine {
        method: Method::parse(method),
        url,
        version,
    })
}

/// Split `path?query` at the first `?`.
pub fn split_query(url: &str) -> (&str, Option<&str>) {
    match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    }
}

/// Documents under a root directory, keyed by their `/`-separated path
/// relative to it.
#[derive(Debug, Default)]
pub struct FileCache {
    files: HashMap<String, Arc<[u8]>>,
    default_file: String,
}

impl FileCache {
    pub fn load(root: &Path, default_file: &str) -> io::Result<Self> {
        let mut files = HashMap::new();
        load_dir(root, "", &mut files)?;
        Ok(Self {
            files,
            default_file: default_file.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Body for a URL path. `/`-terminated paths and directories map to the
    /// default file. Paths containing `..` never resolve.
    pub fn resolve(&self, path: &str) -> Option<Arc<[u8]>> {
        if path.split('/').any(|seg| seg == "..") {
            return None;
        }
        let key = path.trim_start_matches('/');
        if key.is_empty() || key.ends_with('/') {
            return self.files.get(&format!("{key}{}", self.default_file)).cloned();
        }
        self.files
            .get(key)
            .or_else(|| self.files.get(&format!("{key}/{}", self.default_file)))
            .cloned()
    }
}

fn load_dir(dir: &Path, prefix: &str, files: &mut HashMap<String, Arc<[u8]>>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            tracing::warn!(path = ?entry.path(), "skipping non-utf8 file name");
            continue;
        };
        let key = format!("{prefix}{name}");
        let kind = entry.file_type()?;
        if kind.is_dir() {
            load_dir(&entry.path(), &format!("{key}/"), files)?;
        } else if kind.is_file() {
            let body = fs::read(entry.path())?;
            tracing::debug!(file = %key, bytes = body.len(), "cached document");
            files.insert(key, body.into());
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct StaticFileHandler {
    cache: FileCache,
}

impl StaticFileHandler {
    pub fn new(cache: FileCache) -> Self {
        Self { cache }
    }

    pub fn load(root: &Path, default_file: &str) -> io::Result<Self> {
        let cache = FileCache::load(root, default_file)?;
        tracing::info!(root = %root.display(), files = cache.len(), "document cache loaded");
        Ok(Self::new(cache))
    }

    fn serve(&self, client: &mut Client) -> io::Result<()> {
        if client.peer_closed()? {
            tracing::debug!(fd = client.fd(), "client closed itself");
            return Ok(());
        }
        client.set_blocking(true)?;
        client.set_timeouts(Some(IO_TIMEOUT))?;

        let mut reader = BufReader::new(&mut *client);
        let Some(line) = read_line(&mut reader)? else {
            return Ok(());
        };
        let Some(request) = parse_request_line(&line) else {
            tracing::debug!(line = %line.trim_end(), "malformed request line");
            return Ok(());
        };
        tracing::debug!(method = ?request.method, url = request.url, version = request.version, "request");

        match request.method {
            Method::Get => {
                // Discard the rest of the head.
                while let Some(header) = read_line(&mut reader)? {
                    if header.trim_end_matches(['\r', '\n']).is_empty() {
                        break;
                    }
                }
                drop(reader);
                let (path, _query) = split_query(request.url);
                match self.cache.resolve(path) {
                    Some(body) => write_response(client, "200 OK", &body),
                    None => {
                        tracing::debug!(path, "document not found");
                        write_response(client, "404 NOT FOUND", NOT_FOUND_BODY.as_bytes())
                    }
                }
            }
            // Accepted and closed without a reply.
            Method::Post => Ok(()),
            Method::Other => {
                drop(reader);
                write_response(
                    client,
                    "501 Method Not Implemented",
                    NOT_IMPLEMENTED_BODY.as_bytes(),
                )
            }
        }
    }
}

impl RequestHandler for StaticFileHandler {
    fn handle(&self, mut client: Client) {
        if let Err(e) = self.serve(&mut client) {
            tracing::debug!(fd = client.fd(), error = %e, "request failed");
        }
        client.close();
    }
}

const NOT_FOUND_BODY: &str = "<HTML><TITLE>Not Found</TITLE>\r\n\
<BODY><P>The server could not fulfill\r\n\
your request because the resource specified\r\n\
is unavailable or nonexistent.\r\n\
</BODY></HTML>\r\n";

const NOT_IMPLEMENTED_BODY: &str = "<HTML><HEAD><TITLE>Method Not Implemented\r\n\
</TITLE></HEAD>\r\n\
<BODY><P>HTTP request method not supported.\r\n\
</BODY></HTML>\r\n";

/// One line including its terminator; `None` at EOF. Lines longer than
/// [`MAX_LINE`] are rejected.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader.by_ref().take(MAX_LINE as u64).read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && n >= MAX_LINE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "request line too long"));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn write_response<W: Write>(out: &mut W, status: &str, body: &[u8]) -> io::Result<()> {
    let head = format!(
        "HTTP/1.0 {status}\r\nServer: {SERVER_STRING}\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    out.write_all(head.as_bytes())?;
    out.write_all(body)?;
    metrics::inc_responses_sent();
    Ok(())
}
