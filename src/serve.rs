//! Static file serving

use crate::config::ServeConfig;
use crate::context::RequestContext;
use crate::error::{empty_body, error_response, ProxyBody, ProxyErrorCode};
use futures::Stream;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, SizeHint};
use hyper::header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

pub struct ServeAction {
    root: PathBuf,
    index_files: Vec<String>,
}

impl ServeAction {
    pub fn new(config: &ServeConfig) -> Self {
        Self {
            root: PathBuf::from(&config.root),
            index_files: config.index_files.clone(),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        if !self.root.is_dir() {
            anyhow::bail!("serve root '{}' is not a directory", self.root.display());
        }
        Ok(())
    }

    pub async fn handle(&self, ctx: &RequestContext) -> Response<ProxyBody> {
        if ctx.method != Method::GET && ctx.method != Method::HEAD {
            let mut response = error_response(ProxyErrorCode::MethodNotAllowed);
            response
                .headers_mut()
                .insert(ALLOW, hyper::header::HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let Some(relative) = sanitize(ctx.effective_subpath()) else {
            debug!(request_id = %ctx.request_id, path = %ctx.path, "Rejected file path");
            return error_response(ProxyErrorCode::Forbidden);
        };

        let mut path = self.root.join(relative);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => match self.find_index(&path).await {
                Some(index) => path = index,
                None => return error_response(ProxyErrorCode::NotFound),
            },
            Ok(_) => {}
            Err(e) => return io_error_response(ctx, e),
        }

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => return io_error_response(ctx, e),
        };
        let len = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => return io_error_response(ctx, e),
        };

        let mime = mime_guess::from_path(&path).first_or_octet_stream();
        let body = if ctx.method == Method::HEAD {
            empty_body()
        } else {
            FileBody::new(file, len, path).boxed()
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, mime.as_ref())
            .header(CONTENT_LENGTH, len)
            .body(body)
            .expect("valid response with StatusCode enum and static headers")
    }

    async fn find_index(&self, dir: &Path) -> Option<PathBuf> {
        for name in &self.index_files {
            let candidate = dir.join(name);
            if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                if meta.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

/// File contents streamed in chunks
struct FileBody {
    stream: ReaderStream<File>,
    remaining: u64,
    path: PathBuf,
}

impl FileBody {
    fn new(file: File, len: u64, path: PathBuf) -> Self {
        Self {
            stream: ReaderStream::new(file),
            remaining: len,
            path,
        }
    }
}

impl Body for FileBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.stream).poll_next(cx)) {
            Some(Ok(chunk)) => {
                this.remaining = this.remaining.saturating_sub(chunk.len() as u64);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            // Ending early leaves the declared Content-Length unmet, so hyper
            // closes the connection instead of sending a truncated success
            Some(Err(e)) => {
                error!(path = %this.path.display(), error = %e, "Failed to read file");
                Poll::Ready(None)
            }
            None => Poll::Ready(None),
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}

fn io_error_response(ctx: &RequestContext, e: io::Error) -> Response<ProxyBody> {
    match e.kind() {
        io::ErrorKind::NotFound => error_response(ProxyErrorCode::NotFound),
        io::ErrorKind::PermissionDenied => error_response(ProxyErrorCode::Forbidden),
        _ => {
            error!(request_id = %ctx.request_id, path = %ctx.path, error = %e, "Failed to read file");
            error_response(ProxyErrorCode::InternalError)
        }
    }
}

/// Percent-decode a request subpath into a path relative to the root.
/// Returns `None` for parent references and other components that could
/// escape the root.
fn sanitize(subpath: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(subpath).ok()?;
    if decoded.contains('\0') || decoded.contains('\\') {
        return None;
    }

    let mut path = PathBuf::new();
    for component in decoded.split('/') {
        match component {
            "" | "." => continue,
            ".." => return None,
            c if c.contains(':') && cfg!(windows) => return None,
            c => path.push(c),
        }
    }
    Some(path)
}
