//! The transport seam: anything that can put a [`RequestSpec`] on the wire.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::{
    error::Error,
    logger::RequestLogger,
    request::{RequestSpec, prepare},
};

type HyperHttpsConnector = HttpsConnector<HttpConnector>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn send(&self, spec: RequestSpec) -> Result<HttpResponse, Self::Error>;
}

#[derive(Debug)]
pub enum TransportError {
    /// The call arguments could not be turned into a wire request.
    Request(Error),
    Build(hyper::http::Error),
    Send(hyper_util::client::legacy::Error),
    Body(hyper::Error),
    Timeout(Duration),
    Tls(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request(err) => write!(f, "prepare request: {err}"),
            Self::Build(err) => write!(f, "build request: {err}"),
            Self::Send(err) => write!(f, "send request: {err}"),
            Self::Body(err) => write!(f, "read response body: {err}"),
            Self::Timeout(timeout) => write!(f, "request timed out after {timeout:?}"),
            Self::Tls(message) => write!(f, "configure TLS: {message}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(err) => Some(err),
            Self::Build(err) => Some(err),
            Self::Send(err) => Some(err),
            Self::Body(err) => Some(err),
            Self::Timeout(_) | Self::Tls(_) => None,
        }
    }
}

/// HTTP/1.1 and HTTP/2 client over rustls with the platform's root certificates.
#[derive(Clone)]
pub struct HyperClient {
    client: Client<HyperHttpsConnector, Full<Bytes>>,
}

impl std::fmt::Debug for HyperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperClient").finish_non_exhaustive()
    }
}

impl HyperClient {
    pub fn new() -> Result<Self, TransportError> {
        ensure_rustls_crypto_provider()?;
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| {
                TransportError::Tls(format!("load native TLS root certificates: {err}"))
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self::from_connector(connector))
    }

    /// Trusts exactly `roots` for HTTPS. Plain `http://` URLs need no roots at all.
    pub fn with_root_store(roots: rustls::RootCertStore) -> Result<Self, TransportError> {
        ensure_rustls_crypto_provider()?;
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        Ok(Self::from_connector(connector))
    }

    fn from_connector(connector: HyperHttpsConnector) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    async fn dispatch(&self, request: Request<Full<Bytes>>) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(TransportError::Send)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(TransportError::Body)?
            .to_bytes();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpClient for HyperClient {
    type Error = TransportError;

    async fn send(&self, mut spec: RequestSpec) -> Result<HttpResponse, TransportError> {
        let prepared = prepare(&mut spec).map_err(TransportError::Request)?;
        let method = Method::from_bytes(prepared.method.as_bytes()).map_err(|_| {
            TransportError::Request(Error::validation(format!(
                "invalid HTTP method `{}`",
                prepared.method
            )))
        })?;
        // fragments never go on the wire
        let uri = prepared
            .url
            .split_once('#')
            .map_or(prepared.url.as_str(), |(head, _)| head);

        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in prepared.headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(Bytes::from(prepared.body.unwrap_or_default())))
            .map_err(TransportError::Build)?;

        tracing::debug!(method = %prepared.method, url = %prepared.url, "sending request");
        match spec.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.dispatch(request))
                .await
                .map_err(|_| TransportError::Timeout(timeout))?,
            None => self.dispatch(request).await,
        }
    }
}

fn ensure_rustls_crypto_provider() -> Result<(), TransportError> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(TransportError::Tls(
            "install rustls ring crypto provider".to_owned(),
        ));
    }
    Ok(())
}

#[derive(Debug)]
pub enum CaptureError<E> {
    /// The request could not be recorded; nothing was sent.
    Capture(Error),
    Transport(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CaptureError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Capture(err) => write!(f, "capture request: {err}"),
            Self::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CaptureError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Capture(err) => Some(err),
            Self::Transport(err) => Some(err),
        }
    }
}

/// Records every request before handing it to the wrapped client.
#[derive(Debug, Clone)]
pub struct LoggedClient<C> {
    logger: RequestLogger,
    inner: C,
}

impl<C: HttpClient> LoggedClient<C> {
    pub fn new(logger: RequestLogger, inner: C) -> Self {
        Self { logger, inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Like [`HttpClient::send`], also returning the id the request was logged under.
    pub async fn send_logged(
        &self,
        spec: RequestSpec,
    ) -> Result<(String, HttpResponse), CaptureError<C::Error>> {
        let (id, spec) = self
            .logger
            .capture(spec)
            .await
            .map_err(CaptureError::Capture)?;
        let response = self
            .inner
            .send(spec)
            .await
            .map_err(CaptureError::Transport)?;
        Ok((id, response))
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for LoggedClient<C> {
    type Error = CaptureError<C::Error>;

    async fn send(&self, spec: RequestSpec) -> Result<HttpResponse, Self::Error> {
        self.send_logged(spec).await.map(|(_, response)| response)
    }
}
