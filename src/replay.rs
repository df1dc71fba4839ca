//! Re-issuing captured requests.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value;

use crate::{
    client::{HttpClient, HttpResponse},
    codec,
    error::{Error, Result},
    record::{Headers, Record, StoredData, StoredFile},
    request::{FileField, Payload},
    storage::StorageBackend,
};

/// Field overrides applied to a stored record before it is replayed. Unset fields keep the
/// recorded value.
#[derive(Debug, Default)]
pub struct Modifications {
    pub method: Option<String>,
    pub url: Option<String>,
    /// Replaces the recorded headers wholesale.
    pub headers: Option<Headers>,
    /// Set (or replace) individual headers on top of the recorded or replaced ones.
    pub set_headers: Vec<(String, String)>,
    pub json: Option<Value>,
    pub data: Option<Payload>,
    pub files: Option<BTreeMap<String, FileField>>,
    pub timeout: Option<Duration>,
}

impl Modifications {
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.json = Some(value);
        self
    }

    pub fn data(mut self, data: Payload) -> Self {
        self.data = Some(data);
        self
    }

    pub fn file(mut self, field: impl Into<String>, file: FileField) -> Self {
        self.files
            .get_or_insert_with(BTreeMap::new)
            .insert(field.into(), file);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Parses `field=value` overrides as typed on a command line.
    ///
    /// Recognized fields: `method`, `url`, `json` (a JSON document), `data` (text),
    /// `timeout` (milliseconds) and `header.<Name>`.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut modifications = Self::default();
        for pair in pairs {
            let pair = pair.as_ref();
            let (field, value) = pair.split_once('=').ok_or_else(|| {
                Error::validation(format!("modification `{pair}` must look like field=value"))
            })?;
            let field = field.trim();

            if let Some(name) = field.strip_prefix("header.") {
                if name.is_empty() {
                    return Err(Error::validation("header modification needs a name"));
                }
                modifications.set_headers.push((name.to_owned(), value.to_owned()));
                continue;
            }

            match field {
                "method" => modifications.method = Some(value.trim().to_owned()),
                "url" => modifications.url = Some(value.trim().to_owned()),
                "json" => {
                    let parsed = serde_json::from_str(value).map_err(|err| {
                        Error::validation(format!("`json` modification is not valid JSON: {err}"))
                    })?;
                    modifications.json = Some(parsed);
                }
                "data" => modifications.data = Some(Payload::Text(value.to_owned())),
                "timeout" => {
                    let millis: u64 = value.trim().parse().map_err(|_| {
                        Error::validation(format!(
                            "`timeout` modification must be milliseconds, got `{value}`"
                        ))
                    })?;
                    modifications.timeout = Some(Duration::from_millis(millis));
                }
                other => {
                    return Err(Error::validation(format!(
                        "unknown modification field `{other}`; expected method, url, json, data, timeout or header.<Name>"
                    )));
                }
            }
        }
        Ok(modifications)
    }

    /// Merges the overrides into `record`.
    ///
    /// A `json` or `data` override replaces the body outright: the other body form and the
    /// caller's original payload arguments are dropped, along with the recorded
    /// `Content-Type` unless the headers are replaced too.
    pub fn apply_to(self, record: &mut Record) -> Result<()> {
        let replaces_body = self.json.is_some() || self.data.is_some();

        if let Some(method) = self.method {
            record.method = method;
        }
        if let Some(url) = self.url {
            record.url = url;
        }

        let headers_replaced = self.headers.is_some();
        if let Some(headers) = self.headers {
            record.headers = headers;
        }
        if replaces_body && !headers_replaced {
            record.headers.remove("Content-Type");
        }
        for (name, value) in self.set_headers {
            record.headers.insert(name, value);
        }

        if let Some(json) = self.json {
            record.json = Some(json);
            record.data = None;
        }
        if let Some(data) = self.data {
            record.data = Some(match &data {
                Payload::Text(text) => StoredData::text(text.clone()),
                Payload::Bytes(bytes) => StoredData::bytes(bytes),
            });
            record.json = None;
        }
        if replaces_body {
            record.original_arguments.json = None;
            record.original_arguments.data = None;
        }

        if let Some(files) = self.files {
            let mut stored = BTreeMap::new();
            for (field, mut file) in files {
                let content = file.read_content(&field)?;
                stored.insert(
                    field,
                    StoredFile {
                        filename: file.filename,
                        content: STANDARD.encode(content),
                        content_type: file.content_type,
                    },
                );
            }
            record.original_arguments.files = stored
                .iter()
                .map(|(field, file)| (field.clone(), file.filename.clone()))
                .collect();
            record.files = stored;
        }

        if let Some(timeout) = self.timeout {
            record.original_arguments.timeout_ms =
                Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ReplayError<E> {
    /// Loading, modifying or reconstructing the record failed; nothing was sent.
    Store(Error),
    Transport(E),
}

impl<E: std::fmt::Display> std::fmt::Display for ReplayError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Transport(err) => write!(f, "replay transport failed: {err}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ReplayError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Transport(err) => Some(err),
        }
    }
}

impl<E> From<Error> for ReplayError<E> {
    fn from(err: Error) -> Self {
        Self::Store(err)
    }
}

pub struct Replayer<C> {
    storage: Arc<dyn StorageBackend>,
    client: C,
}

impl<C: HttpClient> Replayer<C> {
    pub fn new(storage: Arc<dyn StorageBackend>, client: C) -> Self {
        Self { storage, client }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Loads `id`, applies `modifications` and sends the result. The stored record is not
    /// changed, and the replayed request is not logged again unless `C` does so.
    pub async fn replay(
        &self,
        id: &str,
        modifications: Option<Modifications>,
    ) -> std::result::Result<HttpResponse, ReplayError<C::Error>> {
        let mut record = self.storage.load(id).await?;
        if let Some(modifications) = modifications {
            modifications.apply_to(&mut record)?;
        }
        let spec = codec::reconstruct(&record)?;

        tracing::info!(id = %id, method = %record.method, url = %record.url, "replaying request");
        let response = self
            .client
            .send(spec)
            .await
            .map_err(ReplayError::Transport)?;
        tracing::debug!(id = %id, status = response.status, "replay finished");
        Ok(response)
    }
}
