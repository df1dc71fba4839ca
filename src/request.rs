//! Call arguments for one outbound request and the normalization a transport applies before
//! putting them on the wire.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    io::{Read, Seek, SeekFrom},
    time::Duration,
};

use serde_json::Value;

use crate::{
    error::{Error, Result},
    record::Headers,
};

pub const DEFAULT_USER_AGENT: &str = concat!("reqlog/", env!("CARGO_PKG_VERSION"));
const MULTIPART_FORM_DATA: &str = "multipart/form-data";

pub trait FileStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> FileStream for T {}

pub enum FileContent {
    Bytes(Vec<u8>),
    /// A live handle. Capture and transport read it fully and seek it back to where it was.
    Stream(Box<dyn FileStream>),
}

impl std::fmt::Debug for FileContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct FileField {
    pub filename: String,
    pub content: FileContent,
    pub content_type: Option<String>,
}

impl FileField {
    pub fn from_bytes(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: FileContent::Bytes(content.into()),
            content_type: None,
        }
    }

    pub fn from_stream(filename: impl Into<String>, stream: impl FileStream + 'static) -> Self {
        Self {
            filename: filename.into(),
            content: FileContent::Stream(Box::new(stream)),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Reads the whole content. Streams are read from their current position and rewound to it.
    pub fn read_content(&mut self, field: &str) -> Result<Vec<u8>> {
        match &mut self.content {
            FileContent::Bytes(bytes) => Ok(bytes.clone()),
            FileContent::Stream(stream) => {
                let encoding_error = |source| Error::Encoding {
                    field: field.to_owned(),
                    source,
                };
                let start = stream.stream_position().map_err(encoding_error)?;
                let mut content = Vec::new();
                stream.read_to_end(&mut content).map_err(encoding_error)?;
                stream.seek(SeekFrom::Start(start)).map_err(encoding_error)?;
                Ok(content)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
}

/// Everything a caller hands to the transport for one request.
#[derive(Debug, Default)]
pub struct RequestSpec {
    pub method: String,
    pub url: String,
    pub headers: Option<Headers>,
    /// Query parameters appended to `url` during preparation.
    pub params: Vec<(String, String)>,
    pub json: Option<Value>,
    pub data: Option<Payload>,
    pub files: BTreeMap<String, FileField>,
    pub timeout: Option<Duration>,
    /// Transport parameters this crate does not interpret; carried through capture and replay.
    pub extra: BTreeMap<String, Value>,
}

impl RequestSpec {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(name, value);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.json = Some(value);
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.data = Some(Payload::Text(body.into()));
        self
    }

    pub fn bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.data = Some(Payload::Bytes(body.into()));
        self
    }

    pub fn file(mut self, field: impl Into<String>, file: FileField) -> Self {
        self.files.insert(field.into(), file);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }
}

/// The request exactly as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

/// Applies transport normalization: method casing, query merging, default headers and the
/// body encoding implied by `files`, `data` or `json` (checked in that order).
pub fn prepare(spec: &mut RequestSpec) -> Result<PreparedRequest> {
    let method = normalize_method(&spec.method)?;
    let url = prepare_url(&spec.url, &spec.params)?;

    let mut headers = spec.headers.clone().unwrap_or_default();
    headers.insert_if_absent("User-Agent", DEFAULT_USER_AGENT);
    headers.insert_if_absent("Accept", "*/*");

    let body = if !spec.files.is_empty() {
        if spec.data.is_some() {
            return Err(Error::validation(
                "raw `data` cannot be combined with multipart `files`",
            ));
        }
        let boundary = headers
            .get("Content-Type")
            .and_then(multipart_boundary)
            .map(str::to_owned)
            .unwrap_or_else(new_multipart_boundary);
        let body = encode_multipart(&mut spec.files, &boundary)?;
        headers.insert(
            "Content-Type",
            format!("{MULTIPART_FORM_DATA}; boundary={boundary}"),
        );
        Some(body)
    } else if let Some(data) = &spec.data {
        Some(match data {
            Payload::Text(text) => text.as_bytes().to_vec(),
            Payload::Bytes(bytes) => bytes.clone(),
        })
    } else if let Some(json) = &spec.json {
        headers.insert_if_absent("Content-Type", "application/json");
        Some(
            serde_json::to_vec(json)
                .map_err(|err| Error::validation(format!("serialize json body: {err}")))?,
        )
    } else {
        None
    };

    match &body {
        Some(body) => headers.insert("Content-Length", body.len().to_string()),
        None if method != "GET" && method != "HEAD" => headers.insert("Content-Length", "0"),
        None => {
            headers.remove("Content-Length");
        }
    }

    Ok(PreparedRequest {
        method,
        url,
        headers,
        body,
    })
}

fn normalize_method(method: &str) -> Result<String> {
    let upper = method.trim().to_ascii_uppercase();
    if upper.is_empty() || hyper::Method::from_bytes(upper.as_bytes()).is_err() {
        return Err(Error::validation(format!("invalid HTTP method `{method}`")));
    }
    Ok(upper)
}

fn prepare_url(raw: &str, params: &[(String, String)]) -> Result<String> {
    let requoted = requote_uri(raw.trim());
    let raw = requoted.as_ref();
    let (without_fragment, fragment) = match raw.split_once('#') {
        Some((head, fragment)) => (head, Some(fragment)),
        None => (raw, None),
    };

    let uri: hyper::Uri = without_fragment
        .parse()
        .map_err(|err| Error::validation(format!("invalid URL `{raw}`: {err}")))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(Error::validation(format!(
            "invalid URL `{raw}`: expected an absolute http(s) URL"
        )));
    }

    let mut url = without_fragment.to_owned();
    let authority_start = url.find("://").map_or(0, |idx| idx + 3);
    match url[authority_start..].find(['/', '?']) {
        Some(offset) if url.as_bytes()[authority_start + offset] == b'/' => {}
        Some(offset) => url.insert(authority_start + offset, '/'),
        None => url.push('/'),
    }

    if !params.is_empty() {
        let encoded = params
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(value)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        if !url.contains('?') {
            url.push('?');
        } else if !url.ends_with('?') && !url.ends_with('&') {
            url.push('&');
        }
        url.push_str(&encoded);
    }

    if let Some(fragment) = fragment {
        url.push('#');
        url.push_str(fragment);
    }
    Ok(url)
}

/// Percent-encodes everything a URI cannot carry literally (spaces, quotes, non-ASCII, ...).
/// Existing `%XX` escapes are kept; a stray `%` becomes `%25`.
fn requote_uri(raw: &str) -> Cow<'_, str> {
    let needs_quoting = |pos: usize, ch: char| match ch {
        '%' => !is_percent_escape(&raw[pos..]),
        _ => !(ch.is_ascii_alphanumeric() || URI_LITERAL_CHARS.contains(ch)),
    };
    if !raw.char_indices().any(|(pos, ch)| needs_quoting(pos, ch)) {
        return Cow::Borrowed(raw);
    }

    let mut quoted = String::with_capacity(raw.len() + 8);
    let mut buf = [0u8; 4];
    for (pos, ch) in raw.char_indices() {
        if needs_quoting(pos, ch) {
            quoted.push_str(&urlencoding::encode(ch.encode_utf8(&mut buf)));
        } else {
            quoted.push(ch);
        }
    }
    Cow::Owned(quoted)
}

const URI_LITERAL_CHARS: &str = "-._~!#$&'()*+,/:;=?@[]";

fn is_percent_escape(rest: &str) -> bool {
    let bytes = rest.as_bytes();
    bytes.len() >= 3 && bytes[1].is_ascii_hexdigit() && bytes[2].is_ascii_hexdigit()
}

fn multipart_boundary(content_type: &str) -> Option<&str> {
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim();
    if !mime.eq_ignore_ascii_case(MULTIPART_FORM_DATA) {
        return None;
    }
    parts.find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"'))
            .filter(|boundary| !boundary.is_empty())
    })
}

fn new_multipart_boundary() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn encode_multipart(files: &mut BTreeMap<String, FileField>, boundary: &str) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for (field, file) in files.iter_mut() {
        let content = file.read_content(field)?;
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                escape_quoted(field),
                escape_quoted(&file.filename)
            )
            .as_bytes(),
        );
        if let Some(content_type) = &file.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(body)
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek as _, SeekFrom};

    use serde_json::json;

    use super::{DEFAULT_USER_AGENT, FileField, RequestSpec, multipart_boundary, prepare};

    #[test]
    fn prepare_uppercases_method_and_merges_params() {
        let mut spec = RequestSpec::new("get", "https://example.com/search?q=rust")
            .param("page", "2")
            .param("tag", "a b&c");
        let prepared = prepare(&mut spec).unwrap();

        assert_eq!(prepared.method, "GET");
        assert_eq!(
            prepared.url,
            "https://example.com/search?q=rust&page=2&tag=a%20b%26c"
        );
        assert_eq!(prepared.headers.get("user-agent"), Some(DEFAULT_USER_AGENT));
        assert_eq!(prepared.headers.get("accept"), Some("*/*"));
        assert!(prepared.headers.get("content-length").is_none());
        assert_eq!(prepared.body, None);
    }

    #[test]
    fn prepare_adds_root_path_and_keeps_fragment() {
        let mut spec = RequestSpec::get("https://example.com").param("a", "1");
        assert_eq!(prepare(&mut spec).unwrap().url, "https://example.com/?a=1");

        let mut spec = RequestSpec::get("http://example.com?x=1#frag").param("y", "2");
        assert_eq!(
            prepare(&mut spec).unwrap().url,
            "http://example.com/?x=1&y=2#frag"
        );
    }

    #[test]
    fn prepare_percent_encodes_characters_a_uri_cannot_carry() {
        let mut spec = RequestSpec::get("https://example.com/search?q=hello world");
        assert_eq!(
            prepare(&mut spec).unwrap().url,
            "https://example.com/search?q=hello%20world"
        );

        let mut spec = RequestSpec::get("https://example.com/café?q=\"x\"&pct=100%&ok=%41")
            .param("page", "2");
        assert_eq!(
            prepare(&mut spec).unwrap().url,
            "https://example.com/caf%C3%A9?q=%22x%22&pct=100%25&ok=%41&page=2"
        );
    }

    #[test]
    fn prepare_rejects_relative_urls_and_bad_methods() {
        let mut spec = RequestSpec::get("/relative/path");
        assert_eq!(prepare(&mut spec).unwrap_err().kind(), "validation");

        let mut spec = RequestSpec::new("BAD METHOD", "https://example.com/");
        assert_eq!(prepare(&mut spec).unwrap_err().kind(), "validation");
    }

    #[test]
    fn json_body_sets_content_type_unless_caller_did() {
        let mut spec = RequestSpec::post("https://example.com/api").json(json!({"key": "value"}));
        let prepared = prepare(&mut spec).unwrap();
        assert_eq!(prepared.body.as_deref(), Some(&br#"{"key":"value"}"#[..]));
        assert_eq!(
            prepared.headers.get("Content-Type"),
            Some("application/json")
        );
        assert_eq!(prepared.headers.get("Content-Length"), Some("15"));

        let mut spec = RequestSpec::post("https://example.com/api")
            .header("content-type", "application/vnd.api+json")
            .json(json!([1, 2]));
        let prepared = prepare(&mut spec).unwrap();
        assert_eq!(
            prepared.headers.get("Content-Type"),
            Some("application/vnd.api+json")
        );
    }

    #[test]
    fn empty_post_gets_zero_content_length() {
        let mut spec = RequestSpec::post("https://example.com/api").header("Content-Length", "999");
        let prepared = prepare(&mut spec).unwrap();
        assert_eq!(prepared.headers.get("content-length"), Some("0"));
    }

    #[test]
    fn multipart_reuses_recorded_boundary_and_rewinds_streams() {
        let mut stream = Cursor::new(b"skip:payload".to_vec());
        stream.seek(SeekFrom::Start(5)).unwrap();

        let mut spec = RequestSpec::post("https://example.com/upload")
            .header("Content-Type", "multipart/form-data; boundary=\"fixed\"")
            .file(
                "file",
                FileField::from_stream("test.txt", stream).with_content_type("text/plain"),
            );
        let prepared = prepare(&mut spec).unwrap();

        let expected = concat!(
            "--fixed\r\n",
            "Content-Disposition: form-data; name=\"file\"; filename=\"test.txt\"\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "payload\r\n",
            "--fixed--\r\n",
        );
        assert_eq!(prepared.body.as_deref(), Some(expected.as_bytes()));
        assert_eq!(
            prepared.headers.get("content-type"),
            Some("multipart/form-data; boundary=fixed")
        );

        let again = prepare(&mut spec).unwrap();
        assert_eq!(again.body, prepared.body, "stream should have been rewound");
    }

    #[test]
    fn data_and_files_cannot_be_combined() {
        let mut spec = RequestSpec::post("https://example.com/upload")
            .text("raw")
            .file("file", FileField::from_bytes("a.bin", vec![1u8]));
        assert_eq!(prepare(&mut spec).unwrap_err().kind(), "validation");
    }

    #[test]
    fn boundary_parsing_ignores_other_mime_types() {
        assert_eq!(
            multipart_boundary("multipart/form-data; charset=utf-8; boundary=abc"),
            Some("abc")
        );
        assert_eq!(multipart_boundary("text/plain; boundary=abc"), None);
        assert_eq!(multipart_boundary("multipart/form-data"), None);
    }
}
