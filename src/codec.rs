//! Conversion between live call arguments and stored [`Record`]s.

use std::{collections::BTreeMap, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::{
    error::Result,
    record::{BodyRef, Headers, OriginalArguments, Record, StoredData, StoredFile},
    request::{FileField, Payload, RequestSpec, prepare},
    timestamp::Timestamp,
};

/// Builds the record for one invocation.
///
/// `url` and `headers` are taken from the prepared request so a replay echoes what was sent
/// rather than re-deriving it. File streams in `spec` are read and rewound, so the caller can
/// still hand `spec` to the transport afterwards. For multipart requests the boundary is pinned
/// on `spec` as well, which keeps the bytes the transport sends equal to the recorded ones.
pub fn serialize(id: impl Into<String>, spec: &mut RequestSpec) -> Result<Record> {
    let original_arguments = sanitize_arguments(spec);
    let prepared = prepare(spec)?;

    let mut files = BTreeMap::new();
    for (field, file) in spec.files.iter_mut() {
        let content = file.read_content(field)?;
        files.insert(
            field.clone(),
            StoredFile {
                filename: file.filename.clone(),
                content: STANDARD.encode(content),
                content_type: file.content_type.clone(),
            },
        );
    }

    if !spec.files.is_empty() {
        if let Some(content_type) = prepared.headers.get("Content-Type") {
            spec.headers
                .get_or_insert_with(Headers::new)
                .insert("Content-Type", content_type);
        }
    }

    let (json, data) = match &spec.data {
        Some(Payload::Bytes(bytes)) => (None, Some(StoredData::bytes(bytes))),
        Some(Payload::Text(text)) => (None, Some(StoredData::text(text.clone()))),
        None => (spec.json.clone(), None),
    };

    Ok(Record {
        id: id.into(),
        timestamp: Some(Timestamp::now()),
        method: prepared.method,
        url: prepared.url,
        headers: prepared.headers,
        json,
        data,
        files,
        original_arguments,
    })
}

/// Caller arguments minus anything that would store raw content a second time.
pub fn sanitize_arguments(spec: &RequestSpec) -> OriginalArguments {
    OriginalArguments {
        headers: spec.headers.clone(),
        params: spec.params.clone(),
        json: spec.json.clone(),
        data: match &spec.data {
            Some(Payload::Text(text)) => Some(text.clone()),
            Some(Payload::Bytes(_)) | None => None,
        },
        files: spec
            .files
            .iter()
            .map(|(field, file)| (field.clone(), file.filename.clone()))
            .collect(),
        timeout_ms: spec
            .timeout
            .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
        extra: spec.extra.clone(),
    }
}

/// Rebuilds call arguments from a stored record.
///
/// `json`/`data` kept in `original_arguments` take precedence over the stored body so the
/// payload is never supplied twice. Byte bodies only live in the stored body and are kept.
pub fn reconstruct(record: &Record) -> Result<RequestSpec> {
    let args = &record.original_arguments;

    let decoded_body = match record.body() {
        BodyRef::Json(value) => (Some(value.clone()), None),
        BodyRef::Data(data) if data.is_base64 => (None, Some(Payload::Bytes(data.decoded()?))),
        BodyRef::Data(data) => (None, Some(Payload::Text(data.content.clone()))),
        BodyRef::None => (None, None),
    };

    let (json, data) = if args.json.is_none() && args.data.is_none() {
        decoded_body
    } else {
        let data = args.data.clone().map(Payload::Text).or(match decoded_body.1 {
            Some(Payload::Bytes(bytes)) => Some(Payload::Bytes(bytes)),
            _ => None,
        });
        (args.json.clone(), data)
    };

    let mut files = BTreeMap::new();
    for (field, stored) in &record.files {
        let mut file = FileField::from_bytes(stored.filename.clone(), stored.decoded()?);
        file.content_type = stored.content_type.clone();
        files.insert(field.clone(), file);
    }

    Ok(RequestSpec {
        method: record.method.clone(),
        url: record.url.clone(),
        headers: (!record.headers.is_empty()).then(|| record.headers.clone()),
        params: Vec::new(),
        json,
        data,
        files,
        timeout: args.timeout_ms.map(Duration::from_millis),
        extra: args.extra.clone(),
    })
}
