//! Represents a blob (object) and the metadata the engine moves around with it.

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, io};

/// Content type stores use for pseudo-directory placeholders.
pub const DIRECTORY_CONTENT_TYPE: &str = "application/directory";

/// Metadata describing a single blob within a container.
///
/// A `BlobMetadata` is a value: once read from a store it is never mutated
/// in place. Anything that changes an object builds a new one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Container (bucket) holding the blob.
    pub container: String,

    /// Object key within the container.
    pub name: String,

    /// Content hash as reported by the store (hex MD5 for the bundled stores).
    pub etag: String,

    /// Size in bytes.
    pub size: u64,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    pub content_encoding: Option<String>,

    pub content_language: Option<String>,

    pub content_disposition: Option<String>,

    /// Raw MD5 digest of the content, when known.
    #[serde(with = "md5_base64", default)]
    pub content_md5: Option<Vec<u8>>,

    /// Expiry advertised to clients.
    pub expires: Option<DateTime<Utc>>,

    /// When the object was first written to the store.
    pub created_at: Option<DateTime<Utc>>,

    /// When the object was last written to the store.
    pub last_modified: DateTime<Utc>,

    /// User-defined metadata; keys are unique.
    pub user_metadata: BTreeMap<String, String>,
}

impl BlobMetadata {
    /// Blank metadata for `name`; stores fill in the rest on put.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            container: String::new(),
            name: name.into(),
            etag: String::new(),
            size: 0,
            content_type: None,
            content_encoding: None,
            content_language: None,
            content_disposition: None,
            content_md5: None,
            expires: None,
            created_at: None,
            last_modified: DateTime::<Utc>::UNIX_EPOCH,
            user_metadata: BTreeMap::new(),
        }
    }

    /// Pseudo-directory placeholders are inert for tiering purposes.
    pub fn is_directory(&self) -> bool {
        self.content_type.as_deref() == Some(DIRECTORY_CONTENT_TYPE)
    }

    /// Copy of the caller-controlled fields, dropping everything a store
    /// computes on write (etag, size, timestamps).
    pub fn to_put_metadata(&self) -> BlobMetadata {
        BlobMetadata {
            container: self.container.clone(),
            name: self.name.clone(),
            content_type: self.content_type.clone(),
            content_encoding: self.content_encoding.clone(),
            content_language: self.content_language.clone(),
            content_disposition: self.content_disposition.clone(),
            content_md5: self.content_md5.clone(),
            expires: self.expires,
            user_metadata: self.user_metadata.clone(),
            ..BlobMetadata::new(self.name.clone())
        }
    }
}

/// Strip surrounding quotes; some providers quote ETags, some don't.
pub fn trim_etag(etag: &str) -> &str {
    let etag = etag.strip_prefix('"').unwrap_or(etag);
    etag.strip_suffix('"').unwrap_or(etag)
}

/// ETag comparison tolerant of quoting and hex case.
pub fn etags_equal(a: &str, b: &str) -> bool {
    trim_etag(a).eq_ignore_ascii_case(trim_etag(b))
}

/// Blob content: either fully buffered or a stream of chunks.
pub enum Payload {
    Buffered(Bytes),
    Streaming(BoxStream<'static, io::Result<Bytes>>),
}

impl Payload {
    pub fn empty() -> Self {
        Payload::Buffered(Bytes::new())
    }

    pub fn from_stream(stream: BoxStream<'static, io::Result<Bytes>>) -> Self {
        Payload::Streaming(stream)
    }

    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            Payload::Buffered(bytes) if bytes.is_empty() => futures::stream::empty().boxed(),
            Payload::Buffered(bytes) => futures::stream::once(async move { Ok(bytes) }).boxed(),
            Payload::Streaming(stream) => stream,
        }
    }

    /// Collect the whole payload into memory, stopping at the first error.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Payload::Buffered(bytes) => Ok(bytes),
            Payload::Streaming(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Buffered(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Buffered(Bytes::from(bytes))
    }
}

impl From<&'static str> for Payload {
    fn from(text: &'static str) -> Self {
        Payload::Buffered(Bytes::from_static(text.as_bytes()))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Buffered(bytes) => write!(f, "Payload::Buffered({} bytes)", bytes.len()),
            Payload::Streaming(_) => write!(f, "Payload::Streaming(..)"),
        }
    }
}

/// A blob: metadata plus content.
#[derive(Debug)]
pub struct Blob {
    pub metadata: BlobMetadata,
    pub payload: Payload,
}

impl Blob {
    pub fn new(metadata: BlobMetadata, payload: impl Into<Payload>) -> Self {
        Self {
            metadata,
            payload: payload.into(),
        }
    }

    /// Shorthand for a blob with default metadata.
    pub fn from_bytes(name: impl Into<String>, content: impl Into<Payload>) -> Self {
        Self::new(BlobMetadata::new(name), content)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

mod md5_base64 {
    use base64::{Engine as _, engine::general_purpose};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => ser.serialize_some(&general_purpose::STANDARD.encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(de)?;
        encoded
            .map(|text| {
                general_purpose::STANDARD
                    .decode(text.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
