use std::io;
use std::str::FromStr;

use futures::StreamExt;
use mime::Mime;

use super::json::JsonCheck;
use crate::store::ByteStream;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid MIME type {0:?}")]
    InvalidMimeType(String),
    #[error("content does not match declared MIME type {declared}: {reason}")]
    Mismatch { declared: String, reason: String },
}

/// What the content of a MIME type must look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expectation {
    /// Parses as JSON; FHIR JSON must also be an object with a `resourceType`
    Json { fhir: bool },
    Xml,
    /// Valid UTF-8
    Text,
    /// Starts with one of the given signatures
    Magic(&'static [&'static [u8]]),
    /// Unknown types are not checked
    Any,
}

const PDF: &[&[u8]] = &[b"%PDF-"];
const ZIP: &[&[u8]] = &[b"PK\x03\x04", b"PK\x05\x06"];
const GZIP: &[&[u8]] = &[&[0x1f, 0x8b]];
const PNG: &[&[u8]] = &[&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]];
const JPEG: &[&[u8]] = &[&[0xff, 0xd8, 0xff]];

fn expectation(mime: &Mime) -> Expectation {
    let is = |name: mime::Name| mime.subtype() == name || mime.suffix() == Some(name);
    if is(mime::JSON) {
        return Expectation::Json {
            fhir: mime.subtype().as_str().eq_ignore_ascii_case("fhir"),
        };
    }
    if is(mime::XML) {
        return Expectation::Xml;
    }
    if mime.type_() == mime::TEXT {
        return Expectation::Text;
    }
    match mime.essence_str() {
        "application/pdf" => Expectation::Magic(PDF),
        "application/zip" => Expectation::Magic(ZIP),
        "application/gzip" | "application/x-gzip" => Expectation::Magic(GZIP),
        "image/png" => Expectation::Magic(PNG),
        "image/jpeg" => Expectation::Magic(JPEG),
        _ => Expectation::Any,
    }
}

fn parse(declared: &str) -> Result<Mime, ValidationError> {
    Mime::from_str(declared).map_err(|_| ValidationError::InvalidMimeType(declared.to_string()))
}

fn mismatch(declared: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::Mismatch {
        declared: declared.to_string(),
        reason: reason.into(),
    }
}

fn skip_prolog(content: &[u8]) -> &[u8] {
    let content = content.strip_prefix(b"\xef\xbb\xbf").unwrap_or(content);
    let start = content
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(content.len());
    &content[start..]
}

fn check_magic(declared: &str, signatures: &[&[u8]], prefix: &[u8]) -> Result<(), ValidationError> {
    if signatures.iter().any(|s| prefix.starts_with(s)) {
        Ok(())
    } else {
        Err(mismatch(declared, "missing file signature"))
    }
}

/// Check that `content` is what `declared` says it is
pub fn validate(declared: &str, content: &[u8]) -> Result<(), ValidationError> {
    let mime = parse(declared)?;
    match expectation(&mime) {
        Expectation::Json { fhir } => {
            let value: serde_json::Value = serde_json::from_slice(content)
                .map_err(|e| mismatch(declared, format!("invalid JSON: {}", e)))?;
            if fhir && value.get("resourceType").and_then(|v| v.as_str()).is_none() {
                return Err(mismatch(declared, "JSON object without resourceType"));
            }
            Ok(())
        }
        Expectation::Xml => match skip_prolog(content).first() {
            Some(b'<') => Ok(()),
            _ => Err(mismatch(declared, "content does not start with an XML element")),
        },
        Expectation::Text => std::str::from_utf8(content)
            .map(|_| ())
            .map_err(|e| mismatch(declared, format!("invalid UTF-8: {}", e))),
        Expectation::Magic(signatures) => check_magic(declared, signatures, content),
        Expectation::Any => Ok(()),
    }
}

/// Incremental checks for content that is never fully buffered. JSON gets
/// the same checks as [`validate`], XML only on its first significant byte.
struct StreamCheck {
    declared: String,
    expectation: Expectation,
    json: Option<JsonCheck>,
    /// Leading bytes kept until the prefix check is decided
    prefix: Vec<u8>,
    prefix_done: bool,
    /// Incomplete UTF-8 sequence carried over from the previous chunk
    carry: Vec<u8>,
}

impl StreamCheck {
    fn new(declared: &str) -> Result<Self, ValidationError> {
        let mime = parse(declared)?;
        let expectation = expectation(&mime);
        Ok(Self {
            declared: declared.to_string(),
            expectation,
            json: match expectation {
                Expectation::Json { .. } => Some(JsonCheck::new()),
                _ => None,
            },
            prefix: Vec::new(),
            prefix_done: !matches!(expectation, Expectation::Xml | Expectation::Magic(_)),
            carry: Vec::new(),
        })
    }

    fn feed(&mut self, chunk: &[u8]) -> Result<(), ValidationError> {
        if !self.prefix_done {
            self.prefix.extend_from_slice(chunk);
            self.check_prefix(false)?;
        }
        if let Some(json) = self.json.as_mut() {
            json.feed(chunk)
                .map_err(|e| mismatch(&self.declared, format!("invalid JSON: {}", e)))?;
        }
        if matches!(self.expectation, Expectation::Text | Expectation::Json { .. }) {
            self.carry.extend_from_slice(chunk);
            match std::str::from_utf8(&self.carry) {
                Ok(_) => self.carry.clear(),
                Err(e) if e.error_len().is_none() => {
                    let valid = e.valid_up_to();
                    self.carry.drain(..valid);
                }
                Err(e) => return Err(mismatch(&self.declared, format!("invalid UTF-8: {}", e))),
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ValidationError> {
        if !self.prefix_done {
            self.check_prefix(true)?;
        }
        if !self.carry.is_empty() {
            return Err(mismatch(&self.declared, "truncated UTF-8 sequence"));
        }
        if let (Some(json), Expectation::Json { fhir }) = (self.json.as_mut(), self.expectation) {
            let has_resource_type = json
                .finish()
                .map_err(|e| mismatch(&self.declared, format!("invalid JSON: {}", e)))?;
            if fhir && !has_resource_type {
                return Err(mismatch(&self.declared, "JSON object without resourceType"));
            }
        }
        Ok(())
    }

    /// Decide the prefix checks once enough bytes are seen, or at the end
    fn check_prefix(&mut self, end: bool) -> Result<(), ValidationError> {
        let declared = self.declared.clone();
        match self.expectation {
            Expectation::Xml => match skip_prolog(&self.prefix).first() {
                None if !end => return Ok(()),
                Some(b'<') => {}
                _ => return Err(mismatch(&declared, "unexpected leading content")),
            },
            Expectation::Magic(signatures) => {
                let longest = signatures.iter().map(|s| s.len()).max().unwrap_or(0);
                if self.prefix.len() < longest && !end {
                    return Ok(());
                }
                check_magic(&declared, signatures, &self.prefix)?;
            }
            Expectation::Json { .. } | Expectation::Text | Expectation::Any => {}
        }
        self.prefix_done = true;
        self.prefix = Vec::new();
        Ok(())
    }
}

fn invalid(e: ValidationError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Wrap `input` so it fails with an `InvalidData` error wrapping a
/// [`ValidationError`] as soon as its content contradicts `declared`
pub fn validate_stream(declared: &str, input: ByteStream) -> Result<ByteStream, ValidationError> {
    let check = StreamCheck::new(declared)?;
    Ok(
        futures::stream::try_unfold((input, check), |(mut input, mut check)| async move {
            match input.next().await {
                Some(Ok(chunk)) => {
                    check.feed(&chunk).map_err(invalid)?;
                    Ok::<_, io::Error>(Some((chunk, (input, check))))
                }
                Some(Err(e)) => Err(e),
                None => {
                    check.finish().map_err(invalid)?;
                    Ok(None)
                }
            }
        })
        .boxed(),
    )
}

/// The validation failure carried by a stream error, if any
pub fn validation_error(e: &io::Error) -> Option<ValidationError> {
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<ValidationError>())
        .cloned()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::TryStreamExt;

    use super::*;

    fn stream_of(chunks: &[&[u8]]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(items).boxed()
    }

    async fn run(declared: &str, chunks: &[&[u8]]) -> Result<(), Option<ValidationError>> {
        let stream = validate_stream(declared, stream_of(chunks)).map_err(Some)?;
        let collected: Result<Vec<Bytes>, io::Error> = stream.try_collect().await;
        collected.map(|_| ()).map_err(|e| validation_error(&e))
    }

    #[test]
    fn test_fhir_json() {
        assert!(validate("application/fhir+json", br#"{"resourceType":"Bundle"}"#).is_ok());
        assert!(validate("application/fhir+json", br#"{"type":"batch"}"#).is_err());
        assert!(validate("application/fhir+json", b"not json").is_err());
    }

    #[test]
    fn test_plain_json_and_suffix() {
        assert!(validate("application/json", b"[1, 2, 3]").is_ok());
        assert!(validate("application/vnd.api+json", br#"{"a":1}"#).is_ok());
        assert!(validate("application/json", b"").is_err());
    }

    #[test]
    fn test_xml() {
        assert!(validate("application/xml", b"\xef\xbb\xbf<?xml version=\"1.0\"?><a/>").is_ok());
        assert!(validate("application/fhir+xml", b"  <Bundle/>").is_ok());
        assert!(validate("text/xml", b"plain").is_err());
    }

    #[test]
    fn test_text() {
        assert!(validate("text/csv; charset=utf-8", "a,b\nä,ö".as_bytes()).is_ok());
        assert!(validate("text/plain", &[0xff, 0xfe]).is_err());
        assert!(validate("text/plain", b"").is_ok());
    }

    #[test]
    fn test_magic() {
        assert!(validate("application/pdf", b"%PDF-1.7\n...").is_ok());
        assert!(validate("application/pdf", b"%PD").is_err());
        assert!(validate("application/zip", b"PK\x03\x04rest").is_ok());
        assert!(validate("image/png", b"GIF89a").is_err());
    }

    #[test]
    fn test_unknown_and_invalid_types() {
        assert!(validate("application/octet-stream", &[0, 1, 2]).is_ok());
        assert_eq!(
            validate("not a mime", b""),
            Err(ValidationError::InvalidMimeType("not a mime".into()))
        );
    }

    #[tokio::test]
    async fn test_stream_prefix_split_across_chunks() {
        assert!(run("application/pdf", &[b"%P", b"DF", b"-1.4 body"]).await.is_ok());
        assert!(run("application/pdf", &[b"%P", b"XF", b"-1.4 body"]).await.is_err());
        assert!(run("application/fhir+json", &[b"  ", b"\n", b"{\"resourceType\":\"Bundle\"}"])
            .await
            .is_ok());
        assert!(run("application/json", &[b"  ", b"oops"]).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_and_buffer_agree() {
        let cases: &[(&str, &[u8])] = &[
            ("application/fhir+json", br#"{"resourceType": oops not json"#),
            ("application/fhir+json", br#"{"resourceType": "Bundle"}"#),
            ("application/fhir+json", br#"{"type": "batch"}"#),
            ("application/fhir+json", br#"[{"resourceType": "Bundle"}]"#),
            ("application/json", br#"{"a": [1, 2,]}"#),
            ("application/json", b"[1, 2] trailing"),
            ("application/json", b"{\"a\": \"\xff\"}"),
            ("application/xml", b"<a/>"),
            ("text/plain", b"\xff"),
            ("application/pdf", b"%PDF-1.7"),
        ];
        for (declared, body) in cases {
            let buffered = validate(declared, body);
            // split mid-body so the stream sees more than one chunk
            let (head, tail) = body.split_at(body.len() / 2);
            let streamed = run(declared, &[head, tail]).await;
            assert_eq!(
                buffered.is_ok(),
                streamed.is_ok(),
                "{} {:?}",
                declared,
                String::from_utf8_lossy(body)
            );
            if let Err(e) = streamed {
                assert!(matches!(e, Some(ValidationError::Mismatch { .. })));
            }
        }
    }

    #[tokio::test]
    async fn test_stream_utf8_split_sequence() {
        let text = "grüße".as_bytes();
        // split inside the two byte 'ü'
        assert!(run("text/plain", &[&text[..3], &text[3..]]).await.is_ok());
        assert!(run("text/plain", &[&text[..3]]).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_short_content() {
        let result = run("image/png", &[&[0x89, b'P']]).await;
        assert!(matches!(result, Err(Some(ValidationError::Mismatch { .. }))));
        assert!(run("application/json", &[]).await.is_err());
    }
}
