//! Form bodies: URL-encoded and multipart.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::context::parse_pairs;
use crate::error::{HttpError, Result};
use crate::request::Request;

/// A parsed form body. Empty for requests that carry no form.
#[derive(Debug, Default)]
pub struct Form {
    pub values: HashMap<String, Vec<String>>,
    pub files: HashMap<String, Vec<FormFile>>,
}

/// An uploaded multipart file.
///
/// Serialises with its content base64-encoded so it can travel through the
/// JSON object that binding assembles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FormFile {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(serialize_with = "encode", deserialize_with = "decode")]
    pub data: Bytes,
}

fn encode<S: Serializer>(data: &Bytes, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&STANDARD.encode(data))
}

fn decode<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Bytes, D::Error> {
    let s = String::deserialize(d)?;
    STANDARD.decode(s).map(Bytes::from).map_err(serde::de::Error::custom)
}

fn malformed(e: multer::Error) -> crate::error::Error {
    HttpError::bad_request().with_internal(e).into()
}

impl Form {
    pub(crate) async fn parse(req: &Request) -> Result<Self> {
        let ct = req.header("content-type").unwrap_or("");
        if ct.starts_with("application/x-www-form-urlencoded") {
            return Ok(Self { values: parse_pairs(req.body()), files: HashMap::new() });
        }
        if ct.starts_with("multipart/form-data") {
            return Self::parse_multipart(ct, req.body().clone()).await;
        }
        Ok(Self::default())
    }

    async fn parse_multipart(content_type: &str, body: Bytes) -> Result<Self> {
        let boundary = multer::parse_boundary(content_type)
            .map_err(|e| HttpError::bad_request().with_internal(e))?;
        let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(body) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(malformed)? {
            let Some(name) = field.name().map(str::to_owned) else { continue };
            match field.file_name().map(str::to_owned) {
                Some(filename) => {
                    let content_type = field
                        .content_type()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "application/octet-stream".to_owned());
                    let data = field.bytes().await.map_err(malformed)?;
                    let file = FormFile { filename, content_type, size: data.len() as u64, data };
                    form.files.entry(name).or_default().push(file);
                }
                None => {
                    let text = field.text().await.map_err(malformed)?;
                    form.values.entry(name).or_default().push(text);
                }
            }
        }
        Ok(form)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn file(&self, name: &str) -> Option<&FormFile> {
        self.files.get(name).and_then(|v| v.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_urlencoded() {
        let req = Request::new(http::Method::POST, "/")
            .with_header("content-type", "application/x-www-form-urlencoded")
            .with_body("username=a&password=b+c");
        let form = Form::parse(&req).await.unwrap();
        assert_eq!(form.value("username"), Some("a"));
        assert_eq!(form.value("password"), Some("b c"));
    }

    #[tokio::test]
    async fn parses_multipart() {
        let body = "--X\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\r\n\
            hello\r\n\
            --X\r\n\
            Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file body\r\n\
            --X--\r\n";
        let req = Request::new(http::Method::POST, "/")
            .with_header("content-type", "multipart/form-data; boundary=X")
            .with_body(body);
        let form = Form::parse(&req).await.unwrap();
        assert_eq!(form.value("title"), Some("hello"));
        let file = form.file("doc").unwrap();
        assert_eq!(file.filename, "a.txt");
        assert_eq!(file.content_type, "text/plain");
        assert_eq!(&file.data[..], b"file body");
    }

    #[test]
    fn file_survives_json() {
        let file = FormFile {
            filename: "x.bin".into(),
            content_type: "application/octet-stream".into(),
            size: 3,
            data: Bytes::from_static(&[0, 1, 2]),
        };
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["data"], "AAEC");
        assert_eq!(serde_json::from_value::<FormFile>(json).unwrap(), file);
    }
}
