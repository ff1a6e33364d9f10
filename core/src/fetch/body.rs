/*
 * body.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Fetchpool, an HTTP request orchestration library.
 *
 * Fetchpool is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fetchpool is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fetchpool.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Request body assembly. File content is never buffered: multipart files and
//! raw file bodies become file elements the engine streams at send time.

use bytes::Bytes;

use super::{FilePart, RawUpload, UploadMode};
use crate::engine::{UploadData, UploadElement};
use crate::mime::multipart;
use crate::params::{encode_params, UrlParams};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A body ready to attach to a transport request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PreparedUpload {
    pub content_type: Option<String>,
    /// Set when the whole body is in memory; file bodies are measured by the engine.
    pub content_length: Option<u64>,
    pub data: UploadData,
}

/// Build the body for `mode`, or `None` when the request has no body.
pub(crate) fn prepare_upload(mode: &UploadMode, params: &UrlParams) -> Option<PreparedUpload> {
    match mode {
        UploadMode::Query(None) => None,
        UploadMode::Query(Some(RawUpload::Bytes { content_type, data })) => Some(PreparedUpload {
            content_type: non_empty(content_type),
            content_length: Some(data.len() as u64),
            data: UploadData::from_bytes(data.clone()),
        }),
        UploadMode::Query(Some(RawUpload::File {
            content_type,
            path,
            offset,
            length,
        })) => Some(PreparedUpload {
            content_type: non_empty(content_type),
            content_length: None,
            data: UploadData {
                elements: vec![UploadElement::File {
                    path: path.clone(),
                    offset: *offset,
                    length: *length,
                }],
            },
        }),
        UploadMode::Form if params.is_empty() => None,
        UploadMode::Form => {
            let body = encode_params(params);
            Some(PreparedUpload {
                content_type: Some(FORM_CONTENT_TYPE.to_string()),
                content_length: Some(body.len() as u64),
                data: UploadData::from_bytes(body),
            })
        }
        UploadMode::Multipart(None) if params.is_empty() => None,
        UploadMode::Multipart(file) => Some(prepare_multipart(
            params,
            file.as_ref(),
            &multipart::generate_boundary(),
        )),
    }
}

/// Fields first, then the optional file part, then the closing delimiter.
pub(crate) fn prepare_multipart(params: &UrlParams, file: Option<&FilePart>, boundary: &str) -> PreparedUpload {
    let mut head = Vec::new();
    for (name, value) in params {
        multipart::add_field_part(&mut head, name, value, boundary);
    }
    let content_type = Some(multipart::content_type(boundary));
    match file {
        Some(file) => {
            multipart::start_file_part(&mut head, &file.key, &file.filename, &file.content_type, boundary);
            let mut tail = Vec::new();
            multipart::finish_file_part(&mut tail);
            multipart::add_final_delimiter(&mut tail, boundary);
            PreparedUpload {
                content_type,
                content_length: None,
                data: UploadData {
                    elements: vec![
                        UploadElement::Bytes(Bytes::from(head)),
                        UploadElement::File {
                            path: file.path.clone(),
                            offset: file.offset,
                            length: file.length,
                        },
                        UploadElement::Bytes(Bytes::from(tail)),
                    ],
                },
            }
        }
        None => {
            multipart::add_final_delimiter(&mut head, boundary);
            PreparedUpload {
                content_type,
                content_length: Some(head.len() as u64),
                data: UploadData::from_bytes(head),
            }
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use std::path::PathBuf;

    fn params(pairs: &[(&str, &str)]) -> UrlParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Flatten an upload the way the engine sends it.
    fn materialize(data: &UploadData) -> Vec<u8> {
        let mut out = Vec::new();
        for element in &data.elements {
            match element {
                UploadElement::Bytes(b) => out.extend_from_slice(b),
                UploadElement::File { path, offset, length } => {
                    let mut f = std::fs::File::open(path).unwrap();
                    f.seek(SeekFrom::Start(*offset)).unwrap();
                    match length {
                        Some(n) => {
                            let mut buf = vec![0u8; *n as usize];
                            f.read_exact(&mut buf).unwrap();
                            out.extend_from_slice(&buf);
                        }
                        None => {
                            f.read_to_end(&mut out).unwrap();
                        }
                    }
                }
            }
        }
        out
    }

    /// Minimal multipart/form-data reader: (name, filename, content-type, body) per part.
    fn parse_multipart(body: &[u8], boundary: &str) -> Vec<(String, Option<String>, Option<String>, Vec<u8>)> {
        let delimiter = format!("--{}", boundary).into_bytes();
        let mut parts = Vec::new();
        let mut pos = find(body, &delimiter, 0).expect("first delimiter");
        loop {
            pos += delimiter.len();
            if body[pos..].starts_with(b"--") {
                break;
            }
            assert!(body[pos..].starts_with(b"\r\n"));
            pos += 2;
            let headers_end = find(body, b"\r\n\r\n", pos).expect("part headers");
            let headers = std::str::from_utf8(&body[pos..headers_end]).unwrap();
            let next = find(body, &delimiter, headers_end + 4).expect("next delimiter");
            // Content ends before the CRLF that precedes the delimiter.
            let content = body[headers_end + 4..next - 2].to_vec();
            let mut name = String::new();
            let mut filename = None;
            let mut content_type = None;
            for line in headers.split("\r\n") {
                if let Some(v) = line.strip_prefix("Content-Type: ") {
                    content_type = Some(v.to_string());
                } else if line.starts_with("Content-Disposition: form-data") {
                    for attr in line.split("; ").skip(1) {
                        let (k, v) = attr.split_once('=').unwrap();
                        let v = v.trim_matches('"').to_string();
                        match k {
                            "name" => name = v,
                            "filename" => filename = Some(v),
                            _ => {}
                        }
                    }
                }
            }
            parts.push((name, filename, content_type, content));
            pos = next;
        }
        parts
    }

    fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
        haystack[from..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|p| p + from)
    }

    fn temp_file(name: &str, content: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("fetchpool-body-{}-{}", std::process::id(), name));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn no_body_by_default() {
        assert!(prepare_upload(&UploadMode::Query(None), &params(&[("a", "1")])).is_none());
        assert!(prepare_upload(&UploadMode::Form, &UrlParams::new()).is_none());
        assert!(prepare_upload(&UploadMode::Multipart(None), &UrlParams::new()).is_none());
    }

    #[test]
    fn raw_body_keeps_its_content_type() {
        let mode = UploadMode::Query(Some(RawUpload::Bytes {
            content_type: "application/json".into(),
            data: Bytes::from_static(b"{\"a\":1}"),
        }));
        let up = prepare_upload(&mode, &UrlParams::new()).unwrap();
        assert_eq!(up.content_type.as_deref(), Some("application/json"));
        assert_eq!(up.content_length, Some(7));
        assert_eq!(materialize(&up.data), b"{\"a\":1}");

        let mode = UploadMode::Query(Some(RawUpload::Bytes {
            content_type: String::new(),
            data: Bytes::from_static(b"x"),
        }));
        assert_eq!(prepare_upload(&mode, &UrlParams::new()).unwrap().content_type, None);
    }

    #[test]
    fn raw_file_is_streamed() {
        let mode = UploadMode::Query(Some(RawUpload::File {
            content_type: "application/octet-stream".into(),
            path: PathBuf::from("/data/blob"),
            offset: 10,
            length: Some(5),
        }));
        let up = prepare_upload(&mode, &UrlParams::new()).unwrap();
        assert_eq!(up.content_length, None);
        assert_eq!(
            up.data.elements,
            vec![UploadElement::File {
                path: PathBuf::from("/data/blob"),
                offset: 10,
                length: Some(5)
            }]
        );
    }

    #[test]
    fn form_body_is_sorted_and_encoded() {
        let up = prepare_upload(&UploadMode::Form, &params(&[("b", "x y"), ("a", "1&2")])).unwrap();
        assert_eq!(up.content_type.as_deref(), Some(FORM_CONTENT_TYPE));
        assert_eq!(materialize(&up.data), b"a=1%262&b=x%20y");
        assert_eq!(up.content_length, Some(15));
    }

    #[test]
    fn multipart_fields_only() {
        let boundary = "---------------------------0000000100000002";
        let up = prepare_multipart(&params(&[("k", "v"), ("a", "b")]), None, boundary);
        assert_eq!(
            up.content_type.as_deref(),
            Some("multipart/form-data; boundary=---------------------------0000000100000002")
        );
        let body = materialize(&up.data);
        assert_eq!(up.content_length, Some(body.len() as u64));
        let parts = parse_multipart(&body, boundary);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, "a");
        assert_eq!(parts[0].3, b"b");
        assert_eq!(parts[1].0, "k");
        assert_eq!(parts[1].3, b"v");
        assert!(body.ends_with(format!("--{}--\r\n", boundary).as_bytes()));
    }

    #[test]
    fn multipart_with_file_round_trips() {
        let content: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let path = temp_file("multipart", &content);
        let file = FilePart {
            key: "upload".into(),
            filename: "data.bin".into(),
            content_type: "application/octet-stream".into(),
            path: path.clone(),
            offset: 0,
            length: None,
        };
        let boundary = "---------------------------DEADBEEFCAFEF00D";
        let up = prepare_multipart(&params(&[("title", "hello world")]), Some(&file), boundary);
        assert_eq!(up.content_length, None);
        assert_eq!(up.data.elements.len(), 3);

        let parts = parse_multipart(&materialize(&up.data), boundary);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], ("title".into(), None, None, b"hello world".to_vec()));
        assert_eq!(parts[1].0, "upload");
        assert_eq!(parts[1].1.as_deref(), Some("data.bin"));
        assert_eq!(parts[1].2.as_deref(), Some("application/octet-stream"));
        assert_eq!(parts[1].3, content);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn multipart_file_without_fields_still_has_a_body() {
        let path = temp_file("file-only", b"abcdef");
        let file = FilePart {
            key: "f".into(),
            filename: "f.txt".into(),
            content_type: String::new(),
            path: path.clone(),
            offset: 2,
            length: Some(3),
        };
        let up = prepare_upload(&UploadMode::Multipart(Some(file)), &UrlParams::new()).unwrap();
        let boundary = up
            .content_type
            .as_deref()
            .and_then(|ct| ct.strip_prefix("multipart/form-data; boundary="))
            .unwrap()
            .to_string();
        let parts = parse_multipart(&materialize(&up.data), &boundary);
        assert_eq!(parts, vec![("f".into(), Some("f.txt".into()), None, b"cde".to_vec())]);
        std::fs::remove_file(path).unwrap();
    }
}
