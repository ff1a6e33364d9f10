/*
 * multipart.rs
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

//! multipart/form-data body construction (RFC 2046 / RFC 7578 layout).
//!
//! Bodies are appended piecewise into a byte buffer so that a file part can be
//! opened with `start_file_part`, streamed by the transport from disk, and
//! closed with `finish_file_part` + `add_final_delimiter` in a separate buffer.

use rand::Rng;

/// Generate a boundary: 27 dashes followed by two random 32-bit values in hex.
pub fn generate_boundary() -> String {
    let mut rng = rand::thread_rng();
    let r1: u32 = rng.gen();
    let r2: u32 = rng.gen();
    format!("---------------------------{:08X}{:08X}", r1, r2)
}

/// Content-Type header value for a multipart/form-data body with the given boundary.
pub fn content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={}", boundary)
}

/// Append a complete form field part: delimiter, disposition, blank line, value.
pub fn add_field_part(out: &mut Vec<u8>, name: &str, value: &str, boundary: &str) {
    append_delimiter(out, boundary);
    append_disposition(out, name, None);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Append the head of a file part. The file content follows, then `finish_file_part`.
pub fn start_file_part(
    out: &mut Vec<u8>,
    name: &str,
    filename: &str,
    content_type: &str,
    boundary: &str,
) {
    append_delimiter(out, boundary);
    append_disposition(out, name, Some(filename));
    if !content_type.is_empty() {
        append_header(out, "Content-Type", content_type);
    }
    out.extend_from_slice(b"\r\n");
}

/// Terminate the content of a part started with `start_file_part`.
pub fn finish_file_part(out: &mut Vec<u8>) {
    out.extend_from_slice(b"\r\n");
}

/// Append the closing delimiter `--boundary--`.
pub fn add_final_delimiter(out: &mut Vec<u8>, boundary: &str) {
    out.extend_from_slice(b"--");
    out.extend_from_slice(boundary.as_bytes());
    out.extend_from_slice(b"--\r\n");
}

fn append_delimiter(out: &mut Vec<u8>, boundary: &str) {
    out.extend_from_slice(b"--");
    out.extend_from_slice(boundary.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn append_disposition(out: &mut Vec<u8>, name: &str, filename: Option<&str>) {
    let mut value = format!("form-data; name=\"{}\"", name);
    if let Some(f) = filename {
        value.push_str("; filename=\"");
        value.push_str(f);
        value.push('"');
    }
    append_header(out, "Content-Disposition", &value);
}

fn append_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_shape() {
        let b = generate_boundary();
        assert_eq!(b.len(), 27 + 16);
        assert!(b.starts_with(&"-".repeat(27)));
        assert!(b[27..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(generate_boundary(), generate_boundary());
    }

    #[test]
    fn field_part_layout() {
        let mut out = Vec::new();
        add_field_part(&mut out, "x", "1", "B");
        add_final_delimiter(&mut out, "B");
        assert_eq!(
            out,
            b"--B\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\n1\r\n--B--\r\n"
        );
    }

    #[test]
    fn file_part_layout() {
        let mut head = Vec::new();
        start_file_part(&mut head, "upload", "a.txt", "text/plain", "B");
        assert_eq!(
            head,
            b"--B\r\nContent-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\n"
        );
        let mut tail = Vec::new();
        finish_file_part(&mut tail);
        add_final_delimiter(&mut tail, "B");
        assert_eq!(tail, b"\r\n--B--\r\n");
    }

    #[test]
    fn file_part_without_content_type() {
        let mut head = Vec::new();
        start_file_part(&mut head, "f", "b.bin", "", "B");
        assert_eq!(
            head,
            b"--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"b.bin\"\r\n\r\n"
        );
    }
}
