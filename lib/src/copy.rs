// Copyright 2025 The pgit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Row encoder for `COPY ... FROM STDIN WITH (FORMAT text)`.
//!
//! The text format is tab-separated with `\N` for NULL; backslash, tab,
//! newline and carriage return must be escaped inside values. `BYTEA` values
//! are sent in hex input form (`\x...`), which needs its backslash doubled.

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;

#[derive(Debug, Default)]
pub(crate) struct CopyBuffer {
    buf: Vec<u8>,
    rows: usize,
    row_open: bool,
}

impl CopyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        debug_assert!(!self.row_open, "unfinished row in copy buffer");
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.rows = 0;
        self.row_open = false;
    }

    fn separator(&mut self) {
        if self.row_open {
            self.buf.push(b'\t');
        }
        self.row_open = true;
    }

    pub fn end_row(&mut self) {
        debug_assert!(self.row_open, "empty row in copy buffer");
        self.buf.push(b'\n');
        self.rows += 1;
        self.row_open = false;
    }

    pub fn null(&mut self) {
        self.separator();
        self.buf.extend_from_slice(b"\\N");
    }

    pub fn int(&mut self, value: i32) {
        self.separator();
        self.buf.extend_from_slice(value.to_string().as_bytes());
    }

    pub fn bool(&mut self, value: bool) {
        self.separator();
        self.buf.push(if value { b't' } else { b'f' });
    }

    pub fn text(&mut self, value: &str) {
        self.separator();
        for &byte in value.as_bytes() {
            match byte {
                b'\\' => self.buf.extend_from_slice(b"\\\\"),
                b'\t' => self.buf.extend_from_slice(b"\\t"),
                b'\n' => self.buf.extend_from_slice(b"\\n"),
                b'\r' => self.buf.extend_from_slice(b"\\r"),
                _ => self.buf.push(byte),
            }
        }
    }

    pub fn opt_text(&mut self, value: Option<&str>) {
        match value {
            Some(value) => self.text(value),
            None => self.null(),
        }
    }

    pub fn bytea(&mut self, value: &[u8]) {
        self.separator();
        self.buf.extend_from_slice(b"\\\\x");
        let mut hex_buf = [0_u8; 2];
        for &byte in value {
            hex::encode_to_slice([byte], &mut hex_buf).unwrap();
            self.buf.extend_from_slice(&hex_buf);
        }
    }

    pub fn opt_bytea(&mut self, value: Option<&[u8]>) {
        match value {
            Some(value) => self.bytea(value),
            None => self.null(),
        }
    }

    /// Integer-array literal, e.g. `{1,2,3}`. Integers need no escaping.
    pub fn int_array<I: IntoIterator<Item = i32>>(&mut self, values: I) {
        self.separator();
        self.buf.push(b'{');
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.buf.push(b',');
            }
            self.buf.extend_from_slice(value.to_string().as_bytes());
        }
        self.buf.push(b'}');
    }

    pub fn timestamptz(&mut self, value: DateTime<Utc>) {
        self.separator();
        self.buf
            .extend_from_slice(value.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn test_plain_row() {
        let mut buf = CopyBuffer::new();
        buf.int(7);
        buf.text("hello");
        buf.bool(true);
        buf.end_row();
        assert_eq!(buf.as_bytes(), b"7\thello\tt\n");
        assert_eq!(buf.rows(), 1);
    }

    #[test]
    fn test_escapes_control_bytes() {
        let mut buf = CopyBuffer::new();
        buf.text("a\tb\nc\rd\\e");
        buf.end_row();
        assert_eq!(buf.as_bytes(), b"a\\tb\\nc\\rd\\\\e\n");
    }

    #[test]
    fn test_null_and_bytea() {
        let mut buf = CopyBuffer::new();
        buf.null();
        buf.bytea(&[0xde, 0xad, 0x00]);
        buf.end_row();
        assert_eq!(buf.as_bytes(), b"\\N\t\\\\xdead00\n");
    }

    #[test]
    fn test_int_array() {
        let mut buf = CopyBuffer::new();
        buf.int_array([3, 1, 2]);
        buf.int_array(std::iter::empty());
        buf.end_row();
        assert_eq!(buf.as_bytes(), b"{3,1,2}\t{}\n");
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let mut buf = CopyBuffer::new();
        buf.timestamptz(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
        buf.end_row();
        assert_eq!(buf.as_bytes(), b"2024-05-01T12:30:00.000000Z\n");
    }

    #[test]
    fn test_clear_resets_row_state() {
        let mut buf = CopyBuffer::new();
        buf.int(1);
        buf.end_row();
        buf.clear();
        assert!(buf.is_empty());
        buf.text("x");
        buf.end_row();
        assert_eq!(buf.as_bytes(), b"x\n");
    }
}
