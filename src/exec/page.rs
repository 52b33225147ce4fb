// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Pages of row-encoded data moved between operators.
//!
//! A page is a list of opaque row payloads. Row encoding belongs to the planner and connector
//! layers; the execution core only needs positions and sizes. Pages have a compact binary
//! form used for splits and for disk output:
//!
//! ```text
//! magic "NXPG" | u32 row count | (u32 length | payload)*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::error::{ExecResult, ExecutionError};

const PAGE_MAGIC: [u8; 4] = *b"NXPG";
const PAGE_HEADER_LEN: usize = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Page {
    rows: Vec<Bytes>,
    size_in_bytes: u64,
}

impl Page {
    pub fn new(rows: Vec<Bytes>) -> Self {
        let size_in_bytes = rows.iter().map(|r| r.len() as u64).sum();
        Self {
            rows,
            size_in_bytes,
        }
    }

    pub fn positions(&self) -> usize {
        self.rows.len()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    pub fn rows(&self) -> &[Bytes] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Bytes> {
        self.rows
    }

    pub fn serialize(&self) -> Bytes {
        let payload: usize = self.rows.iter().map(|r| 4 + r.len()).sum();
        let mut buf = BytesMut::with_capacity(PAGE_HEADER_LEN + payload);
        buf.put_slice(&PAGE_MAGIC);
        buf.put_u32_le(self.rows.len() as u32);
        for row in &self.rows {
            buf.put_u32_le(row.len() as u32);
            buf.put_slice(row);
        }
        buf.freeze()
    }

    /// Decode one page from the front of `buf`, advancing it past the page.
    pub fn deserialize(buf: &mut Bytes) -> ExecResult<Page> {
        if buf.remaining() < PAGE_HEADER_LEN {
            return Err(ExecutionError::internal("serialized page is too small"));
        }
        if buf[..4] != PAGE_MAGIC {
            return Err(ExecutionError::internal("serialized page magic mismatch"));
        }
        buf.advance(4);
        let count = buf.get_u32_le() as usize;
        let mut rows = Vec::with_capacity(count);
        for idx in 0..count {
            if buf.remaining() < 4 {
                return Err(ExecutionError::internal(format!(
                    "serialized page truncated at row {}",
                    idx
                )));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(ExecutionError::internal(format!(
                    "serialized page truncated in row {}: need {} bytes, have {}",
                    idx,
                    len,
                    buf.remaining()
                )));
            }
            rows.push(buf.split_to(len));
        }
        Ok(Page::new(rows))
    }

    /// Decode a buffer holding a sequence of serialized pages.
    pub fn deserialize_all(mut buf: Bytes) -> ExecResult<Vec<Page>> {
        let mut pages = Vec::new();
        while buf.has_remaining() {
            pages.push(Page::deserialize(&mut buf)?);
        }
        Ok(pages)
    }
}

/// Rows handed to a consumer of ROW output, tagged with the producing partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowBatch {
    pub partition: u32,
    pub rows: Vec<Bytes>,
}

impl RowBatch {
    pub fn size_in_bytes(&self) -> u64 {
        self.rows.iter().map(|r| r.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_of_pages_decodes_in_order() {
        let a = Page::new(vec![Bytes::from_static(b"x"), Bytes::from_static(b"yz")]);
        let b = Page::new(vec![Bytes::new()]);
        let mut buf = BytesMut::new();
        buf.put(a.serialize());
        buf.put(b.serialize());
        let pages = Page::deserialize_all(buf.freeze()).unwrap();
        assert_eq!(pages, vec![a.clone(), b]);
        assert_eq!(pages[0].size_in_bytes(), 3);
    }

    #[test]
    fn test_truncated_page_is_rejected() {
        let page = Page::new(vec![Bytes::from_static(b"hello")]);
        let bytes = page.serialize();
        let mut truncated = bytes.slice(..bytes.len() - 2);
        let err = Page::deserialize(&mut truncated).unwrap_err();
        assert!(err.message().contains("truncated"));
    }
}
