//! Shared helpers for the wire protocol tests

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use sealdrop_client::{Delivery, Sink};
use sealdrop_crypto::{
    seal_filename, ChunkTag, Nonce, PushStream, ShareReference, TransferKey,
};
use std::sync::{Arc, Mutex};

/// Find the first occurrence of `needle` in `haystack`
pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Pull the raw bytes of the multipart part named `file` out of a recorded
/// request body
pub fn extract_file_part(request: &wiremock::Request) -> Vec<u8> {
    let content_type = request
        .headers
        .get("content-type")
        .expect("multipart request carries a content type")
        .to_str()
        .expect("content type is ascii");
    let boundary = content_type
        .split("boundary=")
        .nth(1)
        .expect("content type carries a boundary")
        .to_string();

    let body = &request.body;
    let part_start = find_subslice(body, b"name=\"file\"").expect("body has a file part");
    let data_start = part_start
        + find_subslice(&body[part_start..], b"\r\n\r\n").expect("part has a header break")
        + 4;
    let delimiter = format!("\r\n--{}", boundary);
    let data_end = data_start
        + find_subslice(&body[data_start..], delimiter.as_bytes())
            .expect("part is terminated by the boundary");

    body[data_start..data_end].to_vec()
}

/// Encrypt `plaintext` the way the upload pipeline would: envelope first,
/// then full chunks, the trailing chunk bearing the terminal tag
pub fn build_wire(
    plaintext: &[u8],
    filename: &str,
    chunk_size: usize,
) -> (ShareReference, Vec<u8>) {
    let key = TransferKey::generate();
    let nonce = Nonce::generate();
    let (mut push, header) = PushStream::init(&key);

    let mut wire = seal_filename(filename, &key, &nonce)
        .expect("filename fits the envelope")
        .to_vec();

    let chunks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![&[][..]]
    } else {
        plaintext.chunks(chunk_size).collect()
    };
    for (index, chunk) in chunks.iter().enumerate() {
        let tag = if index == chunks.len() - 1 {
            ChunkTag::Final
        } else {
            ChunkTag::Message
        };
        wire.extend(push.push(chunk, tag).expect("push succeeds"));
    }

    (ShareReference::new(key, header, nonce), wire)
}

/// A sink that exposes everything it was handed, surviving the manager's
/// error paths so tests can assert on partial deliveries
#[derive(Clone, Default)]
pub struct RecordingSink {
    delivered: Arc<Mutex<Vec<u8>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<u8> {
        self.delivered.lock().expect("sink lock").clone()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write(&mut self, chunk: Bytes) -> sealdrop_client::Result<()> {
        self.delivered
            .lock()
            .expect("sink lock")
            .extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> sealdrop_client::Result<Delivery> {
        let data = self.delivered.lock().expect("sink lock").clone();
        Ok(Delivery::Buffered(Bytes::from(data)))
    }
}
