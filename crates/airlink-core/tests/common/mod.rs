//! Common test utilities for AirLink integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use airlink_core::config::Config;
use airlink_core::notify::ServerEvent;
use airlink_core::web::{AppState, SharedState};
use airlink_core::Connection;
use tokio::sync::mpsc;

/// Multipart boundary used by [`multipart_body`].
pub const BOUNDARY: &str = "airlink-test-boundary";

/// Base URL the test relay announces.
pub const HOST_URL: &str = "http://127.0.0.1:8080";

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Configuration with short intervals so tests see progress quickly.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.localhost_only = true;
    config.transfer.chunk_size = 64 * 1024;
    config.transfer.progress_interval = Duration::from_millis(1);
    config.transfer.pause_recheck = Duration::from_millis(20);
    config
}

/// Fresh relay state.
pub fn relay(config: Config) -> SharedState {
    Arc::new(AppState::new(config, HOST_URL))
}

/// A device attached directly to the registry, bypassing the WebSocket.
pub struct TestDevice {
    pub id: String,
    pub events: mpsc::Receiver<ServerEvent>,
}

impl TestDevice {
    /// Everything queued for this device so far.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

/// Register a device with address `ip`.
pub fn connect(state: &AppState, ip: &str) -> TestDevice {
    let (connection, events) = Connection::new();
    let id = state.devices.register_connection(ip, connection);
    TestDevice { id, events }
}

/// Build a `multipart/form-data` body.
///
/// Text fields are written in order, then the file part if given.
pub fn multipart_body(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        push_text_part(&mut body, name, value);
    }
    if let Some((filename, data)) = file {
        push_file_part(&mut body, filename, data);
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Build a `multipart/form-data` body with the file part ahead of the text
/// fields, the order browser `FormData` uploads use.
pub fn file_first_multipart_body(file: (&str, &[u8]), fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    push_file_part(&mut body, file.0, file.1);
    for (name, value) in fields {
        push_text_part(&mut body, name, value);
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Build a body that stops partway through the file part, with no closing
/// boundary.
pub fn truncated_multipart_body(fields: &[(&str, &str)], file: (&str, &[u8])) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        push_text_part(&mut body, name, value);
    }
    push_file_part(&mut body, file.0, file.1);
    body.truncate(body.len() - file.1.len() / 2 - 2);
    body
}

fn push_text_part(body: &mut Vec<u8>, name: &str, value: &str) {
    body.extend_from_slice(
        format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
            .as_bytes(),
    );
}

fn push_file_part(body: &mut Vec<u8>, filename: &str, data: &[u8]) {
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");
}

/// `Content-Type` header value matching [`multipart_body`].
pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}
