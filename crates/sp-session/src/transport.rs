use async_trait::async_trait;
use std::io;

/// An authenticated, ordered byte stream to the device.
///
/// Implementations only move bytes; prompt handling lives in
/// [`crate::session::Session`].
#[async_trait]
pub trait Transport: Send {
    /// Write all of `data` to the device.
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Wait for the next chunk of output. `Ok(None)` means the stream ended.
    async fn read(&mut self) -> io::Result<Option<Vec<u8>>>;

    /// Tear down the underlying channel. Must be safe to call twice.
    async fn close(&mut self) -> io::Result<()>;
}
