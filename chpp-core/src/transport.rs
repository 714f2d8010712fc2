//! Seam to the transport layer below the app layer (framing, checksums and the link live there).

/// Outbound side of the transport as seen by the app layer.
pub trait Transport: Send + Sync {
    /// Queue a datagram for transmission. Ownership passes to the transport on success.
    fn enqueue(&self, datagram: Vec<u8>) -> Result<(), TransportError>;

    /// Reset the link. Called when a send finds an initialised endpoint closed.
    fn force_reset(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("link down")]
    LinkDown,
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn enqueue(&self, datagram: Vec<u8>) -> Result<(), TransportError> {
        (**self).enqueue(datagram)
    }

    fn force_reset(&self) {
        (**self).force_reset()
    }
}
