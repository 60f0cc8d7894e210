use std::sync::Arc;

use async_trait::async_trait;

use super::{DeviceFilter, PortHandle, Result, SerialDeviceInfo};

/// The platform's view of serial hardware: which ports this application may
/// use, and a way to ask the user for access to a new one.
#[async_trait]
pub trait SerialHost: Send + Sync {
    /// Ports the user already authorized that are currently present.
    async fn get_ports(&self) -> Result<Vec<Arc<PortHandle>>>;

    /// Prompt the user to grant access to a port matching one of `filters`.
    ///
    /// Returns [`super::SerialError::SelectionCancelled`] when the user
    /// dismisses the prompt.
    async fn request_port(&self, filters: &[DeviceFilter]) -> Result<Arc<PortHandle>>;

    /// Names of the ports access was granted to, for persisting grants.
    async fn authorized_ports(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Device chooser shown during manual pairing.
#[async_trait]
pub trait PortChooser: Send + Sync {
    /// Index into `candidates` of the device the user picked, `None` on cancel.
    async fn choose(&self, candidates: &[SerialDeviceInfo]) -> Option<usize>;
}

/// Chooser that always picks the first candidate, if any.
pub struct FirstMatchChooser;

#[async_trait]
impl PortChooser for FirstMatchChooser {
    async fn choose(&self, candidates: &[SerialDeviceInfo]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}
