//! Camera source: on-demand only. No acquisition loop and no health
//! monitoring; a failed capture just leaves the tick's image null.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::warn;

use super::hal::{FrameGrabber, GrabberFactory};

pub struct CameraSource {
    grabber: tokio::sync::Mutex<Option<Box<dyn FrameGrabber>>>,
    factory: GrabberFactory,
}

impl CameraSource {
    pub fn new(factory: GrabberFactory) -> Self {
        let grabber = match factory() {
            Ok(g) => Some(g),
            Err(e) => {
                warn!(error = %e, "camera unavailable, continuing without image capture");
                None
            }
        };
        Self {
            grabber: tokio::sync::Mutex::new(grabber),
            factory,
        }
    }

    /// Capture one frame and return it base64-encoded, or None on failure.
    /// A failure drops the handle so the next capture retries the open.
    pub async fn capture(&self) -> Option<String> {
        let mut slot = self.grabber.lock().await;
        if slot.is_none() {
            match (self.factory)() {
                Ok(g) => *slot = Some(g),
                Err(e) => {
                    warn!(error = %e, "camera reopen failed");
                    return None;
                }
            }
        }
        let grabber = slot.as_mut()?;
        match grabber.grab_jpeg().await {
            Ok(jpeg) => Some(BASE64.encode(jpeg)),
            Err(e) => {
                warn!(error = %e, "frame capture failed");
                *slot = None;
                None
            }
        }
    }

    pub async fn release(&self) {
        *self.grabber.lock().await = None;
    }
}
