//! Test doubles shared by dispatcher and session tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::RwLock;
use tokio::task::yield_now;

use crate::core::bluetooth::connection::{CommandLink, LinkSlot};
use crate::core::error::BridgeError;

/// Records decoded tokens instead of touching a radio.
pub struct RecordingLink {
    pub writes: Arc<StdMutex<Vec<(String, bool)>>>,
    pub fail: AtomicBool,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self {
            writes: Arc::new(StdMutex::new(Vec::new())),
            fail: AtomicBool::new(false),
        }
    }

    /// Decoded tokens in write order.
    pub fn tokens(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(token, _)| token.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl CommandLink for RecordingLink {
    async fn write(&self, payload: &[u8], with_response: bool) -> Result<(), BridgeError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::WriteFailed("peripheral busy".into()));
        }
        let token = String::from_utf8(BASE64.decode(payload).expect("base64 payload"))
            .expect("ascii token");
        self.writes.lock().unwrap().push((token, with_response));
        Ok(())
    }
}

/// A link slot with a recording link installed, as after a successful
/// connect.
pub fn connected_slot() -> (LinkSlot, Arc<RecordingLink>) {
    let link = Arc::new(RecordingLink::new());
    let slot: LinkSlot = Arc::new(RwLock::new(Some(link.clone() as Arc<dyn CommandLink>)));
    (slot, link)
}

/// Lets spawned tasks run between clock manipulations.
pub async fn settle() {
    for _ in 0..8 {
        yield_now().await;
    }
}
