/// In-process device presence tracker
///
/// Marks devices online with a TTL after a successful ingest. The flow
/// engine never touches this; it belongs to the ingest boundary. Entries
/// expire lazily on read, so the map stays bounded by the active fleet.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// TTL-based online map keyed by device id
#[derive(Debug, Default)]
pub struct DevicePresence {
    online_until: RwLock<HashMap<i64, Instant>>,
}

impl DevicePresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device online for the given TTL
    pub async fn mark_online(&self, device_id: i64, ttl: Duration) {
        let mut map = self.online_until.write().await;
        map.insert(device_id, Instant::now() + ttl);
    }

    /// Whether a device is currently considered online
    pub async fn is_online(&self, device_id: i64) -> bool {
        {
            let map = self.online_until.read().await;
            match map.get(&device_id) {
                Some(deadline) if *deadline > Instant::now() => return true,
                None => return false,
                _ => {}
            }
        }
        // Expired entry, drop it
        let mut map = self.online_until.write().await;
        if let Some(deadline) = map.get(&device_id).copied() {
            if deadline > Instant::now() {
                return true;
            }
            map.remove(&device_id);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn marks_and_expires() {
        let presence = DevicePresence::new();
        assert!(!presence.is_online(1).await);

        presence.mark_online(1, Duration::from_secs(60)).await;
        assert!(presence.is_online(1).await);

        presence.mark_online(2, Duration::from_millis(0)).await;
        assert!(!presence.is_online(2).await);
    }
}
