//! Saves the discovered polling list so a restart can skip discovery.

use crate::erd::Erd;
use crate::store::PersistentStore;

const NAMESPACE: &str = "storage";
const KEY_COUNT: &str = "erdCount";
const KEY_LIST: &str = "erdList";
const KEY_HOST_ADDRESS: &str = "hostAddress";

/// A polling list as it comes back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPollingList {
    pub erds: Vec<Erd>,
    pub host_address: u8,
}

/// Returns the cached list only if a non-zero count was stored and the
/// record is intact. An unavailable store reads as "nothing cached".
pub fn load(store: &mut dyn PersistentStore, capacity: usize) -> Option<CachedPollingList> {
    if !store.begin(NAMESPACE, true) {
        tracing::info!("NV storage unavailable, nothing cached");
        return None;
    }

    let count = store.get_uint(KEY_COUNT, 0) as usize;
    tracing::info!("Stored number of polled ERDs is {}", count);
    let result = if count == 0 {
        None
    } else if count > capacity {
        tracing::warn!("Stored ERD count {} exceeds capacity {}, ignoring cache", count, capacity);
        None
    } else {
        let mut buf = vec![0u8; count * 2];
        let bytes_read = store.get_bytes(KEY_LIST, &mut buf);
        tracing::debug!("Loaded {} bytes from store", bytes_read);
        if bytes_read < buf.len() {
            tracing::warn!("Stored ERD list is short ({} of {} bytes), ignoring cache", bytes_read, buf.len());
            None
        } else {
            let erds = buf
                .chunks_exact(2)
                .map(|pair| Erd(u16::from_le_bytes([pair[0], pair[1]])))
                .collect();
            let host_address = store.get_uint(KEY_HOST_ADDRESS, u32::MAX);
            match u8::try_from(host_address) {
                Ok(host_address) => Some(CachedPollingList { erds, host_address }),
                Err(_) => {
                    tracing::warn!("Stored host address missing, ignoring cache");
                    None
                }
            }
        }
    };

    store.end();
    result
}

/// Replace whatever is stored with `erds` and `host_address`.
/// Failures are logged; the in-memory list stays authoritative.
pub fn save(store: &mut dyn PersistentStore, erds: &[Erd], host_address: u8) {
    if !store.begin(NAMESPACE, false) {
        tracing::warn!("NV storage unavailable, polling list not saved");
        return;
    }

    if !store.clear() {
        tracing::warn!("NV storage not cleared");
    }

    let bytes: Vec<u8> = erds.iter().flat_map(|erd| erd.value().to_le_bytes()).collect();
    let written = store.put_bytes(KEY_LIST, &bytes);
    if written != bytes.len() {
        tracing::warn!("Wrote {} of {} bytes for ERD list", written, bytes.len());
    }
    if store.put_uint(KEY_HOST_ADDRESS, host_address as u32) == 0 {
        tracing::warn!("Failed to store host address");
    }
    // Count goes last so a torn write reads back as "nothing cached"
    if store.put_uint(KEY_COUNT, erds.len() as u32) == 0 {
        tracing::warn!("Failed to store ERD count");
    }
    tracing::info!("Saved {} polled ERDs for host 0x{:02X}", erds.len(), host_address);

    store.end();
}

/// Forget the cached list.
pub fn clear(store: &mut dyn PersistentStore) {
    if !store.begin(NAMESPACE, false) {
        tracing::warn!("NV storage unavailable, cache not cleared");
        return;
    }
    if store.clear() {
        tracing::info!("NV storage cleared");
    } else {
        tracing::warn!("NV storage not cleared");
    }
    store.end();
}
