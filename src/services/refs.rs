use log::{debug, info, warn};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

use crate::client::DeviceChannel;
use crate::models::homekit::{parse_accessories, Accessory, CharKey, CharType};
use crate::services::state::SharedState;

/// Accessory metadata shared by the reconciler (lazy characteristic lookup) and the poller.
#[derive(Clone, Default)]
pub struct AccessoryCache {
    inner: Arc<RwLock<Vec<Accessory>>>,
}

impl AccessoryCache {
    pub fn new(accessories: Vec<Accessory>) -> Self {
        AccessoryCache {
            inner: Arc::new(RwLock::new(accessories)),
        }
    }

    pub fn replace(&self, accessories: Vec<Accessory>) {
        *self.inner.write() = accessories;
    }

    pub fn snapshot(&self) -> Vec<Accessory> {
        self.inner.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn char_type(&self, key: CharKey) -> Option<CharType> {
        self.inner
            .read()
            .iter()
            .filter(|a| a.aid == key.aid)
            .flat_map(|a| a.characteristics())
            .find(|(k, _)| *k == key)
            .and_then(|(_, c)| c.tracked_type())
    }

    /// Every characteristic that advertises event support, with its tracked type if any.
    pub fn monitored(&self) -> Vec<(CharKey, Option<CharType>)> {
        self.inner
            .read()
            .iter()
            .filter(|a| a.aid > 0)
            .flat_map(|a| a.characteristics())
            .filter(|(_, c)| c.supports_events())
            .map(|(k, c)| (k, c.tracked_type()))
            .collect()
    }
}

pub fn load_cache_file(path: &Path) -> Result<Vec<Accessory>, String> {
    let body = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_accessories(&body).map_err(|e| format!("{}: {}", path.display(), e))
}

pub fn write_cache_file(path: &Path, accessories: &[Accessory]) -> Result<(), String> {
    let body = serde_json::to_string_pretty(&serde_json::json!({ "accessories": accessories }))
        .map_err(|e| format!("serialize accessories failed: {}", e))?;
    std::fs::write(path, body).map_err(|e| format!("failed to write {}: {}", path.display(), e))
}

/// Fetch accessory metadata from the channel, refreshing the cache file; fall
/// back to the cache file when the channel cannot answer.
pub async fn load_accessories(channel: &dyn DeviceChannel, cache_path: &Path) -> Result<Vec<Accessory>, String> {
    match channel.accessories().await {
        Ok(accessories) => {
            info!("Refs: fetched {} accessory(ies) from the device channel", accessories.len());
            if let Err(e) = write_cache_file(cache_path, &accessories) {
                warn!("Refs: updating accessory cache failed: {}", e);
            }
            Ok(accessories)
        }
        Err(e) => {
            warn!(
                "Refs: fetching accessories failed ({}); using cache {}",
                e,
                cache_path.display()
            );
            load_cache_file(cache_path)
        }
    }
}

/// Register every accessory that reports a serial number. Returns the number registered.
pub fn sync_registry(state: &SharedState, accessories: &[Accessory]) -> Result<usize, String> {
    info!("Refs: syncing {} accessory(ies)", accessories.len());
    let mut st = state.lock();
    st.reload_registry().map_err(|e| format!("loading device registry failed: {}", e))?;

    let mut registered = 0;
    for acc in accessories {
        let Some(serial) = acc.serial_number() else {
            debug!("Refs: accessory {} has no serial number, skipping", acc.aid);
            continue;
        };
        match st.get_or_create_device(&serial, Some(acc.aid), Some(acc)) {
            Ok(id) => {
                debug!("Refs: accessory {} ({}) -> device {}", acc.aid, serial, id);
                registered += 1;
            }
            Err(e) => warn!("Refs: registering {} failed: {}", serial, e),
        }
    }

    // zones and leaders are maintained externally; pick up any changes
    st.reload_registry().map_err(|e| format!("reloading device registry failed: {}", e))?;
    info!("Refs: {} device(s) registered", registered);
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryRepository;
    use crate::services::state::StateStore;
    use crate::test_support::FakeChannel;

    const DOC: &str = r#"{"accessories":[
        {"aid":1,"services":[
            {"type":"3E","characteristics":[{"iid":2,"type":"30","value":"RU0001","perms":["pr"]}]},
            {"type":"4A","characteristics":[
                {"iid":10,"type":"11","value":21.5,"perms":["pr","ev"]},
                {"iid":11,"type":"35","value":21.0,"perms":["pr","pw","ev"]},
                {"iid":12,"type":"E44673A0-247B-4360-8A76-DB9DA69C0101","perms":["pr","ev"]}
            ]}
        ]},
        {"aid":2,"services":[
            {"type":"3E","characteristics":[{"iid":2,"type":"23","value":"No serial","perms":["pr"]}]},
            {"type":"82","characteristics":[{"iid":10,"type":"10","value":48,"perms":["pr","ev"]}]}
        ]}
    ]}"#;

    #[test]
    fn monitored_set_follows_event_permission() {
        let cache = AccessoryCache::new(parse_accessories(DOC).unwrap());
        let monitored = cache.monitored();
        assert_eq!(monitored.len(), 4);
        assert!(monitored.contains(&(CharKey::new(1, 12), None)));
        assert!(monitored.contains(&(CharKey::new(2, 10), Some(CharType::CurrentRelativeHumidity))));
        assert_eq!(cache.char_type(CharKey::new(1, 11)), Some(CharType::TargetTemperature));
        assert_eq!(cache.char_type(CharKey::new(1, 2)), None);
    }

    #[test]
    fn sync_registers_accessories_with_serials() {
        let repo = Arc::new(MemoryRepository::new());
        let state = StateStore::new(repo, 10, 30).into_shared();
        let accessories = parse_accessories(DOC).unwrap();

        assert_eq!(sync_registry(&state, &accessories).unwrap(), 1);
        let st = state.lock();
        let id = st.device_by_aid(1).unwrap();
        assert_eq!(st.device(id).unwrap().device_type, "thermostat");
        assert_eq!(st.device_by_aid(2), None);
    }

    #[test]
    fn cache_file_round_trips() {
        let dir = std::env::temp_dir().join(format!("tado-local-refs-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("accessories.json");
        let accessories = parse_accessories(DOC).unwrap();

        write_cache_file(&path, &accessories).unwrap();
        assert_eq!(load_cache_file(&path).unwrap(), accessories);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn channel_metadata_refreshes_cache_and_cache_covers_outages() {
        let dir = std::env::temp_dir().join(format!("tado-local-load-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("accessories.json");
        let accessories = parse_accessories(DOC).unwrap();

        let online = FakeChannel::with_accessories(accessories.clone());
        assert_eq!(load_accessories(&online, &path).await.unwrap(), accessories);

        let offline = FakeChannel::default();
        offline.set_available(false);
        assert_eq!(load_accessories(&offline, &path).await.unwrap(), accessories);

        std::fs::remove_dir_all(&dir).unwrap();
        assert!(load_accessories(&offline, &path).await.is_err());
    }
}
