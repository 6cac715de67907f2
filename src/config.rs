use crate::error::{KeyError, KeyResult};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

/// Tunable key-colour classification parameters.
///
/// Hue is in degrees, saturation and lightness on the 0-255 scale used by
/// the classifier. `feather_radius` is accepted and carried along but does
/// not influence compositing: key edges are hard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyConfig {
    pub hue_min: u16,
    pub hue_max: u16,
    pub saturation_min: u8,
    pub saturation_max: u8,
    pub lightness_min: u8,
    pub lightness_max: u8,
    pub tolerance: u8,
    pub feather_radius: u32,
}

impl KeyConfig {
    /// Standard green-screen preset.
    pub fn green() -> Self {
        Self {
            hue_min: 100,
            hue_max: 140,
            saturation_min: 50,
            saturation_max: 255,
            lightness_min: 30,
            lightness_max: 200,
            tolerance: 30,
            feather_radius: 2,
        }
    }

    /// Blue-screen preset.
    pub fn blue() -> Self {
        Self {
            hue_min: 200,
            hue_max: 250,
            ..Self::green()
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "green" => Some(Self::green()),
            "blue" => Some(Self::blue()),
            _ => None,
        }
    }

    /// Parse a JSON-serialized config. Missing fields fall back to the
    /// green preset.
    pub fn from_json(text: &str) -> KeyResult<Self> {
        let config: KeyConfig = serde_json::from_str(text)
            .map_err(|e| KeyError::invalid_config(format!("malformed key config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> KeyResult<()> {
        if self.hue_max >= 360 || self.hue_min >= 360 {
            return Err(KeyError::invalid_config("hue bounds must be below 360"));
        }
        if self.hue_min > self.hue_max {
            return Err(KeyError::invalid_config(format!(
                "hueMin {} exceeds hueMax {}",
                self.hue_min, self.hue_max
            )));
        }
        if self.saturation_min > self.saturation_max {
            return Err(KeyError::invalid_config(format!(
                "saturationMin {} exceeds saturationMax {}",
                self.saturation_min, self.saturation_max
            )));
        }
        if self.lightness_min > self.lightness_max {
            return Err(KeyError::invalid_config(format!(
                "lightnessMin {} exceeds lightnessMax {}",
                self.lightness_min, self.lightness_max
            )));
        }
        if self.tolerance > 100 {
            return Err(KeyError::invalid_config("tolerance must be within 0-100"));
        }
        Ok(())
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self::green()
    }
}

static NEXT_BACKGROUND_ID: AtomicU64 = AtomicU64::new(1);

type BackgroundCell = OnceLock<Option<Arc<RgbaImage>>>;

/// Optional still image composited behind keyed pixels.
///
/// A background may still be decoding; until it is ready the compositor
/// treats it as absent. A failed decode leaves it permanently unusable.
#[derive(Clone)]
pub struct Background {
    id: u64,
    cell: Arc<BackgroundCell>,
}

impl Background {
    pub fn from_image(image: RgbaImage) -> Self {
        let (background, slot) = Self::deferred();
        slot.fulfil(image);
        background
    }

    /// A background whose pixels arrive later through the returned slot.
    pub fn deferred() -> (Self, BackgroundSlot) {
        let cell = Arc::new(OnceLock::new());
        let background = Self {
            id: NEXT_BACKGROUND_ID.fetch_add(1, Ordering::Relaxed),
            cell: Arc::clone(&cell),
        };
        (background, BackgroundSlot { cell })
    }

    /// Start decoding an image file on a helper thread.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path: PathBuf = path.as_ref().to_path_buf();
        let (background, slot) = Self::deferred();
        std::thread::spawn(move || match image::open(&path) {
            Ok(img) => {
                tracing::info!(
                    "Background {} decoded ({}x{})",
                    path.display(),
                    img.width(),
                    img.height()
                );
                slot.fulfil(img.to_rgba8());
            }
            Err(e) => {
                tracing::warn!("Failed to decode background {}: {}", path.display(), e);
                slot.fail();
            }
        });
        background
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.image().is_some()
    }

    /// Decoded pixels at their original size, if available.
    pub fn image(&self) -> Option<&Arc<RgbaImage>> {
        self.cell.get().and_then(|slot| slot.as_ref())
    }
}

impl std::fmt::Debug for Background {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Background")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Write end of a deferred [`Background`].
pub struct BackgroundSlot {
    cell: Arc<BackgroundCell>,
}

impl BackgroundSlot {
    pub fn fulfil(self, image: RgbaImage) {
        let _ = self.cell.set(Some(Arc::new(image)));
    }

    pub fn fail(self) {
        let _ = self.cell.set(None);
    }
}

/// One consistent view of the configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub key: KeyConfig,
    pub background: Option<Background>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    Key,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(ConfigChange) + Send + Sync>;

struct StoreInner {
    current: RwLock<Arc<ConfigSnapshot>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

/// Holds the current [`KeyConfig`] and background.
///
/// Updates replace the whole snapshot, so a reader always sees one
/// consistent pair. Clones share the same store.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl ConfigStore {
    pub fn new(key: KeyConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(Arc::new(ConfigSnapshot {
                    version: 0,
                    key,
                    background: None,
                })),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn get(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(
            &self
                .inner
                .current
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn key(&self) -> KeyConfig {
        self.get().key
    }

    pub fn version(&self) -> u64 {
        self.get().version
    }

    /// Replace the key config. Invalid configs are rejected and the current
    /// snapshot is left untouched.
    pub fn set(&self, key: KeyConfig) -> KeyResult<()> {
        key.validate()?;
        self.replace(|current| ConfigSnapshot {
            version: current.version + 1,
            key,
            background: current.background.clone(),
        });
        self.notify(ConfigChange::Key);
        Ok(())
    }

    pub fn set_background(&self, background: Option<Background>) {
        self.replace(|current| ConfigSnapshot {
            version: current.version + 1,
            key: current.key,
            background,
        });
        self.notify(ConfigChange::Background);
    }

    /// Register a callback invoked after every update, outside the store's
    /// locks.
    pub fn watch<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(ConfigChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unwatch(&self, id: ListenerId) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    fn replace<F>(&self, build: F)
    where
        F: FnOnce(&ConfigSnapshot) -> ConfigSnapshot,
    {
        let mut current = self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let next = build(&current);
        tracing::debug!("Config updated to version {}", next.version);
        *current = Arc::new(next);
    }

    fn notify(&self, change: ConfigChange) {
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(KeyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn presets_are_valid() {
        assert!(KeyConfig::green().validate().is_ok());
        assert!(KeyConfig::blue().validate().is_ok());
        assert_eq!(KeyConfig::preset("GREEN"), Some(KeyConfig::green()));
        assert_eq!(KeyConfig::preset("magenta"), None);
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let cfg = KeyConfig {
            lightness_min: 210,
            ..KeyConfig::green()
        };
        assert!(matches!(cfg.validate(), Err(KeyError::InvalidConfig(_))));

        let cfg = KeyConfig {
            hue_max: 360,
            ..KeyConfig::green()
        };
        assert!(cfg.validate().is_err());

        let cfg = KeyConfig {
            tolerance: 101,
            ..KeyConfig::green()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_uses_camel_case_and_defaults() {
        let cfg = KeyConfig::from_json(r#"{"hueMin": 90, "tolerance": 10}"#).unwrap();
        assert_eq!(cfg.hue_min, 90);
        assert_eq!(cfg.tolerance, 10);
        assert_eq!(cfg.hue_max, 140);

        assert!(KeyConfig::from_json(r#"{"hueMin": 150}"#).is_err());
        assert!(KeyConfig::from_json("not json").is_err());
    }

    #[test]
    fn set_replaces_snapshot_and_bumps_version() {
        let store = ConfigStore::default();
        let before = store.get();
        store.set(KeyConfig::blue()).unwrap();
        let after = store.get();

        assert_eq!(before.key, KeyConfig::green());
        assert_eq!(after.key, KeyConfig::blue());
        assert_eq!(after.version, before.version + 1);
    }

    #[test]
    fn invalid_set_keeps_previous_snapshot() {
        let store = ConfigStore::default();
        let bad = KeyConfig {
            saturation_min: 255,
            saturation_max: 0,
            ..KeyConfig::green()
        };
        assert!(store.set(bad).is_err());
        assert_eq!(store.key(), KeyConfig::green());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn background_change_keeps_key_config() {
        let store = ConfigStore::new(KeyConfig::blue());
        store.set_background(Some(Background::from_image(RgbaImage::new(2, 2))));
        let snapshot = store.get();
        assert_eq!(snapshot.key, KeyConfig::blue());
        assert!(snapshot.background.as_ref().is_some_and(Background::is_ready));
    }

    #[test]
    fn listeners_fire_until_unwatched() {
        let store = ConfigStore::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = store.watch(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.set_background(None);
        store.set(KeyConfig::blue()).unwrap();
        store.unwatch(id);
        store.set(KeyConfig::green()).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn deferred_background_becomes_ready_once_fulfilled() {
        let (background, slot) = Background::deferred();
        assert!(!background.is_ready());
        slot.fulfil(RgbaImage::new(1, 1));
        assert!(background.is_ready());

        let (failed, slot) = Background::deferred();
        slot.fail();
        assert!(!failed.is_ready());
        assert_ne!(background.id(), failed.id());
    }
}
