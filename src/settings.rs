//! Typed, persistent module settings.
//!
//! Settings live in a [`SettingCollection`], an ordered set of entries plus
//! named subcollections. Values are a closed [`SettingValue`] variant; the
//! typed [`SettingEntry<T>`] handle converts through [`SettingType`].

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::{ModuleError, Result};
use crate::events::{Event, Subscription};
use crate::store::{MemorySettingsStore, SettingsStore};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Value stored by a setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    String(String),
    /// Variant name of a [`SettingEnum`]
    Enum(String),
}

impl SettingValue {
    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "bool",
            SettingValue::Int(_) => "int",
            SettingValue::String(_) => "string",
            SettingValue::Enum(_) => "enum",
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(v) => write!(f, "{}", v),
            SettingValue::Int(v) => write!(f, "{}", v),
            SettingValue::String(v) | SettingValue::Enum(v) => f.write_str(v),
        }
    }
}

/// Rust types that can back a setting.
pub trait SettingType: Clone + Send + Sync + 'static {
    /// Matches [`SettingValue::type_name`].
    const TYPE_NAME: &'static str;

    fn to_value(&self) -> SettingValue;

    fn from_value(value: &SettingValue) -> Option<Self>;

    /// Allowed values for drop-down style settings.
    fn options() -> Option<Vec<&'static str>> {
        None
    }
}

impl SettingType for bool {
    const TYPE_NAME: &'static str = "bool";

    fn to_value(&self) -> SettingValue {
        SettingValue::Bool(*self)
    }

    fn from_value(value: &SettingValue) -> Option<Self> {
        match value {
            SettingValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl SettingType for i64 {
    const TYPE_NAME: &'static str = "int";

    fn to_value(&self) -> SettingValue {
        SettingValue::Int(*self)
    }

    fn from_value(value: &SettingValue) -> Option<Self> {
        match value {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl SettingType for String {
    const TYPE_NAME: &'static str = "string";

    fn to_value(&self) -> SettingValue {
        SettingValue::String(self.clone())
    }

    fn from_value(value: &SettingValue) -> Option<Self> {
        match value {
            SettingValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Fieldless enums usable as drop-down settings.
///
/// ```
/// use lib_module_host::SettingEnum;
///
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum ColorType { Blue, Black }
///
/// impl SettingEnum for ColorType {
///     fn variants() -> &'static [Self] { &[ColorType::Blue, ColorType::Black] }
///     fn name(&self) -> &'static str {
///         match self { ColorType::Blue => "Blue", ColorType::Black => "Black" }
///     }
/// }
///
/// assert_eq!(ColorType::from_name("Black"), Some(ColorType::Black));
/// ```
pub trait SettingEnum: Copy + PartialEq + Send + Sync + 'static {
    fn variants() -> &'static [Self];

    fn name(&self) -> &'static str;

    fn from_name(name: &str) -> Option<Self> {
        Self::variants().iter().copied().find(|v| v.name() == name)
    }
}

impl<E: SettingEnum> SettingType for E {
    const TYPE_NAME: &'static str = "enum";

    fn to_value(&self) -> SettingValue {
        SettingValue::Enum(self.name().to_string())
    }

    fn from_value(value: &SettingValue) -> Option<Self> {
        match value {
            SettingValue::Enum(name) => E::from_name(name),
            _ => None,
        }
    }

    fn options() -> Option<Vec<&'static str>> {
        Some(E::variants().iter().map(|v| v.name()).collect())
    }
}

/// Display metadata shown next to a setting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingMetadata {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

impl SettingMetadata {
    pub fn new(display_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            description: description.into(),
        }
    }
}

/// Untyped change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChanged {
    pub key: String,
    pub previous: SettingValue,
    pub new: SettingValue,
}

/// Typed change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChanged<T> {
    pub previous: T,
    pub new: T,
}

struct SettingSlot {
    key: String,
    default: SettingValue,
    metadata: SettingMetadata,
    value: RwLock<SettingValue>,
    range: RwLock<Option<(i64, i64)>>,
    changed: Event<SettingChanged>,
    /// Event of the owning collection
    collection_changed: Event<SettingChanged>,
}

impl SettingSlot {
    fn value(&self) -> SettingValue {
        read(&self.value).clone()
    }

    fn clamp(&self, value: SettingValue) -> SettingValue {
        match (value, *read(&self.range)) {
            (SettingValue::Int(v), Some((min, max))) => SettingValue::Int(v.clamp(min, max)),
            (value, _) => value,
        }
    }

    /// Store and notify on the calling thread. The lock is released before
    /// subscribers run.
    fn set(&self, value: SettingValue) {
        let new = self.clamp(value);
        let previous = std::mem::replace(&mut *write(&self.value), new.clone());
        let change = SettingChanged {
            key: self.key.clone(),
            previous,
            new,
        };
        self.changed.emit(&change);
        self.collection_changed.emit(&change);
    }
}

/// Typed handle to a defined setting. Cheap to clone; clones share state.
pub struct SettingEntry<T> {
    slot: Arc<SettingSlot>,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for SettingEntry<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            _type: PhantomData,
        }
    }
}

impl<T: SettingType> SettingEntry<T> {
    fn from_slot(slot: Arc<SettingSlot>) -> Result<Self> {
        if T::from_value(&slot.default).is_none() {
            return Err(ModuleError::SettingTypeMismatch {
                key: slot.key.clone(),
                expected: T::TYPE_NAME,
                actual: slot.default.type_name(),
            });
        }
        Ok(Self {
            slot,
            _type: PhantomData,
        })
    }

    pub fn key(&self) -> &str {
        &self.slot.key
    }

    pub fn metadata(&self) -> &SettingMetadata {
        &self.slot.metadata
    }

    /// Current value.
    pub fn value(&self) -> T {
        // A slot only ever holds values of its default's variant
        T::from_value(&self.slot.value()).unwrap_or_else(|| self.default_value())
    }

    pub fn default_value(&self) -> T {
        T::from_value(&self.slot.default)
            .unwrap_or_else(|| unreachable!("entry type checked at construction"))
    }

    /// Replace the value and notify subscribers synchronously.
    ///
    /// Subscribers may touch UI state, so UI-observable settings should only
    /// be set from the main thread.
    pub fn set(&self, value: T) {
        self.slot.set(value.to_value());
    }

    /// Restore the default value.
    pub fn reset(&self) {
        self.slot.set(self.slot.default.clone());
    }

    /// Subscribe to value changes.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_changed(
        &self,
        handler: impl Fn(&ValueChanged<T>) + Send + Sync + 'static,
    ) -> Subscription {
        self.slot.changed.subscribe(move |change| {
            if let (Some(previous), Some(new)) =
                (T::from_value(&change.previous), T::from_value(&change.new))
            {
                handler(&ValueChanged { previous, new });
            }
        })
    }
}

impl SettingEntry<i64> {
    /// Restrict the value to `min..=max`. The current value is clamped
    /// immediately and every later `set` is clamped.
    pub fn set_range(&self, min: i64, max: i64) {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        *write(&self.slot.range) = Some((min, max));

        let current = self.slot.value();
        if self.slot.clamp(current.clone()) != current {
            self.slot.set(current);
        }
    }

    pub fn range(&self) -> Option<(i64, i64)> {
        *read(&self.slot.range)
    }
}

impl<T: SettingType + fmt::Debug> fmt::Debug for SettingEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingEntry")
            .field("key", &self.slot.key)
            .field("value", &self.value())
            .finish()
    }
}

/// Persisted form of a setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSetting {
    pub value: SettingValue,
    pub default: SettingValue,
    #[serde(default)]
    pub metadata: SettingMetadata,
}

/// Persisted form of a collection and its subcollections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub entries: BTreeMap<String, PersistedSetting>,
    #[serde(default)]
    pub subcollections: BTreeMap<String, CollectionSnapshot>,
}

/// A setting as presented to the settings UI.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingView {
    /// Subcollection path, empty for the root
    pub path: Vec<String>,
    pub key: String,
    pub value: SettingValue,
    pub metadata: SettingMetadata,
    pub range: Option<(i64, i64)>,
    pub options: Option<Vec<&'static str>>,
}

struct CollectionInner {
    name: String,
    hidden: bool,
    entries: Vec<(Arc<SettingSlot>, Option<Vec<&'static str>>)>,
    subcollections: Vec<SettingCollection>,
    persisted: CollectionSnapshot,
    changed: Event<SettingChanged>,
}

/// Ordered collection of settings and nested subcollections.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SettingCollection {
    inner: Arc<RwLock<CollectionInner>>,
}

impl SettingCollection {
    /// Create an empty collection.
    pub fn new(name: impl Into<String>) -> Self {
        Self::restore(name, false, CollectionSnapshot::default())
    }

    /// Create a collection whose definitions pick up previously persisted
    /// values.
    pub fn restore(name: impl Into<String>, hidden: bool, persisted: CollectionSnapshot) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(RwLock::new(CollectionInner {
                changed: Event::new(name.clone()),
                name,
                hidden,
                entries: Vec::new(),
                subcollections: Vec::new(),
                persisted,
            })),
        }
    }

    pub fn name(&self) -> String {
        read(&self.inner).name.clone()
    }

    /// Hidden collections are persisted but never enumerated for the UI.
    pub fn is_hidden(&self) -> bool {
        read(&self.inner).hidden
    }

    /// Define a setting.
    ///
    /// A persisted value of the same type replaces `default` as the initial
    /// value. Defining a key twice in the same collection is rejected and
    /// leaves the first entry live.
    pub fn define_setting<T: SettingType>(
        &self,
        key: impl Into<String>,
        default: T,
        metadata: SettingMetadata,
    ) -> Result<SettingEntry<T>> {
        let key = key.into();
        let mut inner = write(&self.inner);

        if inner.entries.iter().any(|(slot, _)| slot.key == key) {
            return Err(ModuleError::SettingAlreadyDefined {
                collection: inner.name.clone(),
                key,
            });
        }

        let default = default.to_value();
        let initial = match inner.persisted.entries.get(&key) {
            Some(persisted) if T::from_value(&persisted.value).is_some() => persisted.value.clone(),
            Some(persisted) => {
                tracing::debug!(
                    "Ignoring persisted {} for setting '{}', defined as {}",
                    persisted.value.type_name(),
                    key,
                    T::TYPE_NAME
                );
                default.clone()
            }
            None => default.clone(),
        };

        let slot = Arc::new(SettingSlot {
            changed: Event::new(format!("{}.{}", inner.name, key)),
            collection_changed: inner.changed.clone(),
            key,
            default,
            metadata,
            value: RwLock::new(initial),
            range: RwLock::new(None),
        });
        inner.entries.push((slot.clone(), T::options()));

        SettingEntry::from_slot(slot)
    }

    /// Define a nested subcollection.
    pub fn define_subcollection(&self, name: impl Into<String>, hidden: bool) -> Result<SettingCollection> {
        let name = name.into();
        let mut inner = write(&self.inner);

        if inner.subcollections.iter().any(|c| c.name() == name) {
            return Err(ModuleError::SubcollectionAlreadyDefined {
                collection: inner.name.clone(),
                name,
            });
        }

        let persisted = inner.persisted.subcollections.get(&name).cloned().unwrap_or_default();
        let collection = SettingCollection::restore(name, hidden, persisted);
        inner.subcollections.push(collection.clone());
        Ok(collection)
    }

    /// Look up a typed entry.
    pub fn get<T: SettingType>(&self, key: &str) -> Result<SettingEntry<T>> {
        let slot = self
            .slot(key)
            .ok_or_else(|| ModuleError::SettingNotFound(key.to_string()))?;
        SettingEntry::from_slot(slot)
    }

    /// Current value of a setting, whatever its type.
    pub fn value(&self, key: &str) -> Option<SettingValue> {
        self.slot(key).map(|slot| slot.value())
    }

    /// Set a setting from an untyped value.
    pub fn set_value(&self, key: &str, value: SettingValue) -> Result<()> {
        let slot = self
            .slot(key)
            .ok_or_else(|| ModuleError::SettingNotFound(key.to_string()))?;

        if std::mem::discriminant(&value) != std::mem::discriminant(&slot.default) {
            return Err(ModuleError::SettingTypeMismatch {
                key: key.to_string(),
                expected: slot.default.type_name(),
                actual: value.type_name(),
            });
        }

        if let SettingValue::Enum(name) = &value {
            let options = read(&self.inner)
                .entries
                .iter()
                .find(|(s, _)| s.key == key)
                .and_then(|(_, options)| options.clone())
                .unwrap_or_default();
            if !options.contains(&name.as_str()) {
                return Err(ModuleError::UnknownVariant {
                    key: key.to_string(),
                    variant: name.clone(),
                });
            }
        }

        slot.set(value);
        Ok(())
    }

    /// Subscribe to changes of any setting defined directly in this
    /// collection, including settings defined after subscribing.
    /// Subcollections have their own event.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_any_changed(
        &self,
        handler: impl Fn(&SettingChanged) + Send + Sync + 'static,
    ) -> Subscription {
        read(&self.inner).changed.subscribe(handler)
    }

    /// Keys defined directly in this collection, in definition order.
    pub fn keys(&self) -> Vec<String> {
        read(&self.inner)
            .entries
            .iter()
            .map(|(slot, _)| slot.key.clone())
            .collect()
    }

    pub fn subcollection(&self, name: &str) -> Option<SettingCollection> {
        read(&self.inner)
            .subcollections
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Settings the UI should show: this collection's entries, then those
    /// of each non-hidden subcollection.
    pub fn visible_settings(&self) -> Vec<SettingView> {
        let mut views = Vec::new();
        if !self.is_hidden() {
            self.collect_visible(&mut Vec::new(), &mut views);
        }
        views
    }

    fn collect_visible(&self, path: &mut Vec<String>, views: &mut Vec<SettingView>) {
        let inner = read(&self.inner);
        for (slot, options) in &inner.entries {
            views.push(SettingView {
                path: path.clone(),
                key: slot.key.clone(),
                value: slot.value(),
                metadata: slot.metadata.clone(),
                range: *read(&slot.range),
                options: options.clone(),
            });
        }
        for sub in inner.subcollections.iter().filter(|c| !c.is_hidden()) {
            path.push(sub.name());
            sub.collect_visible(path, views);
            path.pop();
        }
    }

    /// Persistable state, including persisted entries that were not
    /// redefined this session.
    pub fn snapshot(&self) -> CollectionSnapshot {
        let inner = read(&self.inner);
        let mut snapshot = inner.persisted.clone();
        snapshot.hidden = inner.hidden;

        for (slot, _) in &inner.entries {
            snapshot.entries.insert(
                slot.key.clone(),
                PersistedSetting {
                    value: slot.value(),
                    default: slot.default.clone(),
                    metadata: slot.metadata.clone(),
                },
            );
        }
        for sub in &inner.subcollections {
            snapshot.subcollections.insert(sub.name(), sub.snapshot());
        }
        snapshot
    }

    fn slot(&self, key: &str) -> Option<Arc<SettingSlot>> {
        read(&self.inner)
            .entries
            .iter()
            .find(|(slot, _)| slot.key == key)
            .map(|(slot, _)| slot.clone())
    }
}

impl fmt::Debug for SettingCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = read(&self.inner);
        f.debug_struct("SettingCollection")
            .field("name", &inner.name)
            .field("hidden", &inner.hidden)
            .field("entries", &inner.entries.len())
            .field("subcollections", &inner.subcollections.len())
            .finish()
    }
}

/// A module's root settings collection bound to its persistent store.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SettingsRegistry {
    root: SettingCollection,
    store: Arc<dyn SettingsStore>,
}

impl SettingsRegistry {
    /// Load the named collection from `store`.
    pub fn load(name: impl Into<String>, store: Arc<dyn SettingsStore>) -> Result<Self> {
        let name = name.into();
        let persisted = store.load(&name)?.unwrap_or_default();
        tracing::debug!(
            "Loaded {} persisted settings for '{}'",
            persisted.entries.len(),
            name
        );

        Ok(Self {
            root: SettingCollection::restore(name, false, persisted),
            store,
        })
    }

    /// Registry backed by a fresh in-memory store.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            root: SettingCollection::new(name),
            store: Arc::new(MemorySettingsStore::new()),
        }
    }

    pub fn name(&self) -> String {
        self.root.name()
    }

    /// The root collection.
    pub fn collection(&self) -> &SettingCollection {
        &self.root
    }

    pub fn define_setting<T: SettingType>(
        &self,
        key: impl Into<String>,
        default: T,
        metadata: SettingMetadata,
    ) -> Result<SettingEntry<T>> {
        self.root.define_setting(key, default, metadata)
    }

    pub fn define_subcollection(&self, name: impl Into<String>, hidden: bool) -> Result<SettingCollection> {
        self.root.define_subcollection(name, hidden)
    }

    pub fn get<T: SettingType>(&self, key: &str) -> Result<SettingEntry<T>> {
        self.root.get(key)
    }

    /// Set an entry's value, notifying subscribers on the calling thread.
    pub fn set<T: SettingType>(&self, entry: &SettingEntry<T>, value: T) {
        entry.set(value);
    }

    pub fn visible_settings(&self) -> Vec<SettingView> {
        self.root.visible_settings()
    }

    /// Write the current values to the store.
    pub fn save(&self) -> Result<()> {
        let name = self.root.name();
        self.store.save(&name, &self.root.snapshot())?;
        tracing::debug!("Saved settings for '{}'", name);
        Ok(())
    }
}

impl fmt::Debug for SettingsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsRegistry")
            .field("root", &self.root)
            .finish()
    }
}
