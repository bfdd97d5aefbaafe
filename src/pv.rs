//! PV provider interface (§4.3, §6 "PV provider interface (consumed)").
//!
//! The runtime never speaks any wire format; it only calls through this
//! narrow capability trait, which stands in for a channel-access-style
//! client. A real deployment supplies a [`PvProvider`] that bridges to its
//! transport of choice; tests use [`pv::mock`] (a same-process in-memory
//! provider good enough to drive the end-to-end scenario in §8).
//!
//! Grounded on the `pvVarCreate`/`pvVarGet`/`pvVarPut`/`pvVarMonitorOn`
//! boundary named in §6, and, for the connection-state bookkeeping, on the
//! connecting/active/error state machine sketched in `net_box.rs`'s module
//! doc comment.

use std::any::Any;
use std::fmt;

/// The fixed set of user-variable types the compiler can bind a channel to
/// (§6: "variable type string from a fixed set"), and the corresponding
/// get/put wire types (§4.3). Mirrors `init_type()`'s `pv_type_map` in
/// `seq_main.c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvType {
    Char,
    Short,
    Long,
    Float,
    Double,
    String,
}

impl PvType {
    /// Element size in bytes for this type, as `init_type()` computes via
    /// `sizeof`.
    pub fn size(self) -> usize {
        match self {
            PvType::Char => 1,
            PvType::Short => 2,
            PvType::Long => 8,
            PvType::Float => 4,
            PvType::Double => 8,
            PvType::String => 40, // MAX_STRING_SIZE in the original
        }
    }

    /// Map a compiler-emitted variable-type string to its `(get, put)`
    /// wire types, following `init_type()`'s `pv_type_map` table exactly,
    /// including its folding of `int`/`long`/`unsigned *` onto `Long` and
    /// `char`/`unsigned char` onto `Char`.
    pub fn from_var_type(var_type: &str) -> Option<PvType> {
        match var_type {
            "char" | "unsigned char" => Some(PvType::Char),
            "short" | "unsigned short" => Some(PvType::Short),
            "int" | "long" | "unsigned int" | "unsigned long" => Some(PvType::Long),
            "float" => Some(PvType::Float),
            "double" => Some(PvType::Double),
            "string" => Some(PvType::String),
            _ => None,
        }
    }
}

/// Status/severity/timestamp metadata accompanying every provider callback
/// (§6: "All callbacks include status and severity integers plus a
/// timestamp").
#[derive(Debug, Clone, Copy, Default)]
pub struct PvMeta {
    pub status: i32,
    pub severity: i32,
    pub timestamp: f64,
}

impl PvMeta {
    pub fn ok(timestamp: f64) -> Self {
        PvMeta {
            status: 0,
            severity: 0,
            timestamp,
        }
    }
}

/// Opaque handle to a provider-side PV binding, returned by
/// [`PvProvider::var_create`]. `Any` lets a provider implementation
/// downcast handles it handed out back to its own concrete type.
pub trait PvHandle: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Callbacks the provider drives; implemented by [`crate::channel::Channel`]
/// and dispatched from whatever thread the provider chooses to call back
/// on (§5 "PV provider callbacks may arrive on additional provider-owned
/// threads").
pub trait PvCallbacks: Send + Sync {
    fn on_connect(&self, connected: bool, meta: PvMeta);
    fn on_monitor(&self, data: &[u8], meta: PvMeta);
    fn on_get_complete(&self, data: &[u8], meta: PvMeta);
    fn on_put_complete(&self, meta: PvMeta);
}

/// The minimal capability set the runtime requires of a PV transport
/// (§6). Implementations own whatever network/shared-memory machinery is
/// needed to deliver the callbacks in [`PvCallbacks`].
pub trait PvProvider: Send + Sync {
    /// Create a context for `pvsys` (the provider name resolved from the
    /// `pvsys` macro, default `"ca"`).
    fn create_context(&self, pvsys: &str) -> Result<(), crate::error::ProviderError>;

    fn destroy_context(&self);

    /// Bind `name` to a new provider-side handle, registering `callbacks`
    /// for connection-state changes, monitor updates, and get/put
    /// completions.
    fn var_create(
        &self,
        name: &str,
        callbacks: std::sync::Arc<dyn PvCallbacks>,
    ) -> Result<Box<dyn PvHandle>, crate::error::ProviderError>;

    fn var_destroy(&self, handle: &dyn PvHandle);

    fn var_get(&self, handle: &dyn PvHandle, get_type: PvType, count: usize);

    fn var_put(&self, handle: &dyn PvHandle, put_type: PvType, data: &[u8]);

    fn var_monitor_on(&self, handle: &dyn PvHandle, get_type: PvType);

    fn var_monitor_off(&self, handle: &dyn PvHandle);
}

impl fmt::Debug for dyn PvHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pv handle>")
    }
}

/// A same-process, in-memory [`PvProvider`] good enough for tests and for
/// driving the §8 end-to-end scenario without a real channel-access
/// network. Every `var_get`/`var_put`/`var_monitor_on` loops back
/// synchronously through the registered [`PvCallbacks`].
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    struct MockHandle {
        name: String,
    }
    impl PvHandle for MockHandle {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Binding {
        callbacks: Arc<dyn PvCallbacks>,
        value: Vec<u8>,
        monitored: bool,
    }

    /// An in-memory PV name space: `publish()` stores a value and, for any
    /// monitored or get-pending binding, delivers it immediately.
    #[derive(Default)]
    pub struct MockProvider {
        bindings: Mutex<HashMap<String, Binding>>,
    }

    impl MockProvider {
        pub fn new() -> Arc<Self> {
            Arc::new(MockProvider {
                bindings: Mutex::new(HashMap::new()),
            })
        }

        /// Publish a new value for `name`, delivering a monitor callback to
        /// any binding that has monitoring enabled.
        pub fn publish(&self, name: &str, data: &[u8], meta: PvMeta) {
            let bindings = self.bindings.lock().unwrap();
            if let Some(binding) = bindings.get(name) {
                if binding.monitored {
                    binding.callbacks.on_monitor(data, meta);
                }
            }
        }

        /// Drop the server-side binding for `name` without touching the
        /// channel's own handle, so a subsequent `var_get`/`var_put` against
        /// it finds nothing to answer — for exercising get/put timeout
        /// paths in tests.
        pub fn forget(&self, name: &str) {
            self.bindings.lock().unwrap().remove(name);
        }
    }

    impl PvProvider for MockProvider {
        fn create_context(&self, _pvsys: &str) -> Result<(), crate::error::ProviderError> {
            Ok(())
        }

        fn destroy_context(&self) {}

        fn var_create(
            &self,
            name: &str,
            callbacks: Arc<dyn PvCallbacks>,
        ) -> Result<Box<dyn PvHandle>, crate::error::ProviderError> {
            let mut bindings = self.bindings.lock().unwrap();
            bindings.insert(
                name.to_string(),
                Binding {
                    callbacks: Arc::clone(&callbacks),
                    value: Vec::new(),
                    monitored: false,
                },
            );
            callbacks.on_connect(true, PvMeta::ok(crate::clock::time()));
            Ok(Box::new(MockHandle {
                name: name.to_string(),
            }))
        }

        fn var_destroy(&self, handle: &dyn PvHandle) {
            let handle = downcast(handle);
            self.bindings.lock().unwrap().remove(&handle.name);
        }

        fn var_get(&self, handle: &dyn PvHandle, _get_type: PvType, _count: usize) {
            let handle = downcast(handle);
            let bindings = self.bindings.lock().unwrap();
            if let Some(binding) = bindings.get(&handle.name) {
                binding
                    .callbacks
                    .on_get_complete(&binding.value, PvMeta::ok(crate::clock::time()));
            }
        }

        fn var_put(&self, handle: &dyn PvHandle, _put_type: PvType, data: &[u8]) {
            let handle = downcast(handle);
            let mut bindings = self.bindings.lock().unwrap();
            if let Some(binding) = bindings.get_mut(&handle.name) {
                binding.value = data.to_vec();
                binding
                    .callbacks
                    .on_put_complete(PvMeta::ok(crate::clock::time()));
            }
        }

        fn var_monitor_on(&self, handle: &dyn PvHandle, _get_type: PvType) {
            let handle = downcast(handle);
            let mut bindings = self.bindings.lock().unwrap();
            if let Some(binding) = bindings.get_mut(&handle.name) {
                binding.monitored = true;
            }
        }

        fn var_monitor_off(&self, handle: &dyn PvHandle) {
            let handle = downcast(handle);
            let mut bindings = self.bindings.lock().unwrap();
            if let Some(binding) = bindings.get_mut(&handle.name) {
                binding.monitored = false;
            }
        }
    }

    fn downcast(handle: &dyn PvHandle) -> &MockHandle {
        handle
            .as_any()
            .downcast_ref::<MockHandle>()
            .expect("MockProvider only ever hands out MockHandle instances")
    }
}
