use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{constants::NETWORK_DISABLED_MSG, core::traits::backend::BackendError};

/// Network-capable globals an execution context exposes to user code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetPrimitive {
    /// Fetch-like request call.
    Fetch,
    /// Socket constructor.
    Socket,
    /// Server-push / event-source constructor.
    EventStream,
    /// XHR-like request object.
    HttpRequest,
}

impl NetPrimitive {
    pub const ALL: [NetPrimitive; 4] = [
        NetPrimitive::Fetch,
        NetPrimitive::Socket,
        NetPrimitive::EventStream,
        NetPrimitive::HttpRequest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            NetPrimitive::Fetch => "fetch",
            NetPrimitive::Socket => "socket",
            NetPrimitive::EventStream => "event-stream",
            NetPrimitive::HttpRequest => "http-request",
        }
    }
}

type HostFn = Arc<dyn Fn(&str) -> Result<(), BackendError> + Send + Sync>;

#[derive(Clone)]
enum Binding {
    Host(HostFn),
    Disabled,
}

/// Per-context table of network globals.
///
/// Each context owns one; nothing here is shared between contexts. Once
/// [`HostGlobals::install_network_shim`] ran, every primitive fails with
/// "Network access disabled".
pub struct HostGlobals {
    bindings: RwLock<HashMap<NetPrimitive, Binding>>,
}

impl HostGlobals {
    pub fn new() -> Self {
        let allow: HostFn = Arc::new(|_| Ok(()));
        let bindings = NetPrimitive::ALL
            .into_iter()
            .map(|primitive| (primitive, Binding::Host(allow.clone())))
            .collect();

        Self {
            bindings: RwLock::new(bindings),
        }
    }

    /// Replaces every network primitive with a failing stub.
    ///
    /// Returns `true` only for the call that actually installed the shim.
    pub fn install_network_shim(&self) -> bool {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if bindings
            .values()
            .all(|binding| matches!(binding, Binding::Disabled))
        {
            return false;
        }

        for binding in bindings.values_mut() {
            *binding = Binding::Disabled;
        }
        tracing::debug!("Network shim installed");
        true
    }

    pub fn shim_installed(&self) -> bool {
        self.blocked().len() == NetPrimitive::ALL.len()
    }

    /// Calls a primitive the way user code would. Fails synchronously when disabled.
    pub fn invoke(&self, primitive: NetPrimitive, target: &str) -> Result<(), BackendError> {
        let binding = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&primitive)
            .cloned();

        match binding {
            Some(Binding::Host(host_fn)) => host_fn(target),
            Some(Binding::Disabled) | None => {
                tracing::debug!(
                    "Blocked {} call to {:?}: {}",
                    primitive.name(),
                    target,
                    NETWORK_DISABLED_MSG
                );
                Err(BackendError::NetworkDisabled)
            }
        }
    }

    /// Primitives currently disabled, in [`NetPrimitive::ALL`] order.
    pub fn blocked(&self) -> Vec<NetPrimitive> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        NetPrimitive::ALL
            .into_iter()
            .filter(|primitive| matches!(bindings.get(primitive), Some(Binding::Disabled)))
            .collect()
    }
}

impl Default for HostGlobals {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostGlobals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostGlobals")
            .field("blocked", &self.blocked())
            .finish()
    }
}
