//! Hook chains and the "orig" trampoline.
//!
//! Every host method owns a [`HookChain`]: an ordered, lock-free map from install sequence
//! number to hook. The highest sequence number is the outermost hook. A call snapshots the
//! chain once and walks it from the outside in; each [`Orig`] handed to a hook points one
//! step further in, and the innermost one calls the bound implementation. Installing or
//! removing a hook while a call is running affects only later calls.

use std::{fmt, sync::Arc};

use crossbeam_skiplist::SkipMap;

use crate::{
    detour::{HostFn, MethodDescriptor},
    metadata::{signature::MethodSignature, value::Value},
    Error, Result,
};

/// Hook body that fully replaces the next inner behaviour.
pub type DirectFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Hook body that receives the next inner behaviour as its first parameter.
pub type WithOrigFn = Arc<dyn Fn(&Orig, &[Value]) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
enum ReplacementBody {
    Direct(DirectFn),
    WithOrig(WithOrigFn),
}

/// Mod supplied logic for a detoured host method.
///
/// The replacement declares the signature it was written against; installation fails if that
/// signature is not compatible with the target's.
#[derive(Clone)]
pub struct Replacement {
    signature: MethodSignature,
    body: ReplacementBody,
}

impl Replacement {
    /// A replacement that does not call through to the original.
    pub fn direct<F>(signature: MethodSignature, body: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Replacement {
            signature,
            body: ReplacementBody::Direct(Arc::new(body)),
        }
    }

    /// A replacement that receives an [`Orig`] trampoline ahead of the arguments.
    pub fn with_orig<F>(signature: MethodSignature, body: F) -> Self
    where
        F: Fn(&Orig, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Replacement {
            signature,
            body: ReplacementBody::WithOrig(Arc::new(body)),
        }
    }

    /// Signature the replacement was written against.
    #[must_use]
    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    /// Returns `true` if the replacement wants an orig trampoline.
    #[must_use]
    pub fn wants_orig(&self) -> bool {
        matches!(self.body, ReplacementBody::WithOrig(_))
    }
}

impl fmt::Debug for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replacement")
            .field("signature", &self.signature.to_string())
            .field("wants_orig", &self.wants_orig())
            .finish()
    }
}

/// Identifies one installed hook. Removing it restores the behaviour it shadowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookHandle {
    pub(crate) target: MethodDescriptor,
    pub(crate) id: u64,
}

impl HookHandle {
    /// The hooked method.
    #[must_use]
    pub fn target(&self) -> &MethodDescriptor {
        &self.target
    }

    /// Install sequence number, unique per detour table.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook #{} on {}", self.id, self.target)
    }
}

pub(crate) struct HookEntry {
    pub(crate) owner: Option<String>,
    replacement: Replacement,
}

impl HookEntry {
    pub(crate) fn new(owner: Option<&str>, replacement: Replacement) -> Self {
        HookEntry {
            owner: owner.map(str::to_string),
            replacement,
        }
    }
}

/// Installed hooks of one method, keyed by install sequence.
#[derive(Default)]
pub(crate) struct HookChain {
    hooks: SkipMap<u64, Arc<HookEntry>>,
}

impl HookChain {
    pub(crate) fn push(&self, id: u64, entry: HookEntry) {
        self.hooks.insert(id, Arc::new(entry));
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.hooks.remove(&id).is_some()
    }

    /// Ids of hooks installed by `owner`.
    pub(crate) fn owned_by(&self, owner: &str) -> Vec<u64> {
        self.hooks
            .iter()
            .filter(|entry| entry.value().owner.as_deref() == Some(owner))
            .map(|entry| *entry.key())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Outermost first.
    fn snapshot(&self) -> Arc<[Arc<HookEntry>]> {
        self.hooks
            .iter()
            .rev()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn call(
        &self,
        method: &MethodDescriptor,
        body: Option<HostFn>,
        args: &[Value],
    ) -> Result<Value> {
        let orig = Orig {
            method: method.clone(),
            chain: self.snapshot(),
            depth: 0,
            body,
        };
        orig.call(args)
    }
}

/// The behaviour a hook shadows: the next inner hook, or the bound implementation.
pub struct Orig {
    method: MethodDescriptor,
    chain: Arc<[Arc<HookEntry>]>,
    depth: usize,
    body: Option<HostFn>,
}

impl Orig {
    /// The hooked method.
    #[must_use]
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Calls through.
    ///
    /// # Errors
    /// Returns [`Error::MethodNotBound`] when the chain ends at a method without
    /// implementation, or whatever the inner behaviour returns.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        let Some(hook) = self.chain.get(self.depth) else {
            return match &self.body {
                Some(body) => body(args),
                None => Err(Error::MethodNotBound(self.method.to_string())),
            };
        };

        match &hook.replacement.body {
            ReplacementBody::Direct(body) => body(args),
            ReplacementBody::WithOrig(body) => {
                let inner = Orig {
                    method: self.method.clone(),
                    chain: self.chain.clone(),
                    depth: self.depth + 1,
                    body: self.body.clone(),
                };
                body(&inner, args)
            }
        }
    }
}

impl fmt::Debug for Orig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orig")
            .field("method", &self.method.to_string())
            .field("depth", &self.depth)
            .field("remaining", &self.chain.len().saturating_sub(self.depth))
            .finish()
    }
}
