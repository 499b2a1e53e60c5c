//! Runtime detours on host methods and static call-site patches.
//!
//! The host declares the methods mods may hook in a [`DetourTable`], by declaring type, name
//! and signature. A declaration does not need an implementation yet: bodies are bound when
//! the host method is first made available, and hooks installed before that point simply
//! wait for it. Calls from the host go through [`DetourTable::call`], which runs the hook
//! chain of the method outermost first.
//!
//! # Architecture
//!
//! - [`crate::detour::hook`] - Hook chains, replacements and the [`hook::Orig`] trampoline
//! - [`crate::detour::patch`] - Permanent IL call-site rewrites applied by the relinker
//!
//! # Examples
//!
//! ```rust
//! use dotmod::detour::{hook::Replacement, DetourTable, MethodDescriptor};
//! use dotmod::metadata::{signature::{MethodSignature, TypeSig}, value::Value};
//!
//! let sig = MethodSignature::static_method(TypeSig::I4, vec![TypeSig::I4]);
//! let target = MethodDescriptor::new("Game.Rules", "MaxHealth", sig.clone());
//!
//! let table = DetourTable::new();
//! table.declare_bound(target.clone(), |_| Ok(Value::I32(100)));
//!
//! let hook = table.install(
//!     &target,
//!     Replacement::with_orig(sig, |orig, args| {
//!         let base = orig.call(args)?.as_i32().unwrap_or_default();
//!         Ok(Value::I32(base * 2))
//!     }),
//!     Some("Tank"),
//! )?;
//! assert_eq!(table.call(&target, &[Value::I32(0)])?, Value::I32(200));
//!
//! assert!(table.remove(&hook));
//! assert_eq!(table.call(&target, &[Value::I32(0)])?, Value::I32(100));
//! # Ok::<(), dotmod::Error>(())
//! ```

pub mod hook;
pub mod patch;

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use dashmap::DashMap;

use crate::{
    metadata::{
        signature::MethodSignature,
        value::{kinds_of, Value, ValueKind},
    },
    Error, Result,
};

use hook::{HookChain, HookEntry, HookHandle, Replacement};

/// Implementation bound to a host method.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Declaring type, name and signature of a host method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Full name of the declaring type
    pub type_name: String,
    /// Method name
    pub name: String,
    /// Method signature
    pub signature: MethodSignature,
}

impl MethodDescriptor {
    /// Creates a descriptor.
    pub fn new(
        type_name: impl Into<String>,
        name: impl Into<String>,
        signature: MethodSignature,
    ) -> Self {
        MethodDescriptor {
            type_name: type_name.into(),
            name: name.into(),
            signature,
        }
    }

    /// Value kinds a call must pass, `this` first for instance methods.
    #[must_use]
    pub fn argument_kinds(&self) -> Vec<ValueKind> {
        let mut kinds = Vec::with_capacity(self.signature.params.len() + 1);
        if self.signature.has_this {
            kinds.push(ValueKind::Object);
        }
        kinds.extend(self.signature.param_kinds());
        kinds
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} {}", self.type_name, self.name, self.signature)
    }
}

/// Same calling convention, return kind and parameter kinds.
fn is_compatible(target: &MethodSignature, candidate: &MethodSignature) -> bool {
    target.has_this == candidate.has_this
        && target.ret.value_kind() == candidate.ret.value_kind()
        && target.param_kinds() == candidate.param_kinds()
}

struct HostMethod {
    descriptor: MethodDescriptor,
    body: RwLock<Option<HostFn>>,
    hooks: HookChain,
}

/// Declared host methods and the hooks installed on them.
pub struct DetourTable {
    methods: DashMap<MethodDescriptor, Arc<HostMethod>>,
    next_id: AtomicU64,
}

impl Default for DetourTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DetourTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetourTable")
            .field("methods", &self.methods.len())
            .field("hooks", &self.total_hooks())
            .finish()
    }
}

impl DetourTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        DetourTable {
            methods: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn method(&self, descriptor: &MethodDescriptor) -> Option<Arc<HostMethod>> {
        self.methods.get(descriptor).map(|entry| entry.value().clone())
    }

    /// Declares a hookable host method without implementation. Returns `false` if it was
    /// already declared.
    pub fn declare(&self, descriptor: MethodDescriptor) -> bool {
        let mut inserted = false;
        self.methods.entry(descriptor.clone()).or_insert_with(|| {
            inserted = true;
            Arc::new(HostMethod {
                descriptor,
                body: RwLock::new(None),
                hooks: HookChain::default(),
            })
        });
        inserted
    }

    /// Declares a host method and binds its implementation.
    pub fn declare_bound<F>(&self, descriptor: MethodDescriptor, body: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.declare(descriptor.clone());
        // Declared on the line above
        let _ = self.bind(&descriptor, body);
    }

    /// Binds or rebinds the implementation of a declared method. Hooks installed earlier take
    /// effect from now on.
    ///
    /// # Errors
    /// Returns [`Error::HookTargetNotFound`] if the method was never declared.
    pub fn bind<F>(&self, descriptor: &MethodDescriptor, body: F) -> Result<()>
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let Some(method) = self.method(descriptor) else {
            return Err(Error::HookTargetNotFound(descriptor.to_string()));
        };

        let previous = write_lock!(method.body).replace(Arc::new(body));
        let pending = method.hooks.len();
        if previous.is_none() && pending > 0 {
            log::info!(
                target: "dotmod::detour",
                "Bound {}, activating {} deferred hooks",
                descriptor,
                pending
            );
        }
        Ok(())
    }

    /// Returns `true` if the method is declared.
    #[must_use]
    pub fn is_declared(&self, descriptor: &MethodDescriptor) -> bool {
        self.methods.contains_key(descriptor)
    }

    /// Returns `true` if the method is declared and has an implementation.
    #[must_use]
    pub fn is_bound(&self, descriptor: &MethodDescriptor) -> bool {
        self.method(descriptor)
            .is_some_and(|method| read_lock!(method.body).is_some())
    }

    /// Installs `replacement` as the new outermost hook on `target`.
    ///
    /// `owner` names the mod the hook belongs to, so it can be removed on unregistration.
    ///
    /// # Errors
    /// Returns [`Error::HookTargetNotFound`] if `target` is not declared and
    /// [`Error::HookSignatureMismatch`] if the replacement's signature is incompatible.
    /// Nothing is installed in either case.
    pub fn install(
        &self,
        target: &MethodDescriptor,
        replacement: Replacement,
        owner: Option<&str>,
    ) -> Result<HookHandle> {
        let Some(method) = self.method(target) else {
            log::error!(
                target: "dotmod::detour",
                "Cannot hook {}: no such host method",
                target
            );
            return Err(Error::HookTargetNotFound(target.to_string()));
        };

        if !is_compatible(&method.descriptor.signature, replacement.signature()) {
            log::error!(
                target: "dotmod::detour",
                "Cannot hook {}: replacement has signature {}",
                target,
                replacement.signature()
            );
            return Err(Error::HookSignatureMismatch {
                target: target.to_string(),
                expected: method.descriptor.signature.to_string(),
                actual: replacement.signature().to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        method.hooks.push(id, HookEntry::new(owner, replacement));

        let deferred = read_lock!(method.body).is_none();
        log::info!(
            target: "dotmod::detour",
            "Installed hook #{} on {}{}",
            id,
            target,
            if deferred { " (deferred until bound)" } else { "" }
        );
        Ok(HookHandle {
            target: target.clone(),
            id,
        })
    }

    /// Removes a hook, restoring the behaviour it shadowed. Unknown hooks are a no-op.
    pub fn remove(&self, handle: &HookHandle) -> bool {
        let removed = self
            .method(&handle.target)
            .is_some_and(|method| method.hooks.remove(handle.id));
        if removed {
            log::info!(target: "dotmod::detour", "Removed {}", handle);
        } else {
            log::debug!(target: "dotmod::detour", "{} was not installed", handle);
        }
        removed
    }

    /// Removes every hook installed by `owner`. Returns how many were removed.
    pub fn remove_owned_by(&self, owner: &str) -> usize {
        let methods: Vec<Arc<HostMethod>> =
            self.methods.iter().map(|entry| entry.value().clone()).collect();

        let mut removed = 0;
        for method in methods {
            for id in method.hooks.owned_by(owner) {
                if method.hooks.remove(id) {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            log::info!(
                target: "dotmod::detour",
                "Removed {} hooks owned by {}",
                removed,
                owner
            );
        }
        removed
    }

    /// Number of hooks installed on `target`.
    #[must_use]
    pub fn hook_count(&self, target: &MethodDescriptor) -> usize {
        self.method(target).map_or(0, |method| method.hooks.len())
    }

    /// Number of hooks across all methods.
    #[must_use]
    pub fn total_hooks(&self) -> usize {
        self.methods
            .iter()
            .map(|entry| entry.value().hooks.len())
            .sum()
    }

    /// Number of declared methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Calls a host method through its hook chain.
    ///
    /// # Errors
    /// Returns [`Error::HookTargetNotFound`] for undeclared methods,
    /// [`Error::ArgumentMismatch`] if `args` do not fit the signature,
    /// [`Error::MethodNotBound`] if the chain reaches a missing implementation, and any error
    /// raised by a hook or the implementation.
    pub fn call(&self, descriptor: &MethodDescriptor, args: &[Value]) -> Result<Value> {
        let Some(method) = self.method(descriptor) else {
            return Err(Error::HookTargetNotFound(descriptor.to_string()));
        };

        let expected = descriptor.argument_kinds();
        let actual = kinds_of(args);
        if expected != actual {
            return Err(Error::ArgumentMismatch {
                method: descriptor.to_string(),
                message: format!("expected {expected:?}, got {actual:?}"),
            });
        }

        let body = read_lock!(method.body).clone();
        method.hooks.call(&method.descriptor, body, args)
    }
}
