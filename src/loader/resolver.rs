//! Two-round dependency resolution.
//!
//! A lookup of a simple name from a context runs:
//!
//! 1. **Local round**: the context's own modules and package, then each dependency context's
//!    local round, depth first, skipping contexts this thread is already resolving in
//! 2. **Global round**: every registered context's own modules and package, in registration
//!    order. The first match wins and its context is promoted to a dependency of the requester
//! 3. **Native**: the host's own modules
//!
//! Each complete result is memoized on the requesting context (see `cache`). The registry
//! lock is only held while copying the scan list; promotion and every per-context query happen
//! after it is released.
//!
//! Cycles between contexts are broken by a thread-local stack of `(context, name)` frames.
//! [`ResolutionGuard`] pushes a frame and pops it on drop, so an early return or a panic in a
//! mod callback cannot leave the stack unbalanced.
//!
//! A module being relinked is visible to lookups on the relinking thread only, through
//! [`InFlightGuard`]. Two modules of one package that reference each other therefore verify,
//! while other threads never observe a surface that may still fail.

use std::{cell::RefCell, sync::Arc};

use crate::{
    loader::{
        cache::{Cached, LookupCache, MissCache, Provider},
        context::{ContextId, IsolationContext},
        LoadedUnit,
    },
    metadata::{diagnostics::DiagnosticCategory, surface::ModuleSurface},
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    context: ContextId,
    name: String,
}

thread_local! {
    static RESOLUTION_STACK: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
    static IN_FLIGHT: RefCell<Vec<(Frame, Arc<ModuleSurface>)>> =
        const { RefCell::new(Vec::new()) };
}

/// RAII frame on the current thread's resolution stack.
pub(crate) struct ResolutionGuard {
    frame: Frame,
}

impl ResolutionGuard {
    /// Pushes `(context, name)`, or returns `None` if that frame is already on the stack.
    pub(crate) fn enter(context: ContextId, name: &str) -> Option<ResolutionGuard> {
        let frame = Frame {
            context,
            name: name.to_string(),
        };
        RESOLUTION_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&frame) {
                return None;
            }
            stack.push(frame.clone());
            Some(ResolutionGuard { frame })
        })
    }
}

impl Drop for ResolutionGuard {
    fn drop(&mut self) {
        let popped = RESOLUTION_STACK.with(|stack| stack.borrow_mut().pop());
        if std::thread::panicking() {
            return;
        }
        match popped {
            Some(frame) if frame == self.frame => {}
            Some(frame) => invariant_violation!(
                "resolution stack mismatch: expected {}/{}, popped {}/{}",
                self.frame.context,
                self.frame.name,
                frame.context,
                frame.name
            ),
            None => invariant_violation!(
                "resolution stack underflow leaving {}/{}",
                self.frame.context,
                self.frame.name
            ),
        }
    }
}

/// Provisional surface of a module the current thread is relinking.
pub(crate) struct InFlightGuard {
    frame: Frame,
}

impl InFlightGuard {
    pub(crate) fn enter(
        context: ContextId,
        name: &str,
        surface: Arc<ModuleSurface>,
    ) -> InFlightGuard {
        let frame = Frame {
            context,
            name: name.to_string(),
        };
        IN_FLIGHT.with(|in_flight| in_flight.borrow_mut().push((frame.clone(), surface)));
        InFlightGuard { frame }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        IN_FLIGHT.with(|in_flight| {
            let mut in_flight = in_flight.borrow_mut();
            if let Some(index) = in_flight.iter().rposition(|(frame, _)| *frame == self.frame) {
                in_flight.remove(index);
            }
        });
    }
}

/// The surface of `name` if the current thread is relinking it in `context`.
pub(crate) fn in_flight_surface(context: ContextId, name: &str) -> Option<Arc<ModuleSurface>> {
    IN_FLIGHT.with(|in_flight| {
        in_flight
            .borrow()
            .iter()
            .rev()
            .find(|(frame, _)| frame.context == context && frame.name == name)
            .map(|(_, surface)| surface.clone())
    })
}

/// Returns `true` if the current thread is resolving anything in `context`.
pub(crate) fn is_active(context: ContextId) -> bool {
    RESOLUTION_STACK.with(|stack| stack.borrow().iter().any(|f| f.context == context))
}

/// Depth of the current thread's resolution stack.
#[cfg(test)]
pub(crate) fn depth() -> usize {
    RESOLUTION_STACK.with(|stack| stack.borrow().len())
}

/// What the native fallback said about a name.
pub(crate) enum Native<T> {
    /// The host provides it and the value is usable
    Found(T),
    /// The host provides it but the host's own loader handles it
    Deferred,
    /// The host does not know the name
    Unknown,
}

/// One flavour of lookup: metadata surfaces or loaded code.
pub(crate) trait LookupKind {
    type Value: Clone;

    /// Used in log lines
    const WHAT: &'static str;

    fn local_cache(context: &IsolationContext) -> &LookupCache<Self::Value>;

    fn global_misses(context: &IsolationContext) -> &MissCache;

    /// The context's own modules, then its own package.
    fn own(context: &IsolationContext, name: &str) -> Option<Self::Value>;

    fn native(context: &IsolationContext, name: &str) -> Native<Self::Value>;

    /// A module this thread is relinking in `context`. Never memoized.
    fn in_flight(_context: &IsolationContext, _name: &str) -> Option<Self::Value> {
        None
    }
}

/// Metadata resolution, used by the relinker.
pub(crate) struct Metadata;

impl LookupKind for Metadata {
    type Value = Arc<ModuleSurface>;

    const WHAT: &'static str = "module";

    fn local_cache(context: &IsolationContext) -> &LookupCache<Self::Value> {
        context.local_resolve_cache()
    }

    fn global_misses(context: &IsolationContext) -> &MissCache {
        context.global_resolve_misses()
    }

    fn own(context: &IsolationContext, name: &str) -> Option<Self::Value> {
        context
            .own_surface(name)
            .or_else(|| context.parse_from_package(name))
    }

    fn native(context: &IsolationContext, name: &str) -> Native<Self::Value> {
        match context.env().native.resolve(name) {
            Some(surface) => Native::Found(surface),
            None => Native::Unknown,
        }
    }

    fn in_flight(context: &IsolationContext, name: &str) -> Option<Self::Value> {
        in_flight_surface(context.id(), name)
    }
}

/// Code resolution, used when the host asks a context to supply a dependency.
pub(crate) struct Code;

impl LookupKind for Code {
    type Value = Arc<LoadedUnit>;

    const WHAT: &'static str = "code unit";

    fn local_cache(context: &IsolationContext) -> &LookupCache<Self::Value> {
        context.local_load_cache()
    }

    fn global_misses(context: &IsolationContext) -> &MissCache {
        context.global_load_misses()
    }

    fn own(context: &IsolationContext, name: &str) -> Option<Self::Value> {
        match context.own_unit(name) {
            Some(Some(unit)) => return Some(unit),
            // A pending load on another thread is waited for below
            Some(None) if !context.is_pending(name) => return None,
            _ => {}
        }
        let path = context.colocated_path(name)?;
        if !context.package_contains(&path) {
            return None;
        }
        context.load_from_package_path(&path, Some(name))
    }

    fn native(context: &IsolationContext, name: &str) -> Native<Self::Value> {
        match context.env().native.resolve(name) {
            Some(_) => Native::Deferred,
            None => Native::Unknown,
        }
    }
}

fn local_round<K: LookupKind>(
    context: &IsolationContext,
    name: &str,
) -> Option<(K::Value, Provider)> {
    if let Some(value) = K::own(context, name) {
        return Some((value, Provider::Own));
    }

    for dependency in context.dependencies() {
        if is_active(dependency.id()) {
            continue;
        }
        let Some(_guard) = ResolutionGuard::enter(dependency.id(), name) else {
            continue;
        };
        if let Some((value, provider)) = local_round::<K>(&dependency, name) {
            let provider = match provider {
                Provider::Own => Provider::Context(Arc::downgrade(&dependency)),
                deeper => deeper,
            };
            return Some((value, provider));
        }
    }

    None
}

fn global_round<K: LookupKind>(
    context: &IsolationContext,
    name: &str,
) -> Option<(K::Value, Arc<IsolationContext>)> {
    context.note_global_scan();

    // The snapshot releases the registry lock before any context is queried.
    let candidates = context.env().registry.snapshot();
    for candidate in candidates {
        if candidate.id() == context.id() || candidate.is_disposed() || is_active(candidate.id())
        {
            continue;
        }
        let Some(_guard) = ResolutionGuard::enter(candidate.id(), name) else {
            continue;
        };
        if let Some(value) = K::own(&candidate, name) {
            return Some((value, candidate));
        }
    }
    None
}

/// Runs a full lookup of `name` from `context`.
pub(crate) fn lookup<K: LookupKind>(context: &IsolationContext, name: &str) -> Option<K::Value> {
    if context.is_disposed() {
        return None;
    }
    if let Some(value) = K::in_flight(context, name) {
        return Some(value);
    }
    let Some(_guard) = ResolutionGuard::enter(context.id(), name) else {
        return None;
    };

    let env = context.env();
    let epoch = env.registry.epoch();
    let cache = K::local_cache(context);
    let mut computed = false;

    let local_known_missing = match cache.get(name, epoch) {
        Cached::Hit(value) => return (!context.is_disposed()).then_some(value),
        Cached::Miss => true,
        Cached::Unknown => false,
    };

    if !local_known_missing {
        computed = true;
        if let Some((value, provider)) = local_round::<K>(context, name) {
            cache.hit(name, provider, value.clone());
            context.forget_if_disposed();
            return (!context.is_disposed()).then_some(value);
        }
        cache.miss(name, epoch);
        context.forget_if_disposed();
    }

    let misses = K::global_misses(context);
    if !misses.is_fresh(name, epoch) {
        computed = true;
        if let Some((value, provider)) = global_round::<K>(context, name) {
            if context.add_dependency(&provider) {
                log::info!(
                    target: "dotmod::loader",
                    "{} found {} {} in {}, promoted to dependency",
                    context.name(),
                    K::WHAT,
                    name,
                    provider.name()
                );
            }
            cache.hit(name, Provider::Context(Arc::downgrade(&provider)), value.clone());
            context.forget_if_disposed();
            return (!context.is_disposed()).then_some(value);
        }
        misses.record(name, epoch);
        context.forget_if_disposed();
    }

    match K::native(context, name) {
        Native::Found(value) => {
            cache.hit(name, Provider::Native, value.clone());
            context.forget_if_disposed();
            return (!context.is_disposed()).then_some(value);
        }
        Native::Deferred => return None,
        Native::Unknown => {}
    }

    if computed {
        log::error!(
            target: "dotmod::loader",
            "{} could not resolve {} {}",
            context.name(),
            K::WHAT,
            name
        );
        env.diagnostics.error(
            Some(context.name()),
            DiagnosticCategory::Resolution,
            format!("unresolved {} {}", K::WHAT, name),
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::identity::ModuleVersion;

    #[test]
    fn test_guard_push_pop() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert_eq!(depth(), 0);
        {
            let _outer = ResolutionGuard::enter(a, "X").unwrap();
            assert!(is_active(a));
            assert!(!is_active(b));
            // Same frame again is a cycle
            assert!(ResolutionGuard::enter(a, "X").is_none());
            {
                let _inner = ResolutionGuard::enter(a, "Y").unwrap();
                let _other = ResolutionGuard::enter(b, "X").unwrap();
                assert_eq!(depth(), 3);
            }
            assert_eq!(depth(), 1);
        }
        assert_eq!(depth(), 0);
        assert!(!is_active(a));
    }

    #[test]
    fn test_in_flight_surface_is_thread_local() {
        let ctx = ContextId::next();
        let surface = Arc::new(ModuleSurface::new("Lib", ModuleVersion::new(1, 0, 0)));
        {
            let _guard = InFlightGuard::enter(ctx, "Lib", surface.clone());
            let found = in_flight_surface(ctx, "Lib").unwrap();
            assert!(Arc::ptr_eq(&found, &surface));
            assert!(in_flight_surface(ctx, "Other").is_none());
            assert!(in_flight_surface(ContextId::next(), "Lib").is_none());

            std::thread::scope(|scope| {
                let other = scope.spawn(|| in_flight_surface(ctx, "Lib").is_none());
                assert!(other.join().unwrap());
            });
        }
        assert!(in_flight_surface(ctx, "Lib").is_none());
    }

    #[test]
    #[should_panic(expected = "resolution stack mismatch")]
    fn test_guard_mismatch_is_fatal() {
        let a = ContextId::next();
        let first = ResolutionGuard::enter(a, "X").unwrap();
        let _second = ResolutionGuard::enter(a, "Y").unwrap();
        // Dropping out of order breaks the stack discipline
        drop(first);
    }
}
