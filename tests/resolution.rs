//! Cross-mod resolution, isolation context teardown and registry consistency under
//! concurrent use.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Barrier,
    },
    thread,
};

use dotmod::{
    assembly::encoder::IlBuilder,
    metadata::image::{MethodFlags, ModuleImage, ModuleImageBuilder, TypeFlags},
    prelude::*,
};

fn run_sig() -> MethodSignature {
    MethodSignature::static_method(TypeSig::Void, vec![])
}

/// `{name}.dll` exporting `{name}.Api::Run` and calling `{dep}.Api::Run` for each of `calls`.
fn module_bytes(name: &str, calls: &[&str]) -> Vec<u8> {
    let mut builder = ModuleImageBuilder::new(name, ModuleVersion::new(1, 0, 0));
    let mut body = IlBuilder::new();
    for dep in calls {
        let scope = builder.assembly_ref(dep, ModuleVersion::new(1, 0, 0));
        let parent = builder.type_ref(scope, &format!("{dep}.Api"));
        body = body.call(builder.member_ref(parent, "Run", run_sig()));
    }
    let ty = builder.type_def(&format!("{name}.Api"), TypeFlags::PUBLIC);
    builder.method(
        ty,
        "Run",
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        run_sig(),
        body.ret().build(),
    );
    builder.build().write().unwrap()
}

fn mod_with(name: &str, calls: &[&str]) -> ModuleMetadata {
    let package = EmbeddedPackage::new(name)
        .with_file(&format!("{name}.dll"), module_bytes(name, calls))
        .unwrap();
    ModuleMetadata::new(
        name,
        ModuleVersion::new(1, 0, 0),
        PackageSource::Embedded(package),
    )
    .with_entry_point(format!("{name}.dll"))
}

/// Host modules whose first lookup of `Host` parks the caller until the test lets it go.
struct GatedHost {
    modules: HostModules,
    armed: AtomicBool,
    gate: Barrier,
}

impl GatedHost {
    fn new() -> Self {
        let host = ModuleImage::parse(&module_bytes("Host", &[])).unwrap();
        GatedHost {
            modules: HostModules::new().with_image(&host),
            armed: AtomicBool::new(true),
            gate: Barrier::new(2),
        }
    }
}

impl NativeResolver for GatedHost {
    fn resolve(&self, name: &str) -> Option<Arc<ModuleSurface>> {
        if name == "Host" && self.armed.swap(false, Ordering::AcqRel) {
            self.gate.wait();
            self.gate.wait();
        }
        self.modules.resolve(name)
    }
}

/// A code loader that parks its first load after loading, until the test lets it go.
struct GatedLoader {
    inner: Arc<InProcessLoader>,
    armed: AtomicBool,
    gate: Barrier,
}

impl CodeLoader for GatedLoader {
    fn load(&self, context: &str, image: &ModuleImage, bytes: &[u8]) -> dotmod::Result<u64> {
        let handle = self.inner.load(context, image, bytes)?;
        if self.armed.swap(false, Ordering::AcqRel) {
            self.gate.wait();
            self.gate.wait();
        }
        Ok(handle)
    }

    fn unload(&self, context: &str, handle: u64) {
        self.inner.unload(context, handle);
    }
}

fn runtime() -> (ModRuntime, Arc<InProcessLoader>) {
    let loader = Arc::new(InProcessLoader::new());
    let runtime = RuntimeBuilder::new()
        .with_code_loader(loader.clone())
        .build()
        .unwrap();
    (runtime, loader)
}

#[test]
fn test_global_hit_promotes_provider() {
    let (runtime, _) = runtime();
    let lib = runtime.register_module(mod_with("Lib", &[])).unwrap();
    let app = runtime.register_module(mod_with("App", &["Lib"])).unwrap();

    let app_ctx = runtime.context(&app).unwrap();
    assert!(app_ctx.has_dependency("Lib"));
    let scans = app_ctx.global_scan_count();
    assert_eq!(scans, 1);

    // Memoized, and the promoted dependency answers locally from now on
    assert!(runtime.resolve(&app, "Lib").is_some());
    let unit = runtime.load_dependency(&app, "Lib").unwrap();
    assert_eq!(unit.context, "Lib");
    assert_eq!(app_ctx.global_scan_count(), scans);

    // The provider going away drops the promoted link and the memo
    assert!(runtime.unregister_module(&lib));
    assert!(!app_ctx.has_dependency("Lib"));
    assert!(runtime.resolve(&app, "Lib").is_none());
}

#[test]
fn test_misses_are_memoized_until_the_registry_changes() {
    let (runtime, _) = runtime();
    let app = runtime.register_module(mod_with("App", &[])).unwrap();
    let ctx = runtime.context(&app).unwrap();

    assert!(runtime.resolve(&app, "Later").is_none());
    let scans = ctx.global_scan_count();
    assert!(runtime.resolve(&app, "Later").is_none());
    assert_eq!(ctx.global_scan_count(), scans);

    // A new provider invalidates the miss
    runtime.register_module(mod_with("Later", &[])).unwrap();
    assert!(runtime.resolve(&app, "Later").is_some());
    assert_eq!(ctx.global_scan_count(), scans + 1);
}

#[test]
fn test_mutual_dependencies_terminate() {
    let (runtime, _) = runtime();
    let v1 = ModuleVersion::new(1, 0, 0);
    let a = runtime
        .register_module(mod_with("A", &[]).with_dependency("B", v1))
        .unwrap();
    let b = runtime
        .register_module(mod_with("B", &[]).with_dependency("A", v1))
        .unwrap();

    let a_ctx = runtime.context(&a).unwrap();
    let b_ctx = runtime.context(&b).unwrap();
    assert!(a_ctx.has_dependency("B"));
    assert!(b_ctx.has_dependency("A"));

    assert!(runtime.resolve(&a, "Missing").is_none());
    assert!(runtime.resolve(&b, "Missing").is_none());
    assert!(runtime.load_dependency(&a, "Missing").is_none());

    // Both still find each other
    assert!(runtime.resolve(&a, "B").is_some());
    assert!(runtime.resolve(&b, "A").is_some());
}

#[test]
fn test_mutually_referencing_modules_load() {
    let (runtime, loader) = runtime();
    let v1 = ModuleVersion::new(1, 0, 0);
    let package = EmbeddedPackage::new("Pair")
        .with_file("Left.dll", module_bytes("Left", &["Right"]))
        .unwrap()
        .with_file("Right.dll", module_bytes("Right", &["Left"]))
        .unwrap();
    let pair = ModuleMetadata::new("Pair", v1, PackageSource::Embedded(package))
        .with_entry_point("Left.dll");

    let handle = runtime.register_module(pair).unwrap();
    assert_eq!(loader.live_count_of("Pair"), 1);
    let unit = runtime.load_dependency(&handle, "Right").unwrap();
    assert_eq!(unit.path, "Right.dll");
    assert_eq!(loader.live_count_of("Pair"), 2);
}

#[test]
fn test_self_referencing_dependency_loads() {
    let package = || {
        let package = EmbeddedPackage::new("Host")
            .with_file("App.dll", module_bytes("App", &[]))
            .unwrap()
            .with_file("Lib.dll", module_bytes("Lib", &["Lib"]))
            .unwrap();
        ModuleMetadata::new("Host", ModuleVersion::new(1, 0, 0), PackageSource::Embedded(package))
            .with_entry_point("App.dll")
    };

    // Code first
    let (code_first, loader) = runtime();
    let host = code_first.register_module(package()).unwrap();
    let unit = code_first.load_dependency(&host, "Lib").unwrap();
    assert_eq!(unit.path, "Lib.dll");
    assert_eq!(loader.live_count_of("Host"), 2);
    assert!(code_first.resolve(&host, "Lib").unwrap().has_type("Lib.Api"));

    // Metadata first
    let (metadata_first, _) = runtime();
    let host = metadata_first.register_module(package()).unwrap();
    assert!(metadata_first.resolve(&host, "Lib").unwrap().has_type("Lib.Api"));
    assert!(metadata_first.load_dependency(&host, "Lib").is_some());
    assert!(!metadata_first.diagnostics().has_errors());
}

#[test]
fn test_provisional_surface_stays_private_to_the_loader() {
    let native = Arc::new(GatedHost::new());
    let runtime = RuntimeBuilder::new()
        .with_native_resolver(native.clone())
        .build()
        .unwrap();
    let package = EmbeddedPackage::new("Foo")
        .with_file("Code/Foo.dll", module_bytes("Foo", &["Host"]))
        .unwrap();
    let metadata = ModuleMetadata::new(
        "Foo",
        ModuleVersion::new(1, 0, 0),
        PackageSource::Embedded(package),
    );
    let ctx = IsolationContext::create(&metadata, runtime.environment()).unwrap();

    thread::scope(|scope| {
        let loading = scope.spawn(|| ctx.load_from_package_path("Code/Foo.dll", None));

        // Foo is pending and its relink is parked on the host lookup
        native.gate.wait();
        assert!(ctx.resolve("Foo").is_none());
        native.gate.wait();

        assert!(loading.join().unwrap().is_some());
    });

    assert!(ctx.resolve("Foo").unwrap().has_type("Foo.Api"));
    ctx.dispose();
}

#[test]
fn test_dispose_during_lookup_keeps_nothing() {
    let native = Arc::new(GatedHost::new());
    let loader = Arc::new(InProcessLoader::new());
    let runtime = RuntimeBuilder::new()
        .with_code_loader(loader.clone())
        .with_native_resolver(native.clone())
        .build()
        .unwrap();
    let ctx = IsolationContext::create(&mod_with("Foo", &["Host"]), runtime.environment()).unwrap();

    thread::scope(|scope| {
        let loading = scope.spawn(|| ctx.load_entry_point());

        native.gate.wait();
        // The loading thread holds the instance lock; disposal must not wait for it
        assert!(ctx.dispose());
        assert!(ctx.resolve("Host").is_none());
        native.gate.wait();

        assert!(loading.join().unwrap().is_none());
    });

    assert_eq!(ctx.cached_lookup_count(), 0);
    assert!(ctx.relink_cache_entry("Foo").is_none());
    assert!(ctx.loaded_units().is_empty());
    assert_eq!(loader.live_count(), 0);
}

#[test]
fn test_dispose_during_code_load_unloads_the_unit() {
    let inner = Arc::new(InProcessLoader::new());
    let gated = Arc::new(GatedLoader {
        inner: inner.clone(),
        armed: AtomicBool::new(true),
        gate: Barrier::new(2),
    });
    let runtime = RuntimeBuilder::new()
        .with_code_loader(gated.clone())
        .build()
        .unwrap();
    let ctx = IsolationContext::create(&mod_with("Foo", &[]), runtime.environment()).unwrap();

    thread::scope(|scope| {
        let loading = scope.spawn(|| ctx.load_entry_point());

        gated.gate.wait();
        assert!(ctx.dispose());
        // Loaded by the code loader but not yet published
        assert_eq!(inner.live_count(), 1);
        gated.gate.wait();

        assert!(loading.join().unwrap().is_none());
    });

    assert_eq!(inner.load_count(), 1);
    assert_eq!(inner.live_count(), 0);
    assert!(ctx.unit("Foo").is_none());
    assert!(ctx.relink_cache_entry("Foo").is_none());
    assert_eq!(ctx.cached_lookup_count(), 0);
}

#[test]
fn test_failed_dependency_is_not_retried() {
    let (runtime, loader) = runtime();
    let app = runtime.register_module(mod_with("App", &[])).unwrap();

    let broken = module_bytes("Broken", &["Nowhere"]);
    let package = EmbeddedPackage::new("Host")
        .with_file("Broken.dll", broken)
        .unwrap();
    let host = runtime
        .register_module(ModuleMetadata::new(
            "Host",
            ModuleVersion::new(1, 0, 0),
            PackageSource::Embedded(package),
        ))
        .unwrap();

    assert!(runtime.load_assembly_from_mod_path(&host, "Broken.dll", None).is_none());
    let before = runtime.diagnostics().count();
    assert!(runtime.load_assembly_from_mod_path(&host, "Broken.dll", None).is_none());
    assert!(runtime.load_dependency(&app, "Broken").is_none());
    assert_eq!(loader.live_count_of("Host"), 0);
    assert_eq!(runtime.context(&host).unwrap().relink_count(), 0);
    // The second attempt only produced App's own resolution failure
    assert!(runtime.diagnostics().count() <= before + 1);
}

#[test]
fn test_concurrent_dispose_runs_once() {
    for _ in 0..16 {
        let (runtime, loader) = runtime();
        let handle = runtime.register_module(mod_with("Foo", &[])).unwrap();
        let ctx = runtime.context(&handle).unwrap();
        let barrier = Barrier::new(2);
        let (barrier, context) = (&barrier, &ctx);

        let results: Vec<bool> = thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        context.dispose()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|&&won| won).count(), 1);
        assert!(ctx.is_disposed());
        assert_eq!(loader.live_count(), 0);
        assert!(runtime.environment().registry.is_empty());
    }
}

#[test]
fn test_registry_consistent_after_concurrent_churn() {
    let (runtime, loader) = runtime();
    let runtime = &runtime;

    thread::scope(|scope| {
        for worker in 0..8 {
            scope.spawn(move || {
                for i in 0..12 {
                    let name = format!("M{worker}_{i}");
                    let handle = runtime.register_module(mod_with(&name, &[])).unwrap();
                    // Resolve something registered by another worker, if it is there
                    let _ = runtime.resolve(&handle, &format!("M{}_{}", (worker + 1) % 8, i));
                    if i % 2 == 1 {
                        assert!(runtime.unregister_module(&handle));
                    }
                }
            });
        }
    });

    let registered: HashSet<String> = runtime
        .modules()
        .iter()
        .map(|h| h.name().to_string())
        .collect();
    let snapshot = runtime.environment().registry.snapshot();
    let in_registry: Vec<String> = snapshot.iter().map(|c| c.name().to_string()).collect();
    let unique: HashSet<String> = in_registry.iter().cloned().collect();

    assert_eq!(registered.len(), 8 * 6);
    assert_eq!(in_registry.len(), unique.len());
    assert_eq!(unique, registered);
    assert!(snapshot.iter().all(|c| !c.is_disposed()));
    assert_eq!(loader.live_count(), 8 * 6);
}

#[test]
fn test_concurrent_resolution_is_consistent() {
    let (runtime, _) = runtime();
    runtime.register_module(mod_with("Lib", &[])).unwrap();
    let apps: Vec<ModuleHandle> = (0..4)
        .map(|i| runtime.register_module(mod_with(&format!("App{i}"), &[])).unwrap())
        .collect();
    let runtime = &runtime;

    thread::scope(|scope| {
        for app in &apps {
            scope.spawn(move || {
                for _ in 0..50 {
                    let surface = runtime.resolve(app, "Lib").unwrap();
                    assert!(surface.has_type("Lib.Api"));
                }
            });
        }
    });

    for app in &apps {
        let ctx = runtime.context(app).unwrap();
        assert!(ctx.has_dependency("Lib"));
        assert_eq!(ctx.global_scan_count(), 1);
    }
}
