//! Benchmarks for the hot paths of a running mod set:
//! - Memoized cross-mod resolution
//! - Calling a host method through a hook chain
//! - Relinking a module image

extern crate dotmod;

use criterion::{criterion_group, criterion_main, Criterion};
use dotmod::{
    assembly::encoder::IlBuilder,
    metadata::{
        image::{MethodFlags, ModuleImage, ModuleImageBuilder, TypeFlags},
        surface::TypeSurface,
    },
    prelude::*,
    relink::{checksum, Relinker, SymbolResolver},
};
use std::{hint::black_box, sync::Arc};

fn run_sig() -> MethodSignature {
    MethodSignature::static_method(TypeSig::Void, vec![])
}

fn image(name: &str, calls: &[&str]) -> ModuleImage {
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
    builder.build()
}

fn embedded(name: &str, calls: &[&str]) -> ModuleMetadata {
    let package = EmbeddedPackage::new(name)
        .with_file(&format!("{name}.dll"), image(name, calls).write().unwrap())
        .unwrap();
    ModuleMetadata::new(
        name,
        ModuleVersion::new(1, 0, 0),
        PackageSource::Embedded(package),
    )
    .with_entry_point(format!("{name}.dll"))
}

/// Benchmark a memoized resolution across 32 registered mods.
fn bench_cached_resolution(c: &mut Criterion) {
    let runtime = RuntimeBuilder::new().build().unwrap();
    for i in 0..32 {
        runtime.register_module(embedded(&format!("Lib{i}"), &[])).unwrap();
    }
    let app = runtime.register_module(embedded("App", &["Lib31"])).unwrap();

    c.bench_function("resolve_cached_promoted", |b| {
        b.iter(|| black_box(runtime.resolve(&app, black_box("Lib31"))));
    });
    c.bench_function("resolve_cached_miss", |b| {
        b.iter(|| black_box(runtime.resolve(&app, black_box("Nowhere"))));
    });
}

/// Benchmark a host call through a chain of four hooks.
fn bench_hook_chain(c: &mut Criterion) {
    let target = MethodDescriptor::new(
        "Game.Player",
        "Score",
        MethodSignature::static_method(TypeSig::I4, vec![TypeSig::I4]),
    );
    let detours = Arc::new(DetourTable::new());
    detours.declare_bound(target.clone(), |args| Ok(args[0].clone()));
    for _ in 0..4 {
        detours
            .install(
                &target,
                Replacement::with_orig(target.signature.clone(), |orig, args| {
                    let inner = orig.call(args)?.as_i32().unwrap_or(0);
                    Ok(Value::I32(inner + 1))
                }),
                None,
            )
            .unwrap();
    }
    let args = [Value::I32(1)];

    c.bench_function("hook_chain_depth_4", |b| {
        b.iter(|| black_box(detours.call(&target, black_box(&args)).unwrap()));
    });
}

/// The patched host as seen by the relinker.
struct Host(HostModules);

impl SymbolResolver for Host {
    fn resolve_module(&self, name: &str) -> Option<Arc<ModuleSurface>> {
        self.0.resolve(name)
    }
}

/// Benchmark relinking a module with a host redirect and 64 call sites.
fn bench_relink(c: &mut Criterion) {
    let map = RelinkMap::host("Game", "Game.Patched");
    let patches = PatchSet::new();

    let mut api = TypeSurface::new(TypeFlags::PUBLIC);
    api.add_method("Run", run_sig());
    let mut patched = ModuleSurface::new("Game.Patched", ModuleVersion::new(1, 0, 0));
    patched.add_type("Game.Api", api);
    let host = Host(HostModules::new().with_surface(patched));

    let calls = ["Game"; 64];
    let source = image("Mod", &calls);
    let input = checksum(&source.write().unwrap());

    c.bench_function("relink_module", |b| {
        b.iter(|| {
            let relinked = Relinker::new(&map, &patches)
                .relink(black_box(source.clone()), input, &host)
                .unwrap();
            black_box(relinked)
        });
    });
}

criterion_group!(benches, bench_cached_resolution, bench_hook_chain, bench_relink);
criterion_main!(benches);
