//! Hook stacking, undo and failure reporting through the runtime.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use dotmod::prelude::*;

fn damage() -> MethodDescriptor {
    MethodDescriptor::new(
        "Game.Player",
        "TakeDamage",
        MethodSignature::instance(TypeSig::I4, vec![TypeSig::I4]),
    )
}

fn player() -> Value {
    Value::Object(Arc::new("player"))
}

fn hit(runtime: &ModRuntime, amount: i32) -> i32 {
    runtime
        .call_host(&damage(), &[player(), Value::I32(amount)])
        .unwrap()
        .as_i32()
        .unwrap()
}

fn runtime() -> ModRuntime {
    let detours = Arc::new(DetourTable::new());
    detours.declare_bound(damage(), |args| Ok(Value::I32(args[1].as_i32().unwrap_or(0))));
    RuntimeBuilder::new().with_detours(detours).build().unwrap()
}

/// Doubles whatever the inner behaviour returns.
fn doubling() -> Replacement {
    Replacement::with_orig(damage().signature, |orig, args| {
        let inner = orig.call(args)?.as_i32().unwrap_or(0);
        Ok(Value::I32(inner * 2))
    })
}

/// Adds one to the inner behaviour.
fn plus_one() -> Replacement {
    Replacement::with_orig(damage().signature, |orig, args| {
        let inner = orig.call(args)?.as_i32().unwrap_or(0);
        Ok(Value::I32(inner + 1))
    })
}

#[test]
fn test_stacking_and_undo() {
    let runtime = runtime();
    assert_eq!(hit(&runtime, 10), 10);

    let h1 = runtime.install_hook(&damage(), doubling(), None).unwrap();
    assert_eq!(hit(&runtime, 10), 20);

    // Outermost hook runs first
    let h2 = runtime.install_hook(&damage(), plus_one(), None).unwrap();
    assert_eq!(hit(&runtime, 10), 21);

    assert!(runtime.remove_hook(&h2));
    assert_eq!(hit(&runtime, 10), 20);

    assert!(runtime.remove_hook(&h1));
    assert_eq!(hit(&runtime, 10), 10);
    assert!(!runtime.remove_hook(&h1));
    assert_eq!(runtime.detours().hook_count(&damage()), 0);
}

#[test]
fn test_removing_inner_hook_keeps_outer() {
    let runtime = runtime();
    let h1 = runtime.install_hook(&damage(), doubling(), None).unwrap();
    let _h2 = runtime.install_hook(&damage(), plus_one(), None).unwrap();

    assert!(runtime.remove_hook(&h1));
    assert_eq!(hit(&runtime, 10), 11);
}

#[test]
fn test_direct_replacement_shadows_inner_hooks() {
    let runtime = runtime();
    runtime.install_hook(&damage(), doubling(), None).unwrap();
    let god_mode = runtime
        .install_hook(
            &damage(),
            Replacement::direct(damage().signature, |_| Ok(Value::I32(0))),
            None,
        )
        .unwrap();
    assert_eq!(hit(&runtime, 10), 0);
    runtime.remove_hook(&god_mode);
    assert_eq!(hit(&runtime, 10), 20);
}

#[test]
fn test_install_failures_are_reported() {
    let runtime = runtime();
    let missing = MethodDescriptor::new("Game.Player", "Fly", damage().signature);
    let result = runtime.install_hook(&missing, doubling(), None);
    assert!(matches!(result, Err(Error::HookTargetNotFound(_))));

    let wrong = Replacement::direct(
        MethodSignature::instance(TypeSig::Void, vec![TypeSig::I4]),
        |_| Ok(Value::Void),
    );
    let result = runtime.install_hook(&damage(), wrong, None);
    assert!(matches!(result, Err(Error::HookSignatureMismatch { .. })));

    assert_eq!(runtime.detours().total_hooks(), 0);
    let hook_errors = runtime
        .diagnostics()
        .iter()
        .filter(|d| d.category == DiagnosticCategory::Hook)
        .count();
    assert_eq!(hook_errors, 2);
}

#[test]
fn test_deferred_hook_activates_on_bind() {
    let detours = Arc::new(DetourTable::new());
    let spawn = MethodDescriptor::new(
        "Game.World",
        "Spawn",
        MethodSignature::static_method(TypeSig::String, vec![]),
    );
    detours.declare(spawn.clone());
    let runtime = RuntimeBuilder::new()
        .with_detours(detours.clone())
        .build()
        .unwrap();

    runtime
        .install_hook(
            &spawn,
            Replacement::with_orig(spawn.signature.clone(), |orig, args| {
                let inner = orig.call(args)?;
                Ok(Value::Str(format!("modded {}", inner.as_str().unwrap_or_default())))
            }),
            None,
        )
        .unwrap();
    assert!(matches!(
        runtime.call_host(&spawn, &[]),
        Err(Error::MethodNotBound(_))
    ));

    detours.bind(&spawn, |_| Ok(Value::from("skeleton"))).unwrap();
    assert_eq!(runtime.call_host(&spawn, &[]).unwrap(), Value::from("modded skeleton"));
}

#[test]
fn test_calls_during_install_and_removal() {
    let runtime = runtime();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        let runtime = &runtime;
        let stop = &stop;
        for _ in 0..4 {
            scope.spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    // A call sees some subset of the installed hooks, never a torn chain
                    let value = hit(runtime, 5);
                    assert!(matches!(value, 5 | 6 | 10 | 11), "unexpected {value}");
                }
            });
        }

        for _ in 0..200 {
            let h1 = runtime.install_hook(&damage(), doubling(), None).unwrap();
            let h2 = runtime.install_hook(&damage(), plus_one(), None).unwrap();
            assert!(runtime.remove_hook(&h2));
            assert!(runtime.remove_hook(&h1));
        }
        stop.store(true, Ordering::Release);
    });

    assert_eq!(runtime.detours().total_hooks(), 0);
    assert_eq!(hit(&runtime, 5), 5);
}
