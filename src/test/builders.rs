//! Small compiled modules for loader and relinker tests.

use crate::{
    assembly::encoder::IlBuilder,
    metadata::{
        identity::ModuleVersion,
        image::{MethodFlags, ModuleImage, ModuleImageBuilder, TypeFlags},
        signature::{MethodSignature, TypeSig},
    },
};

/// `static void ()`, the signature of every generated method.
pub fn run_signature() -> MethodSignature {
    MethodSignature::static_method(TypeSig::Void, vec![])
}

fn encode(image: &ModuleImage) -> Vec<u8> {
    image.write().unwrap()
}

/// A module named `name` exporting `type_name` with a static `Run` method and no references.
pub fn leaf_module(name: &str, type_name: &str) -> Vec<u8> {
    let mut builder = ModuleImageBuilder::new(name, ModuleVersion::new(1, 0, 0));
    let ty = builder.type_def(type_name, TypeFlags::PUBLIC);
    builder.method(
        ty,
        "Run",
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        run_signature(),
        IlBuilder::new().ret().build(),
    );
    encode(&builder.build())
}

/// A module named `name` whose `{name}.Plugin::Load` calls `dep_type::method` in `dep_module`.
pub fn caller_module(name: &str, dep_module: &str, dep_type: &str, method: &str) -> Vec<u8> {
    encode(&caller_image(name, &[(dep_module, dep_type, method)]))
}

/// Like [`caller_module`], calling every `(module, type, method)` in `calls` from `Load`.
pub fn caller_image(name: &str, calls: &[(&str, &str, &str)]) -> ModuleImage {
    let mut builder = ModuleImageBuilder::new(name, ModuleVersion::new(1, 0, 0));
    let mut body = IlBuilder::new();
    for (module, type_name, method) in calls {
        let scope = builder.assembly_ref(module, ModuleVersion::new(1, 0, 0));
        let parent = builder.type_ref(scope, type_name);
        let member = builder.member_ref(parent, method, run_signature());
        body = body.call(member);
    }
    let ty = builder.type_def(&format!("{name}.Plugin"), TypeFlags::PUBLIC);
    builder.method(
        ty,
        "Load",
        MethodFlags::PUBLIC | MethodFlags::STATIC,
        run_signature(),
        body.ret().build(),
    );
    builder.build()
}
