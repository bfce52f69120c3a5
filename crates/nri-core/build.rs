use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    println!("cargo:rerun-if-changed=proto/api.proto");

    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["proto"])
        .input("proto/api.proto")
        .out_dir(&out_dir)
        .run()
        .expect("failed to compile api.proto messages");

    ttrpc_codegen::Codegen::new()
        .out_dir(&out_dir)
        .inputs(["proto/api.proto"])
        .include("proto")
        .rust_protobuf()
        .customize(ttrpc_codegen::Customize {
            async_all: true,
            ..Default::default()
        })
        .run()
        .expect("failed to compile api.proto services");

    // rust-protobuf emits one file per .proto (api.rs); re-export it as
    // `mod.rs` so `lib.rs` can `include!` a single entry point for the
    // message types, the same shape the teacher's generated output takes.
    std::fs::write(out_dir.join("mod.rs"), "include!(\"api.rs\");\n")
        .expect("failed to write mod.rs");
}
