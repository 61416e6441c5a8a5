fn main() {
    println!("cargo:rerun-if-changed=proto/envelope.proto");
    prost_build::compile_protos(&["proto/envelope.proto"], &["proto/"])
        .expect("failed to compile envelope.proto");
}
