//! Build script to generate gRPC bindings from the protobuf definition.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    println!("cargo:rerun-if-changed=proto/rangeplane.proto");
    tonic_build::configure().compile_protos(&["proto/rangeplane.proto"], &["proto"])?;
    Ok(())
}
