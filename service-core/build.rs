use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = PathBuf::from("../proto");

    // Tell cargo to recompile if any proto files change
    println!("cargo:rerun-if-changed=../proto/micros/auth/v1/");

    // Peers only call the auth service; no server code in service-core
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["../proto/micros/auth/v1/auth.proto"], &[&proto_root])?;

    Ok(())
}
