use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = PathBuf::from("../proto");

    println!("cargo:rerun-if-changed=../proto/micros/identity/v1/");
    println!("cargo:rerun-if-changed=../proto/micros/catalog/v1/");
    println!("cargo:rerun-if-changed=../proto/micros/logistics/v1/");

    // Server stubs are generated too so services can stand up in-process
    // doubles of their collaborators in integration tests.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["../proto/micros/identity/v1/identity.proto"],
            &[&proto_root],
        )?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../proto/micros/catalog/v1/catalog.proto"], &[&proto_root])?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["../proto/micros/logistics/v1/logistics.proto"],
            &[&proto_root],
        )?;

    Ok(())
}
