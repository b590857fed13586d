fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile CSI proto (upstream container-storage-interface definitions)
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    // Compile control-plane agent proto for client
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["../proto/efs_agent.proto"], &["../proto"])?;

    Ok(())
}
