fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .format(true)
        .compile(
            &["proto/runtime/v1alpha2/api.proto"],
            &["proto/runtime/v1alpha2"],
        )?;
    Ok(())
}
