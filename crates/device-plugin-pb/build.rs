fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Both sides are generated: the plugin serves DevicePlugin and dials
    // Registration/PodResourcesLister, tests do the opposite.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/deviceplugin.proto", "proto/podresources.proto"],
            &["proto"],
        )?;

    println!("cargo:rerun-if-changed=proto");
    Ok(())
}
