fn main() {
    let now = chrono::Utc::now().format("%Y-%m-%d").to_string();
    println!("cargo:rustc-env=BUILD_DATE={}", now);

    // The WebRTC shim exports the ap_* entry points
    if std::env::var_os("CARGO_FEATURE_WEBRTC").is_some() {
        println!("cargo:rustc-link-lib=webrtc_audio_processing_shim");
        if let Some(dir) = std::env::var_os("AECSYNC_WEBRTC_LIB_DIR") {
            println!("cargo:rustc-link-search=native={}", dir.to_string_lossy());
        }
    }
    println!("cargo:rerun-if-env-changed=AECSYNC_WEBRTC_LIB_DIR");
}
