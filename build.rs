use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Build stamp for `headless-rt version`. Honors SOURCE_DATE_EPOCH so
/// reproducible builds get a fixed stamp.
fn build_stamp() -> String {
    let at = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    at.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_string())
}

fn main() {
    let features = if std::env::var_os("CARGO_FEATURE_GPU").is_some() {
        "software, gpu"
    } else {
        "software"
    };

    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rustc-env=HEADLESS_RT_BUILD_STAMP={}", build_stamp());
    println!("cargo:rustc-env=HEADLESS_RT_BACKENDS={}", features);
}
