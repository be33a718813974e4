// build.rs

//! Forwards build-time identity constants to the crate, falling back to the
//! stock values when the packaging build does not provide them.

const DEFAULTS: &[(&str, &str)] = &[
    ("LSPD_VERSION_NAME", "1.0.0"),
    ("LSPD_VERSION_CODE", "1"),
    ("MANAGER_PKG_NAME", "org.lsposed.manager"),
    ("MANAGER_INJECTED_PKG_NAME", "com.android.shell"),
    ("MANAGER_INJECTED_UID", "2000"),
    ("XPOSED_API_VERSION", "100"),
];

fn main() {
    for (name, default) in DEFAULTS {
        println!("cargo:rerun-if-env-changed={name}");
        let value = std::env::var(name).unwrap_or_else(|_| default.to_string());
        println!("cargo:rustc-env={name}={value}");
    }
}
