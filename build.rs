use std::env;
use std::fs;
use std::path::Path;

const CONFIG_HEADER: &str = "recovery_config.h";

/// (define name, default). Every value is exported as `RECOVERY_<NAME>`.
const SETTINGS: &[(&str, &str)] = &[
    ("MASTER_PASSWORD", "recovery"),
    ("WIFI_SSID", ""),
    ("WIFI_PASSWORD", ""),
    // NVS keys are limited to 15 characters.
    ("WIFI_SSID_KEY", "wifi_ssid"),
    ("WIFI_PASSWORD_KEY", "wifi_pass"),
    ("LOG_LEVEL", "info"),
];

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF
    embuild::espidf::sysenv::output();

    println!("cargo:rerun-if-changed={CONFIG_HEADER}");

    let header = if Path::new(CONFIG_HEADER).exists() {
        fs::read_to_string(CONFIG_HEADER)?
    } else {
        println!("cargo:warning={CONFIG_HEADER} not found, using built-in defaults");
        String::new()
    };

    for (name, default) in SETTINGS {
        let env_name = format!("RECOVERY_{name}");
        println!("cargo:rerun-if-env-changed={env_name}");

        let value = env::var(&env_name)
            .ok()
            .or_else(|| define(&header, name))
            .unwrap_or_else(|| {
                if *name == "MASTER_PASSWORD" {
                    println!("cargo:warning=No master password configured, using the default '{default}'");
                }
                default.to_string()
            });
        println!("cargo:rustc-env={env_name}={value}");
    }

    Ok(())
}

/// Value of `#define NAME "value"` in the header, if present.
fn define(header: &str, name: &str) -> Option<String> {
    header.lines().find_map(|line| {
        let mut parts = line.trim().splitn(3, char::is_whitespace);
        match (parts.next(), parts.next(), parts.next()) {
            (Some("#define"), Some(key), Some(rest)) if key == name => rest.split('"').nth(1).map(str::to_string),
            _ => None,
        }
    })
}
