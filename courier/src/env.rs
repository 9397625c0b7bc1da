use anyhow::Result;
use std::env;

static COURIER_EMULATOR_HOST: &'static str = "COURIER_EMULATOR_HOST";

fn get(var: &str) -> Result<String> {
    match env::var(var) {
        Ok(val) => Ok(val),
        Err(err) => Err(anyhow::anyhow!("{}: {}", var, err)),
    }
}

/// formats `COURIER_EMULATOR_HOST` env variable as string
pub fn format_emulator_host() -> String {
    format!("{}", COURIER_EMULATOR_HOST)
}

/// Returns the broker connection target (a nats uri) from
/// the COURIER_EMULATOR_HOST env variable
pub fn emulator_host() -> Result<String> {
    get(COURIER_EMULATOR_HOST)
}

// Sets the COURIER_EMULATOR_HOST env variable
pub fn set_emulator_host(uri: String) {
    env::set_var(COURIER_EMULATOR_HOST, uri);
}

