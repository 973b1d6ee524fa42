/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Config store key prefixes for persisted per-service overrides
pub const ENABLED_KEY_PREFIX: &str = "enabled_";
pub const EXPIRATION_KEY_PREFIX: &str = "enabled_expiration_";

/// Key holding the persisted enabled flag of a service
pub fn enabled_key(service_id: &str) -> String {
    format!("{}{}", ENABLED_KEY_PREFIX, service_id)
}

/// Key holding the persisted expiration time of a service
pub fn expiration_key(service_id: &str) -> String {
    format!("{}{}", EXPIRATION_KEY_PREFIX, service_id)
}
