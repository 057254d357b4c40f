//! Default configuration values

/// Environment variable prefix, e.g. `MODEL_HUB_MODEL_STORE_PATH`
pub const ENV_PREFIX: &str = "MODEL_HUB";

/// Environment variable naming an explicit configuration file
pub const CONFIG_FILE_ENV: &str = "MODEL_HUB_CONFIG";

pub const MODEL_STORE_PATH: &str = "/var/lib/model-hub/models";
pub const STATE_PATH: &str = "/var/lib/model-hub/state";
pub const INFERENCE_SERVER_URL: &str = "http://localhost:8000";
pub const INFERENCE_REQUEST_TIMEOUT_MS: i64 = 10 * 60 * 1000;
pub const OPERATION_RESULT_TTL_MS: i64 = 24 * 60 * 60 * 1000;
pub const OPERATION_GET_TIMEOUT_MS: i64 = 5 * 1000;
pub const GIT_CLONE_TIMEOUT_MS: i64 = 10 * 60 * 1000;
pub const LOG_LEVEL: &str = "info";
pub const LOG_FORMAT: &str = "text";

/// All defaults as (key, value) pairs, numbers first
pub(crate) fn integer_defaults() -> [(&'static str, i64); 4] {
    [
        ("inference_request_timeout_ms", INFERENCE_REQUEST_TIMEOUT_MS),
        ("operation_result_ttl_ms", OPERATION_RESULT_TTL_MS),
        ("operation_get_timeout_ms", OPERATION_GET_TIMEOUT_MS),
        ("git_clone_timeout_ms", GIT_CLONE_TIMEOUT_MS),
    ]
}

pub(crate) fn string_defaults() -> [(&'static str, &'static str); 5] {
    [
        ("model_store_path", MODEL_STORE_PATH),
        ("state_path", STATE_PATH),
        ("inference_server_url", INFERENCE_SERVER_URL),
        ("log_level", LOG_LEVEL),
        ("log_format", LOG_FORMAT),
    ]
}
