//! Config loader tests: layered `.env` files, process-env precedence, and
//! startup validation of secrets and allowlists.

use credbroker::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

// 32 zero bytes, base64.
const VALID_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        env::remove_var("CREDBROKER_PROFILE");
        env::remove_var("CREDBROKER_API_BIND_ADDR");
        env::remove_var("CREDBROKER_OPERATOR_TOKEN");
        env::remove_var("CREDBROKER_OPERATOR_TOKENS");
        env::remove_var("CREDBROKER_VAULT_KEY_EU");
        env::remove_var("CREDBROKER_VAULT_DEFAULT_REGION");
        env::remove_var("CREDBROKER_REDIRECT_ALLOWED_DOMAINS");
        env::remove_var("CREDBROKER_REDIRECT_ALLOWED_SCHEMES");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

fn base_env(extra: &str) -> String {
    format!(
        "CREDBROKER_OPERATOR_TOKEN=op-token\n\
         CREDBROKER_VAULT_KEY_EU={}\n\
         CREDBROKER_REDIRECT_ALLOWED_DOMAINS=app.example.com\n\
         {}\n",
        VALID_KEY, extra
    )
}

#[test]
fn loads_from_env_file_with_defaults() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", &base_env(""));

    let cfg = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .expect("config loads");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.operator_tokens, vec!["op-token".to_string()]);
    assert_eq!(cfg.vault.default_region, "eu");
    assert_eq!(cfg.vault.key_eu.as_ref().unwrap().len(), 32);
    assert_eq!(cfg.redirect.allowed_schemes, vec!["https".to_string()]);
    assert_eq!(cfg.token_refresh.window_seconds, 1800);
    assert_eq!(cfg.token_refresh.concurrency, 10);
    assert_eq!(cfg.oauth_state_ttl_minutes, 15);
    clear_env();
}

#[test]
fn profile_env_file_overrides_base() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &base_env("CREDBROKER_API_BIND_ADDR=127.0.0.1:3000\nCREDBROKER_PROFILE=test"),
    );
    write_env_file(
        &temp_dir,
        ".env.test",
        "CREDBROKER_API_BIND_ADDR=127.0.0.1:5000\n",
    );

    let cfg = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .expect("config loads");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "127.0.0.1:5000");
    clear_env();
}

#[test]
fn process_env_wins_over_files() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &base_env("CREDBROKER_API_BIND_ADDR=127.0.0.1:3000"),
    );

    unsafe {
        env::set_var("CREDBROKER_API_BIND_ADDR", "127.0.0.1:9999");
    }

    let cfg = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .expect("config loads");
    assert_eq!(cfg.api_bind_addr, "127.0.0.1:9999");
    clear_env();
}

#[test]
fn missing_operator_token_fails_validation() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!(
            "CREDBROKER_VAULT_KEY_EU={}\nCREDBROKER_REDIRECT_ALLOWED_DOMAINS=app.example.com\n",
            VALID_KEY
        ),
    );

    let result = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf()).load();
    assert!(matches!(result, Err(ConfigError::MissingOperatorTokens)));
    clear_env();
}

#[test]
fn invalid_vault_key_base64_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "CREDBROKER_OPERATOR_TOKEN=op-token\n\
         CREDBROKER_VAULT_KEY_EU=!!!not-base64!!!\n\
         CREDBROKER_REDIRECT_ALLOWED_DOMAINS=app.example.com\n",
    );

    let result = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf()).load();
    assert!(matches!(
        result,
        Err(ConfigError::InvalidVaultKeyBase64 { .. })
    ));
    clear_env();
}

#[test]
fn default_region_requires_a_key() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &base_env("CREDBROKER_VAULT_DEFAULT_REGION=us"),
    );

    let result = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf()).load();
    assert!(matches!(result, Err(ConfigError::MissingVaultKey { .. })));
    clear_env();
}

#[test]
fn comma_separated_lists_are_split_and_trimmed() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &base_env(
            "CREDBROKER_OPERATOR_TOKENS=tok-a, tok-b ,\n\
             CREDBROKER_REDIRECT_ALLOWED_SCHEMES=https, http",
        ),
    );

    let cfg = ConfigLoader::with_base_dir(temp_dir.path().to_path_buf())
        .load()
        .expect("config loads");
    assert_eq!(cfg.operator_tokens, vec!["tok-a", "tok-b"]);
    assert_eq!(cfg.redirect.allowed_schemes, vec!["https", "http"]);
    clear_env();
}
