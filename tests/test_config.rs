use std::time::Duration;

use ferry::config::{CONFIG_ENV, Config, LISTEN_ENV};

#[test]
fn test_config_defaults() {
    let cfg = Config::default();

    assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.backlog, 511);
    assert_eq!(cfg.max_connections, 0);
    assert_eq!(cfg.timeout_ms, 120_000);
    assert_eq!(cfg.max_requests_per_connection, 1000);
    assert_eq!(cfg.pool.parsers, 256);
    assert_eq!(cfg.memory_hint.threshold, 1000);
    assert_eq!(cfg.log_level, "info");
}

#[test]
fn test_config_partial_yaml_keeps_defaults() {
    let cfg = Config::from_yaml(
        "listen_addr: 0.0.0.0:3000\n\
         max_connections: 64\n\
         pool:\n  \
           responses: 8\n",
    )
    .unwrap();

    assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    assert_eq!(cfg.max_connections, 64);
    assert_eq!(cfg.pool.responses, 8);
    assert_eq!(cfg.pool.messages, 256);
    assert_eq!(cfg.batch_size, 16);
}

#[test]
fn test_config_empty_yaml() {
    assert_eq!(Config::from_yaml("").unwrap(), Config::default());
}

#[test]
fn test_config_invalid_yaml() {
    assert!(Config::from_yaml("max_connections: lots").is_err());
}

#[test]
fn test_config_missing_file() {
    let err = Config::from_file("/nonexistent/ferry.yaml").unwrap_err();
    assert!(err.to_string().contains("/nonexistent/ferry.yaml"));
}

#[test]
fn test_config_server_options() {
    let cfg = Config::from_yaml("timeout_ms: 0\nclose_grace_ms: 250\nbacklog: 64\n").unwrap();
    let opts = cfg.server_options();

    assert_eq!(opts.timeout, Duration::ZERO);
    assert_eq!(opts.close_grace, Duration::from_millis(250));
    assert_eq!(opts.backlog, 64);
    assert_eq!(opts.max_requests_per_connection, 1000);
}

// Environment variables are process-wide, so every env-dependent case lives
// in this one test.
#[test]
fn test_config_load_from_env() {
    let path = std::env::temp_dir().join(format!("ferry-config-{}.yaml", std::process::id()));
    std::fs::write(&path, "listen_addr: 10.0.0.1:9000\nbatch_size: 4\n").unwrap();

    unsafe {
        std::env::remove_var(LISTEN_ENV);
        std::env::remove_var(CONFIG_ENV);
    }
    assert_eq!(Config::load().unwrap().listen_addr, "127.0.0.1:8080");

    unsafe {
        std::env::set_var(CONFIG_ENV, &path);
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.listen_addr, "10.0.0.1:9000");
    assert_eq!(cfg.batch_size, 4);

    unsafe {
        std::env::set_var(LISTEN_ENV, "0.0.0.0:5000");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.listen_addr, "0.0.0.0:5000");
    assert_eq!(cfg.batch_size, 4);

    unsafe {
        std::env::remove_var(LISTEN_ENV);
        std::env::remove_var(CONFIG_ENV);
    }
    std::fs::remove_file(&path).unwrap();
}
