use ed_domain::config::Config;

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 3210);
}

#[test]
fn explicit_zero_host_parses() {
    let config = Config::from_toml_str(
        r#"
[server]
host = "0.0.0.0"
port = 3210
"#,
    )
    .unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
}

#[test]
fn unknown_sections_are_tolerated() {
    // Configs from a newer release still parse.
    let config = Config::from_toml_str(
        r#"
[server]
port = 8080

[future_section]
knob = true
"#,
    )
    .unwrap();
    assert_eq!(config.server.port, 8080);
}

#[test]
fn sandbox_policy_defaults() {
    let config = Config::default();
    assert_eq!(config.sandbox.memory_bytes, 1024 * 1024 * 1024);
    assert_eq!(config.sandbox.cpus, 1);
    assert_eq!(config.sandbox.pids_limit, 100);
    assert_eq!(config.sandbox.workspace_root, "/home/node/edward");
}

#[test]
fn roundtrips_through_toml() {
    let config = Config::default();
    let rendered = toml::to_string(&config).unwrap();
    let back = Config::from_toml_str(&rendered).unwrap();
    assert_eq!(back.server.port, config.server.port);
    assert_eq!(back.limits.max_turns, config.limits.max_turns);
    assert_eq!(back.sandbox.pool_size, config.sandbox.pool_size);
}
