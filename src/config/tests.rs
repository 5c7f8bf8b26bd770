use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.to_string(), "127.0.0.1:3000");
    assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(30));
    assert_eq!(settings.cache.max_entries.get(), 256);
    assert_eq!(settings.cache.cold_start_window, Duration::from_secs(30));
    assert_eq!(settings.cache.metrics_interval, Duration::from_secs(60));
    assert!(!settings.cache.per_key_breakdown);
    assert_eq!(settings.stream.tick_interval, Duration::from_secs(60));
    assert_eq!(settings.stream.heartbeat_interval, Duration::from_secs(15));
    assert_eq!(settings.stream.write_timeout, Duration::from_secs(10));
    assert_eq!(settings.stream.fetch_timeout, Duration::from_secs(5));
    assert_eq!(settings.stream.retry_hint_ms, 1000);
    assert_eq!(settings.stream.channel_capacity.get(), 16);
    assert_eq!(settings.admission.max_sessions_per_identity.get(), 8);
    assert!(settings.upstream.url.is_none());
    assert_eq!(settings.upstream.timeout, Duration::from_secs(5));
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn zero_values_are_rejected_with_key() {
    let mut raw = RawSettings::default();
    raw.cache.max_entries = Some(0);
    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "cache.max_entries"),
        other => panic!("expected invalid max_entries, got {other:?}"),
    }

    let mut raw = RawSettings::default();
    raw.stream.heartbeat_interval_seconds = Some(0);
    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => {
            assert_eq!(key, "stream.heartbeat_interval_seconds")
        }
        other => panic!("expected invalid heartbeat interval, got {other:?}"),
    }

    let mut raw = RawSettings::default();
    raw.admission.max_sessions_per_identity = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn upstream_url_is_validated() {
    let mut raw = RawSettings::default();
    raw.upstream.url = Some("not a url".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "upstream.url",
            ..
        })
    ));

    let mut raw = RawSettings::default();
    raw.upstream.url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("blank url is unset");
    assert!(settings.upstream.url.is_none());

    let mut raw = RawSettings::default();
    raw.apply_serve_overrides(&ServeOverrides {
        upstream_url: Some("http://store.internal:8080/api/".to_string()),
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.upstream.url.map(|url| url.to_string()).as_deref(),
        Some("http://store.internal:8080/api/")
    );
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["bucketcast"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "bucketcast",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--cache-max-entries",
        "512",
        "--cache-per-key-breakdown",
        "true",
        "--admission-max-sessions-per-identity",
        "2",
    ]);

    let Some(Command::Serve(serve)) = args.command else {
        panic!("serve command expected");
    };
    assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));

    let mut raw = RawSettings::default();
    raw.apply_serve_overrides(&serve.overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.server.addr.ip().to_string(), "0.0.0.0");
    assert_eq!(settings.cache.max_entries.get(), 512);
    assert!(settings.cache.per_key_breakdown);
    assert_eq!(settings.admission.max_sessions_per_identity.get(), 2);
}

#[test]
#[serial_test::serial]
fn environment_sits_between_file_and_cli() {
    // SAFETY: serialized with every other test that touches the process environment.
    unsafe {
        std::env::set_var("BUCKETCAST__CACHE__MAX_ENTRIES", "64");
        std::env::set_var("BUCKETCAST__STREAM__RETRY_HINT_MS", "2500");
    }

    let env_only = CliArgs {
        config_file: None,
        command: None,
    };
    let from_env = load(&env_only);

    let with_cli = CliArgs {
        config_file: None,
        command: Some(Command::Serve(Box::new(ServeArgs {
            overrides: ServeOverrides {
                cache_max_entries: Some(32),
                ..Default::default()
            },
        }))),
    };
    let from_cli = load(&with_cli);

    unsafe {
        std::env::remove_var("BUCKETCAST__CACHE__MAX_ENTRIES");
        std::env::remove_var("BUCKETCAST__STREAM__RETRY_HINT_MS");
    }

    let from_env = from_env.expect("env settings");
    assert_eq!(from_env.cache.max_entries.get(), 64);
    assert_eq!(from_env.stream.retry_hint_ms, 2500);

    let from_cli = from_cli.expect("cli settings");
    assert_eq!(from_cli.cache.max_entries.get(), 32);
    assert_eq!(from_cli.stream.retry_hint_ms, 2500);
}
