use graphrt::{EngineConfig, Error};

#[test]
fn empty_json_is_the_default() -> anyhow::Result<()> {
    let config = EngineConfig::from_json_str("{}")?;
    assert_eq!(config, EngineConfig::default());
    assert!(config.enable_fusion);
    assert!(!config.profiling);
    assert_eq!(config.fixed_point_max_iters, 4);
    Ok(())
}

#[test]
fn partial_json_keeps_other_defaults() -> anyhow::Result<()> {
    let config = EngineConfig::from_json_str(
        r#"{ "backend_preferences": ["faer", "ref-cpu"], "thread_count": 2 }"#,
    )?;
    assert_eq!(config.backend_preferences, vec!["faer", "ref-cpu"]);
    assert_eq!(config.thread_count, Some(2));
    assert!(config.enable_fusion);
    assert_eq!(config.memory_limit_bytes, None);

    let again = EngineConfig::from_json_str(&config.to_json()?)?;
    assert_eq!(again, config);
    Ok(())
}

#[test]
fn invalid_configs_are_rejected() {
    for json in [
        r#"{ "threads": 2 }"#,
        r#"{ "thread_count": 0 }"#,
        r#"{ "fixed_point_max_iters": 0 }"#,
        r#"{ "backend_preferences": ["faer", "faer"] }"#,
        r#"{ "enable_fusion": "yes" }"#,
        "not json",
    ] {
        assert!(
            matches!(EngineConfig::from_json_str(json), Err(Error::Config(_))),
            "{json} should be rejected"
        );
    }
}

// Environment variables are process-wide, so every override case lives in one test.
#[test]
fn environment_overrides_apply_when_set() {
    std::env::remove_var("GRAPHRT_PROFILE");
    std::env::remove_var("GRAPHRT_THREADS");
    let untouched = EngineConfig::default().with_env_overrides();
    assert_eq!(untouched, EngineConfig::default());

    std::env::set_var("GRAPHRT_PROFILE", "on");
    std::env::set_var("GRAPHRT_THREADS", "6");
    let config = EngineConfig::default().with_env_overrides();
    assert!(config.profiling);
    assert_eq!(config.thread_count, Some(6));

    std::env::set_var("GRAPHRT_PROFILE", "0");
    std::env::set_var("GRAPHRT_THREADS", "many");
    let config = EngineConfig {
        profiling: true,
        thread_count: Some(2),
        ..Default::default()
    }
    .with_env_overrides();
    assert!(!config.profiling);
    assert_eq!(config.thread_count, Some(2));

    std::env::remove_var("GRAPHRT_PROFILE");
    std::env::remove_var("GRAPHRT_THREADS");
}
