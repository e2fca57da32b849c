//! Configuration toggling against a real directory

mod support;

use certpilot::{BackupSlot, ConfigToggler, OrchestratorError};
use certpilot_common::{ActiveState, BackoffPolicy, ConfigVariant};
use support::{TestEnv, BOOTSTRAP, DOMAIN, FULL, INVALID_MARKER};
use tokio_util::sync::CancellationToken;

fn toggler(env: &TestEnv) -> ConfigToggler {
    ConfigToggler::new(
        env.config_dir(),
        env.cert_dir(),
        DOMAIN,
        env.proxy.clone(),
        BackoffPolicy::immediate(3),
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_round_trip_is_byte_identical() {
    let env = TestEnv::new().await;
    support::write_bundle(env.cert_dir(), DOMAIN);
    let mut toggler = toggler(&env);

    toggler.activate(ConfigVariant::Bootstrap).await.unwrap();
    assert_eq!(toggler.active_state().unwrap(), ActiveState::Variant(ConfigVariant::Bootstrap));

    toggler.activate(ConfigVariant::Full).await.unwrap();
    assert_eq!(env.live().as_deref(), Some(FULL));

    toggler.activate(ConfigVariant::Bootstrap).await.unwrap();
    assert_eq!(env.live().unwrap().as_bytes(), BOOTSTRAP.as_bytes());
    assert_eq!(env.proxy.reloads(), 3);
}

#[tokio::test]
async fn test_activating_live_variant_skips_reload() {
    let env = TestEnv::new().await;
    support::write_bundle(env.cert_dir(), DOMAIN);
    let mut toggler = toggler(&env);

    toggler.activate(ConfigVariant::Full).await.unwrap();
    toggler.activate(ConfigVariant::Full).await.unwrap();

    assert_eq!(env.proxy.reloads(), 1);
    assert_eq!(env.live().as_deref(), Some(FULL));
}

#[tokio::test]
async fn test_full_without_certificate_is_refused() {
    let env = TestEnv::new().await;
    env.set_live(BOOTSTRAP);
    let mut toggler = toggler(&env);

    let err = toggler.activate(ConfigVariant::Full).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::ConfigWrite { .. }));
    assert_eq!(err.exit_code(), 41);
    assert_eq!(env.live().as_deref(), Some(BOOTSTRAP));
    assert_eq!(toggler.backup(), &BackupSlot::NotTaken);
    assert_eq!(env.proxy.reloads(), 0);
}

#[tokio::test]
async fn test_invalid_syntax_never_goes_live() {
    let env = TestEnv::new().await;
    support::write_bundle(env.cert_dir(), DOMAIN);
    env.set_live(BOOTSTRAP);
    env.set_variant("full.conf", &format!("{}{}\n", FULL, INVALID_MARKER));
    let mut toggler = toggler(&env);

    let err = toggler.activate(ConfigVariant::Full).await.unwrap_err();

    match err {
        OrchestratorError::ConfigWrite { ref reason, .. } => assert!(reason.contains("unknown directive")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(env.live().as_deref(), Some(BOOTSTRAP));
    assert_eq!(env.proxy.reloads(), 0);

    // No temporary file left behind
    let leftovers: Vec<_> = std::fs::read_dir(env.config_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[tokio::test]
async fn test_restore_custom_configuration() {
    let env = TestEnv::new().await;
    let custom = "server { listen 80; return 503; }\n";
    env.set_live(custom);
    let mut toggler = toggler(&env);

    toggler.activate(ConfigVariant::Bootstrap).await.unwrap();
    assert!(matches!(toggler.backup(), BackupSlot::Saved(_)));

    assert!(toggler.restore().await.unwrap());
    assert_eq!(env.live().as_deref(), Some(custom));
    assert_eq!(toggler.active_state().unwrap(), ActiveState::Custom);
}

#[tokio::test]
async fn test_stale_backup_is_discarded() {
    let env = TestEnv::new().await;
    env.set_variant("active.conf.backup", "stale\n");
    let mut toggler = toggler(&env);

    toggler.activate(ConfigVariant::Bootstrap).await.unwrap();

    assert_eq!(toggler.backup(), &BackupSlot::Empty);
    assert!(!env.config_dir().join("active.conf.backup").exists());
    assert!(!toggler.restore().await.unwrap());
    assert_eq!(env.live().as_deref(), Some(BOOTSTRAP));
}

#[tokio::test]
async fn test_missing_variant_file() {
    let env = TestEnv::new().await;
    std::fs::remove_file(env.config_dir().join("bootstrap.conf")).unwrap();
    let mut toggler = toggler(&env);

    let err = toggler.activate(ConfigVariant::Bootstrap).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::ConfigWrite { .. }));
    assert_eq!(env.live(), None);
}
