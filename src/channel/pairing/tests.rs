use super::*;
use crate::config::PairingConfig;

fn service(dir: &tempfile::TempDir) -> PairingService {
    PairingService::new(dir.path().to_path_buf(), PairingConfig::default()).unwrap()
}

fn service_with(dir: &tempfile::TempDir, config: PairingConfig) -> PairingService {
    PairingService::new(dir.path().to_path_buf(), config).unwrap()
}

#[tokio::test]
async fn pairing_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let code = s.issue("tg").await.unwrap();
    assert_eq!(code.len(), 6);

    let outcome = s.verify("tg", "user-1", &code).await.unwrap();
    assert_eq!(outcome, VerifyOutcome::Paired);
    assert!(s.is_paired("tg", "user-1").await);

    // Subsequent messages skip pairing
    let again = s.verify("tg", "user-1", "WHATEVER").await.unwrap();
    assert_eq!(again, VerifyOutcome::AlreadyPaired);
}

#[tokio::test]
async fn redeemed_code_is_gone_for_other_users() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let code = s.issue("tg").await.unwrap();
    s.verify("tg", "user-1", &code).await.unwrap();

    let other = s.verify("tg", "user-2", &code).await.unwrap();
    assert_eq!(other, VerifyOutcome::UnknownCode);
    assert!(!s.is_paired("tg", "user-2").await);
}

#[tokio::test]
async fn codes_are_case_insensitive() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let code = s.issue("tg").await.unwrap();
    let outcome = s.verify("tg", "u", &code.to_lowercase()).await.unwrap();
    assert_eq!(outcome, VerifyOutcome::Paired);
}

#[tokio::test]
async fn code_is_scoped_to_its_channel() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let code = s.issue("tg").await.unwrap();
    let outcome = s.verify("discord", "u", &code).await.unwrap();
    assert_eq!(outcome, VerifyOutcome::UnknownCode);
}

#[tokio::test]
async fn lockout_after_max_failed_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let _code = s.issue("tg").await.unwrap();

    for _ in 0..5 {
        let outcome = s.verify("tg", "attacker", "WRONG1").await.unwrap();
        assert_eq!(outcome, VerifyOutcome::UnknownCode);
    }
    // Next attempt is rejected inside the ban window without a code check
    let outcome = s.verify("tg", "attacker", "WRONG1").await.unwrap();
    assert!(matches!(outcome, VerifyOutcome::Banned { .. }));
}

#[tokio::test]
async fn banned_user_is_rejected_even_with_the_correct_code() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let code = s.issue("tg").await.unwrap();
    for _ in 0..5 {
        s.verify("tg", "attacker", "NOPE42").await.unwrap();
    }
    let outcome = s.verify("tg", "attacker", &code).await.unwrap();
    assert!(matches!(outcome, VerifyOutcome::Banned { .. }));
    // Another user can still redeem the code
    assert_eq!(s.verify("tg", "friend", &code).await.unwrap(), VerifyOutcome::Paired);
}

#[tokio::test]
async fn ban_is_per_user_not_per_channel() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    s.issue("tg").await.unwrap();
    for _ in 0..5 {
        s.verify("tg", "attacker", "BAD999").await.unwrap();
    }
    let outcome = s.verify("tg", "innocent", "BAD999").await.unwrap();
    assert_eq!(outcome, VerifyOutcome::UnknownCode, "other users unaffected");
}

#[tokio::test]
async fn expired_codes_do_not_verify() {
    let dir = tempfile::tempdir().unwrap();
    let s = service_with(
        &dir,
        PairingConfig {
            code_ttl_secs: 0,
            ..PairingConfig::default()
        },
    );
    let code = s.issue("tg").await.unwrap();
    let outcome = s.verify("tg", "u", &code).await.unwrap();
    assert_eq!(outcome, VerifyOutcome::UnknownCode);
    assert_eq!(s.cleanup_expired().await.unwrap(), 1);
    assert_eq!(s.pending_count().await, 0);
}

#[tokio::test]
async fn reissue_replaces_previous_code() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let first = s.issue("tg").await.unwrap();
    let second = s.issue("tg").await.unwrap();
    assert_eq!(s.verify("tg", "u", &first).await.unwrap(), VerifyOutcome::UnknownCode);
    // The failed attempt above must not block the real code
    assert_eq!(s.verify("tg", "u", &second).await.unwrap(), VerifyOutcome::Paired);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let s = service(&dir);
        let code = s.issue("tg").await.unwrap();
        s.verify("tg", "user-1", &code).await.unwrap();
        for _ in 0..5 {
            s.verify("tg", "attacker", "ZZZZZZ").await.unwrap();
        }
    }
    let reloaded = service(&dir);
    assert!(reloaded.is_paired("tg", "user-1").await);
    let outcome = reloaded.verify("tg", "attacker", "ZZZZZZ").await.unwrap();
    assert!(matches!(outcome, VerifyOutcome::Banned { .. }), "ban persisted");
}

#[tokio::test]
async fn revoke_removes_allowlisted_sender() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let code = s.issue("tg").await.unwrap();
    s.verify("tg", "user-1", &code).await.unwrap();
    assert!(s.revoke("tg", "user-1").await.unwrap());
    assert!(!s.is_paired("tg", "user-1").await);
    assert!(!s.revoke("tg", "user-1").await.unwrap());
}

#[tokio::test]
async fn on_disk_records_only_store_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let s = service(&dir);
    let code = s.issue("tg").await.unwrap();
    let raw = std::fs::read_to_string(dir.path().join("pending.json")).unwrap();
    assert!(!raw.contains(&code), "plaintext code on disk");
}
