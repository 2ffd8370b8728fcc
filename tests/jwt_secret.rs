use std::process::Command;

#[test]
fn fails_without_webhook_secret() {
    let exe = env!("CARGO_BIN_EXE_flakeguard");
    let output = Command::new(exe)
        .env_remove("FLAKEGUARD_WEBHOOK_SECRET")
        .output()
        .expect("failed to run flakeguard binary");
    assert!(!output.status.success());
}
