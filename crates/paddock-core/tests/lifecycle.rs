//! Lifecycle tests: boot, shutdown, kill, release and pause driven through a
//! scripted hypervisor driver.

mod common;

use common::{block_volume, boot, boot_with, test_config, MockDriver, WAIT};
use paddock_core::{ContextConfig, CoreError, ResponseCode, VmState};
use paddock_vm::{VmError, VmEvent};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Drain a subscription until the VM closes it.
async fn collect_codes(mut sub: paddock_core::Subscription) -> Vec<ResponseCode> {
    let mut codes = Vec::new();
    while let Ok(Some(response)) = tokio::time::timeout(WAIT, sub.recv()).await {
        codes.push(response.code);
    }
    codes
}

/// A booted VM is running and reports the guest agent.
#[tokio::test]
async fn test_boot_reports_vm_running() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let mut sub = vm.subscribe();

    assert_eq!(vm.state(), VmState::Running);
    assert_eq!(vm.id(), "vm-test");
    assert!(driver.calls().contains(&"launch".to_string()));

    // launch posts InitConnected; the response may already have gone out
    driver.inject(VmEvent::InitConnected);
    let response = tokio::time::timeout(WAIT, sub.recv())
        .await
        .expect("Timed out waiting for response")
        .expect("Stream closed early");
    assert_eq!(response.code, ResponseCode::VmRunning);
    assert_eq!(response.vm_id, "vm-test");
}

/// Booting with an invalid context config is rejected before launch.
#[tokio::test]
async fn test_boot_rejects_invalid_config() {
    let driver = MockDriver::new();
    let config = ContextConfig {
        shutdown_timeout: Duration::ZERO,
        ..test_config()
    };
    let agent = std::sync::Arc::new(common::MockAgent::default());
    let err = paddock_core::Vm::boot(
        None,
        paddock_vm::BootConfig::default(),
        &driver,
        agent,
        config,
    )
    .await
    .expect_err("zero shutdown timeout must be rejected");

    assert!(matches!(err, CoreError::Spec(_)));
    assert!(driver.calls().is_empty());
}

/// A graceful shutdown reports VmShutdown exactly once and ends in None.
#[tokio::test]
async fn test_shutdown_reports_once() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let sub = vm.subscribe();

    vm.shutdown().await.expect("Failed to shut down");
    vm.wait_for_state(VmState::None, WAIT)
        .await
        .expect("VM should reach None");

    let codes = collect_codes(sub).await;
    let shutdowns = codes
        .iter()
        .filter(|c| **c == ResponseCode::VmShutdown)
        .count();
    assert_eq!(shutdowns, 1, "responses: {codes:?}");
    assert_eq!(driver.count("shutdown"), 1);
    assert_eq!(driver.count("kill"), 0);
    assert!(vm.context().is_closed());
    assert_eq!(driver.count("close"), 1);
}

/// A guest that ignores the power-off is killed when the watchdog fires.
#[tokio::test(start_paused = true)]
async fn test_shutdown_watchdog_kills_vm() {
    let driver = MockDriver::new();
    driver.script.exit_on_shutdown.store(false, Ordering::SeqCst);
    let (vm, _agent) = boot(&driver).await;

    vm.shutdown().await.expect("Failed to shut down");

    assert_eq!(vm.state(), VmState::None);
    assert_eq!(driver.count("shutdown"), 1);
    assert_eq!(driver.count("kill"), 1);
}

/// A second shutdown while terminating is refused.
#[tokio::test]
async fn test_shutdown_while_terminating_is_unexpected() {
    let driver = MockDriver::new();
    driver.script.exit_on_shutdown.store(false, Ordering::SeqCst);
    let (vm, _agent) = boot(&driver).await;

    driver.inject(VmEvent::Shutdown);
    vm.wait_for_state(VmState::Terminating, WAIT)
        .await
        .expect("VM should start terminating");

    let err = vm.shutdown().await.expect_err("second shutdown must fail");
    assert!(
        matches!(err, CoreError::NotReady { ref actual, .. } if actual == "TERMINATING"),
        "got {err:?}"
    );

    driver.inject(VmEvent::VmExit);
    vm.wait_for_state(VmState::None, WAIT)
        .await
        .expect("VM should reach None");
}

/// Resource operations are refused once the VM is not running.
#[tokio::test]
async fn test_operations_refused_after_shutdown() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    vm.shutdown().await.expect("Failed to shut down");
    vm.wait_for_state(VmState::None, WAIT)
        .await
        .expect("VM should reach None");

    let err = vm
        .add_volume(common::dir_volume("data"))
        .await
        .expect_err("VM is gone");
    assert!(matches!(err, CoreError::NotReady { .. }));
}

/// A broken control channel ends the VM with a failure response.
#[tokio::test]
async fn test_interrupted_ends_vm() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let sub = vm.subscribe();

    driver.inject(VmEvent::Interrupted {
        reason: "qmp socket closed".into(),
    });
    vm.wait_for_state(VmState::None, WAIT)
        .await
        .expect("VM should reach None");

    let codes = collect_codes(sub).await;
    assert!(codes.contains(&ResponseCode::Failed), "responses: {codes:?}");
    assert_eq!(codes.last(), Some(&ResponseCode::VmShutdown));
}

/// A guest agent that never comes up fails the VM and powers it off.
#[tokio::test]
async fn test_init_failed_shuts_vm_down() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let sub = vm.subscribe();

    driver.inject(VmEvent::InitFailed {
        reason: "handshake timed out".into(),
    });
    vm.wait_for_state(VmState::None, WAIT)
        .await
        .expect("VM should reach None");

    let codes = collect_codes(sub).await;
    assert!(codes.contains(&ResponseCode::Failed), "responses: {codes:?}");
    assert_eq!(codes.last(), Some(&ResponseCode::VmShutdown));
    assert_eq!(driver.count("shutdown"), 1);
}

/// A hypervisor that fails to start ends the VM without a power-off.
#[tokio::test]
async fn test_start_failure_ends_vm() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let sub = vm.subscribe();

    driver.inject(VmEvent::VmStartFailed {
        message: "qemu exited with status 1".into(),
    });
    vm.wait_for_state(VmState::None, WAIT)
        .await
        .expect("VM should reach None");

    let codes = collect_codes(sub).await;
    assert!(codes.contains(&ResponseCode::Failed), "responses: {codes:?}");
    assert_eq!(codes.last(), Some(&ResponseCode::VmShutdown));
    assert_eq!(driver.count("shutdown"), 0);
}

/// Losing the channel while terminating leaves the watchdog in charge.
#[tokio::test(start_paused = true)]
async fn test_interrupted_while_terminating_waits_for_watchdog() {
    let driver = MockDriver::new();
    driver.script.exit_on_shutdown.store(false, Ordering::SeqCst);
    let (vm, _agent) = boot(&driver).await;

    driver.inject(VmEvent::Shutdown);
    vm.wait_for_state(VmState::Terminating, WAIT)
        .await
        .expect("VM should start terminating");
    driver.inject(VmEvent::Interrupted {
        reason: "agent gone".into(),
    });
    tokio::task::yield_now().await;
    assert_eq!(vm.state(), VmState::Terminating);

    vm.wait_for_state(VmState::None, Duration::from_secs(60))
        .await
        .expect("watchdog should end the VM");
    assert_eq!(driver.count("kill"), 1);
}

/// Killing skips the guest entirely.
#[tokio::test]
async fn test_kill() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;

    vm.kill().await.expect("Failed to kill");

    assert_eq!(vm.state(), VmState::None);
    assert_eq!(driver.count("kill"), 1);
    assert_eq!(driver.count("shutdown"), 0);
}

/// Release leaves the hypervisor alone and hands back a snapshot.
#[tokio::test]
async fn test_release_returns_snapshot() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;

    let data = vm.release().await.expect("Failed to release");
    vm.wait_for_state(VmState::None, WAIT)
        .await
        .expect("VM should reach None");

    let snapshot: serde_json::Value = serde_json::from_slice(&data).expect("snapshot is JSON");
    assert_eq!(snapshot["id"], "vm-test");
    assert_eq!(snapshot["driver_info"]["hypervisor"], "mock");
    assert_eq!(driver.count("shutdown"), 0);
    assert_eq!(driver.count("kill"), 0);
}

/// Pause and resume round-trip through the driver.
#[tokio::test]
async fn test_pause_and_resume() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;

    vm.pause(true).await.expect("Failed to pause");
    assert!(vm.is_paused());
    vm.pause(false).await.expect("Failed to resume");
    assert!(!vm.is_paused());
    assert_eq!(driver.count("pause:true"), 1);
    assert_eq!(driver.count("pause:false"), 1);
}

/// A pause the hypervisor refuses leaves the VM as it was.
#[tokio::test]
async fn test_pause_failure() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;
    let mut sub = vm.subscribe();

    driver.inject(VmEvent::PauseResult {
        pause: true,
        cause: Some("guest busy".into()),
    });
    let response = loop {
        let response = tokio::time::timeout(WAIT, sub.recv())
            .await
            .expect("Timed out waiting for response")
            .expect("Stream closed early");
        if response.code == ResponseCode::PauseResult {
            break response;
        }
    };
    assert_eq!(response.cause, "guest busy");
    assert_eq!(response.data, Some(serde_json::json!({ "pause": true })));
    assert!(!vm.is_paused());
}

/// Waiting for a state that never comes times out.
#[tokio::test(start_paused = true)]
async fn test_wait_for_state_timeout() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot_with(&driver, test_config()).await;

    let err = vm
        .wait_for_state(VmState::Terminating, Duration::from_secs(1))
        .await
        .expect_err("nothing shuts the VM down");
    assert!(matches!(err, CoreError::Vm(VmError::Timeout(_))));
}

/// Sandbox start and stop go through the agent.
#[tokio::test]
async fn test_sandbox_start_and_stop() {
    let driver = MockDriver::new();
    let (vm, agent) = boot(&driver).await;

    vm.start_sandbox().await.expect("Failed to start sandbox");
    vm.stop_sandbox().await.expect("Failed to stop sandbox");

    let calls = agent.calls();
    assert_eq!(
        calls,
        vec!["api_version", "start_sandbox", "destroy_sandbox"]
    );
    assert_eq!(agent.sandboxes.lock().unwrap()[0].hostname, "vm-test");
}

/// Shutting down a VM with a running sandbox stops the sandbox first.
#[tokio::test]
async fn test_shutdown_destroys_running_sandbox() {
    let driver = MockDriver::new();
    let (vm, agent) = boot(&driver).await;
    vm.start_sandbox().await.expect("Failed to start sandbox");

    vm.shutdown().await.expect("Failed to shut down");

    assert!(agent.calls().contains(&"destroy_sandbox".to_string()));
}

/// Waits until `path` is gone, for at most `WAIT`.
async fn wait_removed(path: &std::path::Path) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Shutting a VM down removes its directories.
#[tokio::test]
async fn test_shutdown_removes_vm_directories() {
    let driver = MockDriver::new();
    let config = test_config();
    let (vm, _agent) = boot_with(&driver, config.clone()).await;
    let vm_dir = config.vm_dir(vm.id());
    assert!(config.share_dir(vm.id()).is_dir());

    vm.shutdown().await.expect("Failed to shut down");

    assert!(wait_removed(&vm_dir).await, "{} still exists", vm_dir.display());
}

/// A released VM keeps running elsewhere, so its share directory stays.
#[tokio::test]
async fn test_release_keeps_vm_directories() {
    let driver = MockDriver::new();
    let config = test_config();
    let (vm, _agent) = boot_with(&driver, config.clone()).await;
    let sub = vm.subscribe();

    vm.release().await.expect("Failed to release");
    // the stream ends once the context is closed
    collect_codes(sub).await;
    assert!(vm.context().is_closed());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(config.share_dir(vm.id()).is_dir());
    let _ = std::fs::remove_dir_all(config.vm_dir(vm.id()));
}

/// Operations still waiting when the control channel breaks fail with the
/// interruption as their cause.
#[tokio::test]
async fn test_interrupted_fails_pending_operations() {
    let driver = MockDriver::holding();
    let (vm, _agent) = boot(&driver).await;

    let pending = {
        let vm = vm.clone();
        tokio::spawn(async move { vm.add_volume(block_volume("data")).await })
    };
    while driver.held_count() == 0 {
        tokio::task::yield_now().await;
    }
    driver.inject(VmEvent::Interrupted {
        reason: "qmp socket closed".into(),
    });

    let result = tokio::time::timeout(WAIT, pending)
        .await
        .expect("Timed out waiting for the add")
        .expect("task panicked")
        .expect("request was accepted");
    assert!(!result.success);
    assert_eq!(result.message, "connection interrupted: qmp socket closed");
}

/// Operations racing a kill either are refused or get a result; none is
/// left waiting.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_racing_kill_all_resolve() {
    let driver = MockDriver::holding();
    let (vm, _agent) = boot(&driver).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let vm = vm.clone();
        handles.push(tokio::spawn(async move {
            vm.add_volume(block_volume(&format!("disk{i}"))).await
        }));
    }
    vm.kill().await.expect("Failed to kill");

    for handle in handles {
        let outcome = tokio::time::timeout(WAIT, handle)
            .await
            .expect("an operation was left waiting")
            .expect("task panicked");
        match outcome {
            Ok(result) => assert!(!result.success, "{}: attach never completed", result.id),
            Err(e) => assert!(matches!(e, CoreError::NotReady { .. }), "{e}"),
        }
    }
    assert!(vm.context().volume_names().is_empty());
}

/// Usage counters come from the driver while the VM runs.
#[tokio::test]
async fn test_stats_from_driver() {
    let driver = MockDriver::new();
    let (vm, _agent) = boot(&driver).await;

    let stats = vm.stats().expect("Failed to get stats");
    assert_eq!(stats.cpu.total_ns, 3_000);
    assert_eq!(stats.cpu.per_cpu_ns.len(), 2);
    assert_eq!(stats.memory.usage_bytes, 64 << 20);
    assert_eq!(driver.count("stats"), 1);

    vm.kill().await.expect("Failed to kill");
    let err = vm.stats().unwrap_err();
    assert!(matches!(err, CoreError::NotReady { .. }));
    assert_eq!(driver.count("stats"), 1);
}

/// The empty driver reports zeroed counters.
#[tokio::test]
async fn test_empty_driver_reports_zero_stats() {
    common::init_tracing();
    let vm = paddock_core::Vm::boot(
        None,
        paddock_vm::BootConfig::default(),
        &paddock_vm::EmptyDriver,
        std::sync::Arc::new(common::MockAgent::default()),
        test_config(),
    )
    .await
    .expect("Failed to boot VM");

    let stats = vm.stats().expect("Failed to get stats");
    assert_eq!(stats, paddock_vm::VmStats::default());
}
