use async_trait::async_trait;
use remote_exec::{
    ExecMode, ExecutionError, PlatformClass, RawOutput, RemoteExecutor, RemoteHost,
    SimulatedReply, SimulatedTransport, Stage, Verification,
};
use soakctl::{
    CleanupStack, FailureCause, LaunchArgs, ProvisionError, Provisioner, RunConfig,
    RunController, RunOutcome, RunPlan, RunReport, RunState, VmHandle, WorkloadArgs,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn launch_args(distro: &str) -> LaunchArgs {
    LaunchArgs {
        workload: WorkloadArgs {
            distro: distro.to_string(),
            log_rate: 500,
            log_size_in_bytes: 2000,
        },
        ttl: "30m".to_string(),
        vm_name: None,
        project: Some("soak-project".to_string()),
        zone: Some("us-central1-b".to_string()),
        zones: None,
        machine_type: "e2-standard-16".to_string(),
        boot_disk_size: "4000GB".to_string(),
        image_project: None,
        run_deadline: "60m".to_string(),
        call_timeout: "20m".to_string(),
        verify_grace: "5s".to_string(),
        transport_retries: 0,
        boot_timeout: "10m".to_string(),
        ssh_user: "soak".to_string(),
    }
}

struct FakeProvisioner {
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl FakeProvisioner {
    fn healthy() -> Self {
        Self {
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(&self, config: &RunConfig) -> Result<VmHandle, ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProvisionError::Api {
                status: 1,
                stderr: "QUOTA_EXCEEDED".to_string(),
            });
        }
        let host = RemoteHost {
            instance: config.instance_name.clone(),
            address: "203.0.113.10".to_string(),
            platform: config.platform,
        };
        Ok(VmHandle::new(host, config))
    }
}

struct Harness {
    transport: SimulatedTransport,
    cleaned: Arc<Mutex<Vec<&'static str>>>,
    provisions: Arc<AtomicUsize>,
}

async fn run(
    config: RunConfig,
    provisioner: FakeProvisioner,
    transport: SimulatedTransport,
) -> (RunReport, Harness) {
    let plan = RunPlan::for_config(&config).unwrap();
    let cleaned = Arc::new(Mutex::new(Vec::new()));
    let mut cleanup = CleanupStack::new();
    {
        let cleaned = cleaned.clone();
        cleanup.register("ssh-key", move || cleaned.lock().unwrap().push("ssh-key"));
    }
    let provisions = provisioner.calls.clone();
    let executor = RemoteExecutor::new(transport.clone(), config.executor_config());

    let report = RunController::new(config, plan, provisioner, executor, cleanup)
        .run()
        .await;

    (
        report,
        Harness {
            transport,
            cleaned,
            provisions,
        },
    )
}

fn assert_monotonic_prefix(states: &[RunState]) {
    let mut expected = Some(RunState::Created);
    for state in states {
        assert_eq!(Some(*state), expected, "states out of order: {states:?}");
        expected = state.next();
    }
}

#[tokio::test(start_paused = true)]
async fn given_posix_run_when_every_stage_succeeds_then_verified_with_exit_zero() {
    let config = launch_args("debian-11").into_run_config().unwrap();
    let transport = SimulatedTransport::new().reply(
        Stage::ReadDebugLog,
        SimulatedReply::Output(RawOutput::success("writing 500 records/s of 2000 bytes\n")),
    );

    let (report, harness) = run(config, FakeProvisioner::healthy(), transport).await;

    assert!(report.is_verified(), "{:?}", report.outcome);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.states,
        vec![
            RunState::Created,
            RunState::Provisioned,
            RunState::AgentInstalled,
            RunState::InterpreterReady,
            RunState::ContentUploaded,
            RunState::WorkloadLaunched,
            RunState::Verified,
        ]
    );
    assert!(matches!(
        report.outcome,
        RunOutcome::Verified(Verification::DebugLog { ref contents }) if contents.contains("500 records/s")
    ));
    assert_eq!(
        harness.transport.stages(),
        vec![
            Stage::InstallAgentConfig,
            Stage::InstallInterpreter,
            Stage::UploadContent,
            Stage::StartWorkload,
            Stage::ReadDebugLog,
        ]
    );
    let launch = &harness.transport.calls()[3];
    assert_eq!(launch.mode, ExecMode::Detached);
    assert!(launch.body.contains(r#"--log-rate="500""#));
    assert!(launch.body.contains(r#"--log-size-in-bytes="2000""#));
    assert_eq!(report.cleaned_up, vec!["ssh-key"]);
    assert_eq!(*harness.cleaned.lock().unwrap(), vec!["ssh-key"]);
}

#[tokio::test(start_paused = true)]
async fn given_provisioning_failure_when_run_then_failed_at_provisioned_without_remote_calls() {
    let config = launch_args("debian-11").into_run_config().unwrap();

    let (report, harness) = run(config, FakeProvisioner::failing(), SimulatedTransport::new()).await;

    match &report.outcome {
        RunOutcome::Failed(failure) => {
            assert_eq!(failure.stage, RunState::Provisioned);
            assert!(matches!(failure.cause, FailureCause::Provision(ProvisionError::Api { .. })));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_ne!(report.exit_code(), 0);
    assert_eq!(report.states, vec![RunState::Created]);
    assert!(report.vm.is_none());
    assert_eq!(harness.provisions.load(Ordering::SeqCst), 1);
    assert!(harness.transport.calls().is_empty());
    assert_eq!(*harness.cleaned.lock().unwrap(), vec!["ssh-key"]);
}

#[tokio::test(start_paused = true)]
async fn given_deadline_elapsing_during_interpreter_install_then_timeout_and_no_later_stage() {
    let mut args = launch_args("debian-11");
    args.run_deadline = "60s".to_string();
    args.call_timeout = "50s".to_string();
    let config = args.into_run_config().unwrap();
    let transport = SimulatedTransport::new()
        .reply(
            Stage::InstallAgentConfig,
            SimulatedReply::Delayed(Duration::from_secs(20), RawOutput::success("")),
        )
        .reply(Stage::InstallInterpreter, SimulatedReply::Hang);

    let (report, harness) = run(config, FakeProvisioner::healthy(), transport).await;

    match &report.outcome {
        RunOutcome::Failed(failure) => {
            assert_eq!(failure.stage, RunState::InterpreterReady);
            assert!(matches!(
                failure.cause,
                FailureCause::Timeout { deadline } if deadline == Duration::from_secs(60)
            ));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(report.last_state(), RunState::AgentInstalled);
    assert_eq!(
        harness.transport.stages(),
        vec![Stage::InstallAgentConfig, Stage::InstallInterpreter]
    );
    assert_eq!(*harness.cleaned.lock().unwrap(), vec!["ssh-key"]);
}

#[tokio::test(start_paused = true)]
async fn given_failure_at_each_remote_stage_then_states_form_monotonic_prefix() {
    let cases = [
        (Stage::InstallAgentConfig, RunState::AgentInstalled),
        (Stage::InstallInterpreter, RunState::InterpreterReady),
        (Stage::UploadContent, RunState::ContentUploaded),
        (Stage::StartWorkload, RunState::WorkloadLaunched),
        (Stage::ReadDebugLog, RunState::Verified),
    ];

    for (stage, expected_failure) in cases {
        let config = launch_args("debian-11").into_run_config().unwrap();
        let transport = SimulatedTransport::new().reply(
            stage,
            SimulatedReply::Output(RawOutput::failure(1, "boom")),
        );

        let (report, harness) = run(config, FakeProvisioner::healthy(), transport).await;

        match &report.outcome {
            RunOutcome::Failed(failure) => assert_eq!(failure.stage, expected_failure),
            other => panic!("{stage}: expected failure, got {other:?}"),
        }
        assert_monotonic_prefix(&report.states);
        assert_eq!(report.last_state().next(), Some(expected_failure));
        assert_eq!(harness.transport.stages().last(), Some(&stage));
        if report.states.contains(&RunState::WorkloadLaunched) {
            assert!(report.states.contains(&RunState::ContentUploaded));
        }
        assert_eq!(report.cleaned_up, vec!["ssh-key"]);
    }
}

#[tokio::test(start_paused = true)]
async fn given_remote_command_failure_then_output_is_surfaced_verbatim() {
    let config = launch_args("debian-11").into_run_config().unwrap();
    let transport = SimulatedTransport::new().reply(
        Stage::InstallInterpreter,
        SimulatedReply::Output(RawOutput::failure(100, "E: Unable to locate package python3")),
    );

    let (report, _) = run(config, FakeProvisioner::healthy(), transport).await;

    let RunOutcome::Failed(failure) = report.outcome else {
        panic!("expected failure");
    };
    match failure.cause {
        FailureCause::Execution(ExecutionError::RemoteCommand { status, stderr, .. }) => {
            assert_eq!(status, 100);
            assert_eq!(stderr, "E: Unable to locate package python3");
        }
        other => panic!("unexpected cause: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn given_windows_run_when_launch_accepted_then_verified_without_reading_log() {
    let config = launch_args("windows-2019").into_run_config().unwrap();
    assert_eq!(config.platform, PlatformClass::Windows);
    let transport = SimulatedTransport::new().reply(
        Stage::StartWorkload,
        SimulatedReply::Output(RawOutput::success("4242\r\n")),
    );

    let (report, harness) = run(config, FakeProvisioner::healthy(), transport).await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Verified(Verification::LaunchAccepted)
    ));
    assert_eq!(report.exit_code(), 0);
    assert!(!harness.transport.stages().contains(&Stage::ReadDebugLog));
    assert!(harness.transport.calls()[3].body.contains("Win32_Process"));
}
