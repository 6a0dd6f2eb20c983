// End-to-end tests of the connection controller against shell-script helpers

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use openvpn_manager_common::{
    ConnectionState, ControllerEvent, Credentials, ErrorKind, OutputStream, VpnConfig,
};
use openvpn_manager_controller::{
    ConnectRequest, ConnectionController, ControllerConfig, ControllerError, CredentialStore,
    DeleteOutcome, MemoryStore, StoreError,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

const EVENT_WAIT: Duration = Duration::from_secs(10);

struct Fixture {
    dir: TempDir,
    helper: PathBuf,
    vpn_config: VpnConfig,
}

impl Fixture {
    /// `body` runs for `helper start <config>`; `helper stop <pid>` exits 0
    fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("helper.sh");
        fs::write(
            &helper,
            format!("#!/bin/sh\nif [ \"$1\" = stop ]; then exit 0; fi\n{}\n", body),
        )
        .unwrap();

        let config_path = dir.path().join("work.ovpn");
        fs::write(&config_path, "client\ndev tun\nremote vpn.example.com 1194\n").unwrap();
        let vpn_config = VpnConfig::from_path(&config_path).unwrap();

        Self {
            dir,
            helper,
            vpn_config,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self) -> ControllerConfig {
        ControllerConfig {
            helper_path: self.helper.clone(),
            // Through sh so the script never needs the exec bit
            elevate_command: vec!["/bin/sh".to_string()],
            probe_command: probe_allowing(&self.helper),
            probe_timeout_ms: 5_000,
            auth_timeout_ms: 10_000,
            stop_grace_ms: 2_000,
            log_file: self.path("session.log"),
            config_dirs: vec![self.dir.path().to_path_buf()],
            ..Default::default()
        }
    }

    fn controller(&self, config: ControllerConfig, store: &MemoryStore) -> ConnectionController {
        let store: Arc<dyn CredentialStore> = Arc::new(store.clone());
        ConnectionController::new(config, store).unwrap()
    }

    fn request(&self) -> ConnectRequest {
        ConnectRequest::new(self.vpn_config.clone())
    }
}

fn probe_allowing(helper: &Path) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo '    (ALL) NOPASSWD: {}'", helper.display()),
    ]
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<ControllerEvent>, mut pred: F) -> Vec<ControllerEvent>
where
    F: FnMut(&ControllerEvent) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for controller event");
    seen
}

/// A secret store that never answers in time, like a keyring waiting on an unlock dialog
struct StalledStore;

#[async_trait]
impl CredentialStore for StalledStore {
    async fn get(&self, _config_id: &str) -> Result<Option<Credentials>, StoreError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    }

    async fn put(&self, _credentials: &Credentials) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete(&self, _config_id: &str) -> Result<DeleteOutcome, StoreError> {
        Ok(DeleteOutcome::NotFound)
    }
}

async fn wait_until_idle(controller: &ConnectionController) {
    tokio::time::timeout(EVENT_WAIT, async {
        while controller.status().is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session slot was never released");
}

fn states(events: &[ControllerEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            ControllerEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

const PROMPTING_HELPER: &str = r#"printf 'Enter Auth Username:'
read user
printf 'Enter Auth Password:'
read pass
printf '%s\n%s\n' "$user" "$pass" > "$(dirname "$0")/answers"
echo "Initialization Sequence Completed interface tun0 address 10.8.0.2"
exec sleep 30"#;

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let fixture = Fixture::new("exec sleep 30");
    let store = MemoryStore::new();
    let controller = fixture.controller(fixture.config(), &store);

    let first = controller.connect(fixture.request()).await.unwrap();
    assert_eq!(first.state, ConnectionState::Connecting);

    let second = controller.connect(fixture.request()).await;
    assert!(matches!(second, Err(ControllerError::AlreadyConnected)));
    assert_eq!(second.unwrap_err().kind(), ErrorKind::AlreadyConnected);

    // The running session is untouched
    let status = controller.status().unwrap();
    assert_eq!(status.session_id, first.session_id);
    assert_eq!(status.state, ConnectionState::Connecting);

    controller.disconnect().await.unwrap();
    assert!(controller.status().is_none());
}

#[tokio::test]
async fn test_disconnect_without_session_is_noop() {
    let fixture = Fixture::new("exit 0");
    let controller = fixture.controller(fixture.config(), &MemoryStore::new());

    controller.disconnect().await.unwrap();
    assert!(controller.status().is_none());
    assert!(matches!(
        controller
            .provide_credentials(Credentials::new("work", "alice", "pw"), false)
            .await,
        Err(ControllerError::NoActiveSession)
    ));
}

#[tokio::test]
async fn test_prompted_credentials_written_in_order() {
    let fixture = Fixture::new(PROMPTING_HELPER);
    let store = MemoryStore::new();
    let controller = fixture.controller(fixture.config(), &store);
    let mut events = controller.subscribe();

    controller.connect(fixture.request()).await.unwrap();
    let mut seen = wait_for(&mut events, |e| {
        matches!(e, ControllerEvent::CredentialsRequired { .. })
    })
    .await;
    assert_eq!(controller.status().unwrap().state, ConnectionState::Authenticating);

    controller
        .provide_credentials(Credentials::new("work", "alice", "s3cret-pw"), true)
        .await
        .unwrap();
    seen.extend(wait_for(&mut events, |e| matches!(e, ControllerEvent::Connected { .. })).await);

    let required = seen
        .iter()
        .filter(|e| matches!(e, ControllerEvent::CredentialsRequired { .. }))
        .count();
    assert_eq!(required, 1);
    assert!(seen
        .iter()
        .any(|e| matches!(e, ControllerEvent::AuthenticationRequired { .. })));
    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected
        ]
    );

    // Username line, then password line
    let answers = fs::read_to_string(fixture.path("answers")).unwrap();
    assert_eq!(answers, "alice\ns3cret-pw\n");

    let status = controller.status().unwrap();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.assigned_interface.as_deref(), Some("tun0"));
    assert_eq!(status.assigned_address.as_deref(), Some("10.8.0.2"));

    // Saved on Connected because the caller asked for it
    let stored = store.get("work").await.unwrap().unwrap();
    assert_eq!(stored.username(), "alice");

    controller.disconnect().await.unwrap();
    let log = fs::read_to_string(fixture.path("session.log")).unwrap();
    assert!(log.starts_with("--- Log started ---"));
    assert!(log.contains("Initialization Sequence Completed"));
    assert!(!log.contains("s3cret-pw"));
}

#[tokio::test]
async fn test_stored_credentials_answer_prompts() {
    let fixture = Fixture::new(PROMPTING_HELPER);
    let store = MemoryStore::new();
    store
        .put(&Credentials::new("work", "bob-vpn", "from-keyring"))
        .await
        .unwrap();
    let controller = fixture.controller(fixture.config(), &store);
    let mut events = controller.subscribe();

    controller.connect(fixture.request()).await.unwrap();
    let seen = wait_for(&mut events, |e| matches!(e, ControllerEvent::Connected { .. })).await;
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ControllerEvent::CredentialsRequired { .. })));

    let answers = fs::read_to_string(fixture.path("answers")).unwrap();
    assert_eq!(answers, "bob-vpn\nfrom-keyring\n");
    controller.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unexpected_exit_fails_once() {
    let fixture = Fixture::new(
        "echo 'Initialization Sequence Completed'\n\
         echo 'read UDPv4: Connection refused' >&2\n\
         sleep 0.2\n\
         exit 1",
    );
    let controller = fixture.controller(fixture.config(), &MemoryStore::new());
    let mut events = controller.subscribe();

    let session = controller.connect(fixture.request()).await.unwrap();
    let mut seen = wait_for(&mut events, |e| {
        matches!(
            e,
            ControllerEvent::Error {
                kind: ErrorKind::UnexpectedExit,
                ..
            }
        )
    })
    .await;

    let Some(ControllerEvent::Error {
        session_id, message, ..
    }) = seen.last()
    else {
        panic!("expected an Error event, got {:?}", seen.last());
    };
    assert_eq!(*session_id, Some(session.session_id));
    assert!(message.contains("Connection refused"), "{}", message);

    // Torn down once: slot freed, outcome recorded, nothing reported twice
    wait_until_idle(&controller).await;
    let outcome = controller.last_outcome().unwrap();
    assert_eq!(outcome.session_id, session.session_id);
    assert_eq!(outcome.state, ConnectionState::Failed(ErrorKind::UnexpectedExit));
    assert!(outcome.error.unwrap().message.contains("Connection refused"));

    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Failed(ErrorKind::UnexpectedExit)
        ]
    );
    let errors = seen
        .iter()
        .filter(|e| matches!(e, ControllerEvent::Error { .. }))
        .count();
    assert_eq!(errors, 1);
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ControllerEvent::Disconnected { .. })));
    assert!(controller.wait_for_session_end().await.is_none());
}

#[tokio::test]
async fn test_permission_denied_never_spawns() {
    let fixture = Fixture::new("touch \"$(dirname \"$0\")/spawned\"\nexit 0");
    let config = ControllerConfig {
        probe_command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo 'sudo: a password is required' >&2; exit 1".to_string(),
        ],
        ..fixture.config()
    };
    let controller = fixture.controller(config, &MemoryStore::new());

    let err = controller.connect(fixture.request()).await.unwrap_err();
    match &err {
        ControllerError::PermissionDenied { remediation } => {
            assert!(remediation.contains(&format!("ALL=(ALL) NOPASSWD: {}", fixture.helper.display())));
        }
        other => panic!("expected PermissionDenied, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(!fixture.path("spawned").exists());
    assert!(controller.status().is_none());

    // The slot was released
    let err = controller.connect(fixture.request()).await.unwrap_err();
    assert!(matches!(err, ControllerError::PermissionDenied { .. }));
}

#[tokio::test]
async fn test_spawn_error_reported() {
    let fixture = Fixture::new("exit 0");
    let missing = fixture.path("missing-helper.sh");
    let config = ControllerConfig {
        helper_path: missing.clone(),
        elevate_command: Vec::new(),
        probe_command: probe_allowing(&missing),
        ..fixture.config()
    };
    let controller = fixture.controller(config, &MemoryStore::new());
    let mut events = controller.subscribe();

    let err = controller.connect(fixture.request()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SpawnError);
    assert!(controller.status().is_none());

    let seen = wait_for(&mut events, |e| matches!(e, ControllerEvent::Error { .. })).await;
    assert_eq!(
        states(&seen),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Failed(ErrorKind::SpawnError)
        ]
    );
}

#[tokio::test]
async fn test_auth_timeout_fails_session() {
    let fixture = Fixture::new(PROMPTING_HELPER);
    let config = ControllerConfig {
        auth_timeout_ms: 300,
        ..fixture.config()
    };
    let controller = fixture.controller(config, &MemoryStore::new());
    let mut events = controller.subscribe();

    controller.connect(fixture.request()).await.unwrap();
    let seen = wait_for(&mut events, |e| {
        matches!(
            e,
            ControllerEvent::StateChanged {
                state: ConnectionState::Failed(_),
                ..
            }
        )
    })
    .await;
    assert_eq!(
        states(&seen).last(),
        Some(&ConnectionState::Failed(ErrorKind::AuthenticationTimeout))
    );
    assert!(!fixture.path("answers").exists());
}

#[tokio::test]
async fn test_disconnect_interrupts_credential_wait() {
    let fixture = Fixture::new(PROMPTING_HELPER);
    let controller = fixture.controller(fixture.config(), &MemoryStore::new());
    let mut events = controller.subscribe();

    controller.connect(fixture.request()).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ControllerEvent::CredentialsRequired { .. })
    })
    .await;

    tokio::time::timeout(EVENT_WAIT, controller.disconnect())
        .await
        .expect("disconnect hung while authenticating")
        .unwrap();

    let seen = wait_for(&mut events, |e| matches!(e, ControllerEvent::Disconnected { .. })).await;
    assert_eq!(
        states(&seen),
        vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
    );
    assert!(controller.status().is_none());
    assert!(matches!(
        controller
            .provide_credentials(Credentials::new("work", "alice", "late"), false)
            .await,
        Err(ControllerError::NoActiveSession)
    ));
}

#[tokio::test]
async fn test_auth_failure_does_not_persist() {
    let fixture = Fixture::new(
        "printf 'Enter Auth Username:'\nread user\nprintf 'Enter Auth Password:'\nread pass\n\
         echo 'AUTH: Received control message: AUTH_FAILED'\nexec sleep 30",
    );
    let store = MemoryStore::new();
    let controller = fixture.controller(fixture.config(), &store);
    let mut events = controller.subscribe();

    let request = fixture
        .request()
        .with_credentials(Credentials::new("work", "alice", "wrong"), true);
    controller.connect(request).await.unwrap();

    let seen = wait_for(&mut events, |e| {
        matches!(
            e,
            ControllerEvent::StateChanged {
                state: ConnectionState::Failed(_),
                ..
            }
        )
    })
    .await;
    assert_eq!(
        states(&seen).last(),
        Some(&ConnectionState::Failed(ErrorKind::AuthenticationFailed))
    );
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ControllerEvent::CredentialsRequired { .. })));

    // The process is stopped and the slot released
    wait_until_idle(&controller).await;
    assert_eq!(store.get("work").await.unwrap(), None);
}

#[tokio::test]
async fn test_disconnect_interrupts_store_lookup() {
    let fixture = Fixture::new(PROMPTING_HELPER);
    let store: Arc<dyn CredentialStore> = Arc::new(StalledStore);
    let controller = ConnectionController::new(fixture.config(), store).unwrap();
    let mut events = controller.subscribe();

    controller.connect(fixture.request()).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, ControllerEvent::AuthenticationRequired { .. })
    })
    .await;
    assert_eq!(controller.status().unwrap().state, ConnectionState::Authenticating);

    let started = Instant::now();
    tokio::time::timeout(EVENT_WAIT, controller.disconnect())
        .await
        .expect("disconnect waited for the secret store")
        .unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "disconnect took {:?}",
        started.elapsed()
    );

    let seen = wait_for(&mut events, |e| matches!(e, ControllerEvent::Disconnected { .. })).await;
    assert_eq!(
        states(&seen),
        vec![ConnectionState::Disconnecting, ConnectionState::Disconnected]
    );
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ControllerEvent::CredentialsRequired { .. })));
    assert!(controller.status().is_none());
    assert!(!fixture.path("answers").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_visible_when_connecting_is_announced() {
    let fixture = Fixture::new("exec sleep 30");
    let controller = fixture.controller(fixture.config(), &MemoryStore::new());
    let mut events = controller.subscribe();

    // Looks at status() the moment the event arrives, on another worker
    let observer = controller.clone();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ControllerEvent::StateChanged {
                    session_id,
                    state: ConnectionState::Connecting,
                    ..
                }) => {
                    return observer
                        .status()
                        .map(|s| (s.session_id == session_id, s.state));
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    controller.connect(fixture.request()).await.unwrap();
    let observed = tokio::time::timeout(EVENT_WAIT, watcher)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed, Some((true, ConnectionState::Connecting)));

    controller.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_chatty_client_does_not_crowd_out_state_events() {
    let fixture = Fixture::new(
        "i=1
         while [ $i -le 600 ]; do echo \"client output $i\"; i=$((i + 1)); done
         echo 'Initialization Sequence Completed'
         exec sleep 30",
    );
    let controller = fixture.controller(fixture.config(), &MemoryStore::new());
    let mut events = controller.subscribe();
    let mut logs = controller.subscribe_logs();

    // Nobody reads the event queue until the tunnel is up
    let session = controller.connect(fixture.request()).await.unwrap();
    tokio::time::timeout(EVENT_WAIT, async {
        while controller.status().map(|s| s.state) != Some(ConnectionState::Connected) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("tunnel never came up");

    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Empty) => break,
            Err(e) => panic!("state events lost: {:?}", e),
        }
    }
    assert_eq!(
        states(&seen),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    let first = tokio::time::timeout(EVENT_WAIT, logs.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.session_id, session.session_id);
    assert_eq!(first.stream, OutputStream::Stdout);
    assert_eq!(first.line, "client output 1");

    controller.disconnect().await.unwrap();
    let outcome = controller.last_outcome().unwrap();
    assert_eq!(outcome.session_id, session.session_id);
    assert_eq!(outcome.state, ConnectionState::Disconnected);
}
