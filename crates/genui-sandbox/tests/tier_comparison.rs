//! Integration tests comparing the three tiers on the same candidates.

use genui_sandbox::catalog::{self, CatalogEntry};
use genui_sandbox::{
    sanitize, CapabilityDenylist, DenyRule, ErrorKind, ExecutionResult, HostEnvironment, IsolationConfig,
    PreviewConfig, PreviewRenderer, Tier, ValidatedDirectExecutor,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn host() -> Arc<HostEnvironment> {
    HostEnvironment::builder()
        .local_item("authToken", "secret-token")
        .cookie("session", "s3ss10n")
        .build()
}

fn config() -> PreviewConfig {
    PreviewConfig {
        isolation: IsolationConfig::fast(),
        ..Default::default()
    }
}

fn renderer(tier: Tier, host: &Arc<HostEnvironment>) -> PreviewRenderer {
    PreviewRenderer::builder()
        .tier(tier)
        .host(host.clone())
        .config(config())
        .build()
        .expect("failed to mount tier")
}

async fn render(tier: Tier, host: &Arc<HostEnvironment>, entry: &CatalogEntry) -> (PreviewRenderer, ExecutionResult) {
    let renderer = renderer(tier, host);
    let result = renderer.render_generated(entry.source, entry.component).await;
    (renderer, result)
}

#[tokio::test]
async fn test_safe_counter_identical_on_all_tiers() {
    let mut outputs = Vec::new();
    for tier in Tier::ALL {
        let host = host();
        let (_renderer, mut result) = render(tier, &host, &catalog::SAFE_COUNTER).await;
        let failure = format!("{:?}", result.failure());
        let surface = result.surface_mut().unwrap_or_else(|| panic!("{tier}: {failure}"));
        surface.click_text("Increment").unwrap();
        let markup = surface.snapshot().unwrap().to_markup();
        assert!(markup.contains("You clicked 1 time<"), "{tier}: {markup}");
        assert!(host.accesses().is_empty(), "{tier} touched the host");
        outputs.push(markup);
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
}

#[tokio::test]
async fn test_malicious_across_tiers() {
    let host_original = host();
    let (_, result) = render(Tier::Original, &host_original, &catalog::MALICIOUS).await;
    let tree = result.surface().unwrap().snapshot().unwrap();
    assert!(tree.contains_text("Got token: secret-token"));
    assert_eq!(host_original.egress()[0].url, "https://evil.com/steal");

    let host_enhanced = host();
    let (_, result) = render(Tier::Enhanced, &host_enhanced, &catalog::MALICIOUS).await;
    let failure = result.failure().unwrap();
    assert_eq!(failure.kind, ErrorKind::PolicyViolation);
    assert_eq!(failure.message, "localStorage");
    assert_eq!(host_enhanced.evaluations(), 0);

    let host_isolated = host();
    let (renderer, result) = render(Tier::Isolated, &host_isolated, &catalog::MALICIOUS).await;
    let tree = result.surface().unwrap().snapshot().unwrap();
    assert!(tree.contains_text("localStorage blocked"));
    assert!(host_isolated.accesses().is_empty());
    assert!(host_isolated.egress().is_empty());
    let console = renderer.isolated().unwrap().journal().console();
    assert!(console.iter().any(|entry| entry.message == "Fetch blocked"));
}

#[tokio::test]
async fn test_evasive_across_tiers() {
    assert!(genui_sandbox::validate(&sanitize(catalog::EVASIVE.source)).is_accepted());

    let host_enhanced = host();
    let (_, result) = render(Tier::Enhanced, &host_enhanced, &catalog::EVASIVE).await;
    assert!(result.surface().unwrap().snapshot().unwrap().contains_text("secret-token"));

    let host_isolated = host();
    let (_renderer, result) = render(Tier::Isolated, &host_isolated, &catalog::EVASIVE).await;
    let tree = result.surface().unwrap().snapshot().unwrap();
    assert!(!tree.contains_text("secret-token"));
    assert!(tree.contains_text("localStorage blocked"));
}

#[tokio::test]
async fn test_mismatched_braces_across_tiers() {
    let expected = [
        (Tier::Original, ErrorKind::RuntimeError),
        (Tier::Enhanced, ErrorKind::SyntaxError),
        (Tier::Isolated, ErrorKind::SyntaxError),
    ];
    for (tier, kind) in expected {
        let host = host();
        let (_, result) = render(tier, &host, &catalog::BROKEN).await;
        assert_eq!(result.failure().map(|f| f.kind), Some(kind), "{tier}");
        assert!(host.accesses().is_empty());
        assert_eq!(host.storage_snapshot(genui_sandbox::capability::StorageArea::Local).len(), 1);
    }
}

/// Sources that nest far past what the parser can recurse through.
fn deeply_nested() -> Vec<(&'static str, String)> {
    vec![
        (
            "parentheses",
            format!(
                "function Deep() {{ const x = {}1{}; return <p>{{x}}</p> }}",
                "(".repeat(50_000),
                ")".repeat(50_000)
            ),
        ),
        (
            "negations",
            format!("function Deep() {{ const x = {}0; return <p>{{String(x)}}</p> }}", "!".repeat(100_000)),
        ),
        (
            "sums",
            format!("function Deep() {{ const x = 0{}; return <p>{{x}}</p> }}", "+1".repeat(100_000)),
        ),
    ]
}

#[tokio::test]
async fn test_deep_nesting_fails_cleanly_on_all_tiers() {
    let expected = [
        (Tier::Original, ErrorKind::RuntimeError),
        (Tier::Enhanced, ErrorKind::SyntaxError),
        (Tier::Isolated, ErrorKind::SyntaxError),
    ];
    for (shape, source) in deeply_nested() {
        for (tier, kind) in expected {
            let host = host();
            let renderer = renderer(tier, &host);
            let result = renderer.render_generated(&source, "Deep").await;
            let failure = result
                .failure()
                .unwrap_or_else(|| panic!("{tier}: {shape} rendered"));
            assert_eq!(failure.kind, kind, "{tier}: {shape}");
            assert!(failure.message.contains("exceeds maximum 256"), "{tier}: {}", failure.message);
            assert!(host.accesses().is_empty());

            // the tier is still usable afterwards
            let result = renderer
                .render_generated(catalog::SAFE_COUNTER.source, catalog::SAFE_COUNTER.component)
                .await;
            assert!(result.is_rendered(), "{tier}: {:?}", result.failure());
        }
    }
}

#[tokio::test]
async fn test_brackets_in_strings_render_on_all_tiers() {
    let parens = "(".repeat(300);
    let source = format!(
        "function Quoted() {{\n  // {parens}\n  const s = \"{parens}\";\n  const t = `{parens}`;\n  return <p title={{t}}>{{s.length + t.length}}</p>;\n}}"
    );
    for tier in Tier::ALL {
        let host = host();
        let renderer = renderer(tier, &host);
        let result = renderer.render_generated(&source, "Quoted").await;
        let surface = result.surface().unwrap_or_else(|| panic!("{tier}: {:?}", result.failure()));
        assert!(surface.snapshot().unwrap().contains_text("600"), "{tier}");
    }
}

#[test]
fn test_validated_never_evaluates_denylisted_candidates() {
    for rule in CapabilityDenylist::standard().rules() {
        let (source, token) = match rule {
            DenyRule::Identifier(name) => (
                format!("function A() {{ const x = typeof {name}; return <p>{{x}}</p> }}"),
                name.clone(),
            ),
            DenyRule::MemberPath(path) => (format!("function A() {{ const x = {path}; return null }}"), path.clone()),
            DenyRule::ImportOutside(_) => (
                "import pad from 'left-pad';\nfunction A() { return null }".to_string(),
                "import(\"left-pad\")".to_string(),
            ),
        };
        let host = host();
        let result = ValidatedDirectExecutor::new(host.clone()).render(sanitize(&source), "A");
        let failure = result.failure().unwrap_or_else(|| panic!("{rule} let {source:?} through"));
        assert_eq!(failure.kind, ErrorKind::PolicyViolation, "{rule}");
        assert_eq!(failure.message, token, "{rule}");
        assert_eq!(host.evaluations(), 0, "{rule}");
    }
}

#[tokio::test]
async fn test_isolated_serves_after_timeout() {
    let host = host();
    let renderer = PreviewRenderer::builder()
        .tier(Tier::Isolated)
        .host(host.clone())
        .config(PreviewConfig {
            isolation: IsolationConfig::default().reply_timeout_ms(300).render_budget_ms(30_000),
            ..Default::default()
        })
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let result = renderer
        .render_generated("function Spin() { for (;;) {} }", "Spin")
        .await;
    assert_eq!(result.failure().unwrap().kind, ErrorKind::Timeout);
    assert!(started.elapsed() < std::time::Duration::from_secs(5));

    let mut result = renderer
        .render_generated(catalog::SAFE_COUNTER.source, catalog::SAFE_COUNTER.component)
        .await;
    let surface = result.surface_mut().unwrap();
    surface.click_text("Increment").unwrap();
    surface.click_text("Increment").unwrap();
    assert!(surface.snapshot().unwrap().contains_text("You clicked 2 times"));
}
