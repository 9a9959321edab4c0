//! The component engine: one QuickJS runtime running the component prelude.
//!
//! Rust and JavaScript only exchange strings. Every entry point takes a JSON
//! string and answers with a JSON envelope, and every capability call goes
//! through the single bridge function installed before the prelude runs.
//! The prelude removes that function from the global object once it has
//! captured it.

mod tree;

pub use tree::{VisualNode, VisualTree};

use crate::capability::{BridgeFault, CapabilityBridge, CapabilityContext};
use crate::compile::CompiledUnit;
use crate::error::{Result, SandboxError};
use rquickjs::{CatchResultExt, Context, Function, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PRELUDE: &str = include_str!("prelude.js");

/// Highest `max_tree_depth` an engine accepts.
pub const TREE_DEPTH_CEILING: u32 = 512;

/// JSON levels a reply adds around the tree itself.
const ENVELOPE_DEPTH: usize = 4;

/// Resource bounds for one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Render passes per flush before the component is declared runaway
    pub max_passes: u32,

    /// Wall-clock budget per engine operation (None = unbounded)
    pub budget_ms: Option<u64>,

    /// Promise-job drain rounds between flushes
    pub job_rounds: u32,

    /// Jobs per drain round
    pub max_jobs_per_round: u32,

    /// QuickJS heap limit in bytes (0 = unlimited)
    pub memory_limit: usize,

    /// Deepest chain of host elements a render may produce, capped at
    /// [`TREE_DEPTH_CEILING`]
    pub max_tree_depth: u32,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_passes: 50,
            budget_ms: None,
            job_rounds: 16,
            max_jobs_per_round: 10_000,
            memory_limit: 64 * 1024 * 1024, // 64 MB
            max_tree_depth: 128,
        }
    }
}

impl EngineLimits {
    /// Limits with a wall-clock budget
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget_ms = Some(budget.as_millis() as u64);
        self
    }

    /// Builder: set max render passes
    pub fn max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes;
        self
    }

    /// Builder: set the heap limit
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Builder: set the element depth limit
    pub fn max_tree_depth(mut self, depth: u32) -> Self {
        self.max_tree_depth = depth;
        self
    }

    fn tree_depth(&self) -> u32 {
        self.max_tree_depth.min(TREE_DEPTH_CEILING)
    }

    /// JSON nesting a reply may reach: two levels per element.
    fn reply_depth(&self) -> usize {
        2 * self.tree_depth() as usize + ENVELOPE_DEPTH
    }
}

/// Deepest `[`/`{` nesting in a JSON text, counted without recursing.
fn json_depth(text: &str) -> usize {
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for b in text.bytes() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    deepest
}

/// Why an engine operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineFault {
    /// Candidate code threw
    Script {
        /// Error name, e.g. `TypeError`
        name: String,
        /// Error message
        message: String,
    },
    /// The watchdog stopped the script
    Interrupted,
    /// The engine itself failed
    Engine(String),
}

impl fmt::Display for EngineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineFault::Script { name, message } => write!(f, "{name}: {message}"),
            EngineFault::Interrupted => f.write_str("script interrupted: render budget exhausted"),
            EngineFault::Engine(message) => write!(f, "engine failure: {message}"),
        }
    }
}

#[derive(Debug)]
struct WatchdogState {
    started: Instant,
    /// Milliseconds since `started`; 0 = disarmed
    deadline_ms: AtomicU64,
    tripped: AtomicBool,
    killed: AtomicBool,
}

impl WatchdogState {
    fn should_interrupt(&self) -> bool {
        if self.killed.load(Ordering::Relaxed) {
            self.tripped.store(true, Ordering::Relaxed);
            return true;
        }
        let deadline = self.deadline_ms.load(Ordering::Relaxed);
        if deadline != 0 && self.started.elapsed().as_millis() as u64 >= deadline {
            self.tripped.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// Stops a running engine from another thread.
#[derive(Debug, Clone)]
pub struct KillSwitch(Arc<WatchdogState>);

impl KillSwitch {
    /// Interrupt whatever the engine is running now and anything it runs later.
    pub fn kill(&self) {
        self.0.killed.store(true, Ordering::SeqCst);
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: Option<Value>,
    #[serde(default)]
    error: Option<ScriptError>,
}

#[derive(Deserialize)]
struct ScriptError {
    name: String,
    message: String,
}

/// A QuickJS runtime primed with the component prelude and one capability
/// context. Not `Send`: it stays on the thread that created it.
pub struct ComponentEngine {
    runtime: Runtime,
    context: Context,
    watchdog: Arc<WatchdogState>,
    limits: EngineLimits,
}

impl fmt::Debug for ComponentEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentEngine").field("limits", &self.limits).finish_non_exhaustive()
    }
}

fn bridge_reply(bridge: &dyn CapabilityBridge, op: &str, payload: &str) -> String {
    let payload = serde_json::from_str(payload).unwrap_or(Value::Null);
    match bridge.invoke(op, payload) {
        Ok(value) => json!({ "ok": value }).to_string(),
        Err(BridgeFault { name, message }) => json!({ "error": { "name": name, "message": message } }).to_string(),
    }
}

impl ComponentEngine {
    /// Create an engine whose runtime sees `capabilities`.
    pub fn new(capabilities: &CapabilityContext, limits: EngineLimits) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| SandboxError::EngineError(e.to_string()))?;
        if limits.memory_limit > 0 {
            runtime.set_memory_limit(limits.memory_limit);
        }
        let watchdog = Arc::new(WatchdogState {
            started: Instant::now(),
            deadline_ms: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        });
        let handler_state = watchdog.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || handler_state.should_interrupt())));

        let context = Context::full(&runtime).map_err(|e| SandboxError::EngineError(e.to_string()))?;
        let bridge = capabilities.bridge.clone();
        context
            .with(|ctx| -> std::result::Result<(), String> {
                let bridge_fn = Function::new(ctx.clone(), move |op: String, payload: String| {
                    bridge_reply(bridge.as_ref(), &op, &payload)
                })
                .catch(&ctx)
                .map_err(|e| e.to_string())?;
                ctx.globals()
                    .set("__genui_bridge", bridge_fn)
                    .catch(&ctx)
                    .map_err(|e| e.to_string())?;
                ctx.eval::<(), _>(PRELUDE).catch(&ctx).map_err(|e| e.to_string())
            })
            .map_err(SandboxError::EngineError)?;

        let engine = Self {
            runtime,
            context,
            watchdog,
            limits,
        };
        let config = json!({
            "grants": capabilities.grants,
            "mirrorGlobals": capabilities.mirror_globals,
            "maxPasses": engine.limits.max_passes,
            "maxTreeDepth": engine.limits.tree_depth(),
        });
        engine
            .invoke("__genui_init", &config)
            .map_err(|fault| SandboxError::EngineError(fault.to_string()))?;
        tracing::trace!(origin = %capabilities.grants.origin, "component engine ready");
        Ok(engine)
    }

    /// Handle for interrupting this engine from elsewhere.
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch(self.watchdog.clone())
    }

    fn arm(&self) {
        self.watchdog.tripped.store(false, Ordering::Relaxed);
        let deadline = match self.limits.budget_ms {
            Some(budget) => (self.watchdog.started.elapsed().as_millis() as u64 + budget).max(1),
            None => 0,
        };
        self.watchdog.deadline_ms.store(deadline, Ordering::Relaxed);
    }

    fn disarm(&self) {
        self.watchdog.deadline_ms.store(0, Ordering::Relaxed);
    }

    fn interrupted(&self) -> bool {
        self.watchdog.tripped.load(Ordering::Relaxed)
    }

    /// Call one prelude entry point.
    fn invoke(&self, entry: &str, payload: &Value) -> std::result::Result<Value, EngineFault> {
        let argument = payload.to_string();
        let reply = self.context.with(|ctx| -> std::result::Result<String, String> {
            let func: Function = ctx.globals().get(entry).catch(&ctx).map_err(|e| e.to_string())?;
            func.call::<_, String>((argument,)).catch(&ctx).map_err(|e| e.to_string())
        });
        let reply = match reply {
            Ok(reply) => reply,
            Err(_) if self.interrupted() => return Err(EngineFault::Interrupted),
            Err(message) => return Err(EngineFault::Engine(message)),
        };
        // Trees legitimately nest past serde_json's own limit, so the reply
        // is measured here and parsed without one.
        let limit = self.limits.reply_depth();
        if json_depth(&reply) > limit {
            return Err(EngineFault::Engine(format!("reply from {entry} nests deeper than {limit} levels")));
        }
        let mut de = serde_json::Deserializer::from_str(&reply);
        de.disable_recursion_limit();
        let envelope =
            Envelope::deserialize(&mut de).map_err(|e| EngineFault::Engine(format!("bad reply from {entry}: {e}")))?;
        match envelope.error {
            Some(ScriptError { name, message }) => Err(EngineFault::Script { name, message }),
            None => Ok(envelope.ok.unwrap_or(Value::Null)),
        }
    }

    /// Run queued promise jobs, flushing renders they schedule.
    fn settle(&self) -> std::result::Result<(), EngineFault> {
        for _ in 0..self.limits.job_rounds {
            let mut ran = 0u32;
            while self.runtime.is_job_pending() && ran < self.limits.max_jobs_per_round {
                ran += 1;
                if self.runtime.execute_pending_job().is_err() {
                    if self.interrupted() {
                        return Err(EngineFault::Interrupted);
                    }
                    tracing::debug!("promise job threw");
                }
            }
            if ran == 0 {
                return Ok(());
            }
            self.invoke("__genui_flush", &Value::Null)?;
        }
        Ok(())
    }

    fn run(&self, entry: &str, payload: &Value) -> std::result::Result<(), EngineFault> {
        self.arm();
        let outcome = self.invoke(entry, payload).and_then(|_| self.settle());
        self.disarm();
        outcome
    }

    /// Evaluate a lowered candidate and render the component `name` (or the
    /// default export if `name` is unbound).
    pub fn mount(&mut self, unit: &CompiledUnit, name: &str) -> std::result::Result<(), EngineFault> {
        if !crate::compile::is_js_identifier(name) {
            return Err(EngineFault::Engine(format!("invalid component name {name:?}")));
        }
        self.run("__genui_mount", &json!({ "code": unit.code, "name": name }))
    }

    /// Invoke a handler on a rendered element and re-render.
    pub fn dispatch(&mut self, target: u32, event: &UiEvent) -> std::result::Result<(), EngineFault> {
        self.run(
            "__genui_dispatch",
            &json!({
                "id": target,
                "handler": event.handler,
                "value": event.value,
                "checked": event.checked,
            }),
        )
    }

    /// Advance the virtual clock, firing due timers.
    pub fn advance_timers(&mut self, ms: u64) -> std::result::Result<(), EngineFault> {
        self.run("__genui_tick", &json!({ "ms": ms }))
    }

    /// Output of the last successful render.
    pub fn tree(&self) -> std::result::Result<VisualTree, EngineFault> {
        let value = self.invoke("__genui_tree", &Value::Null)?;
        serde_json::from_value(value).map_err(|e| EngineFault::Engine(format!("bad tree: {e}")))
    }
}

/// A user interaction aimed at one rendered element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiEvent {
    /// Handler prop, e.g. `onClick` or `onChange`
    pub handler: String,
    /// `event.target.value`
    #[serde(default)]
    pub value: Option<String>,
    /// `event.target.checked`
    #[serde(default)]
    pub checked: bool,
}

impl UiEvent {
    /// A click.
    pub fn click() -> Self {
        Self {
            handler: "onClick".to_string(),
            value: None,
            checked: false,
        }
    }

    /// A change carrying a new input value.
    pub fn change(value: impl Into<String>) -> Self {
        Self {
            handler: "onChange".to_string(),
            value: Some(value.into()),
            checked: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HostEnvironment;
    use crate::compile::compile;
    use pretty_assertions::assert_eq;

    fn engine(host: &Arc<HostEnvironment>) -> ComponentEngine {
        ComponentEngine::new(&CapabilityContext::ambient(host.clone()), EngineLimits::default()).unwrap()
    }

    fn mount(engine: &mut ComponentEngine, src: &str, name: &str) -> std::result::Result<(), EngineFault> {
        engine.mount(&compile(src).unwrap(), name)
    }

    #[test]
    fn test_renders_static_markup() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        mount(&mut engine, "function Hello() { return <div className=\"x\"><b>Hi</b> there</div> }", "Hello").unwrap();
        assert_eq!(engine.tree().unwrap().to_markup(), "<div class=\"x\"><b>Hi</b> there</div>");
    }

    #[test]
    fn test_state_and_click() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        let src = r#"
            function Counter() {
              const [n, setN] = useState(0);
              return <div><span>{n}</span><button onClick={() => setN(n + 1)}>Add</button></div>;
            }
        "#;
        mount(&mut engine, src, "Counter").unwrap();
        let id = engine.tree().unwrap().find_clickable("Add").unwrap();
        engine.dispatch(id, &UiEvent::click()).unwrap();
        engine.dispatch(id, &UiEvent::click()).unwrap();
        assert!(engine.tree().unwrap().text_content().starts_with("2"));
    }

    #[test]
    fn test_effects_and_timers() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        let src = r#"
            function Clock() {
              const [t, setT] = useState(0);
              useEffect(() => {
                const id = setInterval(() => setT((x) => x + 1), 1000);
                return () => clearInterval(id);
              }, []);
              return <p>{t}</p>;
            }
        "#;
        mount(&mut engine, src, "Clock").unwrap();
        assert_eq!(engine.tree().unwrap().text_content(), "0");
        engine.advance_timers(3500).unwrap();
        assert_eq!(engine.tree().unwrap().text_content(), "3");
    }

    #[test]
    fn test_default_export_fallback() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        mount(&mut engine, "export default function Card() { return <p>card</p> }", "Missing").unwrap();
        assert_eq!(engine.tree().unwrap().text_content(), "card");
    }

    #[test]
    fn test_unbound_name_is_reference_error() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        let fault = mount(&mut engine, "function A() { return null }", "B").unwrap_err();
        assert_eq!(
            fault,
            EngineFault::Script {
                name: "ReferenceError".into(),
                message: "B is not defined".into()
            }
        );
    }

    const NEST: &str = r#"
        function Nest({ n }) {
          return n === 0 ? <b>leaf</b> : <div><Nest n={n - 1} /></div>;
        }
    "#;

    #[test]
    fn test_deep_trees_render() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        let src = format!("{NEST}\nfunction Deep() {{ return <Nest n={{100}} /> }}");
        mount(&mut engine, &src, "Deep").unwrap();
        let tree = engine.tree().unwrap();
        assert!(tree.contains_text("leaf"));
        assert!(tree.to_markup().starts_with(&"<div>".repeat(100)));
    }

    #[test]
    fn test_tree_depth_limit() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        let src = format!("{NEST}\nfunction Deep() {{ return <Nest n={{200}} /> }}");
        match mount(&mut engine, &src, "Deep").unwrap_err() {
            EngineFault::Script { name, message } => {
                assert_eq!(name, "RangeError");
                assert_eq!(message, "render tree is deeper than 128 elements");
            }
            other => panic!("unexpected fault {other:?}"),
        }

        let limits = EngineLimits::default().max_tree_depth(10);
        let mut engine = ComponentEngine::new(&CapabilityContext::ambient(host.clone()), limits).unwrap();
        let src = format!("{NEST}\nfunction Deep() {{ return <Nest n={{20}} /> }}");
        assert!(mount(&mut engine, &src, "Deep").is_err());
    }

    #[test]
    fn test_json_depth() {
        assert_eq!(json_depth(r#"{"ok":null}"#), 1);
        assert_eq!(json_depth(r#"{"ok":[{"children":[]}]}"#), 4);
        assert_eq!(json_depth(r#"{"ok":"[[[[{{{{\"]]"}"#), 1);
        assert_eq!(json_depth(&"[".repeat(1000)), 1000);
    }

    #[test]
    fn test_runaway_updates_stop() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        let src = "function Loop() { const [n, setN] = useState(0); setN(n + 1); return <p>{n}</p> }";
        match mount(&mut engine, src, "Loop").unwrap_err() {
            EngineFault::Script { message, .. } => assert!(message.contains("Too many re-renders")),
            other => panic!("unexpected fault {other:?}"),
        }
    }

    #[test]
    fn test_ambient_storage_reaches_host() {
        let host = HostEnvironment::builder().local_item("authToken", "secret").build();
        let mut engine = engine(&host);
        let src = "function T() { return <p>{localStorage.getItem('authToken')}</p> }";
        mount(&mut engine, src, "T").unwrap();
        assert_eq!(engine.tree().unwrap().text_content(), "secret");
        assert_eq!(host.accesses()[0].capability, "localStorage");
    }

    #[test]
    fn test_indirect_eval_sees_mirrored_globals() {
        let host = HostEnvironment::builder().local_item("k", "v").build();
        let mut engine = engine(&host);
        let src = "function T() { return <p>{(0, eval)('localStorage').getItem('k')}</p> }";
        mount(&mut engine, src, "T").unwrap();
        assert_eq!(engine.tree().unwrap().text_content(), "v");
    }

    #[test]
    fn test_budget_interrupts_infinite_loop() {
        let host = HostEnvironment::builder().build();
        let limits = EngineLimits::default().with_budget(Duration::from_millis(100));
        let mut engine = ComponentEngine::new(&CapabilityContext::ambient(host), limits).unwrap();
        let fault = mount(&mut engine, "function L() { while (true) {} }", "L").unwrap_err();
        assert_eq!(fault, EngineFault::Interrupted);
    }

    #[test]
    fn test_change_event_value() {
        let host = HostEnvironment::builder().build();
        let mut engine = engine(&host);
        let src = r#"
            function Field() {
              const [v, setV] = useState("");
              return <div><input onChange={(e) => setV(e.target.value)} /><p>{v}</p></div>;
            }
        "#;
        mount(&mut engine, src, "Field").unwrap();
        engine.dispatch(2, &UiEvent::change("hello")).unwrap();
        assert_eq!(engine.tree().unwrap().text_content(), "hello");
    }
}
