use parking_lot::Mutex;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Position, Scope, AST};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{ScriptError, ENTRY_POINT};
use crate::config::ScriptsConfig;
use crate::pipeline::FieldMap;

/// How often (in interpreter operations) the deadline is checked.
const DEADLINE_CHECK_INTERVAL: u64 = 256;

/// Resource ceilings applied to every script invocation.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// 0 = unlimited
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_call_levels: 64,
            max_expr_depth: 128,
            max_string_size: 16 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
        }
    }
}

impl SandboxLimits {
    pub fn from_config(config: &ScriptsConfig) -> Self {
        Self {
            max_operations: config.max_operations,
            ..Self::default()
        }
    }
}

/// A configured Rhai engine for running transformation scripts.
///
/// Scripts get no file, network, process or module access: imports never
/// resolve, `eval` is turned off and `print`/`debug` go to the proxy log.
/// Each call runs in a fresh `Scope` against fresh argument maps, so nothing
/// a script does is visible to the next invocation.
pub struct SandboxEngine {
    engine: Engine,
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl SandboxEngine {
    pub fn new(limits: &SandboxLimits) -> Self {
        let deadline = Arc::new(Mutex::new(None));
        let engine = Self::create_engine(limits, Arc::clone(&deadline));
        Self { engine, deadline }
    }

    fn create_engine(limits: &SandboxLimits, deadline: Arc<Mutex<Option<Instant>>>) -> Engine {
        let mut engine = Engine::new();

        engine
            .set_max_operations(limits.max_operations)
            .set_max_call_levels(limits.max_call_levels)
            .set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth)
            .set_max_string_size(limits.max_string_size)
            .set_max_array_size(limits.max_array_size)
            .set_max_map_size(limits.max_map_size)
            .set_max_modules(0);
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.on_print(|text| info!(target: "rewrite_proxy::script", "{}", text));
        engine.on_debug(|text, source, pos: Position| {
            debug!(
                target: "rewrite_proxy::script",
                "[{}{}] {}",
                source.unwrap_or("script"),
                if pos.is_none() { String::new() } else { format!(" {pos}") },
                text
            )
        });

        engine.on_progress(move |ops| {
            if ops % DEADLINE_CHECK_INTERVAL != 0 {
                return None;
            }
            match *deadline.lock() {
                Some(at) if Instant::now() >= at => Some(Dynamic::UNIT),
                _ => None,
            }
        });

        engine.register_fn(
            "json_decode",
            |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
                serde_json::from_str::<Value>(text)
                    .map(json_to_dynamic)
                    .map_err(|e| format!("json_decode: {e}").into())
            },
        );
        engine.register_fn("json_encode", |value: Dynamic| -> String {
            dynamic_to_json(value).to_string()
        });

        engine
    }

    /// Compile a script with this engine's settings. Disabled symbols are
    /// rejected here rather than at run time.
    pub fn compile(&self, source: &str) -> Result<AST, rhai::ParseError> {
        self.engine.compile(source)
    }

    /// Call `modify(request, response)` in `ast` within `budget`.
    pub fn invoke(
        &self,
        ast: &AST,
        request: &FieldMap,
        response: &FieldMap,
        budget: Duration,
    ) -> Result<Dynamic, ScriptError> {
        let mut scope = Scope::new();
        let args = (field_map_to_rhai(request), field_map_to_rhai(response));

        let _armed = DeadlineGuard::arm(&self.deadline, budget);
        self.engine
            .call_fn::<Dynamic>(&mut scope, ast, ENTRY_POINT, args)
            .map_err(|err| {
                if is_terminated(&err) {
                    ScriptError::TimedOut(budget)
                } else {
                    ScriptError::Runtime(err.to_string())
                }
            })
    }
}

/// Clears the deadline when the invocation ends, even on unwind.
struct DeadlineGuard<'a> {
    slot: &'a Mutex<Option<Instant>>,
}

impl<'a> DeadlineGuard<'a> {
    fn arm(slot: &'a Mutex<Option<Instant>>, budget: Duration) -> Self {
        *slot.lock() = Some(Instant::now() + budget);
        Self { slot }
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

fn is_terminated(err: &EvalAltResult) -> bool {
    match err {
        EvalAltResult::ErrorTerminated(..) => true,
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => is_terminated(inner),
        _ => false,
    }
}

fn field_map_to_rhai(fields: &FieldMap) -> Map {
    fields
        .iter()
        .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
        .collect()
}

pub(super) fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            let vec: Vec<Dynamic> = arr.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

pub(super) fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Number(i.into())
    } else if let Ok(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if value.is_string() {
        Value::String(value.into_string().unwrap_or_default())
    } else if let Some(arr) = value.clone().try_cast::<Vec<Dynamic>>() {
        Value::Array(arr.into_iter().map(dynamic_to_json).collect())
    } else if let Some(map) = value.clone().try_cast::<Map>() {
        let mut obj = serde_json::Map::new();
        for (k, v) in map {
            obj.insert(k.to_string(), dynamic_to_json(v));
        }
        Value::Object(obj)
    } else {
        Value::String(format!("{value}"))
    }
}
