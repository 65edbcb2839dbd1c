//! Chain Executor: an atomic DAG of tool calls with variable
//! interpolation between steps.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use toolgate_core::error::GatewayError;

use crate::router::{ToolCallOutcome, ToolRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Stop,
    Continue,
}

impl Default for OnError {
    fn default() -> Self {
        OnError::Stop
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainStep {
    pub id: String,
    pub tool: String,
    pub server: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainRequest {
    pub session_id: Option<String>,
    pub steps: Vec<ChainStep>,
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub id: String,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Completed,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainResult {
    pub chain_id: String,
    pub status: ChainStatus,
    pub steps: Vec<StepResult>,
    pub total_duration_ms: u64,
}

/// Base36 encoding of a millisecond timestamp, used for `chain_` ids
/// No leading-zero stripping beyond the natural
/// effect of `0` mapping to a single digit.
fn base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        let digit = (n % 36) as usize;
        out.push(*DIGITS.get(digit).unwrap_or(&b'0'));
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_else(|_| "0".to_string())
}

pub fn generate_chain_id(now_millis: u128) -> String {
    format!("chain_{}", base36(now_millis))
}

/// Groups steps into layers via Kahn's algorithm: each layer holds every
/// step whose dependencies have all been placed in a prior layer. A
/// leftover, unplaceable step indicates a cycle.
fn topo_layers(steps: &[ChainStep]) -> Result<Vec<Vec<usize>>, GatewayError> {
    let ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    if ids.len() != steps.len() {
        return Err(GatewayError::BadRequest("duplicate step ids".to_string()));
    }

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, step) in steps.iter().enumerate() {
        let mut degree = 0;
        for dep in &step.depends_on {
            if ids.contains(dep.as_str()) {
                degree += 1;
                dependents.entry(dep.as_str()).or_default().push(idx);
            }
        }
        in_degree.insert(step.id.as_str(), degree);
    }

    let mut ready: VecDeque<usize> = steps
        .iter()
        .enumerate()
        .filter(|(_, step)| in_degree.get(step.id.as_str()).copied().unwrap_or(0) == 0)
        .map(|(idx, _)| idx)
        .collect();

    let mut layers = Vec::new();
    let mut placed = 0usize;
    while !ready.is_empty() {
        let layer: Vec<usize> = ready.drain(..).collect();
        placed += layer.len();
        let mut next_ready = Vec::new();
        for &idx in &layer {
            let Some(id) = steps.get(idx).map(|s| s.id.as_str()) else { continue };
            if let Some(children) = dependents.get(id) {
                for &child_idx in children {
                    let Some(child_id) = steps.get(child_idx).map(|s| s.id.as_str()) else { continue };
                    if let Some(degree) = in_degree.get_mut(child_id) {
                        *degree -= 1;
                        if *degree == 0 {
                            next_ready.push(child_idx);
                        }
                    }
                }
            }
        }
        layers.push(layer);
        ready.extend(next_ready);
    }

    if placed != steps.len() {
        return Err(GatewayError::BadRequest("CIRCULAR_DEPENDENCY".to_string()));
    }
    Ok(layers)
}

/// Walks a JSON value recursively, replacing any string that matches
/// `{{stepId.path.to.field}}` with the resolved value from a prior step's
/// result, stringified. A reference to a missing step or missing path is
/// left untouched.
fn interpolate(value: &Value, results: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_str(s, results)),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, results)).collect()),
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), interpolate(v, results))).collect())
        }
        other => other.clone(),
    }
}

fn interpolate_str(input: &str, results: &HashMap<String, Value>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        let Some(start) = rest.find("{{") else {
            output.push_str(rest);
            break;
        };
        let Some(tail) = rest.get(start..) else {
            output.push_str(rest);
            break;
        };
        let Some(end_rel) = tail.find("}}") else {
            output.push_str(rest);
            break;
        };
        let end = start + end_rel;
        let (before, after_start) = (rest.get(..start), rest.get(start + 2..end));
        let Some(before) = before else {
            output.push_str(rest);
            break;
        };
        output.push_str(before);
        let path = after_start.unwrap_or_default().trim();
        output.push_str(&resolve_path(path, results).unwrap_or_else(|| format!("{{{{{path}}}}}")));
        rest = rest.get(end + 2..).unwrap_or_default();
    }
    output
}

fn resolve_path(path: &str, results: &HashMap<String, Value>) -> Option<String> {
    let mut parts = path.split('.');
    let step_id = parts.next()?;
    let mut current = results.get(step_id)?;
    for segment in parts {
        current = current.get(segment)?;
    }
    Some(stringify(current))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => "[object Object]".to_string(),
    }
}

pub struct ChainExecutor<'a> {
    router: &'a ToolRouter,
}

impl<'a> ChainExecutor<'a> {
    pub fn new(router: &'a ToolRouter) -> Self {
        Self { router }
    }

    pub async fn execute(&self, tenant: &str, request: ChainRequest, chain_id: String) -> Result<ChainResult, GatewayError> {
        if request.steps.is_empty() {
            return Err(GatewayError::BadRequest("steps must not be empty".to_string()));
        }
        let layers = topo_layers(&request.steps)?;

        let mut results_by_id: HashMap<String, Value> = HashMap::new();
        let mut step_results: Vec<Option<StepResult>> = vec![None; request.steps.len()];
        let mut failed = false;
        let start = std::time::Instant::now();

        for layer in layers {
            if failed && request.on_error == OnError::Stop {
                for idx in layer {
                    let Some(step) = request.steps.get(idx) else { continue };
                    let entry = StepResult {
                        id: step.id.clone(),
                        status: StepStatus::Skipped,
                        result: None,
                        error: None,
                        duration_ms: 0,
                    };
                    if let Some(slot) = step_results.get_mut(idx) {
                        *slot = Some(entry);
                    }
                }
                continue;
            }

            let outcomes = futures::future::join_all(layer.iter().filter_map(|&idx| {
                let step = request.steps.get(idx)?;
                let args = interpolate(&step.args, &results_by_id);
                let server = step.server.clone();
                let tool = step.tool.clone();
                let session_id = request.session_id.clone();
                Some(async move {
                    let step_start = std::time::Instant::now();
                    let outcome =
                        self.router.route_tool_call(tenant, &server, &tool, args, session_id.as_deref()).await;
                    (idx, outcome, step_start.elapsed().as_millis() as u64)
                })
            }))
            .await;

            for (idx, outcome, duration_ms) in outcomes {
                let Some(step) = request.steps.get(idx) else { continue };
                let entry = match outcome {
                    Ok(ToolCallOutcome { content, is_error, .. }) => {
                        let parsed = content.first().map(parse_content_element);
                        if let Some(value) = &parsed {
                            results_by_id.insert(step.id.clone(), value.clone());
                        }
                        let status = if is_error { StepStatus::Error } else { StepStatus::Success };
                        StepResult { id: step.id.clone(), status, result: parsed, error: None, duration_ms }
                    }
                    Err(err) => {
                        // Only a thrown error (not merely `isError:true`) triggers the
                        // `stop` skip policy.
                        failed = failed || request.on_error == OnError::Stop;
                        StepResult {
                            id: step.id.clone(),
                            status: StepStatus::Error,
                            result: None,
                            error: Some(err.to_string()),
                            duration_ms,
                        }
                    }
                };
                if let Some(slot) = step_results.get_mut(idx) {
                    *slot = Some(entry);
                }
            }
        }

        let steps: Vec<StepResult> = step_results.into_iter().flatten().collect();
        let status = if steps.iter().all(|s| matches!(s.status, StepStatus::Error | StepStatus::Skipped)) {
            ChainStatus::Failed
        } else if steps.iter().any(|s| matches!(s.status, StepStatus::Error | StepStatus::Skipped)) {
            ChainStatus::Partial
        } else {
            ChainStatus::Completed
        };

        Ok(ChainResult { chain_id, status, steps, total_duration_ms: start.elapsed().as_millis() as u64 })
    }
}

/// A step's result is the parsed JSON body of its first content element, or
/// the raw text if JSON parsing fails.
fn parse_content_element(content: &Value) -> Value {
    if let Some(text) = content.get("text").and_then(Value::as_str) {
        serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
    } else {
        content.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, depends_on: &[&str]) -> ChainStep {
        ChainStep {
            id: id.into(),
            tool: "t".into(),
            server: "s".into(),
            args: Value::Null,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn independent_steps_land_in_the_same_layer() {
        let layers = topo_layers(&[step("a", &[]), step("b", &[])]).expect("no cycle");
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].len(), 2);
    }

    #[test]
    fn a_chain_of_dependencies_yields_one_layer_each() {
        let layers = topo_layers(&[step("a", &[]), step("b", &["a"]), step("c", &["b"])]).expect("no cycle");
        assert_eq!(layers.len(), 3);
    }

    #[test]
    fn a_cycle_is_rejected() {
        let err = topo_layers(&[step("a", &["b"]), step("b", &["a"])]).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = topo_layers(&[step("a", &[]), step("a", &[])]).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn interpolation_substitutes_a_resolved_field() {
        let mut results = HashMap::new();
        results.insert("a".to_string(), serde_json::json!({"value": 42}));
        let rendered = interpolate_str("x:{{a.value}}", &results);
        assert_eq!(rendered, "x:42");
    }

    #[test]
    fn interpolation_leaves_missing_references_untouched() {
        let results = HashMap::new();
        let rendered = interpolate_str("{{missing.field}}", &results);
        assert_eq!(rendered, "{{missing.field}}");
    }

    #[test]
    fn chain_ids_carry_the_expected_prefix() {
        let id = generate_chain_id(1_700_000_000_000);
        assert!(id.starts_with("chain_"));
    }
}
