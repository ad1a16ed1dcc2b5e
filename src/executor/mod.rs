//! Template Executor (§4.2): interprets a `ProtocolTemplate` against a
//! `Driver`. Pure with respect to wall time and state outside the driver and
//! a local context — grounded step-for-step on
//! `backend/services/protocol_executor.py`.

mod expr;
mod parse;

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::driver::Driver;
use crate::error::GatewayError;
use crate::model::{is_write_action, MessageHandler, ProtocolTemplate, Step, StepOutcome, Trigger};

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\}").unwrap()
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ManualStepResult {
    pub step_id: String,
    pub result: Value,
    pub output: Value,
}

/// Build the context object step resolution and parse/expression evaluation
/// run against: template variables at the top level, plus `steps.<id>.result`.
/// Exposed so the runtime can build the same shape when it needs to render
/// output from a `step_results` snapshot outside of an executor call.
pub fn build_context(vars: &HashMap<String, Value>, steps: &HashMap<String, StepOutcome>) -> Value {
    let mut root = Map::new();
    for (k, v) in vars {
        root.insert(k.clone(), v.clone());
    }
    let mut steps_obj = Map::new();
    for (id, outcome) in steps {
        steps_obj.insert(id.clone(), serde_json::json!({"result": outcome.result}));
    }
    root.insert("steps".to_string(), Value::Object(steps_obj));
    Value::Object(root)
}

fn get_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = ctx;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn render_string(s: &str, ctx: &Value) -> Value {
    let re = placeholder_pattern();
    if let Some(caps) = re.captures(s) {
        if caps.get(0).unwrap().as_str() == s {
            // The entire string is one placeholder: preserve the resolved type.
            return get_path(ctx, &caps[1]).cloned().unwrap_or(Value::Null);
        }
    }
    let rendered = re.replace_all(s, |caps: &regex::Captures| {
        match get_path(ctx, &caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    });
    Value::String(rendered.into_owned())
}

fn render_value(v: &Value, ctx: &Value) -> Value {
    match v {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|i| render_value(i, ctx)).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, ctx));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn resolve_params(params: &HashMap<String, Value>, ctx: &Value) -> HashMap<String, Value> {
    params
        .iter()
        .map(|(k, v)| (k.clone(), render_value(v, ctx)))
        .collect()
}

pub fn render_output(tpl: &ProtocolTemplate, ctx: &Value) -> Value {
    render_value(&tpl.template.output, ctx)
}

/// A uniform view over `Step` and `MessageHandler`, which share the same
/// execution shape (action/params/parse) but aren't the same Rust type.
struct StepLike<'a> {
    id: &'a str,
    action: &'a str,
    params: &'a HashMap<String, Value>,
    parse: Option<&'a crate::model::Parse>,
}

impl<'a> From<&'a Step> for StepLike<'a> {
    fn from(s: &'a Step) -> Self {
        StepLike {
            id: &s.id,
            action: &s.action,
            params: &s.params,
            parse: s.parse.as_ref(),
        }
    }
}

impl<'a> From<&'a MessageHandler> for StepLike<'a> {
    fn from(m: &'a MessageHandler) -> Self {
        StepLike {
            id: "message_handler",
            action: &m.action,
            params: &m.params,
            parse: m.parse.as_ref(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_step(
    step: &StepLike<'_>,
    driver: &mut dyn Driver,
    ctx: &Value,
    allow_write: bool,
    skip_driver: bool,
    params_override: Option<&HashMap<String, Value>>,
) -> Result<Value, GatewayError> {
    let mut effective = resolve_params(step.params, ctx);
    if let Some(overrides) = params_override {
        for (k, v) in overrides {
            effective.insert(k.clone(), v.clone());
        }
    }

    let raw_result = if step.action == "delay" {
        let ms = effective
            .get("milliseconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        serde_json::json!({"delayed_ms": ms})
    } else if step.action.starts_with("transform.") {
        parse::run_transform(step.action, &effective)?
    } else if skip_driver {
        serde_json::json!({"payload": ctx.get("payload").cloned().unwrap_or(Value::Null)})
    } else {
        if is_write_action(step.action) && !allow_write {
            return Err(GatewayError::Forbidden(format!(
                "write action '{}' is only permitted via a manual-step or allow_write step-test RPC",
                step.action
            )));
        }
        driver.execute_action(step.action, &effective).await?
    };

    match step.parse {
        Some(p) => parse::apply_parse(p, &raw_result, ctx),
        None => Ok(raw_result),
    }
}

fn bind(steps: &mut HashMap<String, StepOutcome>, id: &str, result: Value) {
    steps.insert(id.to_string(), StepOutcome { result });
}

/// `run_setup_steps(tpl, drv, vars) -> steps_map`
pub async fn run_setup_steps(
    tpl: &ProtocolTemplate,
    driver: &mut dyn Driver,
    vars: &HashMap<String, Value>,
) -> Result<HashMap<String, StepOutcome>, GatewayError> {
    let mut steps_map: HashMap<String, StepOutcome> = HashMap::new();
    for step in &tpl.template.setup_steps {
        let ctx = build_context(vars, &steps_map);
        let like = StepLike::from(step);
        let result = execute_step(&like, driver, &ctx, false, false, None).await?;
        bind(&mut steps_map, &step.id, result);
    }
    Ok(steps_map)
}

/// `run_poll_steps(tpl, drv, vars, previous_steps) -> steps_map`
pub async fn run_poll_steps(
    tpl: &ProtocolTemplate,
    driver: &mut dyn Driver,
    vars: &HashMap<String, Value>,
    previous_steps: &HashMap<String, StepOutcome>,
) -> Result<HashMap<String, StepOutcome>, GatewayError> {
    let mut steps_map = previous_steps.clone();
    for step in tpl.template.steps.iter().filter(|s| s.trigger == Trigger::Poll) {
        let ctx = build_context(vars, &steps_map);
        let like = StepLike::from(step);
        let result = execute_step(&like, driver, &ctx, false, false, None).await?;
        bind(&mut steps_map, &step.id, result);
    }
    Ok(steps_map)
}

/// `run_manual_step(tpl, drv, step_id, vars, params_override, previous_steps)`.
/// Does not mutate the caller's `previous_steps` — the runtime's
/// `RuntimeState.step_results` is left untouched by a manual invocation.
pub async fn run_manual_step(
    tpl: &ProtocolTemplate,
    driver: &mut dyn Driver,
    step_id: &str,
    vars: &HashMap<String, Value>,
    params_override: &HashMap<String, Value>,
    previous_steps: &HashMap<String, StepOutcome>,
) -> Result<ManualStepResult, GatewayError> {
    let step = tpl
        .template
        .steps
        .iter()
        .find(|s| s.id == step_id)
        .ok_or_else(|| GatewayError::NotFound(format!("step '{step_id}' not found")))?;

    if step.trigger != Trigger::Manual {
        return Err(GatewayError::Forbidden(format!(
            "step '{step_id}' is not a manual-trigger step"
        )));
    }

    let mut steps_map = previous_steps.clone();
    let ctx = build_context(vars, &steps_map);
    let like = StepLike::from(step);
    let result = execute_step(&like, driver, &ctx, true, false, Some(params_override)).await?;
    bind(&mut steps_map, &step.id, result.clone());

    let out_ctx = build_context(vars, &steps_map);
    let output = render_output(tpl, &out_ctx);

    Ok(ManualStepResult {
        step_id: step_id.to_string(),
        result,
        output,
    })
}

/// `run_message_handler(tpl, drv, payload_bytes, vars, previous_steps) -> (steps_map, output)`.
pub async fn run_message_handler(
    tpl: &ProtocolTemplate,
    driver: &mut dyn Driver,
    payload_bytes: &[u8],
    vars: &HashMap<String, Value>,
    previous_steps: &HashMap<String, StepOutcome>,
) -> Result<(HashMap<String, StepOutcome>, Value), GatewayError> {
    let handler = tpl
        .template
        .message_handler
        .as_ref()
        .ok_or_else(|| GatewayError::NotFound("template has no message_handler".to_string()))?;

    let mut steps_map = previous_steps.clone();
    let mut ctx = build_context(vars, &steps_map);
    if let Value::Object(root) = &mut ctx {
        root.insert(
            "payload".to_string(),
            Value::String(String::from_utf8_lossy(payload_bytes).into_owned()),
        );
    }

    let like = StepLike::from(handler);
    let result = execute_step(&like, driver, &ctx, false, true, None).await?;
    bind(&mut steps_map, "message_handler", result);

    let out_ctx = build_context(vars, &steps_map);
    let output = render_output(tpl, &out_ctx);
    Ok((steps_map, output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubDriver {
        response: Value,
    }

    #[async_trait]
    impl Driver for StubDriver {
        async fn connect(&mut self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn disconnect(&mut self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn execute_action(
            &mut self,
            _action: &str,
            _params: &HashMap<String, Value>,
        ) -> Result<Value, GatewayError> {
            Ok(self.response.clone())
        }
    }

    fn modbus_template() -> ProtocolTemplate {
        use crate::model::*;
        ProtocolTemplate {
            id: 1,
            name: "scale".into(),
            description: String::new(),
            protocol_type: ProtocolType::ModbusTcp,
            is_system: false,
            template: TemplateBody {
                variables: vec![],
                setup_steps: vec![],
                steps: vec![Step {
                    id: "read_weight".into(),
                    name: None,
                    trigger: Trigger::Poll,
                    action: "modbus.read_input_registers".into(),
                    params: HashMap::from([
                        ("slave_id".to_string(), serde_json::json!("${slave_id}")),
                        ("address".to_string(), serde_json::json!("${address}")),
                        ("count".to_string(), serde_json::json!(2)),
                    ]),
                    parse: Some(Parse::Expression {
                        expression: "registers[0]*65536+registers[1]".to_string(),
                    }),
                }],
                message_handler: None,
                output: serde_json::json!({"weight": "${steps.read_weight.result}", "unit": "kg"}),
            },
        }
    }

    #[tokio::test]
    async fn s1_modbus_poll_happy_path() {
        let tpl = modbus_template();
        let mut driver = StubDriver {
            response: serde_json::json!({"registers": [0, 12340]}),
        };
        let vars = HashMap::from([
            ("slave_id".to_string(), serde_json::json!(1)),
            ("address".to_string(), serde_json::json!(0)),
        ]);
        let steps = run_poll_steps(&tpl, &mut driver, &vars, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(steps["read_weight"].result, serde_json::json!(12340));

        let ctx = build_context(&vars, &steps);
        let output = render_output(&tpl, &ctx);
        assert_eq!(output["weight"], serde_json::json!(12340));
        assert_eq!(output["unit"], serde_json::json!("kg"));
    }

    #[test]
    fn full_string_placeholder_preserves_type() {
        let ctx = serde_json::json!({"steps": {"x": {"result": 42}}});
        assert_eq!(render_string("${steps.x.result}", &ctx), serde_json::json!(42));
        assert_eq!(
            render_string("value=${steps.x.result}", &ctx),
            serde_json::json!("value=42")
        );
    }

    #[test]
    fn missing_path_renders_null_as_empty_string() {
        let ctx = serde_json::json!({});
        assert_eq!(render_string("w=${missing.path}", &ctx), serde_json::json!("w="));
    }

    #[tokio::test]
    async fn run_poll_steps_preserves_setup_keys() {
        let mut tpl = modbus_template();
        tpl.template.steps[0].trigger = Trigger::Poll;
        let mut driver = StubDriver {
            response: serde_json::json!({"registers": [0, 1]}),
        };
        let mut previous = HashMap::new();
        previous.insert(
            "subscribe".to_string(),
            StepOutcome {
                result: serde_json::json!({"topic": "x", "qos": 1}),
            },
        );
        let steps = run_poll_steps(&tpl, &mut driver, &HashMap::new(), &previous)
            .await
            .unwrap();
        assert!(steps.contains_key("subscribe"));
        assert!(steps.contains_key("read_weight"));
    }

    #[tokio::test]
    async fn manual_step_requires_manual_trigger() {
        let tpl = modbus_template(); // its only step is trigger:"poll"
        let mut driver = StubDriver {
            response: serde_json::json!({"ok": true}),
        };
        let err = run_manual_step(
            &tpl,
            &mut driver,
            "read_weight",
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn manual_step_does_not_mutate_caller_step_results() {
        let mut tpl = modbus_template();
        tpl.template.steps[0].trigger = Trigger::Manual;
        tpl.template.steps[0].action = "mqtt.publish".to_string();
        let mut driver = StubDriver {
            response: serde_json::json!({"topic": "sensor/weight/cmd", "published": true}),
        };
        let previous = HashMap::new();
        let result = run_manual_step(
            &tpl,
            &mut driver,
            "read_weight",
            &HashMap::new(),
            &HashMap::new(),
            &previous,
        )
        .await
        .unwrap();
        assert_eq!(result.result["published"], serde_json::json!(true));
        assert!(previous.is_empty());
    }
}
