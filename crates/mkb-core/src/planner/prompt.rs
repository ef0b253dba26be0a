//! Planning-mode prompt construction and plan parsing.
//!
//! Pure logic: no I/O. The orchestrator feeds retrieval hits in and gets a
//! system prompt plus any image links to attach to the user turn.

use serde_json::Value;

use crate::knowledge::SearchHit;
use crate::knowledge::prompt::{RenderedContext, content_for_prompt, number_images};

/// Key under which an unparseable plan answer is kept verbatim.
pub const RAW_PLAN_KEY: &str = "raw_plan";

/// Role and output contract for the planning model.
const PLANNER_ROLE: &str = "\
# Task
You are an experienced project planner who breaks goals down into tasks. \
Given the user's goal and requirements, produce an execution plan. Keep the \
plan as simple as possible and take the available tools into account. An \
agent will carry out every step of the plan, so each step must be \
executable on its own.

Your plan must meet these requirements:
1. Break the user's goal into concrete, executable steps.
2. Base the plan on the reference material so it is feasible and accurate.
3. If a step depends on the result of an earlier one, do not split it in \
two; complete it within a single step.
4. The last step is a conclusion that summarizes the answer clearly and \
concisely.

";

/// JSON shape the model is asked to emit.
const OUTPUT_FORMAT: &str = r#"# Output format
Output the execution plan strictly in the following JSON format, with no other text:

{
  "goal_analysis": "Analysis of the user's specific goal and requirements",
  "steps": [
    {
      "step_number": 1,
      "title": "Step title",
      "description": "What to do in this step",
      "expected_outcome": "A measurable result"
    }
  ]
}

"#;

const CLOSING: &str = "\
Now draw up a detailed execution plan for the user based on the reference \
material provided.";

/// Build the planning system prompt.
///
/// `tools` lists one `name: description` line per tool the step agent can
/// call. Hits with empty content contribute no text but may still carry an
/// image when `vision` is set.
pub fn build_plan_prompt(hits: &[SearchHit], tools: &[String], vision: bool) -> RenderedContext {
    let (numbers, image_urls) = number_images(hits, vision);

    let mut prompt = String::with_capacity(4096);
    prompt.push_str(PLANNER_ROLE);
    prompt.push_str(OUTPUT_FORMAT);

    prompt.push_str("# Available tools\n");
    if tools.is_empty() {
        prompt.push_str("No external tools are registered.\n");
    } else {
        for tool in tools {
            prompt.push_str(&format!("- {tool}\n"));
        }
    }
    prompt.push('\n');

    prompt.push_str("# Reference material\n<context>\n");
    for (hit, image_number) in hits.iter().zip(numbers) {
        if hit.content.is_empty() {
            continue;
        }
        prompt.push_str(&content_for_prompt(hit, image_number));
        prompt.push_str("\n\n");
    }
    prompt.push_str("</context>\n\n");
    prompt.push_str(CLOSING);

    RenderedContext { prompt, image_urls }
}

/// Parse the model's answer as a JSON object.
///
/// Models often wrap JSON in a Markdown code fence, so one surrounding
/// fence is stripped first. Anything that still is not a JSON object is
/// stored as `{"raw_plan": <answer>}`.
pub fn parse_plan(answer: &str) -> Value {
    match serde_json::from_str::<Value>(strip_code_fence(answer)) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            tracing::warn!("plan answer is not a JSON object, keeping raw text");
            let mut raw = serde_json::Map::new();
            raw.insert(RAW_PLAN_KEY.to_string(), Value::String(answer.to_string()));
            Value::Object(raw)
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening fence line.
    match body.split_once('\n') {
        Some((_, inner)) => inner.trim(),
        None => body.trim(),
    }
}
