//! Renders earlier step results into a context block for the next step's
//! prompt.

use super::plan::StepResult;

const CONTEXT_HEADING: &str = "# Previous Step Results\n\n";

const CONTEXT_INTRO: &str = "The following steps have already been executed. \
Their results are reliable and available to you:\n\n";

const CONTEXT_TRAILER: &str = "Use the information above directly where it applies. \
Do not repeat operations that have already been completed.\n";

/// Timestamp layout used for each step's execution time.
const EXECUTED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Render `steps` in the order given. Returns an empty string when `steps`
/// is empty.
pub fn render_context(steps: &[StepResult]) -> String {
    if steps.is_empty() {
        return String::new();
    }

    let body_len: usize = steps
        .iter()
        .map(|s| s.execution_result.len() + s.description.len() + 128)
        .sum();
    let mut out = String::with_capacity(
        CONTEXT_HEADING.len() + CONTEXT_INTRO.len() + CONTEXT_TRAILER.len() + body_len,
    );

    out.push_str(CONTEXT_HEADING);
    out.push_str(CONTEXT_INTRO);

    for step in steps {
        out.push_str(&format!("## Step {}: {}\n", step.step_number, step.title));
        out.push_str(&format!("Description: {}\n", step.description));
        out.push_str(&format!("Expected outcome: {}\n", step.expected_outcome));
        out.push_str(&format!(
            "Executed at: {}\n",
            step.executed_at.format(EXECUTED_AT_FORMAT)
        ));
        out.push_str("Actual execution result:\n");
        out.push_str(&step.execution_result);
        out.push_str("\n\n---\n\n");
    }

    out.push_str(CONTEXT_TRAILER);
    out
}
