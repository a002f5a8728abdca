//! Tool-call pairing repair.
//!
//! A crash between persisting an AI turn and persisting all of its tool
//! responses leaves calls without answers. Models reject such chains, so they
//! are closed with a fallback response before the chain is reused.

use std::collections::HashSet;

use super::{Message, Role, ToolCall, ToolCallResponse};

pub const FALLBACK_TOOL_RESPONSE: &str =
    "the tool call was interrupted before it produced a result; call it again if it is still needed";

fn last_ai_index(chain: &[Message]) -> Option<usize> {
    chain.iter().rposition(|m| m.role == Role::Ai)
}

/// Position right after the block of Tool messages that follows the last AI turn.
fn response_insert_index(chain: &[Message], ai_idx: usize) -> usize {
    let mut idx = ai_idx + 1;
    while idx < chain.len() && chain[idx].role == Role::Tool {
        idx += 1;
    }
    idx
}

/// Tool calls of the most recent AI message that have no matching response.
pub fn find_unresponded_tool_calls(chain: &[Message]) -> Vec<ToolCall> {
    let Some(ai_idx) = last_ai_index(chain) else {
        return Vec::new();
    };

    let answered: HashSet<&str> = chain[ai_idx + 1..]
        .iter()
        .filter(|m| m.role == Role::Tool)
        .flat_map(|m| m.tool_responses())
        .map(|r| r.tool_call_id.as_str())
        .collect();

    chain[ai_idx]
        .tool_calls()
        .filter(|call| !answered.contains(call.id.as_str()))
        .cloned()
        .collect()
}

fn insert_responses(chain: &mut Vec<Message>, responses: Vec<ToolCallResponse>) {
    let Some(ai_idx) = last_ai_index(chain) else {
        return;
    };
    let at = response_insert_index(chain, ai_idx);
    for (offset, response) in responses.into_iter().enumerate() {
        chain.insert(at + offset, Message::tool_response(response));
    }
}

/// Answers every dangling tool call with [`FALLBACK_TOOL_RESPONSE`].
/// Returns the number of responses added; a consistent chain is left untouched.
pub fn ensure_chain_consistency(chain: &mut Vec<Message>) -> usize {
    let missing = find_unresponded_tool_calls(chain);
    if missing.is_empty() {
        return 0;
    }

    let added = missing.len();
    let responses = missing
        .into_iter()
        .map(|call| ToolCallResponse {
            tool_call_id: call.id,
            name: call.name,
            content: FALLBACK_TOOL_RESPONSE.to_string(),
        })
        .collect();
    insert_responses(chain, responses);
    added
}

/// Delivers user input into a chain.
///
/// If the last AI turn is waiting on a `tool_name` call, the input becomes that
/// call's response and any sibling calls get the fallback. Otherwise dangling
/// calls are closed with the fallback and the input is appended as a Human turn.
pub fn add_tool_call_response_or_human(chain: &mut Vec<Message>, tool_name: &str, input: &str) {
    let missing = find_unresponded_tool_calls(chain);
    let Some(target) = missing.iter().position(|call| call.name == tool_name) else {
        ensure_chain_consistency(chain);
        chain.push(Message::human(input));
        return;
    };

    let responses = missing
        .into_iter()
        .enumerate()
        .map(|(idx, call)| ToolCallResponse {
            tool_call_id: call.id,
            name: call.name,
            content: if idx == target {
                input.to_string()
            } else {
                FALLBACK_TOOL_RESPONSE.to_string()
            },
        })
        .collect();
    insert_responses(chain, responses);
}
