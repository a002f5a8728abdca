//! Names, argument shapes and schemas of the engine's own tools: sub-agent
//! delegation tools and the barrier tools that end a chain.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::llm::ToolDefinition;
use crate::core::subtasks::SubtaskInfo;

pub const ASK_USER: &str = "ask_user";
pub const DONE: &str = "done";

pub const PENTESTER: &str = "pentester";
pub const CODER: &str = "coder";
pub const MAINTENANCE: &str = "maintenance";
pub const MEMORIST: &str = "memorist";
pub const SEARCH: &str = "search";
pub const ADVICE: &str = "advice";

pub const HACK_RESULT: &str = "hack_result";
pub const CODE_RESULT: &str = "code_result";
pub const MAINTENANCE_RESULT: &str = "maintenance_result";
pub const MEMORIST_RESULT: &str = "memorist_result";
pub const SEARCH_RESULT: &str = "search_result";
pub const ENRICHER_RESULT: &str = "enricher_result";
pub const REPORT_RESULT: &str = "report_result";
pub const SUBTASK_LIST: &str = "subtask_list";
pub const SUBTASK_PATCH: &str = "subtask_patch";

/// Delegation request to a tool-loop sub-agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexAsk {
    pub question: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AskAdvice {
    pub question: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub message: String,
}

/// Payload of every `*_result` barrier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub result: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Done {
    #[serde(default = "default_success")]
    pub success: bool,
    pub result: String,
    #[serde(default)]
    pub message: String,
}

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AskUser {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubtaskList {
    pub subtasks: Vec<SubtaskInfo>,
    #[serde(default)]
    pub message: String,
}

fn question_schema(question: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "question": { "type": "string", "description": question },
            "message": { "type": "string", "description": "Short note for the user about why this is asked" }
        },
        "required": ["question"]
    })
}

fn result_schema(result: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "result": { "type": "string", "description": result },
            "message": { "type": "string", "description": "Short summary for the user" }
        },
        "required": ["result"]
    })
}

fn subtask_info_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" },
            "description": { "type": "string" }
        },
        "required": ["title", "description"]
    })
}

fn def(name: &str, description: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

/// Definition of a built-in tool, `None` for names the engine does not own.
pub fn tool_definition(name: &str) -> Option<ToolDefinition> {
    let definition = match name {
        ASK_USER => def(
            ASK_USER,
            "Ask the user a question and wait for the answer",
            json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Question for the user" }
                },
                "required": ["message"]
            }),
        ),
        DONE => def(
            DONE,
            "Finish the current subtask and report its result",
            json!({
                "type": "object",
                "properties": {
                    "success": { "type": "boolean" },
                    "result": { "type": "string", "description": "Full result of the subtask" },
                    "message": { "type": "string" }
                },
                "required": ["success", "result"]
            }),
        ),
        PENTESTER => def(
            PENTESTER,
            "Delegate a penetration testing job to the pentester agent",
            question_schema("Detailed description of the security testing job"),
        ),
        CODER => def(
            CODER,
            "Delegate writing or changing code to the coder agent",
            question_schema("Detailed description of the code to write"),
        ),
        MAINTENANCE => def(
            MAINTENANCE,
            "Delegate installing or configuring software to the installer agent",
            question_schema("What must be installed or configured"),
        ),
        MEMORIST => def(
            MEMORIST,
            "Ask the memorist agent to recall facts from earlier work",
            question_schema("What to look up in the work history"),
        ),
        SEARCH => def(
            SEARCH,
            "Ask the searcher agent to research a question on the internet",
            question_schema("What to research"),
        ),
        ADVICE => def(
            ADVICE,
            "Ask the adviser for expert guidance when stuck",
            json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string" },
                    "code": { "type": "string", "description": "Relevant code, if any" },
                    "output": { "type": "string", "description": "Relevant command output, if any" },
                    "message": { "type": "string" }
                },
                "required": ["question"]
            }),
        ),
        HACK_RESULT => def(
            HACK_RESULT,
            "Report the result of the penetration testing job",
            result_schema("Findings, evidence and reproduction steps"),
        ),
        CODE_RESULT => def(
            CODE_RESULT,
            "Report the result of the coding job",
            result_schema("What was written, where, and how to run it"),
        ),
        MAINTENANCE_RESULT => def(
            MAINTENANCE_RESULT,
            "Report the result of the maintenance job",
            result_schema("What was installed or configured"),
        ),
        MEMORIST_RESULT => def(
            MEMORIST_RESULT,
            "Report what was recalled",
            result_schema("Recalled facts relevant to the question"),
        ),
        SEARCH_RESULT => def(
            SEARCH_RESULT,
            "Report the research result",
            result_schema("Answer with sources"),
        ),
        ENRICHER_RESULT => def(
            ENRICHER_RESULT,
            "Report the gathered context for the adviser",
            result_schema("Context that helps answer the question"),
        ),
        REPORT_RESULT => def(
            REPORT_RESULT,
            "Report the final result of the task",
            result_schema("Final report of the task"),
        ),
        SUBTASK_LIST => def(
            SUBTASK_LIST,
            "Submit the planned list of subtasks",
            json!({
                "type": "object",
                "properties": {
                    "subtasks": { "type": "array", "items": subtask_info_schema() },
                    "message": { "type": "string" }
                },
                "required": ["subtasks"]
            }),
        ),
        SUBTASK_PATCH => def(
            SUBTASK_PATCH,
            "Submit changes to the planned subtasks",
            json!({
                "type": "object",
                "properties": {
                    "operations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "op": { "type": "string", "enum": ["add", "remove", "modify", "reorder"] },
                                "id": { "type": "integer" },
                                "after_id": { "type": "integer" },
                                "title": { "type": "string" },
                                "description": { "type": "string" }
                            },
                            "required": ["op"]
                        }
                    },
                    "message": { "type": "string" }
                },
                "required": ["operations", "message"]
            }),
        ),
        _ => return None,
    };
    Some(definition)
}
