//! Agent capability tables
//!
//! Three agents, each a thin adapter over core components. The dispatcher
//! routes a message to exactly one function from the speaking agent's table
//! (or free-chats). Agents never bypass the core APIs.

use serde::Serialize;

/// The closed set of agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Receipt-processing agent; owns the receipt-flow dialog.
    Receipts,
    /// Authorization agent; fronts the auto-auth engine.
    Authorization,
    /// General read-only chat agent.
    Assistant,
}

impl AgentKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Receipts => "receipts",
            Self::Authorization => "authorization",
            Self::Assistant => "assistant",
        }
    }

    /// Display name used as the bot author in chat.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Receipts => "Scanner",
            Self::Authorization => "Warden",
            Self::Assistant => "Sitebook Assistant",
        }
    }

    /// One-line persona for message wrapping.
    pub fn persona(&self) -> &'static str {
        match self {
            Self::Receipts => {
                "Scanner, the receipt clerk. Practical and brisk; reports what was read, \
                 what was created, and what is still missing."
            }
            Self::Authorization => {
                "Warden, the expense auditor. Calm, observant, firm; states findings \
                 plainly and never alarms."
            }
            Self::Assistant => {
                "The project assistant. Helpful and concise; answers questions about \
                 projects, expenses, and budgets."
            }
        }
    }

    /// The agent a request should be forwarded to when it falls outside
    /// this one's table.
    pub fn sibling(&self) -> AgentKind {
        match self {
            Self::Receipts => Self::Authorization,
            Self::Authorization => Self::Receipts,
            Self::Assistant => Self::Authorization,
        }
    }
}

impl std::str::FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "receipts" | "scanner" => Ok(Self::Receipts),
            "authorization" | "warden" => Ok(Self::Authorization),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Unknown agent: {}", s)),
        }
    }
}

/// One callable function in an agent's table
#[derive(Debug, Clone)]
pub struct AgentFunction {
    pub name: &'static str,
    pub description: &'static str,
    /// (name, required, description)
    pub parameters: &'static [(&'static str, bool, &'static str)],
    /// Long-running functions get an acknowledgment message before work.
    pub long_running: bool,
}

const RECEIPTS_FUNCTIONS: &[AgentFunction] = &[
    AgentFunction {
        name: "process_receipt",
        description: "Run extraction and categorization on an uploaded receipt and create \
                      pending expenses from its line items.",
        parameters: &[("intake_id", true, "The receipt intake id")],
        long_running: true,
    },
    AgentFunction {
        name: "answer_missing_field",
        description: "Supply a field the extraction could not read (vendor, date, or total) \
                      for a receipt waiting in review, then retry expense creation.",
        parameters: &[
            ("intake_id", true, "The receipt intake id"),
            ("field", true, "vendor | date | total"),
            ("value", true, "The value the human provided"),
        ],
        long_running: true,
    },
    AgentFunction {
        name: "reject_intake",
        description: "Reject a receipt so it will never become expenses.",
        parameters: &[
            ("intake_id", true, "The receipt intake id"),
            ("reason", true, "Why it is rejected"),
        ],
        long_running: false,
    },
];

const AUTHORIZATION_FUNCTIONS: &[AgentFunction] = &[
    AgentFunction {
        name: "run_auto_auth",
        description: "Run the authorization engine over the project's pending expenses: \
                      authorize safe ones, flag duplicates, request missing info.",
        parameters: &[("project_id", false, "Defaults to the channel's project")],
        long_running: true,
    },
    AgentFunction {
        name: "explain_decision",
        description: "Explain why the engine authorized, flagged, or escalated an expense.",
        parameters: &[("expense_id", true, "The expense id")],
        long_running: false,
    },
    AgentFunction {
        name: "request_missing_info",
        description: "Ask the channel for specific missing fields on an expense.",
        parameters: &[
            ("expense_id", true, "The expense id"),
            ("fields", true, "Comma-separated field names"),
        ],
        long_running: false,
    },
];

const ASSISTANT_FUNCTIONS: &[AgentFunction] = &[
    AgentFunction {
        name: "fetch_project_summary",
        description: "Summarize a project's expenses by authorization state.",
        parameters: &[("project_id", false, "Defaults to the channel's project")],
        long_running: false,
    },
    AgentFunction {
        name: "fetch_expense_list",
        description: "List recent expenses, optionally filtered by status.",
        parameters: &[
            ("project_id", false, "Defaults to the channel's project"),
            ("status", false, "pending | authorized | review"),
        ],
        long_running: false,
    },
    AgentFunction {
        name: "fetch_budget_status",
        description: "Report authorized spend for a project as a budget proxy.",
        parameters: &[("project_id", false, "Defaults to the channel's project")],
        long_running: false,
    },
];

/// The function table for an agent.
pub fn functions(agent: AgentKind) -> &'static [AgentFunction] {
    match agent {
        AgentKind::Receipts => RECEIPTS_FUNCTIONS,
        AgentKind::Authorization => AUTHORIZATION_FUNCTIONS,
        AgentKind::Assistant => ASSISTANT_FUNCTIONS,
    }
}

pub fn get_function(agent: AgentKind, name: &str) -> Option<&'static AgentFunction> {
    functions(agent).iter().find(|f| f.name == name)
}

/// Render the function menu for the routing prompt.
pub fn format_for_llm(agent: AgentKind) -> String {
    let mut lines = Vec::new();
    for f in functions(agent) {
        lines.push(format!("- {}: {}", f.name, f.description));
        for (name, required, desc) in f.parameters {
            lines.push(format!(
                "    {} ({}): {}",
                name,
                if *required { "required" } else { "optional" },
                desc
            ));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_closed() {
        assert_eq!(functions(AgentKind::Receipts).len(), 3);
        assert_eq!(functions(AgentKind::Authorization).len(), 3);
        assert_eq!(functions(AgentKind::Assistant).len(), 3);
        assert!(get_function(AgentKind::Receipts, "process_receipt").is_some());
        assert!(get_function(AgentKind::Receipts, "run_auto_auth").is_none());
        assert!(get_function(AgentKind::Assistant, "fetch_budget_status").is_some());
    }

    #[test]
    fn test_agent_parse() {
        assert_eq!("scanner".parse::<AgentKind>().unwrap(), AgentKind::Receipts);
        assert_eq!(
            "authorization".parse::<AgentKind>().unwrap(),
            AgentKind::Authorization
        );
        assert!("nobody".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_menu_renders_parameters() {
        let menu = format_for_llm(AgentKind::Receipts);
        assert!(menu.contains("process_receipt"));
        assert!(menu.contains("intake_id (required)"));
    }
}
