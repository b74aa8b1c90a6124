//! Agent dispatcher
//!
//! The sole entry point for chat-driven actions. Each inbound event is
//! cooldown-checked, routed through the small model against the speaking
//! agent's function table, executed, and answered as a structured message.
//! Cross-agent forwards happen at most once per event. Cooldown and
//! attention-session maps are bounded (hard cap, oldest-half eviction) and
//! keyed by hashes so no PII sits in process memory.

pub mod registry;

pub use registry::AgentKind;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::{LlmBackend, LlmClient};
use crate::autoauth::AutoAuthEngine;
use crate::config::Config;
use crate::db::{Database, ExpenseFilter};
use crate::error::{Error, Result};
use crate::fingerprint::key_hash;
use crate::intake::IntakeService;
use crate::models::ExpenseStatus;

/// Hard cap on the cooldown and session maps.
const MAP_CAP: usize = 200;
/// Attention session inactivity TTL.
const SESSION_TTL: Duration = Duration::from_secs(300);
/// Follow-ups an attention session covers before expiring.
const SESSION_MAX_FOLLOWUPS: u32 = 5;

/// Phrases that close an attention session after one last reply.
const CLOSING_PHRASES: &[&str] = &[
    "ok", "okay", "thanks", "thank you", "got it", "perfect", "great", "noted", "understood",
    "all good", "that's all", "nothing else", "nevermind", "never mind",
];

/// An inbound chat event
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub user_id: Uuid,
    pub channel_key: String,
    pub project_id: Option<Uuid>,
    pub text: String,
    pub message_id: Option<Uuid>,
}

/// What the dispatcher did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Cooldown active; nothing ran and nothing was posted.
    Suppressed,
    /// A reply was posted.
    Posted(Uuid),
    /// No active session and no mention; the event was not for an agent.
    Ignored,
}

/// Receipt-flow dialog states owned by the receipt agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptFlowState {
    AwaitingFile,
    Extracting,
    AwaitingFields,
    Creating,
    Done,
    Failed,
}

struct AttentionSession {
    agent: AgentKind,
    last_activity: Instant,
    remaining: u32,
}

#[derive(Debug, Deserialize)]
struct RouteDecision {
    action: String,
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    arguments: serde_json::Value,
    #[serde(default)]
    ack_message: Option<String>,
    #[serde(default)]
    response: Option<String>,
}

pub struct AgentDispatcher {
    db: Database,
    llm: Option<LlmClient>,
    config: Config,
    intake: Arc<IntakeService>,
    engine: Arc<AutoAuthEngine>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    sessions: Mutex<HashMap<String, AttentionSession>>,
    flows: Mutex<HashMap<String, ReceiptFlowState>>,
}

impl AgentDispatcher {
    pub fn new(
        db: Database,
        llm: Option<LlmClient>,
        intake: Arc<IntakeService>,
        engine: Arc<AutoAuthEngine>,
        config: Config,
    ) -> Self {
        Self {
            db,
            llm,
            config,
            intake,
            engine,
            cooldowns: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Handle an explicit @mention of an agent.
    pub async fn dispatch(&self, agent: AgentKind, event: &InboundEvent) -> Result<DispatchOutcome> {
        // Bot-authored messages never trigger agents (loop prevention).
        if let Some(user) = self.db.get_user(event.user_id)? {
            if user.role == crate::models::Role::Bot {
                return Ok(DispatchOutcome::Ignored);
            }
        }

        if !self.check_cooldown(event.user_id, &event.channel_key, agent) {
            self.db.log_audit(
                event.user_id,
                "agent_suppressed",
                Some("agent"),
                Some(agent.name()),
                Some("cooldown active"),
            )?;
            info!(agent = agent.name(), "Cooldown active, event suppressed");
            return Ok(DispatchOutcome::Suppressed);
        }

        self.start_session(event.user_id, &event.channel_key, agent);
        self.route_and_execute(agent, event, false).await
    }

    /// Handle a message with no mention: routed only when the sender has an
    /// active attention session in this channel.
    pub async fn handle_followup(&self, event: &InboundEvent) -> Result<DispatchOutcome> {
        let Some(agent) = self.consume_session(event.user_id, &event.channel_key, &event.text)
        else {
            return Ok(DispatchOutcome::Ignored);
        };
        // Follow-ups skip the cooldown: the session already throttles them.
        self.route_and_execute(agent, event, false).await
    }

    /// Current receipt-flow state for a (user, channel), if a flow is open.
    pub fn flow_state(&self, user_id: Uuid, channel_key: &str) -> Option<ReceiptFlowState> {
        let key = key_hash(&[&user_id.to_string(), channel_key]);
        self.flows.lock().unwrap().get(&key).copied()
    }

    async fn route_and_execute(
        &self,
        agent: AgentKind,
        event: &InboundEvent,
        forwarded: bool,
    ) -> Result<DispatchOutcome> {
        let Some(llm) = &self.llm else {
            let id = self.post_reply(agent, event, "Agents are offline right now.", None)?;
            return Ok(DispatchOutcome::Posted(id));
        };

        let context = self.db.recent_messages(&event.channel_key, 6)?;
        let context_lines: Vec<String> = context
            .iter()
            .map(|m| format!("{}: {}", m.author_id, truncate(&m.body, 120)))
            .collect();

        let system = format!(
            "You are {}.\n\nYour functions:\n{}\n\n\
             Decide what to do with the user's message. Return ONLY JSON:\n\
             {{\"action\": \"function_call\", \"function\": \"<name>\", \
             \"arguments\": {{...}}, \"ack_message\": \"<short ack>\"}}\n\
             or {{\"action\": \"free_chat\", \"response\": \"<reply in persona>\"}}\n\
             or {{\"action\": \"cross_agent\", \"response\": \"<why>\"}} when the \
             request belongs to another agent.",
            agent.persona(),
            registry::format_for_llm(agent),
        );
        let user = format!(
            "Channel: {}\nRecent conversation:\n{}\n\nUser message: {}",
            event.channel_key,
            context_lines.join("\n"),
            event.text
        );

        let decision: RouteDecision = match llm.classify_small("agent_route", &system, &user).await
        {
            Ok(reply) => match serde_json::from_value(reply.value) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "Routing reply did not match schema");
                    let id = self.post_reply(
                        agent,
                        event,
                        "I didn't catch that. Could you rephrase?",
                        None,
                    )?;
                    return Ok(DispatchOutcome::Posted(id));
                }
            },
            Err(e) => {
                warn!(error = %e, "Routing call failed");
                let id = self.post_reply(
                    agent,
                    event,
                    "I couldn't process that just now. Try again in a moment.",
                    None,
                )?;
                return Ok(DispatchOutcome::Posted(id));
            }
        };

        match decision.action.as_str() {
            "function_call" => {
                let Some(name) = decision.function.as_deref() else {
                    let id =
                        self.post_reply(agent, event, "No function selected.", None)?;
                    return Ok(DispatchOutcome::Posted(id));
                };
                let Some(function) = registry::get_function(agent, name) else {
                    let id = self.post_reply(
                        agent,
                        event,
                        &format!("'{}' is outside what I can do.", name),
                        None,
                    )?;
                    return Ok(DispatchOutcome::Posted(id));
                };

                if function.long_running {
                    if let Some(ack) = decision.ack_message.as_deref() {
                        let _ = self.post_reply(agent, event, ack, None);
                    }
                }

                let body = self
                    .execute_function(agent, name, &decision.arguments, event)
                    .await
                    .unwrap_or_else(|e| format!("That didn't work: {}", e));
                let metadata = json!({"agent": agent.name(), "function": name});
                let id = self.post_reply(agent, event, &body, Some(metadata))?;
                Ok(DispatchOutcome::Posted(id))
            }
            "cross_agent" if !forwarded => {
                // Forward once; the sibling sees the same event.
                let sibling = agent.sibling();
                info!(
                    from = agent.name(),
                    to = sibling.name(),
                    "Cross-agent forward"
                );
                Box::pin(self.route_and_execute(sibling, event, true)).await
            }
            "cross_agent" => {
                // Already forwarded once; answer instead of looping.
                let id = self.post_reply(
                    agent,
                    event,
                    "Neither of us can take that one. A human should look at it.",
                    None,
                )?;
                Ok(DispatchOutcome::Posted(id))
            }
            _ => {
                let body = decision
                    .response
                    .unwrap_or_else(|| "Happy to help with receipts and expenses.".into());
                let id = self.post_reply(agent, event, &body, None)?;
                Ok(DispatchOutcome::Posted(id))
            }
        }
    }

    async fn execute_function(
        &self,
        agent: AgentKind,
        name: &str,
        args: &serde_json::Value,
        event: &InboundEvent,
    ) -> Result<String> {
        let flow_key = key_hash(&[&event.user_id.to_string(), &event.channel_key]);
        let arg_str = |key: &str| -> Option<String> {
            args.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let arg_uuid = |key: &str| -> Result<Uuid> {
            arg_str(key)
                .and_then(|s| Uuid::parse_str(&s).ok())
                .ok_or_else(|| Error::Validation(format!("Missing or invalid '{}'", key)))
        };
        let project = || -> Result<Uuid> {
            arg_str("project_id")
                .and_then(|s| Uuid::parse_str(&s).ok())
                .or(event.project_id)
                .ok_or_else(|| Error::Validation("No project in scope".into()))
        };

        match (agent, name) {
            (AgentKind::Receipts, "process_receipt") => {
                let intake_id = arg_uuid("intake_id")?;
                self.set_flow(&flow_key, ReceiptFlowState::Extracting);
                match self.intake.process(intake_id).await {
                    Ok(outcome) => {
                        use crate::models::IntakeStatus::*;
                        let state = match outcome.status {
                            Linked => ReceiptFlowState::Done,
                            CheckReview => ReceiptFlowState::AwaitingFields,
                            _ => ReceiptFlowState::Failed,
                        };
                        self.set_flow(&flow_key, state);
                        let mut body = format!(
                            "Receipt {}: {} - {} expense(s) created, {} skipped.",
                            intake_id,
                            outcome.status,
                            outcome.created,
                            outcome.skipped
                        );
                        if !outcome.reasons.is_empty() {
                            body.push_str(&format!("\n{}", outcome.reasons.join("\n")));
                        }
                        Ok(body)
                    }
                    Err(e) => {
                        self.set_flow(&flow_key, ReceiptFlowState::Failed);
                        Err(e)
                    }
                }
            }
            (AgentKind::Receipts, "answer_missing_field") => {
                let intake_id = arg_uuid("intake_id")?;
                let field = arg_str("field")
                    .ok_or_else(|| Error::Validation("Missing 'field'".into()))?;
                let value = arg_str("value")
                    .ok_or_else(|| Error::Validation("Missing 'value'".into()))?;
                self.set_flow(&flow_key, ReceiptFlowState::Creating);
                let outcome = self
                    .intake
                    .answer_missing_field(intake_id, &field, &value)
                    .await?;
                let state = if outcome.status == crate::models::IntakeStatus::Linked {
                    ReceiptFlowState::Done
                } else {
                    ReceiptFlowState::AwaitingFields
                };
                self.set_flow(&flow_key, state);
                Ok(format!(
                    "Applied {}={}. Receipt {} is now {} ({} created, {} skipped).",
                    field, value, intake_id, outcome.status, outcome.created, outcome.skipped
                ))
            }
            (AgentKind::Receipts, "reject_intake") => {
                let intake_id = arg_uuid("intake_id")?;
                let reason = arg_str("reason").unwrap_or_else(|| "Rejected via chat".into());
                self.intake.reject(intake_id, &reason)?;
                self.set_flow(&flow_key, ReceiptFlowState::Done);
                Ok(format!("Receipt {} rejected: {}", intake_id, reason))
            }
            (AgentKind::Authorization, "run_auto_auth") => {
                let project_id = project()?;
                let outcome = self.engine.run(project_id, None, false).await?;
                Ok(format!(
                    "Run complete: {} authorized (${}), {} duplicates, {} need info, {} escalated.",
                    outcome.summary.authorized,
                    outcome.summary.authorized_amount,
                    outcome.summary.duplicates,
                    outcome.summary.missing_info,
                    outcome.summary.escalated,
                ))
            }
            (AgentKind::Authorization, "explain_decision") => {
                let expense_id = arg_uuid("expense_id")?;
                Ok(self
                    .engine
                    .explain_decision(expense_id)?
                    .unwrap_or_else(|| "I haven't made a decision on that expense.".into()))
            }
            (AgentKind::Authorization, "request_missing_info") => {
                let expense_id = arg_uuid("expense_id")?;
                let fields: Vec<String> = arg_str("fields")
                    .unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if fields.is_empty() {
                    return Err(Error::Validation("No fields named".into()));
                }
                let project_id = project()?;
                self.db
                    .track_pending_info(expense_id, project_id, &fields, event.message_id)?;
                Ok(format!(
                    "Noted. Expense {} is waiting on: {}.",
                    expense_id,
                    fields.join(", ")
                ))
            }
            (AgentKind::Assistant, "fetch_project_summary") => {
                let project_id = project()?;
                let summary = self.db.summarize_by_status(&ExpenseFilter {
                    project_id: Some(project_id),
                    ..Default::default()
                })?;
                Ok(format!(
                    "Pending: {} (${}) | Authorized: {} (${}) | In review: {} (${})",
                    summary.pending.count,
                    summary.pending.total,
                    summary.authorized.count,
                    summary.authorized.total,
                    summary.review.count,
                    summary.review.total,
                ))
            }
            (AgentKind::Assistant, "fetch_expense_list") => {
                let project_id = project()?;
                let status = arg_str("status").and_then(|s| s.parse::<ExpenseStatus>().ok());
                let page = self.db.list_expenses(
                    &ExpenseFilter {
                        project_id: Some(project_id),
                        status,
                        ..Default::default()
                    },
                    0,
                    10,
                )?;
                if page.items.is_empty() {
                    return Ok("No matching expenses.".into());
                }
                let mut lines = vec![format!("{} expense(s):", page.total)];
                for e in &page.items {
                    lines.push(format!(
                        "- {} | ${} | {} | {}",
                        e.txn_date,
                        e.amount,
                        e.status,
                        truncate(&e.description, 50)
                    ));
                }
                Ok(lines.join("\n"))
            }
            (AgentKind::Assistant, "fetch_budget_status") => {
                let project_id = project()?;
                let summary = self.db.summarize_by_status(&ExpenseFilter {
                    project_id: Some(project_id),
                    ..Default::default()
                })?;
                Ok(format!(
                    "Authorized spend to date: ${} across {} expenses; ${} more pending.",
                    summary.authorized.total, summary.authorized.count, summary.pending.total,
                ))
            }
            _ => Err(Error::Validation(format!(
                "Function '{}' not in {}'s table",
                name,
                agent.name()
            ))),
        }
    }

    fn post_reply(
        &self,
        agent: AgentKind,
        event: &InboundEvent,
        body: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Uuid> {
        let bot = self.db.bot_user_id()?;
        let text = format!("**{}**: {}", agent.display_name(), body);
        self.db.post_message(
            &event.channel_key,
            bot,
            &text,
            None,
            metadata.as_ref(),
            event.message_id,
            &[],
        )
    }

    /// True when the user may invoke this agent (and stamps the attempt).
    fn check_cooldown(&self, user_id: Uuid, channel_key: &str, agent: AgentKind) -> bool {
        let key = key_hash(&[&user_id.to_string(), channel_key, agent.name()]);
        let mut cooldowns = self.cooldowns.lock().unwrap();
        let now = Instant::now();

        if let Some(last) = cooldowns.get(&key) {
            if now.duration_since(*last) < Duration::from_secs(self.config.cooldown_seconds) {
                return false;
            }
        }

        if cooldowns.len() >= MAP_CAP {
            evict_oldest_half(&mut cooldowns, |v| *v);
        }
        cooldowns.insert(key, now);
        true
    }

    fn start_session(&self, user_id: Uuid, channel_key: &str, agent: AgentKind) {
        let key = key_hash(&[&user_id.to_string(), channel_key]);
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= MAP_CAP {
            evict_oldest_half(&mut sessions, |s| s.last_activity);
        }
        sessions.insert(
            key,
            AttentionSession {
                agent,
                last_activity: Instant::now(),
                remaining: SESSION_MAX_FOLLOWUPS,
            },
        );
    }

    fn consume_session(
        &self,
        user_id: Uuid,
        channel_key: &str,
        text: &str,
    ) -> Option<AgentKind> {
        let key = key_hash(&[&user_id.to_string(), channel_key]);
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&key)?;

        if session.last_activity.elapsed() > SESSION_TTL || session.remaining == 0 {
            sessions.remove(&key);
            return None;
        }

        session.last_activity = Instant::now();
        session.remaining -= 1;

        let normalized = text
            .trim()
            .to_lowercase()
            .trim_end_matches(['.', '!', '?', ','])
            .to_string();
        if CLOSING_PHRASES.contains(&normalized.as_str()) {
            // Route this last message, then the session is spent.
            session.remaining = 0;
        }

        Some(session.agent)
    }

    fn set_flow(&self, key: &str, state: ReceiptFlowState) {
        let mut flows = self.flows.lock().unwrap();
        if flows.len() >= MAP_CAP {
            flows.clear();
        }
        flows.insert(key.to_string(), state);
    }
}

fn evict_oldest_half<V>(map: &mut HashMap<String, V>, stamp: impl Fn(&V) -> Instant) {
    let mut entries: Vec<(String, Instant)> =
        map.iter().map(|(k, v)| (k.clone(), stamp(v))).collect();
    entries.sort_by_key(|(_, t)| *t);
    for (key, _) in entries.iter().take(entries.len() / 2) {
        map.remove(key);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categorize::CategorizationEngine;
    use crate::classifier::Classifier;
    use crate::models::Role;
    use crate::ocr::OcrPipeline;

    fn dispatcher(db: &Database, llm: LlmClient) -> AgentDispatcher {
        let mut config = Config::default();
        config.blob_dir = std::env::temp_dir().join(format!("sb_agent_{}", Uuid::new_v4()));
        let classifier = Arc::new(Classifier::new(6));
        let ocr = OcrPipeline::new(db.clone(), Some(llm.clone()), config.clone());
        let categorizer = CategorizationEngine::new(
            db.clone(),
            Some(llm.clone()),
            classifier,
            config.clone(),
        );
        let intake = Arc::new(IntakeService::new(
            db.clone(),
            ocr,
            categorizer,
            config.clone(),
        ));
        let engine = Arc::new(AutoAuthEngine::new(db.clone(), config.clone()));
        AgentDispatcher::new(db.clone(), Some(llm), intake, engine, config)
    }

    fn event(user: Uuid, project: Uuid, text: &str) -> InboundEvent {
        InboundEvent {
            user_id: user,
            channel_key: format!("project_general:{}", project),
            project_id: Some(project),
            text: text.to_string(),
            message_id: None,
        }
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_second_mention() {
        let db = Database::in_memory().unwrap();
        let llm = LlmClient::mock();
        llm.as_mock()
            .unwrap()
            .push_response("agent_route", json!({"action": "free_chat", "response": "Hello."}));
        let dispatcher = dispatcher(&db, llm.clone());
        let user = db
            .create_user("u@example.com", "U", Role::ProjectManager, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();
        let ev = event(user, project, "@warden hello");

        let first = dispatcher
            .dispatch(AgentKind::Authorization, &ev)
            .await
            .unwrap();
        assert!(matches!(first, DispatchOutcome::Posted(_)));

        // two seconds later (well under the 5s default) -> suppressed,
        // no model call, no message
        let calls_before = llm.as_mock().unwrap().calls().len();
        let second = dispatcher
            .dispatch(AgentKind::Authorization, &ev)
            .await
            .unwrap();
        assert_eq!(second, DispatchOutcome::Suppressed);
        assert_eq!(llm.as_mock().unwrap().calls().len(), calls_before);

        // suppression is audit-logged
        let audit = db.list_audit_log(10).unwrap();
        assert!(audit.iter().any(|(_, _, action, _, _)| action == "agent_suppressed"));
    }

    #[tokio::test]
    async fn test_function_call_runs_auto_auth() {
        let db = Database::in_memory().unwrap();
        let llm = LlmClient::mock();
        llm.as_mock().unwrap().push_response(
            "agent_route",
            json!({"action": "function_call", "function": "run_auto_auth",
                   "arguments": {}, "ack_message": "On it."}),
        );
        let dispatcher = dispatcher(&db, llm);
        let user = db
            .create_user("pm@example.com", "PM", Role::ProjectManager, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();

        let outcome = dispatcher
            .dispatch(AgentKind::Authorization, &event(user, project, "@warden run it"))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Posted(_)));

        let msgs = db
            .recent_messages(&format!("project_general:{}", project), 10)
            .unwrap();
        // ack + result
        assert!(msgs.iter().any(|m| m.body.contains("On it.")));
        assert!(msgs.iter().any(|m| m.body.contains("Run complete")));
    }

    #[tokio::test]
    async fn test_cross_agent_forwards_at_most_once() {
        let db = Database::in_memory().unwrap();
        let llm = LlmClient::mock();
        let mock = llm.as_mock().unwrap();
        // both agents punt -> loop guard answers instead of a third hop
        mock.push_response("agent_route", json!({"action": "cross_agent"}));
        mock.push_response("agent_route", json!({"action": "cross_agent"}));
        let dispatcher = dispatcher(&db, llm.clone());
        let user = db
            .create_user("u@example.com", "U", Role::ProjectManager, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();

        let outcome = dispatcher
            .dispatch(AgentKind::Receipts, &event(user, project, "@scanner who am i"))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Posted(_)));
        // exactly two routing calls: original + one forward
        assert_eq!(llm.as_mock().unwrap().calls().len(), 2);
    }

    #[tokio::test]
    async fn test_attention_session_followups() {
        let db = Database::in_memory().unwrap();
        let llm = LlmClient::mock();
        let mock = llm.as_mock().unwrap();
        mock.push_response("agent_route", json!({"action": "free_chat", "response": "Hi."}));
        mock.push_response("agent_route", json!({"action": "free_chat", "response": "Sure."}));
        let dispatcher = dispatcher(&db, llm);
        let user = db
            .create_user("u@example.com", "U", Role::ProjectManager, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();

        dispatcher
            .dispatch(AgentKind::Assistant, &event(user, project, "@assistant hello"))
            .await
            .unwrap();

        // follow-up without a mention routes to the same agent
        let outcome = dispatcher
            .handle_followup(&event(user, project, "and the budget?"))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Posted(_)));

        // a different user has no session
        let other = db
            .create_user("o@example.com", "O", Role::ProjectManager, None)
            .unwrap();
        let outcome = dispatcher
            .handle_followup(&event(other, project, "me too"))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_closing_phrase_ends_session() {
        let db = Database::in_memory().unwrap();
        let llm = LlmClient::mock();
        let mock = llm.as_mock().unwrap();
        mock.push_response("agent_route", json!({"action": "free_chat", "response": "Hi."}));
        mock.push_response("agent_route", json!({"action": "free_chat", "response": "Bye."}));
        let dispatcher = dispatcher(&db, llm);
        let user = db
            .create_user("u@example.com", "U", Role::ProjectManager, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();

        dispatcher
            .dispatch(AgentKind::Assistant, &event(user, project, "@assistant hello"))
            .await
            .unwrap();

        // the closing phrase still routes (agent may say goodbye)...
        let outcome = dispatcher
            .handle_followup(&event(user, project, "thanks!"))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Posted(_)));

        // ...but the session is spent afterwards
        let outcome = dispatcher
            .handle_followup(&event(user, project, "one more thing"))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_bot_messages_ignored() {
        let db = Database::in_memory().unwrap();
        let dispatcher = dispatcher(&db, LlmClient::mock());
        let bot = db.bot_user_id().unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();

        let outcome = dispatcher
            .dispatch(AgentKind::Assistant, &event(bot, project, "@assistant loop?"))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_unknown_function_rejected() {
        let db = Database::in_memory().unwrap();
        let llm = LlmClient::mock();
        llm.as_mock().unwrap().push_response(
            "agent_route",
            json!({"action": "function_call", "function": "drop_all_tables", "arguments": {}}),
        );
        let dispatcher = dispatcher(&db, llm);
        let user = db
            .create_user("u@example.com", "U", Role::ProjectManager, None)
            .unwrap();
        let project = db.upsert_project("Maple St", "Framing").unwrap();

        dispatcher
            .dispatch(AgentKind::Receipts, &event(user, project, "@scanner nuke it"))
            .await
            .unwrap();
        let msgs = db
            .recent_messages(&format!("project_general:{}", project), 5)
            .unwrap();
        assert!(msgs.iter().any(|m| m.body.contains("outside what I can do")));
    }
}
