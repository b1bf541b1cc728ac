//! Engine construction and the session API
//!
//! The engine holds only immutable definitions and collaborators. All
//! conversation state travels in the [`SessionContext`] the host passes in
//! and receives back on every call.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_core::{AiCallback, ContextEntry, Engine};
//!
//! let engine = Engine::builder()
//!     .flows(flows)
//!     .ai_client(AiCallback::new(|system, user| async move { my_model(system, user).await }))
//!     .build()?;
//!
//! let session = engine.init_session("user-1", None);
//! let outcome = engine.update_activity(ContextEntry::user("hi"), session).await?;
//! ```

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn, Instrument, Span};

use crate::collaborators::{
    AiClient, ApprovedFunction, FlowValidator, LocalFunctionInvoker, ReferenceValidator,
    ToolInvoker,
};
use crate::config::{Config, EngineSettings};
use crate::error::{EngineError, EngineResult};
use crate::executor::exec_loop::ExecContext;
use crate::executor::interruption::{activate_from_input, handle_active_input};
use crate::expression::Evaluator;
use crate::flows::{FlowDefinition, FlowLibrary, ToolDefinition, ToolRegistry};
use crate::messages::MessageRegistry;
use crate::session::{SessionContext, Variables};
use crate::types::{ContextEntry, Role};

/// What one `update_activity` call produced
#[derive(Debug, Clone)]
pub struct ActivityOutcome {
    /// Text for the user, if the turn produced any
    pub response: Option<String>,
    /// The new source of truth for this conversation
    pub session: SessionContext,
}

/// The flow interpreter
pub struct Engine {
    pub(crate) flows: FlowLibrary,
    pub(crate) tools: ToolRegistry,
    pub(crate) ai: Arc<dyn AiClient>,
    pub(crate) invoker: Arc<dyn ToolInvoker>,
    pub(crate) messages: MessageRegistry,
    pub(crate) evaluator: Evaluator,
    pub(crate) settings: EngineSettings,
    global_variables: Variables,
    span: Span,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("flows", &self.flows.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn flows(&self) -> &FlowLibrary {
        &self.flows
    }

    /// Create an idle session seeded with the engine's global variables
    pub fn init_session(&self, user_id: &str, session_id: Option<String>) -> SessionContext {
        let session = SessionContext::new(user_id, session_id, self.global_variables.clone());
        info!(parent: &self.span, session_id = %session.session_id, user_id, "Session created");
        session
    }

    /// Feed one conversation entry into the session.
    ///
    /// `user` entries drive flows; `assistant` entries are only recorded.
    /// Any other role is rejected.
    pub async fn update_activity(
        &self,
        entry: ContextEntry,
        mut session: SessionContext,
    ) -> EngineResult<ActivityOutcome> {
        let span = info_span!(
            parent: &self.span,
            "update_activity",
            session_id = %session.session_id,
            user_id = %session.user_id,
        );
        let response = self
            .process_entry(entry, &mut session)
            .instrument(span)
            .await?;
        session.touch();
        Ok(ActivityOutcome { response, session })
    }

    async fn process_entry(
        &self,
        entry: ContextEntry,
        session: &mut SessionContext,
    ) -> EngineResult<Option<String>> {
        match entry.role {
            Role::User => {}
            Role::Assistant => {
                record_passive(session, entry);
                return Ok(None);
            }
            role => return Err(EngineError::InvalidRole(role.to_string())),
        }
        session.validate()?;

        let input = entry.content.clone();
        session.last_chat_turn = Some(entry.clone());

        if let Some(frame) = session.flow_stacks.current_frame_mut() {
            frame.record(entry);
            let mut ctx = ExecContext::new(self, session, Some(input));
            return handle_active_input(&mut ctx).await;
        }

        session.history.push(entry);
        let mut ctx = ExecContext::new(self, session, Some(input.clone()));
        match activate_from_input(&mut ctx, &input).await? {
            Some(response) => Ok(response),
            None => {
                info!("No flow matched the input");
                Ok(None)
            }
        }
    }

    /// Call the AI collaborator, bounded by the configured timeout
    pub(crate) async fn ask_ai(&self, instruction: &str, message: &str) -> anyhow::Result<String> {
        let limit = Duration::from_millis(self.settings.ai_timeout_ms);
        match tokio::time::timeout(limit, self.ai.complete(instruction, message)).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(timeout_ms = self.settings.ai_timeout_ms, "AI call timed out");
                anyhow::bail!("AI call timed out after {}ms", self.settings.ai_timeout_ms)
            }
        }
    }
}

/// Assistant turns are appended to the active frame's trail or, when idle,
/// to the session history. Flow state is never touched.
fn record_passive(session: &mut SessionContext, entry: ContextEntry) {
    match session.flow_stacks.current_frame_mut() {
        Some(frame) => frame.record(entry),
        None => {
            session.last_chat_turn = Some(entry.clone());
            session.history.push(entry);
        }
    }
}

/* ===================== Builder ===================== */

/// Builder for [`Engine`]
pub struct EngineBuilder {
    flows: Vec<FlowDefinition>,
    library: Option<FlowLibrary>,
    tools: Vec<ToolDefinition>,
    ai: Option<Arc<dyn AiClient>>,
    invoker: Option<Arc<dyn ToolInvoker>>,
    functions: BTreeMap<String, ApprovedFunction>,
    messages: MessageRegistry,
    settings: EngineSettings,
    language: Option<String>,
    global_variables: Variables,
    validate_on_init: bool,
    validator: Arc<dyn FlowValidator>,
    span: Option<Span>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            flows: Vec::new(),
            library: None,
            tools: Vec::new(),
            ai: None,
            invoker: None,
            functions: BTreeMap::new(),
            messages: MessageRegistry::default(),
            settings: EngineSettings::default(),
            language: None,
            global_variables: Variables::new(),
            validate_on_init: false,
            validator: Arc::new(ReferenceValidator),
            span: None,
        }
    }

    /// Flow definitions to add to the library
    pub fn flows(mut self, flows: Vec<FlowDefinition>) -> Self {
        self.flows.extend(flows);
        self
    }

    /// Start from an already loaded library
    pub fn flow_library(mut self, library: FlowLibrary) -> Self {
        self.library = Some(library);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// The required AI collaborator
    pub fn ai_client(mut self, client: impl AiClient + 'static) -> Self {
        self.ai = Some(Arc::new(client));
        self
    }

    /// Replace the default local-function invoker
    pub fn tool_invoker(mut self, invoker: impl ToolInvoker + 'static) -> Self {
        self.invoker = Some(Arc::new(invoker));
        self
    }

    /// Register a function local tools may run
    pub fn approved_function<F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<JsonValue, crate::collaborators::ToolError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn messages(mut self, messages: MessageRegistry) -> Self {
        self.messages = messages;
        self
    }

    pub fn global_variables(mut self, variables: Variables) -> Self {
        self.global_variables = variables;
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Take engine settings from a loaded [`Config`]
    pub fn config(self, config: &Config) -> Self {
        self.settings(config.engine.clone())
    }

    pub fn validate_on_init(mut self, validate: bool) -> Self {
        self.validate_on_init = validate;
        self
    }

    pub fn validator(mut self, validator: impl FlowValidator + 'static) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Parent span for everything the engine logs
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let ai = self.ai.ok_or(EngineError::MissingAiClient)?;

        let mut flows = self.library.unwrap_or_default();
        for definition in self.flows {
            flows.insert(definition)?;
        }
        let tools = ToolRegistry::new(self.tools)?;

        if self.validate_on_init {
            let problems = self.validator.validate(&flows, &tools);
            if !problems.is_empty() {
                return Err(EngineError::Validation(problems));
            }
        }

        let mut settings = self.settings;
        if let Some(language) = self.language {
            settings.language = language;
        }
        let invoker: Arc<dyn ToolInvoker> = match self.invoker {
            Some(invoker) => invoker,
            None => Arc::new(LocalFunctionInvoker::with_functions(self.functions)),
        };
        let span = self
            .span
            .unwrap_or_else(|| info_span!("engine", language = %settings.language));

        info!(
            parent: &span,
            flows = flows.len(),
            tools = tools.iter().count(),
            "Engine ready"
        );

        Ok(Engine {
            flows,
            tools,
            ai,
            invoker,
            messages: self.messages,
            evaluator: Evaluator::new(settings.max_template_depth),
            settings,
            global_variables: self.global_variables,
            span,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
