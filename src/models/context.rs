// Isolation context - the (tenant, agent, platform, chat stream) scope key
// Every other component keys its caches off the values defined here

//! # Isolation Context
//!
//! An [`IsolationContext`] names the scope an instance lives in. Two contexts
//! with equal fields compare and hash equal, so they can be used directly as
//! map keys.
//!
//! ```text
//!   tenant ─┬─ agent ─┬─ platform? ─┬─ chat_stream?
//!           │         │             │
//!        Tenant     Agent       Platform        Chat     (IsolationLevel)
//! ```
//!
//! Instance keys are derived by [`instance_key`], which is a pure function of
//! its inputs: `type:tenant:agent[:chat_stream|:platform]`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, RuntimeError};

/// How narrow an isolation context is
///
/// Variants are declared from broadest to narrowest so that the derived
/// ordering matches specificity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Tenant,
    Agent,
    Platform,
    Chat,
}

/// Immutable isolation scope identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsolationContext {
    /// Tenant identifier (T)
    pub tenant_id: String,

    /// Agent identifier (A)
    pub agent_id: String,

    /// Platform identifier (P)
    pub platform: Option<String>,

    /// Chat stream identifier (C)
    pub chat_stream_id: Option<String>,
}

impl IsolationContext {
    pub fn new<T: Into<String>, A: Into<String>>(tenant_id: T, agent_id: A) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            agent_id: agent_id.into(),
            platform: None,
            chat_stream_id: None,
        }
    }

    /// Builder-style platform setter
    pub fn with_platform<S: Into<String>>(mut self, platform: S) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Builder-style chat stream setter
    pub fn with_chat_stream<S: Into<String>>(mut self, chat_stream_id: S) -> Self {
        self.chat_stream_id = Some(chat_stream_id.into());
        self
    }

    /// Build a context from optional parts, treating empty strings as absent
    pub fn from_parts(
        tenant_id: &str,
        agent_id: &str,
        platform: Option<&str>,
        chat_stream_id: Option<&str>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            agent_id: agent_id.to_string(),
            platform: non_empty(platform),
            chat_stream_id: non_empty(chat_stream_id),
        }
    }

    /// Most specific level this context describes
    pub fn level(&self) -> IsolationLevel {
        if self.chat_stream_id.is_some() {
            IsolationLevel::Chat
        } else if self.platform.is_some() {
            IsolationLevel::Platform
        } else if !self.agent_id.is_empty() {
            IsolationLevel::Agent
        } else {
            IsolationLevel::Tenant
        }
    }

    /// Scope string `tenant:agent[:platform][:chat_stream]`
    pub fn scope(&self) -> IsolationScope {
        IsolationScope {
            tenant_id: self.tenant_id.clone(),
            agent_id: self.agent_id.clone(),
            platform: self.platform.clone(),
            chat_stream_id: self.chat_stream_id.clone(),
        }
    }

    /// Derive a narrower context that keeps this context's tenant and agent
    ///
    /// The parent's platform is inherited when none is given; the chat stream
    /// is always taken from the argument.
    pub fn sub_context(&self, platform: Option<&str>, chat_stream_id: Option<&str>) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            agent_id: self.agent_id.clone(),
            platform: non_empty(platform).or_else(|| self.platform.clone()),
            chat_stream_id: non_empty(chat_stream_id),
        }
    }

    /// Cache key for an instance of `instance_type` in this scope
    pub fn instance_key(&self, instance_type: &str) -> String {
        instance_key(
            instance_type,
            &self.tenant_id,
            &self.agent_id,
            self.chat_stream_id.as_deref(),
            self.platform.as_deref(),
        )
    }

    /// Chat-level bucket used by the nested cache (`global` when unscoped)
    pub fn chat_scope(&self) -> &str {
        self.chat_stream_id.as_deref().unwrap_or(GLOBAL_CHAT_SCOPE)
    }

    /// Prefix an identifier with this context's scope
    pub fn isolated_id(&self, base_id: &str, prefix: Option<&str>) -> String {
        match prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}:{}:{}", prefix, self.scope(), base_id),
            _ => format!("{}:{}", self.scope(), base_id),
        }
    }

    /// Whether this context is at least as specific as `required`
    pub fn satisfies(&self, required: IsolationLevel) -> bool {
        self.level() >= required
    }

    pub fn can_access_tenant(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }

    /// Check access to an agent addressed as `tenant:agent`
    pub fn can_access_agent(&self, qualified_agent: &str) -> bool {
        match qualified_agent.split_once(':') {
            Some((tenant, agent)) => self.tenant_id == tenant && self.agent_id == agent,
            None => false,
        }
    }
}

impl fmt::Display for IsolationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scope())
    }
}

/// Chat bucket name used when no chat stream is set
pub const GLOBAL_CHAT_SCOPE: &str = "global";

/// Parsed form of a scope string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsolationScope {
    pub tenant_id: String,
    pub agent_id: String,
    pub platform: Option<String>,
    pub chat_stream_id: Option<String>,
}

impl IsolationScope {
    /// Parse `tenant:agent[:platform][:chat_stream]`
    pub fn parse(scope: &str) -> Result<Self> {
        let parts: Vec<&str> = scope.split(':').collect();
        if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(RuntimeError::InvalidInput(format!(
                "scope '{}' needs at least tenant_id and agent_id",
                scope
            )));
        }

        Ok(Self {
            tenant_id: parts[0].to_string(),
            agent_id: parts[1].to_string(),
            platform: parts.get(2).and_then(|p| non_empty(Some(p))),
            chat_stream_id: parts.get(3).and_then(|c| non_empty(Some(c))),
        })
    }

    pub fn into_context(self) -> IsolationContext {
        IsolationContext {
            tenant_id: self.tenant_id,
            agent_id: self.agent_id,
            platform: self.platform,
            chat_stream_id: self.chat_stream_id,
        }
    }
}

impl fmt::Display for IsolationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tenant_id, self.agent_id)?;
        if let Some(platform) = &self.platform {
            write!(f, ":{}", platform)?;
        }
        if let Some(chat) = &self.chat_stream_id {
            write!(f, ":{}", chat)?;
        }
        Ok(())
    }
}

/// Derive the cache key `type:tenant:agent[:chat_stream|:platform]`
///
/// The chat stream wins over the platform when both are present.
pub fn instance_key(
    instance_type: &str,
    tenant_id: &str,
    agent_id: &str,
    chat_stream_id: Option<&str>,
    platform: Option<&str>,
) -> String {
    let mut key = format!("{}:{}:{}", instance_type, tenant_id, agent_id);
    if let Some(chat) = chat_stream_id.filter(|c| !c.is_empty()) {
        key.push(':');
        key.push_str(chat);
    } else if let Some(platform) = platform.filter(|p| !p.is_empty()) {
        key.push(':');
        key.push_str(platform);
    }
    key
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(|v| v.to_string())
}
