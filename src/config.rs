use serde::{Deserialize, Serialize};

/// How a confirmed save is written back to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// Unconditional update keyed by record id. Concurrent saves race and
    /// the last one wins.
    #[default]
    LastWriteWins,
    /// The update only applies if the stored `updated_at` still equals the
    /// value read when the record was loaded.
    ExpectUpdatedAt,
}

/// What entering edit mode does when the record lock is not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Warn and continue with an unprotected edit.
    #[default]
    Advisory,
    /// Refuse to enter edit mode.
    Required,
}

/// Edit session configuration
///
/// Built with chained setters or read from JSON:
///
/// ```
/// use compliancedesk::{ConcurrencyMode, EditConfig};
///
/// let config = EditConfig::new()
///     .concurrency(ConcurrencyMode::ExpectUpdatedAt)
///     .history_page_size(50);
/// assert!(config.validate().is_ok());
///
/// let parsed = EditConfig::from_json(r#"{ "lock_policy": "required" }"#).unwrap();
/// assert!(parsed.require_reason);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditConfig {
    /// Write strategy for confirmed saves
    pub concurrency: ConcurrencyMode,

    /// Behaviour when the lock is held by someone else
    pub lock_policy: LockPolicy,

    /// Whether a non-blank reason is needed to confirm a save
    pub require_reason: bool,

    /// Marker shown for null or missing values in formatted changes
    pub empty_marker: String,

    /// Maximum number of history entries returned by a listing
    pub history_page_size: Option<usize>,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyMode::LastWriteWins,
            lock_policy: LockPolicy::Advisory,
            require_reason: true,
            empty_marker: "None".to_string(),
            history_page_size: None,
        }
    }
}

impl EditConfig {
    /// Create a configuration with the default (observed) behaviour
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the save write strategy
    pub fn concurrency(mut self, mode: ConcurrencyMode) -> Self {
        self.concurrency = mode;
        self
    }

    /// Set the lock policy
    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Set whether a save reason is mandatory
    pub fn require_reason(mut self, required: bool) -> Self {
        self.require_reason = required;
        self
    }

    /// Set the empty-value marker
    pub fn empty_marker(mut self, marker: &str) -> Self {
        self.empty_marker = marker.to_string();
        self
    }

    /// Limit history listings
    pub fn history_page_size(mut self, size: usize) -> Self {
        self.history_page_size = Some(size);
        self
    }

    /// Parse from a JSON document. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let config: Self = serde_json::from_str(json).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.empty_marker.is_empty() {
            return Err("empty_marker cannot be empty".to_string());
        }

        if self.history_page_size == Some(0) {
            return Err("history_page_size must be > 0".to_string());
        }

        Ok(())
    }
}
