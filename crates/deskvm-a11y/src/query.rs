//! Predicate search over the live tree.

use std::fmt;
use std::time::Duration;

use deskvm_error::{Error, Result};
use deskvm_retry::{retryable, SEARCH};
use tracing::debug;

use crate::node::Accessible;
use crate::state::State;

/// Conjunction of optional criteria a node must meet.
///
/// An unset field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Exact accessible name.
    pub name: Option<String>,
    /// Exact role name.
    pub role_name: Option<String>,
    /// Exact description.
    pub description: Option<String>,
    /// Name of any node the candidate is labelled by.
    pub label: Option<String>,
    /// Whether the `editable` state must be set or clear.
    pub editable: Option<bool>,
    /// Whether the `focused` state must be set or clear.
    pub focused: Option<bool>,
}

impl Query {
    /// A query matching every node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn role(mut self, role_name: impl Into<String>) -> Self {
        self.role_name = Some(role_name.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// `true` requires the `editable` state, `false` requires its absence.
    #[must_use]
    pub fn editable(mut self, editable: bool) -> Self {
        self.editable = Some(editable);
        self
    }

    /// `true` requires the `focused` state, `false` requires its absence.
    #[must_use]
    pub fn focused(mut self, focused: bool) -> Self {
        self.focused = Some(focused);
        self
    }

    /// Tests `node` against every set criterion.
    ///
    /// Snapshotted fields are compared first so that most candidates are
    /// rejected without a bus round trip.
    pub fn matches(&self, node: &Accessible) -> Result<bool> {
        if let Some(name) = &self.name {
            if node.name() != Some(name.as_str()) {
                return Ok(false);
            }
        }
        if let Some(description) = &self.description {
            if node.description() != Some(description.as_str()) {
                return Ok(false);
            }
        }
        if let Some(role_name) = &self.role_name {
            if node.role_name()? != *role_name {
                return Ok(false);
            }
        }
        if let Some(label) = &self.label {
            let labels = node.labels()?;
            if !labels.iter().any(|l| l.name() == Some(label.as_str())) {
                return Ok(false);
            }
        }
        if self.editable.is_some() || self.focused.is_some() {
            let states = node.states()?;
            if let Some(editable) = self.editable {
                if states.contains(State::Editable) != editable {
                    return Ok(false);
                }
            }
            if let Some(focused) = self.focused {
                if states.contains(State::Focused) != focused {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(name={:?}, description={:?}, label={:?}, role_name={:?}, editable={:?}, focused={:?})",
            self.name, self.description, self.label, self.role_name, self.editable, self.focused
        )
    }
}

/// Whether a search keeps looking while nothing matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Search once.
    No,
    /// Repeat the whole search until a match appears or `timeout` elapses.
    Within {
        /// Total time budget.
        timeout: Duration,
        /// Pause between searches.
        interval: Duration,
    },
}

impl Retry {
    /// Five seconds, polling every 200 ms.
    pub const DEFAULT: Self = Self::Within {
        timeout: Duration::from_secs(5),
        interval: Duration::from_millis(200),
    };
}

impl Accessible {
    /// Depth-first pre-order search for the first node matching `query`,
    /// starting with this node itself.
    ///
    /// Returns [`Error::Search`] if nothing matches. With
    /// [`Retry::Within`], the entire traversal is repeated on search
    /// failures; bus errors still abort right away.
    pub fn find_child(&self, query: &Query, retry: Retry) -> Result<Self> {
        let search = || {
            self.find_match(query)?
                .ok_or_else(|| Error::search(format!("Could not find child with {query}")))
        };

        match retry {
            Retry::No => search(),
            Retry::Within { timeout, interval } => retryable(timeout, interval, SEARCH)
                .with_message(format!("Could not find child with {query}"))
                .run(search),
        }
    }

    fn find_match(&self, query: &Query) -> Result<Option<Self>> {
        if query.matches(self)? {
            debug!(%query, node = %self, "Found child");
            return Ok(Some(self.clone()));
        }
        for child in self.children()? {
            if let Some(found) = child.find_match(query)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}
